pub mod patch;
pub mod replica;
pub mod tables;

pub use patch::{ObjectDelta, Patch, RowChange};
pub use replica::{ChangeRecord, ReplicatedDocument};
pub use tables::{
    Draft, GeometryRow, MaterialRow, ObjectRow, RowId, SceneTables, Table, TableKind, ROOT_ROW_ID,
};
