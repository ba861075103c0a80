use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;
use yrs::{Any, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, TransactionMut};

use crate::{SyncError, SyncResult};

/// Stable identifier of a row, assigned on insertion
pub type RowId = String;

/// Well-known id of the sentinel scene root
///
/// Every replica writes its bootstrap root under this key, so concurrent
/// bootstraps collapse into a single row.
pub const ROOT_ROW_ID: &str = "root";

const META: &str = "meta";
const TABLES_FLAG: &str = "tables";
const OBJECTS: &str = "objects";
const GEOMETRIES: &str = "geometries";
const MATERIALS: &str = "materials";

/// Placeholder written in place of a deleted row
const TOMBSTONE: &str = "";

/// A node of the shared scene
///
/// A row without `position` is the sentinel scene root.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRow {
    pub name: String,
    pub parent_id: Option<RowId>,
    pub position: Option<[f64; 3]>,
    pub quaternion: Option<[f64; 4]>,
    pub scale: Option<[f64; 3]>,
    pub geometry_id: Option<RowId>,
    pub material_id: Option<RowId>,
}

impl ObjectRow {
    /// A mesh at `position` with identity rotation and unit scale
    pub fn mesh(
        name: impl Into<String>,
        parent_id: Option<RowId>,
        geometry_id: RowId,
        material_id: RowId,
        position: [f64; 3],
    ) -> Self {
        Self {
            name: name.into(),
            parent_id,
            position: Some(position),
            quaternion: Some([0.0, 0.0, 0.0, 1.0]),
            scale: Some([1.0, 1.0, 1.0]),
            geometry_id: Some(geometry_id),
            material_id: Some(material_id),
        }
    }

    pub fn is_root(&self) -> bool {
        self.position.is_none()
    }
}

/// Indexed triangle geometry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeometryRow {
    pub name: String,
    pub index: Vec<u32>,
    /// Flat xyz vertex positions
    pub position: Vec<f32>,
}

impl GeometryRow {
    /// Check the buffers describe whole vertices and in-range indices
    pub fn validate(&self) -> SyncResult<()> {
        if self.position.len() % 3 != 0 {
            return Err(SyncError::integrity(format!(
                "Geometry '{}' has {} position floats, not a multiple of 3",
                self.name,
                self.position.len()
            )));
        }
        let vertices = (self.position.len() / 3) as u32;
        if let Some(bad) = self.index.iter().find(|&&i| i >= vertices) {
            return Err(SyncError::integrity(format!(
                "Geometry '{}' index {} out of range for {} vertices",
                self.name, bad, vertices
            )));
        }
        Ok(())
    }

    pub fn vertex_count(&self) -> usize {
        self.position.len() / 3
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialRow {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub color: [f32; 3],
}

impl Default for MaterialRow {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: "standard".to_string(),
            color: [1.0, 1.0, 1.0],
        }
    }
}

/// One of the three logical tables of the scene document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    Objects,
    Geometries,
    Materials,
}

impl TableKind {
    fn map_name(self) -> &'static str {
        match self {
            TableKind::Objects => OBJECTS,
            TableKind::Geometries => GEOMETRIES,
            TableKind::Materials => MATERIALS,
        }
    }
}

/// Materialized view of one table
#[derive(Debug, Clone, PartialEq)]
pub struct Table<R> {
    rows: BTreeMap<RowId, R>,
    tombstones: BTreeSet<RowId>,
}

impl<R> Default for Table<R> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            tombstones: BTreeSet::new(),
        }
    }
}

impl<R> Table<R> {
    /// Live row by id; tombstoned rows are not returned
    pub fn get(&self, id: &str) -> Option<&R> {
        self.rows.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    /// Live rows in id order
    pub fn iter(&self) -> impl Iterator<Item = (&RowId, &R)> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub(crate) fn rows(&self) -> &BTreeMap<RowId, R> {
        &self.rows
    }
}

/// Read-only snapshot of the whole scene document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneTables {
    /// Whether any replica has created the tables yet
    pub created: bool,
    pub objects: Table<ObjectRow>,
    pub geometries: Table<GeometryRow>,
    pub materials: Table<MaterialRow>,
}

impl SceneTables {
    /// Sentinel root rows, lowest id first
    pub fn roots(&self) -> impl Iterator<Item = (&RowId, &ObjectRow)> {
        self.objects.iter().filter(|(_, row)| row.is_root())
    }

    /// The root every replica agrees on
    pub fn root(&self) -> Option<&RowId> {
        self.roots().map(|(id, _)| id).next()
    }
}

/// Root-level CRDT maps backing the tables
pub(crate) struct SceneMaps {
    meta: MapRef,
    objects: MapRef,
    geometries: MapRef,
    materials: MapRef,
}

impl SceneMaps {
    pub(crate) fn new(doc: &Doc) -> Self {
        Self {
            meta: doc.get_or_insert_map(META),
            objects: doc.get_or_insert_map(OBJECTS),
            geometries: doc.get_or_insert_map(GEOMETRIES),
            materials: doc.get_or_insert_map(MATERIALS),
        }
    }

    fn map(&self, kind: TableKind) -> &MapRef {
        match kind {
            TableKind::Objects => &self.objects,
            TableKind::Geometries => &self.geometries,
            TableKind::Materials => &self.materials,
        }
    }

    pub(crate) fn read<T: ReadTxn>(&self, txn: &T) -> SceneTables {
        SceneTables {
            created: self.meta.get(txn, TABLES_FLAG).is_some(),
            objects: read_table(&self.objects, txn, TableKind::Objects),
            geometries: read_table(&self.geometries, txn, TableKind::Geometries),
            materials: read_table(&self.materials, txn, TableKind::Materials),
        }
    }
}

fn read_table<R: DeserializeOwned, T: ReadTxn>(map: &MapRef, txn: &T, kind: TableKind) -> Table<R> {
    let mut table = Table::default();
    for (id, value) in map.iter(txn) {
        let decoded = match value {
            Out::YMap(fields) => decode_fields(&fields, txn),
            Out::Any(Any::String(encoded)) if &*encoded == TOMBSTONE => {
                table.tombstones.insert(id.to_string());
                continue;
            }
            // whole-row JSON written by older archives
            Out::Any(Any::String(encoded)) => serde_json::from_str(&encoded),
            _ => {
                warn!("Skipping unexpected row '{}' in {}", id, kind.map_name());
                continue;
            }
        };
        match decoded {
            Ok(row) => {
                table.rows.insert(id.to_string(), row);
            }
            Err(e) => warn!("Skipping malformed row '{}' in {}: {}", id, kind.map_name(), e),
        }
    }
    table
}

/// Rebuild a row from its per-field map, one JSON value per key
fn decode_fields<R: DeserializeOwned, T: ReadTxn>(
    fields: &MapRef,
    txn: &T,
) -> Result<R, serde_json::Error> {
    let mut object = serde_json::Map::new();
    for (field, value) in fields.iter(txn) {
        if let Out::Any(Any::String(encoded)) = value {
            object.insert(field.to_string(), serde_json::from_str(&encoded)?);
        }
    }
    serde_json::from_value(serde_json::Value::Object(object))
}

/// Split a row into `(field, JSON value)` pairs
fn encode_fields<R: Serialize>(row: &R) -> SyncResult<Vec<(String, String)>> {
    match serde_json::to_value(row)? {
        serde_json::Value::Object(object) => Ok(object
            .into_iter()
            .map(|(field, value)| (field, value.to_string()))
            .collect()),
        other => Err(SyncError::integrity(format!(
            "Row encodes to {} instead of an object",
            other
        ))),
    }
}

/// Staged rows for one table; `None` marks a deletion
type Staged<R> = BTreeMap<RowId, Option<R>>;

/// Mutable view handed to [`ReplicatedDocument::apply_change`]
///
/// Writes are staged and validated against the current tables plus earlier
/// staged writes. Nothing reaches the CRDT unless the whole mutator succeeds.
///
/// [`ReplicatedDocument::apply_change`]: super::ReplicatedDocument::apply_change
pub struct Draft<'a> {
    base: &'a SceneTables,
    create_tables: bool,
    objects: Staged<ObjectRow>,
    geometries: Staged<GeometryRow>,
    materials: Staged<MaterialRow>,
}

impl<'a> Draft<'a> {
    pub(crate) fn new(base: &'a SceneTables) -> Self {
        Self {
            base,
            create_tables: false,
            objects: BTreeMap::new(),
            geometries: BTreeMap::new(),
            materials: BTreeMap::new(),
        }
    }

    pub fn tables_exist(&self) -> bool {
        self.base.created || self.create_tables
    }

    /// Mark the three tables as created
    pub fn create_tables(&mut self) {
        self.create_tables = true;
    }

    /// Write the sentinel root under its well-known id
    pub fn insert_root(&mut self, name: impl Into<String>) -> RowId {
        let row = ObjectRow {
            name: name.into(),
            ..ObjectRow::default()
        };
        self.objects.insert(ROOT_ROW_ID.to_string(), Some(row));
        ROOT_ROW_ID.to_string()
    }

    pub fn object(&self, id: &str) -> Option<&ObjectRow> {
        lookup(&self.objects, &self.base.objects, id)
    }

    pub fn geometry(&self, id: &str) -> Option<&GeometryRow> {
        lookup(&self.geometries, &self.base.geometries, id)
    }

    pub fn material(&self, id: &str) -> Option<&MaterialRow> {
        lookup(&self.materials, &self.base.materials, id)
    }

    pub fn insert_object(&mut self, row: ObjectRow) -> SyncResult<RowId> {
        if row.is_root() {
            return Err(SyncError::integrity(format!(
                "Object '{}' has no position; only the scene root may omit it",
                row.name
            )));
        }
        self.check_references(None, &row)?;
        let id = new_row_id();
        self.objects.insert(id.clone(), Some(row));
        Ok(id)
    }

    pub fn insert_geometry(&mut self, row: GeometryRow) -> SyncResult<RowId> {
        row.validate()?;
        let id = new_row_id();
        self.geometries.insert(id.clone(), Some(row));
        Ok(id)
    }

    pub fn insert_material(&mut self, row: MaterialRow) -> RowId {
        let id = new_row_id();
        self.materials.insert(id.clone(), Some(row));
        id
    }

    /// Modify a live object in place
    pub fn update_object<F>(&mut self, id: &str, update: F) -> SyncResult<()>
    where
        F: FnOnce(&mut ObjectRow),
    {
        let mut row = self
            .object(id)
            .cloned()
            .ok_or_else(|| SyncError::integrity(format!("Unknown object '{}'", id)))?;
        update(&mut row);
        self.check_references(Some(id), &row)?;
        self.objects.insert(id.to_string(), Some(row));
        Ok(())
    }

    pub fn remove_object(&mut self, id: &str) -> SyncResult<()> {
        if self.object(id).is_none() {
            return Err(SyncError::integrity(format!("Unknown object '{}'", id)));
        }
        self.objects.insert(id.to_string(), None);
        Ok(())
    }

    pub fn remove_geometry(&mut self, id: &str) -> SyncResult<()> {
        if self.geometry(id).is_none() {
            return Err(SyncError::integrity(format!("Unknown geometry '{}'", id)));
        }
        self.geometries.insert(id.to_string(), None);
        Ok(())
    }

    pub fn remove_material(&mut self, id: &str) -> SyncResult<()> {
        if self.material(id).is_none() {
            return Err(SyncError::integrity(format!("Unknown material '{}'", id)));
        }
        self.materials.insert(id.to_string(), None);
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.create_tables
            && self.objects.is_empty()
            && self.geometries.is_empty()
            && self.materials.is_empty()
    }

    /// Write every staged row into the CRDT
    pub(crate) fn commit(self, maps: &SceneMaps, txn: &mut TransactionMut) -> SyncResult<()> {
        if self.create_tables {
            maps.meta.insert(txn, TABLES_FLAG, true);
        }
        flush(maps, txn, TableKind::Geometries, self.geometries)?;
        flush(maps, txn, TableKind::Materials, self.materials)?;
        flush(maps, txn, TableKind::Objects, self.objects)?;
        Ok(())
    }

    fn check_references(&self, id: Option<&str>, row: &ObjectRow) -> SyncResult<()> {
        if let Some(parent) = &row.parent_id {
            if self.object(parent).is_none() {
                return Err(SyncError::integrity(format!(
                    "Object '{}' references missing parent '{}'",
                    row.name, parent
                )));
            }
            if let Some(id) = id {
                self.check_acyclic(id, parent)?;
            }
        }
        if let Some(geometry) = &row.geometry_id {
            if self.geometry(geometry).is_none() {
                return Err(SyncError::integrity(format!(
                    "Object '{}' references missing geometry '{}'",
                    row.name, geometry
                )));
            }
        }
        if let Some(material) = &row.material_id {
            if self.material(material).is_none() {
                return Err(SyncError::integrity(format!(
                    "Object '{}' references missing material '{}'",
                    row.name, material
                )));
            }
        }
        Ok(())
    }

    fn check_acyclic(&self, id: &str, parent: &str) -> SyncResult<()> {
        let mut cursor = Some(parent.to_string());
        let mut hops = 0;
        while let Some(current) = cursor {
            if current == id || hops > self.base.objects.len() + self.objects.len() {
                return Err(SyncError::integrity(format!(
                    "Parenting '{}' under '{}' would create a cycle",
                    id, parent
                )));
            }
            cursor = self.object(&current).and_then(|row| row.parent_id.clone());
            hops += 1;
        }
        Ok(())
    }
}

fn lookup<'s, R>(staged: &'s Staged<R>, base: &'s Table<R>, id: &str) -> Option<&'s R> {
    match staged.get(id) {
        Some(row) => row.as_ref(),
        None => base.get(id),
    }
}

/// Write staged rows field by field so concurrent edits to different
/// fields of one row both survive the merge
fn flush<R: Serialize>(
    maps: &SceneMaps,
    txn: &mut TransactionMut,
    kind: TableKind,
    staged: Staged<R>,
) -> SyncResult<()> {
    let table = maps.map(kind);
    for (id, row) in staged {
        let Some(row) = row else {
            table.insert(txn, id.as_str(), TOMBSTONE.to_string());
            continue;
        };
        let fields = encode_fields(&row)?;
        let row_map = match table.get(&*txn, &id) {
            Some(Out::YMap(existing)) => existing,
            _ => table.insert(txn, id.as_str(), MapPrelim::default()),
        };
        for (field, encoded) in fields {
            let unchanged = matches!(
                row_map.get(&*txn, &field),
                Some(Out::Any(Any::String(current))) if *current == *encoded
            );
            if !unchanged {
                row_map.insert(txn, field, encoded);
            }
        }
    }
    Ok(())
}

fn new_row_id() -> RowId {
    uuid::Uuid::new_v4().to_string()
}
