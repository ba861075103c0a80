use std::collections::BTreeSet;

use super::tables::{GeometryRow, MaterialRow, ObjectRow, RowId, SceneTables, Table};

/// State of a single row after a merge, relative to before it
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange<R, C> {
    /// Row became live (new, or resurrected by a concurrent write)
    Inserted { id: RowId, row: R },
    /// Row stayed live with different contents
    Updated { id: RowId, change: C },
    /// Row was tombstoned
    Removed { id: RowId },
}

impl<R, C> RowChange<R, C> {
    pub fn id(&self) -> &RowId {
        match self {
            RowChange::Inserted { id, .. }
            | RowChange::Updated { id, .. }
            | RowChange::Removed { id } => id,
        }
    }
}

/// Field-level difference between two versions of an object row
///
/// Tuple fields carry only the components that changed; `None` components
/// keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectDelta {
    pub name: Option<String>,
    pub parent_id: Option<Option<RowId>>,
    pub position: [Option<f64>; 3],
    pub quaternion: [Option<f64>; 4],
    pub scale: [Option<f64>; 3],
    pub geometry_id: Option<Option<RowId>>,
    pub material_id: Option<Option<RowId>>,
}

impl ObjectDelta {
    pub fn between(old: &ObjectRow, new: &ObjectRow) -> Self {
        Self {
            name: changed(&old.name, &new.name),
            parent_id: changed(&old.parent_id, &new.parent_id),
            position: components(old.position, new.position),
            quaternion: components(old.quaternion, new.quaternion),
            scale: components(old.scale, new.scale),
            geometry_id: changed(&old.geometry_id, &new.geometry_id),
            material_id: changed(&old.material_id, &new.material_id),
        }
    }

    pub fn transform_changed(&self) -> bool {
        self.position.iter().any(Option::is_some)
            || self.quaternion.iter().any(Option::is_some)
            || self.scale.iter().any(Option::is_some)
    }

    /// Overwrite the components present in `delta`
    pub fn apply_components<const N: usize>(target: &mut [f64; N], delta: &[Option<f64>; N]) {
        for (value, change) in target.iter_mut().zip(delta) {
            if let Some(change) = change {
                *value = *change;
            }
        }
    }
}

fn changed<T: PartialEq + Clone>(old: &T, new: &T) -> Option<T> {
    (old != new).then(|| new.clone())
}

fn components<const N: usize>(old: Option<[f64; N]>, new: Option<[f64; N]>) -> [Option<f64>; N] {
    let mut out = [None; N];
    if let Some(new) = new {
        for (i, value) in new.into_iter().enumerate() {
            if old.map_or(true, |old| old[i] != value) {
                out[i] = Some(value);
            }
        }
    }
    out
}

/// Exactly which rows and fields a merge changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    /// The tables went from absent to present
    pub tables_created: bool,
    pub geometries: Vec<RowChange<GeometryRow, GeometryRow>>,
    pub materials: Vec<RowChange<MaterialRow, MaterialRow>>,
    pub objects: Vec<RowChange<ObjectRow, ObjectDelta>>,
}

impl Patch {
    pub fn between(before: &SceneTables, after: &SceneTables) -> Self {
        Self {
            tables_created: !before.created && after.created,
            geometries: diff_table(&before.geometries, &after.geometries, |_, new| new.clone()),
            materials: diff_table(&before.materials, &after.materials, |_, new| new.clone()),
            objects: diff_table(&before.objects, &after.objects, ObjectDelta::between),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.tables_created
            && self.geometries.is_empty()
            && self.materials.is_empty()
            && self.objects.is_empty()
    }

    /// Number of row changes across all tables
    pub fn len(&self) -> usize {
        self.geometries.len() + self.materials.len() + self.objects.len()
    }
}

fn diff_table<R, C, F>(before: &Table<R>, after: &Table<R>, change: F) -> Vec<RowChange<R, C>>
where
    R: PartialEq + Clone,
    F: Fn(&R, &R) -> C,
{
    let ids: BTreeSet<&RowId> = before.rows().keys().chain(after.rows().keys()).collect();
    ids.into_iter()
        .filter_map(|id| match (before.get(id), after.get(id)) {
            (None, Some(row)) => Some(RowChange::Inserted {
                id: id.clone(),
                row: row.clone(),
            }),
            (Some(old), Some(new)) if old != new => Some(RowChange::Updated {
                id: id.clone(),
                change: change(old, new),
            }),
            (Some(_), None) => Some(RowChange::Removed { id: id.clone() }),
            _ => None,
        })
        .collect()
}
