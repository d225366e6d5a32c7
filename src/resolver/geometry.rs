use std::collections::HashMap;

use rusqlite::types::Value;
use rusqlite::Connection;

use super::{mismatch, Resolution, ResolveCx, Resolver};
use crate::adapter::IdTable;
use crate::convert::PolygonRings;
use crate::error::{ImportError, Result};
use crate::xlink::{Category, DeferredRef};

/// One row of a `surface_geometry` subtree.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GeometryRow {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub kind: String,
    pub is_xlink: bool,
    pub is_reverse: bool,
    pub geometry: Option<String>,
    pub solid_geometry: Option<String>,
}

/// Rows of the tree below (and including) `root_id`, parents before children.
pub(crate) fn load_subtree(conn: &Connection, root_id: i64) -> Result<Vec<GeometryRow>> {
    let mut stmt = conn.prepare_cached(
        "WITH RECURSIVE tree(id, depth) AS (
             SELECT id, 0 FROM surface_geometry WHERE id = ?1
             UNION ALL
             SELECT g.id, tree.depth + 1
             FROM surface_geometry g JOIN tree ON g.parent_id = tree.id
         )
         SELECT g.id, g.parent_id, g.kind, g.is_xlink, g.is_reverse, g.geometry, g.solid_geometry
         FROM tree JOIN surface_geometry g ON g.id = tree.id
         ORDER BY tree.depth, g.id",
    )?;
    let rows = stmt
        .query_map([root_id], |row| {
            Ok(GeometryRow {
                id: row.get(0)?,
                parent_id: row.get(1)?,
                kind: row.get(2)?,
                is_xlink: row.get(3)?,
                is_reverse: row.get(4)?,
                geometry: row.get(5)?,
                solid_geometry: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn orient(geometry: Option<&str>, reverse: bool) -> Result<Value> {
    match geometry {
        None => Ok(Value::Null),
        Some(json) if !reverse => Ok(Value::Text(json.to_string())),
        Some(json) => Ok(Value::Text(PolygonRings::decode(json)?.reversed().encode()?)),
    }
}

/// Replaces geometry placeholders with a copy of the referenced tree.
///
/// The copy is taken only once the referenced tree holds no placeholder of
/// the current snapshot; otherwise the record is retried in the next pass so
/// chains of references resolve from the leaves up.
pub struct SurfaceGeometryResolver;

impl Resolver for SurfaceGeometryResolver {
    fn category(&self) -> Category {
        Category::SurfaceGeometry
    }

    fn resolve(&mut self, record: &DeferredRef, cx: &mut ResolveCx<'_>) -> Result<Resolution> {
        let DeferredRef::SurfaceGeometry(link) = record else {
            return Err(mismatch(Category::SurfaceGeometry, record));
        };
        let Some(target) = cx.cache.get(&link.target)? else {
            return Ok(Resolution::Dangling);
        };
        if !target.tag.is_geometry() {
            return Err(ImportError::Invalid(format!(
                "'{}' is not a surface geometry",
                link.target
            )));
        }
        let rows = load_subtree(cx.conn, target.id)?;
        let Some((root, descendants)) = rows.split_first() else {
            return Ok(Resolution::Dangling);
        };
        let placeholders: Vec<i64> = rows.iter().filter(|r| r.is_xlink).map(|r| r.id).collect();
        if !placeholders.is_empty()
            && cx
                .store
                .snapshot_has_owner(Category::SurfaceGeometry, &placeholders)?
        {
            return Ok(Resolution::Retry);
        }

        cx.batch.push(
            "UPDATE surface_geometry
             SET kind = ?1, geometry = ?2, solid_geometry = ?3, is_reverse = ?4
             WHERE id = ?5",
            vec![
                Value::Text(root.kind.clone()),
                orient(root.geometry.as_deref(), link.reverse)?,
                root.solid_geometry.clone().map_or(Value::Null, Value::Text),
                Value::Integer(i64::from(root.is_reverse ^ link.reverse)),
                Value::Integer(link.placeholder_id),
            ],
        )?;

        let mut mapped = HashMap::with_capacity(rows.len());
        mapped.insert(root.id, link.placeholder_id);
        for row in descendants {
            let id = cx.sequences.next(IdTable::SurfaceGeometry);
            mapped.insert(row.id, id);
            let parent_id = row
                .parent_id
                .and_then(|parent| mapped.get(&parent).copied())
                .unwrap_or(link.placeholder_id);
            cx.batch.insert(
                "surface_geometry",
                &[
                    "id",
                    "gmlid",
                    "parent_id",
                    "root_id",
                    "feature_id",
                    "kind",
                    "is_xlink",
                    "is_reverse",
                    "geometry",
                    "solid_geometry",
                ],
                vec![
                    Value::Integer(id),
                    Value::Null,
                    Value::Integer(parent_id),
                    Value::Integer(link.root_id),
                    Value::Integer(link.feature_id),
                    Value::Text(row.kind.clone()),
                    Value::Integer(1),
                    Value::Integer(i64::from(row.is_reverse ^ link.reverse)),
                    orient(row.geometry.as_deref(), link.reverse)?,
                    row.solid_geometry.clone().map_or(Value::Null, Value::Text),
                ],
            )?;
        }
        Ok(Resolution::Resolved)
    }
}
