use rusqlite::types::Value;

use super::geometry::load_subtree;
use super::{mismatch, Resolution, ResolveCx, Resolver};
use crate::convert::solid_shell_json;
use crate::error::Result;
use crate::xlink::{Category, DeferredRef};

/// Rebuilds the aggregated representation of solids whose shell contained
/// geometry references. Runs after every geometry reference is resolved.
pub struct SolidGeometryResolver;

impl Resolver for SolidGeometryResolver {
    fn category(&self) -> Category {
        Category::SolidGeometry
    }

    fn resolve(&mut self, record: &DeferredRef, cx: &mut ResolveCx<'_>) -> Result<Resolution> {
        let DeferredRef::SolidGeometry(rebuild) = record else {
            return Err(mismatch(Category::SolidGeometry, record));
        };
        let rows = load_subtree(cx.conn, rebuild.solid_id)?;
        if rows.is_empty() {
            return Ok(Resolution::Dangling);
        }
        let polygons: Vec<String> = rows
            .into_iter()
            .filter(|row| row.kind == "polygon")
            .filter_map(|row| row.geometry)
            .collect();
        cx.batch.push(
            "UPDATE surface_geometry SET solid_geometry = ?1 WHERE id = ?2",
            vec![
                Value::Text(solid_shell_json(&polygons)),
                Value::Integer(rebuild.solid_id),
            ],
        )?;
        Ok(Resolution::Resolved)
    }
}
