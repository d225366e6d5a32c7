use std::iter;

use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{flag, int, text, Converter};
use crate::adapter::IdTable;
use crate::cache::{CacheEntry, CacheTag};
use crate::error::Result;
use crate::model::{local_target, Geometry, GeometryMember};
use crate::xlink::{DeferredRef, GeometryLink, SolidRebuild};

/// Stored form of a polygon: flat `x y z` rings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PolygonRings {
    pub exterior: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interiors: Vec<Vec<f64>>,
}

impl PolygonRings {
    pub(crate) fn decode(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub(crate) fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Same polygon with flipped orientation.
    pub(crate) fn reversed(self) -> Self {
        Self {
            exterior: reverse_ring(&self.exterior),
            interiors: self.interiors.iter().map(|ring| reverse_ring(ring)).collect(),
        }
    }
}

fn reverse_ring(coords: &[f64]) -> Vec<f64> {
    coords.chunks(3).rev().flatten().copied().collect()
}

/// Aggregated representation of a solid built from its shell polygons.
pub(crate) fn solid_shell_json(polygons: &[String]) -> String {
    format!("{{\"shell\":[{}]}}", polygons.join(","))
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    feature_id: i64,
    parent_id: Option<i64>,
    root_id: Option<i64>,
}

/// What a converted subtree contributes to its parent.
struct Built {
    has_xlink: bool,
    polygons: Vec<String>,
}

impl Built {
    fn empty() -> Self {
        Self {
            has_xlink: false,
            polygons: Vec::new(),
        }
    }

    fn absorb(&mut self, other: Built) {
        self.has_xlink |= other.has_xlink;
        self.polygons.extend(other.polygons);
    }
}

struct Row<'a> {
    id: i64,
    gml_id: Option<&'a str>,
    scope: Scope,
    role: Option<&'a str>,
    kind: &'a str,
    is_xlink: bool,
    is_reverse: bool,
    geometry: Option<String>,
    solid_geometry: Option<String>,
}

impl Converter<'_> {
    /// Converts a geometry property of feature `feature_id`; returns the root row id.
    pub(super) fn geometry_root(&mut self, geometry: &Geometry, feature_id: i64, role: &str) -> Result<i64> {
        let scope = Scope {
            feature_id,
            parent_id: None,
            root_id: None,
        };
        let (id, _) = self.geometry(geometry, scope, Some(role))?;
        Ok(id)
    }

    fn geometry(&mut self, geometry: &Geometry, scope: Scope, role: Option<&str>) -> Result<(i64, Built)> {
        let tag = match geometry {
            Geometry::Polygon { .. } => CacheTag::Polygon,
            _ => CacheTag::Geometry,
        };
        let id = self.allocate_geometry(geometry.gml_id(), tag)?;
        let root_id = scope.root_id.unwrap_or(id);
        let inner = Scope {
            feature_id: scope.feature_id,
            parent_id: Some(id),
            root_id: Some(root_id),
        };
        let mut row = Row {
            id,
            gml_id: geometry.gml_id(),
            scope: Scope {
                root_id: Some(root_id),
                ..scope
            },
            role,
            kind: geometry.kind(),
            is_xlink: false,
            is_reverse: false,
            geometry: None,
            solid_geometry: None,
        };

        let built = match geometry {
            Geometry::Polygon {
                exterior, interiors, ..
            } => {
                for ring in iter::once(exterior).chain(interiors) {
                    if let Some(ring_id) = ring.gml_id.as_deref() {
                        let entry = CacheEntry {
                            id,
                            tag: CacheTag::Ring,
                        };
                        if self.cache.insert_if_absent(ring_id, entry)? {
                            self.unit.cache_keys.push(ring_id.to_string());
                        } else {
                            warn!(gml_id = ring_id, "convert.ring.duplicate");
                        }
                    }
                }
                let encoded = PolygonRings {
                    exterior: exterior.coords.clone(),
                    interiors: interiors.iter().map(|ring| ring.coords.clone()).collect(),
                }
                .encode()?;
                row.geometry = Some(encoded.clone());
                Built {
                    has_xlink: false,
                    polygons: vec![encoded],
                }
            }
            Geometry::MultiSurface { members, .. } | Geometry::CompositeSurface { members, .. } => {
                let mut built = Built::empty();
                for member in members {
                    built.absorb(self.member(member, inner)?);
                }
                built
            }
            Geometry::Solid { exterior, .. } => {
                let shell = self.member(exterior, inner)?;
                if shell.has_xlink {
                    self.defer(DeferredRef::SolidGeometry(SolidRebuild { solid_id: id }));
                } else {
                    row.solid_geometry = Some(solid_shell_json(&shell.polygons));
                }
                shell
            }
        };
        self.geometry_row(row)?;
        Ok((id, built))
    }

    fn member(&mut self, member: &GeometryMember, scope: Scope) -> Result<Built> {
        match member {
            GeometryMember::Inline { geometry } => Ok(self.geometry(geometry, scope, None)?.1),
            GeometryMember::Xlink { href, reverse } => {
                let Some(target) = local_target(href) else {
                    debug!(href, "convert.geometry.remote");
                    return Ok(Built::empty());
                };
                let placeholder_id = self.adapter.sequences().next(IdTable::SurfaceGeometry);
                let root_id = scope.root_id.unwrap_or(placeholder_id);
                self.geometry_row(Row {
                    id: placeholder_id,
                    gml_id: None,
                    scope,
                    role: None,
                    kind: "xlink",
                    is_xlink: true,
                    is_reverse: *reverse,
                    geometry: None,
                    solid_geometry: None,
                })?;
                self.defer(DeferredRef::SurfaceGeometry(GeometryLink {
                    placeholder_id,
                    parent_id: scope.parent_id,
                    root_id,
                    feature_id: scope.feature_id,
                    reverse: *reverse,
                    target: target.to_string(),
                }));
                Ok(Built {
                    has_xlink: true,
                    polygons: Vec::new(),
                })
            }
        }
    }

    fn allocate_geometry(&mut self, gml_id: Option<&str>, tag: CacheTag) -> Result<i64> {
        let sequences = self.adapter.sequences();
        let Some(gml_id) = gml_id else {
            return Ok(sequences.next(IdTable::SurfaceGeometry));
        };
        let (entry, created) = self.claim(gml_id, tag, || Ok(sequences.next(IdTable::SurfaceGeometry)))?;
        if created {
            return Ok(entry.id);
        }
        warn!(gml_id, existing = entry.id, "convert.geometry.duplicate");
        Ok(sequences.next(IdTable::SurfaceGeometry))
    }

    fn geometry_row(&mut self, row: Row<'_>) -> Result<()> {
        let root_id = row.scope.root_id.unwrap_or(row.id);
        self.batch.insert(
            "surface_geometry",
            &[
                "id",
                "gmlid",
                "parent_id",
                "root_id",
                "feature_id",
                "role",
                "kind",
                "is_xlink",
                "is_reverse",
                "geometry",
                "solid_geometry",
            ],
            vec![
                Value::Integer(row.id),
                text(row.gml_id),
                int(row.scope.parent_id),
                Value::Integer(root_id),
                Value::Integer(row.scope.feature_id),
                text(row.role),
                Value::Text(row.kind.to_string()),
                flag(row.is_xlink),
                flag(row.is_reverse),
                row.geometry.map_or(Value::Null, Value::Text),
                row.solid_geometry.map_or(Value::Null, Value::Text),
            ],
        )?;
        self.unit.geometries += 1;
        Ok(())
    }
}
