use rusqlite::types::Value;
use serde_json::json;
use tracing::{debug, warn};

use super::{flag, text, Converter};
use crate::adapter::IdTable;
use crate::cache::CacheTag;
use crate::error::Result;
use crate::model::{
    local_target, Appearance, SurfaceData, SurfaceDataKind, SurfaceDataMember, TextureParameterization,
    TextureTarget,
};
use crate::xlink::{
    BasicLink, DeferredRef, LinkTarget, TexCoordListLink, TextureAssociationLink, TextureImageLoad,
    TextureParamLink,
};

/// Stored form of the texture coordinates of one ring.
pub(crate) fn texture_coordinates(ring: &str, coords: &[f64]) -> Result<String> {
    Ok(serde_json::to_string(&json!({ "ring": ring, "coords": coords }))?)
}

impl Converter<'_> {
    pub(super) fn appearance(&mut self, appearance: &Appearance, feature_id: i64) -> Result<()> {
        let id = self.allocate(appearance.gml_id.as_deref(), CacheTag::Appearance, IdTable::Appearance)?;
        self.batch.insert(
            "appearance",
            &["id", "gmlid", "theme", "feature_id"],
            vec![
                Value::Integer(id),
                text(appearance.gml_id.as_deref()),
                text(appearance.theme.as_deref()),
                Value::Integer(feature_id),
            ],
        )?;
        for member in &appearance.surface_data {
            match member {
                SurfaceDataMember::Inline { surface_data } => {
                    let surface_data_id = self.surface_data(surface_data)?;
                    self.link_surface_data(id, surface_data_id)?;
                }
                SurfaceDataMember::Xlink { href } => {
                    let Some(target) = local_target(href) else {
                        debug!(href, "convert.surface_data.remote");
                        continue;
                    };
                    match self.cache.get(target)? {
                        Some(entry) if entry.tag == CacheTag::SurfaceData => {
                            self.link_surface_data(id, entry.id)?;
                        }
                        _ => self.defer(DeferredRef::Basic(BasicLink {
                            table: "appear_to_surface_data".into(),
                            id,
                            from_column: Some("appearance_id".into()),
                            to_column: "surface_data_id".into(),
                            role: None,
                            reverse: false,
                            target: target.to_string(),
                        })),
                    }
                }
            }
        }
        Ok(())
    }

    fn link_surface_data(&mut self, appearance_id: i64, surface_data_id: i64) -> Result<()> {
        self.batch.insert(
            "appear_to_surface_data",
            &["appearance_id", "surface_data_id"],
            vec![Value::Integer(appearance_id), Value::Integer(surface_data_id)],
        )
    }

    fn surface_data(&mut self, surface_data: &SurfaceData) -> Result<i64> {
        let id = self.allocate(surface_data.gml_id.as_deref(), CacheTag::SurfaceData, IdTable::SurfaceData)?;
        let columns = ["id", "gmlid", "kind", "tex_image_id", "diffuse"];
        match &surface_data.kind {
            SurfaceDataKind::ParameterizedTexture { image_uri, targets } => {
                let image_id = self.texture_image(image_uri)?;
                self.batch.insert(
                    "surface_data",
                    &columns,
                    vec![
                        Value::Integer(id),
                        text(surface_data.gml_id.as_deref()),
                        Value::Text("parameterized_texture".into()),
                        Value::Integer(image_id),
                        Value::Null,
                    ],
                )?;
                for target in targets {
                    self.texture_target(id, target)?;
                }
            }
            SurfaceDataKind::X3dMaterial {
                diffuse_color,
                targets,
            } => {
                let diffuse = diffuse_color.map(|c| serde_json::to_string(&c)).transpose()?;
                self.batch.insert(
                    "surface_data",
                    &columns,
                    vec![
                        Value::Integer(id),
                        text(surface_data.gml_id.as_deref()),
                        Value::Text("x3d_material".into()),
                        Value::Null,
                        text(diffuse.as_deref()),
                    ],
                )?;
                for target in targets {
                    let Some(target) = local_target(target) else {
                        continue;
                    };
                    self.texture_param(id, target, false, None, None)?;
                }
            }
        }
        Ok(id)
    }

    /// Id of the image row for `uri`, creating the row and its load request
    /// the first time the image is seen.
    fn texture_image(&mut self, uri: &str) -> Result<i64> {
        let sequences = self.adapter.sequences();
        let (entry, created) = self.claim(
            &format!("tex-image:{uri}"),
            CacheTag::TexImage,
            || Ok(sequences.next(IdTable::TexImage)),
        )?;
        if created {
            self.batch.insert(
                "tex_image",
                &["id", "uri"],
                vec![Value::Integer(entry.id), Value::Text(uri.to_string())],
            )?;
            self.defer(DeferredRef::TextureImage(TextureImageLoad {
                image_id: entry.id,
                uri: uri.to_string(),
                base_dir: self.base_dir.to_path_buf(),
            }));
        }
        Ok(entry.id)
    }

    fn texture_target(&mut self, surface_data_id: i64, target: &TextureTarget) -> Result<()> {
        match &target.parameterization {
            TextureParameterization::TexCoordList { gml_id, rings } => {
                for ring in rings {
                    let Some(ring_id) = local_target(&ring.ring) else {
                        continue;
                    };
                    match self.cache.get(ring_id)? {
                        Some(entry) if entry.tag == CacheTag::Ring => {
                            let coords = texture_coordinates(ring_id, &ring.coords)?;
                            self.insert_texture_param(gml_id.as_deref(), entry.id, surface_data_id, true, Some(coords))?;
                        }
                        _ => self.defer(DeferredRef::TextureCoordList(TexCoordListLink {
                            surface_data_id,
                            ring: ring_id.to_string(),
                            coords: ring.coords.clone(),
                            association: gml_id.clone(),
                        })),
                    }
                }
            }
            TextureParameterization::TexCoordGen {
                gml_id,
                world_to_texture,
            } => {
                let Some(uri) = local_target(&target.uri) else {
                    return Ok(());
                };
                let coords = serde_json::to_string(&json!({ "world_to_texture": world_to_texture }))?;
                self.texture_param(surface_data_id, uri, true, Some(coords), gml_id.clone())?;
            }
            TextureParameterization::Xlink { href } => {
                if let (Some(uri), Some(association)) = (local_target(&target.uri), local_target(href)) {
                    self.defer(DeferredRef::TextureAssociation(TextureAssociationLink {
                        surface_data_id,
                        target: uri.to_string(),
                        association: association.to_string(),
                    }));
                }
            }
        }
        Ok(())
    }

    fn texture_param(
        &mut self,
        surface_data_id: i64,
        target: &str,
        is_texture: bool,
        coordinates: Option<String>,
        association: Option<String>,
    ) -> Result<()> {
        match self.cache.get(target)? {
            Some(entry) if entry.tag.is_geometry() => self.insert_texture_param(
                association.as_deref(),
                entry.id,
                surface_data_id,
                is_texture,
                coordinates,
            ),
            _ => {
                self.defer(DeferredRef::TextureParam(TextureParamLink {
                    surface_data_id,
                    target: LinkTarget::Symbolic(target.to_string()),
                    is_texture,
                    coordinates,
                    association,
                }));
                Ok(())
            }
        }
    }

    fn insert_texture_param(
        &mut self,
        gml_id: Option<&str>,
        geometry_id: i64,
        surface_data_id: i64,
        is_texture: bool,
        coordinates: Option<String>,
    ) -> Result<()> {
        self.batch.insert(
            "textureparam",
            &[
                "gmlid",
                "surface_geometry_id",
                "surface_data_id",
                "is_texture_parametrization",
                "texture_coordinates",
            ],
            vec![
                text(gml_id),
                Value::Integer(geometry_id),
                Value::Integer(surface_data_id),
                flag(is_texture),
                coordinates.map_or(Value::Null, Value::Text),
            ],
        )
    }

    fn allocate(&mut self, gml_id: Option<&str>, tag: CacheTag, table: IdTable) -> Result<i64> {
        let sequences = self.adapter.sequences();
        let Some(gml_id) = gml_id else {
            return Ok(sequences.next(table));
        };
        let (entry, created) = self.claim(gml_id, tag, || Ok(sequences.next(table)))?;
        if created {
            return Ok(entry.id);
        }
        warn!(gml_id, existing = entry.id, table = table.table(), "convert.duplicate_id");
        Ok(sequences.next(table))
    }
}
