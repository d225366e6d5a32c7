use std::io::ErrorKind;

use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use tracing::debug;

use super::{mismatch, Resolution, ResolveCx, Resolver};
use crate::cache::{CacheEntry, CacheTag};
use crate::convert::texture_coordinates;
use crate::error::{ImportError, Result};
use crate::xlink::{Category, DeferredRef, LinkTarget, TextureParamLink};

/// Loads texture image files into their `tex_image` rows.
pub struct TextureImageResolver;

impl Resolver for TextureImageResolver {
    fn category(&self) -> Category {
        Category::TextureImage
    }

    fn resolve(&mut self, record: &DeferredRef, cx: &mut ResolveCx<'_>) -> Result<Resolution> {
        let DeferredRef::TextureImage(load) = record else {
            return Err(mismatch(Category::TextureImage, record));
        };
        if load.uri.contains("://") {
            debug!(uri = %load.uri, "xlink.texture_image.remote");
            return Ok(Resolution::Dangling);
        }
        let path = load.base_dir.join(&load.uri);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Resolution::Dangling),
            Err(err) => return Err(err.into()),
        };
        let mime_type = mime_guess::from_path(&path).first_raw();
        cx.batch.push(
            "UPDATE tex_image SET data = ?1, mime_type = ?2 WHERE id = ?3",
            vec![
                Value::Blob(data),
                mime_type.map_or(Value::Null, |m| Value::Text(m.to_string())),
                Value::Integer(load.image_id),
            ],
        )?;
        Ok(Resolution::Resolved)
    }
}

/// Turns ring-level texture coordinates into a parameterization of the
/// enclosing polygon, handed on to the texture parameter pass.
pub struct TexCoordListResolver;

impl Resolver for TexCoordListResolver {
    fn category(&self) -> Category {
        Category::TextureCoordList
    }

    fn resolve(&mut self, record: &DeferredRef, cx: &mut ResolveCx<'_>) -> Result<Resolution> {
        let DeferredRef::TextureCoordList(link) = record else {
            return Err(mismatch(Category::TextureCoordList, record));
        };
        let Some(entry) = cx.cache.get(&link.ring)? else {
            return Ok(Resolution::Dangling);
        };
        if entry.tag != CacheTag::Ring {
            return Err(ImportError::Invalid(format!(
                "texture coordinates target '{}' which is not a linear ring",
                link.ring
            )));
        }
        cx.reinject.push(DeferredRef::TextureParam(TextureParamLink {
            surface_data_id: link.surface_data_id,
            target: LinkTarget::Resolved(entry.id),
            is_texture: true,
            coordinates: Some(texture_coordinates(&link.ring, &link.coords)?),
            association: link.association.clone(),
        }));
        Ok(Resolution::Resolved)
    }
}

/// Writes parameterization rows once their surface is known.
pub struct TextureParamResolver;

impl Resolver for TextureParamResolver {
    fn category(&self) -> Category {
        Category::TextureParam
    }

    fn resolve(&mut self, record: &DeferredRef, cx: &mut ResolveCx<'_>) -> Result<Resolution> {
        let DeferredRef::TextureParam(link) = record else {
            return Err(mismatch(Category::TextureParam, record));
        };
        let geometry_id = match &link.target {
            LinkTarget::Resolved(id) => *id,
            LinkTarget::Symbolic(target) => match geometry(cx, target)? {
                Some(entry) => entry.id,
                None => return Ok(Resolution::Dangling),
            },
        };
        insert_param(
            cx,
            link.association.clone().map_or(Value::Null, Value::Text),
            geometry_id,
            link.surface_data_id,
            Value::Integer(i64::from(link.is_texture)),
            link.coordinates.clone().map_or(Value::Null, Value::Text),
        )?;
        Ok(Resolution::Resolved)
    }
}

/// Copies a parameterization referenced by identifier onto another surface.
///
/// Runs after the texture parameter pass, so every parameterization that
/// exists in this import is already written.
pub struct TextureAssociationResolver;

impl Resolver for TextureAssociationResolver {
    fn category(&self) -> Category {
        Category::TextureAssociation
    }

    fn resolve(&mut self, record: &DeferredRef, cx: &mut ResolveCx<'_>) -> Result<Resolution> {
        let DeferredRef::TextureAssociation(link) = record else {
            return Err(mismatch(Category::TextureAssociation, record));
        };
        let Some(entry) = geometry(cx, &link.target)? else {
            return Ok(Resolution::Dangling);
        };
        let mut stmt = cx.conn.prepare_cached(
            "SELECT is_texture_parametrization, texture_coordinates
             FROM textureparam WHERE gmlid = ?1 LIMIT 1",
        )?;
        let source: Option<(i64, Option<String>)> = stmt
            .query_row([&link.association], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let Some((is_texture, coordinates)) = source else {
            return Ok(Resolution::Dangling);
        };
        insert_param(
            cx,
            Value::Null,
            entry.id,
            link.surface_data_id,
            Value::Integer(is_texture),
            coordinates.map_or(Value::Null, Value::Text),
        )?;
        Ok(Resolution::Resolved)
    }
}

/// Legacy material links: an untextured parameterization row.
pub struct MaterialResolver;

impl Resolver for MaterialResolver {
    fn category(&self) -> Category {
        Category::DeprecatedMaterial
    }

    fn resolve(&mut self, record: &DeferredRef, cx: &mut ResolveCx<'_>) -> Result<Resolution> {
        let DeferredRef::DeprecatedMaterial(link) = record else {
            return Err(mismatch(Category::DeprecatedMaterial, record));
        };
        let Some(material) = cx.cache.get(&link.material)? else {
            return Ok(Resolution::Dangling);
        };
        if material.tag != CacheTag::SurfaceData {
            return Err(ImportError::Invalid(format!(
                "'{}' is not a surface data object",
                link.material
            )));
        }
        let Some(target) = geometry(cx, &link.target)? else {
            return Ok(Resolution::Dangling);
        };
        insert_param(
            cx,
            Value::Null,
            target.id,
            material.id,
            Value::Integer(0),
            Value::Null,
        )?;
        Ok(Resolution::Resolved)
    }
}

/// Cache entry of geometry `target`; errors when the identifier names
/// something else.
fn geometry(cx: &ResolveCx<'_>, target: &str) -> Result<Option<CacheEntry>> {
    match cx.cache.get(target)? {
        Some(entry) if entry.tag.is_geometry() => Ok(Some(entry)),
        Some(_) => Err(ImportError::Invalid(format!(
            "appearance target '{target}' is not a surface geometry"
        ))),
        None => Ok(None),
    }
}

fn insert_param(
    cx: &mut ResolveCx<'_>,
    gml_id: Value,
    geometry_id: i64,
    surface_data_id: i64,
    is_texture: Value,
    coordinates: Value,
) -> Result<()> {
    cx.batch.insert(
        "textureparam",
        &[
            "gmlid",
            "surface_geometry_id",
            "surface_data_id",
            "is_texture_parametrization",
            "texture_coordinates",
        ],
        vec![
            gml_id,
            Value::Integer(geometry_id),
            Value::Integer(surface_data_id),
            is_texture,
            coordinates,
        ],
    )
}
