#![allow(missing_docs)]

mod common;

use cityload::model::{
    Appearance, Geometry, Property, SurfaceData, SurfaceDataKind, SurfaceDataMember, TexCoordRing,
    TextureParameterization, TextureTarget,
};
use cityload::{Feature, Importer, Result};
use common::{config, count, inline, open, square, write_features};
use tempfile::tempdir;

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nnot really an image";

fn textured_building() -> Feature {
    let texture = SurfaceData {
        gml_id: Some("tex_1".into()),
        kind: SurfaceDataKind::ParameterizedTexture {
            image_uri: "tex/wall.png".into(),
            targets: vec![
                TextureTarget {
                    uri: "#poly_1".into(),
                    parameterization: TextureParameterization::TexCoordList {
                        gml_id: Some("tc_1".into()),
                        rings: vec![TexCoordRing {
                            ring: "#ring_1".into(),
                            coords: vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0],
                        }],
                    },
                },
                TextureTarget {
                    uri: "#poly_2".into(),
                    parameterization: TextureParameterization::Xlink { href: "#tc_1".into() },
                },
            ],
        },
    };
    let material = SurfaceData {
        gml_id: Some("mat_1".into()),
        kind: SurfaceDataKind::X3dMaterial {
            diffuse_color: Some([0.8, 0.2, 0.2]),
            targets: vec!["#poly_2".into()],
        },
    };
    Feature::top_level("Building", "bldg_1")
        .with(Property::Appearance {
            appearance: Appearance {
                gml_id: Some("app_1".into()),
                theme: Some("rgbTexture".into()),
                surface_data: vec![
                    SurfaceDataMember::Inline { surface_data: texture },
                    SurfaceDataMember::Inline { surface_data: material },
                ],
            },
        })
        .with(Property::Geometry {
            role: "lod2MultiSurface".into(),
            geometry: Geometry::MultiSurface {
                gml_id: Some("ms_1".into()),
                members: vec![inline(square("poly_1", Some("ring_1"), 0.0))],
            },
        })
        .with(Property::Material {
            href: "#mat_1".into(),
            target: "#poly_1".into(),
        })
}

fn neighbour() -> Feature {
    Feature::top_level("Building", "bldg_2")
        .with(Property::Geometry {
            role: "lod2MultiSurface".into(),
            geometry: square("poly_2", Some("ring_2"), 5.0),
        })
        .with(Property::Appearance {
            appearance: Appearance {
                gml_id: None,
                theme: Some("rgbTexture".into()),
                surface_data: vec![SurfaceDataMember::Xlink { href: "#tex_1".into() }],
            },
        })
}

#[test]
fn texture_chain_lands_in_category_order() -> Result<()> {
    let dir = tempdir()?;
    std::fs::create_dir(dir.path().join("tex"))?;
    std::fs::write(dir.path().join("tex/wall.png"), PNG_BYTES)?;
    let config = config(dir.path());
    let input = write_features(&dir.path().join("textured.jsonl"), &[textured_building(), neighbour()])?;

    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.counters.xlinks_dangling, 0);

    let conn = open(&config);
    let (data, mime): (Vec<u8>, String) =
        conn.query_row("SELECT data, mime_type FROM tex_image", [], |row| Ok((row.get(0)?, row.get(1)?)))?;
    assert_eq!(data, PNG_BYTES);
    assert_eq!(mime, "image/png");

    let poly_1: i64 =
        conn.query_row("SELECT id FROM surface_geometry WHERE gmlid = 'poly_1'", [], |row| row.get(0))?;
    let poly_2: i64 =
        conn.query_row("SELECT id FROM surface_geometry WHERE gmlid = 'poly_2'", [], |row| row.get(0))?;
    let (listed, coords): (i64, String) = conn.query_row(
        "SELECT surface_geometry_id, texture_coordinates FROM textureparam WHERE gmlid = 'tc_1'",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    assert_eq!(listed, poly_1);
    let coords: serde_json::Value = serde_json::from_str(&coords)?;
    assert_eq!(coords["ring"], "ring_1");

    let reused: (i64, String) = conn.query_row(
        "SELECT is_texture_parametrization, texture_coordinates FROM textureparam
         WHERE gmlid IS NULL AND surface_geometry_id = ?1 AND is_texture_parametrization = 1",
        [poly_2],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    assert_eq!(reused.0, 1);
    assert_eq!(serde_json::from_str::<serde_json::Value>(&reused.1)?["ring"], "ring_1");

    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM textureparam WHERE is_texture_parametrization = 0"),
        2
    );
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM textureparam"), 4);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM appear_to_surface_data"), 3);
    Ok(())
}

#[test]
fn missing_image_is_dangling() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let input = write_features(&dir.path().join("untextured.jsonl"), &[textured_building()])?;

    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success());
    // The image, plus the association and the material targeting the undeclared poly_2.
    assert_eq!(outcome.counters.xlinks_dangling, 3);

    let conn = open(&config);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM tex_image WHERE data IS NULL"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM textureparam WHERE gmlid = 'tc_1'"), 1);
    Ok(())
}
