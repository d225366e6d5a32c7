#![allow(missing_docs)]

mod common;

use cityload::model::{Geometry, GeometryMember, Property};
use cityload::{Feature, Importer, Result};
use common::{config, count, feature_id, inline, open, square, write_features, xlink, CapturedLog};
use tempfile::tempdir;

fn with_geometry(feature: Feature, geometry: Geometry) -> Feature {
    feature.with(Property::Geometry {
        role: "lod2Solid".into(),
        geometry,
    })
}

fn composite(gml_id: &str, members: Vec<GeometryMember>) -> Geometry {
    Geometry::CompositeSurface {
        gml_id: Some(gml_id.into()),
        members,
    }
}

#[test]
fn solid_shell_reuses_surface_declared_later() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let solid = Geometry::Solid {
        gml_id: Some("solid_1".into()),
        exterior: Box::new(inline(composite(
            "shell_1",
            vec![
                inline(square("poly_1", None, 0.0)),
                xlink("poly_shared"),
                GeometryMember::Xlink {
                    href: "#poly_shared".into(),
                    reverse: true,
                },
            ],
        ))),
    };
    let input = write_features(
        &dir.path().join("solids.jsonl"),
        &[
            with_geometry(Feature::top_level("Building", "bldg_1"), solid),
            with_geometry(
                Feature::top_level("Building", "bldg_2"),
                Geometry::MultiSurface {
                    gml_id: Some("ms_2".into()),
                    members: vec![inline(square("poly_shared", None, 3.0))],
                },
            ),
        ],
    )?;

    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.counters.xlinks_dangling, 0);

    let conn = open(&config);
    let bldg_1 = feature_id(&conn, "bldg_1").expect("bldg_1");
    let original: String = conn.query_row(
        "SELECT geometry FROM surface_geometry WHERE gmlid = 'poly_shared'",
        [],
        |row| row.get(0),
    )?;
    let mut copies = conn.prepare(
        "SELECT kind, geometry, is_reverse FROM surface_geometry
         WHERE feature_id = ?1 AND is_xlink = 1 ORDER BY id",
    )?;
    let copies: Vec<(String, String, bool)> = copies
        .query_map([bldg_1], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<_>>()?;
    assert_eq!(copies.len(), 2);
    assert_eq!(copies[0], ("polygon".to_string(), original.clone(), false));
    assert_eq!(copies[1].0, "polygon");
    assert!(copies[1].2);
    assert_ne!(copies[1].1, original);

    let shell: String = conn.query_row(
        "SELECT solid_geometry FROM surface_geometry WHERE gmlid = 'solid_1'",
        [],
        |row| row.get(0),
    )?;
    let shell: serde_json::Value = serde_json::from_str(&shell)?;
    assert_eq!(shell["shell"].as_array().map(Vec::len), Some(3));
    Ok(())
}

#[test]
fn chained_references_copy_the_resolved_tree() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let input = write_features(
        &dir.path().join("chain.jsonl"),
        &[
            with_geometry(
                Feature::top_level("Building", "bldg_a"),
                Geometry::MultiSurface {
                    gml_id: Some("ms_a".into()),
                    members: vec![xlink("cs_b")],
                },
            ),
            with_geometry(
                Feature::top_level("Building", "bldg_b"),
                composite("cs_b", vec![xlink("poly_c"), inline(square("poly_b", None, 1.0))]),
            ),
            with_geometry(Feature::top_level("Building", "bldg_c"), square("poly_c", None, 2.0)),
        ],
    )?;

    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.counters.xlinks_cyclic, 0);

    let conn = open(&config);
    let bldg_a = feature_id(&conn, "bldg_a").expect("bldg_a");
    let polygons: i64 = conn.query_row(
        "SELECT COUNT(*) FROM surface_geometry WHERE feature_id = ?1 AND kind = 'polygon'",
        [bldg_a],
        |row| row.get(0),
    )?;
    assert_eq!(polygons, 2);
    let roots: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT root_id) FROM surface_geometry WHERE feature_id = ?1",
        [bldg_a],
        |row| row.get(0),
    )?;
    assert_eq!(roots, 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM surface_geometry WHERE kind = 'xlink'"), 0);
    Ok(())
}

#[test]
fn geometry_cycle_is_cut_off() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let input = write_features(
        &dir.path().join("cycle.jsonl"),
        &[
            with_geometry(Feature::top_level("Building", "bldg_x"), composite("cs_x", vec![xlink("cs_y")])),
            with_geometry(Feature::top_level("Building", "bldg_y"), composite("cs_y", vec![xlink("cs_x")])),
        ],
    )?;

    let log = CapturedLog::default();
    let outcome = log.capture(|| -> Result<_> { Ok(Importer::new(config.clone())?.run(&[input])) })?;
    assert!(outcome.success());
    assert_eq!(outcome.counters.xlinks_cyclic, 2);
    let contents = log.contents();
    assert_eq!(
        contents
            .lines()
            .filter(|line| line.contains("illegal graph cycle") && line.contains("surface_geometry"))
            .count(),
        1,
        "{contents}"
    );
    Ok(())
}
