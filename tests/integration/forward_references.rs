#![allow(missing_docs)]

mod common;

use cityload::model::Property;
use cityload::{Feature, Importer, Result};
use common::{config, count, feature_id, init_tracing, open, reference, write_features};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tempfile::tempdir;

#[test]
fn address_declared_later_is_linked_after_import() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config = config(dir.path());
    let input = write_features(
        &dir.path().join("city.jsonl"),
        &[
            Feature::top_level("Building", "bldg_1").with(reference("address", "#addr_9")),
            Feature::top_level("Address", "addr_9"),
        ],
    )?;

    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success(), "{:?}", outcome.error);

    let conn = open(&config);
    let addr = feature_id(&conn, "addr_9").expect("address row");
    let linked: Option<i64> = conn.query_row(
        "SELECT address_id FROM feature WHERE gmlid = 'bldg_1'",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(linked, Some(addr));
    assert_eq!(outcome.counters.xlinks_registered, 1);
    assert_eq!(outcome.counters.xlinks_resolved, 1);
    assert_eq!(outcome.counters.xlinks_dangling, 0);
    Ok(())
}

#[test]
fn references_resolve_regardless_of_arrival_order() -> Result<()> {
    init_tracing();
    let mut features = Vec::new();
    for i in 0..60 {
        let next = (i + 1) % 60;
        features.push(
            Feature::top_level("Building", format!("bldg_{i}"))
                .with(reference("address", &format!("addr_{i}")))
                .with(reference("neighbour", &format!("bldg_{next}"))),
        );
        features.push(Feature::top_level("Address", format!("addr_{i}")));
    }
    features.shuffle(&mut thread_rng());

    let dir = tempdir()?;
    let mut config = config(dir.path());
    config.commit_after = 7;
    let input = write_features(&dir.path().join("shuffled.jsonl"), &features)?;
    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success(), "{:?}", outcome.error);

    let conn = open(&config);
    for i in 0..60 {
        let bldg = feature_id(&conn, &format!("bldg_{i}")).expect("building row");
        let addr = feature_id(&conn, &format!("addr_{i}")).expect("address row");
        let linked: Option<i64> =
            conn.query_row("SELECT address_id FROM feature WHERE id = ?1", [bldg], |row| row.get(0))?;
        assert_eq!(linked, Some(addr), "bldg_{i}");

        let next = feature_id(&conn, &format!("bldg_{}", (i + 1) % 60)).expect("neighbour row");
        let target: i64 = conn.query_row(
            "SELECT target_id FROM feature_reference WHERE feature_id = ?1 AND role = 'neighbour'",
            [bldg],
            |row| row.get(0),
        )?;
        assert_eq!(target, next);
    }
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM feature_reference"), 60);
    assert_eq!(outcome.counters.top_level_features, 120);
    assert_eq!(outcome.counters.xlinks_dangling, 0);
    Ok(())
}

#[test]
fn unknown_and_remote_targets_are_left_unresolved() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config = config(dir.path());
    let input = write_features(
        &dir.path().join("dangling.jsonl"),
        &[Feature::top_level("Building", "bldg_1")
            .with(reference("address", "#nowhere"))
            .with(reference("address", "https://example.org/city.gml#addr_1"))
            .with(Property::Attribute {
                name: "storeys".into(),
                value: cityload::model::AttributeValue::Int(3),
            })],
    )?;

    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success());
    assert_eq!(outcome.counters.xlinks_registered, 1);
    assert_eq!(outcome.counters.xlinks_dangling, 1);

    let conn = open(&config);
    let linked: Option<i64> = conn.query_row(
        "SELECT address_id FROM feature WHERE gmlid = 'bldg_1'",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(linked, None);
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM feature_attribute WHERE name = 'storeys' AND value_num = 3"),
        1
    );
    Ok(())
}
