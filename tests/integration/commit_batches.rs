#![allow(missing_docs)]

mod common;

use cityload::model::Property;
use cityload::{Feature, Importer, Result};
use common::{config, count, open, square, write_features};
use tempfile::tempdir;

fn buildings(n: usize) -> Vec<Feature> {
    (0..n)
        .map(|i| {
            Feature::top_level("Building", format!("bldg_{i:03}")).with(Property::Geometry {
                role: "lod1Solid".into(),
                geometry: square(&format!("poly_{i:03}"), None, i as f64),
            })
        })
        .collect()
}

#[test]
fn single_worker_commits_every_threshold_and_the_rest() -> Result<()> {
    let dir = tempdir()?;
    let mut config = config(dir.path());
    config.workers.min = 1;
    config.workers.max = 1;
    config.commit_after = 20;
    let input = write_features(&dir.path().join("city.jsonl"), &buildings(45))?;

    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.counters.batches_committed, 3);
    assert_eq!(outcome.counters.top_level_features, 45);
    assert_eq!(outcome.counters.objects_by_class.get("Building"), Some(&45));

    let conn = open(&config);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM feature WHERE toplevel = 1"), 45);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM surface_geometry"), 45);
    Ok(())
}

#[test]
fn invalid_feature_is_counted_without_losing_its_batch() -> Result<()> {
    let dir = tempdir()?;
    let mut config = config(dir.path());
    config.workers.max = 1;
    config.commit_after = 5;
    let input = dir.path().join("mixed.jsonl");
    write_features(&input, &buildings(4))?;
    let mut text = std::fs::read_to_string(&input)?;
    text.push_str("{\"not\": \"a feature\"}\n");
    std::fs::write(&input, text)?;

    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.counters.validation_errors, 1);
    assert_eq!(outcome.counters.top_level_features, 4);
    assert_eq!(outcome.counters.files_remaining, 0);
    Ok(())
}

#[test]
fn feature_limit_stops_reading_early() -> Result<()> {
    let dir = tempdir()?;
    let mut config = config(dir.path());
    config.limits.max_features = Some(10);
    let input = write_features(&dir.path().join("city.jsonl"), &buildings(30))?;

    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.counters.top_level_features, 10);
    Ok(())
}
