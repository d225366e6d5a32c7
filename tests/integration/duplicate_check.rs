#![allow(missing_docs)]

mod common;

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use cityload::config::DuplicateMode;
use cityload::model::Property;
use cityload::{Feature, FeatureReader, ImportError, Importer, InterruptHandle, ReadSummary, Result};
use common::{config, count, open, square, write_features};
use rusqlite::Connection;
use tempfile::tempdir;

fn building(gml_id: &str, z: f64) -> Feature {
    Feature::top_level("Building", gml_id).with(Property::Geometry {
        role: "lod2MultiSurface".into(),
        geometry: square(&format!("{gml_id}_roof"), None, z),
    })
}

fn seed(config: &cityload::ImporterConfig, dir: &std::path::Path) -> Result<()> {
    let seed = write_features(&dir.join("seed.jsonl"), &[building("bldg_007", 1.0)])?;
    let outcome = Importer::new(config.clone())?.run(&[seed]);
    assert!(outcome.success(), "{:?}", outcome.error);
    Ok(())
}

#[test]
fn existing_top_level_feature_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    seed(&config, dir.path())?;

    let input = write_features(
        &dir.path().join("delivery.jsonl"),
        &[building("bldg_006", 2.0), building("bldg_007", 2.0), building("bldg_008", 2.0)],
    )?;
    let log = Importer::new(config.clone())?.check_duplicates(&[input])?;
    assert!(log.has_duplicates()?);
    assert_eq!(log.len()?, 1);
    let records = log.records()?;
    assert_eq!(records[0].gml_id, "bldg_007");

    let conn = open(&config);
    let existing: i64 = conn.query_row("SELECT id FROM feature WHERE gmlid = 'bldg_007'", [], |row| row.get(0))?;
    assert_eq!(records[0].existing_id, existing);
    Ok(())
}

#[test]
fn skip_mode_leaves_existing_features_alone() -> Result<()> {
    let dir = tempdir()?;
    let mut config = config(dir.path());
    seed(&config, dir.path())?;

    config.duplicates.mode = DuplicateMode::Skip;
    let input = write_features(
        &dir.path().join("delivery.jsonl"),
        &[building("bldg_007", 2.0), building("bldg_008", 2.0)],
    )?;
    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.counters.skipped_duplicates, 1);
    assert_eq!(outcome.counters.top_level_features, 1);
    let report = outcome.duplicates.expect("duplicate report");
    assert_eq!((report.found, report.deleted), (1, 0));

    let conn = open(&config);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM feature WHERE gmlid = 'bldg_007'"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM feature WHERE gmlid = 'bldg_008'"), 1);
    Ok(())
}

#[test]
fn delete_mode_replaces_existing_features() -> Result<()> {
    let dir = tempdir()?;
    let mut config = config(dir.path());
    seed(&config, dir.path())?;
    let conn = open(&config);
    let old_id: i64 = conn.query_row("SELECT id FROM feature WHERE gmlid = 'bldg_007'", [], |row| row.get(0))?;

    config.duplicates.mode = DuplicateMode::Delete;
    let input = write_features(&dir.path().join("delivery.jsonl"), &[building("bldg_007", 2.0)])?;
    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success(), "{:?}", outcome.error);
    let report = outcome.duplicates.expect("duplicate report");
    assert_eq!(report.found, 1);
    assert_eq!(report.deleted, 1);

    assert_eq!(count(&conn, "SELECT COUNT(*) FROM feature WHERE gmlid = 'bldg_007'"), 1);
    let new_id: i64 = conn.query_row("SELECT id FROM feature WHERE gmlid = 'bldg_007'", [], |row| row.get(0))?;
    assert_ne!(new_id, old_id);
    assert_eq!(
        count(&conn, &format!("SELECT COUNT(*) FROM surface_geometry WHERE feature_id = {old_id}")),
        0
    );
    Ok(())
}

/// Emits `bldg_0..` and interrupts once the first `logged` duplicates are
/// visible in the checker's log under `store_dir`.
struct InterruptingCheckReader {
    store_dir: PathBuf,
    logged: usize,
    handle: Arc<OnceLock<InterruptHandle>>,
}

impl InterruptingCheckReader {
    fn logged_rows(&self) -> i64 {
        let Ok(entries) = std::fs::read_dir(&self.store_dir) else {
            return 0;
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("cityload-duplicates-"))
            .filter_map(|entry| Connection::open(entry.path().join("duplicates.db")).ok())
            .filter_map(|conn| conn.query_row("SELECT COUNT(*) FROM duplicate", [], |row| row.get::<_, i64>(0)).ok())
            .sum()
    }

    fn wait_for_log(&self) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            if self.logged_rows() >= self.logged as i64 {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("duplicates were not logged before deadline");
    }
}

impl FeatureReader for InterruptingCheckReader {
    fn read(&mut self, _path: &Path, sink: &mut dyn FnMut(Feature) -> Result<()>) -> Result<ReadSummary> {
        let mut summary = ReadSummary::default();
        for i in 0.. {
            if i == self.logged {
                self.wait_for_log();
                self.handle.get().expect("handle installed").interrupt();
            }
            match sink(building(&format!("bldg_{i}"), 2.0)) {
                Ok(()) => summary.features += 1,
                Err(ImportError::Interrupted) => {
                    summary.stopped = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(summary)
    }
}

#[test]
fn interrupted_check_returns_what_was_logged() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let existing: Vec<Feature> = (0..10).map(|i| building(&format!("bldg_{i}"), 1.0)).collect();
    let seed = write_features(&dir.path().join("seed.jsonl"), &existing)?;
    assert!(Importer::new(config.clone())?.run(&[seed]).success());

    let first = dir.path().join("first.jsonl");
    let second = dir.path().join("second.jsonl");
    std::fs::write(&first, "")?;
    std::fs::write(&second, "")?;

    let handle = Arc::new(OnceLock::new());
    let mut importer = Importer::new(config.clone())?.with_reader(InterruptingCheckReader {
        store_dir: config.xlink.store_dir.clone().expect("store dir configured"),
        logged: 4,
        handle: Arc::clone(&handle),
    });
    let _ = handle.set(importer.interrupt_handle());

    let log = importer.check_duplicates(&[first, second])?;
    let ids: Vec<String> = log.records()?.into_iter().map(|record| record.gml_id).collect();
    assert_eq!(ids, ["bldg_0", "bldg_1", "bldg_2", "bldg_3"]);
    Ok(())
}
