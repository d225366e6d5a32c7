#![allow(missing_docs)]

mod common;

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use cityload::model::Property;
use cityload::xlink::Category;
use cityload::{
    Feature, FeatureReader, ImportError, Importer, InterruptHandle, ProgressEvent, ReadSummary, Result, RunOutcome,
};
use common::{config, count, open, reference, square};
use rusqlite::Connection;
use tempfile::tempdir;

/// Emits buildings forever and interrupts the run once `committed` rows are
/// visible in the target database.
struct InterruptingReader {
    database: PathBuf,
    committed: i64,
    handle: Arc<OnceLock<InterruptHandle>>,
}

impl InterruptingReader {
    fn wait_for_commits(&self) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            if let Ok(conn) = Connection::open(&self.database) {
                let rows: i64 = conn
                    .query_row("SELECT COUNT(*) FROM feature", [], |row| row.get(0))
                    .unwrap_or(0);
                if rows >= self.committed {
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("no commit observed before deadline");
    }
}

impl FeatureReader for InterruptingReader {
    fn read(&mut self, _path: &Path, sink: &mut dyn FnMut(Feature) -> Result<()>) -> Result<ReadSummary> {
        let mut summary = ReadSummary::default();
        for i in 0.. {
            if i == self.committed as usize {
                self.wait_for_commits();
                self.handle.get().expect("handle installed").interrupt();
            }
            let feature = Feature::top_level("Building", format!("bldg_{i}"))
                .with(Property::Geometry {
                    role: "lod2MultiSurface".into(),
                    geometry: square(&format!("poly_{i}"), None, 0.0),
                })
                .with(reference("address", &format!("#addr_{i}")));
            match sink(feature) {
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
fn interrupt_keeps_committed_batches() -> Result<()> {
    let dir = tempdir()?;
    let mut config = config(dir.path());
    config.workers.max = 1;
    config.commit_after = 10;
    let input = dir.path().join("endless.jsonl");
    std::fs::write(&input, "")?;
    let second = dir.path().join("never.jsonl");
    std::fs::write(&second, "")?;

    let handle = Arc::new(OnceLock::new());
    let importer = Importer::new(config.clone())?.with_reader(InterruptingReader {
        database: config.database.clone(),
        committed: 20,
        handle: Arc::clone(&handle),
    });
    let _ = handle.set(importer.interrupt_handle());

    let outcome = importer.run(&[input, second]);
    assert_eq!(outcome.state, RunOutcome::Aborted);
    assert!(outcome.error.is_none());
    assert!(outcome.counters.batches_committed >= 2);
    assert!(outcome.counters.files_remaining >= 1);

    let conn = open(&config);
    let stored = count(&conn, "SELECT COUNT(*) FROM feature WHERE toplevel = 1");
    assert!(stored >= 20);
    assert_eq!(stored as u64, outcome.counters.top_level_features);
    // Resolution never ran for the interrupted file, and every reference of
    // a committed building reached the store or was reported as lost.
    assert_eq!(outcome.counters.xlinks_resolved, 0);
    assert_eq!(
        outcome.counters.xlinks_registered + outcome.counters.xlinks_lost,
        outcome.counters.top_level_features
    );
    Ok(())
}

#[test]
fn interrupt_before_run_imports_nothing() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let input = common::write_features(
        &dir.path().join("city.jsonl"),
        &[Feature::top_level("Building", "bldg_1")],
    )?;

    let importer = Importer::new(config.clone())?;
    importer.interrupt_handle().interrupt();
    let outcome = importer.run(&[input]);
    assert_eq!(outcome.state, RunOutcome::Aborted);
    assert_eq!(outcome.counters.top_level_features, 0);
    Ok(())
}

#[test]
fn interrupted_category_is_applied_whole_or_not_at_all() -> Result<()> {
    let dir = tempdir()?;
    let mut config = config(dir.path());
    config.workers.max = 1;
    config.resolver_batch_size = 1;
    let total = 3000;
    let mut features: Vec<Feature> = (0..total)
        .map(|i| {
            Feature::top_level("Building", format!("bldg_{i}")).with(reference("address", &format!("#addr_{i}")))
        })
        .collect();
    features.extend((0..total).map(|i| Feature::top_level("Address", format!("addr_{i}"))));
    let input = common::write_features(&dir.path().join("city.jsonl"), &features)?;

    let importer = Importer::new(config.clone())?;
    let handle = importer.interrupt_handle();
    let progress = importer.progress();
    let watcher = std::thread::spawn(move || {
        for event in progress {
            if let ProgressEvent::Resolving(Category::Basic) = event {
                handle.interrupt();
            }
        }
    });
    let outcome = importer.run(&[input]);
    watcher.join().expect("progress watcher");

    assert_eq!(outcome.state, RunOutcome::Aborted);
    let conn = open(&config);
    let linked = count(&conn, "SELECT COUNT(*) FROM feature WHERE address_id IS NOT NULL");
    assert!(linked == 0 || linked == total as i64, "{linked} of {total} linked");
    assert_eq!(outcome.counters.xlinks_resolved, linked as u64);
    Ok(())
}
