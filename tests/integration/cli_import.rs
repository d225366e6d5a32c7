#![allow(missing_docs)]

mod common;

use assert_cmd::cargo::cargo_bin_cmd;
use cityload::model::{AttributeValue, Property};
use cityload::{Feature, Result};
use common::{reference, write_features};
use serde_json::Value;
use tempfile::{tempdir, TempDir};

fn delivery() -> Result<(TempDir, std::path::PathBuf)> {
    let dir = tempdir()?;
    let input = write_features(
        &dir.path().join("city.jsonl"),
        &[
            Feature::top_level("Building", "bldg_1").with(reference("address", "#addr_1")),
            Feature::top_level("Address", "addr_1").with(Property::Attribute {
                name: "street".into(),
                value: AttributeValue::Text("Main Street".into()),
            }),
        ],
    )?;
    Ok((dir, input))
}

#[test]
fn import_reports_json_counters() -> Result<()> {
    let (dir, input) = delivery()?;
    let db = dir.path().join("city.db");
    let output = cargo_bin_cmd!("cityload")
        .args(["--format", "json", "import", "--db"])
        .arg(&db)
        .arg(&input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output)?;
    assert_eq!(json["state"], "Done");
    assert_eq!(json["counters"]["top_level_features"], 2);
    assert_eq!(json["counters"]["xlinks_resolved"], 1);
    assert!(json["error"].is_null());
    Ok(())
}

#[test]
fn import_text_report_lists_xlink_accounting() -> Result<()> {
    let (dir, input) = delivery()?;
    let db = dir.path().join("city.db");
    let output = cargo_bin_cmd!("cityload")
        .args(["--theme", "plain", "import", "--db"])
        .arg(&db)
        .arg(&input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    let xlinks: Vec<&str> = text
        .lines()
        .skip_while(|line| *line != "Xlinks")
        .skip(1)
        .take_while(|line| line.starts_with("  "))
        .map(|line| line.split_whitespace().next().unwrap_or_default())
        .collect();
    assert_eq!(xlinks, ["registered", "resolved", "dangling", "cyclic", "lost"]);
    assert!(text.contains("import finished"));
    Ok(())
}

#[test]
fn check_duplicates_lists_existing_features() -> Result<()> {
    let (dir, input) = delivery()?;
    let db = dir.path().join("city.db");
    cargo_bin_cmd!("cityload")
        .args(["-q", "import", "--db"])
        .arg(&db)
        .arg(&input)
        .assert()
        .success();

    let output = cargo_bin_cmd!("cityload")
        .args(["--format", "json", "check-duplicates", "--db"])
        .arg(&db)
        .arg(&input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output)?;
    let ids: Vec<&str> = json
        .as_array()
        .expect("array of duplicates")
        .iter()
        .filter_map(|record| record["gml_id"].as_str())
        .collect();
    assert_eq!(ids, ["addr_1", "bldg_1"]);
    Ok(())
}

#[test]
fn index_toggle_round_trips() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("city.db");
    let status = |db: &std::path::Path| -> Result<Vec<bool>> {
        let output = cargo_bin_cmd!("cityload")
            .args(["--format", "json", "index", "status", "--db"])
            .arg(db)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let json: Value = serde_json::from_slice(&output)?;
        Ok(json
            .as_array()
            .map(|all| all.iter().filter_map(|s| s["active"].as_bool()).collect())
            .unwrap_or_default())
    };

    let before = status(&db)?;
    assert!(!before.is_empty());
    assert!(before.iter().all(|active| *active));

    cargo_bin_cmd!("cityload")
        .args(["-q", "index", "deactivate", "--db"])
        .arg(&db)
        .assert()
        .success();
    assert!(status(&db)?.iter().all(|active| !*active));

    cargo_bin_cmd!("cityload")
        .args(["-q", "index", "activate", "--db"])
        .arg(&db)
        .assert()
        .success();
    assert!(status(&db)?.iter().all(|active| *active));
    Ok(())
}

#[test]
fn missing_input_fails() {
    let dir = tempdir().expect("tempdir");
    cargo_bin_cmd!("cityload")
        .args(["import", "--db"])
        .arg(dir.path().join("city.db"))
        .arg(dir.path().join("absent.jsonl"))
        .assert()
        .failure();
}
