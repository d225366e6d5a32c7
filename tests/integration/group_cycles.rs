#![allow(missing_docs)]

mod common;

use cityload::model::Property;
use cityload::{Feature, Importer, Result};
use common::{config, count, feature_id, open, write_features, CapturedLog};
use tempfile::tempdir;

fn group(gml_id: &str, members: &[&str]) -> Feature {
    members.iter().fold(Feature::top_level("CityObjectGroup", gml_id), |group, member| {
        group.with(Property::GroupMember {
            role: None,
            href: format!("#{member}"),
        })
    })
}

#[test]
fn mutual_membership_is_reported_once_and_abandoned() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let input = write_features(
        &dir.path().join("groups.jsonl"),
        &[
            group("grp_A", &["grp_B"]),
            group("grp_B", &["grp_A"]),
            Feature::top_level("Building", "bldg_1"),
            group("grp_C", &["bldg_1"]),
        ],
    )?;

    let log = CapturedLog::default();
    let outcome = log.capture(|| -> Result<_> { Ok(Importer::new(config.clone())?.run(&[input])) })?;
    assert!(outcome.success(), "{:?}", outcome.error);

    let contents = log.contents();
    let cycle_errors: Vec<&str> = contents
        .lines()
        .filter(|line| line.contains("illegal graph cycle"))
        .collect();
    assert_eq!(cycle_errors.len(), 1, "{contents}");
    assert!(cycle_errors[0].contains("group_member"));
    assert!(cycle_errors[0].contains("ERROR"));

    assert_eq!(outcome.counters.xlinks_cyclic, 2);
    let conn = open(&config);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM group_member"), 1);
    let member: i64 = conn.query_row(
        "SELECT member_id FROM group_member WHERE group_id = ?1",
        [feature_id(&conn, "grp_C").expect("grp_C")],
        |row| row.get(0),
    )?;
    assert_eq!(Some(member), feature_id(&conn, "bldg_1"));
    Ok(())
}

#[test]
fn nested_groups_resolve_innermost_first() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let outer = group("grp_outer", &["grp_middle"]).with(Property::GroupParent {
        href: "#site_1".into(),
    });
    let input = write_features(
        &dir.path().join("nested.jsonl"),
        &[
            outer,
            group("grp_middle", &["grp_inner", "bldg_2"]),
            group("grp_inner", &["bldg_1"]),
            Feature::top_level("Building", "bldg_1"),
            Feature::top_level("Building", "bldg_2"),
            Feature::top_level("Site", "site_1"),
        ],
    )?;

    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.counters.xlinks_cyclic, 0);
    assert_eq!(outcome.counters.xlinks_dangling, 0);

    let conn = open(&config);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM group_member"), 4);
    let parent: Option<i64> = conn.query_row(
        "SELECT group_parent_id FROM feature WHERE gmlid = 'grp_outer'",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(parent, feature_id(&conn, "site_1"));
    Ok(())
}

#[test]
fn self_membership_terminates() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    let input = write_features(&dir.path().join("self.jsonl"), &[group("grp_self", &["grp_self"])])?;

    let outcome = Importer::new(config.clone())?.run(&[input]);
    assert!(outcome.success());
    assert_eq!(outcome.counters.xlinks_cyclic, 1);
    assert_eq!(count(&open(&config), "SELECT COUNT(*) FROM group_member"), 0);
    Ok(())
}
