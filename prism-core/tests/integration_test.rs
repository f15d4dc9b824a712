//! End-to-end tests over the farm fixture: first runs, edit propagation in
//! both directions, concurrent edits, and the schema edge cases.
//!
//! Run with: cargo test --test integration_test

mod common;

use common::*;

use rusqlite::Connection;
use tempfile::TempDir;

use prism_core::error::PrismError;
use prism_core::{Prism, PrismConfig};

fn first_run(config: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fresh_workspace(dir.path());
    run(dir.path(), config);
    dir
}

fn second_run_workspace(config: &str) -> (TempDir, TempDir) {
    let first = first_run(config);
    let second = TempDir::new().unwrap();
    next_run(first.path(), second.path());
    (first, second)
}

#[test]
fn test_first_run_splits_by_column() {
    let dir = first_run(CONFIG_BASIC);
    let output = dir.path().join("output");

    assert!(output.join("master.gpkg").is_file());
    assert!(output.join("Kyle.gpkg").is_file());
    assert!(output.join("Emma.gpkg").is_file());
    assert!(output.join("remap.db").is_file());
    assert!(output.join("master-input-output.diff").is_file());
    assert!(output.join("master-input-output.json").is_file());

    assert_counts(&output.join("master.gpkg"), 4, 9);
    assert_counts(&output.join("Kyle.gpkg"), 1, 2);
    assert_counts(&output.join("Emma.gpkg"), 2, 6);

    // Package-local numbering starts at 1,000,000 in key order.
    assert_eq!(tree_fids(&output.join("Kyle.gpkg")), vec![1_000_000, 1_000_001]);

    // Unconfigured tables are carried over unfiltered.
    assert_eq!(row_count(&output.join("Kyle.gpkg"), "tree_species"), 3);
}

#[test]
fn test_first_run_splits_by_geometry() {
    let dir = first_run(CONFIG_GEOMETRY);
    let output = dir.path().join("output");

    assert_counts(&output.join("master.gpkg"), 4, 9);
    assert_counts(&output.join("Kyle.gpkg"), 2, 3);
    assert_counts(&output.join("Emma.gpkg"), 2, 6);
}

#[test]
fn test_update_in_package_reaches_master() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    // Kyle's 1000000 is master tree 8.
    update_tree_age(&dir.path().join("input").join("Kyle.gpkg"), 1_000_000, 10);

    run(dir.path(), CONFIG_BASIC);
    let output = dir.path().join("output");

    assert_counts(&output.join("master.gpkg"), 4, 9);
    assert_counts(&output.join("Kyle.gpkg"), 1, 2);
    assert_counts(&output.join("Emma.gpkg"), 2, 6);
    assert_eq!(tree_age(&output.join("master.gpkg"), 8), Some(10));
    assert_eq!(tree_age(&output.join("Kyle.gpkg"), 1_000_000), Some(10));
}

#[test]
fn test_update_in_master_reaches_package() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    // Master tree 9 is Kyle's 1000001.
    update_tree_age(&dir.path().join("input").join("master.gpkg"), 9, 20);

    run(dir.path(), CONFIG_BASIC);
    let output = dir.path().join("output");

    assert_counts(&output.join("master.gpkg"), 4, 9);
    assert_counts(&output.join("Kyle.gpkg"), 1, 2);
    assert_eq!(tree_age(&output.join("master.gpkg"), 9), Some(20));
    assert_eq!(tree_age(&output.join("Kyle.gpkg"), 1_000_001), Some(20));
}

#[test]
fn test_updates_on_both_sides_different_rows() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    update_tree_age(&dir.path().join("input").join("Kyle.gpkg"), 1_000_000, 30);
    update_tree_age(&dir.path().join("input").join("master.gpkg"), 9, 40);

    run(dir.path(), CONFIG_BASIC);
    let output = dir.path().join("output");

    assert_counts(&output.join("master.gpkg"), 4, 9);
    assert_eq!(tree_age(&output.join("master.gpkg"), 8), Some(30));
    assert_eq!(tree_age(&output.join("master.gpkg"), 9), Some(40));
    assert_eq!(tree_age(&output.join("Kyle.gpkg"), 1_000_000), Some(30));
    assert_eq!(tree_age(&output.join("Kyle.gpkg"), 1_000_001), Some(40));
}

#[test]
fn test_concurrent_update_same_row_package_wins() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    update_tree_age(&dir.path().join("input").join("Kyle.gpkg"), 1_000_000, 30);
    update_tree_age(&dir.path().join("input").join("master.gpkg"), 8, 40);

    let report = run(dir.path(), CONFIG_BASIC);
    let output = dir.path().join("output");

    let kyle = report.merged.iter().find(|m| m.name == "Kyle").unwrap();
    assert!(kyle.applied);
    assert_eq!(kyle.conflicts, 1);

    assert_eq!(tree_age(&output.join("master.gpkg"), 8), Some(30));
    assert_eq!(tree_age(&output.join("Kyle.gpkg"), 1_000_000), Some(30));
}

#[test]
fn test_delete_in_package_reaches_master() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    delete_tree(&dir.path().join("input").join("Kyle.gpkg"), 1_000_000);

    run(dir.path(), CONFIG_BASIC);
    let output = dir.path().join("output");

    assert_counts(&output.join("master.gpkg"), 4, 8);
    assert_counts(&output.join("Kyle.gpkg"), 1, 1);
    assert_counts(&output.join("Emma.gpkg"), 2, 6);
    assert!(!tree_exists(&output.join("master.gpkg"), 8));
}

#[test]
fn test_delete_in_master_reaches_package() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    delete_tree(&dir.path().join("input").join("master.gpkg"), 9);

    run(dir.path(), CONFIG_BASIC);
    let output = dir.path().join("output");

    assert_counts(&output.join("master.gpkg"), 4, 8);
    assert_counts(&output.join("Kyle.gpkg"), 1, 1);
    assert!(!tree_exists(&output.join("Kyle.gpkg"), 1_000_001));
}

#[test]
fn test_same_row_deleted_on_both_sides() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    // Master tree 9 and Kyle's 1000001 are the same row.
    delete_tree(&dir.path().join("input").join("master.gpkg"), 9);
    delete_tree(&dir.path().join("input").join("Kyle.gpkg"), 1_000_001);

    run(dir.path(), CONFIG_BASIC);
    let output = dir.path().join("output");

    assert_counts(&output.join("master.gpkg"), 4, 8);
    assert_counts(&output.join("Kyle.gpkg"), 1, 1);
    assert_counts(&output.join("Emma.gpkg"), 2, 6);
    assert!(!tree_exists(&output.join("master.gpkg"), 9));
    assert!(!tree_exists(&output.join("Kyle.gpkg"), 1_000_001));
}

#[test]
fn test_inserts_in_two_packages_get_distinct_master_keys() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    let kyle_fid = insert_tree(&dir.path().join("input").join("Kyle.gpkg"), 6.0, 16.0, 1, 4);
    let emma_fid = insert_tree(&dir.path().join("input").join("Emma.gpkg"), 7.0, 17.0, 2, 2);
    assert_eq!(kyle_fid, 1_000_002);
    assert_eq!(emma_fid, 1_000_006);

    run(dir.path(), CONFIG_BASIC);
    let output = dir.path().join("output");

    assert_counts(&output.join("master.gpkg"), 4, 11);
    assert_counts(&output.join("Kyle.gpkg"), 1, 3);
    assert_counts(&output.join("Emma.gpkg"), 2, 7);
    // Each package keeps its own local numbering for its new row.
    assert!(tree_exists(&output.join("Kyle.gpkg"), 1_000_002));
    assert!(tree_exists(&output.join("Emma.gpkg"), 1_000_006));
}

#[test]
fn test_insert_in_master_and_package() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    insert_tree(&dir.path().join("input").join("master.gpkg"), 9.0, 19.0, 3, 4);
    insert_tree(&dir.path().join("input").join("Kyle.gpkg"), 6.0, 16.0, 1, 4);

    run(dir.path(), CONFIG_BASIC);
    let output = dir.path().join("output");

    assert_counts(&output.join("master.gpkg"), 4, 11);
    assert_counts(&output.join("Kyle.gpkg"), 1, 4);
    assert_counts(&output.join("Emma.gpkg"), 2, 6);
    assert!(tree_exists(&output.join("Kyle.gpkg"), 1_000_002));
    assert!(tree_exists(&output.join("Kyle.gpkg"), 1_000_003));
}

#[test]
fn test_rerun_without_edits_is_idempotent() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    let report = run(dir.path(), CONFIG_BASIC);

    // Nothing changed, so nothing was imported.
    assert!(report.merged.iter().all(|m| !m.applied));

    let output = dir.path().join("output");
    assert_counts(&output.join("master.gpkg"), 4, 9);
    assert_counts(&output.join("Kyle.gpkg"), 1, 2);
    assert_counts(&output.join("Emma.gpkg"), 2, 6);
    assert_eq!(tree_fids(&output.join("Kyle.gpkg")), vec![1_000_000, 1_000_001]);

    // A third generation still maps the same rows to the same keys.
    let third = TempDir::new().unwrap();
    next_run(dir.path(), third.path());
    run(third.path(), CONFIG_BASIC);
    let third_output = third.path().join("output");
    assert_eq!(
        tree_fids(&third_output.join("Kyle.gpkg")),
        vec![1_000_000, 1_000_001]
    );
    assert_eq!(
        remap_rows(&output.join("remap.db")),
        remap_rows(&third_output.join("remap.db"))
    );
}

fn remap_rows(path: &std::path::Path) -> Vec<(String, i64, i64)> {
    let conn = Connection::open(path).unwrap();
    let tables: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap();

    let mut rows = Vec::new();
    for table in tables {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT master_fid, wp_fid FROM \"{}\" ORDER BY master_fid",
                table
            ))
            .unwrap();
        for pair in stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
        {
            let (master_fid, wp_fid) = pair.unwrap();
            rows.push((table.clone(), master_fid, wp_fid));
        }
    }
    rows
}

#[test]
fn test_package_diagnostics_written_on_second_run() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    // No input package on the first run means no package diff there.
    assert!(!_first
        .path()
        .join("output")
        .join("Kyle-input-output.diff")
        .exists());

    update_tree_age(&dir.path().join("input").join("Kyle.gpkg"), 1_000_000, 10);
    run(dir.path(), CONFIG_BASIC);

    let output = dir.path().join("output");
    assert!(output.join("Kyle-input-output.diff").is_file());
    assert!(output.join("Kyle-input-output.json").is_file());
    assert!(output.join("master-base-output.diff").is_file());
}

#[test]
fn test_package_removed_from_config_still_merges() {
    let (_first, dir) = second_run_workspace(CONFIG_BASIC);
    update_tree_age(&dir.path().join("input").join("Emma.gpkg"), 1_000_000, 50);

    let without_emma = r#"
file: farms.gpkg
work-packages:
  - name: Kyle
    value: [Kyle Flynn, 4]
    mergin-project: farmcorp/wp-kyle
tables:
  - name: farms
    method: filter-column
    filter-column-name: owner
  - name: trees
    method: filter-column
    filter-column-name: farm_id
"#;
    let report = run(dir.path(), without_emma);
    let output = dir.path().join("output");

    // Emma's edit was imported (her 1000000 is master tree 1), but her
    // package is no longer generated.
    assert!(report.merged.iter().any(|m| m.name == "Emma" && m.applied));
    assert_eq!(tree_age(&output.join("master.gpkg"), 1), Some(50));
    assert!(!output.join("Emma.gpkg").exists());
    assert!(output.join("Kyle.gpkg").is_file());
}

#[test]
fn test_custom_primary_key_column() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("input")).unwrap();
    let master = dir.path().join("input").join("master.gpkg");
    let conn = Connection::open(&master).unwrap();
    conn.execute_batch(
        "CREATE TABLE farms (objectid INTEGER PRIMARY KEY, owner TEXT);
         INSERT INTO farms VALUES (1, 'Emma Johnston'), (4, 'Kyle Flynn');
         CREATE TABLE trees (objectid INTEGER PRIMARY KEY, farm_id INTEGER);
         INSERT INTO trees VALUES (1, 1), (2, 4), (3, 4);",
    )
    .unwrap();
    drop(conn);

    run(dir.path(), CONFIG_BASIC);
    let output = dir.path().join("output");

    assert_counts(&output.join("master.gpkg"), 2, 3);
    assert_counts(&output.join("Kyle.gpkg"), 1, 2);
    assert_counts(&output.join("Emma.gpkg"), 1, 1);
}

#[test]
fn test_multi_column_primary_key_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("input")).unwrap();
    let master = dir.path().join("input").join("master.gpkg");
    let conn = Connection::open(&master).unwrap();
    conn.execute_batch(
        "CREATE TABLE farms (region INTEGER, plot INTEGER, owner TEXT, PRIMARY KEY (region, plot));
         CREATE TABLE trees (fid INTEGER PRIMARY KEY, farm_id INTEGER);",
    )
    .unwrap();
    drop(conn);

    let err = try_run(dir.path(), CONFIG_BASIC).unwrap_err();
    assert!(matches!(err, PrismError::UnsupportedSchema { .. }));
}

#[test]
fn test_quoted_identifiers_end_to_end() {
    let config = r#"
file: sites.gpkg
work-packages:
  - name: Quinn
    value: Quinn
    mergin-project: farmcorp/wp-quinn
tables:
  - name: 'si"te'
    method: filter-column
    filter-column-name: 'ow"ner'
"#;

    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("input")).unwrap();
    let master = dir.path().join("input").join("master.gpkg");
    let conn = Connection::open(&master).unwrap();
    conn.execute_batch(
        "CREATE TABLE \"si\"\"te\" (fid INTEGER PRIMARY KEY, \"ow\"\"ner\" TEXT, note TEXT);
         INSERT INTO \"si\"\"te\" VALUES (1, 'Quinn', 'a'), (2, 'Riley', 'b');",
    )
    .unwrap();
    drop(conn);

    run(dir.path(), config);
    assert_eq!(
        row_count(&dir.path().join("output").join("Quinn.gpkg"), "si\"te"),
        1
    );

    // Edit the package row and run again: the edit must reach the master
    // through the same quoted identifiers.
    let second = TempDir::new().unwrap();
    next_run(dir.path(), second.path());
    let quinn = second.path().join("input").join("Quinn.gpkg");
    let conn = Connection::open(&quinn).unwrap();
    conn.execute(
        "UPDATE \"si\"\"te\" SET note = 'edited' WHERE fid = 1000000",
        [],
    )
    .unwrap();
    drop(conn);

    run(second.path(), config);
    let master_out = second.path().join("output").join("master.gpkg");
    let conn = Connection::open(&master_out).unwrap();
    let note: String = conn
        .query_row("SELECT note FROM \"si\"\"te\" WHERE fid = 1", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(note, "edited");
}

#[test]
fn test_workspace_invariant_enforced() {
    let dir = TempDir::new().unwrap();
    fresh_workspace(dir.path());
    std::fs::create_dir_all(dir.path().join("base")).unwrap();
    std::fs::write(dir.path().join("base").join("Kyle.gpkg"), b"").unwrap();

    let err = try_run(dir.path(), CONFIG_BASIC).unwrap_err();
    assert!(matches!(err, PrismError::WorkspaceInvariant(_)));
    // The invariant fires before output/ is touched.
    assert!(!dir.path().join("output").exists());
}

#[test]
fn test_check_reports_new_packages_and_issues() {
    let dir = TempDir::new().unwrap();
    fresh_workspace(dir.path());

    let config = PrismConfig::from_str(CONFIG_BASIC).unwrap();
    let report = Prism::new(config).check(dir.path()).unwrap();
    assert!(report.known_packages.is_empty());
    assert_eq!(report.new_packages, vec!["Kyle", "Emma"]);
    assert!(report.removed_packages.is_empty());
    assert!(report.issues.is_empty());

    let bad = r#"
file: farms.gpkg
work-packages:
  - name: Kyle
    value: [Kyle Flynn, 4]
    mergin-project: farmcorp/wp-kyle
tables:
  - name: missing_table
    method: filter-column
    filter-column-name: owner
  - name: tree_species
    method: filter-geometry
"#;
    let config = PrismConfig::from_str(bad).unwrap();
    let report = Prism::new(config).check(dir.path()).unwrap();
    assert_eq!(report.issues.len(), 2);
}
