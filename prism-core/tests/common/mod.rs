//! Shared fixture for the end-to-end tests: a small farm survey dataset
//! and helpers for driving runs across workspace generations.

#![allow(dead_code)]

use std::path::Path;

use rusqlite::{params, Connection};

use prism_core::{Prism, PrismConfig, RunReport};

pub const CONFIG_BASIC: &str = r#"
file: farms.gpkg
work-packages:
  - name: Kyle
    value: [Kyle Flynn, 4]
    mergin-project: farmcorp/wp-kyle
  - name: Emma
    value: [Emma Johnston, 1, 2]
    mergin-project: farmcorp/wp-emma
tables:
  - name: farms
    method: filter-column
    filter-column-name: owner
  - name: trees
    method: filter-column
    filter-column-name: farm_id
"#;

pub const CONFIG_GEOMETRY: &str = r#"
file: farms.gpkg
work-packages:
  - name: Kyle
    value: POLYGON((0 12, 25 12, 25 25, 0 25, 0 12))
    mergin-project: farmcorp/wp-kyle
  - name: Emma
    value: POLYGON((0 0, 25 0, 25 12, 0 12, 0 0))
    mergin-project: farmcorp/wp-emma
tables:
  - name: farms
    method: filter-geometry
  - name: trees
    method: filter-geometry
"#;

// ---------------------------------------------------------------------------
// GeoPackage geometry encoding
// ---------------------------------------------------------------------------

/// Wrap little-endian WKB in a standard GeoPackage header (no envelope).
fn gpkg_blob(wkb: Vec<u8>) -> Vec<u8> {
    let mut blob = vec![0x47, 0x50, 0x00, 0x01];
    blob.extend_from_slice(&3857_i32.to_le_bytes());
    blob.extend(wkb);
    blob
}

pub fn gpkg_point(x: f64, y: f64) -> Vec<u8> {
    let mut wkb = vec![0x01];
    wkb.extend_from_slice(&1_u32.to_le_bytes());
    wkb.extend_from_slice(&x.to_le_bytes());
    wkb.extend_from_slice(&y.to_le_bytes());
    gpkg_blob(wkb)
}

pub fn gpkg_polygon(ring: &[(f64, f64)]) -> Vec<u8> {
    let mut wkb = vec![0x01];
    wkb.extend_from_slice(&3_u32.to_le_bytes());
    wkb.extend_from_slice(&1_u32.to_le_bytes());
    wkb.extend_from_slice(&(ring.len() as u32).to_le_bytes());
    for (x, y) in ring {
        wkb.extend_from_slice(&x.to_le_bytes());
        wkb.extend_from_slice(&y.to_le_bytes());
    }
    gpkg_blob(wkb)
}

fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<u8> {
    gpkg_polygon(&[(x0, y0), (x1, y0), (x1, y1), (x0, y1), (x0, y0)])
}

// ---------------------------------------------------------------------------
// Fixture dataset
// ---------------------------------------------------------------------------

/// Build the farm dataset: 4 farms, 9 trees, 3 species.
pub fn create_farm_dataset(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE gpkg_geometry_columns (table_name TEXT NOT NULL, column_name TEXT NOT NULL);
         INSERT INTO gpkg_geometry_columns VALUES ('farms', 'geometry'), ('trees', 'geometry');
         CREATE TABLE farms (
             fid INTEGER PRIMARY KEY,
             name TEXT,
             owner TEXT,
             geometry BLOB
         );
         CREATE TABLE trees (
             fid INTEGER PRIMARY KEY,
             tree_species_id INTEGER,
             farm_id INTEGER,
             age_years INTEGER,
             geometry BLOB
         );
         CREATE TABLE tree_species (
             fid INTEGER PRIMARY KEY,
             name TEXT,
             name_latin TEXT
         );
         INSERT INTO tree_species VALUES
             (1, 'Apple tree', 'Malus domestica'),
             (2, 'Orange tree', 'Citrus sinensis'),
             (3, 'Mango tree', 'Mangifera indica');",
    )
    .unwrap();

    let farms: &[(i64, &str, &str, Vec<u8>)] = &[
        (1, "Oasis Gardens", "Emma Johnston", rect(5.0, 5.0, 10.0, 10.0)),
        (2, "Tranquility Estate", "Emma Johnston", rect(15.0, 5.0, 20.0, 10.0)),
        (3, "Rainbow Farm", "Lily Fleming", rect(15.0, 15.0, 20.0, 20.0)),
        (4, "Melody Orchard", "Kyle Flynn", rect(5.0, 15.0, 10.0, 20.0)),
    ];
    for (fid, name, owner, geometry) in farms {
        conn.execute(
            "INSERT INTO farms (fid, name, owner, geometry) VALUES (?1, ?2, ?3, ?4)",
            params![fid, name, owner, geometry],
        )
        .unwrap();
    }

    let trees: &[(i64, i64, i64, f64, f64)] = &[
        (1, 1, 1, 6.0, 6.0),
        (2, 1, 1, 8.0, 7.0),
        (3, 1, 1, 7.0, 8.0),
        (4, 1, 2, 16.0, 6.0),
        (5, 2, 2, 18.0, 7.0),
        (6, 3, 2, 17.0, 8.0),
        (7, 3, 3, 17.5, 17.5),
        (8, 2, 4, 8.0, 17.0),
        (9, 3, 4, 7.0, 18.0),
    ];
    for (fid, species, farm, x, y) in trees {
        conn.execute(
            "INSERT INTO trees (fid, tree_species_id, farm_id, geometry) VALUES (?1, ?2, ?3, ?4)",
            params![fid, species, farm, gpkg_point(*x, *y)],
        )
        .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Edit helpers (the kinds of changes a field app would make)
// ---------------------------------------------------------------------------

/// Insert a tree with a fresh primary key (max + 1, as GeoPackage editors
/// assign them) and return it.
pub fn insert_tree(path: &Path, x: f64, y: f64, species: i64, farm_id: i64) -> i64 {
    let conn = Connection::open(path).unwrap();
    let fid: i64 = conn
        .query_row("SELECT coalesce(max(fid), 0) + 1 FROM trees", [], |row| {
            row.get(0)
        })
        .unwrap();
    conn.execute(
        "INSERT INTO trees (fid, tree_species_id, farm_id, geometry) VALUES (?1, ?2, ?3, ?4)",
        params![fid, species, farm_id, gpkg_point(x, y)],
    )
    .unwrap();
    fid
}

pub fn update_tree_age(path: &Path, fid: i64, age: i64) {
    let conn = Connection::open(path).unwrap();
    let updated = conn
        .execute(
            "UPDATE trees SET age_years = ?1 WHERE fid = ?2",
            params![age, fid],
        )
        .unwrap();
    assert_eq!(updated, 1, "no tree with fid {}", fid);
}

pub fn delete_tree(path: &Path, fid: i64) {
    let conn = Connection::open(path).unwrap();
    let deleted = conn
        .execute("DELETE FROM trees WHERE fid = ?1", params![fid])
        .unwrap();
    assert_eq!(deleted, 1, "no tree with fid {}", fid);
}

// ---------------------------------------------------------------------------
// Inspection helpers
// ---------------------------------------------------------------------------

pub fn row_count(path: &Path, table: &str) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row(&format!("SELECT count(*) FROM \"{}\"", table), [], |row| {
        row.get(0)
    })
    .unwrap()
}

pub fn assert_counts(path: &Path, farms: i64, trees: i64) {
    assert_eq!(row_count(path, "farms"), farms, "farms in {:?}", path);
    assert_eq!(row_count(path, "trees"), trees, "trees in {:?}", path);
}

pub fn tree_fids(path: &Path) -> Vec<i64> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare("SELECT fid FROM trees ORDER BY fid").unwrap();
    stmt.query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<Vec<i64>>>()
        .unwrap()
}

pub fn tree_age(path: &Path, fid: i64) -> Option<i64> {
    let conn = Connection::open(path).unwrap();
    conn.query_row(
        "SELECT age_years FROM trees WHERE fid = ?1",
        params![fid],
        |row| row.get(0),
    )
    .unwrap()
}

pub fn tree_exists(path: &Path, fid: i64) -> bool {
    let conn = Connection::open(path).unwrap();
    let count: i64 = conn
        .query_row(
            "SELECT count(*) FROM trees WHERE fid = ?1",
            params![fid],
            |row| row.get(0),
        )
        .unwrap();
    count == 1
}

// ---------------------------------------------------------------------------
// Workspace helpers
// ---------------------------------------------------------------------------

/// Create a first-run workspace: `input/master.gpkg` holding the farm
/// dataset, nothing else.
pub fn fresh_workspace(root: &Path) {
    std::fs::create_dir_all(root.join("input")).unwrap();
    create_farm_dataset(&root.join("input").join("master.gpkg"));
}

/// Stage the next run: the previous run's outputs become `base/` and
/// `input/` of a new workspace.
pub fn next_run(previous_root: &Path, next_root: &Path) {
    std::fs::create_dir_all(next_root.join("base")).unwrap();
    std::fs::create_dir_all(next_root.join("input")).unwrap();

    let output = previous_root.join("output");
    std::fs::copy(output.join("remap.db"), next_root.join("base").join("remap.db")).unwrap();
    for entry in std::fs::read_dir(&output).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(".gpkg") {
            std::fs::copy(entry.path(), next_root.join("base").join(&name)).unwrap();
            std::fs::copy(entry.path(), next_root.join("input").join(&name)).unwrap();
        }
    }
}

pub fn run(root: &Path, config_yaml: &str) -> RunReport {
    try_run(root, config_yaml).unwrap()
}

pub fn try_run(root: &Path, config_yaml: &str) -> prism_core::error::Result<RunReport> {
    let config = PrismConfig::from_str(config_yaml)?;
    Prism::new(config).run(root)
}
