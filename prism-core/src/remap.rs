//! Primary-key remapping between master and work-package numbering.
//!
//! Each work package carries its own numbering of rows, because two packages
//! may otherwise assign the same fresh primary key to different rows. For
//! every (table, package) pair an auxiliary relation in the attached `remap`
//! database records `(master_fid, wp_fid)` pairs. Any key seen on one side
//! without a mapping is assigned a fresh key on the other side.
//!
//! Both operations expect the remap database already attached under the
//! `remap` alias and an open transaction on the connection; the caller owns
//! the commit, so mapping inserts land atomically with the key rewrite.
//! Mapping entries are never deleted, even when the underlying row is gone
//! on both sides, so a key value is never reused.

use rusqlite::Connection;

use crate::db::{primary_key_column, quote_ident};
use crate::error::Result;

/// Work-package keys for rows first seen on the master side start here.
const WP_FID_FLOOR: i64 = 1_000_000;

/// Schema-qualified, quoted name of the mapping relation for a
/// (table, package) pair.
fn mapping_table(table: &str, package: &str) -> String {
    format!("\"remap\".{}", quote_ident(&format!("{}_{}", table, package)))
}

fn ensure_mapping_table(conn: &Connection, mapping: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (master_fid INTEGER PRIMARY KEY, wp_fid INTEGER UNIQUE)",
        mapping
    ))?;
    Ok(())
}

/// Keys present in the target table that have no mapping entry yet, in
/// ascending key order so fresh assignments are deterministic.
fn unmapped_ids(
    conn: &Connection,
    table: &str,
    pk: &str,
    mapping: &str,
    mapped_side: &str,
    missing_side: &str,
) -> Result<Vec<i64>> {
    let sql = format!(
        "SELECT t.{pk} FROM {table} AS t \
         LEFT JOIN {mapping} AS m ON t.{pk} = m.{mapped} \
         WHERE m.{missing} IS NULL ORDER BY t.{pk}",
        pk = quote_ident(pk),
        table = quote_ident(table),
        mapping = mapping,
        mapped = mapped_side,
        missing = missing_side,
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids: Vec<i64> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Rewrite every key of the target table according to the mapping.
///
/// Two phases: negate all keys first, then update each row to its mapped
/// positive value. Going through the negative range keeps the uniqueness
/// constraint satisfied while old and new key ranges overlap.
fn rewrite_keys(conn: &Connection, table: &str, pk: &str, pairs: &[(i64, i64)]) -> Result<()> {
    let table_sql = quote_ident(table);
    let pk_sql = quote_ident(pk);

    conn.execute(
        &format!("UPDATE {} SET {} = -{}", table_sql, pk_sql, pk_sql),
        [],
    )?;

    let mut stmt = conn.prepare(&format!(
        "UPDATE {} SET {} = ?1 WHERE {} = ?2",
        table_sql, pk_sql, pk_sql
    ))?;
    for (from, to) in pairs {
        stmt.execute([*to, -*from])?;
    }
    Ok(())
}

/// Collect `(current_key, mapped_key)` pairs for every row of the table.
fn key_pairs(
    conn: &Connection,
    table: &str,
    pk: &str,
    mapping: &str,
    current_side: &str,
    target_side: &str,
) -> Result<Vec<(i64, i64)>> {
    let sql = format!(
        "SELECT t.{pk}, m.{target} FROM {table} AS t \
         JOIN {mapping} AS m ON t.{pk} = m.{current}",
        pk = quote_ident(pk),
        table = quote_ident(table),
        mapping = mapping,
        current = current_side,
        target = target_side,
    );
    let mut stmt = conn.prepare(&sql)?;
    let pairs: Vec<(i64, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(pairs)
}

/// Rewrite the primary keys of `table` from master numbering to the
/// package-local numbering of `package`.
///
/// Master keys without a mapping are assigned fresh package keys starting
/// at 1,000,000 (or one past the highest package key ever assigned).
pub fn remap_master_to_wp(conn: &Connection, table: &str, package: &str) -> Result<()> {
    let mapping = mapping_table(table, package);
    ensure_mapping_table(conn, &mapping)?;
    let pk = primary_key_column(conn, table)?;

    let missing = unmapped_ids(conn, table, &pk, &mapping, "master_fid", "wp_fid")?;

    let max_wp: Option<i64> = conn.query_row(
        &format!("SELECT max(wp_fid) FROM {}", mapping),
        [],
        |row| row.get(0),
    )?;
    let mut next_wp_fid = max_wp.map_or(WP_FID_FLOOR, |m| m + 1);

    if !missing.is_empty() {
        tracing::debug!(
            table = %table,
            package = %package,
            count = missing.len(),
            first = next_wp_fid,
            "assigning package keys to new master rows"
        );
        let mut stmt = conn.prepare(&format!(
            "INSERT INTO {} (master_fid, wp_fid) VALUES (?1, ?2)",
            mapping
        ))?;
        for master_fid in &missing {
            stmt.execute([*master_fid, next_wp_fid])?;
            next_wp_fid += 1;
        }
    }

    let pairs = key_pairs(conn, table, &pk, &mapping, "master_fid", "wp_fid")?;
    rewrite_keys(conn, table, &pk, &pairs)
}

/// Rewrite the primary keys of `table` from the package-local numbering of
/// `package` back to master numbering.
///
/// Package keys without a mapping are rows inserted inside the package;
/// they are assigned master keys starting at `first_unused_master_id`,
/// which the caller computes from the current merged master.
pub fn remap_wp_to_master(
    conn: &Connection,
    table: &str,
    package: &str,
    first_unused_master_id: i64,
) -> Result<()> {
    let mapping = mapping_table(table, package);
    ensure_mapping_table(conn, &mapping)?;
    let pk = primary_key_column(conn, table)?;

    let missing = unmapped_ids(conn, table, &pk, &mapping, "wp_fid", "master_fid")?;

    if !missing.is_empty() {
        tracing::debug!(
            table = %table,
            package = %package,
            count = missing.len(),
            first = first_unused_master_id,
            "assigning master keys to new package rows"
        );
        let mut stmt = conn.prepare(&format!(
            "INSERT INTO {} (master_fid, wp_fid) VALUES (?1, ?2)",
            mapping
        ))?;
        let mut next_master_fid = first_unused_master_id;
        for wp_fid in &missing {
            stmt.execute([next_master_fid, *wp_fid])?;
            next_master_fid += 1;
        }
    }

    let pairs = key_pairs(conn, table, &pk, &mapping, "wp_fid", "master_fid")?;
    rewrite_keys(conn, table, &pk, &pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;
    use tempfile::TempDir;

    /// Open a table database with the remap database attached, both backed
    /// by files so the mapping survives reconnects.
    fn setup(dir: &TempDir, rows: &[i64]) -> Connection {
        let conn = Connection::open(dir.path().join("data.db")).unwrap();
        conn.execute_batch("CREATE TABLE IF NOT EXISTS trees (fid INTEGER PRIMARY KEY, label TEXT)")
            .unwrap();
        for fid in rows {
            conn.execute(
                "INSERT INTO trees (fid, label) VALUES (?1, 'tree-' || ?1)",
                [fid],
            )
            .unwrap();
        }
        db::attach(&conn, &dir.path().join("remap.db"), "remap").unwrap();
        conn
    }

    fn fids(conn: &Connection) -> Vec<i64> {
        let mut stmt = conn.prepare("SELECT fid FROM trees ORDER BY fid").unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<i64>>>()
            .unwrap()
    }

    fn mapping_rows(conn: &Connection) -> Vec<(i64, i64)> {
        let mut stmt = conn
            .prepare("SELECT master_fid, wp_fid FROM \"remap\".\"trees_Kyle\" ORDER BY master_fid")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_fresh_assignment_starts_at_floor() {
        let dir = TempDir::new().unwrap();
        let mut conn = setup(&dir, &[8, 9]);

        let tx = conn.transaction().unwrap();
        remap_master_to_wp(&tx, "trees", "Kyle").unwrap();
        tx.commit().unwrap();

        assert_eq!(fids(&conn), vec![1_000_000, 1_000_001]);
        assert_eq!(mapping_rows(&conn), vec![(8, 1_000_000), (9, 1_000_001)]);
    }

    #[test]
    fn test_round_trip_is_stable() {
        let dir = TempDir::new().unwrap();
        let mut conn = setup(&dir, &[8, 9]);

        let tx = conn.transaction().unwrap();
        remap_master_to_wp(&tx, "trees", "Kyle").unwrap();
        tx.commit().unwrap();

        let tx = conn.transaction().unwrap();
        remap_wp_to_master(&tx, "trees", "Kyle", 10).unwrap();
        tx.commit().unwrap();
        assert_eq!(fids(&conn), vec![8, 9]);

        // A second pass reuses existing entries and changes nothing.
        let tx = conn.transaction().unwrap();
        remap_master_to_wp(&tx, "trees", "Kyle").unwrap();
        tx.commit().unwrap();
        assert_eq!(fids(&conn), vec![1_000_000, 1_000_001]);
        assert_eq!(mapping_rows(&conn), vec![(8, 1_000_000), (9, 1_000_001)]);
    }

    #[test]
    fn test_new_package_rows_get_fresh_master_keys() {
        let dir = TempDir::new().unwrap();
        let mut conn = setup(&dir, &[8, 9]);

        let tx = conn.transaction().unwrap();
        remap_master_to_wp(&tx, "trees", "Kyle").unwrap();
        tx.commit().unwrap();

        // The package inserts a row with the next local key.
        conn.execute(
            "INSERT INTO trees (fid, label) VALUES (1000002, 'new')",
            [],
        )
        .unwrap();

        let tx = conn.transaction().unwrap();
        remap_wp_to_master(&tx, "trees", "Kyle", 10).unwrap();
        tx.commit().unwrap();

        assert_eq!(fids(&conn), vec![8, 9, 10]);
        assert_eq!(
            mapping_rows(&conn),
            vec![(8, 1_000_000), (9, 1_000_001), (10, 1_000_002)]
        );
    }

    #[test]
    fn test_rewrite_survives_swapped_mapping() {
        // A mapping that swaps two live keys collides under a naive
        // one-phase UPDATE; the negation staging must absorb it.
        let dir = TempDir::new().unwrap();
        let mut conn = setup(&dir, &[1, 2]);
        conn.execute_batch(
            "CREATE TABLE \"remap\".\"trees_Kyle\" (master_fid INTEGER PRIMARY KEY, wp_fid INTEGER UNIQUE);
             INSERT INTO \"remap\".\"trees_Kyle\" VALUES (1, 2), (2, 1);",
        )
        .unwrap();

        let tx = conn.transaction().unwrap();
        remap_master_to_wp(&tx, "trees", "Kyle").unwrap();
        tx.commit().unwrap();

        let mut stmt = conn
            .prepare("SELECT fid, label FROM trees ORDER BY fid")
            .unwrap();
        let rows: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![(1, "tree-2".to_string()), (2, "tree-1".to_string())]
        );
    }

    #[test]
    fn test_entries_survive_row_deletion() {
        let dir = TempDir::new().unwrap();
        let mut conn = setup(&dir, &[8, 9]);

        let tx = conn.transaction().unwrap();
        remap_master_to_wp(&tx, "trees", "Kyle").unwrap();
        tx.commit().unwrap();

        conn.execute("DELETE FROM trees WHERE fid = 1000000", [])
            .unwrap();

        let tx = conn.transaction().unwrap();
        remap_wp_to_master(&tx, "trees", "Kyle", 10).unwrap();
        tx.commit().unwrap();

        // The mapping for the deleted row is retained, so its keys are
        // never handed out again.
        assert_eq!(mapping_rows(&conn), vec![(8, 1_000_000), (9, 1_000_001)]);
        assert_eq!(fids(&conn), vec![9]);
    }

    #[test]
    fn test_custom_primary_key_name() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("data.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE plots (objectid INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO plots VALUES (5, 'a'), (6, 'b');",
        )
        .unwrap();
        db::attach(&conn, &dir.path().join("remap.db"), "remap").unwrap();

        let mut conn = conn;
        let tx = conn.transaction().unwrap();
        remap_master_to_wp(&tx, "plots", "Emma").unwrap();
        tx.commit().unwrap();

        let ids: Vec<i64> = conn
            .prepare("SELECT objectid FROM plots ORDER BY objectid")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(ids, vec![1_000_000, 1_000_001]);
    }
}
