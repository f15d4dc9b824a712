//! Snapshot diffing over the SQLite session extension.
//!
//! Changesets are the session extension's opaque binary encoding of
//! row-level differences. [`SessionEngine`] produces one by attaching the
//! old snapshot to a connection on the new snapshot and running
//! `Session::diff` per table; applying goes through `apply_strm` with a
//! fixed conflict policy.
//!
//! Rebasing reconstructs both sides: replay `our` changeset onto a scratch
//! copy of the base, replay `their` changeset on top of that (resolving and
//! recording row-level conflicts), then re-diff the two scratch states. An
//! empty re-diff means there is nothing left to import.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use fallible_streaming_iterator::FallibleStreamingIterator;
use rusqlite::hooks::Action;
use rusqlite::session::{ChangesetItem, ChangesetIter, ConflictAction, ConflictType, Session};
use rusqlite::Connection;
use serde::Serialize;

use crate::db;
use crate::error::{PrismError, Result};

/// Interface to the snapshot diff engine.
///
/// Changeset files are opaque to callers; only the engine that wrote one
/// can read it back.
pub trait ChangesetEngine {
    /// Compute the difference between two snapshots and write it to
    /// `output`. An empty file means the snapshots hold the same rows.
    fn create_changeset(&self, old_db: &Path, new_db: &Path, output: &Path) -> Result<()>;

    /// Apply a changeset file to a database.
    fn apply_changeset(&self, db: &Path, changeset: &Path) -> Result<()>;

    /// Transform `their` changeset so it applies on top of `our` changeset,
    /// both derived from `base_db`. Writes the rebased changeset to
    /// `output` (only when one was produced) and the conflict report to
    /// `conflicts_output` (only when conflicts arose).
    fn create_rebased_changeset(
        &self,
        base_db: &Path,
        their_changeset: &Path,
        our_changeset: &Path,
        output: &Path,
        conflicts_output: &Path,
    ) -> Result<Rebase>;

    /// Decode a changeset into per-table change counts and write the
    /// summary JSON to `output`.
    fn list_changes(&self, changeset: &Path, output: &Path) -> Result<ChangeSummary>;
}

/// Outcome of a rebase: whether a changeset was produced, and the
/// row-level conflicts resolved along the way. Conflicts are artefacts,
/// not errors; the run continues.
#[derive(Debug, Default)]
pub struct Rebase {
    pub produced: bool,
    pub conflicts: Vec<RebaseConflict>,
}

/// A single resolved rebase conflict.
#[derive(Debug, Clone, Serialize)]
pub struct RebaseConflict {
    pub table: String,
    pub operation: String,
    pub resolution: String,
}

/// Per-table change counts decoded from a changeset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSummary {
    pub tables: Vec<TableChanges>,
}

impl ChangeSummary {
    pub fn total(&self) -> usize {
        self.tables
            .iter()
            .map(|t| t.inserts + t.updates + t.deletes)
            .sum()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TableChanges {
    pub table: String,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

/// The built-in engine over the session extension of the bundled SQLite.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionEngine;

impl ChangesetEngine for SessionEngine {
    fn create_changeset(&self, old_db: &Path, new_db: &Path, output: &Path) -> Result<()> {
        let bytes = diff_to_bytes(old_db, new_db)?;
        tracing::debug!(
            old = %old_db.display(),
            new = %new_db.display(),
            size = bytes.len(),
            "changeset written"
        );
        std::fs::write(output, &bytes)?;
        Ok(())
    }

    fn apply_changeset(&self, db: &Path, changeset: &Path) -> Result<()> {
        let bytes = std::fs::read(changeset)?;
        apply_bytes(db, &bytes, None)
    }

    fn create_rebased_changeset(
        &self,
        base_db: &Path,
        their_changeset: &Path,
        our_changeset: &Path,
        output: &Path,
        conflicts_output: &Path,
    ) -> Result<Rebase> {
        let their = std::fs::read(their_changeset)?;
        let our = std::fs::read(our_changeset)?;

        let scratch = tempfile::tempdir()?;
        let ours_db = scratch.path().join("ours.db");
        let merged_db = scratch.path().join("merged.db");

        // State after `our` changes only.
        db::copy_database(base_db, &ours_db)?;
        apply_bytes(&ours_db, &our, None)?;

        // State after `our` changes plus `their` changes, with conflicts
        // resolved and recorded.
        std::fs::copy(&ours_db, &merged_db)?;
        let sink = Mutex::new(Vec::new());
        apply_bytes(&merged_db, &their, Some(&sink))?;
        let conflicts = sink.into_inner().expect("mutex not poisoned");

        if !conflicts.is_empty() {
            let json = serde_json::to_string_pretty(&conflicts)
                .map_err(|e| PrismError::ChangesetError(e.to_string()))?;
            std::fs::write(conflicts_output, json)?;
        }

        let rebased = diff_to_bytes(&ours_db, &merged_db)?;
        let produced = !rebased.is_empty();
        if produced {
            std::fs::write(output, &rebased)?;
        }
        Ok(Rebase {
            produced,
            conflicts,
        })
    }

    fn list_changes(&self, changeset: &Path, output: &Path) -> Result<ChangeSummary> {
        let bytes = std::fs::read(changeset)?;
        let mut counts: BTreeMap<String, TableChanges> = BTreeMap::new();

        if !bytes.is_empty() {
            let mut input: &[u8] = &bytes;
            let mut reader: &mut dyn std::io::Read = &mut input;
            let mut iter = ChangesetIter::start_strm(&reader)
                .map_err(|e| PrismError::ChangesetError(format!("unreadable changeset: {}", e)))?;
            while let Some(item) = iter
                .next()
                .map_err(|e| PrismError::ChangesetError(format!("unreadable changeset: {}", e)))?
            {
                let op = item
                    .op()
                    .map_err(|e| PrismError::ChangesetError(format!("unreadable changeset: {}", e)))?;
                let entry = counts
                    .entry(op.table_name().to_string())
                    .or_insert_with(|| TableChanges {
                        table: op.table_name().to_string(),
                        ..TableChanges::default()
                    });
                match op.code() {
                    Action::SQLITE_INSERT => entry.inserts += 1,
                    Action::SQLITE_UPDATE => entry.updates += 1,
                    Action::SQLITE_DELETE => entry.deletes += 1,
                    _ => {}
                }
            }
        }

        let summary = ChangeSummary {
            tables: counts.into_values().collect(),
        };
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| PrismError::ChangesetError(e.to_string()))?;
        std::fs::write(output, json)?;
        Ok(summary)
    }
}

/// Tables eligible for diffing: present on both sides with a primary key
/// (the session extension silently skips keyless tables, so they are
/// filtered out up front and logged).
fn diffable_tables(conn: &Connection) -> Result<Vec<String>> {
    let base_tables: HashSet<String> = db::user_tables(conn, "base")?.into_iter().collect();
    let mut tables = Vec::new();
    for table in db::user_tables(conn, "main")? {
        if !base_tables.contains(&table) {
            tracing::debug!(table = %table, "table exists on one side only, not diffed");
            continue;
        }
        let pk_columns: i64 = conn.query_row(
            "SELECT count(*) FROM pragma_table_info(?1) WHERE pk > 0",
            [table.as_str()],
            |row| row.get(0),
        )?;
        if pk_columns == 0 {
            tracing::debug!(table = %table, "table has no primary key, not diffed");
            continue;
        }
        tables.push(table);
    }
    Ok(tables)
}

/// Binary changeset transforming `old_db` into `new_db`; empty when the
/// snapshots hold the same rows.
fn diff_to_bytes(old_db: &Path, new_db: &Path) -> Result<Vec<u8>> {
    let conn = Connection::open(new_db)?;
    db::attach(&conn, old_db, "base")?;
    let tables = diffable_tables(&conn)?;

    let mut buf = Vec::new();
    {
        let mut session = Session::new(&conn)?;
        for table in &tables {
            session.attach(Some(table.as_str()))?;
            session
                .diff("base", table.as_str())
                .map_err(|e| {
                    PrismError::ChangesetError(format!("diff of table '{}' failed: {}", table, e))
                })?;
        }
        if !session.is_empty() {
            session.changeset_strm(&mut buf)?;
        }
    }
    Ok(buf)
}

/// Apply raw changeset bytes to a database file. When a conflict sink is
/// supplied, resolved conflicts are recorded into it; without one the
/// resolutions still apply silently (used when replaying a changeset onto
/// the base it was derived from).
fn apply_bytes(
    db: &Path,
    bytes: &[u8],
    sink: Option<&RefCell<Vec<RebaseConflict>>>,
) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let conn = Connection::open(db)?;
    let mut input: &[u8] = bytes;
    conn.apply_strm(
        &mut input,
        None::<fn(&str) -> bool>,
        |conflict_type, item| resolve_conflict(conflict_type, &item, sink),
    )
    .map_err(|e| PrismError::ChangesetError(format!("failed to apply changeset: {}", e)))?;
    // Keep the main file self-contained for subsequent file-level copies.
    db::checkpoint(&conn)?;
    Ok(())
}

/// Fixed conflict policy: incoming package values win on concurrent
/// updates; operations against rows the other side already deleted are
/// dropped. A delete whose row is already gone is not a conflict (the
/// intent is satisfied).
fn resolve_conflict(
    conflict_type: ConflictType,
    item: &ChangesetItem,
    sink: Option<&RefCell<Vec<RebaseConflict>>>,
) -> ConflictAction {
    let (table, code) = match item.op() {
        Ok(op) => (op.table_name().to_string(), op.code()),
        Err(_) => (String::new(), Action::UNKNOWN),
    };

    let (action, resolution) = match conflict_type {
        ConflictType::SQLITE_CHANGESET_DATA => (ConflictAction::SQLITE_CHANGESET_REPLACE, "theirs"),
        ConflictType::SQLITE_CHANGESET_CONFLICT => {
            (ConflictAction::SQLITE_CHANGESET_REPLACE, "theirs")
        }
        ConflictType::SQLITE_CHANGESET_NOTFOUND => {
            (ConflictAction::SQLITE_CHANGESET_OMIT, "dropped")
        }
        _ => (ConflictAction::SQLITE_CHANGESET_OMIT, "dropped"),
    };

    let benign_delete = matches!(conflict_type, ConflictType::SQLITE_CHANGESET_NOTFOUND)
        && matches!(code, Action::SQLITE_DELETE);
    if !benign_delete {
        if let Some(sink) = sink {
            tracing::warn!(
                table = %table,
                operation = ?code,
                resolution = resolution,
                "rebase conflict"
            );
            sink.borrow_mut().push(RebaseConflict {
                table,
                operation: operation_name(code).to_string(),
                resolution: resolution.to_string(),
            });
        }
    }
    action
}

fn operation_name(code: Action) -> &'static str {
    match code {
        Action::SQLITE_INSERT => "insert",
        Action::SQLITE_UPDATE => "update",
        Action::SQLITE_DELETE => "delete",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SCHEMA: &str = "CREATE TABLE trees (fid INTEGER PRIMARY KEY, species TEXT, age INTEGER)";

    fn make_db(dir: &TempDir, name: &str, rows: &[(i64, &str, i64)]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        for (fid, species, age) in rows {
            conn.execute(
                "INSERT INTO trees VALUES (?1, ?2, ?3)",
                rusqlite::params![fid, species, age],
            )
            .unwrap();
        }
        path
    }

    fn rows(path: &Path) -> Vec<(i64, String, i64)> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare("SELECT fid, species, age FROM trees ORDER BY fid")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_create_and_apply_round_trip() {
        let dir = TempDir::new().unwrap();
        let old = make_db(&dir, "old.db", &[(1, "apple", 3), (2, "pear", 5), (3, "oak", 40)]);
        let new = make_db(&dir, "new.db", &[(1, "apple", 4), (3, "oak", 40), (9, "fir", 1)]);

        let engine = SessionEngine;
        let diff = dir.path().join("delta.diff");
        engine.create_changeset(&old, &new, &diff).unwrap();
        assert!(std::fs::metadata(&diff).unwrap().len() > 0);

        let target = dir.path().join("target.db");
        std::fs::copy(&old, &target).unwrap();
        engine.apply_changeset(&target, &diff).unwrap();
        assert_eq!(rows(&target), rows(&new));
    }

    #[test]
    fn test_identical_snapshots_produce_empty_changeset() {
        let dir = TempDir::new().unwrap();
        let old = make_db(&dir, "old.db", &[(1, "apple", 3)]);
        let new = make_db(&dir, "new.db", &[(1, "apple", 3)]);

        let engine = SessionEngine;
        let diff = dir.path().join("delta.diff");
        engine.create_changeset(&old, &new, &diff).unwrap();
        assert_eq!(std::fs::metadata(&diff).unwrap().len(), 0);

        // Applying the empty changeset is a no-op.
        engine.apply_changeset(&old, &diff).unwrap();
        assert_eq!(rows(&old), vec![(1, "apple".to_string(), 3)]);

        let summary = engine
            .list_changes(&diff, &dir.path().join("delta.json"))
            .unwrap();
        assert_eq!(summary.total(), 0);
    }

    #[test]
    fn test_list_changes_counts() {
        let dir = TempDir::new().unwrap();
        let old = make_db(&dir, "old.db", &[(1, "apple", 3), (2, "pear", 5)]);
        let new = make_db(&dir, "new.db", &[(1, "apple", 9), (7, "fir", 1), (8, "fir", 2)]);

        let engine = SessionEngine;
        let diff = dir.path().join("delta.diff");
        engine.create_changeset(&old, &new, &diff).unwrap();
        let json_path = dir.path().join("delta.json");
        let summary = engine.list_changes(&diff, &json_path).unwrap();

        assert_eq!(summary.tables.len(), 1);
        let changes = &summary.tables[0];
        assert_eq!(changes.table, "trees");
        assert_eq!(changes.inserts, 2);
        assert_eq!(changes.updates, 1);
        assert_eq!(changes.deletes, 1);
        assert!(json_path.exists());
    }

    #[test]
    fn test_rebase_disjoint_changes() {
        let dir = TempDir::new().unwrap();
        let base = make_db(&dir, "base.db", &[(1, "apple", 3), (2, "pear", 5)]);
        let theirs = make_db(&dir, "theirs.db", &[(1, "apple", 10), (2, "pear", 5)]);
        let ours = make_db(&dir, "ours.db", &[(1, "apple", 3), (2, "pear", 20)]);

        let engine = SessionEngine;
        let their_diff = dir.path().join("their.diff");
        let our_diff = dir.path().join("our.diff");
        engine.create_changeset(&base, &theirs, &their_diff).unwrap();
        engine.create_changeset(&base, &ours, &our_diff).unwrap();

        let rebased = dir.path().join("rebased.diff");
        let conflicts = dir.path().join("conflicts.json");
        let outcome = engine
            .create_rebased_changeset(&base, &their_diff, &our_diff, &rebased, &conflicts)
            .unwrap();
        assert!(outcome.produced);
        assert!(outcome.conflicts.is_empty());
        assert!(!conflicts.exists());

        engine.apply_changeset(&ours, &rebased).unwrap();
        assert_eq!(
            rows(&ours),
            vec![(1, "apple".to_string(), 10), (2, "pear".to_string(), 20)]
        );
    }

    #[test]
    fn test_rebase_same_delete_both_sides() {
        let dir = TempDir::new().unwrap();
        let base = make_db(&dir, "base.db", &[(1, "apple", 3), (2, "pear", 5)]);
        let theirs = make_db(&dir, "theirs.db", &[(1, "apple", 3)]);
        let ours = make_db(&dir, "ours.db", &[(1, "apple", 3)]);

        let engine = SessionEngine;
        let their_diff = dir.path().join("their.diff");
        let our_diff = dir.path().join("our.diff");
        engine.create_changeset(&base, &theirs, &their_diff).unwrap();
        engine.create_changeset(&base, &ours, &our_diff).unwrap();

        let outcome = engine
            .create_rebased_changeset(
                &base,
                &their_diff,
                &our_diff,
                &dir.path().join("rebased.diff"),
                &dir.path().join("conflicts.json"),
            )
            .unwrap();
        // The row is already gone; there is nothing to import and the
        // double delete is not a conflict.
        assert!(!outcome.produced);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn test_rebase_concurrent_update_package_wins() {
        let dir = TempDir::new().unwrap();
        let base = make_db(&dir, "base.db", &[(1, "apple", 3)]);
        let theirs = make_db(&dir, "theirs.db", &[(1, "apple", 30)]);
        let ours = make_db(&dir, "ours.db", &[(1, "apple", 40)]);

        let engine = SessionEngine;
        let their_diff = dir.path().join("their.diff");
        let our_diff = dir.path().join("our.diff");
        engine.create_changeset(&base, &theirs, &their_diff).unwrap();
        engine.create_changeset(&base, &ours, &our_diff).unwrap();

        let rebased = dir.path().join("rebased.diff");
        let conflicts_path = dir.path().join("conflicts.json");
        let outcome = engine
            .create_rebased_changeset(&base, &their_diff, &our_diff, &rebased, &conflicts_path)
            .unwrap();
        assert!(outcome.produced);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].table, "trees");
        assert_eq!(outcome.conflicts[0].operation, "update");
        assert!(conflicts_path.exists());

        engine.apply_changeset(&ours, &rebased).unwrap();
        assert_eq!(rows(&ours), vec![(1, "apple".to_string(), 30)]);
    }

    #[test]
    fn test_rebase_update_of_deleted_row_dropped() {
        let dir = TempDir::new().unwrap();
        let base = make_db(&dir, "base.db", &[(1, "apple", 3), (2, "pear", 5)]);
        let theirs = make_db(&dir, "theirs.db", &[(1, "apple", 3), (2, "pear", 50)]);
        let ours = make_db(&dir, "ours.db", &[(1, "apple", 3)]);

        let engine = SessionEngine;
        let their_diff = dir.path().join("their.diff");
        let our_diff = dir.path().join("our.diff");
        engine.create_changeset(&base, &theirs, &their_diff).unwrap();
        engine.create_changeset(&base, &ours, &our_diff).unwrap();

        let outcome = engine
            .create_rebased_changeset(
                &base,
                &their_diff,
                &our_diff,
                &dir.path().join("rebased.diff"),
                &dir.path().join("conflicts.json"),
            )
            .unwrap();
        assert!(!outcome.produced);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].operation, "update");
        assert_eq!(outcome.conflicts[0].resolution, "dropped");
    }
}
