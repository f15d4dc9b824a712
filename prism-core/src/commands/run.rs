//! The merge/split pipeline.
//!
//! Stage 1 imports edits from every previously-known package into the
//! master: the package snapshots are re-expressed in master keys, diffed
//! against their base, rebased onto whatever happened to the master in the
//! meantime, and applied. Stage 2 then regenerates every configured package
//! from the merged master: copy, filter, renumber, vacuum.
//!
//! Stage-1 iterations are ordered (sorted package names) and sequential:
//! each package observes the master state left by the previous one, and
//! rebase outcomes depend on that order. Stage 2 runs in configuration
//! order.

use std::collections::HashMap;

use rusqlite::Connection;
use serde::Serialize;

use crate::changeset::{ChangeSummary, ChangesetEngine};
use crate::config::{PrismConfig, WorkPackage};
use crate::db;
use crate::error::Result;
use crate::filter;
use crate::remap;
use crate::workspace::Workspace;

/// Report returned after a run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub merged: Vec<MergeDetail>,
    pub generated: Vec<SplitDetail>,
}

/// Stage-1 outcome for one previously-known package.
#[derive(Debug, Serialize)]
pub struct MergeDetail {
    pub name: String,
    /// Whether a rebased changeset was produced and applied to the master.
    pub applied: bool,
    pub conflicts: usize,
    pub changes: Option<ChangeSummary>,
}

/// Stage-2 outcome for one configured package.
#[derive(Debug, Serialize)]
pub struct SplitDetail {
    pub name: String,
    pub tables: Vec<TableRows>,
}

#[derive(Debug, Serialize)]
pub struct TableRows {
    pub table: String,
    pub kept: i64,
    pub dropped: usize,
}

/// Execute the full pipeline on a workspace.
pub fn execute<E: ChangesetEngine>(
    workspace: &Workspace,
    config: &PrismConfig,
    engine: &E,
) -> Result<RunReport> {
    // All invariants are checked before anything is mutated.
    let known = workspace.validate()?;
    workspace.prepare()?;
    tracing::info!(packages = ?known, "previously-known work packages");

    let base_master = workspace.base_master();
    let input_master = workspace.input_master();
    let output_master = workspace.output_master();

    // Upstream master edits, for debugging only.
    if base_master.is_file() {
        let (diff, json) = workspace.tmp_artefact("master-base-input");
        engine.create_changeset(&base_master, &input_master, &diff)?;
        engine.list_changes(&diff, &json)?;
    }

    db::copy_database(&input_master, &output_master)?;
    if workspace.base_remap().is_file() {
        std::fs::copy(workspace.base_remap(), workspace.output_remap())?;
    }

    let mut merged = Vec::with_capacity(known.len());
    for name in &known {
        merged.push(merge_package(workspace, config, engine, name)?);
    }

    // Net effect of all package edits on the master.
    let (diff, json) = workspace.output_artefact("master-input-output");
    engine.create_changeset(&input_master, &output_master, &diff)?;
    engine.list_changes(&diff, &json)?;

    // Everything that happened since the previous run.
    if base_master.is_file() {
        let (diff, json) = workspace.output_artefact("master-base-output");
        engine.create_changeset(&base_master, &output_master, &diff)?;
        engine.list_changes(&diff, &json)?;
    }

    let mut generated = Vec::with_capacity(config.work_packages.len());
    for wp in &config.work_packages {
        generated.push(generate_package(workspace, config, engine, wp)?);
    }

    Ok(RunReport { merged, generated })
}

/// Stage 1 for one package: re-express its snapshots in master keys,
/// rebase its edits onto the current master, apply.
fn merge_package<E: ChangesetEngine>(
    workspace: &Workspace,
    config: &PrismConfig,
    engine: &E,
    name: &str,
) -> Result<MergeDetail> {
    tracing::info!(package = %name, "importing work-package edits");
    let output_master = workspace.output_master();

    // First unused master key per table, from the master as it stands now.
    // Both snapshot copies below must remap identically, so this is
    // computed once per package.
    let next_master_ids: HashMap<String, i64> = {
        let conn = Connection::open(&output_master)?;
        let mut ids = HashMap::new();
        for table in &config.tables {
            let pk = db::primary_key_column(&conn, &table.name)?;
            ids.insert(table.name.clone(), db::next_id(&conn, &table.name, &pk)?);
        }
        ids
    };

    let tmp_base = workspace.tmp_package(name, "base");
    let tmp_input = workspace.tmp_package(name, "input");
    db::copy_database(&workspace.base_package(name), &tmp_base)?;
    db::copy_database(&workspace.input_package(name), &tmp_input)?;

    for snapshot in [&tmp_base, &tmp_input] {
        let mut conn = Connection::open(snapshot)?;
        db::attach(&conn, &workspace.output_remap(), "remap")?;
        let tx = conn.transaction()?;
        for table in &config.tables {
            remap::remap_wp_to_master(&tx, &table.name, name, next_master_ids[&table.name])?;
        }
        tx.commit()?;
    }

    let (their_diff, their_json) = workspace.tmp_artefact(&format!("{}-base-input", name));
    engine.create_changeset(&tmp_base, &tmp_input, &their_diff)?;
    engine.list_changes(&their_diff, &their_json)?;

    let (our_diff, our_json) = workspace.tmp_artefact(&format!("{}-base-output", name));
    engine.create_changeset(&tmp_base, &output_master, &our_diff)?;
    engine.list_changes(&our_diff, &our_json)?;

    let (rebased_diff, rebased_json) = workspace.tmp_artefact(&format!("{}-rebased", name));
    let conflicts_json = workspace
        .tmp_dir()
        .join(format!("{}-rebased-conflicts.json", name));
    let rebase = engine.create_rebased_changeset(
        &workspace.base_master(),
        &their_diff,
        &our_diff,
        &rebased_diff,
        &conflicts_json,
    )?;

    if !rebase.produced {
        tracing::info!(package = %name, "no changes to import");
        return Ok(MergeDetail {
            name: name.to_string(),
            applied: false,
            conflicts: rebase.conflicts.len(),
            changes: None,
        });
    }

    let changes = engine.list_changes(&rebased_diff, &rebased_json)?;
    engine.apply_changeset(&output_master, &rebased_diff)?;
    tracing::info!(
        package = %name,
        changes = changes.total(),
        conflicts = rebase.conflicts.len(),
        "applied package edits to master"
    );

    Ok(MergeDetail {
        name: name.to_string(),
        applied: true,
        conflicts: rebase.conflicts.len(),
        changes: Some(changes),
    })
}

/// Stage 2 for one package: copy the merged master, filter, renumber,
/// vacuum.
fn generate_package<E: ChangesetEngine>(
    workspace: &Workspace,
    config: &PrismConfig,
    engine: &E,
    wp: &WorkPackage,
) -> Result<SplitDetail> {
    tracing::info!(package = %wp.name, "generating work package");
    let output_package = workspace.output_package(&wp.name);
    db::copy_database(&workspace.output_master(), &output_package)?;

    let mut conn = Connection::open(&output_package)?;
    db::attach(&conn, &workspace.output_remap(), "remap")?;

    let mut tables = Vec::with_capacity(config.tables.len());
    let tx = conn.transaction()?;
    for table in &config.tables {
        let dropped = filter::apply_filter(&tx, table, &wp.value)?;
        remap::remap_master_to_wp(&tx, &table.name, &wp.name)?;
        let kept: i64 = tx.query_row(
            &format!("SELECT count(*) FROM {}", db::quote_ident(&table.name)),
            [],
            |row| row.get(0),
        )?;
        tables.push(TableRows {
            table: table.name.clone(),
            kept,
            dropped,
        });
    }
    tx.commit()?;

    // VACUUM must run outside any transaction.
    db::vacuum(&conn)?;
    drop(conn);

    // Collated changes the package's team will receive, for debugging only.
    let input_package = workspace.input_package(&wp.name);
    if input_package.is_file() {
        let (diff, json) = workspace.output_artefact(&format!("{}-input-output", wp.name));
        engine.create_changeset(&input_package, &output_package, &diff)?;
        engine.list_changes(&diff, &json)?;
    }

    Ok(SplitDetail {
        name: wp.name.clone(),
        tables,
    })
}
