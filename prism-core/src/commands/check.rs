//! Read-only pre-flight validation of a workspace against a configuration.

use rusqlite::Connection;
use serde::Serialize;

use crate::config::{FilterMethod, PrismConfig};
use crate::db;
use crate::error::{PrismError, Result};
use crate::workspace::Workspace;

/// Report returned by the check command.
///
/// `issues` are problems a run would trip over; they are reported rather
/// than raised so a single check surfaces all of them at once. Workspace
/// invariant violations still fail hard, exactly as a run would.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub known_packages: Vec<String>,
    /// Configured packages seen for the first time (no base snapshot yet).
    pub new_packages: Vec<String>,
    /// Packages with a base snapshot that are no longer configured; their
    /// edits are still imported, but they will not be regenerated.
    pub removed_packages: Vec<String>,
    pub issues: Vec<String>,
}

/// Execute the check command. Nothing in the workspace is modified.
pub fn execute(workspace: &Workspace, config: &PrismConfig) -> Result<CheckReport> {
    let known = workspace.validate()?;

    let new_packages: Vec<String> = config
        .work_packages
        .iter()
        .filter(|wp| !known.contains(&wp.name))
        .map(|wp| wp.name.clone())
        .collect();
    let removed_packages: Vec<String> = known
        .iter()
        .filter(|name| !config.work_packages.iter().any(|wp| wp.name.as_str() == name.as_str()))
        .cloned()
        .collect();

    let mut issues = Vec::new();

    for name in &known {
        if !workspace.input_package(name).is_file() {
            issues.push(format!(
                "package '{}' has a base snapshot but no input/{}.gpkg",
                name, name
            ));
        }
    }

    let conn = Connection::open(workspace.input_master())?;
    for table in &config.tables {
        if !db::table_exists(&conn, &table.name)? {
            issues.push(format!("table '{}' does not exist in the master", table.name));
            continue;
        }
        match db::primary_key_column(&conn, &table.name) {
            Ok(_) => {}
            Err(PrismError::UnsupportedSchema { reason, .. }) => {
                issues.push(format!("table '{}': {}", table.name, reason));
            }
            Err(e) => return Err(e),
        }
        if table.method == FilterMethod::Geometry
            && db::geometry_column(&conn, &table.name)?.is_none()
        {
            issues.push(format!(
                "table '{}' uses filter-geometry but has no geometry column",
                table.name
            ));
        }
    }

    tracing::info!(
        known = known.len(),
        new = new_packages.len(),
        removed = removed_packages.len(),
        issues = issues.len(),
        "workspace check complete"
    );

    Ok(CheckReport {
        known_packages: known,
        new_packages,
        removed_packages,
        issues,
    })
}
