//! Split/merge engine for partitioned geospatial SQLite datasets.
//!
//! One authoritative dataset (the "master") is filtered into independent
//! derivatives ("work packages"), each edited by a different team. A run
//! merges the edits from every package back into the master and regenerates
//! fresh packages from the merged state, keeping primary keys stable from
//! run to run through a persisted remapping database.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use prism_core::{Prism, PrismConfig};
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PrismConfig::load(Path::new("prism.yml"))?;
//! let prism = Prism::new(config);
//! let report = prism.run(Path::new("./data"))?;
//! println!("Regenerated {} work packages", report.generated.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`config`] — YAML configuration loading and validation
//! - [`workspace`] — the base/input/output/tmp directory contract
//! - [`db`] — SQLite helpers: quoting, introspection, checkpointed copies
//! - [`remap`] — master ↔ package primary-key remapping
//! - [`filter`] — per-package row filtering (attribute and geometry)
//! - [`changeset`] — snapshot diff/apply/rebase over the session extension
//! - [`commands`] — run (the two-stage pipeline) and check (pre-flight)
//! - [`error`] — error types

pub mod changeset;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod remap;
pub mod workspace;

use std::path::Path;

use changeset::{ChangesetEngine, SessionEngine};
use error::Result;
use workspace::Workspace;

pub use commands::check::CheckReport;
pub use commands::run::RunReport;
pub use config::PrismConfig;
pub use error::PrismError;

/// Main entry point for the prism library.
///
/// Create a `Prism` instance with a config and use its methods to run the
/// pipeline programmatically.
pub struct Prism<E = SessionEngine> {
    pub config: PrismConfig,
    engine: E,
}

impl Prism<SessionEngine> {
    /// Create a new instance with the built-in changeset engine.
    pub fn new(config: PrismConfig) -> Self {
        Self {
            config,
            engine: SessionEngine,
        }
    }
}

impl<E: ChangesetEngine> Prism<E> {
    /// Create a new instance with a custom changeset engine.
    pub fn with_engine(config: PrismConfig, engine: E) -> Self {
        Self { config, engine }
    }

    /// Merge package edits into the master and regenerate every configured
    /// package.
    pub fn run(&self, workspace_root: &Path) -> Result<RunReport> {
        let workspace = Workspace::new(workspace_root);
        commands::run::execute(&workspace, &self.config, &self.engine)
    }

    /// Validate the workspace and configuration without modifying anything.
    pub fn check(&self, workspace_root: &Path) -> Result<CheckReport> {
        let workspace = Workspace::new(workspace_root);
        commands::check::execute(&workspace, &self.config)
    }
}
