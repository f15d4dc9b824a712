//! Workspace directory layout and invariants.
//!
//! One run owns a workspace root with four subdirectories:
//!
//! - `base/`   — outputs of the previous run, read-only to this run:
//!   `master.gpkg`, one `<name>.gpkg` per previously-known package, `remap.db`
//! - `input/`  — the files users present this run (same names as `base/`,
//!   any of them possibly edited)
//! - `output/` — rebuilt from scratch every run
//! - `tmp/`    — scratch, also rebuilt every run

use std::path::{Path, PathBuf};

use crate::error::{PrismError, Result};

pub const MASTER_FILE: &str = "master.gpkg";
pub const REMAP_FILE: &str = "remap.db";
const PACKAGE_SUFFIX: &str = ".gpkg";

/// Path layout of a single run's workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn base_dir(&self) -> PathBuf {
        self.root.join("base")
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn base_master(&self) -> PathBuf {
        self.base_dir().join(MASTER_FILE)
    }

    pub fn input_master(&self) -> PathBuf {
        self.input_dir().join(MASTER_FILE)
    }

    pub fn output_master(&self) -> PathBuf {
        self.output_dir().join(MASTER_FILE)
    }

    pub fn base_remap(&self) -> PathBuf {
        self.base_dir().join(REMAP_FILE)
    }

    pub fn output_remap(&self) -> PathBuf {
        self.output_dir().join(REMAP_FILE)
    }

    pub fn base_package(&self, name: &str) -> PathBuf {
        self.base_dir().join(format!("{}{}", name, PACKAGE_SUFFIX))
    }

    pub fn input_package(&self, name: &str) -> PathBuf {
        self.input_dir().join(format!("{}{}", name, PACKAGE_SUFFIX))
    }

    pub fn output_package(&self, name: &str) -> PathBuf {
        self.output_dir().join(format!("{}{}", name, PACKAGE_SUFFIX))
    }

    /// Scratch copy of a package snapshot, re-expressed in master keys
    /// during stage 1.
    pub fn tmp_package(&self, name: &str, role: &str) -> PathBuf {
        self.tmp_dir()
            .join(format!("{}-{}{}", name, role, PACKAGE_SUFFIX))
    }

    /// A diagnostic artefact pair (`.diff` and `.json`) under `output/`.
    pub fn output_artefact(&self, stem: &str) -> (PathBuf, PathBuf) {
        (
            self.output_dir().join(format!("{}.diff", stem)),
            self.output_dir().join(format!("{}.json", stem)),
        )
    }

    /// A diagnostic artefact pair (`.diff` and `.json`) under `tmp/`.
    pub fn tmp_artefact(&self, stem: &str) -> (PathBuf, PathBuf) {
        (
            self.tmp_dir().join(format!("{}.diff", stem)),
            self.tmp_dir().join(format!("{}.json", stem)),
        )
    }

    /// Names of packages generated by the previous run, read from the
    /// `<name>.gpkg` files in `base/`, sorted for a deterministic stage-1
    /// order.
    pub fn known_packages(&self) -> Result<Vec<String>> {
        let base_dir = self.base_dir();
        let mut names = Vec::new();
        if base_dir.exists() {
            for entry in std::fs::read_dir(&base_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let file_name = entry.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };
                if file_name == MASTER_FILE {
                    continue;
                }
                if let Some(stem) = file_name.strip_suffix(PACKAGE_SUFFIX) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Check the workspace before any mutation and return the known
    /// packages. Previously-known packages and `base/remap.db` must appear
    /// together: one without the other means the caller lost part of the
    /// previous run's state.
    pub fn validate(&self) -> Result<Vec<String>> {
        if !self.input_master().is_file() {
            return Err(PrismError::WorkspaceInvariant(format!(
                "input/{} is missing",
                MASTER_FILE
            )));
        }

        let known = self.known_packages()?;
        let has_remap = self.base_remap().is_file();
        if !known.is_empty() && !has_remap {
            return Err(PrismError::WorkspaceInvariant(format!(
                "base/ contains package files but no {}",
                REMAP_FILE
            )));
        }
        if known.is_empty() && has_remap {
            return Err(PrismError::WorkspaceInvariant(format!(
                "base/ contains {} but no package files",
                REMAP_FILE
            )));
        }
        Ok(known)
    }

    /// Purge and recreate `output/` and `tmp/`.
    pub fn prepare(&self) -> Result<()> {
        for dir in [self.output_dir(), self.tmp_dir()] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_known_packages_sorted_without_master() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        touch(&ws.base_master());
        touch(&ws.base_package("Kyle"));
        touch(&ws.base_package("Emma"));
        touch(&ws.base_dir().join("notes.txt"));

        assert_eq!(ws.known_packages().unwrap(), vec!["Emma", "Kyle"]);
    }

    #[test]
    fn test_known_packages_without_base_dir() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        assert!(ws.known_packages().unwrap().is_empty());
    }

    #[test]
    fn test_validate_requires_input_master() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        assert!(matches!(
            ws.validate(),
            Err(PrismError::WorkspaceInvariant(_))
        ));
    }

    #[test]
    fn test_validate_packages_without_remap() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        touch(&ws.input_master());
        touch(&ws.base_package("Kyle"));

        let err = ws.validate().unwrap_err();
        assert!(err.to_string().contains("remap.db"));
    }

    #[test]
    fn test_validate_remap_without_packages() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        touch(&ws.input_master());
        touch(&ws.base_remap());

        assert!(matches!(
            ws.validate(),
            Err(PrismError::WorkspaceInvariant(_))
        ));
    }

    #[test]
    fn test_validate_fresh_workspace() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        touch(&ws.input_master());
        assert!(ws.validate().unwrap().is_empty());
    }

    #[test]
    fn test_prepare_purges_output_and_tmp() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        touch(&ws.output_dir().join("stale.gpkg"));
        touch(&ws.tmp_dir().join("stale.diff"));

        ws.prepare().unwrap();
        assert!(ws.output_dir().exists());
        assert!(ws.tmp_dir().exists());
        assert!(!ws.output_dir().join("stale.gpkg").exists());
        assert!(!ws.tmp_dir().join("stale.diff").exists());
    }
}
