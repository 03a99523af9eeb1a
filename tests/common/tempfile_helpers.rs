//! Temp directories for cache tests.

use anyhow::Context;
use std::path::PathBuf;

pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}

/// A path inside `dir` that does not exist yet.
pub fn blob_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(format!("{}.gfpc", name))
}
