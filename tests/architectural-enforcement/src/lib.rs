//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the bridge crates:
//! - No sleep() calls in production code
//! - No blocking I/O inside the async runtime
//!
//! These tests are designed to catch violations early in the development cycle.
//! The helpers here locate the production source trees relative to this
//! package so the checks work from any working directory.

use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["bridge/core/src", "bridge/daemon/src"];

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Absolute paths of every production source directory
#[must_use]
pub fn production_source_dirs() -> Vec<PathBuf> {
    PRODUCTION_DIRS
        .iter()
        .map(|dir| workspace_root().join(dir))
        .collect()
}

/// Every `.rs` file under `dir`
///
/// # Panics
///
/// Panics if `dir` does not exist, so a moved crate cannot make the checks
/// pass by scanning nothing.
#[must_use]
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    assert!(
        dir.is_dir(),
        "production source directory not found: {}",
        dir.display()
    );

    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_dirs_resolve() {
        for dir in production_source_dirs() {
            assert!(!rust_files(&dir).is_empty(), "{} has no sources", dir.display());
        }
    }
}
