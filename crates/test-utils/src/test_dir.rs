//! Temporary directories for tests that need real files.

#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A temporary directory, removed with everything in it on drop.
///
/// # Example
///
/// ```
/// use fbdb_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// let path = dir.db_path();
/// assert!(path.starts_with(dir.path()));
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Creates a new temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: TempDir::new().expect("failed to create temp directory") }
    }

    /// The directory itself.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// A path inside the directory.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.inner.path().join(path)
    }

    /// Conventional database file path inside the directory.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.join("test.fbdb")
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
