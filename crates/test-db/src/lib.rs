use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A scratch directory holding one database file, removed on drop.
pub struct TestDb {
    path: PathBuf,
    _dir: TempDir,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

impl TestDb {
    pub const FILE_NAME: &'static str = "threadtree.sqlite3";

    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let path = dir.path().join(Self::FILE_NAME);
        Ok(Self { path, _dir: dir })
    }

    /// Path of the database file. The file itself is created by whoever opens it first.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of another file inside the scratch directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self._dir.path().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_in_scratch_dir() {
        let db = TestDb::new().unwrap();
        assert!(db.path().ends_with(TestDb::FILE_NAME));
        assert_eq!(db.path().parent(), db.file("other").parent());
        assert!(!db.path().exists());
    }

    #[test]
    fn test_dir_removed_on_drop() {
        let db = TestDb::new().unwrap();
        let dir = db.path().parent().unwrap().to_path_buf();
        std::fs::write(db.file("scratch"), "x").unwrap();
        drop(db);
        assert!(!dir.exists());
    }
}
