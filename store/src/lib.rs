mod document;

pub use document::CachedDocument;

use parking_lot::ReentrantMutex;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use rusqlite::Connection;

/// Local sqlite database keeping downloaded documents across process runs.
#[derive(Debug)]
pub struct Store {
    conn: ReentrantMutex<Connection>,
    db_path: PathBuf,
}

impl Store {
    const TABLE_DOCUMENT_CACHE: &'static str = "document_cache";

    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = match Connection::open(&path) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(
                    path = ?path,
                    error = %e,
                    "open db error, delete and reinitialize db"
                );
                std::fs::remove_file(&path)?;
                Connection::open(&path)?
            }
        };
        let store = Store {
            db_path: path,
            conn: ReentrantMutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store {
            db_path: PathBuf::new(),
            conn: ReentrantMutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                data BLOB NOT NULL,
                last_update INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {table}_last_update ON {table} (last_update);
            "#,
            table = Self::TABLE_DOCUMENT_CACHE,
        ))?;
        Ok(())
    }
}

/// Milliseconds since the unix epoch.
fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("cache.sqlite");
        let store = Store::new(&path)?;
        assert_eq!(store.path(), path.as_path());
        assert!(path.exists());
        Ok(())
    }
}
