use crate::{now, Store};
use anyhow::Result;
use std::time::Duration;

// Rows older than this are never served, not even as a last resort.
const DOCUMENT_CACHE_TTL: u64 = 1000 * 60 * 60 * 24 * 90; // 90 days

/// A document previously downloaded from `url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDocument {
    pub data: Vec<u8>,
    /// Time elapsed since the document was stored.
    pub age: Duration,
}

impl Store {
    pub fn get_cached_document(&self, url: &str) -> Result<Option<CachedDocument>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            r#"SELECT data, last_update FROM {} WHERE url = ?"#,
            Self::TABLE_DOCUMENT_CACHE
        ))?;
        let ret = stmt.query_row((url,), |row| {
            Ok((
                row.get::<_, Vec<u8>>("data")?,
                row.get::<_, u64>("last_update")?,
            ))
        });
        let (data, last_update) = match ret {
            Ok(value) => value,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let now = now();
        if last_update + DOCUMENT_CACHE_TTL < now {
            self.delete_cached_document(url)?;
            return Ok(None);
        }
        Ok(Some(CachedDocument {
            data,
            age: Duration::from_millis(now.saturating_sub(last_update)),
        }))
    }

    pub fn cache_document(&self, url: &str, data: &[u8]) -> Result<()> {
        self.cache_document_at(url, data, now())
    }

    fn cache_document_at(&self, url: &str, data: &[u8], last_update: u64) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            r#"INSERT OR REPLACE INTO {} (url, data, last_update) VALUES (?, ?, ?)"#,
            Self::TABLE_DOCUMENT_CACHE
        ))?;
        let _affected = stmt.execute((url, data, &last_update))?;
        self.delete_expired_documents()?;
        Ok(())
    }

    fn delete_cached_document(&self, url: &str) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            r#"DELETE FROM {} WHERE url = ?"#,
            Self::TABLE_DOCUMENT_CACHE
        ))?;
        let _affected = stmt.execute((url,))?;
        Ok(())
    }

    fn delete_expired_documents(&self) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            r#"DELETE FROM {} WHERE last_update < ?"#,
            Self::TABLE_DOCUMENT_CACHE
        ))?;
        let _affected = stmt.execute([now().saturating_sub(DOCUMENT_CACHE_TTL)])?;
        Ok(())
    }
}
