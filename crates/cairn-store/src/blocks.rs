//! Local copy of content-addressed blocks.
//!
//! The table does not compute CIDs itself; callers pass the CID they derived
//! from the canonical JSON so the store stays agnostic of the hashing scheme.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Insert a block. Re-inserting an existing CID is a no-op.
    pub fn put_block(&self, cid: &str, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn()?.execute(
            "INSERT OR IGNORE INTO blocks (cid, json, pinned_at) VALUES (?1, ?2, ?3)",
            params![cid, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_block(&self, cid: &str) -> Result<Option<Value>> {
        let json: Option<String> = self
            .conn()?
            .query_row(
                "SELECT json FROM blocks WHERE cid = ?1",
                params![cid],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, cid: &str) -> Result<bool> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM blocks WHERE cid = ?1",
            params![cid],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn block_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_block() {
        let db = Database::open_in_memory().unwrap();
        db.put_block("f01a9021220aa", &json!({"depth": 0})).unwrap();

        assert!(db.has_block("f01a9021220aa").unwrap());
        assert!(!db.has_block("f01a9021220bb").unwrap());
        assert_eq!(
            db.get_block("f01a9021220aa").unwrap(),
            Some(json!({"depth": 0}))
        );
    }

    #[test]
    fn put_block_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.put_block("c1", &json!(1)).unwrap();
        db.put_block("c1", &json!(1)).unwrap();
        assert_eq!(db.block_count().unwrap(), 1);
    }
}
