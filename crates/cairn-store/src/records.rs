use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Durable key→JSON persistence grouped in namespaces.
pub trait RecordStore: Send + Sync {
    fn put(&self, namespace: &str, key: &str, value: &Value) -> Result<()>;

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    /// Returns whether a record was removed.
    fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// All records of a namespace, ordered by key.
    fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>>;
}

/// Typed helpers over any [`RecordStore`].
pub trait RecordStoreExt: RecordStore {
    fn put_json<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<()> {
        self.put(namespace, key, &serde_json::to_value(value)?)
    }

    fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>> {
        match self.get(namespace, key)? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Decode every record of a namespace; undecodable entries are skipped
    /// with a warning.
    fn list_json<T: DeserializeOwned>(&self, namespace: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for (key, value) in self.list(namespace)? {
            match serde_json::from_value(value) {
                Ok(v) => out.push(v),
                Err(e) => tracing::warn!(namespace, key = %key, error = %e, "skipping bad record"),
            }
        }
        Ok(out)
    }
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {}

impl RecordStore for Database {
    fn put(&self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn()?.execute(
            "INSERT INTO records (namespace, key, json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET json = excluded.json, updated_at = excluded.updated_at",
            params![namespace, key, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let json: Option<String> = self
            .conn()?
            .query_row(
                "SELECT json FROM records WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let affected = self.conn()?.execute(
            "DELETE FROM records WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(affected > 0)
    }

    fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT key, json FROM records WHERE namespace = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![namespace], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, json) = row?;
            out.push((key, serde_json::from_str(&json)?));
        }
        Ok(out)
    }
}

/// Process-local [`RecordStore`] used by tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<BTreeMap<(String, String), Value>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn put(&self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        let mut map = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        map.insert((namespace.to_string(), key.to_string()), value.clone());
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let map = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(map.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let mut map = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(map
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let map = self.inner.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(map
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}
