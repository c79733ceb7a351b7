//! # cairn-store
//!
//! Durable local storage for Cairn, backed by SQLite.
//!
//! Two tables carry everything: `records`, a namespaced key→JSON map used for
//! identities, conversations, messages, pins, queues and call history, and
//! `blocks`, the local copy of every content-addressed DAG node and manifest.
//! [`RecordStore`] abstracts the first so the engine can also run on the
//! in-memory [`MemoryRecordStore`].

pub mod blocks;
pub mod database;
pub mod migrations;
pub mod records;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use records::{MemoryRecordStore, RecordStore};
