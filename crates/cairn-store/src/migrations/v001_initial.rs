//! v001 -- Initial schema creation.
//!
//! Creates the `records` key/value table and the `blocks` content table.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Namespaced JSON records
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS records (
    namespace  TEXT NOT NULL,                -- e.g. "conversations", "messages/<id>"
    key        TEXT NOT NULL,
    json       TEXT NOT NULL,
    updated_at TEXT NOT NULL,                -- RFC-3339

    PRIMARY KEY (namespace, key)
);

-- ----------------------------------------------------------------
-- Content-addressed blocks (DAG nodes, manifests)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocks (
    cid       TEXT PRIMARY KEY NOT NULL,     -- f01a9021220<sha256 hex>
    json      TEXT NOT NULL,                 -- canonical JSON
    pinned_at TEXT NOT NULL
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
