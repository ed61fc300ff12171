//! SQLite persistence for snippets, guest storage rows, the configuration
//! document and accounts.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use host::Snippet;
use host::backend::{AccountSource, ConfigSource, KvRecord, KvStore, MasterAccount, StoreError};
use rusqlite::{Connection, OptionalExtension, Row, params};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS snippets (
    id TEXT PRIMARY KEY,
    reference TEXT NOT NULL,
    name TEXT NOT NULL,
    source TEXT NOT NULL,
    method TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    private INTEGER NOT NULL DEFAULT 0,
    built_in INTEGER NOT NULL DEFAULT 0,
    secret TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snippets_reference_name ON snippets(reference, name);

CREATE TABLE IF NOT EXISTS fn_storage (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, key)
);

CREATE TABLE IF NOT EXISTS config_document (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    document TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    name TEXT NOT NULL,
    avatar TEXT,
    introduce TEXT,
    mail TEXT,
    url TEXT,
    created_at INTEGER NOT NULL
);
";

const SNIPPET_COLUMNS: &str = "id, reference, name, source, method, enabled, private, built_in, \
     secret, created_at, updated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(backend)?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        tracing::debug!("opened sqlite store at {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every snippet stored under `reference/name`, oldest first.
    pub fn find_snippets(&self, reference: &str, name: &str) -> Result<Vec<Snippet>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM snippets WHERE reference = ?1 AND name = ?2 \
                 ORDER BY created_at ASC, rowid ASC",
                SNIPPET_COLUMNS
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![reference, name], snippet_from_row)
            .map_err(backend)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }

    pub fn snippet_by_id(&self, id: &str) -> Result<Option<Snippet>, StoreError> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM snippets WHERE id = ?1", SNIPPET_COLUMNS),
                params![id],
                snippet_from_row,
            )
            .optional()
            .map_err(backend)
    }

    pub fn insert_snippet(&self, snippet: &Snippet) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO snippets ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    SNIPPET_COLUMNS
                ),
                params![
                    snippet.id,
                    snippet.reference,
                    snippet.name,
                    snippet.source,
                    snippet.method,
                    snippet.enabled,
                    snippet.private,
                    snippet.built_in,
                    snippet.secret,
                    snippet.created_at.timestamp_millis(),
                    snippet.updated_at.timestamp_millis(),
                ],
            )
            .map_err(|err| conflict_or_backend(err, &snippet.id))?;
        Ok(())
    }

    /// Replace a snippet's source; `updated_at` moves so compiled code is
    /// rebuilt on the next call.
    pub fn replace_source(
        &self,
        id: &str,
        source: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE snippets SET source = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, source, updated_at.timestamp_millis()],
            )
            .map_err(backend)?;
        Ok(changed > 0)
    }

    /// Flag rows under `reference/name` as built in. Returns rows changed.
    pub fn mark_built_in(&self, reference: &str, name: &str) -> Result<usize, StoreError> {
        self.conn()
            .execute(
                "UPDATE snippets SET built_in = 1 \
                 WHERE reference = ?1 AND name = ?2 AND built_in = 0",
                params![reference, name],
            )
            .map_err(backend)
    }

    pub fn delete_snippet(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute("DELETE FROM snippets WHERE id = ?1", params![id])
            .map_err(backend)?;
        Ok(removed > 0)
    }

    pub fn set_config_document(&self, document: &serde_json::Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(document).map_err(backend)?;
        self.conn()
            .execute(
                "INSERT INTO config_document (id, document) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET document = excluded.document",
                params![text],
            )
            .map_err(backend)?;
        Ok(())
    }

    pub fn insert_account(&self, account: &MasterAccount) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO accounts (id, username, name, avatar, introduce, mail, url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    account.id,
                    account.username,
                    account.name,
                    account.avatar,
                    account.introduce,
                    account.mail,
                    account.url,
                    account.created_at.timestamp_millis(),
                ],
            )
            .map_err(|err| conflict_or_backend(err, &account.id))?;
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        self.conn()
            .query_row(
                "SELECT value FROM fn_storage WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)
    }

    fn find(&self, namespace: &str, key: Option<&str>) -> Result<Vec<KvRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT key, value, created_at FROM fn_storage
                 WHERE namespace = ?1 AND (?2 IS NULL OR key = ?2)
                 ORDER BY created_at DESC, rowid DESC",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![namespace, key], |row| {
                Ok(KvRecord {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    created_at: from_millis(row.get(2)?),
                })
            })
            .map_err(backend)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO fn_storage (namespace, key, value, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
                params![namespace, key, value, Utc::now().timestamp_millis()],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn insert(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO fn_storage (namespace, key, value, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![namespace, key, value, Utc::now().timestamp_millis()],
            )
            .map_err(|err| conflict_or_backend(err, key))?;
        Ok(())
    }

    fn update(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE fn_storage SET value = ?3 WHERE namespace = ?1 AND key = ?2",
                params![namespace, key, value],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::Missing(key.to_string()));
        }
        Ok(())
    }

    fn del(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM fn_storage WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )
            .map_err(backend)?;
        Ok(removed > 0)
    }
}

impl ConfigSource for SqliteStore {
    fn document(&self) -> Result<serde_json::Value, StoreError> {
        let text: Option<String> = self
            .conn()
            .query_row("SELECT document FROM config_document WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(backend)?;
        match text {
            Some(text) => serde_json::from_str(&text).map_err(backend),
            None => Ok(serde_json::Value::Object(serde_json::Map::new())),
        }
    }
}

impl AccountSource for SqliteStore {
    fn master(&self) -> Result<Option<MasterAccount>, StoreError> {
        self.conn()
            .query_row(
                "SELECT id, username, name, avatar, introduce, mail, url, created_at
                 FROM accounts ORDER BY created_at ASC, rowid ASC LIMIT 1",
                [],
                |row| {
                    Ok(MasterAccount {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        name: row.get(2)?,
                        avatar: row.get(3)?,
                        introduce: row.get(4)?,
                        mail: row.get(5)?,
                        url: row.get(6)?,
                        created_at: from_millis(row.get(7)?),
                    })
                },
            )
            .optional()
            .map_err(backend)
    }
}

fn snippet_from_row(row: &Row<'_>) -> rusqlite::Result<Snippet> {
    Ok(Snippet {
        id: row.get(0)?,
        reference: row.get(1)?,
        name: row.get(2)?,
        source: row.get(3)?,
        method: row.get(4)?,
        enabled: row.get(5)?,
        private: row.get(6)?,
        built_in: row.get(7)?,
        secret: row.get(8)?,
        created_at: from_millis(row.get(9)?),
        updated_at: from_millis(row.get(10)?),
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn conflict_or_backend(err: rusqlite::Error, key: &str) -> StoreError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => StoreError::Conflict(key.to_string()),
        _ => backend(err),
    }
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}
