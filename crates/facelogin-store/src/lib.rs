//! facelogin-store — Registered identity records backed by SQLite.
//!
//! The store keeps descriptors as opaque text; decoding and matching belong to
//! `facelogin-core`. Access goes through `tokio-rusqlite`, which runs every
//! query on a dedicated connection thread.

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    username        TEXT NOT NULL UNIQUE,
    email           TEXT NOT NULL,
    face_encoding   TEXT,
    face_image_path TEXT,
    notify_chat_id  TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS identities_email ON identities (email);
";

const COLUMNS: &str =
    "id, username, email, face_encoding, face_image_path, notify_chat_id, created_at";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("username already exists: {0}")]
    UsernameTaken(String),
    #[error("identity not found: {0}")]
    NotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A registered identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub id: i64,
    pub username: String,
    pub email: String,
    /// Descriptor text; `None` when registration stored no face.
    #[serde(skip_serializing)]
    pub face_encoding: Option<String>,
    pub face_image_path: Option<String>,
    pub notify_chat_id: Option<String>,
    pub created_at: String,
}

/// Fields supplied when saving a new identity; the store assigns the id.
#[derive(Debug, Clone, Default)]
pub struct NewIdentity {
    pub username: String,
    pub email: String,
    pub face_encoding: Option<String>,
    pub face_image_path: Option<String>,
}

/// Record store keyed by numeric id.
#[allow(async_fn_in_trait)]
pub trait IdentityStore {
    /// All identities in ascending id order.
    async fn find_all(&self) -> Result<Vec<Identity>, StoreError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<Identity>, StoreError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>, StoreError>;
    /// Email is not unique; returns every identity registered with it.
    async fn find_by_email(&self, email: &str) -> Result<Vec<Identity>, StoreError>;
    async fn save(&self, identity: NewIdentity) -> Result<Identity, StoreError>;
    async fn count(&self) -> Result<u64, StoreError>;
    async fn set_notify_chat_id(&self, id: i64, chat_id: &str) -> Result<Identity, StoreError>;
}

/// SQLite-backed [`IdentityStore`].
#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        tracing::info!(path = %path.display(), "identity store opened");
        Self::with_connection(conn).await
    }

    /// Private in-memory database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    async fn query_one(
        &self,
        clause: &'static str,
        key: rusqlite::types::Value,
    ) -> Result<Option<Identity>, StoreError> {
        let identity = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {COLUMNS} FROM identities WHERE {clause}");
                let row = conn
                    .query_row(&sql, params![key], row_to_identity)
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(identity)
    }
}

fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        face_encoding: row.get(3)?,
        face_image_path: row.get(4)?,
        notify_chat_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl IdentityStore for SqliteStore {
    async fn find_all(&self) -> Result<Vec<Identity>, StoreError> {
        let identities = self
            .conn
            .call(|conn| {
                let sql = format!("SELECT {COLUMNS} FROM identities ORDER BY id");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], row_to_identity)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        tracing::debug!(count = identities.len(), "loaded all identities");
        Ok(identities)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Identity>, StoreError> {
        self.query_one("id = ?1", id.into()).await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>, StoreError> {
        self.query_one("username = ?1", username.to_string().into()).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Vec<Identity>, StoreError> {
        let email = email.to_string();
        let identities = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {COLUMNS} FROM identities WHERE email = ?1 ORDER BY id");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![email], row_to_identity)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(identities)
    }

    async fn save(&self, identity: NewIdentity) -> Result<Identity, StoreError> {
        let username = identity.username.clone();
        let created_at = chrono::Utc::now().to_rfc3339();

        let result = self
            .conn
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO identities (username, email, face_encoding, face_image_path, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        identity.username,
                        identity.email,
                        identity.face_encoding,
                        identity.face_image_path,
                        created_at,
                    ],
                );
                match inserted {
                    Ok(_) => {}
                    Err(e) if is_unique_violation(&e) => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
                let id = conn.last_insert_rowid();
                let sql = format!("SELECT {COLUMNS} FROM identities WHERE id = ?1");
                let saved = conn.query_row(&sql, params![id], row_to_identity)?;
                Ok(Some(saved))
            })
            .await?;

        let saved = result.ok_or(StoreError::UsernameTaken(username))?;
        tracing::info!(id = saved.id, username = %saved.username, "identity saved");
        Ok(saved)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count = self
            .conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
                Ok(count)
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn set_notify_chat_id(&self, id: i64, chat_id: &str) -> Result<Identity, StoreError> {
        let chat_id = chat_id.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE identities SET notify_chat_id = ?1 WHERE id = ?2",
                    params![chat_id, id],
                )?;
                Ok(changed)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(id));
        }
        self.find_by_id(id).await?.ok_or(StoreError::NotFound(id))
    }
}
