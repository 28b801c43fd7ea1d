//! SQLite-backed persistence for profiles and the published classifier.

use chrono::{DateTime, Utc};
use roster_core::persist::{decode_model, encode_model};
use roster_core::{
    ClassifierModel, Embedding, PersistError, ProfileFields, ProfileRecord, Repository,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS profiles (
    id          TEXT PRIMARY KEY,
    position    INTEGER NOT NULL,
    name        TEXT NOT NULL,
    email       TEXT,
    enrolled_at TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    profile_id  TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
    seq         INTEGER NOT NULL,
    dim         INTEGER NOT NULL,
    vector      BLOB NOT NULL,
    PRIMARY KEY (profile_id, seq)
);

CREATE TABLE IF NOT EXISTS classifier (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    body        TEXT NOT NULL,
    saved_at    TEXT NOT NULL
);
";

fn backend(err: rusqlite::Error) -> PersistError {
    PersistError::Backend(err.to_string())
}

pub struct SqliteRepository {
    conn: Connection,
}

impl SqliteRepository {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PersistError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        tracing::info!(path = %path.display(), "opened profile database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, PersistError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, PersistError> {
        conn.pragma_update(None, "foreign_keys", 1).map_err(backend)?;
        conn.execute_batch(SCHEMA_SQL).map_err(backend)?;
        Ok(Self { conn })
    }

    fn load_embeddings(&self, profile_id: &str) -> Result<Vec<Embedding>, PersistError> {
        let mut stmt = self
            .conn
            .prepare("SELECT dim, vector FROM embeddings WHERE profile_id = ?1 ORDER BY seq")
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![profile_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(backend)?;

        let mut embeddings = Vec::new();
        for row in rows {
            let (dim, blob) = row.map_err(backend)?;
            let dim = usize::try_from(dim).map_err(|_| {
                PersistError::Corrupt(format!("{profile_id}: negative embedding dimension"))
            })?;
            let values = decode_f32_blob(&blob, dim)
                .map_err(|e| PersistError::Corrupt(format!("{profile_id}: {e}")))?;
            embeddings.push(Embedding::new(values));
        }
        Ok(embeddings)
    }
}

fn encode_f32_blob(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_f32_blob(blob: &[u8], dim: usize) -> Result<Vec<f32>, String> {
    if blob.len() != dim * 4 {
        return Err(format!("embedding blob is {} bytes, expected {}", blob.len(), dim * 4));
    }
    let mut out = Vec::with_capacity(dim);
    for chunk in blob.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !value.is_finite() {
            return Err("embedding contains non-finite values".into());
        }
        out.push(value);
    }
    Ok(out)
}

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>, PersistError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PersistError::Corrupt(format!("{field} {value:?}: {e}")))
}

impl Repository for SqliteRepository {
    fn load_profiles(&self) -> Result<Vec<ProfileRecord>, PersistError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, email, enrolled_at, updated_at FROM profiles ORDER BY position",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(backend)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, name, email, enrolled_at, updated_at) = row.map_err(backend)?;
            records.push(ProfileRecord {
                embeddings: self.load_embeddings(&id)?,
                fields: ProfileFields { name, email },
                enrolled_at: parse_time("enrolled_at", &enrolled_at)?,
                updated_at: parse_time("updated_at", &updated_at)?,
                id,
            });
        }
        tracing::debug!(profiles = records.len(), "profiles loaded");
        Ok(records)
    }

    fn save_profiles(&mut self, profiles: &[ProfileRecord]) -> Result<(), PersistError> {
        let tx = self.conn.transaction().map_err(backend)?;
        tx.execute("DELETE FROM embeddings", []).map_err(backend)?;
        tx.execute("DELETE FROM profiles", []).map_err(backend)?;

        for (position, record) in profiles.iter().enumerate() {
            tx.execute(
                "INSERT INTO profiles (id, position, name, email, enrolled_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    position as i64,
                    record.fields.name,
                    record.fields.email,
                    record.enrolled_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(backend)?;

            for (seq, embedding) in record.embeddings.iter().enumerate() {
                tx.execute(
                    "INSERT INTO embeddings (profile_id, seq, dim, vector) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        record.id,
                        seq as i64,
                        embedding.dim() as i64,
                        encode_f32_blob(&embedding.values)
                    ],
                )
                .map_err(backend)?;
            }
        }

        tx.commit().map_err(backend)?;
        tracing::debug!(profiles = profiles.len(), "profiles saved");
        Ok(())
    }

    fn load_model(&self) -> Result<Option<ClassifierModel>, PersistError> {
        let body: Option<String> = self
            .conn
            .query_row("SELECT body FROM classifier WHERE id = 1", [], |row| row.get(0))
            .optional()
            .map_err(backend)?;
        body.as_deref().map(decode_model).transpose()
    }

    fn save_model(&mut self, model: &ClassifierModel) -> Result<(), PersistError> {
        let body = encode_model(model)?;
        self.conn
            .execute(
                "INSERT INTO classifier (id, body, saved_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET body = excluded.body, saved_at = excluded.saved_at",
                params![body, Utc::now().to_rfc3339()],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn clear_model(&mut self) -> Result<(), PersistError> {
        self.conn.execute("DELETE FROM classifier", []).map_err(backend)?;
        Ok(())
    }
}
