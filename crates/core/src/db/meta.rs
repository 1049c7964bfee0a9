//! Key/value metadata and run checkpoints.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{encode_id_list, now_rfc3339, parse_id_list, parse_time, Database};
use crate::errors::DatabaseError;
use crate::models::Checkpoint;

// ---------------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------------

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, DatabaseError> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?)
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO meta (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now_rfc3339()],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

pub fn load_checkpoint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<Checkpoint>, DatabaseError> {
    let raw = conn
        .query_row(
            "SELECT fingerprint, processed, failed_ids, started_at, total, updated_at
             FROM checkpoints WHERE fingerprint = ?1",
            params![fingerprint],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((fingerprint, processed, failed, started, total, updated)) = raw else {
        return Ok(None);
    };
    let missing = || DatabaseError::Corruption(format!("checkpoints row {fingerprint}: no time"));
    Ok(Some(Checkpoint {
        processed: processed.max(0) as u64,
        failed_ids: parse_id_list(&failed, "checkpoints", &fingerprint)?,
        started_at: parse_time(Some(started), "checkpoints", &fingerprint)?.ok_or_else(missing)?,
        total: total.map(|t| t.max(0) as u64),
        updated_at: parse_time(Some(updated), "checkpoints", &fingerprint)?.ok_or_else(missing)?,
        fingerprint,
    }))
}

pub fn save_checkpoint(conn: &Connection, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO checkpoints (fingerprint, processed, failed_ids, started_at, total, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(fingerprint) DO UPDATE SET
             processed = excluded.processed,
             failed_ids = excluded.failed_ids,
             started_at = excluded.started_at,
             total = excluded.total,
             updated_at = excluded.updated_at",
        params![
            checkpoint.fingerprint,
            checkpoint.processed as i64,
            encode_id_list(&checkpoint.failed_ids),
            checkpoint.started_at.to_rfc3339(),
            checkpoint.total.map(|t| t as i64),
            checkpoint.updated_at.to_rfc3339(),
        ],
    )?;
    debug!(
        fingerprint = %checkpoint.fingerprint,
        processed = checkpoint.processed,
        failed = checkpoint.failed_ids.len(),
        "saved checkpoint"
    );
    Ok(())
}

pub fn delete_checkpoint(conn: &Connection, fingerprint: &str) -> Result<bool, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM checkpoints WHERE fingerprint = ?1",
        params![fingerprint],
    )? > 0)
}

impl Database {
    pub fn get_meta(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        get_meta(&self.conn(), key)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.transaction(|conn| set_meta(conn, key, value))
    }

    pub fn load_checkpoint(&self, fingerprint: &str) -> Result<Option<Checkpoint>, DatabaseError> {
        load_checkpoint(&self.conn(), fingerprint)
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
        self.transaction(|conn| save_checkpoint(conn, checkpoint))
    }

    pub fn delete_checkpoint(&self, fingerprint: &str) -> Result<bool, DatabaseError> {
        self.transaction(|conn| delete_checkpoint(conn, fingerprint))
    }
}
