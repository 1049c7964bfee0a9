//! Open conflict records (the three-way triple kept until resolution).

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{parse_time, Database};
use crate::errors::DatabaseError;
use crate::models::ConflictRecord;

type RawConflict = (String, String, String, String, i64, i64, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawConflict> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn validate(raw: RawConflict) -> Result<ConflictRecord, DatabaseError> {
    let (item_id, base, local, remote, remote_version, regions, detected_at) = raw;
    let detected_at = parse_time(Some(detected_at), "conflicts", &item_id)?
        .ok_or_else(|| DatabaseError::Corruption(format!("conflicts row {item_id}: no time")))?;
    Ok(ConflictRecord {
        item_id,
        base,
        local,
        remote,
        remote_version,
        regions: regions.max(0) as usize,
        detected_at,
    })
}

pub fn save_conflict(conn: &Connection, record: &ConflictRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO conflicts (item_id, base, local, remote, remote_version, regions, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(item_id) DO UPDATE SET
             base = excluded.base,
             local = excluded.local,
             remote = excluded.remote,
             remote_version = excluded.remote_version,
             regions = excluded.regions,
             detected_at = excluded.detected_at",
        params![
            record.item_id,
            record.base,
            record.local,
            record.remote,
            record.remote_version,
            record.regions as i64,
            record.detected_at.to_rfc3339(),
        ],
    )?;
    debug!(item_id = %record.item_id, regions = record.regions, "saved conflict");
    Ok(())
}

pub fn get_conflict(conn: &Connection, item_id: &str) -> Result<Option<ConflictRecord>, DatabaseError> {
    conn.query_row(
        "SELECT item_id, base, local, remote, remote_version, regions, detected_at
         FROM conflicts WHERE item_id = ?1",
        params![item_id],
        read_row,
    )
    .optional()?
    .map(validate)
    .transpose()
}

pub fn list_conflicts(conn: &Connection) -> Result<Vec<ConflictRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT item_id, base, local, remote, remote_version, regions, detected_at
         FROM conflicts ORDER BY detected_at, item_id",
    )?;
    let rows = stmt
        .query_map([], read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(validate).collect()
}

pub fn delete_conflict(conn: &Connection, item_id: &str) -> Result<bool, DatabaseError> {
    Ok(conn.execute("DELETE FROM conflicts WHERE item_id = ?1", params![item_id])? > 0)
}

impl Database {
    pub fn save_conflict(&self, record: &ConflictRecord) -> Result<(), DatabaseError> {
        self.transaction(|conn| save_conflict(conn, record))
    }

    pub fn get_conflict(&self, item_id: &str) -> Result<Option<ConflictRecord>, DatabaseError> {
        get_conflict(&self.conn(), item_id)
    }

    pub fn list_conflicts(&self) -> Result<Vec<ConflictRecord>, DatabaseError> {
        list_conflicts(&self.conn())
    }

    pub fn delete_conflict(&self, item_id: &str) -> Result<bool, DatabaseError> {
        self.transaction(|conn| delete_conflict(conn, item_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemRecord;
    use chrono::Utc;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.upsert_item(&ItemRecord::new("1", "a.md", "A")).unwrap();
        db
    }

    fn record() -> ConflictRecord {
        ConflictRecord {
            item_id: "1".into(),
            base: "x\n".into(),
            local: "y\n".into(),
            remote: "z\n".into(),
            remote_version: 4,
            regions: 1,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_conflict_lifecycle() {
        let db = setup_db();
        assert!(db.get_conflict("1").unwrap().is_none());

        db.save_conflict(&record()).unwrap();
        let loaded = db.get_conflict("1").unwrap().unwrap();
        assert_eq!(loaded.remote_version, 4);
        assert_eq!(loaded.local, "y\n");
        assert_eq!(db.list_conflicts().unwrap().len(), 1);

        let mut newer = record();
        newer.remote_version = 5;
        db.save_conflict(&newer).unwrap();
        assert_eq!(db.list_conflicts().unwrap().len(), 1);
        assert_eq!(db.get_conflict("1").unwrap().unwrap().remote_version, 5);

        assert!(db.delete_conflict("1").unwrap());
        assert!(db.list_conflicts().unwrap().is_empty());
    }

    #[test]
    fn test_conflict_cascades_with_item() {
        let db = setup_db();
        db.save_conflict(&record()).unwrap();
        db.delete_item("1").unwrap();
        assert!(db.get_conflict("1").unwrap().is_none());
    }
}
