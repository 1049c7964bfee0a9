//! Attachment records, owned by an item and cascade-deleted with it.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{parse_enum, Database};
use crate::errors::DatabaseError;
use crate::models::AttachmentRecord;

const ATTACHMENT_COLUMNS: &str = "id, item_id, file_name, media_type, size, path, version, \
     local_hash, remote_hash, base_hash, state";

type RawAttachment = (AttachmentRecordParts, String);

struct AttachmentRecordParts {
    id: String,
    item_id: String,
    file_name: String,
    media_type: String,
    size: i64,
    path: String,
    version: i64,
    local_hash: Option<String>,
    remote_hash: Option<String>,
    base_hash: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawAttachment> {
    Ok((
        AttachmentRecordParts {
            id: row.get(0)?,
            item_id: row.get(1)?,
            file_name: row.get(2)?,
            media_type: row.get(3)?,
            size: row.get(4)?,
            path: row.get(5)?,
            version: row.get(6)?,
            local_hash: row.get(7)?,
            remote_hash: row.get(8)?,
            base_hash: row.get(9)?,
        },
        row.get(10)?,
    ))
}

fn validate((p, state): RawAttachment) -> Result<AttachmentRecord, DatabaseError> {
    Ok(AttachmentRecord {
        state: parse_enum(&state, "attachments", &p.id)?,
        id: p.id,
        item_id: p.item_id,
        file_name: p.file_name,
        media_type: p.media_type,
        size: p.size,
        path: p.path,
        version: p.version,
        local_hash: p.local_hash,
        remote_hash: p.remote_hash,
        base_hash: p.base_hash,
    })
}

pub fn get_attachment(
    conn: &Connection,
    id: &str,
) -> Result<Option<AttachmentRecord>, DatabaseError> {
    let sql = format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?1");
    conn.query_row(&sql, params![id], read_row)
        .optional()?
        .map(validate)
        .transpose()
}

pub fn upsert_attachment(conn: &Connection, att: &AttachmentRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO attachments (id, item_id, file_name, media_type, size, path, version,
             local_hash, remote_hash, base_hash, state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
             item_id = excluded.item_id,
             file_name = excluded.file_name,
             media_type = excluded.media_type,
             size = excluded.size,
             path = excluded.path,
             version = excluded.version,
             local_hash = excluded.local_hash,
             remote_hash = excluded.remote_hash,
             base_hash = excluded.base_hash,
             state = excluded.state",
        params![
            att.id,
            att.item_id,
            att.file_name,
            att.media_type,
            att.size,
            att.path,
            att.version,
            att.local_hash,
            att.remote_hash,
            att.base_hash,
            att.state.as_str(),
        ],
    )?;
    debug!(id = %att.id, item_id = %att.item_id, "upserted attachment");
    Ok(())
}

pub fn list_attachments(
    conn: &Connection,
    item_id: &str,
) -> Result<Vec<AttachmentRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE item_id = ?1 ORDER BY file_name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![item_id], read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(validate).collect()
}

pub fn delete_attachment(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    Ok(conn.execute("DELETE FROM attachments WHERE id = ?1", params![id])? > 0)
}

impl Database {
    pub fn get_attachment(&self, id: &str) -> Result<Option<AttachmentRecord>, DatabaseError> {
        get_attachment(&self.conn(), id)
    }

    pub fn upsert_attachment(&self, att: &AttachmentRecord) -> Result<(), DatabaseError> {
        self.transaction(|conn| upsert_attachment(conn, att))
    }

    pub fn list_attachments(&self, item_id: &str) -> Result<Vec<AttachmentRecord>, DatabaseError> {
        list_attachments(&self.conn(), item_id)
    }

    pub fn delete_attachment(&self, id: &str) -> Result<bool, DatabaseError> {
        self.transaction(|conn| delete_attachment(conn, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemRecord, SyncState};

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.upsert_item(&ItemRecord::new("1", "a.md", "A")).unwrap();
        db
    }

    fn attachment(id: &str, name: &str) -> AttachmentRecord {
        AttachmentRecord {
            id: id.into(),
            item_id: "1".into(),
            file_name: name.into(),
            media_type: "image/png".into(),
            size: 120,
            path: format!("a/_attachments/{name}"),
            version: 1,
            local_hash: Some("aa".into()),
            remote_hash: Some("aa".into()),
            base_hash: Some("aa".into()),
            state: SyncState::Synced,
        }
    }

    #[test]
    fn test_attachment_crud() {
        let db = setup_db();
        db.upsert_attachment(&attachment("att1", "b.png")).unwrap();
        db.upsert_attachment(&attachment("att2", "a.png")).unwrap();

        let list = db.list_attachments("1").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].file_name, "a.png");

        let mut changed = attachment("att1", "b.png");
        changed.version = 2;
        db.upsert_attachment(&changed).unwrap();
        assert_eq!(db.get_attachment("att1").unwrap().unwrap().version, 2);

        assert!(db.delete_attachment("att2").unwrap());
        assert_eq!(db.list_attachments("1").unwrap().len(), 1);
    }

    #[test]
    fn test_attachments_cascade_with_item() {
        let db = setup_db();
        db.upsert_attachment(&attachment("att1", "b.png")).unwrap();
        db.delete_item("1").unwrap();
        assert!(db.get_attachment("att1").unwrap().is_none());
    }

    #[test]
    fn test_attachment_requires_owner() {
        let db = setup_db();
        let mut orphan = attachment("att9", "x.png");
        orphan.item_id = "missing".into();
        assert!(db.upsert_attachment(&orphan).is_err());
    }
}
