//! Portable JSON snapshot of the whole store.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{attachments, conflicts, graph, items, meta, Database};
use crate::errors::DatabaseError;
use crate::models::{
    AttachmentRecord, Checkpoint, ConflictRecord, Contributor, ItemFilter, ItemRecord, LinkTarget,
};

/// Bumped whenever the snapshot layout changes incompatibly.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub items: Vec<ItemSnapshot>,
    pub conflicts: Vec<ConflictRecord>,
    pub checkpoints: Vec<Checkpoint>,
    pub meta: Vec<(String, String)>,
}

/// One item together with everything it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub record: ItemRecord,
    #[serde(default)]
    pub base_content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
    #[serde(default)]
    pub links: Vec<LinkTarget>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub contributors: Vec<Contributor>,
}

fn export(conn: &Connection) -> Result<Snapshot, DatabaseError> {
    let mut out = Vec::new();
    for record in items::list_items(conn, &ItemFilter::default())? {
        let id = record.id.clone();
        out.push(ItemSnapshot {
            base_content: items::get_base_content(conn, &id)?,
            attachments: attachments::list_attachments(conn, &id)?,
            links: graph::list_links_from(conn, &id)?
                .into_iter()
                .map(|l| l.target)
                .collect(),
            labels: graph::list_labels(conn, &id)?,
            contributors: graph::list_contributors(conn, &id)?,
            record,
        });
    }

    let fingerprints: Vec<String> = {
        let mut stmt = conn.prepare("SELECT fingerprint FROM checkpoints ORDER BY fingerprint")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    let mut checkpoints = Vec::new();
    for fp in fingerprints {
        if let Some(cp) = meta::load_checkpoint(conn, &fp)? {
            checkpoints.push(cp);
        }
    }

    let meta_rows: Vec<(String, String)> = {
        let mut stmt = conn.prepare("SELECT key, value FROM meta ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<_, _>>()?
    };

    Ok(Snapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        exported_at: Utc::now(),
        items: out,
        conflicts: conflicts::list_conflicts(conn)?,
        checkpoints,
        meta: meta_rows,
    })
}

fn replace_all(conn: &Connection, snapshot: &Snapshot) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "DELETE FROM items;
         DELETE FROM checkpoints;
         DELETE FROM meta;",
    )?;

    for entry in &snapshot.items {
        items::upsert_item(conn, &entry.record)?;
        let id = entry.record.id.as_str();
        if let Some(base) = &entry.base_content {
            items::set_base_content(conn, id, base)?;
        }
        for att in &entry.attachments {
            if att.item_id != id {
                return Err(DatabaseError::Snapshot(format!(
                    "attachment {} listed under item {id} but owned by {}",
                    att.id, att.item_id
                )));
            }
            attachments::upsert_attachment(conn, att)?;
        }
        graph::replace_links(conn, id, &entry.links)?;
        graph::replace_labels(conn, id, &entry.labels)?;
        graph::replace_contributors(conn, id, &entry.contributors)?;
    }
    for conflict in &snapshot.conflicts {
        conflicts::save_conflict(conn, conflict)?;
    }
    for cp in &snapshot.checkpoints {
        meta::save_checkpoint(conn, cp)?;
    }
    for (key, value) in &snapshot.meta {
        meta::set_meta(conn, key, value)?;
    }
    Ok(())
}

impl Database {
    /// Dump every table into a [`Snapshot`].
    pub fn export_snapshot(&self) -> Result<Snapshot, DatabaseError> {
        export(&self.conn())
    }

    /// Replace the whole store with `snapshot` in one transaction.
    pub fn import_snapshot(&self, snapshot: &Snapshot) -> Result<(), DatabaseError> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(DatabaseError::Snapshot(format!(
                "unsupported snapshot format {} (expected {SNAPSHOT_FORMAT_VERSION})",
                snapshot.format_version
            )));
        }
        self.transaction(|conn| replace_all(conn, snapshot))?;
        info!(items = snapshot.items.len(), "imported snapshot");
        Ok(())
    }

    pub fn export_snapshot_json(&self) -> Result<String, DatabaseError> {
        let snapshot = self.export_snapshot()?;
        serde_json::to_string_pretty(&snapshot).map_err(|e| DatabaseError::Snapshot(e.to_string()))
    }

    pub fn import_snapshot_json(&self, json: &str) -> Result<usize, DatabaseError> {
        let snapshot: Snapshot =
            serde_json::from_str(json).map_err(|e| DatabaseError::Snapshot(e.to_string()))?;
        self.import_snapshot(&snapshot)?;
        Ok(snapshot.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncState;

    fn populated_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let mut a = ItemRecord::new("1", "a.md", "A");
        a.state = SyncState::Synced;
        db.upsert_item(&a).unwrap();
        db.upsert_item(&ItemRecord::new("2", "b.md", "B")).unwrap();
        db.set_base_content("1", "base\n").unwrap();
        db.replace_labels("1", &["x".into()]).unwrap();
        db.replace_links("1", &[LinkTarget::Item("2".into())]).unwrap();
        db.set_meta("scope", "subtree:1").unwrap();
        db
    }

    #[test]
    fn test_export_import_replaces_store() {
        let source = populated_db();
        let json = source.export_snapshot_json().unwrap();

        let target = Database::in_memory().unwrap();
        target.initialize().unwrap();
        target
            .upsert_item(&ItemRecord::new("99", "stale.md", "Stale"))
            .unwrap();

        let imported = target.import_snapshot_json(&json).unwrap();
        assert_eq!(imported, 2);
        assert!(target.get_item("99").unwrap().is_none());
        assert_eq!(
            target.get_base_content("1").unwrap().as_deref(),
            Some("base\n")
        );
        assert_eq!(target.list_links_to("2").unwrap().len(), 1);
        assert_eq!(target.get_meta("scope").unwrap().as_deref(), Some("subtree:1"));
    }

    #[test]
    fn test_import_rejects_unknown_format() {
        let db = populated_db();
        let mut snapshot = db.export_snapshot().unwrap();
        snapshot.format_version = 42;
        assert!(matches!(
            db.import_snapshot(&snapshot),
            Err(DatabaseError::Snapshot(_))
        ));
        // Store untouched.
        assert_eq!(db.count_items().unwrap(), 2);
    }

    #[test]
    fn test_failed_import_rolls_back() {
        let db = populated_db();
        let mut snapshot = db.export_snapshot().unwrap();
        // Two items claiming the same path.
        snapshot.items[1].record.path = "a.md".into();
        assert!(db.import_snapshot(&snapshot).is_err());
        assert_eq!(db.count_items().unwrap(), 2);
        assert!(db.get_item("2").unwrap().is_some());
    }
}
