//! Item records and their base content.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{encode_id_list, now_rfc3339, parse_enum, parse_id_list, parse_time, Database};
use crate::errors::DatabaseError;
use crate::models::{ItemFilter, ItemRecord};

const ITEM_COLUMNS: &str = "id, path, title, collection, version, local_hash, remote_hash, \
     base_hash, state, parent_id, ancestors, created_by, created_at, modified_by, modified_at, \
     status, restricted, inaccessible, inaccessible_since, miss_count, last_synced_at";

/// Raw column values, validated by [`ItemRow::into_record`].
struct ItemRow {
    id: String,
    path: String,
    title: String,
    collection: String,
    version: i64,
    local_hash: Option<String>,
    remote_hash: Option<String>,
    base_hash: Option<String>,
    state: String,
    parent_id: Option<String>,
    ancestors: String,
    created_by: Option<String>,
    created_at: Option<String>,
    modified_by: Option<String>,
    modified_at: Option<String>,
    status: String,
    restricted: bool,
    inaccessible: Option<String>,
    inaccessible_since: Option<String>,
    miss_count: u32,
    last_synced_at: Option<String>,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            path: row.get(1)?,
            title: row.get(2)?,
            collection: row.get(3)?,
            version: row.get(4)?,
            local_hash: row.get(5)?,
            remote_hash: row.get(6)?,
            base_hash: row.get(7)?,
            state: row.get(8)?,
            parent_id: row.get(9)?,
            ancestors: row.get(10)?,
            created_by: row.get(11)?,
            created_at: row.get(12)?,
            modified_by: row.get(13)?,
            modified_at: row.get(14)?,
            status: row.get(15)?,
            restricted: row.get(16)?,
            inaccessible: row.get(17)?,
            inaccessible_since: row.get(18)?,
            miss_count: row.get(19)?,
            last_synced_at: row.get(20)?,
        })
    }

    fn into_record(self) -> Result<ItemRecord, DatabaseError> {
        let key = self.id.as_str();
        let record = ItemRecord {
            state: parse_enum(&self.state, "items", key)?,
            ancestors: parse_id_list(&self.ancestors, "items", key)?,
            created_at: parse_time(self.created_at, "items", key)?,
            modified_at: parse_time(self.modified_at, "items", key)?,
            status: parse_enum(&self.status, "items", key)?,
            inaccessible: self
                .inaccessible
                .as_deref()
                .map(|s| parse_enum(s, "items", key))
                .transpose()?,
            inaccessible_since: parse_time(self.inaccessible_since, "items", key)?,
            last_synced_at: parse_time(self.last_synced_at, "items", key)?,
            id: self.id,
            path: self.path,
            title: self.title,
            collection: self.collection,
            version: self.version,
            local_hash: self.local_hash,
            remote_hash: self.remote_hash,
            base_hash: self.base_hash,
            parent_id: self.parent_id,
            created_by: self.created_by,
            modified_by: self.modified_by,
            restricted: self.restricted,
            miss_count: self.miss_count,
        };
        if let Some(parent) = &record.parent_id {
            if record.ancestors.last() != Some(parent) {
                return Err(DatabaseError::Corruption(format!(
                    "items row {}: ancestor chain does not end at parent {parent}",
                    record.id
                )));
            }
        }
        Ok(record)
    }
}

fn query_items(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> Result<Vec<ItemRecord>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), ItemRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(ItemRow::into_record).collect()
}

// ---------------------------------------------------------------------------
// Free functions over a connection
// ---------------------------------------------------------------------------

pub fn get_item(conn: &Connection, id: &str) -> Result<Option<ItemRecord>, DatabaseError> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id], ItemRow::from_row)
        .optional()?;
    row.map(ItemRow::into_record).transpose()
}

pub fn get_item_by_path(
    conn: &Connection,
    path: &str,
) -> Result<Option<ItemRecord>, DatabaseError> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE path = ?1");
    let row = conn
        .query_row(&sql, params![path], ItemRow::from_row)
        .optional()?;
    row.map(ItemRow::into_record).transpose()
}

/// Insert or replace the record keyed by id. A path already held by a
/// different item is rejected with [`DatabaseError::PathConflict`].
pub fn upsert_item(conn: &Connection, item: &ItemRecord) -> Result<(), DatabaseError> {
    let holder: Option<String> = conn
        .query_row(
            "SELECT id FROM items WHERE path = ?1 AND id != ?2",
            params![item.path, item.id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing_id) = holder {
        return Err(DatabaseError::PathConflict {
            path: item.path.clone(),
            existing_id,
        });
    }

    conn.execute(
        "INSERT INTO items (id, path, title, collection, version, local_hash, remote_hash,
             base_hash, state, parent_id, ancestors, created_by, created_at, modified_by,
             modified_at, status, restricted, inaccessible, inaccessible_since, miss_count,
             last_synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
             ?18, ?19, ?20, ?21)
         ON CONFLICT(id) DO UPDATE SET
             path = excluded.path,
             title = excluded.title,
             collection = excluded.collection,
             version = excluded.version,
             local_hash = excluded.local_hash,
             remote_hash = excluded.remote_hash,
             base_hash = excluded.base_hash,
             state = excluded.state,
             parent_id = excluded.parent_id,
             ancestors = excluded.ancestors,
             created_by = excluded.created_by,
             created_at = excluded.created_at,
             modified_by = excluded.modified_by,
             modified_at = excluded.modified_at,
             status = excluded.status,
             restricted = excluded.restricted,
             inaccessible = excluded.inaccessible,
             inaccessible_since = excluded.inaccessible_since,
             miss_count = excluded.miss_count,
             last_synced_at = excluded.last_synced_at",
        params![
            item.id,
            item.path,
            item.title,
            item.collection,
            item.version,
            item.local_hash,
            item.remote_hash,
            item.base_hash,
            item.state.as_str(),
            item.parent_id,
            encode_id_list(&item.ancestors),
            item.created_by,
            item.created_at.map(|t| t.to_rfc3339()),
            item.modified_by,
            item.modified_at.map(|t| t.to_rfc3339()),
            item.status.as_str(),
            item.restricted,
            item.inaccessible.map(|r| r.as_str()),
            item.inaccessible_since.map(|t| t.to_rfc3339()),
            item.miss_count,
            item.last_synced_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    debug!(id = %item.id, path = %item.path, state = %item.state, "upserted item");
    Ok(())
}

pub fn list_items(conn: &Connection, filter: &ItemFilter) -> Result<Vec<ItemRecord>, DatabaseError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    // Push a bound value and return its numbered placeholder.
    let mut bind = |v: String| {
        values.push(Value::Text(v));
        format!("?{}", values.len())
    };

    if let Some(collection) = &filter.collection {
        clauses.push(format!("collection = {}", bind(collection.clone())));
    }
    if let Some(state) = filter.state {
        clauses.push(format!("state = {}", bind(state.as_str().into())));
    }
    if let Some(prefix) = &filter.path_prefix {
        let exact = bind(prefix.clone());
        let dir = bind(subtree_dir(prefix));
        clauses.push(format!(
            "(path = {exact} OR substr(path, 1, length({dir})) = {dir})"
        ));
    }
    if let Some(ancestor) = &filter.ancestor {
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM json_each(items.ancestors) WHERE json_each.value = {})",
            bind(ancestor.clone())
        ));
    }
    if let Some(after) = filter.modified_after {
        clauses.push(format!("modified_at >= {}", bind(after.to_rfc3339())));
    }
    if let Some(before) = filter.modified_before {
        clauses.push(format!("modified_at < {}", bind(before.to_rfc3339())));
    }
    match filter.inaccessible {
        Some(true) => clauses.push("state = 'remote-inaccessible'".into()),
        Some(false) => clauses.push("state != 'remote-inaccessible'".into()),
        None => {}
    }

    let mut sql = format!("SELECT {ITEM_COLUMNS} FROM items");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY path");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    query_items(conn, &sql, values)
}

/// Directory form of a path: `a/b.md` and `a/b/` both become `a/b/`.
fn subtree_dir(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    let stem = trimmed.strip_suffix(".md").unwrap_or(trimmed);
    format!("{stem}/")
}

pub fn delete_item(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let n = conn.execute("DELETE FROM items WHERE id = ?1", params![id])?;
    debug!(id, deleted = n > 0, "deleted item");
    Ok(n > 0)
}

pub fn get_base_content(conn: &Connection, id: &str) -> Result<Option<String>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT content FROM item_bases WHERE item_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn set_base_content(conn: &Connection, id: &str, content: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO item_bases (item_id, content, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(item_id) DO UPDATE SET content = excluded.content,
             updated_at = excluded.updated_at",
        params![id, content, now_rfc3339()],
    )?;
    Ok(())
}

/// Rewrite every item and attachment path under directory `old_dir` to live
/// under `new_dir` instead. Both are directory prefixes without a trailing
/// slash. Returns the number of item rows changed.
pub fn rewrite_path_prefix(
    conn: &Connection,
    old_dir: &str,
    new_dir: &str,
) -> Result<usize, DatabaseError> {
    let old = format!("{}/", old_dir.trim_end_matches('/'));
    let new = format!("{}/", new_dir.trim_end_matches('/'));
    let items = conn.execute(
        "UPDATE items SET path = ?2 || substr(path, length(?1) + 1)
         WHERE substr(path, 1, length(?1)) = ?1",
        params![old, new],
    )?;
    conn.execute(
        "UPDATE attachments SET path = ?2 || substr(path, length(?1) + 1)
         WHERE substr(path, 1, length(?1)) = ?1",
        params![old, new],
    )?;
    debug!(old = %old, new = %new, items, "rewrote path prefix");
    Ok(items)
}

/// Rewrite the ancestor chain of every item below `id`: the chain prefix up
/// to and including `id` is replaced by `new_prefix` (which ends with `id`).
pub fn rewrite_descendant_chains(
    conn: &Connection,
    id: &str,
    new_prefix: &[String],
) -> Result<usize, DatabaseError> {
    let descendants = list_items(
        conn,
        &ItemFilter {
            ancestor: Some(id.to_string()),
            ..ItemFilter::default()
        },
    )?;
    let mut changed = 0;
    for mut item in descendants {
        let Some(pos) = item.ancestors.iter().position(|a| a == id) else {
            continue;
        };
        let mut chain = new_prefix.to_vec();
        chain.extend(item.ancestors.drain(pos + 1..));
        if chain != item.ancestors {
            conn.execute(
                "UPDATE items SET ancestors = ?2 WHERE id = ?1",
                params![item.id, encode_id_list(&chain)],
            )?;
            changed += 1;
        }
    }
    Ok(changed)
}

pub fn count_items(conn: &Connection) -> Result<i64, DatabaseError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?)
}

// ---------------------------------------------------------------------------
// Database wrappers
// ---------------------------------------------------------------------------

impl Database {
    pub fn get_item(&self, id: &str) -> Result<Option<ItemRecord>, DatabaseError> {
        get_item(&self.conn(), id)
    }

    pub fn get_item_by_path(&self, path: &str) -> Result<Option<ItemRecord>, DatabaseError> {
        get_item_by_path(&self.conn(), path)
    }

    pub fn upsert_item(&self, item: &ItemRecord) -> Result<(), DatabaseError> {
        self.transaction(|conn| upsert_item(conn, item))
    }

    pub fn list_items(&self, filter: &ItemFilter) -> Result<Vec<ItemRecord>, DatabaseError> {
        list_items(&self.conn(), filter)
    }

    pub fn delete_item(&self, id: &str) -> Result<bool, DatabaseError> {
        self.transaction(|conn| delete_item(conn, id))
    }

    pub fn get_base_content(&self, id: &str) -> Result<Option<String>, DatabaseError> {
        get_base_content(&self.conn(), id)
    }

    pub fn set_base_content(&self, id: &str, content: &str) -> Result<(), DatabaseError> {
        self.transaction(|conn| set_base_content(conn, id, content))
    }

    pub fn rewrite_path_prefix(&self, old_dir: &str, new_dir: &str) -> Result<usize, DatabaseError> {
        self.transaction(|conn| rewrite_path_prefix(conn, old_dir, new_dir))
    }

    pub fn count_items(&self) -> Result<i64, DatabaseError> {
        count_items(&self.conn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InaccessibleReason, SyncState};
    use chrono::{TimeZone, Utc};

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn item(id: &str, path: &str) -> ItemRecord {
        let mut rec = ItemRecord::new(id, path, format!("Title {id}"));
        rec.collection = "ENG".into();
        rec.version = 1;
        rec.state = SyncState::Synced;
        rec
    }

    #[test]
    fn test_upsert_and_get() {
        let db = setup_db();
        let mut rec = item("1", "root.md");
        rec.inaccessible = Some(InaccessibleReason::Forbidden);
        rec.modified_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        db.upsert_item(&rec).unwrap();

        let loaded = db.get_item("1").unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(db.get_item_by_path("root.md").unwrap().unwrap().id, "1");
        assert!(db.get_item("nope").unwrap().is_none());
    }

    #[test]
    fn test_upsert_is_idempotent_and_updates() {
        let db = setup_db();
        let mut rec = item("1", "a.md");
        db.upsert_item(&rec).unwrap();
        db.upsert_item(&rec).unwrap();
        rec.version = 5;
        rec.path = "b.md".into();
        db.upsert_item(&rec).unwrap();

        assert_eq!(db.count_items().unwrap(), 1);
        let loaded = db.get_item("1").unwrap().unwrap();
        assert_eq!(loaded.version, 5);
        assert_eq!(loaded.path, "b.md");
    }

    #[test]
    fn test_path_conflict_rejected() {
        let db = setup_db();
        db.upsert_item(&item("1", "a.md")).unwrap();
        let err = db.upsert_item(&item("2", "a.md")).unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::PathConflict { ref existing_id, .. } if existing_id == "1"
        ));
    }

    #[test]
    fn test_unknown_state_is_corruption() {
        let db = setup_db();
        db.upsert_item(&item("1", "a.md")).unwrap();
        db.conn()
            .execute("UPDATE items SET state = 'exploded' WHERE id = '1'", [])
            .unwrap();
        assert!(matches!(
            db.get_item("1"),
            Err(DatabaseError::Corruption(_))
        ));
    }

    #[test]
    fn test_malformed_ancestors_is_corruption() {
        let db = setup_db();
        db.upsert_item(&item("1", "a.md")).unwrap();
        db.conn()
            .execute("UPDATE items SET ancestors = '{not json' WHERE id = '1'", [])
            .unwrap();
        assert!(matches!(
            db.list_items(&ItemFilter::default()),
            Err(DatabaseError::Corruption(_))
        ));
    }

    #[test]
    fn test_list_filters() {
        let db = setup_db();
        let root = item("1", "root.md");
        let mut child = item("2", "root/child.md");
        child.parent_id = Some("1".into());
        child.ancestors = vec!["1".into()];
        child.state = SyncState::LocalModified;
        let mut grandchild = item("3", "root/child/leaf.md");
        grandchild.parent_id = Some("2".into());
        grandchild.ancestors = vec!["1".into(), "2".into()];
        let mut other = item("4", "other.md");
        other.collection = "OPS".into();
        other.state = SyncState::RemoteInaccessible;
        for rec in [&root, &child, &grandchild, &other] {
            db.upsert_item(rec).unwrap();
        }

        let by_collection = db
            .list_items(&ItemFilter {
                collection: Some("ENG".into()),
                ..ItemFilter::default()
            })
            .unwrap();
        assert_eq!(by_collection.len(), 3);

        let modified = db
            .list_items(&ItemFilter::state(SyncState::LocalModified))
            .unwrap();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].id, "2");

        let subtree = db
            .list_items(&ItemFilter {
                path_prefix: Some("root/child.md".into()),
                ..ItemFilter::default()
            })
            .unwrap();
        let ids: Vec<_> = subtree.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);

        let under_root = db
            .list_items(&ItemFilter {
                ancestor: Some("1".into()),
                ..ItemFilter::default()
            })
            .unwrap();
        assert_eq!(under_root.len(), 2);

        let gone = db
            .list_items(&ItemFilter {
                inaccessible: Some(true),
                ..ItemFilter::default()
            })
            .unwrap();
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].id, "4");

        let limited = db
            .list_items(&ItemFilter {
                limit: Some(2),
                ..ItemFilter::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_modified_range_filter() {
        let db = setup_db();
        let mut old = item("1", "old.md");
        old.modified_at = Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        let mut new = item("2", "new.md");
        new.modified_at = Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        db.upsert_item(&old).unwrap();
        db.upsert_item(&new).unwrap();

        let recent = db
            .list_items(&ItemFilter {
                modified_after: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                ..ItemFilter::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "2");
    }

    #[test]
    fn test_base_content_cascades() {
        let db = setup_db();
        db.upsert_item(&item("1", "a.md")).unwrap();
        db.set_base_content("1", "hello\n").unwrap();
        db.set_base_content("1", "hello again\n").unwrap();
        assert_eq!(
            db.get_base_content("1").unwrap().as_deref(),
            Some("hello again\n")
        );
        assert!(db.delete_item("1").unwrap());
        assert!(db.get_base_content("1").unwrap().is_none());
        assert!(!db.delete_item("1").unwrap());
    }

    #[test]
    fn test_rewrite_path_prefix() {
        let db = setup_db();
        db.upsert_item(&item("1", "a/b.md")).unwrap();
        db.upsert_item(&item("2", "a/b/c.md")).unwrap();
        db.upsert_item(&item("3", "a/bc.md")).unwrap();

        let changed = db.rewrite_path_prefix("a/b", "x/b").unwrap();
        assert_eq!(changed, 1);
        assert_eq!(db.get_item("2").unwrap().unwrap().path, "x/b/c.md");
        assert_eq!(db.get_item("1").unwrap().unwrap().path, "a/b.md");
        assert_eq!(db.get_item("3").unwrap().unwrap().path, "a/bc.md");
    }

    #[test]
    fn test_rewrite_descendant_chains() {
        let db = setup_db();
        let mut child = item("2", "p/c.md");
        child.parent_id = Some("1".into());
        child.ancestors = vec!["0".into(), "1".into()];
        let mut leaf = item("3", "p/c/l.md");
        leaf.parent_id = Some("2".into());
        leaf.ancestors = vec!["0".into(), "1".into(), "2".into()];
        db.upsert_item(&child).unwrap();
        db.upsert_item(&leaf).unwrap();

        let new_prefix = vec!["9".to_string(), "2".to_string()];
        let changed = db
            .transaction(|conn| rewrite_descendant_chains(conn, "2", &new_prefix))
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(db.get_item("3").unwrap().unwrap().ancestors, vec!["9", "2"]);
    }
}
