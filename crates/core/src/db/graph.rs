//! Links, labels, and contributors. All three are replaced wholesale per
//! item on every successful fetch of that item.

use rusqlite::{params, Connection};

use super::{parse_time, Database};
use crate::errors::DatabaseError;
use crate::models::{Contributor, LinkRecord, LinkTarget};

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

pub fn replace_links(
    conn: &Connection,
    source_id: &str,
    targets: &[LinkTarget],
) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM links WHERE source_id = ?1", params![source_id])?;
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO links (source_id, kind, target) VALUES (?1, ?2, ?3)",
    )?;
    for target in targets {
        stmt.execute(params![source_id, target.kind(), target.value()])?;
    }
    Ok(())
}

fn query_links(
    conn: &Connection,
    sql: &str,
    param: Option<&str>,
) -> Result<Vec<LinkRecord>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let read = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    };
    let rows = match param {
        Some(p) => stmt.query_map(params![p], read)?.collect::<Result<Vec<_>, _>>()?,
        None => stmt.query_map([], read)?.collect::<Result<Vec<_>, _>>()?,
    };
    rows.into_iter()
        .map(|(source_id, kind, target)| {
            let target = LinkTarget::from_parts(&kind, target)
                .map_err(|e| DatabaseError::Corruption(format!("links row {source_id}: {e}")))?;
            Ok(LinkRecord { source_id, target })
        })
        .collect()
}

pub fn list_links_from(conn: &Connection, id: &str) -> Result<Vec<LinkRecord>, DatabaseError> {
    query_links(
        conn,
        "SELECT source_id, kind, target FROM links WHERE source_id = ?1 ORDER BY kind, target",
        Some(id),
    )
}

pub fn list_links_to(conn: &Connection, id: &str) -> Result<Vec<LinkRecord>, DatabaseError> {
    query_links(
        conn,
        "SELECT source_id, kind, target FROM links
         WHERE kind = 'item' AND target = ?1 ORDER BY source_id",
        Some(id),
    )
}

/// Links the codec could not resolve, plus item links whose target is not
/// tracked in this tree.
pub fn list_broken_links(conn: &Connection) -> Result<Vec<LinkRecord>, DatabaseError> {
    query_links(
        conn,
        "SELECT source_id, kind, target FROM links
         WHERE kind = 'broken'
            OR (kind = 'item' AND target NOT IN (SELECT id FROM items))
         ORDER BY source_id, target",
        None,
    )
}

/// Ids of tracked items that no other item links to.
pub fn list_orphans(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM items
         WHERE id NOT IN (SELECT target FROM links WHERE kind = 'item' AND source_id != target)
         ORDER BY path",
    )?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

pub fn replace_labels(
    conn: &Connection,
    item_id: &str,
    labels: &[String],
) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM labels WHERE item_id = ?1", params![item_id])?;
    let mut stmt = conn.prepare("INSERT OR IGNORE INTO labels (item_id, name) VALUES (?1, ?2)")?;
    for label in labels {
        stmt.execute(params![item_id, label])?;
    }
    Ok(())
}

pub fn list_labels(conn: &Connection, item_id: &str) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT name FROM labels WHERE item_id = ?1 ORDER BY name")?;
    let labels = stmt
        .query_map(params![item_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(labels)
}

pub fn list_items_with_label(conn: &Connection, name: &str) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT l.item_id FROM labels l JOIN items i ON i.id = l.item_id
         WHERE l.name = ?1 ORDER BY i.path",
    )?;
    let ids = stmt
        .query_map(params![name], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Contributors
// ---------------------------------------------------------------------------

pub fn replace_contributors(
    conn: &Connection,
    item_id: &str,
    contributors: &[Contributor],
) -> Result<(), DatabaseError> {
    conn.execute("DELETE FROM contributors WHERE item_id = ?1", params![item_id])?;
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO contributors
             (item_id, account_id, display_name, edit_count, last_edit_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for c in contributors {
        stmt.execute(params![
            item_id,
            c.account_id,
            c.display_name,
            c.edit_count,
            c.last_edit_at.map(|t| t.to_rfc3339()),
        ])?;
    }
    Ok(())
}

pub fn list_contributors(
    conn: &Connection,
    item_id: &str,
) -> Result<Vec<Contributor>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT account_id, display_name, edit_count, last_edit_at FROM contributors
         WHERE item_id = ?1 ORDER BY edit_count DESC, account_id",
    )?;
    let rows = stmt
        .query_map(params![item_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(account_id, display_name, edit_count, last)| {
            Ok(Contributor {
                last_edit_at: parse_time(last, "contributors", &account_id)?,
                account_id,
                display_name,
                edit_count,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Database wrappers
// ---------------------------------------------------------------------------

impl Database {
    pub fn replace_links(&self, source_id: &str, targets: &[LinkTarget]) -> Result<(), DatabaseError> {
        self.transaction(|conn| replace_links(conn, source_id, targets))
    }

    pub fn list_links_from(&self, id: &str) -> Result<Vec<LinkRecord>, DatabaseError> {
        list_links_from(&self.conn(), id)
    }

    pub fn list_links_to(&self, id: &str) -> Result<Vec<LinkRecord>, DatabaseError> {
        list_links_to(&self.conn(), id)
    }

    pub fn list_broken_links(&self) -> Result<Vec<LinkRecord>, DatabaseError> {
        list_broken_links(&self.conn())
    }

    pub fn list_orphans(&self) -> Result<Vec<String>, DatabaseError> {
        list_orphans(&self.conn())
    }

    pub fn replace_labels(&self, item_id: &str, labels: &[String]) -> Result<(), DatabaseError> {
        self.transaction(|conn| replace_labels(conn, item_id, labels))
    }

    pub fn list_labels(&self, item_id: &str) -> Result<Vec<String>, DatabaseError> {
        list_labels(&self.conn(), item_id)
    }

    pub fn list_items_with_label(&self, name: &str) -> Result<Vec<String>, DatabaseError> {
        list_items_with_label(&self.conn(), name)
    }

    pub fn replace_contributors(
        &self,
        item_id: &str,
        contributors: &[Contributor],
    ) -> Result<(), DatabaseError> {
        self.transaction(|conn| replace_contributors(conn, item_id, contributors))
    }

    pub fn list_contributors(&self, item_id: &str) -> Result<Vec<Contributor>, DatabaseError> {
        list_contributors(&self.conn(), item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemRecord;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        for (id, path) in [("1", "a.md"), ("2", "b.md"), ("3", "c.md")] {
            db.upsert_item(&ItemRecord::new(id, path, id)).unwrap();
        }
        db
    }

    #[test]
    fn test_links_replace_and_query() {
        let db = setup_db();
        db.replace_links(
            "1",
            &[
                LinkTarget::Item("2".into()),
                LinkTarget::External("https://example.com".into()),
                LinkTarget::Broken("Missing Page".into()),
            ],
        )
        .unwrap();
        assert_eq!(db.list_links_from("1").unwrap().len(), 3);
        assert_eq!(db.list_links_to("2").unwrap()[0].source_id, "1");

        // Replacing drops the old edges.
        db.replace_links("1", &[LinkTarget::Item("3".into())]).unwrap();
        assert!(db.list_links_to("2").unwrap().is_empty());
        assert_eq!(db.list_links_from("1").unwrap().len(), 1);
    }

    #[test]
    fn test_broken_links_and_orphans() {
        let db = setup_db();
        db.replace_links(
            "1",
            &[
                LinkTarget::Item("2".into()),
                LinkTarget::Item("999".into()),
                LinkTarget::Broken("nowhere".into()),
            ],
        )
        .unwrap();
        db.replace_links("3", &[LinkTarget::Item("3".into())]).unwrap();

        let broken = db.list_broken_links().unwrap();
        assert_eq!(broken.len(), 2);

        // Self-links do not rescue an item from being an orphan.
        assert_eq!(db.list_orphans().unwrap(), vec!["1", "3"]);
    }

    #[test]
    fn test_labels() {
        let db = setup_db();
        db.replace_labels("1", &["howto".into(), "ops".into()]).unwrap();
        db.replace_labels("2", &["ops".into()]).unwrap();
        assert_eq!(db.list_labels("1").unwrap(), vec!["howto", "ops"]);
        assert_eq!(db.list_items_with_label("ops").unwrap(), vec!["1", "2"]);

        db.replace_labels("1", &[]).unwrap();
        assert_eq!(db.list_items_with_label("ops").unwrap(), vec!["2"]);
    }

    #[test]
    fn test_contributors() {
        let db = setup_db();
        let people = vec![
            Contributor {
                account_id: "u1".into(),
                display_name: "Ana".into(),
                edit_count: 2,
                last_edit_at: None,
            },
            Contributor {
                account_id: "u2".into(),
                display_name: "Bo".into(),
                edit_count: 7,
                last_edit_at: Some(chrono::Utc::now()),
            },
        ];
        db.replace_contributors("1", &people).unwrap();
        let listed = db.list_contributors("1").unwrap();
        assert_eq!(listed[0].account_id, "u2");
        assert_eq!(listed.len(), 2);

        db.delete_item("1").unwrap();
        assert!(db.list_contributors("1").unwrap().is_empty());
    }
}
