//! Database schema definitions and migration runner.
//!
//! Migrations are SQL strings applied in order, each inside its own
//! transaction together with the `user_version` bump, so a failed migration
//! leaves the store at the previous version.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id                  TEXT PRIMARY KEY,
            path                TEXT NOT NULL UNIQUE,
            title               TEXT NOT NULL,
            collection          TEXT NOT NULL DEFAULT '',
            version             INTEGER NOT NULL DEFAULT 0,
            local_hash          TEXT,
            remote_hash         TEXT,
            base_hash           TEXT,
            state               TEXT NOT NULL,
            parent_id           TEXT,
            ancestors           TEXT NOT NULL DEFAULT '[]',
            created_by          TEXT,
            created_at          TEXT,
            modified_by         TEXT,
            modified_at         TEXT,
            status              TEXT NOT NULL DEFAULT 'current',
            restricted          INTEGER NOT NULL DEFAULT 0,
            inaccessible        TEXT,
            inaccessible_since  TEXT,
            last_synced_at      TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_items_collection ON items (collection);
        CREATE INDEX IF NOT EXISTS idx_items_state ON items (state);
        CREATE INDEX IF NOT EXISTS idx_items_parent ON items (parent_id);

        CREATE TABLE IF NOT EXISTS item_bases (
            item_id     TEXT PRIMARY KEY REFERENCES items (id) ON DELETE CASCADE,
            content     TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attachments (
            id          TEXT PRIMARY KEY,
            item_id     TEXT NOT NULL REFERENCES items (id) ON DELETE CASCADE,
            file_name   TEXT NOT NULL,
            media_type  TEXT NOT NULL DEFAULT 'application/octet-stream',
            size        INTEGER NOT NULL DEFAULT 0,
            path        TEXT NOT NULL,
            version     INTEGER NOT NULL DEFAULT 0,
            local_hash  TEXT,
            remote_hash TEXT,
            base_hash   TEXT,
            state       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_item ON attachments (item_id);

        CREATE TABLE IF NOT EXISTS links (
            source_id   TEXT NOT NULL REFERENCES items (id) ON DELETE CASCADE,
            kind        TEXT NOT NULL CHECK (kind IN ('item', 'external', 'broken')),
            target      TEXT NOT NULL,
            PRIMARY KEY (source_id, kind, target)
        );

        CREATE INDEX IF NOT EXISTS idx_links_target ON links (kind, target);

        CREATE TABLE IF NOT EXISTS labels (
            item_id     TEXT NOT NULL REFERENCES items (id) ON DELETE CASCADE,
            name        TEXT NOT NULL,
            PRIMARY KEY (item_id, name)
        );

        CREATE INDEX IF NOT EXISTS idx_labels_name ON labels (name);

        CREATE TABLE IF NOT EXISTS contributors (
            item_id         TEXT NOT NULL REFERENCES items (id) ON DELETE CASCADE,
            account_id      TEXT NOT NULL,
            display_name    TEXT NOT NULL DEFAULT '',
            edit_count      INTEGER NOT NULL DEFAULT 0,
            last_edit_at    TEXT,
            PRIMARY KEY (item_id, account_id)
        );

        CREATE TABLE IF NOT EXISTS meta (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS checkpoints (
            fingerprint TEXT PRIMARY KEY,
            processed   INTEGER NOT NULL DEFAULT 0,
            failed_ids  TEXT NOT NULL DEFAULT '[]',
            started_at  TEXT NOT NULL,
            total       INTEGER,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        "conflict records and miss counter",
        r#"
        ALTER TABLE items ADD COLUMN miss_count INTEGER NOT NULL DEFAULT 0;

        CREATE TABLE IF NOT EXISTS conflicts (
            item_id         TEXT PRIMARY KEY REFERENCES items (id) ON DELETE CASCADE,
            base            TEXT NOT NULL,
            local           TEXT NOT NULL,
            remote          TEXT NOT NULL,
            remote_version  INTEGER NOT NULL,
            regions         INTEGER NOT NULL DEFAULT 0,
            detected_at     TEXT NOT NULL
        );
        "#,
    ),
];

/// Latest schema version known to this build.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.0).unwrap_or(0)
}

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = latest_version(),
        "checking database migrations"
    );

    if current_version > latest_version() {
        return Err(DatabaseError::MigrationFailed {
            version: current_version,
            detail: format!(
                "store was written by a newer build (schema {current_version} > {})",
                latest_version()
            ),
        });
    }

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            let failed = |e: rusqlite::Error| DatabaseError::MigrationFailed {
                version,
                detail: e.to_string(),
            };
            let tx = conn.unchecked_transaction().map_err(failed)?;
            tx.execute_batch(sql).map_err(failed)?;
            tx.pragma_update(None, "user_version", version)
                .map_err(failed)?;
            tx.commit().map_err(failed)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
pub fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for table in [
            "items",
            "item_bases",
            "attachments",
            "links",
            "labels",
            "contributors",
            "conflicts",
            "checkpoints",
            "meta",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_upgrade_from_version_one() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0].2).unwrap();
        conn.pragma_update(None, "user_version", 1u32).unwrap();
        conn.execute(
            "INSERT INTO items (id, path, title, state) VALUES ('1', 'a.md', 'A', 'synced')",
            [],
        )
        .unwrap();

        run_migrations(&conn).unwrap();

        let misses: i64 = conn
            .query_row("SELECT miss_count FROM items WHERE id = '1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(misses, 0);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99u32).unwrap();
        assert!(matches!(
            run_migrations(&conn),
            Err(DatabaseError::MigrationFailed { version: 99, .. })
        ));
    }
}
