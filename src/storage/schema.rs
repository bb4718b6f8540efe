//! Database schema definitions and version negotiation

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

use crate::{Error, Result};

/// Highest schema version this build understands
pub const SCHEMA_VERSION: i64 = 2;

/// Reserved key-value entry holding the schema version
pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";

/// SQL to create the key-value table. Values are stored JSON-encoded.
pub const CREATE_KEYVALUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS keyvalue (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

pub const SELECT_VALUE: &str = "SELECT value FROM keyvalue WHERE key = ?1";

pub const UPSERT_VALUE: &str = r#"
INSERT INTO keyvalue (key, value) VALUES (?1, ?2)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#;

/// One step of the schema history
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Version reached once `sql` is applied (sequential, starting at 1)
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Ordered schema history
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "locomotive documents, views and view membership",
        sql: r#"
CREATE TABLE IF NOT EXISTS locomotives (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    search TEXT NOT NULL DEFAULT '',
    json TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS locomotives_fts
    USING fts5(search, content='locomotives', content_rowid='id');

CREATE TRIGGER IF NOT EXISTS locomotives_ai AFTER INSERT ON locomotives BEGIN
    INSERT INTO locomotives_fts (rowid, search) VALUES (new.id, new.search);
END;

CREATE TRIGGER IF NOT EXISTS locomotives_ad AFTER DELETE ON locomotives BEGIN
    INSERT INTO locomotives_fts (locomotives_fts, rowid, search) VALUES ('delete', old.id, old.search);
END;

CREATE TRIGGER IF NOT EXISTS locomotives_au AFTER UPDATE ON locomotives BEGIN
    INSERT INTO locomotives_fts (locomotives_fts, rowid, search) VALUES ('delete', old.id, old.search);
    INSERT INTO locomotives_fts (rowid, search) VALUES (new.id, new.search);
END;

CREATE TABLE IF NOT EXISTS views (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS view_locomotives (
    view_id INTEGER NOT NULL REFERENCES views(id) ON DELETE CASCADE,
    loco_id INTEGER NOT NULL REFERENCES locomotives(id) ON DELETE CASCADE,
    PRIMARY KEY (view_id, loco_id)
);
"#,
    },
    Migration {
        version: 2,
        description: "seed the On Track view",
        sql: r#"
INSERT OR IGNORE INTO views (name) VALUES ('On Track');

CREATE INDEX IF NOT EXISTS idx_view_locomotives_loco ON view_locomotives(loco_id);
"#,
    },
];

/// Ensure the key-value table exists and bring the schema up to [`SCHEMA_VERSION`].
///
/// Returns the resolved version. A store written by a newer build is rejected
/// before anything is modified.
pub(crate) fn bootstrap(conn: &mut Connection) -> Result<i64> {
    conn.execute_batch(CREATE_KEYVALUE_TABLE)?;

    match stored_version(conn)? {
        None => {
            migrate(conn, 0, SCHEMA_VERSION, MIGRATIONS)?;
            info!(version = SCHEMA_VERSION, "initialized new store");
            Ok(SCHEMA_VERSION)
        }
        Some(found) if found > SCHEMA_VERSION => Err(Error::UnsupportedSchema {
            found,
            supported: SCHEMA_VERSION,
        }),
        Some(found) if found < SCHEMA_VERSION => {
            warn!(from = found, to = SCHEMA_VERSION, "upgrading schema");
            migrate(conn, found, SCHEMA_VERSION, MIGRATIONS)?;
            Ok(SCHEMA_VERSION)
        }
        Some(found) => Ok(found),
    }
}

/// Read the stored schema version, if any
pub(crate) fn stored_version(conn: &Connection) -> Result<Option<i64>> {
    let raw: Option<String> = conn
        .query_row(SELECT_VALUE, [SCHEMA_VERSION_KEY], |row| row.get(0))
        .optional()?;
    raw.map(|text| serde_json::from_str(&text).map_err(Error::from))
        .transpose()
}

/// Apply every migration in `(from, to]`, each in its own transaction along
/// with the version bump. Gaps are detected before anything is applied.
pub(crate) fn migrate(conn: &mut Connection, from: i64, to: i64, migrations: &[Migration]) -> Result<()> {
    let pending = ((from + 1)..=to)
        .map(|version| {
            migrations
                .iter()
                .find(|m| m.version == version)
                .ok_or(Error::MissingMigration(version))
        })
        .collect::<Result<Vec<_>>>()?;

    for migration in pending {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(UPSERT_VALUE, params![SCHEMA_VERSION_KEY, migration.version.to_string()])?;
        tx.commit()?;
        info!(
            version = migration.version,
            description = migration.description,
            "migration applied"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'index') ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap()
    }

    #[test]
    fn test_fresh_store_gets_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(bootstrap(&mut conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(stored_version(&conn).unwrap(), Some(SCHEMA_VERSION));

        let names = table_names(&conn);
        for expected in ["keyvalue", "locomotives", "locomotives_fts", "views", "view_locomotives"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_bootstrap_is_stable_on_reopen() {
        let mut conn = Connection::open_in_memory().unwrap();
        bootstrap(&mut conn).unwrap();
        assert_eq!(bootstrap(&mut conn).unwrap(), SCHEMA_VERSION);

        let views: i64 = conn
            .query_row("SELECT COUNT(*) FROM views WHERE name = 'On Track'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(views, 1);
    }

    #[test]
    fn test_newer_store_rejected_untouched() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_KEYVALUE_TABLE).unwrap();
        conn.execute(UPSERT_VALUE, params![SCHEMA_VERSION_KEY, "99"]).unwrap();

        let err = bootstrap(&mut conn).unwrap_err();
        assert!(matches!(err, Error::UnsupportedSchema { found: 99, supported: SCHEMA_VERSION }));
        assert!(!table_names(&conn).iter().any(|n| n == "locomotives"));
    }

    #[test]
    fn test_upgrade_from_version_one() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_KEYVALUE_TABLE).unwrap();
        migrate(&mut conn, 0, 1, MIGRATIONS).unwrap();
        assert_eq!(stored_version(&conn).unwrap(), Some(1));

        assert_eq!(bootstrap(&mut conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(stored_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        assert!(table_names(&conn).iter().any(|n| n == "idx_view_locomotives_loco"));
    }

    #[test]
    fn test_gap_in_history_applies_nothing() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_KEYVALUE_TABLE).unwrap();

        let err = migrate(&mut conn, 0, SCHEMA_VERSION, &MIGRATIONS[..1]).unwrap_err();
        assert!(matches!(err, Error::MissingMigration(2)));
        assert_eq!(stored_version(&conn).unwrap(), None);
        assert!(!table_names(&conn).iter().any(|n| n == "locomotives"));
    }

    #[test]
    fn test_history_is_contiguous() {
        for (idx, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version, idx as i64 + 1);
        }
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(SCHEMA_VERSION));
    }
}
