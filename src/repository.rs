//! Generic JSON-document repository
//!
//! Every record type lives in its own table of `(id, search, json)` rows:
//! - `id` is assigned by the store on insert
//! - `search` is derived from the record and indexed with FTS5
//! - `json` is the serialized record
//!
//! Documents are addressed by the primary key only. The `id` inside the JSON is
//! overwritten with the row id whenever a record is read back.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::types::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::storage::statement::Handle;
use crate::storage::{Release, Row, Statement};
use crate::{Error, Result};

/// Naming of a document table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table {
    pub name: &'static str,
    pub id_column: &'static str,
    pub search_column: &'static str,
    pub document_column: &'static str,
}

impl Table {
    /// A table using the conventional `id`, `search` and `json` columns
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            id_column: "id",
            search_column: "search",
            document_column: "json",
        }
    }

    /// Name of the FTS5 index over the search column
    pub fn fts_name(&self) -> String {
        format!("{}_fts", self.name)
    }

    /// DDL for the table, its full-text index and the triggers keeping them in sync
    pub fn ddl(&self) -> String {
        let Table {
            name,
            id_column: id,
            search_column: search,
            document_column: json,
        } = *self;
        let fts = self.fts_name();
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {name} (
    {id} INTEGER PRIMARY KEY AUTOINCREMENT,
    {search} TEXT NOT NULL DEFAULT '',
    {json} TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS {fts}
    USING fts5({search}, content='{name}', content_rowid='{id}');

CREATE TRIGGER IF NOT EXISTS {name}_ai AFTER INSERT ON {name} BEGIN
    INSERT INTO {fts} (rowid, {search}) VALUES (new.{id}, new.{search});
END;

CREATE TRIGGER IF NOT EXISTS {name}_ad AFTER DELETE ON {name} BEGIN
    INSERT INTO {fts} ({fts}, rowid, {search}) VALUES ('delete', old.{id}, old.{search});
END;

CREATE TRIGGER IF NOT EXISTS {name}_au AFTER UPDATE ON {name} BEGIN
    INSERT INTO {fts} ({fts}, rowid, {search}) VALUES ('delete', old.{id}, old.{search});
    INSERT INTO {fts} (rowid, {search}) VALUES (new.{id}, new.{search});
END;
"#
        )
    }
}

/// A record type stored as a JSON document.
///
/// The serialized form must be a JSON object whose `id` field holds the
/// record id.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table holding this record type. `TABLE.name` also keys the repository cache.
    const TABLE: Table;

    fn id(&self) -> Option<i64>;

    /// Text indexed for full-text search
    fn search_text(&self) -> String;
}

/// CRUD and search over one record type
pub struct Repository<T> {
    list: Statement,
    search: Statement,
    get: Statement,
    insert: Statement,
    update: Statement,
    delete: Statement,
    released: AtomicBool,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Repository<T> {
    pub(crate) async fn prepare(handle: &Handle) -> Result<Self> {
        let Table {
            name,
            id_column: id,
            search_column: search,
            document_column: json,
        } = T::TABLE;
        let fts = T::TABLE.fts_name();

        Ok(Self {
            list: Statement::prepare(handle, format!("SELECT {id}, {json} FROM {name} ORDER BY {id}")).await?,
            search: Statement::prepare(
                handle,
                format!(
                    "SELECT {name}.{id}, {name}.{json} FROM {fts} \
                     JOIN {name} ON {name}.{id} = {fts}.rowid \
                     WHERE {fts} MATCH ?1 ORDER BY bm25({fts})"
                ),
            )
            .await?,
            get: Statement::prepare(handle, format!("SELECT {id}, {json} FROM {name} WHERE {id} = ?1")).await?,
            insert: Statement::prepare(handle, format!("INSERT INTO {name} ({search}, {json}) VALUES (?1, ?2)"))
                .await?,
            update: Statement::prepare(
                handle,
                format!("UPDATE {name} SET {search} = ?1, {json} = ?2 WHERE {id} = ?3"),
            )
            .await?,
            delete: Statement::prepare(handle, format!("DELETE FROM {name} WHERE {id} = ?1")).await?,
            released: AtomicBool::new(false),
            _record: PhantomData,
        })
    }

    /// All records in id order, or the records matching an FTS5 `query` ranked by relevance.
    ///
    /// A blank query lists everything.
    pub async fn list(&self, query: Option<&str>) -> Result<Vec<T>> {
        match query.map(str::trim).filter(|q| !q.is_empty()) {
            None => self.list.all_with(vec![], Self::hydrate).await,
            Some(q) => {
                self.search
                    .all_with(vec![Value::Text(q.to_owned())], Self::hydrate)
                    .await
            }
        }
    }

    pub async fn get(&self, id: i64) -> Result<Option<T>> {
        self.get
            .get_with(vec![Value::Integer(id)], |row| row.map(Self::hydrate).transpose())
            .await
    }

    /// Store a new record and return the id assigned to it
    pub async fn insert(&self, item: &T) -> Result<i64> {
        let search = item.search_text();
        let json = serde_json::to_string(item)?;
        self.insert
            .run_with(vec![Value::Text(search), Value::Text(json)], |outcome| {
                Ok(outcome.last_insert_id)
            })
            .await
    }

    /// Rewrite an existing record. Fails with [`Error::NoSuchRecord`] unless exactly one row changed.
    pub async fn update(&self, item: &T) -> Result<()> {
        let id = item.id().ok_or(Error::MissingId)?;
        let search = item.search_text();
        let json = serde_json::to_string(item)?;
        self.update
            .run_with(
                vec![Value::Text(search), Value::Text(json), Value::Integer(id)],
                |outcome| match outcome.changes {
                    1 => Ok(()),
                    _ => Err(Error::NoSuchRecord(id)),
                },
            )
            .await
    }

    /// Remove a record. Removing an unknown id is not an error.
    pub async fn delete(&self, id: i64) -> Result<()> {
        self.delete.run(vec![Value::Integer(id)]).await?;
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Finalize all statements. Later calls are no-ops.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for stmt in [&self.list, &self.search, &self.get, &self.insert, &self.update, &self.delete] {
            stmt.release();
        }
        debug!(table = T::TABLE.name, "repository released");
    }

    fn hydrate(row: Row) -> Result<T> {
        let id: i64 = row.get(0)?;
        let json: String = row.get(1)?;
        let mut document: serde_json::Value = serde_json::from_str(&json)?;
        if let Some(fields) = document.as_object_mut() {
            fields.insert("id".to_owned(), id.into());
        }
        Ok(serde_json::from_value(document)?)
    }
}

impl<T: Record> Release for Repository<T> {
    fn release(&self) {
        Repository::release(self);
    }

    fn is_released(&self) -> bool {
        Repository::is_released(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, Locomotive};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
        title: String,
        body: String,
    }

    impl Record for Note {
        const TABLE: Table = Table {
            name: "notes",
            id_column: "note_id",
            search_column: "keywords",
            document_column: "doc",
        };

        fn id(&self) -> Option<i64> {
            self.id
        }

        fn search_text(&self) -> String {
            self.title.clone()
        }
    }

    async fn locomotives() -> (Database, std::sync::Arc<Repository<Locomotive>>) {
        let db = Database::open_in_memory().await.unwrap();
        let repo = db.open_repository::<Locomotive>().await.unwrap();
        (db, repo)
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids_and_lists_in_order() {
        let (_db, repo) = locomotives().await;

        let foo = repo.insert(&Locomotive::new("Foo", 4)).await.unwrap();
        let bar = repo.insert(&Locomotive::new("Bar", 8)).await.unwrap();
        assert_eq!((foo, bar), (1, 2));

        let all = repo.list(None).await.unwrap();
        let names: Vec<_> = all.iter().map(|l| (l.id, l.name.as_str())).collect();
        assert_eq!(names, vec![(Some(1), "Foo"), (Some(2), "Bar")]);

        let found = repo.list(Some("Foo")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, Some(1));

        assert_eq!(repo.list(Some("  ")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_round_trips_with_id() {
        let (_db, repo) = locomotives().await;
        let mut loco = Locomotive::new("V 100", 100);
        loco.functions = vec!["light".into(), "horn".into()];

        let id = repo.insert(&loco).await.unwrap();
        loco.id = Some(id);
        assert_eq!(repo.get(id).await.unwrap(), Some(loco));
        assert_eq!(repo.get(id + 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_rewrites_document_and_index() {
        let (_db, repo) = locomotives().await;
        let id = repo.insert(&Locomotive::new("Taurus", 1116)).await.unwrap();

        let mut loco = repo.get(id).await.unwrap().unwrap();
        loco.name = "Vectron".into();
        repo.update(&loco).await.unwrap();

        assert_eq!(repo.get(id).await.unwrap().unwrap().name, "Vectron");
        assert!(repo.list(Some("Taurus")).await.unwrap().is_empty());
        assert_eq!(repo.list(Some("Vectron")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_or_unsaved_record() {
        let (_db, repo) = locomotives().await;

        let mut ghost = Locomotive::new("Ghost", 3);
        assert!(matches!(repo.update(&ghost).await, Err(Error::MissingId)));

        ghost.id = Some(42);
        assert!(matches!(repo.update(&ghost).await, Err(Error::NoSuchRecord(42))));

        let id = repo.insert(&Locomotive::new("Gone", 5)).await.unwrap();
        repo.delete(id).await.unwrap();
        let mut gone = Locomotive::new("Gone", 5);
        gone.id = Some(id);
        assert!(matches!(repo.update(&gone).await, Err(Error::NoSuchRecord(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_db, repo) = locomotives().await;
        let id = repo.insert(&Locomotive::new("Ae 6/6", 11401)).await.unwrap();

        repo.delete(id).await.unwrap();
        repo.delete(id).await.unwrap();
        assert_eq!(repo.get(id).await.unwrap(), None);
        assert!(repo.list(Some("11401")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_ranks_by_relevance() {
        let (_db, repo) = locomotives().await;
        repo.insert(&Locomotive::new("Class 66 freight", 66)).await.unwrap();
        repo.insert(&Locomotive::new("Class 66 Class 66 shunter", 67)).await.unwrap();
        repo.insert(&Locomotive::new("Crocodile", 3)).await.unwrap();

        let hits = repo.list(Some("class")).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].address, 67);

        let prefixed = repo.list(Some("Croc*")).await.unwrap();
        assert_eq!(prefixed.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_search_is_execution_error() {
        let (_db, repo) = locomotives().await;
        repo.insert(&Locomotive::new("Foo", 4)).await.unwrap();

        assert!(matches!(repo.list(Some("\"unterminated")).await, Err(Error::Storage(_))));
        assert_eq!(repo.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_document_fails_whole_list() {
        let (db, repo) = locomotives().await;
        repo.insert(&Locomotive::new("Fine", 1)).await.unwrap();
        db.run(
            "INSERT INTO locomotives (search, json) VALUES (?1, ?2)",
            vec![Value::Text("broken".into()), Value::Text("{not json".into())],
        )
        .await
        .unwrap();

        assert!(matches!(repo.list(None).await, Err(Error::Serialization(_))));
        assert!(repo.get(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_custom_table_naming() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.open_repository::<Note>().await.is_err());

        db.exec(Note::TABLE.ddl()).await.unwrap();
        let notes = db.open_repository::<Note>().await.unwrap();
        let id = notes
            .insert(&Note {
                id: None,
                title: "Ballast".into(),
                body: "order more".into(),
            })
            .await
            .unwrap();

        let note = notes.get(id).await.unwrap().unwrap();
        assert_eq!(note.id, Some(id));
        assert_eq!(notes.list(Some("ballast")).await.unwrap(), vec![note]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_db, repo) = locomotives().await;
        repo.release();
        repo.release();
        assert!(repo.is_released());
        assert!(matches!(repo.get(1).await, Err(Error::StatementReleased)));
    }
}
