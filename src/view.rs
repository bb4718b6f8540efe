//! Named membership views
//!
//! A view ("On Track", "Depot", ...) is a row in `views`; its members are the
//! locomotive ids paired with it in `view_locomotives`. Membership has set
//! semantics: adding twice is a no-op, removing an absent id is not an error.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::types::Value;
use tracing::debug;

use crate::storage::statement::Handle;
use crate::storage::{Release, Statement};
use crate::{Error, Result};

/// Statements shared by every view of one database
pub(crate) struct ViewStatements {
    find: Statement,
    members: Statement,
    contains: Statement,
    add: Statement,
    remove: Statement,
}

impl ViewStatements {
    pub(crate) async fn prepare(handle: &Handle) -> Result<Self> {
        Ok(Self {
            find: Statement::prepare(handle, "SELECT id FROM views WHERE name = ?1").await?,
            members: Statement::prepare(handle, "SELECT loco_id FROM view_locomotives WHERE view_id = ?1").await?,
            contains: Statement::prepare(
                handle,
                "SELECT 1 FROM view_locomotives WHERE view_id = ?1 AND loco_id = ?2",
            )
            .await?,
            add: Statement::prepare(
                handle,
                "INSERT OR IGNORE INTO view_locomotives (view_id, loco_id) VALUES (?1, ?2)",
            )
            .await?,
            remove: Statement::prepare(
                handle,
                "DELETE FROM view_locomotives WHERE view_id = ?1 AND loco_id = ?2",
            )
            .await?,
        })
    }
}

impl Release for ViewStatements {
    fn release(&self) {
        for stmt in [&self.find, &self.members, &self.contains, &self.add, &self.remove] {
            stmt.release();
        }
        debug!("view statements released");
    }

    fn is_released(&self) -> bool {
        self.find.is_released()
    }
}

/// A resolved view. The id is fixed for the lifetime of the instance.
pub struct View {
    id: i64,
    name: String,
    statements: Arc<ViewStatements>,
}

impl View {
    pub(crate) async fn resolve(statements: Arc<ViewStatements>, name: &str) -> Result<Self> {
        let id = statements
            .find
            .get_with(vec![Value::Text(name.to_owned())], |row| {
                row.map(|row| row.get::<i64>(0)).transpose()
            })
            .await?
            .ok_or_else(|| Error::ViewNotFound(name.to_owned()))?;

        Ok(Self {
            id,
            name: name.to_owned(),
            statements,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current members, read fresh on every call
    pub async fn loco_ids(&self) -> Result<BTreeSet<i64>> {
        let ids = self
            .statements
            .members
            .all_with(vec![Value::Integer(self.id)], |row| row.get::<i64>(0))
            .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn has_loco(&self, loco_id: i64) -> Result<bool> {
        self.statements
            .contains
            .get_with(self.pair(loco_id), |row| Ok(row.is_some()))
            .await
    }

    /// Add a member. Fails with a constraint violation if the locomotive does not exist.
    pub async fn add_loco(&self, loco_id: i64) -> Result<()> {
        self.statements.add.run(self.pair(loco_id)).await?;
        Ok(())
    }

    pub async fn remove_loco(&self, loco_id: i64) -> Result<()> {
        self.statements.remove.run(self.pair(loco_id)).await?;
        Ok(())
    }

    fn pair(&self, loco_id: i64) -> Vec<Value> {
        vec![Value::Integer(self.id), Value::Integer(loco_id)]
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, Locomotive};

    async fn seeded() -> (Database, i64, i64) {
        let db = Database::open_in_memory().await.unwrap();
        let locos = db.open_repository::<Locomotive>().await.unwrap();
        let a = locos.insert(&Locomotive::new("Re 460", 460)).await.unwrap();
        let b = locos.insert(&Locomotive::new("Re 465", 465)).await.unwrap();
        (db, a, b)
    }

    #[tokio::test]
    async fn test_seeded_view_starts_empty() {
        let db = Database::open_in_memory().await.unwrap();
        let view = db.open_view("On Track").await.unwrap();
        assert_eq!(view.name(), "On Track");
        assert!(view.loco_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_view() {
        let db = Database::open_in_memory().await.unwrap();
        let err = db.open_view("Missing").await.unwrap_err();
        assert_eq!(err.to_string(), "View not found: Missing");
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let (db, a, _) = seeded().await;
        let view = db.open_view("On Track").await.unwrap();

        for _ in 0..3 {
            view.add_loco(a).await.unwrap();
        }
        assert_eq!(view.loco_ids().await.unwrap(), BTreeSet::from([a]));
        assert!(view.has_loco(a).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_absent_is_not_an_error() {
        let (db, a, b) = seeded().await;
        let view = db.open_view("On Track").await.unwrap();
        view.add_loco(a).await.unwrap();
        view.add_loco(b).await.unwrap();

        view.remove_loco(a).await.unwrap();
        view.remove_loco(a).await.unwrap();
        view.remove_loco(999).await.unwrap();

        assert_eq!(view.loco_ids().await.unwrap(), BTreeSet::from([b]));
        assert!(!view.has_loco(a).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_loco_violates_constraint() {
        let (db, _, _) = seeded().await;
        let view = db.open_view("On Track").await.unwrap();

        let err = view.add_loco(999).await.unwrap_err();
        assert!(err.is_constraint_violation());
        assert!(view.loco_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_views_are_independent_and_follow_deletes() {
        let (db, a, b) = seeded().await;
        db.run("INSERT INTO views (name) VALUES (?1)", vec![Value::Text("Depot".into())])
            .await
            .unwrap();
        let track = db.open_view("On Track").await.unwrap();
        let depot = db.open_view("Depot").await.unwrap();
        assert_ne!(track.id(), depot.id());

        track.add_loco(a).await.unwrap();
        depot.add_loco(b).await.unwrap();
        assert!(!track.has_loco(b).await.unwrap());

        let locos = db.open_repository::<Locomotive>().await.unwrap();
        locos.delete(b).await.unwrap();
        assert!(depot.loco_ids().await.unwrap().is_empty());
        assert_eq!(track.loco_ids().await.unwrap(), BTreeSet::from([a]));
    }
}
