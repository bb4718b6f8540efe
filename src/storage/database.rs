//! SQLite connection manager

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, DatabaseName};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::Release;
use super::schema;
use super::settings::{Settings, StoredValue};
use super::statement::{self, Handle, Params, Row, RunOutcome};
use crate::config::{self, StoreConfig};
use crate::repository::{Record, Repository};
use crate::view::{View, ViewStatements};
use crate::{Error, Result};

type RepositorySlot = Arc<OnceCell<RegisteredRepository>>;
type ViewSlot = Arc<OnceCell<Arc<View>>>;

/// A prepared repository, kept both typed (for lookup) and as a statement owner
#[derive(Clone)]
struct RegisteredRepository {
    instance: Arc<dyn Any + Send + Sync>,
    owner: Arc<dyn Release>,
}

/// The single open handle to a store, plus everything prepared against it.
///
/// Repositories and views are created on first request and cached. Concurrent
/// requests for the same key share one preparation.
pub struct Database {
    handle: Handle,
    path: PathBuf,
    schema_version: i64,
    settings: Settings,
    repositories: Mutex<HashMap<&'static str, RepositorySlot>>,
    views: Mutex<HashMap<String, ViewSlot>>,
    view_statements: OnceCell<Arc<ViewStatements>>,
    /// Statement owners in registration order
    registry: Mutex<Vec<Arc<dyn Release>>>,
    closed: AtomicBool,
}

impl Database {
    /// Open a database file (created if missing), or `:memory:`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(&StoreConfig::for_path(path.as_ref())).await
    }

    /// Open an in-memory database (for testing)
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    pub async fn open_with(config: &StoreConfig) -> Result<Self> {
        let path = config.database.clone();
        let capacity = config.statement_cache_capacity;
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

        let target = path.clone();
        let (conn, schema_version) = tokio::task::spawn_blocking(move || -> Result<_> {
            config::ensure_db_dir(&target)?;
            let mut conn = connect(&target, capacity, busy_timeout)?;
            let version = schema::bootstrap(&mut conn)?;
            Ok((conn, version))
        })
        .await??;

        let handle = Handle::new(conn);
        let settings = Settings::prepare(&handle).await?;
        info!(path = %path.display(), schema_version, "database opened");

        Ok(Self {
            handle,
            path,
            schema_version,
            settings,
            repositories: Mutex::new(HashMap::new()),
            views: Mutex::new(HashMap::new()),
            view_statements: OnceCell::new(),
            registry: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schema version resolved when the store was opened
    pub fn schema_version(&self) -> i64 {
        self.schema_version
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    // ========== Raw Statements ==========

    /// Execute one or more statements without parameters (schema setup, tests)
    pub async fn exec(&self, sql: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        let sql = sql.into();
        self.handle
            .call(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
    }

    /// Execute an ad hoc mutating statement
    pub async fn run(&self, sql: impl Into<String>, params: Params) -> Result<RunOutcome> {
        self.ensure_open()?;
        let sql = sql.into();
        self.handle
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                Ok(statement::execute(conn, &mut stmt, &params)?)
            })
            .await
    }

    /// Fetch at most one row from an ad hoc query
    pub async fn get(&self, sql: impl Into<String>, params: Params) -> Result<Option<Row>> {
        self.ensure_open()?;
        let sql = sql.into();
        self.handle
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                Ok(statement::fetch_one(&mut stmt, &params)?)
            })
            .await
    }

    // ========== Key-Value Operations ==========

    /// Insert or replace a key-value entry
    pub async fn set_value(&self, key: &str, value: impl Into<StoredValue>) -> Result<()> {
        self.ensure_open()?;
        self.settings.set(key, &value.into()).await
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<StoredValue>> {
        self.ensure_open()?;
        self.settings.get(key).await
    }

    // ========== Repositories & Views ==========

    /// Return the repository for `T`, preparing it on first use.
    ///
    /// A repository released by its caller is evicted and replaced by a fresh one.
    pub async fn open_repository<T: Record>(&self) -> Result<Arc<Repository<T>>> {
        self.ensure_open()?;
        let table = T::TABLE.name;
        let slot = {
            let mut repositories = self.repositories.lock();
            let slot = repositories.entry(table).or_default();
            if slot.get().is_some_and(|entry| entry.owner.is_released()) {
                debug!(table, "evicting released repository");
                *slot = RepositorySlot::default();
            }
            Arc::clone(slot)
        };

        let entry = slot
            .get_or_try_init(|| async {
                let repository = Arc::new(Repository::<T>::prepare(&self.handle).await?);
                self.register(repository.clone());
                debug!(table, "repository registered");
                Ok::<_, Error>(RegisteredRepository {
                    instance: repository.clone(),
                    owner: repository,
                })
            })
            .await?;

        Arc::clone(&entry.instance)
            .downcast::<Repository<T>>()
            .map_err(|_| Error::RegistryConflict(table))
    }

    /// Return the view named `name`, resolving it on first use
    pub async fn open_view(&self, name: &str) -> Result<Arc<View>> {
        self.ensure_open()?;
        let statements = self.view_statements().await?;
        let slot = {
            let mut views = self.views.lock();
            Arc::clone(views.entry(name.to_owned()).or_default())
        };

        let view = slot
            .get_or_try_init(|| async {
                let view = View::resolve(statements, name).await?;
                debug!(view = name, id = view.id(), "view resolved");
                Ok::<_, Error>(Arc::new(view))
            })
            .await?;
        Ok(Arc::clone(view))
    }

    /// Statements shared by every view of this connection
    async fn view_statements(&self) -> Result<Arc<ViewStatements>> {
        let statements = self
            .view_statements
            .get_or_try_init(|| async {
                let statements = Arc::new(ViewStatements::prepare(&self.handle).await?);
                self.register(statements.clone());
                Ok::<_, Error>(statements)
            })
            .await?;
        Ok(Arc::clone(statements))
    }

    /// Track `owner` for release on close, dropping owners already released
    fn register(&self, owner: Arc<dyn Release>) {
        if self.is_closed() {
            owner.release();
            return;
        }
        let mut registry = self.registry.lock();
        registry.retain(|registered| !registered.is_released());
        registry.push(owner);
    }

    // ========== Lifecycle ==========

    /// Snapshot the live store to `path`
    pub async fn backup(&self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_open()?;
        let path = path.as_ref().to_path_buf();
        let target = path.clone();
        self.handle
            .call(move |conn| {
                conn.backup(DatabaseName::Main, &target, None)
                    .map_err(|source| Error::Backup { path: target, source })
            })
            .await?;
        info!(path = %path.display(), "backup written");
        Ok(())
    }

    /// Release every repository and view, then close the handle.
    ///
    /// A second call fails with [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        let registered = std::mem::take(&mut *self.registry.lock());
        for owner in &registered {
            owner.release();
        }
        self.settings.release();
        self.repositories.lock().clear();
        self.views.lock().clear();

        self.handle.shutdown().await?;
        info!(path = %self.path.display(), released = registered.len(), "database closed");
        Ok(())
    }
}

/// Open the connection and configure the session.
///
/// Everything up to the first read of the file is reported as [`Error::Open`],
/// so a file that is not a database fails here rather than during migration.
fn connect(path: &Path, capacity: usize, busy_timeout: Duration) -> Result<Connection> {
    let open = || -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        conn.set_prepared_statement_cache_capacity(capacity);
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;
        Ok(conn)
    };
    open().map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })
}
