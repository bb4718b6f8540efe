//! Asynchronous prepared statements over the shared connection
//!
//! rusqlite statements borrow their connection, so a [`Statement`] keeps only
//! its SQL text and relies on the connection's prepared statement cache.
//! Each execution checks the compiled statement out of the cache and hands it
//! back afterwards, which resets it for the next call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::types::{FromSql, Value, ValueRef};
use tracing::debug;

use crate::{Error, Result};

/// Positional parameters bound to `?1`, `?2`, ...
pub type Params = Vec<Value>;

/// Owner of the single database handle.
///
/// Cloned into every statement. The handle is `None` once the database is closed.
#[derive(Clone)]
pub(crate) struct Handle {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Handle {
    pub(crate) fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        }
    }

    /// Run `f` against the connection on the blocking pool
    pub(crate) async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let conn = guard.as_ref().ok_or(Error::Closed)?;
            f(conn)
        })
        .await?
    }

    /// Finalize every cached statement. Live statements recompile on next use.
    ///
    /// Inside a runtime the flush is queued on the blocking pool, so a caller on
    /// an async worker never waits for a query holding the connection.
    pub(crate) fn flush_cache(&self) {
        let conn = Arc::clone(&self.conn);
        let flush = move || {
            if let Some(conn) = conn.lock().as_ref() {
                conn.flush_prepared_statement_cache();
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => drop(runtime.spawn_blocking(flush)),
            Err(_) => flush(),
        }
    }

    /// Close the connection. Fails with [`Error::Closed`] if already closed.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().take().ok_or(Error::Closed)?;
            conn.flush_prepared_statement_cache();
            conn.close().map_err(|(_, e)| Error::Storage(e))
        })
        .await?
    }
}

/// A fetched row, detached from the statement that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    fn read(row: &rusqlite::Row<'_>, columns: usize) -> rusqlite::Result<Self> {
        let values = (0..columns)
            .map(|idx| row.get_ref(idx).map(Value::from))
            .collect::<rusqlite::Result<_>>()?;
        Ok(Self { values })
    }

    /// Convert column `idx` to `T`
    pub fn get<T: FromSql>(&self, idx: usize) -> Result<T> {
        let value = self
            .values
            .get(idx)
            .ok_or(rusqlite::Error::InvalidColumnIndex(idx))?;
        T::column_result(ValueRef::from(value)).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, value.data_type(), Box::new(e)).into()
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Low-level outcome of a mutating statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Rows inserted, updated or deleted
    pub changes: usize,
    /// Rowid generated by the most recent insert on this connection
    pub last_insert_id: i64,
}

pub(crate) fn fetch_one(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> rusqlite::Result<Option<Row>> {
    let columns = stmt.column_count();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    rows.next()?.map(|row| Row::read(row, columns)).transpose()
}

pub(crate) fn fetch_all(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> rusqlite::Result<Vec<Row>> {
    let columns = stmt.column_count();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(Row::read(row, columns)?);
    }
    Ok(out)
}

pub(crate) fn execute(
    conn: &Connection,
    stmt: &mut rusqlite::Statement<'_>,
    params: &[Value],
) -> rusqlite::Result<RunOutcome> {
    let changes = stmt.execute(rusqlite::params_from_iter(params.iter()))?;
    Ok(RunOutcome {
        changes,
        last_insert_id: conn.last_insert_rowid(),
    })
}

/// A compiled, reusable statement bound to one database.
///
/// Calls against the same statement must be awaited one after another.
pub struct Statement {
    handle: Handle,
    sql: Arc<str>,
    released: AtomicBool,
}

impl Statement {
    /// Compile `sql` eagerly so syntax and schema errors surface here
    pub(crate) async fn prepare(handle: &Handle, sql: impl Into<String>) -> Result<Self> {
        let sql: Arc<str> = Arc::from(sql.into());
        let text = Arc::clone(&sql);
        handle
            .call(move |conn| {
                conn.prepare_cached(&text)
                    .map(drop)
                    .map_err(|source| Error::Prepare {
                        sql: text.to_string(),
                        source,
                    })
            })
            .await?;
        debug!(sql = %sql, "statement prepared");

        Ok(Self {
            handle: handle.clone(),
            sql,
            released: AtomicBool::new(false),
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Fetch at most one row
    pub async fn get(&self, params: Params) -> Result<Option<Row>> {
        self.with_cached(move |_, stmt| fetch_one(stmt, &params)).await
    }

    /// Fetch at most one row and apply `transform` to it, or to `None` when nothing matched
    pub async fn get_with<T, F>(&self, params: Params, transform: F) -> Result<T>
    where
        F: FnOnce(Option<Row>) -> Result<T>,
    {
        let row = self.get(params).await?;
        transform(row)
    }

    /// Fetch every matching row in retrieval order
    pub async fn all(&self, params: Params) -> Result<Vec<Row>> {
        self.with_cached(move |_, stmt| fetch_all(stmt, &params)).await
    }

    /// Fetch every matching row through `transform`. The first failing row fails the call.
    pub async fn all_with<T, F>(&self, params: Params, transform: F) -> Result<Vec<T>>
    where
        F: FnMut(Row) -> Result<T>,
    {
        self.all(params).await?.into_iter().map(transform).collect()
    }

    /// Execute a mutating statement
    pub async fn run(&self, params: Params) -> Result<RunOutcome> {
        self.with_cached(move |conn, stmt| execute(conn, stmt, &params)).await
    }

    pub async fn run_with<T, F>(&self, params: Params, transform: F) -> Result<T>
    where
        F: FnOnce(RunOutcome) -> Result<T>,
    {
        let outcome = self.run(params).await?;
        transform(outcome)
    }

    /// Finalize the compiled statement. Later calls fail with [`Error::StatementReleased`].
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.handle.flush_cache();
            debug!(sql = %self.sql, "statement released");
        }
    }

    async fn with_cached<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, &mut rusqlite::Statement<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_released() {
            return Err(Error::StatementReleased);
        }
        let sql = Arc::clone(&self.sql);
        self.handle
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                Ok(f(conn, &mut *stmt)?)
            })
            .await
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("released", &self.is_released())
            .finish()
    }
}
