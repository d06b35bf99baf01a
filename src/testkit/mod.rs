// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory driver for exercising cluster behavior without a database.
//!
//! [`MemoryDriver`] keeps one shared [`MemoryServer`] per DSN, so several
//! opened connections (and several endpoints in a cluster) can point at the
//! same simulated server. Tests flip server state instead of mocking the
//! client:
//!
//! - [`MemoryServer::set_reachable`]: a down server rejects every operation
//!   with a `connection refused` error
//! - [`MemoryServer::set_wsrep_ready`]: controls the row returned for
//!   `SHOW STATUS LIKE 'wsrep_ready'`
//!
//! The statement engine is deliberately small: `INSERT INTO t (a, b) VALUES
//! (...)`, `SELECT cols FROM t [WHERE col = ?]`, `DELETE FROM t`,
//! `SELECT 1`, and a `RAISE <message>` escape hatch that fails with a
//! driver error (useful for exercising non-retryable error paths).
//! Identifiers are folded to lowercase. `open` is lazy: it always succeeds
//! for a non-empty DSN, and connectivity is checked on first use, the way
//! production SQL drivers defer connection establishment.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::driver::{Connection, Driver, ExecResult, PoolStats, Row, Transaction, Value};
use crate::error::{Error, Result};

/// In-memory driver. Register it under any name; the name also picks the
/// placeholder dialect and MySQL-family behavior, so `"mysql-mem"` gets
/// `?` placeholders and wsrep gating while `"postgres-mem"` gets `$N`.
#[derive(Debug)]
pub struct MemoryDriver {
    name: String,
    servers: Mutex<HashMap<String, Arc<MemoryServer>>>,
}

impl MemoryDriver {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// The shared server behind a DSN, created on first use. Use this to
    /// control server state before or after connecting.
    pub fn server(&self, dsn: &str) -> Arc<MemoryServer> {
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        servers
            .entry(dsn.to_string())
            .or_insert_with(|| Arc::new(MemoryServer::new()))
            .clone()
    }

    /// Concrete-typed variant of [`Driver::open`], for tests that need to
    /// inspect [`MemoryConnection`] state directly.
    pub fn connect(&self, dsn: &str) -> Result<Arc<MemoryConnection>> {
        if dsn.trim().is_empty() {
            return Err(Error::Config("empty DSN".to_string()));
        }
        Ok(Arc::new(MemoryConnection {
            dsn: dsn.to_string(),
            server: self.server(dsn),
            closed: AtomicBool::new(false),
            max_idle: AtomicU32::new(2),
            max_open: AtomicU32::new(0),
            lifetime: Mutex::new(None),
        }))
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, dsn: &str) -> Result<Arc<dyn Connection>> {
        let conn = self.connect(dsn)?;
        Ok(conn)
    }
}

#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// Simulated server state shared by every connection to one DSN.
#[derive(Debug)]
pub struct MemoryServer {
    reachable: AtomicBool,
    wsrep_ready: AtomicBool,
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryServer {
    fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            wsrep_ready: AtomicBool::new(true),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    pub fn set_wsrep_ready(&self, ready: bool) {
        self.wsrep_ready.store(ready, Ordering::Relaxed);
    }

    /// Number of committed rows in a table; `0` for an unknown table.
    #[must_use]
    pub fn rows_in(&self, table: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.get(table).map_or(0, |t| t.rows.len())
    }

    fn check_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(Error::Driver("dial tcp: connection refused".to_string()))
        }
    }

    fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        let stmt = normalize(query);
        if let Some(message) = stmt.strip_prefix("raise ") {
            return Err(Error::Driver(message.to_string()));
        }
        if stmt.starts_with("insert into") {
            return self.insert(&stmt, args);
        }
        if stmt.starts_with("delete from") {
            return self.delete(&stmt);
        }
        // DDL and other statements are accepted as no-ops.
        Ok(ExecResult::default())
    }

    fn query(&self, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        let stmt = normalize(query);
        if let Some(message) = stmt.strip_prefix("raise ") {
            return Err(Error::Driver(message.to_string()));
        }
        if stmt.starts_with("show status") && stmt.contains("wsrep_ready") {
            return Ok(vec![wsrep_row(self.wsrep_ready.load(Ordering::Relaxed))]);
        }
        if stmt == "select 1" {
            let columns: Arc<[String]> = Arc::from(vec!["1".to_string()].into_boxed_slice());
            return Ok(vec![Row::new(columns, vec![Value::Int(1)])]);
        }
        if stmt.starts_with("select") {
            return self.select(&stmt, args);
        }
        Err(Error::Driver(format!("unsupported query: {stmt}")))
    }

    fn insert(&self, stmt: &str, args: &[Value]) -> Result<ExecResult> {
        let rest = stmt["insert into".len()..].trim_start();
        let open = rest
            .find('(')
            .ok_or_else(|| Error::Driver("malformed insert statement".to_string()))?;
        let name = rest[..open].trim().to_string();
        let close = rest[open..]
            .find(')')
            .map(|i| open + i)
            .ok_or_else(|| Error::Driver("malformed insert statement".to_string()))?;
        let columns: Vec<String> = rest[open + 1..close]
            .split(',')
            .map(|c| c.trim().to_string())
            .collect();
        if columns.len() != args.len() {
            return Err(Error::Driver(format!(
                "insert expects {} values, got {}",
                columns.len(),
                args.len()
            )));
        }

        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let table = tables.entry(name).or_default();
        for column in &columns {
            if !table.columns.iter().any(|c| c == column) {
                table.columns.push(column.clone());
                for row in &mut table.rows {
                    row.push(Value::Null);
                }
            }
        }

        let mut row = vec![Value::Null; table.columns.len()];
        for (column, value) in columns.iter().zip(args) {
            if let Some(idx) = table.columns.iter().position(|c| c == column) {
                row[idx] = value.clone();
            }
        }
        table.rows.push(row);

        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: Some(table.rows.len() as i64),
        })
    }

    fn select(&self, stmt: &str, args: &[Value]) -> Result<Vec<Row>> {
        let rest = stmt["select".len()..].trim_start();
        let from = rest
            .find(" from ")
            .ok_or_else(|| Error::Driver("malformed select statement".to_string()))?;
        let projection = rest[..from].trim();
        let after = rest[from + " from ".len()..].trim();
        let (name, tail) = match after.find(char::is_whitespace) {
            Some(i) => (&after[..i], after[i..].trim_start()),
            None => (after, ""),
        };
        let where_column = match tail.strip_prefix("where ") {
            Some(clause) => {
                let eq = clause
                    .find('=')
                    .ok_or_else(|| Error::Driver("malformed where clause".to_string()))?;
                Some(clause[..eq].trim().to_string())
            }
            None => None,
        };

        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let table = tables
            .get(name)
            .ok_or_else(|| Error::Driver(format!("no such table: {name}")))?;

        let selected: Vec<String> = if projection == "*" {
            table.columns.clone()
        } else {
            projection.split(',').map(|c| c.trim().to_string()).collect()
        };
        let columns: Arc<[String]> = Arc::from(selected.clone().into_boxed_slice());

        let mut out = Vec::new();
        for row in &table.rows {
            if let Some(column) = &where_column {
                let idx = table
                    .columns
                    .iter()
                    .position(|c| c == column)
                    .ok_or_else(|| Error::Driver(format!("no such column: {column}")))?;
                let needle = args.first().ok_or_else(|| {
                    Error::Driver("missing bind argument for where clause".to_string())
                })?;
                if &row[idx] != needle {
                    continue;
                }
            }
            let values = selected
                .iter()
                .map(|c| {
                    table
                        .columns
                        .iter()
                        .position(|tc| tc == c)
                        .and_then(|i| row.get(i))
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect();
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    fn delete(&self, stmt: &str) -> Result<ExecResult> {
        let name = stmt["delete from".len()..].trim();
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        match tables.get_mut(name) {
            Some(table) => {
                let rows_affected = table.rows.len() as u64;
                table.rows.clear();
                Ok(ExecResult {
                    rows_affected,
                    last_insert_id: None,
                })
            }
            None => Ok(ExecResult::default()),
        }
    }
}

fn normalize(query: &str) -> String {
    query.trim().trim_end_matches(';').trim().to_ascii_lowercase()
}

fn wsrep_row(ready: bool) -> Row {
    let columns: Arc<[String]> = Arc::from(
        vec!["Variable_name".to_string(), "Value".to_string()].into_boxed_slice(),
    );
    Row::new(
        columns,
        vec![
            Value::Text("wsrep_ready".to_string()),
            Value::Text(if ready { "ON" } else { "OFF" }.to_string()),
        ],
    )
}

/// One opened handle onto a [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryConnection {
    dsn: String,
    server: Arc<MemoryServer>,
    closed: AtomicBool,
    max_idle: AtomicU32,
    max_open: AtomicU32,
    lifetime: Mutex<Option<Duration>>,
}

impl MemoryConnection {
    #[must_use]
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    #[must_use]
    pub fn max_idle_conns(&self) -> u32 {
        self.max_idle.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn conn_max_lifetime(&self) -> Option<Duration> {
        *self.lifetime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            Err(Error::Driver("connection handle is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        self.server.check_reachable()
    }

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.ensure_open()?;
        self.server.check_reachable()?;
        self.server.exec(query, args)
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.server.check_reachable()?;
        self.server.query(query, args)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.server.check_reachable()?;
        Ok(Box::new(MemoryTransaction {
            server: self.server.clone(),
            buffered: Vec::new(),
        }))
    }

    fn stats(&self) -> PoolStats {
        let open = u32::from(!self.closed.load(Ordering::Relaxed));
        PoolStats {
            max_open_connections: self.max_open.load(Ordering::Relaxed),
            open_connections: open,
            in_use: 0,
            idle: open,
            wait_count: 0,
            wait_duration: Duration::ZERO,
        }
    }

    fn set_max_idle_conns(&self, n: u32) {
        self.max_idle.store(n, Ordering::Relaxed);
    }

    fn set_max_open_conns(&self, n: u32) {
        self.max_open.store(n, Ordering::Relaxed);
    }

    fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        *self.lifetime.lock().unwrap_or_else(PoisonError::into_inner) = lifetime;
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Writes are buffered until `commit`; reads see committed state only.
struct MemoryTransaction {
    server: Arc<MemoryServer>,
    buffered: Vec<(String, Vec<Value>)>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.server.check_reachable()?;
        self.buffered.push((query.to_string(), args.to_vec()));
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn query(&mut self, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.server.check_reachable()?;
        self.server.query(query, args)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.server.check_reachable()?;
        for (query, args) in &self.buffered {
            self.server.exec(query, args)?;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_select_roundtrip() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.open("mem://t").await.unwrap();

        let result = conn
            .exec(
                "INSERT INTO person (first_name, last_name) VALUES (?, ?)",
                &[Value::from("Ada"), Value::from("Lovelace")],
            )
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, Some(1));

        let rows = conn.query("SELECT * FROM person", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].try_get::<String>("first_name").unwrap(), "Ada");
    }

    #[tokio::test]
    async fn where_clause_filters_by_equality() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.open("mem://t").await.unwrap();

        for name in ["alpha", "beta"] {
            conn.exec(
                "INSERT INTO items (name) VALUES (?)",
                &[Value::from(name)],
            )
            .await
            .unwrap();
        }

        let rows = conn
            .query(
                "SELECT name FROM items WHERE name = ?",
                &[Value::from("beta")],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].try_get::<String>("name").unwrap(), "beta");
    }

    #[tokio::test]
    async fn unreachable_server_refuses_everything() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.open("mem://down").await.unwrap();
        driver.server("mem://down").set_reachable(false);

        assert!(conn.ping().await.is_err());
        assert!(conn.exec("SELECT 1", &[]).await.is_err());
        assert!(conn.query("SELECT 1", &[]).await.is_err());
        assert!(conn.begin().await.is_err());

        driver.server("mem://down").set_reachable(true);
        assert!(conn.ping().await.is_ok());
    }

    #[tokio::test]
    async fn wsrep_status_row_tracks_flag() {
        let driver = MemoryDriver::new("mysql-mem");
        let conn = driver.open("mem://galera").await.unwrap();

        let rows = conn
            .query("SHOW STATUS LIKE 'wsrep_ready'", &[])
            .await
            .unwrap();
        assert_eq!(rows[0].try_get::<String>("Value").unwrap(), "ON");

        driver.server("mem://galera").set_wsrep_ready(false);
        let rows = conn
            .query("SHOW STATUS LIKE 'wsrep_ready'", &[])
            .await
            .unwrap();
        assert_eq!(rows[0].try_get::<String>("Value").unwrap(), "OFF");
    }

    #[tokio::test]
    async fn transactions_buffer_until_commit() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.open("mem://tx").await.unwrap();
        let server = driver.server("mem://tx");

        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO audit (event) VALUES (?)", &[Value::from("a")])
            .await
            .unwrap();
        assert_eq!(server.rows_in("audit"), 0);
        tx.commit().await.unwrap();
        assert_eq!(server.rows_in("audit"), 1);

        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO audit (event) VALUES (?)", &[Value::from("b")])
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(server.rows_in("audit"), 1);
    }

    #[tokio::test]
    async fn raise_surfaces_a_driver_error() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.open("mem://err").await.unwrap();

        let err = conn.exec("RAISE duplicate key value", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Driver(msg) if msg.contains("duplicate key")));
    }

    #[tokio::test]
    async fn select_from_missing_table_errors() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.open("mem://empty").await.unwrap();
        let err = conn.query("SELECT * FROM nothing", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Driver(msg) if msg.contains("no such table")));
    }

    #[tokio::test]
    async fn sizing_knobs_are_recorded() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.connect("mem://sizing").unwrap();

        conn.set_max_idle_conns(4);
        conn.set_max_open_conns(9);
        conn.set_conn_max_lifetime(Some(Duration::from_secs(60)));

        assert_eq!(conn.max_idle_conns(), 4);
        assert_eq!(conn.stats().max_open_connections, 9);
        assert_eq!(conn.conn_max_lifetime(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn delete_clears_table() {
        let driver = MemoryDriver::new("memory");
        let conn = driver.open("mem://d").await.unwrap();
        conn.exec("INSERT INTO t (a) VALUES (?)", &[Value::from(1i64)])
            .await
            .unwrap();
        let result = conn.exec("DELETE FROM t", &[]).await.unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(driver.server("mem://d").rows_in("t"), 0);
    }
}
