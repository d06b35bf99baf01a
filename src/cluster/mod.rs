// SPDX-License-Identifier: MIT OR Apache-2.0

//! The cluster handle: one logical database over two pools.
//!
//! A [`Cluster`] owns a masters [`Balancer`] and a slaves [`Balancer`] and
//! dispatches every operation to the right pool:
//!
//! - writes (`exec`, `named_exec`, `begin`) go to masters
//! - reads (`query`, `query_row`, `get`, `select`, `named_query`) go to
//!   slaves, falling through to masters when the slaves pool is empty or
//!   exhausted by transient failures
//! - admin operations (`ping`, `stats`, pool sizing, destroy) aggregate
//!   over both pools or target one of them
//!
//! Each dispatched call runs a retry loop: pick an endpoint, run the driver
//! call, classify the failure through [`parse_error`]. Transient failures
//! quarantine the endpoint and try the next one, bounded by the healthy size
//! at entry; any other error is surfaced verbatim on the first occurrence.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::balancer::{Balancer, Endpoint, DEFAULT_HEALTH_CHECK_PERIOD};
use crate::bind;
use crate::driver::{self, Driver, ExecResult, FromRow, Placeholder, PoolStats, Row, Value};
use crate::error::{parse_error, Error, Result};


// =============================================================================
// Options
// =============================================================================

/// Construction options for [`connect_master_slaves`].
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Delay between health-check cycles for both pools.
    pub health_check_period: Duration,
    /// Concurrent health-probe cap per pool; `0` means the default of 2.
    pub health_check_workers: usize,
    /// Gate endpoint health on Galera `wsrep_ready = ON`. Only effective
    /// for MySQL-family drivers.
    pub wsrep_aware: bool,
    /// Skip the initial ping of each endpoint.
    pub lazy: bool,
    /// Initial per-endpoint pool caps, applied right after open.
    pub max_idle_conns: Option<u32>,
    pub max_open_conns: Option<u32>,
    pub conn_max_lifetime: Option<Duration>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            health_check_period: DEFAULT_HEALTH_CHECK_PERIOD,
            health_check_workers: 0,
            wsrep_aware: false,
            lazy: false,
            max_idle_conns: None,
            max_open_conns: None,
            conn_max_lifetime: None,
        }
    }
}

impl ClusterOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_health_check_period(mut self, period: Duration) -> Self {
        self.health_check_period = period;
        self
    }

    #[must_use]
    pub fn with_health_check_workers(mut self, workers: usize) -> Self {
        self.health_check_workers = workers;
        self
    }

    #[must_use]
    pub fn wsrep_aware(mut self) -> Self {
        self.wsrep_aware = true;
        self
    }

    /// Skip the initial ping on every endpoint.
    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    #[must_use]
    pub fn with_max_idle_conns(mut self, n: u32) -> Self {
        self.max_idle_conns = Some(n);
        self
    }

    #[must_use]
    pub fn with_max_open_conns(mut self, n: u32) -> Self {
        self.max_open_conns = Some(n);
        self
    }

    #[must_use]
    pub fn with_conn_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.conn_max_lifetime = Some(lifetime);
        self
    }
}

// =============================================================================
// Construction
// =============================================================================

/// Connect one cluster: one endpoint per master DSN and per slave DSN.
///
/// The returned vector has one slot per DSN, masters first, then slaves. A
/// slot is `Some` when the open failed or (unless [`ClusterOptions::lazy`])
/// the initial ping failed. Endpoints whose ping failed still join their
/// pool; they quarantine on the first dispatched failure and recover through
/// the health checker. Either DSN list may be empty.
///
/// # Errors
///
/// Fails only when `driver_name` is not registered.
pub async fn connect_master_slaves<S: AsRef<str>>(
    driver_name: &str,
    master_dsns: &[S],
    slave_dsns: &[S],
    options: ClusterOptions,
) -> Result<(Cluster, Vec<Option<Error>>)> {
    let driver = driver::lookup(driver_name)?;
    Ok(Cluster::connect_with(driver, master_dsns, slave_dsns, options).await)
}

/// The logical handle over a masters pool and a slaves pool.
pub struct Cluster {
    driver: Arc<dyn Driver>,
    masters: Balancer,
    slaves: Balancer,
}

impl Cluster {
    /// Connect with an explicit driver instance instead of a registry name.
    pub async fn connect_with<S: AsRef<str>>(
        driver: Arc<dyn Driver>,
        master_dsns: &[S],
        slave_dsns: &[S],
        options: ClusterOptions,
    ) -> (Self, Vec<Option<Error>>) {
        let wsrep = options.wsrep_aware && driver::is_mysql_family(driver.name());
        let masters = Balancer::with_period(
            options.health_check_workers,
            master_dsns.len(),
            wsrep,
            options.health_check_period,
        );
        let slaves = Balancer::with_period(
            options.health_check_workers,
            slave_dsns.len(),
            wsrep,
            options.health_check_period,
        );

        let mut errors = Vec::with_capacity(master_dsns.len() + slave_dsns.len());
        for dsn in master_dsns {
            errors.push(open_endpoint(&driver, dsn.as_ref(), &options, &masters).await);
        }
        for dsn in slave_dsns {
            errors.push(open_endpoint(&driver, dsn.as_ref(), &options, &slaves).await);
        }

        (
            Self {
                driver,
                masters,
                slaves,
            },
            errors,
        )
    }

    #[must_use]
    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    #[must_use]
    pub fn placeholder(&self) -> Placeholder {
        self.driver.placeholder()
    }

    /// Translate `?` placeholders into this cluster's dialect.
    #[must_use]
    pub fn rebind(&self, query: &str) -> String {
        bind::rebind(query, self.placeholder())
    }
}

async fn open_endpoint(
    driver: &Arc<dyn Driver>,
    dsn: &str,
    options: &ClusterOptions,
    balancer: &Balancer,
) -> Option<Error> {
    match driver.open(dsn).await {
        Ok(conn) => {
            if let Some(n) = options.max_idle_conns {
                conn.set_max_idle_conns(n);
            }
            if let Some(n) = options.max_open_conns {
                conn.set_max_open_conns(n);
            }
            if let Some(lifetime) = options.conn_max_lifetime {
                conn.set_conn_max_lifetime(Some(lifetime));
            }
            let slot = if options.lazy {
                None
            } else {
                conn.ping().await.err()
            };
            debug!(dsn = %driver::redact_dsn(dsn), "opened endpoint");
            balancer.add(Endpoint::new(dsn, conn)).await;
            slot
        }
        Err(err) => {
            warn!(dsn = %driver::redact_dsn(dsn), %err, "failed to open endpoint");
            Some(err)
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

fn exhausted_sentinel(total_at_entry: usize) -> Error {
    if total_at_entry == 0 {
        Error::NoConnection
    } else {
        Error::NoConnectionOrWsrep
    }
}

impl Cluster {
    /// The retry loop shared by every dispatched call: at most one attempt
    /// per endpoint that was healthy at entry.
    async fn dispatch<T, F, Fut>(&self, balancer: &Balancer, read_only: bool, op: F) -> Result<T>
    where
        F: Fn(Arc<Endpoint>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (attempts, total) = balancer.sizes().await;

        for _ in 0..attempts {
            let Some(endpoint) = balancer.get(read_only).await else {
                break;
            };
            match op(endpoint.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => match parse_error(Some(endpoint.conn().as_ref()), err) {
                    Error::Network => {
                        warn!(
                            endpoint = endpoint.id(),
                            "transient failure, retrying on another endpoint"
                        );
                        balancer.failure(&endpoint).await;
                    }
                    other => return Err(other),
                },
            }
        }

        Err(exhausted_sentinel(total))
    }

    /// Read-path dispatch: slaves first, with a single fall-through to
    /// masters when the slaves pool is empty or exhausted by transient
    /// failures.
    async fn dispatch_read<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<Endpoint>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (_, slave_total) = self.slaves.sizes().await;
        if slave_total == 0 {
            return self.dispatch(&self.masters, false, &op).await;
        }

        match self.dispatch(&self.slaves, true, &op).await {
            Err(Error::NoConnection | Error::NoConnectionOrWsrep | Error::Network) => {
                debug!("slaves exhausted, falling through to masters");
                match self.dispatch(&self.masters, false, &op).await {
                    // The slaves pool had endpoints at entry, so an empty
                    // masters pool still reports exhaustion, not absence.
                    Err(Error::NoConnection) => Err(Error::NoConnectionOrWsrep),
                    other => other,
                }
            }
            other => other,
        }
    }
}

// =============================================================================
// Statement surface
// =============================================================================

impl Cluster {
    /// Execute a write statement on a master.
    pub async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.dispatch(&self.masters, false, |ep| async move {
            ep.conn().exec(query, args).await
        })
        .await
    }

    /// Like [`Cluster::exec`].
    ///
    /// # Panics
    ///
    /// Panics on any error. Prefer [`Cluster::exec`] outside of setup code.
    pub async fn must_exec(&self, query: &str, args: &[Value]) -> ExecResult {
        match self.exec(query, args).await {
            Ok(result) => result,
            Err(err) => panic!("must_exec: {err}"),
        }
    }

    /// Expand `:name` parameters, rebind for the dialect, and execute on a
    /// master.
    pub async fn named_exec(
        &self,
        query: &str,
        params: &HashMap<String, Value>,
    ) -> Result<ExecResult> {
        let (expanded, args) = bind::named(query, params)?;
        let rebound = bind::rebind(&expanded, self.placeholder());
        let query: &str = &rebound;
        let args: &[Value] = &args;
        self.dispatch(&self.masters, false, |ep| async move {
            ep.conn().exec(query, args).await
        })
        .await
    }

    /// Run a read query on a slave (falling through to masters) and collect
    /// all rows.
    pub async fn query(&self, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.dispatch_read(|ep| async move { ep.conn().query(query, args).await })
            .await
    }

    /// Run a read query and return its first row, or [`Error::NoRows`].
    pub async fn query_row(&self, query: &str, args: &[Value]) -> Result<Row> {
        let rows = self.query(query, args).await?;
        rows.into_iter().next().ok_or(Error::NoRows)
    }

    /// Run a read query and map the first row, or [`Error::NoRows`].
    pub async fn get<T: FromRow>(&self, query: &str, args: &[Value]) -> Result<T> {
        let row = self.query_row(query, args).await?;
        T::from_row(&row)
    }

    /// Run a read query and map every row.
    pub async fn select<T: FromRow>(&self, query: &str, args: &[Value]) -> Result<Vec<T>> {
        let rows = self.query(query, args).await?;
        rows.iter().map(T::from_row).collect()
    }

    /// Expand `:name` parameters, rebind for the dialect, and run as a read
    /// query.
    pub async fn named_query(
        &self,
        query: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Vec<Row>> {
        let (expanded, args) = bind::named(query, params)?;
        let rebound = bind::rebind(&expanded, self.placeholder());
        let query: &str = &rebound;
        let args: &[Value] = &args;
        self.dispatch_read(|ep| async move { ep.conn().query(query, args).await })
            .await
    }

    /// Start a transaction on a master. Selection retries across masters
    /// like any write; once started, every operation is pinned to that
    /// endpoint and errors are surfaced verbatim.
    pub async fn begin(&self) -> Result<Transaction> {
        self.dispatch(&self.masters, false, |ep| async move {
            let inner = ep.conn().begin().await?;
            Ok(Transaction {
                inner,
                endpoint: ep,
            })
        })
        .await
    }
}

/// A transaction pinned to one master endpoint.
///
/// No retry machinery runs inside a transaction: if the endpoint dies
/// mid-transaction, the transaction is lost and the caller sees the
/// underlying error.
pub struct Transaction {
    inner: Box<dyn driver::Transaction>,
    endpoint: Arc<Endpoint>,
}

impl Transaction {
    pub async fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.inner.exec(query, args).await
    }

    pub async fn query(&mut self, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.inner.query(query, args).await
    }

    pub async fn commit(self) -> Result<()> {
        self.inner.commit().await
    }

    pub async fn rollback(self) -> Result<()> {
        self.inner.rollback().await
    }

    /// The master endpoint this transaction is pinned to.
    #[must_use]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }
}

// =============================================================================
// Admin surface
// =============================================================================

async fn ping_pool(balancer: &Balancer) -> Vec<Option<Error>> {
    let endpoints = balancer.endpoints().await;
    let mut probes = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        probes.push(tokio::spawn(async move {
            endpoint.conn().ping().await.err()
        }));
    }

    let mut results = Vec::with_capacity(probes.len());
    for probe in probes {
        results.push(match probe.await {
            Ok(slot) => slot,
            Err(err) => Some(Error::Driver(format!("ping task failed: {err}"))),
        });
    }
    results
}

async fn stats_pool(balancer: &Balancer) -> Vec<PoolStats> {
    balancer
        .endpoints()
        .await
        .iter()
        .map(|endpoint| endpoint.conn().stats())
        .collect()
}

impl Cluster {
    /// Ping every endpoint in both pools, masters first. One slot per
    /// endpoint; `None` means healthy.
    pub async fn ping(&self) -> Vec<Option<Error>> {
        let mut results = self.ping_master().await;
        results.extend(self.ping_slave().await);
        results
    }

    pub async fn ping_master(&self) -> Vec<Option<Error>> {
        ping_pool(&self.masters).await
    }

    pub async fn ping_slave(&self) -> Vec<Option<Error>> {
        ping_pool(&self.slaves).await
    }

    /// Pool statistics for every endpoint in both pools, masters first.
    pub async fn stats(&self) -> Vec<PoolStats> {
        let mut results = self.stats_master().await;
        results.extend(self.stats_slave().await);
        results
    }

    pub async fn stats_master(&self) -> Vec<PoolStats> {
        stats_pool(&self.masters).await
    }

    pub async fn stats_slave(&self) -> Vec<PoolStats> {
        stats_pool(&self.slaves).await
    }

    /// One master endpoint (rotating) plus the total master count.
    pub async fn get_master(&self) -> (Option<Arc<Endpoint>>, usize) {
        let (_, total) = self.masters.sizes().await;
        (self.masters.get(false).await, total)
    }

    /// Every master endpoint plus the count.
    pub async fn get_all_masters(&self) -> (Vec<Arc<Endpoint>>, usize) {
        let endpoints = self.masters.endpoints().await;
        let count = endpoints.len();
        (endpoints, count)
    }

    /// Every slave endpoint plus the count.
    pub async fn get_all_slaves(&self) -> (Vec<Arc<Endpoint>>, usize) {
        let endpoints = self.slaves.endpoints().await;
        let count = endpoints.len();
        (endpoints, count)
    }

    pub fn set_health_check_period(&self, period: Duration) {
        self.masters.set_health_check_period(period);
        self.slaves.set_health_check_period(period);
    }

    pub fn set_master_health_check_period(&self, period: Duration) {
        self.masters.set_health_check_period(period);
    }

    pub fn set_slave_health_check_period(&self, period: Duration) {
        self.slaves.set_health_check_period(period);
    }

    #[must_use]
    pub fn master_health_check_period(&self) -> Duration {
        self.masters.health_check_period()
    }

    #[must_use]
    pub fn slave_health_check_period(&self) -> Duration {
        self.slaves.health_check_period()
    }

    pub async fn set_max_idle_conns(&self, n: u32) {
        self.set_master_max_idle_conns(n).await;
        self.set_slave_max_idle_conns(n).await;
    }

    pub async fn set_master_max_idle_conns(&self, n: u32) {
        for endpoint in self.masters.endpoints().await {
            endpoint.conn().set_max_idle_conns(n);
        }
    }

    pub async fn set_slave_max_idle_conns(&self, n: u32) {
        for endpoint in self.slaves.endpoints().await {
            endpoint.conn().set_max_idle_conns(n);
        }
    }

    pub async fn set_max_open_conns(&self, n: u32) {
        self.set_master_max_open_conns(n).await;
        self.set_slave_max_open_conns(n).await;
    }

    pub async fn set_master_max_open_conns(&self, n: u32) {
        for endpoint in self.masters.endpoints().await {
            endpoint.conn().set_max_open_conns(n);
        }
    }

    pub async fn set_slave_max_open_conns(&self, n: u32) {
        for endpoint in self.slaves.endpoints().await {
            endpoint.conn().set_max_open_conns(n);
        }
    }

    pub async fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        self.set_master_conn_max_lifetime(lifetime).await;
        self.set_slave_conn_max_lifetime(lifetime).await;
    }

    pub async fn set_master_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        for endpoint in self.masters.endpoints().await {
            endpoint.conn().set_conn_max_lifetime(lifetime);
        }
    }

    pub async fn set_slave_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        for endpoint in self.slaves.endpoints().await {
            endpoint.conn().set_conn_max_lifetime(lifetime);
        }
    }

    /// Destroy both pools: stop the health checkers, close every endpoint,
    /// empty the pools. Later dispatches observe empty pools and return
    /// [`Error::NoConnection`].
    pub async fn destroy(&self) -> Vec<Error> {
        let mut errors = self.destroy_master().await;
        errors.extend(self.destroy_slave().await);
        errors
    }

    pub async fn destroy_master(&self) -> Vec<Error> {
        self.masters.destroy().await
    }

    pub async fn destroy_slave(&self) -> Vec<Error> {
        self.slaves.destroy().await
    }
}
