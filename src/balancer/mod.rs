// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pool balancing and endpoint health management.
//!
//! One [`Balancer`] serves one pool (masters or slaves). It owns a rotating
//! ring of healthy endpoints and a bag of quarantined ones, both behind a
//! single lock. [`Balancer::get`] hands out endpoints in strict round-robin
//! order; [`Balancer::failure`] moves an endpoint into quarantine; a
//! background checker periodically probes quarantined endpoints and
//! reinstates the ones that recovered.
//!
//! Movement rules:
//!
//! - healthy → quarantined: only `failure` (and `destroy`)
//! - quarantined → healthy: only the health checker
//!
//! The checker never holds the pool lock across a probe: it snapshots the
//! quarantined set, probes outside the lock behind a bounded semaphore, and
//! reacquires the lock to promote.

mod ring;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use crate::driver::{Connection, Value};
use crate::error::Error;
use ring::Ring;

/// Default delay between health-check cycles.
pub const DEFAULT_HEALTH_CHECK_PERIOD: Duration = Duration::from_millis(500);

const DEFAULT_HEALTH_WORKERS: usize = 2;
const MAX_HEALTH_WORKERS: usize = 16;

const WSREP_QUERY: &str = "SHOW STATUS LIKE 'wsrep_ready'";

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// One physical database endpoint: an opened connection handle plus an
/// identifier that stays stable as the endpoint moves between the healthy
/// and quarantined sets. Endpoints are created at cluster construction and
/// closed on destroy; a dead endpoint is quarantined and probed, never
/// reopened.
#[derive(Debug)]
pub struct Endpoint {
    id: u64,
    dsn: String,
    conn: Arc<dyn Connection>,
}

impl Endpoint {
    pub(crate) fn new(dsn: impl Into<String>, conn: Arc<dyn Connection>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            dsn: dsn.into(),
            conn,
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    #[must_use]
    pub fn conn(&self) -> &Arc<dyn Connection> {
        &self.conn
    }
}

struct Sets {
    healthy: Ring,
    quarantined: Vec<Arc<Endpoint>>,
    destroyed: bool,
}

struct Inner {
    sets: Mutex<Sets>,
    period_ms: AtomicU64,
    workers: usize,
    wsrep_aware: bool,
}

/// Round-robin balancer over one pool of endpoints, with quarantine and a
/// background recovery loop.
pub struct Balancer {
    inner: Arc<Inner>,
    stop: watch::Sender<bool>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl Balancer {
    /// Create a balancer and launch its health checker with the default
    /// period.
    ///
    /// `worker_count` caps concurrent health probes: `0` means the default
    /// of 2, anything else is clamped to `min(worker_count, endpoint_count,
    /// 16)`.
    #[must_use]
    pub fn new(worker_count: usize, endpoint_count: usize, wsrep_aware: bool) -> Self {
        Self::with_period(
            worker_count,
            endpoint_count,
            wsrep_aware,
            DEFAULT_HEALTH_CHECK_PERIOD,
        )
    }

    /// Like [`Balancer::new`] with an explicit health-check period.
    #[must_use]
    pub fn with_period(
        worker_count: usize,
        endpoint_count: usize,
        wsrep_aware: bool,
        period: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            sets: Mutex::new(Sets {
                healthy: Ring::new(),
                quarantined: Vec::new(),
                destroyed: false,
            }),
            period_ms: AtomicU64::new((period.as_millis() as u64).max(1)),
            workers: clamp_workers(worker_count, endpoint_count),
            wsrep_aware,
        });
        let (stop, stop_rx) = watch::channel(false);
        let checker = tokio::spawn(health_loop(inner.clone(), stop_rx));

        Self {
            inner,
            stop,
            checker: Mutex::new(Some(checker)),
        }
    }

    /// Insert an endpoint at the tail of the healthy ring.
    pub async fn add(&self, endpoint: Arc<Endpoint>) {
        let mut sets = self.inner.sets.lock().await;
        if sets.destroyed {
            return;
        }
        sets.healthy.push(endpoint);
    }

    /// Atomically return the current healthy endpoint and advance the
    /// rotation cursor by one step. Returns `None` when the healthy ring is
    /// empty.
    ///
    /// `read_only` is accepted as a routing hint; the baseline rotation does
    /// not act on it.
    pub async fn get(&self, read_only: bool) -> Option<Arc<Endpoint>> {
        let mut sets = self.inner.sets.lock().await;
        let endpoint = sets.healthy.rotate();
        if let Some(endpoint) = &endpoint {
            trace!(endpoint = endpoint.id(), read_only, "handing out endpoint");
        }
        endpoint
    }

    /// Move an endpoint from the healthy ring into quarantine. Idempotent:
    /// an endpoint that is already quarantined (or unknown) is left alone.
    pub async fn failure(&self, endpoint: &Arc<Endpoint>) {
        let mut sets = self.inner.sets.lock().await;
        if sets.healthy.remove(endpoint) {
            warn!(
                endpoint = endpoint.id(),
                dsn = endpoint.dsn(),
                "endpoint quarantined"
            );
            sets.quarantined.push(endpoint.clone());
        }
    }

    /// `(healthy, total)` sizes under one lock acquisition.
    pub async fn sizes(&self) -> (usize, usize) {
        let sets = self.inner.sets.lock().await;
        let healthy = sets.healthy.len();
        (healthy, healthy + sets.quarantined.len())
    }

    pub async fn healthy_len(&self) -> usize {
        self.inner.sets.lock().await.healthy.len()
    }

    pub async fn quarantined_len(&self) -> usize {
        self.inner.sets.lock().await.quarantined.len()
    }

    /// Total endpoints across both sets.
    pub async fn len(&self) -> usize {
        let sets = self.inner.sets.lock().await;
        sets.healthy.len() + sets.quarantined.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every endpoint, healthy ring order first, then
    /// quarantined.
    pub async fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let sets = self.inner.sets.lock().await;
        let mut out: Vec<Arc<Endpoint>> = sets.healthy.iter().cloned().collect();
        out.extend(sets.quarantined.iter().cloned());
        out
    }

    pub async fn contains_healthy(&self, endpoint: &Arc<Endpoint>) -> bool {
        self.inner.sets.lock().await.healthy.contains(endpoint)
    }

    /// Update the health-check period. The running checker picks the new
    /// value up on its next iteration.
    pub fn set_health_check_period(&self, period: Duration) {
        self.inner
            .period_ms
            .store((period.as_millis() as u64).max(1), Ordering::Relaxed);
    }

    #[must_use]
    pub fn health_check_period(&self) -> Duration {
        Duration::from_millis(self.inner.period_ms.load(Ordering::Relaxed))
    }

    /// Stop the health checker, close every endpoint in both sets, and empty
    /// the pool. Blocks until the checker has exited; in-flight probes are
    /// allowed to finish. Close failures are collected, not short-circuited.
    pub async fn destroy(&self) -> Vec<Error> {
        let _ = self.stop.send(true);
        if let Some(handle) = self.checker.lock().await.take() {
            if let Err(err) = handle.await {
                debug!(%err, "health checker did not exit cleanly");
            }
        }

        let endpoints = {
            let mut sets = self.inner.sets.lock().await;
            sets.destroyed = true;
            let mut endpoints: Vec<Arc<Endpoint>> = sets.healthy.iter().cloned().collect();
            endpoints.extend(sets.quarantined.drain(..));
            sets.healthy.clear();
            endpoints
        };

        let mut errors = Vec::new();
        for endpoint in endpoints {
            if let Err(err) = endpoint.conn().close().await {
                errors.push(err);
            }
        }
        debug!("pool destroyed");
        errors
    }
}

fn clamp_workers(worker_count: usize, endpoint_count: usize) -> usize {
    if worker_count == 0 {
        DEFAULT_HEALTH_WORKERS
    } else {
        worker_count
            .min(endpoint_count.max(1))
            .min(MAX_HEALTH_WORKERS)
    }
}

/// One probe: ping, then the Galera readiness check when enabled. Both must
/// pass for the endpoint to count as recovered.
async fn probe(endpoint: &Endpoint, wsrep_aware: bool) -> bool {
    if endpoint.conn().ping().await.is_err() {
        return false;
    }
    if !wsrep_aware {
        return true;
    }
    match endpoint.conn().query(WSREP_QUERY, &[]).await {
        Ok(rows) => rows.first().is_some_and(|row| {
            matches!(row.get("Value"), Some(Value::Text(v)) if v == "ON")
        }),
        Err(_) => false,
    }
}

async fn health_loop(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    let semaphore = Arc::new(Semaphore::new(inner.workers));

    loop {
        let period = Duration::from_millis(inner.period_ms.load(Ordering::Relaxed).max(1));
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            () = tokio::time::sleep(period) => {}
        }
        if *stop.borrow() {
            break;
        }

        let quarantined: Vec<Arc<Endpoint>> =
            { inner.sets.lock().await.quarantined.clone() };
        if quarantined.is_empty() {
            continue;
        }

        let mut probes = JoinSet::new();
        for endpoint in quarantined {
            if *stop.borrow() {
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let inner = inner.clone();
            probes.spawn(async move {
                let _permit = permit;
                if !probe(&endpoint, inner.wsrep_aware).await {
                    return;
                }
                let mut sets = inner.sets.lock().await;
                if sets.destroyed {
                    return;
                }
                if let Some(pos) = sets
                    .quarantined
                    .iter()
                    .position(|e| e.id() == endpoint.id())
                {
                    let recovered = sets.quarantined.remove(pos);
                    debug!(
                        endpoint = recovered.id(),
                        dsn = recovered.dsn(),
                        "endpoint recovered, back in rotation"
                    );
                    sets.healthy.push(recovered);
                }
            });
        }
        // Wait the cycle out; destroy never interrupts an in-flight probe.
        while probes.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver;
    use crate::testkit::MemoryDriver;

    async fn pool(
        driver: &MemoryDriver,
        balancer: &Balancer,
        dsns: &[&str],
    ) -> Vec<Arc<Endpoint>> {
        let mut endpoints = Vec::with_capacity(dsns.len());
        for dsn in dsns {
            let conn = driver.open(dsn).await.unwrap();
            let endpoint = Endpoint::new(*dsn, conn);
            balancer.add(endpoint.clone()).await;
            endpoints.push(endpoint);
        }
        endpoints
    }

    #[test]
    fn worker_clamp() {
        assert_eq!(clamp_workers(0, 10), 2);
        assert_eq!(clamp_workers(4, 10), 4);
        assert_eq!(clamp_workers(8, 3), 3);
        assert_eq!(clamp_workers(64, 100), 16);
        assert_eq!(clamp_workers(4, 0), 1);
    }

    #[tokio::test]
    async fn round_robin_rotation() {
        let driver = MemoryDriver::new("memory");
        let balancer = Balancer::new(2, 3, false);
        let eps = pool(&driver, &balancer, &["mem://a", "mem://b", "mem://c"]).await;

        // Two full cycles: strict round-robin, one step per get.
        for k in 0..6 {
            let got = balancer.get(k % 2 == 0).await.unwrap();
            assert_eq!(got.id(), eps[k % 3].id());
        }

        balancer.destroy().await;
    }

    #[tokio::test]
    async fn rotation_skips_nothing_after_failure() {
        // A, B, C, D; after handing out A, B, C, quarantine C; next gets are
        // D then A.
        let driver = MemoryDriver::new("memory");
        let balancer = Balancer::new(2, 4, false);
        let eps = pool(
            &driver,
            &balancer,
            &["mem://a", "mem://b", "mem://c", "mem://d"],
        )
        .await;

        assert_eq!(balancer.get(true).await.unwrap().id(), eps[0].id());
        assert_eq!(balancer.get(false).await.unwrap().id(), eps[1].id());
        assert_eq!(balancer.get(true).await.unwrap().id(), eps[2].id());

        balancer.failure(&eps[2]).await;

        assert_eq!(balancer.get(false).await.unwrap().id(), eps[3].id());
        assert_eq!(balancer.get(false).await.unwrap().id(), eps[0].id());

        balancer.destroy().await;
    }

    #[tokio::test]
    async fn failure_quarantines_and_preserves_total() {
        let driver = MemoryDriver::new("memory");
        let balancer = Balancer::with_period(2, 3, false, Duration::from_secs(3600));
        let eps = pool(&driver, &balancer, &["mem://a", "mem://b", "mem://c"]).await;

        let (healthy, total) = balancer.sizes().await;
        assert_eq!((healthy, total), (3, 3));

        driver.server("mem://b").set_reachable(false);
        balancer.failure(&eps[1]).await;

        let (healthy, total) = balancer.sizes().await;
        assert_eq!((healthy, total), (2, 3));
        assert!(!balancer.contains_healthy(&eps[1]).await);

        // The quarantined endpoint is never handed out.
        for _ in 0..6 {
            let got = balancer.get(true).await.unwrap();
            assert_ne!(got.id(), eps[1].id());
        }

        // Idempotent.
        balancer.failure(&eps[1]).await;
        assert_eq!(balancer.sizes().await, (2, 3));

        balancer.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn health_checker_promotes_recovered_endpoint() {
        let driver = MemoryDriver::new("memory");
        let balancer = Balancer::with_period(2, 2, false, Duration::from_millis(20));
        let eps = pool(&driver, &balancer, &["mem://a", "mem://b"]).await;

        driver.server("mem://b").set_reachable(false);
        balancer.failure(&eps[1]).await;
        assert_eq!(balancer.sizes().await, (1, 2));

        // Stays quarantined while unreachable.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(balancer.sizes().await, (1, 2));

        // Recovers within two periods of coming back.
        driver.server("mem://b").set_reachable(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(balancer.sizes().await, (2, 2));
        assert!(balancer.contains_healthy(&eps[1]).await);

        balancer.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wsrep_gating_blocks_promotion() {
        let driver = MemoryDriver::new("mysql-mem");
        let balancer = Balancer::with_period(2, 1, true, Duration::from_millis(20));
        let eps = pool(&driver, &balancer, &["mem://galera"]).await;

        let server = driver.server("mem://galera");
        server.set_wsrep_ready(false);
        balancer.failure(&eps[0]).await;

        // Reachable but not wsrep ready: stays quarantined.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(balancer.sizes().await, (0, 1));

        server.set_wsrep_ready(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(balancer.sizes().await, (1, 1));

        balancer.destroy().await;
    }

    #[tokio::test]
    async fn get_on_empty_pool_returns_none() {
        let balancer = Balancer::new(2, 0, false);
        assert!(balancer.get(true).await.is_none());
        assert!(balancer.get(false).await.is_none());
        balancer.destroy().await;
    }

    #[tokio::test]
    async fn destroy_empties_pool_and_stops_checker() {
        let driver = MemoryDriver::new("memory");
        let balancer = Balancer::with_period(2, 2, false, Duration::from_millis(10));
        let eps = pool(&driver, &balancer, &["mem://a", "mem://b"]).await;
        balancer.failure(&eps[1]).await;

        let errors = balancer.destroy().await;
        assert!(errors.is_empty());
        assert_eq!(balancer.sizes().await, (0, 0));
        assert!(balancer.get(false).await.is_none());

        // Closed handles reject further use.
        assert!(eps[0].conn().ping().await.is_err());

        // Second destroy is a no-op.
        assert!(balancer.destroy().await.is_empty());
    }

    #[tokio::test]
    async fn period_is_settable_at_runtime() {
        let balancer = Balancer::new(2, 1, false);
        assert_eq!(balancer.health_check_period(), DEFAULT_HEALTH_CHECK_PERIOD);
        balancer.set_health_check_period(Duration::from_millis(200));
        assert_eq!(
            balancer.health_check_period(),
            Duration::from_millis(200)
        );
        balancer.destroy().await;
    }
}
