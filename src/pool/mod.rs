/// Connection pool keyed by logical connection id
///
/// Entries are created lazily on first use. Concurrent first callers for the
/// same id share one connect attempt through a per-id `OnceCell`, so there is
/// never more than one live entry per id.
use crate::connection::{
    Connection, DriverConnection, HealthReport, LegacyDriver, RelationalConnection,
};
use crate::core::{ConnectionConfig, ConnectionKind, QueryParam, Rows};
use crate::error::{ConfigError, PuenteError, PuenteResult};
use crate::health::{HealthChecker, HealthStatus};
use crate::pipeline::{Executor, QueryContext};
use crate::telemetry::Observer;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Upper bound for establishing a new connection
    pub connect_timeout: Duration,
    /// Wait for a free handle inside a relational pool
    pub acquire_timeout: Duration,
    /// How long `close` waits for in-flight queries
    pub drain_timeout: Duration,
    pub drain_poll_interval: Duration,
    pub health_check_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
            drain_poll_interval: Duration::from_millis(50),
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

/// One live connection with its usage bookkeeping
pub struct PoolEntry {
    connection: Connection,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last use
    last_used_ms: AtomicU64,
    in_flight: AtomicUsize,
}

impl fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("connection", &self.connection)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl PoolEntry {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.connection.config()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_used_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    pub fn idle_for(&self) -> Duration {
        let last_used = Duration::from_millis(self.last_used_ms.load(Ordering::Acquire));
        self.created_at.elapsed().saturating_sub(last_used)
    }

    fn begin(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { entry: self }
    }
}

/// Decrements the in-flight counter on every exit path
struct InFlightGuard<'a> {
    entry: &'a PoolEntry,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time view of one pool entry
#[derive(Debug, Clone, Serialize)]
pub struct PoolEntryStats {
    pub connection_id: String,
    pub kind: ConnectionKind,
    pub connected: bool,
    pub in_flight: usize,
    pub idle_ms: u64,
    pub idle_handles: u32,
}

type Slot = Arc<OnceCell<Arc<PoolEntry>>>;

pub struct ConnectionPool {
    configs: HashMap<String, Arc<ConnectionConfig>>,
    config: PoolConfig,
    drivers: HashMap<String, Arc<dyn LegacyDriver>>,
    entries: Mutex<HashMap<String, Slot>>,
    observer: Arc<dyn Observer>,
}

impl ConnectionPool {
    pub fn new(
        connections: Vec<ConnectionConfig>,
        config: PoolConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let configs = connections
            .into_iter()
            .map(|c| (c.id.clone(), Arc::new(c)))
            .collect();
        Self {
            configs,
            config,
            drivers: HashMap::new(),
            entries: Mutex::new(HashMap::new()),
            observer,
        }
    }

    /// Register a legacy driver under its name
    pub fn with_driver(mut self, driver: Arc<dyn LegacyDriver>) -> Self {
        self.drivers.insert(driver.name().to_string(), driver);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Configured logical ids, sorted
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn connection_config(&self, connection_id: &str) -> Option<&ConnectionConfig> {
        self.configs.get(connection_id).map(|c| c.as_ref())
    }

    /// Ids with a live entry
    pub async fn active_ids(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut ids: Vec<String> = entries
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Live entry for `connection_id`, connecting it on first use
    pub async fn resolve(&self, connection_id: &str) -> PuenteResult<Arc<PoolEntry>> {
        let slot = {
            let mut entries = self.entries.lock().await;
            match entries.get(connection_id) {
                Some(slot) => {
                    if let Some(entry) = slot.get() {
                        entry.touch();
                        return Ok(Arc::clone(entry));
                    }
                    Arc::clone(slot)
                }
                None => {
                    if !self.configs.contains_key(connection_id) {
                        return Err(PuenteError::config_not_found(connection_id));
                    }
                    let slot: Slot = Arc::new(OnceCell::new());
                    entries.insert(connection_id.to_string(), Arc::clone(&slot));
                    slot
                }
            }
        };

        let entry = slot.get_or_try_init(|| self.open(connection_id)).await?;
        entry.touch();
        Ok(Arc::clone(entry))
    }

    fn build(&self, config: &Arc<ConnectionConfig>) -> PuenteResult<Connection> {
        match config.kind {
            ConnectionKind::Odbc => {
                let name = config.driver.as_deref().ok_or_else(|| {
                    ConfigError::ValidationError(format!(
                        "connection {} has kind odbc but no driver",
                        config.id
                    ))
                })?;
                let driver = self.drivers.get(name).ok_or_else(|| {
                    ConfigError::ValidationError(format!(
                        "no legacy driver registered under {} for connection {}",
                        name, config.id
                    ))
                })?;
                Ok(Connection::Driver(DriverConnection::new(
                    Arc::clone(config),
                    Arc::clone(driver),
                )))
            }
            ConnectionKind::Sql => Ok(Connection::Relational(RelationalConnection::new(
                Arc::clone(config),
                self.config.acquire_timeout,
            ))),
        }
    }

    async fn open(&self, connection_id: &str) -> PuenteResult<Arc<PoolEntry>> {
        let config = self
            .configs
            .get(connection_id)
            .ok_or_else(|| PuenteError::config_not_found(connection_id))?;
        let connection = self.build(config)?;

        debug!(connection_id, kind = %connection.kind(), "connecting");
        match tokio::time::timeout(self.config.connect_timeout, connection.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(connection_id, error = %e, "connect failed");
                return Err(e);
            }
            Err(_) => {
                warn!(
                    connection_id,
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "connect timed out"
                );
                if let Err(e) = connection.close().await {
                    debug!(connection_id, error = %e, "close after connect timeout failed");
                }
                return Err(PuenteError::timeout(format!("connect {}", connection_id)));
            }
        }

        info!(connection_id, kind = %connection.kind(), "connection added to pool");
        let entry = Arc::new(PoolEntry::new(connection));
        self.emit_gauge(connection_id, &entry);
        Ok(entry)
    }

    fn emit_gauge(&self, connection_id: &str, entry: &PoolEntry) {
        self.observer.on_pool_gauge(
            connection_id,
            entry.in_flight(),
            entry.connection.idle_handles(),
        );
    }

    pub async fn query(
        &self,
        connection_id: &str,
        sql: &str,
        params: &[QueryParam],
    ) -> PuenteResult<Rows> {
        let entry = self.resolve(connection_id).await?;
        let result = {
            let _guard = entry.begin();
            entry.connection.query_with(sql, params).await
        };
        entry.touch();
        self.emit_gauge(connection_id, &entry);
        result
    }

    /// Drain and close one entry; unknown or already closed ids are a no-op
    pub async fn close(&self, connection_id: &str) -> PuenteResult<()> {
        let slot = self.entries.lock().await.get(connection_id).cloned();
        let Some(slot) = slot else {
            return Ok(());
        };

        // A connect in progress finishes into this slot; wait for it so the
        // connection it opens is closed here instead of leaking.
        let entry = match slot.get() {
            Some(entry) => Some(Arc::clone(entry)),
            None => slot
                .get_or_try_init(|| async {
                    Err(PuenteError::Closed {
                        connection_id: connection_id.to_string(),
                    })
                })
                .await
                .ok()
                .map(Arc::clone),
        };

        if let Some(entry) = &entry {
            let deadline = Instant::now() + self.config.drain_timeout;
            while entry.in_flight() > 0 && Instant::now() < deadline {
                tokio::time::sleep(self.config.drain_poll_interval).await;
            }
            if entry.in_flight() > 0 {
                warn!(
                    connection_id,
                    in_flight = entry.in_flight(),
                    "drain timeout reached, closing connection with queries in flight"
                );
            }
        }

        {
            let mut entries = self.entries.lock().await;
            if entries
                .get(connection_id)
                .map_or(false, |current| Arc::ptr_eq(current, &slot))
            {
                entries.remove(connection_id);
            }
        }

        if let Some(entry) = entry {
            if let Err(e) = entry.connection.close().await {
                warn!(connection_id, error = %e, "error while closing connection");
            }
            self.observer.on_pool_gauge(connection_id, 0, 0);
            info!(connection_id, "connection removed from pool");
        }
        Ok(())
    }

    /// Close every entry concurrently
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        let results = join_all(ids.iter().map(|id| self.close(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(connection_id = %id, error = %e, "close failed");
            }
        }
    }

    pub async fn stats(&self) -> Vec<PoolEntryStats> {
        let entries: Vec<(String, Arc<PoolEntry>)> = self
            .entries
            .lock()
            .await
            .iter()
            .filter_map(|(id, slot)| slot.get().map(|e| (id.clone(), Arc::clone(e))))
            .collect();

        let mut stats: Vec<PoolEntryStats> = entries
            .into_iter()
            .map(|(connection_id, entry)| PoolEntryStats {
                connection_id,
                kind: entry.connection.kind(),
                connected: entry.connection.is_connected(),
                in_flight: entry.in_flight(),
                idle_ms: entry.idle_for().as_millis() as u64,
                idle_handles: entry.connection.idle_handles(),
            })
            .collect();
        stats.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        stats
    }

    /// Close entries idle for at least `max_idle` with nothing in flight
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let idle: Vec<String> = self
            .entries
            .lock()
            .await
            .iter()
            .filter_map(|(id, slot)| {
                slot.get()
                    .filter(|e| e.in_flight() == 0 && e.idle_for() >= max_idle)
                    .map(|_| id.clone())
            })
            .collect();

        for id in &idle {
            debug!(connection_id = %id, "evicting idle connection");
            if let Err(e) = self.close(id).await {
                warn!(connection_id = %id, error = %e, "eviction failed");
            }
        }
        idle
    }

    pub async fn health_check(&self, connection_id: &str) -> PuenteResult<HealthReport> {
        let entry = self.resolve(connection_id).await?;
        let report = entry.connection.health_check().await;
        self.emit_gauge(connection_id, &entry);
        Ok(report)
    }

    /// Check every configured connection concurrently
    pub async fn health_check_all(&self) -> BTreeMap<String, HealthReport> {
        let ids = self.connection_ids();
        let reports = join_all(ids.iter().map(|id| async move {
            let started = Instant::now();
            match tokio::time::timeout(self.config.health_check_timeout, self.health_check(id))
                .await
            {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    warn!(connection_id = %id, error = %e, "health check failed");
                    HealthReport::new(false, started.elapsed())
                }
                Err(_) => {
                    warn!(connection_id = %id, "health check timed out");
                    HealthReport::new(false, started.elapsed())
                }
            }
        }))
        .await;

        ids.into_iter().zip(reports).collect()
    }
}

#[async_trait]
impl Executor for ConnectionPool {
    async fn execute(&self, ctx: &QueryContext) -> PuenteResult<Rows> {
        self.query(&ctx.connection_id, &ctx.sql, &ctx.params).await
    }
}

#[async_trait]
impl HealthChecker for ConnectionPool {
    async fn check_health(&self, connection_id: &str) -> HealthStatus {
        match self.health_check(connection_id).await {
            Ok(report) if report.connected => HealthStatus::Healthy,
            Ok(_) => HealthStatus::Unhealthy {
                reason: "health query failed".to_string(),
            },
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    fn check_timeout(&self) -> Duration {
        self.config.health_check_timeout
    }
}
