/// Puente - resilient access layer for legacy ERP and SQL database backends
///
/// Callers name a logical connection (or a failover group of them) and hand
/// over SQL with typed parameters. Puente resolves the physical backend,
/// gates the call with a per-connection circuit breaker, retries transient
/// failures with exponential backoff and moves a group to its next region
/// when the active one keeps failing.
///
/// Two kinds of backends are supported:
/// 1. ODBC-style legacy systems, reached through a registered [`LegacyDriver`]
/// 2. Relational databases reached through a sqlx `AnyPool`
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod failover;
pub mod health;
pub mod pipeline;
pub mod pool;
pub mod resilience;
pub mod telemetry;
pub mod utils;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{HealthReport, LegacyDriver};
use crate::core::{ConnectionConfig, QueryParam, Rows};
use crate::error::{PuenteError, PuenteResult};
use crate::failover::{ConnectionGroup, FailoverDecision, FailoverRegistry};
use crate::health::{HealthCheckManager, HealthChecker};
use crate::pipeline::{
    BreakerStage, ChaosStage, Pipeline, QueryContext, RetryStage, TracingStage,
};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, FaultInjectionConfig, FaultInjector,
    RetryConfig, RetryPolicy,
};
use crate::telemetry::{Observer, TracingObserver};

/// Regions a single group query may visit before giving up
pub const MAX_REGION_ATTEMPTS: usize = 3;

/// Assembles a [`Puente`] from configuration plus runtime collaborators
pub struct PuenteBuilder {
    environment: String,
    connections: Vec<ConnectionConfig>,
    groups: Vec<ConnectionGroup>,
    pool: PoolConfig,
    retry: RetryConfig,
    circuit_breaker: CircuitBreakerConfig,
    fault_injection: FaultInjectionConfig,
    drivers: Vec<Arc<dyn LegacyDriver>>,
    observer: Arc<dyn Observer>,
}

impl Default for PuenteBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PuenteBuilder {
    pub fn new() -> Self {
        Self {
            environment: "development".to_string(),
            connections: Vec::new(),
            groups: Vec::new(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            fault_injection: FaultInjectionConfig::default(),
            drivers: Vec::new(),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Start from a loaded configuration file
    pub fn from_config(config: &Config) -> Self {
        Self {
            environment: config.environment.clone(),
            connections: config.connections.clone(),
            groups: config.connection_groups(),
            pool: config.pool_config(),
            retry: config.retry_config(),
            circuit_breaker: config.circuit_breaker_config(),
            fault_injection: config.fault_injection_config(),
            ..Self::new()
        }
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn group(mut self, group: ConnectionGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn fault_injection_config(mut self, config: FaultInjectionConfig) -> Self {
        self.fault_injection = config;
        self
    }

    /// Register a legacy driver; connections select it by name
    pub fn with_driver(mut self, driver: Arc<dyn LegacyDriver>) -> Self {
        self.drivers.push(driver);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub async fn build(self) -> PuenteResult<Puente> {
        let PuenteBuilder {
            environment,
            connections,
            groups,
            pool,
            retry,
            circuit_breaker,
            fault_injection,
            drivers,
            observer,
        } = self;

        let pool = drivers
            .into_iter()
            .fold(
                ConnectionPool::new(connections, pool, Arc::clone(&observer)),
                ConnectionPool::with_driver,
            );
        let pool = Arc::new(pool);

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            circuit_breaker,
            Arc::clone(&observer),
        ));
        let retry = Arc::new(RetryPolicy::new(retry));
        let injector = Arc::new(FaultInjector::new(fault_injection, &environment));

        let checker: Arc<dyn HealthChecker> = pool.clone();
        let failover = FailoverRegistry::new(HealthCheckManager::new(checker), Arc::clone(&observer));
        for group in groups {
            for region in &group.regions {
                if pool.connection_config(&region.connection_id).is_none() {
                    return Err(PuenteError::ConfigNotFound {
                        connection_id: region.connection_id.clone(),
                    });
                }
            }
            failover.register(group).await?;
        }

        let mut pipeline = Pipeline::new()
            .stage(TracingStage::new(Arc::clone(&observer)))
            .stage(BreakerStage::new(Arc::clone(&breakers)))
            .stage(RetryStage::new(Arc::clone(&retry)));
        if injector.is_active() {
            warn!(environment = %environment, "fault injection is active");
            pipeline = pipeline.stage(ChaosStage::new(Arc::clone(&injector)));
        }

        info!(
            environment = %environment,
            connections = pool.connection_ids().len(),
            stages = ?pipeline.stage_names(),
            "puente initialized"
        );

        Ok(Puente {
            environment,
            pool,
            breakers,
            retry,
            injector,
            failover,
            pipeline,
        })
    }
}

/// Main access layer: one pool, one breaker registry, one failover registry
pub struct Puente {
    environment: String,
    pool: Arc<ConnectionPool>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: Arc<RetryPolicy>,
    injector: Arc<FaultInjector>,
    failover: FailoverRegistry,
    pipeline: Pipeline,
}

impl Puente {
    pub fn builder() -> PuenteBuilder {
        PuenteBuilder::new()
    }

    pub async fn from_config(config: &Config) -> PuenteResult<Self> {
        PuenteBuilder::from_config(config).build().await
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn fault_injector(&self) -> &FaultInjector {
        &self.injector
    }

    pub fn failover(&self) -> &FailoverRegistry {
        &self.failover
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run a query against one logical connection
    pub async fn query(
        &self,
        connection_id: &str,
        sql: &str,
        params: &[QueryParam],
    ) -> PuenteResult<Rows> {
        let ctx = QueryContext::new(connection_id, sql, params.to_vec());
        self.pipeline.run(self.pool.as_ref(), &ctx).await
    }

    /// Run a query against the active region of a failover group
    ///
    /// The active region is re-resolved before every attempt, so a failover
    /// triggered by an earlier attempt is honored by the next one.
    pub async fn query_group(
        &self,
        group_id: &str,
        sql: &str,
        params: &[QueryParam],
    ) -> PuenteResult<Rows> {
        let mut last_error = None;

        for _ in 0..MAX_REGION_ATTEMPTS {
            let connection_id = self.failover.current_connection(group_id).await?;
            let ctx = QueryContext::new(connection_id.as_str(), sql, params.to_vec())
                .with_group(group_id);

            let error = match self.pipeline.run(self.pool.as_ref(), &ctx).await {
                Ok(rows) => {
                    self.failover.record_success(&connection_id).await;
                    return Ok(rows);
                }
                Err(e) if e.is_fatal() || e.is_domain() => return Err(e),
                Err(e) => e,
            };

            match self
                .failover
                .record_failure(group_id, &connection_id, &error)
                .await?
            {
                FailoverDecision::NoHealthyRegion => {
                    return Err(PuenteError::AllRegionsFailed {
                        group_id: group_id.to_string(),
                    })
                }
                FailoverDecision::Recorded { count } => {
                    debug!(group_id, connection_id = %connection_id, count, "retrying query on current region");
                }
                FailoverDecision::FailedOver { from, to } => {
                    debug!(group_id, from = %from, to = %to, "retrying query on new region");
                }
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| PuenteError::AllRegionsFailed {
            group_id: group_id.to_string(),
        }))
    }

    pub async fn health_check(&self, connection_id: &str) -> PuenteResult<HealthReport> {
        self.pool.health_check(connection_id).await
    }

    /// Health of every configured connection, keyed by id
    pub async fn health_report(&self) -> BTreeMap<String, HealthReport> {
        self.pool.health_check_all().await
    }

    /// Stop health polls, then drain and close every pooled connection
    pub async fn shutdown(&self) {
        info!("shutting down puente");
        self.failover.shutdown();
        self.pool.close_all().await;
        info!("puente shutdown complete");
    }
}
