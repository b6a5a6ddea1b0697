/// Standard pipeline stages: trace, breaker, retry, chaos
use super::{Next, QueryContext, Stage};
use crate::core::Rows;
use crate::error::PuenteResult;
use crate::resilience::{CircuitBreakerRegistry, FaultInjector, RetryPolicy};
use crate::telemetry::Observer;
use crate::utils::generate_id;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

/// Opens a span per query and reports duration and outcome to the observer
pub struct TracingStage {
    observer: Arc<dyn Observer>,
}

impl TracingStage {
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        Self { observer }
    }
}

#[async_trait]
impl Stage for TracingStage {
    fn name(&self) -> &'static str {
        "trace"
    }

    async fn handle(&self, ctx: &QueryContext, next: Next<'_>) -> PuenteResult<Rows> {
        let query_id = generate_id("q");
        let span = info_span!(
            "query",
            query_id = %query_id,
            connection_id = %ctx.connection_id,
            group_id = ctx.group_id.as_deref().unwrap_or("-"),
        );

        let started = Instant::now();
        let result = next.run(ctx).instrument(span).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(rows) => debug!(
                query_id = %query_id,
                connection_id = %ctx.connection_id,
                rows = rows.len(),
                duration_ms = elapsed.as_millis() as u64,
                "query succeeded"
            ),
            Err(e) => warn!(
                query_id = %query_id,
                connection_id = %ctx.connection_id,
                duration_ms = elapsed.as_millis() as u64,
                severity = %e.severity(),
                error = %e,
                "query failed"
            ),
        }
        self.observer
            .on_query(&ctx.connection_id, elapsed, result.is_ok());
        result
    }
}

/// Gates the rest of the chain with the connection's circuit breaker
pub struct BreakerStage {
    breakers: Arc<CircuitBreakerRegistry>,
}

impl BreakerStage {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { breakers }
    }
}

#[async_trait]
impl Stage for BreakerStage {
    fn name(&self) -> &'static str {
        "breaker"
    }

    async fn handle(&self, ctx: &QueryContext, next: Next<'_>) -> PuenteResult<Rows> {
        let breaker = self.breakers.breaker(&ctx.connection_id).await;
        breaker.execute(|| next.run(ctx)).await
    }
}

/// Re-runs the rest of the chain on transient errors
pub struct RetryStage {
    policy: Arc<RetryPolicy>,
}

impl RetryStage {
    pub fn new(policy: Arc<RetryPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Stage for RetryStage {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn handle(&self, ctx: &QueryContext, next: Next<'_>) -> PuenteResult<Rows> {
        self.policy
            .execute(&ctx.connection_id, move || next.run(ctx))
            .await
    }
}

/// Perturbs calls with injected latency and errors
pub struct ChaosStage {
    injector: Arc<FaultInjector>,
}

impl ChaosStage {
    pub fn new(injector: Arc<FaultInjector>) -> Self {
        Self { injector }
    }
}

#[async_trait]
impl Stage for ChaosStage {
    fn name(&self) -> &'static str {
        "chaos"
    }

    async fn handle(&self, ctx: &QueryContext, next: Next<'_>) -> PuenteResult<Rows> {
        self.injector.inject(&ctx.connection_id).await?;
        next.run(ctx).await
    }
}
