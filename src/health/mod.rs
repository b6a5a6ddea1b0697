/// Health checking for logical connections
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Health status of a backend
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy backend
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Check one logical connection
    async fn check_health(&self, connection_id: &str) -> HealthStatus;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// Applies the checker's timeout to every check
#[derive(Clone)]
pub struct HealthCheckManager {
    checker: Arc<dyn HealthChecker>,
}

impl HealthCheckManager {
    pub fn new(checker: Arc<dyn HealthChecker>) -> Self {
        Self { checker }
    }

    /// Perform health check with timeout
    pub async fn check(&self, connection_id: &str) -> HealthStatus {
        let check_timeout = self.checker.check_timeout();

        let status = match timeout(check_timeout, self.checker.check_health(connection_id)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };

        match &status {
            HealthStatus::Healthy => {
                tracing::debug!(connection_id, "connection is healthy");
            }
            HealthStatus::Unhealthy { reason } => {
                tracing::warn!(connection_id, reason = %reason, "connection is unhealthy");
            }
            HealthStatus::Timeout => {
                tracing::warn!(connection_id, timeout_ms = check_timeout.as_millis() as u64, "health check timed out");
            }
            HealthStatus::Unknown => {
                tracing::warn!(connection_id, "unknown health status");
            }
        }

        status
    }
}
