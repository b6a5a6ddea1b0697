/// Backend connections
///
/// A logical connection is served by exactly one of two variants, chosen once
/// from its configured kind: a session on a registered legacy driver, or a
/// sqlx pool against a modern relational backend.
pub mod driver;
pub mod relational;

pub use driver::{DriverConnection, DriverSession, LegacyDriver};
pub use relational::RelationalConnection;

use crate::core::{ConnectionConfig, ConnectionKind, QueryParam, Rows};
use crate::error::PuenteResult;
use serde::Serialize;
use std::time::Duration;

/// Result of a cheap round trip against one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub connected: bool,
    pub response_time_ms: u64,
}

impl HealthReport {
    pub fn new(connected: bool, elapsed: Duration) -> Self {
        Self {
            connected,
            response_time_ms: elapsed.as_millis() as u64,
        }
    }
}

#[derive(Debug)]
pub enum Connection {
    Driver(DriverConnection),
    Relational(RelationalConnection),
}

impl Connection {
    pub fn config(&self) -> &ConnectionConfig {
        match self {
            Connection::Driver(conn) => conn.config(),
            Connection::Relational(conn) => conn.config(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config().id
    }

    pub fn kind(&self) -> ConnectionKind {
        match self {
            Connection::Driver(_) => ConnectionKind::Odbc,
            Connection::Relational(_) => ConnectionKind::Sql,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Connection::Driver(conn) => conn.is_connected(),
            Connection::Relational(conn) => conn.is_connected(),
        }
    }

    /// Idle physical handles behind this connection (a driver session counts as one)
    pub fn idle_handles(&self) -> u32 {
        match self {
            Connection::Driver(conn) => u32::from(conn.is_connected()),
            Connection::Relational(conn) => conn.idle_connections(),
        }
    }

    pub async fn connect(&self) -> PuenteResult<()> {
        match self {
            Connection::Driver(conn) => conn.connect().await,
            Connection::Relational(conn) => conn.connect().await,
        }
    }

    /// Raw statement without parameters
    pub async fn query(&self, sql: &str) -> PuenteResult<Rows> {
        self.query_with(sql, &[]).await
    }

    pub async fn query_with(&self, sql: &str, params: &[QueryParam]) -> PuenteResult<Rows> {
        match self {
            Connection::Driver(conn) => conn.query(sql, params).await,
            Connection::Relational(conn) => conn.query(sql, params).await,
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        match self {
            Connection::Driver(conn) => conn.health_check().await,
            Connection::Relational(conn) => conn.health_check().await,
        }
    }

    pub async fn close(&self) -> PuenteResult<()> {
        match self {
            Connection::Driver(conn) => conn.close().await,
            Connection::Relational(conn) => conn.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::driver::testing::{row, MockDriver};
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_health_report_serializes_camel_case() {
        let report = HealthReport::new(true, Duration::from_millis(42));
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json, json!({"connected": true, "responseTimeMs": 42}));
    }

    #[tokio::test]
    async fn test_driver_variant_dispatch() {
        let driver = MockDriver::new("mock").with_rows(vec![row(&[("ONE", json!(1))])]);
        let config = Arc::new(ConnectionConfig::odbc("erp", "mock"));
        let conn = Connection::Driver(DriverConnection::new(config, Arc::new(driver.clone())));

        assert_eq!(conn.kind(), ConnectionKind::Odbc);
        assert_eq!(conn.idle_handles(), 0);

        conn.connect().await.unwrap();
        let rows = conn.query("SELECT 1 AS one").await.unwrap();
        assert_eq!(rows[0].get("one"), Some(&json!(1)));
        assert_eq!(conn.idle_handles(), 1);

        conn.close().await.unwrap();
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_relational_variant_dispatch() {
        let config = Arc::new(ConnectionConfig::sql("local", "sqlite::memory:"));
        let conn = Connection::Relational(RelationalConnection::new(
            config,
            Duration::from_secs(5),
        ));

        assert_eq!(conn.kind(), ConnectionKind::Sql);
        assert_eq!(conn.id(), "local");

        conn.connect().await.unwrap();
        let report = conn.health_check().await;
        assert!(report.connected);
        conn.close().await.unwrap();
    }
}
