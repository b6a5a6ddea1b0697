/// Driver-based connections to legacy (ODBC-style) backends
///
/// The wire-level driver is an external collaborator registered by name on
/// the pool. This variant owns one driver session, rewrites named markers to
/// positional `?` markers and restores the select-list aliases on the rows
/// the driver hands back.

use super::HealthReport;
use crate::core::columns::{declared_aliases, normalize_row};
use crate::core::placeholders::{bind_positional, PlaceholderStyle};
use crate::core::{ConnectionConfig, QueryParam, Rows};
use crate::error::{PuenteError, PuenteResult};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Factory for sessions against one family of legacy backends
#[async_trait]
pub trait LegacyDriver: Send + Sync {
    /// Name referenced by `ConnectionConfig::driver`
    fn name(&self) -> &str;

    /// Open a session for the given connection
    async fn open(&self, config: &ConnectionConfig) -> PuenteResult<Box<dyn DriverSession>>;
}

/// One open session with a legacy backend
#[async_trait]
pub trait DriverSession: Send + Sync {
    /// Execute a statement with positional `?` markers
    async fn execute(&self, sql: &str, params: &[QueryParam]) -> PuenteResult<Rows>;

    async fn close(&self) -> PuenteResult<()>;
}

pub struct DriverConnection {
    config: Arc<ConnectionConfig>,
    driver: Arc<dyn LegacyDriver>,
    session: RwLock<Option<Arc<dyn DriverSession>>>,
    connected: AtomicBool,
}

impl fmt::Debug for DriverConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConnection")
            .field("id", &self.config.id)
            .field("driver", &self.driver.name())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl DriverConnection {
    pub fn new(config: Arc<ConnectionConfig>, driver: Arc<dyn LegacyDriver>) -> Self {
        Self {
            config,
            driver,
            session: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Open the driver session; a second call is a no-op
    pub async fn connect(&self) -> PuenteResult<()> {
        let mut session = self.session.write().await;
        if session.is_some() {
            return Ok(());
        }

        debug!(connection_id = %self.config.id, driver = self.driver.name(), "opening driver session");
        let opened = self.driver.open(&self.config).await?;
        *session = Some(Arc::from(opened));
        self.connected.store(true, Ordering::Release);
        info!(connection_id = %self.config.id, "driver session opened");
        Ok(())
    }

    async fn session(&self) -> PuenteResult<Arc<dyn DriverSession>> {
        self.session
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| PuenteError::Closed {
                connection_id: self.config.id.clone(),
            })
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> PuenteResult<Rows> {
        let session = self.session().await?;
        let bound = bind_positional(sql, params, PlaceholderStyle::Question)?;
        let rows = session.execute(&bound.sql, &bound.params).await?;

        let aliases = declared_aliases(sql);
        Ok(rows
            .into_iter()
            .map(|row| normalize_row(row, &aliases))
            .collect())
    }

    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let connected = match self.query(self.config.health_query(), &[]).await {
            Ok(_) => true,
            Err(e) => {
                debug!(connection_id = %self.config.id, error = %e, "driver health query failed");
                false
            }
        };
        HealthReport::new(connected, started.elapsed())
    }

    pub async fn close(&self) -> PuenteResult<()> {
        let session = self.session.write().await.take();
        self.connected.store(false, Ordering::Release);
        match session {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::core::Row;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted driver: counts opens/executions and replays a fixed row set
    #[derive(Clone)]
    pub struct MockDriver {
        pub name: String,
        pub opens: Arc<AtomicUsize>,
        pub executions: Arc<AtomicUsize>,
        pub closes: Arc<AtomicUsize>,
        pub rows: Rows,
        pub open_delay: Duration,
        pub query_delay: Duration,
        /// Errors returned by successive executions before rows are returned
        pub failures: Arc<Mutex<Vec<PuenteError>>>,
        pub fail_open: Arc<AtomicBool>,
        pub last_sql: Arc<Mutex<Option<(String, Vec<QueryParam>)>>>,
    }

    impl MockDriver {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                opens: Arc::new(AtomicUsize::new(0)),
                executions: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
                rows: Vec::new(),
                open_delay: Duration::ZERO,
                query_delay: Duration::ZERO,
                failures: Arc::new(Mutex::new(Vec::new())),
                fail_open: Arc::new(AtomicBool::new(false)),
                last_sql: Arc::new(Mutex::new(None)),
            }
        }

        pub fn with_rows(mut self, rows: Rows) -> Self {
            self.rows = rows;
            self
        }

        pub fn with_open_delay(mut self, delay: Duration) -> Self {
            self.open_delay = delay;
            self
        }

        pub fn with_query_delay(mut self, delay: Duration) -> Self {
            self.query_delay = delay;
            self
        }

        pub fn fail_next(&self, error: PuenteError) {
            self.failures.lock().unwrap().push(error);
        }

        pub fn executions(&self) -> usize {
            self.executions.load(Ordering::SeqCst)
        }

        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    pub fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    struct MockSession {
        driver: MockDriver,
    }

    #[async_trait]
    impl DriverSession for MockSession {
        async fn execute(&self, sql: &str, params: &[QueryParam]) -> PuenteResult<Rows> {
            self.driver.executions.fetch_add(1, Ordering::SeqCst);
            *self.driver.last_sql.lock().unwrap() = Some((sql.to_string(), params.to_vec()));
            if !self.driver.query_delay.is_zero() {
                tokio::time::sleep(self.driver.query_delay).await;
            }
            let next_failure = {
                let mut failures = self.driver.failures.lock().unwrap();
                if failures.is_empty() {
                    None
                } else {
                    Some(failures.remove(0))
                }
            };
            match next_failure {
                Some(error) => Err(error),
                None => Ok(self.driver.rows.clone()),
            }
        }

        async fn close(&self) -> PuenteResult<()> {
            self.driver.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl LegacyDriver for MockDriver {
        fn name(&self) -> &str {
            &self.name
        }

        async fn open(&self, config: &ConnectionConfig) -> PuenteResult<Box<dyn DriverSession>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if !self.open_delay.is_zero() {
                tokio::time::sleep(self.open_delay).await;
            }
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(PuenteError::backend(
                    config.id.as_str(),
                    Some("08001"),
                    "Unable to establish connection",
                ));
            }
            Ok(Box::new(MockSession {
                driver: self.clone(),
            }))
        }
    }
}
