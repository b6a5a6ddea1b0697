/// Pooled connections to modern relational backends through sqlx
use super::HealthReport;
use crate::core::placeholders::{bind_positional, PlaceholderStyle};
use crate::core::{ConnectionConfig, ParamType, QueryParam, Row, Rows};
use crate::error::{PuenteError, PuenteResult};
use serde_json::Value;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Executor as _, Row as _};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct RelationalConnection {
    config: Arc<ConnectionConfig>,
    acquire_timeout: Duration,
    pool: RwLock<Option<(AnyPool, PlaceholderStyle)>>,
    connected: AtomicBool,
}

impl RelationalConnection {
    pub fn new(config: Arc<ConnectionConfig>, acquire_timeout: Duration) -> Self {
        Self {
            config,
            acquire_timeout,
            pool: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Idle connections currently held by the underlying sqlx pool
    pub fn idle_connections(&self) -> u32 {
        match self.pool.try_read() {
            Ok(guard) => guard
                .as_ref()
                .map(|(pool, _)| pool.num_idle() as u32)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Build the sqlx pool; a second call is a no-op
    pub async fn connect(&self) -> PuenteResult<()> {
        let mut slot = self.pool.write().await;
        if slot.is_some() {
            return Ok(());
        }

        sqlx::any::install_default_drivers();
        let url = self.config.relational_url()?;
        let style = PlaceholderStyle::for_url(&url);

        debug!(connection_id = %self.config.id, max_connections = self.config.max_pool_size, read_only = self.config.read_only, "creating relational pool");
        let mut options = AnyPoolOptions::new()
            .max_connections(self.config.max_pool_size.max(1))
            .acquire_timeout(self.acquire_timeout);
        if self.config.read_only {
            match read_only_statement(&url) {
                Some(statement) => {
                    options = options.after_connect(move |conn, _meta| {
                        Box::pin(async move {
                            conn.execute(statement).await?;
                            Ok(())
                        })
                    });
                }
                None => warn!(connection_id = %self.config.id, "read_only is not enforced for this backend"),
            }
        }
        let pool = options
            .connect(&url)
            .await
            .map_err(|e| map_sqlx_error(&self.config.id, e))?;

        *slot = Some((pool, style));
        self.connected.store(true, Ordering::Release);
        info!(connection_id = %self.config.id, "relational pool connected");
        Ok(())
    }

    async fn pool(&self) -> PuenteResult<(AnyPool, PlaceholderStyle)> {
        self.pool
            .read()
            .await
            .as_ref()
            .map(|(pool, style)| (pool.clone(), *style))
            .ok_or_else(|| PuenteError::Closed {
                connection_id: self.config.id.clone(),
            })
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> PuenteResult<Rows> {
        let (pool, style) = self.pool().await?;
        let bound = bind_positional(sql, params, style)?;

        let mut query = sqlx::query(&bound.sql);
        for param in &bound.params {
            query = bind_param(query, param)?;
        }

        let rows = query
            .fetch_all(&pool)
            .await
            .map_err(|e| map_sqlx_error(&self.config.id, e))?;
        Ok(rows.iter().map(decode_row).collect())
    }

    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let connected = match self.query(self.config.health_query(), &[]).await {
            Ok(_) => true,
            Err(e) => {
                debug!(connection_id = %self.config.id, error = %e, "relational health query failed");
                false
            }
        };
        HealthReport::new(connected, started.elapsed())
    }

    pub async fn close(&self) -> PuenteResult<()> {
        let pool = self.pool.write().await.take();
        self.connected.store(false, Ordering::Release);
        if let Some((pool, _)) = pool {
            pool.close().await;
        }
        Ok(())
    }
}

/// Session statement that rejects writes on every pooled connection
fn read_only_statement(url: &str) -> Option<&'static str> {
    let scheme = url.split(':').next().unwrap_or_default();
    match scheme {
        "sqlite" => Some("PRAGMA query_only = ON"),
        "postgres" | "postgresql" => Some("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY"),
        "mysql" | "mariadb" => Some("SET SESSION TRANSACTION READ ONLY"),
        _ => None,
    }
}

fn bind_param<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    param: &QueryParam,
) -> PuenteResult<Query<'q, Any, AnyArguments<'q>>> {
    if param.is_null() {
        return Ok(query.bind(Option::<String>::None));
    }

    Ok(match param.kind {
        ParamType::Int | ParamType::Bigint => query.bind(param.as_i64()?),
        ParamType::Float => query.bind(param.as_f64()?),
        ParamType::Bit => query.bind(param.as_bool()?),
        ParamType::Decimal if param.value.is_number() => query.bind(param.as_f64()?),
        ParamType::Decimal | ParamType::Varchar | ParamType::Datetime => {
            query.bind(param.as_text())
        }
    })
}

fn decode_row(row: &AnyRow) -> Row {
    row.columns()
        .iter()
        .map(|column| {
            let index = column.ordinal();
            (column.name().to_string(), decode_value(row, index))
        })
        .collect()
}

fn decode_value(row: &AnyRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return value
            .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null);
    }
    Value::Null
}

fn io_code(kind: io::ErrorKind) -> Option<&'static str> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Some("ECONNRESET"),
        io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
        io::ErrorKind::BrokenPipe => Some("EPIPE"),
        io::ErrorKind::NotConnected => Some("ESOCKET"),
        _ => None,
    }
}

/// Translate a sqlx error into the access layer's taxonomy
pub(crate) fn map_sqlx_error(connection_id: &str, err: sqlx::Error) -> PuenteError {
    match err {
        sqlx::Error::PoolTimedOut => PuenteError::backend(
            connection_id,
            Some("POOL_TIMEOUT"),
            "pool timed out while waiting for an open connection",
        ),
        sqlx::Error::PoolClosed => PuenteError::Closed {
            connection_id: connection_id.to_string(),
        },
        sqlx::Error::Io(e) => PuenteError::backend(connection_id, io_code(e.kind()), e.to_string()),
        sqlx::Error::Database(e) => {
            let code = e.code().map(|c| c.into_owned());
            PuenteError::Backend {
                connection_id: connection_id.to_string(),
                code,
                message: e.message().to_string(),
            }
        }
        other => PuenteError::backend(connection_id, None, other.to_string()),
    }
}
