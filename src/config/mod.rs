/// Configuration management for puente

use crate::core::{ConnectionConfig, ConnectionKind};
use crate::failover::{ConnectionGroup, FailoverPolicy, RegionConfig};
use crate::pool::PoolConfig;
use crate::resilience::{
    CircuitBreakerConfig, FaultInjectionConfig, RetryConfig, DEFAULT_RETRYABLE_ERRORS,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use crate::error::ConfigError;

/// Main puente configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Deployment environment (production, staging, development, test)
    pub environment: String,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Connection pool configuration
    pub pool: PoolSettings,
    /// Health check configuration
    pub health: HealthConfig,
    /// Retry policy configuration
    pub retry: RetrySettings,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerSettings,
    /// Fault injection configuration
    pub fault_injection: FaultInjectionSettings,
    /// Logical connections
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    /// Failover groups
    #[serde(default)]
    pub groups: Vec<GroupSettings>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    /// Idle connections older than this are evicted; 0 disables eviction
    pub idle_timeout_ms: u64,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval of the periodic health report in milliseconds
    pub interval_ms: u64,
    /// Health check timeout in milliseconds
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    /// Error codes and message fragments treated as transient
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

fn default_retryable_errors() -> Vec<String> {
    DEFAULT_RETRYABLE_ERRORS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
    pub monitoring_period_ms: u64,
    pub volume_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultInjectionSettings {
    pub enabled: bool,
    pub latency_probability: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub error_probability: f64,
    pub error_code: String,
    pub error_message: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Failover group as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    pub id: String,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_failback_delay_ms")]
    pub failback_delay_ms: u64,
    #[serde(default = "default_auto_failback")]
    pub auto_failback: bool,
    pub regions: Vec<RegionConfig>,
}

fn default_max_failures() -> u32 {
    3
}

fn default_failure_window_ms() -> u64 {
    60_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_failback_delay_ms() -> u64 {
    60_000
}

fn default_auto_failback() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
                stdout: true,
                file: None,
            },
            pool: PoolSettings {
                connect_timeout_ms: 30_000,
                acquire_timeout_ms: 30_000,
                drain_timeout_ms: 5_000,
                idle_timeout_ms: 0,
            },
            health: HealthConfig {
                interval_ms: 60_000,
                timeout_ms: 5_000,
            },
            retry: RetrySettings {
                max_attempts: 3,
                initial_delay_ms: 100,
                max_delay_ms: 5_000,
                multiplier: 2.0,
                jitter_ms: 100,
                retryable_errors: default_retryable_errors(),
            },
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: 5,
                success_threshold: 2,
                timeout_ms: 60_000,
                monitoring_period_ms: 120_000,
                volume_threshold: 10,
            },
            fault_injection: FaultInjectionSettings {
                enabled: false,
                latency_probability: 0.0,
                min_latency_ms: 100,
                max_latency_ms: 1_000,
                error_probability: 0.0,
                error_code: "ECONNRESET".to_string(),
                error_message: "injected fault: connection reset".to_string(),
                targets: Vec::new(),
                seed: None,
            },
            connections: Vec::new(),
            groups: Vec::new(),
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        PoolConfig {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
            drain_timeout: Duration::from_millis(settings.drain_timeout_ms),
            ..PoolConfig::default()
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            jitter: Duration::from_millis(settings.jitter_ms),
            retryable_errors: settings.retryable_errors.clone(),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            timeout: Duration::from_millis(settings.timeout_ms),
            monitoring_period: Duration::from_millis(settings.monitoring_period_ms),
            volume_threshold: settings.volume_threshold,
        }
    }
}

impl From<&FaultInjectionSettings> for FaultInjectionConfig {
    fn from(settings: &FaultInjectionSettings) -> Self {
        FaultInjectionConfig {
            enabled: settings.enabled,
            latency_probability: settings.latency_probability,
            min_latency: Duration::from_millis(settings.min_latency_ms),
            max_latency: Duration::from_millis(settings.max_latency_ms),
            error_probability: settings.error_probability,
            error_code: settings.error_code.clone(),
            error_message: settings.error_message.clone(),
            targets: settings.targets.clone(),
            seed: settings.seed,
        }
    }
}

impl From<&GroupSettings> for ConnectionGroup {
    fn from(settings: &GroupSettings) -> Self {
        ConnectionGroup::new(
            settings.id.clone(),
            settings.regions.clone(),
            FailoverPolicy {
                max_failures: settings.max_failures,
                failure_window: Duration::from_millis(settings.failure_window_ms),
                health_check_interval: Duration::from_millis(settings.health_check_interval_ms),
                failback_delay: Duration::from_millis(settings.failback_delay_ms),
                auto_failback: settings.auto_failback,
            },
        )
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            health_check_timeout: Duration::from_millis(self.health.timeout_ms),
            ..PoolConfig::from(&self.pool)
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from(&self.retry)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::from(&self.circuit_breaker)
    }

    pub fn fault_injection_config(&self) -> FaultInjectionConfig {
        FaultInjectionConfig::from(&self.fault_injection)
    }

    pub fn connection_groups(&self) -> Vec<ConnectionGroup> {
        self.groups.iter().map(ConnectionGroup::from).collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(message: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::ValidationError(message.into()))
        }

        if self.environment.trim().is_empty() {
            return invalid("environment cannot be empty");
        }

        // Validate pool and health config
        if self.pool.connect_timeout_ms == 0 {
            return invalid("pool connect_timeout_ms must be greater than 0");
        }
        if self.pool.acquire_timeout_ms == 0 {
            return invalid("pool acquire_timeout_ms must be greater than 0");
        }
        if self.health.interval_ms == 0 {
            return invalid("health check interval_ms must be greater than 0");
        }
        if self.health.timeout_ms == 0 {
            return invalid("health check timeout_ms must be greater than 0");
        }
        if self.health.timeout_ms >= self.health.interval_ms {
            return invalid("health check timeout_ms must be less than interval_ms");
        }

        // Validate resilience config
        if self.retry.max_attempts == 0 {
            return invalid("retry max_attempts must be greater than 0");
        }
        if self.retry.multiplier < 1.0 {
            return invalid("retry multiplier must be at least 1.0");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return invalid("retry initial_delay_ms must not exceed max_delay_ms");
        }
        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0
            || breaker.success_threshold == 0
            || breaker.volume_threshold == 0
        {
            return invalid("circuit breaker thresholds must be greater than 0");
        }
        if breaker.timeout_ms == 0 || breaker.monitoring_period_ms == 0 {
            return invalid("circuit breaker timeout_ms and monitoring_period_ms must be greater than 0");
        }

        // Validate fault injection
        let faults = &self.fault_injection;
        if faults.enabled && self.environment.eq_ignore_ascii_case("production") {
            return invalid("fault injection cannot be enabled in production");
        }
        for (name, p) in [
            ("latency_probability", faults.latency_probability),
            ("error_probability", faults.error_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return invalid(format!("fault injection {} must be between 0 and 1", name));
            }
        }
        if faults.min_latency_ms > faults.max_latency_ms {
            return invalid("fault injection min_latency_ms must not exceed max_latency_ms");
        }

        // Validate connections
        let mut ids = HashSet::new();
        for connection in &self.connections {
            if connection.id.trim().is_empty() {
                return invalid("connection id cannot be empty");
            }
            if !ids.insert(connection.id.as_str()) {
                return invalid(format!("Duplicate connection id: {}", connection.id));
            }
            if connection.max_pool_size == 0 {
                return invalid(format!(
                    "connection {} max_pool_size must be greater than 0",
                    connection.id
                ));
            }
            match connection.kind {
                ConnectionKind::Odbc if connection.driver.is_none() => {
                    return invalid(format!("odbc connection {} needs a driver", connection.id));
                }
                ConnectionKind::Sql if connection.url.is_none() && connection.host.is_none() => {
                    return invalid(format!(
                        "sql connection {} needs either url or host",
                        connection.id
                    ));
                }
                _ => {}
            }
        }

        // Validate groups
        let mut group_ids = HashSet::new();
        for group in &self.groups {
            if !group_ids.insert(group.id.as_str()) {
                return invalid(format!("Duplicate group id: {}", group.id));
            }
            if group.regions.is_empty() {
                return invalid(format!("group {} has no regions", group.id));
            }
            if group.max_failures == 0 {
                return invalid(format!("group {} max_failures must be greater than 0", group.id));
            }
            if group.health_check_interval_ms == 0 {
                return invalid(format!(
                    "group {} health_check_interval_ms must be greater than 0",
                    group.id
                ));
            }
            for region in &group.regions {
                if !ids.contains(region.connection_id.as_str()) {
                    return invalid(format!(
                        "group {} references unknown connection {}",
                        group.id, region.connection_id
                    ));
                }
            }
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return invalid(format!("Invalid log level: {}", self.logging.level)),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return invalid(format!("Invalid log format: {}", self.logging.format)),
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "sql" => {
                let region = |id: &str, host: &str| {
                    let mut c = ConnectionConfig::new(id, ConnectionKind::Sql);
                    c.description = format!("ERP reporting replica ({})", host);
                    c.system = "postgres".to_string();
                    c.driver = Some("postgres".to_string());
                    c.host = Some(host.to_string());
                    c.port = Some(5432);
                    c.database = Some("erp".to_string());
                    c.username = Some("reader".to_string());
                    c.password = Some("change-me".to_string());
                    c.read_only = true;
                    c
                };
                let mut local = ConnectionConfig::sql("local", "sqlite::memory:");
                local.description = "In-memory scratch database".to_string();
                local.system = "sqlite".to_string();

                Config {
                    connections: vec![
                        local,
                        region("erp-eu", "10.0.1.10"),
                        region("erp-us", "10.0.2.10"),
                    ],
                    groups: vec![example_group("erp", &[("erp-eu", "eu-west", 1), ("erp-us", "us-east", 2)])],
                    ..Default::default()
                }
            }
            "odbc" => {
                let region = |id: &str, host: &str| {
                    let mut c = ConnectionConfig::odbc(id, "informix");
                    c.description = format!("Legacy ERP ({})", host);
                    c.system = "informix".to_string();
                    c.host = Some(host.to_string());
                    c.port = Some(9088);
                    c.database = Some("erp".to_string());
                    c.username = Some("erp".to_string());
                    c.password = Some("change-me".to_string());
                    c.health_query = Some("SELECT 1 FROM systables WHERE tabid = 1".to_string());
                    c
                };
                Config {
                    connections: vec![
                        region("legacy-primary", "10.0.1.20"),
                        region("legacy-dr", "10.0.3.20"),
                    ],
                    groups: vec![example_group(
                        "legacy",
                        &[("legacy-primary", "main", 1), ("legacy-dr", "dr", 2)],
                    )],
                    ..Default::default()
                }
            }
            _ => {
                return Err(ConfigError::ValidationError(
                    "Mode must be 'sql' or 'odbc'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

fn example_group(id: &str, regions: &[(&str, &str, u32)]) -> GroupSettings {
    GroupSettings {
        id: id.to_string(),
        max_failures: default_max_failures(),
        failure_window_ms: default_failure_window_ms(),
        health_check_interval_ms: default_health_check_interval_ms(),
        failback_delay_ms: default_failback_delay_ms(),
        auto_failback: default_auto_failback(),
        regions: regions
            .iter()
            .map(|(connection_id, region, priority)| {
                RegionConfig::new(*connection_id, *region, *priority)
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        config.retry.max_attempts = 3;
        assert!(config.validate().is_ok());

        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_and_dangling_ids() {
        let mut config = Config::default();
        config.connections = vec![
            ConnectionConfig::odbc("erp", "informix"),
            ConnectionConfig::odbc("erp", "informix"),
        ];
        assert!(config.validate().is_err());

        config.connections.pop();
        config.groups = vec![example_group("erp", &[("erp", "eu", 1), ("erp-dr", "us", 2)])];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown connection erp-dr"));
    }

    #[test]
    fn test_fault_injection_blocked_in_production() {
        let mut config = Config::default();
        config.fault_injection.enabled = true;
        assert!(config.validate().is_ok());

        config.environment = "production".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_runtime_conversions() {
        let config = Config::default();

        let retry = config.retry_config();
        assert_eq!(retry, RetryConfig::default());

        let breaker = config.circuit_breaker_config();
        assert_eq!(breaker, CircuitBreakerConfig::default());

        let pool = config.pool_config();
        assert_eq!(pool.drain_timeout, Duration::from_secs(5));
        assert_eq!(pool.health_check_timeout, Duration::from_secs(5));

        assert_eq!(config.fault_injection_config(), FaultInjectionConfig::default());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
    }

    #[test]
    fn test_group_defaults_from_toml() {
        let toml_str = r#"
environment = "test"

[logging]
level = "debug"
format = "json"
stdout = true

[pool]
connect_timeout_ms = 1000
acquire_timeout_ms = 1000
drain_timeout_ms = 500
idle_timeout_ms = 0

[health]
interval_ms = 10000
timeout_ms = 1000

[retry]
max_attempts = 2
initial_delay_ms = 50
max_delay_ms = 500
multiplier = 2.0
jitter_ms = 0

[circuit_breaker]
failure_threshold = 5
success_threshold = 2
timeout_ms = 60000
monitoring_period_ms = 120000
volume_threshold = 10

[fault_injection]
enabled = false
latency_probability = 0.0
min_latency_ms = 0
max_latency_ms = 0
error_probability = 0.0
error_code = "ECONNRESET"
error_message = "injected"

[[connections]]
id = "erp-eu"
kind = "sql"
url = "postgres://reader@10.0.1.10/erp"

[[connections]]
id = "erp-us"
kind = "sql"
url = "postgres://reader@10.0.2.10/erp"

[[groups]]
id = "erp"

[[groups.regions]]
connection_id = "erp-us"
region = "us-east"
priority = 2

[[groups.regions]]
connection_id = "erp-eu"
region = "eu-west"
priority = 1
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.retry.retryable_errors.len(), DEFAULT_RETRYABLE_ERRORS.len());
        let groups = config.connection_groups();
        assert_eq!(groups[0].policy, FailoverPolicy::default());
        assert_eq!(groups[0].regions.len(), 2);
        assert_eq!(config.connections[0].max_pool_size, 10);
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded_config.validate().is_ok());
    }

    #[test]
    fn test_example_configs_validate() {
        for mode in ["sql", "odbc"] {
            let temp_file = NamedTempFile::new().unwrap();
            Config::create_example_config(temp_file.path(), mode).unwrap();
            let loaded = Config::load_from_file(temp_file.path()).unwrap();
            assert!(!loaded.connections.is_empty());
            assert_eq!(loaded.groups.len(), 1);
        }

        let temp_file = NamedTempFile::new().unwrap();
        assert!(Config::create_example_config(temp_file.path(), "oracle").is_err());
    }
}
