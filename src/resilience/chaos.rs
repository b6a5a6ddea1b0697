/// Fault injection for resilience testing
///
/// Disabled unless explicitly enabled, and refused outright outside the
/// `test` and `development` environments.

use crate::error::{PuenteError, PuenteResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Environments in which faults may be injected
pub const FAULT_INJECTION_ENVIRONMENTS: &[&str] = &["test", "development"];

#[derive(Debug, Clone, PartialEq)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    /// Probability in [0, 1] that a call is delayed
    pub latency_probability: f64,
    pub min_latency: Duration,
    pub max_latency: Duration,
    /// Probability in [0, 1] that a call fails
    pub error_probability: f64,
    pub error_code: String,
    pub error_message: String,
    /// Connection ids affected; empty means every connection
    pub targets: Vec<String>,
    /// Fixed seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            latency_probability: 0.0,
            min_latency: Duration::from_millis(100),
            max_latency: Duration::from_millis(1000),
            error_probability: 0.0,
            error_code: "ECONNRESET".to_string(),
            error_message: "injected fault: connection reset".to_string(),
            targets: Vec::new(),
            seed: None,
        }
    }
}

#[derive(Debug)]
pub struct FaultInjector {
    config: FaultInjectionConfig,
    active: bool,
    rng: Mutex<StdRng>,
}

/// What one call will suffer, decided up front
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fault {
    latency: Option<Duration>,
    error: bool,
}

impl FaultInjector {
    pub fn new(config: FaultInjectionConfig, environment: &str) -> Self {
        let allowed = FAULT_INJECTION_ENVIRONMENTS
            .iter()
            .any(|env| env.eq_ignore_ascii_case(environment));
        if config.enabled && !allowed {
            warn!(environment, "fault injection requested outside test environments, keeping it off");
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            active: config.enabled && allowed,
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn disabled() -> Self {
        Self::new(FaultInjectionConfig::default(), "production")
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn config(&self) -> &FaultInjectionConfig {
        &self.config
    }

    pub fn applies_to(&self, connection_id: &str) -> bool {
        self.active
            && (self.config.targets.is_empty()
                || self.config.targets.iter().any(|t| t == connection_id))
    }

    fn draw(&self) -> Fault {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());

        let latency = if rng.gen_bool(self.config.latency_probability.clamp(0.0, 1.0)) {
            let min = self.config.min_latency.as_millis() as u64;
            let max = (self.config.max_latency.as_millis() as u64).max(min);
            Some(Duration::from_millis(rng.gen_range(min..=max)))
        } else {
            None
        };
        let error = rng.gen_bool(self.config.error_probability.clamp(0.0, 1.0));

        Fault { latency, error }
    }

    /// Maybe delay and maybe fail the call about to reach `connection_id`
    pub async fn inject(&self, connection_id: &str) -> PuenteResult<()> {
        if !self.applies_to(connection_id) {
            return Ok(());
        }

        let fault = self.draw();
        if let Some(latency) = fault.latency {
            debug!(connection_id, latency_ms = latency.as_millis() as u64, "injecting latency");
            tokio::time::sleep(latency).await;
        }
        if fault.error {
            debug!(connection_id, code = %self.config.error_code, "injecting error");
            return Err(PuenteError::backend(
                connection_id,
                Some(self.config.error_code.as_str()),
                self.config.error_message.clone(),
            ));
        }
        Ok(())
    }
}
