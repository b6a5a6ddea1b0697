/// Circuit breaker per logical connection
///
/// CLOSED lets calls through and trips to OPEN once enough traffic has been
/// seen and enough failures sit inside the monitoring window. OPEN rejects
/// calls until the timeout elapses, then lets one call through as HALF_OPEN.
/// HALF_OPEN closes again after enough consecutive successes and reopens on
/// any failure.

use crate::error::{PuenteError, PuenteResult};
use crate::telemetry::Observer;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures inside the monitoring window needed to trip
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
    /// Time spent OPEN before a trial call is let through
    pub timeout: Duration,
    /// Width of the failure sliding window
    pub monitoring_period: Duration,
    /// Minimum request volume before the breaker may trip
    pub volume_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(120),
            volume_threshold: 10,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    consecutive_successes: u32,
    consecutive_failures: u32,
    failures: VecDeque<Instant>,
    opened_at: Option<(Instant, SystemTime)>,
    /// Trial calls currently running while HALF_OPEN
    trials: u32,
    /// Bumped on every OPEN -> HALF_OPEN; a trial from an older epoch is not counted
    trial_epoch: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            failures: VecDeque::new(),
            opened_at: None,
            trials: 0,
            trial_epoch: 0,
        }
    }

    /// Fresh counters, keeping the trial epoch
    fn clear(&mut self) {
        let trial_epoch = self.trial_epoch;
        *self = Self::new();
        self.trial_epoch = trial_epoch;
    }

    fn release_trial(&mut self, trial: Option<u64>) {
        if trial == Some(self.trial_epoch) {
            self.trials = self.trials.saturating_sub(1);
        }
    }

    fn prune(&mut self, now: Instant, period: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) >= period {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn trip(&mut self, now: Instant) -> CircuitState {
        let from = self.state;
        self.state = CircuitState::Open;
        self.opened_at = Some((now, SystemTime::now()));
        self.consecutive_successes = 0;
        from
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub connection_id: String,
    pub state: CircuitState,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub window_failures: usize,
    pub opened_at: Option<SystemTime>,
}

pub struct CircuitBreaker {
    connection_id: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    observer: Arc<dyn Observer>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("connection_id", &self.connection_id)
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        connection_id: impl Into<String>,
        config: CircuitBreakerConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            observer,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Run `operation` if the breaker admits it and record the outcome
    pub async fn execute<F, Fut, T>(&self, operation: F) -> PuenteResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PuenteResult<T>>,
    {
        let trial = self.admit().await?;

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(trial).await,
            Err(e) => self.on_failure(e, trial).await,
        }
        result
    }

    /// Admit one call; HALF_OPEN admits at most `success_threshold` concurrent trial calls
    async fn admit(&self) -> PuenteResult<Option<u64>> {
        let (transition, trial) = {
            let mut inner = self.state.lock().await;
            let mut transition = None;

            if inner.state == CircuitState::Open {
                let now = Instant::now();
                let (opened, opened_wall) = inner
                    .opened_at
                    .unwrap_or((now, SystemTime::now()));
                let elapsed = now.duration_since(opened);
                if elapsed < self.config.timeout {
                    return Err(PuenteError::CircuitOpen {
                        connection_id: self.connection_id.clone(),
                        state: CircuitState::Open,
                        opened_at: opened_wall,
                        remaining: self.config.timeout - elapsed,
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.trials = 0;
                inner.trial_epoch += 1;
                transition = Some((CircuitState::Open, CircuitState::HalfOpen));
            }

            let trial = if inner.state == CircuitState::HalfOpen {
                if inner.trials >= self.config.success_threshold.max(1) {
                    return Err(PuenteError::CircuitOpen {
                        connection_id: self.connection_id.clone(),
                        state: CircuitState::HalfOpen,
                        opened_at: inner
                            .opened_at
                            .map_or_else(SystemTime::now, |(_, wall)| wall),
                        remaining: Duration::ZERO,
                    });
                }
                inner.trials += 1;
                Some(inner.trial_epoch)
            } else {
                None
            };

            inner.total_requests += 1;
            (transition, trial)
        };

        if let Some((from, to)) = transition {
            self.report(from, to);
        }
        Ok(trial)
    }

    async fn on_success(&self, trial: Option<u64>) {
        let transition = {
            let mut inner = self.state.lock().await;
            inner.release_trial(trial);
            inner.total_successes += 1;
            inner.consecutive_failures = 0;

            match inner.state {
                CircuitState::HalfOpen => {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        inner.clear();
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                _ => {
                    inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
                    None
                }
            }
        };

        if let Some((from, to)) = transition {
            self.report(from, to);
        }
    }

    async fn on_failure(&self, error: &PuenteError, trial: Option<u64>) {
        let transition = {
            let mut inner = self.state.lock().await;
            inner.release_trial(trial);
            let now = Instant::now();
            inner.total_failures += 1;
            inner.consecutive_failures += 1;
            inner.consecutive_successes = 0;
            inner.failures.push_back(now);
            inner.prune(now, self.config.monitoring_period);

            debug!(
                connection_id = %self.connection_id,
                state = %inner.state,
                window_failures = inner.failures.len(),
                error = %error,
                "breaker recorded failure"
            );

            match inner.state {
                CircuitState::Closed
                    if inner.total_requests >= u64::from(self.config.volume_threshold)
                        && inner.failures.len() >= self.config.failure_threshold as usize =>
                {
                    Some((inner.trip(now), CircuitState::Open))
                }
                CircuitState::HalfOpen => Some((inner.trip(now), CircuitState::Open)),
                _ => None,
            }
        };

        if let Some((from, to)) = transition {
            self.report(from, to);
        }
    }

    fn report(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => {
                warn!(connection_id = %self.connection_id, %from, %to, "circuit breaker opened")
            }
            _ => info!(connection_id = %self.connection_id, %from, %to, "circuit breaker state changed"),
        }
        self.observer.on_breaker_transition(&self.connection_id, from, to);
    }

    /// Trip the breaker regardless of traffic
    pub async fn force_open(&self) {
        let from = {
            let mut inner = self.state.lock().await;
            inner.trip(Instant::now())
        };
        if from != CircuitState::Open {
            self.report(from, CircuitState::Open);
        }
    }

    /// Close the breaker and forget the failure window
    pub async fn force_close(&self) {
        let from = {
            let mut inner = self.state.lock().await;
            let from = inner.state;
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.failures.clear();
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            from
        };
        if from != CircuitState::Closed {
            self.report(from, CircuitState::Closed);
        }
    }

    /// Back to a freshly created breaker
    pub async fn reset(&self) {
        let from = {
            let mut inner = self.state.lock().await;
            let from = inner.state;
            inner.clear();
            from
        };
        if from != CircuitState::Closed {
            self.report(from, CircuitState::Closed);
        }
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.state.lock().await;
        inner.prune(Instant::now(), self.config.monitoring_period);
        CircuitBreakerStats {
            connection_id: self.connection_id.clone(),
            state: inner.state,
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            consecutive_successes: inner.consecutive_successes,
            consecutive_failures: inner.consecutive_failures,
            window_failures: inner.failures.len(),
            opened_at: inner.opened_at.map(|(_, wall)| wall),
        }
    }
}

/// Lazily created breakers keyed by logical connection id
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    observer: Arc<dyn Observer>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, observer: Arc<dyn Observer>) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            observer,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker for `connection_id`, created on first use
    pub async fn breaker(&self, connection_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(connection_id) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(connection_id.to_string()).or_insert_with(|| {
            debug!(connection_id, "creating circuit breaker");
            Arc::new(CircuitBreaker::new(
                connection_id,
                self.config.clone(),
                Arc::clone(&self.observer),
            ))
        });
        Arc::clone(breaker)
    }

    /// Existing breaker, without creating one
    pub async fn get(&self, connection_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(connection_id).cloned()
    }

    pub async fn states(&self) -> HashMap<String, CircuitState> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();

        let mut states = HashMap::with_capacity(breakers.len());
        for breaker in breakers {
            states.insert(breaker.connection_id().to_string(), breaker.state().await);
        }
        states
    }

    pub async fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();

        let mut stats = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            stats.push(breaker.stats().await);
        }
        stats.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RecordingObserver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker_with(observer: Arc<RecordingObserver>) -> CircuitBreaker {
        CircuitBreaker::new("erp", CircuitBreakerConfig::default(), observer)
    }

    async fn fail(breaker: &CircuitBreaker) -> PuenteError {
        breaker
            .execute(|| async {
                Err::<(), _>(PuenteError::backend("erp", Some("ECONNRESET"), "reset"))
            })
            .await
            .unwrap_err()
    }

    async fn succeed(breaker: &CircuitBreaker) {
        breaker.execute(|| async { Ok(()) }).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_threshold_gates_tripping() {
        let breaker = breaker_with(Arc::new(RecordingObserver::new()));

        for _ in 0..9 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_volume_and_window_failures() {
        let observer = Arc::new(RecordingObserver::new());
        let breaker = breaker_with(Arc::clone(&observer));

        for _ in 0..5 {
            succeed(&breaker).await;
        }
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);

        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert_eq!(
            observer.breaker_transitions("erp"),
            vec![(CircuitState::Closed, CircuitState::Open)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let breaker = breaker_with(Arc::new(RecordingObserver::new()));

        for _ in 0..6 {
            succeed(&breaker).await;
        }
        for _ in 0..4 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(121)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.stats().await.window_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking() {
        let breaker = breaker_with(Arc::new(RecordingObserver::new()));
        breaker.force_open().await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let calls = AtomicUsize::new(0);
        let err = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match err {
            PuenteError::CircuitOpen {
                connection_id,
                state,
                remaining,
                ..
            } => {
                assert_eq!(connection_id, "erp");
                assert_eq!(state, CircuitState::Open);
                assert_eq!(remaining, Duration::from_secs(50));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_then_closed_with_counters_reset() {
        let observer = Arc::new(RecordingObserver::new());
        let breaker = breaker_with(Arc::clone(&observer));
        for _ in 0..10 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(60)).await;

        succeed(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);

        let stats = breaker.stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.total_failures, 0);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.window_failures, 0);
        assert!(stats.opened_at.is_none());

        assert_eq!(
            observer.breaker_transitions("erp"),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker_with(Arc::new(RecordingObserver::new()));
        breaker.force_open().await;
        tokio::time::advance(Duration::from_secs(61)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        let err = fail(&breaker).await;
        assert!(matches!(err, PuenteError::CircuitOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_limited_trial_calls() {
        let observer = Arc::new(RecordingObserver::new());
        let breaker = Arc::new(breaker_with(Arc::clone(&observer)));
        breaker.force_open().await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    breaker
                        .execute(|| async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok(())
                        })
                        .await
                })
            })
            .collect();
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => {}
                Err(PuenteError::CircuitOpen { state, .. }) => {
                    assert_eq!(state, CircuitState::HalfOpen);
                    rejected += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        // success_threshold (2) trial calls ran, both succeeded and closed the breaker
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rejected, 6);
        assert_eq!(breaker.state().await, CircuitState::Closed);

        let half_open = observer
            .breaker_transitions("erp")
            .into_iter()
            .filter(|(_, to)| *to == CircuitState::HalfOpen)
            .count();
        assert_eq!(half_open, 1);
    }

    #[tokio::test]
    async fn test_force_close_and_reset() {
        let breaker = breaker_with(Arc::new(RecordingObserver::new()));
        breaker.force_open().await;
        breaker.force_close().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        succeed(&breaker).await;

        breaker.force_open().await;
        breaker.reset().await;
        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_requests, 0);
    }

    #[tokio::test]
    async fn test_registry_creates_lazily_and_reuses() {
        let registry =
            CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), Arc::new(RecordingObserver::new()));
        assert!(registry.get("erp").await.is_none());

        let first = registry.breaker("erp").await;
        let second = registry.breaker("erp").await;
        assert!(Arc::ptr_eq(&first, &second));

        first.force_open().await;
        registry.breaker("crm").await;
        let states = registry.states().await;
        assert_eq!(states.get("erp"), Some(&CircuitState::Open));
        assert_eq!(states.get("crm"), Some(&CircuitState::Closed));
        assert_eq!(registry.stats().await.len(), 2);
    }

    #[test]
    fn test_state_serializes_like_display() {
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"HALF_OPEN\""
        );
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }
}
