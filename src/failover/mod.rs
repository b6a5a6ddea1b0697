/// Multi-region failover with automatic failback
///
/// A group lists the logical connections serving the same data in different
/// regions, ordered by priority. Failures are counted per connection inside a
/// rolling window; once the active region reaches the threshold the group
/// switches to the next healthy region and the failed one is polled until it
/// recovers. A recovered region of higher priority takes the group back after
/// the failback delay.
pub mod counter;

pub use counter::{FailureCounter, FailureRecord, MAX_ERROR_RECORDS};

use crate::error::{PuenteError, PuenteResult};
use crate::health::HealthCheckManager;
use crate::telemetry::Observer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One region of a connection group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub connection_id: String,
    pub region: String,
    /// Lower is preferred
    pub priority: u32,
}

impl RegionConfig {
    pub fn new(connection_id: impl Into<String>, region: impl Into<String>, priority: u32) -> Self {
        Self {
            connection_id: connection_id.into(),
            region: region.into(),
            priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailoverPolicy {
    pub max_failures: u32,
    pub failure_window: Duration,
    pub health_check_interval: Duration,
    pub failback_delay: Duration,
    pub auto_failback: bool,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            max_failures: 3,
            failure_window: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            failback_delay: Duration::from_secs(60),
            auto_failback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionGroup {
    pub id: String,
    pub regions: Vec<RegionConfig>,
    pub policy: FailoverPolicy,
}

impl ConnectionGroup {
    pub fn new(id: impl Into<String>, regions: Vec<RegionConfig>, policy: FailoverPolicy) -> Self {
        Self {
            id: id.into(),
            regions,
            policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailoverEvent {
    Failover {
        group_id: String,
        from: String,
        to: String,
    },
    Failback {
        group_id: String,
        from: String,
        to: String,
    },
    AllRegionsFailed {
        group_id: String,
        connection_id: String,
    },
    HealthChanged {
        connection_id: String,
        healthy: bool,
    },
}

/// What a recorded failure led to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverDecision {
    Recorded { count: u32 },
    FailedOver { from: String, to: String },
    NoHealthyRegion,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionStatus {
    pub connection_id: String,
    pub region: String,
    pub priority: u32,
    pub failures: u32,
    pub active: bool,
    pub polling: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group_id: String,
    pub current: String,
    pub regions: Vec<RegionStatus>,
}

#[derive(Debug)]
struct GroupState {
    group: ConnectionGroup,
    current: String,
}

impl GroupState {
    fn priority_of(&self, connection_id: &str) -> Option<u32> {
        self.group
            .regions
            .iter()
            .find(|r| r.connection_id == connection_id)
            .map(|r| r.priority)
    }
}

struct Shared {
    // lock order: groups before counters
    groups: RwLock<HashMap<String, GroupState>>,
    counters: RwLock<HashMap<String, FailureCounter>>,
    polls: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    health: HealthCheckManager,
    observer: Arc<dyn Observer>,
    events: broadcast::Sender<FailoverEvent>,
}

#[derive(Clone)]
pub struct FailoverRegistry {
    shared: Arc<Shared>,
}

impl FailoverRegistry {
    pub fn new(health: HealthCheckManager, observer: Arc<dyn Observer>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                groups: RwLock::new(HashMap::new()),
                counters: RwLock::new(HashMap::new()),
                polls: std::sync::Mutex::new(HashMap::new()),
                health,
                observer,
                events,
            }),
        }
    }

    /// Register a group; regions are ordered by priority once, here
    pub async fn register(&self, mut group: ConnectionGroup) -> PuenteResult<()> {
        if group.regions.is_empty() {
            return Err(PuenteError::validation(format!(
                "connection group {} has no regions",
                group.id
            )));
        }
        group.regions.sort_by_key(|r| r.priority);
        let current = group.regions[0].connection_id.clone();

        info!(
            group_id = %group.id,
            current = %current,
            regions = group.regions.len(),
            "registered connection group"
        );
        let mut groups = self.shared.groups.write().await;
        if groups.contains_key(&group.id) {
            warn!(group_id = %group.id, "replacing existing connection group");
        }
        groups.insert(group.id.clone(), GroupState { group, current });
        Ok(())
    }

    pub async fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.groups.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Active region's logical connection id
    pub async fn current_connection(&self, group_id: &str) -> PuenteResult<String> {
        self.shared
            .groups
            .read()
            .await
            .get(group_id)
            .map(|state| state.current.clone())
            .ok_or_else(|| PuenteError::GroupNotFound {
                group_id: group_id.to_string(),
            })
    }

    pub async fn failure_count(&self, connection_id: &str) -> u32 {
        self.shared
            .counters
            .read()
            .await
            .get(connection_id)
            .map_or(0, FailureCounter::count)
    }

    pub async fn record_failure(
        &self,
        group_id: &str,
        connection_id: &str,
        error: &PuenteError,
    ) -> PuenteResult<FailoverDecision> {
        let (decision, policy) = {
            let mut groups = self.shared.groups.write().await;
            let state = groups
                .get_mut(group_id)
                .ok_or_else(|| PuenteError::GroupNotFound {
                    group_id: group_id.to_string(),
                })?;
            let policy = state.group.policy.clone();

            let mut counters = self.shared.counters.write().await;
            let now = Instant::now();
            let count = counters
                .entry(connection_id.to_string())
                .or_insert_with(|| FailureCounter::new(now))
                .record(now, error, policy.failure_window);

            debug!(group_id, connection_id, count, max_failures = policy.max_failures, "recorded region failure");

            if count < policy.max_failures || state.current != connection_id {
                return Ok(FailoverDecision::Recorded { count });
            }

            let failing_at = state
                .group
                .regions
                .iter()
                .position(|r| r.connection_id == connection_id)
                .unwrap_or(state.group.regions.len());
            let next = state
                .group
                .regions
                .iter()
                .skip(failing_at + 1)
                .find(|r| {
                    counters
                        .get(&r.connection_id)
                        .map_or(true, |c| c.count() < policy.max_failures)
                })
                .map(|r| r.connection_id.clone());

            let decision = match next {
                Some(to) => {
                    state.current = to.clone();
                    FailoverDecision::FailedOver {
                        from: connection_id.to_string(),
                        to,
                    }
                }
                None => FailoverDecision::NoHealthyRegion,
            };
            (decision, policy)
        };

        match &decision {
            FailoverDecision::FailedOver { from, to } => {
                warn!(group_id, from = %from, to = %to, "failing over to next region");
                self.emit(FailoverEvent::Failover {
                    group_id: group_id.to_string(),
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            FailoverDecision::NoHealthyRegion => {
                warn!(group_id, connection_id, "no healthy region left");
                self.emit(FailoverEvent::AllRegionsFailed {
                    group_id: group_id.to_string(),
                    connection_id: connection_id.to_string(),
                });
            }
            FailoverDecision::Recorded { .. } => {}
        }

        self.start_health_poll(group_id, connection_id, &policy);
        Ok(decision)
    }

    /// One success offsets one failure; the counter never drops below zero
    pub async fn record_success(&self, connection_id: &str) -> u32 {
        let mut counters = self.shared.counters.write().await;
        counters
            .get_mut(connection_id)
            .map_or(0, FailureCounter::decrement)
    }

    fn start_health_poll(&self, group_id: &str, connection_id: &str, policy: &FailoverPolicy) {
        let mut polls = self.shared.polls.lock().unwrap_or_else(|e| e.into_inner());
        if polls
            .get(connection_id)
            .map_or(false, |handle| !handle.is_finished())
        {
            return;
        }

        debug!(
            group_id,
            connection_id,
            interval_ms = policy.health_check_interval.as_millis() as u64,
            "starting health poll"
        );
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let group_id = group_id.to_string();
        let id = connection_id.to_string();
        let period = policy.health_check_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let registry = FailoverRegistry { shared };
                if registry.poll_once(&group_id, &id).await {
                    break;
                }
            }
        });
        polls.insert(connection_id.to_string(), handle);
    }

    /// Check a failed region once; true when it recovered and polling stops
    async fn poll_once(&self, group_id: &str, connection_id: &str) -> bool {
        let status = self.shared.health.check(connection_id).await;
        if !status.is_healthy() {
            debug!(group_id, connection_id, status = %status, "region still unhealthy");
            return false;
        }

        self.shared.counters.write().await.remove(connection_id);
        self.shared
            .polls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection_id);
        info!(group_id, connection_id, "region recovered");
        self.emit(FailoverEvent::HealthChanged {
            connection_id: connection_id.to_string(),
            healthy: true,
        });

        self.maybe_failback(group_id, connection_id).await;
        true
    }

    fn outranks_current(state: &GroupState, connection_id: &str) -> bool {
        match (state.priority_of(connection_id), state.priority_of(&state.current)) {
            (Some(recovered), Some(current)) => recovered < current,
            _ => false,
        }
    }

    async fn maybe_failback(&self, group_id: &str, connection_id: &str) {
        let delay = {
            let groups = self.shared.groups.read().await;
            let Some(state) = groups.get(group_id) else {
                return;
            };
            if !state.group.policy.auto_failback || !Self::outranks_current(state, connection_id) {
                return;
            }
            state.group.policy.failback_delay
        };

        debug!(group_id, connection_id, delay_ms = delay.as_millis() as u64, "waiting before failback");
        tokio::time::sleep(delay).await;

        if !self.shared.health.check(connection_id).await.is_healthy() {
            warn!(group_id, connection_id, "region unhealthy again, failback cancelled");
            return;
        }

        let from = {
            let mut groups = self.shared.groups.write().await;
            let Some(state) = groups.get_mut(group_id) else {
                return;
            };
            if !Self::outranks_current(state, connection_id) {
                return;
            }
            std::mem::replace(&mut state.current, connection_id.to_string())
        };

        info!(group_id, from = %from, to = connection_id, "failing back to preferred region");
        self.emit(FailoverEvent::Failback {
            group_id: group_id.to_string(),
            from,
            to: connection_id.to_string(),
        });
    }

    fn emit(&self, event: FailoverEvent) {
        self.shared.observer.on_failover_event(&event);
        // no subscribers is fine
        let _ = self.shared.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.shared.events.subscribe()
    }

    /// Connection ids currently being polled
    pub fn active_polls(&self) -> Vec<String> {
        let polls = self.shared.polls.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = polls
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn group_status(&self, group_id: &str) -> PuenteResult<GroupStatus> {
        let polling = self.active_polls();
        let groups = self.shared.groups.read().await;
        let state = groups
            .get(group_id)
            .ok_or_else(|| PuenteError::GroupNotFound {
                group_id: group_id.to_string(),
            })?;
        let counters = self.shared.counters.read().await;

        Ok(GroupStatus {
            group_id: group_id.to_string(),
            current: state.current.clone(),
            regions: state
                .group
                .regions
                .iter()
                .map(|r| RegionStatus {
                    connection_id: r.connection_id.clone(),
                    region: r.region.clone(),
                    priority: r.priority,
                    failures: counters.get(&r.connection_id).map_or(0, FailureCounter::count),
                    active: r.connection_id == state.current,
                    polling: polling.contains(&r.connection_id),
                })
                .collect(),
        })
    }

    /// Abort every health poll
    pub fn shutdown(&self) {
        let mut polls = self.shared.polls.lock().unwrap_or_else(|e| e.into_inner());
        for (connection_id, handle) in polls.drain() {
            debug!(connection_id = %connection_id, "aborting health poll");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthChecker, HealthStatus};
    use crate::telemetry::RecordingObserver;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Health checker answering from a mutable table; unknown ids are unhealthy
    #[derive(Default)]
    struct Scripted {
        healthy: Mutex<HashMap<String, bool>>,
    }

    impl Scripted {
        fn set(&self, connection_id: &str, healthy: bool) {
            self.healthy
                .lock()
                .unwrap()
                .insert(connection_id.to_string(), healthy);
        }
    }

    #[async_trait]
    impl HealthChecker for Scripted {
        async fn check_health(&self, connection_id: &str) -> HealthStatus {
            if *self.healthy.lock().unwrap().get(connection_id).unwrap_or(&false) {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy {
                    reason: "scripted".to_string(),
                }
            }
        }

        fn check_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    fn regions() -> Vec<RegionConfig> {
        vec![
            RegionConfig::new("tertiary", "ap", 3),
            RegionConfig::new("primary", "eu", 1),
            RegionConfig::new("secondary", "us", 2),
        ]
    }

    async fn registry() -> (FailoverRegistry, Arc<Scripted>, Arc<RecordingObserver>) {
        let checker = Arc::new(Scripted::default());
        let observer = Arc::new(RecordingObserver::new());
        let registry = FailoverRegistry::new(
            HealthCheckManager::new(checker.clone()),
            observer.clone(),
        );
        registry
            .register(ConnectionGroup::new("erp", regions(), FailoverPolicy::default()))
            .await
            .unwrap();
        (registry, checker, observer)
    }

    fn link_failure(id: &str) -> PuenteError {
        PuenteError::backend(id, Some("08S01"), "Communication link failure")
    }

    async fn fail(registry: &FailoverRegistry, id: &str, times: usize) -> Vec<FailoverDecision> {
        let mut decisions = Vec::new();
        for _ in 0..times {
            decisions.push(
                registry
                    .record_failure("erp", id, &link_failure(id))
                    .await
                    .unwrap(),
            );
        }
        decisions
    }

    #[tokio::test]
    async fn test_register_sorts_by_priority() {
        let (registry, _, _) = registry().await;
        assert_eq!(registry.current_connection("erp").await.unwrap(), "primary");

        let status = registry.group_status("erp").await.unwrap();
        let order: Vec<&str> = status.regions.iter().map(|r| r.connection_id.as_str()).collect();
        assert_eq!(order, vec!["primary", "secondary", "tertiary"]);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let (registry, _, _) = registry().await;
        assert!(matches!(
            registry.current_connection("crm").await,
            Err(PuenteError::GroupNotFound { .. })
        ));
        assert!(registry
            .record_failure("crm", "primary", &link_failure("primary"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_empty_group_rejected() {
        let (registry, _, _) = registry().await;
        let err = registry
            .register(ConnectionGroup::new("empty", Vec::new(), FailoverPolicy::default()))
            .await
            .unwrap_err();
        assert!(err.is_domain());
    }

    #[tokio::test]
    async fn test_fails_over_down_the_priority_list() {
        let (registry, _, observer) = registry().await;

        let decisions = fail(&registry, "primary", 4).await;
        assert_eq!(decisions[1], FailoverDecision::Recorded { count: 2 });
        assert_eq!(
            decisions[2],
            FailoverDecision::FailedOver {
                from: "primary".to_string(),
                to: "secondary".to_string(),
            }
        );
        assert_eq!(decisions[3], FailoverDecision::Recorded { count: 4 });
        assert_eq!(registry.current_connection("erp").await.unwrap(), "secondary");

        fail(&registry, "secondary", 4).await;
        assert_eq!(registry.current_connection("erp").await.unwrap(), "tertiary");

        assert_eq!(
            observer.failover_events(),
            vec![
                FailoverEvent::Failover {
                    group_id: "erp".to_string(),
                    from: "primary".to_string(),
                    to: "secondary".to_string(),
                },
                FailoverEvent::Failover {
                    group_id: "erp".to_string(),
                    from: "secondary".to_string(),
                    to: "tertiary".to_string(),
                },
            ]
        );
        assert_eq!(registry.active_polls(), vec!["primary", "secondary"]);
        registry.shutdown();
        assert!(registry.active_polls().is_empty());
    }

    #[tokio::test]
    async fn test_success_decrements_with_floor() {
        let (registry, _, _) = registry().await;
        fail(&registry, "primary", 2).await;

        assert_eq!(registry.record_success("primary").await, 1);
        assert_eq!(registry.record_success("primary").await, 0);
        assert_eq!(registry.record_success("primary").await, 0);
        assert_eq!(registry.record_success("never-failed").await, 0);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_failures_on_standby_region_do_not_switch() {
        let (registry, _, _) = registry().await;
        let decisions = fail(&registry, "secondary", 3).await;

        assert_eq!(decisions[2], FailoverDecision::Recorded { count: 3 });
        assert_eq!(registry.current_connection("erp").await.unwrap(), "primary");

        // secondary is over threshold, so primary going down skips it
        fail(&registry, "primary", 3).await;
        assert_eq!(registry.current_connection("erp").await.unwrap(), "tertiary");
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_all_regions_failed() {
        let (registry, _, observer) = registry().await;
        fail(&registry, "primary", 3).await;
        fail(&registry, "secondary", 3).await;

        let decisions = fail(&registry, "tertiary", 3).await;
        assert_eq!(decisions[2], FailoverDecision::NoHealthyRegion);
        assert_eq!(registry.current_connection("erp").await.unwrap(), "tertiary");
        assert!(observer
            .failover_events()
            .contains(&FailoverEvent::AllRegionsFailed {
                group_id: "erp".to_string(),
                connection_id: "tertiary".to_string(),
            }));
        registry.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_window_restarts() {
        let (registry, _, _) = registry().await;
        fail(&registry, "primary", 2).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let decisions = fail(&registry, "primary", 1).await;
        assert_eq!(decisions[0], FailoverDecision::Recorded { count: 1 });
        assert_eq!(registry.current_connection("erp").await.unwrap(), "primary");
        registry.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_and_failback() {
        let (registry, checker, _) = registry().await;
        let mut events = registry.subscribe();

        fail(&registry, "primary", 3).await;
        assert!(matches!(events.recv().await.unwrap(), FailoverEvent::Failover { .. }));

        // first poll finds primary still down
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.failure_count("primary").await, 3);

        checker.set("primary", true);
        assert_eq!(
            events.recv().await.unwrap(),
            FailoverEvent::HealthChanged {
                connection_id: "primary".to_string(),
                healthy: true,
            }
        );
        assert_eq!(registry.failure_count("primary").await, 0);
        assert_eq!(registry.current_connection("erp").await.unwrap(), "secondary");

        let started = Instant::now();
        assert_eq!(
            events.recv().await.unwrap(),
            FailoverEvent::Failback {
                group_id: "erp".to_string(),
                from: "secondary".to_string(),
                to: "primary".to_string(),
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(registry.current_connection("erp").await.unwrap(), "primary");
        assert!(registry.active_polls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_failback_when_disabled() {
        let checker = Arc::new(Scripted::default());
        let registry = FailoverRegistry::new(
            HealthCheckManager::new(checker.clone()),
            Arc::new(RecordingObserver::new()),
        );
        let policy = FailoverPolicy {
            auto_failback: false,
            ..FailoverPolicy::default()
        };
        registry
            .register(ConnectionGroup::new("erp", regions(), policy))
            .await
            .unwrap();
        let mut events = registry.subscribe();

        fail(&registry, "primary", 3).await;
        events.recv().await.unwrap();
        checker.set("primary", true);
        assert!(matches!(
            events.recv().await.unwrap(),
            FailoverEvent::HealthChanged { .. }
        ));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(registry.current_connection("erp").await.unwrap(), "secondary");
    }
}
