/// Observability hooks consumed by an external metrics/tracing collaborator
///
/// The access layer reports what happens through the [`Observer`] trait. The
/// default [`TracingObserver`] turns every hook into a structured `tracing`
/// event; a metrics exporter can implement the trait to feed its gauges.

use crate::failover::FailoverEvent;
use crate::resilience::breaker::CircuitState;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receiver of query, pool, breaker and failover signals
pub trait Observer: Send + Sync {
    /// A query finished (after every pipeline stage) on a logical connection
    fn on_query(&self, _connection_id: &str, _duration: Duration, _success: bool) {}

    /// Current active/idle connection gauges for a logical connection
    fn on_pool_gauge(&self, _connection_id: &str, _active: usize, _idle: u32) {}

    /// A circuit breaker changed state
    fn on_breaker_transition(&self, _connection_id: &str, _from: CircuitState, _to: CircuitState) {}

    /// Failover, failback, all-regions-failed or health change
    fn on_failover_event(&self, _event: &FailoverEvent) {}
}

/// Observer that logs every signal through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_query(&self, connection_id: &str, duration: Duration, success: bool) {
        debug!(
            connection_id,
            duration_ms = duration.as_millis() as u64,
            success,
            "query finished"
        );
    }

    fn on_pool_gauge(&self, connection_id: &str, active: usize, idle: u32) {
        debug!(connection_id, active, idle, "pool gauge");
    }

    fn on_breaker_transition(&self, connection_id: &str, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(connection_id, %from, %to, "circuit breaker transition"),
            _ => info!(connection_id, %from, %to, "circuit breaker transition"),
        }
    }

    fn on_failover_event(&self, event: &FailoverEvent) {
        match event {
            FailoverEvent::AllRegionsFailed { .. } => warn!(?event, "failover event"),
            _ => info!(?event, "failover event"),
        }
    }
}

/// Everything an observer can be told, as a value
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Query {
        connection_id: String,
        success: bool,
    },
    PoolGauge {
        connection_id: String,
        active: usize,
        idle: u32,
    },
    BreakerTransition {
        connection_id: String,
        from: CircuitState,
        to: CircuitState,
    },
    Failover(FailoverEvent),
}

/// Observer that keeps every signal in memory, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<TelemetryEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: TelemetryEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event);
    }

    /// Snapshot of recorded events in arrival order
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn breaker_transitions(&self, connection_id: &str) -> Vec<(CircuitState, CircuitState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TelemetryEvent::BreakerTransition {
                    connection_id: id,
                    from,
                    to,
                } if id == connection_id => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn failover_events(&self) -> Vec<FailoverEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TelemetryEvent::Failover(event) => Some(event),
                _ => None,
            })
            .collect()
    }
}

impl Observer for RecordingObserver {
    fn on_query(&self, connection_id: &str, _duration: Duration, success: bool) {
        self.push(TelemetryEvent::Query {
            connection_id: connection_id.to_string(),
            success,
        });
    }

    fn on_pool_gauge(&self, connection_id: &str, active: usize, idle: u32) {
        self.push(TelemetryEvent::PoolGauge {
            connection_id: connection_id.to_string(),
            active,
            idle,
        });
    }

    fn on_breaker_transition(&self, connection_id: &str, from: CircuitState, to: CircuitState) {
        self.push(TelemetryEvent::BreakerTransition {
            connection_id: connection_id.to_string(),
            from,
            to,
        });
    }

    fn on_failover_event(&self, event: &FailoverEvent) {
        self.push(TelemetryEvent::Failover(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_filters_by_connection() {
        let observer = RecordingObserver::new();
        observer.on_breaker_transition("erp-eu", CircuitState::Closed, CircuitState::Open);
        observer.on_breaker_transition("erp-us", CircuitState::Closed, CircuitState::Open);
        observer.on_query("erp-eu", Duration::from_millis(3), true);

        assert_eq!(
            observer.breaker_transitions("erp-eu"),
            vec![(CircuitState::Closed, CircuitState::Open)]
        );
        assert_eq!(observer.events().len(), 3);
    }

    #[test]
    fn test_tracing_observer_accepts_every_hook() {
        let observer = TracingObserver;
        observer.on_query("erp", Duration::from_millis(1), false);
        observer.on_pool_gauge("erp", 1, 0);
        observer.on_breaker_transition("erp", CircuitState::Open, CircuitState::HalfOpen);
        observer.on_failover_event(&FailoverEvent::HealthChanged {
            connection_id: "erp".to_string(),
            healthy: true,
        });
    }
}
