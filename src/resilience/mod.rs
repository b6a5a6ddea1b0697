/// Resilience strategies: circuit breaking, retry with backoff, fault injection
pub mod breaker;
pub mod chaos;
pub mod retry;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};
pub use chaos::{FaultInjectionConfig, FaultInjector};
pub use retry::{RetryConfig, RetryPolicy, DEFAULT_RETRYABLE_ERRORS};
