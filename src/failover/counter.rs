/// Rolling failure bookkeeping per logical connection
use crate::error::PuenteError;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Most recent error records kept per connection
pub const MAX_ERROR_RECORDS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub at: SystemTime,
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct FailureCounter {
    count: u32,
    first_failure: Instant,
    last_failure: Instant,
    errors: VecDeque<FailureRecord>,
}

impl FailureCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0,
            first_failure: now,
            last_failure: now,
            errors: VecDeque::with_capacity(MAX_ERROR_RECORDS),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn first_failure(&self) -> Instant {
        self.first_failure
    }

    pub fn last_failure(&self) -> Instant {
        self.last_failure
    }

    pub fn errors(&self) -> impl Iterator<Item = &FailureRecord> {
        self.errors.iter()
    }

    /// Count one failure; a window older than `window` starts over
    pub fn record(&mut self, now: Instant, error: &PuenteError, window: Duration) -> u32 {
        if self.count > 0 && now.duration_since(self.first_failure) > window {
            self.count = 0;
            self.errors.clear();
        }
        if self.count == 0 {
            self.first_failure = now;
        }

        self.count += 1;
        self.last_failure = now;
        if self.errors.len() == MAX_ERROR_RECORDS {
            self.errors.pop_front();
        }
        self.errors.push_back(FailureRecord {
            at: SystemTime::now(),
            code: error.code().map(str::to_string),
            message: error.to_string(),
        });
        self.count
    }

    /// One success offsets one failure
    pub fn decrement(&mut self) -> u32 {
        self.count = self.count.saturating_sub(1);
        self.count
    }
}
