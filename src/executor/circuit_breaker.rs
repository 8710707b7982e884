//! Per-capability circuit breaker.
//!
//! A breaker is open while `failure_count >= threshold` and the last failure
//! is younger than the cooldown. Once the cooldown has elapsed the entry is
//! cleared on the next check, which admits the call.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub status: CircuitStatus,
    pub failure_count: u32,
    /// Time until the breaker closes, when open
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct BreakerEntry {
    failure_count: u32,
    last_failure: Instant,
}

#[derive(Debug)]
pub struct CircuitBreakers {
    entries: DashMap<String, BreakerEntry>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakers {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// Gate a call. `Err` carries the time left until the breaker closes.
    pub fn check(&self, name: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = match self.entries.get(name) {
            None => return Ok(()),
            Some(entry) => {
                let elapsed = now.saturating_duration_since(entry.last_failure);
                if elapsed < self.cooldown {
                    if entry.failure_count >= self.threshold {
                        return Err(self.cooldown - elapsed);
                    }
                    return Ok(());
                }
                elapsed
            }
        };

        let cooldown = self.cooldown;
        let removed = self.entries.remove_if(name, |_, entry| {
            now.saturating_duration_since(entry.last_failure) >= cooldown
        });
        if removed.is_some() {
            log::debug!(
                "Circuit for {} reset after {}ms without failures",
                name,
                elapsed.as_millis()
            );
        }
        Ok(())
    }

    pub fn record_failure(&self, name: &str) -> u32 {
        let now = Instant::now();
        let mut entry = self.entries.entry(name.to_string()).or_insert(BreakerEntry {
            failure_count: 0,
            last_failure: now,
        });
        entry.failure_count += 1;
        entry.last_failure = now;
        if entry.failure_count == self.threshold {
            log::warn!(
                "Circuit opened for {} after {} consecutive failures",
                name,
                entry.failure_count
            );
        }
        entry.failure_count
    }

    pub fn record_success(&self, name: &str) {
        self.entries.remove(name);
    }

    pub fn reset(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn snapshot(&self, name: &str) -> CircuitSnapshot {
        let now = Instant::now();
        match self.entries.get(name) {
            Some(entry) => {
                let elapsed = now.saturating_duration_since(entry.last_failure);
                let open = entry.failure_count >= self.threshold && elapsed < self.cooldown;
                CircuitSnapshot {
                    status: if open {
                        CircuitStatus::Open
                    } else {
                        CircuitStatus::Closed
                    },
                    failure_count: entry.failure_count,
                    retry_after_ms: open.then(|| (self.cooldown - elapsed).as_millis() as u64),
                }
            }
            None => CircuitSnapshot {
                status: CircuitStatus::Closed,
                failure_count: 0,
                retry_after_ms: None,
            },
        }
    }

    /// Drop entries whose last failure is older than the cooldown.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_failure) < self.cooldown);
        before.saturating_sub(self.entries.len())
    }
}
