//! Sliding-window rate limiter keyed by `name[:caller_id]`.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
        }
    }

    /// Window key for a capability and optional caller.
    pub fn key(name: &str, caller_id: Option<&str>) -> String {
        match caller_id {
            Some(caller) => format!("{}:{}", name, caller),
            None => name.to_string(),
        }
    }

    /// Admit and record one call, or return the wait until a slot frees up.
    ///
    /// Pruning, the capacity check and the append happen under one entry
    /// guard, so concurrent calls on the same key never overshoot `capacity`.
    /// A rejected call is not recorded.
    pub fn try_acquire(&self, key: &str, capacity: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let mut window = self.windows.entry(key.to_string()).or_default();
        prune(&mut window, now, self.window);

        if window.len() >= capacity as usize {
            let oldest = window.front().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            return Err(retry_after);
        }
        window.push_back(now);
        Ok(())
    }

    /// Calls recorded for `key` within the current window.
    pub fn in_window(&self, key: &str) -> usize {
        let now = Instant::now();
        self.windows
            .get(key)
            .map(|w| {
                w.iter()
                    .filter(|t| now.saturating_duration_since(**t) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Prune every window and drop the empty ones.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            prune(window, now, self.window);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn clear(&self) {
        self.windows.clear();
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(*oldest) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}
