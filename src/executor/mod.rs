//! # Capability Executor
//!
//! Runs one capability invocation end-to-end behind the resilience layer.
//! Gates run in order and the first failing gate decides the result:
//!
//! 1. lookup (canonical name, then legacy alias)
//! 2. circuit breaker
//! 3. sliding-window rate limit (when the capability declares one)
//! 4. auth (`requires_auth` needs a caller id)
//! 5. input schema validation
//! 6. result cache
//! 7. timeout-bounded execution with exponential-backoff retry
//!
//! Gates 1-5 touch neither metrics nor breakers. Every attempt in step 7
//! updates metrics, and a failed attempt also counts against the breaker.
//! `execute` never returns `Err` and never panics: every path yields an
//! [`ExecutionResult`].

pub mod cache;
pub mod circuit_breaker;
pub mod metrics;
pub mod rate_limiter;
pub mod result;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinError;
use tokio::time::Instant;

use crate::capabilities::{CapabilityRegistry, DynCapability, ExecutionContext, ValidatedInput};
use crate::config::RuntimeConfig;

pub use cache::{cache_key, canonical_json, ResultCache};
pub use circuit_breaker::{CircuitBreakers, CircuitSnapshot, CircuitStatus};
pub use metrics::{MetricsSnapshot, MetricsStore};
pub use rate_limiter::RateLimiter;
pub use result::{ExecutionError, ExecutionMetadata, ExecutionResult};

/// Per-call options for [`CapabilityExecutor::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Consult and fill the result cache
    pub use_cache: bool,
    /// Caller identity; falls back to `context.caller_id`
    pub caller_id: Option<String>,
    /// Replaces the timeout derived from `estimated_time_seconds`
    pub timeout_override: Option<Duration>,
    /// Extra attempts after the first, capped by `max_retry_count`
    pub retry_count: u32,
    pub context: ExecutionContext,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            caller_id: None,
            timeout_override: None,
            retry_count: 0,
            context: ExecutionContext::default(),
        }
    }
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }
}

/// Entries dropped by one [`CapabilityExecutor::purge_expired`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub cache_entries: usize,
    pub rate_windows: usize,
    pub circuits: usize,
}

/// Executes registered capabilities.
///
/// Breakers, rate windows, cache and metrics are keyed by canonical name, so
/// calls through a legacy alias share state with the canonical name.
pub struct CapabilityExecutor {
    registry: Arc<CapabilityRegistry>,
    config: RuntimeConfig,
    breakers: CircuitBreakers,
    limiter: RateLimiter,
    cache: ResultCache,
    metrics: MetricsStore,
}

impl CapabilityExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>, config: RuntimeConfig) -> Self {
        Self {
            breakers: CircuitBreakers::new(config.failure_threshold, config.circuit_cooldown()),
            limiter: RateLimiter::new(config.rate_limit_window()),
            cache: ResultCache::new(config.cache_ttl()),
            metrics: MetricsStore::new(),
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run `name` with raw JSON `input`.
    pub async fn execute(&self, name: &str, input: Value, options: ExecuteOptions) -> ExecutionResult {
        let started = Instant::now();

        let Some(capability) = self.registry.get(name) else {
            log::debug!("Capability {} not found", name);
            return ExecutionResult::failure(ExecutionError::NotFound {
                name: name.to_string(),
            });
        };
        let descriptor = capability.descriptor().clone();
        let canonical = descriptor.name.clone();

        if let Err(remaining) = self.breakers.check(&canonical) {
            log::warn!("Rejected {}: circuit open", canonical);
            return ExecutionResult::failure(ExecutionError::CircuitOpen {
                name: canonical,
                retry_after_ms: remaining.as_millis() as u64,
            });
        }

        let ExecuteOptions {
            use_cache,
            caller_id,
            timeout_override,
            retry_count,
            mut context,
        } = options;
        let caller_id = caller_id.or_else(|| context.caller_id.clone());

        if let Some(limit) = descriptor.rate_limit_per_minute {
            let key = RateLimiter::key(&canonical, caller_id.as_deref());
            if let Err(wait) = self.limiter.try_acquire(&key, limit) {
                log::warn!("Rate limit exceeded for {}", key);
                return ExecutionResult::failure(ExecutionError::RateLimited {
                    name: canonical,
                    limit_per_minute: limit,
                    retry_after_ms: wait.as_millis() as u64,
                });
            }
        }

        if descriptor.requires_auth && caller_id.is_none() {
            return ExecutionResult::failure(ExecutionError::AuthRequired { name: canonical });
        }

        let validated = match capability.validate_input(&input) {
            Ok(validated) => validated,
            Err(e) => {
                log::debug!("Input for {} rejected: {}", canonical, e);
                return ExecutionResult::failure(ExecutionError::ValidationFailed {
                    message: e.message,
                });
            }
        };

        context.caller_id = caller_id;
        let request_id = context
            .request_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let metadata = |attempts: u32, cached: bool| ExecutionMetadata {
            execution_time_ms: started.elapsed().as_millis() as u64,
            capability_version: descriptor.version.clone(),
            timestamp: Utc::now(),
            attempts,
            cached,
            request_id: Some(request_id.clone()),
        };

        let key = use_cache.then(|| cache_key(&canonical, &input));
        if let Some(key) = &key {
            if let Some(output) = self.cache.get(key) {
                log::debug!("Cache hit for {}", canonical);
                self.metrics.record_cache_hit(&canonical);
                return ExecutionResult::success(output, metadata(0, true));
            }
            self.metrics.record_cache_miss(&canonical);
        }

        let timeout = timeout_override
            .or_else(|| descriptor.default_timeout())
            .unwrap_or_else(|| self.config.default_timeout());
        let max_attempts = retry_count.min(self.config.max_retry_count) + 1;
        let context = Arc::new(context);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let attempt_started = Instant::now();

            if !capability.validate(&validated) {
                let err = ExecutionError::SecondaryValidationFailed {
                    name: canonical.clone(),
                };
                self.record_failure(&canonical, attempt_started.elapsed(), &err);
                return ExecutionResult::failure_with_metadata(err, metadata(attempt, false));
            }

            let outcome = run_attempt(
                Arc::clone(&capability),
                validated.clone(),
                Arc::clone(&context),
                timeout,
            )
            .await;
            let latency = attempt_started.elapsed();

            match outcome {
                Ok(output) => {
                    self.metrics.record_success(&canonical, latency);
                    self.breakers.record_success(&canonical);
                    if let Some(key) = key {
                        self.cache.insert(key, output.clone());
                    }
                    log::debug!(
                        "Executed {} in {}ms (attempt {}/{})",
                        canonical,
                        latency.as_millis(),
                        attempt,
                        max_attempts
                    );
                    return ExecutionResult::success(output, metadata(attempt, false));
                }
                Err(err) => {
                    self.record_failure(&canonical, latency, &err);
                    if attempt >= max_attempts {
                        log::error!(
                            "{} failed after {} attempt(s): {}",
                            canonical,
                            attempt,
                            err
                        );
                        return ExecutionResult::failure_with_metadata(
                            ExecutionError::ExecutionFailed {
                                attempts: attempt,
                                cause: Box::new(err),
                            },
                            metadata(attempt, false),
                        );
                    }
                    let delay = self.backoff(attempt);
                    log::warn!(
                        "{} attempt {}/{} failed: {}; retrying in {}ms",
                        canonical,
                        attempt,
                        max_attempts,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delay after the `attempt`-th failure: base, 2x base, 4x base, ...
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config.retry_base_delay().saturating_mul(factor)
    }

    fn record_failure(&self, name: &str, latency: Duration, err: &ExecutionError) {
        self.metrics.record_failure(name, latency, &err.to_string());
        self.breakers.record_failure(name);
    }

    // -----------------------------------------------------------------------
    // Introspection / administration
    // -----------------------------------------------------------------------

    fn canonical(&self, name: &str) -> String {
        self.registry
            .resolve_name(name)
            .unwrap_or_else(|| name.to_string())
    }

    pub fn metrics(&self, name: &str) -> Option<MetricsSnapshot> {
        self.metrics.snapshot(&self.canonical(name))
    }

    pub fn all_metrics(&self) -> Vec<MetricsSnapshot> {
        self.metrics.all()
    }

    pub fn reset_metrics(&self, name: Option<&str>) {
        match name {
            Some(name) => self.metrics.reset(Some(&self.canonical(name))),
            None => self.metrics.reset(None),
        }
    }

    pub fn circuit_state(&self, name: &str) -> CircuitSnapshot {
        self.breakers.snapshot(&self.canonical(name))
    }

    /// Close a breaker by hand. Returns whether it had any recorded failures.
    pub fn reset_circuit(&self, name: &str) -> bool {
        let canonical = self.canonical(name);
        let had_entry = self.breakers.reset(&canonical);
        if had_entry {
            log::info!("Circuit for {} reset manually", canonical);
        }
        had_entry
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Drop expired cache entries, idle rate windows and stale breakers.
    pub fn purge_expired(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            cache_entries: self.cache.purge_expired(),
            rate_windows: self.limiter.purge_idle(),
            circuits: self.breakers.purge_expired(),
        };
        if report != MaintenanceReport::default() {
            log::debug!(
                "Maintenance purged {} cache entries, {} rate windows, {} circuits",
                report.cache_entries,
                report.rate_windows,
                report.circuits
            );
        }
        report
    }
}

impl std::fmt::Debug for CapabilityExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityExecutor")
            .field("registry", &self.registry)
            .field("cache_entries", &self.cache.len())
            .finish()
    }
}

/// One attempt on its own task, aborted when `timeout` elapses first.
///
/// Abort takes effect at the capability's next `.await`; blocking work keeps
/// its thread until it yields.
async fn run_attempt(
    capability: Arc<dyn DynCapability>,
    input: ValidatedInput,
    context: Arc<ExecutionContext>,
    timeout: Duration,
) -> Result<Value, ExecutionError> {
    let mut handle = tokio::spawn(async move { capability.execute(&input, &context).await });

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(e))) => Err(ExecutionError::Capability {
            message: e.to_string(),
        }),
        Ok(Err(join_error)) => Err(ExecutionError::Capability {
            message: join_error_message(join_error),
        }),
        Err(_) => {
            handle.abort();
            Err(ExecutionError::Timeout {
                after_ms: timeout.as_millis() as u64,
            })
        }
    }
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "capability task was cancelled".to_string();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("capability panicked: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilityDescriptor, Category, FnCapability};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn descriptor(name: &str) -> CapabilityDescriptor {
        CapabilityDescriptor::new(name, "1.0.0", format!("{} test capability", name), Category::Utility)
    }

    /// Registry holding `echo.v1` (alias `echo`) plus `extra`.
    async fn executor_with(extra: Vec<Arc<dyn DynCapability>>) -> CapabilityExecutor {
        let _ = env_logger::builder().is_test(true).try_init();
        let registry = Arc::new(CapabilityRegistry::new());
        let echo = FnCapability::new(
            descriptor("echo.v1").with_legacy_alias("echo"),
            |input, ctx| async move {
                Ok(json!({ "echo": input, "caller": ctx.caller_id, "request_id": ctx.request_id }))
            },
        )
        .with_input_schema(json!({"type": "object", "required": ["message"]}));
        registry.register(echo.into_dyn()).await.unwrap();
        for capability in extra {
            registry.register(capability).await.unwrap();
        }
        CapabilityExecutor::new(registry, RuntimeConfig::default())
    }

    /// Fails the first `failures` calls, then echoes.
    fn flaky(name: &str, failures: u32, calls: Arc<AtomicU32>) -> Arc<dyn DynCapability> {
        FnCapability::new(descriptor(name), move |input, _ctx| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(crate::capabilities::CapabilityError::failed(format!("transient failure {}", n + 1)))
                } else {
                    Ok(input)
                }
            }
        })
        .into_dyn()
    }

    #[tokio::test]
    async fn test_echo_success_metadata() {
        let executor = executor_with(vec![]).await;
        let result = executor
            .execute("echo.v1", json!({"message": "hola"}), ExecuteOptions::new().with_caller("u1"))
            .await;

        assert!(result.success);
        let data = result.data.clone().unwrap();
        assert_eq!(data["echo"], json!({"message": "hola"}));
        assert_eq!(data["caller"], "u1");

        let metadata = result.metadata.unwrap();
        assert_eq!(metadata.attempts, 1);
        assert!(!metadata.cached);
        assert_eq!(metadata.capability_version, "1.0.0");
        assert_eq!(data["request_id"], json!(metadata.request_id));

        let snap = executor.metrics("echo.v1").unwrap();
        assert_eq!(snap.calls, 1);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_not_found() {
        let executor = executor_with(vec![]).await;
        let result = executor.execute("nope.v1", json!({}), ExecuteOptions::new()).await;
        assert!(!result.success);
        assert_eq!(
            result.error,
            Some(ExecutionError::NotFound {
                name: "nope.v1".into()
            })
        );
        assert!(executor.all_metrics().is_empty());
    }

    #[tokio::test]
    async fn test_alias_shares_canonical_state() {
        let executor = executor_with(vec![]).await;
        let result = executor
            .execute("echo", json!({"message": "via alias"}), ExecuteOptions::new().without_cache())
            .await;
        assert!(result.success);
        assert_eq!(executor.metrics("echo.v1").unwrap().calls, 1);
        assert_eq!(executor.metrics("echo").unwrap().calls, 1);
    }

    #[tokio::test]
    async fn test_validation_failure_touches_nothing() {
        let executor = executor_with(vec![]).await;
        let result = executor.execute("echo.v1", json!({"msg": 1}), ExecuteOptions::new()).await;
        assert_eq!(
            result.error,
            Some(ExecutionError::ValidationFailed {
                message: "missing required field(s): message".into()
            })
        );
        assert!(executor.metrics("echo.v1").is_none());
        assert_eq!(executor.circuit_state("echo.v1").failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flaky_succeeds_on_retry_after_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_with(vec![flaky("flaky.v1", 1, Arc::clone(&calls))]).await;

        let started = Instant::now();
        let result = executor
            .execute("flaky.v1", json!({"n": 1}), ExecuteOptions::new().with_retries(2))
            .await;

        assert!(result.success);
        assert_eq!(result.metadata.unwrap().attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));

        let snap = executor.metrics("flaky.v1").unwrap();
        assert_eq!(snap.calls, 2);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.last_error.as_deref(), Some("transient failure 1"));
        // Success clears the breaker.
        assert_eq!(executor.circuit_state("flaky.v1").failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_with(vec![flaky("broken.v1", u32::MAX, Arc::clone(&calls))]).await;

        let started = Instant::now();
        let result = executor
            .execute("broken.v1", json!({}), ExecuteOptions::new().with_retries(2))
            .await;

        // 1s + 2s of backoff between three attempts.
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            result.error,
            Some(ExecutionError::ExecutionFailed {
                attempts: 3,
                cause: Box::new(ExecutionError::Capability {
                    message: "transient failure 3".into()
                }),
            })
        );
        assert_eq!(result.metadata.unwrap().attempts, 3);
        assert_eq!(executor.circuit_state("broken.v1").failure_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_is_capped() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_with(vec![flaky("broken.v1", u32::MAX, Arc::clone(&calls))]).await;
        let result = executor
            .execute("broken.v1", json!({}), ExecuteOptions::new().with_retries(50))
            .await;
        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), RuntimeConfig::default().max_retry_count + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_and_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_with(vec![flaky("broken.v1", 5, Arc::clone(&calls))]).await;
        let opts = || ExecuteOptions::new().without_cache();

        for _ in 0..5 {
            let result = executor.execute("broken.v1", json!({}), opts()).await;
            assert_eq!(result.error.unwrap().kind(), "execution_failed");
        }
        assert_eq!(executor.circuit_state("broken.v1").status, CircuitStatus::Open);

        let result = executor.execute("broken.v1", json!({}), opts()).await;
        match result.error {
            Some(ExecutionError::CircuitOpen { retry_after_ms, .. }) => {
                assert!(retry_after_ms > 59_000 && retry_after_ms <= 60_000)
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        tokio::time::advance(Duration::from_secs(60)).await;
        let result = executor.execute("broken.v1", json!({}), opts()).await;
        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(executor.circuit_state("broken.v1").status, CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_circuit_reset() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_with(vec![flaky("broken.v1", 5, Arc::clone(&calls))]).await;
        for _ in 0..5 {
            executor.execute("broken.v1", json!({}), ExecuteOptions::new()).await;
        }
        assert!(executor.reset_circuit("broken.v1"));
        assert!(executor.execute("broken.v1", json!({}), ExecuteOptions::new()).await.success);
        assert!(!executor.reset_circuit("broken.v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_per_caller() {
        let limited = FnCapability::new(descriptor("limited.v1").with_rate_limit(2), |input, _ctx| async move {
            Ok(input)
        })
        .into_dyn();
        let executor = executor_with(vec![limited]).await;
        let opts = |caller: &str| ExecuteOptions::new().without_cache().with_caller(caller);

        assert!(executor.execute("limited.v1", json!({}), opts("u1")).await.success);
        assert!(executor.execute("limited.v1", json!({}), opts("u1")).await.success);
        let rejected = executor.execute("limited.v1", json!({}), opts("u1")).await;
        assert_eq!(rejected.error.unwrap().kind(), "rate_limited");
        assert!(executor.execute("limited.v1", json!({}), opts("u2")).await.success);

        // Rejections are not executions.
        assert_eq!(executor.metrics("limited.v1").unwrap().calls, 3);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(executor.execute("limited.v1", json!({}), opts("u1")).await.success);
    }

    #[tokio::test]
    async fn test_auth_gate() {
        let secure = FnCapability::new(descriptor("docs.vault").with_auth(true), |_input, ctx| async move {
            Ok(json!({ "owner": ctx.caller_id }))
        })
        .into_dyn();
        let executor = executor_with(vec![secure]).await;

        let denied = executor.execute("docs.vault", json!({}), ExecuteOptions::new()).await;
        assert_eq!(
            denied.error,
            Some(ExecutionError::AuthRequired {
                name: "docs.vault".into()
            })
        );
        assert!(executor.metrics("docs.vault").is_none());

        let ctx = ExecutionContext::new().with_caller("alice");
        let allowed = executor
            .execute("docs.vault", json!({}), ExecuteOptions::new().with_context(ctx))
            .await;
        assert_eq!(allowed.data.unwrap()["owner"], "alice");
    }

    #[tokio::test]
    async fn test_secondary_validation_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let strict = FnCapability::new(descriptor("tax.strict"), move |input, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(input) }
        })
        .with_validator(|input| input.get("year").and_then(Value::as_u64).is_some_and(|y| y >= 2000))
        .into_dyn();
        let executor = executor_with(vec![strict]).await;

        let result = executor
            .execute("tax.strict", json!({"year": 1999}), ExecuteOptions::new().with_retries(3))
            .await;
        assert_eq!(
            result.error,
            Some(ExecutionError::SecondaryValidationFailed {
                name: "tax.strict".into()
            })
        );
        assert_eq!(result.metadata.unwrap().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let snap = executor.metrics("tax.strict").unwrap();
        assert_eq!(snap.calls, 1);
        assert_eq!(snap.failures, 1);
        assert_eq!(executor.circuit_state("tax.strict").failure_count, 1);

        assert!(executor
            .execute("tax.strict", json!({"year": 2024}), ExecuteOptions::new())
            .await
            .success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_and_expiry() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor_with(vec![flaky("tax.rates", 0, Arc::clone(&calls))]).await;

        let first = executor
            .execute("tax.rates", json!({"country": "DE", "year": 2024}), ExecuteOptions::new())
            .await;
        let second = executor
            .execute("tax.rates", json!({"year": 2024, "country": "DE"}), ExecuteOptions::new())
            .await;

        assert!(!first.is_cached());
        assert!(second.is_cached());
        assert_eq!(second.data, first.data);
        assert_eq!(second.metadata.as_ref().unwrap().attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let snap = executor.metrics("tax.rates").unwrap();
        assert_eq!(snap.calls, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);

        // Bypassing the cache always executes.
        executor
            .execute("tax.rates", json!({"country": "DE", "year": 2024}), ExecuteOptions::new().without_cache())
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(3600)).await;
        let third = executor
            .execute("tax.rates", json!({"country": "DE", "year": 2024}), ExecuteOptions::new())
            .await;
        assert!(!third.is_cached());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_attempt() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let slow = FnCapability::new(descriptor("docs.ocr"), move |input, _ctx| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(input)
            }
        })
        .into_dyn();
        let executor = executor_with(vec![slow]).await;

        let result = executor
            .execute("docs.ocr", json!({}), ExecuteOptions::new().with_timeout(Duration::from_millis(100)))
            .await;
        assert_eq!(
            result.error,
            Some(ExecutionError::ExecutionFailed {
                attempts: 1,
                cause: Box::new(ExecutionError::Timeout { after_ms: 100 }),
            })
        );

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(executor.metrics("docs.ocr").unwrap().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_from_estimate() {
        let slow = FnCapability::new(
            descriptor("docs.slow").with_estimated_time(0.25),
            |input, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(input)
            },
        )
        .into_dyn();
        let executor = executor_with(vec![slow]).await;
        let result = executor.execute("docs.slow", json!({}), ExecuteOptions::new()).await;
        assert_eq!(
            result.error.unwrap().root_cause(),
            &ExecutionError::Timeout { after_ms: 500 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_estimate_uses_config_timeout() {
        let batch = FnCapability::new(
            descriptor("docs.batch").with_estimated_time(1e19),
            |input, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(input)
            },
        )
        .into_dyn();
        let executor = executor_with(vec![batch]).await;
        let result = executor.execute("docs.batch", json!({}), ExecuteOptions::new()).await;
        assert_eq!(
            result.error.unwrap().root_cause(),
            &ExecutionError::Timeout {
                after_ms: RuntimeConfig::default().default_timeout_ms
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rate_limit_is_exact_under_concurrency() {
        let limited = FnCapability::new(descriptor("limited.v1").with_rate_limit(3), |input, _ctx| async move {
            tokio::task::yield_now().await;
            Ok(input)
        })
        .into_dyn();
        let executor = Arc::new(executor_with(vec![limited]).await);

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let executor = Arc::clone(&executor);
                tokio::spawn(async move {
                    executor
                        .execute(
                            "limited.v1",
                            json!({ "n": i }),
                            ExecuteOptions::new().without_cache().with_caller("u1"),
                        )
                        .await
                })
            })
            .collect();

        let mut successes = 0;
        let mut limited_count = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            if result.success {
                successes += 1;
            } else if result.error.as_ref().map(ExecutionError::kind) == Some("rate_limited") {
                limited_count += 1;
            }
        }
        assert_eq!(successes, 3);
        assert_eq!(limited_count, 61);
        assert_eq!(executor.metrics("limited.v1").unwrap().calls, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_work_outlives_timeout() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let blocking = FnCapability::new(descriptor("docs.render"), move |input, _ctx| {
            let flag = Arc::clone(&flag);
            async move {
                std::thread::sleep(Duration::from_millis(300));
                flag.store(true, Ordering::SeqCst);
                Ok(input)
            }
        })
        .into_dyn();
        let executor = executor_with(vec![blocking]).await;

        let result = executor
            .execute("docs.render", json!({}), ExecuteOptions::new().with_timeout(Duration::from_millis(50)))
            .await;
        assert_eq!(
            result.error.unwrap().root_cause(),
            &ExecutionError::Timeout { after_ms: 50 }
        );
        assert!(!finished.load(Ordering::SeqCst));

        // Abort cannot interrupt a thread that never yields.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let fragile = FnCapability::new(descriptor("comms.fragile"), |input, _ctx| async move {
            if input.get("explode").is_some() {
                panic!("boom");
            }
            Ok(input)
        })
        .into_dyn();
        let executor = executor_with(vec![fragile]).await;

        let result = executor
            .execute("comms.fragile", json!({"explode": true}), ExecuteOptions::new())
            .await;
        match result.error.unwrap().root_cause() {
            ExecutionError::Capability { message } => {
                assert_eq!(message, "capability panicked: boom")
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert!(executor
            .execute("comms.fragile", json!({"ok": true}), ExecuteOptions::new())
            .await
            .success);
    }

    #[tokio::test]
    async fn test_request_id_is_kept_when_supplied() {
        let executor = executor_with(vec![]).await;
        let ctx = ExecutionContext::new().with_request_id("req-42");
        let result = executor
            .execute("echo.v1", json!({"message": "x"}), ExecuteOptions::new().with_context(ctx))
            .await;
        assert_eq!(result.metadata.unwrap().request_id.as_deref(), Some("req-42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_and_admin() {
        let executor = executor_with(vec![]).await;
        executor
            .execute("echo.v1", json!({"message": "a"}), ExecuteOptions::new())
            .await;
        assert_eq!(executor.cache_len(), 1);

        tokio::time::advance(Duration::from_secs(3601)).await;
        let report = executor.purge_expired();
        assert_eq!(report.cache_entries, 1);
        assert_eq!(executor.cache_len(), 0);

        executor.reset_metrics(Some("echo"));
        assert!(executor.metrics("echo.v1").is_none());
    }
}
