//! Runtime context - owns one registry, one executor and the background
//! maintenance task.
//!
//! Construct one per process (or per test) and share it behind an `Arc`:
//!
//! ```ignore
//! let runtime = Arc::new(RuntimeContext::new(RuntimeConfig::from_env()?));
//! builtin::register_builtins(runtime.registry()).await;
//! runtime.start_maintenance();
//! let result = runtime.execute("echo.v1", json!({"message": "hi"}), ExecuteOptions::new()).await;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::capabilities::CapabilityRegistry;
use crate::config::RuntimeConfig;
use crate::executor::{CapabilityExecutor, ExecuteOptions, ExecutionResult};

pub struct RuntimeContext {
    registry: Arc<CapabilityRegistry>,
    executor: Arc<CapabilityExecutor>,
    config: RuntimeConfig,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeContext {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(CapabilityRegistry::new()), config)
    }

    /// Build around an existing registry.
    pub fn with_registry(registry: Arc<CapabilityRegistry>, config: RuntimeConfig) -> Self {
        let executor = Arc::new(CapabilityExecutor::new(Arc::clone(&registry), config.clone()));
        Self {
            registry,
            executor,
            config,
            maintenance: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<CapabilityExecutor> {
        &self.executor
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub async fn execute(&self, name: &str, input: Value, options: ExecuteOptions) -> ExecutionResult {
        self.executor.execute(name, input, options).await
    }

    /// Start the periodic purge of expired cache entries, idle rate windows
    /// and stale breakers. Must be called inside a tokio runtime. A second
    /// call while the task is running does nothing.
    pub fn start_maintenance(&self) {
        let mut slot = self.maintenance.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let period = self.config.sweep_interval();
        let executor = Arc::clone(&self.executor);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                executor.purge_expired();
            }
        }));
        log::info!("Maintenance task started (every {}s)", period.as_secs());
    }

    /// Stop the maintenance task. Returns whether one was running.
    pub fn stop_maintenance(&self) -> bool {
        match self.maintenance.lock().take() {
            Some(handle) => {
                handle.abort();
                log::info!("Maintenance task stopped");
                true
            }
            None => false,
        }
    }

    pub fn maintenance_running(&self) -> bool {
        self.maintenance
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("registry", &self.registry)
            .field("maintenance_running", &self.maintenance_running())
            .finish()
    }
}
