//! Capability Registry - catalog of invocable capabilities.
//!
//! Resolution is by canonical dotted name first, then by legacy alias:
//! `registry.get("visa_lookup")` finds `immigration.visa_requirements` when
//! that capability declares `legacy_alias: visa_lookup`.
//!
//! Re-registering a name under a newer version replaces the invocable instance;
//! an equal or older version is ignored. Earlier version strings stay in the
//! version history for introspection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::capability::{CallerClass, CapabilityDescriptor, Category, DynCapability};
use super::error::RegistryError;
use super::tool_descriptor::{sanitize_tool_name, ToolDescriptor};

/// Outcome of a successful [`CapabilityRegistry::register`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The capability was stored and its `on_load` hook completed.
    Registered,
    /// The name is already registered at this version or a newer one;
    /// nothing changed.
    Unchanged,
}

/// Report of a best-effort [`CapabilityRegistry::register_batch`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub registered: Vec<String>,
    pub unchanged: Vec<String>,
    /// `(name, error message)` for every capability that was skipped
    pub failed: Vec<(String, String)>,
}

/// Filter for [`CapabilityRegistry::list`].
///
/// `tags` matches when the capability carries any of the listed tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub allowed_caller: Option<CallerClass>,
}

impl ListFilter {
    pub fn matches(&self, descriptor: &CapabilityDescriptor) -> bool {
        if let Some(category) = self.category {
            if descriptor.category != category {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| descriptor.has_tag(t)) {
            return false;
        }
        if let Some(caller) = self.allowed_caller {
            if !descriptor.allows_caller(caller) {
                return false;
            }
        }
        true
    }
}

/// Registry-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryStatistics {
    pub total: usize,
    pub categories: usize,
    pub by_category: BTreeMap<String, usize>,
    /// Version history entries of the currently registered names.
    pub total_versions: usize,
    pub aliases: usize,
}

#[derive(Default)]
struct RegistryTables {
    plugins: HashMap<String, Arc<dyn DynCapability>>,
    metadata: HashMap<String, CapabilityDescriptor>,
    aliases: HashMap<String, String>,
    versions: HashMap<String, Vec<String>>,
}

/// State of the tables for one name, captured before a registration.
struct Rollback {
    name: String,
    plugin: Option<Arc<dyn DynCapability>>,
    metadata: Option<CapabilityDescriptor>,
    versions: Option<Vec<String>>,
    aliases: HashMap<String, String>,
}

/// Precedence key: numeric core, then release above pre-release. Build
/// metadata is ignored.
fn version_key(version: &str) -> Option<(u64, u64, u64, bool, &str)> {
    let version = version.split('+').next().unwrap_or(version);
    let (core, pre) = match version.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (version, None),
    };
    let mut parts = core.split('.').map(|p| p.parse::<u64>().ok());
    Some((
        parts.next()??,
        parts.next()??,
        parts.next()??,
        pre.is_none(),
        pre.unwrap_or(""),
    ))
}

fn is_newer_version(candidate: &str, current: &str) -> bool {
    match (version_key(candidate), version_key(current)) {
        (Some(candidate), Some(current)) => candidate > current,
        _ => candidate != current,
    }
}

impl RegistryTables {
    fn resolve(&self, name: &str) -> Option<&str> {
        if let Some((canonical, _)) = self.plugins.get_key_value(name) {
            return Some(canonical.as_str());
        }
        self.aliases
            .get(name)
            .filter(|canonical| self.plugins.contains_key(*canonical))
            .map(String::as_str)
    }

    fn check_conflicts(&self, descriptor: &CapabilityDescriptor) -> Result<(), RegistryError> {
        if let Some(owner) = self.aliases.get(&descriptor.name) {
            if owner != &descriptor.name {
                return Err(RegistryError::AliasConflict {
                    alias: descriptor.name.clone(),
                    existing: owner.clone(),
                });
            }
        }
        if let Some(alias) = &descriptor.legacy_alias {
            if self.plugins.contains_key(alias) {
                return Err(RegistryError::AliasConflict {
                    alias: alias.clone(),
                    existing: alias.clone(),
                });
            }
            if let Some(owner) = self.aliases.get(alias) {
                if owner != &descriptor.name {
                    return Err(RegistryError::AliasConflict {
                        alias: alias.clone(),
                        existing: owner.clone(),
                    });
                }
            }
        }
        let tool = sanitize_tool_name(&descriptor.name, None);
        if let Some(existing) = self
            .plugins
            .keys()
            .find(|other| *other != &descriptor.name && sanitize_tool_name(other, None) == tool)
        {
            return Err(RegistryError::ToolNameConflict {
                tool,
                existing: existing.clone(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, capability: Arc<dyn DynCapability>) -> Rollback {
        let descriptor = capability.descriptor().clone();
        let name = descriptor.name.clone();
        let rollback = Rollback {
            name: name.clone(),
            plugin: self.plugins.get(&name).cloned(),
            metadata: self.metadata.get(&name).cloned(),
            versions: self.versions.get(&name).cloned(),
            aliases: self.aliases.clone(),
        };

        self.aliases.retain(|_, target| target != &name);
        if let Some(alias) = &descriptor.legacy_alias {
            self.aliases.insert(alias.clone(), name.clone());
        }
        let history = self.versions.entry(name.clone()).or_default();
        if !history.contains(&descriptor.version) {
            history.push(descriptor.version.clone());
        }
        self.metadata.insert(name.clone(), descriptor);
        self.plugins.insert(name, capability);
        rollback
    }

    fn restore(&mut self, rollback: Rollback) {
        let Rollback {
            name,
            plugin,
            metadata,
            versions,
            aliases,
        } = rollback;
        match plugin {
            Some(p) => self.plugins.insert(name.clone(), p),
            None => self.plugins.remove(&name),
        };
        match metadata {
            Some(m) => self.metadata.insert(name.clone(), m),
            None => self.metadata.remove(&name),
        };
        match versions {
            Some(v) => self.versions.insert(name, v),
            None => self.versions.remove(&name),
        };
        self.aliases = aliases;
    }

    fn remove(&mut self, name: &str) -> Option<Arc<dyn DynCapability>> {
        self.metadata.remove(name);
        self.aliases.retain(|_, target| target != name);
        self.plugins.remove(name)
    }

    fn sorted_descriptors(
        &self,
        mut keep: impl FnMut(&CapabilityDescriptor) -> bool,
    ) -> Vec<CapabilityDescriptor> {
        let mut out: Vec<CapabilityDescriptor> = self
            .metadata
            .values()
            .filter(|d| keep(*d))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.category
                .as_str()
                .cmp(b.category.as_str())
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }
}

/// Catalog of capabilities keyed by canonical name.
///
/// Lookups take a short read lock and never wait on lifecycle hooks.
/// `register`, `unregister` and `reload` are serialized by an async lock
/// held across `on_load` / `on_unload`.
pub struct CapabilityRegistry {
    tables: RwLock<RegistryTables>,
    lifecycle: Mutex<()>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(RegistryTables::default()),
            lifecycle: Mutex::new(()),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register a capability and run its `on_load` hook.
    ///
    /// Registering the `(name, version)` that is already current is a no-op.
    /// If `on_load` fails, every table is restored to its prior state.
    pub async fn register(
        &self,
        capability: Arc<dyn DynCapability>,
    ) -> Result<Registration, RegistryError> {
        let _guard = self.lifecycle.lock().await;
        self.register_locked(capability).await
    }

    /// Register many capabilities, skipping (and logging) failures.
    pub async fn register_batch(
        &self,
        capabilities: impl IntoIterator<Item = Arc<dyn DynCapability>>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for capability in capabilities {
            let name = capability.descriptor().name.clone();
            match self.register(capability).await {
                Ok(Registration::Registered) => report.registered.push(name),
                Ok(Registration::Unchanged) => report.unchanged.push(name),
                Err(e) => {
                    log::error!("Skipping capability {}: {}", name, e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        report
    }

    /// Remove a capability (by canonical name or alias) and its aliases.
    ///
    /// An `on_unload` failure is logged; the capability is removed anyway.
    pub async fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let _guard = self.lifecycle.lock().await;
        self.unregister_locked(name).await
    }

    /// Hot-reload: unregister then register the same instance.
    pub async fn reload(&self, name: &str) -> Result<Registration, RegistryError> {
        let _guard = self.lifecycle.lock().await;
        let capability = self.get_or_err(name)?;
        let canonical = capability.descriptor().name.clone();
        self.unregister_locked(&canonical).await?;
        let outcome = self.register_locked(capability).await?;
        log::info!("Reloaded capability {}", canonical);
        Ok(outcome)
    }

    async fn register_locked(
        &self,
        capability: Arc<dyn DynCapability>,
    ) -> Result<Registration, RegistryError> {
        let descriptor = capability.descriptor();
        let name = descriptor.name.clone();
        let version = descriptor.version.clone();

        descriptor
            .validate()
            .map_err(|reason| RegistryError::InvalidDescriptor {
                name: name.clone(),
                reason,
            })?;

        let rollback = {
            let mut tables = self.tables.write();
            if let Some(current) = tables.metadata.get(&name) {
                if current.version == version {
                    log::debug!("Capability {}@{} already registered", name, version);
                    return Ok(Registration::Unchanged);
                }
                if !is_newer_version(&version, &current.version) {
                    log::warn!(
                        "Ignoring {}@{}: version {} is already registered",
                        name,
                        version,
                        current.version
                    );
                    return Ok(Registration::Unchanged);
                }
            }
            tables.check_conflicts(descriptor)?;
            tables.insert(Arc::clone(&capability))
        };

        if let Err(source) = capability.on_load().await {
            self.tables.write().restore(rollback);
            log::error!("on_load failed for {}@{}, registration rolled back", name, version);
            return Err(RegistryError::LoadHookFailed { name, source });
        }

        log::info!("Registered capability {}@{}", name, version);
        Ok(Registration::Registered)
    }

    async fn unregister_locked(&self, name: &str) -> Result<(), RegistryError> {
        let (canonical, capability) = {
            let tables = self.tables.read();
            let canonical = tables
                .resolve(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?
                .to_string();
            let capability = tables
                .plugins
                .get(&canonical)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            (canonical, capability)
        };

        if let Err(source) = capability.on_unload().await {
            let err = RegistryError::UnloadHookFailed {
                name: canonical.clone(),
                source,
            };
            log::warn!("{}; removing anyway", err);
        }

        self.tables.write().remove(&canonical);
        log::info!("Unregistered capability {}", canonical);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Resolve by canonical name, then by alias.
    pub fn get(&self, name: &str) -> Option<Arc<dyn DynCapability>> {
        let tables = self.tables.read();
        let canonical = tables.resolve(name)?;
        tables.plugins.get(canonical).cloned()
    }

    /// Like [`get`](Self::get) but with a `NotFound` error.
    pub fn get_or_err(&self, name: &str) -> Result<Arc<dyn DynCapability>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Canonical name for a name or alias.
    pub fn resolve_name(&self, name: &str) -> Option<String> {
        self.tables.read().resolve(name).map(str::to_string)
    }

    pub fn get_metadata(&self, name: &str) -> Option<CapabilityDescriptor> {
        let tables = self.tables.read();
        let canonical = tables.resolve(name)?;
        tables.metadata.get(canonical).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tables.read().resolve(name).is_some()
    }

    /// Canonical names, sorted.
    pub fn all_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().plugins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every version ever registered under `name`, oldest first.
    pub fn versions(&self, name: &str) -> Vec<String> {
        let tables = self.tables.read();
        let canonical = tables.resolve(name).unwrap_or(name);
        tables.versions.get(canonical).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().plugins.is_empty()
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Descriptors matching `filter`, sorted by `(category, name)`.
    pub fn list(&self, filter: &ListFilter) -> Vec<CapabilityDescriptor> {
        self.tables.read().sorted_descriptors(|d| filter.matches(d))
    }

    /// Case-insensitive substring search over name, description and tags.
    pub fn search(&self, query: &str) -> Vec<CapabilityDescriptor> {
        let needle = query.to_lowercase();
        self.tables.read().sorted_descriptors(|d| {
            d.name.to_lowercase().contains(&needle)
                || d.description.to_lowercase().contains(&needle)
                || d.tags.iter().any(|t| t.to_lowercase().contains(&needle))
        })
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let tables = self.tables.read();
        let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
        for descriptor in tables.metadata.values() {
            *by_category
                .entry(descriptor.category.as_str().to_string())
                .or_default() += 1;
        }
        let categories: HashSet<Category> = tables.metadata.values().map(|d| d.category).collect();
        RegistryStatistics {
            total: tables.plugins.len(),
            categories: categories.len(),
            by_category,
            total_versions: tables
                .plugins
                .keys()
                .filter_map(|name| tables.versions.get(name))
                .map(Vec::len)
                .sum(),
            aliases: tables.aliases.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Tool export
    // -----------------------------------------------------------------------

    /// Tool descriptors for every registered capability.
    pub fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.collect_tools(|_| true)
    }

    /// Tool descriptors for capabilities exposed to `caller`.
    pub fn tools_for_caller(&self, caller: CallerClass) -> Vec<ToolDescriptor> {
        self.collect_tools(|d| d.allows_caller(caller))
    }

    /// Map a sanitized tool name back to its canonical capability name.
    pub fn resolve_tool_name(&self, tool_name: &str) -> Option<String> {
        self.tool_descriptors()
            .into_iter()
            .find(|t| t.name == tool_name || t.capability == tool_name)
            .map(|t| t.capability)
    }

    fn collect_tools(&self, keep: impl Fn(&CapabilityDescriptor) -> bool) -> Vec<ToolDescriptor> {
        let capabilities: Vec<Arc<dyn DynCapability>> = {
            let tables = self.tables.read();
            tables
                .sorted_descriptors(|d| keep(d))
                .iter()
                .filter_map(|d| tables.plugins.get(&d.name).cloned())
                .collect()
        };
        capabilities
            .iter()
            .map(|c| c.to_tool_descriptor())
            .collect()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &tables.plugins.len())
            .field("aliases", &tables.aliases.len())
            .finish()
    }
}
