// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plugin dispatch: the capability trait and the process-wide registry.

use cordon_core::JobPayload;
use cordon_core::check::{CheckResult, ExecutionContext};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

/// An ecosystem-specific safety check, linked at build time.
///
/// Plugins run after the deny/allow lists; they may deny outright, require
/// the approval gate, or contribute metadata to the verdict. A plugin that
/// returns an error (rather than a verdict) is soft-failed by the chain.
pub trait Plugin: Send + Sync {
    /// Stable plugin name, referenced by job `plugin_metadata`.
    fn name(&self) -> &'static str;

    /// Inspect a candidate before execution.
    ///
    /// # Errors
    ///
    /// An `Err` is treated as a plugin malfunction: the chain logs it and
    /// continues with the remaining plugins.
    fn pre_run_check(
        &self,
        ctx: &ExecutionContext,
        payload: &JobPayload,
    ) -> anyhow::Result<CheckResult>;

    /// Whether this plugin always demands approval for the candidate,
    /// independent of its `pre_run_check` verdict.
    fn requires_approval(&self, _payload: &JobPayload) -> bool {
        false
    }

    /// Scopes this plugin understands and may enforce.
    fn scopes(&self) -> Vec<String> {
        vec![]
    }
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    enabled: bool,
}

/// A named registry of [`Plugin`] implementations with enable/disable
/// toggles.
///
/// One registry exists per process ([`global_registry`]); tests construct
/// their own and inject it into the chain.
#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<BTreeMap<String, PluginEntry>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its own name, enabled, replacing any
    /// previous entry.
    pub fn register(&self, plugin: impl Plugin + 'static) {
        let mut entries = self.entries.write().expect("plugin registry poisoned");
        entries.insert(
            plugin.name().to_string(),
            PluginEntry {
                plugin: Arc::new(plugin),
                enabled: true,
            },
        );
    }

    /// Enable a plugin by name. Returns `false` when unknown.
    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Disable a plugin by name. Returns `false` when unknown.
    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut entries = self.entries.write().expect("plugin registry poisoned");
        match entries.get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Look up an enabled plugin by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let entries = self.entries.read().expect("plugin registry poisoned");
        entries
            .get(name)
            .filter(|e| e.enabled)
            .map(|e| Arc::clone(&e.plugin))
    }

    /// All enabled plugins, in name order.
    #[must_use]
    pub fn enabled_plugins(&self) -> Vec<Arc<dyn Plugin>> {
        let entries = self.entries.read().expect("plugin registry poisoned");
        entries
            .values()
            .filter(|e| e.enabled)
            .map(|e| Arc::clone(&e.plugin))
            .collect()
    }

    /// Sorted names of all registered plugins (enabled or not).
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.read().expect("plugin registry poisoned");
        entries.keys().cloned().collect()
    }
}

/// The process-wide registry, populated with the built-in plugins on first
/// access.
pub fn global_registry() -> &'static Arc<PluginRegistry> {
    static INSTANCE: OnceLock<Arc<PluginRegistry>> = OnceLock::new();
    INSTANCE.get_or_init(|| {
        let registry = PluginRegistry::new();
        crate::builtin::register_builtins(&registry);
        Arc::new(registry)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedPlugin(&'static str);

    impl Plugin for NamedPlugin {
        fn name(&self) -> &'static str {
            self.0
        }
        fn pre_run_check(
            &self,
            _ctx: &ExecutionContext,
            _payload: &JobPayload,
        ) -> anyhow::Result<CheckResult> {
            Ok(CheckResult::allow())
        }
    }

    #[test]
    fn register_and_get() {
        let registry = PluginRegistry::new();
        registry.register(NamedPlugin("alpha"));
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("beta").is_none());
    }

    #[test]
    fn disable_hides_from_lookup_and_listing() {
        let registry = PluginRegistry::new();
        registry.register(NamedPlugin("alpha"));
        registry.register(NamedPlugin("beta"));

        assert!(registry.disable("alpha"));
        assert!(registry.get("alpha").is_none());
        assert_eq!(registry.enabled_plugins().len(), 1);

        assert!(registry.enable("alpha"));
        assert_eq!(registry.enabled_plugins().len(), 2);
    }

    #[test]
    fn toggling_unknown_plugin_returns_false() {
        let registry = PluginRegistry::new();
        assert!(!registry.enable("ghost"));
        assert!(!registry.disable("ghost"));
    }

    #[test]
    fn enabled_plugins_are_name_ordered() {
        let registry = PluginRegistry::new();
        registry.register(NamedPlugin("zeta"));
        registry.register(NamedPlugin("alpha"));
        let names: Vec<&str> = registry
            .enabled_plugins()
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn global_registry_carries_builtins() {
        let registry = global_registry();
        let names = registry.names();
        for expected in ["aws", "git", "kubernetes"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }
}
