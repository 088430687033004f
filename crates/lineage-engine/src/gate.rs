//! Capability gate for optional engine behaviour.
//!
//! The engine asks a gate before using behaviour that is rolled out behind a
//! flag. Gates answer synchronously. Capabilities listed in
//! [`DEFAULT_ENABLED`] are on unless a flag turns them off; anything else a
//! gate does not know about is off.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Enables the change-count refresh trigger.
pub const SMART_TRIGGER: &str = "refresh.smart_trigger";

/// Capabilities that [`FeatureFlags`] enables when no flag names them.
pub const DEFAULT_ENABLED: &[&str] = &[SMART_TRIGGER];

/// Boolean capability check.
pub trait CapabilityGate: Send + Sync {
    /// Returns `false` for unknown capabilities and on evaluation failure.
    fn is_enabled(&self, capability: &str) -> bool;
}

/// Named boolean flags, usually loaded from configuration.
///
/// Starts from [`DEFAULT_ENABLED`]; configured flags override the defaults.
#[derive(Debug)]
pub struct FeatureFlags {
    flags: RwLock<HashMap<String, bool>>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::from_map(HashMap::new())
    }
}

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(configured: HashMap<String, bool>) -> Self {
        let mut flags: HashMap<String, bool> = DEFAULT_ENABLED
            .iter()
            .map(|name| (name.to_string(), true))
            .collect();
        flags.extend(configured);
        Self {
            flags: RwLock::new(flags),
        }
    }

    /// Builder-style flag setter.
    #[must_use]
    pub fn with(self, name: impl Into<String>, enabled: bool) -> Self {
        self.set(name, enabled);
        self
    }

    /// Changes a flag at runtime.
    pub fn set(&self, name: impl Into<String>, enabled: bool) {
        self.flags.write().insert(name.into(), enabled);
    }

    pub fn remove(&self, name: &str) -> Option<bool> {
        self.flags.write().remove(name)
    }

    /// Snapshot of all flags.
    pub fn list(&self) -> HashMap<String, bool> {
        self.flags.read().clone()
    }
}

impl CapabilityGate for FeatureFlags {
    fn is_enabled(&self, capability: &str) -> bool {
        self.flags.read().get(capability).copied().unwrap_or(false)
    }
}

/// Gate with every capability disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledGate;

impl CapabilityGate for DisabledGate {
    fn is_enabled(&self, _capability: &str) -> bool {
        false
    }
}
