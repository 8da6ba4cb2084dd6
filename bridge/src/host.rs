//! Host console capability surface.

use adit_types::{BridgeStatus, DefinitionSet};

/// Configuration keys the engine persists through [`Host::save_config`].
pub mod config_keys {
    pub const DEFINITION_CACHE: &str = "definition_cache";
    pub const CONTROL_INTERFACE_ID: &str = "control_interface_id";
    pub const CACHED_CHANNEL_NAME: &str = "cached_channel_name";
}

/// Capabilities the embedding console provides to the engine.
///
/// The engine pushes status transitions, variable values and definition
/// re-binds, and persists small configuration values (the control interface
/// id, the definition cache) back through `save_config`. Implementations are
/// called from the engine's own tasks and must return promptly without
/// calling back into the engine.
pub trait Host: Send + Sync + 'static {
    fn set_status(&self, status: &BridgeStatus);

    /// Publish variable values: engine diagnostics and primary-gated
    /// passthrough updates alike.
    fn set_variable_values(&self, values: &[(String, String)]);

    /// The selected channel's definitions changed; re-bind actions and
    /// variable registrations.
    fn rebind_definitions(&self, definitions: &DefinitionSet);

    fn save_config(&self, key: &str, value: &str);
}

/// Host for running the bridge standalone: everything goes to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingHost;

impl Host for TracingHost {
    fn set_status(&self, status: &BridgeStatus) {
        tracing::info!(level = %status.level, message = %status.message, "status");
    }

    fn set_variable_values(&self, values: &[(String, String)]) {
        for (id, value) in values {
            tracing::debug!(%id, %value, "variable");
        }
    }

    fn rebind_definitions(&self, definitions: &DefinitionSet) {
        tracing::info!(
            channels = definitions.channels.len(),
            variables = definitions.variables.len(),
            rules = definitions.rules.len(),
            "definitions changed",
        );
    }

    fn save_config(&self, key: &str, value: &str) {
        tracing::debug!(%key, bytes = value.len(), "config persisted");
    }
}
