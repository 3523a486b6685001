use async_trait::async_trait;

use crate::coordinator::Coordinator;

/// Outcome of a default-framework disconnect attempt, mirroring the
/// source's `(success, touched)` tuple: `touched` tells the coordinator
/// whether it actually changed the device's state in the default
/// framework (and so must remember to reconnect it later), independent of
/// whether the disconnect ultimately succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectOutcome {
    pub success: bool,
    pub touched: bool,
}

/// One registered test framework's integration with the coordinator.
///
/// Implementations are the only code allowed to know a framework's own
/// vocabulary (job tags, reservations, device health states, ...); the
/// coordinator only ever calls through this trait.
#[async_trait]
pub trait FrameworkPlugin: Send + Sync {
    /// Must match the key this plugin is registered under in
    /// `registered_frameworks` / `frameworks_config`.
    fn name(&self) -> &str;

    /// Called once at startup, before the tick loop begins. Reconciles
    /// the framework's own view of its managed resources with the
    /// coordinator's ownership table (e.g. accepting resources the
    /// framework already holds, or requesting disconnects for resources
    /// it shouldn't have if this is the default framework).
    async fn init(&self, coordinator: Coordinator);

    /// Called every tick that is a multiple of this plugin's
    /// `schedule_interval`. Looks at the framework's current demand
    /// (queued jobs, pending reservations, ...), asks the coordinator to
    /// arbitrate resources it wants, and accepts whatever it's granted.
    async fn schedule(&self, coordinator: Coordinator);

    /// Called by the coordinator when this plugin currently holds
    /// `resource` and a higher-priority framework has been granted a
    /// seize on it. Must make a best effort to stop using the resource
    /// promptly; the coordinator does not wait indefinitely (see the
    /// seize expiry timer).
    async fn force_kick_off(&self, resource: &str);

    /// Only meaningful for the configured default framework. Asks this
    /// plugin to disconnect `resource` from its own inventory so another
    /// framework can use it. Returns whether the disconnect succeeded and
    /// whether the framework's state was touched either way.
    ///
    /// The default no-op implementation is for non-default-framework
    /// plugins, which never receive this call — the coordinator only
    /// invokes it on the plugin marked `is_default` in config.
    async fn default_framework_disconnect(&self, _resource: &str) -> DisconnectOutcome {
        DisconnectOutcome {
            success: false,
            touched: false,
        }
    }

    /// Only meaningful for the configured default framework. Asks this
    /// plugin to reconnect `resource` to its own inventory once every
    /// other framework is done with it. Returns whether the reconnect
    /// succeeded; on failure the coordinator keeps retrying on a later
    /// tick rather than leaving the resource stranded outside every
    /// framework's inventory.
    async fn default_framework_connect(&self, _resource: &str) -> bool {
        true
    }
}
