use crate::resource::FrameworkId;
use serde::{Deserialize, Serialize};

/// Static configuration for one registered framework plugin.
///
/// `schedule_tick` (the running counter compared against
/// `schedule_interval` each tick) is deliberately not part of this struct:
/// it is runtime state owned by the plugin instance, not config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkConfig {
    pub name: FrameworkId,
    /// Lower value = more important. A framework may seize a resource held
    /// by another framework only if its priority is strictly lower
    /// (numerically greater) than its own.
    pub priority: i64,
    #[serde(default = "default_true")]
    pub seize_enabled: bool,
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval: u32,
    #[serde(default)]
    pub is_default: bool,
}

fn default_true() -> bool {
    true
}

fn default_schedule_interval() -> u32 {
    1
}

impl FrameworkConfig {
    /// True if `self` may seize a resource currently held by `other`.
    pub fn outranks(&self, other_priority: i64) -> bool {
        self.priority < other_priority
    }
}
