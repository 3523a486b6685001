use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fc_core::{FrameworkId, OwnershipTable, ResourceId, ResourceRegistry, SeizeRecord};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::plugin::FrameworkPlugin;

/// How long a `Seized{to}` resource waits for `to` to call `accept_resource`
/// before the coordinator reclaims it and puts it back to `Free`. Matches
/// the reference framework's 90 second grant window.
pub const SEIZE_TIMEOUT: Duration = Duration::from_secs(90);

struct CoordinatorState {
    ownership: OwnershipTable,
    seize_records: SeizeRecord,
    seize_timers: HashMap<ResourceId, JoinHandle<()>>,
    pending_reconnect: HashSet<ResourceId>,
}

struct CoordinatorShared {
    state: Mutex<CoordinatorState>,
    resources: ResourceRegistry,
    priorities: HashMap<FrameworkId, i64>,
    seize_enabled: HashMap<FrameworkId, bool>,
    plugins: HashMap<FrameworkId, Arc<dyn FrameworkPlugin>>,
    default_framework: Option<FrameworkId>,
    priority_scheduler: bool,
}

/// Cheap, `Clone`-able handle to the coordinator's shared state. The
/// ownership table and seize bookkeeping live behind a single
/// `tokio::sync::Mutex` — every transition is short, so serializing them
/// costs nothing, and it sidesteps the single-threaded-event-loop
/// assumption the original coordinator was written under (see the design
/// notes on concurrency).
#[derive(Clone)]
pub struct Coordinator(Arc<CoordinatorShared>);

impl Coordinator {
    pub fn new(
        resources: ResourceRegistry,
        registered_frameworks: &[FrameworkId],
        priorities: HashMap<FrameworkId, i64>,
        default_framework: Option<FrameworkId>,
        priority_scheduler: bool,
        plugins: HashMap<FrameworkId, Arc<dyn FrameworkPlugin>>,
    ) -> Self {
        Self::with_seize_enabled(
            resources,
            registered_frameworks,
            priorities,
            HashMap::new(),
            default_framework,
            priority_scheduler,
            plugins,
        )
    }

    /// Like [`Self::new`], but lets callers configure per-framework
    /// `seize_enabled` (§4.3: `coordinate_resources` is a no-op if the
    /// requester's plugin has seize disabled). Frameworks absent from the
    /// map default to seize-enabled, matching [`fc_core::FrameworkConfig`]'s
    /// own default.
    pub fn with_seize_enabled(
        resources: ResourceRegistry,
        registered_frameworks: &[FrameworkId],
        priorities: HashMap<FrameworkId, i64>,
        seize_enabled: HashMap<FrameworkId, bool>,
        default_framework: Option<FrameworkId>,
        priority_scheduler: bool,
        plugins: HashMap<FrameworkId, Arc<dyn FrameworkPlugin>>,
    ) -> Self {
        let ownership = OwnershipTable::new(
            resources.ids().cloned(),
            registered_frameworks.iter().cloned().collect(),
            default_framework.clone(),
            priority_scheduler,
        );

        Self(Arc::new(CoordinatorShared {
            state: Mutex::new(CoordinatorState {
                ownership,
                seize_records: SeizeRecord::new(),
                seize_timers: HashMap::new(),
                pending_reconnect: HashSet::new(),
            }),
            resources,
            priorities,
            seize_enabled,
            plugins,
            default_framework,
            priority_scheduler,
        }))
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.0.resources
    }

    pub fn priority_scheduler(&self) -> bool {
        self.0.priority_scheduler
    }

    pub fn is_default_framework(&self, framework: &str) -> bool {
        self.0.default_framework.as_deref() == Some(framework)
    }

    pub async fn managed_resources_status(&self) -> HashMap<ResourceId, String> {
        self.0.state.lock().await.ownership.status_snapshot()
    }

    pub async fn is_resource_non_available(&self, resource: &str) -> bool {
        self.0.state.lock().await.ownership.is_non_available(resource)
    }

    pub async fn is_seized_resource(&self, framework: &str, resource: &str) -> bool {
        self.0.state.lock().await.ownership.is_seized(framework, resource)
    }

    pub async fn is_seized_job(&self, job_id: &str) -> bool {
        self.0.state.lock().await.seize_records.is_seized_job(job_id)
    }

    pub async fn clear_seized_job_records(&self, resource: &str) {
        self.0
            .state
            .lock()
            .await
            .seize_records
            .clear_for_resource(resource);
    }

    /// Whether `resource` can be granted to `framework` right now. If the
    /// resource is `Free` and a default framework other than `framework`
    /// is configured, this negotiates the default-framework disconnect
    /// bridge before answering — matching the source's `fc` placeholder
    /// ownership convention (§5, Component Design).
    pub async fn is_resource_available(&self, framework: &str, resource: &str) -> bool {
        use fc_core::Availability;

        let (availability, default_framework) = {
            let state = self.0.state.lock().await;
            (
                state.ownership.availability(framework, resource),
                self.0.default_framework.clone(),
            )
        };

        match availability {
            Availability::SeizedForRequester => true,
            Availability::Free => match default_framework {
                Some(default) if default != framework => {
                    let Some(plugin) = self.0.plugins.get(&default) else {
                        return false;
                    };
                    let outcome = plugin.default_framework_disconnect(resource).await;
                    if outcome.touched {
                        let mut state = self.0.state.lock().await;
                        if outcome.success {
                            state.ownership.mark_managed_disconnect(resource);
                        } else {
                            state.pending_reconnect.insert(resource.to_string());
                        }
                    }
                    outcome.success
                }
                _ => true,
            },
            Availability::Unavailable => false,
        }
    }

    /// Attempt to seize lower-priority-held resources among `candidates`
    /// on behalf of `framework`/`job_id`. Returns the resources the
    /// framework may proceed to use: every high-priority candidate
    /// unchanged, plus at most one freshly seized victim. No-op
    /// (returns candidates unchanged) if the priority scheduler is
    /// disabled — seizing is a priority-scheduler-only feature.
    pub async fn coordinate_resources(
        &self,
        framework: &str,
        job_id: &str,
        candidates: &[ResourceId],
    ) -> Vec<ResourceId> {
        if !self.0.priority_scheduler || candidates.is_empty() {
            return Vec::new();
        }

        if !self.0.seize_enabled.get(framework).copied().unwrap_or(true) {
            return Vec::new();
        }

        let Some(&requester_priority) = self.0.priorities.get(framework) else {
            return Vec::new();
        };

        let (high, low, holder) = {
            let state = self.0.state.lock().await;
            let (high, low) =
                state
                    .ownership
                    .partition_by_seizability(requester_priority, &self.0.priorities, candidates);

            let holder = low.first().and_then(|victim| {
                match state.ownership.state_of(victim) {
                    Some(fc_core::OwnershipState::Held { framework }) => Some(framework.clone()),
                    _ => None,
                }
            });

            (high, low, holder)
        };

        let Some(victim) = low.into_iter().next() else {
            return high;
        };
        let Some(holder) = holder else {
            return high;
        };

        {
            let mut state = self.0.state.lock().await;
            state.seize_records.record(job_id, victim.clone());
            state.ownership.begin_seize(&victim, &holder, framework);
        }

        if let Some(plugin) = self.0.plugins.get(&holder) {
            plugin.force_kick_off(&victim).await;
        }

        let expires_at = Utc::now() + chrono::Duration::from_std(SEIZE_TIMEOUT).unwrap();
        {
            let mut state = self.0.state.lock().await;
            state.ownership.complete_seize(&victim, framework, expires_at);
        }

        self.arm_seize_timer(victim.clone()).await;

        let mut result = high;
        result.push(victim);
        result
    }

    async fn arm_seize_timer(&self, resource: ResourceId) {
        let this = self.clone();
        let resource_for_task = resource.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(SEIZE_TIMEOUT).await;
            this.expire_seize(&resource_for_task).await;
        });

        let mut state = self.0.state.lock().await;
        if let Some(old) = state.seize_timers.insert(resource, handle) {
            old.abort();
        }
    }

    async fn expire_seize(&self, resource: &str) {
        let mut state = self.0.state.lock().await;
        state.seize_timers.remove(resource);
        tracing::warn!(resource, "seize grant expired unaccepted, reverting to free");
        state.ownership.reset(resource);
        state.seize_records.clear_for_resource(resource);
    }

    /// `framework` claims `resource`, cancelling any pending seize-expiry
    /// timer for it.
    pub async fn accept_resource(&self, framework: &str, resource: &str) {
        use fc_core::AcceptOutcome;

        let mut state = self.0.state.lock().await;
        if let AcceptOutcome::Accepted {
            had_pending_seize_timer: true,
        } = state.ownership.accept(resource, framework)
        {
            if let Some(handle) = state.seize_timers.remove(resource) {
                handle.abort();
            }
        }
        state.seize_records.clear_for_resource(resource);
    }

    /// `resource` is returned to `Free`, reconnecting it to the default
    /// framework if the coordinator disconnected it on that framework's
    /// behalf earlier.
    pub async fn return_resource(&self, resource: &str) {
        use fc_core::ReturnOutcome;

        let needs_reconnect = {
            let mut state = self.0.state.lock().await;
            matches!(
                state.ownership.return_to_free(resource),
                ReturnOutcome::Freed {
                    needs_default_reconnect: true
                }
            )
        };

        if !needs_reconnect {
            return;
        }

        let Some(default) = self.0.default_framework.clone() else {
            return;
        };
        let Some(plugin) = self.0.plugins.get(&default) else {
            return;
        };

        if !plugin.default_framework_connect(resource).await {
            self.0
                .state
                .lock()
                .await
                .pending_reconnect
                .insert(resource.to_string());
        }
    }

    pub async fn retire_resource(&self, resource: &str) -> bool {
        self.0.state.lock().await.ownership.retire(resource)
    }

    pub async fn reset_resource(&self, resource: &str) -> bool {
        self.0.state.lock().await.ownership.reset(resource)
    }

    /// Retries `default_framework_connect` for every resource that failed
    /// to reconnect earlier. Called once per tick from [`crate::run`]
    /// before any plugin's `schedule`, mirroring the reconnect-retry pass
    /// the reference coordinator runs ahead of each scheduling round.
    pub async fn retry_pending_reconnects(&self) {
        let Some(default) = self.0.default_framework.clone() else {
            return;
        };
        let Some(plugin) = self.0.plugins.get(&default).cloned() else {
            return;
        };

        let pending: Vec<ResourceId> = {
            let state = self.0.state.lock().await;
            state.pending_reconnect.iter().cloned().collect()
        };

        for resource in pending {
            if plugin.default_framework_connect(&resource).await {
                self.0.state.lock().await.pending_reconnect.remove(&resource);
            }
        }
    }

    pub fn plugins(&self) -> impl Iterator<Item = (&FrameworkId, &Arc<dyn FrameworkPlugin>)> {
        self.0.plugins.iter()
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn FrameworkPlugin>> {
        self.0.plugins.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::FrameworkPlugin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Minimal [`FrameworkPlugin`] stand-in for coordinator tests: records
    /// how many times each hook fired and lets a test script the outcome
    /// of the default-framework bridge.
    struct FakePlugin {
        name: String,
        kicked: AtomicUsize,
        disconnect_outcome: DisconnectOutcome,
    }

    impl FakePlugin {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                kicked: AtomicUsize::new(0),
                disconnect_outcome: DisconnectOutcome {
                    success: true,
                    touched: true,
                },
            })
        }
    }

    #[async_trait::async_trait]
    impl FrameworkPlugin for FakePlugin {
        fn name(&self) -> &str {
            &self.name
        }

        async fn init(&self, _coordinator: Coordinator) {}

        async fn schedule(&self, _coordinator: Coordinator) {}

        async fn force_kick_off(&self, _resource: &str) {
            self.kicked.fetch_add(1, Ordering::SeqCst);
        }

        async fn default_framework_disconnect(&self, _resource: &str) -> DisconnectOutcome {
            self.disconnect_outcome
        }

        async fn default_framework_connect(&self, _resource: &str) -> bool {
            true
        }
    }

    fn coordinator_with(
        resources: &[&str],
        frameworks: &[(&str, i64)],
        default_framework: Option<&str>,
        priority_scheduler: bool,
    ) -> (Coordinator, HashMap<FrameworkId, Arc<FakePlugin>>) {
        let mut registry = ResourceRegistry::new();
        for r in resources {
            registry.insert(*r, "lab-a", "device-type");
        }

        let registered: Vec<FrameworkId> = frameworks.iter().map(|(n, _)| n.to_string()).collect();
        let priorities: HashMap<FrameworkId, i64> = frameworks
            .iter()
            .map(|(n, p)| (n.to_string(), *p))
            .collect();

        let mut fakes = HashMap::new();
        let mut plugins: HashMap<FrameworkId, Arc<dyn FrameworkPlugin>> = HashMap::new();
        for (name, _) in frameworks {
            let fake = FakePlugin::new(name);
            fakes.insert(name.to_string(), fake.clone());
            plugins.insert(name.to_string(), fake as Arc<dyn FrameworkPlugin>);
        }

        let coordinator = Coordinator::new(
            registry,
            &registered,
            priorities,
            default_framework.map(str::to_string),
            priority_scheduler,
            plugins,
        );

        (coordinator, fakes)
    }

    #[tokio::test]
    async fn accept_then_return_round_trips_to_free() {
        let (c, _) = coordinator_with(&["r1"], &[("lava", 1)], None, false);
        c.accept_resource("lava", "r1").await;
        assert_eq!(
            c.managed_resources_status().await.get("r1").map(String::as_str),
            Some("lava")
        );
        c.return_resource("r1").await;
        assert_eq!(
            c.managed_resources_status().await.get("r1").map(String::as_str),
            Some("fc")
        );
    }

    #[tokio::test]
    async fn coordinate_resources_is_noop_when_priority_scheduler_disabled() {
        let (c, fakes) = coordinator_with(&["r1"], &[("lava", 1), ("labgrid", 2)], None, false);
        c.accept_resource("labgrid", "r1").await;

        let granted = c.coordinate_resources("lava", "job-1", &["r1".to_string()]).await;
        assert!(granted.is_empty());
        assert_eq!(fakes["labgrid"].kicked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn coordinate_resources_seizes_lower_priority_holder() {
        let (c, fakes) = coordinator_with(&["r1"], &[("lava", 1), ("labgrid", 2)], None, true);
        c.accept_resource("labgrid", "r1").await;

        let granted = c.coordinate_resources("lava", "job-1", &["r1".to_string()]).await;
        assert_eq!(granted, vec!["r1".to_string()]);
        assert_eq!(fakes["labgrid"].kicked.load(Ordering::SeqCst), 1);
        assert!(c.is_seized_resource("lava", "r1").await);
        assert!(c.is_seized_job("job-1").await);

        // The requester observing its own grant clears the seize record and
        // cancels the expiry timer.
        c.clear_seized_job_records("r1").await;
        c.accept_resource("lava", "r1").await;
        assert!(!c.is_seized_job("job-1").await);
        assert_eq!(
            c.managed_resources_status().await.get("r1").map(String::as_str),
            Some("lava")
        );
    }

    #[tokio::test]
    async fn coordinate_resources_never_seizes_equal_priority_holder() {
        let (c, fakes) = coordinator_with(&["r1"], &[("lava", 1), ("labgrid", 1)], None, true);
        c.accept_resource("labgrid", "r1").await;

        let granted = c.coordinate_resources("lava", "job-1", &["r1".to_string()]).await;
        assert!(granted.is_empty());
        assert_eq!(fakes["labgrid"].kicked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn is_resource_available_negotiates_default_framework_bridge() {
        let (c, fakes) = coordinator_with(
            &["r1"],
            &[("lava", 1), ("labgrid", 2)],
            Some("lava"),
            false,
        );

        // r1 is Free; labgrid (non-default) asking must bounce through the
        // default framework's disconnect bridge.
        assert!(c.is_resource_available("labgrid", "r1").await);
        assert_eq!(fakes["lava"].kicked.load(Ordering::SeqCst), 0);

        // The default framework itself never needs the bridge.
        assert!(c.is_resource_available("lava", "r1").await);
    }

    #[tokio::test]
    async fn empty_candidates_return_empty_with_no_state_change() {
        let (c, _) = coordinator_with(&["r1"], &[("lava", 1)], None, true);
        let granted = c.coordinate_resources("lava", "job-1", &[]).await;
        assert!(granted.is_empty());
        assert_eq!(
            c.managed_resources_status().await.get("r1").map(String::as_str),
            Some("fc")
        );
    }
}
