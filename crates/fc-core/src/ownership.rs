use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::{FrameworkId, ResourceId};

/// The state of one managed resource. Every managed resource has exactly
/// one of these at all times (Invariant 1, spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OwnershipState {
    /// No framework holds it; the coordinator may grant it.
    Free,
    /// A specific framework is actively using it.
    Held { framework: FrameworkId },
    /// Transient: `to` is attempting to preempt `from`; force-kick-off is
    /// in flight.
    Seizing { from: FrameworkId, to: FrameworkId },
    /// Preempted; `to` has been granted but has not yet accepted it.
    /// Carries the wall-clock deadline after which it reverts to `Free`.
    Seized { to: FrameworkId, expires_at: DateTime<Utc> },
    /// The device has disappeared from its backing framework's inventory.
    /// No grants allowed.
    Retired,
}

impl fmt::Display for OwnershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipState::Free => write!(f, "fc"),
            OwnershipState::Held { framework } => write!(f, "{framework}"),
            OwnershipState::Seizing { from, to } => write!(f, "{to}_seizing (from {from})"),
            OwnershipState::Seized { to, .. } => write!(f, "{to}_seized"),
            OwnershipState::Retired => write!(f, "retired"),
        }
    }
}

/// Outcome of [`OwnershipTable::accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Transition applied. `had_pending_seize_timer` is true if the
    /// resource was `Seized` and the caller must cancel its expiry task.
    Accepted { had_pending_seize_timer: bool },
    /// Resource is not in the managed set; no-op.
    UnknownResource,
}

/// Outcome of [`OwnershipTable::return_to_free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// Transition applied. `needs_default_reconnect` is true if the
    /// default-framework bridge must be asked to reconnect this resource.
    Freed { needs_default_reconnect: bool },
    /// Resource was not `Held` by a registered framework; no-op.
    NotHeld,
    /// Resource is not in the managed set; no-op.
    UnknownResource,
}

/// What [`OwnershipTable::availability`] found for a (framework, resource)
/// pair, prior to any default-framework bridge negotiation (which requires
/// awaiting the default plugin and so cannot live in this synchronous,
/// no-tokio crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Free. If a default framework is configured and the asking framework
    /// isn't it, the caller must negotiate the bridge before treating this
    /// as available.
    Free,
    /// Already `Seized{requester}` — available to the requester directly.
    SeizedForRequester,
    /// Held by someone else, mid-seize, retired, or unknown to the table.
    Unavailable,
}

/// Mutable mapping: resource -> `OwnershipState`. The coordinator is the
/// only component allowed to mutate this table (Invariant 4); plugins only
/// request transitions through the coordinator's query/command methods.
///
/// This table is deliberately synchronous and side-effect free: anything
/// that needs to await a plugin (the default-framework disconnect/connect
/// bridge, force-kick-off) lives one layer up, in the async coordinator.
#[derive(Debug, Clone)]
pub struct OwnershipTable {
    state: HashMap<ResourceId, OwnershipState>,
    registered_frameworks: HashSet<FrameworkId>,
    default_framework: Option<FrameworkId>,
    /// Resources currently disconnected from the default framework's
    /// inventory on the coordinator's behalf; cleared (and reconnect
    /// triggered) on `return_to_free`.
    managed_disconnect: HashSet<ResourceId>,
    priority_scheduler: bool,
}

impl OwnershipTable {
    /// Build a table with every resource in `resources` starting `Free`.
    pub fn new(
        resources: impl IntoIterator<Item = ResourceId>,
        registered_frameworks: HashSet<FrameworkId>,
        default_framework: Option<FrameworkId>,
        priority_scheduler: bool,
    ) -> Self {
        let state = resources
            .into_iter()
            .map(|r| (r, OwnershipState::Free))
            .collect();

        Self {
            state,
            registered_frameworks,
            default_framework,
            managed_disconnect: HashSet::new(),
            priority_scheduler,
        }
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.state.contains_key(resource)
    }

    pub fn managed_resources(&self) -> impl Iterator<Item = &ResourceId> {
        self.state.keys()
    }

    pub fn status_snapshot(&self) -> HashMap<ResourceId, String> {
        self.state
            .iter()
            .map(|(id, state)| (id.clone(), state.to_string()))
            .collect()
    }

    pub fn state_of(&self, resource: &str) -> Option<&OwnershipState> {
        self.state.get(resource)
    }

    pub fn default_framework(&self) -> Option<&str> {
        self.default_framework.as_deref()
    }

    pub fn is_default_framework(&self, framework: &str) -> bool {
        self.default_framework.as_deref() == Some(framework)
    }

    pub fn is_managed_disconnect(&self, resource: &str) -> bool {
        self.managed_disconnect.contains(resource)
    }

    fn set(&mut self, resource: &str, new_state: OwnershipState) {
        tracing::info!(resource = %resource, state = %new_state, "* {resource} now belongs to {new_state}");
        self.state.insert(resource.to_string(), new_state);
    }

    /// Transition to `Held{framework}`. No-op if `resource` is unknown.
    pub fn accept(&mut self, resource: &str, framework: &str) -> AcceptOutcome {
        if !self.state.contains_key(resource) {
            tracing::warn!(resource = %resource, "accept on unknown resource ignored");
            return AcceptOutcome::UnknownResource;
        }

        let had_pending_seize_timer = matches!(
            self.state.get(resource),
            Some(OwnershipState::Seized { .. })
        );

        self.set(
            resource,
            OwnershipState::Held {
                framework: framework.to_string(),
            },
        );

        AcceptOutcome::Accepted {
            had_pending_seize_timer,
        }
    }

    /// If currently `Held` by a registered framework, transition to `Free`.
    pub fn return_to_free(&mut self, resource: &str) -> ReturnOutcome {
        let Some(current) = self.state.get(resource) else {
            return ReturnOutcome::UnknownResource;
        };

        let is_held_by_registered = matches!(
            current,
            OwnershipState::Held { framework } if self.registered_frameworks.contains(framework)
        );

        if !is_held_by_registered {
            return ReturnOutcome::NotHeld;
        }

        self.set(resource, OwnershipState::Free);

        let needs_default_reconnect =
            self.default_framework.is_some() && self.managed_disconnect.remove(resource);

        ReturnOutcome::Freed {
            needs_default_reconnect,
        }
    }

    /// Explicit transition to `Retired`. No-op if `resource` is unknown.
    pub fn retire(&mut self, resource: &str) -> bool {
        if !self.state.contains_key(resource) {
            return false;
        }
        self.set(resource, OwnershipState::Retired);
        true
    }

    /// Explicit transition to `Free`. No-op if `resource` is unknown.
    pub fn reset(&mut self, resource: &str) -> bool {
        if !self.state.contains_key(resource) {
            return false;
        }
        self.set(resource, OwnershipState::Free);
        true
    }

    /// Pure classification used by the async `is_resource_available`
    /// coordinator method to decide whether a default-framework bridge
    /// negotiation is needed.
    pub fn availability(&self, framework: &str, resource: &str) -> Availability {
        match self.state.get(resource) {
            Some(OwnershipState::Free) => Availability::Free,
            Some(OwnershipState::Seized { to, .. }) if to == framework => {
                Availability::SeizedForRequester
            }
            _ => Availability::Unavailable,
        }
    }

    /// Record that `resource` was disconnected from the default framework
    /// on the coordinator's behalf, so `return_to_free` later reconnects it.
    pub fn mark_managed_disconnect(&mut self, resource: &str) {
        self.managed_disconnect.insert(resource.to_string());
    }

    /// True iff `Held{*}` for some registered framework.
    pub fn is_non_available(&self, resource: &str) -> bool {
        matches!(
            self.state.get(resource),
            Some(OwnershipState::Held { framework }) if self.registered_frameworks.contains(framework)
        )
    }

    /// True iff `Seized{framework}`. Gated by the global priority-scheduler
    /// flag — returns false when scheduling is disabled regardless of state.
    pub fn is_seized(&self, framework: &str, resource: &str) -> bool {
        if !self.priority_scheduler {
            return false;
        }
        matches!(
            self.state.get(resource),
            Some(OwnershipState::Seized { to, .. }) if to == framework
        )
    }

    /// Partition `candidates` into (high, low) where `low` holds resources
    /// currently held by a framework with strictly lower priority (larger
    /// numeric value) than `requester_priority`, i.e. eligible seize
    /// victims. Order within each bucket follows the input order.
    pub fn partition_by_seizability(
        &self,
        requester_priority: i64,
        priorities: &HashMap<FrameworkId, i64>,
        candidates: &[ResourceId],
    ) -> (Vec<ResourceId>, Vec<ResourceId>) {
        let mut high = Vec::new();
        let mut low = Vec::new();

        for candidate in candidates {
            let holder_priority = match self.state.get(candidate) {
                Some(OwnershipState::Held { framework }) => priorities.get(framework).copied(),
                _ => None,
            };

            match holder_priority {
                Some(p) if p > requester_priority => low.push(candidate.clone()),
                _ => high.push(candidate.clone()),
            }
        }

        (high, low)
    }

    /// `Held{from}` -> `Seizing{from, to}`.
    pub fn begin_seize(&mut self, resource: &str, from: &str, to: &str) {
        self.set(
            resource,
            OwnershipState::Seizing {
                from: from.to_string(),
                to: to.to_string(),
            },
        );
    }

    /// `Seizing{.., to}` -> `Seized{to, expires_at}`.
    pub fn complete_seize(&mut self, resource: &str, to: &str, expires_at: DateTime<Utc>) {
        self.set(
            resource,
            OwnershipState::Seized {
                to: to.to_string(),
                expires_at,
            },
        );
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_priority() -> impl Strategy<Value = i64> {
        -5i64..5
    }

    proptest! {
        /// Invariant (§8): two consecutive `accept` calls for the same
        /// framework leave the same observable state as one.
        #[test]
        fn accept_is_idempotent(framework in "[a-z]{2,6}") {
            let mut t = table(&["r1"], &[&framework], None);
            t.accept("r1", &framework);
            let once = t.state_of("r1").cloned();
            t.accept("r1", &framework);
            let twice = t.state_of("r1").cloned();
            prop_assert_eq!(once, twice);
        }

        /// Invariant (§8): accept then return round-trips to `Free` and
        /// clears any managed-disconnect bookkeeping for the resource.
        #[test]
        fn accept_then_return_round_trips(framework in "[a-z]{2,6}") {
            let mut t = table(&["r1"], &[&framework], Some("default-fw"));
            t.accept("r1", &framework);
            t.mark_managed_disconnect("r1");
            t.return_to_free("r1");
            prop_assert_eq!(t.state_of("r1").cloned(), Some(OwnershipState::Free));
            prop_assert!(!t.is_managed_disconnect("r1"));
        }

        /// Invariant (§8): a framework may seize a resource held by another
        /// framework only if its priority is strictly lower (numerically
        /// greater) — equal or higher priority holders are never chosen as
        /// victims.
        #[test]
        fn seize_never_picks_equal_or_higher_priority_holder(
            requester_priority in arb_priority(),
            holder_priority in arb_priority(),
        ) {
            let mut t = table(&["r1"], &["requester", "holder"], None);
            t.accept("r1", "holder");
            let priorities = HashMap::from([
                ("requester".to_string(), requester_priority),
                ("holder".to_string(), holder_priority),
            ]);
            let (high, low) = t.partition_by_seizability(
                requester_priority,
                &priorities,
                &["r1".to_string()],
            );
            if holder_priority > requester_priority {
                prop_assert_eq!(low, vec!["r1".to_string()]);
                prop_assert!(high.is_empty());
            } else {
                prop_assert_eq!(high, vec!["r1".to_string()]);
                prop_assert!(low.is_empty());
            }
        }

        /// Invariant (§3.1): every managed resource always has exactly one
        /// state, regardless of which sequence of valid transitions is
        /// applied to it.
        #[test]
        fn resource_always_has_exactly_one_state(
            ops in proptest::collection::vec(0u8..4, 0..20),
        ) {
            let mut t = table(&["r1"], &["a", "b"], None);
            for op in ops {
                match op {
                    0 => { t.accept("r1", "a"); }
                    1 => { t.return_to_free("r1"); }
                    2 => { t.begin_seize("r1", "a", "b"); }
                    3 => { t.complete_seize("r1", "b", Utc::now()); }
                    _ => unreachable!(),
                }
                prop_assert!(t.state_of("r1").is_some());
            }
        }
    }
}
