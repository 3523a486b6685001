use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use fc_cli::CliExecutor;
use serde::Deserialize;

use crate::coordinator::Coordinator;
use crate::plugin::{DisconnectOutcome, FrameworkPlugin};

/// Owner string the coordinator uses for its own placeholder reservation
/// on a place, so it can tell "nobody but us has asked for this" apart
/// from a real external reservation.
const SYSTEM_OWNER: &str = "fc/fc";
const SYSTEM_PRIORITY: i64 = 100;
/// Priority of a manually created reservation an operator uses to pin a
/// place for themselves; these are swept on each tick so they don't
/// linger once the operator is done.
const GUARD_PRIORITY: i64 = -100;
/// Wall-clock cap on a single blocking acquire attempt during takeover and
/// switch-over, so a stuck reservation framework never wedges a background
/// task forever (§5, Timeouts).
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(20);
/// Backoff between re-acquire attempts while waiting for a real user to
/// release a place.
const REACQUIRE_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
struct Reservation {
    token: String,
    owner: String,
    state: String,
    priority: i64,
    #[serde(rename = "filters")]
    place: String,
}

/// The part of the plugin cheap enough to clone into spawned takeover and
/// switch-over tasks.
struct Inner {
    name: String,
    cli: CliExecutor,
}

impl Inner {
    async fn reservations(&self) -> Vec<Reservation> {
        self.cli
            .run_yaml(&["reservation", "list", "--format", "yaml"])
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(framework = %self.name, %err, "failed to list reservations");
                Vec::new()
            })
    }

    async fn create_reservation(&self, place: &str, priority: i64) -> Option<String> {
        self.cli
            .run(&[
                "reservation",
                "create",
                "--prio",
                &priority.to_string(),
                &format!("name={place}"),
            ])
            .await
            .ok()
            .and_then(|out| out.lines().find_map(|l| l.strip_prefix("token: ").map(str::to_string)))
    }

    async fn acquire_place(&self, place: &str) -> bool {
        self.cli.run(&["acquire", place]).await.is_ok()
    }

    async fn release_place(&self, place: &str) -> bool {
        self.cli.run(&["release", place]).await.is_ok()
    }

    /// Like [`Self::release_place`], but forces the release even if the
    /// place is currently held by someone other than us — the situation
    /// `force_kick_off` runs in, where the coordinator's own reservation is
    /// already gone and a real external holder now owns the place.
    async fn release_place_forced(&self, place: &str) -> bool {
        self.cli.run(&["release", "-k", place]).await.is_ok()
    }

    async fn cancel_reservation(&self, token: &str) {
        let _ = self.cli.run(&["reservation", "cancel", token]).await;
    }

    /// Creates a fresh priority-100 system reservation for `place` and
    /// retries acquiring it, backing off between attempts, until it
    /// succeeds — i.e. until whichever real user currently holds the
    /// place releases it. Bounds each individual acquire attempt so a
    /// wedged framework can't hang this task forever (it just retries).
    async fn reacquire_when_free(&self, place: &str) {
        loop {
            let Some(token) = self.create_reservation(place, SYSTEM_PRIORITY).await else {
                tokio::time::sleep(REACQUIRE_BACKOFF).await;
                continue;
            };

            match tokio::time::timeout(ACQUIRE_TIMEOUT, self.acquire_place(place)).await {
                Ok(true) => return,
                _ => {
                    self.cancel_reservation(&token).await;
                    tokio::time::sleep(REACQUIRE_BACKOFF).await;
                }
            }
        }
    }

    /// Takeover / switch-over task: once the coordinator's place has been
    /// released (or was never acquired during initial takeover), waits
    /// for a real user to finish and reacquires the system reservation on
    /// the coordinator's behalf, then hands the place back to `Free`
    /// (§4.5, "Switch-over task").
    async fn reacquire_then_return(self: Arc<Self>, coordinator: Coordinator, place: fc_core::ResourceId) {
        self.reacquire_when_free(&place).await;
        coordinator.return_resource(&place).await;
    }
}

/// Reference implementation of a reservation-style framework integration
/// (§5, Reservation-Style Plugin): the coordinator holds each managed
/// place with a standing priority-100 "system" reservation, and releases
/// it only when a real, higher-priority reservation shows up waiting.
pub struct ReservationPlugin {
    inner: Arc<Inner>,
    /// Places this plugin has already seized a job onto, keyed by
    /// reservation token, so a later tick doesn't re-seize the same
    /// waiting reservation.
    seize_cache: StdMutex<HashMap<String, String>>,
}

impl ReservationPlugin {
    pub fn new(name: impl Into<String>, cli: CliExecutor) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                cli,
            }),
            seize_cache: StdMutex::new(HashMap::new()),
        }
    }

    fn spawn_reacquire(&self, coordinator: &Coordinator, place: fc_core::ResourceId) {
        let inner = self.inner.clone();
        let coordinator = coordinator.clone();
        tokio::spawn(async move { inner.reacquire_then_return(coordinator, place).await });
    }

    /// Atomic switch-over (§4.5 step 4): hold the place with a low-priority
    /// guard across the gap, release the coordinator's own acquisition, and
    /// kick off the background task that reclaims it once the real user is
    /// done.
    fn spawn_switch_over(&self, coordinator: &Coordinator, place: fc_core::ResourceId, managed_token: Option<String>) {
        let inner = self.inner.clone();
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            inner.create_reservation(&place, GUARD_PRIORITY).await;
            if let Some(token) = managed_token {
                inner.cancel_reservation(&token).await;
            }
            inner.release_place(&place).await;
            inner.reacquire_then_return(coordinator, place).await;
        });
    }
}

#[async_trait]
impl FrameworkPlugin for ReservationPlugin {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn init(&self, coordinator: Coordinator) {
        let reservations = self.inner.reservations().await;

        for place in coordinator.resources().ids().cloned().collect::<Vec<_>>() {
            let system_reservations: Vec<&Reservation> = reservations
                .iter()
                .filter(|r| r.place == place && r.owner == SYSTEM_OWNER && r.priority == SYSTEM_PRIORITY)
                .collect();

            let already_acquired = system_reservations.iter().any(|r| r.state == "acquired");

            if !already_acquired {
                // Any non-acquired leftover system reservation from a prior
                // run is stale; clear it before trying again.
                for r in &system_reservations {
                    self.inner.cancel_reservation(&r.token).await;
                }

                let token = self.inner.create_reservation(&place, SYSTEM_PRIORITY).await;
                let acquired = self.inner.acquire_place(&place).await;

                if !acquired {
                    // Either a real user held the place before the
                    // coordinator ever started, or this run landed in the
                    // scheduling gap while a previous coordinator instance
                    // was shutting down. Either way, back off and let the
                    // background task reclaim it once it's free.
                    if let Some(token) = token {
                        self.inner.cancel_reservation(&token).await;
                    }
                    self.spawn_reacquire(&coordinator, place.clone());
                }
            }

            // Whoever currently owns the place (if not the coordinator
            // itself) is using it through this framework; reflect that in
            // the ownership table so the rest of the coordinator treats it
            // as held rather than free.
            let owner = reservations
                .iter()
                .find(|r| r.place == place && (r.state == "acquired" || r.state == "allocated"))
                .map(|r| r.owner.as_str());
            if owner.is_some_and(|o| o != SYSTEM_OWNER) {
                coordinator.accept_resource(&self.inner.name, &place).await;
            }
        }
    }

    async fn schedule(&self, coordinator: Coordinator) {
        let reservations = self.inner.reservations().await;

        let managed_tokens: HashMap<&str, &str> = reservations
            .iter()
            .filter(|r| r.owner == SYSTEM_OWNER && matches!(r.state.as_str(), "acquired" | "allocated"))
            .map(|r| (r.place.as_str(), r.token.as_str()))
            .collect();

        for r in &reservations {
            if r.owner == SYSTEM_OWNER && r.state == "allocated" && r.priority == GUARD_PRIORITY {
                tracing::warn!(place = %r.place, token = %r.token, "releasing stale guard reservation");
                self.inner.cancel_reservation(&r.token).await;
                self.inner.release_place(&r.place).await;
                self.inner.create_reservation(&r.place, SYSTEM_PRIORITY).await;
                self.inner.acquire_place(&r.place).await;
            }
        }

        for r in &reservations {
            if r.owner == SYSTEM_OWNER || r.state != "waiting" {
                continue;
            }
            if !coordinator.resources().contains(&r.place) {
                continue;
            }

            if coordinator.is_resource_available(&self.inner.name, &r.place).await {
                if coordinator.is_seized_resource(&self.inner.name, &r.place).await {
                    coordinator.clear_seized_job_records(&r.place).await;
                }
                coordinator.accept_resource(&self.inner.name, &r.place).await;
                let managed_token = managed_tokens.get(r.place.as_str()).map(|t| t.to_string());
                self.spawn_switch_over(&coordinator, r.place.clone(), managed_token);
                continue;
            }

            if !coordinator.priority_scheduler() {
                continue;
            }

            let already_seizing = self.seize_cache.lock().unwrap().contains_key(&r.token);
            if already_seizing {
                continue;
            }

            let granted = coordinator
                .coordinate_resources(&self.inner.name, &r.token, &[r.place.clone()])
                .await;

            if !granted.is_empty() {
                self.seize_cache
                    .lock()
                    .unwrap()
                    .insert(r.token.clone(), r.place.clone());
            }
        }

        let pending: Vec<(String, String)> = {
            let cache = self.seize_cache.lock().unwrap();
            cache.iter().map(|(t, p)| (t.clone(), p.clone())).collect()
        };

        let mut done = Vec::new();
        for (token, place) in &pending {
            if coordinator.is_seized_resource(&self.inner.name, place).await {
                coordinator.accept_resource(&self.inner.name, place).await;
                done.push(token.clone());
            }
        }
        if !done.is_empty() {
            let mut cache = self.seize_cache.lock().unwrap();
            for token in done {
                cache.remove(&token);
            }
        }
    }

    async fn force_kick_off(&self, resource: &str) {
        // The place's current reservation may no longer be the coordinator's
        // own system reservation by the time this fires — the seize protocol
        // calls this on the framework that *currently holds* the resource,
        // owner-agnostic, same as `labgrid_get_place_token`/
        // `labgrid_release_place(resource, True)` in the reference client.
        let reservations = self.inner.reservations().await;
        if let Some(r) = reservations.iter().find(|r| r.place == resource) {
            self.inner.cancel_reservation(&r.token).await;
        }
        self.inner.release_place_forced(resource).await;
    }

    async fn default_framework_disconnect(&self, resource: &str) -> DisconnectOutcome {
        let released = self.inner.release_place(resource).await;
        DisconnectOutcome {
            success: released,
            touched: true,
        }
    }

    async fn default_framework_connect(&self, resource: &str) -> bool {
        self.inner.create_reservation(resource, SYSTEM_PRIORITY).await.is_some()
            && self.inner.acquire_place(resource).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_core::ResourceRegistry;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn fake_cli(dir: &tempfile::TempDir, script: &str) -> CliExecutor {
        let path = dir.path().join("fake-reservation-cli");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(script.as_bytes()).unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        CliExecutor::new(path.to_string_lossy().into_owned())
    }

    fn coordinator_with(resource: &str, plugin: Arc<ReservationPlugin>) -> Coordinator {
        let mut registry = ResourceRegistry::new();
        registry.insert(resource, "lab-a", "rack-mount");

        let mut plugins: HashMap<String, Arc<dyn FrameworkPlugin>> = HashMap::new();
        plugins.insert("labgrid".to_string(), plugin);

        Coordinator::new(
            registry,
            &["labgrid".to_string()],
            HashMap::from([("labgrid".to_string(), 1i64)]),
            None,
            false,
            plugins,
        )
    }

    #[tokio::test]
    async fn schedule_accepts_a_waiting_reservation_only_through_is_resource_available() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            &dir,
            r#"#!/bin/sh
case "$*" in
  "reservation list --format yaml")
    cat <<'EOF'
- token: "tok-1"
  owner: "alice"
  state: "waiting"
  priority: 50
  filters: "rack-a"
EOF
    ;;
  *)
    exit 0
    ;;
esac
"#,
        );

        let plugin = Arc::new(ReservationPlugin::new("labgrid", cli));
        let coordinator = coordinator_with("rack-a", plugin.clone());

        // `rack-a` starts `Free`, so `is_resource_available` is the only
        // thing standing between the waiting reservation and acceptance.
        plugin.schedule(coordinator.clone()).await;

        assert_eq!(
            coordinator
                .managed_resources_status()
                .await
                .get("rack-a")
                .map(String::as_str),
            Some("labgrid")
        );
    }

    #[tokio::test]
    async fn schedule_leaves_a_place_held_by_another_framework_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            &dir,
            r#"#!/bin/sh
case "$*" in
  "reservation list --format yaml")
    cat <<'EOF'
- token: "tok-1"
  owner: "alice"
  state: "waiting"
  priority: 50
  filters: "rack-a"
EOF
    ;;
  *)
    exit 0
    ;;
esac
"#,
        );

        let plugin = Arc::new(ReservationPlugin::new("labgrid", cli));
        let coordinator = coordinator_with("rack-a", plugin.clone());
        coordinator.accept_resource("other", "rack-a").await;

        // Without the priority scheduler enabled, a place held by a
        // different framework is simply unavailable — no seize attempt.
        plugin.schedule(coordinator.clone()).await;

        assert_eq!(
            coordinator
                .managed_resources_status()
                .await
                .get("rack-a")
                .map(String::as_str),
            Some("other")
        );
    }

    #[test]
    fn seize_cache_is_keyed_by_reservation_token() {
        let plugin = ReservationPlugin::new("labgrid", CliExecutor::new("true"));
        {
            let mut cache = plugin.seize_cache.lock().unwrap();
            cache.insert("tok-1".to_string(), "rack-a".to_string());
        }

        assert_eq!(
            plugin.seize_cache.lock().unwrap().get("tok-1").cloned(),
            Some("rack-a".to_string())
        );

        // Once `schedule()` observes the seize accepted, the entry for that
        // token is dropped, same as the `done` bookkeeping at the end of
        // `schedule()`.
        plugin.seize_cache.lock().unwrap().remove("tok-1");
        assert!(!plugin.seize_cache.lock().unwrap().contains_key("tok-1"));
    }
}
