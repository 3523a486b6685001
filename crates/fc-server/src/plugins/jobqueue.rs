use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use fc_cli::CliExecutor;
use serde::Deserialize;

use crate::coordinator::Coordinator;
use crate::plugin::{DisconnectOutcome, FrameworkPlugin};

/// Description prefix the coordinator stamps on a device's health-state
/// description when it puts a device into maintenance on this framework's
/// behalf, so a later restart can tell "we did this" apart from a device
/// an operator put into maintenance by hand.
const MAINTENANCE_TAG: &str = "fc-coordinator-managed";

/// How long an accepted device gets to actually start a job before the
/// cleanup task assumes it was never consumed and puts it back under
/// maintenance (§4.4 step 5).
const CONSUME_GRACE: Duration = Duration::from_secs(90);
/// Poll cadence while waiting for a device's job to finish, once it has
/// been consumed.
const IDLE_POLL: Duration = Duration::from_secs(60);

const JOB_POLL_QUERY: &[&str] = &["jobs", "queue", "--format", "yaml"];
const DEVICE_LIST_QUERY: &[&str] = &["devices", "list", "--format", "yaml"];

#[derive(Debug, Clone, Deserialize)]
struct QueuedJob {
    job_id: String,
    device_type: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeviceInfo {
    hostname: String,
    device_type: String,
    health: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    current_job: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// The part of the plugin cheap enough to clone into a spawned cleanup
/// task: the CLI handle and the plugin's own name. Kept separate from
/// [`JobQueuePlugin`] itself so background tasks don't need an `Arc<dyn
/// FrameworkPlugin>` just to shell out a couple more commands.
struct Inner {
    name: String,
    cli: CliExecutor,
}

impl Inner {
    async fn queued_jobs(&self) -> Vec<QueuedJob> {
        self.cli
            .run_yaml(JOB_POLL_QUERY)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(framework = %self.name, %err, "failed to poll job queue");
                Vec::new()
            })
    }

    async fn devices(&self) -> Vec<DeviceInfo> {
        self.cli
            .run_yaml(DEVICE_LIST_QUERY)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(framework = %self.name, %err, "failed to list devices");
                Vec::new()
            })
    }

    async fn set_maintenance(&self, device: &str, description: &str) -> bool {
        self.cli
            .run(&["devices", "update", device, "--health", "Maintenance", "--description", description])
            .await
            .is_ok()
    }

    async fn set_online(&self, device: &str, description: &str) -> bool {
        self.cli
            .run(&["devices", "update", device, "--health", "Good", "--description", description])
            .await
            .is_ok()
    }

    /// Runs from the moment a device is accepted for a job until the
    /// framework reports it idle again: first waits for the job to
    /// actually pick the device up, reclaiming it under maintenance if it
    /// never does, then polls until the job finishes and hands the device
    /// back to the coordinator (§4.4 step 5).
    async fn cleanup(self: Arc<Self>, coordinator: Coordinator, device: fc_core::ResourceId) {
        tokio::time::sleep(CONSUME_GRACE).await;

        let consumed = self
            .devices()
            .await
            .iter()
            .any(|d| d.hostname == device && d.current_job.is_some());

        if !consumed {
            tracing::warn!(framework = %self.name, %device, "accepted device was never consumed, forcing back to maintenance");
            self.set_maintenance(&device, MAINTENANCE_TAG).await;
            coordinator.return_resource(&device).await;
            return;
        }

        loop {
            tokio::time::sleep(IDLE_POLL).await;
            let devices = self.devices().await;
            let Some(found) = devices.iter().find(|d| d.hostname == device) else {
                // Device vanished from the inventory entirely; the next
                // inventory sweep in `schedule` will retire it.
                return;
            };
            if found.current_job.is_none() {
                coordinator.return_resource(&device).await;
                return;
            }
        }
    }
}

/// Reference implementation of a job-queue-style framework integration
/// (§5, Job-Queue-Style Plugin): devices are either servicing the
/// framework's own queue or sitting in "Maintenance" while the coordinator
/// holds them. Jobs are matched to devices by `tags ⊆ device.tags`, the
/// same subset rule queueing frameworks in this family use to restrict a
/// job to compatible hardware.
pub struct JobQueuePlugin {
    inner: Arc<Inner>,
    /// Per-job cache of devices already considered for a seize, keyed by
    /// `job_id` (spec §3: "per-plugin caches ... {job_id -> list-of-
    /// resources-already-considered}"), so a later tick doesn't re-seize
    /// the same device for the same job on every poll, while two different
    /// jobs contending for the same device are tracked independently.
    /// Entries age out once a job leaves the queue.
    seize_cache: StdMutex<HashMap<String, HashSet<fc_core::ResourceId>>>,
}

impl JobQueuePlugin {
    pub fn new(name: impl Into<String>, cli: CliExecutor) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                cli,
            }),
            seize_cache: StdMutex::new(HashMap::new()),
        }
    }

    fn spawn_cleanup(&self, coordinator: &Coordinator, device: fc_core::ResourceId) {
        let inner = self.inner.clone();
        let coordinator = coordinator.clone();
        tokio::spawn(async move { inner.cleanup(coordinator, device).await });
    }

    /// Per-tick inventory health sweep (§4.4 step 1): a managed device
    /// reporting "ready" framework-native health while its ownership state
    /// is still `Free` must be force-maintenanced, keeping the invariant
    /// that coordinator-`Free` implies framework-offline. For the default
    /// framework this is inverted: a device reporting "ready" health while
    /// *not* `Free` is reset to `Free` instead, since the default
    /// framework's own readiness is the coordinator's only signal that
    /// nobody else is using the device right now.
    async fn health_sweep(&self, coordinator: &Coordinator, devices: &[DeviceInfo], is_default: bool) {
        let status = coordinator.managed_resources_status().await;

        for device in devices {
            if !coordinator.resources().contains(&device.hostname) {
                continue;
            }

            let is_free = status.get(&device.hostname).map(String::as_str) == Some("fc");
            let is_ready = matches!(device.health.as_str(), "Unknown" | "Good" | "Bad");

            if is_default {
                if is_ready && !is_free {
                    coordinator.reset_resource(&device.hostname).await;
                }
            } else if is_ready && is_free {
                self.inner.set_maintenance(&device.hostname, MAINTENANCE_TAG).await;
            }
        }
    }
}

#[async_trait]
impl FrameworkPlugin for JobQueuePlugin {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn init(&self, coordinator: Coordinator) {
        let is_default = coordinator.is_default_framework(&self.inner.name);
        let devices = self.inner.devices().await;

        for device in &devices {
            if !coordinator.resources().contains(&device.hostname) {
                continue;
            }
            if is_default {
                let was_managed = device
                    .description
                    .as_deref()
                    .map(|d| d.contains(MAINTENANCE_TAG))
                    .unwrap_or(false);
                if was_managed && device.health == "Maintenance" {
                    self.inner.set_online(&device.hostname, "").await;
                }
            } else if matches!(device.health.as_str(), "Unknown" | "Good" | "Bad") {
                self.inner.set_maintenance(&device.hostname, MAINTENANCE_TAG).await;
            }
        }
    }

    async fn schedule(&self, coordinator: Coordinator) {
        let is_default = coordinator.is_default_framework(&self.inner.name);
        let devices = self.inner.devices().await;
        let inventory: HashSet<&str> = devices.iter().map(|d| d.hostname.as_str()).collect();

        let managed: Vec<fc_core::ResourceId> = coordinator.resources().ids().cloned().collect();
        for resource in &managed {
            if !inventory.contains(resource.as_str()) {
                coordinator.retire_resource(resource).await;
            }
        }

        self.health_sweep(&coordinator, &devices, is_default).await;

        let status = coordinator.managed_resources_status().await;
        let mut available: HashMap<&str, Vec<&DeviceInfo>> = HashMap::new();
        let mut non_available: HashMap<&str, Vec<&DeviceInfo>> = HashMap::new();

        for device in &devices {
            if !coordinator.resources().contains(&device.hostname) {
                continue;
            }

            if device.health == "Retired" {
                coordinator.retire_resource(&device.hostname).await;
                continue;
            }

            // Only a device actually reappearing from `Retired` needs
            // resetting; any other resource's ownership state (held,
            // seizing, seized) must be left untouched here.
            if status.get(&device.hostname).map(String::as_str) == Some("retired") {
                coordinator.reset_resource(&device.hostname).await;
            }

            // Guard: the framework is already running a job on this device
            // but the coordinator still thinks it's free (e.g. it was
            // dispatched before the coordinator last restarted). Claim it
            // and track it through to completion rather than fighting the
            // framework over a device it's already using.
            if device.current_job.is_some()
                && !coordinator.is_resource_non_available(&device.hostname).await
            {
                coordinator.accept_resource(&self.inner.name, &device.hostname).await;
                self.spawn_cleanup(&coordinator, device.hostname.clone());
                continue;
            }

            // Availability is the coordinator's call, not this plugin's own
            // reading of framework health: it gates on `OwnershipState`,
            // negotiates the default-framework disconnect bridge when this
            // isn't the default plugin, and recognizes a resource already
            // `Seized{self}` as available (spec §4.4 step 5, §4.1).
            if coordinator.is_resource_available(&self.inner.name, &device.hostname).await {
                available.entry(device.device_type.as_str()).or_default().push(device);
            } else if coordinator.is_resource_non_available(&device.hostname).await {
                non_available.entry(device.device_type.as_str()).or_default().push(device);
            }
        }

        let jobs = self.inner.queued_jobs().await;

        // Age out per-job seize bookkeeping for jobs that have left the
        // queue (spec §3: "entries age out when the job leaves the queue").
        let current_job_ids: HashSet<&str> = jobs.iter().map(|j| j.job_id.as_str()).collect();
        self.seize_cache
            .lock()
            .unwrap()
            .retain(|job_id, _| current_job_ids.contains(job_id.as_str()));

        let mut accepted = Vec::new();

        for job in &jobs {
            let tag_set: HashSet<&str> = job.tags.iter().map(String::as_str).collect();

            if let Some(candidates) = available.get(job.device_type.as_str()) {
                if let Some(device) = candidates.iter().find(|d| {
                    tag_set.is_subset(&d.tags.iter().map(String::as_str).collect())
                }) {
                    accepted.push(device.hostname.clone());
                    continue;
                }
            }

            if !coordinator.priority_scheduler() {
                continue;
            }

            let Some(candidates) = non_available.get(job.device_type.as_str()) else {
                continue;
            };
            let matching: Vec<fc_core::ResourceId> = candidates
                .iter()
                .filter(|d| tag_set.is_subset(&d.tags.iter().map(String::as_str).collect()))
                .map(|d| d.hostname.clone())
                .collect();

            if matching.is_empty() {
                continue;
            }

            let already_seizing = {
                let cache = self.seize_cache.lock().unwrap();
                cache
                    .get(&job.job_id)
                    .is_some_and(|considered| matching.iter().any(|r| considered.contains(r)))
            };
            if already_seizing {
                continue;
            }

            let granted = coordinator
                .coordinate_resources(&self.inner.name, &job.job_id, &matching)
                .await;

            if !granted.is_empty() {
                self.seize_cache
                    .lock()
                    .unwrap()
                    .entry(job.job_id.clone())
                    .or_default()
                    .extend(granted.iter().cloned());
                accepted.extend(granted);
            }
        }

        for resource in accepted {
            coordinator.accept_resource(&self.inner.name, &resource).await;
            {
                let mut cache = self.seize_cache.lock().unwrap();
                cache.retain(|_, considered| {
                    considered.remove(&resource);
                    !considered.is_empty()
                });
            }
            self.inner.set_online(&resource, "").await;
            self.spawn_cleanup(&coordinator, resource);
        }
    }

    async fn force_kick_off(&self, resource: &str) {
        // Best effort: cancel whatever job is currently running on this
        // device so the preempting framework isn't kept waiting.
        let _ = self.inner.cli.run(&["devices", "cancel-job", resource]).await;
    }

    async fn default_framework_disconnect(&self, resource: &str) -> DisconnectOutcome {
        let devices = self.inner.devices().await;
        let Some(device) = devices.iter().find(|d| d.hostname == resource) else {
            return DisconnectOutcome {
                success: false,
                touched: false,
            };
        };

        if device.current_job.is_some() {
            return DisconnectOutcome {
                success: false,
                touched: false,
            };
        }
        match device.health.as_str() {
            "Maintenance" => DisconnectOutcome {
                success: true,
                touched: false,
            },
            "Retired" => DisconnectOutcome {
                success: false,
                touched: false,
            },
            _ => {
                let ok = self.inner.set_maintenance(resource, MAINTENANCE_TAG).await;
                DisconnectOutcome {
                    success: ok,
                    touched: true,
                }
            }
        }
    }

    async fn default_framework_connect(&self, resource: &str) -> bool {
        self.inner.set_online(resource, "").await
    }
}
