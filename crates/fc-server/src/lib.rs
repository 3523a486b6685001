//! The farm coordinator's async runtime: the [`Coordinator`] itself, the
//! [`FrameworkPlugin`] contract plugins implement, the reference plugins,
//! and the tick loop that drives them.

pub mod coordinator;
pub mod plugin;
pub mod plugins;

pub use coordinator::Coordinator;
pub use plugin::{DisconnectOutcome, FrameworkPlugin};

use std::collections::HashMap;
use std::time::Duration;

use fc_core::FrameworkId;
use tokio_util::sync::CancellationToken;

/// Drives every registered framework's `schedule` on its own cadence,
/// ticking once a second — the same granularity the reference coordinator
/// used, since every `schedule_interval` in this domain is expressed in
/// whole ticks of that length.
///
/// Runs until `cancel` is triggered (wired to `ctrl_c` in `main`).
pub async fn run(
    coordinator: Coordinator,
    registered_frameworks: Vec<FrameworkId>,
    schedule_intervals: HashMap<FrameworkId, u32>,
    cancel: CancellationToken,
) {
    let init_tasks: Vec<_> = coordinator
        .plugins()
        .map(|(_, plugin)| {
            let plugin = plugin.clone();
            let coordinator = coordinator.clone();
            async move { plugin.init(coordinator).await }
        })
        .collect();
    futures::future::join_all(init_tasks).await;

    let mut ticks: HashMap<FrameworkId, u32> =
        registered_frameworks.iter().map(|f| (f.clone(), 0)).collect();
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("shutdown requested, stopping tick loop");
                break;
            }
            _ = interval.tick() => {}
        }

        coordinator.retry_pending_reconnects().await;

        for name in &registered_frameworks {
            let due = {
                let tick = ticks.get_mut(name).expect("tick counter initialized for every registered framework");
                let sched_interval = schedule_intervals.get(name).copied().unwrap_or(1).max(1);
                let due = *tick % sched_interval == 0;
                *tick += 1;
                due
            };

            if !due {
                continue;
            }

            let Some(plugin) = coordinator.plugin(name) else {
                tracing::warn!(framework = %name, "registered framework has no plugin instance");
                continue;
            };

            let coordinator = coordinator.clone();
            let name = name.clone();
            tokio::spawn(async move {
                plugin.schedule(coordinator).await;
                tracing::debug!(framework = %name, "schedule tick complete");
            });
        }
    }
}
