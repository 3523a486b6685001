use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fc_cli::CliExecutor;
use fc_core::Config;
use fc_server::plugins::{JobQueuePlugin, ReservationPlugin};
use fc_server::{Coordinator, FrameworkPlugin};
use tokio_util::sync::CancellationToken;

/// Farm coordinator: arbitrates ownership of shared test devices among
/// registered test frameworks.
#[derive(Parser, Debug)]
#[command(name = "fc-server", version, about)]
struct Cli {
    /// Root directory containing `config/cfg.yaml` unless
    /// `FC_SERVER_CFG_PATH` overrides it.
    #[arg(long, env = "FC_PATH", default_value = ".")]
    fc_path: PathBuf,
}

/// Which plugin kind backs a registered framework, read from
/// `$FC_<NAME>_KIND` (`job_queue` or `reservation`); defaults to
/// `job_queue`, the more common integration shape in this domain.
fn build_plugin(name: &str, kind: &str, cli_bin: &str) -> Arc<dyn FrameworkPlugin> {
    let executor = CliExecutor::new(cli_bin.to_string());
    match kind {
        "reservation" => Arc::new(ReservationPlugin::new(name.to_string(), executor)),
        _ => Arc::new(JobQueuePlugin::new(name.to_string(), executor)),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.fc_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_server(config))
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let mut plugins = std::collections::HashMap::new();
    let mut schedule_intervals = std::collections::HashMap::new();
    let mut priorities = std::collections::HashMap::new();
    let mut seize_enabled = std::collections::HashMap::new();

    for name in &config.registered_frameworks {
        let framework_cfg = config
            .frameworks
            .get(name)
            .expect("Config::load rejects registered_frameworks without a config entry");

        // The CLI binary and plugin kind come from the environment rather
        // than `frameworks_config` itself — this reference binary only
        // ships two plugin kinds, so there's no per-framework YAML schema
        // worth inventing for them yet.
        let cli_bin = std::env::var(format!("FC_{}_CLI", name.to_uppercase()))
            .unwrap_or_else(|_| name.clone());
        let kind = std::env::var(format!("FC_{}_KIND", name.to_uppercase()))
            .unwrap_or_else(|_| "job_queue".to_string());

        plugins.insert(name.clone(), build_plugin(name, &kind, &cli_bin));
        schedule_intervals.insert(name.clone(), framework_cfg.schedule_interval);
        priorities.insert(name.clone(), framework_cfg.priority);
        seize_enabled.insert(name.clone(), framework_cfg.seize_enabled);
    }

    let coordinator = Coordinator::with_seize_enabled(
        config.resources,
        &config.registered_frameworks,
        priorities,
        seize_enabled,
        config.default_framework,
        config.priority_scheduler,
        plugins,
    );

    let cancel = CancellationToken::new();
    let tick_loop = tokio::spawn(fc_server::run(
        coordinator,
        config.registered_frameworks,
        schedule_intervals,
        cancel.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl-c received, shutting down");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    if let Err(err) = tick_loop.await {
        tracing::error!(%err, "tick loop task panicked");
    }

    Ok(())
}
