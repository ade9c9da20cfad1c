//! twinboot daemon
//!
//! Loads the host and VM registry, keeps VM status fresh, broadcasts status
//! snapshots and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use twinboot_core::{
    EventPublisher, HostOrchestrator, StatusBroadcaster, TaskTracker, VmOrchestrator,
};

mod config;
mod factory;
mod logging;

use config::Config;
use factory::{DefaultHostFactory, ProxmoxVmFactory};

const JANITOR_INTERVAL: Duration = Duration::from_secs(3600);

/// Dual-boot host and VM power orchestration daemon
#[derive(Parser, Debug)]
#[command(name = "twinboot", version, about)]
struct Args {
    /// Configuration file (defaults to $TWINBOOT_CONFIG or the standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let path = Config::locate(args.config.as_deref());
    let mut config = match &path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    logging::init_tracing(&config.daemon);
    match &path {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => warn!("no config file found, using defaults"),
    }

    config.settings.apply_env(|var| std::env::var(var).ok())?;
    let registry = config.resolve()?;
    if args.check {
        info!(
            hosts = registry.hosts.len(),
            vms = registry.vms.len(),
            "configuration is valid"
        );
        return Ok(());
    }

    let settings = config.settings.orchestrator();
    let tracker = TaskTracker::new();
    let events = EventPublisher::new(settings.event_channel_capacity);
    let shutdown = CancellationToken::new();
    let event_log = tokio::spawn(logging::log_events(events.subscribe(), shutdown.clone()));

    let hosts = HostOrchestrator::spawn(
        Arc::new(DefaultHostFactory::new(&config.settings)),
        settings,
        tracker.clone(),
        events.clone(),
    );
    let vms = VmOrchestrator::spawn(
        Arc::new(ProxmoxVmFactory::new(&config.settings)),
        settings,
        tracker.clone(),
        events.clone(),
    );

    for host in registry.hosts {
        let host_id = host.id.clone();
        if let Err(e) = hosts.register_host(host).await {
            error!(host = %host_id, error = %e, "failed to register host");
        }
    }
    for vm in registry.vms {
        let vm_id = vm.id.clone();
        if let Err(e) = vms.add_vm(vm).await {
            error!(vm = %vm_id, error = %e, "failed to register vm");
        }
    }

    match hosts.get_all_status().await {
        Ok(statuses) => {
            for (host_id, report) in statuses {
                info!(host = %host_id, state = %report.state, "initial host state");
            }
        }
        Err(e) => warn!(error = %e, "initial host status check failed"),
    }

    vms.start_monitoring();
    let broadcaster = StatusBroadcaster::start(
        hosts.clone(),
        vms.clone(),
        tracker.clone(),
        events.clone(),
        settings.broadcast_interval,
    );
    let janitor = tracker.spawn_janitor(
        JANITOR_INTERVAL,
        settings.task_max_age,
        shutdown.child_token(),
    );

    info!("twinboot running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    broadcaster.stop().await;
    vms.stop_monitoring().await;
    hosts.shutdown().await;
    vms.shutdown().await;

    shutdown.cancel();
    if let Err(e) = janitor.await {
        warn!(error = %e, "task janitor ended abnormally");
    }
    if let Err(e) = event_log.await {
        warn!(error = %e, "event log ended abnormally");
    }

    info!("twinboot stopped");
    Ok(())
}
