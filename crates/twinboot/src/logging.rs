//! Tracing setup and the event log

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use twinboot_api::events::WsEvent;

use crate::config::{DaemonConfig, LogFormat};

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `daemon.log_level`.
pub fn init_tracing(daemon: &DaemonConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&daemon.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match daemon.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
}

/// Write every core event to the log until cancelled or the channel closes
pub async fn log_events(mut rx: broadcast::Receiver<WsEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };

        match event {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &WsEvent) {
    match event {
        WsEvent::HostStateChanged { host, from, to } => {
            info!(%host, %from, %to, "host state changed");
        }
        WsEvent::TaskStarted {
            task_id,
            entity,
            kind,
            message,
        } => info!(task = %task_id, %entity, %kind, %message, "task started"),
        WsEvent::TaskProgress {
            task_id, message, ..
        } => debug!(task = %task_id, %message, "task progress"),
        WsEvent::TaskCompleted {
            task_id,
            entity,
            kind,
            success,
            message,
        } => {
            if *success {
                info!(task = %task_id, %entity, %kind, %message, "task completed");
            } else {
                warn!(task = %task_id, %entity, %kind, %message, "task failed");
            }
        }
        WsEvent::VmStatusChanged { vm, status } => info!(%vm, %status, "vm status changed"),
        WsEvent::HostRegistered { host } => info!(%host, "host registered"),
        WsEvent::HostRemoved { host, reason } => info!(%host, %reason, "host removed"),
        WsEvent::VmRegistered { vm } => info!(%vm, "vm registered"),
        WsEvent::VmRemoved { vm } => info!(%vm, "vm removed"),
        WsEvent::StatusSnapshot(snapshot) => debug!(
            hosts = snapshot.hosts.len(),
            vms = snapshot.vms.len(),
            active_tasks = snapshot.active_tasks.len(),
            "status snapshot"
        ),
    }
}
