//! Periodic status snapshot broadcast
//!
//! Builds a full snapshot only while someone is subscribed to events.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use twinboot_api::responses::StatusSnapshot;

use crate::error::CoreError;
use crate::host::HostOrchestrator;
use crate::notify::EventPublisher;
use crate::tracker::TaskTracker;
use crate::vm::VmOrchestrator;

/// Collect host and VM status plus every active task
///
/// # Errors
/// Returns an error if either registry actor is gone.
pub async fn build_snapshot(
    hosts: &HostOrchestrator,
    vms: &VmOrchestrator,
    tracker: &TaskTracker,
) -> Result<StatusSnapshot, CoreError> {
    let (host_statuses, vm_statuses) = tokio::join!(hosts.get_all_status(), vms.get_all_statuses());

    Ok(StatusSnapshot {
        hosts: host_statuses?
            .into_iter()
            .map(|(id, report)| (id, report.to_view()))
            .collect(),
        vms: vm_statuses?
            .into_iter()
            .map(|status| (status.vm_id.clone(), status.to_view()))
            .collect(),
        active_tasks: tracker
            .list_active(None)
            .iter()
            .map(|task| task.to_view())
            .collect(),
        timestamp: Utc::now(),
    })
}

/// Handle to the running broadcast loop
pub struct StatusBroadcaster {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StatusBroadcaster {
    /// Publish a snapshot every `interval` while there are subscribers
    #[must_use]
    pub fn start(
        hosts: HostOrchestrator,
        vms: VmOrchestrator,
        tracker: TaskTracker,
        events: EventPublisher,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "status broadcast started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if events.subscriber_count() == 0 {
                    continue;
                }

                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    snapshot = build_snapshot(&hosts, &vms, &tracker) => match snapshot {
                        Ok(snapshot) => {
                            debug!(hosts = snapshot.hosts.len(), vms = snapshot.vms.len(), "broadcasting status snapshot");
                            events.snapshot(snapshot);
                        }
                        Err(e) => warn!(error = %e, "failed to build status snapshot"),
                    },
                }
            }
            info!("status broadcast stopped");
        });

        Self { cancel, handle }
    }

    /// Cancel the loop and wait until it has exited
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "status broadcast task ended abnormally");
        }
    }
}
