//! Event publishing over a broadcast channel
//!
//! Sending with no subscribers is not an error; dropping a receiver
//! unsubscribes it.

use tokio::sync::broadcast;

use twinboot_api::events::WsEvent;
use twinboot_api::responses::StatusSnapshot;

use crate::state::{HostState, TaskStatus, VmPowerState};
use crate::tracker::TaskRecord;

/// Cloneable sender side of the event channel
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<WsEvent>,
}

impl EventPublisher {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish(&self, event: WsEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn host_state_changed(&self, host: &str, from: Option<HostState>, to: HostState) {
        self.publish(WsEvent::HostStateChanged {
            host: host.to_string(),
            from: from.map_or("unknown", HostState::as_str).to_string(),
            to: to.to_string(),
        });
    }

    pub fn task_started(&self, task: &TaskRecord) {
        self.publish(WsEvent::TaskStarted {
            task_id: task.id.to_string(),
            entity: task.entity_id.clone(),
            kind: task.kind.to_string(),
            message: task.message.clone(),
        });
    }

    pub fn task_progress(&self, task: &TaskRecord) {
        self.publish(WsEvent::TaskProgress {
            task_id: task.id.to_string(),
            entity: task.entity_id.clone(),
            kind: task.kind.to_string(),
            message: task.message.clone(),
        });
    }

    pub fn task_completed(&self, task: &TaskRecord) {
        self.publish(WsEvent::TaskCompleted {
            task_id: task.id.to_string(),
            entity: task.entity_id.clone(),
            kind: task.kind.to_string(),
            success: task.status == TaskStatus::Completed,
            message: task.message.clone(),
        });
    }

    pub fn vm_status_changed(&self, vm: &str, status: &VmPowerState) {
        self.publish(WsEvent::VmStatusChanged {
            vm: vm.to_string(),
            status: status.to_string(),
        });
    }

    pub fn host_registered(&self, host: &str) {
        self.publish(WsEvent::HostRegistered {
            host: host.to_string(),
        });
    }

    pub fn host_removed(&self, host: &str, reason: &str) {
        self.publish(WsEvent::HostRemoved {
            host: host.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn vm_registered(&self, vm: &str) {
        self.publish(WsEvent::VmRegistered { vm: vm.to_string() });
    }

    pub fn vm_removed(&self, vm: &str) {
        self.publish(WsEvent::VmRemoved { vm: vm.to_string() });
    }

    pub fn snapshot(&self, snapshot: StatusSnapshot) {
        self.publish(WsEvent::StatusSnapshot(snapshot));
    }
}
