//! WebSocket event types

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::responses::StatusSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type")]
pub enum WsEvent {
    HostStateChanged {
        host: String,
        from: String,
        to: String,
    },
    TaskStarted {
        task_id: String,
        entity: String,
        kind: String,
        message: String,
    },
    TaskProgress {
        task_id: String,
        entity: String,
        kind: String,
        message: String,
    },
    TaskCompleted {
        task_id: String,
        entity: String,
        kind: String,
        success: bool,
        message: String,
    },
    VmStatusChanged {
        vm: String,
        status: String,
    },
    HostRegistered {
        host: String,
    },
    HostRemoved {
        host: String,
        reason: String,
    },
    VmRegistered {
        vm: String,
    },
    VmRemoved {
        vm: String,
    },
    StatusSnapshot(StatusSnapshot),
}

impl WsEvent {
    /// Task id carried by task lifecycle events
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            WsEvent::TaskStarted { task_id, .. }
            | WsEvent::TaskProgress { task_id, .. }
            | WsEvent::TaskCompleted { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_is_tagged_by_variant() {
        let event = WsEvent::HostStateChanged {
            host: "pc-1".to_string(),
            from: "unreachable".to_string(),
            to: "ubuntu".to_string(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "HostStateChanged");
        assert_eq!(json["to"], "ubuntu");
    }

    #[test]
    fn test_task_id_only_on_task_events() {
        let completed = WsEvent::TaskCompleted {
            task_id: "t-1".to_string(),
            entity: "pc-1".to_string(),
            kind: "boot_ubuntu".to_string(),
            success: true,
            message: "done".to_string(),
        };
        let removed = WsEvent::VmRemoved {
            vm: "vm-1".to_string(),
        };

        assert_eq!(completed.task_id(), Some("t-1"));
        assert_eq!(removed.task_id(), None);
    }
}
