//! Status and task views handed to the API layer

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Point-in-time status of one dual-boot host
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HostStatusView {
    pub host_id: String,
    pub name: String,
    pub state: String,
    pub ubuntu_reachable: bool,
    pub windows_reachable: bool,
    pub active_tasks: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cached status of one virtual machine
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VmStatusView {
    pub vm_id: String,
    pub name: String,
    pub status: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Tracked asynchronous operation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskView {
    pub task_id: String,
    pub entity_id: String,
    pub kind: String,
    pub status: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate broadcast to listeners at a fixed interval
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusSnapshot {
    pub hosts: BTreeMap<String, HostStatusView>,
    pub vms: BTreeMap<String, VmStatusView>,
    pub active_tasks: Vec<TaskView>,
    pub timestamp: DateTime<Utc>,
}
