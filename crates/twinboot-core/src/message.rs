//! Message types for actor communication

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kameo::actor::ActorRef;
use kameo_macros::Reply;

use twinboot_api::responses::{HostStatusView, VmStatusView};

use crate::actor::host::HostActor;
use crate::config::{HostConfig, VmConfig};
use crate::state::{HostAction, HostState, VmAction, VmPowerState};
use crate::traits::{HostProbe, VmBackend};

// ============================================================================
// HostActor Messages
// ============================================================================

/// Hand out what a caller needs to probe the host outside the mailbox
#[derive(Debug, Clone, Copy)]
pub struct PrepareSample;

/// Probe handle and config for sampling one host
#[derive(Clone)]
pub struct HostSampler {
    pub config: Arc<HostConfig>,
    pub probe: Arc<dyn HostProbe>,
    /// Order of this sample among those handed out by the actor
    pub seq: u64,
}

/// Record a sample taken by the caller and report the resulting state
#[derive(Debug, Clone, Copy)]
pub struct ApplySample {
    pub seq: u64,
    pub ubuntu_reachable: bool,
    pub windows_reachable: bool,
}

/// Result of sampling one host
#[derive(Debug, Clone, PartialEq, Eq, Reply)]
pub struct HostStatusReport {
    pub host_id: String,
    pub name: String,
    pub state: HostState,
    pub ubuntu_reachable: bool,
    pub windows_reachable: bool,
    /// Non-terminal tasks for this host
    pub active_tasks: usize,
    pub timestamp: DateTime<Utc>,
    /// Set when the status could not be determined at all
    pub error: Option<String>,
}

impl HostStatusReport {
    /// Record returned when sampling itself failed
    #[must_use]
    pub fn failed(host_id: &str, error: impl Into<String>) -> Self {
        Self {
            host_id: host_id.to_string(),
            name: "unknown".to_string(),
            state: HostState::Unreachable,
            ubuntu_reachable: false,
            windows_reachable: false,
            active_tasks: 0,
            timestamp: Utc::now(),
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn to_view(&self) -> HostStatusView {
        HostStatusView {
            host_id: self.host_id.clone(),
            name: self.name.clone(),
            state: self.state.to_string(),
            ubuntu_reachable: self.ubuntu_reachable,
            windows_reachable: self.windows_reachable,
            active_tasks: self.active_tasks,
            timestamp: self.timestamp,
            error: self.error.clone(),
        }
    }
}

/// Create a task for a transition and launch its workflow
#[derive(Debug, Clone, Copy)]
pub struct BeginTransition {
    pub action: HostAction,
}

/// Fail outstanding work and cancel workflows before the actor stops
#[derive(Debug, Clone)]
pub struct Retire {
    pub reason: String,
}

// ============================================================================
// OrchestratorActor Messages
// ============================================================================

/// Register a new host
#[derive(Debug, Clone)]
pub struct RegisterHost {
    pub config: HostConfig,
}

/// Remove a host, failing its outstanding tasks
#[derive(Debug, Clone)]
pub struct UnregisterHost {
    pub host_id: String,
}

/// Replace a host's configuration, re-creating its backend handles
#[derive(Debug, Clone)]
pub struct UpdateHost {
    pub config: HostConfig,
}

/// Look up the actor of one host
#[derive(Debug, Clone)]
pub struct GetHostRef {
    pub host_id: String,
}

/// All registered hosts and their actors
#[derive(Debug, Clone, Copy)]
pub struct ListHostRefs;

/// Host actor handle paired with its id
#[derive(Debug, Clone)]
pub struct HostHandle {
    pub host_id: String,
    pub actor: ActorRef<HostActor>,
}

// ============================================================================
// VmControllerActor Messages
// ============================================================================

/// Cached status of one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmStatus {
    pub vm_id: String,
    pub name: String,
    pub status: VmPowerState,
    /// Time of the last successful status query
    pub last_updated: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl VmStatus {
    #[must_use]
    pub fn new(vm_id: &str, name: &str) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            name: name.to_string(),
            status: VmPowerState::Unknown,
            last_updated: None,
            error_message: None,
        }
    }

    #[must_use]
    pub fn to_view(&self) -> VmStatusView {
        VmStatusView {
            vm_id: self.vm_id.clone(),
            name: self.name.clone(),
            status: self.status.to_string(),
            last_updated: self.last_updated,
            error_message: self.error_message.clone(),
        }
    }
}

/// Register a new VM
#[derive(Debug, Clone)]
pub struct RegisterVm {
    pub config: VmConfig,
}

/// Remove a VM, failing its outstanding tasks
#[derive(Debug, Clone)]
pub struct UnregisterVm {
    pub vm_id: String,
}

/// Change a VM's display name
#[derive(Debug, Clone)]
pub struct RenameVm {
    pub vm_id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct GetVmStatus {
    pub vm_id: String,
}

/// Cached statuses of all VMs, sorted by id
#[derive(Debug, Clone, Copy)]
pub struct ListVmStatuses;

/// Create a task for a power action and launch its workflow
#[derive(Debug, Clone)]
pub struct BeginVmAction {
    pub vm_id: String,
    pub action: VmAction,
}

/// Overwrite the cached power state, e.g. `starting` while a start runs
#[derive(Debug, Clone)]
pub struct MarkVmStatus {
    pub vm_id: String,
    pub status: VmPowerState,
}

/// What a refresh needs to query one VM
#[derive(Clone)]
pub struct RefreshTarget {
    pub vm_id: String,
    pub config: Arc<VmConfig>,
    pub backend: VmBackend,
    /// Connectivity has to be checked before the status query
    pub needs_precheck: bool,
}

/// Refresh target for one VM
#[derive(Debug, Clone)]
pub struct GetRefreshTarget {
    pub vm_id: String,
}

/// Refresh targets for every registered VM
#[derive(Debug, Clone, Copy)]
pub struct ListRefreshTargets;

/// Outcome of querying the hypervisor for one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Status(VmPowerState),
    QueryFailed(String),
    ConnectionFailed(String),
}

/// Apply a refresh result; ignored for VMs removed in the meantime
#[derive(Debug, Clone)]
pub struct ApplyRefresh {
    pub vm_id: String,
    pub outcome: RefreshOutcome,
}
