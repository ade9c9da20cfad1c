//! Host, task, and VM state types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Observed OS state of a dual-boot host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Unreachable,
    TransitionUnknown,
    Ubuntu,
    Windows,
}

impl HostState {
    /// Derive the host state from the two reachability probes
    ///
    /// | ubuntu | windows | state |
    /// |---|---|---|
    /// | no | no | `Unreachable` |
    /// | yes | no | `Ubuntu` |
    /// | no | yes | `Windows` |
    /// | yes | yes | `TransitionUnknown` |
    #[must_use]
    pub const fn from_probes(ubuntu: bool, windows: bool) -> Self {
        match (ubuntu, windows) {
            (false, false) => HostState::Unreachable,
            (true, false) => HostState::Ubuntu,
            (false, true) => HostState::Windows,
            (true, true) => HostState::TransitionUnknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            HostState::Unreachable => "unreachable",
            HostState::TransitionUnknown => "transition_unknown",
            HostState::Ubuntu => "ubuntu",
            HostState::Windows => "windows",
        }
    }

    /// The OS this state is settled in, if any
    #[must_use]
    pub const fn os(self) -> Option<OsTarget> {
        match self {
            HostState::Ubuntu => Some(OsTarget::Ubuntu),
            HostState::Windows => Some(OsTarget::Windows),
            HostState::Unreachable | HostState::TransitionUnknown => None,
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two operating systems installed on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsTarget {
    Ubuntu,
    Windows,
}

impl OsTarget {
    #[must_use]
    pub const fn state(self) -> HostState {
        match self {
            OsTarget::Ubuntu => HostState::Ubuntu,
            OsTarget::Windows => HostState::Windows,
        }
    }
}

impl fmt::Display for OsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsTarget::Ubuntu => f.write_str("Ubuntu"),
            OsTarget::Windows => f.write_str("Windows"),
        }
    }
}

/// Lifecycle status of a tracked task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// `Completed` and `Failed` are never left once entered
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    BootUbuntu,
    BootWindows,
    ShutdownUbuntu,
    ShutdownWindows,
    RebootToUbuntu,
    StartVm,
    StopVm,
}

impl TaskKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskKind::BootUbuntu => "boot_ubuntu",
            TaskKind::BootWindows => "boot_windows",
            TaskKind::ShutdownUbuntu => "shutdown_ubuntu",
            TaskKind::ShutdownWindows => "shutdown_windows",
            TaskKind::RebootToUbuntu => "reboot_to_ubuntu",
            TaskKind::StartVm => "start_vm",
            TaskKind::StopVm => "stop_vm",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition requested on a physical host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostAction {
    BootUbuntu,
    BootWindows,
    ShutdownUbuntu,
    ShutdownWindows,
    RebootToUbuntu,
}

impl HostAction {
    /// Human readable label used in task messages
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            HostAction::BootUbuntu => "Ubuntu boot",
            HostAction::BootWindows => "Windows boot",
            HostAction::ShutdownUbuntu => "Ubuntu shutdown",
            HostAction::ShutdownWindows => "Windows shutdown",
            HostAction::RebootToUbuntu => "reboot to Ubuntu",
        }
    }
}

impl From<HostAction> for TaskKind {
    fn from(action: HostAction) -> Self {
        match action {
            HostAction::BootUbuntu => TaskKind::BootUbuntu,
            HostAction::BootWindows => TaskKind::BootWindows,
            HostAction::ShutdownUbuntu => TaskKind::ShutdownUbuntu,
            HostAction::ShutdownWindows => TaskKind::ShutdownWindows,
            HostAction::RebootToUbuntu => TaskKind::RebootToUbuntu,
        }
    }
}

/// Power action requested on a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmAction {
    Start,
    Stop,
}

impl From<VmAction> for TaskKind {
    fn from(action: VmAction) -> Self {
        match action {
            VmAction::Start => TaskKind::StartVm,
            VmAction::Stop => TaskKind::StopVm,
        }
    }
}

/// Cached power state of a VM
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmPowerState {
    Running,
    Stopped,
    Starting,
    Unknown,
    ConnectionError,
    /// Status string reported by the hypervisor that has no dedicated variant
    Other(String),
}

impl VmPowerState {
    /// Map a hypervisor status string (`running`, `stopped`, ...)
    #[must_use]
    pub fn from_hypervisor(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "running" => VmPowerState::Running,
            "stopped" => VmPowerState::Stopped,
            "starting" => VmPowerState::Starting,
            "unknown" | "" => VmPowerState::Unknown,
            other => VmPowerState::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            VmPowerState::Running => "running",
            VmPowerState::Stopped => "stopped",
            VmPowerState::Starting => "starting",
            VmPowerState::Unknown => "unknown",
            VmPowerState::ConnectionError => "connection_error",
            VmPowerState::Other(raw) => raw,
        }
    }
}

impl fmt::Display for VmPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
