//! Probe and actuator contracts implemented by the leaf backends
//!
//! Probes only observe; actuators change power or OS state. A probe that
//! returns `Err` is treated the same as one reporting "not reachable".

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{HostConfig, VmConfig};
use crate::error::CoreError;
use crate::state::{OsTarget, VmPowerState};

/// Result of a reachability check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub message: String,
}

impl ProbeResult {
    #[must_use]
    pub fn reachable(message: impl Into<String>) -> Self {
        Self {
            reachable: true,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            reachable: false,
            message: message.into(),
        }
    }
}

/// Result of a fire-and-forget action such as sending a wake packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub ok: bool,
    pub message: String,
}

impl ActionOutcome {
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Result of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    /// Text describing why the command failed
    #[must_use]
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            let stdout = self.stdout.trim();
            if stdout.is_empty() {
                "command failed".to_string()
            } else {
                stdout.to_string()
            }
        } else {
            stderr.to_string()
        }
    }
}

/// Command to run on one of the host's operating systems
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Selects which credentials are used
    pub target: OsTarget,
    pub command: String,
}

/// Reachability checks for a dual-boot host
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn check_ubuntu(&self, host: &HostConfig) -> Result<ProbeResult, CoreError>;

    async fn check_windows(&self, host: &HostConfig) -> Result<ProbeResult, CoreError>;
}

/// Power and OS actions on a dual-boot host
#[async_trait]
pub trait HostActuator: Send + Sync {
    /// Send the wake signal
    async fn wake(&self, host: &HostConfig) -> Result<ActionOutcome, CoreError>;

    async fn run_remote_command(
        &self,
        host: &HostConfig,
        command: &RemoteCommand,
    ) -> Result<CommandOutcome, CoreError>;
}

/// Status queries against the hypervisor
#[async_trait]
pub trait VmProbe: Send + Sync {
    /// Whether the hypervisor API answers with these credentials
    async fn test_connection(&self, vm: &VmConfig) -> Result<bool, CoreError>;

    /// Current power state, `None` when the query produced no answer
    async fn check_vm(&self, vm: &VmConfig) -> Result<Option<VmPowerState>, CoreError>;
}

/// Power commands against the hypervisor
#[async_trait]
pub trait VmActuator: Send + Sync {
    async fn start_vm(&self, vm: &VmConfig) -> Result<bool, CoreError>;

    async fn stop_vm(&self, vm: &VmConfig) -> Result<bool, CoreError>;
}

/// Cached probe and actuator handles for one host
#[derive(Clone)]
pub struct HostBackend {
    pub probe: Arc<dyn HostProbe>,
    pub actuator: Arc<dyn HostActuator>,
}

/// Cached probe and actuator handles for one VM
#[derive(Clone)]
pub struct VmBackend {
    pub probe: Arc<dyn VmProbe>,
    pub actuator: Arc<dyn VmActuator>,
}

/// Creates backend handles when a host is registered
///
/// Allows injection of different probes/actuators per host.
#[async_trait]
pub trait HostBackendFactory: Send + Sync {
    async fn create(&self, host: &HostConfig) -> Result<HostBackend, CoreError>;
}

/// Creates backend handles when a VM is registered
#[async_trait]
pub trait VmBackendFactory: Send + Sync {
    async fn create(&self, vm: &VmConfig) -> Result<VmBackend, CoreError>;
}
