//! twinboot-core: Lifecycle orchestration for dual-boot hosts and VMs
//!
//! Implements the `OrchestratorActor`, `HostActor` and `VmControllerActor`
//! using the kameo framework, the task ledger shared by their workflows,
//! the VM monitor and the periodic status broadcast.

pub mod actor;
pub mod aggregate;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod host;
pub mod message;
pub mod monitor;
pub mod notify;
pub mod state;
pub mod tracker;
pub mod traits;
pub mod vm;
mod workflow;

pub use actor::host::{HostActor, HostActorArgs};
pub use actor::orchestrator::{OrchestratorActor, OrchestratorActorArgs};
pub use actor::vm::{VmControllerActor, VmControllerActorArgs};
pub use broadcast::{StatusBroadcaster, build_snapshot};
pub use config::{
    GuestType, HostCommands, HostConfig, OrchestratorSettings, SshCredentials, VmConfig,
    WakeTarget, WindowsProbe,
};
pub use error::CoreError;
pub use host::HostOrchestrator;
pub use message::{HostStatusReport, RefreshOutcome, VmStatus};
pub use monitor::VmMonitor;
pub use notify::EventPublisher;
pub use state::{HostAction, HostState, OsTarget, TaskKind, TaskStatus, VmAction, VmPowerState};
pub use tracker::{TaskId, TaskRecord, TaskTracker};
pub use traits::{
    ActionOutcome, CommandOutcome, HostActuator, HostBackend, HostBackendFactory, HostProbe,
    ProbeResult, RemoteCommand, VmActuator, VmBackend, VmBackendFactory, VmProbe,
};
pub use vm::VmOrchestrator;
