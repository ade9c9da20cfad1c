//! Actor implementations

pub mod host;
pub mod orchestrator;
pub mod vm;

pub use host::{HostActor, HostActorArgs};
pub use orchestrator::{OrchestratorActor, OrchestratorActorArgs};
pub use vm::{VmControllerActor, VmControllerActorArgs};
