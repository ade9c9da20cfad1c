//! twinboot-exec: Host-side actuators and probes
//!
//! SSH command execution, Wake-on-LAN magic packets and TCP port
//! reachability checks used to drive dual-boot machines.

pub mod error;
pub mod keys;
pub mod port;
pub mod result;
pub mod ssh;
pub mod traits;
pub mod wol;

pub use error::{ExecError, WakeError};
pub use keys::KeySource;
pub use result::{CommandResult, ConnectionInfo};
pub use ssh::{SshExecutor, SshExecutorBuilder};
pub use traits::RemoteExecutor;
