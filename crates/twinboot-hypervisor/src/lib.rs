//! twinboot-hypervisor: Proxmox VE client
//!
//! Minimal REST surface needed to observe and power guests on and off.

pub mod error;
pub mod proxmox;

pub use error::{HypervisorError, Result};
pub use proxmox::{GuestKind, GuestRef, ProxmoxClient};
