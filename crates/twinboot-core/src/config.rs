//! Configuration types for hosts, VMs and orchestration timing

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::OsTarget;

/// SSH login for one of the host's operating systems
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCredentials {
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Path to a private key file
    #[serde(default)]
    pub key_path: Option<String>,
    /// Private key in OpenSSH/PEM text form
    #[serde(default)]
    pub key_text: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl SshCredentials {
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            port: default_ssh_port(),
            key_path: None,
            key_text: None,
            password: None,
        }
    }
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .field("port", &self.port)
            .field("key_path", &self.key_path)
            .field("key_text", &self.key_text.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_ssh_port() -> u16 {
    22
}

/// Where the Wake-on-LAN packet is sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeTarget {
    /// IPv4 CIDR whose broadcast address receives the packet
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default = "default_wake_port")]
    pub port: u16,
}

impl Default for WakeTarget {
    fn default() -> Self {
        Self {
            subnet: None,
            port: default_wake_port(),
        }
    }
}

fn default_wake_port() -> u16 {
    9
}

/// How Windows reachability is detected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowsProbe {
    /// SSH login with the Windows credentials
    #[default]
    Ssh,
    /// TCP connect to a port, usually remote desktop
    Port {
        #[serde(default = "default_rdp_port")]
        port: u16,
    },
}

fn default_rdp_port() -> u16 {
    3389
}

/// Remote commands issued by the transition workflows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCommands {
    /// Run on Ubuntu to reboot into Windows
    #[serde(default = "default_boot_to_windows")]
    pub boot_to_windows: String,
    #[serde(default = "default_shutdown_ubuntu")]
    pub shutdown_ubuntu: String,
    #[serde(default = "default_shutdown_windows")]
    pub shutdown_windows: String,
    /// Run on Windows to reboot into the default (Ubuntu) boot entry
    #[serde(default = "default_reboot_to_ubuntu")]
    pub reboot_to_ubuntu: String,
}

impl Default for HostCommands {
    fn default() -> Self {
        Self {
            boot_to_windows: default_boot_to_windows(),
            shutdown_ubuntu: default_shutdown_ubuntu(),
            shutdown_windows: default_shutdown_windows(),
            reboot_to_ubuntu: default_reboot_to_ubuntu(),
        }
    }
}

fn default_boot_to_windows() -> String {
    "grub-reboot Windows && reboot".to_string()
}

fn default_shutdown_ubuntu() -> String {
    "sudo shutdown -h now".to_string()
}

fn default_shutdown_windows() -> String {
    "shutdown /s /f /t 0".to_string()
}

fn default_reboot_to_ubuntu() -> String {
    "shutdown /r /f /t 0".to_string()
}

/// Configuration for a single dual-boot host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Unique identifier
    pub id: String,
    /// Display name, unique across hosts
    pub name: String,
    pub mac_address: String,
    /// Management address used by both operating systems
    pub ip_address: String,
    #[serde(default)]
    pub wake: WakeTarget,
    pub ubuntu_ssh: SshCredentials,
    pub windows_ssh: SshCredentials,
    #[serde(default)]
    pub windows_probe: WindowsProbe,
    #[serde(default)]
    pub commands: HostCommands,
    #[serde(default)]
    pub description: Option<String>,
}

impl HostConfig {
    /// Credentials for the given operating system
    #[must_use]
    pub fn credentials(&self, os: OsTarget) -> &SshCredentials {
        match os {
            OsTarget::Ubuntu => &self.ubuntu_ssh,
            OsTarget::Windows => &self.windows_ssh,
        }
    }
}

/// Hypervisor guest flavour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    #[default]
    Qemu,
    Lxc,
}

/// Configuration for a single hypervisor-managed VM or container
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Unique identifier
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub vm_type: GuestType,
    /// Hypervisor-local numeric id
    pub vm_id: u32,
    pub node_name: String,
    /// Hypervisor API endpoint as `host:port`
    pub node_address: String,
    pub api_token: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl fmt::Debug for VmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("vm_type", &self.vm_type)
            .field("vm_id", &self.vm_id)
            .field("node_name", &self.node_name)
            .field("node_address", &self.node_address)
            .field("api_token", &"<redacted>")
            .field("description", &self.description)
            .finish()
    }
}

/// Timing and retry policy shared by workflows and background loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Maximum time a boot workflow polls for the target OS
    pub boot_timeout: Duration,
    /// Interval between reachability polls during a boot
    pub poll_interval: Duration,
    /// Number of wake attempts before a boot fails
    pub max_retries: u32,
    /// Delay between wake attempts
    pub retry_delay: Duration,
    /// Wait after a VM power command before its status is refreshed
    pub settle_delay: Duration,
    /// VM monitor refresh interval
    pub monitor_interval: Duration,
    /// VM monitor delay after a failed iteration
    pub monitor_backoff: Duration,
    /// Status snapshot broadcast interval
    pub broadcast_interval: Duration,
    /// Age after which tasks are purged from the ledger
    pub task_max_age: Duration,
    /// Capacity of the event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            settle_delay: Duration::from_secs(2),
            monitor_interval: Duration::from_secs(10),
            monitor_backoff: Duration::from_secs(5),
            broadcast_interval: Duration::from_secs(5),
            task_max_age: Duration::from_secs(24 * 60 * 60),
            event_channel_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_config_defaults_from_json() {
        let config: HostConfig = serde_json::from_value(serde_json::json!({
            "id": "pc-1",
            "name": "Workstation",
            "mac_address": "AA:BB:CC:DD:EE:FF",
            "ip_address": "192.168.1.20",
            "ubuntu_ssh": { "user": "ubuntu" },
            "windows_ssh": { "user": "admin", "password": "pw" }
        }))
        .unwrap();

        assert_eq!(config.wake, WakeTarget::default());
        assert_eq!(config.ubuntu_ssh.port, 22);
        assert_eq!(config.windows_probe, WindowsProbe::Ssh);
        assert_eq!(config.commands.boot_to_windows, "grub-reboot Windows && reboot");
        assert_eq!(config.credentials(OsTarget::Windows).user, "admin");
    }

    #[test]
    fn test_windows_port_probe_default_port() {
        let probe: WindowsProbe = serde_json::from_value(serde_json::json!({ "kind": "port" })).unwrap();
        assert_eq!(probe, WindowsProbe::Port { port: 3389 });
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut creds = SshCredentials::new("admin");
        creds.password = Some("hunter2".to_string());
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
