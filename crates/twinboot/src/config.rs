//! Configuration loading and types
//!
//! The daemon reads `twinboot.toml` once at startup. Registry entries are
//! validated and legacy flat SSH fields are folded into the per-OS
//! credential tables before anything reaches the core.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Result, WrapErr, bail};
use serde::Deserialize;
use tracing::{info, warn};

use twinboot_core::{
    HostCommands, HostConfig, OrchestratorSettings, SshCredentials, VmConfig, WakeTarget,
    WindowsProbe,
};
use twinboot_exec::wol;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV: &str = "TWINBOOT_CONFIG";

/// Top-level configuration for the twinboot daemon
#[derive(Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub settings: Settings,
    /// Dual-boot hosts
    #[serde(default)]
    pub host: Vec<HostEntry>,
    /// Hypervisor guests
    #[serde(default)]
    pub vm: Vec<VmConfig>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Daemon process settings
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Timing and limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub boot_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub settle_delay_secs: u64,
    pub monitor_interval_secs: u64,
    pub monitor_backoff_secs: u64,
    pub broadcast_interval_secs: u64,
    pub task_max_age_hours: u64,
    pub ssh_timeout_secs: u64,
    pub port_timeout_secs: u64,
    pub event_channel_capacity: usize,
    pub max_hosts: usize,
    /// Accept self-signed hypervisor certificates
    pub accept_invalid_certs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            boot_timeout_secs: 300,
            poll_interval_secs: 5,
            max_retries: 3,
            retry_delay_secs: 2,
            settle_delay_secs: 2,
            monitor_interval_secs: 10,
            monitor_backoff_secs: 5,
            broadcast_interval_secs: 5,
            task_max_age_hours: 24,
            ssh_timeout_secs: 10,
            port_timeout_secs: 5,
            event_channel_capacity: 1024,
            max_hosts: 20,
            accept_invalid_certs: true,
        }
    }
}

impl Settings {
    /// Apply `BOOT_TIMEOUT`-style overrides from the environment
    ///
    /// # Errors
    /// Returns an error if a variable is set but not a number.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        override_from(&lookup, "BOOT_TIMEOUT", &mut self.boot_timeout_secs)?;
        override_from(&lookup, "STATUS_CHECK_INTERVAL", &mut self.poll_interval_secs)?;
        override_from(&lookup, "MAX_RETRIES", &mut self.max_retries)?;
        override_from(&lookup, "RETRY_DELAY", &mut self.retry_delay_secs)?;
        override_from(&lookup, "SSH_TIMEOUT", &mut self.ssh_timeout_secs)?;
        override_from(&lookup, "PORT_SCAN_TIMEOUT", &mut self.port_timeout_secs)?;
        override_from(&lookup, "MAX_PCS", &mut self.max_hosts)?;
        Ok(())
    }

    #[must_use]
    pub fn orchestrator(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            boot_timeout: Duration::from_secs(self.boot_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            settle_delay: Duration::from_secs(self.settle_delay_secs),
            monitor_interval: Duration::from_secs(self.monitor_interval_secs),
            monitor_backoff: Duration::from_secs(self.monitor_backoff_secs),
            broadcast_interval: Duration::from_secs(self.broadcast_interval_secs),
            task_max_age: Duration::from_secs(self.task_max_age_hours * 3600),
            event_channel_capacity: self.event_channel_capacity,
        }
    }

    #[must_use]
    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }

    #[must_use]
    pub fn port_timeout(&self) -> Duration {
        Duration::from_secs(self.port_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        let intervals = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("monitor_interval_secs", self.monitor_interval_secs),
            ("monitor_backoff_secs", self.monitor_backoff_secs),
            ("broadcast_interval_secs", self.broadcast_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("settings.{name} must be greater than zero");
            }
        }
        if self.task_max_age_hours == 0 {
            bail!("settings.task_max_age_hours must be greater than zero");
        }
        Ok(())
    }
}

fn override_from<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    slot: &mut T,
) -> Result<()> {
    if let Some(raw) = lookup(var) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| eyre::eyre!("{var} must be a non-negative integer, got {raw:?}"))?;
        info!(var, value = %raw.trim(), "setting overridden from environment");
    }
    Ok(())
}

/// Host entry as written in the file
///
/// Accepts the older flat `ssh_*` fields; see [`HostEntry::into_host_config`].
#[derive(Clone, Deserialize)]
pub struct HostEntry {
    pub id: String,
    pub name: String,
    pub mac_address: String,
    pub ip_address: String,
    #[serde(default)]
    pub wake: WakeTarget,
    pub ubuntu_ssh: Option<SshCredentials>,
    pub windows_ssh: Option<SshCredentials>,
    pub windows_probe: Option<WindowsProbe>,
    #[serde(default)]
    pub commands: HostCommands,
    pub description: Option<String>,

    // Legacy flat fields
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_key_path: Option<String>,
    pub ssh_key_text: Option<String>,
    pub ssh_password: Option<String>,
    pub rdp_port: Option<u16>,
    pub boot_command: Option<String>,
}

impl HostEntry {
    fn uses_legacy_ssh(&self) -> bool {
        self.ssh_user.is_some()
            || self.ssh_port.is_some()
            || self.ssh_key_path.is_some()
            || self.ssh_key_text.is_some()
            || self.ssh_password.is_some()
    }

    /// Resolve into the core host configuration
    ///
    /// Legacy `ssh_*` fields take precedence over `ubuntu_ssh`; `rdp_port`
    /// selects port probing for Windows unless `windows_probe` is set.
    ///
    /// # Errors
    /// Returns an error if either credential table is missing.
    pub fn into_host_config(self) -> Result<HostConfig> {
        let legacy = self.uses_legacy_ssh();
        if legacy {
            warn!(host = %self.id, "host uses deprecated ssh_* fields, move them to [host.ubuntu_ssh]");
        }

        let ubuntu_ssh = if legacy {
            SshCredentials {
                user: self.ssh_user.unwrap_or_else(|| "ubuntu".to_string()),
                port: self.ssh_port.unwrap_or(22),
                key_path: self.ssh_key_path.filter(|p| !p.is_empty()),
                key_text: self.ssh_key_text.filter(|k| !k.is_empty()),
                password: self.ssh_password.filter(|p| !p.is_empty()),
            }
        } else {
            match self.ubuntu_ssh {
                Some(creds) => normalize(creds),
                None => bail!("host {}: missing [host.ubuntu_ssh]", self.id),
            }
        };

        let Some(windows_ssh) = self.windows_ssh.map(normalize) else {
            bail!("host {}: missing [host.windows_ssh]", self.id);
        };

        let windows_probe = self
            .windows_probe
            .or(self.rdp_port.map(|port| WindowsProbe::Port { port }))
            .unwrap_or_default();

        let mut commands = self.commands;
        if let Some(boot_command) = self.boot_command {
            commands.boot_to_windows = boot_command;
        }

        Ok(HostConfig {
            id: self.id,
            name: self.name,
            mac_address: self.mac_address,
            ip_address: self.ip_address,
            wake: self.wake,
            ubuntu_ssh,
            windows_ssh,
            windows_probe,
            commands,
            description: self.description,
        })
    }
}

fn normalize(mut creds: SshCredentials) -> SshCredentials {
    creds.password = creds.password.filter(|p| !p.is_empty());
    creds.key_path = creds.key_path.filter(|p| !p.is_empty());
    creds.key_text = creds.key_text.filter(|k| !k.is_empty());
    creds
}

/// Validated registry contents ready to hand to the orchestrators
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub hosts: Vec<HostConfig>,
    pub vms: Vec<VmConfig>,
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).wrap_err_with(|| format!("invalid configuration in {}", path.display()))
    }

    /// # Errors
    /// Returns error if the text is not valid TOML for this schema
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Configuration file to read: the explicit path, `$TWINBOOT_CONFIG`,
    /// or the first existing default location
    #[must_use]
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        default_paths().into_iter().find(|path| path.exists())
    }

    /// Validate the file contents and migrate legacy host entries
    ///
    /// # Errors
    /// Returns an error describing the first invalid setting or entry.
    pub fn resolve(&self) -> Result<Registry> {
        self.settings.validate()?;

        if self.host.len() > self.settings.max_hosts {
            bail!(
                "{} hosts configured, at most {} allowed",
                self.host.len(),
                self.settings.max_hosts
            );
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        let mut hosts = Vec::with_capacity(self.host.len());
        for entry in &self.host {
            if entry.id.trim().is_empty() {
                bail!("host with empty id");
            }
            if !ids.insert(entry.id.clone()) {
                bail!("duplicate host id {}", entry.id);
            }
            if !names.insert(entry.name.clone()) {
                bail!("duplicate host name {}", entry.name);
            }
            wol::parse_mac(&entry.mac_address).wrap_err_with(|| format!("host {}", entry.id))?;
            wol::broadcast_address(entry.wake.subnet.as_deref())
                .wrap_err_with(|| format!("host {}", entry.id))?;
            if entry.ip_address.trim().is_empty() {
                bail!("host {}: empty ip_address", entry.id);
            }
            hosts.push(entry.clone().into_host_config()?);
        }

        let mut vm_ids = HashSet::new();
        let mut vm_names = HashSet::new();
        let mut guests = HashSet::new();
        for vm in &self.vm {
            if vm.id.trim().is_empty() {
                bail!("vm with empty id");
            }
            if !vm_ids.insert(vm.id.clone()) {
                bail!("duplicate vm id {}", vm.id);
            }
            if !vm_names.insert(vm.name.clone()) {
                bail!("duplicate vm name {}", vm.name);
            }
            if !guests.insert((vm.node_name.clone(), vm.vm_id)) {
                bail!(
                    "vm {}: guest {} on node {} is already configured",
                    vm.id,
                    vm.vm_id,
                    vm.node_name
                );
            }
        }

        Ok(Registry {
            hosts,
            vms: self.vm.clone(),
        })
    }
}

fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("twinboot.toml"),
        PathBuf::from("/etc/twinboot/twinboot.toml"),
    ];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("twinboot/twinboot.toml"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SAMPLE: &str = r#"
[daemon]
log_level = "debug"
log_format = "json"

[settings]
boot_timeout_secs = 120

[[host]]
id = "pc-1"
name = "Gaming PC"
mac_address = "AA:BB:CC:DD:EE:FF"
ip_address = "192.168.1.100"
wake = { subnet = "192.168.1.0/24" }

[host.ubuntu_ssh]
user = "ubuntu"
key_path = "~/.ssh/id_ed25519"

[host.windows_ssh]
user = "administrator"
password = "hunter2"

[[vm]]
id = "vm-1"
name = "Dev Server"
vm_type = "lxc"
vm_id = 100
node_name = "pve"
node_address = "192.168.1.10:8006"
api_token = "PVEAPIToken=root@pam!token=uuid"
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.log_format, LogFormat::Json);
        assert_eq!(config.settings.boot_timeout_secs, 120);
        assert_eq!(config.settings.poll_interval_secs, 5);

        let registry = config.resolve().unwrap();
        assert_eq!(registry.hosts.len(), 1);
        let host = &registry.hosts[0];
        assert_eq!(host.wake.subnet.as_deref(), Some("192.168.1.0/24"));
        assert_eq!(host.wake.port, 9);
        assert_eq!(host.ubuntu_ssh.port, 22);
        assert_eq!(host.windows_ssh.password.as_deref(), Some("hunter2"));
        assert_eq!(host.windows_probe, WindowsProbe::Ssh);
        assert_eq!(registry.vms[0].vm_id, 100);
    }

    #[test]
    fn test_locate_prefers_explicit_path() {
        let path = Path::new("/srv/twinboot/custom.toml");
        assert_eq!(Config::locate(Some(path)), Some(path.to_path_buf()));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.daemon.log_format, LogFormat::Pretty);
        assert!(config.resolve().unwrap().hosts.is_empty());
    }

    #[test]
    fn test_orchestrator_settings_conversion() {
        let settings = Settings::default().orchestrator();
        assert_eq!(settings.boot_timeout, Duration::from_secs(300));
        assert_eq!(settings.task_max_age, Duration::from_secs(24 * 3600));
        assert_eq!(settings.event_channel_capacity, 1024);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BOOT_TIMEOUT", "600"),
            ("MAX_RETRIES", " 5 "),
            ("SSH_TIMEOUT", "3"),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings::default();
        settings
            .apply_env(|var| env.get(var).map(ToString::to_string))
            .unwrap();

        assert_eq!(settings.boot_timeout_secs, 600);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.ssh_timeout(), Duration::from_secs(3));
        assert_eq!(settings.poll_interval_secs, 5);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(|var| (var == "RETRY_DELAY").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("RETRY_DELAY"));
    }

    #[test]
    fn test_legacy_fields_are_migrated() {
        let text = r#"
[[host]]
id = "pc-1"
name = "Old PC"
mac_address = "AA-BB-CC-DD-EE-FF"
ip_address = "10.0.0.5"
ssh_user = "me"
ssh_port = 2222
ssh_password = ""
rdp_port = 3390
boot_command = "sudo grub-reboot 2 && sudo reboot"

[host.ubuntu_ssh]
user = "ignored"

[host.windows_ssh]
user = "admin"
"#;
        let registry = Config::parse(text).unwrap().resolve().unwrap();
        let host = &registry.hosts[0];
        assert_eq!(host.ubuntu_ssh.user, "me");
        assert_eq!(host.ubuntu_ssh.port, 2222);
        assert!(host.ubuntu_ssh.password.is_none());
        assert_eq!(host.windows_probe, WindowsProbe::Port { port: 3390 });
        assert_eq!(host.commands.boot_to_windows, "sudo grub-reboot 2 && sudo reboot");
    }

    #[test]
    fn test_missing_windows_credentials_rejected() {
        let text = r#"
[[host]]
id = "pc-1"
name = "PC"
mac_address = "AA:BB:CC:DD:EE:FF"
ip_address = "10.0.0.5"

[host.ubuntu_ssh]
user = "ubuntu"
"#;
        let err = Config::parse(text).unwrap().resolve().unwrap_err();
        assert!(err.to_string().contains("windows_ssh"));
    }

    #[test]
    fn test_duplicate_host_name_rejected() {
        let mut config = Config::parse(SAMPLE).unwrap();
        let mut copy = config.host[0].clone();
        copy.id = "pc-2".to_string();
        config.host.push(copy);

        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("duplicate host name"));
    }

    #[test]
    fn test_bad_mac_rejected() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.host[0].mac_address = "not-a-mac".to_string();
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_duplicate_guest_rejected() {
        let mut config = Config::parse(SAMPLE).unwrap();
        let mut copy = config.vm[0].clone();
        copy.id = "vm-2".to_string();
        copy.name = "Other".to_string();
        config.vm.push(copy);

        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("already configured"));
    }

    #[test]
    fn test_host_limit() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.settings.max_hosts = 0;
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = Config::default();
        config.settings.monitor_interval_secs = 0;
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("monitor_interval_secs"));
    }
}
