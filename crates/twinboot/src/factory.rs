//! Backend factories wiring SSH, Wake-on-LAN and Proxmox into the core contracts

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use twinboot_core::{
    ActionOutcome, CommandOutcome, CoreError, GuestType, HostActuator, HostBackend,
    HostBackendFactory, HostConfig, HostProbe, OsTarget, ProbeResult, RemoteCommand,
    SshCredentials, VmActuator, VmBackend, VmBackendFactory, VmConfig, VmPowerState, VmProbe,
    WindowsProbe,
};
use twinboot_exec::wol::{self, MagicPacket};
use twinboot_exec::{RemoteExecutor, SshExecutorBuilder, port};
use twinboot_hypervisor::{GuestKind, GuestRef, ProxmoxClient};

use crate::config::Settings;

const PROBE_MARKER: &str = "twinboot-probe";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Probes and actuators for one dual-boot host
///
/// Holds one SSH executor per operating system; sessions are opened lazily.
pub struct SshHostBackend {
    ubuntu: Arc<dyn RemoteExecutor>,
    windows: Arc<dyn RemoteExecutor>,
    ssh_timeout: Duration,
    port_timeout: Duration,
}

impl SshHostBackend {
    #[must_use]
    pub fn new(
        ubuntu: Arc<dyn RemoteExecutor>,
        windows: Arc<dyn RemoteExecutor>,
        ssh_timeout: Duration,
        port_timeout: Duration,
    ) -> Self {
        Self {
            ubuntu,
            windows,
            ssh_timeout,
            port_timeout,
        }
    }

    fn executor(&self, os: OsTarget) -> &Arc<dyn RemoteExecutor> {
        match os {
            OsTarget::Ubuntu => &self.ubuntu,
            OsTarget::Windows => &self.windows,
        }
    }

    async fn ssh_probe(&self, host: &HostConfig, os: OsTarget) -> ProbeResult {
        let command = format!("echo {PROBE_MARKER}");
        match self
            .executor(os)
            .run_with_timeout(&command, self.ssh_timeout)
            .await
        {
            Ok(result) if result.success() && result.stdout.trim() == PROBE_MARKER => {
                ProbeResult::reachable(format!("{os} SSH connection succeeded"))
            }
            Ok(result) => ProbeResult::unreachable(format!(
                "{os} SSH probe failed: {}",
                result.combined_output().trim()
            )),
            Err(e) => {
                debug!(host = %host.id, %os, error = %e, "SSH probe failed");
                ProbeResult::unreachable(format!("{os} SSH connection failed: {e}"))
            }
        }
    }
}

#[async_trait]
impl HostProbe for SshHostBackend {
    async fn check_ubuntu(&self, host: &HostConfig) -> Result<ProbeResult, CoreError> {
        Ok(self.ssh_probe(host, OsTarget::Ubuntu).await)
    }

    async fn check_windows(&self, host: &HostConfig) -> Result<ProbeResult, CoreError> {
        match host.windows_probe {
            WindowsProbe::Ssh => Ok(self.ssh_probe(host, OsTarget::Windows).await),
            WindowsProbe::Port { port } => {
                if port::is_port_open(&host.ip_address, port, self.port_timeout).await {
                    Ok(ProbeResult::reachable(format!("port {port} open")))
                } else {
                    Ok(ProbeResult::unreachable(format!("port {port} closed")))
                }
            }
        }
    }
}

#[async_trait]
impl HostActuator for SshHostBackend {
    async fn wake(&self, host: &HostConfig) -> Result<ActionOutcome, CoreError> {
        let packet = match MagicPacket::from_mac_str(&host.mac_address) {
            Ok(packet) => packet,
            Err(e) => return Ok(ActionOutcome::failed(e.to_string())),
        };
        let address = match wol::broadcast_address(host.wake.subnet.as_deref()) {
            Ok(address) => address,
            Err(e) => return Ok(ActionOutcome::failed(e.to_string())),
        };
        let target = SocketAddrV4::new(address, host.wake.port);

        match wol::send_magic_packet(&packet, target).await {
            Ok(()) => {
                info!(host = %host.id, %target, "magic packet sent");
                Ok(ActionOutcome::ok(format!("magic packet sent to {target}")))
            }
            Err(e) => Ok(ActionOutcome::failed(e.to_string())),
        }
    }

    async fn run_remote_command(
        &self,
        host: &HostConfig,
        command: &RemoteCommand,
    ) -> Result<CommandOutcome, CoreError> {
        let executor = self.executor(command.target);
        let run = executor.run_privileged(&command.command);

        let outcome = match tokio::time::timeout(COMMAND_TIMEOUT, run).await {
            Ok(Ok(result)) => CommandOutcome {
                ok: result.success(),
                stdout: result.stdout,
                stderr: result.stderr,
            },
            Ok(Err(e)) => CommandOutcome {
                ok: false,
                stdout: String::new(),
                stderr: e.to_string(),
            },
            Err(_) => CommandOutcome {
                ok: false,
                stdout: String::new(),
                stderr: format!("command timed out after {}s", COMMAND_TIMEOUT.as_secs()),
            },
        };

        if !outcome.ok {
            warn!(host = %host.id, os = %command.target, stderr = %outcome.stderr, "remote command failed");
        }
        Ok(outcome)
    }
}

/// Builds an [`SshHostBackend`] per registered host
pub struct DefaultHostFactory {
    ssh_timeout: Duration,
    port_timeout: Duration,
}

impl DefaultHostFactory {
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            ssh_timeout: settings.ssh_timeout(),
            port_timeout: settings.port_timeout(),
        }
    }

    fn executor(
        &self,
        host: &HostConfig,
        creds: &SshCredentials,
    ) -> Result<Arc<dyn RemoteExecutor>, CoreError> {
        let mut builder = SshExecutorBuilder::new(&host.ip_address, &creds.user)
            .with_port(creds.port)
            .with_connect_timeout(self.ssh_timeout);

        // Inline key text wins over a key file
        if let Some(text) = &creds.key_text {
            builder = builder.with_inline_key(text);
        } else if let Some(path) = &creds.key_path {
            builder = builder.with_key_path(path);
        }
        if let Some(password) = &creds.password {
            builder = builder.with_password(password);
        }

        let executor = builder
            .build()
            .map_err(|e| CoreError::ConfigError(format!("host {}: {e}", host.id)))?;
        Ok(Arc::new(executor))
    }
}

#[async_trait]
impl HostBackendFactory for DefaultHostFactory {
    async fn create(&self, host: &HostConfig) -> Result<HostBackend, CoreError> {
        let backend = Arc::new(SshHostBackend::new(
            self.executor(host, &host.ubuntu_ssh)?,
            self.executor(host, &host.windows_ssh)?,
            self.ssh_timeout,
            self.port_timeout,
        ));
        Ok(HostBackend {
            probe: backend.clone(),
            actuator: backend,
        })
    }
}

/// Probe and actuator for one Proxmox guest
pub struct ProxmoxVmBackend {
    client: ProxmoxClient,
    guest: GuestRef,
}

impl ProxmoxVmBackend {
    #[must_use]
    pub fn new(client: ProxmoxClient, guest: GuestRef) -> Self {
        Self { client, guest }
    }
}

fn backend_error(e: impl std::fmt::Display) -> CoreError {
    CoreError::Backend(e.to_string())
}

#[async_trait]
impl VmProbe for ProxmoxVmBackend {
    async fn test_connection(&self, vm: &VmConfig) -> Result<bool, CoreError> {
        match self.client.version().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.is_auth() {
                    warn!(vm = %vm.id, error = %e, "hypervisor rejected API token");
                }
                Err(backend_error(e))
            }
        }
    }

    async fn check_vm(&self, _vm: &VmConfig) -> Result<Option<VmPowerState>, CoreError> {
        let status = self
            .client
            .guest_status(&self.guest)
            .await
            .map_err(backend_error)?;
        Ok(Some(VmPowerState::from_hypervisor(&status)))
    }
}

#[async_trait]
impl VmActuator for ProxmoxVmBackend {
    async fn start_vm(&self, vm: &VmConfig) -> Result<bool, CoreError> {
        self.client.start(&self.guest).await.map_err(backend_error)?;
        info!(vm = %vm.id, vmid = self.guest.vmid, "start requested");
        Ok(true)
    }

    async fn stop_vm(&self, vm: &VmConfig) -> Result<bool, CoreError> {
        self.client.stop(&self.guest).await.map_err(backend_error)?;
        info!(vm = %vm.id, vmid = self.guest.vmid, "stop requested");
        Ok(true)
    }
}

/// Builds a [`ProxmoxVmBackend`] per registered VM
pub struct ProxmoxVmFactory {
    accept_invalid_certs: bool,
}

impl ProxmoxVmFactory {
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self {
            accept_invalid_certs: settings.accept_invalid_certs,
        }
    }
}

fn guest_ref(vm: &VmConfig) -> GuestRef {
    GuestRef {
        node: vm.node_name.clone(),
        kind: match vm.vm_type {
            GuestType::Qemu => GuestKind::Qemu,
            GuestType::Lxc => GuestKind::Lxc,
        },
        vmid: vm.vm_id,
    }
}

#[async_trait]
impl VmBackendFactory for ProxmoxVmFactory {
    async fn create(&self, vm: &VmConfig) -> Result<VmBackend, CoreError> {
        let client = ProxmoxClient::new(&vm.node_address, &vm.api_token, self.accept_invalid_certs)
            .map_err(|e| CoreError::ConfigError(format!("vm {}: {e}", vm.id)))?;
        let backend = Arc::new(ProxmoxVmBackend::new(client, guest_ref(vm)));
        Ok(VmBackend {
            probe: backend.clone(),
            actuator: backend,
        })
    }
}
