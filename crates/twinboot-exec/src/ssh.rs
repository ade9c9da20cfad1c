//! SSH command execution using russh crate

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, decode_secret_key, load_secret_key};
use russh::{ChannelMsg, Disconnect, client};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ExecError;
use crate::keys::{KeySource, ResolvedKey};
use crate::result::{CommandResult, ConnectionInfo};
use crate::traits::RemoteExecutor;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Hosts are re-imaged between OSes and present different host keys,
        // so keys are accepted like StrictHostKeyChecking=no
        Ok(true)
    }
}

/// SSH command executor
///
/// Manages an SSH session for remote command execution.
/// Connections are established on first use and dropped after an I/O
/// failure so the next call reconnects.
pub struct SshExecutor {
    /// Connection configuration
    conn_info: ConnectionInfo,
    /// Resolved SSH key, `None` for password authentication
    key: Option<ResolvedKey>,
    /// SSH session (initialized on first use)
    session: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("conn_info", &self.conn_info)
            .field("key", &self.key.as_ref().map(|k| k.path().cloned()))
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshExecutor {
    /// Create a new SSH executor
    ///
    /// # Arguments
    /// * `conn_info` - Connection details (host, user, port, password)
    /// * `key_source` - How to obtain the SSH key, `None` to use the password
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if key resolution fails
    pub fn new(conn_info: ConnectionInfo, key_source: Option<&KeySource>) -> Result<Self, ExecError> {
        let key = key_source
            .map(KeySource::resolve)
            .transpose()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        Ok(Self {
            conn_info,
            key,
            session: Mutex::new(None),
        })
    }

    /// Get connection info
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }

    fn load_key(&self) -> Result<Option<PrivateKey>, ExecError> {
        let Some(key) = &self.key else {
            return Ok(None);
        };

        let loaded = match (key.path(), key.text()) {
            (Some(path), _) => load_secret_key(path, None),
            (None, Some(text)) => decode_secret_key(text, None),
            (None, None) => return Ok(None),
        };

        loaded
            .map(Some)
            .map_err(|e| ExecError::SshKeyError(e.to_string()))
    }

    /// Connect to the remote host
    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn connect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if session_lock.is_some() {
            return Ok(());
        }

        debug!(
            host = %self.conn_info.host,
            port = self.conn_info.port,
            user = %self.conn_info.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let connect_timeout = self.conn_info.connect_timeout;

        let mut session = timeout(
            connect_timeout,
            client::connect(
                config,
                (&self.conn_info.host[..], self.conn_info.port),
                SshClientHandler,
            ),
        )
        .await
        .map_err(|_| ExecError::Timeout {
            timeout: connect_timeout,
        })?
        .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let auth_res = if let Some(key_pair) = self.load_key()? {
            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            session
                .authenticate_publickey(
                    &self.conn_info.user,
                    PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                )
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
        } else if let Some(password) = &self.conn_info.password {
            session
                .authenticate_password(&self.conn_info.user, password)
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
        } else {
            return Err(ExecError::AuthenticationFailed(
                "No authentication method available".to_string(),
            ));
        };

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(format!(
                "server rejected credentials for {}",
                self.conn_info.user
            )));
        }

        info!(host = %self.conn_info.host, "SSH connected and authenticated");

        *session_lock = Some(session);
        Ok(())
    }

    /// Execute command on remote host
    #[instrument(skip(self, cmd), fields(host = %self.conn_info.host))]
    async fn execute_remote(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let mut session_lock = self.session.lock().await;

        let session = session_lock.as_mut().ok_or(ExecError::NotConnected)?;

        let start = Instant::now();

        let mut channel = match session.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                // stale session, reconnect next time
                *session_lock = None;
                return Err(ExecError::IoError(e.to_string()));
            }
        };

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut status = -1;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    status = exit_status.cast_signed();
                }
                Some(ChannelMsg::Eof) | None => break,
                _ => {}
            }
        }

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();

        debug!(
            status = status,
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }

    /// Disconnect from remote host
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if disconnection fails
    pub async fn disconnect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if let Some(session) = session_lock.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(host = %self.conn_info.host, "SSH disconnected");
        }
        Ok(())
    }
}

/// Rewrite a command so every `sudo` in it reads the password from stdin
///
/// The password is piped into `sh -c` once and replayed to each `sudo`
/// through a shell function, so chains like `sudo a && sudo b` never depend
/// on sudo's credential cache. Commands without `sudo`, or hosts without a
/// password, are returned unchanged.
#[must_use]
pub fn privileged_command(cmd: &str, password: Option<&str>) -> String {
    let Some(password) = password else {
        return cmd.to_string();
    };
    if !cmd.split_whitespace().any(|word| word == "sudo") {
        return cmd.to_string();
    }

    let script = format!(
        "IFS= read -r {SUDO_PASSWORD_VAR}; \
         sudo() {{ printf '%s\\n' \"${SUDO_PASSWORD_VAR}\" | command sudo -S -p '' \"$@\"; }}; \
         {cmd}"
    );
    format!(
        "printf '%s\\n' {} | sh -c {}",
        shell_quote(password),
        shell_quote(&script)
    )
}

const SUDO_PASSWORD_VAR: &str = "__twinboot_sudo_pw";

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.connect().await?;
        self.execute_remote(cmd).await
    }

    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        self.connect().await?;

        let result = timeout(timeout_duration, self.execute_remote(cmd)).await;

        match result {
            Ok(Ok(cmd_result)) => Ok(cmd_result),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                error!(
                    command = %cmd,
                    timeout = ?timeout_duration,
                    elapsed = ?start.elapsed(),
                    "command timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    #[instrument(skip(self, cmd), fields(host = %self.conn_info.host))]
    async fn run_privileged(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        if self.conn_info.password.is_none() && cmd.contains("sudo") {
            warn!("no password configured, sudo may prompt and fail");
        }
        let full = privileged_command(cmd, self.conn_info.password.as_deref());
        self.run(&full).await
    }

    fn is_connected(&self) -> bool {
        // only a hint: the session may have been closed by the peer
        let session_opt = self.session.try_lock();
        session_opt.map(|s| s.is_some()).unwrap_or(false)
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}

/// Builder for `SshExecutor`
pub struct SshExecutorBuilder {
    conn_info: ConnectionInfo,
    key_source: Option<KeySource>,
}

impl SshExecutorBuilder {
    /// Create builder with required fields
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            conn_info: ConnectionInfo::new(host, user),
            key_source: None,
        }
    }

    /// Set SSH key path
    #[must_use]
    pub fn with_key_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.key_source = Some(KeySource::Path(path.into()));
        self
    }

    /// Use key text stored in configuration
    #[must_use]
    pub fn with_inline_key(mut self, text: impl Into<String>) -> Self {
        self.key_source = Some(KeySource::Inline(text.into()));
        self
    }

    /// Set key from environment variable (base64)
    #[must_use]
    pub fn with_env_key(mut self, var_name: impl Into<String>) -> Self {
        self.key_source = Some(KeySource::Env(var_name.into()));
        self
    }

    /// Set password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.conn_info = self.conn_info.with_password(password);
        self
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.conn_info.port = port;
        self
    }

    /// Set connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.conn_info.connect_timeout = timeout;
        self
    }

    /// Build the executor
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if key resolution fails
    pub fn build(self) -> Result<SshExecutor, ExecError> {
        SshExecutor::new(self.conn_info, self.key_source.as_ref())
    }
}
