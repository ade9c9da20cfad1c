//! Host transition workflows
//!
//! Each workflow runs as its own spawned task. Only one workflow per host
//! actuates at a time; a queued workflow re-samples the host once it gets
//! the lock, so a second boot request finds the host already booted.
//! Every exit path, including a panic, leaves the task terminal.

use std::future::IntoFuture;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use kameo::actor::ActorRef;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::actor::host::{HostActor, sample_host};
use crate::aggregate::panic_message;
use crate::config::{HostConfig, OrchestratorSettings};
use crate::message::HostStatusReport;
use crate::notify::EventPublisher;
use crate::state::{HostAction, HostState, OsTarget, TaskStatus};
use crate::tracker::{TaskId, TaskTracker};
use crate::traits::{CommandOutcome, HostBackend, RemoteCommand};

/// Why a workflow stopped before succeeding
#[derive(Debug, Clone, PartialEq, Eq)]
enum Failure {
    Failed(String),
    Cancelled,
}

impl Failure {
    fn context(self, context: &str) -> Self {
        match self {
            Failure::Failed(message) => Failure::Failed(format!("{context}: {message}")),
            Failure::Cancelled => Failure::Cancelled,
        }
    }
}

/// Everything a spawned transition needs, detached from the actor
pub(crate) struct HostWorkflow {
    pub task_id: TaskId,
    pub action: HostAction,
    pub config: Arc<HostConfig>,
    pub backend: HostBackend,
    pub host: ActorRef<HostActor>,
    pub tracker: TaskTracker,
    pub events: EventPublisher,
    pub settings: OrchestratorSettings,
    pub lock: Arc<Mutex<()>>,
    pub cancel: CancellationToken,
}

impl HostWorkflow {
    pub(crate) async fn run(self) {
        let outcome = AssertUnwindSafe(self.execute()).catch_unwind().await;
        let (status, message) = match outcome {
            Ok(Ok(message)) => (TaskStatus::Completed, message),
            Ok(Err(Failure::Failed(message))) => (TaskStatus::Failed, message),
            Ok(Err(Failure::Cancelled)) => (TaskStatus::Failed, "cancelled".to_string()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(host = %self.config.id, task = %self.task_id, error = %message, "workflow panicked");
                (TaskStatus::Failed, format!("unexpected error: {message}"))
            }
        };

        if self.tracker.update(self.task_id, status, message)
            && let Some(record) = self.tracker.get(self.task_id)
        {
            info!(
                host = %self.config.id,
                task = %self.task_id,
                status = %record.status,
                message = %record.message,
                "transition finished"
            );
            self.events.task_completed(&record);
        }
    }

    async fn execute(&self) -> Result<String, Failure> {
        let _guard = self.acquire_lock().await?;

        match self.action {
            HostAction::BootUbuntu => self.boot_ubuntu().await,
            HostAction::BootWindows => self.boot_windows().await,
            HostAction::ShutdownUbuntu => {
                self.single_command(OsTarget::Ubuntu, &self.config.commands.shutdown_ubuntu)
                    .await
            }
            HostAction::ShutdownWindows => {
                self.single_command(OsTarget::Windows, &self.config.commands.shutdown_windows)
                    .await
            }
            HostAction::RebootToUbuntu => {
                self.single_command(OsTarget::Windows, &self.config.commands.reboot_to_ubuntu)
                    .await
            }
        }
    }

    async fn acquire_lock(&self) -> Result<OwnedMutexGuard<()>, Failure> {
        if let Ok(guard) = self.lock.clone().try_lock_owned() {
            return Ok(guard);
        }
        self.progress("waiting for in-flight operation on this host");
        self.cancellable(self.lock.clone().lock_owned()).await
    }

    fn progress(&self, message: &str) {
        if self.tracker.progress(self.task_id, message)
            && let Some(record) = self.tracker.get(self.task_id)
        {
            self.events.task_progress(&record);
        }
    }

    async fn cancellable<F: IntoFuture>(&self, work: F) -> Result<F::Output, Failure> {
        let work = work.into_future();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Failure::Cancelled),
            output = work => Ok(output),
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<(), Failure> {
        self.cancellable(tokio::time::sleep(duration)).await
    }

    /// Sample through the actor so the cached state and notifications stay current
    async fn sample(&self) -> Result<HostStatusReport, Failure> {
        self.cancellable(sample_host(&self.host))
            .await?
            .map_err(|e| Failure::Failed(format!("status check failed: {e}")))
    }

    async fn current_state(&self) -> Result<HostState, Failure> {
        Ok(self.sample().await?.state)
    }

    async fn is_reachable(&self, os: OsTarget) -> Result<bool, Failure> {
        let report = self.sample().await?;
        Ok(report.error.is_none()
            && match os {
                OsTarget::Ubuntu => report.ubuntu_reachable,
                OsTarget::Windows => report.windows_reachable,
            })
    }

    /// Poll `os` until reachable or the boot timeout elapses
    async fn wait_for(&self, os: OsTarget) -> Result<(), Failure> {
        self.progress(&format!("waiting for {os} to boot"));
        let deadline = Instant::now() + self.settings.boot_timeout;

        loop {
            if self.is_reachable(os).await? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Failure::Failed(format!(
                    "timed out after {}s waiting for {os} to boot",
                    self.settings.boot_timeout.as_secs()
                )));
            }
            self.sleep(self.settings.poll_interval.min(deadline - now))
                .await?;
        }
    }

    async fn wake_with_retry(&self) -> Result<(), Failure> {
        let attempts = self.settings.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.progress(&format!("sending wake signal (attempt {attempt}/{attempts})"));
            match self.cancellable(self.backend.actuator.wake(&self.config)).await? {
                Ok(outcome) if outcome.ok => return Ok(()),
                Ok(outcome) => last_error = outcome.message,
                Err(e) => last_error = e.to_string(),
            }

            warn!(host = %self.config.id, attempt, error = %last_error, "wake attempt failed");
            if attempt < attempts {
                self.sleep(self.settings.retry_delay).await?;
            }
        }

        Err(Failure::Failed(format!(
            "wake failed after {attempts} attempts: {last_error}"
        )))
    }

    async fn boot_ubuntu(&self) -> Result<String, Failure> {
        if self.current_state().await? == HostState::Ubuntu {
            return Ok("Ubuntu is already running".to_string());
        }
        self.wake_into_ubuntu().await?;
        Ok("Ubuntu boot completed".to_string())
    }

    async fn wake_into_ubuntu(&self) -> Result<(), Failure> {
        self.wake_with_retry().await?;
        self.wait_for(OsTarget::Ubuntu).await
    }

    async fn boot_windows(&self) -> Result<String, Failure> {
        match self.current_state().await? {
            HostState::Windows => return Ok("Windows is already running".to_string()),
            HostState::Ubuntu => {}
            _ => {
                self.progress("booting Ubuntu first");
                self.wake_into_ubuntu()
                    .await
                    .map_err(|f| f.context("Ubuntu boot failed"))?;
            }
        }

        self.progress("switching to Windows");
        self.run_command(OsTarget::Ubuntu, &self.config.commands.boot_to_windows)
            .await
            .map_err(|f| f.context("Windows boot command failed"))?;

        self.wait_for(OsTarget::Windows).await?;
        Ok("Windows boot completed".to_string())
    }

    async fn single_command(&self, os: OsTarget, command: &str) -> Result<String, Failure> {
        let label = self.action.label();
        self.progress(&format!("sending {label} command"));
        self.run_command(os, command)
            .await
            .map_err(|f| f.context(&format!("{label} failed")))?;
        Ok(format!("{label} command sent"))
    }

    async fn run_command(&self, os: OsTarget, command: &str) -> Result<CommandOutcome, Failure> {
        let command = RemoteCommand {
            target: os,
            command: command.to_string(),
        };
        match self
            .cancellable(self.backend.actuator.run_remote_command(&self.config, &command))
            .await?
        {
            Ok(outcome) if outcome.ok => Ok(outcome),
            Ok(outcome) => Err(Failure::Failed(outcome.failure_message())),
            Err(e) => Err(Failure::Failed(e.to_string())),
        }
    }
}
