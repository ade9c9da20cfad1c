//! VM orchestration: facade, power workflows and status refresh

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use kameo::actor::{ActorRef, Spawn};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use twinboot_api::events::WsEvent;

use crate::actor::vm::{VmControllerActor, VmControllerActorArgs};
use crate::aggregate::{fan_out, panic_message};
use crate::config::{OrchestratorSettings, VmConfig};
use crate::error::{CoreError, from_send_error};
use crate::message::{
    ApplyRefresh, BeginVmAction, GetRefreshTarget, GetVmStatus, ListRefreshTargets,
    ListVmStatuses, MarkVmStatus, RefreshOutcome, RefreshTarget, RegisterVm, RenameVm,
    UnregisterVm, VmStatus,
};
use crate::monitor::VmMonitor;
use crate::notify::EventPublisher;
use crate::state::{TaskStatus, VmAction, VmPowerState};
use crate::tracker::{TaskId, TaskRecord, TaskTracker};
use crate::traits::{VmBackend, VmBackendFactory};

/// Query the hypervisor for one VM
///
/// Connectivity is checked first while the VM has never answered a
/// status query; a failed check skips the query.
pub(crate) async fn probe_vm(target: &RefreshTarget) -> RefreshOutcome {
    let probe = &target.backend.probe;

    if target.needs_precheck {
        match probe.test_connection(&target.config).await {
            Ok(true) => {}
            Ok(false) => {
                return RefreshOutcome::ConnectionFailed("hypervisor connection failed".to_string());
            }
            Err(e) => {
                return RefreshOutcome::ConnectionFailed(format!("hypervisor connection failed: {e}"));
            }
        }
    }

    match probe.check_vm(&target.config).await {
        Ok(Some(status)) => RefreshOutcome::Status(status),
        Ok(None) => RefreshOutcome::QueryFailed("status query failed".to_string()),
        Err(e) => RefreshOutcome::QueryFailed(format!("status query failed: {e}")),
    }
}

/// Refresh one VM and return its updated status
///
/// Returns `Ok(None)` when the VM was removed while it was being queried.
pub(crate) async fn refresh_vm(
    controller: &ActorRef<VmControllerActor>,
    vm_id: &str,
) -> Result<Option<VmStatus>, CoreError> {
    let target = controller
        .ask(GetRefreshTarget {
            vm_id: vm_id.to_string(),
        })
        .await
        .map_err(from_send_error)?;
    let outcome = probe_vm(&target).await;
    controller
        .ask(ApplyRefresh {
            vm_id: target.vm_id,
            outcome,
        })
        .await
        .map_err(from_send_error)
}

/// Refresh every registered VM concurrently, returning how many were queried
pub(crate) async fn refresh_all(controller: &ActorRef<VmControllerActor>) -> Result<usize, CoreError> {
    let targets: HashMap<String, RefreshTarget> = controller
        .ask(ListRefreshTargets)
        .await
        .map_err(from_send_error)?
        .into_iter()
        .map(|target| (target.vm_id.clone(), target))
        .collect();

    let outcomes = fan_out(
        targets.keys().cloned(),
        |vm_id| {
            let target = targets.get(&vm_id).cloned();
            async move {
                let target = target.ok_or(CoreError::VmNotFound(vm_id))?;
                Ok(probe_vm(&target).await)
            }
        },
        |_, error| RefreshOutcome::QueryFailed(error),
    )
    .await;

    let count = outcomes.len();
    for (vm_id, outcome) in outcomes {
        controller
            .ask(ApplyRefresh { vm_id, outcome })
            .await
            .map_err(from_send_error)?;
    }
    Ok(count)
}

/// Spawned start/stop of one VM
pub(crate) struct VmWorkflow {
    pub task_id: TaskId,
    pub action: VmAction,
    pub config: Arc<VmConfig>,
    pub backend: VmBackend,
    pub controller: ActorRef<VmControllerActor>,
    pub tracker: TaskTracker,
    pub events: EventPublisher,
    pub settle_delay: Duration,
    pub lock: Arc<Mutex<()>>,
    pub cancel: CancellationToken,
}

impl VmWorkflow {
    pub(crate) async fn run(self) {
        let outcome = AssertUnwindSafe(self.execute()).catch_unwind().await;
        let (status, message) = match outcome {
            Ok(Ok(message)) => (TaskStatus::Completed, message),
            Ok(Err(message)) => (TaskStatus::Failed, message),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(vm = %self.config.id, task = %self.task_id, error = %message, "vm workflow panicked");
                (TaskStatus::Failed, format!("error: {message}"))
            }
        };

        // Refresh regardless of the outcome, unless the VM is gone
        if !self.cancel.is_cancelled()
            && let Err(e) = refresh_vm(&self.controller, &self.config.id).await
        {
            warn!(vm = %self.config.id, error = %e, "status refresh after vm action failed");
        }

        if self.tracker.update(self.task_id, status, message)
            && let Some(record) = self.tracker.get(self.task_id)
        {
            info!(vm = %self.config.id, task = %self.task_id, status = %record.status, "vm action finished");
            self.events.task_completed(&record);
        }
    }

    async fn execute(&self) -> Result<String, String> {
        let _guard = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err("cancelled".to_string()),
            guard = self.lock.clone().lock_owned() => guard,
        };

        let (running, done, failed) = match self.action {
            VmAction::Start => ("starting VM", "VM started", "VM start failed"),
            VmAction::Stop => ("stopping VM", "VM stopped", "VM stop failed"),
        };
        if self.tracker.update(self.task_id, TaskStatus::Running, running)
            && let Some(record) = self.tracker.get(self.task_id)
        {
            self.events.task_progress(&record);
        }

        if self.action == VmAction::Start
            && let Err(e) = self
                .controller
                .ask(MarkVmStatus {
                    vm_id: self.config.id.clone(),
                    status: VmPowerState::Starting,
                })
                .await
        {
            warn!(vm = %self.config.id, error = %e, "failed to mark vm as starting");
        }

        let actuator = &self.backend.actuator;
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err("cancelled".to_string()),
            result = async {
                match self.action {
                    VmAction::Start => actuator.start_vm(&self.config).await,
                    VmAction::Stop => actuator.stop_vm(&self.config).await,
                }
            } => result,
        };

        match result {
            Ok(true) => {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Err("cancelled".to_string()),
                    () = tokio::time::sleep(self.settle_delay) => {}
                }
                Ok(done.to_string())
            }
            Ok(false) => Err(failed.to_string()),
            Err(e) => Err(format!("{failed}: {e}")),
        }
    }
}

/// Cloneable handle to the VM controller and its monitor
#[derive(Clone)]
pub struct VmOrchestrator {
    controller: ActorRef<VmControllerActor>,
    tracker: TaskTracker,
    events: EventPublisher,
    settings: OrchestratorSettings,
    monitor: Arc<StdMutex<Option<VmMonitor>>>,
}

impl VmOrchestrator {
    /// Spawn the controller actor
    #[must_use]
    pub fn spawn(
        vm_factory: Arc<dyn VmBackendFactory>,
        settings: OrchestratorSettings,
        tracker: TaskTracker,
        events: EventPublisher,
    ) -> Self {
        let controller = VmControllerActor::spawn(VmControllerActorArgs {
            vm_factory,
            tracker: tracker.clone(),
            events: events.clone(),
            settings,
        });
        Self {
            controller,
            tracker,
            events,
            settings,
            monitor: Arc::new(StdMutex::new(None)),
        }
    }

    /// Register a VM; its status starts as `unknown` until the first refresh
    ///
    /// # Errors
    /// `VmAlreadyExists` for a duplicate id, or the backend factory's error.
    pub async fn add_vm(&self, config: VmConfig) -> Result<(), CoreError> {
        self.controller
            .ask(RegisterVm { config })
            .await
            .map_err(from_send_error)
    }

    /// Remove a VM, cancelling its workflows and failing its tasks
    ///
    /// # Errors
    /// `VmNotFound` if the id is not registered.
    pub async fn remove_vm(&self, vm_id: &str) -> Result<(), CoreError> {
        self.controller
            .ask(UnregisterVm {
                vm_id: vm_id.to_string(),
            })
            .await
            .map_err(from_send_error)
    }

    /// # Errors
    /// `VmNotFound` if the id is not registered.
    pub async fn rename_vm(&self, vm_id: &str, name: &str) -> Result<(), CoreError> {
        self.controller
            .ask(RenameVm {
                vm_id: vm_id.to_string(),
                name: name.to_string(),
            })
            .await
            .map_err(from_send_error)
    }

    /// Cached status, `None` for an unknown VM
    ///
    /// # Errors
    /// Returns an error if the controller actor is gone.
    pub async fn get_status(&self, vm_id: &str) -> Result<Option<VmStatus>, CoreError> {
        match self
            .controller
            .ask(GetVmStatus {
                vm_id: vm_id.to_string(),
            })
            .await
            .map_err(from_send_error)
        {
            Ok(status) => Ok(Some(status)),
            Err(CoreError::VmNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Cached statuses of every VM, sorted by id
    ///
    /// # Errors
    /// Returns an error if the controller actor is gone.
    pub async fn get_all_statuses(&self) -> Result<Vec<VmStatus>, CoreError> {
        self.controller
            .ask(ListVmStatuses)
            .await
            .map_err(from_send_error)
    }

    /// # Errors
    /// `VmNotFound` before any task is created if the id is not registered.
    pub async fn start(&self, vm_id: &str) -> Result<TaskId, CoreError> {
        self.begin(vm_id, VmAction::Start).await
    }

    /// # Errors
    /// `VmNotFound` before any task is created if the id is not registered.
    pub async fn stop(&self, vm_id: &str) -> Result<TaskId, CoreError> {
        self.begin(vm_id, VmAction::Stop).await
    }

    async fn begin(&self, vm_id: &str, action: VmAction) -> Result<TaskId, CoreError> {
        self.controller
            .ask(BeginVmAction {
                vm_id: vm_id.to_string(),
                action,
            })
            .await
            .map_err(from_send_error)
    }

    /// Query the hypervisor for one VM now
    ///
    /// # Errors
    /// `VmNotFound` if the id is not registered.
    pub async fn refresh(&self, vm_id: &str) -> Result<VmStatus, CoreError> {
        refresh_vm(&self.controller, vm_id)
            .await?
            .ok_or_else(|| CoreError::VmNotFound(vm_id.to_string()))
    }

    /// Query the hypervisor for every VM concurrently
    ///
    /// # Errors
    /// Returns an error if the controller actor is gone.
    pub async fn refresh_all(&self) -> Result<usize, CoreError> {
        refresh_all(&self.controller).await
    }

    /// Start the background refresh loop; returns `false` if it already runs
    pub fn start_monitoring(&self) -> bool {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.as_ref().is_some_and(VmMonitor::is_running) {
            return false;
        }
        *monitor = Some(VmMonitor::spawn(
            self.controller.clone(),
            self.settings.monitor_interval,
            self.settings.monitor_backoff,
        ));
        true
    }

    /// Stop the background refresh loop and wait for it to exit
    pub async fn stop_monitoring(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
    }

    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(VmMonitor::is_running)
    }

    #[must_use]
    pub fn get_task(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.tracker.get(task_id)
    }

    /// Non-terminal tasks, optionally for one VM
    #[must_use]
    pub fn list_active_tasks(&self, vm_id: Option<&str>) -> Vec<TaskRecord> {
        self.tracker.list_active(vm_id)
    }

    /// Wait until the task is terminal
    ///
    /// # Errors
    /// `TaskNotFound` if the id is unknown or purged while waiting.
    pub async fn wait_for_task(&self, task_id: TaskId) -> Result<TaskRecord, CoreError> {
        self.tracker
            .wait(task_id)
            .await
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))
    }

    pub fn purge_tasks(&self, age: Duration) -> usize {
        self.tracker.purge_older_than(age)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.events.subscribe()
    }

    /// Stop the monitor and the controller actor
    pub async fn shutdown(&self) {
        self.stop_monitoring().await;
        self.controller.stop_gracefully().await.ok();
    }
}
