//! `VmControllerActor`: VM registry and status cache
//!
//! All status writes go through this actor, so monitor refreshes and
//! task-triggered refreshes never interleave on one record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{OrchestratorSettings, VmConfig};
use crate::error::CoreError;
use crate::message::{
    ApplyRefresh, BeginVmAction, GetRefreshTarget, GetVmStatus, ListRefreshTargets,
    ListVmStatuses, MarkVmStatus, RefreshOutcome, RefreshTarget, RegisterVm, RenameVm,
    UnregisterVm, VmStatus,
};
use crate::notify::EventPublisher;
use crate::state::{TaskKind, TaskStatus, VmAction, VmPowerState};
use crate::tracker::{TaskId, TaskTracker};
use crate::traits::{VmBackend, VmBackendFactory};
use crate::vm::VmWorkflow;

/// Arguments for spawning a `VmControllerActor`
pub struct VmControllerActorArgs {
    /// Factory for creating VM backends
    pub vm_factory: Arc<dyn VmBackendFactory>,
    /// Shared task ledger
    pub tracker: TaskTracker,
    /// Event publisher
    pub events: EventPublisher,
    /// Timing policy
    pub settings: OrchestratorSettings,
}

struct VmEntry {
    config: Arc<VmConfig>,
    backend: VmBackend,
    status: VmStatus,
    lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl VmEntry {
    fn refresh_target(&self) -> RefreshTarget {
        RefreshTarget {
            vm_id: self.config.id.clone(),
            config: self.config.clone(),
            backend: self.backend.clone(),
            needs_precheck: self.status.last_updated.is_none(),
        }
    }
}

/// Registry of VMs with their cached status and backends
pub struct VmControllerActor {
    vms: HashMap<String, VmEntry>,
    vm_factory: Arc<dyn VmBackendFactory>,
    tracker: TaskTracker,
    events: EventPublisher,
    settings: OrchestratorSettings,
    workflows: HashMap<TaskId, JoinHandle<()>>,
    self_ref: WeakActorRef<Self>,
}

impl VmControllerActor {
    fn entry(&self, vm_id: &str) -> Result<&VmEntry, CoreError> {
        self.vms
            .get(vm_id)
            .ok_or_else(|| CoreError::VmNotFound(vm_id.to_string()))
    }

    /// Overwrite the cached status, notifying only when the power state changed
    fn set_status(&mut self, vm_id: &str, update: impl FnOnce(&mut VmStatus)) -> Option<VmStatus> {
        let entry = self.vms.get_mut(vm_id)?;
        let previous = entry.status.status.clone();
        update(&mut entry.status);

        if entry.status.status != previous {
            debug!(vm = %vm_id, from = %previous, to = %entry.status.status, "vm status changed");
            self.events.vm_status_changed(vm_id, &entry.status.status);
        }
        Some(entry.status.clone())
    }

    fn remove_entry(&mut self, vm_id: &str, reason: &str) -> bool {
        let Some(entry) = self.vms.remove(vm_id) else {
            return false;
        };

        for task_id in self.tracker.fail_active_for(vm_id, reason) {
            if let Some(record) = self.tracker.get(task_id) {
                self.events.task_completed(&record);
            }
        }
        entry.cancel.cancel();
        self.events.vm_removed(vm_id);
        true
    }
}

impl Actor for VmControllerActor {
    type Args = VmControllerActorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(id = %actor_ref.id(), "VmControllerActor starting");

        Ok(Self {
            vms: HashMap::new(),
            vm_factory: args.vm_factory,
            tracker: args.tracker,
            events: args.events,
            settings: args.settings,
            workflows: HashMap::new(),
            self_ref: actor_ref.downgrade(),
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, "VmControllerActor stopping");

        let vm_ids: Vec<String> = self.vms.keys().cloned().collect();
        for vm_id in vm_ids {
            self.remove_entry(&vm_id, "vm controller stopped");
        }
        for (_, handle) in self.workflows.drain() {
            handle.abort();
        }

        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<RegisterVm> for VmControllerActor {
    type Reply = Result<(), CoreError>;

    async fn handle(&mut self, msg: RegisterVm, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let vm_id = msg.config.id.clone();
        if self.vms.contains_key(&vm_id) {
            return Err(CoreError::VmAlreadyExists(vm_id));
        }

        let backend = self.vm_factory.create(&msg.config).await?;
        let status = VmStatus::new(&vm_id, &msg.config.name);
        self.vms.insert(
            vm_id.clone(),
            VmEntry {
                config: Arc::new(msg.config),
                backend,
                status,
                lock: Arc::new(Mutex::new(())),
                cancel: CancellationToken::new(),
            },
        );

        info!(vm = %vm_id, "registered vm");
        self.events.vm_registered(&vm_id);
        Ok(())
    }
}

impl Message<UnregisterVm> for VmControllerActor {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: UnregisterVm,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.remove_entry(&msg.vm_id, "vm removed") {
            info!(vm = %msg.vm_id, "unregistered vm");
            Ok(())
        } else {
            Err(CoreError::VmNotFound(msg.vm_id))
        }
    }
}

impl Message<RenameVm> for VmControllerActor {
    type Reply = Result<(), CoreError>;

    async fn handle(&mut self, msg: RenameVm, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let entry = self
            .vms
            .get_mut(&msg.vm_id)
            .ok_or_else(|| CoreError::VmNotFound(msg.vm_id.clone()))?;

        let mut config = (*entry.config).clone();
        config.name.clone_from(&msg.name);
        entry.config = Arc::new(config);
        entry.status.name = msg.name;
        Ok(())
    }
}

impl Message<GetVmStatus> for VmControllerActor {
    type Reply = Result<VmStatus, CoreError>;

    async fn handle(
        &mut self,
        msg: GetVmStatus,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.entry(&msg.vm_id)?.status.clone())
    }
}

impl Message<ListVmStatuses> for VmControllerActor {
    type Reply = Result<Vec<VmStatus>, CoreError>;

    async fn handle(
        &mut self,
        _msg: ListVmStatuses,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let mut statuses: Vec<VmStatus> = self.vms.values().map(|e| e.status.clone()).collect();
        statuses.sort_by(|a, b| a.vm_id.cmp(&b.vm_id));
        Ok(statuses)
    }
}

impl Message<BeginVmAction> for VmControllerActor {
    type Reply = Result<TaskId, CoreError>;

    async fn handle(
        &mut self,
        msg: BeginVmAction,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let controller = self
            .self_ref
            .upgrade()
            .ok_or_else(|| CoreError::ActorError("vm controller is stopping".to_string()))?;
        let entry = self.entry(&msg.vm_id)?;

        let kind = TaskKind::from(msg.action);
        let queued = match msg.action {
            VmAction::Start => "VM start queued",
            VmAction::Stop => "VM stop queued",
        };
        let task_id = self
            .tracker
            .create(&msg.vm_id, kind, TaskStatus::Pending, queued);
        if let Some(record) = self.tracker.get(task_id) {
            self.events.task_started(&record);
        }
        info!(vm = %msg.vm_id, task = %task_id, %kind, "vm action requested");

        let workflow = VmWorkflow {
            task_id,
            action: msg.action,
            config: entry.config.clone(),
            backend: entry.backend.clone(),
            controller,
            tracker: self.tracker.clone(),
            events: self.events.clone(),
            settle_delay: self.settings.settle_delay,
            lock: entry.lock.clone(),
            cancel: entry.cancel.child_token(),
        };

        self.workflows.retain(|_, handle| !handle.is_finished());
        self.workflows.insert(task_id, tokio::spawn(workflow.run()));

        Ok(task_id)
    }
}

impl Message<MarkVmStatus> for VmControllerActor {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: MarkVmStatus,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.set_status(&msg.vm_id, |status| status.status = msg.status)
            .map(|_| ())
            .ok_or(CoreError::VmNotFound(msg.vm_id))
    }
}

impl Message<GetRefreshTarget> for VmControllerActor {
    type Reply = Result<RefreshTarget, CoreError>;

    async fn handle(
        &mut self,
        msg: GetRefreshTarget,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.entry(&msg.vm_id)?.refresh_target())
    }
}

impl Message<ListRefreshTargets> for VmControllerActor {
    type Reply = Result<Vec<RefreshTarget>, CoreError>;

    async fn handle(
        &mut self,
        _msg: ListRefreshTargets,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.vms.values().map(VmEntry::refresh_target).collect())
    }
}

impl Message<ApplyRefresh> for VmControllerActor {
    /// `None` when the VM was removed while it was being queried
    type Reply = Result<Option<VmStatus>, CoreError>;

    async fn handle(
        &mut self,
        msg: ApplyRefresh,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let applied = self.set_status(&msg.vm_id, |status| match msg.outcome {
            RefreshOutcome::Status(power) => {
                status.status = power;
                status.last_updated = Some(Utc::now());
                status.error_message = None;
            }
            RefreshOutcome::QueryFailed(error) => {
                status.status = VmPowerState::Unknown;
                status.error_message = Some(error);
            }
            RefreshOutcome::ConnectionFailed(error) => {
                status.status = VmPowerState::ConnectionError;
                status.error_message = Some(error);
            }
        });
        if applied.is_none() {
            debug!(vm = %msg.vm_id, "dropping refresh result for removed vm");
        }
        Ok(applied)
    }
}
