//! `HostActor`: Per-host orchestration
//!
//! Owns the cached state of one dual-boot host and is its only writer.
//! Probes never run inside a handler: callers take a `HostSampler`, probe
//! in their own task and hand the result back with `ApplySample`.
//! Transition workflows run as spawned tasks holding a child of the actor's
//! cancellation token; the actor keeps their handles until it stops.

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
use tracing::{debug, info, warn};

use crate::config::{HostConfig, OrchestratorSettings};
use crate::error::{CoreError, from_send_error};
use crate::message::{
    ApplySample, BeginTransition, HostSampler, HostStatusReport, PrepareSample, Retire,
};
use crate::notify::EventPublisher;
use crate::state::{HostState, TaskKind, TaskStatus};
use crate::tracker::{TaskId, TaskTracker};
use crate::traits::{HostBackend, ProbeResult};
use crate::workflow::HostWorkflow;

/// Arguments for spawning a `HostActor`
pub struct HostActorArgs {
    /// Host configuration
    pub config: HostConfig,
    /// Probe and actuator handles created for this host
    pub backend: HostBackend,
    /// Shared task ledger
    pub tracker: TaskTracker,
    /// Event publisher
    pub events: EventPublisher,
    /// Timing and retry policy
    pub settings: OrchestratorSettings,
}

/// Per-host actor owning cached state and in-flight workflows
pub struct HostActor {
    config: Arc<HostConfig>,
    backend: HostBackend,
    /// Last sampled state, `None` until the first sample
    state: Option<HostState>,
    tracker: TaskTracker,
    events: EventPublisher,
    settings: OrchestratorSettings,
    /// Held by the workflow that is currently actuating this host
    workflow_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    workflows: HashMap<TaskId, JoinHandle<()>>,
    /// Sequence of the last sampler handed out
    issued_seq: u64,
    /// Sequence of the newest sample recorded in `state`
    applied_seq: u64,
    self_ref: WeakActorRef<Self>,
    retired: bool,
}

impl HostSampler {
    /// Run both probes concurrently
    ///
    /// Probe errors count as unreachable; a probe that panics fails the
    /// whole sample.
    pub(crate) async fn run(&self) -> Result<(bool, bool), String> {
        let ubuntu = {
            let probe = self.probe.clone();
            let config = self.config.clone();
            tokio::spawn(async move { probe.check_ubuntu(&config).await })
        };
        let windows = {
            let probe = self.probe.clone();
            let config = self.config.clone();
            tokio::spawn(async move { probe.check_windows(&config).await })
        };

        let (ubuntu, windows) = tokio::join!(ubuntu, windows);
        let ubuntu = ubuntu.map_err(|e| format!("Ubuntu probe failed: {e}"))?;
        let windows = windows.map_err(|e| format!("Windows probe failed: {e}"))?;

        Ok((
            self.reachable("ubuntu", ubuntu),
            self.reachable("windows", windows),
        ))
    }

    fn reachable(&self, os: &str, result: Result<ProbeResult, CoreError>) -> bool {
        match result {
            Ok(probe) => {
                debug!(host = %self.config.id, os, reachable = probe.reachable, message = %probe.message, "probe result");
                probe.reachable
            }
            Err(e) => {
                debug!(host = %self.config.id, os, error = %e, "probe error, treating as unreachable");
                false
            }
        }
    }
}

/// Sample a host without holding its mailbox while the probes run
///
/// A sample that fails outright yields an error record; only a host actor
/// that is gone is an `Err`.
pub(crate) async fn sample_host(host: &ActorRef<HostActor>) -> Result<HostStatusReport, CoreError> {
    let sampler = host.ask(PrepareSample).await.map_err(from_send_error)?;

    match sampler.run().await {
        Ok((ubuntu_reachable, windows_reachable)) => host
            .ask(ApplySample {
                seq: sampler.seq,
                ubuntu_reachable,
                windows_reachable,
            })
            .await
            .map_err(from_send_error),
        Err(e) => {
            warn!(host = %sampler.config.id, error = %e, "status sampling failed");
            let mut report = HostStatusReport::failed(&sampler.config.id, e);
            report.name = sampler.config.name.clone();
            Ok(report)
        }
    }
}

impl HostActor {
    /// Store a freshly computed state and notify only when it changed
    fn record_state(&mut self, new_state: HostState) {
        if self.state == Some(new_state) {
            return;
        }
        let old_state = self.state.replace(new_state);

        info!(
            host = %self.config.id,
            from = %old_state.map_or("unknown", HostState::as_str),
            to = %new_state,
            "state transition"
        );
        self.events
            .host_state_changed(&self.config.id, old_state, new_state);
    }

    /// Fail outstanding tasks, then cancel their workflows
    fn retire(&mut self, reason: &str) {
        if self.retired {
            return;
        }
        self.retired = true;

        for task_id in self.tracker.fail_active_for(&self.config.id, reason) {
            if let Some(record) = self.tracker.get(task_id) {
                self.events.task_completed(&record);
            }
        }
        self.cancel.cancel();
        self.state = None;

        info!(host = %self.config.id, reason, "host retired");
        self.events.host_removed(&self.config.id, reason);
    }
}

impl Actor for HostActor {
    type Args = HostActorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(host = %args.config.id, id = %actor_ref.id(), "HostActor starting");

        args.events.host_registered(&args.config.id);

        Ok(Self {
            config: Arc::new(args.config),
            backend: args.backend,
            state: None,
            tracker: args.tracker,
            events: args.events,
            settings: args.settings,
            workflow_lock: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
            workflows: HashMap::new(),
            issued_seq: 0,
            applied_seq: 0,
            self_ref: actor_ref.downgrade(),
            retired: false,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(
            host = %self.config.id,
            reason = ?reason,
            "HostActor stopping"
        );

        self.retire("host actor stopped");
        for (_, handle) in self.workflows.drain() {
            handle.abort();
        }

        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<PrepareSample> for HostActor {
    type Reply = Result<HostSampler, CoreError>;

    async fn handle(
        &mut self,
        _msg: PrepareSample,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.retired {
            return Err(CoreError::HostNotFound(self.config.id.clone()));
        }
        self.issued_seq += 1;
        Ok(HostSampler {
            config: self.config.clone(),
            probe: self.backend.probe.clone(),
            seq: self.issued_seq,
        })
    }
}

impl Message<ApplySample> for HostActor {
    type Reply = Result<HostStatusReport, CoreError>;

    async fn handle(
        &mut self,
        msg: ApplySample,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.retired {
            return Err(CoreError::HostNotFound(self.config.id.clone()));
        }

        let state = HostState::from_probes(msg.ubuntu_reachable, msg.windows_reachable);
        // A sample that started before the last applied one is stale
        if msg.seq > self.applied_seq {
            self.applied_seq = msg.seq;
            self.record_state(state);
        }

        Ok(HostStatusReport {
            host_id: self.config.id.clone(),
            name: self.config.name.clone(),
            state,
            ubuntu_reachable: msg.ubuntu_reachable,
            windows_reachable: msg.windows_reachable,
            active_tasks: self.tracker.list_active(Some(&self.config.id)).len(),
            timestamp: Utc::now(),
            error: None,
        })
    }
}

impl Message<BeginTransition> for HostActor {
    type Reply = Result<TaskId, CoreError>;

    async fn handle(
        &mut self,
        msg: BeginTransition,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.retired {
            return Err(CoreError::HostNotFound(self.config.id.clone()));
        }
        let host_ref = self
            .self_ref
            .upgrade()
            .ok_or_else(|| CoreError::ActorError("host actor is stopping".to_string()))?;

        let kind = TaskKind::from(msg.action);
        let task_id = self.tracker.create(
            &self.config.id,
            kind,
            TaskStatus::Running,
            format!("{} started", msg.action.label()),
        );
        if let Some(record) = self.tracker.get(task_id) {
            self.events.task_started(&record);
        }
        info!(host = %self.config.id, task = %task_id, %kind, "transition requested");

        let workflow = HostWorkflow {
            task_id,
            action: msg.action,
            config: self.config.clone(),
            backend: self.backend.clone(),
            host: host_ref,
            tracker: self.tracker.clone(),
            events: self.events.clone(),
            settings: self.settings,
            lock: self.workflow_lock.clone(),
            cancel: self.cancel.child_token(),
        };

        self.workflows.retain(|_, handle| !handle.is_finished());
        self.workflows.insert(task_id, tokio::spawn(workflow.run()));

        Ok(task_id)
    }
}

impl Message<Retire> for HostActor {
    type Reply = Result<(), CoreError>;

    async fn handle(&mut self, msg: Retire, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.retire(&msg.reason);
        Ok(())
    }
}
