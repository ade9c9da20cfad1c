//! `OrchestratorActor`: Host registry
//!
//! Manages the registry of `HostActors` and hands out their refs. Sampling
//! and transitions are sent to the host actors by the caller, so no handler
//! here ever waits on a probe or a workflow.

use std::collections::HashMap;
use std::sync::Arc;

use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tracing::{info, warn};

use crate::actor::host::{HostActor, HostActorArgs};
use crate::config::{HostConfig, OrchestratorSettings};
use crate::error::CoreError;
use crate::message::{
    GetHostRef, HostHandle, ListHostRefs, RegisterHost, Retire, UnregisterHost, UpdateHost,
};
use crate::notify::EventPublisher;
use crate::tracker::TaskTracker;
use crate::traits::HostBackendFactory;

/// Arguments for spawning an `OrchestratorActor`
pub struct OrchestratorActorArgs {
    /// Factory for creating host backends
    pub host_factory: Arc<dyn HostBackendFactory>,
    /// Shared task ledger
    pub tracker: TaskTracker,
    /// Event publisher
    pub events: EventPublisher,
    /// Timing and retry policy handed to every host
    pub settings: OrchestratorSettings,
}

/// Registry of host actors keyed by host id
pub struct OrchestratorActor {
    hosts: HashMap<String, ActorRef<HostActor>>,
    tracker: TaskTracker,
    events: EventPublisher,
    settings: OrchestratorSettings,
    host_factory: Arc<dyn HostBackendFactory>,
}

impl OrchestratorActor {
    /// Spawn a `HostActor` for the given config
    async fn spawn_host_actor(&self, config: HostConfig) -> Result<ActorRef<HostActor>, CoreError> {
        let backend = self.host_factory.create(&config).await?;
        let host_id = config.id.clone();

        let args = HostActorArgs {
            config,
            backend,
            tracker: self.tracker.clone(),
            events: self.events.clone(),
            settings: self.settings,
        };

        let actor_ref = HostActor::spawn(args);

        info!(host = %host_id, "spawned HostActor");

        Ok(actor_ref)
    }

    async fn stop_host_actor(host_id: &str, actor_ref: &ActorRef<HostActor>, reason: &str) {
        if let Err(e) = actor_ref
            .ask(Retire {
                reason: reason.to_string(),
            })
            .await
        {
            warn!(host = %host_id, error = %e, "failed to retire HostActor");
        }
        actor_ref.stop_gracefully().await.ok();
    }
}

impl Actor for OrchestratorActor {
    type Args = OrchestratorActorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(id = %actor_ref.id(), "OrchestratorActor starting");

        Ok(Self {
            hosts: HashMap::new(),
            tracker: args.tracker,
            events: args.events,
            settings: args.settings,
            host_factory: args.host_factory,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, "OrchestratorActor stopping");

        // Stop all host actors
        for (host_id, actor_ref) in self.hosts.drain() {
            info!(host = %host_id, "stopping HostActor");
            Self::stop_host_actor(&host_id, &actor_ref, "orchestrator stopped").await;
        }

        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<RegisterHost> for OrchestratorActor {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: RegisterHost,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let host_id = msg.config.id.clone();

        if self.hosts.contains_key(&host_id) {
            return Err(CoreError::HostAlreadyExists(host_id));
        }

        let actor_ref = self.spawn_host_actor(msg.config).await?;
        self.hosts.insert(host_id, actor_ref);

        Ok(())
    }
}

impl Message<UnregisterHost> for OrchestratorActor {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: UnregisterHost,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let host_id = &msg.host_id;

        if let Some(actor_ref) = self.hosts.remove(host_id) {
            Self::stop_host_actor(host_id, &actor_ref, "host removed").await;
            info!(host = %host_id, "unregistered host");
            Ok(())
        } else {
            Err(CoreError::HostNotFound(host_id.clone()))
        }
    }
}

impl Message<UpdateHost> for OrchestratorActor {
    type Reply = Result<(), CoreError>;

    async fn handle(
        &mut self,
        msg: UpdateHost,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let host_id = msg.config.id.clone();

        let Some(old_ref) = self.hosts.remove(&host_id) else {
            return Err(CoreError::HostNotFound(host_id));
        };
        Self::stop_host_actor(&host_id, &old_ref, "host configuration updated").await;

        let actor_ref = self.spawn_host_actor(msg.config).await?;
        self.hosts.insert(host_id.clone(), actor_ref);
        info!(host = %host_id, "updated host configuration");

        Ok(())
    }
}

impl Message<GetHostRef> for OrchestratorActor {
    type Reply = Result<ActorRef<HostActor>, CoreError>;

    async fn handle(
        &mut self,
        msg: GetHostRef,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.hosts
            .get(&msg.host_id)
            .cloned()
            .ok_or(CoreError::HostNotFound(msg.host_id))
    }
}

impl Message<ListHostRefs> for OrchestratorActor {
    type Reply = Result<Vec<HostHandle>, CoreError>;

    async fn handle(
        &mut self,
        _msg: ListHostRefs,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let mut handles: Vec<HostHandle> = self
            .hosts
            .iter()
            .map(|(host_id, actor)| HostHandle {
                host_id: host_id.clone(),
                actor: actor.clone(),
            })
            .collect();
        handles.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        Ok(handles)
    }
}
