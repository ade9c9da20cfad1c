//! Host orchestration facade
//!
//! Cloneable handle over the `OrchestratorActor`. The registry only resolves
//! host ids; sampling and transitions then go to the host actor from the
//! caller's task, so a slow host never holds up requests for another.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use kameo::actor::{ActorRef, Spawn};
use kameo::error::SendError;
use tokio::sync::broadcast;

use twinboot_api::events::WsEvent;

use crate::actor::host::{HostActor, sample_host};
use crate::actor::orchestrator::{OrchestratorActor, OrchestratorActorArgs};
use crate::aggregate::fan_out;
use crate::config::{HostConfig, OrchestratorSettings};
use crate::error::{CoreError, from_send_error};
use crate::message::{
    BeginTransition, GetHostRef, HostStatusReport, ListHostRefs, RegisterHost, UnregisterHost,
    UpdateHost,
};
use crate::notify::EventPublisher;
use crate::state::HostAction;
use crate::tracker::{TaskId, TaskRecord, TaskTracker};
use crate::traits::HostBackendFactory;

/// Cloneable handle to the host registry
#[derive(Clone)]
pub struct HostOrchestrator {
    orchestrator: ActorRef<OrchestratorActor>,
    tracker: TaskTracker,
    events: EventPublisher,
}

impl HostOrchestrator {
    /// Spawn the registry actor
    #[must_use]
    pub fn spawn(
        host_factory: Arc<dyn HostBackendFactory>,
        settings: OrchestratorSettings,
        tracker: TaskTracker,
        events: EventPublisher,
    ) -> Self {
        let orchestrator = OrchestratorActor::spawn(OrchestratorActorArgs {
            host_factory,
            tracker: tracker.clone(),
            events: events.clone(),
            settings,
        });
        Self {
            orchestrator,
            tracker,
            events,
        }
    }

    /// # Errors
    /// `HostAlreadyExists` for a duplicate id, or the backend factory's error.
    pub async fn register_host(&self, config: HostConfig) -> Result<(), CoreError> {
        self.orchestrator
            .ask(RegisterHost { config })
            .await
            .map_err(from_send_error)
    }

    /// Replace a host's configuration, failing its outstanding tasks
    ///
    /// # Errors
    /// `HostNotFound` if the id is not registered.
    pub async fn update_host(&self, config: HostConfig) -> Result<(), CoreError> {
        self.orchestrator
            .ask(UpdateHost { config })
            .await
            .map_err(from_send_error)
    }

    /// Remove a host, cancelling its workflows and failing its tasks
    ///
    /// # Errors
    /// `HostNotFound` if the id is not registered.
    pub async fn remove_host(&self, host_id: &str) -> Result<(), CoreError> {
        self.orchestrator
            .ask(UnregisterHost {
                host_id: host_id.to_string(),
            })
            .await
            .map_err(from_send_error)
    }

    /// Registered host ids, sorted
    ///
    /// # Errors
    /// Returns an error if the registry actor is gone.
    pub async fn host_ids(&self) -> Result<Vec<String>, CoreError> {
        let handles = self
            .orchestrator
            .ask(ListHostRefs)
            .await
            .map_err(from_send_error)?;
        Ok(handles.into_iter().map(|h| h.host_id).collect())
    }

    /// Probe one host now
    ///
    /// A failure of the host actor itself yields an error record rather
    /// than an `Err`.
    ///
    /// # Errors
    /// `HostNotFound` if the id is not registered.
    pub async fn get_status(&self, host_id: &str) -> Result<HostStatusReport, CoreError> {
        let host = self.host_ref(host_id).await?;

        match sample_host(&host).await {
            Ok(report) => Ok(report),
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => Ok(HostStatusReport::failed(host_id, e.to_string())),
        }
    }

    /// Probe every host concurrently; every registered host gets an entry
    ///
    /// # Errors
    /// Returns an error if the registry actor is gone.
    pub async fn get_all_status(&self) -> Result<BTreeMap<String, HostStatusReport>, CoreError> {
        let hosts: HashMap<String, ActorRef<HostActor>> = self
            .orchestrator
            .ask(ListHostRefs)
            .await
            .map_err(from_send_error)?
            .into_iter()
            .map(|handle| (handle.host_id, handle.actor))
            .collect();

        Ok(fan_out(
            hosts.keys().cloned(),
            |host_id| {
                let host = hosts.get(&host_id).cloned();
                async move {
                    let host = host.ok_or(CoreError::HostNotFound(host_id))?;
                    sample_host(&host).await
                }
            },
            |host_id, error| HostStatusReport::failed(host_id, error),
        )
        .await)
    }

    /// # Errors
    /// `HostNotFound` before any task is created if the id is not registered.
    pub async fn boot_to_ubuntu(&self, host_id: &str) -> Result<TaskId, CoreError> {
        self.request(host_id, HostAction::BootUbuntu).await
    }

    /// # Errors
    /// `HostNotFound` before any task is created if the id is not registered.
    pub async fn boot_to_windows(&self, host_id: &str) -> Result<TaskId, CoreError> {
        self.request(host_id, HostAction::BootWindows).await
    }

    /// # Errors
    /// `HostNotFound` before any task is created if the id is not registered.
    pub async fn shutdown_ubuntu(&self, host_id: &str) -> Result<TaskId, CoreError> {
        self.request(host_id, HostAction::ShutdownUbuntu).await
    }

    /// # Errors
    /// `HostNotFound` before any task is created if the id is not registered.
    pub async fn shutdown_windows(&self, host_id: &str) -> Result<TaskId, CoreError> {
        self.request(host_id, HostAction::ShutdownWindows).await
    }

    /// # Errors
    /// `HostNotFound` before any task is created if the id is not registered.
    pub async fn reboot_to_ubuntu(&self, host_id: &str) -> Result<TaskId, CoreError> {
        self.request(host_id, HostAction::RebootToUbuntu).await
    }

    async fn request(&self, host_id: &str, action: HostAction) -> Result<TaskId, CoreError> {
        let host = self.host_ref(host_id).await?;
        host.ask(BeginTransition { action })
            .await
            .map_err(|e| match e {
                // Removed between the lookup and the request
                SendError::ActorNotRunning(_) | SendError::ActorStopped => {
                    CoreError::HostNotFound(host_id.to_string())
                }
                other => from_send_error(other),
            })
    }

    async fn host_ref(&self, host_id: &str) -> Result<ActorRef<HostActor>, CoreError> {
        self.orchestrator
            .ask(GetHostRef {
                host_id: host_id.to_string(),
            })
            .await
            .map_err(from_send_error)
    }

    #[must_use]
    pub fn get_task(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.tracker.get(task_id)
    }

    /// Non-terminal tasks, optionally for one host
    #[must_use]
    pub fn list_active_tasks(&self, host_id: Option<&str>) -> Vec<TaskRecord> {
        self.tracker.list_active(host_id)
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

    /// Stop the registry; every host actor is retired first
    pub async fn shutdown(&self) {
        self.orchestrator.stop_gracefully().await.ok();
    }
}
