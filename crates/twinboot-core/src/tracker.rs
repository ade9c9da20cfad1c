//! Task ledger shared by host and VM workflows
//!
//! Records are keyed by an opaque [`TaskId`]. Status only moves forward:
//! once a task is `Completed` or `Failed`, later updates are ignored.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use twinboot_api::responses::TaskView;

use crate::state::{TaskKind, TaskStatus};

/// Opaque task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One tracked operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub entity_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn to_view(&self) -> TaskView {
        TaskView {
            task_id: self.id.to_string(),
            entity_id: self.entity_id.clone(),
            kind: self.kind.to_string(),
            status: self.status.to_string(),
            message: self.message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        }
    }
}

struct TaskEntry {
    record: TaskRecord,
    status_tx: watch::Sender<TaskStatus>,
}

/// Cloneable handle to the in-memory task ledger
#[derive(Clone, Default)]
pub struct TaskTracker {
    inner: Arc<Mutex<HashMap<TaskId, TaskEntry>>>,
}

impl fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTracker")
            .field("tasks", &self.lock().len())
            .finish()
    }
}

impl TaskTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a task and return its fresh id
    pub fn create(
        &self,
        entity_id: &str,
        kind: TaskKind,
        status: TaskStatus,
        message: impl Into<String>,
    ) -> TaskId {
        let id = TaskId::new();
        let now = Utc::now();
        let record = TaskRecord {
            id,
            entity_id: entity_id.to_string(),
            kind,
            status,
            message: message.into(),
            created_at: now,
            updated_at: now,
            completed_at: status.is_terminal().then_some(now),
        };
        let (status_tx, _) = watch::channel(status);

        debug!(task = %id, entity = %entity_id, %kind, %status, "task created");
        self.lock().insert(id, TaskEntry { record, status_tx });
        id
    }

    /// Move a task to `status` with a new message
    ///
    /// Returns `false` when the task is unknown or already terminal.
    pub fn update(&self, id: TaskId, status: TaskStatus, message: impl Into<String>) -> bool {
        let mut tasks = self.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return false;
        };
        if entry.record.is_terminal() {
            debug!(task = %id, current = %entry.record.status, requested = %status, "ignoring update of finished task");
            return false;
        }

        let now = Utc::now();
        entry.record.status = status;
        entry.record.message = message.into();
        entry.record.updated_at = now;
        if status.is_terminal() {
            entry.record.completed_at = Some(now);
        }
        entry.status_tx.send_replace(status);

        debug!(task = %id, %status, message = %entry.record.message, "task updated");
        true
    }

    /// Replace the message of a running task without changing its status
    pub fn progress(&self, id: TaskId, message: impl Into<String>) -> bool {
        let mut tasks = self.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return false;
        };
        if entry.record.is_terminal() {
            return false;
        }
        entry.record.message = message.into();
        entry.record.updated_at = Utc::now();
        true
    }

    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.lock().get(&id).map(|entry| entry.record.clone())
    }

    /// Non-terminal tasks, oldest first, optionally limited to one entity
    #[must_use]
    pub fn list_active(&self, entity_id: Option<&str>) -> Vec<TaskRecord> {
        let mut active: Vec<TaskRecord> = self
            .lock()
            .values()
            .map(|entry| &entry.record)
            .filter(|record| !record.is_terminal())
            .filter(|record| entity_id.is_none_or(|id| record.entity_id == id))
            .cloned()
            .collect();
        active.sort_by_key(|record| record.created_at);
        active
    }

    /// Drop tasks created more than `age` ago, whatever their status
    pub fn purge_older_than(&self, age: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, entry| entry.record.created_at > cutoff);
        before - tasks.len()
    }

    /// Fail every non-terminal task of an entity, returning the ids touched
    pub fn fail_active_for(&self, entity_id: &str, message: &str) -> Vec<TaskId> {
        let ids: Vec<TaskId> = self
            .list_active(Some(entity_id))
            .into_iter()
            .map(|record| record.id)
            .collect();
        ids.into_iter()
            .filter(|id| self.update(*id, TaskStatus::Failed, message))
            .collect()
    }

    /// Resolve once the task is terminal
    ///
    /// Returns `None` if the id is unknown or the task is purged while waiting.
    pub async fn wait(&self, id: TaskId) -> Option<TaskRecord> {
        let mut status_rx = self.lock().get(&id)?.status_tx.subscribe();
        loop {
            let done = status_rx.borrow_and_update().is_terminal();
            if done || status_rx.changed().await.is_err() {
                return self.get(id);
            }
        }
    }

    /// Periodically purge tasks older than `max_age` until `cancel` fires
    #[must_use]
    pub fn spawn_janitor(
        &self,
        interval: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = tracker.purge_older_than(max_age);
                        if purged > 0 {
                            info!(purged, "purged old tasks");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get() {
        let tracker = TaskTracker::new();
        let id = tracker.create("pc-1", TaskKind::BootUbuntu, TaskStatus::Running, "started");

        let record = tracker.get(id).unwrap();
        assert_eq!(record.entity_id, "pc-1");
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.message, "started");
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn test_unknown_id_is_none() {
        let tracker = TaskTracker::new();
        assert!(tracker.get(TaskId::new()).is_none());
        assert!(!tracker.update(TaskId::new(), TaskStatus::Completed, "done"));
    }

    #[test]
    fn test_terminal_status_is_final() {
        let tracker = TaskTracker::new();
        let id = tracker.create("pc-1", TaskKind::BootUbuntu, TaskStatus::Running, "started");

        assert!(tracker.update(id, TaskStatus::Failed, "host removed"));
        assert!(!tracker.update(id, TaskStatus::Completed, "late success"));
        assert!(!tracker.progress(id, "late progress"));

        let record = tracker.get(id).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.message, "host removed");
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_list_active_filters_and_orders() {
        let tracker = TaskTracker::new();
        let first = tracker.create("pc-1", TaskKind::BootUbuntu, TaskStatus::Running, "a");
        let second = tracker.create("pc-1", TaskKind::ShutdownUbuntu, TaskStatus::Running, "b");
        let other = tracker.create("vm-1", TaskKind::StartVm, TaskStatus::Pending, "c");
        let done = tracker.create("pc-1", TaskKind::BootWindows, TaskStatus::Running, "d");
        tracker.update(done, TaskStatus::Completed, "ok");

        let ids: Vec<TaskId> = tracker.list_active(Some("pc-1")).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(tracker.list_active(None).len(), 3);
        assert!(tracker.list_active(None).iter().any(|r| r.id == other));
    }

    #[test]
    fn test_purge_removes_regardless_of_status() {
        let tracker = TaskTracker::new();
        let running = tracker.create("pc-1", TaskKind::BootUbuntu, TaskStatus::Running, "a");
        let done = tracker.create("pc-1", TaskKind::BootUbuntu, TaskStatus::Running, "b");
        tracker.update(done, TaskStatus::Completed, "ok");

        assert_eq!(tracker.purge_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(tracker.purge_older_than(Duration::ZERO), 2);
        assert!(tracker.get(running).is_none());
        assert!(tracker.get(done).is_none());
    }

    #[test]
    fn test_fail_active_for_entity() {
        let tracker = TaskTracker::new();
        let a = tracker.create("pc-1", TaskKind::BootUbuntu, TaskStatus::Running, "a");
        let b = tracker.create("pc-2", TaskKind::BootUbuntu, TaskStatus::Running, "b");

        assert_eq!(tracker.fail_active_for("pc-1", "host removed"), vec![a]);
        assert_eq!(tracker.get(a).unwrap().status, TaskStatus::Failed);
        assert_eq!(tracker.get(b).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_wait_resolves_on_terminal() {
        let tracker = TaskTracker::new();
        let id = tracker.create("vm-1", TaskKind::StartVm, TaskStatus::Pending, "queued");

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(id).await })
        };
        tracker.update(id, TaskStatus::Running, "starting");
        tracker.update(id, TaskStatus::Completed, "started");

        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(tracker.wait(TaskId::new()).await.is_none());
    }

    #[test]
    fn test_task_id_parse_roundtrip() {
        let id = TaskId::new();
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert!("not-a-task".parse::<TaskId>().is_err());
    }
}
