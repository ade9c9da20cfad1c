use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use twinboot_api::events::WsEvent;
use twinboot_core::*;

// Mock host whose probes and actuators share one simulated machine
struct SimState {
    ubuntu: bool,
    windows: bool,
    ubuntu_at: Option<Instant>,
    windows_at: Option<Instant>,
    boots: bool,
    boot_delay: Duration,
    windows_delay: Duration,
    wake_failures: u32,
    wake_calls: u32,
    ubuntu_probes: u32,
    probe_error: bool,
    probe_panics: bool,
    probe_delay: Duration,
    command_ok: bool,
    commands: Vec<RemoteCommand>,
}

impl SimState {
    fn ubuntu_up(&self) -> bool {
        self.ubuntu || self.ubuntu_at.is_some_and(|at| Instant::now() >= at)
    }

    fn windows_up(&self) -> bool {
        self.windows || self.windows_at.is_some_and(|at| Instant::now() >= at)
    }
}

struct HostSim {
    state: Mutex<SimState>,
}

impl HostSim {
    fn off() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState {
                ubuntu: false,
                windows: false,
                ubuntu_at: None,
                windows_at: None,
                boots: true,
                boot_delay: Duration::from_secs(12),
                windows_delay: Duration::from_secs(20),
                wake_failures: 0,
                wake_calls: 0,
                ubuntu_probes: 0,
                probe_error: false,
                probe_panics: false,
                probe_delay: Duration::ZERO,
                command_ok: true,
                commands: Vec::new(),
            }),
        })
    }

    fn in_ubuntu() -> Arc<Self> {
        let sim = Self::off();
        sim.lock().ubuntu = true;
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn answer_delay(&self) {
        let delay = self.lock().probe_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl HostProbe for HostSim {
    async fn check_ubuntu(&self, _host: &HostConfig) -> Result<ProbeResult, CoreError> {
        self.answer_delay().await;
        let (panics, error, up) = {
            let mut state = self.lock();
            state.ubuntu_probes += 1;
            (state.probe_panics, state.probe_error, state.ubuntu_up())
        };
        if panics {
            panic!("probe exploded");
        }
        if error {
            return Err(CoreError::Backend("connection refused".to_string()));
        }
        Ok(if up {
            ProbeResult::reachable("ssh ok")
        } else {
            ProbeResult::unreachable("ssh timeout")
        })
    }

    async fn check_windows(&self, _host: &HostConfig) -> Result<ProbeResult, CoreError> {
        self.answer_delay().await;
        let state = self.lock();
        if state.probe_error {
            return Err(CoreError::Backend("connection refused".to_string()));
        }
        Ok(if state.windows_up() {
            ProbeResult::reachable("rdp open")
        } else {
            ProbeResult::unreachable("rdp closed")
        })
    }
}

#[async_trait]
impl HostActuator for HostSim {
    async fn wake(&self, _host: &HostConfig) -> Result<ActionOutcome, CoreError> {
        let mut state = self.lock();
        state.wake_calls += 1;
        if state.wake_calls <= state.wake_failures {
            return Ok(ActionOutcome::failed(format!(
                "send failed #{}",
                state.wake_calls
            )));
        }
        if state.boots {
            state.ubuntu_at = Some(Instant::now() + state.boot_delay);
        }
        Ok(ActionOutcome::ok("magic packet sent"))
    }

    async fn run_remote_command(
        &self,
        _host: &HostConfig,
        command: &RemoteCommand,
    ) -> Result<CommandOutcome, CoreError> {
        let mut state = self.lock();
        state.commands.push(command.clone());
        if !state.command_ok {
            return Ok(CommandOutcome {
                ok: false,
                stdout: String::new(),
                stderr: "access denied".to_string(),
            });
        }
        if command.command.contains("grub-reboot") {
            state.ubuntu = false;
            state.ubuntu_at = None;
            state.windows_at = Some(Instant::now() + state.windows_delay);
        }
        Ok(CommandOutcome {
            ok: true,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

struct SimFactory {
    sims: HashMap<String, Arc<HostSim>>,
}

#[async_trait]
impl HostBackendFactory for SimFactory {
    async fn create(&self, host: &HostConfig) -> Result<HostBackend, CoreError> {
        let sim = self
            .sims
            .get(&host.id)
            .cloned()
            .ok_or_else(|| CoreError::ConfigError(format!("no backend for {}", host.id)))?;
        Ok(HostBackend {
            probe: sim.clone(),
            actuator: sim,
        })
    }
}

fn host_config(id: &str) -> HostConfig {
    HostConfig {
        id: id.to_string(),
        name: format!("{id} desk"),
        mac_address: "AA:BB:CC:DD:EE:01".to_string(),
        ip_address: "192.0.2.10".to_string(),
        wake: WakeTarget::default(),
        ubuntu_ssh: SshCredentials::new("ubuntu"),
        windows_ssh: SshCredentials::new("admin"),
        windows_probe: WindowsProbe::Ssh,
        commands: HostCommands::default(),
        description: None,
    }
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        boot_timeout: Duration::from_secs(60),
        poll_interval: Duration::from_secs(5),
        max_retries: 3,
        retry_delay: Duration::from_secs(2),
        ..OrchestratorSettings::default()
    }
}

async fn spawn_hosts(sims: &[(&str, Arc<HostSim>)]) -> (HostOrchestrator, EventPublisher) {
    let factory = SimFactory {
        sims: sims
            .iter()
            .map(|(id, sim)| ((*id).to_string(), sim.clone()))
            .collect(),
    };
    let events = EventPublisher::new(256);
    let hosts = HostOrchestrator::spawn(
        Arc::new(factory),
        settings(),
        TaskTracker::new(),
        events.clone(),
    );
    for (id, _) in sims {
        hosts.register_host(host_config(id)).await.unwrap();
    }
    (hosts, events)
}

fn drain(rx: &mut broadcast::Receiver<WsEvent>) -> Vec<WsEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Status sampling
// ============================================================================

#[tokio::test]
async fn test_status_reflects_probes_and_notifies_once() {
    let sim = HostSim::in_ubuntu();
    let (hosts, events) = spawn_hosts(&[("pc-1", sim.clone())]).await;
    let mut rx = events.subscribe();

    let first = hosts.get_status("pc-1").await.unwrap();
    let second = hosts.get_status("pc-1").await.unwrap();

    assert_eq!(first.state, HostState::Ubuntu);
    assert!(first.ubuntu_reachable);
    assert!(!first.windows_reachable);
    assert_eq!(first.name, "pc-1 desk");
    assert_eq!(second.state, HostState::Ubuntu);

    let changes: Vec<WsEvent> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, WsEvent::HostStateChanged { .. }))
        .collect();
    assert_eq!(changes.len(), 1);
    match &changes[0] {
        WsEvent::HostStateChanged { host, from, to } => {
            assert_eq!(host, "pc-1");
            assert_eq!(from, "unknown");
            assert_eq!(to, "ubuntu");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // A real change is announced again
    sim.lock().ubuntu = false;
    let third = hosts.get_status("pc-1").await.unwrap();
    assert_eq!(third.state, HostState::Unreachable);
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        WsEvent::HostStateChanged { from, to, .. } if from == "ubuntu" && to == "unreachable"
    )));
}

#[tokio::test]
async fn test_both_reachable_is_transition_unknown() {
    let sim = HostSim::in_ubuntu();
    sim.lock().windows = true;
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim)]).await;

    let report = hosts.get_status("pc-1").await.unwrap();
    assert_eq!(report.state, HostState::TransitionUnknown);
}

#[tokio::test]
async fn test_probe_error_counts_as_unreachable() {
    let sim = HostSim::off();
    sim.lock().probe_error = true;
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim)]).await;

    let report = hosts.get_status("pc-1").await.unwrap();
    assert_eq!(report.state, HostState::Unreachable);
    assert!(report.error.is_none());
}

#[tokio::test]
async fn test_unknown_host_status_is_not_found() {
    let (hosts, _events) = spawn_hosts(&[]).await;
    let err = hosts.get_status("ghost").await.unwrap_err();
    assert!(matches!(err, CoreError::HostNotFound(id) if id == "ghost"));
}

#[tokio::test]
async fn test_all_status_isolates_panicking_probe() {
    let healthy = HostSim::in_ubuntu();
    let broken = HostSim::off();
    broken.lock().probe_panics = true;
    let (hosts, _events) = spawn_hosts(&[("pc-1", healthy), ("pc-2", broken)]).await;

    let all = hosts.get_all_status().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all["pc-1"].state, HostState::Ubuntu);
    assert!(all["pc-1"].error.is_none());
    assert_eq!(all["pc-2"].state, HostState::Unreachable);
    assert!(all["pc-2"].error.is_some());

    // The host actor survives the panic
    let again = hosts.get_status("pc-2").await.unwrap();
    assert!(again.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_slow_sample_does_not_hold_up_requests() {
    let slow = HostSim::in_ubuntu();
    slow.lock().probe_delay = Duration::from_secs(10);
    let fast = HostSim::in_ubuntu();
    let (hosts, _events) = spawn_hosts(&[("slow", slow), ("fast", fast)]).await;

    let sampling = {
        let hosts = hosts.clone();
        tokio::spawn(async move { hosts.get_status("slow").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let slow_task = hosts.boot_to_ubuntu("slow").await.unwrap();
    let fast_task = hosts.boot_to_ubuntu("fast").await.unwrap();
    let fast_report = hosts.get_status("fast").await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "requests waited {:?}",
        started.elapsed()
    );
    assert_eq!(fast_report.state, HostState::Ubuntu);

    let report = sampling.await.unwrap().unwrap();
    assert_eq!(report.state, HostState::Ubuntu);
    for task_id in [slow_task, fast_task] {
        let task = hosts.wait_for_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
}

// ============================================================================
// Boot workflows
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_boot_ubuntu_already_running_skips_wake() {
    let sim = HostSim::in_ubuntu();
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim.clone())]).await;

    let task_id = hosts.boot_to_ubuntu("pc-1").await.unwrap();
    let task = hosts.wait_for_task(task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.message.contains("already running"));
    assert_eq!(sim.lock().wake_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn test_boot_ubuntu_polls_at_interval() {
    let sim = HostSim::off();
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim.clone())]).await;

    let started = Instant::now();
    let task_id = hosts.boot_to_ubuntu("pc-1").await.unwrap();
    let task = hosts.wait_for_task(task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.kind, TaskKind::BootUbuntu);
    assert!(task.completed_at.is_some());

    // Booted 12s after the wake; polls at 0s, 5s, 10s, 15s
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(15), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(20), "elapsed {elapsed:?}");
    let state = sim.lock();
    assert_eq!(state.wake_calls, 1);
    // One initial sample plus four polls
    assert_eq!(state.ubuntu_probes, 5);
}

#[tokio::test(start_paused = true)]
async fn test_boot_completion_updates_cached_state() {
    let sim = HostSim::off();
    let (hosts, events) = spawn_hosts(&[("pc-1", sim)]).await;
    let mut rx = events.subscribe();

    let task_id = hosts.boot_to_ubuntu("pc-1").await.unwrap();
    hosts.wait_for_task(task_id).await.unwrap();

    let events = drain(&mut rx);
    let booted = events
        .iter()
        .position(|e| {
            matches!(
                e,
                WsEvent::HostStateChanged { from, to, .. } if from == "unreachable" && to == "ubuntu"
            )
        })
        .expect("no ubuntu state change");
    let completed = events
        .iter()
        .position(|e| matches!(e, WsEvent::TaskCompleted { success: true, .. }))
        .expect("task never completed");
    assert!(booted < completed);

    // The next sample finds nothing new to announce
    let mut rx = hosts.subscribe();
    assert_eq!(hosts.get_status("pc-1").await.unwrap().state, HostState::Ubuntu);
    assert!(
        !drain(&mut rx)
            .iter()
            .any(|e| matches!(e, WsEvent::HostStateChanged { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_wake_is_retried_until_success() {
    let sim = HostSim::off();
    sim.lock().wake_failures = 2;
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim.clone())]).await;

    let task_id = hosts.boot_to_ubuntu("pc-1").await.unwrap();
    let task = hosts.wait_for_task(task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(sim.lock().wake_calls, 3);
}

#[tokio::test(start_paused = true)]
async fn test_wake_exhaustion_fails_with_last_message() {
    let sim = HostSim::off();
    sim.lock().wake_failures = u32::MAX;
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim.clone())]).await;

    let task_id = hosts.boot_to_ubuntu("pc-1").await.unwrap();
    let task = hosts.wait_for_task(task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.message.contains("send failed #3"), "{}", task.message);
    assert_eq!(sim.lock().wake_calls, 3);
}

#[tokio::test(start_paused = true)]
async fn test_boot_times_out() {
    let sim = HostSim::off();
    sim.lock().boots = false;
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim.clone())]).await;

    let started = Instant::now();
    let task_id = hosts.boot_to_ubuntu("pc-1").await.unwrap();
    let task = hosts.wait_for_task(task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.message.contains("timed out"), "{}", task.message);
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(started.elapsed() < Duration::from_secs(70));
}

#[tokio::test(start_paused = true)]
async fn test_boot_windows_from_off_goes_through_ubuntu() {
    let sim = HostSim::off();
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim.clone())]).await;

    let task_id = hosts.boot_to_windows("pc-1").await.unwrap();
    let task = hosts.wait_for_task(task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed, "{}", task.message);
    let state = sim.lock();
    assert_eq!(state.wake_calls, 1);
    assert_eq!(
        state.commands,
        vec![RemoteCommand {
            target: OsTarget::Ubuntu,
            command: "grub-reboot Windows && reboot".to_string(),
        }]
    );
    assert!(state.windows_up());
}

#[tokio::test(start_paused = true)]
async fn test_boot_windows_stops_when_ubuntu_boot_fails() {
    let sim = HostSim::off();
    sim.lock().boots = false;
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim.clone())]).await;

    let task_id = hosts.boot_to_windows("pc-1").await.unwrap();
    let task = hosts.wait_for_task(task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.message.starts_with("Ubuntu boot failed"), "{}", task.message);
    assert!(sim.lock().commands.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_boots_wake_once() {
    let sim = HostSim::off();
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim.clone())]).await;

    let first = hosts.boot_to_ubuntu("pc-1").await.unwrap();
    let second = hosts.boot_to_ubuntu("pc-1").await.unwrap();
    assert_ne!(first, second);

    let first = hosts.wait_for_task(first).await.unwrap();
    let second = hosts.wait_for_task(second).await.unwrap();

    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(second.status, TaskStatus::Completed);
    // Whichever ran second found the host already booted
    let skipped = [&first, &second]
        .iter()
        .filter(|task| task.message.contains("already running"))
        .count();
    assert_eq!(skipped, 1);
    assert_eq!(sim.lock().wake_calls, 1);
}

// ============================================================================
// Single-command workflows
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_windows_uses_windows_credentials() {
    let sim = HostSim::off();
    sim.lock().windows = true;
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim.clone())]).await;

    let task_id = hosts.shutdown_windows("pc-1").await.unwrap();
    let task = hosts.wait_for_task(task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.kind, TaskKind::ShutdownWindows);
    assert_eq!(
        sim.lock().commands,
        vec![RemoteCommand {
            target: OsTarget::Windows,
            command: "shutdown /s /f /t 0".to_string(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_command_fails_task() {
    let sim = HostSim::in_ubuntu();
    sim.lock().command_ok = false;
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim.clone())]).await;

    let task_id = hosts.shutdown_ubuntu("pc-1").await.unwrap();
    let task = hosts.wait_for_task(task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.message.contains("access denied"), "{}", task.message);
}

// ============================================================================
// Registry and task ledger
// ============================================================================

#[tokio::test]
async fn test_unknown_host_rejected_before_task_exists() {
    let (hosts, _events) = spawn_hosts(&[]).await;

    let err = hosts.boot_to_windows("ghost").await.unwrap_err();
    assert!(matches!(err, CoreError::HostNotFound(_)));
    assert!(hosts.list_active_tasks(None).is_empty());
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let (hosts, _events) = spawn_hosts(&[("pc-1", HostSim::off())]).await;

    let err = hosts.register_host(host_config("pc-1")).await.unwrap_err();
    assert!(matches!(err, CoreError::HostAlreadyExists(_)));
    assert_eq!(hosts.host_ids().await.unwrap(), vec!["pc-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_remove_host_cancels_and_fails_tasks() {
    let sim = HostSim::off();
    sim.lock().boots = false;
    let (hosts, events) = spawn_hosts(&[("pc-1", sim.clone()), ("pc-2", HostSim::off())]).await;
    let mut rx = events.subscribe();

    let task_id = hosts.boot_to_ubuntu("pc-1").await.unwrap();
    tokio::time::sleep(Duration::from_secs(12)).await;
    hosts.remove_host("pc-1").await.unwrap();

    let task = hosts.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.message, "host removed");
    assert!(hosts.list_active_tasks(Some("pc-1")).is_empty());

    let all = hosts.get_all_status().await.unwrap();
    assert!(!all.contains_key("pc-1"));
    assert!(all.contains_key("pc-2"));

    // No polling after removal
    let probes = sim.lock().ubuntu_probes;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(sim.lock().ubuntu_probes, probes);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        WsEvent::HostRemoved { host, reason } if host == "pc-1" && reason == "host removed"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        WsEvent::TaskCompleted { task_id: id, success: false, .. } if *id == task_id.to_string()
    )));

    assert!(matches!(
        hosts.remove_host("pc-1").await.unwrap_err(),
        CoreError::HostNotFound(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_update_host_fails_outstanding_tasks() {
    let sim = HostSim::off();
    sim.lock().boots = false;
    let (hosts, _events) = spawn_hosts(&[("pc-1", sim)]).await;

    let task_id = hosts.boot_to_ubuntu("pc-1").await.unwrap();
    let mut updated = host_config("pc-1");
    updated.name = "renamed".to_string();
    hosts.update_host(updated).await.unwrap();

    let task = hosts.get_task(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.message, "host configuration updated");

    let report = hosts.get_status("pc-1").await.unwrap();
    assert_eq!(report.name, "renamed");
}

#[tokio::test(start_paused = true)]
async fn test_task_lifecycle_events() {
    let sim = HostSim::in_ubuntu();
    let (hosts, events) = spawn_hosts(&[("pc-1", sim)]).await;
    let mut rx = events.subscribe();

    let task_id = hosts.boot_to_ubuntu("pc-1").await.unwrap();
    hosts.wait_for_task(task_id).await.unwrap();

    let ours: Vec<WsEvent> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.task_id() == Some(task_id.to_string().as_str()))
        .collect();
    assert!(matches!(ours.first(), Some(WsEvent::TaskStarted { .. })));
    assert!(matches!(
        ours.last(),
        Some(WsEvent::TaskCompleted { success: true, .. })
    ));
}

#[tokio::test]
async fn test_unknown_task_id() {
    let (hosts, _events) = spawn_hosts(&[]).await;
    assert!(hosts.get_task(TaskId::new()).is_none());
    assert!(matches!(
        hosts.wait_for_task(TaskId::new()).await.unwrap_err(),
        CoreError::TaskNotFound(_)
    ));
}
