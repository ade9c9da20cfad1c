//! Background VM status monitor

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use kameo::actor::ActorRef;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actor::vm::VmControllerActor;
use crate::aggregate::panic_message;
use crate::error::CoreError;
use crate::vm::refresh_all;

/// Handle to a running monitor loop
pub struct VmMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl VmMonitor {
    pub(crate) fn spawn(
        controller: ActorRef<VmControllerActor>,
        interval: Duration,
        backoff: Duration,
    ) -> Self {
        Self::spawn_with(
            move || {
                let controller = controller.clone();
                async move { refresh_all(&controller).await }
            },
            interval,
            backoff,
        )
    }

    /// Run `refresh` every `interval`, retrying after `backoff` when it fails
    pub(crate) fn spawn_with<F, Fut>(refresh: F, interval: Duration, backoff: Duration) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<usize, CoreError>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(refresh, interval, backoff, cancel.clone()));
        Self { cancel, handle }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the loop and wait until it has exited
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "VM monitor task ended abnormally");
        }
    }
}

async fn run<F, Fut>(mut refresh: F, interval: Duration, backoff: Duration, cancel: CancellationToken)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize, CoreError>>,
{
    info!(interval_secs = interval.as_secs(), "VM status monitoring started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let refreshed = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = AssertUnwindSafe(refresh()).catch_unwind() => match result {
                Ok(Ok(count)) => {
                    debug!(vms = count, "VM status refresh complete");
                    true
                }
                Ok(Err(e)) => {
                    error!(error = %e, "VM status refresh failed");
                    false
                }
                Err(panic) => {
                    error!(error = %panic_message(panic.as_ref()), "VM status refresh panicked");
                    false
                }
            },
        };

        if !refreshed {
            ticker.reset_after(backoff);
        }
    }

    info!("VM status monitoring stopped");
}
