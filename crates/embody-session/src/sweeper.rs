//! Background task that sweeps sessions on a fixed period.

use std::sync::Arc;
use std::time::Duration;

use embody_core::Timestamp;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::{SessionManager, SweepReport};

/// Handle to a running sweep loop.
///
/// Dropping the handle cancels the loop without waiting for it; call
/// [`SessionSweeper::shutdown`] to stop and join.
pub struct SessionSweeper {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SessionSweeper {
    /// Sweep `manager` every `interval` until cancelled.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(manager: Arc<SessionManager>, interval: Duration) -> Self {
        Self::spawn_with(manager, interval, |_| {})
    }

    /// Like [`SessionSweeper::spawn`], passing every non-empty report to
    /// `on_report`.
    #[must_use]
    pub fn spawn_with<F>(manager: Arc<SessionManager>, interval: Duration, on_report: F) -> Self
    where
        F: Fn(&SweepReport) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            info!(interval = ?period, "Session sweeper started");

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match manager.sweep(Timestamp::now()) {
                            Ok(report) if !report.is_empty() => on_report(&report),
                            Ok(_) => {},
                            Err(e) => warn!(error = %e, "Session sweep failed"),
                        }
                    },
                }
            }
            debug!("Session sweeper stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Whether the loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Session sweeper task failed");
        }
    }
}

impl Drop for SessionSweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SessionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSweeper")
            .field("running", &self.is_running())
            .finish()
    }
}
