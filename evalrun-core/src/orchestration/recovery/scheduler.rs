use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{RecoveryService, RecoverySummary};
use crate::orchestration::config::RecoveryConfig;

/// Runs recovery sweeps: once at startup, then on a fixed interval. Sweeps
/// never overlap; a sweep requested while one is running is skipped.
pub struct RecoveryScheduler {
    sweeper: Arc<Sweeper>,
    config: RecoveryConfig,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

struct Sweeper {
    service: Arc<RecoveryService>,
    is_recovering: AtomicBool,
}

struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Sweeper {
    async fn sweep(&self, trigger: &'static str) -> Option<RecoverySummary> {
        if self
            .is_recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!(
                target: "evalrun::recovery",
                trigger,
                "recovery sweep already running; skipping"
            );
            return None;
        }
        let _guard = SweepGuard(&self.is_recovering);

        match self.service.recover_orphaned_runs().await {
            Ok(summary) => {
                if summary.detected > 0 || summary.reconciled > 0 || !summary.errors.is_empty() {
                    tracing::info!(
                        target: "evalrun::recovery",
                        trigger,
                        detected = summary.detected,
                        recovered = summary.recovered,
                        reconciled = summary.reconciled,
                        errors = summary.errors.len(),
                        "recovery sweep finished"
                    );
                } else {
                    tracing::debug!(target: "evalrun::recovery", trigger, "no orphaned runs");
                }
                Some(summary)
            }
            Err(err) => {
                tracing::warn!(
                    target: "evalrun::recovery",
                    trigger,
                    "recovery sweep abandoned: {err}"
                );
                None
            }
        }
    }
}

impl fmt::Debug for RecoveryScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryScheduler")
            .field("config", &self.config)
            .field(
                "is_recovering",
                &self.sweeper.is_recovering.load(Ordering::Acquire),
            )
            .finish_non_exhaustive()
    }
}

impl RecoveryScheduler {
    pub fn new(service: Arc<RecoveryService>, config: RecoveryConfig) -> Self {
        Self {
            sweeper: Arc::new(Sweeper {
                service,
                is_recovering: AtomicBool::new(false),
            }),
            config,
            task: Mutex::new(None),
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.sweeper.is_recovering.load(Ordering::Acquire)
    }

    /// On-demand sweep. Returns `None` when a sweep was already running or
    /// the sweep was abandoned.
    pub async fn trigger_recovery(&self) -> Option<RecoverySummary> {
        self.sweeper.sweep("manual").await
    }

    /// Starts the periodic task. Returns false when it is already running.
    pub async fn start(&self) -> bool {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let sweeper = Arc::clone(&self.sweeper);
        let interval = self.config.interval();
        let run_on_startup = self.config.run_on_startup;

        let handle = tokio::spawn(async move {
            if run_on_startup {
                sweeper.sweep("startup").await;
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(target: "evalrun::recovery", "recovery scheduler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        sweeper.sweep("interval").await;
                    }
                }
            }
        });

        tracing::info!(
            target: "evalrun::recovery",
            interval_secs = interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold_secs,
            "recovery scheduler started"
        );
        *task = Some((token, handle));
        true
    }

    /// Stops the periodic task, letting a sweep in progress finish.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.task.lock().await.take() else {
            return;
        };
        token.cancel();
        if let Err(err) = handle.await {
            tracing::warn!(target: "evalrun::recovery", "recovery scheduler ended abnormally: {err}");
        }
    }

    pub async fn is_running(&self) -> bool {
        let task = self.task.lock().await;
        task.as_ref().is_some_and(|(_, handle)| !handle.is_finished())
    }
}
