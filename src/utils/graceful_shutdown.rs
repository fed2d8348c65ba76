//! Staged graceful shutdown.
//!
//! Lifecycle: `running → initiated → draining → force-close-tasks →
//! force-shutdown → completed (clean | unclean)`. Triggered exactly once by a
//! termination signal or a fatal startup error; later triggers are ignored.
//! All deadlines are measured from the trigger instant:
//!
//! * `keep_accepting`: new connections are still served; the health surface
//!   already reports unhealthy so load balancers reroute early
//! * `cancel_tasks_after`: outstanding task contexts get a "please wrap up"
//!   cancellation
//! * `+ force_close_grace`: tasks that ignored it are force-canceled
//! * `force_shutdown_after + force_shutdown_grace`: the hard deadline;
//!   anything still running makes the shutdown unclean
//!
//! Shutdown hooks run concurrently; a panicking hook is caught and recorded
//! under its registered name without blocking the others.
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use eyre::Result;
use futures_util::{FutureExt, future::BoxFuture};
use tokio::{
    signal,
    sync::{broadcast, watch},
    time::timeout,
};

use crate::{config::ShutdownConfig, core::server::Server};

/// Environment hint set by Kubernetes-style orchestrators.
pub const TERMINATION_GRACE_ENV: &str = "TERMINATION_GRACE_PERIOD_SECONDS";

/// Why shutdown was triggered.
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// SIGTERM or SIGINT.
    Signal,
    /// A fatal error made continuing pointless.
    Fatal(String),
}

/// One failed or panicked shutdown hook.
#[derive(Debug, Clone)]
pub struct ShutdownError {
    pub hook: String,
    pub message: String,
}

/// Terminal state of the shutdown process.
#[derive(Debug)]
pub struct ShutdownReport {
    /// Whether tasks and hooks wound down before the hard deadline.
    pub clean: bool,
    pub errors: Vec<ShutdownError>,
}

impl ShutdownReport {
    /// Suggested process exit code.
    pub fn exit_code(&self) -> i32 {
        if self.clean { 0 } else { 1 }
    }
}

/// All five shutdown deadlines, resolved to concrete durations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownTimings {
    pub keep_accepting: Duration,
    pub cancel_tasks_after: Duration,
    pub force_close_grace: Duration,
    pub force_shutdown_after: Duration,
    pub force_shutdown_grace: Duration,
}

impl ShutdownTimings {
    pub fn from_config(cfg: &ShutdownConfig) -> Result<Self> {
        Ok(Self {
            keep_accepting: cfg.keep_accepting()?,
            cancel_tasks_after: cfg.cancel_tasks_after()?,
            force_close_grace: cfg.force_close_grace()?,
            force_shutdown_after: cfg.force_shutdown_after()?,
            force_shutdown_grace: cfg.force_shutdown_grace()?,
        })
    }

    /// Recompute the keep-accepting window from the orchestrator's external
    /// grace period: whatever time the orchestrator grants beyond our own
    /// total is spent still accepting connections, clamped to non-negative.
    pub fn with_external_grace_env(self) -> Self {
        match std::env::var(TERMINATION_GRACE_ENV) {
            Ok(value) => self.with_external_grace(Some(&value)),
            Err(_) => self,
        }
    }

    fn total(&self) -> Duration {
        self.force_shutdown_after + self.force_shutdown_grace
    }

    pub fn with_external_grace(mut self, value: Option<&str>) -> Self {
        if let Some(secs) = value.and_then(|v| v.trim().parse::<u64>().ok()) {
            self.keep_accepting = Duration::from_secs(secs).saturating_sub(self.total());
        }
        self
    }

    /// The hard deadline relative to the trigger instant.
    pub fn hard_deadline(&self) -> Duration {
        self.total()
    }
}

struct Hook {
    name: String,
    run: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
}

/// Coordinates the staged shutdown of a [`Server`].
pub struct GracefulShutdown {
    server: Arc<Server>,
    timings: ShutdownTimings,
    // Watch channel so a trigger fired before anyone listens is still
    // observed; late observers read the retained state.
    shutdown_tx: watch::Sender<Option<ShutdownReason>>,
    /// Stage-one cancellation: "please wrap up".
    task_cancel_tx: broadcast::Sender<()>,
    /// Stage-two cancellation: tasks are being force-closed.
    force_cancel_tx: broadcast::Sender<()>,
    initiated: AtomicBool,
    // Append-only after startup.
    hooks: Mutex<Vec<Hook>>,
}

impl GracefulShutdown {
    pub fn new(server: Arc<Server>, timings: ShutdownTimings) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(None);
        let (task_cancel_tx, _) = broadcast::channel(1);
        let (force_cancel_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            server,
            timings,
            shutdown_tx,
            task_cancel_tx,
            force_cancel_tx,
            initiated: AtomicBool::new(false),
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// Register a named hook run once shutdown begins. Hooks run
    /// concurrently with each other and with request draining.
    pub fn on_shutdown<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push(Hook {
                name: name.into(),
                run: Box::new(move || hook().boxed()),
            });
        }
    }

    /// Resolves once shutdown has been triggered, including when the trigger
    /// fired before this call.
    pub async fn triggered(&self) -> ShutdownReason {
        let mut rx = self.shutdown_tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return ShutdownReason::Fatal("shutdown channel closed".into());
            }
        }
    }

    /// Receiver signaled when outstanding tasks should wrap up.
    pub fn task_canceled(&self) -> broadcast::Receiver<()> {
        self.task_cancel_tx.subscribe()
    }

    /// Receiver signaled when remaining tasks are force-closed.
    pub fn force_canceled(&self) -> broadcast::Receiver<()> {
        self.force_cancel_tx.subscribe()
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Trigger shutdown. Only the first call has any effect; the health
    /// surface flips to unhealthy immediately, before connections are
    /// refused.
    pub fn trigger(&self, reason: ShutdownReason) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!(?reason, "shutdown triggered");
            self.server.mark_unhealthy();
            let _ = self.shutdown_tx.send(Some(reason));
        } else {
            tracing::debug!(?reason, "shutdown already initiated, ignoring trigger");
        }
    }

    /// Listen for SIGTERM / SIGINT and trigger shutdown on the first one.
    pub async fn run_signal_handler(self: Arc<Self>) {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
        self.trigger(ShutdownReason::Signal);
    }

    /// Run the staged shutdown to completion. Blocks until triggered, then
    /// drives the stages and returns the terminal report.
    pub async fn process(self: Arc<Self>) -> ShutdownReport {
        self.triggered().await;
        let started = Instant::now();

        // Stage: initiated. Still accepting while load balancers reroute.
        tokio::time::sleep(self.timings.keep_accepting).await;
        self.server.mark_draining();
        tracing::info!("draining: no longer accepting new requests");

        // Staged task cancellation timers.
        let cancel_at = self.timings.cancel_tasks_after;
        let force_at = cancel_at + self.timings.force_close_grace;
        let task_cancel = self.task_cancel_tx.clone();
        let force_cancel = self.force_cancel_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cancel_at.saturating_sub(started.elapsed())).await;
            let _ = task_cancel.send(());
            tokio::time::sleep(force_at.saturating_sub(started.elapsed())).await;
            let _ = force_cancel.send(());
        });

        // Hooks run concurrently; each panic is caught and tagged.
        let hooks = self
            .hooks
            .lock()
            .map(|mut h| h.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        let handles: Vec<(String, tokio::task::JoinHandle<Result<()>>)> = hooks
            .into_iter()
            .map(|hook| (hook.name, tokio::spawn((hook.run)())))
            .collect();
        let hooks_done = async {
            let mut errors = Vec::new();
            for (name, handle) in handles {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => errors.push(ShutdownError {
                        hook: name,
                        message: e.to_string(),
                    }),
                    Err(join_err) if join_err.is_panic() => {
                        let payload = join_err.into_panic();
                        let message = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "hook panicked".to_string());
                        errors.push(ShutdownError {
                            hook: name,
                            message,
                        });
                    }
                    Err(_) => errors.push(ShutdownError {
                        hook: name,
                        message: "hook was canceled".to_string(),
                    }),
                }
            }
            errors
        };
        let drained = async {
            while self.server.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        };

        let remaining = self.timings.hard_deadline().saturating_sub(started.elapsed());
        match timeout(remaining, async {
            let (errors, ()) = tokio::join!(hooks_done, drained);
            errors
        })
        .await
        {
            Ok(errors) => {
                for err in &errors {
                    tracing::error!(hook = %err.hook, error = %err.message, "shutdown hook failed");
                }
                tracing::info!("shutdown complete");
                ShutdownReport {
                    clean: true,
                    errors,
                }
            }
            Err(_) => {
                tracing::error!("force shutdown: deadline exceeded with work outstanding");
                ShutdownReport {
                    clean: false,
                    errors: vec![ShutdownError {
                        hook: "<deadline>".to_string(),
                        message: "force shutdown deadline exceeded".to_string(),
                    }],
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
