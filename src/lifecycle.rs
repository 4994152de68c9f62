//! Backend lifecycle tracking
//!
//! The proxy models the real game server as `Offline`, `Starting` or
//! `Online`. The first login seen while offline starts it, the connected
//! session count decides when it may be stopped again.

use crate::config::Config;
use crate::controller::BackendController;
use crate::error::ProxyError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// State of the backend as tracked by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Backend is not running
    Offline,
    /// Start script is running
    Starting,
    /// Start script finished, backend accepts players
    Online,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Offline => "offline",
            Lifecycle::Starting => "starting",
            Lifecycle::Online => "online",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking the manager to start the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// This caller moved the backend to `Starting` and launched the start script
    Started,
    /// Another caller already started it
    AlreadyStarting,
    /// Backend is already online
    AlreadyOnline,
    /// A previous start failed; the backend can no longer be started
    Unavailable,
}

struct ProcessState {
    lifecycle: Lifecycle,
    connected_sessions: usize,
    degraded: bool,
}

/// Owns the backend lifecycle and the connected session count.
///
/// Created once at service start and shared behind an `Arc` with every
/// connection handler. Methods that spawn background tasks take
/// `self: &Arc<Self>`.
///
/// The state lock is a synchronous mutex that is never held across an
/// await. Start and stop script runs are additionally serialized by
/// `controller_gate`, so a start requested while a stop is still running
/// waits for the stop to finish.
pub struct BackendManager {
    state: Mutex<ProcessState>,
    backend_addr: String,
    controller: Arc<dyn BackendController>,
    controller_gate: Arc<tokio::sync::Mutex<()>>,
    idle_shutdown_delay: Duration,
    startup_grace_delay: Duration,
    lifecycle_tx: watch::Sender<Lifecycle>,
    fatal_tx: watch::Sender<Option<String>>,
}

impl BackendManager {
    pub fn new(
        backend_addr: String,
        controller: Arc<dyn BackendController>,
        idle_shutdown_delay: Duration,
        startup_grace_delay: Duration,
    ) -> Arc<Self> {
        let (lifecycle_tx, _) = watch::channel(Lifecycle::Offline);
        let (fatal_tx, _) = watch::channel(None);
        Arc::new(Self {
            state: Mutex::new(ProcessState {
                lifecycle: Lifecycle::Offline,
                connected_sessions: 0,
                degraded: false,
            }),
            backend_addr,
            controller,
            controller_gate: Arc::new(tokio::sync::Mutex::new(())),
            idle_shutdown_delay,
            startup_grace_delay,
            lifecycle_tx,
            fatal_tx,
        })
    }

    pub fn from_config(config: &Config, controller: Arc<dyn BackendController>) -> Arc<Self> {
        Self::new(
            config.server.backend.clone(),
            controller,
            config.lifecycle.idle_shutdown_delay(),
            config.lifecycle.startup_grace_delay(),
        )
    }

    /// Address of the real backend
    pub fn backend_addr(&self) -> &str {
        &self.backend_addr
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn connected_sessions(&self) -> usize {
        self.state.lock().connected_sessions
    }

    /// True once a start attempt has failed
    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }

    /// Receiver notified on every lifecycle transition
    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle_tx.subscribe()
    }

    /// Receiver that gets the error message if the start script fails
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    fn set_lifecycle(&self, state: &mut ProcessState, to: Lifecycle) {
        if state.lifecycle != to {
            debug!(from = %state.lifecycle, to = %to, "Lifecycle transition");
            state.lifecycle = to;
            self.lifecycle_tx.send_replace(to);
        }
    }

    /// Start the backend if it is offline.
    ///
    /// Exactly one of any number of concurrent callers observing `Offline`
    /// gets `Started` and launches the start script; the rest see
    /// `AlreadyStarting`.
    pub fn request_start(self: &Arc<Self>) -> StartOutcome {
        match self.lifecycle() {
            Lifecycle::Starting => return StartOutcome::AlreadyStarting,
            Lifecycle::Online => return StartOutcome::AlreadyOnline,
            Lifecycle::Offline => {}
        }

        let mut state = self.state.lock();
        if state.degraded {
            return StartOutcome::Unavailable;
        }
        match state.lifecycle {
            Lifecycle::Offline => {
                self.set_lifecycle(&mut state, Lifecycle::Starting);
                drop(state);
                self.spawn_start();
                StartOutcome::Started
            }
            Lifecycle::Starting => StartOutcome::AlreadyStarting,
            Lifecycle::Online => StartOutcome::AlreadyOnline,
        }
    }

    fn spawn_start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let gate = Arc::clone(&manager.controller_gate).lock_owned().await;
            info!(backend = %manager.backend_addr, "Starting backend");
            let result = manager.controller.start().await;
            drop(gate);

            match result {
                Ok(()) => {
                    manager.mark_online();
                    // Stop it again if nobody joins
                    manager.schedule_idle_check(manager.startup_grace_delay);
                }
                Err(e) => manager.start_failed(ProxyError::from(e)),
            }
        });
    }

    fn mark_online(&self) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Starting {
            self.set_lifecycle(&mut state, Lifecycle::Online);
            info!(backend = %self.backend_addr, "Backend is now online");
        }
    }

    fn start_failed(&self, err: ProxyError) {
        {
            let mut state = self.state.lock();
            state.degraded = true;
            self.set_lifecycle(&mut state, Lifecycle::Offline);
        }
        error!(
            backend = %self.backend_addr,
            kind = err.kind().as_str(),
            error = %err,
            "Backend start script failed; refusing further logins"
        );
        self.fatal_tx.send_replace(Some(err.to_string()));
    }

    /// Wait until the backend is online, giving up on timeout or if the start fails
    pub async fn wait_until_online(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let result = tokio::time::timeout(timeout, async {
            loop {
                let current = *rx.borrow_and_update();
                match current {
                    Lifecycle::Online => return true,
                    Lifecycle::Offline => return false,
                    Lifecycle::Starting => {}
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        matches!(result, Ok(true))
    }

    /// Record that the backend could not be reached.
    ///
    /// An online backend that refuses connections is treated as not running.
    /// While starting, the start attempt is still in flight and the state is
    /// left alone. Returns true if the lifecycle changed.
    pub fn mark_unreachable(&self) -> bool {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Online {
            return false;
        }
        self.set_lifecycle(&mut state, Lifecycle::Offline);
        warn!(backend = %self.backend_addr, "Backend unreachable, marking offline");
        true
    }

    /// Register a relayed session.
    ///
    /// Returns `None` unless the backend is online. The session counts as
    /// connected until the returned guard is dropped.
    pub fn open_session(self: &Arc<Self>) -> Option<SessionGuard> {
        let sessions = {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Online {
                return None;
            }
            state.connected_sessions += 1;
            state.connected_sessions
        };

        let id = Uuid::new_v4();
        info!(session_id = %id, sessions, "Player connected");
        Some(SessionGuard {
            manager: Arc::clone(self),
            id,
        })
    }

    fn close_session(self: &Arc<Self>, id: Uuid) {
        let sessions = {
            let mut state = self.state.lock();
            state.connected_sessions = state.connected_sessions.saturating_sub(1);
            state.connected_sessions
        };

        info!(session_id = %id, sessions, "Player disconnected");
        if sessions == 0 && tokio::runtime::Handle::try_current().is_ok() {
            self.schedule_idle_check(self.idle_shutdown_delay);
        }
    }

    /// Check for idleness after `delay`.
    ///
    /// The spawned task is detached and nobody waits on it. It is never
    /// cancelled either: it re-validates the idle condition when it fires.
    pub fn schedule_idle_check(self: &Arc<Self>, delay: Duration) {
        debug!(delay_secs = delay.as_secs_f64(), "Scheduling idle check");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.idle_check().await;
        });
    }

    /// Stop the backend if it is online with no connected sessions.
    ///
    /// Returns true if the stop script was run.
    pub async fn idle_check(&self) -> bool {
        self.stop_backend(true).await
    }

    /// Stop an online backend regardless of connected sessions.
    ///
    /// Used when the proxy itself shuts down.
    pub async fn shutdown(&self) -> bool {
        self.stop_backend(false).await
    }

    async fn stop_backend(&self, require_idle: bool) -> bool {
        let gate = {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Online {
                debug!(lifecycle = %state.lifecycle, "Backend not online, nothing to stop");
                return false;
            }
            if require_idle && state.connected_sessions > 0 {
                debug!(sessions = state.connected_sessions, "Backend in use, not stopping");
                return false;
            }
            let Ok(gate) = Arc::clone(&self.controller_gate).try_lock_owned() else {
                debug!("Backend script already running, not stopping");
                return false;
            };
            self.set_lifecycle(&mut state, Lifecycle::Offline);
            gate
        };

        if require_idle {
            info!(backend = %self.backend_addr, "Shutting down backend due to idle");
        } else {
            info!(backend = %self.backend_addr, "Shutting down backend");
        }

        match self.controller.stop().await {
            Ok(()) => info!(backend = %self.backend_addr, "Backend offline"),
            Err(e) => {
                let err = ProxyError::from(e);
                warn!(
                    backend = %self.backend_addr,
                    kind = err.kind().as_str(),
                    error = %err,
                    "Backend stop script failed, treating backend as offline"
                );
            }
        }
        drop(gate);
        true
    }
}

#[cfg(test)]
impl BackendManager {
    /// Jump straight to `to` without running any script
    pub(crate) fn force_lifecycle(&self, to: Lifecycle) {
        let mut state = self.state.lock();
        self.set_lifecycle(&mut state, to);
    }
}

/// A relayed session counted in `connected_sessions`.
///
/// Dropping the guard decrements the count exactly once and schedules an
/// idle check when it reaches zero.
pub struct SessionGuard {
    manager: Arc<BackendManager>,
    id: Uuid,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.close_session(self.id);
    }
}
