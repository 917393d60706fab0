//! Idle-timeout supervision of a single tool process
//!
//! A [`SupervisedSession`] starts the tool lazily on the first query, keeps it
//! resident while queries keep arriving and shuts it down once it has been
//! idle for the configured period. The next query starts a fresh process.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::ToolConfig;
use crate::error::{Result, SessionError};
use crate::process::{CommandLauncher, Launcher, ProcessSession};

enum State {
    /// No process alive
    Empty,
    /// One process alive, reclaimed once `deadline` passes without a query
    Active {
        session: ProcessSession,
        deadline: Instant,
    },
    /// Torn down for good
    Stopped,
}

impl State {
    fn deadline(&self) -> Option<Instant> {
        match self {
            State::Active { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }
}

struct Shared {
    state: Mutex<State>,
    launcher: Box<dyn Launcher>,
    idle_timeout: Duration,
    /// Wakes the monitor whenever the deadline moves
    activity: Notify,
    launches: AtomicUsize,
}

/// A lazily started, idle-reclaimed tool session
pub struct SupervisedSession {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisedSession {
    /// Supervise sessions produced by `launcher`
    ///
    /// Cancelling `cancel` tears the live process down and stops the
    /// supervisor for good. Must be called from within a tokio runtime.
    pub fn new<L: Launcher>(launcher: L, idle_timeout: Duration, cancel: &CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Empty),
            launcher: Box::new(launcher),
            idle_timeout,
            activity: Notify::new(),
            launches: AtomicUsize::new(0),
        });
        let cancel = cancel.child_token();
        let monitor = tokio::spawn(monitor(Arc::clone(&shared), cancel.clone()));

        Self {
            shared,
            cancel,
            monitor: Mutex::new(Some(monitor)),
        }
    }

    /// Supervise the real tool as described by `config`
    pub fn from_config(config: &ToolConfig, cancel: &CancellationToken) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            CommandLauncher::from_config(config),
            config.idle_timeout(),
            cancel,
        ))
    }

    /// Query the tool about one file, starting it first if necessary
    pub async fn query(&self, path: &str) -> Result<String> {
        let idle_timeout = self.shared.idle_timeout;
        let mut state = self.shared.state.lock().await;

        if self.cancel.is_cancelled() {
            return Err(SessionError::Stopped);
        }

        if matches!(*state, State::Empty) {
            let session = self.shared.launcher.launch().await?;
            let launches = self.shared.launches.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Started tool (launch #{}, pid {:?})", launches, session.pid());
            *state = State::Active {
                session,
                deadline: Instant::now() + idle_timeout,
            };
        }

        let State::Active { session, deadline } = &mut *state else {
            return Err(SessionError::Stopped);
        };

        *deadline = Instant::now() + idle_timeout;
        self.shared.activity.notify_one();

        let result = session.query(path).await;
        *deadline = Instant::now() + idle_timeout;

        // Timeouts and abandoned requests kill the process behind the session
        if !session.is_open().await {
            debug!("Tool session closed itself, next query starts a new one");
            *state = State::Empty;
        }
        self.shared.activity.notify_one();

        result
    }

    /// Shut the live process down now; the next query starts a new one
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if !matches!(*state, State::Active { .. }) {
            return Ok(());
        }

        let result = match std::mem::replace(&mut *state, State::Empty) {
            State::Active { session, .. } => session.shutdown().await,
            _ => Ok(()),
        };
        self.shared.activity.notify_one();
        result
    }

    /// Tear everything down and refuse further queries
    pub async fn shutdown(&self) -> Result<()> {
        let result = {
            let mut state = self.shared.state.lock().await;
            teardown(&mut state).await
        };

        self.cancel.cancel();
        if let Some(monitor) = self.monitor.lock().await.take() {
            if let Err(e) = monitor.await {
                warn!("Idle monitor ended abnormally: {}", e);
            }
        }

        result
    }

    /// Whether a process is currently alive
    pub async fn is_active(&self) -> bool {
        matches!(*self.shared.state.lock().await, State::Active { .. })
    }

    /// Number of processes started so far
    pub fn launches(&self) -> usize {
        self.shared.launches.load(Ordering::SeqCst)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.shared.idle_timeout
    }
}

impl Drop for SupervisedSession {
    fn drop(&mut self) {
        // The monitor owns the last reference to the process and tears it down
        self.cancel.cancel();
    }
}

/// Reclaims the process on idle expiry and tears down on cancellation
async fn monitor(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let deadline = shared.state.lock().await.deadline();

        tokio::select! {
            _ = cancel.cancelled() => {
                let mut state = shared.state.lock().await;
                if let Err(e) = teardown(&mut state).await {
                    warn!("Error stopping tool on cancellation: {}", e);
                }
                return;
            }
            _ = shared.activity.notified() => {}
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                expire(&shared).await;
            }
        }
    }
}

async fn expire(shared: &Shared) {
    let mut state = shared.state.lock().await;

    // A query may have moved the deadline while we waited for the lock
    match state.deadline() {
        Some(deadline) if deadline <= Instant::now() => {}
        _ => return,
    }

    if let State::Active { session, .. } = std::mem::replace(&mut *state, State::Empty) {
        debug!("Tool idle for {:?}, stopping it", shared.idle_timeout);
        if let Err(e) = session.shutdown().await {
            warn!("Error stopping idle tool: {}", e);
        }
    }
}

/// Stop whatever is live, exactly once
async fn teardown(state: &mut State) -> Result<()> {
    match std::mem::replace(state, State::Stopped) {
        State::Active { session, .. } => {
            info!("Stopping tool and idle monitor");
            session.shutdown().await
        }
        State::Empty => {
            debug!("Stopping idle monitor");
            Ok(())
        }
        State::Stopped => Ok(()),
    }
}
