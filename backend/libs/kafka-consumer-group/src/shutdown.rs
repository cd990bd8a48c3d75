//! Coordinated teardown of the consumer group and its co-hosted service.
//!
//! The orchestrator waits for the first of three triggers (consumer error, OS
//! signal, service error), cancels the shared token, waits for every tracked
//! task to exit and finally closes the group and the service. Each step runs
//! at most once.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::error::{ConsumerError, ConsumerResult};
use crate::group::ConsumerGroup;
use crate::server::ServiceHandle;
use crate::session::GroupRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Closed,
}

/// The source that started the shutdown.
#[derive(Debug)]
pub enum ShutdownTrigger {
    Consumer(ConsumerError),
    Signal,
    Service(ConsumerError),
}

impl ShutdownTrigger {
    /// A requested shutdown, as opposed to a failure.
    pub fn is_signal(&self) -> bool {
        matches!(self, ShutdownTrigger::Signal)
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::Consumer(err) => write!(f, "consumer error: {err}"),
            ShutdownTrigger::Signal => write!(f, "OS signal"),
            ShutdownTrigger::Service(err) => write!(f, "service error: {err}"),
        }
    }
}

pub struct ShutdownOrchestrator {
    cancel: CancellationToken,
    tracker: TaskTracker,
    state: Mutex<ShutdownState>,
}

impl ShutdownOrchestrator {
    /// `cancel` is the token shared with the consumer group; `tracker` holds
    /// the tasks that must exit before anything is closed.
    pub fn new(cancel: CancellationToken, tracker: TaskTracker) -> Self {
        Self {
            cancel,
            tracker,
            state: Mutex::new(ShutdownState::Running),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock()
    }

    fn transition(&self, from: ShutdownState, to: ShutdownState) -> ConsumerResult<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(out_of_order(*state));
        }
        *state = to;
        Ok(())
    }

    /// Wait for the first trigger, then drain.
    ///
    /// Later triggers are left unread. Returns once the shared token is
    /// cancelled and every tracked task has exited.
    pub async fn wait_for_trigger<S>(
        &self,
        consumer_errors: &mut mpsc::Receiver<ConsumerError>,
        service_errors: Option<&mut mpsc::Receiver<ConsumerError>>,
        signal: S,
    ) -> ConsumerResult<ShutdownTrigger>
    where
        S: Future<Output = ()>,
    {
        let state = self.state();
        if state != ShutdownState::Running {
            return Err(out_of_order(state));
        }

        let trigger = tokio::select! {
            err = consumer_errors.recv() => {
                ShutdownTrigger::Consumer(err.unwrap_or(ConsumerError::ChannelClosed("consumer error")))
            }
            _ = signal => ShutdownTrigger::Signal,
            err = recv_optional(service_errors) => {
                ShutdownTrigger::Service(err.unwrap_or(ConsumerError::ChannelClosed("service error")))
            }
        };

        match &trigger {
            ShutdownTrigger::Consumer(err) => {
                error!(error = %err, "shutting down consumer due to consumer error...")
            }
            ShutdownTrigger::Signal => info!("shutting down consumer due to OS signal..."),
            ShutdownTrigger::Service(err) => {
                error!(error = %err, "shutting down consumer due to server error...")
            }
        }

        self.transition(ShutdownState::Running, ShutdownState::Draining)?;
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("All consumer tasks exited");

        Ok(trigger)
    }

    /// Close the consumer group, then the service.
    ///
    /// Both are attempted; the first failure is returned.
    pub async fn close<R: GroupRuntime>(
        &self,
        group: &ConsumerGroup<R>,
        service: Option<ServiceHandle>,
    ) -> ConsumerResult<()> {
        self.transition(ShutdownState::Draining, ShutdownState::Closed)?;

        let group_result = group.close().await;
        if let Err(err) = &group_result {
            error!(error = %err, "Failed to close consumer group");
        }

        let service_result = match service {
            Some(service) => service.close().await,
            None => Ok(()),
        };
        if let Err(err) = &service_result {
            error!(error = %err, "Failed to close HTTP service");
        }

        group_result.and(service_result)
    }
}

fn out_of_order(state: ShutdownState) -> ConsumerError {
    ConsumerError::Shutdown(match state {
        ShutdownState::Running => "still running",
        ShutdownState::Draining => "already draining",
        ShutdownState::Closed => "already closed",
    })
}

async fn recv_optional(rx: Option<&mut mpsc::Receiver<ConsumerError>>) -> Option<ConsumerError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves on SIGINT, SIGTERM, SIGHUP or SIGQUIT.
///
/// A handler that cannot be installed is logged and skipped.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        async fn wait_for(kind: SignalKind, name: &str) {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    error!(error = %err, signal = name, "Failed to install signal handler");
                    std::future::pending::<()>().await;
                }
            }
        }

        tokio::select! {
            _ = wait_for(SignalKind::interrupt(), "SIGINT") => {},
            _ = wait_for(SignalKind::terminate(), "SIGTERM") => {},
            _ = wait_for(SignalKind::hangup(), "SIGHUP") => {},
            _ = wait_for(SignalKind::quit(), "SIGQUIT") => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
