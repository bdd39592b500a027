//! Single-assignment readiness signal for the isolated execution host.
//!
//! Workers block on [`ReadinessGate::wait`]. The cooperative dispatch thread
//! is the one that eventually calls [`ReadinessGate::signal_ready`], so it must
//! never block on the gate: [`ReadinessGate::await_ready`] degrades to a
//! [`ReadinessGate::poll`] there.

use std::{
    sync::OnceLock,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::TRACE_TARGET;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not signalled yet. Only returned by non-blocking paths.
    Pending,
    TimedOut,
    Failed(String),
}

impl Readiness {
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

#[derive(Debug, Clone)]
enum State {
    Pending,
    Ready,
    Failed(String),
}

impl State {
    fn snapshot(&self) -> Readiness {
        match self {
            Self::Pending => Readiness::Pending,
            Self::Ready => Readiness::Ready,
            Self::Failed(cause) => Readiness::Failed(cause.clone()),
        }
    }
}

#[derive(Debug)]
pub struct ReadinessGate {
    state: Mutex<State>,
    changed: Condvar,
    dispatch: OnceLock<ThreadId>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            changed: Condvar::new(),
            dispatch: OnceLock::new(),
        }
    }

    /// Record the calling thread as the cooperative dispatch thread.
    ///
    /// Only the first call binds; returns whether the caller is the bound
    /// thread afterwards.
    pub fn bind_dispatch_thread(&self) -> bool {
        let current = thread::current().id();
        *self.dispatch.get_or_init(|| current) == current
    }

    #[must_use]
    pub fn is_dispatch_thread(&self) -> bool {
        self.dispatch
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }

    /// Mark the host ready. Returns whether this call performed the transition.
    ///
    /// Once a dispatch thread is bound, calls from any other thread are
    /// rejected.
    pub fn signal_ready(&self) -> bool {
        if let Some(dispatch) = self.dispatch.get()
            && *dispatch != thread::current().id()
        {
            warn!(
                target: TRACE_TARGET,
                "signal_ready called off the dispatch thread; ignoring"
            );
            return false;
        }
        self.transition(State::Ready)
    }

    /// Mark the host as failed to start. Single assignment like
    /// [`Self::signal_ready`].
    pub fn signal_failed(&self, cause: impl Into<String>) -> bool {
        self.transition(State::Failed(cause.into()))
    }

    fn transition(&self, next: State) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, State::Pending) {
            debug!(target: TRACE_TARGET, current = ?*state, "readiness already settled");
            return false;
        }
        *state = next;
        drop(state);
        self.changed.notify_all();
        true
    }

    #[must_use]
    pub fn poll(&self) -> Readiness {
        self.state.lock().snapshot()
    }

    /// Block for up to `timeout`. Never returns [`Readiness::Pending`].
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> Readiness {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while matches!(*state, State::Pending) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        match state.snapshot() {
            Readiness::Pending => Readiness::TimedOut,
            settled => settled,
        }
    }

    /// [`Self::wait`] on workers, [`Self::poll`] on the dispatch thread.
    #[must_use]
    pub fn await_ready(&self, timeout: Duration) -> Readiness {
        if !self.is_dispatch_thread() {
            return self.wait(timeout);
        }
        let readiness = self.poll();
        if readiness == Readiness::Pending {
            warn!(
                target: TRACE_TARGET,
                "execution host not ready; refusing to block the dispatch thread"
            );
        }
        readiness
    }
}
