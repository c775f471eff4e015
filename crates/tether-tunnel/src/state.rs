//! Connection state register.
//!
//! A [`StateMachine`] holds one connection's [`ConnectionState`] behind a
//! `tokio::sync::watch` channel. Writers publish with release semantics and
//! waiters observe with acquire semantics; [`StateMachine::wait_for_state`]
//! re-checks the current value before parking, so a transition that lands
//! between the check and the wait is never missed.

use std::fmt;
use std::ops::BitOr;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of a single connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Failed,
    Terminated,
}

impl ConnectionState {
    const fn mask(self) -> u8 {
        match self {
            Self::Unconnected => 1,
            Self::Connecting => 2,
            Self::Connected => 4,
            Self::Failed => 8,
            Self::Terminated => 16,
        }
    }

    /// Whether this state is a member of `set`.
    pub const fn is_in(self, set: StateSet) -> bool {
        set.0 & self.mask() != 0
    }

    /// Whether `self -> next` is a legal step.
    ///
    /// Any state may move to `Terminated`; nothing leaves `Terminated`.
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Failed)
                | (Self::Connected, Self::Failed)
                | (
                    Self::Unconnected | Self::Connecting | Self::Connected | Self::Failed,
                    Self::Terminated
                )
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unconnected => "UNCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        })
    }
}

/// A set of [`ConnectionState`]s, tested with a single mask operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateSet(u8);

impl StateSet {
    pub const EMPTY: Self = Self(0);
    /// States in which no further I/O will ever succeed.
    pub const TERMINAL: Self =
        Self(ConnectionState::Failed.mask() | ConnectionState::Terminated.mask());

    pub const fn with(self, state: ConnectionState) -> Self {
        Self(self.0 | state.mask())
    }

    pub const fn contains(self, state: ConnectionState) -> bool {
        state.is_in(self)
    }
}

impl From<ConnectionState> for StateSet {
    fn from(state: ConnectionState) -> Self {
        Self(state.mask())
    }
}

impl BitOr for ConnectionState {
    type Output = StateSet;

    fn bitor(self, rhs: Self) -> StateSet {
        StateSet(self.mask() | rhs.mask())
    }
}

impl BitOr<ConnectionState> for StateSet {
    type Output = Self;

    fn bitor(self, rhs: ConnectionState) -> Self {
        self.with(rhs)
    }
}

/// Shared state register with blocking waits.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(ConnectionState::Unconnected),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Move to `next` if the step is legal from the current state.
    ///
    /// Returns the previous state on success, or the state that blocked the
    /// step. The check and the write happen under the channel's lock, so two
    /// racing callers cannot both win the same step.
    pub fn advance(&self, next: ConnectionState) -> Result<ConnectionState, ConnectionState> {
        let mut outcome = Err(next);
        self.tx.send_if_modified(|state| {
            if state.can_advance_to(next) {
                outcome = Ok(*state);
                *state = next;
                true
            } else {
                outcome = Err(*state);
                false
            }
        });
        if let Ok(previous) = outcome {
            debug!(from = %previous, to = %next, "connection state changed");
        }
        outcome
    }

    /// Force `Terminated`. Idempotent; returns the state it replaced.
    pub fn terminate(&self) -> ConnectionState {
        let previous = self.tx.send_replace(ConnectionState::Terminated);
        if previous != ConnectionState::Terminated {
            debug!(from = %previous, "connection terminated");
        }
        previous
    }

    /// Block until the state is in `accept` or `timeout` elapses.
    ///
    /// Returns whatever state was observed last; a timeout is not an error.
    pub async fn wait_for_state(&self, timeout: Duration, accept: StateSet) -> ConnectionState {
        let mut rx = self.tx.subscribe();
        let reached = match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_in(accept))).await
        {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) | Err(_) => None,
        };
        reached.unwrap_or_else(|| *rx.borrow())
    }
}
