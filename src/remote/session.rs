//! Explicit state machine for one remote execution session.

use super::RemoteError;

/// States a remote session moves through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Transport handshake in progress.
    Connecting,
    /// Authenticated and idle.
    Ready,
    /// Script file transfer in progress.
    Uploading,
    /// Remote command dispatched, no output seen yet.
    Executing,
    /// Remote output is being forwarded.
    Streaming,
    /// Remote process finished or the session failed.
    Closed,
}

/// Events that drive [`SessionState`] transitions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    /// Transport handshake completed.
    Connected,
    /// Script upload started.
    UploadStarted,
    /// Remote command dispatched.
    ExecDispatched,
    /// A stdout or stderr chunk arrived.
    OutputReceived,
    /// The remote process reported its exit.
    StreamClosed,
    /// Any step failed.
    Failed,
}

/// Returns the state reached by applying `event` in `state`, or `None` when
/// the transition is not allowed.
#[must_use]
pub const fn next_state(state: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Connecting, E::Connected) => Some(S::Ready),
        (S::Ready, E::UploadStarted) => Some(S::Uploading),
        (S::Ready | S::Uploading, E::ExecDispatched) => Some(S::Executing),
        (S::Executing | S::Streaming, E::OutputReceived) => Some(S::Streaming),
        (S::Executing | S::Streaming, E::StreamClosed) => Some(S::Closed),
        (S::Closed, _) => None,
        (_, E::Failed) => Some(S::Closed),
        _ => None,
    }
}

/// Tracks the current state and the path taken through the machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionMachine {
    state: SessionState,
    trace: Vec<SessionState>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    /// Starts a machine in [`SessionState::Connecting`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            trace: vec![SessionState::Connecting],
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Every state visited, starting with `Connecting`. Repeated `Streaming`
    /// entries are collapsed.
    #[must_use]
    pub fn trace(&self) -> &[SessionState] {
        &self.trace
    }

    /// Applies `event`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidTransition`] when the table has no
    /// entry for the current state and event.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState, RemoteError> {
        let next = next_state(self.state, event).ok_or(RemoteError::InvalidTransition {
            from: self.state,
            event,
        })?;
        if next != self.state {
            self.trace.push(next);
        }
        self.state = next;
        Ok(next)
    }
}
