//! Pure session state machine.
//!
//! [`transition`] maps `(state, event)` to the next state plus the ordered side effects the
//! connection driver must perform. It never touches I/O, so every edge can be tested directly.

// self
use crate::_prelude::*;

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
	/// Created, never started.
	#[default]
	None,
	/// First connection attempt in progress.
	Starting,
	/// Channel open, no data frame seen yet.
	RunningPreliminary,
	/// At least one valid data frame processed on the live channel.
	Running,
	/// Channel lost; reconnecting.
	Restarting,
	/// Close requested; waiting for the peer's acknowledgement.
	Closing,
	/// Connection attempt failed; may be started again.
	Failed,
	/// Terminal.
	Closed,
}
impl SessionState {
	/// Returns a stable label suitable for log fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			SessionState::None => "NONE",
			SessionState::Starting => "STARTING",
			SessionState::RunningPreliminary => "RUNNING_PRELIMINARY",
			SessionState::Running => "RUNNING",
			SessionState::Restarting => "RESTARTING",
			SessionState::Closing => "CLOSING",
			SessionState::Failed => "FAILED",
			SessionState::Closed => "CLOSED",
		}
	}

	/// Returns `true` while a channel is open and usable.
	pub const fn is_running(self) -> bool {
		matches!(self, SessionState::RunningPreliminary | SessionState::Running)
	}

	/// Returns `true` once a close has been requested.
	pub const fn is_closing(self) -> bool {
		matches!(self, SessionState::Closing | SessionState::Closed)
	}
}
impl Display for SessionState {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Inputs driving the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
	/// Caller invoked `start`.
	Start,
	/// Channel opened and the open hook succeeded.
	Opened,
	/// Channel open, token lookup, or open hook failed.
	OpenFailed,
	/// A valid data frame arrived.
	DataFrame,
	/// A frame carried an embedded error code.
	RemoteError {
		/// Embedded status code.
		code: u16,
	},
	/// The peer closed the channel.
	PeerClosed,
	/// Reading or writing the channel failed.
	TransportFailed,
	/// The listener rejected a message.
	ListenerFailed,
	/// Caller invoked `close`.
	CloseRequested,
	/// Close handshake finished or timed out.
	CloseCompleted,
}

/// Side effects emitted by a transition, performed in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
	/// Invoke `on_open`.
	NotifyOpen,
	/// Hand the frame to `on_message`.
	DeliverMessage,
	/// Rewind the backoff calculator.
	ResetBackoff,
	/// Invoke `on_error` with the triggering error.
	ReportError,
	/// Force a token refresh.
	RefreshToken,
	/// Open a new channel after the next backoff delay.
	Reconnect,
	/// Drop the live channel.
	ReleaseChannel,
	/// Send a normal-closure frame.
	SendCloseFrame,
	/// Invoke `on_close`.
	NotifyClose,
}

/// Result of a valid transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
	/// State after the event.
	pub next: SessionState,
	/// Effects to perform, in order.
	pub effects: Vec<Effect>,
}
impl Transition {
	fn to(next: SessionState, effects: impl Into<Vec<Effect>>) -> Option<Self> {
		Some(Self { next, effects: effects.into() })
	}
}

/// Computes the transition for `event` in `state`, or `None` when the event is ignored.
pub fn transition(state: SessionState, event: SessionEvent) -> Option<Transition> {
	use {Effect::*, SessionEvent as E, SessionState as S};

	match (state, event) {
		(S::None | S::Failed, E::Start) => Transition::to(S::Starting, Vec::new()),
		(S::Starting | S::Restarting, E::Opened) => Transition::to(S::RunningPreliminary, [NotifyOpen]),
		(S::Starting | S::Restarting, E::OpenFailed) =>
			Transition::to(S::Failed, [ReleaseChannel, ReportError]),
		(S::RunningPreliminary | S::Running, E::DataFrame) =>
			Transition::to(S::Running, [DeliverMessage, ResetBackoff]),
		(S::Running, E::RemoteError { code: 401 }) =>
			Transition::to(S::Restarting, [ReleaseChannel, RefreshToken, Reconnect]),
		(S::RunningPreliminary, E::RemoteError { code: 401 }) =>
			Transition::to(S::Failed, [ReleaseChannel, ReportError]),
		(S::RunningPreliminary | S::Running, E::RemoteError { .. }) =>
			Transition::to(state, [ReportError]),
		(
			S::Starting | S::RunningPreliminary | S::Running,
			E::PeerClosed | E::TransportFailed,
		) => Transition::to(S::Restarting, [ReleaseChannel, Reconnect]),
		(S::RunningPreliminary | S::Running, E::ListenerFailed) =>
			Transition::to(S::Failed, [ReleaseChannel, ReportError]),
		(state, E::CloseRequested) if !state.is_closing() =>
			Transition::to(S::Closing, [SendCloseFrame]),
		(S::Closing, E::CloseCompleted) => Transition::to(S::Closed, [ReleaseChannel, NotifyClose]),
		_ => None,
	}
}
