//! Callbacks a session delivers to the application.

// crates.io
use futures::SinkExt;
// self
use crate::{
	_prelude::*,
	session::{CloseReason, Frame, FrameSink, Session},
};

/// Boxed future returned by [`SessionListener::on_message`].
pub type ListenerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a + Send>>;
/// Boxed future returned by [`OpenHook::on_open`].
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a + Send>>;

/// Receives session lifecycle callbacks.
///
/// Messages are delivered strictly serially from the channel's reader task. Returning an error
/// from [`on_message`](Self::on_message) is fatal to the connection.
pub trait SessionListener
where
	Self: 'static + Send + Sync,
{
	/// A channel opened (initially or after a reconnect).
	fn on_open(&self, _session: &Session) {}

	/// A complete data message arrived.
	fn on_message<'a>(&'a self, session: &'a Session, message: &'a str) -> ListenerFuture<'a>;

	/// The session closed.
	fn on_close(&self, _session: &Session, _reason: Option<&CloseReason>) {}

	/// An error was observed (open failure, remote error, listener failure).
	fn on_error(&self, _session: &Session, error: &Error) {
		tracing::warn!(%error, "session error");
	}
}

/// Listener that ignores every message.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;
impl SessionListener for NoopListener {
	fn on_message<'a>(&'a self, _session: &'a Session, _message: &'a str) -> ListenerFuture<'a> {
		Box::pin(async { Ok(()) })
	}
}

/// Runs on every freshly opened channel before the session advances; a failure marks the
/// session FAILED without retrying.
pub trait OpenHook
where
	Self: 'static + Send + Sync,
{
	/// Prepares the channel, for example by registering subscriptions.
	fn on_open<'a>(&'a self, channel: HookChannel<'a>) -> HookFuture<'a>;
}

/// Write access to a channel that is not yet published to the session.
pub struct HookChannel<'a> {
	sink: &'a mut FrameSink,
	timeout: Duration,
}
impl<'a> HookChannel<'a> {
	pub(crate) fn new(sink: &'a mut FrameSink, timeout: Duration) -> Self {
		Self { sink, timeout }
	}

	/// Sends a text message, bounded by the session's send timeout.
	pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
		tokio::time::timeout(self.timeout, self.sink.send(Frame::text(text)))
			.await
			.map_err(|_| Error::Timeout { operation: "open hook send" })?
			.map_err(Error::from)
	}

	/// Serializes `value` and sends it as a text message.
	pub async fn send_json(&mut self, value: &Value) -> Result<()> {
		self.send_text(value.to_string()).await
	}
}
impl Debug for HookChannel<'_> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("HookChannel").field("timeout", &self.timeout).finish()
	}
}
