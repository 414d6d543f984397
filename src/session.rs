//! Resilient session over a persistent channel.
//!
//! A [`Session`] owns exactly one live channel at a time and drives it through the
//! [`state`] machine: it resolves the endpoint, presents the bearer token as a subprotocol, runs
//! the [`OpenHook`], dispatches inbound frames to the [`SessionListener`], and reconnects with
//! [`Backoff`] when the channel is lost or the peer rejects the token.
//!
//! Each live channel has one reader task. Events from a released channel carry a stale
//! generation and are ignored, and a close always wins over an in-flight reconnect.

pub mod backoff;
pub mod channel;
pub mod events;
pub mod frame;
pub mod listener;
pub mod state;

mod send;

pub use backoff::*;
pub use channel::*;
pub use events::*;
pub use frame::*;
pub use listener::*;
pub use state::*;

// std
use std::ops::ControlFlow;
// crates.io
use futures::{SinkExt, StreamExt};
use tokio::{
	sync::{Notify, oneshot, watch},
	time::{Instant, Interval},
};
// self
use crate::{
	_prelude::*,
	discovery::{ACTION_WS_API, EVENTS_WS_API},
	error::{ConfigError, SessionError},
	obs::{self, FlowKind},
	token::TokenManager,
};

/// Where a session connects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEndpoint {
	/// Fixed WebSocket URL and optional subprotocol.
	Static {
		/// `ws://` or `wss://` URL.
		url: Url,
		/// Protocol presented ahead of the token subprotocol.
		protocol: Option<String>,
	},
	/// API resolved through capability discovery on first connect.
	Discovered {
		/// API name in the discovery document.
		api: String,
	},
}
impl SessionEndpoint {
	/// Event-stream API resolved through discovery.
	pub fn events() -> Self {
		Self::Discovered { api: EVENTS_WS_API.into() }
	}

	/// Action API resolved through discovery.
	pub fn actions() -> Self {
		Self::Discovered { api: ACTION_WS_API.into() }
	}
}

/// Validation failures raised by [`SessionConfigBuilder::build`].
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum SessionConfigError {
	/// `send_timeout` must be positive.
	#[error("Send timeout must be greater than zero.")]
	ZeroSendTimeout,
	/// `close_timeout` must be positive.
	#[error("Close timeout must be greater than zero.")]
	ZeroCloseTimeout,
	/// `ping_interval` must be positive when set.
	#[error("Ping interval must be greater than zero.")]
	ZeroPingInterval,
	/// `max_message_size` must be positive.
	#[error("Maximum message size must be greater than zero.")]
	ZeroMaxMessageSize,
	/// Close reasons must fit in a control frame.
	#[error("Close reason is {len} bytes; at most {max} are allowed.")]
	CloseReasonTooLong {
		/// Actual length.
		len: usize,
		/// Maximum length.
		max: usize,
	},
	/// Discovered endpoints need an API name.
	#[error("Discovered endpoint requires a non-empty API name.")]
	EmptyApiName,
	/// Static endpoints must use `ws` or `wss`.
	#[error("Endpoint scheme `{scheme}` is not a WebSocket scheme.")]
	InvalidScheme {
		/// Offending scheme.
		scheme: String,
	},
}

/// Validated session configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
	/// Connection target.
	pub endpoint: SessionEndpoint,
	/// Additional write attempts after a failed send.
	pub send_retries: u32,
	/// Bound on a single write.
	pub send_timeout: Duration,
	/// Bound on waiting for the peer's close acknowledgement.
	pub close_timeout: Duration,
	/// Interval between keep-alive pings, if any.
	pub ping_interval: Option<Duration>,
	/// Whether a send that exhausts its retries forces a reconnect.
	pub reconnect_on_failed_send: bool,
	/// Reason sent with the normal-closure frame.
	pub close_reason: String,
	/// Largest reassembled inbound message, in bytes; larger ones are dropped.
	pub max_message_size: usize,
}
impl SessionConfig {
	/// Default cap on a reassembled inbound message (16 MiB).
	pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 << 20;
	const MAX_CLOSE_REASON: usize = 123;

	/// Starts a builder for `endpoint`.
	pub fn builder(endpoint: SessionEndpoint) -> SessionConfigBuilder {
		SessionConfigBuilder {
			config: Self {
				endpoint,
				send_retries: 3,
				send_timeout: Duration::from_secs(10),
				close_timeout: Duration::from_secs(5),
				ping_interval: None,
				reconnect_on_failed_send: true,
				close_reason: "Normal closure".into(),
				max_message_size: Self::DEFAULT_MAX_MESSAGE_SIZE,
			},
		}
	}
}

/// Builder for [`SessionConfig`].
#[derive(Clone, Debug)]
pub struct SessionConfigBuilder {
	config: SessionConfig,
}
impl SessionConfigBuilder {
	/// Overrides the send retry budget.
	pub fn send_retries(mut self, retries: u32) -> Self {
		self.config.send_retries = retries;

		self
	}

	/// Overrides the per-write timeout.
	pub fn send_timeout(mut self, timeout: Duration) -> Self {
		self.config.send_timeout = timeout;

		self
	}

	/// Overrides the close acknowledgement timeout.
	pub fn close_timeout(mut self, timeout: Duration) -> Self {
		self.config.close_timeout = timeout;

		self
	}

	/// Enables periodic keep-alive pings.
	pub fn ping_interval(mut self, interval: Duration) -> Self {
		self.config.ping_interval = Some(interval);

		self
	}

	/// Controls whether exhausted sends force a reconnect.
	pub fn reconnect_on_failed_send(mut self, enabled: bool) -> Self {
		self.config.reconnect_on_failed_send = enabled;

		self
	}

	/// Overrides the close reason.
	pub fn close_reason(mut self, reason: impl Into<String>) -> Self {
		self.config.close_reason = reason.into();

		self
	}

	/// Overrides the inbound message size cap.
	pub fn max_message_size(mut self, bytes: usize) -> Self {
		self.config.max_message_size = bytes;

		self
	}

	/// Validates and returns the configuration.
	pub fn build(self) -> Result<SessionConfig, SessionConfigError> {
		let config = self.config;

		if config.send_timeout.is_zero() {
			return Err(SessionConfigError::ZeroSendTimeout);
		}
		if config.close_timeout.is_zero() {
			return Err(SessionConfigError::ZeroCloseTimeout);
		}
		if config.ping_interval.is_some_and(|interval| interval.is_zero()) {
			return Err(SessionConfigError::ZeroPingInterval);
		}
		if config.max_message_size == 0 {
			return Err(SessionConfigError::ZeroMaxMessageSize);
		}
		if config.close_reason.len() > SessionConfig::MAX_CLOSE_REASON {
			return Err(SessionConfigError::CloseReasonTooLong {
				len: config.close_reason.len(),
				max: SessionConfig::MAX_CLOSE_REASON,
			});
		}

		match &config.endpoint {
			SessionEndpoint::Discovered { api } if api.trim().is_empty() =>
				return Err(SessionConfigError::EmptyApiName),
			SessionEndpoint::Static { url, .. } if !matches!(url.scheme(), "ws" | "wss") =>
				return Err(SessionConfigError::InvalidScheme { scheme: url.scheme().into() }),
			_ => {},
		}

		Ok(config)
	}
}

/// Assembles a [`Session`].
pub struct SessionBuilder {
	config: SessionConfig,
	tokens: Arc<TokenManager>,
	transport: Option<Arc<dyn ChannelTransport>>,
	listener: Option<Arc<dyn SessionListener>>,
	hook: Option<Arc<dyn OpenHook>>,
}
impl SessionBuilder {
	/// Overrides the channel transport.
	pub fn transport(mut self, transport: Arc<dyn ChannelTransport>) -> Self {
		self.transport = Some(transport);

		self
	}

	/// Sets the listener receiving callbacks.
	pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
		self.listener = Some(listener);

		self
	}

	/// Sets the hook run on every freshly opened channel.
	pub fn open_hook(mut self, hook: Arc<dyn OpenHook>) -> Self {
		self.hook = Some(hook);

		self
	}

	/// Builds the session in state [`SessionState::None`].
	pub fn build(self) -> Result<Session> {
		let transport = match self.transport {
			Some(transport) => transport,
			None => default_transport()?,
		};
		let (state_tx, _) = watch::channel(SessionState::None);

		Ok(Session {
			inner: Arc::new(Inner {
				config: self.config,
				tokens: self.tokens,
				transport,
				listener: self.listener.unwrap_or_else(|| Arc::new(NoopListener)),
				hook: self.hook,
				core: Mutex::new(Core::default()),
				state_tx,
				backoff: Mutex::new(Backoff::default()),
				endpoint: RwLock::new(None),
				writer: AsyncMutex::new(None),
				close_ack: Notify::new(),
			}),
		})
	}
}

/// Handle to a resilient session; clones share the same connection.
#[derive(Clone)]
pub struct Session {
	inner: Arc<Inner>,
}
impl Session {
	/// Starts a builder for a session authorized by `tokens`.
	pub fn builder(config: SessionConfig, tokens: Arc<TokenManager>) -> SessionBuilder {
		SessionBuilder { config, tokens, transport: None, listener: None, hook: None }
	}

	/// Current state.
	pub fn state(&self) -> SessionState {
		self.inner.core.lock().state
	}

	/// Receiver observing every state change.
	pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
		self.inner.state_tx.subscribe()
	}

	/// Configuration in effect.
	pub fn config(&self) -> &SessionConfig {
		&self.inner.config
	}

	/// Token manager authorizing this session.
	pub fn tokens(&self) -> &Arc<TokenManager> {
		&self.inner.tokens
	}

	/// Opens the first channel.
	///
	/// Valid from [`SessionState::None`] and, for manual retries, [`SessionState::Failed`]. The
	/// backoff position is preserved across retries.
	pub async fn start(&self) -> Result<()> {
		let state = self.state();

		if self.apply(SessionEvent::Start, None).is_none() {
			return Err(SessionError::InvalidState { operation: "start", state }.into());
		}

		self.connect().await
	}

	/// Closes the session with a normal-closure frame. Repeat calls are no-ops.
	pub async fn close(&self) -> Result<()> {
		let Some(applied) = self.apply(SessionEvent::CloseRequested, None) else {
			return Ok(());
		};
		let performed = self.perform(&applied.effects, Trigger::default()).await.unwrap_or_default();

		if performed.close_sent
			&& tokio::time::timeout(self.inner.config.close_timeout, self.inner.close_ack.notified())
				.await
				.is_err()
		{
			tracing::debug!("peer did not acknowledge close in time");
		}

		let reason = CloseReason::normal(self.inner.config.close_reason.clone());

		if let Some(applied) = self.apply(SessionEvent::CloseCompleted, None) {
			let trigger = Trigger { close: Some(&reason), ..Default::default() };
			let _ = self.perform(&applied.effects, trigger).await;
		}

		Ok(())
	}

	fn apply(&self, event: SessionEvent, channel: Option<u64>) -> Option<Applied> {
		let mut core = self.inner.core.lock();

		if let Some(generation) = channel
			&& core.live != Some(generation)
		{
			tracing::trace!(generation, ?event, "ignoring event from released channel");

			return None;
		}

		let from = core.state;
		let Some(transition) = transition(from, event) else {
			tracing::debug!(state = %from, ?event, "event ignored in current state");

			return None;
		};

		if event == SessionEvent::Opened {
			core.generation += 1;
			core.live = Some(core.generation);
		}

		core.state = transition.next;
		self.inner.state_tx.send_replace(transition.next);

		if from != transition.next {
			tracing::info!(from = %from, to = %transition.next, ?event, "session transition");
		}

		Some(Applied { effects: transition.effects, generation: core.generation })
	}

	async fn perform(
		&self,
		effects: &[Effect],
		trigger: Trigger<'_>,
	) -> Result<Performed, (SessionEvent, Error)> {
		let mut performed = Performed::default();

		for effect in effects {
			match effect {
				Effect::NotifyOpen => self.inner.listener.on_open(self),
				Effect::DeliverMessage =>
					if let Some(message) = trigger.message {
						self.inner
							.listener
							.on_message(self, message)
							.await
							.map_err(|e| (SessionEvent::ListenerFailed, e))?;
					},
				Effect::ResetBackoff => self.inner.backoff.lock().reset(),
				Effect::ReportError =>
					if let Some(error) = trigger.error {
						self.inner.listener.on_error(self, error);
					},
				Effect::RefreshToken =>
					self.refresh_after_rejection().await.map_err(|e| (SessionEvent::OpenFailed, e))?,
				Effect::Reconnect => performed.reconnect = true,
				Effect::ReleaseChannel => self.release_channel().await,
				Effect::SendCloseFrame => performed.close_sent = self.send_close_frame().await,
				Effect::NotifyClose => self.inner.listener.on_close(self, trigger.close),
			}
		}

		Ok(performed)
	}

	/// Performs `effects`, escalating failures and reconnecting when requested.
	async fn run(&self, effects: Vec<Effect>, trigger: Trigger<'_>, channel: Option<u64>) {
		match self.perform(&effects, trigger).await {
			Ok(performed) if performed.reconnect => {
				let _ = self.connect().await;
			},
			Ok(_) => {},
			Err((event, error)) => {
				let channel = (event == SessionEvent::ListenerFailed).then_some(channel).flatten();

				if let Some(applied) = self.apply(event, channel) {
					let trigger = Trigger { error: Some(&error), ..Default::default() };
					let _ = self.perform(&applied.effects, trigger).await;
				}
			},
		}
	}

	async fn connect(&self) -> Result<()> {
		let delay = self.inner.backoff.lock().next_delay();

		if !delay.is_zero() {
			tracing::info!(delay_secs = delay.as_secs(), "waiting before connection attempt");

			let mut states = self.inner.state_tx.subscribe();

			tokio::select! {
				_ = tokio::time::sleep(delay) => {},
				_ = states.wait_for(|state| state.is_closing()) =>
					return Err(SessionError::Closed.into()),
			}
		}

		match obs::observe(FlowKind::Connect, "open_channel", self.open_channel()).await {
			Ok(channel) => self.install(channel).await,
			Err(e) => {
				if let Some(applied) = self.apply(SessionEvent::OpenFailed, None) {
					let trigger = Trigger { error: Some(&e), ..Default::default() };
					let _ = self.perform(&applied.effects, trigger).await;
				}

				Err(e)
			},
		}
	}

	async fn open_channel(&self) -> Result<Channel> {
		let (url, protocol) = self.endpoint().await?;
		let token = self.inner.tokens.get_token().await?;
		let mut protocols = Vec::with_capacity(2);

		if let Some(protocol) = protocol {
			protocols.push(protocol);
		}

		protocols.push(format!("token-{}", token.expose()));

		let mut channel = self.inner.transport.open(&url, &protocols).await?;

		if let Some(hook) = &self.inner.hook {
			hook.on_open(HookChannel::new(&mut channel.sink, self.inner.config.send_timeout))
				.await
				.map_err(|e| SessionError::OpenHook { reason: e.to_string() })?;
		}

		Ok(channel)
	}

	async fn install(&self, channel: Channel) -> Result<()> {
		let Channel { mut sink, stream } = channel;
		let mut writer = self.inner.writer.lock().await;
		let Some(applied) = self.apply(SessionEvent::Opened, None) else {
			drop(writer);

			tracing::debug!("channel opened after close; tearing it down");

			let _ = tokio::time::timeout(self.inner.config.close_timeout, sink.close()).await;

			return Err(SessionError::Closed.into());
		};
		let (stop_tx, stop_rx) = oneshot::channel();

		*writer = Some(Writer { generation: applied.generation, sink, _stop: stop_tx });

		drop(writer);

		let _ = self.perform(&applied.effects, Trigger::default()).await;

		self.spawn_reader(stream, applied.generation, stop_rx);

		Ok(())
	}

	async fn endpoint(&self) -> Result<(Url, Option<String>)> {
		if let Some(cached) = self.inner.endpoint.read().clone() {
			return Ok(cached);
		}

		let resolved = match &self.inner.config.endpoint {
			SessionEndpoint::Static { url, protocol } => (url.clone(), protocol.clone()),
			SessionEndpoint::Discovered { api } => {
				let discovery =
					self.inner.tokens.discovery().ok_or(ConfigError::MissingApiRoot)?.clone();

				discovery.ws_url(api).await?
			},
		};

		*self.inner.endpoint.write() = Some(resolved.clone());

		Ok(resolved)
	}

	async fn refresh_after_rejection(&self) -> Result<()> {
		match self.inner.tokens.refresh_token().await {
			Ok(_) => Ok(()),
			Err(Error::NotSupported { reason }) => {
				tracing::warn!(%reason, "token cannot be refreshed; reconnecting with the current one");

				Ok(())
			},
			Err(e) => Err(e),
		}
	}

	async fn release_channel(&self) {
		let released = self.inner.writer.lock().await.take();

		self.inner.core.lock().live = None;

		if let Some(writer) = released {
			tracing::debug!(generation = writer.generation, "channel released");
		}
	}

	async fn send_close_frame(&self) -> bool {
		let mut writer = self.inner.writer.lock().await;
		let Some(writer) = writer.as_mut() else {
			return false;
		};
		let frame = Frame::Close(Some(CloseReason::normal(self.inner.config.close_reason.clone())));

		match tokio::time::timeout(self.inner.config.close_timeout, writer.sink.send(frame)).await {
			Ok(Ok(())) => true,
			Ok(Err(e)) => {
				tracing::debug!(error = %e, "close frame could not be sent");

				false
			},
			Err(_) => false,
		}
	}

	/// Sends a control frame on channel `generation`, ignoring failures.
	async fn write_control(&self, generation: u64, frame: Frame) {
		let mut writer = self.inner.writer.lock().await;

		if let Some(writer) = writer.as_mut().filter(|writer| writer.generation == generation)
			&& let Err(e) =
				tokio::time::timeout(self.inner.config.send_timeout, writer.sink.send(frame)).await
		{
			tracing::debug!(error = %e, "control frame timed out");
		}
	}

	fn spawn_reader(&self, stream: FrameStream, generation: u64, stop: oneshot::Receiver<()>) {
		let session = self.clone();
		let task: Pin<Box<dyn Future<Output = ()> + Send>> =
			Box::pin(async move { session.read_loop(stream, generation, stop).await });

		tokio::spawn(task);
	}

	fn spawn_restart(&self, generation: u64) {
		let session = self.clone();
		let task: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
			session.fail_channel(generation, SessionEvent::TransportFailed, None).await
		});

		tokio::spawn(task);
	}

	async fn fail_channel(&self, generation: u64, event: SessionEvent, error: Option<Error>) {
		let Some(applied) = self.apply(event, Some(generation)) else {
			return;
		};

		if let Some(error) = &error {
			tracing::warn!(generation, %error, "channel failed");
		}

		let trigger = Trigger { error: error.as_ref(), ..Default::default() };

		self.run(applied.effects, trigger, Some(generation)).await;
	}

	async fn read_loop(
		self,
		mut stream: FrameStream,
		generation: u64,
		mut stop: oneshot::Receiver<()>,
	) {
		let mut reassembler = Reassembler::new(self.inner.config.max_message_size);
		let mut keepalive = self
			.inner
			.config
			.ping_interval
			.map(|every| tokio::time::interval_at(Instant::now() + every, every));

		loop {
			let frame = tokio::select! {
				_ = &mut stop => return,
				_ = tick(&mut keepalive) => {
					self.write_control(generation, Frame::Ping(Vec::new())).await;

					continue;
				},
				frame = stream.next() => frame,
			};
			let (event, error) = match frame {
				Some(Ok(Frame::Text { data, last })) => {
					let Some(text) = reassembler.push(&data, last) else {
						continue;
					};

					match self.handle_text(&text, generation).await {
						ControlFlow::Continue(()) => continue,
						ControlFlow::Break(()) => return,
					}
				},
				Some(Ok(Frame::Ping(payload))) => {
					self.write_control(generation, Frame::Pong(payload)).await;

					continue;
				},
				Some(Ok(Frame::Pong(_))) => continue,
				Some(Ok(Frame::Binary(data))) => {
					tracing::warn!(len = data.len(), "dropping binary frame");

					continue;
				},
				Some(Ok(Frame::Close(reason))) => {
					tracing::debug!(generation, ?reason, "peer closed channel");

					(SessionEvent::PeerClosed, None)
				},
				Some(Err(e)) => (SessionEvent::TransportFailed, Some(Error::from(e))),
				None => (SessionEvent::PeerClosed, None),
			};

			if self.state() == SessionState::Closing {
				self.inner.close_ack.notify_one();

				return;
			}

			self.fail_channel(generation, event, error).await;

			return;
		}
	}

	async fn handle_text(&self, text: &str, generation: u64) -> ControlFlow<()> {
		match classify(text) {
			Inbound::Malformed(reason) => {
				tracing::warn!(%reason, "dropping malformed frame");

				return ControlFlow::Continue(());
			},
			Inbound::Data => {
				let Some(applied) = self.apply(SessionEvent::DataFrame, Some(generation)) else {
					return ControlFlow::Continue(());
				};
				let trigger = Trigger { message: Some(text), ..Default::default() };

				self.run(applied.effects, trigger, Some(generation)).await;
			},
			Inbound::Error { code, message } => {
				let error = match code {
					401 => Error::Unauthorized { reason: message },
					code => Error::Remote { code, message },
				};
				let event = SessionEvent::RemoteError { code };
				let Some(applied) = self.apply(event, Some(generation)) else {
					return ControlFlow::Continue(());
				};
				let trigger = Trigger { error: Some(&error), ..Default::default() };

				self.run(applied.effects, trigger, Some(generation)).await;
			},
		}

		if self.inner.core.lock().live == Some(generation) {
			ControlFlow::Continue(())
		} else {
			ControlFlow::Break(())
		}
	}
}
impl Debug for Session {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Session")
			.field("state", &self.state())
			.field("endpoint", &self.inner.config.endpoint)
			.finish()
	}
}

struct Inner {
	config: SessionConfig,
	tokens: Arc<TokenManager>,
	transport: Arc<dyn ChannelTransport>,
	listener: Arc<dyn SessionListener>,
	hook: Option<Arc<dyn OpenHook>>,
	core: Mutex<Core>,
	state_tx: watch::Sender<SessionState>,
	backoff: Mutex<Backoff>,
	endpoint: RwLock<Option<(Url, Option<String>)>>,
	writer: AsyncMutex<Option<Writer>>,
	close_ack: Notify,
}

#[derive(Debug, Default)]
struct Core {
	state: SessionState,
	generation: u64,
	live: Option<u64>,
}

struct Writer {
	generation: u64,
	sink: FrameSink,
	// Dropping the writer stops the channel's reader task.
	_stop: oneshot::Sender<()>,
}

struct Applied {
	effects: Vec<Effect>,
	generation: u64,
}

#[derive(Default)]
struct Trigger<'a> {
	error: Option<&'a Error>,
	message: Option<&'a str>,
	close: Option<&'a CloseReason>,
}

#[derive(Debug, Default)]
struct Performed {
	reconnect: bool,
	close_sent: bool,
}

#[cfg(feature = "tokio-tungstenite")]
fn default_transport() -> Result<Arc<dyn ChannelTransport>> {
	Ok(Arc::new(TungsteniteTransport))
}

#[cfg(not(feature = "tokio-tungstenite"))]
fn default_transport() -> Result<Arc<dyn ChannelTransport>> {
	Err(ConfigError::MissingTransport.into())
}

async fn tick(keepalive: &mut Option<Interval>) {
	match keepalive {
		Some(interval) => {
			interval.tick().await;
		},
		None => std::future::pending().await,
	}
}
