//! Resilient, token-aware HIRO sessions: single-flight credential lifecycle, self-healing
//! WebSocket reconnects, and at-most-once action dispatch in one crate.

#![deny(clippy::all)]
#![warn(missing_docs, unused_crate_dependencies)]

pub mod action;
pub mod auth;
pub mod discovery;
pub mod error;
pub mod http;
pub mod obs;
pub mod provider;
pub mod session;
pub mod store;
pub mod token;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// crates.io
	use futures::{
		SinkExt,
		channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
	};
	use tokio::sync::mpsc as tokio_mpsc;
	// self
	use crate::{
		auth::{Credential, TokenSecret},
		error::TransportError,
		provider::{ExchangeContext, SourceFuture, SourceKind, TokenSource},
		session::{
			Channel, ChannelFuture, ChannelTransport, CloseReason, Frame, Session, SessionListener,
			SessionState,
		},
		token::{TokenManager, TokenManagerConfig},
	};

	/// Upper bound used by the polling helpers before a test gives up.
	pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

	/// Polls `condition` until it holds or [`WAIT_LIMIT`] elapses.
	pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
		let deadline = tokio::time::Instant::now() + WAIT_LIMIT;

		while tokio::time::Instant::now() < deadline {
			if condition() {
				return true;
			}

			tokio::time::sleep(Duration::from_millis(5)).await;
		}

		condition()
	}

	/// Waits until the session reports `state`.
	pub async fn wait_for_state(session: &Session, state: SessionState) -> bool {
		wait_until(|| session.state() == state).await
	}

	/// Token source that mints sequential tokens (`token-1`, `token-2`, ...) and counts
	/// acquisitions.
	#[derive(Debug, Default)]
	pub struct CountingSource {
		acquisitions: AtomicUsize,
		delay: Duration,
	}
	impl CountingSource {
		/// Creates a source whose acquisitions take `delay` to complete.
		pub fn with_delay(delay: Duration) -> Self {
			Self { acquisitions: AtomicUsize::new(0), delay }
		}

		/// Number of acquisitions performed so far.
		pub fn acquisitions(&self) -> usize {
			self.acquisitions.load(Ordering::SeqCst)
		}
	}
	impl TokenSource for CountingSource {
		fn kind(&self) -> SourceKind {
			SourceKind::PasswordGrant
		}

		fn acquire<'a>(&'a self, ctx: &'a ExchangeContext) -> SourceFuture<'a, Credential> {
			Box::pin(async move {
				if !self.delay.is_zero() {
					tokio::time::sleep(self.delay).await;
				}

				let n = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;

				Credential::builder()
					.access_token(format!("token-{n}"))
					.expires_in(Duration::from_secs(3_600))
					.refresh_offset(ctx.refresh_offset())
					.build()
					.map_err(|e| crate::error::ConfigError::from(e).into())
			})
		}
	}

	/// Builds a manager over a fresh [`CountingSource`] without any HTTP backing.
	pub fn counting_manager() -> (Arc<TokenManager>, Arc<CountingSource>) {
		let source = Arc::new(CountingSource::default());
		let manager = TokenManager::with_transport(
			source.clone(),
			TokenManagerConfig::default(),
			Arc::new(UnreachableHttp),
		);

		(Arc::new(manager), source)
	}

	/// HTTP transport that fails every request; used where no exchange is expected.
	#[derive(Clone, Copy, Debug, Default)]
	pub struct UnreachableHttp;
	impl crate::http::HttpTransport for UnreachableHttp {
		fn execute(&self, request: crate::http::HttpRequest) -> crate::http::HttpFuture<'_> {
			Box::pin(async move {
				Err(TransportError::Status {
					status: 503,
					body: format!("No HTTP backend for {}.", request.url),
				}
				.into())
			})
		}
	}

	/// Server side of an in-memory channel opened through [`FakeChannelTransport`].
	#[derive(Debug)]
	pub struct FakePeer {
		/// URL the client connected to.
		pub url: Url,
		/// Subprotocols the client presented.
		pub protocols: Vec<String>,
		outbound: UnboundedReceiver<Frame>,
		inbound: UnboundedSender<Result<Frame, TransportError>>,
	}
	impl FakePeer {
		/// Pushes a text frame to the client.
		pub fn send_text(&self, text: impl Into<String>) {
			let _ = self.inbound.unbounded_send(Ok(Frame::text(text)));
		}

		/// Pushes an arbitrary frame to the client.
		pub fn send_frame(&self, frame: Frame) {
			let _ = self.inbound.unbounded_send(Ok(frame));
		}

		/// Answers a client close with a close frame and hangs up.
		pub fn close(&self) {
			let _ = self.inbound.unbounded_send(Ok(Frame::Close(Some(CloseReason::normal("bye")))));

			self.inbound.close_channel();
		}

		/// Simulates a network failure on the read side.
		pub fn fail(&self) {
			let _ = self.inbound.unbounded_send(Err(TransportError::Io(std::io::Error::new(
				std::io::ErrorKind::ConnectionReset,
				"Connection reset by fake peer.",
			))));
		}

		/// Stops accepting frames from the client, making its writes fail.
		pub fn stop_reading(&mut self) {
			self.outbound.close();
		}

		/// Waits for the next frame the client sent.
		pub async fn next_frame(&mut self) -> Option<Frame> {
			use futures::StreamExt;

			tokio::time::timeout(WAIT_LIMIT, self.outbound.next()).await.ok().flatten()
		}

		/// Waits for the next text frame the client sent, skipping control frames.
		pub async fn next_text(&mut self) -> Option<String> {
			loop {
				match self.next_frame().await? {
					Frame::Text { data, .. } => return Some(data),
					Frame::Close(_) => return None,
					_ => continue,
				}
			}
		}

		/// Drains every frame already sent by the client without waiting.
		pub fn drain(&mut self) -> Vec<Frame> {
			let mut frames = Vec::new();

			while let Ok(Some(frame)) = self.outbound.try_next() {
				frames.push(frame);
			}

			frames
		}
	}

	/// In-memory [`ChannelTransport`] handing each opened channel to the test as a [`FakePeer`].
	#[derive(Debug)]
	pub struct FakeChannelTransport {
		peers_tx: tokio_mpsc::UnboundedSender<FakePeer>,
		peers_rx: AsyncMutex<tokio_mpsc::UnboundedReceiver<FakePeer>>,
		failures: AtomicUsize,
		opens: AtomicUsize,
	}
	impl FakeChannelTransport {
		/// Creates a transport with no queued failures.
		pub fn new() -> Arc<Self> {
			let (peers_tx, peers_rx) = tokio_mpsc::unbounded_channel();

			Arc::new(Self {
				peers_tx,
				peers_rx: AsyncMutex::new(peers_rx),
				failures: AtomicUsize::new(0),
				opens: AtomicUsize::new(0),
			})
		}

		/// Makes the next `count` open attempts fail.
		pub fn fail_next_opens(&self, count: usize) {
			self.failures.store(count, Ordering::SeqCst);
		}

		/// Number of open attempts observed, successful or not.
		pub fn opens(&self) -> usize {
			self.opens.load(Ordering::SeqCst)
		}

		/// Waits for the next successfully opened channel.
		pub async fn next_peer(&self) -> Option<FakePeer> {
			self.next_peer_within(WAIT_LIMIT).await
		}

		/// Waits up to `limit` for the next successfully opened channel.
		pub async fn next_peer_within(&self, limit: Duration) -> Option<FakePeer> {
			let mut rx = self.peers_rx.lock().await;

			tokio::time::timeout(limit, rx.recv()).await.ok().flatten()
		}
	}
	impl ChannelTransport for FakeChannelTransport {
		fn open<'a>(&'a self, url: &'a Url, protocols: &'a [String]) -> ChannelFuture<'a> {
			Box::pin(async move {
				self.opens.fetch_add(1, Ordering::SeqCst);

				let pending = self.failures.load(Ordering::SeqCst);

				if pending > 0 {
					self.failures.store(pending - 1, Ordering::SeqCst);

					return Err(TransportError::Status {
						status: 503,
						body: "Channel refused.".into(),
					}
					.into());
				}

				let (client_tx, outbound) = mpsc::unbounded::<Frame>();
				let (inbound, client_rx) = mpsc::unbounded::<Result<Frame, TransportError>>();
				let peer =
					FakePeer { url: url.clone(), protocols: protocols.to_vec(), outbound, inbound };
				let _ = self.peers_tx.send(peer);

				Ok(Channel {
					sink: Box::pin(client_tx.sink_err_into::<TransportError>()),
					stream: Box::pin(client_rx),
				})
			})
		}
	}

	/// Listener callback observed by [`RecordingListener`].
	#[derive(Clone, Debug, PartialEq, Eq)]
	pub enum ListenerEvent {
		/// `on_open` fired.
		Open,
		/// `on_message` fired with the payload.
		Message(String),
		/// `on_close` fired.
		Close,
		/// `on_error` fired with the rendered error.
		Error(String),
	}

	/// Listener that records every callback and optionally fails on a given payload.
	#[derive(Debug, Default)]
	pub struct RecordingListener {
		events: Mutex<Vec<ListenerEvent>>,
		fail_on: Mutex<Option<String>>,
	}
	impl RecordingListener {
		/// Creates an empty recorder.
		pub fn new() -> Arc<Self> {
			Arc::new(Self::default())
		}

		/// Makes `on_message` fail when it receives exactly `payload`.
		pub fn fail_on(&self, payload: impl Into<String>) {
			*self.fail_on.lock() = Some(payload.into());
		}

		/// Snapshot of all callbacks so far.
		pub fn events(&self) -> Vec<ListenerEvent> {
			self.events.lock().clone()
		}

		/// Payloads delivered through `on_message`.
		pub fn messages(&self) -> Vec<String> {
			self.events()
				.into_iter()
				.filter_map(|event| match event {
					ListenerEvent::Message(payload) => Some(payload),
					_ => None,
				})
				.collect()
		}

		/// Rendered errors delivered through `on_error`.
		pub fn errors(&self) -> Vec<String> {
			self.events()
				.into_iter()
				.filter_map(|event| match event {
					ListenerEvent::Error(message) => Some(message),
					_ => None,
				})
				.collect()
		}

		/// Number of times `event` was recorded.
		pub fn count(&self, event: &ListenerEvent) -> usize {
			self.events.lock().iter().filter(|seen| *seen == event).count()
		}
	}
	impl SessionListener for RecordingListener {
		fn on_open(&self, _session: &Session) {
			self.events.lock().push(ListenerEvent::Open);
		}

		fn on_message<'a>(
			&'a self,
			_session: &'a Session,
			message: &'a str,
		) -> crate::session::ListenerFuture<'a> {
			Box::pin(async move {
				self.events.lock().push(ListenerEvent::Message(message.to_owned()));

				if self.fail_on.lock().as_deref() == Some(message) {
					return Err(Error::Protocol { reason: format!("Listener rejected {message}.") });
				}

				Ok(())
			})
		}

		fn on_close(&self, _session: &Session, _reason: Option<&CloseReason>) {
			self.events.lock().push(ListenerEvent::Close);
		}

		fn on_error(&self, _session: &Session, error: &Error) {
			self.events.lock().push(ListenerEvent::Error(error.to_string()));
		}
	}

	/// Redacted token helper for assertions.
	pub fn secret(value: &str) -> TokenSecret {
		TokenSecret::new(value)
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
		time::Duration,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use serde_json::Value;
	pub use thiserror::Error as ThisError;
	pub use time::OffsetDateTime;
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
#[cfg(feature = "tokio-tungstenite")] pub use tokio_tungstenite;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};
