//! Persistent bidirectional channel abstraction and the default WebSocket adapter.

// crates.io
use futures::{Sink, Stream};
// self
use crate::{_prelude::*, error::TransportError};

/// Close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Outbound half of a channel.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
/// Inbound half of a channel.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;
/// Boxed future returned by [`ChannelTransport::open`].
pub type ChannelFuture<'a> = Pin<Box<dyn Future<Output = Result<Channel>> + 'a + Send>>;

/// Frames exchanged over a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
	/// Text payload; `last == false` marks a partial frame to be continued.
	Text {
		/// UTF-8 payload.
		data: String,
		/// Whether this fragment completes the message.
		last: bool,
	},
	/// Binary payload (not part of the protocol; dropped on receipt).
	Binary(Vec<u8>),
	/// Keep-alive probe; adapters that answer pings themselves never yield it inbound.
	Ping(Vec<u8>),
	/// Keep-alive answer.
	Pong(Vec<u8>),
	/// Close handshake frame.
	Close(Option<CloseReason>),
}
impl Frame {
	/// Complete text frame.
	pub fn text(data: impl Into<String>) -> Self {
		Self::Text { data: data.into(), last: true }
	}
}

/// Close code plus human-readable reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
	/// Close code.
	pub code: u16,
	/// Reason text.
	pub reason: String,
}
impl CloseReason {
	/// Normal closure (1000) with `reason`.
	pub fn normal(reason: impl Into<String>) -> Self {
		Self { code: NORMAL_CLOSURE, reason: reason.into() }
	}
}

/// An opened channel split into its halves.
pub struct Channel {
	/// Outbound frames.
	pub sink: FrameSink,
	/// Inbound frames.
	pub stream: FrameStream,
}
impl Debug for Channel {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("Channel(..)")
	}
}

/// Capability to open persistent channels.
pub trait ChannelTransport
where
	Self: 'static + Send + Sync,
{
	/// Opens a channel to `url`, presenting `protocols` as subprotocols.
	fn open<'a>(&'a self, url: &'a Url, protocols: &'a [String]) -> ChannelFuture<'a>;
}

#[cfg(feature = "tokio-tungstenite")]
pub use tungstenite_transport::TungsteniteTransport;

#[cfg(feature = "tokio-tungstenite")]
mod tungstenite_transport {
	// crates.io
	use futures::{SinkExt, StreamExt, future};
	use tokio_tungstenite::tungstenite::{
		Message,
		client::IntoClientRequest,
		http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
		protocol::{CloseFrame, frame::coding::CloseCode},
	};
	// self
	use super::*;
	use crate::error::ConfigError;

	/// [`ChannelTransport`] over `tokio-tungstenite` (rustls with webpki roots).
	#[derive(Clone, Copy, Debug, Default)]
	pub struct TungsteniteTransport;
	impl ChannelTransport for TungsteniteTransport {
		fn open<'a>(&'a self, url: &'a Url, protocols: &'a [String]) -> ChannelFuture<'a> {
			Box::pin(async move {
				let mut request =
					url.as_str().into_client_request().map_err(TransportError::channel)?;

				if !protocols.is_empty() {
					let value = HeaderValue::from_str(&protocols.join(", ")).map_err(|_| {
						ConfigError::InvalidHeader { name: SEC_WEBSOCKET_PROTOCOL.to_string() }
					})?;

					request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
				}

				let (socket, _response) = tokio_tungstenite::connect_async(request)
					.await
					.map_err(TransportError::channel)?;
				let (sink, stream) = socket.split();
				let sink = sink
					.sink_err_into::<TransportError>()
					.with(|frame: Frame| future::ready(Ok::<_, TransportError>(into_message(frame))));
				let stream = stream.filter_map(|message| {
					future::ready(match message {
						Ok(message) => from_message(message).map(Ok),
						Err(e) => Some(Err(TransportError::channel(e))),
					})
				});

				tracing::debug!(url = %url, "channel opened");

				Ok(Channel { sink: Box::pin(sink), stream: Box::pin(stream) })
			})
		}
	}

	fn into_message(frame: Frame) -> Message {
		match frame {
			Frame::Text { data, .. } => Message::Text(data),
			Frame::Binary(data) => Message::Binary(data),
			Frame::Ping(data) => Message::Ping(data),
			Frame::Pong(data) => Message::Pong(data),
			Frame::Close(reason) => Message::Close(reason.map(|reason| CloseFrame {
				code: CloseCode::from(reason.code),
				reason: reason.reason.into(),
			})),
		}
	}

	fn from_message(message: Message) -> Option<Frame> {
		match message {
			Message::Text(data) => Some(Frame::text(data)),
			Message::Binary(data) => Some(Frame::Binary(data)),
			// tungstenite queues the pong itself.
			Message::Ping(_) => None,
			Message::Pong(data) => Some(Frame::Pong(data)),
			Message::Close(frame) => Some(Frame::Close(frame.map(|frame| CloseReason {
				code: frame.code.into(),
				reason: frame.reason.into_owned(),
			}))),
			Message::Frame(_) => None,
		}
	}

}
