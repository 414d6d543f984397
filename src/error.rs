//! Crate-level error types shared across token flows, sessions, and action dispatch.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Transport failure (DNS, TCP, TLS, HTTP status, channel I/O).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Session lifecycle violation.
	#[error(transparent)]
	Session(#[from] SessionError),

	/// Credentials were rejected or could not be obtained.
	#[error("Authentication failed: {reason}.")]
	Authentication {
		/// Provider- or crate-supplied reason string.
		reason: String,
	},
	/// The peer answered with HTTP/embedded status 401.
	#[error("Unauthorized: {reason}.")]
	Unauthorized {
		/// Provider- or crate-supplied reason string.
		reason: String,
	},
	/// Malformed or unexpected message.
	#[error("Protocol violation: {reason}.")]
	Protocol {
		/// Description of what could not be understood.
		reason: String,
	},
	/// An operation exceeded its deadline.
	#[error("Timed out while waiting for {operation}.")]
	Timeout {
		/// Operation label.
		operation: &'static str,
	},
	/// The operation is not available for the configured token source.
	#[error("Operation not supported: {reason}.")]
	NotSupported {
		/// Why the operation cannot be performed.
		reason: String,
	},
	/// An entry with the same id is already being tracked.
	#[error("Duplicate id `{id}`.")]
	Duplicate {
		/// Offending identifier.
		id: String,
	},
	/// The tracked entry passed its deadline.
	#[error("Entry `{id}` has expired.")]
	Expired {
		/// Expired identifier.
		id: String,
	},
	/// The peer embedded an error in an otherwise valid message.
	#[error("Remote error {code}: {message}.")]
	Remote {
		/// Embedded status code.
		code: u16,
		/// Embedded message (may be empty).
		message: String,
	},
}
impl Error {
	/// Returns `true` for the class of failures that warrants a fresh credential.
	pub fn is_authentication(&self) -> bool {
		matches!(self, Self::Authentication { .. } | Self::Unauthorized { .. })
	}

	/// Returns `true` when the peer answered with status 401.
	pub fn is_unauthorized(&self) -> bool {
		matches!(self, Self::Unauthorized { .. } | Self::Remote { code: 401, .. })
	}
}

/// Configuration and validation failures.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// A configured or discovered URL is invalid.
	#[error("URL `{value}` is invalid.")]
	InvalidUrl {
		/// Offending input.
		value: String,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// A header value contains characters that cannot be transmitted.
	#[error("Header `{name}` has an invalid value.")]
	InvalidHeader {
		/// Header name.
		name: String,
	},
	/// A discovered endpoint uses a scheme that cannot carry a WebSocket.
	#[error("URL scheme `{scheme}` cannot be mapped to a WebSocket scheme.")]
	UnsupportedScheme {
		/// Offending scheme.
		scheme: String,
	},
	/// No channel transport was supplied and the default adapter is not compiled in.
	#[error("No channel transport is configured; enable `tokio-tungstenite` or supply one.")]
	MissingTransport,
	/// Discovery was requested without an API root.
	#[error("No API root is configured; capability discovery is unavailable.")]
	MissingApiRoot,
	/// Discovery did not list the requested API.
	#[error("Capability discovery does not list the `{name}` API.")]
	MissingApi {
		/// API name.
		name: String,
	},
	/// A discovered API version could not be parsed.
	#[error("API version `{value}` cannot be parsed.")]
	InvalidVersion {
		/// Offending version string.
		value: String,
	},
	/// Credential builder validation failed.
	#[error("Unable to build credential.")]
	CredentialBuild(#[from] crate::auth::CredentialBuilderError),
	/// Session configuration validation failed.
	#[error("Invalid session configuration.")]
	Session(#[from] crate::session::SessionConfigError),
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}

	/// Wraps a URL parse failure together with the offending input.
	pub fn invalid_url(value: impl Into<String>, source: url::ParseError) -> Self {
		Self::InvalidUrl { value: value.into(), source }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Transport-level failures (network, IO, status, channel).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the remote service.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred during transport.")]
	Io(#[from] std::io::Error),
	/// The remote service answered with an unexpected HTTP status.
	#[error("Remote service returned HTTP {status}: {body}.")]
	Status {
		/// HTTP status code.
		status: u16,
		/// Response body preview.
		body: String,
	},
	/// The persistent channel failed to open, read, or write.
	#[error("Channel failure.")]
	Channel {
		/// Channel-specific failure.
		#[source]
		source: BoxError,
	},
}
impl TransportError {
	const BODY_PREVIEW_LIMIT: usize = 256;

	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}

	/// Wraps a channel-specific error.
	pub fn channel(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Channel { source: Box::new(src) }
	}

	/// Builds a status error, truncating the body preview.
	pub fn status(status: u16, body: &[u8]) -> Self {
		let mut body = String::from_utf8_lossy(body).into_owned();

		if body.len() > Self::BODY_PREVIEW_LIMIT {
			let mut cut = Self::BODY_PREVIEW_LIMIT;

			while !body.is_char_boundary(cut) {
				cut -= 1;
			}

			body.truncate(cut);
		}

		Self::Status { status, body }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		Self::network(e)
	}
}
impl From<futures::channel::mpsc::SendError> for TransportError {
	fn from(e: futures::channel::mpsc::SendError) -> Self {
		Self::channel(e)
	}
}
#[cfg(feature = "tokio-tungstenite")]
impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
	fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
		Self::channel(e)
	}
}

/// Session lifecycle failures.
#[derive(Debug, ThisError)]
pub enum SessionError {
	/// The requested operation is not valid in the current state.
	#[error("Operation `{operation}` is not valid while the session is {state}.")]
	InvalidState {
		/// Operation label.
		operation: &'static str,
		/// Session state at the time of the call.
		state: crate::session::SessionState,
	},
	/// The session was closed while the operation was in flight.
	#[error("Session is closed.")]
	Closed,
	/// No channel is currently live.
	#[error("Session has no live channel.")]
	NotConnected,
	/// The open hook rejected the freshly opened channel.
	#[error("Open hook failed: {reason}.")]
	OpenHook {
		/// Hook-supplied reason.
		reason: String,
	},
}
