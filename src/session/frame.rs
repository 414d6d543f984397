//! Inbound frame reassembly and classification.

// self
use crate::_prelude::*;

/// Buffers partial text frames until the final fragment arrives.
///
/// A message growing past `limit` bytes is discarded along with its remaining fragments.
#[derive(Debug)]
pub struct Reassembler {
	buffer: String,
	limit: usize,
	discarding: bool,
}
impl Reassembler {
	/// Creates a reassembler accepting messages of at most `limit` bytes.
	pub fn new(limit: usize) -> Self {
		Self { buffer: String::new(), limit, discarding: false }
	}

	/// Appends a fragment; returns the complete message once `last` is set.
	pub fn push(&mut self, data: &str, last: bool) -> Option<String> {
		if !self.discarding && self.buffer.len().saturating_add(data.len()) > self.limit {
			tracing::warn!(
				len = self.buffer.len() + data.len(),
				limit = self.limit,
				"dropping oversized message"
			);

			self.buffer = String::new();
			self.discarding = true;
		}
		if self.discarding {
			self.discarding = !last;

			return None;
		}
		if last && self.buffer.is_empty() {
			return Some(data.to_owned());
		}

		self.buffer.push_str(data);

		last.then(|| std::mem::take(&mut self.buffer))
	}

	/// Returns `true` while a partial message is buffered or being discarded.
	pub fn is_pending(&self) -> bool {
		self.discarding || !self.buffer.is_empty()
	}
}
impl Default for Reassembler {
	fn default() -> Self {
		Self::new(crate::session::SessionConfig::DEFAULT_MAX_MESSAGE_SIZE)
	}
}

/// Verdict for a complete inbound text message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
	/// Regular data for the listener.
	Data,
	/// Embedded error signalled by the peer.
	Error {
		/// Embedded status code.
		code: u16,
		/// Embedded message (may be empty).
		message: String,
	},
	/// Not JSON; dropped.
	Malformed(String),
}

/// Classifies a message as data, an embedded error, or malformed.
///
/// Errors arrive either as an `error` object carrying a numeric `code`, or as a top-level numeric
/// `code` on a message that has no `type`.
pub fn classify(text: &str) -> Inbound {
	let value = match serde_json::from_str::<Value>(text) {
		Ok(value) => value,
		Err(e) => return Inbound::Malformed(e.to_string()),
	};
	let Some(object) = value.as_object() else {
		return Inbound::Data;
	};
	let (source, code) = match object.get("error").and_then(Value::as_object) {
		Some(error) => (error, error.get("code")),
		None if !object.contains_key("type") => (object, object.get("code")),
		None => return Inbound::Data,
	};
	let Some(code) = code.and_then(Value::as_u64) else {
		return Inbound::Data;
	};
	let message = source.get("message").and_then(Value::as_str).unwrap_or_default().to_owned();

	Inbound::Error { code: u16::try_from(code).unwrap_or(u16::MAX), message }
}
