//! Compact token decoding (payload segment only; signatures are not verified).

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
// self
use crate::_prelude::*;

/// Splits a compact `header.payload.signature` token and parses its payload segment as JSON.
///
/// Padding on the payload segment is tolerated. The signature is never inspected.
pub fn decode_token(token: &str) -> Result<Value> {
	let mut segments = token.split('.');
	let payload = match (segments.next(), segments.next()) {
		(Some(_), Some(payload)) => payload,
		_ => return Err(Error::Authentication { reason: "Token is not in compact form".into() }),
	};
	let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).map_err(|e| {
		Error::Authentication { reason: format!("Token payload is not base64url: {e}") }
	})?;

	serde_json::from_slice(&bytes).map_err(|e| Error::Authentication {
		reason: format!("Token payload is not JSON: {e}"),
	})
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn decodes_payload_segment() {
		let payload = decode_token("header.eyJhIjoxfQ.sig").expect("Payload should decode.");

		assert_eq!(payload, serde_json::json!({ "a": 1 }));
	}

	#[test]
	fn tolerates_padding_and_missing_signature() {
		assert_eq!(
			decode_token("h.eyJhIjoxfQ==").expect("Padded payload should decode."),
			serde_json::json!({ "a": 1 })
		);
	}

	#[test]
	fn rejects_tokens_without_separator() {
		let err = decode_token("opaque-token").expect_err("Opaque token should fail.");

		assert!(matches!(err, Error::Authentication { .. }));
	}

	#[test]
	fn rejects_non_json_payloads() {
		let err = decode_token("h.bm90LWpzb24.s").expect_err("Non-JSON payload should fail.");

		assert!(matches!(err, Error::Authentication { .. }));
	}
}
