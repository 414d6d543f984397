//! Outbound send pipeline: bounded writes, retry with backoff, optional reconnect escalation.

// crates.io
use futures::SinkExt;
// self
use crate::{
	_prelude::*,
	error::SessionError,
	session::{Backoff, Frame, Session},
};

impl Session {
	/// Sends a text message on the live channel.
	///
	/// Each write is bounded by `send_timeout`. A failed write is retried up to `send_retries`
	/// times, each retry preceded by the next backoff delay. When retries are exhausted and
	/// `reconnect_on_failed_send` is set, the channel is replaced in the background and the call
	/// still fails; the message is not re-sent on the new channel.
	pub async fn send(&self, message: impl Into<String>) -> Result<()> {
		let text = message.into();
		let mut backoff = Backoff::default();
		let mut attempt = 0;

		loop {
			let (generation, outcome) = self.write_frame(Frame::text(text.clone())).await;
			let error = match (generation, outcome) {
				(_, Ok(())) => return Ok(()),
				(None, Err(e)) => return Err(e),
				(Some(generation), Err(e)) if attempt >= self.config().send_retries => {
					tracing::warn!(attempts = attempt + 1, error = %e, "send failed");

					if self.config().reconnect_on_failed_send {
						self.spawn_restart(generation);
					}

					return Err(e);
				},
				(_, Err(e)) => e,
			};

			attempt += 1;

			let delay = backoff.next_delay();

			tracing::debug!(attempt, delay_secs = delay.as_secs(), %error, "retrying send");
			tokio::time::sleep(delay).await;
		}
	}

	/// Serializes `value` and sends it.
	pub async fn send_json<T>(&self, value: &T) -> Result<()>
	where
		T: ?Sized + Serialize,
	{
		let text = serde_json::to_string(value)
			.map_err(|e| Error::Protocol { reason: format!("Message cannot be encoded: {e}") })?;

		self.send(text).await
	}

	/// Writes one frame; returns the generation of the channel used, if any.
	async fn write_frame(&self, frame: Frame) -> (Option<u64>, Result<()>) {
		let mut writer = self.inner.writer.lock().await;
		let Some(writer) = writer.as_mut() else {
			return (None, Err(SessionError::NotConnected.into()));
		};
		let outcome =
			match tokio::time::timeout(self.config().send_timeout, writer.sink.send(frame)).await {
				Ok(Ok(())) => Ok(()),
				Ok(Err(e)) => Err(e.into()),
				Err(_) => Err(Error::Timeout { operation: "send" }),
			};

		(Some(writer.generation), outcome)
	}
}
