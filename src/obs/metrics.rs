// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::obs::{FlowKind, FlowOutcome};

/// Records a flow outcome via the global metrics recorder (when enabled).
pub fn record_flow_outcome(kind: FlowKind, outcome: FlowOutcome) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"hiro_session_flow_total",
			"flow" => kind.as_str(),
			"outcome" => outcome.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (kind, outcome);
	}
}

/// In-process counters kept by a token manager.
#[derive(Debug, Default)]
pub struct TokenMetrics {
	acquisitions: AtomicU64,
	refresh_attempts: AtomicU64,
	refresh_success: AtomicU64,
	refresh_failure: AtomicU64,
}
impl TokenMetrics {
	/// Number of full acquisitions performed through the token source.
	pub fn acquisitions(&self) -> u64 {
		self.acquisitions.load(Ordering::Relaxed)
	}

	/// Number of refresh attempts (forced or due).
	pub fn refresh_attempts(&self) -> u64 {
		self.refresh_attempts.load(Ordering::Relaxed)
	}

	/// Number of refreshes that produced a credential, including fallback re-acquisitions.
	pub fn refresh_successes(&self) -> u64 {
		self.refresh_success.load(Ordering::Relaxed)
	}

	/// Number of refreshes that surfaced an error.
	pub fn refresh_failures(&self) -> u64 {
		self.refresh_failure.load(Ordering::Relaxed)
	}

	pub(crate) fn record_acquisition(&self) {
		self.acquisitions.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_refresh_attempt(&self) {
		self.refresh_attempts.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_refresh_success(&self) {
		self.refresh_success.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_refresh_failure(&self) {
		self.refresh_failure.fetch_add(1, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn record_flow_outcome_accepts_every_label() {
		record_flow_outcome(FlowKind::Connect, FlowOutcome::Failure);
		record_flow_outcome(FlowKind::Revoke, FlowOutcome::Success);
	}

	#[test]
	fn token_metrics_count_independently() {
		let metrics = TokenMetrics::default();

		metrics.record_acquisition();
		metrics.record_refresh_attempt();
		metrics.record_refresh_attempt();
		metrics.record_refresh_failure();

		assert_eq!(metrics.acquisitions(), 1);
		assert_eq!(metrics.refresh_attempts(), 2);
		assert_eq!(metrics.refresh_successes(), 0);
		assert_eq!(metrics.refresh_failures(), 1);
	}
}
