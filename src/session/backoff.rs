//! Reconnect backoff: whole-second steps with a randomized plateau.

// crates.io
use rand::Rng;
// self
use crate::_prelude::*;

const STEPS: [u64; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 20, 30, 40, 50, 60];
const PLATEAU_SECS: u64 = 60;
const PLATEAU_JITTER_SECS: u64 = 540;

/// Delay calculator applied before every connection attempt.
///
/// Yields `0, 1, ..., 10, 20, 30, 40, 50, 60` seconds and then `60 + uniform[0, 540)` seconds
/// until [`reset`](Self::reset) rewinds it.
#[derive(Clone, Debug, Default)]
pub struct Backoff {
	attempt: usize,
}
impl Backoff {
	/// Returns the delay for the next attempt and advances.
	pub fn next_delay(&mut self) -> Duration {
		let secs = match STEPS.get(self.attempt) {
			Some(secs) => *secs,
			None => PLATEAU_SECS + rand::rng().random_range(0..PLATEAU_JITTER_SECS),
		};

		self.attempt = self.attempt.saturating_add(1);

		Duration::from_secs(secs)
	}

	/// Rewinds to the first step.
	pub fn reset(&mut self) {
		self.attempt = 0;
	}

	/// Number of delays handed out since the last reset.
	pub fn attempts(&self) -> usize {
		self.attempt
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn steps_then_plateau() {
		let mut backoff = Backoff::default();
		let steps: Vec<u64> = (0..16).map(|_| backoff.next_delay().as_secs()).collect();

		assert_eq!(steps, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 20, 30, 40, 50, 60]);

		for _ in 0..200 {
			let secs = backoff.next_delay().as_secs();

			assert!((60..600).contains(&secs), "{secs}");
		}
	}

	#[test]
	fn reset_rewinds() {
		let mut backoff = Backoff::default();

		for _ in 0..5 {
			backoff.next_delay();
		}

		backoff.reset();

		assert_eq!(backoff.attempts(), 0);
		assert_eq!(backoff.next_delay(), Duration::ZERO);
	}
}
