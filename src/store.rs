//! Expiring keyed store backing the action ledger.
//!
//! Entries carry an absolute deadline. An entry whose deadline has passed is treated as absent by
//! every read and purged lazily on the next access that touches it.

// std
use std::hash::Hash;
// crates.io
use tokio::time::Instant;
// self
use crate::_prelude::*;

#[derive(Clone, Debug)]
struct Entry<V> {
	value: V,
	deadline: Instant,
}
impl<V> Entry<V> {
	fn is_live(&self, now: Instant) -> bool {
		now < self.deadline
	}
}

/// Thread-safe map whose entries disappear once their deadline passes.
#[derive(Debug)]
pub struct ExpiringStore<K, V> {
	entries: Mutex<HashMap<K, Entry<V>>>,
}
impl<K, V> ExpiringStore<K, V>
where
	K: Clone + Display + Eq + Hash,
	V: Clone,
{
	/// Creates an empty store.
	pub fn new() -> Self {
		Self { entries: Mutex::new(HashMap::new()) }
	}

	/// Inserts `value` under `key`, failing with [`Error::Duplicate`] while a live entry exists.
	///
	/// An expired entry under the same key is replaced.
	pub fn insert(&self, key: K, value: V, deadline: Instant) -> Result<()> {
		let now = Instant::now();
		let mut entries = self.entries.lock();

		if entries.get(&key).is_some_and(|entry| entry.is_live(now)) {
			return Err(Error::Duplicate { id: key.to_string() });
		}

		entries.insert(key, Entry { value, deadline });

		Ok(())
	}

	/// Inserts or replaces the entry under `key`.
	pub fn upsert(&self, key: K, value: V, deadline: Instant) {
		self.entries.lock().insert(key, Entry { value, deadline });
	}

	/// Returns a clone of the live value under `key`.
	pub fn get(&self, key: &K) -> Option<V> {
		self.live(key, |entry| entry.value.clone())
	}

	/// Returns the deadline of the live entry under `key`.
	pub fn deadline(&self, key: &K) -> Option<Instant> {
		self.live(key, |entry| entry.deadline)
	}

	/// Returns `true` if a live entry exists under `key`.
	pub fn contains(&self, key: &K) -> bool {
		self.live(key, |_| ()).is_some()
	}

	/// Applies `f` to the live value under `key`, returning its output.
	pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
		let now = Instant::now();
		let mut entries = self.entries.lock();

		match entries.get_mut(key) {
			Some(entry) if entry.is_live(now) => Some(f(&mut entry.value)),
			Some(_) => {
				entries.remove(key);

				None
			},
			None => None,
		}
	}

	/// Removes the entry under `key`, returning its value if it was still live.
	pub fn remove(&self, key: &K) -> Option<V> {
		let now = Instant::now();

		self.entries.lock().remove(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value)
	}

	/// Drops every expired entry and returns how many were removed.
	pub fn purge_expired(&self) -> usize {
		let now = Instant::now();
		let mut entries = self.entries.lock();
		let before = entries.len();

		entries.retain(|_, entry| entry.is_live(now));

		before - entries.len()
	}

	/// Number of live entries.
	pub fn len(&self) -> usize {
		let now = Instant::now();

		self.entries.lock().values().filter(|entry| entry.is_live(now)).count()
	}

	/// Number of stored entries, including expired ones not yet purged.
	pub fn stored(&self) -> usize {
		self.entries.lock().len()
	}

	/// Returns `true` when no live entry remains.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn live<R>(&self, key: &K, f: impl FnOnce(&Entry<V>) -> R) -> Option<R> {
		let now = Instant::now();
		let mut entries = self.entries.lock();

		match entries.get(key) {
			Some(entry) if entry.is_live(now) => Some(f(entry)),
			Some(_) => {
				entries.remove(key);

				None
			},
			None => None,
		}
	}
}
impl<K, V> Default for ExpiringStore<K, V>
where
	K: Clone + Display + Eq + Hash,
	V: Clone,
{
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn store() -> ExpiringStore<String, u32> {
		ExpiringStore::new()
	}

	#[tokio::test(start_paused = true)]
	async fn live_duplicates_are_rejected() {
		let store = store();
		let deadline = Instant::now() + Duration::from_secs(10);

		store.insert("a".into(), 1, deadline).expect("First insert should succeed.");

		let err = store.insert("a".into(), 2, deadline).expect_err("Live duplicate should fail.");

		assert!(matches!(err, Error::Duplicate { ref id } if id == "a"));
		assert_eq!(store.get(&"a".into()), Some(1));
	}

	#[tokio::test(start_paused = true)]
	async fn expired_entries_read_as_absent_and_can_be_replaced() {
		let store = store();

		store
			.insert("a".into(), 1, Instant::now() + Duration::from_secs(1))
			.expect("First insert should succeed.");
		tokio::time::advance(Duration::from_secs(1)).await;

		assert_eq!(store.get(&"a".into()), None);
		assert!(!store.contains(&"a".into()));

		store
			.insert("a".into(), 2, Instant::now() + Duration::from_secs(1))
			.expect("Insert over an expired entry should succeed.");

		assert_eq!(store.get(&"a".into()), Some(2));
	}

	#[tokio::test(start_paused = true)]
	async fn purge_and_update_respect_deadlines() {
		let store = store();
		let now = Instant::now();

		store.upsert("short".into(), 1, now + Duration::from_millis(100));
		store.upsert("long".into(), 1, now + Duration::from_secs(60));
		tokio::time::advance(Duration::from_millis(200)).await;

		assert_eq!(store.update(&"short".into(), |v| *v += 1), None);
		assert_eq!(
			store.update(&"long".into(), |v| {
				*v += 1;

				*v
			}),
			Some(2)
		);
		assert_eq!(store.purge_expired(), 0);
		assert_eq!(store.len(), 1);
		assert_eq!(store.remove(&"long".into()), Some(2));
		assert!(store.is_empty());
	}
}
