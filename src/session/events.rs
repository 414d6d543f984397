//! Event-stream subscriptions re-registered on every (re)connect.

// crates.io
use rand::{Rng, distr::Alphanumeric};
use serde_json::json;
// self
use crate::{
	_prelude::*,
	session::{HookChannel, HookFuture, OpenHook},
};

const SUBSCRIPTION_ID_LEN: usize = 16;

/// One `jfilter` registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventFilter {
	/// Filter identifier chosen by the client.
	pub id: String,
	/// Filter expression, for example `(element.ogit/_type=ogit/Automation/AutomationIssue)`.
	pub content: String,
}

/// Open hook registering event filters and scope subscriptions.
#[derive(Clone, Debug, Default)]
pub struct EventSubscriptions {
	filters: Vec<EventFilter>,
	scopes: Vec<String>,
}
impl EventSubscriptions {
	/// Creates an empty set.
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a filter registration.
	pub fn with_filter(mut self, id: impl Into<String>, content: impl Into<String>) -> Self {
		self.filters.push(EventFilter { id: id.into(), content: content.into() });

		self
	}

	/// Adds a scope subscription.
	pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
		self.scopes.push(scope_id.into());

		self
	}

	/// Registered filters.
	pub fn filters(&self) -> &[EventFilter] {
		&self.filters
	}

	/// Subscribed scopes.
	pub fn scopes(&self) -> &[String] {
		&self.scopes
	}
}
impl OpenHook for EventSubscriptions {
	fn on_open<'a>(&'a self, mut channel: HookChannel<'a>) -> HookFuture<'a> {
		Box::pin(async move {
			for filter in &self.filters {
				channel.send_json(&register_message(filter)).await?;
			}
			for scope in &self.scopes {
				channel.send_json(&subscribe_message(scope)).await?;
			}

			tracing::debug!(
				filters = self.filters.len(),
				scopes = self.scopes.len(),
				"event subscriptions registered"
			);

			Ok(())
		})
	}
}

/// `register` message for `filter`.
pub fn register_message(filter: &EventFilter) -> Value {
	json!({
		"type": "register",
		"args": {
			"filter-id": filter.id,
			"filter-type": "jfilter",
			"filter-content": filter.content,
		},
	})
}

/// `subscribe` message for `scope_id` with a fresh random id.
pub fn subscribe_message(scope_id: &str) -> Value {
	let id: String =
		rand::rng().sample_iter(&Alphanumeric).take(SUBSCRIPTION_ID_LEN).map(char::from).collect();

	json!({ "type": "subscribe", "id": id, "args": { "scopeId": scope_id } })
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn register_message_shape() {
		let filter = EventFilter { id: "f1".into(), content: "(element.ogit/_type=x)".into() };

		assert_eq!(
			register_message(&filter),
			json!({
				"type": "register",
				"args": {
					"filter-id": "f1",
					"filter-type": "jfilter",
					"filter-content": "(element.ogit/_type=x)",
				},
			})
		);
	}

	#[test]
	fn subscribe_messages_use_fresh_ids() {
		let first = subscribe_message("scope-1");
		let second = subscribe_message("scope-1");

		assert_eq!(first["type"], "subscribe");
		assert_eq!(first["args"]["scopeId"], "scope-1");
		assert_eq!(first["id"].as_str().map(str::len), Some(SUBSCRIPTION_ID_LEN));
		assert_ne!(first["id"], second["id"]);
	}
}
