//! Action-ws protocol: at-most-once dispatch of submitted actions and bounded result redelivery.
//!
//! The peer submits actions over a [`Session`]; every submit is acknowledged immediately, its
//! handler runs once per id, and the outcome is tracked until the peer acknowledges it or its
//! deadline passes.

// crates.io
use tokio::time::Instant;
// self
use crate::{
	_prelude::*,
	auth::ActionId,
	session::{ListenerFuture, Session, SessionListener},
	store::ExpiringStore,
};

/// Boxed future returned by [`ActionHandler::handle`].
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<Value>> + 'a + Send>>;

/// Application logic invoked for submitted actions.
pub trait ActionHandler
where
	Self: 'static + Send + Sync,
{
	/// Executes `action` and returns the success payload sent back to the peer.
	///
	/// An error is reported to the peer as `{"error":{"code","message"}}`.
	fn handle<'a>(&'a self, action: &'a ActionSubmit) -> ActionFuture<'a>;
}

/// Action submitted by the peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionSubmit {
	/// Peer-assigned id.
	pub id: ActionId,
	/// Handler name.
	pub handler: String,
	/// Capability the handler is expected to provide.
	pub capability: String,
	/// Handler parameters.
	#[serde(default)]
	pub parameters: Value,
	/// Lifetime of the action in milliseconds.
	pub timeout: u64,
}
impl ActionSubmit {
	/// Lifetime of the action.
	pub fn lifetime(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}
}

/// Messages exchanged on the action-ws channel, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActionMessage {
	/// Peer submits an action.
	SubmitAction(ActionSubmit),
	/// Result of an action.
	SendActionResult {
		/// Action id.
		id: ActionId,
		/// Success payload or error object.
		result: Value,
	},
	/// Positive acknowledgement of a submit or a result.
	Acknowledged {
		/// Acknowledged id.
		id: ActionId,
	},
	/// The peer rejected a result; it may be redelivered.
	NegativeAcknowledged {
		/// Rejected id.
		id: ActionId,
		/// Peer-supplied status code.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		code: Option<u16>,
		/// Peer-supplied message.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		message: Option<String>,
	},
	/// Handler configuration changed on the peer side.
	ConfigChanged {},
}

/// Tunables for action dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActionConfig {
	/// Number of redeliveries allowed after negative acknowledgements.
	pub result_retries: u32,
}
impl ActionConfig {
	/// Default redelivery budget.
	pub const DEFAULT_RESULT_RETRIES: u32 = 4;

	/// Overrides the redelivery budget.
	pub fn with_result_retries(mut self, retries: u32) -> Self {
		self.result_retries = retries;

		self
	}
}
impl Default for ActionConfig {
	fn default() -> Self {
		Self { result_retries: Self::DEFAULT_RESULT_RETRIES }
	}
}

/// Submitted action awaiting its result.
#[derive(Clone, Debug)]
pub struct PendingAction {
	/// The submit as received.
	pub submit: ActionSubmit,
}

/// Result awaiting acknowledgement.
#[derive(Clone, Debug)]
pub struct ActionResult {
	/// Payload sent as `result`.
	pub payload: Value,
	/// Redeliveries still allowed.
	pub retries_left: u32,
}

/// What to do with an incoming submit.
#[derive(Clone, Debug, PartialEq)]
pub enum SubmitDecision {
	/// First sighting; run the handler.
	Run,
	/// A result already exists; send it again instead of re-running.
	Resend(Value),
	/// The action is still running; nothing to do.
	InFlight,
}

/// Correlates submits with results, both expiring at the submit's deadline.
#[derive(Debug)]
pub struct ActionLedger {
	config: ActionConfig,
	submitted: ExpiringStore<ActionId, PendingAction>,
	results: ExpiringStore<ActionId, ActionResult>,
}
impl ActionLedger {
	/// Creates an empty ledger.
	pub fn new(config: ActionConfig) -> Self {
		Self { config, submitted: ExpiringStore::new(), results: ExpiringStore::new() }
	}

	/// Ledger configuration.
	pub fn config(&self) -> ActionConfig {
		self.config
	}

	/// Records a submit received at `received_at` and decides how to handle it.
	///
	/// Expired submits and results are purged first, so both stores only hold live actions.
	pub fn on_submit(&self, submit: ActionSubmit, received_at: Instant) -> SubmitDecision {
		self.purge_expired();

		if let Some(result) = self.results.get(&submit.id) {
			return SubmitDecision::Resend(result.payload);
		}

		let id = submit.id.clone();
		let deadline = received_at + submit.lifetime();

		match self.submitted.insert(id, PendingAction { submit }, deadline) {
			Ok(()) => SubmitDecision::Run,
			Err(_) => SubmitDecision::InFlight,
		}
	}

	/// Stores the outcome for `id` under the submit's deadline.
	///
	/// Fails with [`Error::Expired`] once the submit has expired; nothing should be sent then.
	pub fn record_result(&self, id: &ActionId, payload: Value) -> Result<()> {
		let deadline =
			self.submitted.deadline(id).ok_or_else(|| Error::Expired { id: id.to_string() })?;

		self.results.upsert(
			id.clone(),
			ActionResult { payload, retries_left: self.config.result_retries },
			deadline,
		);

		Ok(())
	}

	/// Drops the result for `id`; returns `true` if one was pending.
	pub fn on_ack(&self, id: &ActionId) -> bool {
		self.results.remove(id).is_some()
	}

	/// Returns the payload to redeliver for `id`, consuming one unit of its budget.
	///
	/// Once the budget is spent the result is dropped and `None` is returned.
	pub fn on_nack(&self, id: &ActionId) -> Option<Value> {
		let redeliver = self.results.update(id, |result| {
			if result.retries_left == 0 {
				return None;
			}

			result.retries_left -= 1;

			Some(result.payload.clone())
		})?;

		if redeliver.is_none() {
			self.results.remove(id);
		}

		redeliver
	}

	/// Drops expired submits and results; returns how many entries were removed.
	pub fn purge_expired(&self) -> usize {
		let purged = self.submitted.purge_expired() + self.results.purge_expired();

		if purged > 0 {
			tracing::debug!(purged, "purged expired actions");
		}

		purged
	}

	/// Returns `true` if a live submit exists for `id`.
	pub fn is_pending(&self, id: &ActionId) -> bool {
		self.submitted.contains(id)
	}
}
impl Default for ActionLedger {
	fn default() -> Self {
		Self::new(ActionConfig::default())
	}
}

/// Builds the error payload reported for a failed handler.
pub fn error_payload(error: &Error) -> Value {
	let code = match error {
		Error::Remote { code, .. } => *code,
		Error::Unauthorized { .. } => 401,
		Error::Authentication { .. } => 403,
		Error::Protocol { .. } => 400,
		Error::NotSupported { .. } => 501,
		Error::Timeout { .. } => 504,
		_ => 500,
	};

	serde_json::json!({ "error": { "code": code, "message": error.to_string() } })
}

/// [`SessionListener`] speaking the action-ws protocol on behalf of an [`ActionHandler`].
#[derive(Clone)]
pub struct ActionDispatcher {
	handler: Arc<dyn ActionHandler>,
	ledger: Arc<ActionLedger>,
}
impl ActionDispatcher {
	/// Creates a dispatcher with the default [`ActionConfig`].
	pub fn new(handler: Arc<dyn ActionHandler>) -> Self {
		Self::with_config(handler, ActionConfig::default())
	}

	/// Creates a dispatcher with a custom [`ActionConfig`].
	pub fn with_config(handler: Arc<dyn ActionHandler>, config: ActionConfig) -> Self {
		Self { handler, ledger: Arc::new(ActionLedger::new(config)) }
	}

	/// Shared ledger, exposed for inspection.
	pub fn ledger(&self) -> &Arc<ActionLedger> {
		&self.ledger
	}

	async fn dispatch(&self, session: &Session, message: ActionMessage) {
		match message {
			ActionMessage::SubmitAction(submit) => {
				let id = submit.id.clone();

				send_logged(session, &ActionMessage::Acknowledged { id: id.clone() }).await;

				match self.ledger.on_submit(submit.clone(), Instant::now()) {
					SubmitDecision::Run => self.spawn_handler(session.clone(), submit),
					SubmitDecision::Resend(result) => {
						tracing::debug!(%id, "resending stored action result");

						send_logged(session, &ActionMessage::SendActionResult { id, result }).await;
					},
					SubmitDecision::InFlight => {
						tracing::debug!(%id, "ignoring duplicate submit of running action");
					},
				}
			},
			ActionMessage::Acknowledged { id } =>
				if !self.ledger.on_ack(&id) {
					tracing::debug!(%id, "acknowledgement for unknown result");
				},
			ActionMessage::NegativeAcknowledged { id, code, message } => {
				tracing::debug!(%id, ?code, ?message, "action result rejected");

				match self.ledger.on_nack(&id) {
					Some(result) =>
						send_logged(session, &ActionMessage::SendActionResult { id, result }).await,
					None => tracing::warn!(%id, "dropping action result after redelivery budget"),
				}
			},
			ActionMessage::ConfigChanged {} => tracing::info!("action handler configuration changed"),
			ActionMessage::SendActionResult { id, .. } => {
				tracing::warn!(%id, "ignoring action result sent by peer");
			},
		}
	}

	fn spawn_handler(&self, session: Session, submit: ActionSubmit) {
		let handler = self.handler.clone();
		let ledger = self.ledger.clone();

		tokio::spawn(async move {
			let result = match handler.handle(&submit).await {
				Ok(payload) => payload,
				Err(e) => {
					tracing::warn!(id = %submit.id, handler = %submit.handler, error = %e, "action failed");

					error_payload(&e)
				},
			};

			if let Err(e) = ledger.record_result(&submit.id, result.clone()) {
				tracing::warn!(id = %submit.id, error = %e, "discarding result of expired action");

				return;
			}

			send_logged(&session, &ActionMessage::SendActionResult { id: submit.id, result })
				.await;
		});
	}
}
impl Debug for ActionDispatcher {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ActionDispatcher").field("ledger", &self.ledger).finish()
	}
}
impl SessionListener for ActionDispatcher {
	fn on_message<'a>(&'a self, session: &'a Session, message: &'a str) -> ListenerFuture<'a> {
		Box::pin(async move {
			match serde_json::from_str::<ActionMessage>(message) {
				Ok(message) => self.dispatch(session, message).await,
				Err(e) => tracing::warn!(error = %e, "dropping unrecognized action message"),
			}

			Ok(())
		})
	}
}

async fn send_logged(session: &Session, message: &ActionMessage) {
	if let Err(e) = session.send_json(message).await {
		tracing::warn!(error = %e, "failed to send action message");
	}
}
