//! Streams graph events from a HIRO instance, logging in with the password grant.
//!
//! Reads `HIRO_API_ROOT`, `HIRO_CLIENT_ID`, `HIRO_CLIENT_SECRET`, `HIRO_USERNAME`, and
//! `HIRO_PASSWORD`. Optional: `HIRO_EVENT_FILTER` (jfilter expression) and `HIRO_DEMO_SECS`
//! (run time, default 30).

// std
use std::{env, sync::Arc, time::Duration};
// crates.io
use color_eyre::{Result, eyre::WrapErr};
// self
use hiro_session::{
	auth::ClientId,
	provider::{ClientCredentials, PasswordSource},
	session::{
		CloseReason, EventSubscriptions, ListenerFuture, Session, SessionConfig, SessionEndpoint,
		SessionListener,
	},
	token::{TokenManager, TokenManagerConfig},
};

struct PrintListener;
impl SessionListener for PrintListener {
	fn on_open(&self, _session: &Session) {
		println!("event stream open");
	}

	fn on_message<'a>(&'a self, _session: &'a Session, message: &'a str) -> ListenerFuture<'a> {
		Box::pin(async move {
			println!("{message}");

			Ok(())
		})
	}

	fn on_close(&self, _session: &Session, reason: Option<&CloseReason>) {
		println!("event stream closed: {reason:?}");
	}

	fn on_error(&self, _session: &Session, error: &hiro_session::error::Error) {
		eprintln!("event stream error: {error}");
	}
}

fn var(name: &str) -> Result<String> {
	env::var(name).wrap_err_with(|| format!("{name} must be set"))
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let client = ClientCredentials::new(ClientId::new(var("HIRO_CLIENT_ID")?)?, var("HIRO_CLIENT_SECRET")?);
	let source = PasswordSource::new(client, var("HIRO_USERNAME")?, var("HIRO_PASSWORD")?);
	let tokens = Arc::new(TokenManager::new(
		Arc::new(source),
		TokenManagerConfig::from_root(&var("HIRO_API_ROOT")?)?,
	));
	let filter = env::var("HIRO_EVENT_FILTER")
		.unwrap_or_else(|_| "(element.ogit/_type = ogit/Automation/AutomationIssue)".into());
	let run_for = env::var("HIRO_DEMO_SECS").ok().and_then(|secs| secs.parse().ok()).unwrap_or(30);
	let session = Session::builder(SessionConfig::builder(SessionEndpoint::events()).build()?, tokens)
		.listener(Arc::new(PrintListener))
		.open_hook(Arc::new(EventSubscriptions::new().with_filter("demo", filter)))
		.build()?;

	session.start().await?;
	tokio::time::sleep(Duration::from_secs(run_for)).await;
	session.close().await?;

	Ok(())
}
