//! Authorization code grant with PKCE (S256).

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{Rng, distr::Alphanumeric};
use sha2::{Digest, Sha256};
// self
use crate::{
	_prelude::*,
	auth::Credential,
	discovery::{AUTH_API, ApiDiscovery},
	provider::{ClientCredentials, ExchangeContext, SourceFuture, SourceKind, TokenGrant, TokenSource},
};

const STATE_LEN: usize = 32;
const PKCE_VERIFIER_LEN: usize = 64;

/// PKCE verifier/challenge pair.
#[derive(Clone)]
pub struct PkcePair {
	verifier: String,
	challenge: String,
}
impl PkcePair {
	/// Generates a fresh random pair.
	pub fn generate() -> Self {
		let verifier = random_string(PKCE_VERIFIER_LEN);
		let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

		Self { verifier, challenge }
	}

	/// Challenge sent to the authorize endpoint.
	pub fn challenge(&self) -> &str {
		&self.challenge
	}

	/// Challenge method (always `S256`).
	pub fn method(&self) -> &'static str {
		"S256"
	}
}
impl Debug for PkcePair {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("PkcePair")
			.field("verifier", &"<redacted>")
			.field("challenge", &self.challenge)
			.finish()
	}
}

#[derive(Debug, Default)]
struct Handshake {
	state: Option<String>,
	pkce: Option<PkcePair>,
	code: Option<String>,
}

/// Source driving a browser-based authorization code login.
///
/// 1. [`authorization_url`](Self::authorization_url) creates a fresh PKCE pair and state.
/// 2. The redirect handler passes the returned `state` + `code` to
///    [`handle_callback`](Self::handle_callback).
/// 3. The next acquisition exchanges the code. Codes are single use; once consumed, acquiring
///    fails with [`Error::Unauthorized`] until a new authorization completes.
#[derive(Debug)]
pub struct AuthCodePkceSource {
	client: ClientCredentials,
	redirect_uri: Url,
	scope: Option<String>,
	handshake: Mutex<Handshake>,
}
impl AuthCodePkceSource {
	/// Creates a source for `client` redirecting to `redirect_uri`.
	pub fn new(client: ClientCredentials, redirect_uri: Url) -> Self {
		Self { client, redirect_uri, scope: None, handshake: Mutex::new(Handshake::default()) }
	}

	/// Requests a scope at authorization time.
	pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
		self.scope = Some(scope.into());

		self
	}

	/// Builds the authorize URL using the auth API resolved by `discovery`.
	pub async fn authorization_url(&self, discovery: &ApiDiscovery) -> Result<Url> {
		let base = discovery.http_url(AUTH_API).await?;

		self.authorization_url_at(&base)
	}

	/// Builds the authorize URL relative to an explicit auth API base.
	///
	/// Every call starts a new handshake, invalidating the previous state and verifier.
	pub fn authorization_url_at(&self, auth_base: &Url) -> Result<Url> {
		let mut url = crate::discovery::with_trailing_slash(auth_base.clone())
			.join("authorize")
			.map_err(|e| crate::error::ConfigError::invalid_url("authorize", e))?;
		let pkce = PkcePair::generate();
		let state = random_string(STATE_LEN);

		{
			let mut query = url.query_pairs_mut();

			query.append_pair("response_type", "code");
			query.append_pair("client_id", &self.client.client_id);
			query.append_pair("redirect_uri", self.redirect_uri.as_str());

			if let Some(scope) = &self.scope {
				query.append_pair("scope", scope);
			}

			query.append_pair("state", &state);
			query.append_pair("code_challenge", pkce.challenge());
			query.append_pair("code_challenge_method", pkce.method());
		}

		*self.handshake.lock() = Handshake { state: Some(state), pkce: Some(pkce), code: None };

		Ok(url)
	}

	/// Accepts the redirect parameters; `state` must match the pending handshake exactly.
	pub fn handle_callback(&self, state: &str, code: &str) -> Result<()> {
		let mut handshake = self.handshake.lock();

		if handshake.state.as_deref() != Some(state) {
			return Err(Error::Authentication { reason: "Authorization state mismatch".into() });
		}

		handshake.state = None;
		handshake.code = Some(code.to_owned());

		Ok(())
	}

	/// Returns `true` while an authorization code is waiting to be exchanged.
	pub fn has_pending_code(&self) -> bool {
		self.handshake.lock().code.is_some()
	}
}
impl TokenSource for AuthCodePkceSource {
	fn kind(&self) -> SourceKind {
		SourceKind::AuthCodePkce
	}

	fn acquire<'a>(&'a self, ctx: &'a ExchangeContext) -> SourceFuture<'a, Credential> {
		Box::pin(async move {
			// The verifier stays put until a code arrives to pair with it.
			let (code, pkce) = {
				let mut handshake = self.handshake.lock();
				let Some(code) = handshake.code.take() else {
					return Err(Error::Unauthorized {
						reason: "No authorization code is pending; start a new authorization"
							.into(),
					});
				};

				(code, handshake.pkce.take())
			};
			let Some(pkce) = pkce else {
				return Err(Error::Unauthorized {
					reason: "Authorization verifier is missing; start a new authorization".into(),
				});
			};

			ctx.exchange(TokenGrant::AuthorizationCode {
				client: &self.client,
				code: &code,
				verifier: &pkce.verifier,
				redirect_uri: &self.redirect_uri,
			})
			.await
		})
	}

	fn client(&self) -> Option<&ClientCredentials> {
		Some(&self.client)
	}
}

fn random_string(len: usize) -> String {
	rand::rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::auth::ClientId;

	fn source() -> AuthCodePkceSource {
		AuthCodePkceSource::new(
			ClientCredentials::public(ClientId::new("cli").expect("Client id should be valid.")),
			Url::parse("http://localhost:8080/callback").expect("Redirect URI should parse."),
		)
		.with_scope("all")
	}

	#[test]
	fn challenge_is_sha256_of_verifier() {
		let pair = PkcePair::generate();

		assert_eq!(pair.verifier.len(), PKCE_VERIFIER_LEN);
		assert_eq!(pair.challenge, URL_SAFE_NO_PAD.encode(Sha256::digest(pair.verifier.as_bytes())));
		assert!(!format!("{pair:?}").contains(&pair.verifier));
	}

	#[test]
	fn authorization_url_carries_pkce_parameters() {
		let source = source();
		let base = Url::parse("https://core.example.com/api/auth/6.6")
			.expect("Auth base should parse.");
		let url = source.authorization_url_at(&base).expect("Authorize URL should build.");
		let params: HashMap<_, _> = url.query_pairs().into_owned().collect();

		assert_eq!(url.path(), "/api/auth/6.6/authorize");
		assert_eq!(params.get("response_type").map(String::as_str), Some("code"));
		assert_eq!(params.get("client_id").map(String::as_str), Some("cli"));
		assert_eq!(params.get("scope").map(String::as_str), Some("all"));
		assert_eq!(params.get("code_challenge_method").map(String::as_str), Some("S256"));
		assert_eq!(params.get("state").map(String::len), Some(STATE_LEN));
	}

	#[test]
	fn callback_requires_exact_state() {
		let source = source();
		let base = Url::parse("https://core.example.com/auth/").expect("Auth base should parse.");
		let url = source.authorization_url_at(&base).expect("Authorize URL should build.");
		let state = url
			.query_pairs()
			.find(|(key, _)| key == "state")
			.map(|(_, value)| value.into_owned())
			.expect("State parameter should be present.");

		assert!(source.handle_callback("forged", "code").is_err());
		assert!(!source.has_pending_code());
		source.handle_callback(&state, "code-1").expect("Matching state should be accepted.");
		assert!(source.has_pending_code());
		assert!(source.handle_callback(&state, "code-2").is_err());
	}
}
