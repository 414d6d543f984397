//! Token endpoint exchanges shared by every mutable token source.
//!
//! The auth API changed shape in version 6.6. Older deployments expose JSON endpoints
//! (`app`, `refresh`, `revoke`); newer ones expose form-encoded OAuth endpoints (`token`,
//! `revoke`). [`ExchangeContext`] resolves the auth API through capability discovery and picks
//! the dialect from the reported version.

// self
use crate::{
	_prelude::*,
	auth::{Credential, CredentialBuilderError, TokenSecret},
	discovery::{AUTH_API, ApiDiscovery, ApiVersion},
	error::{ConfigError, TransportError},
	http::{HttpRequest, HttpResponse, HttpTransport},
	provider::ClientCredentials,
};

/// Grant submitted to the auth API.
#[derive(Clone, Copy)]
pub enum TokenGrant<'a> {
	/// Username/password login.
	Password {
		/// Client registration.
		client: &'a ClientCredentials,
		/// Login name.
		username: &'a str,
		/// Login password.
		password: &'a TokenSecret,
	},
	/// Refresh-token exchange.
	Refresh {
		/// Client registration.
		client: &'a ClientCredentials,
		/// Refresh token issued with the current credential.
		refresh_token: &'a TokenSecret,
	},
	/// Authorization code exchange (PKCE).
	AuthorizationCode {
		/// Client registration.
		client: &'a ClientCredentials,
		/// One-time code returned to the redirect URI.
		code: &'a str,
		/// PKCE verifier matching the challenge sent to the authorize endpoint.
		verifier: &'a str,
		/// Redirect URI used when authorizing.
		redirect_uri: &'a Url,
	},
}
impl TokenGrant<'_> {
	/// Returns the OAuth `grant_type` value.
	pub const fn grant_type(&self) -> &'static str {
		match self {
			TokenGrant::Password { .. } => "password",
			TokenGrant::Refresh { .. } => "refresh_token",
			TokenGrant::AuthorizationCode { .. } => "authorization_code",
		}
	}

	fn client(&self) -> &ClientCredentials {
		match self {
			TokenGrant::Password { client, .. }
			| TokenGrant::Refresh { client, .. }
			| TokenGrant::AuthorizationCode { client, .. } => client,
		}
	}
}
impl Debug for TokenGrant<'_> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenGrant")
			.field("grant_type", &self.grant_type())
			.field("client", self.client())
			.finish()
	}
}

/// Resolved auth API location and dialect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthApi {
	/// Base URL of the auth API, ending with `/`.
	pub base: Url,
	/// `true` when the peer predates the form-encoded token endpoints.
	pub legacy: bool,
}
impl AuthApi {
	fn endpoint(&self, path: &str) -> Result<Url> {
		self.base.join(path).map_err(|e| ConfigError::invalid_url(path, e).into())
	}
}

/// Everything a token source needs to talk to the auth API.
#[derive(Clone)]
pub struct ExchangeContext {
	http: Arc<dyn HttpTransport>,
	discovery: Option<Arc<ApiDiscovery>>,
	refresh_offset: Duration,
	timeout: Duration,
	retries: u32,
}
impl ExchangeContext {
	/// Creates a context over `http` with optional capability discovery.
	pub fn new(
		http: Arc<dyn HttpTransport>,
		discovery: Option<Arc<ApiDiscovery>>,
		refresh_offset: Duration,
	) -> Self {
		Self { http, discovery, refresh_offset, timeout: Duration::from_secs(30), retries: 0 }
	}

	/// Overrides the per-request timeout.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;

		self
	}

	/// Overrides the per-request retry budget.
	pub fn with_retries(mut self, retries: u32) -> Self {
		self.retries = retries;

		self
	}

	/// Refresh lead time applied to credentials built by sources.
	pub fn refresh_offset(&self) -> Duration {
		self.refresh_offset
	}

	/// Capability discovery client, if an API root was configured.
	pub fn discovery(&self) -> Result<&Arc<ApiDiscovery>> {
		self.discovery.as_ref().ok_or_else(|| ConfigError::MissingApiRoot.into())
	}

	/// Resolves the auth API and its dialect.
	///
	/// A missing version is treated as current.
	pub async fn auth_api(&self) -> Result<AuthApi> {
		let discovery = self.discovery()?;
		let api = discovery.api(AUTH_API).await?;
		let legacy = api
			.api_version()?
			.is_some_and(|version| version < ApiVersion::token_endpoint_cutover());
		let base = discovery.http_url(AUTH_API).await?;

		Ok(AuthApi { base, legacy })
	}

	/// Submits `grant` and parses the issued credential.
	pub async fn exchange(&self, grant: TokenGrant<'_>) -> Result<Credential> {
		let api = self.auth_api().await?;
		let request = self.grant_request(&api, &grant)?;

		tracing::debug!(
			grant_type = grant.grant_type(),
			legacy = api.legacy,
			url = %request.url,
			"submitting token request"
		);

		let response = self.http.execute(request).await?;
		let body = checked_body(&response)?;

		parse_credential(body, self.refresh_offset)
	}

	/// Revokes `token` (`token_type_hint` is `refresh_token` or `access_token`).
	pub async fn revoke(
		&self,
		client: &ClientCredentials,
		token: &TokenSecret,
		token_type_hint: &str,
	) -> Result<()> {
		let api = self.auth_api().await?;
		let url = api.endpoint("revoke")?;
		let request = if api.legacy {
			let mut body = client_json(client);

			body.insert("token".into(), token.expose().into());
			body.insert("token_type_hint".into(), token_type_hint.into());

			HttpRequest::post(url).json(&Value::Object(body))
		} else {
			let mut form = client_form(client);

			form.push(("token", token.expose()));
			form.push(("token_type_hint", token_type_hint));

			HttpRequest::post(url).form(form)
		};
		let response =
			self.http.execute(request.timeout(self.timeout).retries(self.retries)).await?;

		checked_body(&response).map(|_| ())
	}

	fn grant_request(&self, api: &AuthApi, grant: &TokenGrant<'_>) -> Result<HttpRequest> {
		let request = match (*grant, api.legacy) {
			(TokenGrant::Password { client, username, password }, true) => {
				let mut body = client_json(client);

				body.insert("username".into(), username.into());
				body.insert("password".into(), password.expose().into());

				HttpRequest::post(api.endpoint("app")?).json(&Value::Object(body))
			},
			(TokenGrant::Refresh { client, refresh_token }, true) => {
				let mut body = client_json(client);

				body.insert("refresh_token".into(), refresh_token.expose().into());

				HttpRequest::post(api.endpoint("refresh")?).json(&Value::Object(body))
			},
			(TokenGrant::Password { client, username, password }, false) => {
				let mut form = vec![("grant_type", grant.grant_type())];

				form.extend(client_form(client));
				form.push(("username", username));
				form.push(("password", password.expose()));

				HttpRequest::post(api.endpoint("token")?).form(form)
			},
			(TokenGrant::Refresh { client, refresh_token }, false) => {
				let mut form = vec![("grant_type", grant.grant_type())];

				form.extend(client_form(client));
				form.push(("refresh_token", refresh_token.expose()));

				HttpRequest::post(api.endpoint("token")?).form(form)
			},
			(TokenGrant::AuthorizationCode { client, code, verifier, redirect_uri }, _) => {
				let mut form = vec![("grant_type", grant.grant_type())];

				form.extend(client_form(client));
				form.push(("code", code));
				form.push(("code_verifier", verifier));
				form.push(("redirect_uri", redirect_uri.as_str()));

				HttpRequest::post(api.endpoint("token")?).form(form)
			},
		};

		Ok(request.timeout(self.timeout).retries(self.retries))
	}
}
impl Debug for ExchangeContext {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ExchangeContext")
			.field("discovery", &self.discovery)
			.field("refresh_offset", &self.refresh_offset)
			.field("timeout", &self.timeout)
			.field("retries", &self.retries)
			.finish()
	}
}

/// Token response accepting both the legacy and the OAuth field names.
#[derive(Debug, Deserialize)]
struct TokenResponse {
	#[serde(alias = "_TOKEN")]
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default, rename = "expires-at")]
	expires_at_ms: Option<i64>,
	#[serde(default)]
	expires_in: Option<u64>,
	#[serde(default, alias = "_IDENTITY")]
	identity: Option<String>,
	#[serde(default, alias = "_IDENTITY_ID")]
	identity_id: Option<String>,
	#[serde(default, alias = "_APPLICATION")]
	application: Option<String>,
}

fn client_json(client: &ClientCredentials) -> serde_json::Map<String, Value> {
	let mut body = serde_json::Map::new();

	body.insert("client_id".into(), client.client_id.to_string().into());

	if let Some(secret) = &client.client_secret {
		body.insert("client_secret".into(), secret.expose().into());
	}
	if let Some(organization) = &client.organization {
		body.insert("organization".into(), organization.as_str().into());
	}

	body
}

fn client_form(client: &ClientCredentials) -> Vec<(&str, &str)> {
	let mut form = vec![("client_id", &*client.client_id)];

	if let Some(secret) = &client.client_secret {
		form.push(("client_secret", secret.expose()));
	}
	if let Some(organization) = &client.organization {
		form.push(("organization", organization.as_str()));
	}

	form
}

/// Maps HTTP statuses and embedded `error` objects into the crate taxonomy.
fn checked_body(response: &HttpResponse) -> Result<&[u8]> {
	let reason = || error_message(&response.body, response.status);

	match response.status {
		200..=299 => {
			if let Some((code, message)) = embedded_error(&response.body) {
				return Err(match code {
					401 => Error::Unauthorized { reason: message },
					_ => Error::Authentication { reason: message },
				});
			}

			Ok(&response.body)
		},
		401 => Err(Error::Unauthorized { reason: reason() }),
		400..=499 => Err(Error::Authentication { reason: reason() }),
		status => Err(TransportError::status(status, &response.body).into()),
	}
}

fn embedded_error(body: &[u8]) -> Option<(u16, String)> {
	let value = serde_json::from_slice::<Value>(body).ok()?;
	let error = value.get("error")?.as_object()?;
	let code = error.get("code").and_then(Value::as_u64).unwrap_or(401);
	let message = error.get("message").and_then(Value::as_str).unwrap_or_default().to_owned();

	Some((u16::try_from(code).unwrap_or(u16::MAX), message))
}

fn error_message(body: &[u8], status: u16) -> String {
	let value = serde_json::from_slice::<Value>(body).unwrap_or_default();
	let message = value
		.pointer("/error/message")
		.or_else(|| value.get("error_description"))
		.or_else(|| value.get("message"))
		.or_else(|| value.get("error"))
		.and_then(Value::as_str);

	match message {
		Some(message) => message.to_owned(),
		None => format!("auth API answered HTTP {status}"),
	}
}

fn parse_credential(body: &[u8], refresh_offset: Duration) -> Result<Credential> {
	let mut de = serde_json::Deserializer::from_slice(body);
	let response: TokenResponse = serde_path_to_error::deserialize(&mut de).map_err(|e| {
		Error::Protocol {
			reason: format!("Token response is malformed at `{}`: {}", e.path(), e.inner()),
		}
	})?;
	let mut builder =
		Credential::builder().access_token(response.access_token).refresh_offset(refresh_offset);

	if let Some(refresh_token) = response.refresh_token.filter(|token| !token.is_empty()) {
		builder = builder.refresh_token(refresh_token);
	}
	if let Some(millis) = response.expires_at_ms {
		let instant = OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
			.map_err(|_| Error::Protocol {
				reason: format!("Token expiry `{millis}` is out of range"),
			})?;

		builder = builder.expires_at(instant);
	} else if let Some(secs) = response.expires_in {
		builder = builder.expires_in(Duration::from_secs(secs));
	}
	if let Some(identity) = response.identity {
		builder = builder.identity(identity);
	}
	if let Some(identity_id) = response.identity_id {
		builder = builder.identity_id(identity_id);
	}
	if let Some(application) = response.application {
		builder = builder.application(application);
	}

	builder.build().map_err(|e| match e {
		CredentialBuilderError::MissingAccessToken =>
			Error::Protocol { reason: "Token response carries an empty access token".into() },
		e => ConfigError::from(e).into(),
	})
}
