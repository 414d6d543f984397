#![cfg(feature = "reqwest")]

// crates.io
use httpmock::prelude::*;
use serde_json::json;
// self
use hiro_session::{
	_preludet::*,
	auth::ClientId,
	discovery::{ApiDiscovery, ApiVersion},
	http::ReqwestHttpClient,
	provider::{AuthCodePkceSource, ClientCredentials, PasswordSource},
	token::{TokenManager, TokenManagerConfig},
};

const CLIENT_ID: &str = "client-hiro";
const CLIENT_SECRET: &str = "secret-hiro";
const USERNAME: &str = "ops@example.com";
const PASSWORD: &str = "hunter2";

fn client() -> ClientCredentials {
	let id = ClientId::new(CLIENT_ID).expect("Client identifier fixture should be valid.");

	ClientCredentials::new(id, CLIENT_SECRET)
}

fn password_manager(server: &MockServer) -> TokenManager {
	let config = TokenManagerConfig::from_root(&server.base_url())
		.expect("Mock server root should parse.")
		.with_http_retries(0);

	TokenManager::new(Arc::new(PasswordSource::new(client(), USERNAME, PASSWORD)), config)
}

async fn mock_discovery<'a>(server: &'a MockServer, auth_version: &str) -> httpmock::Mock<'a> {
	let document = json!({
		"auth": { "endpoint": "/api/auth/6", "version": auth_version },
		"events-ws": { "endpoint": "/api/events-ws/6", "protocol": "events-1.0.0", "version": "6.6" },
	});

	server
		.mock_async(|when, then| {
			when.method(GET).path("/api/version");
			then.status(200).header("content-type", "application/json").json_body(document);
		})
		.await
}

fn password_form() -> String {
	format!(
		"grant_type=password&client_id={CLIENT_ID}&client_secret={CLIENT_SECRET}&username=ops%40example.com&password={PASSWORD}"
	)
}

#[tokio::test]
async fn legacy_auth_api_logs_in_with_json_on_app() {
	let server = MockServer::start_async().await;
	let discovery = mock_discovery(&server, "6.5").await;
	let login = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/6/app").json_body(json!({
				"client_id": CLIENT_ID,
				"client_secret": CLIENT_SECRET,
				"username": USERNAME,
				"password": PASSWORD,
			}));
			then.status(200).header("content-type", "application/json").json_body(json!({
				"_TOKEN": "legacy-token",
				"refresh_token": "legacy-refresh",
				"expires-at": 4_102_444_800_000_i64,
				"_IDENTITY": USERNAME,
				"_IDENTITY_ID": "ogit/Identity:1",
				"_APPLICATION": "cockpit",
			}));
		})
		.await;
	let manager = password_manager(&server);
	let token = manager.get_token().await.expect("Legacy login should succeed.");

	assert_eq!(token.expose(), "legacy-token");
	assert!(manager.has_refresh_token());

	let credential = manager.credential().expect("Credential should be held after login.");

	assert_eq!(credential.identity.as_deref(), Some(USERNAME));
	assert_eq!(credential.identity_id.as_deref(), Some("ogit/Identity:1"));
	assert_eq!(credential.application.as_deref(), Some("cockpit"));
	assert_eq!(manager.expiry_instant(), credential.refresh_due());

	login.assert_calls_async(1).await;
	discovery.assert_calls_async(1).await;
}

#[tokio::test]
async fn current_auth_api_logs_in_with_form_on_token() {
	let server = MockServer::start_async().await;
	let _discovery = mock_discovery(&server, "6.10").await;
	let login = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/api/auth/6/token")
				.header("content-type", "application/x-www-form-urlencoded")
				.body(password_form());
			then.status(200).header("content-type", "application/json").json_body(json!({
				"access_token": "form-token",
				"refresh_token": "form-refresh",
				"expires_in": 3_600,
			}));
		})
		.await;
	let manager = password_manager(&server);
	let (first, second) = tokio::join!(manager.get_token(), manager.get_token());

	assert_eq!(first.expect("First concurrent login should succeed.").expose(), "form-token");
	assert_eq!(second.expect("Second concurrent login should succeed.").expose(), "form-token");
	assert_eq!(manager.metrics().acquisitions(), 1);

	login.assert_calls_async(1).await;
}

#[tokio::test]
async fn rejected_refresh_falls_back_to_login() {
	let server = MockServer::start_async().await;
	let _discovery = mock_discovery(&server, "6.6").await;
	let login = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/6/token").body(password_form());
			then.status(200).header("content-type", "application/json").json_body(json!({
				"access_token": "fresh-token",
				"refresh_token": "stale-refresh",
				"expires_in": 3_600,
			}));
		})
		.await;
	let refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/6/token").body(format!(
				"grant_type=refresh_token&client_id={CLIENT_ID}&client_secret={CLIENT_SECRET}&refresh_token=stale-refresh"
			));
			then.status(401)
				.header("content-type", "application/json")
				.json_body(json!({ "error": { "code": 401, "message": "refresh token expired" } }));
		})
		.await;
	let manager = password_manager(&server);

	manager.get_token().await.expect("Initial login should succeed.");

	let token = manager.refresh_token().await.expect("Rejected refresh should fall back to login.");

	assert_eq!(token.expose(), "fresh-token");
	assert_eq!(manager.metrics().refresh_attempts(), 1);
	assert_eq!(manager.metrics().refresh_successes(), 1);

	refresh.assert_calls_async(1).await;
	login.assert_calls_async(2).await;
}

#[tokio::test]
async fn embedded_errors_in_successful_responses_are_classified() {
	let server = MockServer::start_async().await;
	let _discovery = mock_discovery(&server, "6.6").await;
	let _login = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/6/token");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "error": { "code": 403, "message": "account locked" } }));
		})
		.await;
	let manager = password_manager(&server);
	let err = manager.get_token().await.expect_err("Embedded errors should fail the login.");

	assert!(matches!(err, Error::Authentication { ref reason } if reason == "account locked"));
	assert!(!manager.has_token());
}

#[tokio::test]
async fn authorized_retries_once_after_unauthorized() {
	let server = MockServer::start_async().await;
	let _discovery = mock_discovery(&server, "6.6").await;
	let login = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/6/token").body(password_form());
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "access_token": "rest-token", "expires_in": 3_600 }));
		})
		.await;
	let manager = password_manager(&server);
	let mut calls = 0;
	let outcome = manager
		.authorized(|token| {
			calls += 1;

			let first = calls == 1;

			async move {
				if first {
					Err(Error::Unauthorized { reason: format!("{} rejected", token.expose()) })
				} else {
					Ok(token.expose().to_owned())
				}
			}
		})
		.await
		.expect("Second attempt should succeed.");

	assert_eq!(outcome, "rest-token");
	assert_eq!(calls, 2);

	login.assert_calls_async(2).await;
}

#[tokio::test]
async fn pkce_code_is_exchanged_once() {
	let server = MockServer::start_async().await;
	let _discovery = mock_discovery(&server, "6.6").await;
	let exchange = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/api/auth/6/token")
				.header("content-type", "application/x-www-form-urlencoded");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "access_token": "pkce-token", "expires_in": 600 }));
		})
		.await;
	let redirect = Url::parse("http://localhost:8080/callback").expect("Redirect URI should parse.");
	let id = ClientId::new(CLIENT_ID).expect("Client identifier fixture should be valid.");
	let source = Arc::new(AuthCodePkceSource::new(ClientCredentials::public(id), redirect));
	let config = TokenManagerConfig::from_root(&server.base_url())
		.expect("Mock server root should parse.")
		.with_http_retries(0);
	let manager = TokenManager::new(source.clone(), config);
	let discovery = manager.discovery().expect("Discovery should be configured.").clone();
	let authorize = source
		.authorization_url(&discovery)
		.await
		.expect("Authorize URL should resolve through discovery.");
	let pairs: HashMap<String, String> = authorize.query_pairs().into_owned().collect();

	assert_eq!(authorize.path(), "/api/auth/6/authorize");
	assert_eq!(pairs.get("code_challenge_method").map(String::as_str), Some("S256"));
	assert_eq!(pairs.get("client_id").map(String::as_str), Some(CLIENT_ID));

	let state = pairs.get("state").expect("Authorize URL should carry a state.");

	assert!(matches!(
		source.handle_callback("forged-state", "code-1"),
		Err(Error::Authentication { .. })
	));

	source.handle_callback(state, "code-1").expect("Matching state should be accepted.");

	assert_eq!(manager.get_token().await.expect("Code exchange should succeed.").expose(), "pkce-token");
	assert!(!source.has_pending_code());
	assert!(matches!(manager.refresh_token().await, Err(Error::Unauthorized { .. })));

	exchange.assert_calls_async(1).await;
}

#[tokio::test]
async fn pkce_acquire_before_callback_keeps_the_handshake() {
	let server = MockServer::start_async().await;
	let _discovery = mock_discovery(&server, "6.6").await;
	let exchange = server
		.mock_async(|when, then| {
			when.method(POST)
				.path("/api/auth/6/token")
				.header("content-type", "application/x-www-form-urlencoded");
			then.status(200)
				.header("content-type", "application/json")
				.json_body(json!({ "access_token": "late-pkce-token", "expires_in": 600 }));
		})
		.await;
	let redirect = Url::parse("http://localhost:8080/callback").expect("Redirect URI should parse.");
	let id = ClientId::new(CLIENT_ID).expect("Client identifier fixture should be valid.");
	let source = Arc::new(AuthCodePkceSource::new(ClientCredentials::public(id), redirect));
	let config = TokenManagerConfig::from_root(&server.base_url())
		.expect("Mock server root should parse.")
		.with_http_retries(0);
	let manager = TokenManager::new(source.clone(), config);
	let discovery = manager.discovery().expect("Discovery should be configured.").clone();
	let authorize = source
		.authorization_url(&discovery)
		.await
		.expect("Authorize URL should resolve through discovery.");
	let state = authorize
		.query_pairs()
		.find(|(key, _)| key == "state")
		.map(|(_, value)| value.into_owned())
		.expect("Authorize URL should carry a state.");

	assert!(matches!(manager.get_token().await, Err(Error::Unauthorized { .. })));

	source.handle_callback(&state, "code-1").expect("Matching state should be accepted.");

	assert_eq!(
		manager.get_token().await.expect("Late callback should still be exchanged.").expose(),
		"late-pkce-token"
	);
	assert!(!source.has_pending_code());

	exchange.assert_calls_async(1).await;
}

#[tokio::test]
async fn discovery_reports_versions_and_missing_apis() {
	let server = MockServer::start_async().await;
	let document = mock_discovery(&server, "6.10.2").await;
	let root = Url::parse(&server.base_url()).expect("Mock server root should parse.");
	let discovery = ApiDiscovery::new(root, Arc::new(ReqwestHttpClient::default()));
	let (auth, events) = tokio::join!(discovery.api("auth"), discovery.ws_url("events-ws"));
	let version = auth
		.expect("Auth API should be listed.")
		.api_version()
		.expect("Auth version should parse.")
		.expect("Auth version should be reported.");

	assert!(version > ApiVersion::token_endpoint_cutover());

	let (url, protocol) = events.expect("Events API should resolve to a WebSocket URL.");

	assert_eq!(url.scheme(), "ws");
	assert_eq!(url.path(), "/api/events-ws/6");
	assert_eq!(protocol.as_deref(), Some("events-1.0.0"));
	assert!(matches!(
		discovery.api("graph").await,
		Err(Error::Config(hiro_session::error::ConfigError::MissingApi { ref name })) if name == "graph"
	));

	document.assert_calls_async(1).await;
}
