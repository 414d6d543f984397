//! Token lifecycle manager: single-flight acquisition, refresh, and revocation over a
//! [`TokenSource`].
//!
//! One manager is shared (`Arc`) by every session and REST caller that needs authorization.
//! The credential sits behind a read/write lock; every exchange additionally holds an async
//! single-flight mutex so concurrent callers collapse into one physical request.

// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::{
	_prelude::*,
	auth::{self, Credential, DEFAULT_REFRESH_OFFSET, TokenSecret},
	discovery::ApiDiscovery,
	http::HttpTransport,
	obs::{self, FlowKind, TokenMetrics},
	provider::{ExchangeContext, SourceKind, TokenGrant, TokenSource},
};

/// Configuration shared by the manager, its exchanges, and capability discovery.
#[derive(Clone, Debug)]
pub struct TokenManagerConfig {
	/// API root used for capability discovery (for example `https://core.example.com`).
	pub api_root: Option<Url>,
	/// Lead time before expiry at which credentials are refreshed.
	pub refresh_offset: Duration,
	/// Per-request timeout for auth and discovery calls.
	pub http_timeout: Duration,
	/// Additional attempts allowed after a transport failure.
	pub http_retries: u32,
}
impl TokenManagerConfig {
	/// Creates a config discovering APIs below `api_root`.
	pub fn new(api_root: Url) -> Self {
		Self { api_root: Some(api_root), ..Default::default() }
	}

	/// Parses `api_root` and creates a config from it.
	pub fn from_root(api_root: &str) -> Result<Self> {
		let url = Url::parse(api_root)
			.map_err(|e| crate::error::ConfigError::invalid_url(api_root, e))?;

		Ok(Self::new(url))
	}

	/// Overrides the refresh lead time.
	pub fn with_refresh_offset(mut self, offset: Duration) -> Self {
		self.refresh_offset = offset;

		self
	}

	/// Overrides the HTTP timeout.
	pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
		self.http_timeout = timeout;

		self
	}

	/// Overrides the HTTP retry budget.
	pub fn with_http_retries(mut self, retries: u32) -> Self {
		self.http_retries = retries;

		self
	}
}
impl Default for TokenManagerConfig {
	fn default() -> Self {
		Self {
			api_root: None,
			refresh_offset: DEFAULT_REFRESH_OFFSET,
			http_timeout: Duration::from_secs(30),
			http_retries: 1,
		}
	}
}

/// Owns the current credential and every exchange that replaces it.
pub struct TokenManager {
	source: Arc<dyn TokenSource>,
	ctx: ExchangeContext,
	credential: RwLock<Option<Credential>>,
	generation: AtomicU64,
	flight: AsyncMutex<()>,
	metrics: Arc<TokenMetrics>,
}
impl TokenManager {
	/// Creates a manager backed by the default reqwest transport.
	#[cfg(feature = "reqwest")]
	pub fn new(source: Arc<dyn TokenSource>, config: TokenManagerConfig) -> Self {
		Self::with_transport(
			source,
			config,
			Arc::new(crate::http::ReqwestHttpClient::default()),
		)
	}

	/// Creates a manager over a caller-supplied HTTP transport.
	pub fn with_transport(
		source: Arc<dyn TokenSource>,
		config: TokenManagerConfig,
		http: Arc<dyn HttpTransport>,
	) -> Self {
		let discovery = config.api_root.clone().map(|root| {
			Arc::new(
				ApiDiscovery::new(root, http.clone())
					.with_timeout(config.http_timeout)
					.with_retries(config.http_retries),
			)
		});

		Self::with_discovery(source, config, http, discovery)
	}

	/// Creates a manager sharing an existing discovery client.
	pub fn with_discovery(
		source: Arc<dyn TokenSource>,
		config: TokenManagerConfig,
		http: Arc<dyn HttpTransport>,
		discovery: Option<Arc<ApiDiscovery>>,
	) -> Self {
		let ctx = ExchangeContext::new(http, discovery, config.refresh_offset)
			.with_timeout(config.http_timeout)
			.with_retries(config.http_retries);

		Self {
			source,
			ctx,
			credential: RwLock::new(None),
			generation: AtomicU64::new(0),
			flight: AsyncMutex::new(()),
			metrics: Default::default(),
		}
	}

	/// Variant of the underlying token source.
	pub fn source_kind(&self) -> SourceKind {
		self.source.kind()
	}

	/// Capability discovery client, when an API root is configured.
	pub fn discovery(&self) -> Option<&Arc<ApiDiscovery>> {
		self.ctx.discovery().ok()
	}

	/// Counters for acquisitions and refreshes.
	pub fn metrics(&self) -> Arc<TokenMetrics> {
		self.metrics.clone()
	}

	/// Returns a valid access token, acquiring or refreshing as needed.
	///
	/// Concurrent callers collapse into a single exchange.
	pub async fn get_token(&self) -> Result<TokenSecret> {
		if !self.source.kind().is_mutable() {
			let credential = self.acquire().await?;

			return Ok(self.install(credential));
		}
		if let Some(token) = self.fresh_token() {
			return Ok(token);
		}

		let _flight = self.flight.lock().await;

		if let Some(token) = self.fresh_token() {
			return Ok(token);
		}

		let current = self.credential.read().clone();
		let credential = match current {
			Some(current) => self.refresh_locked(current).await?,
			None => self.acquire().await?,
		};

		Ok(self.install(credential))
	}

	/// Forces a refresh, falling back to a full acquisition when no refresh token exists.
	///
	/// Concurrent forced refreshes observed against the same credential collapse into one.
	pub async fn refresh_token(&self) -> Result<TokenSecret> {
		self.ensure_mutable()?;

		let observed = self.generation.load(Ordering::SeqCst);
		let _flight = self.flight.lock().await;

		if self.generation.load(Ordering::SeqCst) != observed {
			let token = self.credential.read().as_ref().map(|c| c.access_token.clone());

			if let Some(token) = token {
				return Ok(token);
			}
		}

		let current = self.credential.read().clone();
		let credential = match current {
			Some(current) => self.refresh_locked(current).await?,
			None => self.acquire().await?,
		};

		Ok(self.install(credential))
	}

	/// Revokes the refresh token (or the access token when none exists) and forgets the
	/// credential.
	pub async fn revoke_token(&self) -> Result<()> {
		self.ensure_mutable()?;

		let _flight = self.flight.lock().await;
		let Some(current) = self.credential.write().take() else {
			return Ok(());
		};

		self.generation.fetch_add(1, Ordering::SeqCst);

		let Some(client) = self.source.client() else {
			return Err(Error::NotSupported {
				reason: format!("{} source has no client credentials", self.source.kind()),
			});
		};
		let (token, hint) = match &current.refresh_token {
			Some(refresh_token) => (refresh_token, "refresh_token"),
			None => (&current.access_token, "access_token"),
		};

		obs::observe(FlowKind::Revoke, "revoke_token", self.ctx.revoke(client, token, hint)).await
	}

	/// Returns `true` when a credential is held.
	pub fn has_token(&self) -> bool {
		self.credential.read().is_some()
	}

	/// Returns `true` when the held credential carries a refresh token.
	pub fn has_refresh_token(&self) -> bool {
		self.credential.read().as_ref().is_some_and(|c| c.refresh_token.is_some())
	}

	/// Instant at which the held credential becomes due for refresh.
	pub fn expiry_instant(&self) -> Option<OffsetDateTime> {
		self.credential.read().as_ref().and_then(Credential::refresh_due)
	}

	/// Snapshot of the held credential.
	pub fn credential(&self) -> Option<Credential> {
		self.credential.read().clone()
	}

	/// Decodes the payload of the current token.
	pub async fn decode_token(&self) -> Result<Value> {
		let token = self.get_token().await?;

		auth::decode_token(token.expose())
	}

	/// Runs `request` with the current token, refreshing and retrying once on
	/// [`Error::Unauthorized`].
	pub async fn authorized<T, F, Fut>(&self, mut request: F) -> Result<T>
	where
		F: FnMut(TokenSecret) -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let token = self.get_token().await?;

		match request(token).await {
			Err(e) if e.is_unauthorized() && self.source.kind().is_mutable() => {
				tracing::debug!(error = %e, "request rejected; refreshing token and retrying once");

				let token = self.refresh_token().await?;

				request(token).await
			},
			outcome => outcome,
		}
	}

	fn fresh_token(&self) -> Option<TokenSecret> {
		self.credential
			.read()
			.as_ref()
			.filter(|credential| !credential.needs_refresh())
			.map(|credential| credential.access_token.clone())
	}

	fn ensure_mutable(&self) -> Result<()> {
		if self.source.kind().is_mutable() {
			Ok(())
		} else {
			Err(Error::NotSupported { reason: "cannot mutate fixed token".into() })
		}
	}

	fn install(&self, credential: Credential) -> TokenSecret {
		let token = credential.access_token.clone();

		*self.credential.write() = Some(credential);
		self.generation.fetch_add(1, Ordering::SeqCst);

		token
	}

	async fn acquire(&self) -> Result<Credential> {
		self.metrics.record_acquisition();

		obs::observe(FlowKind::Acquire, "acquire", self.source.acquire(&self.ctx)).await
	}

	/// Caller must hold `flight`.
	async fn refresh_locked(&self, current: Credential) -> Result<Credential> {
		self.metrics.record_refresh_attempt();

		let outcome = match (&current.refresh_token, self.source.client()) {
			(Some(refresh_token), Some(client)) => {
				let grant = TokenGrant::Refresh { client, refresh_token };

				match obs::observe(FlowKind::Refresh, "refresh_token", self.ctx.exchange(grant))
					.await
				{
					Ok(mut fresh) => {
						if fresh.refresh_token.is_none() {
							fresh.refresh_token = current.refresh_token.clone();
						}

						Ok(fresh)
					},
					Err(e) if e.is_authentication() => {
						tracing::info!(error = %e, "refresh rejected; re-acquiring credential");

						self.acquire().await
					},
					Err(e) => Err(e),
				}
			},
			_ => self.acquire().await,
		};

		match &outcome {
			Ok(_) => self.metrics.record_refresh_success(),
			Err(_) => self.metrics.record_refresh_failure(),
		}

		outcome
	}
}
impl Debug for TokenManager {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenManager")
			.field("source", &self.source.kind())
			.field("credential", &*self.credential.read())
			.field("generation", &self.generation.load(Ordering::Relaxed))
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		_preludet::{CountingSource, UnreachableHttp},
		provider::{EnvironmentSource, FixedSource},
	};

	fn manager(source: Arc<dyn TokenSource>) -> TokenManager {
		TokenManager::with_transport(source, TokenManagerConfig::default(), Arc::new(UnreachableHttp))
	}

	#[tokio::test]
	async fn fixed_tokens_cannot_be_mutated() {
		let manager = manager(Arc::new(FixedSource::new("literal")));

		assert_eq!(manager.get_token().await.expect("Fixed token should resolve.").expose(), "literal");
		assert!(manager.has_token());
		assert_eq!(manager.expiry_instant(), None);

		let err = manager.refresh_token().await.expect_err("Fixed refresh should fail.");

		assert!(matches!(err, Error::NotSupported { ref reason } if reason == "cannot mutate fixed token"));
		assert!(matches!(manager.revoke_token().await, Err(Error::NotSupported { .. })));
	}

	#[tokio::test]
	async fn environment_source_rereads_the_variable() {
		let variable = "HIRO_SESSION_TOKEN_MANAGER_TEST";
		let manager = manager(Arc::new(EnvironmentSource::new(variable)));

		// SAFETY: the variable name is unique to this test.
		unsafe { std::env::remove_var(variable) };

		assert!(matches!(manager.get_token().await, Err(Error::Authentication { .. })));

		// SAFETY: the variable name is unique to this test.
		unsafe { std::env::set_var(variable, "first") };

		assert_eq!(manager.get_token().await.expect("Variable should be read.").expose(), "first");

		// SAFETY: the variable name is unique to this test.
		unsafe { std::env::set_var(variable, "second") };

		assert_eq!(manager.get_token().await.expect("Variable should be re-read.").expose(), "second");
		assert!(matches!(manager.refresh_token().await, Err(Error::NotSupported { .. })));
	}

	#[tokio::test]
	async fn forced_refresh_without_refresh_token_reacquires() {
		let source = Arc::new(CountingSource::default());
		let manager = manager(source.clone());

		assert_eq!(manager.get_token().await.expect("Initial token should resolve.").expose(), "token-1");
		assert!(!manager.has_refresh_token());
		assert_eq!(
			manager.refresh_token().await.expect("Forced refresh should re-acquire.").expose(),
			"token-2"
		);
		assert_eq!(source.acquisitions(), 2);
		assert_eq!(manager.metrics().refresh_attempts(), 1);
		assert_eq!(manager.metrics().refresh_successes(), 1);
	}

	#[tokio::test]
	async fn authorized_retries_once_after_refresh() {
		let source = Arc::new(CountingSource::default());
		let manager = manager(source.clone());
		let seen = Mutex::new(Vec::new());
		let value = manager
			.authorized(|token| {
				seen.lock().push(token.expose().to_owned());

				let first = seen.lock().len() == 1;

				async move {
					if first {
						Err(Error::Unauthorized { reason: "expired".into() })
					} else {
						Ok(token.expose().len())
					}
				}
			})
			.await
			.expect("Second attempt should succeed.");

		assert_eq!(value, "token-2".len());
		assert_eq!(*seen.lock(), vec!["token-1".to_owned(), "token-2".to_owned()]);

		let err = manager
			.authorized(|_| async { Err::<(), _>(Error::Unauthorized { reason: "still".into() }) })
			.await
			.expect_err("Persistent rejection should surface.");

		assert!(err.is_unauthorized());
	}
}
