//! Request/response transport used for token exchanges and capability discovery.
//!
//! The crate never talks to an HTTP stack directly. Token sources and discovery build an
//! [`HttpRequest`] (method, URL, headers, body, timeout, retry budget) and hand it to an
//! [`HttpTransport`]. [`ReqwestHttpClient`] is the default implementation; tests and custom
//! deployments can supply their own.

// std
use std::ops::Deref;
// crates.io
#[cfg(feature = "reqwest")] use reqwest::header::{HeaderMap, RETRY_AFTER};
#[cfg(feature = "reqwest")] use time::format_description::well_known::Rfc2822;
// self
use crate::_prelude::*;
#[cfg(feature = "reqwest")] use crate::error::{ConfigError, TransportError};

/// Boxed future returned by [`HttpTransport::execute`].
pub type HttpFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpResponse>> + 'a + Send>>;

/// Abstraction over HTTP stacks capable of executing a single request/response exchange.
///
/// Implementations own their retry loop: a request carries the number of additional attempts
/// allowed after a transport-level failure. HTTP error statuses are returned as ordinary
/// responses so callers can classify them.
pub trait HttpTransport
where
	Self: 'static + Send + Sync,
{
	/// Executes `request`, retrying transport failures up to `request.retries` times.
	fn execute(&self, request: HttpRequest) -> HttpFuture<'_>;
}

/// HTTP verbs used by this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
	/// `GET`
	Get,
	/// `POST`
	Post,
}
impl HttpMethod {
	/// Returns the canonical method name.
	pub const fn as_str(self) -> &'static str {
		match self {
			HttpMethod::Get => "GET",
			HttpMethod::Post => "POST",
		}
	}
}

/// Outbound request handed to an [`HttpTransport`].
#[derive(Clone)]
pub struct HttpRequest {
	/// HTTP verb.
	pub method: HttpMethod,
	/// Absolute target URL.
	pub url: Url,
	/// Header name/value pairs.
	pub headers: Vec<(String, String)>,
	/// Optional request body.
	pub body: Option<Vec<u8>>,
	/// Per-attempt timeout.
	pub timeout: Duration,
	/// Additional attempts allowed after a transport failure.
	pub retries: u32,
}
impl HttpRequest {
	const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

	/// Creates a `GET` request.
	pub fn get(url: Url) -> Self {
		Self::new(HttpMethod::Get, url)
	}

	/// Creates a `POST` request.
	pub fn post(url: Url) -> Self {
		Self::new(HttpMethod::Post, url)
	}

	fn new(method: HttpMethod, url: Url) -> Self {
		Self {
			method,
			url,
			headers: vec![("accept".into(), "application/json".into())],
			body: None,
			timeout: Self::DEFAULT_TIMEOUT,
			retries: 0,
		}
	}

	/// Appends a header.
	pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));

		self
	}

	/// Attaches a JSON body.
	pub fn json(mut self, body: &Value) -> Self {
		self.body = Some(body.to_string().into_bytes());

		self.header("content-type", "application/json")
	}

	/// Attaches an `application/x-www-form-urlencoded` body.
	pub fn form<'a, I>(mut self, pairs: I) -> Self
	where
		I: IntoIterator<Item = (&'a str, &'a str)>,
	{
		let mut serializer = url::form_urlencoded::Serializer::new(String::new());

		for (key, value) in pairs {
			serializer.append_pair(key, value);
		}

		self.body = Some(serializer.finish().into_bytes());

		self.header("content-type", "application/x-www-form-urlencoded")
	}

	/// Attaches a bearer authorization header.
	pub fn bearer(self, token: &str) -> Self {
		self.header("authorization", format!("Bearer {token}"))
	}

	/// Overrides the per-attempt timeout.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;

		self
	}

	/// Overrides the retry budget.
	pub fn retries(mut self, retries: u32) -> Self {
		self.retries = retries;

		self
	}
}
impl Debug for HttpRequest {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("HttpRequest")
			.field("method", &self.method)
			.field("url", &self.url.as_str())
			.field("body_len", &self.body.as_ref().map(Vec::len))
			.field("timeout", &self.timeout)
			.field("retries", &self.retries)
			.finish()
	}
}

/// Response returned by an [`HttpTransport`].
#[derive(Clone, Debug, Default)]
pub struct HttpResponse {
	/// HTTP status code.
	pub status: u16,
	/// Raw response body.
	pub body: Vec<u8>,
	/// Retry-After hint expressed as a relative duration.
	pub retry_after: Option<Duration>,
}
impl HttpResponse {
	/// Returns `true` for 2xx statuses.
	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}
}

/// Thin wrapper around [`ReqwestClient`] so shared HTTP behavior lives in one place.
///
/// Transport failures and `429`/`503` answers are retried within the request's budget, waiting
/// for the server's Retry-After hint when one is supplied.
#[cfg(feature = "reqwest")]
#[derive(Clone, Default)]
pub struct ReqwestHttpClient(pub ReqwestClient);
#[cfg(feature = "reqwest")]
impl ReqwestHttpClient {
	const RETRY_DELAY: Duration = Duration::from_secs(1);

	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}

	async fn attempt(&self, request: &HttpRequest) -> Result<HttpResponse> {
		let method = match request.method {
			HttpMethod::Get => reqwest::Method::GET,
			HttpMethod::Post => reqwest::Method::POST,
		};
		let mut builder =
			self.0.request(method, request.url.clone()).timeout(request.timeout);

		for (name, value) in &request.headers {
			builder = builder.header(name.as_str(), value.as_str());
		}
		if let Some(body) = &request.body {
			builder = builder.body(body.clone());
		}

		let response = builder.send().await.map_err(map_reqwest_error)?;
		let status = response.status().as_u16();
		let retry_after = parse_retry_after(response.headers());
		let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

		Ok(HttpResponse { status, body, retry_after })
	}
}
#[cfg(feature = "reqwest")]
impl AsRef<ReqwestClient> for ReqwestHttpClient {
	fn as_ref(&self) -> &ReqwestClient {
		&self.0
	}
}
#[cfg(feature = "reqwest")]
impl Deref for ReqwestHttpClient {
	type Target = ReqwestClient;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
#[cfg(feature = "reqwest")]
impl HttpTransport for ReqwestHttpClient {
	fn execute(&self, request: HttpRequest) -> HttpFuture<'_> {
		Box::pin(async move {
			let mut attempt = 0;

			loop {
				let outcome = self.attempt(&request).await;
				let retry_in = match &outcome {
					Ok(response) if matches!(response.status, 429 | 503) =>
						response.retry_after.unwrap_or(Self::RETRY_DELAY),
					Ok(_) => return outcome,
					Err(Error::Transport(_)) | Err(Error::Timeout { .. }) => Self::RETRY_DELAY,
					Err(_) => return outcome,
				};

				if attempt >= request.retries {
					return outcome;
				}

				attempt += 1;

				tracing::debug!(
					method = request.method.as_str(),
					url = %request.url,
					attempt,
					delay_ms = retry_in.as_millis() as u64,
					"retrying HTTP request"
				);
				tokio::time::sleep(retry_in).await;
			}
		})
	}
}

#[cfg(feature = "reqwest")]
fn map_reqwest_error(err: ReqwestError) -> Error {
	if err.is_builder() {
		return ConfigError::from(err).into();
	}
	if err.is_timeout() {
		return Error::Timeout { operation: "HTTP response" };
	}

	TransportError::from(err).into()
}

#[cfg(feature = "reqwest")]
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
	let value = headers.get(RETRY_AFTER)?;
	let raw = value.to_str().ok()?.trim();

	if let Ok(secs) = raw.parse::<u64>() {
		return Some(Duration::from_secs(secs));
	}
	if let Ok(moment) = OffsetDateTime::parse(raw, &Rfc2822) {
		let delta = moment - OffsetDateTime::now_utc();

		if delta.is_positive() {
			return Duration::try_from(delta).ok();
		}
	}

	None
}
