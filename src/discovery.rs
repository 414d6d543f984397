//! Capability discovery: resolves per-API endpoints, protocols, and versions from
//! `GET {root}/api/version`.

// std
use std::{
	cmp::Ordering as CmpOrdering,
	hash::{Hash, Hasher},
};
// self
use crate::{
	_prelude::*,
	error::{ConfigError, TransportError},
	http::{HttpRequest, HttpTransport},
	obs::{self, FlowKind},
};

/// Name of the authentication API in the discovery document.
pub const AUTH_API: &str = "auth";
/// Name of the event-stream WebSocket API.
pub const EVENTS_WS_API: &str = "events-ws";
/// Name of the action WebSocket API.
pub const ACTION_WS_API: &str = "action-ws";

/// One entry of the discovery document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
	/// Path of the API relative to the root.
	pub endpoint: String,
	/// Subprotocol advertised for WebSocket APIs.
	#[serde(default)]
	pub protocol: Option<String>,
	/// Version string as reported by the peer.
	#[serde(default)]
	pub version: Option<String>,
}
impl ApiEndpoint {
	/// Parses the reported version, if any.
	pub fn api_version(&self) -> Result<Option<ApiVersion>> {
		self.version.as_deref().map(str::parse).transpose().map_err(Error::from)
	}
}

/// Dotted numeric version compared component by component.
///
/// Missing components count as zero, so `6.6` and `6.6.0` are equal.
#[derive(Clone, Debug)]
pub struct ApiVersion(Vec<u64>);
impl ApiVersion {
	/// First version whose auth API uses the form-encoded `/token` endpoints.
	pub fn token_endpoint_cutover() -> Self {
		Self(vec![6, 6])
	}

	/// Builds a version from its components.
	pub fn new(parts: impl Into<Vec<u64>>) -> Self {
		Self(parts.into())
	}

	fn significant(&self) -> &[u64] {
		let len = self.0.iter().rposition(|part| *part != 0).map_or(0, |idx| idx + 1);

		&self.0[..len]
	}
}
impl PartialEq for ApiVersion {
	fn eq(&self, other: &Self) -> bool {
		self.significant() == other.significant()
	}
}
impl Eq for ApiVersion {}
impl Hash for ApiVersion {
	fn hash<H>(&self, state: &mut H)
	where
		H: Hasher,
	{
		self.significant().hash(state);
	}
}
impl FromStr for ApiVersion {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let invalid = || ConfigError::InvalidVersion { value: s.to_owned() };
		let trimmed = s.trim().trim_start_matches(['v', 'V']);

		if trimmed.is_empty() {
			return Err(invalid());
		}

		trimmed
			.split('.')
			.map(|part| {
				let digits = part.split(|c: char| !c.is_ascii_digit()).next().unwrap_or_default();

				digits.parse::<u64>().map_err(|_| invalid())
			})
			.collect::<Result<Vec<_>, _>>()
			.map(Self)
	}
}
impl Ord for ApiVersion {
	fn cmp(&self, other: &Self) -> CmpOrdering {
		let len = self.0.len().max(other.0.len());

		for idx in 0..len {
			let lhs = self.0.get(idx).copied().unwrap_or(0);
			let rhs = other.0.get(idx).copied().unwrap_or(0);

			match lhs.cmp(&rhs) {
				CmpOrdering::Equal => continue,
				ordering => return ordering,
			}
		}

		CmpOrdering::Equal
	}
}
impl PartialOrd for ApiVersion {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}
impl Display for ApiVersion {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		for (idx, part) in self.0.iter().enumerate() {
			if idx > 0 {
				f.write_str(".")?;
			}

			write!(f, "{part}")?;
		}

		Ok(())
	}
}

/// Cached discovery client bound to one API root.
///
/// The document is fetched at most once; concurrent first callers share a single request.
pub struct ApiDiscovery {
	root: Url,
	http: Arc<dyn HttpTransport>,
	timeout: Duration,
	retries: u32,
	cache: RwLock<Option<Arc<BTreeMap<String, ApiEndpoint>>>>,
	flight: AsyncMutex<()>,
}
impl ApiDiscovery {
	/// Creates a discovery client for `root` (for example `https://core.example.com`).
	pub fn new(root: Url, http: Arc<dyn HttpTransport>) -> Self {
		Self {
			root: with_trailing_slash(root),
			http,
			timeout: Duration::from_secs(30),
			retries: 0,
			cache: RwLock::new(None),
			flight: AsyncMutex::new(()),
		}
	}

	/// Overrides the request timeout.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;

		self
	}

	/// Overrides the request retry budget.
	pub fn with_retries(mut self, retries: u32) -> Self {
		self.retries = retries;

		self
	}

	/// API root this client resolves against.
	pub fn root(&self) -> &Url {
		&self.root
	}

	/// Returns the discovery entry for `name`, fetching the document on first use.
	pub async fn api(&self, name: &str) -> Result<ApiEndpoint> {
		let apis = self.apis().await?;

		apis.get(name).cloned().ok_or_else(|| ConfigError::MissingApi { name: name.into() }.into())
	}

	/// Returns the absolute HTTP(S) URL of the API called `name`, with a trailing slash.
	pub async fn http_url(&self, name: &str) -> Result<Url> {
		let api = self.api(name).await?;

		self.resolve(&api.endpoint).map(with_trailing_slash)
	}

	/// Returns the WebSocket URL and subprotocol of the API called `name`.
	///
	/// `http` roots map to `ws`, `https` roots map to `wss`.
	pub async fn ws_url(&self, name: &str) -> Result<(Url, Option<String>)> {
		let api = self.api(name).await?;
		let mut url = self.resolve(&api.endpoint)?;
		let scheme = match url.scheme() {
			"http" | "ws" => "ws",
			"https" | "wss" => "wss",
			other => return Err(ConfigError::UnsupportedScheme { scheme: other.into() }.into()),
		};

		url.set_scheme(scheme)
			.map_err(|_| ConfigError::UnsupportedScheme { scheme: scheme.into() })?;

		Ok((url, api.protocol))
	}

	/// Returns the full discovery document.
	pub async fn apis(&self) -> Result<Arc<BTreeMap<String, ApiEndpoint>>> {
		if let Some(cached) = self.cache.read().clone() {
			return Ok(cached);
		}

		let _flight = self.flight.lock().await;

		if let Some(cached) = self.cache.read().clone() {
			return Ok(cached);
		}

		let fetched = Arc::new(
			obs::observe(FlowKind::Discovery, "api_version", self.fetch()).await?,
		);

		*self.cache.write() = Some(fetched.clone());

		Ok(fetched)
	}

	async fn fetch(&self) -> Result<BTreeMap<String, ApiEndpoint>> {
		let url = self.resolve("api/version")?;
		let request = HttpRequest::get(url).timeout(self.timeout).retries(self.retries);
		let response = self.http.execute(request).await?;

		if !response.is_success() {
			return Err(TransportError::status(response.status, &response.body).into());
		}

		let mut de = serde_json::Deserializer::from_slice(&response.body);

		serde_path_to_error::deserialize(&mut de).map_err(|e| Error::Protocol {
			reason: format!("Discovery document is malformed at `{}`: {}", e.path(), e.inner()),
		})
	}

	fn resolve(&self, path: &str) -> Result<Url> {
		self.root
			.join(path.trim_start_matches('/'))
			.map_err(|e| ConfigError::invalid_url(path, e).into())
	}
}
impl Debug for ApiDiscovery {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ApiDiscovery")
			.field("root", &self.root.as_str())
			.field("cached", &self.cache.read().is_some())
			.finish()
	}
}

/// Ensures `url` ends with `/` so relative joins append instead of replacing the last segment.
pub fn with_trailing_slash(mut url: Url) -> Url {
	if !url.path().ends_with('/') {
		let path = format!("{}/", url.path());

		url.set_path(&path);
	}

	url
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn versions_compare_numerically() {
		let v6_6: ApiVersion = "6.6".parse().expect("6.6 should parse.");
		let v6_10: ApiVersion = "6.10.1".parse().expect("6.10.1 should parse.");
		let v6_5: ApiVersion = "6.5.99".parse().expect("6.5.99 should parse.");

		assert!(v6_10 > v6_6);
		assert!(v6_5 < ApiVersion::token_endpoint_cutover());
		assert_eq!("6.6.0".parse::<ApiVersion>().expect("6.6.0 should parse."), v6_6);
		assert_eq!(v6_10.to_string(), "6.10.1");
	}

	#[test]
	fn equality_and_hashing_agree_with_ordering() {
		let short = ApiVersion::new([6, 6]);
		let padded = ApiVersion::new([6, 6, 0, 0]);
		let zero = ApiVersion::new([0]);

		assert_eq!(short.cmp(&padded), CmpOrdering::Equal);
		assert_eq!(short, padded);
		assert_eq!(zero, ApiVersion::new(Vec::<u64>::new()));
		assert_ne!(short, ApiVersion::new([6, 6, 1]));
		assert_eq!(padded.to_string(), "6.6.0.0");

		let versions: std::collections::HashSet<ApiVersion> = [short, padded].into_iter().collect();

		assert_eq!(versions.len(), 1);
	}

	#[test]
	fn versions_tolerate_prefixes_and_suffixes() {
		assert_eq!(
			"v6.6-rc1".parse::<ApiVersion>().expect("Prefixed version should parse."),
			ApiVersion::new([6, 6])
		);
		assert!("".parse::<ApiVersion>().is_err());
		assert!("latest".parse::<ApiVersion>().is_err());
	}

	#[test]
	fn trailing_slash_is_added_once() {
		let url = Url::parse("https://core.example.com/api/auth/6.6")
			.expect("Fixture URL should parse.");
		let url = with_trailing_slash(with_trailing_slash(url));

		assert_eq!(url.as_str(), "https://core.example.com/api/auth/6.6/");
		assert_eq!(
			url.join("token").expect("Join should succeed.").as_str(),
			"https://core.example.com/api/auth/6.6/token"
		);
	}
}
