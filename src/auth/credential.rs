//! Bearer credential model, refresh-due math, and the redacting secret wrapper.

// crates.io
use time::{Date, Duration as TimeDuration};
// self
use crate::_prelude::*;

/// Default lead time subtracted from the expiry instant before a refresh becomes due.
pub const DEFAULT_REFRESH_OFFSET: Duration = Duration::from_secs(5);

/// Redacted token secret wrapper keeping sensitive material out of logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSecret(String);
impl TokenSecret {
	/// Wraps a new secret string.
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the inner token value. Callers must avoid logging this string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}
impl AsRef<str> for TokenSecret {
	fn as_ref(&self) -> &str {
		self.expose()
	}
}
impl Debug for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("TokenSecret").field(&"<redacted>").finish()
	}
}
impl Display for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}

/// Errors produced by [`CredentialBuilder`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum CredentialBuilderError {
	/// Issued when no (or an empty) access token value was provided.
	#[error("Access token is required.")]
	MissingAccessToken,
	/// The relative expiry cannot be represented as an instant.
	#[error("The expires_in value exceeds the supported range.")]
	ExpiryOutOfRange,
}

/// Bearer credential held by the token manager.
///
/// `expires_at == None` means the credential never expires on its own; it is only replaced
/// when the peer rejects it.
#[derive(Clone)]
pub struct Credential {
	/// Access token secret; callers must avoid logging it.
	pub access_token: TokenSecret,
	/// Refresh token secret, if the auth API issued one.
	pub refresh_token: Option<TokenSecret>,
	/// Absolute expiry instant, if known.
	pub expires_at: Option<OffsetDateTime>,
	/// Identity (user) the token was issued to.
	pub identity: Option<String>,
	/// Graph id of the identity.
	pub identity_id: Option<String>,
	/// Application the token was issued for.
	pub application: Option<String>,
	/// Lead time before `expires_at` at which the credential is refreshed.
	pub refresh_offset: Duration,
}
impl Credential {
	/// Returns a builder for assembling credentials from token responses.
	pub fn builder() -> CredentialBuilder {
		CredentialBuilder::default()
	}

	/// Instant at which the credential should be refreshed, or `None` if it never expires.
	pub fn refresh_due(&self) -> Option<OffsetDateTime> {
		self.expires_at.map(|expires_at| refresh_due(expires_at, self.refresh_offset))
	}

	/// Returns `true` if a refresh is due at the provided instant.
	pub fn needs_refresh_at(&self, instant: OffsetDateTime) -> bool {
		self.refresh_due().is_some_and(|due| instant >= due)
	}

	/// Returns `true` if a refresh is due relative to the current clock.
	pub fn needs_refresh(&self) -> bool {
		self.needs_refresh_at(OffsetDateTime::now_utc())
	}

	/// Returns `true` if the credential has passed its hard expiry at the provided instant.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		self.expires_at.is_some_and(|expires_at| instant >= expires_at)
	}
}
impl Debug for Credential {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Credential")
			.field("access_token", &"<redacted>")
			.field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
			.field("expires_at", &self.expires_at)
			.field("identity", &self.identity)
			.field("identity_id", &self.identity_id)
			.field("application", &self.application)
			.field("refresh_offset", &self.refresh_offset)
			.finish()
	}
}

/// Builder for [`Credential`].
#[derive(Clone, Debug)]
pub struct CredentialBuilder {
	access_token: Option<TokenSecret>,
	refresh_token: Option<TokenSecret>,
	issued_at: Option<OffsetDateTime>,
	expires_at: Option<OffsetDateTime>,
	expires_in: Option<Duration>,
	identity: Option<String>,
	identity_id: Option<String>,
	application: Option<String>,
	refresh_offset: Duration,
}
impl Default for CredentialBuilder {
	fn default() -> Self {
		Self {
			access_token: None,
			refresh_token: None,
			issued_at: None,
			expires_at: None,
			expires_in: None,
			identity: None,
			identity_id: None,
			application: None,
			refresh_offset: DEFAULT_REFRESH_OFFSET,
		}
	}
}
impl CredentialBuilder {
	/// Provides the access token value.
	pub fn access_token(mut self, token: impl Into<String>) -> Self {
		self.access_token = Some(TokenSecret::new(token));

		self
	}

	/// Provides the refresh token value.
	pub fn refresh_token(mut self, token: impl Into<String>) -> Self {
		self.refresh_token = Some(TokenSecret::new(token));

		self
	}

	/// Sets the instant `expires_in` is measured from (defaults to now).
	pub fn issued_at(mut self, instant: OffsetDateTime) -> Self {
		self.issued_at = Some(instant);

		self
	}

	/// Sets an absolute expiry instant.
	pub fn expires_at(mut self, instant: OffsetDateTime) -> Self {
		self.expires_at = Some(instant);

		self
	}

	/// Sets a relative expiry duration.
	pub fn expires_in(mut self, duration: Duration) -> Self {
		self.expires_in = Some(duration);

		self
	}

	/// Records the identity the token belongs to.
	pub fn identity(mut self, identity: impl Into<String>) -> Self {
		self.identity = Some(identity.into());

		self
	}

	/// Records the graph id of the identity.
	pub fn identity_id(mut self, identity_id: impl Into<String>) -> Self {
		self.identity_id = Some(identity_id.into());

		self
	}

	/// Records the application the token was issued for.
	pub fn application(mut self, application: impl Into<String>) -> Self {
		self.application = Some(application.into());

		self
	}

	/// Overrides the refresh lead time.
	pub fn refresh_offset(mut self, offset: Duration) -> Self {
		self.refresh_offset = offset;

		self
	}

	/// Consumes the builder and produces a [`Credential`].
	pub fn build(self) -> Result<Credential, CredentialBuilderError> {
		let access_token = self
			.access_token
			.filter(|token| !token.expose().is_empty())
			.ok_or(CredentialBuilderError::MissingAccessToken)?;
		let expires_at = match (self.expires_at, self.expires_in) {
			(Some(instant), _) => Some(instant),
			(None, Some(delta)) => {
				let issued_at = self.issued_at.unwrap_or_else(OffsetDateTime::now_utc);
				let delta = TimeDuration::try_from(delta)
					.map_err(|_| CredentialBuilderError::ExpiryOutOfRange)?;

				Some(
					issued_at
						.checked_add(delta)
						.ok_or(CredentialBuilderError::ExpiryOutOfRange)?,
				)
			},
			(None, None) => None,
		};

		Ok(Credential {
			access_token,
			refresh_token: self.refresh_token,
			expires_at,
			identity: self.identity,
			identity_id: self.identity_id,
			application: self.application,
			refresh_offset: self.refresh_offset,
		})
	}
}

/// Computes `expires_at - offset`, clamped to the earliest representable instant.
pub fn refresh_due(expires_at: OffsetDateTime, offset: Duration) -> OffsetDateTime {
	TimeDuration::try_from(offset)
		.ok()
		.and_then(|offset| expires_at.checked_sub(offset))
		.unwrap_or_else(earliest_instant)
}

fn earliest_instant() -> OffsetDateTime {
	Date::MIN.midnight().assume_utc()
}
