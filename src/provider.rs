//! Token sources: the strategies a [`TokenManager`](crate::token::TokenManager) uses to obtain
//! credentials.
//!
//! Each variant lives in its own module. Refresh, revocation, and expiry math are shared and live
//! in the manager; a source only knows how to acquire a fresh credential and which client
//! credentials (if any) back it.

pub mod environment;
pub mod exchange;
pub mod fixed;
pub mod password;
pub mod pkce;

pub use environment::*;
pub use exchange::*;
pub use fixed::*;
pub use password::*;
pub use pkce::*;

// self
use crate::{
	_prelude::*,
	auth::{ClientId, Credential, TokenSecret},
};

/// Boxed future returned by [`TokenSource::acquire`].
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a + Send>>;

/// Variant tag reported by a [`TokenSource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
	/// Literal token supplied by the caller.
	Fixed,
	/// Token read from an environment variable on every call.
	Environment,
	/// Resource-owner password grant against the auth API.
	PasswordGrant,
	/// Authorization code grant with PKCE.
	AuthCodePkce,
}
impl SourceKind {
	/// Returns `false` for sources whose token cannot be refreshed or revoked.
	pub const fn is_mutable(self) -> bool {
		matches!(self, SourceKind::PasswordGrant | SourceKind::AuthCodePkce)
	}

	/// Returns a stable label suitable for log fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			SourceKind::Fixed => "fixed",
			SourceKind::Environment => "environment",
			SourceKind::PasswordGrant => "password",
			SourceKind::AuthCodePkce => "auth_code_pkce",
		}
	}
}
impl Display for SourceKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Strategy that knows how to obtain a credential.
///
/// Implementors are required to be `Send + Sync`; the manager serializes calls to
/// [`acquire`](TokenSource::acquire) so sources never see concurrent acquisitions.
pub trait TokenSource
where
	Self: 'static + Send + Sync,
{
	/// Variant of this source.
	fn kind(&self) -> SourceKind;

	/// Obtains a brand-new credential.
	fn acquire<'a>(&'a self, ctx: &'a ExchangeContext) -> SourceFuture<'a, Credential>;

	/// Client credentials used for refresh and revocation exchanges.
	fn client(&self) -> Option<&ClientCredentials> {
		None
	}
}

/// OAuth client registration presented to the auth API.
#[derive(Clone)]
pub struct ClientCredentials {
	/// Registered client identifier.
	pub client_id: ClientId,
	/// Client secret; public clients omit it.
	pub client_secret: Option<TokenSecret>,
	/// Organization the user logs into, when the account spans several.
	pub organization: Option<String>,
}
impl ClientCredentials {
	/// Confidential client with a secret.
	pub fn new(client_id: ClientId, client_secret: impl Into<String>) -> Self {
		Self {
			client_id,
			client_secret: Some(TokenSecret::new(client_secret)),
			organization: None,
		}
	}

	/// Public client without a secret.
	pub fn public(client_id: ClientId) -> Self {
		Self { client_id, client_secret: None, organization: None }
	}

	/// Sets the organization.
	pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
		self.organization = Some(organization.into());

		self
	}
}
impl Debug for ClientCredentials {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ClientCredentials")
			.field("client_id", &self.client_id)
			.field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
			.field("organization", &self.organization)
			.finish()
	}
}
