// self
use crate::{
	_prelude::*,
	auth::{Credential, TokenSecret},
	provider::{ClientCredentials, ExchangeContext, SourceFuture, SourceKind, TokenGrant, TokenSource},
};

/// Resource-owner password grant against the discovered auth API.
#[derive(Clone)]
pub struct PasswordSource {
	client: ClientCredentials,
	username: String,
	password: TokenSecret,
}
impl PasswordSource {
	/// Creates a source logging in as `username` through `client`.
	pub fn new(
		client: ClientCredentials,
		username: impl Into<String>,
		password: impl Into<String>,
	) -> Self {
		Self { client, username: username.into(), password: TokenSecret::new(password) }
	}

	/// Username presented to the auth API.
	pub fn username(&self) -> &str {
		&self.username
	}
}
impl Debug for PasswordSource {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("PasswordSource")
			.field("client", &self.client)
			.field("username", &self.username)
			.field("password", &"<redacted>")
			.finish()
	}
}
impl TokenSource for PasswordSource {
	fn kind(&self) -> SourceKind {
		SourceKind::PasswordGrant
	}

	fn acquire<'a>(&'a self, ctx: &'a ExchangeContext) -> SourceFuture<'a, Credential> {
		Box::pin(ctx.exchange(TokenGrant::Password {
			client: &self.client,
			username: &self.username,
			password: &self.password,
		}))
	}

	fn client(&self) -> Option<&ClientCredentials> {
		Some(&self.client)
	}
}
