// self
use crate::{
	_prelude::*,
	auth::{Credential, TokenSecret},
	error::ConfigError,
	provider::{ExchangeContext, SourceFuture, SourceKind, TokenSource},
};

/// Source returning a caller-supplied literal token that never expires.
#[derive(Clone, Debug)]
pub struct FixedSource {
	token: TokenSecret,
}
impl FixedSource {
	/// Wraps a literal token.
	pub fn new(token: impl Into<String>) -> Self {
		Self { token: TokenSecret::new(token) }
	}
}
impl TokenSource for FixedSource {
	fn kind(&self) -> SourceKind {
		SourceKind::Fixed
	}

	fn acquire<'a>(&'a self, ctx: &'a ExchangeContext) -> SourceFuture<'a, Credential> {
		Box::pin(async move {
			Credential::builder()
				.access_token(self.token.expose())
				.refresh_offset(ctx.refresh_offset())
				.build()
				.map_err(|e| ConfigError::from(e).into())
		})
	}
}
