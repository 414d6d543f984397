// self
use crate::{
	_prelude::*,
	auth::Credential,
	provider::{ExchangeContext, SourceFuture, SourceKind, TokenSource},
};

/// Environment variable read by [`EnvironmentSource::default`].
pub const DEFAULT_TOKEN_VARIABLE: &str = "HIRO_TOKEN";

/// Source re-reading a token from an environment variable on every call.
#[derive(Clone, Debug)]
pub struct EnvironmentSource {
	variable: String,
}
impl EnvironmentSource {
	/// Reads the token from `variable`.
	pub fn new(variable: impl Into<String>) -> Self {
		Self { variable: variable.into() }
	}

	/// Name of the variable being read.
	pub fn variable(&self) -> &str {
		&self.variable
	}
}
impl Default for EnvironmentSource {
	fn default() -> Self {
		Self::new(DEFAULT_TOKEN_VARIABLE)
	}
}
impl TokenSource for EnvironmentSource {
	fn kind(&self) -> SourceKind {
		SourceKind::Environment
	}

	fn acquire<'a>(&'a self, ctx: &'a ExchangeContext) -> SourceFuture<'a, Credential> {
		Box::pin(async move {
			let token = std::env::var(&self.variable).unwrap_or_default();

			if token.is_empty() {
				return Err(Error::Authentication {
					reason: format!("Environment variable `{}` is missing or empty", self.variable),
				});
			}

			Credential::builder()
				.access_token(token)
				.refresh_offset(ctx.refresh_offset())
				.build()
				.map_err(|e| crate::error::ConfigError::from(e).into())
		})
	}
}
