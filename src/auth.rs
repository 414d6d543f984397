//! Credential model, token decoding, and validated identifiers.

pub mod credential;
pub mod decode;
pub mod id;

pub use credential::*;
pub use decode::*;
pub use id::*;
