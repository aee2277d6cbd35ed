//! Provider client module.
//!
//! - `transport`: wire types and the HTTP transport
//! - `credentials`: ordered API keys with rotation and redaction
//! - `provider`: retry, backoff and rotation policy over a transport

mod credentials;
mod provider;
mod transport;

pub use credentials::*;
pub use provider::*;
pub use transport::*;
