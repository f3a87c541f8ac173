//! Small shared helpers.
//!
//! - **URL validation**: endpoint URLs from the config file are checked
//!   before a probe client is built for them
//! - **Content hashing**: the fallback validator used when a response has
//!   neither an ETag nor a Last-Modified header

mod url_validator;

use sha2::{Digest, Sha256};

pub use url_validator::{validate_endpoint_url, UrlValidationError};

/// Hex-encoded SHA-256 of a payload.
pub fn content_hash(payload: &[u8]) -> String {
    let hash = Sha256::digest(payload);
    format!("{:x}", hash)
}
