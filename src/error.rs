//! Error types for the Open Trust client runtime.

use thiserror::Error;

/// Unified error type for all Open Trust operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An OTID or trust domain violates the identifier grammar or length bounds.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A JWK is malformed, has an unrecognized algorithm, or lacks a key id.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Signing or verifying an OTVID token failed.
    #[error("signature error: {0}")]
    Signature(String),

    /// A registered claim did not match expectations (issuer, audience, expiry).
    #[error("claim mismatch: {0}")]
    ClaimMismatch(String),

    /// A token violates length bounds or carries malformed claims.
    #[error("token format error: {0}")]
    TokenFormat(String),

    /// Domain discovery failed: OTID mismatch, unparseable keys, or no live endpoint.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A network operation failed, returned a non-success status, or produced
    /// an undecodable response.
    #[error("transport error: {0}")]
    Transport(String),

    /// An operation was cut short by a deadline.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
