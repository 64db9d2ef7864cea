//! # Open Trust — Rust client runtime
//!
//! Client-side runtime for Open Trust federations: subjects inside named
//! trust domains authenticate to services by presenting short-lived,
//! signed Verifiable Identity Documents (OTVIDs).
//!
//! The crate provides:
//!
//! - [`Otid`] / [`TrustDomain`] — the federated identifier grammar
//! - [`Otvid`] — the identity document: build, sign, parse, verify
//! - [`KeySet`] — JWK keysets: parse, fetch, derive public, pick signers
//! - [`OtClient`] — the per-subject client composing discovery, caching,
//!   single-flight renewal, and verification
//! - [`ServiceClient`] — authenticated calls with the OTVID as bearer token
//!
//! ## Quick start
//!
//! ```
//! use open_trust::{lookup_public_keys, new_private_key, Algorithm, KeySet, Otvid, TrustDomain};
//!
//! # fn main() -> Result<(), open_trust::Error> {
//! let td = TrustDomain::new("ot.example.com");
//!
//! let mut vid = Otvid::new(
//!     td.new_otid("user", "joe")?,
//!     td.otid(),
//!     td.new_otid("svc", "auth")?,
//! );
//!
//! let key = new_private_key(Algorithm::ES256)?;
//! let token = vid.sign(&key)?;
//!
//! let public = lookup_public_keys(&KeySet::new(vec![key])?);
//! let parsed = Otvid::parse(&token, &public, &vid.issuer, &vid.audience)?;
//! assert_eq!(parsed.id, vid.id);
//! # Ok(())
//! # }
//! ```

mod cache;

pub mod client;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod keys;
pub mod otid;
pub mod otvid;
pub mod types;

// Re-export primary types at the crate root.
pub use client::{DomainResolver, OtClient, ServiceClient};
pub use endpoint::select_endpoints;
pub use error::Error;
pub use http::{add_token_to_headers, extract_token_from_headers, with_headers, HttpClient, Method};
pub use keys::{
    fetch_keys, lookup_public_keys, lookup_signing_key, new_private_key, parse_key, parse_keys,
    Algorithm, Key, KeySet,
};
pub use otid::{Otid, TrustDomain};
pub use otvid::Otvid;
pub use types::{
    DiscoveryDocument, DomainConfig, Response, ServiceConfig, SignInput, SignOutput,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
