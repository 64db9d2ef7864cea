//! JWK key store: parse, fetch, derive public keys, pick signing keys, and
//! generate new private keys.
//!
//! Keys are carried as raw JWK parameter maps and handed to `josekit` only
//! at the point of signing or verification, so sets can be serialized,
//! filtered, and copied without touching key material.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use josekit::jwk::alg::ec::EcCurve;
use josekit::jwk::Jwk;
use josekit::jws::{
    JwsSigner, JwsVerifier, ES256, ES384, ES512, PS256, PS384, PS512, RS256, RS384, RS512,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::http::HttpClient;

/// The JWS signature algorithms recognized by the trust fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    RS256,
    RS384,
    RS512,
    PS256,
    PS384,
    PS512,
    ES256,
    ES384,
    ES512,
}

impl Algorithm {
    /// The IANA name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RS256 => "RS256",
            Algorithm::RS384 => "RS384",
            Algorithm::RS512 => "RS512",
            Algorithm::PS256 => "PS256",
            Algorithm::PS384 => "PS384",
            Algorithm::PS512 => "PS512",
            Algorithm::ES256 => "ES256",
            Algorithm::ES384 => "ES384",
            Algorithm::ES512 => "ES512",
        }
    }

    pub(crate) fn signer_for(&self, key: &Key) -> Result<Box<dyn JwsSigner>, Error> {
        const OP: &str = "Algorithm::signer_for";
        let jwk = key.to_jwk()?;
        let signer: Box<dyn JwsSigner> = match self {
            Algorithm::RS256 => Box::new(map_key_err(OP, RS256.signer_from_jwk(&jwk))?),
            Algorithm::RS384 => Box::new(map_key_err(OP, RS384.signer_from_jwk(&jwk))?),
            Algorithm::RS512 => Box::new(map_key_err(OP, RS512.signer_from_jwk(&jwk))?),
            Algorithm::PS256 => Box::new(map_key_err(OP, PS256.signer_from_jwk(&jwk))?),
            Algorithm::PS384 => Box::new(map_key_err(OP, PS384.signer_from_jwk(&jwk))?),
            Algorithm::PS512 => Box::new(map_key_err(OP, PS512.signer_from_jwk(&jwk))?),
            Algorithm::ES256 => Box::new(map_key_err(OP, ES256.signer_from_jwk(&jwk))?),
            Algorithm::ES384 => Box::new(map_key_err(OP, ES384.signer_from_jwk(&jwk))?),
            Algorithm::ES512 => Box::new(map_key_err(OP, ES512.signer_from_jwk(&jwk))?),
        };
        Ok(signer)
    }

    pub(crate) fn verifier_for(&self, key: &Key) -> Result<Box<dyn JwsVerifier>, Error> {
        const OP: &str = "Algorithm::verifier_for";
        let jwk = key.to_jwk()?;
        let verifier: Box<dyn JwsVerifier> = match self {
            Algorithm::RS256 => Box::new(map_key_err(OP, RS256.verifier_from_jwk(&jwk))?),
            Algorithm::RS384 => Box::new(map_key_err(OP, RS384.verifier_from_jwk(&jwk))?),
            Algorithm::RS512 => Box::new(map_key_err(OP, RS512.verifier_from_jwk(&jwk))?),
            Algorithm::PS256 => Box::new(map_key_err(OP, PS256.verifier_from_jwk(&jwk))?),
            Algorithm::PS384 => Box::new(map_key_err(OP, PS384.verifier_from_jwk(&jwk))?),
            Algorithm::PS512 => Box::new(map_key_err(OP, PS512.verifier_from_jwk(&jwk))?),
            Algorithm::ES256 => Box::new(map_key_err(OP, ES256.verifier_from_jwk(&jwk))?),
            Algorithm::ES384 => Box::new(map_key_err(OP, ES384.verifier_from_jwk(&jwk))?),
            Algorithm::ES512 => Box::new(map_key_err(OP, ES512.verifier_from_jwk(&jwk))?),
        };
        Ok(verifier)
    }
}

fn map_key_err<T>(op: &str, res: Result<T, josekit::JoseError>) -> Result<T, Error> {
    res.map_err(|e| Error::InvalidKey(format!("{op}: unusable key material: {e}")))
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RS256" => Ok(Algorithm::RS256),
            "RS384" => Ok(Algorithm::RS384),
            "RS512" => Ok(Algorithm::RS512),
            "PS256" => Ok(Algorithm::PS256),
            "PS384" => Ok(Algorithm::PS384),
            "PS512" => Ok(Algorithm::PS512),
            "ES256" => Ok(Algorithm::ES256),
            "ES384" => Ok(Algorithm::ES384),
            "ES512" => Ok(Algorithm::ES512),
            _ => Err(Error::InvalidKey(format!(
                "Algorithm::parse: invalid algorithm '{s}'"
            ))),
        }
    }
}

/// A single JWK carrying an algorithm tag and a key id.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    params: Map<String, Value>,
}

impl Key {
    /// Wrap a raw JWK parameter map, validating algorithm and key id.
    pub fn from_map(params: Map<String, Value>) -> Result<Self, Error> {
        let key = Key { params };
        key.validate()?;
        Ok(key)
    }

    /// Return an error if the key has an unrecognized algorithm or no key id.
    pub fn validate(&self) -> Result<(), Error> {
        self.algorithm()?;
        if self.key_id().is_empty() {
            return Err(Error::InvalidKey("Key::validate: kid required".to_string()));
        }
        Ok(())
    }

    /// The key's signature algorithm.
    pub fn algorithm(&self) -> Result<Algorithm, Error> {
        self.param_str("alg").parse()
    }

    /// The key id, or an empty string when absent.
    pub fn key_id(&self) -> &str {
        self.param_str("kid")
    }

    /// The JWK key type (`RSA`, `EC`, ...), or an empty string when absent.
    pub fn key_type(&self) -> &str {
        self.param_str("kty")
    }

    /// True if the key carries private material of a recognized type.
    pub fn is_private(&self) -> bool {
        matches!(self.key_type(), "RSA" | "EC") && self.params.contains_key("d")
    }

    /// Derive the public key, copying the `alg`, `kid`, `use`, and `key_ops`
    /// attributes. A public key is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] for key types other than RSA and EC.
    pub fn to_public_key(&self) -> Result<Key, Error> {
        let members: &[&str] = match (self.key_type(), self.params.contains_key("d")) {
            ("RSA", true) => &["kty", "n", "e"],
            ("EC", true) => &["kty", "crv", "x", "y"],
            ("RSA", false) | ("EC", false) => return Ok(self.clone()),
            (kty, _) => {
                return Err(Error::InvalidKey(format!(
                    "Key::to_public_key: invalid key type '{kty}'"
                )));
            }
        };

        let mut params = Map::new();
        for name in members.iter().chain(["alg", "kid", "use", "key_ops"].iter()) {
            if let Some(v) = self.params.get(*name) {
                params.insert((*name).to_string(), v.clone());
            }
        }
        Key::from_map(params)
    }

    /// The raw JWK parameter map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.params
    }

    pub(crate) fn to_jwk(&self) -> Result<Jwk, Error> {
        Jwk::from_map(self.params.clone())
            .map_err(|e| Error::InvalidKey(format!("Key::to_jwk: invalid JWK: {e}")))
    }

    fn param_str(&self, name: &str) -> &str {
        self.params.get(name).and_then(Value::as_str).unwrap_or_default()
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.params.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let params = Map::deserialize(deserializer)?;
        Key::from_map(params).map_err(serde::de::Error::custom)
    }
}

/// An ordered collection of validated keys, serialized as `{"keys":[...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeySet {
    keys: Vec<Key>,
}

impl KeySet {
    /// Build a keyset from validated keys.
    pub fn new(keys: Vec<Key>) -> Result<Self, Error> {
        let ks = KeySet { keys };
        ks.validate()?;
        Ok(ks)
    }

    /// Return an error if any key in the set is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        for key in &self.keys {
            key.validate()?;
        }
        Ok(())
    }

    /// The keys in order.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Find a key by its key id.
    pub fn find(&self, kid: &str) -> Option<&Key> {
        self.keys.iter().find(|k| k.key_id() == kid)
    }
}

/// Parse a single JWK from its JSON form.
pub fn parse_key(s: &str) -> Result<Key, Error> {
    let value: Value =
        serde_json::from_str(s).map_err(|e| Error::InvalidKey(format!("parse_key: {e}")))?;
    let map = value
        .as_object()
        .ok_or_else(|| Error::InvalidKey("parse_key: key must be a JSON object".to_string()))?;
    Key::from_map(map.clone())
}

/// Parse a keyset from JSON, accepting either a single key object or a
/// keyset wrapper `{"keys":[...]}`.
pub fn parse_keys(s: &str) -> Result<KeySet, Error> {
    if s.contains("\"keys\"") {
        serde_json::from_str(s).map_err(|e| Error::InvalidKey(format!("parse_keys: {e}")))
    } else {
        let key = parse_key(s)?;
        KeySet::new(vec![key])
    }
}

/// Fetch a keyset from an HTTP URL.
pub async fn fetch_keys(client: &HttpClient, url: &str) -> Result<KeySet, Error> {
    client.get(url).await
}

/// Derive the public counterparts of every convertible key in the set,
/// preserving order and key ids.
pub fn lookup_public_keys(ks: &KeySet) -> KeySet {
    KeySet {
        keys: ks.keys().iter().filter_map(|k| k.to_public_key().ok()).collect(),
    }
}

/// Pick the signing key of a keyset: the key at index 1 when the set holds
/// two or more keys, else the key at index 0. During rotation the next
/// signer is appended at position 1 while the old signer at position 0
/// remains for verification.
///
/// # Errors
///
/// Returns [`Error::InvalidKey`] for an empty set or a non-private choice.
pub fn lookup_signing_key(ks: &KeySet) -> Result<&Key, Error> {
    if ks.is_empty() {
        return Err(Error::InvalidKey(
            "lookup_signing_key: no keys exist".to_string(),
        ));
    }
    let key = if ks.len() > 1 { &ks.keys()[1] } else { &ks.keys()[0] };
    if !key.is_private() {
        return Err(Error::InvalidKey(format!(
            "lookup_signing_key: key '{}' is not a private key",
            key.key_id()
        )));
    }
    Ok(key)
}

/// Generate a new private key for the given algorithm.
///
/// RS\*/PS\* keys are RSA-2048; ES256/384/512 use P-256/P-384/P-521. The
/// key id is assigned deterministically from the key material (RFC 7638
/// thumbprint).
pub fn new_private_key(alg: Algorithm) -> Result<Key, Error> {
    let jwk = match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => Jwk::generate_rsa_key(2048),
        Algorithm::ES256 => Jwk::generate_ec_key(EcCurve::P256),
        Algorithm::ES384 => Jwk::generate_ec_key(EcCurve::P384),
        Algorithm::ES512 => Jwk::generate_ec_key(EcCurve::P521),
    }
    .map_err(|e| Error::InvalidKey(format!("new_private_key: generate key: {e}")))?;

    let mut params = Map::new();
    for name in ["kty", "crv", "n", "e", "d", "p", "q", "dp", "dq", "qi", "x", "y"] {
        if let Some(v) = jwk.parameter(name) {
            params.insert(name.to_string(), v.clone());
        }
    }
    params.insert("alg".to_string(), Value::String(alg.as_str().to_string()));
    let kid = thumbprint(&params)?;
    params.insert("kid".to_string(), Value::String(kid));
    Key::from_map(params)
}

// RFC 7638: SHA-256 over the canonical JSON of the required members,
// base64url-encoded without padding.
fn thumbprint(params: &Map<String, Value>) -> Result<String, Error> {
    let kty = params.get("kty").and_then(Value::as_str).unwrap_or_default();
    let members: &[&str] = match kty {
        "RSA" => &["e", "kty", "n"],
        "EC" => &["crv", "kty", "x", "y"],
        _ => {
            return Err(Error::InvalidKey(format!(
                "new_private_key: invalid key type '{kty}'"
            )));
        }
    };

    let mut canonical = String::from("{");
    for (i, name) in members.iter().enumerate() {
        let v = params.get(*name).and_then(Value::as_str).ok_or_else(|| {
            Error::InvalidKey(format!(
                "new_private_key: missing '{name}' member for key id"
            ))
        })?;
        if i > 0 {
            canonical.push(',');
        }
        canonical.push_str(&format!("\"{name}\":\"{v}\""));
    }
    canonical.push('}');

    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
}
