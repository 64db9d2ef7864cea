//! The Open Trust Verifiable Identity Document: build, sign, parse, and
//! verify.
//!
//! An OTVID is a signed JWT with the registered claims `sub`, `iss`, `aud`
//! (a one-element array), `iat`, `exp`, the optional revocation hint `rid`,
//! and arbitrary private claims. The serialized token is recorded on the
//! document after signing or parsing.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::keys::{Algorithm, Key, KeySet};
use crate::otid::Otid;

const MIN_TOKEN_SIZE: usize = 64;
const MAX_TOKEN_SIZE: usize = 2048;

/// Caches schedule renewal this long before expiry.
const RENEW_WINDOW: Duration = Duration::from_secs(10);

/// Default document lifetime when no expiry is set.
const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// An Open Trust Verifiable Identity Document.
#[derive(Debug, Clone, Default)]
pub struct Otvid {
    /// The OTID the document attests to (`sub`).
    pub id: Otid,
    /// The issuing authority (`iss`).
    pub issuer: Otid,
    /// The intended recipient (`aud`).
    pub audience: Otid,
    /// Expiration time (`exp`).
    pub expiry: Option<SystemTime>,
    /// Issuance time (`iat`).
    pub issued_at: Option<SystemTime>,
    /// Revocation-hint string (`rid`), empty when absent.
    pub release_id: String,
    /// Additional claims carried by the token.
    pub claims: Map<String, Value>,
    /// The serialized signed form, populated by sign or parse.
    token: String,
}

impl Otvid {
    /// Build an unsigned document attesting `id` to `audience`, issued by
    /// `issuer`. Expiry, release id, and extra claims are set on the value
    /// before signing.
    pub fn new(id: Otid, issuer: Otid, audience: Otid) -> Otvid {
        Otvid {
            id,
            issuer,
            audience,
            ..Otvid::default()
        }
    }

    /// The serialized signed token, empty until signed or parsed.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// True if the document carries a release id, signaling that the holder
    /// should interrogate the authority before trusting it.
    pub fn maybe_revoked(&self) -> bool {
        !self.release_id.is_empty()
    }

    /// True if the document expires within the renewal window (or has no
    /// expiry at all).
    pub fn should_renew(&self) -> bool {
        match self.expiry {
            None => true,
            Some(exp) => SystemTime::now() + RENEW_WINDOW >= exp,
        }
    }

    /// Return an error if any of the three OTIDs is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        self.id.validate().map_err(|e| {
            Error::InvalidIdentifier(format!("Otvid::validate: sub OTID invalid: {e}"))
        })?;
        self.issuer.validate().map_err(|e| {
            Error::InvalidIdentifier(format!("Otvid::validate: iss OTID invalid: {e}"))
        })?;
        self.audience.validate().map_err(|e| {
            Error::InvalidIdentifier(format!("Otvid::validate: aud OTID invalid: {e}"))
        })?;
        Ok(())
    }

    /// The document's claim set as a JSON object.
    ///
    /// Free-form claims are merged first and the registered claims written
    /// after, so callers cannot forge identity fields through the map.
    pub fn to_claims(&self) -> Map<String, Value> {
        let mut claims = self.claims.clone();
        claims.insert("sub".to_string(), Value::String(self.id.to_string()));
        claims.insert("iss".to_string(), Value::String(self.issuer.to_string()));
        claims.insert(
            "aud".to_string(),
            Value::Array(vec![Value::String(self.audience.to_string())]),
        );
        if let Some(iat) = self.issued_at {
            claims.insert("iat".to_string(), Value::from(unix_seconds(iat)));
        }
        if let Some(exp) = self.expiry {
            claims.insert("exp".to_string(), Value::from(unix_seconds(exp)));
        }
        if !self.release_id.is_empty() {
            claims.insert("rid".to_string(), Value::String(self.release_id.clone()));
        }
        claims
    }

    /// Sign the document with the given private key and record the token.
    ///
    /// `iat` is set to the current second; an unset expiry defaults to
    /// `iat` + 10 minutes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidKey`] for a non-private or malformed key,
    /// [`Error::Signature`] when signing fails, and
    /// [`Error::TokenFormat`] when the token exceeds 2048 bytes.
    pub fn sign(&mut self, key: &Key) -> Result<String, Error> {
        key.validate()?;
        if !key.is_private() {
            return Err(Error::InvalidKey(format!(
                "Otvid::sign: signing requires a private key, got '{}'",
                key.key_type()
            )));
        }
        let alg = key.algorithm()?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Signature(format!("Otvid::sign: system clock error: {e}")))?;
        self.issued_at = Some(UNIX_EPOCH + Duration::from_secs(now.as_secs()));
        if self.expiry.is_none() {
            self.expiry = self.issued_at.map(|iat| iat + DEFAULT_TTL);
        }

        let mut header = Map::new();
        header.insert("alg".to_string(), Value::String(alg.as_str().to_string()));
        header.insert("kid".to_string(), Value::String(key.key_id().to_string()));
        header.insert("typ".to_string(), Value::String("JWT".to_string()));

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&self.to_claims())?)
        );
        let sig = alg
            .signer_for(key)?
            .sign(signing_input.as_bytes())
            .map_err(|e| Error::Signature(format!("Otvid::sign: {e}")))?;
        let token = format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig));

        if token.len() > MAX_TOKEN_SIZE {
            return Err(Error::TokenFormat(format!(
                "Otvid::sign: token length {} exceeds {MAX_TOKEN_SIZE}",
                token.len()
            )));
        }
        self.token = token.clone();
        Ok(token)
    }

    /// Re-verify an already-signed or parsed document: OTIDs, claims against
    /// the expected issuer and audience, and the token signature.
    pub fn verify(&self, keys: &KeySet, issuer: &Otid, audience: &Otid) -> Result<(), Error> {
        self.validate()?;
        self.verify_claims(issuer, audience)?;
        if self.token.is_empty() {
            return Err(Error::TokenFormat(
                "Otvid::verify: no token recorded".to_string(),
            ));
        }
        verify_signature("Otvid::verify", &self.token, keys)
    }

    /// Parse an OTVID from a serialized token, verifying the signature
    /// against the keyset and the claims against the expected issuer and
    /// audience.
    pub fn parse(
        token: &str,
        keys: &KeySet,
        issuer: &Otid,
        audience: &Otid,
    ) -> Result<Otvid, Error> {
        const OP: &str = "Otvid::parse";
        check_token_size(OP, token)?;
        if keys.is_empty() {
            return Err(Error::InvalidKey(format!("{OP}: public keys required")));
        }
        verify_signature(OP, token, keys)?;
        let vid = decode_token(OP, token)?;
        vid.validate()?;
        vid.verify_claims(issuer, audience)?;
        Ok(vid)
    }

    /// Parse an OTVID without verifying the signature.
    ///
    /// Callers must subsequently call [`Otvid::verify`], or trust the
    /// channel the token arrived on.
    pub fn parse_insecure(token: &str) -> Result<Otvid, Error> {
        const OP: &str = "Otvid::parse_insecure";
        check_token_size(OP, token)?;
        let vid = decode_token(OP, token)?;
        vid.validate()?;
        Ok(vid)
    }

    /// Build an OTVID from a token and its already-parsed claim set, as
    /// returned by the authority's verify endpoint.
    pub fn from_claims(token: &str, claims: Map<String, Value>) -> Result<Otvid, Error> {
        let id = Otid::parse(str_claim(&claims, "sub"))?;
        let issuer = Otid::parse(str_claim(&claims, "iss"))?;
        let audience = Otid::parse(first_audience(&claims))?;

        let release_id = match claims.get("rid") {
            None => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(Error::TokenFormat(
                    "Otvid::from_claims: invalid 'rid' claim, must be a string".to_string(),
                ));
            }
        };

        Ok(Otvid {
            id,
            issuer,
            audience,
            expiry: time_claim(&claims, "exp"),
            issued_at: time_claim(&claims, "iat"),
            release_id,
            claims,
            token: token.to_string(),
        })
    }

    fn verify_claims(&self, issuer: &Otid, audience: &Otid) -> Result<(), Error> {
        if self.issuer != *issuer {
            return Err(Error::ClaimMismatch(
                "Otvid::verify: issuer not satisfied".to_string(),
            ));
        }
        if self.audience != *audience {
            return Err(Error::ClaimMismatch(
                "Otvid::verify: audience not satisfied".to_string(),
            ));
        }
        match self.expiry {
            Some(exp) if SystemTime::now() < exp => Ok(()),
            _ => Err(Error::ClaimMismatch(
                "Otvid::verify: expiration time not satisfied".to_string(),
            )),
        }
    }
}

fn check_token_size(op: &str, token: &str) -> Result<(), Error> {
    let len = token.len();
    if !(MIN_TOKEN_SIZE..=MAX_TOKEN_SIZE).contains(&len) {
        return Err(Error::TokenFormat(format!(
            "{op}: invalid OTVID token with length {len}"
        )));
    }
    Ok(())
}

// Split a compact JWS into its three base64url segments.
fn split_token<'a>(op: &str, token: &'a str) -> Result<(&'a str, &'a str, &'a str), Error> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) => Ok((h, p, s)),
        _ => Err(Error::TokenFormat(format!(
            "{op}: invalid compact JWS form"
        ))),
    }
}

fn decode_segment(op: &str, segment: &str) -> Result<Map<String, Value>, Error> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| Error::TokenFormat(format!("{op}: base64url decode: {e}")))?;
    serde_json::from_slice(&raw)
        .map_err(|e| Error::TokenFormat(format!("{op}: decode segment: {e}")))
}

fn decode_token(op: &str, token: &str) -> Result<Otvid, Error> {
    let (_, payload, _) = split_token(op, token)?;
    Otvid::from_claims(token, decode_segment(op, payload)?)
}

// Verify the JWS signature using the keyset entry matching the token's kid.
fn verify_signature(op: &str, token: &str, keys: &KeySet) -> Result<(), Error> {
    let (header_seg, payload_seg, sig_seg) = split_token(op, token)?;
    let header = decode_segment(op, header_seg)?;

    let alg: Algorithm = header
        .get("alg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .parse()
        .map_err(|e| Error::Signature(format!("{op}: {e}")))?;
    let kid = header.get("kid").and_then(Value::as_str).unwrap_or_default();
    if kid.is_empty() {
        return Err(Error::Signature(format!("{op}: kid header required")));
    }
    let key = keys
        .find(kid)
        .ok_or_else(|| Error::Signature(format!("{op}: no key for kid '{kid}'")))?;

    let sig = URL_SAFE_NO_PAD
        .decode(sig_seg)
        .map_err(|e| Error::TokenFormat(format!("{op}: base64url decode: {e}")))?;
    alg.verifier_for(key)?
        .verify(format!("{header_seg}.{payload_seg}").as_bytes(), &sig)
        .map_err(|e| Error::Signature(format!("{op}: {e}")))
}

fn str_claim<'a>(claims: &'a Map<String, Value>, name: &str) -> &'a str {
    claims.get(name).and_then(Value::as_str).unwrap_or_default()
}

// The audience claim is a one-element array; a bare string is tolerated.
fn first_audience(claims: &Map<String, Value>) -> &str {
    match claims.get("aud") {
        Some(Value::Array(auds)) => auds.first().and_then(Value::as_str).unwrap_or_default(),
        Some(Value::String(s)) => s.as_str(),
        _ => "",
    }
}

fn time_claim(claims: &Map<String, Value>, name: &str) -> Option<SystemTime> {
    let secs = claims.get(name)?.as_i64()?;
    if secs <= 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}
