//! Wire types shared with the authority service.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::keys::KeySet;
use crate::otid::Otid;
use crate::otvid::Otvid;

/// Envelope wrapping every authority response.
#[derive(Debug, Deserialize)]
pub struct Response<T> {
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub result: Option<T>,
}

impl<T> Response<T> {
    /// Unwrap the envelope. A non-null `error` on a transport-level success
    /// surfaces as [`Error::Transport`] with the server's message.
    pub fn into_result(self) -> Result<T, Error> {
        if let Some(err) = self.error {
            return Err(Error::Transport(format!(
                "Response::into_result: authority error: {err}"
            )));
        }
        self.result.ok_or_else(|| {
            Error::Transport("Response::into_result: authority response missing result".to_string())
        })
    }
}

/// Request body for the authority `/sign` endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignInput {
    /// The subject the OTVID is requested for.
    #[serde(rename = "sub")]
    pub subject: Otid,
    /// The audience the OTVID is scoped to.
    #[serde(rename = "aud")]
    pub audience: Otid,
    /// Requested expiration as Unix seconds, 0 for the authority default.
    #[serde(rename = "exp")]
    pub expiry: i64,
    /// Additional claims the authority should include.
    #[serde(rename = "claims")]
    pub claims: Map<String, Value>,
    /// The subject's self-signed OTVID when requesting on behalf of another
    /// principal.
    #[serde(rename = "forwardedOtvid", skip_serializing_if = "String::is_empty")]
    pub forwarded_otvid: String,
}

/// Result payload of the authority `/sign` endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignOutput {
    #[serde(rename = "iss", default)]
    pub issuer: Otid,
    #[serde(rename = "aud", default)]
    pub audience: Otid,
    #[serde(rename = "exp", default)]
    pub expiry: i64,
    /// The signed OTVID token.
    #[serde(rename = "otvid", default)]
    pub otvid: String,
    /// Endpoints at which the audience service can be reached.
    #[serde(rename = "serviceEndpoints", default)]
    pub service_endpoints: Vec<String>,
}

/// The discovery document served at
/// `https://<td>/.well-known/open-trust-configuration`.
#[derive(Debug, Deserialize)]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub otid: Otid,
    /// Raw JWK objects.
    #[serde(default)]
    pub keys: Vec<Value>,
    /// Suggested keyset refresh interval in seconds.
    #[serde(rename = "keysRefreshHint", default)]
    pub keys_refresh_hint: i64,
    #[serde(rename = "serviceEndpoints", default)]
    pub service_endpoints: Vec<String>,
}

/// Snapshot of a resolved trust domain configuration.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// The domain OTID.
    pub otid: Otid,
    /// The domain's published keys, absent until discovered.
    pub keys: Option<Arc<KeySet>>,
    /// The selected authority endpoint, empty until discovered.
    pub endpoint: String,
}

/// Snapshot of a resolved audience configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// The subject's OTVID for the audience, absent until acquired.
    pub otvid: Option<Arc<Otvid>>,
    /// The selected service endpoint, empty until discovered.
    pub endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_envelope() {
        let resp: Response<Value> = serde_json::from_str(r#"{"result": {"ok": true}}"#).unwrap();
        assert_eq!(resp.into_result().unwrap()["ok"], true);

        let resp: Response<Value> =
            serde_json::from_str(r#"{"error": "denied", "result": null}"#).unwrap();
        let err = resp.into_result().unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.to_string().contains("denied"));

        let resp: Response<Value> = serde_json::from_str(r#"{}"#).unwrap();
        assert!(resp.into_result().is_err());
    }

    #[test]
    fn sign_input_wire_form() {
        let input = SignInput {
            subject: Otid::parse("otid:localhost:app:123").unwrap(),
            audience: Otid::parse("otid:localhost:svc:t").unwrap(),
            ..SignInput::default()
        };
        let json: Value = serde_json::to_value(&input).unwrap();
        assert_eq!(json["sub"], "otid:localhost:app:123");
        assert_eq!(json["aud"], "otid:localhost:svc:t");
        assert_eq!(json["exp"], 0);
        assert!(json.get("forwardedOtvid").is_none());
    }

    #[test]
    fn sign_output_tolerates_missing_fields() {
        let out: SignOutput = serde_json::from_str(r#"{"otvid": "abc"}"#).unwrap();
        assert_eq!(out.otvid, "abc");
        assert!(out.service_endpoints.is_empty());
        assert_eq!(out.issuer, Otid::default());
    }
}
