//! OTID parsing, validation, and formatting.
//!
//! An Open Trust ID names a trust domain or a subject inside one:
//!
//! ```text
//! otid:{trust_domain}[:{subject_type}:{subject_id}]
//! ```
//!
//! Each component is lowercase ASCII letters, digits, `.`, `-`, or `_`,
//! and may not lead with `.`, `-`, or `_`. The component byte lengths may
//! sum to at most 1016.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

const MAX_COMPONENT_SUM: usize = 1016;

/// A federation namespace, e.g. `ot.example.com`.
///
/// The trust domain is the authority anchor: its OTID is the domain itself,
/// and its authority is discovered at [`TrustDomain::config_url`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Wrap a string as a trust domain without validating it.
    ///
    /// Call [`TrustDomain::validate`] before trusting the value.
    pub fn new(td: impl Into<String>) -> Self {
        Self(td.into())
    }

    /// Return an error if the trust domain is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        if self.0.is_empty() {
            return Err(Error::InvalidIdentifier(
                "TrustDomain::validate: trust domain required".to_string(),
            ));
        }
        check_component(&self.0).map_err(|e| {
            Error::InvalidIdentifier(format!("TrustDomain::validate: invalid trust domain {e}"))
        })
    }

    /// The trust domain as a string, e.g. `ot.example.com`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The OTID of the trust domain itself (a domain OTID).
    pub fn otid(&self) -> Otid {
        Otid {
            trust_domain: self.clone(),
            subject_type: String::new(),
            subject_id: String::new(),
        }
    }

    /// Build a subject OTID inside this trust domain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`] if any component violates the
    /// grammar or the subject pair is incomplete.
    pub fn new_otid(&self, subject_type: &str, subject_id: &str) -> Result<Otid, Error> {
        Otid::new(self.as_str(), subject_type, subject_id)
    }

    /// The well-known URL serving this domain's authority configuration.
    pub fn config_url(&self) -> String {
        format!("https://{}/.well-known/open-trust-configuration", self.0)
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrustDomain {
    fn from(td: &str) -> Self {
        Self(td.to_string())
    }
}

/// An Open Trust ID naming a trust domain or a subject inside one.
///
/// OTIDs are immutable value objects compared by full value. The default
/// OTID is the zero value and fails [`Otid::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Otid {
    trust_domain: TrustDomain,
    subject_type: String,
    subject_id: String,
}

impl Otid {
    /// Build an OTID from its components.
    ///
    /// Both subject components must be non-empty, or both empty (producing a
    /// domain OTID).
    pub fn new(trust_domain: &str, subject_type: &str, subject_id: &str) -> Result<Self, Error> {
        let id = Otid {
            trust_domain: TrustDomain::new(trust_domain),
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
        };
        id.validate()?;
        Ok(id)
    }

    /// Build the domain OTID of a trust domain.
    pub fn domain(trust_domain: &str) -> Result<Self, Error> {
        Self::new(trust_domain, "", "")
    }

    /// Parse an OTID from its serialized form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`] for a missing `otid` scheme, a
    /// subject segment count other than zero or two, empty segments, or
    /// grammar violations.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut parts = s.split(':');
        let scheme = parts.next().unwrap_or_default();
        if scheme != "otid" {
            return Err(Error::InvalidIdentifier(format!(
                "Otid::parse: invalid OTID scheme '{scheme}'"
            )));
        }
        let trust_domain = parts.next().ok_or_else(|| {
            Error::InvalidIdentifier(format!("Otid::parse: invalid OTID string '{s}'"))
        })?;
        let subject: Vec<&str> = parts.collect();
        match subject.len() {
            0 => Self::new(trust_domain, "", ""),
            2 => Self::new(trust_domain, subject[0], subject[1]),
            _ => Err(Error::InvalidIdentifier(format!(
                "Otid::parse: invalid OTID subject segments in '{s}'"
            ))),
        }
    }

    /// Return an error if the OTID is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        self.trust_domain.validate()?;

        if !self.subject_type.is_empty() || !self.subject_id.is_empty() {
            if self.subject_type.is_empty() {
                return Err(Error::InvalidIdentifier(
                    "Otid::validate: subject type required".to_string(),
                ));
            }
            check_component(&self.subject_type).map_err(|e| {
                Error::InvalidIdentifier(format!("Otid::validate: invalid subject type {e}"))
            })?;
            if self.subject_id.is_empty() {
                return Err(Error::InvalidIdentifier(
                    "Otid::validate: subject ID required".to_string(),
                ));
            }
            check_component(&self.subject_id).map_err(|e| {
                Error::InvalidIdentifier(format!("Otid::validate: invalid subject ID {e}"))
            })?;
        }

        let total =
            self.trust_domain.as_str().len() + self.subject_type.len() + self.subject_id.len();
        if total > MAX_COMPONENT_SUM {
            return Err(Error::InvalidIdentifier(format!(
                "Otid::validate: OTID length {total} is too long"
            )));
        }
        Ok(())
    }

    /// True if the OTID belongs to the given trust domain.
    pub fn member_of(&self, td: &TrustDomain) -> bool {
        self.trust_domain == *td
    }

    /// True if this is a domain OTID (no subject pair).
    pub fn is_domain_id(&self) -> bool {
        self.subject_type.is_empty() && self.subject_id.is_empty()
    }

    /// The OTID's trust domain.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The OTID's subject type, empty for a domain OTID.
    pub fn subject_type(&self) -> &str {
        &self.subject_type
    }

    /// The OTID's subject ID, empty for a domain OTID.
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }
}

impl fmt::Display for Otid {
    /// The canonical form, e.g. `otid:ot.example.com:user:joe`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "otid:{}", self.trust_domain)?;
        if !self.subject_type.is_empty() {
            write!(f, ":{}:{}", self.subject_type, self.subject_id)?;
        }
        Ok(())
    }
}

impl FromStr for Otid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Otid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.validate().map_err(S::Error::custom)?;
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Otid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Otid::default()),
            Some(s) if s.is_empty() => Ok(Otid::default()),
            Some(s) => Otid::parse(&s).map_err(D::Error::custom),
        }
    }
}

// Components must be lower ALPHA / DIGIT / "." / "-" / "_", and may not
// lead with "." / "-" / "_".
fn check_component(s: &str) -> Result<(), String> {
    if let Some(first) = s.chars().next() {
        if matches!(first, '.' | '-' | '_') {
            return Err(format!("leading rune {:?}", first));
        }
    }
    for c in s.chars() {
        match c {
            'a'..='z' | '0'..='9' | '.' | '-' | '_' => continue,
            _ => return Err(format!("rune {c:?}")),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_domain_validate() {
        for ok in ["localhost", "ot.example.com", "o-t.example.com", "o_t.example.com"] {
            TrustDomain::new(ok).validate().unwrap();
        }
        for bad in ["", " ", "localHost", "Foo", "*.x", ".foo", "-foo", "_foo", "ot.example.co m"] {
            assert!(TrustDomain::new(bad).validate().is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn trust_domain_otid() {
        let td = TrustDomain::new("ot.example.com");
        assert_eq!(td.otid().to_string(), "otid:ot.example.com");
        assert_eq!(
            td.new_otid("user", "joe").unwrap().to_string(),
            "otid:ot.example.com:user:joe"
        );
    }

    #[test]
    fn config_url() {
        let td = TrustDomain::new("ot.example.com");
        assert_eq!(
            td.config_url(),
            "https://ot.example.com/.well-known/open-trust-configuration"
        );
    }

    #[test]
    fn new_otid() {
        assert_eq!(Otid::domain("localhost").unwrap().to_string(), "otid:localhost");
        assert_eq!(
            Otid::new("localhost", "app", "auth").unwrap().to_string(),
            "otid:localhost:app:auth"
        );

        assert!(Otid::domain("").is_err());
        assert!(Otid::domain("T").is_err());
        assert!(Otid::new("localhost", "", "").is_ok());
        assert!(Otid::new("localhost", "app", "").is_err());
        assert!(Otid::new("localhost", "", "abc").is_err());
    }

    #[test]
    fn parse_roundtrip() {
        for s in ["otid:localhost", "otid:localhost:app:auth", "otid:ot.example.com:user:9eebccd2-12bf-40a6-b262-65fe0487d453"] {
            let id = Otid::parse(s).unwrap();
            assert_eq!(id.to_string(), s);
            assert_eq!(Otid::parse(&id.to_string()).unwrap(), id);
        }
    }

    #[test]
    fn parse_rejects_malformed() {
        for s in [
            "",
            "otid",
            "localhost",
            "otid:localhost:app",
            "otid:localhost:app:auth:",
            "otid:localhost:app:auth:extra",
            "otid:localhost::auth",
            "oti:localhost:app:auth",
            "otid:localHost",
        ] {
            let err = Otid::parse(s).unwrap_err();
            assert!(
                matches!(err, Error::InvalidIdentifier(_)),
                "{s:?}: unexpected {err:?}"
            );
        }
    }

    #[test]
    fn length_bounds() {
        // component byte sum of exactly 1016 is accepted
        let td = "localhost"; // 9 bytes
        let ty = "user"; // 4 bytes
        let id = "a".repeat(1016 - 9 - 4);
        Otid::new(td, ty, &id).unwrap();

        let id = "a".repeat(1024 - 9 - 4);
        assert!(Otid::new(td, ty, &id).is_err());
    }

    #[test]
    fn member_of_and_accessors() {
        let td = TrustDomain::new("localhost");
        let id = td.new_otid("user", "joe").unwrap();
        assert!(id.member_of(&td));
        assert!(!id.member_of(&TrustDomain::new("other")));
        assert!(!id.is_domain_id());
        assert!(td.otid().is_domain_id());
        assert_eq!(id.subject_type(), "user");
        assert_eq!(id.subject_id(), "joe");
        assert_eq!(id.trust_domain().as_str(), "localhost");
    }

    #[test]
    fn serde_roundtrip() {
        let id = Otid::parse("otid:localhost:user:joe").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"otid:localhost:user:joe\"");
        let back: Otid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn serde_empty_and_null() {
        let id: Otid = serde_json::from_str("\"\"").unwrap();
        assert_eq!(id, Otid::default());
        let id: Otid = serde_json::from_str("null").unwrap();
        assert_eq!(id, Otid::default());
        assert!(serde_json::from_str::<Otid>("\"garbage\"").is_err());
    }

    #[test]
    fn serialize_invalid_fails() {
        assert!(serde_json::to_string(&Otid::default()).is_err());
    }
}
