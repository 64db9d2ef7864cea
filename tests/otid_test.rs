use open_trust::{Error, Otid, TrustDomain};

#[test]
fn canonical_subject_otid() {
    let td = TrustDomain::new("ot.example.com");
    assert_eq!(
        td.new_otid("user", "joe").unwrap().to_string(),
        "otid:ot.example.com:user:joe"
    );
}

#[test]
fn trailing_empty_segment_rejected() {
    let err = Otid::parse("otid:localhost:app:auth:").unwrap_err();
    assert!(matches!(err, Error::InvalidIdentifier(_)));
}

#[test]
fn grammar_violations_are_invalid_identifier() {
    for s in [
        "otid:",
        "otid: ",
        "otid:Foo",
        "otid:.foo",
        "otid:*.x",
        "otid:localhost:app",
        "otid:localhost:app:auth:x:y",
        "spiffe://example.org/app",
    ] {
        let err = Otid::parse(s).unwrap_err();
        assert!(
            matches!(err, Error::InvalidIdentifier(_)),
            "{s:?}: unexpected {err:?}"
        );
    }
}

#[test]
fn domain_otid_roundtrip() {
    let id = Otid::parse("otid:ot.example.com").unwrap();
    assert!(id.is_domain_id());
    assert_eq!(id, TrustDomain::new("ot.example.com").otid());
    assert_eq!(Otid::parse(&id.to_string()).unwrap(), id);
}

#[test]
fn subject_component_boundaries() {
    // component sum of 1016 bytes is the ceiling
    let id = "x".repeat(1016 - "localhost".len() - "user".len());
    assert!(Otid::new("localhost", "user", &id).is_ok());

    let id = "x".repeat(1024 - "localhost".len() - "user".len());
    assert!(Otid::new("localhost", "user", &id).is_err());
}

#[test]
fn json_field_roundtrip() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct Doc {
        otid: Otid,
    }

    let doc: Doc = serde_json::from_str(r#"{"otid": "otid:localhost:svc:auth"}"#).unwrap();
    assert_eq!(doc.otid.subject_type(), "svc");
    assert_eq!(
        serde_json::to_string(&doc).unwrap(),
        r#"{"otid":"otid:localhost:svc:auth"}"#
    );

    let doc: Doc = serde_json::from_str(r#"{"otid": null}"#).unwrap();
    assert_eq!(doc.otid, Otid::default());
}
