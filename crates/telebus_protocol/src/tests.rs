use crate::{
    Ack, AckStatus, CodecError, Ed25519Signer, Envelope, EnvelopeCodec, EnvelopeSigner,
    HealthStatus, SharedTrustStore, TrustStore, VerifyError, verify, verify_detailed,
};

fn signer() -> Ed25519Signer {
    Ed25519Signer::from_seed("agent-1", &[7u8; 32])
}

fn trust_for(signer: &Ed25519Signer) -> TrustStore {
    let mut store = TrustStore::new();
    store.insert(signer.producer_id(), signer.verifying_key());
    store
}

fn signed(payload: &[u8], key: &str) -> Envelope {
    Envelope::unsigned(payload.to_vec(), "ignored", key, 1_700_000_000_000_000_000)
        .sign_with(&signer())
        .unwrap()
}

#[test]
fn test_sign_stamps_producer_and_verifies() {
    let s = signer();
    let envelope = signed(b"cpu=42", "evt-1");
    assert_eq!(envelope.producer_id, "agent-1");
    assert!(envelope.is_signed());
    assert!(verify(&envelope, &trust_for(&s)));
}

#[test]
fn test_any_mutation_breaks_signature() {
    let trust = trust_for(&signer());
    let original = signed(b"cpu=42", "evt-1");

    let mut payload = original.clone();
    payload.payload = b"cpu=43".to_vec();
    let mut key = original.clone();
    key.idempotency_key = "evt-2".into();
    let mut ts = original.clone();
    ts.timestamp_ns += 1;

    for tampered in [payload, key, ts] {
        assert_eq!(
            verify_detailed(&tampered, &trust),
            Err(VerifyError::Mismatch)
        );
    }
}

#[test]
fn test_unknown_producer_fails_closed() {
    let envelope = signed(b"x", "evt-1");
    assert_eq!(
        verify_detailed(&envelope, &TrustStore::new()),
        Err(VerifyError::UnknownProducer("agent-1".into()))
    );
}

#[test]
fn test_wrong_key_for_producer_is_rejected() {
    let envelope = signed(b"x", "evt-1");
    let other = Ed25519Signer::from_seed("agent-1", &[9u8; 32]);
    assert!(!verify(&envelope, &trust_for(&other)));
}

#[test]
fn test_truncated_signature_is_bad_encoding() {
    let mut envelope = signed(b"x", "evt-1");
    envelope.signature.truncate(10);
    assert_eq!(
        verify_detailed(&envelope, &trust_for(&signer())),
        Err(VerifyError::BadEncoding)
    );
}

#[test]
fn test_signing_bytes_keep_field_boundaries() {
    let a = Envelope::unsigned(b"ab".to_vec(), "c", "k", 0);
    let b = Envelope::unsigned(b"a".to_vec(), "bc", "k", 0);
    assert_ne!(a.signing_bytes(), b.signing_bytes());
}

#[test]
fn test_codec_decodes_what_it_encodes() {
    let codec = EnvelopeCodec::default();
    let envelope = signed(b"\x00\xffbinary", "evt-1");
    let bytes = codec.encode(&envelope).unwrap();
    assert_eq!(codec.decode(&bytes).unwrap(), envelope);
}

#[test]
fn test_codec_rejects_missing_required_fields() {
    let codec = EnvelopeCodec::default();
    let cases = [
        (
            r#"{"payload":"","idempotency_key":"k","signature":"AA==","timestamp_ns":1}"#,
            "producer_id",
        ),
        (
            r#"{"payload":"","producer_id":"p","signature":"AA==","timestamp_ns":1}"#,
            "idempotency_key",
        ),
        (
            r#"{"payload":"","producer_id":"p","idempotency_key":"k","timestamp_ns":1}"#,
            "signature",
        ),
        (
            r#"{"payload":"","producer_id":"p","idempotency_key":"k","signature":"AA=="}"#,
            "timestamp_ns",
        ),
        (
            r#"{"payload":"","producer_id":"","idempotency_key":"k","signature":"AA==","timestamp_ns":1}"#,
            "producer_id",
        ),
    ];
    for (json, field) in cases {
        match codec.decode(json.as_bytes()) {
            Err(CodecError::Malformed(msg)) => assert!(msg.contains(field), "{msg}"),
            other => panic!("expected malformed for {field}, got {other:?}"),
        }
    }
}

#[test]
fn test_codec_rejects_garbage_and_bad_base64() {
    let codec = EnvelopeCodec::default();
    assert!(matches!(
        codec.decode(b"not json"),
        Err(CodecError::Malformed(_))
    ));
    let bad_b64 = r#"{"payload":"%%%","producer_id":"p","idempotency_key":"k","signature":"AA==","timestamp_ns":1}"#;
    assert!(matches!(
        codec.decode(bad_b64.as_bytes()),
        Err(CodecError::Malformed(_))
    ));
}

#[test]
fn test_missing_payload_defaults_to_empty() {
    let codec = EnvelopeCodec::default();
    let json = r#"{"producer_id":"p","idempotency_key":"k","signature":"AA==","timestamp_ns":1,"extra":true}"#;
    let envelope = codec.decode(json.as_bytes()).unwrap();
    assert!(envelope.payload.is_empty());
}

#[test]
fn test_oversize_is_checked_before_parsing() {
    let codec = EnvelopeCodec::new(16);
    // Not even JSON: size must win over the parse error.
    let err = codec.decode(&[b'x'; 17]).unwrap_err();
    assert_eq!(err, CodecError::Oversize { size: 17, max: 16 });
    assert!(err.is_oversize());
}

#[test]
fn test_encode_refuses_oversize_envelope() {
    let codec = EnvelopeCodec::new(256);
    let envelope = signed(&[1u8; 512], "evt-big");
    assert!(codec.encode(&envelope).unwrap_err().is_oversize());
}

#[test]
fn test_trust_store_from_hex() {
    let s = signer();
    let store = TrustStore::from_hex_entries([("agent-1", s.public_key_hex())]).unwrap();
    assert!(store.contains("agent-1"));
    assert_eq!(store.len(), 1);

    assert!(TrustStore::from_hex_entries([("agent-2", "zz")]).is_err());
    assert!(TrustStore::from_hex_entries([("agent-2", "abcd")]).is_err());
}

#[test]
fn test_shared_trust_store_rotation() {
    let old = signer();
    let new = Ed25519Signer::from_seed("agent-1", &[8u8; 32]);
    let shared = SharedTrustStore::new(trust_for(&old));

    let before = shared.snapshot();
    shared.replace(trust_for(&new));
    let after = shared.snapshot();

    let envelope = signed(b"x", "evt-1");
    assert!(verify(&envelope, &before));
    assert!(!verify(&envelope, &after));
}

#[test]
fn test_signer_key_file_roundtrip() {
    let original = Ed25519Signer::generate("agent-9");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.key");
    std::fs::write(&path, format!("{}\n", original.secret_hex())).unwrap();

    let loaded = Ed25519Signer::from_key_file("agent-9", &path).unwrap();
    assert_eq!(loaded.public_key_hex(), original.public_key_hex());

    let missing = Ed25519Signer::from_key_file("agent-9", &dir.path().join("nope"));
    assert!(matches!(missing, Err(crate::SignError::KeyFile { .. })));
    assert!(Ed25519Signer::from_hex("agent-9", "1234").is_err());
}

#[test]
fn test_signer_debug_hides_secret() {
    let s = signer();
    let rendered = format!("{s:?}");
    assert!(!rendered.contains(&s.secret_hex()));
    assert!(rendered.contains("agent-1"));
}

#[test]
fn test_ack_json_shape() {
    let json = serde_json::to_value(Ack::retry(Some(250))).unwrap();
    assert_eq!(json["status"], "retry");
    assert_eq!(json["retry_after_ms"], 250);
    assert!(json.get("reason").is_none());

    let ack: Ack = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
    assert_eq!(ack.status, AckStatus::Ok);
    assert!(ack.is_ok());
    assert!(Ack::invalid("bad").is_invalid());
}

#[test]
fn test_health_requires_both_parts() {
    assert!(HealthStatus::from_parts(true, true).ready);
    assert!(!HealthStatus::from_parts(false, true).ready);
    assert!(!HealthStatus::from_parts(true, false).ready);
}
