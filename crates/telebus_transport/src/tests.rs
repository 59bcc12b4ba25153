use crate::message::{ClientMessage, ServerMessage};
use crate::{LoopbackTransport, TlsError, WsTransport, serve, tls};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::pem::PemObject;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use telebus_broker::{Broker, BrokerOptions};
use telebus_client::{
    BrokerTransport, PublishOutcome, Publisher, PublisherOptions, TransportError,
};
use telebus_persistence::{EventLog, LocalBuffer, Wal};
use telebus_protocol::{
    Ack, AckStatus, Ed25519Signer, Envelope, EnvelopeCodec, EnvelopeSigner, SharedTrustStore,
    TrustStore,
};
use telebus_utils::ManualClock;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

fn signer() -> Ed25519Signer {
    Ed25519Signer::from_seed("agent-1", &[1u8; 32])
}

struct TestBroker {
    broker: Arc<Broker>,
    wal: Arc<Wal>,
    _dir: TempDir,
}

fn test_broker() -> TestBroker {
    let dir = tempfile::tempdir().unwrap();
    let wal = Arc::new(Wal::open(dir.path()).unwrap());
    let mut store = TrustStore::new();
    store.insert("agent-1", signer().verifying_key());
    let broker = Arc::new(Broker::new(
        BrokerOptions::default(),
        Arc::new(SharedTrustStore::new(store)),
        wal.clone(),
    ));
    TestBroker {
        broker,
        wal,
        _dir: dir,
    }
}

fn signed_bytes(key: &str, payload: &[u8]) -> Vec<u8> {
    let envelope = Envelope::unsigned(payload.to_vec(), "", key, 42)
        .sign_with(&signer())
        .unwrap();
    EnvelopeCodec::default().encode(&envelope).unwrap()
}

async fn spawn_server(broker: Arc<Broker>, tls: Option<TlsAcceptor>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, broker, tls));
    addr
}

struct Pki {
    ca: String,
    server_cert: String,
    server_key: String,
    client_cert: String,
    client_key: String,
}

fn pki() -> Pki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "telebus test ca");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf = |name: &str| {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();
        (cert.pem(), key.serialize_pem())
    };
    let (server_cert, server_key) = leaf("localhost");
    let (client_cert, client_key) = leaf("agent-1");

    Pki {
        ca: ca_cert.pem(),
        server_cert,
        server_key,
        client_cert,
        client_key,
    }
}

fn mtls_acceptor(pki: &Pki) -> TlsAcceptor {
    tls::acceptor(
        tls::server_config(
            pki.server_cert.as_bytes(),
            pki.server_key.as_bytes(),
            pki.ca.as_bytes(),
        )
        .unwrap(),
    )
}

fn mtls_client(pki: &Pki, addr: SocketAddr) -> WsTransport {
    let config = tls::client_config(
        pki.ca.as_bytes(),
        pki.client_cert.as_bytes(),
        pki.client_key.as_bytes(),
    )
    .unwrap();
    WsTransport::new(&format!("wss://{addr}"))
        .unwrap()
        .with_tls(config, "localhost")
        .unwrap()
}

#[test]
fn test_wire_message_shapes() {
    let publish = ClientMessage::Publish {
        request_id: 7,
        envelope: b"abc".to_vec(),
    };
    assert_eq!(
        serde_json::to_value(&publish).unwrap(),
        json!({"type": "publish", "request_id": 7, "envelope": "YWJj"})
    );

    let health: ClientMessage =
        serde_json::from_value(json!({"type": "health", "request_id": 3})).unwrap();
    assert_eq!(health.request_id(), 3);

    let ack = ServerMessage::Ack {
        request_id: 7,
        ack: Ack::retry(Some(100)),
    };
    let value = serde_json::to_value(&ack).unwrap();
    assert_eq!(value["type"], "ack");
    assert_eq!(value["ack"]["status"], "retry");
    assert_eq!(value["ack"]["retry_after_ms"], 100);

    let error = ServerMessage::Error {
        request_id: None,
        message: "bad".into(),
    };
    assert_eq!(
        serde_json::to_value(&error).unwrap(),
        json!({"type": "error", "message": "bad"})
    );
    assert_eq!(error.request_id(), None);
}

#[tokio::test]
async fn test_websocket_publish_and_health() {
    let t = test_broker();
    let addr = spawn_server(t.broker.clone(), None).await;
    let transport = WsTransport::new(&format!("ws://{addr}")).unwrap();

    let health = transport.health().await.unwrap();
    assert!(health.ready);

    let bytes = signed_bytes("evt-1", b"cpu=42");
    assert!(transport.publish(bytes.clone()).await.unwrap().is_ok());
    assert!(transport.publish(bytes).await.unwrap().is_ok());
    assert_eq!(t.wal.len(), 1);
}

#[tokio::test]
async fn test_websocket_invalid_envelope_gets_invalid_ack() {
    let t = test_broker();
    let addr = spawn_server(t.broker.clone(), None).await;
    let transport = WsTransport::new(&format!("ws://{addr}")).unwrap();

    let ack = transport.publish(b"not an envelope".to_vec()).await.unwrap();
    assert_eq!(ack.status, AckStatus::Invalid);
    assert_eq!(t.wal.len(), 0);

    // the connection survives a rejected request
    assert!(transport.health().await.unwrap().ready);
}

#[tokio::test]
async fn test_unreachable_broker_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = WsTransport::new(&format!("ws://{addr}")).unwrap();
    let err = transport.publish(signed_bytes("evt-1", b"x")).await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}

#[test]
fn test_bad_url_is_permanent() {
    let err = WsTransport::new("not a url").unwrap_err();
    assert!(matches!(err, TransportError::Permanent(_)));
}

#[tokio::test]
async fn test_mtls_round_trip() {
    let pki = pki();
    let t = test_broker();
    let addr = spawn_server(t.broker.clone(), Some(mtls_acceptor(&pki))).await;
    let transport = mtls_client(&pki, addr);

    assert!(transport.health().await.unwrap().ready);
    let ack = transport.publish(signed_bytes("evt-1", b"cpu=42")).await.unwrap();
    assert!(ack.is_ok());
    assert_eq!(t.wal.len(), 1);
}

#[tokio::test]
async fn test_mtls_rejects_client_without_certificate() {
    let pki = pki();
    let t = test_broker();
    let addr = spawn_server(t.broker.clone(), Some(mtls_acceptor(&pki))).await;

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls::pki_types::CertificateDer::pem_slice_iter(pki.ca.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let anonymous = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let transport = WsTransport::new(&format!("wss://{addr}"))
        .unwrap()
        .with_tls(Arc::new(anonymous), "localhost")
        .unwrap()
        .with_connect_timeout(Duration::from_secs(2));

    let result = transport.publish(signed_bytes("evt-1", b"x")).await;
    assert!(result.is_err(), "{result:?}");
    assert_eq!(t.wal.len(), 0);
}

#[tokio::test]
async fn test_client_rejects_untrusted_broker() {
    let broker_pki = pki();
    let other_pki = pki();
    let t = test_broker();
    let addr = spawn_server(t.broker.clone(), Some(mtls_acceptor(&broker_pki))).await;

    let config = tls::client_config(
        other_pki.ca.as_bytes(),
        other_pki.client_cert.as_bytes(),
        other_pki.client_key.as_bytes(),
    )
    .unwrap();
    let transport = WsTransport::new(&format!("wss://{addr}"))
        .unwrap()
        .with_tls(config, "localhost")
        .unwrap();

    let err = transport.publish(signed_bytes("evt-1", b"x")).await.unwrap_err();
    assert!(matches!(err, TransportError::Permanent(_)), "{err:?}");
}

#[test]
fn test_tls_config_errors() {
    let err = tls::server_config(b"garbage", b"garbage", b"garbage").unwrap_err();
    assert!(matches!(err, TlsError::Certificate(_)), "{err:?}");

    let missing = std::path::Path::new("/nonexistent/telebus/ca.pem");
    let err = tls::load_client_config(missing, missing, missing).unwrap_err();
    assert!(matches!(err, TlsError::Read { .. }));

    assert!(tls::server_name("localhost").is_ok());
}

#[tokio::test]
async fn test_loopback_reachability() {
    let t = test_broker();
    let transport = LoopbackTransport::new(t.broker.clone());
    assert!(transport.health().await.unwrap().ready);

    transport.set_reachable(false);
    let err = transport.publish(signed_bytes("evt-1", b"x")).await.unwrap_err();
    assert!(err.is_transient());
    assert!(transport.health().await.is_err());
    assert_eq!(t.wal.len(), 0);
}

#[tokio::test]
async fn test_end_to_end_buffered_until_broker_reachable() {
    let t = test_broker();
    let transport = Arc::new(LoopbackTransport::new(t.broker.clone()));
    let buffer_dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_000_000_000));
    let publisher = Publisher::new(
        transport.clone(),
        Arc::new(signer()),
        LocalBuffer::open(buffer_dir.path()).unwrap(),
        PublisherOptions::default(),
    )
    .with_clock(clock.clone())
    .with_rng_seed(1);

    // broker down: the event is parked locally
    transport.set_reachable(false);
    let outcome = publisher
        .publish_with_key(b"cpu=42".to_vec(), "evt-1")
        .await
        .unwrap();
    assert!(matches!(outcome, PublishOutcome::Buffered { .. }));
    assert_eq!(publisher.buffer().len(), 1);
    assert_eq!(t.wal.len(), 0);
    let parked = publisher.buffer().entries().unwrap().remove(0).1.envelope;

    // broker back: the drain delivers it
    transport.set_reachable(true);
    clock.advance(Duration::from_secs(60));
    let report = publisher.drain_due().await.unwrap();
    assert_eq!(report.acked, 1);
    assert!(publisher.buffer().is_empty());

    let records: Vec<_> = t.wal.read_from(0).map(|r| r.unwrap()).collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].envelope.payload, b"cpu=42");
    assert_eq!(records[0].envelope.idempotency_key, "evt-1");
    assert_eq!(records[0].envelope.producer_id, signer().producer_id());

    // the ack was "lost": the same envelope arrives again
    let resend = EnvelopeCodec::default().encode(&parked).unwrap();
    let ack = transport.publish(resend).await.unwrap();
    assert!(ack.is_ok());
    assert_eq!(t.wal.len(), 1);
}
