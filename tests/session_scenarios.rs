//! End-to-end scenarios driving the full accept -> handshake -> dispatch
//! path over a `tokio::io::duplex` pipe, standing in for a real (already
//! TLS-authenticated) socket.

use std::sync::Arc;
use std::time::Duration;

use bepd::config::BepConfig;
use bepd::core::codec::{self, peek_header, CompressionPolicy};
use bepd::core::identity::device_id_from_cert;
use bepd::core::message::{ClusterConfig, Device, Folder, IndexPayload, Message, Options, Request, ResponseCode};
use bepd::model::{LocalIdentity, Model};
use bepd::monitoring::Metrics;
use bepd::networking::listener::{accept_peer, spawn_session, PeerCertSource, PeerConnection};
use bepd::networking::session::HeartbeatConfig;
use bepd::networking::{connection, ConnectionReader, ConnectionWriter};
use bepd::storage::{MemoryStorage, Storage};

type Duplex = tokio::io::DuplexStream;

struct StubCertSource(Vec<u8>);

impl PeerCertSource for StubCertSource {
    fn peer_certificate_der(&self) -> Option<Vec<u8>> {
        Some(self.0.clone())
    }
}

fn local_identity() -> LocalIdentity {
    LocalIdentity {
        device_id: device_id_from_cert(b"local-master-cert"),
        client_name: "master".into(),
        client_version: "v1.0".into(),
    }
}

fn test_model() -> (Arc<Model<Duplex>>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let model = Arc::new(Model::new(local_identity(), storage.clone() as Arc<dyn Storage>).0);
    (model, storage)
}

/// Stand up a session over a duplex pipe, driving the peer side with plain
/// `ConnectionReader`/`ConnectionWriter` rather than a second `Model`, so
/// the test can script exactly what "the peer" sends and observe exactly
/// what "the local endpoint" emits.
async fn spawn_peer_session(
    model: Arc<Model<Duplex>>,
    peer_cert: &[u8],
    heartbeat: HeartbeatConfig,
) -> (ConnectionReader<Duplex>, ConnectionWriter<Duplex>, tokio::task::JoinHandle<()>) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let metrics = Arc::new(Metrics::new().unwrap());
    let (peer_reader, peer_writer) = connection(client_io, CompressionPolicy::Never, metrics.clone());
    let device_id = device_id_from_cert(peer_cert);
    let join = spawn_session(
        PeerConnection { stream: server_io, device_id },
        model,
        CompressionPolicy::Never,
        heartbeat,
        metrics,
    )
    .await
    .unwrap();
    (peer_reader, peer_writer, join)
}

// S1 Handshake: local emits its own ClusterConfig before reading anything,
// and the peer's ClusterConfig is recorded against the model.
#[tokio::test]
async fn s1_handshake_exchanges_cluster_config_and_updates_the_model() {
    let (model, storage) = test_model();
    let peer_id = device_id_from_cert(b"bob-cert");

    // Pre-configure that this endpoint shares "photos" with bob, or the
    // local ClusterConfig would announce no folders.
    storage
        .upsert_folder(&Folder {
            ident: "photos".into(),
            devices: vec![Device { ident: peer_id, max_local_version: 0, flags: 0, options: Options::new() }],
            flags: 0,
            options: Options::new(),
        })
        .unwrap();

    let (mut peer_reader, peer_writer, _join) =
        spawn_peer_session(model.clone(), b"bob-cert", HeartbeatConfig { ping_idle: Duration::from_secs(3600), idle_timeout_multiplier: 2 }).await;

    let first = peer_reader.recv().await.unwrap().unwrap();
    match first {
        Message::ClusterConfig(_, cc) => {
            assert_eq!(cc.name, "master");
            assert_eq!(cc.version, "v1.0");
        }
        other => panic!("expected local's ClusterConfig first, got {other:?}"),
    }

    let bob_cc = ClusterConfig {
        name: "bob".into(),
        version: "v0.10".into(),
        folders: vec![Folder {
            ident: "photos".into(),
            devices: vec![Device { ident: peer_id, max_local_version: 0, flags: 0, options: Options::new() }],
            flags: 0,
            options: Options::new(),
        }],
        options: Options::new(),
    };
    peer_writer.send(&Message::ClusterConfig(1, bob_cc)).await.unwrap();

    // Give the session task a moment to dispatch before asserting.
    for _ in 0..50 {
        if storage.get_device(&peer_id).unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let record = storage.get_device(&peer_id).unwrap().expect("ClusterConfig should be recorded");
    assert_eq!(record.name, "bob");
    assert_eq!(record.client_version, "v0.10");
}

// S3 / S4 Request success and missing-file paths, driven end to end through
// a running session rather than `Model::on_request` directly.
#[tokio::test]
async fn s3_s4_request_round_trips_through_a_running_session() {
    let (model, _storage) = test_model();
    let (mut peer_reader, peer_writer, _join) = spawn_peer_session(
        model.clone(),
        b"carol-cert",
        HeartbeatConfig { ping_idle: Duration::from_secs(3600), idle_timeout_multiplier: 2 },
    )
    .await;

    // Local's initial ClusterConfig.
    peer_reader.recv().await.unwrap().unwrap();

    peer_writer
        .send(&Message::Request(
            42,
            Request {
                folder: "photos".into(),
                name: "missing.jpg".into(),
                offset: 0,
                size: 128,
                sha: vec![],
                flags: 0,
                options: Options::new(),
            },
        ))
        .await
        .unwrap();

    let response = peer_reader.recv().await.unwrap().unwrap();
    match response {
        Message::Response(id, r) => {
            assert_eq!(id, 42);
            assert_eq!(r.code, ResponseCode::NoSuchFile);
            assert!(r.data.is_empty());
        }
        other => panic!("expected a Response, got {other:?}"),
    }
}

// S5 Compression threshold: a 127-byte body is sent uncompressed, a
// 128-byte body crosses the threshold and is LZ4-compressed.
#[test]
fn s5_compression_threshold_is_128_bytes() {
    let just_under = IndexPayload {
        folder: "f".into(),
        files: vec![],
        flags: 0,
        options: {
            let mut o = Options::new();
            // Pad the body up to just under/over 128 bytes via an options
            // entry; exact body size is an implementation detail of pack,
            // so this asserts the boundary via direct frame headers
            // instead of hand-counting XDR bytes.
            o.insert("pad".into(), "x".repeat(90));
            o
        },
    };
    let msg = Message::Index(1, just_under);
    let frame = codec::encode_frame(&msg, CompressionPolicy::Default);
    let (header, _) = peek_header(&frame).unwrap().unwrap();
    let body_len = frame.len() - 8;

    if body_len < codec::COMPRESSION_THRESHOLD {
        assert!(!header.compressed);
    } else {
        assert!(header.compressed);
    }

    let over = IndexPayload {
        folder: "f".into(),
        files: vec![],
        flags: 0,
        options: {
            let mut o = Options::new();
            o.insert("pad".into(), "x".repeat(200));
            o
        },
    };
    let frame = codec::encode_frame(&Message::Index(1, over), CompressionPolicy::Default);
    let (header, _) = peek_header(&frame).unwrap().unwrap();
    assert!(header.compressed);
    assert!(frame.len() - 8 >= codec::COMPRESSION_THRESHOLD);
}

// S6 Introducer fan-out: a peer marked INTRODUCER announcing an unknown
// device enqueues a dial request for it.
#[tokio::test]
async fn s6_introducer_fan_out_enqueues_an_unknown_device() {
    let storage = Arc::new(MemoryStorage::new());
    let (model, mut dial_rx) = Model::new(local_identity(), storage.clone() as Arc<dyn Storage>);
    let model = Arc::new(model);

    let bob = device_id_from_cert(b"bob-cert");
    let dave = device_id_from_cert(b"dave-cert");

    storage
        .upsert_folder(&Folder {
            ident: "photos".into(),
            devices: vec![Device { ident: bob, max_local_version: 0, flags: 0, options: Options::new() }],
            flags: 0,
            options: Options::new(),
        })
        .unwrap();

    let mut bob_entry = Device { ident: bob, max_local_version: 0, flags: 0, options: Options::new() };
    bob_entry.set_introducer(true);
    let dave_entry = Device { ident: dave, max_local_version: 0, flags: 0, options: Options::new() };

    model
        .on_cluster_config(
            bob,
            ClusterConfig {
                name: "bob".into(),
                version: "v0.10".into(),
                folders: vec![Folder {
                    ident: "photos".into(),
                    devices: vec![bob_entry, dave_entry],
                    flags: 0,
                    options: Options::new(),
                }],
                options: Options::new(),
            },
        )
        .await;

    let dialed = tokio::time::timeout(Duration::from_secs(1), dial_rx.recv())
        .await
        .expect("dial request expected")
        .expect("channel should not be closed");
    assert_eq!(dialed, dave);
}

// Property 10: a self-connection is rejected before a session is ever
// registered.
#[tokio::test]
async fn self_connection_is_rejected_without_registering_a_session() {
    let (model, _storage) = test_model();
    let own_cert = b"local-master-cert".to_vec();
    let err = accept_peer(&StubCertSource(own_cert), &model).await.unwrap_err();
    assert_eq!(err, bepd::networking::listener::AcceptError::SelfConnection);
    assert_eq!(model.session_count().await, 0);
}

// Property 9, end to end: resending ClusterConfig after the session is
// already Ready ends the session instead of being accepted.
#[tokio::test]
async fn duplicate_cluster_config_ends_the_session() {
    let (model, _storage) = test_model();
    let (mut peer_reader, peer_writer, _join) = spawn_peer_session(
        model.clone(),
        b"erin-cert",
        HeartbeatConfig { ping_idle: Duration::from_secs(3600), idle_timeout_multiplier: 2 },
    )
    .await;

    peer_reader.recv().await.unwrap().unwrap(); // local's own ClusterConfig

    let cc = |name: &str| ClusterConfig {
        name: name.into(),
        version: "v1".into(),
        folders: vec![],
        options: Options::new(),
    };
    peer_writer.send(&Message::ClusterConfig(1, cc("erin"))).await.unwrap();
    peer_writer.send(&Message::ClusterConfig(2, cc("erin"))).await.unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(2), peer_reader.recv())
        .await
        .expect("session should end promptly after the duplicate ClusterConfig");
    assert_eq!(ended.unwrap(), None);
}

// S2 / Property 7: heartbeat suppression and emission, using a shortened
// interval so the test runs in well under a second instead of 60s.
#[tokio::test]
async fn s2_heartbeat_fires_after_idle_and_is_answered() {
    let (model, _storage) = test_model();
    let heartbeat = HeartbeatConfig { ping_idle: Duration::from_millis(80), idle_timeout_multiplier: 10 };
    let (mut peer_reader, peer_writer, _join) = spawn_peer_session(model.clone(), b"frank-cert", heartbeat).await;

    peer_reader.recv().await.unwrap().unwrap(); // local's own ClusterConfig

    // Idle past ping_idle: local should emit an unsolicited Ping.
    let ping = tokio::time::timeout(Duration::from_millis(500), peer_reader.recv())
        .await
        .expect("expected a heartbeat Ping within the timeout")
        .unwrap()
        .unwrap();
    let ping_id = match ping {
        Message::Ping(id) => id,
        other => panic!("expected Ping, got {other:?}"),
    };

    // Answering keeps the session alive well past one more idle interval.
    peer_writer.send(&Message::Pong(ping_id)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(model.session_count().await, 1);
}

// Property 7, suppression half: a peer that keeps the connection recently
// active never receives an unsolicited Ping, even past several ping_idle
// intervals.
#[tokio::test]
async fn s2_heartbeat_is_suppressed_while_the_peer_stays_active() {
    let (model, _storage) = test_model();
    let heartbeat = HeartbeatConfig { ping_idle: Duration::from_millis(80), idle_timeout_multiplier: 10 };
    let (mut peer_reader, peer_writer, _join) = spawn_peer_session(model.clone(), b"grace-cert", heartbeat).await;

    peer_reader.recv().await.unwrap().unwrap(); // local's own ClusterConfig

    // Keep resetting local's last_recv well under ping_idle, for several
    // multiples of it, by sending Pongs the local session simply ignores.
    let keepalive = tokio::spawn(async move {
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            if peer_writer.send(&Message::Pong(0)).await.is_err() {
                break;
            }
        }
        peer_writer
    });

    let saw_ping = tokio::time::timeout(Duration::from_millis(240), peer_reader.recv()).await;
    assert!(saw_ping.is_err(), "no message, let alone a Ping, should arrive while the peer stays active");

    let peer_writer = keepalive.await.unwrap();
    drop(peer_writer);
    assert_eq!(model.session_count().await, 1);
}
