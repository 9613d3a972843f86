use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use codec::{vmap, MapKey, PacketEncoder, Value};
use proto::{Endpoint, EndpointConfig, EndpointEvent, PacketPriority, Transport};
use tokio::sync::mpsc;

use super::*;
use crate::auth::{self, PasswordAuth};
use crate::encode::image::{ImageBuffer, PixelFormat};
use crate::model::WindowMetadata;

struct TestPixels {
    frames: Mutex<HashMap<Wid, ImageBuffer>>,
}

impl TestPixels {
    fn new() -> Arc<TestPixels> {
        Arc::new(TestPixels {
            frames: Mutex::new(HashMap::new()),
        })
    }

    fn set(&self, wid: Wid, w: u32, h: u32, seed: u8) {
        let pixels: Vec<u8> = (0..(w * h * 4))
            .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
            .collect();
        let image = ImageBuffer::new(w, h, PixelFormat::Bgrx, Bytes::from(pixels)).unwrap();
        self.frames.lock().unwrap().insert(wid, image);
    }
}

impl PixelSource for TestPixels {
    fn capture(&self, wid: Wid) -> Option<ImageBuffer> {
        self.frames.lock().unwrap().get(&wid).cloned()
    }
}

struct TestClient {
    endpoint: Endpoint,
    events: mpsc::Receiver<EndpointEvent>,
}

impl TestClient {
    async fn connect(handle: &SessionHandle) -> TestClient {
        let (client_side, server_side) = Transport::memory_pair(256 * 1024);
        handle.attach_transport(server_side).await.unwrap();
        let (endpoint, events) = Endpoint::spawn(client_side, EndpointConfig::default());
        TestClient { endpoint, events }
    }

    fn hello_caps(uuid: &str) -> Value {
        vmap! {
            "version" => "6.0",
            "uuid" => uuid,
            "encodings" => Value::List(vec!["rgb".into(), "png".into()]),
            "compressors" => Value::List(vec!["lz4".into(), "none".into()]),
            "packet-encoders" => Value::List(vec!["rencode".into()]),
        }
    }

    async fn send_hello(&mut self, caps: Value) {
        self.endpoint
            .send(
                PacketPriority::Control,
                vec![Value::Str("hello".into()), caps],
            )
            .await
            .unwrap();
    }

    /// Next packet that is not keepalive noise.
    async fn recv(&mut self) -> Vec<Value> {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for a packet")
                .expect("endpoint closed")
            {
                EndpointEvent::Packet(p) => {
                    match p[0].as_str() {
                        // Keepalive and attach markers are noise here.
                        Some("ping") | Some("ping_echo") | Some("startup-complete") => continue,
                        _ => return p,
                    }
                }
                EndpointEvent::Closed(e) => panic!("connection closed: {e:?}"),
            }
        }
    }

    /// Waits for the connection to close; returns the final packet seen
    /// with a disconnect type, if any.
    async fn recv_until_closed(&mut self) -> Option<String> {
        let mut reason = None;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for close")
            {
                Some(EndpointEvent::Packet(p)) => {
                    if p[0].as_str() == Some("disconnect") {
                        reason = p.get(1).and_then(Value::as_str).map(str::to_owned);
                    }
                }
                Some(EndpointEvent::Closed(_)) | None => return reason,
            }
        }
    }

    /// Completes the plain handshake and switches to the negotiated
    /// encoder.
    async fn handshake(&mut self, uuid: &str) -> Value {
        self.send_hello(Self::hello_caps(uuid)).await;
        let hello = self.recv().await;
        assert_eq!(hello[0].as_str(), Some("hello"));
        self.endpoint.set_encoder(PacketEncoder::Rencode).await;
        self.endpoint.set_authenticated();
        hello[1].clone()
    }

    async fn ack(&mut self, wid: u32, sequence: u64) {
        self.endpoint
            .send(
                PacketPriority::Control,
                vec![
                    Value::Str("damage-sequence".into()),
                    Value::Int(sequence as i64),
                    Value::Int(wid as i64),
                    Value::Int(100),
                    Value::Int(100),
                    Value::Int(2000),
                    Value::Str(String::new()),
                ],
            )
            .await
            .unwrap();
    }
}

fn test_config(pixels: Arc<TestPixels>) -> SessionConfig {
    SessionConfig::new(pixels)
}

async fn add_window(handle: &SessionHandle, pixels: &TestPixels, w: u32, h: u32) {
    pixels.set(1, w, h, 1);
    handle
        .backend(BackendEvent::NewWindow {
            geometry: Rect::new(0, 0, w, h),
            metadata: WindowMetadata {
                title: Some("xterm".into()),
                ..Default::default()
            },
            pixel_format: PixelFormat::Bgrx,
            alpha: false,
            override_redirect: false,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_handshake_without_auth() {
    let pixels = TestPixels::new();
    let (handle, _join) = Session::spawn(test_config(pixels));
    let mut client = TestClient::connect(&handle).await;

    client.send_hello(TestClient::hello_caps("C-1")).await;
    let hello = client.recv().await;
    // No challenge: the first reply is the server hello.
    assert_eq!(hello[0].as_str(), Some("hello"));
    let caps = hello[1].as_map().unwrap();
    let encodings = caps[&MapKey::from("encodings")].as_list().unwrap();
    assert_eq!(encodings[0].as_str(), Some("rgb"));
    assert_eq!(caps[&MapKey::from("compressor")].as_str(), Some("lz4"));
    assert_eq!(caps[&MapKey::from("packet-encoder")].as_str(), Some("rencode"));
    assert!(caps[&MapKey::from("session_uuid")].as_str().is_some());

    // The connection stays up: a follow-up packet is processed, not
    // dropped.
    client.endpoint.set_encoder(PacketEncoder::Rencode).await;
    client.endpoint.set_authenticated();
    client
        .endpoint
        .send(
            PacketPriority::Metadata,
            vec![Value::Str("info-request".into())],
        )
        .await
        .unwrap();
    let info = client.recv().await;
    assert_eq!(info[0].as_str(), Some("info-response"));
    handle.stop().await;
}

#[tokio::test]
async fn test_version_mismatch_refused() {
    let pixels = TestPixels::new();
    let (handle, _join) = Session::spawn(test_config(pixels));
    let mut client = TestClient::connect(&handle).await;

    let mut caps = TestClient::hello_caps("C-1");
    if let Value::Map(m) = &mut caps {
        m.insert(MapKey::from("version"), Value::Str("5.9".into()));
    }
    client.send_hello(caps).await;
    assert_eq!(
        client.recv_until_closed().await.as_deref(),
        Some("version-mismatch")
    );
    handle.stop().await;
}

#[tokio::test]
async fn test_challenge_handshake() {
    let pixels = TestPixels::new();
    let mut config = test_config(pixels);
    config.authenticators = vec![Arc::new(PasswordAuth::new(b"sesame".to_vec()))];
    let (handle, _join) = Session::spawn(config);
    let mut client = TestClient::connect(&handle).await;

    let mut caps = TestClient::hello_caps("C-1");
    if let Value::Map(m) = &mut caps {
        m.insert(
            MapKey::from("digests"),
            Value::List(vec!["hmac+sha256".into(), "hmac+sha1".into()]),
        );
    }
    client.send_hello(caps.clone()).await;

    let challenge = client.recv().await;
    assert_eq!(challenge[0].as_str(), Some("challenge"));
    let server_salt = challenge[1].as_bytes().unwrap();

    // Respond with the derived HMAC.
    let client_salt = auth::new_salt();
    let xored = auth::xor_salts(&server_salt, &client_salt).unwrap();
    let response = auth::hmac_response("hmac+sha256", b"sesame", &xored).unwrap();
    if let Value::Map(m) = &mut caps {
        m.insert(
            MapKey::from("challenge_response"),
            Value::Bytes(Bytes::from(response)),
        );
        m.insert(
            MapKey::from("challenge_client_salt"),
            Value::Bytes(Bytes::from(client_salt)),
        );
    }
    client.send_hello(caps).await;
    let hello = client.recv().await;
    assert_eq!(hello[0].as_str(), Some("hello"));
    handle.stop().await;
}

#[tokio::test]
async fn test_wrong_password_eventually_refused() {
    let pixels = TestPixels::new();
    let mut config = test_config(pixels);
    config.authenticators = vec![Arc::new(PasswordAuth::new(b"sesame".to_vec()))];
    config.auth_retries = 1;
    let (handle, _join) = Session::spawn(config);
    let mut client = TestClient::connect(&handle).await;

    let mut caps = TestClient::hello_caps("C-1");
    if let Value::Map(m) = &mut caps {
        m.insert(MapKey::from("digests"), Value::List(vec!["hmac+sha256".into()]));
    }
    client.send_hello(caps.clone()).await;
    let challenge = client.recv().await;
    let server_salt = challenge[1].as_bytes().unwrap();
    let client_salt = auth::new_salt();
    let xored = auth::xor_salts(&server_salt, &client_salt).unwrap();
    let response = auth::hmac_response("hmac+sha256", b"wrong", &xored).unwrap();
    if let Value::Map(m) = &mut caps {
        m.insert(MapKey::from("challenge_response"), Value::Bytes(Bytes::from(response)));
        m.insert(MapKey::from("challenge_client_salt"), Value::Bytes(Bytes::from(client_salt)));
    }
    client.send_hello(caps).await;
    assert_eq!(
        client.recv_until_closed().await.as_deref(),
        Some("authentication-failed")
    );
    handle.stop().await;
}

#[tokio::test]
async fn test_damage_draw_ack() {
    let pixels = TestPixels::new();
    let (handle, _join) = Session::spawn(test_config(Arc::clone(&pixels)));
    let mut client = TestClient::connect(&handle).await;
    client.handshake("C-1").await;

    add_window(&handle, &pixels, 100, 100).await;

    let new_window = client.recv().await;
    assert_eq!(new_window[0].as_str(), Some("new-window"));
    assert_eq!(new_window[1].as_i64(), Some(1));
    assert_eq!(new_window[4].as_i64(), Some(100));

    // The initial attach paints the whole surface.
    let draw = client.recv().await;
    assert_eq!(draw[0].as_str(), Some("draw"));
    assert_eq!(draw[1].as_i64(), Some(1), "wid");
    assert_eq!(draw[4].as_i64(), Some(100), "width");
    assert_eq!(draw[5].as_i64(), Some(100), "height");
    assert_eq!(draw[6].as_str(), Some("rgb"));
    let sequence = draw[8].as_u64().unwrap();
    assert_eq!(sequence, 1);
    client.ack(1, sequence).await;

    // Fresh damage produces the next sequence.
    pixels.set(1, 100, 100, 2);
    handle
        .backend(BackendEvent::Damage {
            wid: 1,
            rect: Rect::new(0, 0, 100, 100),
        })
        .await
        .unwrap();
    let draw = client.recv().await;
    assert_eq!(draw[0].as_str(), Some("draw"));
    assert_eq!(draw[8].as_u64(), Some(2));
    handle.stop().await;
}

#[tokio::test]
async fn test_sharing_broadcasts_draws() {
    let pixels = TestPixels::new();
    let mut config = test_config(Arc::clone(&pixels));
    config.sharing = true;
    let (handle, _join) = Session::spawn(config);

    let mut a = TestClient::connect(&handle).await;
    let mut caps = TestClient::hello_caps("A");
    if let Value::Map(m) = &mut caps {
        m.insert(MapKey::from("share"), Value::Bool(true));
    }
    a.send_hello(caps).await;
    a.recv().await; // hello
    a.endpoint.set_encoder(PacketEncoder::Rencode).await;
    a.endpoint.set_authenticated();

    let mut b = TestClient::connect(&handle).await;
    let mut caps = TestClient::hello_caps("B");
    if let Value::Map(m) = &mut caps {
        m.insert(MapKey::from("share"), Value::Bool(true));
    }
    b.send_hello(caps).await;
    b.recv().await; // hello
    b.endpoint.set_encoder(PacketEncoder::Rencode).await;
    b.endpoint.set_authenticated();

    // A learns that B joined.
    let event = a.recv().await;
    assert_eq!(event[0].as_str(), Some("server-event"));

    add_window(&handle, &pixels, 64, 64).await;

    for client in [&mut a, &mut b] {
        let new_window = client.recv().await;
        assert_eq!(new_window[0].as_str(), Some("new-window"));
        let draw = client.recv().await;
        assert_eq!(draw[0].as_str(), Some("draw"));
        assert_eq!(draw[8].as_u64(), Some(1), "sequences are per client");
    }
    handle.stop().await;
}

#[tokio::test]
async fn test_session_busy_and_steal() {
    let pixels = TestPixels::new();
    let (handle, _join) = Session::spawn(test_config(pixels));

    let mut a = TestClient::connect(&handle).await;
    a.handshake("A").await;

    // Sharing disabled: a second plain client is refused.
    let mut b = TestClient::connect(&handle).await;
    b.send_hello(TestClient::hello_caps("B")).await;
    assert_eq!(b.recv_until_closed().await.as_deref(), Some("session-busy"));

    // A thief displaces the incumbent.
    let mut c = TestClient::connect(&handle).await;
    let mut caps = TestClient::hello_caps("C");
    if let Value::Map(m) = &mut caps {
        m.insert(MapKey::from("steal"), Value::Bool(true));
    }
    c.send_hello(caps).await;
    let hello = c.recv().await;
    assert_eq!(hello[0].as_str(), Some("hello"));
    assert_eq!(a.recv_until_closed().await.as_deref(), Some("policy"));
    handle.stop().await;
}

#[tokio::test]
async fn test_reconnect_restores_session() {
    let pixels = TestPixels::new();
    let (handle, _join) = Session::spawn(test_config(Arc::clone(&pixels)));

    let mut client = TestClient::connect(&handle).await;
    client.handshake("C-1").await;
    add_window(&handle, &pixels, 80, 80).await;
    let new_window = client.recv().await;
    assert_eq!(new_window[0].as_str(), Some("new-window"));
    let draw = client.recv().await;
    let sequence = draw[8].as_u64().unwrap();
    client.ack(1, sequence).await;

    // Abrupt transport loss, no disconnect packet.
    client.endpoint.close(None).await;
    drop(client);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Same UUID, fresh transport, inside the reconnect window.
    let mut client = TestClient::connect(&handle).await;
    client.handshake("C-1").await;
    // The current surface set is re-announced and damage resumes from a
    // fresh sequence.
    let new_window = client.recv().await;
    assert_eq!(new_window[0].as_str(), Some("new-window"));
    assert_eq!(new_window[1].as_i64(), Some(1));
    let draw = client.recv().await;
    assert_eq!(draw[0].as_str(), Some("draw"));
    assert_eq!(draw[8].as_u64(), Some(1));
    handle.stop().await;
}

#[tokio::test]
async fn test_readonly_input_is_dropped() {
    let pixels = TestPixels::new();

    #[derive(Default)]
    struct RecordingSink {
        inputs: Mutex<Vec<InputEvent>>,
    }
    impl PlatformSink for RecordingSink {
        fn input(&self, event: InputEvent) {
            self.inputs.lock().unwrap().push(event);
        }
    }
    let sink = Arc::new(RecordingSink::default());
    let mut config = test_config(Arc::clone(&pixels));
    config.platform = sink.clone();
    let (handle, _join) = Session::spawn(config);

    let mut client = TestClient::connect(&handle).await;
    let mut caps = TestClient::hello_caps("RO");
    if let Value::Map(m) = &mut caps {
        m.insert(MapKey::from("readonly"), Value::Bool(true));
    }
    client.send_hello(caps).await;
    client.recv().await;
    client.endpoint.set_encoder(PacketEncoder::Rencode).await;
    client.endpoint.set_authenticated();

    add_window(&handle, &pixels, 32, 32).await;
    client.recv().await; // new-window

    client
        .endpoint
        .send(
            PacketPriority::Metadata,
            vec![
                Value::Str("pointer-position".into()),
                Value::Int(1),
                Value::Int(5),
                Value::Int(5),
            ],
        )
        .await
        .unwrap();
    // Force a round-trip so the input would have been seen by now.
    client
        .endpoint
        .send(PacketPriority::Metadata, vec![Value::Str("info-request".into())])
        .await
        .unwrap();
    loop {
        let p = client.recv().await;
        if p[0].as_str() == Some("info-response") {
            break;
        }
    }
    assert!(sink.inputs.lock().unwrap().is_empty());
    handle.stop().await;
}

#[tokio::test]
async fn test_lossy_draw_gets_auto_refresh() {
    use crate::encode::mock::MockEncoder;

    let pixels = TestPixels::new();
    let mut config = test_config(Arc::clone(&pixels));
    config
        .registry
        .register(Arc::new(MockEncoder::lossy("jpeg")))
        .unwrap();
    let (handle, _join) = Session::spawn(config);

    let mut client = TestClient::connect(&handle).await;
    let mut caps = TestClient::hello_caps("C-1");
    if let Value::Map(m) = &mut caps {
        m.insert(
            MapKey::from("encodings"),
            Value::List(vec!["jpeg".into(), "rgb".into(), "png".into()]),
        );
    }
    client.send_hello(caps).await;
    client.recv().await;
    client.endpoint.set_encoder(PacketEncoder::Rencode).await;
    client.endpoint.set_authenticated();

    add_window(&handle, &pixels, 200, 200).await;
    handle
        .backend(BackendEvent::ContentType {
            wid: 1,
            content_type: ContentType::Picture,
        })
        .await
        .unwrap();
    client.recv().await; // new-window

    let draw = client.recv().await;
    assert_eq!(draw[6].as_str(), Some("jpeg"));
    let sequence = draw[8].as_u64().unwrap();
    client.ack(1, sequence).await;

    // With no further damage, the auto-refresh sends one lossless frame
    // for the same region.
    let refresh = client.recv().await;
    assert_eq!(refresh[0].as_str(), Some("draw"));
    let encoding = refresh[6].as_str().unwrap();
    assert_ne!(encoding, "jpeg");
    assert_eq!(refresh[8].as_u64(), Some(sequence + 1));
    handle.stop().await;
}
