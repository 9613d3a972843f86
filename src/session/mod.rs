//! The session: one virtual display, its surface set, and every client
//! attached to it.
//!
//! The session is a single actor. All mutations of the window model, the
//! display and the client map happen on its task; endpoints, timers and
//! encoder workers communicate with it exclusively through the event
//! channel. The session outlives every client: transports come and go,
//! the display stays.

pub mod client;
pub mod handshake;
pub mod upgrade;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use codec::{MapKey, Value};
use log::{debug, info, warn};
use proto::{
    derive_session_keys, CipherMode, CryptoContext, Endpoint, EndpointEvent, PacketPriority,
    Transport,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::auth::{self, Authenticator};
use crate::channels::clipboard::ClipboardAction;
use crate::channels::ReceivedFile;
use crate::damage::{Action, DamageConfig, DamageState, EncodeJob, FireOutcome, Plan};
use crate::encode::image::{ImageBuffer, PixelFormat};
use crate::encode::{EncodeOptions, EncoderRegistry};
use crate::error::{Error, Result};
use crate::message::{outbound, ClientPacket, DisconnectReason, HelloCaps};
use crate::model::{
    ContentType, ModelEvent, Rect, VirtualDisplay, Wid, WindowMetadata, WindowModel,
};
use crate::session::client::{ClientConn, ClientId, ClientPhase, RetainedClient};

/// Pixel access to the platform backend's current frame for a surface.
pub trait PixelSource: Send + Sync {
    fn capture(&self, wid: Wid) -> Option<ImageBuffer>;
}

#[derive(Debug, Clone)]
pub enum InputEvent {
    Pointer { wid: Wid, x: i32, y: i32 },
    Button { wid: Wid, button: u8, pressed: bool, x: i32, y: i32 },
    Key { wid: Wid, keyname: String, pressed: bool, modifiers: Vec<String> },
    Wheel { wid: Wid, button: u8, distance: i32 },
    Close { wid: Wid },
}

/// Everything the session hands back to the platform side. All methods
/// default to no-ops so tests and shadow-only deployments can ignore
/// what they do not consume.
pub trait PlatformSink: Send + Sync {
    fn input(&self, _event: InputEvent) {}
    fn clipboard_token(&self, _selection: &str) {}
    fn clipboard_request(&self, _request_id: u64, _selection: &str, _target: &str) {}
    fn clipboard_data(&self, _request_id: u64, _selection: &str, _data: Bytes) {}
    fn file_received(&self, _file: ReceivedFile) {}
    fn microphone_data(&self, _codec: &str, _data: Bytes, _timestamp_ms: u64) {}
}

struct NoopPlatform;
impl PlatformSink for NoopPlatform {}

pub struct CipherSetup {
    pub secret: Vec<u8>,
    pub modes: Vec<CipherMode>,
    pub iterations: u32,
}

pub struct SessionConfig {
    pub session_uuid: String,
    pub display_size: (u32, u32),
    pub sharing: bool,
    pub readonly: bool,
    pub authenticators: Vec<Arc<dyn Authenticator>>,
    pub auth_retries: u32,
    pub reconnect_window: Duration,
    pub idle_timeout: Option<Duration>,
    pub damage: DamageConfig,
    pub registry: EncoderRegistry,
    pub pixels: Arc<dyn PixelSource>,
    pub platform: Arc<dyn PlatformSink>,
    pub cipher: Option<CipherSetup>,
    pub max_file_size: u64,
    /// Where the upgrade rendezvous file lives; no upgrades without it.
    pub runtime_dir: Option<PathBuf>,
}

impl SessionConfig {
    pub fn new(pixels: Arc<dyn PixelSource>) -> SessionConfig {
        SessionConfig {
            session_uuid: new_session_uuid(),
            display_size: (1024, 768),
            sharing: false,
            readonly: false,
            authenticators: vec![],
            auth_retries: auth::DEFAULT_AUTH_RETRIES,
            reconnect_window: Duration::from_secs(120),
            idle_timeout: None,
            damage: DamageConfig::default(),
            registry: EncoderRegistry::with_builtins(),
            pixels,
            platform: Arc::new(NoopPlatform),
            cipher: None,
            max_file_size: crate::channels::DEFAULT_MAX_FILE_SIZE,
            runtime_dir: None,
        }
    }
}

fn new_session_uuid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| char::from(rng.sample(rand::distributions::Alphanumeric)))
        .collect()
}

/// Surface lifecycle and damage notifications from the platform backend.
#[derive(Debug)]
pub enum BackendEvent {
    NewWindow {
        geometry: Rect,
        metadata: WindowMetadata,
        pixel_format: PixelFormat,
        alpha: bool,
        override_redirect: bool,
    },
    Damage { wid: Wid, rect: Rect },
    Metadata { wid: Wid, metadata: WindowMetadata },
    Geometry { wid: Wid, geometry: Rect },
    RemoveWindow { wid: Wid },
    ContentType { wid: Wid, content_type: ContentType },
    Bell { wid: Wid, percent: i32 },
    Cursor { image: Option<(u32, u32, u32, u32, Bytes)> },
    Notification {
        nid: u64,
        app_name: String,
        summary: String,
        body: String,
        expire_ms: i64,
    },
    ClipboardToken { selection: String },
    ClipboardData { request_id: u64, selection: String, data: Bytes },
    AudioData {
        codec: String,
        data: Bytes,
        timestamp_ms: u64,
        end_of_stream: bool,
    },
}

pub enum SessionEvent {
    Connected {
        endpoint: Endpoint,
        events: mpsc::Receiver<EndpointEvent>,
    },
    FromClient { cid: ClientId, event: EndpointEvent },
    BatchTimer { cid: ClientId, wid: Wid, generation: u64 },
    RefreshTimer { cid: ClientId, wid: Wid, generation: u64 },
    EncodeDone {
        cid: ClientId,
        job: EncodeJob,
        image: ImageBuffer,
        result: Result<crate::encode::EncodedFrame>,
    },
    Backend(BackendEvent),
    Housekeeping,
    Info { reply: oneshot::Sender<Value> },
    Upgrade { reply: oneshot::Sender<Result<()>> },
    Shutdown { reason: DisconnectReason },
}

/// Cloneable handle for the server front-end and the platform glue.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Hands a fresh transport to the session; the endpoint tasks start
    /// immediately, the client becomes real after its hello.
    pub async fn attach_transport(&self, transport: Transport) -> Result<()> {
        let (endpoint, events) = Endpoint::spawn(transport, Default::default());
        self.tx
            .send(SessionEvent::Connected { endpoint, events })
            .await
            .map_err(|_| Error::ErrSessionState("session is gone".into()))
    }

    pub async fn backend(&self, event: BackendEvent) -> Result<()> {
        self.tx
            .send(SessionEvent::Backend(event))
            .await
            .map_err(|_| Error::ErrSessionState("session is gone".into()))
    }

    pub async fn info(&self) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionEvent::Info { reply })
            .await
            .map_err(|_| Error::ErrSessionState("session is gone".into()))?;
        rx.await
            .map_err(|_| Error::ErrSessionState("session is gone".into()))
    }

    /// Writes the rendezvous state and shuts the process-side down,
    /// leaving the display for a successor.
    pub async fn upgrade(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionEvent::Upgrade { reply })
            .await
            .map_err(|_| Error::ErrSessionState("session is gone".into()))?;
        rx.await
            .map_err(|_| Error::ErrSessionState("session is gone".into()))?
    }

    pub async fn stop(&self) {
        let _ = self
            .tx
            .send(SessionEvent::Shutdown {
                reason: DisconnectReason::ServerShutdown,
            })
            .await;
    }
}

pub struct Session {
    config: SessionConfig,
    tx: mpsc::Sender<SessionEvent>,
    model: WindowModel,
    display: VirtualDisplay,
    clients: HashMap<ClientId, ClientConn>,
    retained: HashMap<String, RetainedClient>,
    /// Outstanding platform-side clipboard fetches: request id -> client.
    clipboard_requests: HashMap<u64, ClientId>,
    next_cid: ClientId,
    running: bool,
}

impl Session {
    /// Starts the session actor; it runs until [`SessionHandle::stop`].
    pub fn spawn(config: SessionConfig) -> (SessionHandle, tokio::task::JoinHandle<()>) {
        Self::spawn_with_model(config, None)
    }

    /// Starts the actor over a window model restored from an upgrade.
    pub fn spawn_with_model(
        config: SessionConfig,
        model: Option<WindowModel>,
    ) -> (SessionHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let display = VirtualDisplay::new(config.display_size.0, config.display_size.1);
        let session = Session {
            display,
            model: model.unwrap_or_default(),
            clients: HashMap::new(),
            retained: HashMap::new(),
            clipboard_requests: HashMap::new(),
            next_cid: 1,
            running: true,
            tx: tx.clone(),
            config,
        };
        let handle = SessionHandle { tx: tx.clone() };

        // Housekeeping heartbeat: idle timeouts, reconnect-window and
        // transfer expiry.
        let hk_tx = tx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if hk_tx.send(SessionEvent::Housekeeping).await.is_err() {
                    return;
                }
            }
        });

        let join = tokio::spawn(session.run(rx));
        (handle, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionEvent>) {
        info!("session {} started", self.config.session_uuid);
        while self.running {
            let Some(event) = rx.recv().await else { break };
            self.handle_event(event).await;
        }
        info!("session {} stopped", self.config.session_uuid);
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { endpoint, events } => self.on_connected(endpoint, events),
            SessionEvent::FromClient { cid, event } => self.on_client_event(cid, event).await,
            SessionEvent::BatchTimer { cid, wid, generation } => {
                self.on_batch_timer(cid, wid, generation).await
            }
            SessionEvent::RefreshTimer { cid, wid, generation } => {
                self.on_refresh_timer(cid, wid, generation).await
            }
            SessionEvent::EncodeDone { cid, job, image, result } => {
                self.on_encode_done(cid, job, image, result).await
            }
            SessionEvent::Backend(event) => self.on_backend(event).await,
            SessionEvent::Housekeeping => self.on_housekeeping().await,
            SessionEvent::Info { reply } => {
                let _ = reply.send(self.info_snapshot());
            }
            SessionEvent::Upgrade { reply } => {
                let _ = reply.send(self.on_upgrade().await);
            }
            SessionEvent::Shutdown { reason } => self.on_shutdown(reason).await,
        }
    }

    fn on_connected(&mut self, endpoint: Endpoint, mut events: mpsc::Receiver<EndpointEvent>) {
        let cid = self.next_cid;
        self.next_cid += 1;
        info!("connection {cid} from {}", endpoint.info());
        self.clients.insert(
            cid,
            ClientConn::new(cid, endpoint, self.config.max_file_size, Instant::now()),
        );
        // Pump endpoint events into the session queue, tagged.
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closed = matches!(event, EndpointEvent::Closed(_));
                if tx.send(SessionEvent::FromClient { cid, event }).await.is_err() || closed {
                    return;
                }
            }
        });
    }

    async fn on_client_event(&mut self, cid: ClientId, event: EndpointEvent) {
        match event {
            EndpointEvent::Packet(packet) => {
                if let Err(e) = self.on_client_packet(cid, packet).await {
                    warn!("client {cid}: {e}");
                    self.drop_client(cid, Some(e.disconnect_reason()), false).await;
                }
            }
            EndpointEvent::Closed(reason) => {
                if let Some(e) = reason {
                    debug!("client {cid} connection lost: {e}");
                }
                // An abrupt loss keeps the seat warm for a reconnect.
                self.drop_client(cid, None, true).await;
            }
        }
    }

    async fn on_client_packet(&mut self, cid: ClientId, packet: Vec<Value>) -> Result<()> {
        let packet = ClientPacket::parse(&packet)?;
        let active = self
            .clients
            .get(&cid)
            .map(ClientConn::is_active)
            .unwrap_or(false);
        if !active && !packet.packet_type().allowed_pre_auth() {
            return Err(Error::ErrPacketBeforeAuth(
                packet.packet_type().as_str().to_owned(),
            ));
        }
        match packet {
            ClientPacket::Hello(caps) => self.on_hello(cid, *caps).await,
            ClientPacket::Disconnect { reason } => {
                debug!("client {cid} disconnected: {reason}");
                self.drop_client(cid, None, false).await;
                Ok(())
            }
            packet => self.on_active_packet(cid, packet).await,
        }
    }

    // ---- handshake ----------------------------------------------------

    async fn on_hello(&mut self, cid: ClientId, caps: HelloCaps) -> Result<()> {
        handshake::check_version(&caps.version)?;

        let phase = {
            let client = self.clients.get(&cid).ok_or_else(gone)?;
            match &client.phase {
                ClientPhase::Active => return Ok(()), // duplicate hello, ignore
                ClientPhase::PendingHello => None,
                ClientPhase::Challenged { index, server_salt, retries } => {
                    Some((*index, server_salt.clone(), *retries))
                }
            }
        };

        let auth_index = match phase {
            None => 0,
            Some((index, server_salt, retries)) => {
                // A challenge is outstanding: this hello must answer it.
                let authenticator = self.config.authenticators[index].clone();
                let digest = auth::strongest_digest(&caps.digests)?;
                let (response, client_salt) = match (
                    caps.challenge_response.clone(),
                    caps.challenge_client_salt.clone(),
                ) {
                    (Some(r), Some(s)) => (r, s),
                    _ => return Err(Error::ErrAuthenticationFailed),
                };
                let ok = authenticator
                    .verify(digest, &response, &server_salt, &client_salt)
                    .await?;
                if !ok {
                    let retries = retries + 1;
                    if retries >= self.config.auth_retries {
                        return Err(Error::ErrAuthRetriesExceeded);
                    }
                    self.send_challenge(cid, index, retries).await?;
                    return Ok(());
                }
                index + 1
            }
        };

        // Next module that insists on a challenge, if any.
        for index in auth_index..self.config.authenticators.len() {
            if self.config.authenticators[index].requires_challenge() {
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                client.caps = caps;
                return self.send_challenge(cid, index, 0).await;
            }
        }

        self.admit(cid, caps).await
    }

    async fn send_challenge(&mut self, cid: ClientId, index: usize, retries: u32) -> Result<()> {
        let server_salt = auth::new_salt();
        let digests: Vec<String> = auth::DIGESTS.iter().map(|d| d.to_string()).collect();
        let prompt = self.config.authenticators[index].prompt().to_owned();
        let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
        client.phase = ClientPhase::Challenged {
            index,
            server_salt: server_salt.clone(),
            retries,
        };
        client
            .endpoint
            .send(
                PacketPriority::Control,
                outbound::challenge(&server_salt, &digests, &prompt),
            )
            .await?;
        Ok(())
    }

    /// Authentication is done; apply sharing policy, negotiate, attach.
    async fn admit(&mut self, cid: ClientId, caps: HelloCaps) -> Result<()> {
        // Sharing / stealing policy against already-active clients.
        let others: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(id, c)| **id != cid && c.is_active())
            .map(|(id, _)| *id)
            .collect();
        if !others.is_empty() {
            let share_ok = self.config.sharing && caps.share;
            if !share_ok {
                if caps.steal {
                    for other in others {
                        info!("client {other} displaced by steal from {cid}");
                        self.drop_client(other, Some(DisconnectReason::Policy), false)
                            .await;
                    }
                } else {
                    return Err(Error::ErrSessionBusy);
                }
            }
        }

        let negotiated = handshake::negotiate(&caps, &self.config.registry.encodings())?;

        // Cipher parameters ride in the server hello; the first encrypted
        // chunk follows it.
        let cipher = match (&self.config.cipher, caps.ciphers.is_empty()) {
            (Some(setup), false) => {
                let mode = caps
                    .ciphers
                    .iter()
                    .find_map(|name| CipherMode::from_name(name).ok())
                    .filter(|m| setup.modes.contains(m))
                    .ok_or(Error::ErrNoCommonCapability("cipher"))?;
                let salt = auth::new_salt();
                Some((mode, salt, setup.iterations))
            }
            _ => None,
        };

        let hello = outbound::hello(handshake::server_hello_caps(
            &self.config.session_uuid,
            &negotiated,
            self.display.size(),
            self.display.max_size(),
            self.model.count(),
            cipher
                .as_ref()
                .map(|(mode, salt, rounds)| (mode.as_str(), &salt[..], *rounds)),
        ));

        let reconnected = self.retained.remove(&caps.uuid);
        let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
        match &cipher {
            // The hello itself leaves in the clear; everything after it is
            // sealed under the keys its parameters derive.
            Some((mode, salt, _)) => {
                let setup = self.config.cipher.as_ref().expect("cipher configured");
                let keys = derive_session_keys(&setup.secret, salt, setup.iterations);
                client
                    .endpoint
                    .send_then_encrypt(
                        PacketPriority::Control,
                        hello,
                        CryptoContext::new(*mode, keys.to_client),
                        CryptoContext::new(*mode, keys.to_server),
                    )
                    .await?;
            }
            None => client.endpoint.send(PacketPriority::Control, hello).await?,
        }
        // From here on the negotiated codec and compressor apply.
        client.endpoint.set_encoder(negotiated.packet_encoder).await;
        client.endpoint.set_compressor(negotiated.compressor).await;
        client.endpoint.set_authenticated();

        client.phase = ClientPhase::Active;
        client.uuid = caps.uuid.clone();
        client.share = caps.share;
        client.readonly = caps.readonly || self.config.readonly;
        client.encodings = negotiated.encodings;
        client.clipboard.set_direction(caps.clipboard_direction);
        client.caps = caps;

        if let Some(retained) = reconnected {
            info!("client {cid} reconnected as `{}`", client.uuid);
            client.clipboard = retained.clipboard;
            if let Some(wid) = retained.focus {
                if self.model.contains(wid) {
                    let _ = self.model.focus(Some(wid));
                }
            }
        }

        let uuid = self
            .clients
            .get(&cid)
            .map(|c| c.uuid.clone())
            .unwrap_or_default();
        self.attach_windows(cid).await?;
        self.broadcast_server_event(cid, &uuid, "client-connected").await;
        Ok(())
    }

    /// Session damage defaults with the client's hello overrides applied.
    fn client_damage_config(&self, caps: &HelloCaps) -> DamageConfig {
        let mut config = self.config.damage.clone();
        if let Some(ms) = caps.auto_refresh_delay_ms {
            config.auto_refresh_delay = Duration::from_millis(ms);
        }
        config
    }

    fn new_scheduler(
        &self,
        wid: Wid,
        geometry: Rect,
        pixel_format: PixelFormat,
        alpha: bool,
        content_type: ContentType,
        client: &ClientConn,
    ) -> DamageState {
        let mut sched = DamageState::new(
            wid,
            Rect::new(0, 0, geometry.w, geometry.h),
            pixel_format,
            alpha,
            self.config.registry.descriptors(),
            client.encodings.clone(),
            self.client_damage_config(&client.caps),
        );
        sched.set_content_type(content_type);
        if let Some(q) = client.caps.quality {
            sched.set_quality(q);
        }
        if let Some(q) = client.caps.min_quality {
            sched.set_min_quality(q);
        }
        if let Some(s) = client.caps.speed {
            sched.set_speed(s);
        }
        if let Some(s) = client.caps.min_speed {
            sched.set_min_speed(s);
        }
        if let Some(limit) = client.caps.bandwidth_limit {
            sched.set_bandwidth_limit(limit);
        }
        sched
    }

    /// Sends the current surface set and starts damage flow.
    async fn attach_windows(&mut self, cid: ClientId) -> Result<()> {
        let now = Instant::now();
        let mut built: Vec<(Wid, Vec<Value>, DamageState, Vec<Action>)> = vec![];
        let endpoint = {
            let client = self.clients.get(&cid).ok_or_else(gone)?;
            for surface in self.model.iter() {
                let geometry = surface.geometry;
                let packet = outbound::new_window(
                    surface.wid,
                    geometry.x,
                    geometry.y,
                    geometry.w,
                    geometry.h,
                    surface.metadata.to_map(),
                    surface.override_redirect,
                );
                let mut sched = self.new_scheduler(
                    surface.wid,
                    geometry,
                    surface.pixel_format,
                    surface.alpha,
                    surface.content_type,
                    client,
                );
                // Initial full paint.
                let actions = sched.damage(Rect::new(0, 0, geometry.w, geometry.h), now);
                built.push((surface.wid, packet, sched, actions));
            }
            client.endpoint.clone()
        };

        for (wid, packet, sched, actions) in built {
            endpoint.send(PacketPriority::Metadata, packet).await?;
            if let Some(client) = self.clients.get_mut(&cid) {
                client.schedulers.insert(wid, sched);
            }
            self.arm_actions(cid, wid, actions);
        }
        endpoint
            .send(PacketPriority::Control, outbound::startup_complete())
            .await?;
        Ok(())
    }

    async fn broadcast_server_event(&mut self, about: ClientId, uuid: &str, event: &str) {
        for client in self.clients.values() {
            if client.cid != about && client.is_active() {
                let _ = client
                    .endpoint
                    .send(
                        PacketPriority::Metadata,
                        outbound::server_event(event, uuid),
                    )
                    .await;
            }
        }
    }

    // ---- active-client packets ----------------------------------------

    async fn on_active_packet(&mut self, cid: ClientId, packet: ClientPacket) -> Result<()> {
        match packet {
            ClientPacket::Ping { echo_ms } => {
                let client = self.clients.get(&cid).ok_or_else(gone)?;
                client
                    .endpoint
                    .send(
                        PacketPriority::Keepalive,
                        outbound::ping_echo(echo_ms, load_average()),
                    )
                    .await?;
            }
            ClientPacket::PingEcho { echo_ms, .. } => {
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                let now = client.endpoint.now_ms();
                client.latency_ms = now.saturating_sub(echo_ms.max(0) as u64);
            }
            ClientPacket::DamageSequence {
                sequence,
                wid,
                decode_time_us,
                message,
                ..
            } => {
                let now = Instant::now();
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                let backpressure = *client.backpressure.borrow();
                if let Some(sched) = client.schedulers.get_mut(&wid) {
                    let actions = sched.ack(sequence, decode_time_us, &message, now, backpressure);
                    self.arm_actions(cid, wid, actions);
                }
            }
            ClientPacket::BufferRefresh { wid, quality } => {
                let bounds = self
                    .model
                    .get(wid)
                    .map(|s| Rect::new(0, 0, s.geometry.w, s.geometry.h))
                    .ok_or(Error::ErrNoSuchWindow(wid))?;
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                if let Some(sched) = client.schedulers.get_mut(&wid) {
                    if let Some(q) = quality {
                        sched.set_quality(q);
                    }
                    let actions = sched.damage(bounds, Instant::now());
                    self.arm_actions(cid, wid, actions);
                }
            }
            ClientPacket::MapWindow { wid } => {
                self.model.set_mapped(wid, true)?;
                // Remapping repaints from scratch.
                self.damage_all_clients(wid).await;
            }
            ClientPacket::UnmapWindow { wid } => {
                self.model.set_mapped(wid, false)?;
            }
            ClientPacket::ConfigureWindow { wid, x, y, w, h } => {
                let event = self.model.update_geometry(wid, Rect::new(x, y, w, h))?;
                if let Some(event) = event {
                    self.fanout_model_event(event, Some(cid)).await;
                }
            }
            ClientPacket::CloseWindow { wid } => {
                self.forward_input(cid, InputEvent::Close { wid })?;
            }
            ClientPacket::FocusWindow { wid } => {
                let target = if wid == 0 { None } else { Some(wid) };
                if let Some(event) = self.model.focus(target)? {
                    self.fanout_model_event(event, None).await;
                }
                if let Some(client) = self.clients.get_mut(&cid) {
                    client.last_input = Instant::now();
                }
            }
            ClientPacket::DesktopSize { width, height } => {
                let client_max = self
                    .clients
                    .get(&cid)
                    .and_then(|c| c.caps.desktop_size);
                if self.display.resize(width, height, client_max)? {
                    let (w, h) = self.display.size();
                    let (mw, mh) = self.display.max_size();
                    for client in self.clients.values() {
                        if client.is_active() {
                            let _ = client
                                .endpoint
                                .send(
                                    PacketPriority::Metadata,
                                    outbound::desktop_size(w, h, mw, mh),
                                )
                                .await;
                        }
                    }
                }
            }
            ClientPacket::PointerPosition { wid, x, y } => {
                self.forward_input(cid, InputEvent::Pointer { wid, x, y })?;
            }
            ClientPacket::ButtonAction { wid, button, pressed, x, y } => {
                self.forward_input(cid, InputEvent::Button { wid, button, pressed, x, y })?;
            }
            ClientPacket::KeyAction { wid, keyname, pressed, modifiers } => {
                self.forward_input(cid, InputEvent::Key { wid, keyname, pressed, modifiers })?;
            }
            ClientPacket::WheelMotion { wid, button, distance } => {
                self.forward_input(cid, InputEvent::Wheel { wid, button, distance })?;
            }
            ClientPacket::ClipboardToken { selection, .. } => {
                let now = Instant::now();
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                for action in client.clipboard.client_token(&selection, now)? {
                    if let ClipboardAction::ForwardToken { selection } = action {
                        self.config.platform.clipboard_token(selection);
                    }
                }
            }
            ClientPacket::ClipboardRequest { request_id, selection, target } => {
                // The client wants a server-held selection.
                self.clipboard_requests.insert(request_id, cid);
                self.config
                    .platform
                    .clipboard_request(request_id, &selection, &target);
            }
            ClientPacket::ClipboardContents { request_id, selection, data } => {
                let now = Instant::now();
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                for action in client
                    .clipboard
                    .data_received(request_id, &selection, data, now)?
                {
                    if let ClipboardAction::DeliverData { request_id, selection, data } = action {
                        self.config.platform.clipboard_data(request_id, selection, data);
                    }
                }
            }
            ClientPacket::SoundData { codec, data, timestamp_ms, end_of_stream } => {
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                if let Some(chunk) =
                    client.microphone.chunk(&codec, data, timestamp_ms, end_of_stream)
                {
                    self.config
                        .platform
                        .microphone_data(&chunk.codec, chunk.data, chunk.timestamp_ms);
                }
            }
            ClientPacket::SendFile { filename, mimetype, size, digest } => {
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                if !client.caps.file_transfer {
                    return Err(Error::ErrFileRejected("file transfer is disabled".into()));
                }
                let id = client
                    .files
                    .offer(&filename, &mimetype, size, digest, Instant::now())?;
                client
                    .endpoint
                    .send(PacketPriority::Bulk, outbound::ack_file_chunk(id))
                    .await?;
            }
            ClientPacket::FileChunk { chunk_id, data, last } => {
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                let done = client.files.chunk(chunk_id, &data, last, Instant::now())?;
                client
                    .endpoint
                    .send(PacketPriority::Bulk, outbound::ack_file_chunk(chunk_id))
                    .await?;
                if let Some(file) = done {
                    self.config.platform.file_received(file);
                }
            }
            ClientPacket::AckFileChunk { .. } => {}
            ClientPacket::NotifyClose { nid } => {
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                client.notifications.closed(nid);
            }
            ClientPacket::ConnectionData { bandwidth_limit, .. } => {
                if let Some(limit) = bandwidth_limit {
                    let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                    for sched in client.schedulers.values_mut() {
                        sched.set_bandwidth_limit(limit);
                    }
                }
            }
            ClientPacket::Control { command, args } => {
                self.on_control(cid, &command, &args).await?;
            }
            ClientPacket::InfoRequest => {
                let info = self.info_snapshot();
                let client = self.clients.get(&cid).ok_or_else(gone)?;
                let map = match info {
                    Value::Map(m) => m,
                    _ => BTreeMap::new(),
                };
                client
                    .endpoint
                    .send(PacketPriority::Metadata, outbound::info_response(map))
                    .await?;
            }
            ClientPacket::Suspend => {
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                client.suspended = true;
                debug!("client {cid} suspended");
            }
            ClientPacket::Resume => {
                let wids: Vec<Wid> = self.model.iter().map(|s| s.wid).collect();
                let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
                client.suspended = false;
                debug!("client {cid} resumed, repainting {} windows", wids.len());
                let now = Instant::now();
                let mut arm = vec![];
                for wid in wids {
                    if let (Some(surface), Some(sched)) =
                        (self.model.get(wid), client.schedulers.get_mut(&wid))
                    {
                        let bounds = Rect::new(0, 0, surface.geometry.w, surface.geometry.h);
                        arm.push((wid, sched.damage(bounds, now)));
                    }
                }
                for (wid, actions) in arm {
                    self.arm_actions(cid, wid, actions);
                }
            }
            ClientPacket::Hello(_) | ClientPacket::Disconnect { .. } => unreachable!(),
        }
        Ok(())
    }

    fn forward_input(&mut self, cid: ClientId, event: InputEvent) -> Result<()> {
        let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
        if client.readonly {
            // Read-only clients watch; their input is dropped quietly.
            return Ok(());
        }
        client.last_input = Instant::now();
        // Input is applied in arrival order on this task: last write wins,
        // serialized per surface by construction.
        self.config.platform.input(event);
        Ok(())
    }

    async fn on_control(&mut self, cid: ClientId, command: &str, args: &[String]) -> Result<()> {
        let arg = |i: usize| -> Result<u8> {
            args.get(i)
                .and_then(|a| a.parse::<i64>().ok())
                .map(|v| v.clamp(1, 100) as u8)
                .ok_or_else(|| Error::ErrBadPacket {
                    packet_type: "command_request".into(),
                    reason: format!("`{command}` needs a numeric argument"),
                })
        };
        let client = self.clients.get_mut(&cid).ok_or_else(gone)?;
        match command {
            "quality" => {
                let q = arg(0)?;
                client.schedulers.values_mut().for_each(|s| s.set_quality(q));
            }
            "min-quality" => {
                let q = arg(0)?;
                client
                    .schedulers
                    .values_mut()
                    .for_each(|s| s.set_min_quality(q));
            }
            "speed" => {
                let v = arg(0)?;
                client.schedulers.values_mut().for_each(|s| s.set_speed(v));
            }
            "min-speed" => {
                let v = arg(0)?;
                client
                    .schedulers
                    .values_mut()
                    .for_each(|s| s.set_min_speed(v));
            }
            "refresh" => {
                let wids: Vec<Wid> = self.model.iter().map(|s| s.wid).collect();
                let mut arm = vec![];
                let now = Instant::now();
                for wid in wids {
                    if let (Some(surface), Some(sched)) =
                        (self.model.get(wid), client.schedulers.get_mut(&wid))
                    {
                        let bounds = Rect::new(0, 0, surface.geometry.w, surface.geometry.h);
                        arm.push((wid, sched.damage(bounds, now)));
                    }
                }
                for (wid, actions) in arm {
                    self.arm_actions(cid, wid, actions);
                }
            }
            "bandwidth-limit" => {
                let limit = args
                    .first()
                    .and_then(|a| a.parse::<u64>().ok())
                    .unwrap_or(0);
                client
                    .schedulers
                    .values_mut()
                    .for_each(|s| s.set_bandwidth_limit(limit));
            }
            other => {
                return Err(Error::ErrBadPacket {
                    packet_type: "command_request".into(),
                    reason: format!("unknown control command `{other}`"),
                })
            }
        }
        Ok(())
    }

    // ---- damage pipeline ----------------------------------------------

    fn arm_actions(&self, cid: ClientId, wid: Wid, actions: Vec<Action>) {
        for action in actions {
            let tx = self.tx.clone();
            match action {
                Action::ArmBatchTimer { generation, delay } => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(SessionEvent::BatchTimer { cid, wid, generation }).await;
                    });
                }
                Action::ArmRefreshTimer { generation, delay } => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx
                            .send(SessionEvent::RefreshTimer { cid, wid, generation })
                            .await;
                    });
                }
            }
        }
    }

    fn draw_priority(&self, wid: Wid) -> PacketPriority {
        if self.model.focused() == Some(wid) {
            PacketPriority::FocusedDraw
        } else {
            PacketPriority::Draw
        }
    }

    async fn on_batch_timer(&mut self, cid: ClientId, wid: Wid, generation: u64) {
        let now = Instant::now();
        let Some(client) = self.clients.get_mut(&cid) else { return };
        if client.suspended {
            return;
        }
        let backpressure = *client.backpressure.borrow();
        let Some(sched) = client.schedulers.get_mut(&wid) else { return };
        if !sched.wants_fire(generation) {
            return;
        }
        let Some(image) = self.config.pixels.capture(wid) else {
            // The surface vanished under us; the remove event will follow.
            return;
        };
        let outcome = sched.timer_fired(generation, &image, now, backpressure);
        self.handle_fire_outcome(cid, wid, image, outcome).await;
    }

    async fn on_refresh_timer(&mut self, cid: ClientId, wid: Wid, generation: u64) {
        let now = Instant::now();
        let Some(client) = self.clients.get_mut(&cid) else { return };
        if client.suspended {
            return;
        }
        let backpressure = *client.backpressure.borrow();
        let Some(sched) = client.schedulers.get_mut(&wid) else { return };
        let outcome = sched.refresh_fired(generation, now, backpressure);
        match outcome {
            FireOutcome::Deferred(actions) => self.arm_actions(cid, wid, actions),
            FireOutcome::Plan(Plan::Encode(job), actions) => {
                self.arm_actions(cid, wid, actions);
                if let Some(image) = self.config.pixels.capture(wid) {
                    self.dispatch_encode(cid, job, image);
                }
            }
            FireOutcome::Plan(_, actions) => self.arm_actions(cid, wid, actions),
        }
    }

    async fn handle_fire_outcome(
        &mut self,
        cid: ClientId,
        wid: Wid,
        image: ImageBuffer,
        outcome: FireOutcome,
    ) {
        match outcome {
            FireOutcome::Deferred(actions) => self.arm_actions(cid, wid, actions),
            FireOutcome::Plan(plan, actions) => {
                self.arm_actions(cid, wid, actions);
                match plan {
                    Plan::Skip => {}
                    Plan::Scroll { sequence, bands } => {
                        let priority = self.draw_priority(wid);
                        let packet_bands: Vec<(u32, u32, u32)> = bands
                            .iter()
                            .map(|b| (b.src_y, b.dst_y, b.height))
                            .collect();
                        if let Some(client) = self.clients.get(&cid) {
                            let _ = client
                                .endpoint
                                .send(priority, outbound::scroll(wid, sequence, &packet_bands))
                                .await;
                        }
                    }
                    Plan::Delta {
                        sequence,
                        region,
                        data,
                        rowstride,
                        reference,
                        store,
                    } => {
                        let priority = self.draw_priority(wid);
                        let mut options = BTreeMap::new();
                        options.insert(MapKey::from("delta"), Value::Int(reference as i64));
                        options.insert(MapKey::from("store"), Value::Int(store as i64));
                        if let Some(client) = self.clients.get(&cid) {
                            let _ = client
                                .endpoint
                                .send(
                                    priority,
                                    outbound::draw(
                                        wid, region.x, region.y, region.w, region.h, "delta",
                                        data, sequence, rowstride, options,
                                    ),
                                )
                                .await;
                        }
                    }
                    Plan::Encode(job) => self.dispatch_encode(cid, job, image),
                }
            }
        }
    }

    /// Runs the actual codec on a blocking worker; the result returns as
    /// an event.
    fn dispatch_encode(&self, cid: ClientId, job: EncodeJob, image: ImageBuffer) {
        let tx = self.tx.clone();
        let mut registry = self.config.registry.clone();
        tokio::task::spawn_blocking(move || {
            let result = registry.encode(
                &job.encoding,
                &image,
                &job.region,
                job.quality,
                job.speed,
                &EncodeOptions {
                    lossless: job.lossless,
                    content_type: job.content_type,
                },
            );
            let _ = tx.blocking_send(SessionEvent::EncodeDone { cid, job, image, result });
        });
    }

    async fn on_encode_done(
        &mut self,
        cid: ClientId,
        job: EncodeJob,
        image: ImageBuffer,
        result: Result<crate::encode::EncodedFrame>,
    ) {
        let now = Instant::now();
        let wid = job.wid;
        let priority = self.draw_priority(wid);
        match result {
            Ok(frame) => {
                let Some(client) = self.clients.get_mut(&cid) else { return };
                let Some(sched) = client.schedulers.get_mut(&wid) else { return };
                let (sequence, actions) =
                    sched.encode_complete(&job, &image, frame.data.len(), frame.lossy, now);
                let packet = outbound::draw(
                    wid,
                    job.region.x,
                    job.region.y,
                    job.region.w,
                    job.region.h,
                    &frame.encoding,
                    frame.data,
                    sequence,
                    frame.rowstride,
                    frame.client_options,
                );
                // Encoder output is already entropy-coded.
                let _ = client.endpoint.send_with(priority, packet, true).await;
                self.arm_actions(cid, wid, actions);
            }
            Err(e) => {
                warn!("client {cid} window {wid}: encode failed: {e}");
                if let Error::ErrEncoderPermanent { ref name, .. } = e {
                    self.config.registry.unregister(name);
                    let descriptors = self.config.registry.descriptors();
                    for client in self.clients.values_mut() {
                        for sched in client.schedulers.values_mut() {
                            sched.set_candidates(descriptors.clone());
                        }
                    }
                }
                if let Some(client) = self.clients.get_mut(&cid) {
                    if let Some(sched) = client.schedulers.get_mut(&wid) {
                        let actions = sched.encode_failed(&job, now);
                        self.arm_actions(cid, wid, actions);
                    }
                }
            }
        }
    }

    // ---- backend events -----------------------------------------------

    async fn on_backend(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::NewWindow {
                geometry,
                metadata,
                pixel_format,
                alpha,
                override_redirect,
            } => {
                match self
                    .model
                    .add(geometry, metadata, pixel_format, alpha, override_redirect)
                {
                    Ok((wid, _)) => self.announce_window(wid).await,
                    Err(e) => warn!("backend window rejected: {e}"),
                }
            }
            BackendEvent::Damage { wid, rect } => {
                if self.model.get(wid).map(|s| s.mapped).unwrap_or(false) {
                    self.damage_clients(wid, rect).await;
                }
            }
            BackendEvent::Metadata { wid, metadata } => {
                match self.model.update_metadata(wid, metadata) {
                    Ok(Some(event)) => self.fanout_model_event(event, None).await,
                    Ok(None) => {}
                    Err(e) => warn!("metadata update failed: {e}"),
                }
            }
            BackendEvent::Geometry { wid, geometry } => {
                match self.model.update_geometry(wid, geometry) {
                    Ok(Some(event)) => self.fanout_model_event(event, None).await,
                    Ok(None) => {}
                    Err(e) => warn!("geometry update failed: {e}"),
                }
            }
            BackendEvent::RemoveWindow { wid } => match self.model.remove(wid) {
                Ok(event) => self.fanout_model_event(event, None).await,
                Err(e) => warn!("window removal failed: {e}"),
            },
            BackendEvent::ContentType { wid, content_type } => {
                let _ = self.model.set_content_type(wid, content_type);
                for client in self.clients.values_mut() {
                    if let Some(sched) = client.schedulers.get_mut(&wid) {
                        sched.set_content_type(content_type);
                    }
                }
            }
            BackendEvent::Bell { wid, percent } => {
                for client in self.clients.values() {
                    if client.is_active() && client.caps.bell {
                        let _ = client
                            .endpoint
                            .send(PacketPriority::Metadata, outbound::bell(wid, percent))
                            .await;
                    }
                }
            }
            BackendEvent::Cursor { image } => {
                self.display.cursor.image = image.as_ref().map(|(w, h, hx, hy, data)| {
                    crate::model::CursorImage {
                        width: *w,
                        height: *h,
                        hotspot_x: *hx,
                        hotspot_y: *hy,
                        data: data.clone(),
                    }
                });
                for client in self.clients.values() {
                    if client.is_active() && client.caps.cursors {
                        let _ = client
                            .endpoint
                            .send(PacketPriority::Metadata, outbound::cursor(image.clone()))
                            .await;
                    }
                }
            }
            BackendEvent::Notification { nid, app_name, summary, body, expire_ms } => {
                let now = Instant::now();
                for client in self.clients.values_mut() {
                    if client.is_active()
                        && client.caps.notifications
                        && client.notifications.should_forward(nid, now)
                    {
                        let _ = client
                            .endpoint
                            .send(
                                PacketPriority::Metadata,
                                outbound::notify_show(nid, &app_name, &summary, &body, expire_ms),
                            )
                            .await;
                    }
                }
            }
            BackendEvent::ClipboardToken { selection } => {
                let now = Instant::now();
                for client in self.clients.values_mut() {
                    if !client.is_active() || !client.caps.clipboard {
                        continue;
                    }
                    match client.clipboard.backend_token(&selection, now) {
                        Ok(actions) => {
                            for action in actions {
                                if let ClipboardAction::ForwardToken { selection } = action {
                                    let _ = client
                                        .endpoint
                                        .send(
                                            PacketPriority::Bulk,
                                            outbound::clipboard_token(selection, None, None),
                                        )
                                        .await;
                                }
                            }
                        }
                        Err(Error::ErrClipboardDirection) => {}
                        Err(e) => warn!("clipboard token failed: {e}"),
                    }
                }
            }
            BackendEvent::ClipboardData { request_id, selection, data } => {
                if let Some(cid) = self.clipboard_requests.remove(&request_id) {
                    if let Some(client) = self.clients.get(&cid) {
                        let _ = client
                            .endpoint
                            .send(
                                PacketPriority::Bulk,
                                outbound::clipboard_contents(request_id, &selection, data),
                            )
                            .await;
                    }
                }
            }
            BackendEvent::AudioData { codec, data, timestamp_ms, end_of_stream } => {
                for client in self.clients.values_mut() {
                    if !client.is_active() || !client.caps.audio {
                        continue;
                    }
                    if let Some(chunk) =
                        client
                            .speaker
                            .chunk(&codec, data.clone(), timestamp_ms, end_of_stream)
                    {
                        let _ = client
                            .endpoint
                            .send(
                                PacketPriority::Draw,
                                outbound::sound_data(
                                    &chunk.codec,
                                    chunk.data,
                                    chunk.timestamp_ms,
                                    false,
                                ),
                            )
                            .await;
                    }
                }
            }
        }
    }

    async fn announce_window(&mut self, wid: Wid) {
        let Some(surface) = self.model.get(wid) else { return };
        let geometry = surface.geometry;
        let metadata = surface.metadata.to_map();
        let override_redirect = surface.override_redirect;
        let pixel_format = surface.pixel_format;
        let alpha = surface.alpha;
        let content_type = surface.content_type;
        let now = Instant::now();

        let cids: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.is_active())
            .map(|c| c.cid)
            .collect();
        for cid in cids {
            let Some(client) = self.clients.get(&cid) else { continue };
            let endpoint = client.endpoint.clone();
            let mut sched =
                self.new_scheduler(wid, geometry, pixel_format, alpha, content_type, client);
            let actions = sched.damage(Rect::new(0, 0, geometry.w, geometry.h), now);
            let _ = endpoint
                .send(
                    PacketPriority::Metadata,
                    outbound::new_window(
                        wid,
                        geometry.x,
                        geometry.y,
                        geometry.w,
                        geometry.h,
                        metadata.clone(),
                        override_redirect,
                    ),
                )
                .await;
            if let Some(client) = self.clients.get_mut(&cid) {
                client.schedulers.insert(wid, sched);
            }
            self.arm_actions(cid, wid, actions);
        }
    }

    async fn damage_clients(&mut self, wid: Wid, rect: Rect) {
        let now = Instant::now();
        let mut arm = vec![];
        for (cid, client) in self.clients.iter_mut() {
            if !client.is_active() || client.suspended {
                continue;
            }
            if let Some(sched) = client.schedulers.get_mut(&wid) {
                arm.push((*cid, sched.damage(rect, now)));
            }
        }
        for (cid, actions) in arm {
            self.arm_actions(cid, wid, actions);
        }
    }

    async fn damage_all_clients(&mut self, wid: Wid) {
        if let Some(surface) = self.model.get(wid) {
            let bounds = Rect::new(0, 0, surface.geometry.w, surface.geometry.h);
            self.damage_clients(wid, bounds).await;
        }
    }

    /// Translates one model event into client packets. `skip` suppresses
    /// the echo to the client that caused the change.
    async fn fanout_model_event(&mut self, event: ModelEvent, skip: Option<ClientId>) {
        match event {
            ModelEvent::Created(_) => unreachable!("announce_window handles creation"),
            ModelEvent::Destroyed(wid) => {
                for client in self.clients.values_mut() {
                    if let Some(mut sched) = client.schedulers.remove(&wid) {
                        sched.remove();
                    }
                    if client.is_active() {
                        let _ = client
                            .endpoint
                            .send(PacketPriority::Metadata, outbound::lost_window(wid))
                            .await;
                    }
                }
            }
            ModelEvent::Metadata(wid, diff) => {
                for client in self.clients.values() {
                    if client.is_active() && Some(client.cid) != skip {
                        let _ = client
                            .endpoint
                            .send(
                                PacketPriority::Metadata,
                                outbound::window_metadata(wid, diff.clone()),
                            )
                            .await;
                    }
                }
            }
            ModelEvent::ConfigureOr(wid, rect) => {
                self.resize_schedulers(wid, rect).await;
                for client in self.clients.values() {
                    if client.is_active() && Some(client.cid) != skip {
                        let _ = client
                            .endpoint
                            .send(
                                PacketPriority::Metadata,
                                outbound::configure_override_redirect(
                                    wid, rect.x, rect.y, rect.w, rect.h,
                                ),
                            )
                            .await;
                    }
                }
            }
            ModelEvent::Remapped(wid) => {
                // Too big a move for a managed surface: drop and re-add.
                let Some(surface) = self.model.get(wid) else { return };
                let geometry = surface.geometry;
                let metadata = surface.metadata.to_map();
                let override_redirect = surface.override_redirect;
                self.resize_schedulers(wid, geometry).await;
                for client in self.clients.values() {
                    if client.is_active() && Some(client.cid) != skip {
                        let _ = client
                            .endpoint
                            .send(PacketPriority::Metadata, outbound::lost_window(wid))
                            .await;
                        let _ = client
                            .endpoint
                            .send(
                                PacketPriority::Metadata,
                                outbound::new_window(
                                    wid,
                                    geometry.x,
                                    geometry.y,
                                    geometry.w,
                                    geometry.h,
                                    metadata.clone(),
                                    override_redirect,
                                ),
                            )
                            .await;
                    }
                }
                self.damage_all_clients(wid).await;
            }
            ModelEvent::Raised(wid) => {
                for client in self.clients.values() {
                    if client.is_active() && Some(client.cid) != skip {
                        let _ = client
                            .endpoint
                            .send(PacketPriority::Metadata, outbound::raise_window(wid))
                            .await;
                    }
                }
            }
            ModelEvent::Restacked(order) => {
                for client in self.clients.values() {
                    if client.is_active() {
                        let _ = client
                            .endpoint
                            .send(PacketPriority::Metadata, outbound::restack_windows(&order))
                            .await;
                    }
                }
            }
            ModelEvent::Focused(_) => {
                // Focus shifts only reprioritize subsequent draws.
            }
        }
    }

    async fn resize_schedulers(&mut self, wid: Wid, geometry: Rect) {
        let bounds = Rect::new(0, 0, geometry.w, geometry.h);
        for client in self.clients.values_mut() {
            if let Some(sched) = client.schedulers.get_mut(&wid) {
                sched.resize(bounds);
            }
        }
    }

    // ---- lifecycle ----------------------------------------------------

    /// Removes a client. `retain` keeps its identity for the reconnect
    /// window; a `reason` is delivered best-effort before the close.
    async fn drop_client(
        &mut self,
        cid: ClientId,
        reason: Option<DisconnectReason>,
        retain: bool,
    ) {
        let Some(mut client) = self.clients.remove(&cid) else { return };
        for sched in client.schedulers.values_mut() {
            sched.remove();
        }
        let packet = reason.map(outbound::disconnect);
        client.endpoint.close(packet).await;
        let was_active = client.is_active();
        let uuid = client.uuid.clone();
        if retain && was_active && !uuid.is_empty() {
            debug!("retaining state for `{uuid}`");
            self.retained.insert(
                uuid.clone(),
                RetainedClient {
                    uuid: uuid.clone(),
                    clipboard: client.clipboard,
                    focus: self.model.focused(),
                    retained_at: Instant::now(),
                },
            );
        }
        if was_active {
            self.broadcast_server_event(cid, &uuid, "client-disconnected").await;
        }
    }

    async fn on_housekeeping(&mut self) {
        let now = Instant::now();
        // Reconnect-window expiry.
        let window = self.config.reconnect_window;
        self.retained
            .retain(|_, r| now.saturating_duration_since(r.retained_at) <= window);

        // Idle clients.
        if let Some(idle_timeout) = self.config.idle_timeout {
            let idle: Vec<ClientId> = self
                .clients
                .values()
                .filter(|c| {
                    c.is_active() && now.saturating_duration_since(c.last_input) > idle_timeout
                })
                .map(|c| c.cid)
                .collect();
            for cid in idle {
                info!("client {cid} idle-timed out");
                self.drop_client(cid, Some(DisconnectReason::IdleTimeout), false)
                    .await;
            }
        }

        // Stalled transfers and clipboard fetches.
        for client in self.clients.values_mut() {
            client.files.expire(now);
            client.clipboard.expire_requests(now);
        }
    }

    async fn on_upgrade(&mut self) -> Result<()> {
        let dir = self
            .config
            .runtime_dir
            .clone()
            .ok_or_else(|| Error::ErrSessionState("no runtime directory configured".into()))?;
        let state =
            upgrade::UpgradeState::capture(&self.config.session_uuid, &self.display, &self.model);
        state.write(&dir)?;
        // Clients are told to go away politely; the successor re-announces
        // every surface when they come back.
        self.on_shutdown(DisconnectReason::ServerShutdown).await;
        Ok(())
    }

    async fn on_shutdown(&mut self, reason: DisconnectReason) {
        info!("session {} shutting down: {}", self.config.session_uuid, reason.as_str());
        let cids: Vec<ClientId> = self.clients.keys().copied().collect();
        for cid in cids {
            self.drop_client(cid, Some(reason), false).await;
        }
        self.running = false;
    }

    // ---- info ----------------------------------------------------------

    fn info_snapshot(&self) -> Value {
        let mut clients = Vec::new();
        for client in self.clients.values() {
            let stats = client.endpoint.stats();
            clients.push(codec::vmap! {
                "uuid" => client.uuid.as_str(),
                "active" => client.is_active(),
                "readonly" => client.readonly,
                "suspended" => client.suspended,
                "latency-ms" => client.latency_ms as i64,
                "bytes-sent" => stats.bytes_sent as i64,
                "bytes-received" => stats.bytes_received as i64,
                "windows" => client.schedulers.len(),
            });
        }
        let mut windows = Vec::new();
        for surface in self.model.iter() {
            windows.push(codec::vmap! {
                "wid" => surface.wid as i64,
                "geometry" => Value::List(vec![
                    Value::Int(surface.geometry.x as i64),
                    Value::Int(surface.geometry.y as i64),
                    Value::Int(surface.geometry.w as i64),
                    Value::Int(surface.geometry.h as i64),
                ]),
                "override-redirect" => surface.override_redirect,
                "mapped" => surface.mapped,
                "content-type" => surface.content_type.as_str(),
            });
        }
        let (w, h) = self.display.size();
        codec::vmap! {
            "session" => self.config.session_uuid.as_str(),
            "version" => handshake::SERVER_VERSION,
            "sharing" => self.config.sharing,
            "display" => Value::List(vec![Value::Int(w as i64), Value::Int(h as i64)]),
            "clients" => Value::List(clients),
            "windows" => Value::List(windows),
            "retained" => self.retained.len(),
        }
    }
}

fn gone() -> Error {
    Error::ErrSessionState("client vanished mid-event".into())
}

/// 1/5/15 minute load averages, scaled by 1000; zeros where the platform
/// does not expose them.
fn load_average() -> (i64, i64, i64) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(raw) = std::fs::read_to_string("/proc/loadavg") {
            let mut parts = raw.split_whitespace().filter_map(|p| p.parse::<f64>().ok());
            if let (Some(a), Some(b), Some(c)) = (parts.next(), parts.next(), parts.next()) {
                return ((a * 1000.0) as i64, (b * 1000.0) as i64, (c * 1000.0) as i64);
            }
        }
    }
    (0, 0, 0)
}

#[cfg(test)]
mod session_test;
