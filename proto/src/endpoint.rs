//! Connection endpoint.
//!
//! Owns one transport and runs three tasks over it: a reader (framed
//! chunks → reassembled packet tuples → inbound event channel), a writer
//! (priority queues → encode → frame → write) and a keepalive/liveness
//! watchdog. The tasks share state only through the `Shared` block below:
//! atomics, channels and short-lived mutexes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use codec::{PacketEncoder, Value};
use log::{debug, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::Instant;

use crate::chunker::{encode_packet, Reassembler, DEFAULT_INLINE_THRESHOLD};
use crate::compress::{Compressor, MIN_COMPRESS_SIZE};
use crate::crypto::{CipherMode, CryptoContext, GCM_TAG_SIZE, IV_SIZE};
use crate::error::{Error, Result};
use crate::frame::{ChunkHeader, AUX_CHUNK_MAX, CHUNK_HEADER_SIZE};
use crate::transport::{Transport, TransportInfo, TransportReader, TransportWriter};

/// Decompressed chunks are bounded regardless of what the peer declares.
const DECOMPRESS_MAX: usize = AUX_CHUNK_MAX;

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub inline_threshold: usize,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    /// Queued outbound bytes above this raise the backpressure signal.
    pub high_water: usize,
    /// Queued outbound bytes below this clear it again.
    pub low_water: usize,
    pub shutdown_grace: Duration,
    pub inbound_queue: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            ping_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(90),
            high_water: 4 * 1024 * 1024,
            low_water: 512 * 1024,
            shutdown_grace: Duration::from_secs(2),
            inbound_queue: 128,
        }
    }
}

/// Strict outbound priority classes; FIFO within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketPriority {
    Keepalive = 0,
    Control = 1,
    Metadata = 2,
    FocusedDraw = 3,
    Draw = 4,
    Bulk = 5,
}

impl PacketPriority {
    pub const COUNT: usize = 6;
}

#[derive(Debug)]
pub enum EndpointEvent {
    Packet(Vec<Value>),
    /// The endpoint stopped; `None` means a locally requested close.
    Closed(Option<Error>),
}

struct OutboundPacket {
    packet: Vec<Value>,
    /// Pixel data arrives pre-compressed by its encoder; recompressing it
    /// wastes CPU for nothing.
    no_compress: bool,
    /// Installed once this packet is on the wire: the packet itself goes
    /// out in the clear, everything after it is sealed.
    cipher_switch: Option<Box<CryptoContext>>,
    cost: usize,
}

#[derive(Default)]
struct Queues {
    classes: [VecDeque<OutboundPacket>; PacketPriority::COUNT],
}

impl Queues {
    fn push(&mut self, priority: PacketPriority, packet: OutboundPacket) {
        self.classes[priority as usize].push_back(packet);
    }

    fn pop(&mut self, max_priority: Option<PacketPriority>) -> Option<OutboundPacket> {
        let limit = max_priority.map(|p| p as usize).unwrap_or(PacketPriority::COUNT - 1);
        for class in self.classes.iter_mut().take(limit + 1) {
            if let Some(p) = class.pop_front() {
                return Some(p);
            }
        }
        None
    }
}

#[derive(Clone, Copy)]
struct Negotiated {
    encoder: PacketEncoder,
    compressor: Compressor,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

struct Shared {
    config: EndpointConfig,
    info: TransportInfo,
    queues: Mutex<Queues>,
    queued_bytes: AtomicUsize,
    write_notify: Notify,
    close_notify: Notify,
    closed: AtomicBool,
    pre_auth: AtomicBool,
    backpressure_tx: watch::Sender<bool>,
    negotiated: Mutex<Negotiated>,
    cipher_tx: Mutex<Option<CryptoContext>>,
    cipher_rx: Mutex<Option<CryptoContext>>,
    epoch: Instant,
    last_send_ms: AtomicU64,
    last_recv_ms: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    packets_sent: AtomicU64,
    packets_recv: AtomicU64,
}

impl Shared {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn account_dequeue(&self, cost: usize) {
        let before = self.queued_bytes.fetch_sub(cost, Ordering::SeqCst);
        let now = before.saturating_sub(cost);
        if now < self.config.low_water && *self.backpressure_tx.borrow() {
            debug!("[{}] backpressure cleared at {} queued bytes", self.info, now);
            let _ = self.backpressure_tx.send(false);
        }
    }
}

/// Handle to a spawned endpoint. Cloneable; the underlying tasks stop when
/// `close` is called or the transport fails.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
    backpressure_rx: watch::Receiver<bool>,
}

impl Endpoint {
    /// Splits the transport and spawns the reader, writer and watchdog
    /// tasks. Inbound packets and the final close arrive on the returned
    /// event channel.
    pub fn spawn(
        transport: Transport,
        config: EndpointConfig,
    ) -> (Endpoint, mpsc::Receiver<EndpointEvent>) {
        let (reader, writer, info) = transport.split();
        let (event_tx, event_rx) = mpsc::channel(config.inbound_queue);
        let (backpressure_tx, backpressure_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            info,
            queues: Mutex::new(Queues::default()),
            queued_bytes: AtomicUsize::new(0),
            write_notify: Notify::new(),
            close_notify: Notify::new(),
            closed: AtomicBool::new(false),
            pre_auth: AtomicBool::new(true),
            backpressure_tx,
            negotiated: Mutex::new(Negotiated {
                encoder: PacketEncoder::Bencode,
                compressor: Compressor::None,
            }),
            cipher_tx: Mutex::new(None),
            cipher_rx: Mutex::new(None),
            epoch: Instant::now(),
            last_send_ms: AtomicU64::new(0),
            last_recv_ms: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_recv: AtomicU64::new(0),
        });

        tokio::spawn(reader_loop(Arc::clone(&shared), reader, event_tx.clone()));
        tokio::spawn(writer_loop(Arc::clone(&shared), writer));
        tokio::spawn(watchdog_loop(Arc::clone(&shared), event_tx));

        (
            Endpoint {
                shared,
                backpressure_rx,
            },
            event_rx,
        )
    }

    pub fn info(&self) -> &TransportInfo {
        &self.shared.info
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn queued_bytes(&self) -> usize {
        self.shared.queued_bytes.load(Ordering::SeqCst)
    }

    /// Watch signal for the damage scheduler: `true` while the outbound
    /// queue sits above the high-water mark.
    pub fn backpressure(&self) -> watch::Receiver<bool> {
        self.backpressure_rx.clone()
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            bytes_sent: self.shared.bytes_sent.load(Ordering::SeqCst),
            bytes_received: self.shared.bytes_recv.load(Ordering::SeqCst),
            packets_sent: self.shared.packets_sent.load(Ordering::SeqCst),
            packets_received: self.shared.packets_recv.load(Ordering::SeqCst),
        }
    }

    pub async fn send(&self, priority: PacketPriority, packet: Vec<Value>) -> Result<()> {
        self.send_with(priority, packet, false).await
    }

    /// `no_compress` marks payloads that are already entropy-coded.
    pub async fn send_with(
        &self,
        priority: PacketPriority,
        packet: Vec<Value>,
        no_compress: bool,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ErrEndpointClosed);
        }
        let cost = estimate_cost(&packet);
        let shared = &self.shared;
        {
            let mut queues = shared.queues.lock().await;
            queues.push(
                priority,
                OutboundPacket {
                    packet,
                    no_compress,
                    cipher_switch: None,
                    cost,
                },
            );
        }
        let queued = shared.queued_bytes.fetch_add(cost, Ordering::SeqCst) + cost;
        if queued > shared.config.high_water && !*shared.backpressure_tx.borrow() {
            debug!("[{}] backpressure raised at {} queued bytes", shared.info, queued);
            let _ = shared.backpressure_tx.send(true);
        }
        shared.write_notify.notify_one();
        Ok(())
    }

    /// Switches the packet encoder once capability exchange settles it.
    pub async fn set_encoder(&self, encoder: PacketEncoder) {
        self.shared.negotiated.lock().await.encoder = encoder;
    }

    pub async fn set_compressor(&self, compressor: Compressor) {
        self.shared.negotiated.lock().await.compressor = compressor;
    }

    /// Installs the per-direction cipher contexts; takes effect with the
    /// next chunk in each direction.
    pub async fn enable_cipher(&self, tx: CryptoContext, rx: CryptoContext) {
        *self.shared.cipher_tx.lock().await = Some(tx);
        *self.shared.cipher_rx.lock().await = Some(rx);
    }

    /// Sends `packet` in the clear and turns encryption on for everything
    /// after it. Used for the hello that carries the cipher parameters:
    /// it must leave unencrypted, and no later packet may slip out before
    /// the cipher is armed.
    pub async fn send_then_encrypt(
        &self,
        priority: PacketPriority,
        packet: Vec<Value>,
        tx: CryptoContext,
        rx: CryptoContext,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ErrEndpointClosed);
        }
        // Inbound chunks flagged as encrypted may arrive as soon as the
        // peer has the parameters; arm the receive side right away.
        *self.shared.cipher_rx.lock().await = Some(rx);
        let cost = estimate_cost(&packet);
        {
            let mut queues = self.shared.queues.lock().await;
            queues.push(
                priority,
                OutboundPacket {
                    packet,
                    no_compress: false,
                    cipher_switch: Some(Box::new(tx)),
                    cost,
                },
            );
        }
        self.shared.queued_bytes.fetch_add(cost, Ordering::SeqCst);
        self.shared.write_notify.notify_one();
        Ok(())
    }

    /// Lifts the pre-authentication chunk-size cap.
    pub fn set_authenticated(&self) {
        self.shared.pre_auth.store(false, Ordering::SeqCst);
    }

    /// Monotonic milliseconds on this endpoint's clock; ping echo
    /// timestamps are expressed in it.
    pub fn now_ms(&self) -> u64 {
        self.shared.now_ms()
    }

    /// Milliseconds since the last inbound chunk.
    pub fn idle_ms(&self) -> u64 {
        self.shared
            .now_ms()
            .saturating_sub(self.shared.last_recv_ms.load(Ordering::SeqCst))
    }

    /// Stops the endpoint. `disconnect` is enqueued at control priority
    /// and flushed best-effort within the shutdown grace period.
    pub async fn close(&self, disconnect: Option<Vec<Value>>) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(packet) = disconnect {
            let cost = estimate_cost(&packet);
            let mut queues = self.shared.queues.lock().await;
            queues.push(
                PacketPriority::Control,
                OutboundPacket {
                    packet,
                    no_compress: false,
                    cipher_switch: None,
                    cost,
                },
            );
            self.shared.queued_bytes.fetch_add(cost, Ordering::SeqCst);
        }
        self.shared.write_notify.notify_one();
        self.shared.close_notify.notify_waiters();
    }
}

fn estimate_cost(packet: &[Value]) -> usize {
    fn value_cost(v: &Value) -> usize {
        match v {
            Value::Bytes(b) => b.len() + 8,
            Value::Str(s) => s.len() + 8,
            Value::List(l) => l.iter().map(value_cost).sum::<usize>() + 8,
            Value::Map(m) => m.values().map(value_cost).sum::<usize>() + m.len() * 16 + 8,
            _ => 8,
        }
    }
    packet.iter().map(value_cost).sum::<usize>() + CHUNK_HEADER_SIZE
}

fn sealed_len(mode: CipherMode, plain: usize) -> usize {
    match mode {
        CipherMode::Gcm => plain + GCM_TAG_SIZE,
        CipherMode::Cbc => IV_SIZE + (plain / 16 + 1) * 16,
        CipherMode::Cfb | CipherMode::Ctr => IV_SIZE + plain,
    }
}

async fn write_one_chunk(
    shared: &Shared,
    writer: &mut TransportWriter,
    mut header: ChunkHeader,
    payload: Bytes,
    compressor: Compressor,
    no_compress: bool,
) -> Result<()> {
    let mut body = payload;

    if !no_compress && compressor != Compressor::None && body.len() > MIN_COMPRESS_SIZE {
        let packed = compressor.compress(&body)?;
        // Incompressible payloads go out as-is.
        if packed.len() < body.len() {
            header.compressed = true;
            header.compressor_id = compressor.wire_id();
            body = packed;
        }
    }

    let mut cipher = shared.cipher_tx.lock().await;
    if let Some(ctx) = cipher.as_mut() {
        header.cipher = true;
        header.payload_len = sealed_len(ctx.mode(), body.len()) as u32;
        let head = header.marshal();
        let sealed = ctx.seal(&head, &body)?;
        debug_assert_eq!(sealed.len(), header.payload_len as usize);
        writer.write_all(&head).await?;
        writer.write_all(&sealed).await?;
    } else {
        header.payload_len = body.len() as u32;
        writer.write_all(&header.marshal()).await?;
        writer.write_all(&body).await?;
    }
    drop(cipher);

    shared
        .bytes_sent
        .fetch_add((CHUNK_HEADER_SIZE + header.payload_len as usize) as u64, Ordering::SeqCst);
    Ok(())
}

async fn write_packet(
    shared: &Shared,
    writer: &mut TransportWriter,
    entry: &OutboundPacket,
) -> Result<()> {
    let negotiated = *shared.negotiated.lock().await;
    let encoded = encode_packet(
        negotiated.encoder,
        &entry.packet,
        shared.config.inline_threshold,
    )?;
    let total_aux = encoded.auxiliaries.len();

    let mut header = ChunkHeader::main(encoded.main.len());
    header.more = total_aux > 0;
    header.encoder_id = negotiated.encoder.wire_id();
    write_one_chunk(
        shared,
        writer,
        header,
        encoded.main,
        negotiated.compressor,
        false,
    )
    .await?;

    for (k, aux) in encoded.auxiliaries.into_iter().enumerate() {
        let mut header = ChunkHeader::auxiliary(k as u8 + 1, aux.len());
        header.more = k + 1 < total_aux;
        header.encoder_id = negotiated.encoder.wire_id();
        write_one_chunk(shared, writer, header, aux, negotiated.compressor, entry.no_compress)
            .await?;
    }

    writer.flush().await?;
    shared.packets_sent.fetch_add(1, Ordering::SeqCst);
    shared.last_send_ms.store(shared.now_ms(), Ordering::SeqCst);
    Ok(())
}

async fn writer_loop(shared: Arc<Shared>, mut writer: TransportWriter) {
    loop {
        let entry = {
            let mut queues = shared.queues.lock().await;
            queues.pop(None)
        };
        match entry {
            Some(mut entry) => {
                let result = write_packet(&shared, &mut writer, &entry).await;
                if result.is_ok() {
                    if let Some(tx_ctx) = entry.cipher_switch.take() {
                        *shared.cipher_tx.lock().await = Some(*tx_ctx);
                    }
                }
                shared.account_dequeue(entry.cost);
                if let Err(e) = result {
                    if !shared.closed.swap(true, Ordering::SeqCst) {
                        warn!("[{}] write failed: {e}", shared.info);
                    }
                    shared.close_notify.notify_waiters();
                    return;
                }
            }
            None if shared.closed.load(Ordering::SeqCst) => {
                // Drain stops once the control classes are empty.
                break;
            }
            None => {
                tokio::select! {
                    _ = shared.write_notify.notified() => {}
                    _ = shared.close_notify.notified() => {}
                }
            }
        }
        if shared.closed.load(Ordering::SeqCst) {
            // Closing: flush remaining keepalive/control packets within the
            // grace period, drop everything else.
            let deadline = Instant::now() + shared.config.shutdown_grace;
            loop {
                let entry = {
                    let mut queues = shared.queues.lock().await;
                    queues.pop(Some(PacketPriority::Control))
                };
                let Some(entry) = entry else { break };
                let write = tokio::time::timeout_at(
                    deadline,
                    write_packet(&shared, &mut writer, &entry),
                )
                .await;
                shared.account_dequeue(entry.cost);
                match write {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            let _ = writer.shutdown().await;
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_exact_or_closed(
    shared: &Shared,
    reader: &mut TransportReader,
    buf: &mut [u8],
) -> Result<bool> {
    tokio::select! {
        r = reader.read_exact(buf) => {
            r?;
            Ok(true)
        }
        _ = shared.close_notify.notified() => Ok(false),
    }
}

async fn reader_loop(
    shared: Arc<Shared>,
    mut reader: TransportReader,
    event_tx: mpsc::Sender<EndpointEvent>,
) {
    let mut reassembler = Reassembler::new();
    let result: Result<()> = async {
        let mut head = [0u8; CHUNK_HEADER_SIZE];
        loop {
            if shared.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            if !read_exact_or_closed(&shared, &mut reader, &mut head).await? {
                return Ok(());
            }
            let header = ChunkHeader::unmarshal(&head)?;
            header.check_limits(shared.pre_auth.load(Ordering::SeqCst))?;

            let mut payload = vec![0u8; header.payload_len as usize];
            if !read_exact_or_closed(&shared, &mut reader, &mut payload).await? {
                return Ok(());
            }
            shared.bytes_recv.fetch_add(
                (CHUNK_HEADER_SIZE + payload.len()) as u64,
                Ordering::SeqCst,
            );
            shared.last_recv_ms.store(shared.now_ms(), Ordering::SeqCst);

            let mut body = Bytes::from(payload);
            if header.cipher {
                let mut cipher = shared.cipher_rx.lock().await;
                match cipher.as_mut() {
                    Some(ctx) => body = ctx.open(&head, &body)?,
                    None => return Err(Error::ErrCipherNotEnabled),
                }
            }
            if header.compressed {
                let compressor = Compressor::from_wire_id(header.compressor_id)?;
                body = compressor.decompress(&body, DECOMPRESS_MAX)?;
            }

            trace!(
                "[{}] chunk level={} index={} {} bytes",
                shared.info,
                header.level,
                header.index,
                body.len()
            );
            // The chunk's own flags say which decoder applies, so the
            // hello-time encoder handover needs no read-side coordination.
            let encoder = PacketEncoder::from_wire_id(header.encoder_id)
                .ok_or(Error::ErrUnknownPacketEncoder { id: header.encoder_id })?;
            if let Some(packet) = reassembler.push_chunk(encoder, &header, body)? {
                shared.packets_recv.fetch_add(1, Ordering::SeqCst);
                if event_tx.send(EndpointEvent::Packet(packet)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
    .await;

    match result {
        Ok(()) => {
            let _ = event_tx.send(EndpointEvent::Closed(None)).await;
        }
        Err(e) => {
            let locally_closed = shared.closed.swap(true, Ordering::SeqCst);
            shared.close_notify.notify_waiters();
            let _ = event_tx
                .send(EndpointEvent::Closed(if locally_closed { None } else { Some(e) }))
                .await;
        }
    }
}

async fn watchdog_loop(shared: Arc<Shared>, event_tx: mpsc::Sender<EndpointEvent>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shared.close_notify.notified() => return,
        }
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let now = shared.now_ms();
        let last_recv = shared.last_recv_ms.load(Ordering::SeqCst);
        if now.saturating_sub(last_recv) > shared.config.liveness_timeout.as_millis() as u64 {
            warn!("[{}] liveness timeout", shared.info);
            shared.closed.store(true, Ordering::SeqCst);
            shared.close_notify.notify_waiters();
            let _ = event_tx.send(EndpointEvent::Closed(Some(Error::ErrTimeout))).await;
            return;
        }
        let last_send = shared.last_send_ms.load(Ordering::SeqCst);
        if now.saturating_sub(last_send) >= shared.config.ping_interval.as_millis() as u64 {
            let ping = vec![Value::Str("ping".into()), Value::Int(now as i64)];
            let cost = estimate_cost(&ping);
            {
                let mut queues = shared.queues.lock().await;
                queues.push(
                    PacketPriority::Keepalive,
                    OutboundPacket {
                        packet: ping,
                        no_compress: false,
                        cipher_switch: None,
                        cost,
                    },
                );
            }
            shared.queued_bytes.fetch_add(cost, Ordering::SeqCst);
            shared.write_notify.notify_one();
        }
    }
}
