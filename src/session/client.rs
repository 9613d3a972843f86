//! Per-client connection state.

use std::collections::HashMap;

use proto::Endpoint;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::channels::{AudioChannel, ClipboardChannel, FileChannel, NotificationChannel};
use crate::damage::DamageState;
use crate::message::{ClipboardDirection, HelloCaps};
use crate::model::Wid;

pub type ClientId = u64;

/// Where a connection stands in the handshake.
#[derive(Debug)]
pub enum ClientPhase {
    /// Transport is up, no hello yet.
    PendingHello,
    /// A challenge is outstanding for `authenticators[index]`.
    Challenged {
        index: usize,
        server_salt: Vec<u8>,
        retries: u32,
    },
    /// Fully negotiated and attached.
    Active,
}

pub struct ClientConn {
    pub cid: ClientId,
    pub endpoint: Endpoint,
    pub backpressure: watch::Receiver<bool>,
    pub phase: ClientPhase,

    pub uuid: String,
    pub caps: HelloCaps,
    /// Negotiated encodings, client preference order.
    pub encodings: Vec<String>,

    pub readonly: bool,
    pub share: bool,
    pub suspended: bool,

    pub schedulers: HashMap<Wid, DamageState>,
    pub clipboard: ClipboardChannel,
    pub speaker: AudioChannel,
    pub microphone: AudioChannel,
    pub files: FileChannel,
    pub notifications: NotificationChannel,

    pub connected_at: Instant,
    pub last_input: Instant,
    /// Round-trip measured from ping echoes, milliseconds.
    pub latency_ms: u64,
}

impl ClientConn {
    pub fn new(
        cid: ClientId,
        endpoint: Endpoint,
        max_file_size: u64,
        now: Instant,
    ) -> ClientConn {
        let backpressure = endpoint.backpressure();
        ClientConn {
            cid,
            endpoint,
            backpressure,
            phase: ClientPhase::PendingHello,
            uuid: String::new(),
            caps: HelloCaps::default(),
            encodings: Vec::new(),
            readonly: false,
            share: false,
            suspended: false,
            schedulers: HashMap::new(),
            clipboard: ClipboardChannel::new(ClipboardDirection::Both),
            speaker: AudioChannel::new(),
            microphone: AudioChannel::new(),
            files: FileChannel::new(max_file_size),
            notifications: NotificationChannel::new(),
            connected_at: now,
            last_input: now,
            latency_ms: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, ClientPhase::Active)
    }

    pub fn under_backpressure(&self) -> bool {
        *self.backpressure.borrow()
    }
}

/// What survives a dropped transport, waiting for the same UUID to come
/// back within the reconnect window.
pub struct RetainedClient {
    pub uuid: String,
    pub clipboard: ClipboardChannel,
    pub focus: Option<Wid>,
    pub retained_at: Instant,
}
