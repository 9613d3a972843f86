//! The `hello` capability set.

use std::collections::BTreeMap;

use bytes::Bytes;
use codec::{MapKey, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClipboardDirection {
    ToServer,
    ToClient,
    #[default]
    Both,
    Disabled,
}

impl ClipboardDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClipboardDirection::ToServer => "to-server",
            ClipboardDirection::ToClient => "to-client",
            ClipboardDirection::Both => "both",
            ClipboardDirection::Disabled => "disabled",
        }
    }

    pub fn from_name(name: &str) -> ClipboardDirection {
        match name {
            "to-server" => ClipboardDirection::ToServer,
            "to-client" => ClipboardDirection::ToClient,
            "disabled" => ClipboardDirection::Disabled,
            _ => ClipboardDirection::Both,
        }
    }
}

/// Parsed client capabilities. Absent keys take the defaults below; the
/// raw map is retained for pass-through of options the core does not
/// interpret itself.
#[derive(Debug, Clone)]
pub struct HelloCaps {
    pub version: String,
    pub uuid: String,
    pub encodings: Vec<String>,
    pub compressors: Vec<String>,
    pub packet_encoders: Vec<String>,
    pub ciphers: Vec<String>,
    pub digests: Vec<String>,
    pub challenge_response: Option<Bytes>,
    pub challenge_client_salt: Option<Bytes>,

    pub share: bool,
    pub steal: bool,
    pub readonly: bool,

    pub encoding: Option<String>,
    pub quality: Option<u8>,
    pub min_quality: Option<u8>,
    pub speed: Option<u8>,
    pub min_speed: Option<u8>,
    pub auto_refresh_delay_ms: Option<u64>,
    pub bandwidth_limit: Option<u64>,

    pub keyboard_sync: bool,
    pub clipboard: bool,
    pub clipboard_direction: ClipboardDirection,
    pub cursors: bool,
    pub bell: bool,
    pub notifications: bool,
    pub file_transfer: bool,
    pub audio: bool,
    pub desktop_size: Option<(u32, u32)>,
    pub dpi: Option<u32>,

    pub raw: BTreeMap<MapKey, Value>,
}

impl Default for HelloCaps {
    fn default() -> Self {
        HelloCaps {
            version: String::new(),
            uuid: String::new(),
            encodings: Vec::new(),
            compressors: Vec::new(),
            packet_encoders: Vec::new(),
            ciphers: Vec::new(),
            digests: Vec::new(),
            challenge_response: None,
            challenge_client_salt: None,
            share: false,
            steal: false,
            readonly: false,
            encoding: None,
            quality: None,
            min_quality: None,
            speed: None,
            min_speed: None,
            auto_refresh_delay_ms: None,
            bandwidth_limit: None,
            keyboard_sync: true,
            clipboard: false,
            clipboard_direction: ClipboardDirection::Both,
            cursors: true,
            bell: true,
            notifications: true,
            file_transfer: false,
            audio: false,
            desktop_size: None,
            dpi: None,
            raw: BTreeMap::new(),
        }
    }
}

fn get<'a>(map: &'a BTreeMap<MapKey, Value>, key: &str) -> Option<&'a Value> {
    map.get(&MapKey::Str(key.to_owned()))
}

fn get_bool(map: &BTreeMap<MapKey, Value>, key: &str, default: bool) -> bool {
    get(map, key).and_then(Value::as_bool).unwrap_or(default)
}

fn get_str_list(map: &BTreeMap<MapKey, Value>, key: &str) -> Vec<String> {
    get(map, key)
        .and_then(Value::as_list)
        .map(|l| {
            l.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

fn get_clamped(map: &BTreeMap<MapKey, Value>, key: &str) -> Option<u8> {
    get(map, key)
        .and_then(Value::as_i64)
        .map(|v| v.clamp(1, 100) as u8)
}

impl HelloCaps {
    pub fn parse(map: &BTreeMap<MapKey, Value>) -> HelloCaps {
        let mut caps = HelloCaps {
            version: get(map, "version")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            uuid: get(map, "uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            encodings: get_str_list(map, "encodings"),
            compressors: get_str_list(map, "compressors"),
            packet_encoders: get_str_list(map, "packet-encoders"),
            ciphers: get_str_list(map, "ciphers"),
            digests: get_str_list(map, "digests"),
            challenge_response: get(map, "challenge_response").and_then(Value::as_bytes),
            challenge_client_salt: get(map, "challenge_client_salt").and_then(Value::as_bytes),
            share: get_bool(map, "share", false),
            steal: get_bool(map, "steal", false),
            readonly: get_bool(map, "readonly", false),
            encoding: get(map, "encoding").and_then(Value::as_str).map(str::to_owned),
            quality: get_clamped(map, "quality"),
            min_quality: get_clamped(map, "min-quality"),
            speed: get_clamped(map, "speed"),
            min_speed: get_clamped(map, "min-speed"),
            auto_refresh_delay_ms: get(map, "auto-refresh-delay").and_then(Value::as_u64),
            bandwidth_limit: get(map, "bandwidth-limit").and_then(Value::as_u64),
            keyboard_sync: get_bool(map, "keyboard-sync", true),
            clipboard: get_bool(map, "clipboard", false),
            clipboard_direction: ClipboardDirection::from_name(
                get(map, "clipboard-direction")
                    .and_then(Value::as_str)
                    .unwrap_or("both"),
            ),
            cursors: get_bool(map, "cursors", true),
            bell: get_bool(map, "bell", true),
            notifications: get_bool(map, "notifications", true),
            file_transfer: get_bool(map, "file-transfer", false),
            audio: get_bool(map, "sound", false),
            desktop_size: None,
            dpi: get(map, "dpi").and_then(Value::as_u64).map(|v| v as u32),
            raw: map.clone(),
        };
        if let Some(l) = get(map, "desktop-size").and_then(Value::as_list) {
            if let (Some(w), Some(h)) = (
                l.first().and_then(Value::as_u64),
                l.get(1).and_then(Value::as_u64),
            ) {
                caps.desktop_size = Some((w as u32, h as u32));
            }
        }
        caps
    }
}
