//! Client → server packets, parsed into typed variants.

use bytes::Bytes;
use codec::Value;

use super::{Args, DisconnectReason, HelloCaps, PacketType};
use crate::error::{Error, Result};

#[derive(Debug)]
pub enum ClientPacket {
    Hello(Box<HelloCaps>),
    Ping {
        echo_ms: i64,
    },
    PingEcho {
        echo_ms: i64,
        load: (i64, i64, i64),
    },
    Disconnect {
        reason: String,
    },
    DamageSequence {
        sequence: u64,
        wid: u32,
        width: u32,
        height: u32,
        decode_time_us: i64,
        message: String,
    },
    BufferRefresh {
        wid: u32,
        quality: Option<u8>,
    },
    MapWindow {
        wid: u32,
    },
    UnmapWindow {
        wid: u32,
    },
    ConfigureWindow {
        wid: u32,
        x: i32,
        y: i32,
        w: u32,
        h: u32,
    },
    CloseWindow {
        wid: u32,
    },
    FocusWindow {
        wid: u32,
    },
    DesktopSize {
        width: u32,
        height: u32,
    },
    PointerPosition {
        wid: u32,
        x: i32,
        y: i32,
    },
    ButtonAction {
        wid: u32,
        button: u8,
        pressed: bool,
        x: i32,
        y: i32,
    },
    KeyAction {
        wid: u32,
        keyname: String,
        pressed: bool,
        modifiers: Vec<String>,
    },
    WheelMotion {
        wid: u32,
        button: u8,
        distance: i32,
    },
    ClipboardToken {
        selection: String,
        target: Option<String>,
        data: Option<Bytes>,
    },
    ClipboardRequest {
        request_id: u64,
        selection: String,
        target: String,
    },
    ClipboardContents {
        request_id: u64,
        selection: String,
        data: Bytes,
    },
    SoundData {
        codec: String,
        data: Bytes,
        timestamp_ms: u64,
        end_of_stream: bool,
    },
    SendFile {
        filename: String,
        mimetype: String,
        size: u64,
        digest: Option<String>,
    },
    FileChunk {
        chunk_id: u64,
        data: Bytes,
        last: bool,
    },
    AckFileChunk {
        chunk_id: u64,
    },
    NotifyClose {
        nid: u64,
    },
    ConnectionData {
        bandwidth_limit: Option<u64>,
        latency_ms: Option<u64>,
    },
    Control {
        command: String,
        args: Vec<String>,
    },
    InfoRequest,
    Suspend,
    Resume,
}

impl ClientPacket {
    /// Typed parse of a reassembled packet tuple. Server → client packet
    /// types arriving inbound are rejected the same way unknown types are.
    pub fn parse(packet: &[Value]) -> Result<ClientPacket> {
        let name = packet
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ErrBadPacket {
                packet_type: "?".into(),
                reason: "packet type missing".into(),
            })?;
        let packet_type = PacketType::from_name(name)?;
        let a = Args::new(name, &packet[1..]);

        Ok(match packet_type {
            PacketType::Hello => {
                let caps = HelloCaps::parse(a.map(0)?);
                ClientPacket::Hello(Box::new(caps))
            }
            PacketType::Ping => ClientPacket::Ping { echo_ms: a.int(0)? },
            PacketType::PingEcho => {
                let load = match a.opt(1).and_then(Value::as_list) {
                    Some(l) if l.len() >= 3 => (
                        l[0].as_i64().unwrap_or(0),
                        l[1].as_i64().unwrap_or(0),
                        l[2].as_i64().unwrap_or(0),
                    ),
                    _ => (0, 0, 0),
                };
                ClientPacket::PingEcho {
                    echo_ms: a.int(0)?,
                    load,
                }
            }
            PacketType::Disconnect => ClientPacket::Disconnect {
                reason: a
                    .opt(0)
                    .and_then(Value::as_str)
                    .unwrap_or(DisconnectReason::ClientExit.as_str())
                    .to_owned(),
            },
            PacketType::DamageSequence => ClientPacket::DamageSequence {
                sequence: a.uint(0)?,
                wid: a.u32(1)?,
                width: a.u32(2)?,
                height: a.u32(3)?,
                decode_time_us: a.int(4)?,
                message: a
                    .opt(5)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            },
            PacketType::BufferRefresh => ClientPacket::BufferRefresh {
                wid: a.u32(0)?,
                quality: a.opt(2).and_then(Value::as_i64).map(|q| q.clamp(1, 100) as u8),
            },
            PacketType::MapWindow => ClientPacket::MapWindow { wid: a.u32(0)? },
            PacketType::UnmapWindow => ClientPacket::UnmapWindow { wid: a.u32(0)? },
            PacketType::ConfigureWindow => ClientPacket::ConfigureWindow {
                wid: a.u32(0)?,
                x: a.i32(1)?,
                y: a.i32(2)?,
                w: a.u32(3)?,
                h: a.u32(4)?,
            },
            PacketType::CloseWindow => ClientPacket::CloseWindow { wid: a.u32(0)? },
            PacketType::FocusWindow => ClientPacket::FocusWindow { wid: a.u32(0)? },
            PacketType::DesktopSize => ClientPacket::DesktopSize {
                width: a.u32(0)?,
                height: a.u32(1)?,
            },
            PacketType::PointerPosition => ClientPacket::PointerPosition {
                wid: a.u32(0)?,
                x: a.i32(1)?,
                y: a.i32(2)?,
            },
            PacketType::ButtonAction => ClientPacket::ButtonAction {
                wid: a.u32(0)?,
                button: a.u32(1)? as u8,
                pressed: a.bool(2)?,
                x: a.i32(3)?,
                y: a.i32(4)?,
            },
            PacketType::KeyAction => ClientPacket::KeyAction {
                wid: a.u32(0)?,
                keyname: a.str(1)?.to_owned(),
                pressed: a.bool(2)?,
                modifiers: a
                    .opt(3)
                    .and_then(Value::as_list)
                    .map(|l| {
                        l.iter()
                            .filter_map(|v| v.as_str().map(str::to_owned))
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            PacketType::WheelMotion => ClientPacket::WheelMotion {
                wid: a.u32(0)?,
                button: a.u32(1)? as u8,
                distance: a.i32(2)?,
            },
            PacketType::ClipboardToken => ClientPacket::ClipboardToken {
                selection: a.str(0)?.to_owned(),
                target: a.opt(1).and_then(Value::as_str).map(str::to_owned),
                data: a.opt(2).and_then(Value::as_bytes),
            },
            PacketType::ClipboardRequest => ClientPacket::ClipboardRequest {
                request_id: a.uint(0)?,
                selection: a.str(1)?.to_owned(),
                target: a.str(2)?.to_owned(),
            },
            PacketType::ClipboardContents => ClientPacket::ClipboardContents {
                request_id: a.uint(0)?,
                selection: a.str(1)?.to_owned(),
                data: a.bytes(2)?,
            },
            PacketType::SoundData => ClientPacket::SoundData {
                codec: a.str(0)?.to_owned(),
                data: a.bytes(1)?,
                timestamp_ms: a.uint(2)?,
                end_of_stream: a.opt(3).and_then(Value::as_bool).unwrap_or(false),
            },
            PacketType::SendFile => ClientPacket::SendFile {
                filename: a.str(0)?.to_owned(),
                mimetype: a.str(1)?.to_owned(),
                size: a.uint(2)?,
                digest: a.opt(3).and_then(Value::as_str).map(str::to_owned),
            },
            PacketType::FileChunk => ClientPacket::FileChunk {
                chunk_id: a.uint(0)?,
                data: a.bytes(1)?,
                last: a.opt(2).and_then(Value::as_bool).unwrap_or(false),
            },
            PacketType::AckFileChunk => ClientPacket::AckFileChunk {
                chunk_id: a.uint(0)?,
            },
            PacketType::NotifyClose => ClientPacket::NotifyClose { nid: a.uint(0)? },
            PacketType::ConnectionData => {
                let map = a.map(0)?;
                let get = |key: &str| {
                    map.get(&codec::MapKey::Str(key.to_owned()))
                        .and_then(Value::as_u64)
                };
                ClientPacket::ConnectionData {
                    bandwidth_limit: get("bandwidth-limit"),
                    latency_ms: get("latency"),
                }
            }
            PacketType::Control => ClientPacket::Control {
                command: a.str(0)?.to_owned(),
                args: packet[2..]
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect(),
            },
            PacketType::InfoRequest => ClientPacket::InfoRequest,
            PacketType::Suspend => ClientPacket::Suspend,
            PacketType::Resume => ClientPacket::Resume,
            other => {
                return Err(Error::ErrBadPacket {
                    packet_type: other.as_str().to_owned(),
                    reason: "not a client packet".into(),
                })
            }
        })
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            ClientPacket::Hello(_) => PacketType::Hello,
            ClientPacket::Ping { .. } => PacketType::Ping,
            ClientPacket::PingEcho { .. } => PacketType::PingEcho,
            ClientPacket::Disconnect { .. } => PacketType::Disconnect,
            ClientPacket::DamageSequence { .. } => PacketType::DamageSequence,
            ClientPacket::BufferRefresh { .. } => PacketType::BufferRefresh,
            ClientPacket::MapWindow { .. } => PacketType::MapWindow,
            ClientPacket::UnmapWindow { .. } => PacketType::UnmapWindow,
            ClientPacket::ConfigureWindow { .. } => PacketType::ConfigureWindow,
            ClientPacket::CloseWindow { .. } => PacketType::CloseWindow,
            ClientPacket::FocusWindow { .. } => PacketType::FocusWindow,
            ClientPacket::DesktopSize { .. } => PacketType::DesktopSize,
            ClientPacket::PointerPosition { .. } => PacketType::PointerPosition,
            ClientPacket::ButtonAction { .. } => PacketType::ButtonAction,
            ClientPacket::KeyAction { .. } => PacketType::KeyAction,
            ClientPacket::WheelMotion { .. } => PacketType::WheelMotion,
            ClientPacket::ClipboardToken { .. } => PacketType::ClipboardToken,
            ClientPacket::ClipboardRequest { .. } => PacketType::ClipboardRequest,
            ClientPacket::ClipboardContents { .. } => PacketType::ClipboardContents,
            ClientPacket::SoundData { .. } => PacketType::SoundData,
            ClientPacket::SendFile { .. } => PacketType::SendFile,
            ClientPacket::FileChunk { .. } => PacketType::FileChunk,
            ClientPacket::AckFileChunk { .. } => PacketType::AckFileChunk,
            ClientPacket::NotifyClose { .. } => PacketType::NotifyClose,
            ClientPacket::ConnectionData { .. } => PacketType::ConnectionData,
            ClientPacket::Control { .. } => PacketType::Control,
            ClientPacket::InfoRequest => PacketType::InfoRequest,
            ClientPacket::Suspend => PacketType::Suspend,
            ClientPacket::Resume => PacketType::Resume,
        }
    }

    /// Input-injecting packets are dropped for read-only clients.
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            ClientPacket::PointerPosition { .. }
                | ClientPacket::ButtonAction { .. }
                | ClientPacket::KeyAction { .. }
                | ClientPacket::WheelMotion { .. }
                | ClientPacket::CloseWindow { .. }
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_damage_sequence() {
        let packet = vec![
            Value::Str("damage-sequence".into()),
            Value::Int(7),
            Value::Int(1),
            Value::Int(100),
            Value::Int(80),
            Value::Int(2000),
            Value::Str(String::new()),
        ];
        match ClientPacket::parse(&packet).unwrap() {
            ClientPacket::DamageSequence {
                sequence,
                wid,
                width,
                height,
                decode_time_us,
                message,
            } => {
                assert_eq!((sequence, wid, width, height), (7, 1, 100, 80));
                assert_eq!(decode_time_us, 2000);
                assert!(message.is_empty());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_type() {
        let packet = vec![Value::Str("frobnicate".into())];
        assert!(matches!(
            ClientPacket::parse(&packet),
            Err(Error::ErrUnknownPacketType(_))
        ));
    }

    #[test]
    fn test_server_packet_type_rejected_inbound() {
        let packet = vec![Value::Str("new-window".into()), Value::Int(1)];
        assert!(matches!(
            ClientPacket::parse(&packet),
            Err(Error::ErrBadPacket { .. })
        ));
    }

    #[test]
    fn test_missing_argument() {
        let packet = vec![Value::Str("focus".into())];
        assert!(ClientPacket::parse(&packet).is_err());
    }

    #[test]
    fn test_negative_decode_time_reports_error() {
        // A decode failure is signalled by a negative decode time plus a
        // message; the parse must pass it through.
        let packet = vec![
            Value::Str("damage-sequence".into()),
            Value::Int(3),
            Value::Int(2),
            Value::Int(64),
            Value::Int(64),
            Value::Int(-1),
            Value::Str("corrupt jpeg".into()),
        ];
        match ClientPacket::parse(&packet).unwrap() {
            ClientPacket::DamageSequence {
                decode_time_us,
                message,
                ..
            } => {
                assert!(decode_time_us < 0);
                assert_eq!(message, "corrupt jpeg");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
