//! Typed packet layer.
//!
//! Every wire packet is a tuple whose first element names its type. The
//! closed [`PacketType`] enumeration replaces any string-keyed handler
//! dispatch: an unknown type is a typed decode error, never a lookup miss
//! at dispatch time.

mod hello;
mod inbound;
pub mod outbound;

pub use hello::{ClipboardDirection, HelloCaps};
pub use inbound::ClientPacket;
pub use outbound::*;

use codec::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    // lifecycle
    Hello,
    Challenge,
    Disconnect,
    StartupComplete,
    ServerEvent,
    // keepalive
    Ping,
    PingEcho,
    // display and windows
    NewWindow,
    NewOverrideRedirect,
    LostWindow,
    WindowMetadata,
    ConfigureOverrideRedirect,
    RaiseWindow,
    RestackWindows,
    Draw,
    Scroll,
    Eos,
    Cursor,
    Bell,
    DesktopSize,
    // client → server window ops
    DamageSequence,
    BufferRefresh,
    MapWindow,
    UnmapWindow,
    ConfigureWindow,
    CloseWindow,
    FocusWindow,
    // input
    PointerPosition,
    ButtonAction,
    KeyAction,
    WheelMotion,
    // subchannels
    ClipboardToken,
    ClipboardRequest,
    ClipboardContents,
    SoundData,
    SendFile,
    FileChunk,
    AckFileChunk,
    Notify,
    NotifyClose,
    // control plane
    ConnectionData,
    Control,
    InfoRequest,
    InfoResponse,
    Suspend,
    Resume,
}

impl PacketType {
    pub fn as_str(&self) -> &'static str {
        use PacketType::*;
        match self {
            Hello => "hello",
            Challenge => "challenge",
            Disconnect => "disconnect",
            StartupComplete => "startup-complete",
            ServerEvent => "server-event",
            Ping => "ping",
            PingEcho => "ping_echo",
            NewWindow => "new-window",
            NewOverrideRedirect => "new-override-redirect",
            LostWindow => "lost-window",
            WindowMetadata => "window-metadata",
            ConfigureOverrideRedirect => "configure-override-redirect",
            RaiseWindow => "raise-window",
            RestackWindows => "restack-windows",
            Draw => "draw",
            Scroll => "scroll",
            Eos => "eos",
            Cursor => "cursor",
            Bell => "bell",
            DesktopSize => "desktop_size",
            DamageSequence => "damage-sequence",
            BufferRefresh => "buffer-refresh",
            MapWindow => "map-window",
            UnmapWindow => "unmap-window",
            ConfigureWindow => "configure-window",
            CloseWindow => "close-window",
            FocusWindow => "focus",
            PointerPosition => "pointer-position",
            ButtonAction => "button-action",
            KeyAction => "key-action",
            WheelMotion => "wheel-motion",
            ClipboardToken => "clipboard-token",
            ClipboardRequest => "clipboard-request",
            ClipboardContents => "clipboard-contents",
            SoundData => "sound-data",
            SendFile => "send-file",
            FileChunk => "send-file-chunk",
            AckFileChunk => "ack-file-chunk",
            Notify => "notify_show",
            NotifyClose => "notify_close",
            ConnectionData => "connection-data",
            Control => "command_request",
            InfoRequest => "info-request",
            InfoResponse => "info-response",
            Suspend => "suspend",
            Resume => "resume",
        }
    }

    pub fn from_name(name: &str) -> Result<PacketType> {
        use PacketType::*;
        Ok(match name {
            "hello" => Hello,
            "challenge" => Challenge,
            "disconnect" => Disconnect,
            "startup-complete" => StartupComplete,
            "server-event" => ServerEvent,
            "ping" => Ping,
            "ping_echo" => PingEcho,
            "new-window" => NewWindow,
            "new-override-redirect" => NewOverrideRedirect,
            "lost-window" => LostWindow,
            "window-metadata" => WindowMetadata,
            "configure-override-redirect" => ConfigureOverrideRedirect,
            "raise-window" => RaiseWindow,
            "restack-windows" => RestackWindows,
            "draw" => Draw,
            "scroll" => Scroll,
            "eos" => Eos,
            "cursor" => Cursor,
            "bell" => Bell,
            "desktop_size" => DesktopSize,
            "damage-sequence" => DamageSequence,
            "buffer-refresh" => BufferRefresh,
            "map-window" => MapWindow,
            "unmap-window" => UnmapWindow,
            "configure-window" => ConfigureWindow,
            "close-window" => CloseWindow,
            "focus" => FocusWindow,
            "pointer-position" => PointerPosition,
            "button-action" => ButtonAction,
            "key-action" => KeyAction,
            "wheel-motion" => WheelMotion,
            "clipboard-token" => ClipboardToken,
            "clipboard-request" => ClipboardRequest,
            "clipboard-contents" => ClipboardContents,
            "sound-data" => SoundData,
            "send-file" => SendFile,
            "send-file-chunk" => FileChunk,
            "ack-file-chunk" => AckFileChunk,
            "notify_show" => Notify,
            "notify_close" => NotifyClose,
            "connection-data" => ConnectionData,
            "command_request" => Control,
            "info-request" => InfoRequest,
            "info-response" => InfoResponse,
            "suspend" => Suspend,
            "resume" => Resume,
            other => return Err(Error::ErrUnknownPacketType(other.to_owned())),
        })
    }

    /// The only packet types a peer may send before authenticating.
    pub fn allowed_pre_auth(&self) -> bool {
        matches!(self, PacketType::Hello | PacketType::Disconnect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    AuthenticationFailed,
    VersionMismatch,
    ServerShutdown,
    ClientExit,
    IdleTimeout,
    Policy,
    ProtocolError,
    SessionBusy,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::AuthenticationFailed => "authentication-failed",
            DisconnectReason::VersionMismatch => "version-mismatch",
            DisconnectReason::ServerShutdown => "server-shutdown",
            DisconnectReason::ClientExit => "client-exit",
            DisconnectReason::IdleTimeout => "idle-timeout",
            DisconnectReason::Policy => "policy",
            DisconnectReason::ProtocolError => "protocol-error",
            DisconnectReason::SessionBusy => "session-busy",
        }
    }
}

/// Packet-argument cursor with typed accessors; every miss carries the
/// packet type and the offending position.
pub(crate) struct Args<'a> {
    packet_type: &'a str,
    args: &'a [Value],
}

impl<'a> Args<'a> {
    pub fn new(packet_type: &'a str, args: &'a [Value]) -> Args<'a> {
        Args { packet_type, args }
    }

    fn bad(&self, reason: String) -> Error {
        Error::ErrBadPacket {
            packet_type: self.packet_type.to_owned(),
            reason,
        }
    }

    pub fn get(&self, pos: usize) -> Result<&'a Value> {
        self.args
            .get(pos)
            .ok_or_else(|| self.bad(format!("missing argument {pos}")))
    }

    pub fn opt(&self, pos: usize) -> Option<&'a Value> {
        self.args.get(pos)
    }

    pub fn int(&self, pos: usize) -> Result<i64> {
        self.get(pos)?
            .as_i64()
            .ok_or_else(|| self.bad(format!("argument {pos} is not an integer")))
    }

    pub fn uint(&self, pos: usize) -> Result<u64> {
        self.get(pos)?
            .as_u64()
            .ok_or_else(|| self.bad(format!("argument {pos} is not a non-negative integer")))
    }

    pub fn u32(&self, pos: usize) -> Result<u32> {
        u32::try_from(self.uint(pos)?)
            .map_err(|_| self.bad(format!("argument {pos} exceeds 32 bits")))
    }

    pub fn i32(&self, pos: usize) -> Result<i32> {
        i32::try_from(self.int(pos)?)
            .map_err(|_| self.bad(format!("argument {pos} exceeds 32 bits")))
    }

    pub fn bool(&self, pos: usize) -> Result<bool> {
        self.get(pos)?
            .as_bool()
            .ok_or_else(|| self.bad(format!("argument {pos} is not a boolean")))
    }

    pub fn str(&self, pos: usize) -> Result<&'a str> {
        self.get(pos)?
            .as_str()
            .ok_or_else(|| self.bad(format!("argument {pos} is not a string")))
    }

    pub fn bytes(&self, pos: usize) -> Result<bytes::Bytes> {
        self.get(pos)?
            .as_bytes()
            .ok_or_else(|| self.bad(format!("argument {pos} is not a byte string")))
    }

    pub fn list(&self, pos: usize) -> Result<&'a [Value]> {
        self.get(pos)?
            .as_list()
            .ok_or_else(|| self.bad(format!("argument {pos} is not a list")))
    }

    pub fn map(&self, pos: usize) -> Result<&'a std::collections::BTreeMap<codec::MapKey, Value>> {
        self.get(pos)?
            .as_map()
            .ok_or_else(|| self.bad(format!("argument {pos} is not a map")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_packet_type_round_trip() {
        for name in [
            "hello",
            "draw",
            "damage-sequence",
            "clipboard-token",
            "sound-data",
            "configure-override-redirect",
        ] {
            let t = PacketType::from_name(name).unwrap();
            assert_eq!(t.as_str(), name);
        }
    }

    #[test]
    fn test_unknown_packet_type() {
        assert!(matches!(
            PacketType::from_name("set-deflate"),
            Err(Error::ErrUnknownPacketType(_))
        ));
    }

    #[test]
    fn test_pre_auth_allowlist() {
        assert!(PacketType::Hello.allowed_pre_auth());
        assert!(PacketType::Disconnect.allowed_pre_auth());
        assert!(!PacketType::Draw.allowed_pre_auth());
        assert!(!PacketType::Ping.allowed_pre_auth());
    }
}
