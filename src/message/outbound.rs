//! Server → client packet builders.
//!
//! Builders produce the positional tuples the wire codec expects; nothing
//! here allocates beyond the tuple itself.

use std::collections::BTreeMap;

use bytes::Bytes;
use codec::{MapKey, Value};

use super::{DisconnectReason, PacketType};

fn packet(packet_type: PacketType, mut args: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::with_capacity(args.len() + 1);
    out.push(Value::Str(packet_type.as_str().to_owned()));
    out.append(&mut args);
    out
}

pub fn hello(caps: BTreeMap<MapKey, Value>) -> Vec<Value> {
    packet(PacketType::Hello, vec![Value::Map(caps)])
}

pub fn challenge(
    server_salt: &[u8],
    digests: &[String],
    prompt: &str,
) -> Vec<Value> {
    packet(
        PacketType::Challenge,
        vec![
            Value::Bytes(Bytes::copy_from_slice(server_salt)),
            Value::List(digests.iter().map(|d| Value::Str(d.clone())).collect()),
            Value::Str(prompt.to_owned()),
        ],
    )
}

pub fn disconnect(reason: DisconnectReason) -> Vec<Value> {
    packet(
        PacketType::Disconnect,
        vec![Value::Str(reason.as_str().to_owned())],
    )
}

pub fn ping(echo_ms: i64) -> Vec<Value> {
    packet(PacketType::Ping, vec![Value::Int(echo_ms)])
}

pub fn ping_echo(echo_ms: i64, load: (i64, i64, i64)) -> Vec<Value> {
    packet(
        PacketType::PingEcho,
        vec![
            Value::Int(echo_ms),
            Value::List(vec![
                Value::Int(load.0),
                Value::Int(load.1),
                Value::Int(load.2),
            ]),
        ],
    )
}

pub fn startup_complete() -> Vec<Value> {
    packet(PacketType::StartupComplete, vec![])
}

pub fn server_event(event: &str, detail: &str) -> Vec<Value> {
    packet(
        PacketType::ServerEvent,
        vec![Value::Str(event.to_owned()), Value::Str(detail.to_owned())],
    )
}

#[allow(clippy::too_many_arguments)]
pub fn new_window(
    wid: u32,
    x: i32,
    y: i32,
    w: u32,
    h: u32,
    metadata: BTreeMap<MapKey, Value>,
    override_redirect: bool,
) -> Vec<Value> {
    let packet_type = if override_redirect {
        PacketType::NewOverrideRedirect
    } else {
        PacketType::NewWindow
    };
    packet(
        packet_type,
        vec![
            Value::Int(wid as i64),
            Value::Int(x as i64),
            Value::Int(y as i64),
            Value::Int(w as i64),
            Value::Int(h as i64),
            Value::Map(metadata),
        ],
    )
}

pub fn lost_window(wid: u32) -> Vec<Value> {
    packet(PacketType::LostWindow, vec![Value::Int(wid as i64)])
}

pub fn window_metadata(wid: u32, diff: BTreeMap<MapKey, Value>) -> Vec<Value> {
    packet(
        PacketType::WindowMetadata,
        vec![Value::Int(wid as i64), Value::Map(diff)],
    )
}

pub fn configure_override_redirect(wid: u32, x: i32, y: i32, w: u32, h: u32) -> Vec<Value> {
    packet(
        PacketType::ConfigureOverrideRedirect,
        vec![
            Value::Int(wid as i64),
            Value::Int(x as i64),
            Value::Int(y as i64),
            Value::Int(w as i64),
            Value::Int(h as i64),
        ],
    )
}

pub fn raise_window(wid: u32) -> Vec<Value> {
    packet(PacketType::RaiseWindow, vec![Value::Int(wid as i64)])
}

pub fn restack_windows(order: &[u32]) -> Vec<Value> {
    packet(
        PacketType::RestackWindows,
        vec![Value::List(
            order.iter().map(|w| Value::Int(*w as i64)).collect(),
        )],
    )
}

/// One encoded frame. `client_options` carries encoder-specific hints the
/// client decoder needs (delta reference, scaled size, ...).
#[allow(clippy::too_many_arguments)]
pub fn draw(
    wid: u32,
    x: i32,
    y: i32,
    w: u32,
    h: u32,
    coding: &str,
    data: Bytes,
    sequence: u64,
    rowstride: u32,
    client_options: BTreeMap<MapKey, Value>,
) -> Vec<Value> {
    packet(
        PacketType::Draw,
        vec![
            Value::Int(wid as i64),
            Value::Int(x as i64),
            Value::Int(y as i64),
            Value::Int(w as i64),
            Value::Int(h as i64),
            Value::Str(coding.to_owned()),
            Value::Bytes(data),
            Value::Int(sequence as i64),
            Value::Int(rowstride as i64),
            Value::Map(client_options),
        ],
    )
}

/// Vertical-translation update: `(src_y, dst_y, height)` per copied band.
pub fn scroll(wid: u32, sequence: u64, bands: &[(u32, u32, u32)]) -> Vec<Value> {
    packet(
        PacketType::Scroll,
        vec![
            Value::Int(wid as i64),
            Value::Int(sequence as i64),
            Value::List(
                bands
                    .iter()
                    .map(|(src, dst, h)| {
                        Value::List(vec![
                            Value::Int(*src as i64),
                            Value::Int(*dst as i64),
                            Value::Int(*h as i64),
                        ])
                    })
                    .collect(),
            ),
        ],
    )
}

pub fn eos(wid: u32) -> Vec<Value> {
    packet(PacketType::Eos, vec![Value::Int(wid as i64)])
}

pub fn cursor(image: Option<(u32, u32, u32, u32, Bytes)>) -> Vec<Value> {
    match image {
        Some((w, h, hx, hy, data)) => packet(
            PacketType::Cursor,
            vec![
                Value::Int(w as i64),
                Value::Int(h as i64),
                Value::Int(hx as i64),
                Value::Int(hy as i64),
                Value::Bytes(data),
            ],
        ),
        // An empty cursor packet hides the pointer.
        None => packet(PacketType::Cursor, vec![]),
    }
}

pub fn bell(wid: u32, percent: i32) -> Vec<Value> {
    packet(
        PacketType::Bell,
        vec![Value::Int(wid as i64), Value::Int(percent as i64)],
    )
}

pub fn desktop_size(w: u32, h: u32, max_w: u32, max_h: u32) -> Vec<Value> {
    packet(
        PacketType::DesktopSize,
        vec![
            Value::Int(w as i64),
            Value::Int(h as i64),
            Value::List(vec![Value::Int(max_w as i64), Value::Int(max_h as i64)]),
        ],
    )
}

pub fn notify_show(
    nid: u64,
    app_name: &str,
    summary: &str,
    body: &str,
    expire_ms: i64,
) -> Vec<Value> {
    packet(
        PacketType::Notify,
        vec![
            Value::Int(nid as i64),
            Value::Str(app_name.to_owned()),
            Value::Str(summary.to_owned()),
            Value::Str(body.to_owned()),
            Value::Int(expire_ms),
        ],
    )
}

pub fn notify_close(nid: u64) -> Vec<Value> {
    packet(PacketType::NotifyClose, vec![Value::Int(nid as i64)])
}

pub fn clipboard_token(selection: &str, target: Option<&str>, data: Option<Bytes>) -> Vec<Value> {
    let mut args = vec![Value::Str(selection.to_owned())];
    if let Some(t) = target {
        args.push(Value::Str(t.to_owned()));
        if let Some(d) = data {
            args.push(Value::Bytes(d));
        }
    }
    packet(PacketType::ClipboardToken, args)
}

pub fn clipboard_request(request_id: u64, selection: &str, target: &str) -> Vec<Value> {
    packet(
        PacketType::ClipboardRequest,
        vec![
            Value::Int(request_id as i64),
            Value::Str(selection.to_owned()),
            Value::Str(target.to_owned()),
        ],
    )
}

pub fn clipboard_contents(request_id: u64, selection: &str, data: Bytes) -> Vec<Value> {
    packet(
        PacketType::ClipboardContents,
        vec![
            Value::Int(request_id as i64),
            Value::Str(selection.to_owned()),
            Value::Bytes(data),
        ],
    )
}

pub fn sound_data(codec_name: &str, data: Bytes, timestamp_ms: u64, end: bool) -> Vec<Value> {
    packet(
        PacketType::SoundData,
        vec![
            Value::Str(codec_name.to_owned()),
            Value::Bytes(data),
            Value::Int(timestamp_ms as i64),
            Value::Bool(end),
        ],
    )
}

pub fn file_chunk(chunk_id: u64, data: Bytes, last: bool) -> Vec<Value> {
    packet(
        PacketType::FileChunk,
        vec![
            Value::Int(chunk_id as i64),
            Value::Bytes(data),
            Value::Bool(last),
        ],
    )
}

pub fn ack_file_chunk(chunk_id: u64) -> Vec<Value> {
    packet(PacketType::AckFileChunk, vec![Value::Int(chunk_id as i64)])
}

pub fn info_response(info: BTreeMap<MapKey, Value>) -> Vec<Value> {
    packet(PacketType::InfoResponse, vec![Value::Map(info)])
}
