//! Capability exchange: version gate and intersection rules.

use std::collections::BTreeMap;

use codec::{vmap, MapKey, PacketEncoder, Value};
use proto::Compressor;

use crate::error::{Error, Result};
use crate::message::HelloCaps;

pub const SERVER_VERSION: &str = "6.0";

fn split_version(v: &str) -> Option<(u32, u32)> {
    let mut parts = v.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}

/// Major must match; newer-minor clients are tolerated, older-minor
/// clients are refused.
pub fn check_version(client: &str) -> Result<()> {
    let mismatch = || Error::ErrVersionMismatch {
        client: client.to_owned(),
        server: SERVER_VERSION.to_owned(),
    };
    let (client_major, client_minor) = split_version(client).ok_or_else(mismatch)?;
    let (server_major, server_minor) =
        split_version(SERVER_VERSION).expect("well-formed server version");
    if client_major != server_major || client_minor < server_minor {
        return Err(mismatch());
    }
    Ok(())
}

/// Negotiated per-connection parameters.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Client preference order, intersected with what the server encodes.
    pub encodings: Vec<String>,
    pub compressor: Compressor,
    pub packet_encoder: PacketEncoder,
}

pub fn negotiate(caps: &HelloCaps, server_encodings: &[String]) -> Result<Negotiated> {
    let encodings: Vec<String> = caps
        .encodings
        .iter()
        .filter(|e| server_encodings.contains(e))
        .cloned()
        .collect();
    if encodings.is_empty() {
        return Err(Error::ErrNoCommonCapability("encoding"));
    }

    let compressor = caps
        .compressors
        .iter()
        .find_map(|name| Compressor::from_name(name).ok())
        .ok_or(Error::ErrNoCommonCapability("compressor"))?;

    let packet_encoder = caps
        .packet_encoders
        .iter()
        .find_map(|name| PacketEncoder::from_name(name))
        .ok_or(Error::ErrNoCommonCapability("packet encoder"))?;

    Ok(Negotiated {
        encodings,
        compressor,
        packet_encoder,
    })
}

/// The server's half of the hello.
pub fn server_hello_caps(
    session_uuid: &str,
    negotiated: &Negotiated,
    display_size: (u32, u32),
    max_display_size: (u32, u32),
    window_count: usize,
    cipher: Option<(&str, &[u8], u32)>,
) -> BTreeMap<MapKey, Value> {
    let mut caps = vmap! {
        "version" => SERVER_VERSION,
        "session_uuid" => session_uuid,
        "encodings" => Value::List(
            negotiated.encodings.iter().map(|e| Value::Str(e.clone())).collect(),
        ),
        "compressor" => negotiated.compressor.as_str(),
        "packet-encoder" => negotiated.packet_encoder.as_str(),
        "desktop-size" => Value::List(vec![
            Value::Int(display_size.0 as i64),
            Value::Int(display_size.1 as i64),
        ]),
        "desktop-size-max" => Value::List(vec![
            Value::Int(max_display_size.0 as i64),
            Value::Int(max_display_size.1 as i64),
        ]),
        "windows" => window_count as i64,
    };
    let map = match &mut caps {
        Value::Map(m) => m,
        _ => unreachable!(),
    };
    if let Some((mode, salt, iterations)) = cipher {
        map.insert(MapKey::from("cipher"), Value::Str(mode.to_owned()));
        map.insert(
            MapKey::from("cipher.salt"),
            Value::Bytes(bytes::Bytes::copy_from_slice(salt)),
        );
        map.insert(
            MapKey::from("cipher.key_rounds"),
            Value::Int(iterations as i64),
        );
    }
    match caps {
        Value::Map(m) => m,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn caps(encodings: &[&str], compressors: &[&str], encoders: &[&str]) -> HelloCaps {
        HelloCaps {
            encodings: encodings.iter().map(|s| s.to_string()).collect(),
            compressors: compressors.iter().map(|s| s.to_string()).collect(),
            packet_encoders: encoders.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_version_gate() {
        assert!(check_version("6.0").is_ok());
        assert!(check_version("6.1").is_ok(), "newer minor is tolerated");
        assert!(check_version("5.9").is_err(), "older major is refused");
        assert!(check_version("7.0").is_err(), "newer major is refused");
        assert!(check_version("junk").is_err());
    }

    #[test]
    fn test_encoding_intersection_keeps_client_order() {
        let server = vec!["rgb".to_string(), "png".to_string(), "jpeg".to_string()];
        let n = negotiate(
            &caps(&["webp", "jpeg", "rgb"], &["lz4"], &["rencode"]),
            &server,
        )
        .unwrap();
        assert_eq!(n.encodings, ["jpeg", "rgb"]);
        assert_eq!(n.compressor, Compressor::Lz4);
        assert_eq!(n.packet_encoder, PacketEncoder::Rencode);
    }

    #[test]
    fn test_first_supported_compressor_wins() {
        let server = vec!["rgb".to_string()];
        let n = negotiate(
            &caps(&["rgb"], &["zstd", "brotli", "lz4"], &["rencode"]),
            &server,
        )
        .unwrap();
        assert_eq!(n.compressor, Compressor::Brotli);
    }

    #[test]
    fn test_no_common_capability() {
        let server = vec!["rgb".to_string()];
        assert!(matches!(
            negotiate(&caps(&["h264"], &["lz4"], &["rencode"]), &server),
            Err(Error::ErrNoCommonCapability("encoding"))
        ));
        assert!(matches!(
            negotiate(&caps(&["rgb"], &["zstd"], &["rencode"]), &server),
            Err(Error::ErrNoCommonCapability("compressor"))
        ));
        assert!(matches!(
            negotiate(&caps(&["rgb"], &["lz4"], &["msgpack"]), &server),
            Err(Error::ErrNoCommonCapability("packet encoder"))
        ));
    }

    #[test]
    fn test_server_hello_cipher_params() {
        let n = negotiate(
            &caps(&["rgb"], &["lz4"], &["rencode"]),
            &["rgb".to_string()],
        )
        .unwrap();
        let caps = server_hello_caps("S-1", &n, (1024, 768), (8192, 8192), 2, Some(("AES-GCM", b"salt", 4096)));
        assert_eq!(caps[&MapKey::from("cipher")], Value::Str("AES-GCM".into()));
        assert_eq!(caps[&MapKey::from("windows")], Value::Int(2));
        let no_cipher = server_hello_caps("S-1", &n, (1024, 768), (8192, 8192), 0, None);
        assert!(!no_cipher.contains_key(&MapKey::from("cipher")));
    }
}
