//! Per-chunk encryption.
//!
//! Each chunk payload is sealed independently with AES under a session key
//! derived from the configured shared secret and the salt exchanged during
//! the hello. GCM authenticates the chunk with the frame header as
//! associated data; the streaming modes (CBC/CFB/CTR) prepend a fresh
//! random IV to every chunk.
//!
//! Each direction of a connection gets its own key and nonce salt so the
//! GCM counter sequences can never collide.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{AsyncStreamCipher, BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes::Aes256;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::frame::CHUNK_HEADER_SIZE;

type CbcEnc = cbc::Encryptor<Aes256>;
type CbcDec = cbc::Decryptor<Aes256>;
type CfbEnc = cfb_mode::Encryptor<Aes256>;
type CfbDec = cfb_mode::Decryptor<Aes256>;
type Ctr = ctr::Ctr128BE<Aes256>;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const IV_SIZE: usize = 16;
pub const GCM_TAG_SIZE: usize = 16;

/// PBKDF2-HMAC-SHA256 round count.
pub const DEFAULT_KDF_ITERATIONS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Cbc,
    Gcm,
    Cfb,
    Ctr,
}

impl CipherMode {
    pub const ALL: [CipherMode; 4] = [
        CipherMode::Cbc,
        CipherMode::Gcm,
        CipherMode::Cfb,
        CipherMode::Ctr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CipherMode::Cbc => "AES-CBC",
            CipherMode::Gcm => "AES-GCM",
            CipherMode::Cfb => "AES-CFB",
            CipherMode::Ctr => "AES-CTR",
        }
    }

    pub fn from_name(name: &str) -> Result<CipherMode> {
        match name {
            "AES-CBC" => Ok(CipherMode::Cbc),
            "AES-GCM" => Ok(CipherMode::Gcm),
            "AES-CFB" => Ok(CipherMode::Cfb),
            "AES-CTR" => Ok(CipherMode::Ctr),
            other => Err(Error::ErrUnknownCipherMode(other.to_owned())),
        }
    }

    /// True when the mode authenticates as well as encrypts.
    pub fn authenticated(&self) -> bool {
        matches!(self, CipherMode::Gcm)
    }
}

/// Key material for one direction of a connection.
#[derive(Clone)]
pub struct DirectionKey {
    pub key: [u8; KEY_SIZE],
    pub nonce_salt: [u8; NONCE_SIZE],
}

/// Both directions, derived in one PBKDF2 pass.
pub struct SessionKeys {
    pub to_client: DirectionKey,
    pub to_server: DirectionKey,
}

/// Derives the per-direction session keys from the shared secret and the
/// salt exchanged in the first cipher chunk.
pub fn derive_session_keys(secret: &[u8], salt: &[u8], iterations: u32) -> SessionKeys {
    let mut okm = [0u8; 2 * (KEY_SIZE + NONCE_SIZE)];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut okm);

    let mut to_client = DirectionKey {
        key: [0u8; KEY_SIZE],
        nonce_salt: [0u8; NONCE_SIZE],
    };
    let mut to_server = to_client.clone();
    to_client.key.copy_from_slice(&okm[..KEY_SIZE]);
    to_client
        .nonce_salt
        .copy_from_slice(&okm[KEY_SIZE..KEY_SIZE + NONCE_SIZE]);
    let off = KEY_SIZE + NONCE_SIZE;
    to_server.key.copy_from_slice(&okm[off..off + KEY_SIZE]);
    to_server
        .nonce_salt
        .copy_from_slice(&okm[off + KEY_SIZE..]);
    SessionKeys {
        to_client,
        to_server,
    }
}

/// Seals or opens chunks for one direction. The GCM chunk counter advances
/// on every call, mirroring the peer's counter for the opposite context;
/// the framed stream is reliable and ordered so the two stay in lockstep.
pub struct CryptoContext {
    mode: CipherMode,
    key: [u8; KEY_SIZE],
    nonce_salt: [u8; NONCE_SIZE],
    gcm: Option<Aes256Gcm>,
    seq: u64,
}

impl CryptoContext {
    pub fn new(mode: CipherMode, keys: DirectionKey) -> CryptoContext {
        let gcm = match mode {
            CipherMode::Gcm => Some(Aes256Gcm::new((&keys.key).into())),
            _ => None,
        };
        CryptoContext {
            mode,
            key: keys.key,
            nonce_salt: keys.nonce_salt,
            gcm,
            seq: 0,
        }
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    fn next_nonce(&mut self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[4..].copy_from_slice(&self.seq.to_be_bytes());
        self.seq = self.seq.wrapping_add(1);
        for (n, s) in nonce.iter_mut().zip(self.nonce_salt.iter()) {
            *n ^= s;
        }
        nonce
    }

    pub fn seal(&mut self, header: &[u8; CHUNK_HEADER_SIZE], payload: &[u8]) -> Result<Bytes> {
        match self.mode {
            CipherMode::Gcm => {
                let nonce = self.next_nonce();
                let gcm = self.gcm.as_ref().expect("gcm context");
                let sealed = gcm
                    .encrypt(
                        Nonce::from_slice(&nonce),
                        Payload {
                            msg: payload,
                            aad: header,
                        },
                    )
                    .map_err(|_| Error::ErrCipherAuthFailed)?;
                Ok(Bytes::from(sealed))
            }
            CipherMode::Cbc => {
                let iv = random_iv();
                let sealed = CbcEnc::new((&self.key).into(), (&iv).into())
                    .encrypt_padded_vec_mut::<Pkcs7>(payload);
                Ok(join_iv(&iv, &sealed))
            }
            CipherMode::Cfb => {
                let iv = random_iv();
                let mut buf = payload.to_vec();
                CfbEnc::new((&self.key).into(), (&iv).into()).encrypt(&mut buf);
                Ok(join_iv(&iv, &buf))
            }
            CipherMode::Ctr => {
                let iv = random_iv();
                let mut buf = payload.to_vec();
                Ctr::new((&self.key).into(), (&iv).into()).apply_keystream(&mut buf);
                Ok(join_iv(&iv, &buf))
            }
        }
    }

    pub fn open(&mut self, header: &[u8; CHUNK_HEADER_SIZE], payload: &[u8]) -> Result<Bytes> {
        match self.mode {
            CipherMode::Gcm => {
                if payload.len() < GCM_TAG_SIZE {
                    return Err(Error::ErrCipherPayloadTooSmall);
                }
                let nonce = self.next_nonce();
                let gcm = self.gcm.as_ref().expect("gcm context");
                let opened = gcm
                    .decrypt(
                        Nonce::from_slice(&nonce),
                        Payload {
                            msg: payload,
                            aad: header,
                        },
                    )
                    .map_err(|_| Error::ErrCipherAuthFailed)?;
                Ok(Bytes::from(opened))
            }
            CipherMode::Cbc => {
                let (iv, body) = split_iv(payload)?;
                if body.len() % 16 != 0 {
                    return Err(Error::ErrCipherPayloadTooSmall);
                }
                let opened = CbcDec::new((&self.key).into(), iv.into())
                    .decrypt_padded_vec_mut::<Pkcs7>(body)
                    .map_err(|_| Error::ErrCipherAuthFailed)?;
                Ok(Bytes::from(opened))
            }
            CipherMode::Cfb => {
                let (iv, body) = split_iv(payload)?;
                let mut buf = body.to_vec();
                CfbDec::new((&self.key).into(), iv.into()).decrypt(&mut buf);
                Ok(Bytes::from(buf))
            }
            CipherMode::Ctr => {
                let (iv, body) = split_iv(payload)?;
                let mut buf = body.to_vec();
                Ctr::new((&self.key).into(), iv.into()).apply_keystream(&mut buf);
                Ok(Bytes::from(buf))
            }
        }
    }
}

fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

fn join_iv(iv: &[u8; IV_SIZE], body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(IV_SIZE + body.len());
    out.put_slice(iv);
    out.put_slice(body);
    out.freeze()
}

fn split_iv(payload: &[u8]) -> Result<(&[u8; IV_SIZE], &[u8])> {
    if payload.len() < IV_SIZE {
        return Err(Error::ErrCipherPayloadTooSmall);
    }
    let (iv, body) = payload.split_at(IV_SIZE);
    Ok((iv.try_into().expect("iv slice length"), body))
}
