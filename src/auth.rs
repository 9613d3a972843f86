//! Challenge/response authentication.
//!
//! Each configured module issues its own challenge; a client must satisfy
//! all of them in order. The response is `HMAC(digest, password_material,
//! server_salt XOR client_salt)` under the strongest digest both sides
//! support.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

pub const SALT_LEN: usize = 32;
/// Challenge retries before `authentication-failed`.
pub const DEFAULT_AUTH_RETRIES: u32 = 3;

/// Server digest preference, strongest first.
pub const DIGESTS: [&str; 2] = ["hmac+sha256", "hmac+sha1"];

pub fn new_salt() -> Vec<u8> {
    use rand::RngCore;
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Strongest digest present in both preference lists.
pub fn strongest_digest(client_digests: &[String]) -> Result<&'static str> {
    DIGESTS
        .iter()
        .find(|d| client_digests.iter().any(|c| c == *d))
        .copied()
        .ok_or(Error::ErrNoCommonCapability("digest"))
}

pub fn xor_salts(server_salt: &[u8], client_salt: &[u8]) -> Result<Vec<u8>> {
    if server_salt.len() != client_salt.len() {
        return Err(Error::ErrAuthenticationFailed);
    }
    Ok(server_salt
        .iter()
        .zip(client_salt.iter())
        .map(|(a, b)| a ^ b)
        .collect())
}

pub fn hmac_response(digest: &str, password: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    match digest {
        "hmac+sha256" => {
            let mut mac = Hmac::<Sha256>::new_from_slice(password)
                .map_err(|_| Error::ErrAuthenticationFailed)?;
            mac.update(salt);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        "hmac+sha1" => {
            let mut mac = Hmac::<Sha1>::new_from_slice(password)
                .map_err(|_| Error::ErrAuthenticationFailed)?;
            mac.update(salt);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        other => Err(Error::ErrUnknownDigest(other.to_owned())),
    }
}

/// One authentication module in the chain.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &str;

    /// Modules that vouch for everyone skip the challenge round-trip.
    fn requires_challenge(&self) -> bool {
        true
    }

    fn prompt(&self) -> &str {
        "password"
    }

    async fn verify(
        &self,
        digest: &str,
        response: &[u8],
        server_salt: &[u8],
        client_salt: &[u8],
    ) -> Result<bool>;
}

/// Accepts anyone; used when no authentication is configured explicitly.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    fn name(&self) -> &str {
        "allow-all"
    }

    fn requires_challenge(&self) -> bool {
        false
    }

    async fn verify(&self, _: &str, _: &[u8], _: &[u8], _: &[u8]) -> Result<bool> {
        Ok(true)
    }
}

/// Shared-secret module.
pub struct PasswordAuth {
    password: Vec<u8>,
}

impl PasswordAuth {
    pub fn new(password: impl Into<Vec<u8>>) -> PasswordAuth {
        PasswordAuth {
            password: password.into(),
        }
    }
}

#[async_trait]
impl Authenticator for PasswordAuth {
    fn name(&self) -> &str {
        "password"
    }

    async fn verify(
        &self,
        digest: &str,
        response: &[u8],
        server_salt: &[u8],
        client_salt: &[u8],
    ) -> Result<bool> {
        let salt = xor_salts(server_salt, client_salt)?;
        let expected = hmac_response(digest, &self.password, &salt)?;
        Ok(expected.ct_eq(response).into())
    }
}
