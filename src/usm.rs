//! SNMPv3 user-based security (authentication only)
//!
//! Keys follow the USM password-to-key algorithm: the passphrase is repeated
//! over 1 MiB and hashed with SHA-1, then localized to the authoritative
//! engine of each message. Messages are authenticated with HMAC-SHA-96.
//! Privacy (encrypted scoped PDUs) is not supported.

use crate::error::DecodeError;
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use std::fmt;

type HmacSha1 = Hmac<Sha1>;

/// Length of the truncated HMAC carried in msgAuthenticationParameters
pub const AUTH_DIGEST_LEN: usize = 12;

const PASSWORD_EXPANSION: usize = 1_048_576;

/// Security level accepted from the configured user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    NoAuthNoPriv,
    AuthNoPriv,
}

impl AuthLevel {
    /// Anything other than `NoAuthNoPriv` means `AuthNoPriv`.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "NoAuthNoPriv" => AuthLevel::NoAuthNoPriv,
            _ => AuthLevel::AuthNoPriv,
        }
    }
}

/// Expand a passphrase into the non-localized SHA-1 key (Ku).
pub fn password_to_key(password: &[u8]) -> Option<[u8; 20]> {
    if password.is_empty() {
        return None;
    }

    let mut hasher = Sha1::new();
    let mut block = [0u8; 64];
    let mut index = 0usize;
    for _ in 0..PASSWORD_EXPANSION / block.len() {
        for byte in block.iter_mut() {
            *byte = password[index % password.len()];
            index += 1;
        }
        hasher.update(block);
    }
    Some(to_key(&hasher.finalize()))
}

/// Localize a key to one authoritative engine: SHA-1(Ku || engineID || Ku).
pub fn localize_key(key: &[u8; 20], engine_id: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(engine_id);
    hasher.update(key);
    to_key(&hasher.finalize())
}

fn to_key(digest: &[u8]) -> [u8; 20] {
    let mut key = [0u8; 20];
    key.copy_from_slice(&digest[..20]);
    key
}

/// The single USM user traps are accepted from.
#[derive(Clone)]
pub struct UsmUser {
    name: String,
    level: AuthLevel,
    key: Option<[u8; 20]>,
}

impl fmt::Debug for UsmUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsmUser")
            .field("name", &self.name)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

impl UsmUser {
    pub fn new(name: &str, password: &str, level: AuthLevel) -> Self {
        Self {
            name: name.to_string(),
            level,
            key: password_to_key(password.as_bytes()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> AuthLevel {
        self.level
    }

    pub fn requires_auth(&self) -> bool {
        self.level == AuthLevel::AuthNoPriv
    }

    fn mac(&self, engine_id: &[u8]) -> Result<HmacSha1, DecodeError> {
        let key = self.key.as_ref().ok_or(DecodeError::AuthenticationFailed)?;
        let local = localize_key(key, engine_id);
        <HmacSha1 as Mac>::new_from_slice(&local).map_err(|_| DecodeError::AuthenticationFailed)
    }

    /// Digest of a whole message whose authentication parameters are zeroed.
    pub fn digest(&self, message: &[u8], engine_id: &[u8]) -> Result<[u8; AUTH_DIGEST_LEN], DecodeError> {
        let mut mac = self.mac(engine_id)?;
        mac.update(message);
        let full = mac.finalize().into_bytes();
        let mut out = [0u8; AUTH_DIGEST_LEN];
        out.copy_from_slice(&full[..AUTH_DIGEST_LEN]);
        Ok(out)
    }

    /// Check the digest found at `digest_at` in `message`.
    pub fn verify(
        &self,
        message: &[u8],
        digest_at: usize,
        digest: &[u8],
        engine_id: &[u8],
    ) -> Result<(), DecodeError> {
        if digest.len() != AUTH_DIGEST_LEN {
            return Err(DecodeError::AuthenticationFailed);
        }

        let mut zeroed = message.to_vec();
        zeroed
            .get_mut(digest_at..digest_at + AUTH_DIGEST_LEN)
            .ok_or(DecodeError::AuthenticationFailed)?
            .fill(0);

        let mut mac = self.mac(engine_id)?;
        mac.update(&zeroed);
        mac.verify_truncated_left(digest)
            .map_err(|_| DecodeError::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENGINE: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];

    #[test]
    fn localized_key_matches_published_vector() {
        let ku = password_to_key(b"maplesyrup").unwrap();
        let kul = localize_key(&ku, &ENGINE);
        assert_eq!(
            kul,
            [
                0x9f, 0xb5, 0xcc, 0x03, 0x81, 0x49, 0x7b, 0x37, 0x93, 0x52, 0x89, 0x39, 0xff, 0x78, 0x8d, 0x5d,
                0x79, 0x14, 0x52, 0x11
            ]
        );
    }

    #[test]
    fn digest_verifies_only_unchanged_messages() {
        let user = UsmUser::new("monitor", "maplesyrup", AuthLevel::AuthNoPriv);
        let mut message = b"header ............ trailer".to_vec();
        let at = 7;
        message[at..at + AUTH_DIGEST_LEN].fill(0);

        let digest = user.digest(&message, &ENGINE).unwrap();
        message[at..at + AUTH_DIGEST_LEN].copy_from_slice(&digest);
        assert!(user.verify(&message, at, &digest, &ENGINE).is_ok());

        let other_engine = [0x80, 0, 0, 1];
        assert_eq!(
            user.verify(&message, at, &digest, &other_engine),
            Err(DecodeError::AuthenticationFailed)
        );

        let last = message.len() - 1;
        message[last] ^= 0x01;
        assert_eq!(
            user.verify(&message, at, &digest, &ENGINE),
            Err(DecodeError::AuthenticationFailed)
        );
    }

    #[test]
    fn user_without_password_cannot_authenticate() {
        let user = UsmUser::new("monitor", "", AuthLevel::AuthNoPriv);
        assert_eq!(user.digest(b"x", &ENGINE), Err(DecodeError::AuthenticationFailed));
    }

    #[test]
    fn auth_level_defaults_to_auth_no_priv() {
        assert_eq!(AuthLevel::parse("NoAuthNoPriv"), AuthLevel::NoAuthNoPriv);
        assert_eq!(AuthLevel::parse("AuthNoPriv"), AuthLevel::AuthNoPriv);
        assert_eq!(AuthLevel::parse(""), AuthLevel::AuthNoPriv);
    }
}
