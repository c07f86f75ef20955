//! Session token signing and API key generation.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use color_eyre::{
    Result, Section,
    eyre::{Context, eyre},
};
use derive_more::Debug;
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::auth::{RawToken, TokenVerifier, UserId};

/// Length of generated API keys.
pub const API_KEY_LEN: usize = 32;

/// Generate a new API key: 32 random alphanumeric characters.
pub fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect()
}

/// Signs and verifies stateless session tokens.
///
/// A token is `<claims>.<mac>`: the claims are base64url-encoded JSON naming
/// the user and an expiry, and the MAC is a keyed BLAKE3 hash of the encoded
/// claims, hex-encoded. The key is derived from an operator-supplied secret,
/// so every instance sharing the secret accepts the same tokens.
#[derive(Clone, Debug)]
#[debug("SessionKeys(..)")]
pub struct SessionKeys {
    key: [u8; 32],
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: UserId,
    exp: i64,
}

impl SessionKeys {
    const CONTEXT: &'static str = "keygate 2026-10 session token signing";
    const MIN_SECRET_LEN: usize = 16;

    /// Derive signing keys from a secret.
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.len() < Self::MIN_SECRET_LEN {
            return Err(eyre!(
                "session secret must be at least {} bytes",
                Self::MIN_SECRET_LEN
            )
            .suggestion("Set `KEYGATE_SESSION_SECRET` to a long random string"));
        }
        Ok(Self {
            key: blake3::derive_key(Self::CONTEXT, secret.as_bytes()),
        })
    }

    /// Mint a token for `user` that stops verifying at `expires_at`.
    pub fn mint(&self, user: &UserId, expires_at: OffsetDateTime) -> Result<RawToken> {
        let claims = SessionClaims {
            sub: user.clone(),
            exp: expires_at.unix_timestamp(),
        };
        let claims = serde_json::to_vec(&claims).context("serialize session claims")?;
        let payload = URL_SAFE_NO_PAD.encode(claims);
        let mac = blake3::keyed_hash(&self.key, payload.as_bytes());
        Ok(RawToken::new(format!("{payload}.{}", mac.to_hex())))
    }

    /// Verify a token as of `now`, returning the user it was minted for.
    pub fn verify_at(&self, token: &RawToken, now: OffsetDateTime) -> Option<UserId> {
        let (payload, mac) = token.as_str().split_once('.')?;
        let mac = blake3::Hash::from_hex(mac).ok()?;

        // `blake3::Hash` equality is constant-time.
        if blake3::keyed_hash(&self.key, payload.as_bytes()) != mac {
            return None;
        }

        let claims = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let claims = serde_json::from_slice::<SessionClaims>(&claims).ok()?;
        (claims.exp > now.unix_timestamp()).then_some(claims.sub)
    }
}

impl TokenVerifier for SessionKeys {
    fn verify(&self, token: &RawToken) -> Option<UserId> {
        self.verify_at(token, OffsetDateTime::now_utc())
    }
}
