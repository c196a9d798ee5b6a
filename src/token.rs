use std::sync::RwLock;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::helpers::{current_ts, random_string};

pub const COOKIE_ATTRIBUTE: &str = "__bProxy_v=";

const OTP_LENGTH: usize = 32;

/// Per-stage secrets. All three rotate together at the hour boundary;
/// `hour_str` is part of every identity key, so tokens minted against
/// the previous hour stop verifying on their own.
#[derive(Clone)]
pub struct Secrets {
    pub cookie_otp: String,
    pub js_otp: String,
    pub captcha_otp: String,
    pub hour_str: String,
}

pub struct SecretStore {
    inner: RwLock<Secrets>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Secrets {
                cookie_otp: random_string(OTP_LENGTH),
                js_otp: random_string(OTP_LENGTH),
                captcha_otp: random_string(OTP_LENGTH),
                hour_str: hour_now(),
            }),
        }
    }

    pub fn current(&self) -> Secrets {
        self.inner.read().unwrap().clone()
    }

    /// True when the wall-clock hour has moved past the stored one.
    pub fn due_for_rotation(&self) -> bool {
        self.inner.read().unwrap().hour_str != hour_now()
    }

    pub fn rotate(&self) {
        let mut secrets = self.inner.write().unwrap();
        secrets.cookie_otp = random_string(OTP_LENGTH);
        secrets.js_otp = random_string(OTP_LENGTH);
        secrets.captcha_otp = random_string(OTP_LENGTH);
        secrets.hour_str = hour_now();
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

pub fn hour_now() -> String {
    (current_ts() / 3600).to_string()
}

/// Issue the opaque token for an identity key under a stage secret.
pub fn issue(identity_key: &str, stage_secret: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(identity_key.as_bytes());
    hasher.update(stage_secret.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Re-issue and compare in constant time.
pub fn verify(provided: &str, identity_key: &str, stage_secret: &str) -> bool {
    let expected = issue(identity_key, stage_secret);
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Check whether the Cookie header carries `__bProxy_v=<token>`.
/// Matched as a substring of the full field value, so the stage-1
/// issuance cookie `_1__bProxy_v=<token>` satisfies it too. The token
/// itself is compared in constant time.
pub fn cookie_matches(cookie_header: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    let mut rest = cookie_header;
    while let Some(idx) = rest.find(COOKIE_ATTRIBUTE) {
        let value_start = idx + COOKIE_ATTRIBUTE.len();
        let value = rest[value_start..]
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        if bool::from(value.as_bytes().ct_eq(token.as_bytes())) {
            return true;
        }
        rest = &rest[value_start..];
    }
    false
}

/// Two-layer token memo. The primary map memoises issued tokens by
/// identity + suspicion level; the second holds the sha256 PoW target
/// per token (stage 2 only). Entries die with the hourly secret
/// rotation; `clear` is called from the rotation task so dead keys do
/// not pile up across hours.
#[derive(Default)]
pub struct TokenCache {
    tokens: DashMap<String, String>,
    pow_hashes: DashMap<String, String>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self, cache_key: &str) -> Option<String> {
        self.tokens.get(cache_key).map(|entry| entry.clone())
    }

    pub fn insert_token(&self, cache_key: String, token: String) {
        self.tokens.insert(cache_key, token);
    }

    pub fn pow_hash(&self, token: &str) -> Option<String> {
        self.pow_hashes.get(token).map(|entry| entry.clone())
    }

    pub fn insert_pow_hash(&self, token: String, hashed: String) {
        self.pow_hashes.insert(token, hashed);
    }

    pub fn clear(&self) {
        self.tokens.clear();
        self.pow_hashes.clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
