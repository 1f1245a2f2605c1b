//! Cryptographic primitives for DevState.
//!
//! Wraps HMAC-SHA-256 keyed hashing and SHA-256 content checksums with
//! strong types. Signing secrets never appear in `Debug` output; keys are
//! identified in logs by id and a short Blake3 fingerprint.

use std::collections::BTreeMap;
use std::fmt;

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canonical::canonical_bytes;
use crate::error::{CoreError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every state checksum.
pub const CHECKSUM_PREFIX: &str = "sha256:";

/// Content checksum of a state document: `sha256:` + hex(SHA-256(canonical json)).
pub fn state_checksum(json: &Value) -> String {
    let digest = Sha256::digest(canonical_bytes(json));
    format!("{}{}", CHECKSUM_PREFIX, hex::encode(digest))
}

/// HMAC-SHA-256 of `message` under `secret`, as lowercase hex.
pub fn keyed_hash(secret: &SigningSecret, message: &[u8]) -> String {
    hex::encode(mac_for(secret, message).finalize().into_bytes())
}

/// Check `expected_hex` against the HMAC of `message` in constant time.
pub fn verify_keyed_hash(secret: &SigningSecret, message: &[u8], expected_hex: &str) -> bool {
    match hex::decode(expected_hex) {
        Ok(expected) => mac_for(secret, message).verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

fn mac_for(secret: &SigningSecret, message: &[u8]) -> HmacSha256 {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&secret.0).expect("HMAC can take key of any size");
    mac.update(message);
    mac
}

/// A keyed-hash signing secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    /// Wrap raw secret bytes. Empty secrets are rejected.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(CoreError::EmptySecret);
        }
        Ok(Self(bytes))
    }

    /// Generate a random 32-byte secret.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        Self::new(hex::decode(s)?)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short public fingerprint: the first 16 hex chars of Blake3(secret).
    pub fn fingerprint(&self) -> String {
        blake3::hash(&self.0).to_hex()[..16].to_string()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningSecret(<redacted {}>)", self.fingerprint())
    }
}

impl std::str::FromStr for SigningSecret {
    type Err = CoreError;

    /// Takes the UTF-8 bytes of `s` verbatim, as deployments pass secrets
    /// through the environment.
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s.as_bytes().to_vec())
    }
}

/// A named signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmacKey {
    pub id: String,
    pub secret: SigningSecret,
    pub active: bool,
    pub created_at: i64,
}

impl HmacKey {
    /// Create an inactive key. [`Keyring`] decides which key is active.
    pub fn new(id: impl Into<String>, secret: SigningSecret, created_at: i64) -> Self {
        Self {
            id: id.into(),
            secret,
            active: false,
            created_at,
        }
    }

    pub fn fingerprint(&self) -> String {
        self.secret.fingerprint()
    }

    /// Sign a message with this key.
    pub fn sign(&self, message: &[u8]) -> String {
        keyed_hash(&self.secret, message)
    }

    /// Verify a hex digest produced by [`HmacKey::sign`].
    pub fn verify(&self, message: &[u8], expected_hex: &str) -> bool {
        verify_keyed_hash(&self.secret, message, expected_hex)
    }

    /// Public description of the key (no secret material).
    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            active: self.active,
            created_at: self.created_at,
            fingerprint: self.fingerprint(),
        }
    }
}

/// What callers may learn about a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub id: String,
    pub active: bool,
    pub created_at: i64,
    pub fingerprint: String,
}

/// The signing keys known to an engine. Exactly one key is active.
///
/// A keyring is immutable; rotation produces a new keyring via
/// [`Keyring::rotated`].
#[derive(Debug, Clone)]
pub struct Keyring {
    keys: BTreeMap<String, HmacKey>,
    active: String,
}

impl Keyring {
    /// A keyring holding a single, active key.
    pub fn new(mut key: HmacKey) -> Self {
        key.active = true;
        let active = key.id.clone();
        let mut keys = BTreeMap::new();
        keys.insert(active.clone(), key);
        Self { keys, active }
    }

    /// Rebuild a keyring from persisted keys.
    ///
    /// Fails unless exactly one key is marked active and ids are unique.
    pub fn from_keys(keys: Vec<HmacKey>) -> Result<Self> {
        let mut map = BTreeMap::new();
        let mut active = None;

        for key in keys {
            if key.active {
                if let Some(previous) = &active {
                    return Err(CoreError::InvalidKeyring(format!(
                        "keys {} and {} are both active",
                        previous, key.id
                    )));
                }
                active = Some(key.id.clone());
            }
            if map.contains_key(&key.id) {
                return Err(CoreError::InvalidKeyring(format!(
                    "duplicate key id {}",
                    key.id
                )));
            }
            map.insert(key.id.clone(), key);
        }

        let active = active
            .ok_or_else(|| CoreError::InvalidKeyring("no active key".into()))?;
        Ok(Self { keys: map, active })
    }

    /// The key that signs new entries.
    pub fn active(&self) -> &HmacKey {
        // `active` always names a key in `keys`; every constructor ensures it.
        &self.keys[&self.active]
    }

    /// Look up a key by id, active or retired.
    pub fn get(&self, id: &str) -> Option<&HmacKey> {
        self.keys.get(id)
    }

    /// Resolve the key for an entry: its own key if tagged, else the active key.
    pub fn resolve(&self, key_id: Option<&str>) -> Option<&HmacKey> {
        match key_id {
            Some(id) => self.get(id),
            None => Some(self.active()),
        }
    }

    /// A new keyring in which `key` is active and every other key retired.
    ///
    /// Re-installing an existing id replaces that key's secret.
    pub fn rotated(&self, mut key: HmacKey) -> Self {
        let mut keys = self.keys.clone();
        for existing in keys.values_mut() {
            existing.active = false;
        }
        key.active = true;
        let active = key.id.clone();
        keys.insert(active.clone(), key);
        Self { keys, active }
    }

    /// All keys, ordered by id.
    pub fn keys(&self) -> impl Iterator<Item = &HmacKey> {
        self.keys.values()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(id: &str, secret: &str) -> HmacKey {
        HmacKey::new(id, secret.parse().unwrap(), 0)
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        let b = json!({"a": 1, "b": 2});
        assert_eq!(state_checksum(&a), state_checksum(&b));
        assert!(state_checksum(&a).starts_with(CHECKSUM_PREFIX));
    }

    #[test]
    fn test_checksum_empty_object() {
        // SHA-256("{}")
        assert_eq!(
            state_checksum(&json!({})),
            "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_keyed_hash_rfc4231_case_2() {
        let secret = SigningSecret::new(b"Jefe".to_vec()).unwrap();
        assert_eq!(
            keyed_hash(&secret, b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_keyed_hash() {
        let secret = SigningSecret::generate();
        let digest = keyed_hash(&secret, b"message");
        assert!(verify_keyed_hash(&secret, b"message", &digest));
        assert!(!verify_keyed_hash(&secret, b"other", &digest));
        assert!(!verify_keyed_hash(&secret, b"message", "not-hex"));
        assert!(!verify_keyed_hash(&SigningSecret::generate(), b"message", &digest));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(SigningSecret::new(Vec::new()), Err(CoreError::EmptySecret)));
        assert!("".parse::<SigningSecret>().is_err());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret: SigningSecret = "hunter2".parse().unwrap();
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains(&secret.fingerprint()));
    }

    #[test]
    fn test_secret_hex_roundtrip() {
        let secret = SigningSecret::generate();
        let recovered = SigningSecret::from_hex(&secret.to_hex()).unwrap();
        assert_eq!(secret, recovered);
    }

    #[test]
    fn test_keyring_rotation() {
        let ring = Keyring::new(key("k1", "one"));
        assert_eq!(ring.active().id, "k1");

        let rotated = ring.rotated(key("k2", "two"));
        assert_eq!(rotated.active().id, "k2");
        assert!(!rotated.get("k1").unwrap().active);
        assert_eq!(rotated.len(), 2);

        // The original keyring is untouched.
        assert_eq!(ring.active().id, "k1");
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_keyring_resolve() {
        let ring = Keyring::new(key("k1", "one")).rotated(key("k2", "two"));
        assert_eq!(ring.resolve(Some("k1")).unwrap().id, "k1");
        assert_eq!(ring.resolve(None).unwrap().id, "k2");
        assert!(ring.resolve(Some("missing")).is_none());
    }

    #[test]
    fn test_keyring_from_keys_requires_one_active() {
        let mut a = key("a", "1");
        let mut b = key("b", "2");
        assert!(Keyring::from_keys(vec![a.clone(), b.clone()]).is_err());

        a.active = true;
        b.active = true;
        assert!(Keyring::from_keys(vec![a.clone(), b.clone()]).is_err());

        b.active = false;
        let ring = Keyring::from_keys(vec![a, b]).unwrap();
        assert_eq!(ring.active().id, "a");
    }
}
