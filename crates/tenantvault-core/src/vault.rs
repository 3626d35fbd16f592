//! Deterministic field-level encryption for `TenantVault`.
//!
//! Secret fields (provisioned passwords) are encrypted before they reach the
//! mapping store. Encryption is deterministic: the same plaintext under the
//! same context always yields the same ciphertext, so stored values can be
//! matched for equality without decrypting them. The cost is that repeated
//! plaintexts are visible as repeated ciphertexts.
//!
//! # Construction
//!
//! - The operator supplies a 96-byte master key (base64). Two 256-bit
//!   subkeys are derived from it with HKDF-SHA256: an AES-256-GCM key and a
//!   synthetic-IV key.
//! - The nonce is `HMAC-SHA256(siv_key, header || plaintext)` truncated to
//!   12 bytes. Nonces therefore only repeat when the header and plaintext
//!   repeat, which is exactly the deterministic case.
//! - Envelope: `marker (1) || key_id (16) || value_type (1) || nonce (12) ||
//!   ciphertext || tag (16)`. The first 18 bytes are authenticated as
//!   associated data.
//!
//! A fresh random key identifier is generated for every context. It is
//! embedded in the envelope, so values written by earlier runs remain
//! decryptable as long as the same master key is supplied.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::VaultError;

/// Length of the operator-supplied master key in bytes.
pub const MASTER_KEY_LEN: usize = 96;

/// Length of the per-context key identifier in bytes.
pub const KEY_ID_LEN: usize = 16;

/// Name of the algorithm bound to every context.
pub const ALGORITHM: &str = "AEAD_AES_256_GCM_HMAC_SHA_256-Deterministic";

/// Envelope marker for deterministic encryption.
const DETERMINISTIC_MARKER: u8 = 0x01;

/// Envelope value type for UTF-8 strings.
const VALUE_TYPE_STRING: u8 = 0x02;

const HEADER_LEN: usize = 1 + KEY_ID_LEN + 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENVELOPE_LEN: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

const ENC_KEY_INFO: &[u8] = b"tenantvault-dae-enc-v1";
const SIV_KEY_INFO: &[u8] = b"tenantvault-dae-siv-v1";

/// The operator's 96-byte master key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; MASTER_KEY_LEN]);

impl MasterKey {
    /// Generate a new random master key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Decode a base64 master key.
    ///
    /// Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyMaterial`] if the input is not valid base64 or
    /// does not decode to exactly 96 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let decoded = Zeroizing::new(BASE64.decode(encoded.trim()).map_err(|e| {
            VaultError::KeyMaterial {
                reason: format!("not valid base64: {e}"),
            }
        })?);
        let bytes: [u8; MASTER_KEY_LEN] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| VaultError::KeyMaterial {
                    reason: format!(
                        "expected {MASTER_KEY_LEN} bytes, got {}",
                        decoded.len()
                    ),
                })?;
        Ok(Self(bytes))
    }

    /// Encode the key as base64 for the operator to store.
    ///
    /// The caller must not log the returned string.
    #[must_use]
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.0))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A 256-bit subkey derived from the master key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SubKey([u8; 32]);

fn derive_subkey(master: &MasterKey, info: &[u8]) -> Result<SubKey, VaultError> {
    let hk = Hkdf::<Sha256>::new(None, &master.0);
    let mut derived = [0u8; 32];
    hk.expand(info, &mut derived)
        .map_err(|e| VaultError::KeyDerivation {
            context: String::from_utf8_lossy(info).into_owned(),
            reason: e.to_string(),
        })?;
    Ok(SubKey(derived))
}

/// Per-run encryption context.
///
/// Built once per process from the master key and used for every field
/// encryption in that run. Holds no mutable state.
#[derive(Clone)]
pub struct EncryptionContext {
    key_id: [u8; KEY_ID_LEN],
    enc_key: SubKey,
    siv_key: SubKey,
}

impl EncryptionContext {
    /// Build a context from a base64 master key with a fresh random key id.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyMaterial`] if the key cannot be decoded or has
    /// the wrong length.
    pub fn initialize(master_key_base64: &str) -> Result<Self, VaultError> {
        let master = MasterKey::from_base64(master_key_base64)?;
        Self::from_master_key(&master)
    }

    /// Build a context from an already decoded master key.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyDerivation`] if subkey derivation fails.
    pub fn from_master_key(master: &MasterKey) -> Result<Self, VaultError> {
        let mut key_id = [0u8; KEY_ID_LEN];
        OsRng.fill_bytes(&mut key_id);
        Ok(Self {
            key_id,
            enc_key: derive_subkey(master, ENC_KEY_INFO)?,
            siv_key: derive_subkey(master, SIV_KEY_INFO)?,
        })
    }

    /// The key identifier embedded in every value this context encrypts.
    #[must_use]
    pub fn key_id(&self) -> &[u8; KEY_ID_LEN] {
        &self.key_id
    }

    /// The algorithm this context is bound to.
    #[must_use]
    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    /// Encrypt a string field deterministically.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Encryption`] if the AEAD operation fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedValue, VaultError> {
        let header = header(&self.key_id);
        let nonce = self.synthetic_nonce(&header, plaintext.as_bytes())?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key.0));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &header,
                },
            )
            .map_err(|e| VaultError::Encryption {
                reason: e.to_string(),
            })?;

        let mut envelope =
            Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&header);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(EncryptedValue(envelope))
    }

    /// Decrypt a value produced by [`encrypt`](Self::encrypt) under the same
    /// master key. The value may carry a key id from an earlier run.
    ///
    /// # Errors
    ///
    /// - [`VaultError::MalformedCiphertext`] if the envelope is truncated or
    ///   its header is not a deterministic string value.
    /// - [`VaultError::Decryption`] if authentication fails (wrong master key
    ///   or tampered data) or the plaintext is not UTF-8.
    pub fn decrypt(&self, value: &EncryptedValue) -> Result<String, VaultError> {
        let envelope = value.as_bytes();
        if envelope.len() < MIN_ENVELOPE_LEN {
            return Err(VaultError::MalformedCiphertext {
                reason: format!(
                    "expected at least {MIN_ENVELOPE_LEN} bytes, got {}",
                    envelope.len()
                ),
            });
        }
        let (header, rest) = envelope.split_at(HEADER_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        if header[0] != DETERMINISTIC_MARKER {
            return Err(VaultError::MalformedCiphertext {
                reason: format!("unknown algorithm marker {:#04x}", header[0]),
            });
        }
        if header[HEADER_LEN - 1] != VALUE_TYPE_STRING {
            return Err(VaultError::MalformedCiphertext {
                reason: format!("unsupported value type {:#04x}", header[HEADER_LEN - 1]),
            });
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key.0));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: header,
                    },
                )
                .map_err(|e| VaultError::Decryption {
                    reason: e.to_string(),
                })?,
        );

        // The nonce must be the one this plaintext would have produced.
        let expected = self.synthetic_nonce(header, &plaintext)?;
        if !bool::from(expected[..].ct_eq(nonce)) {
            return Err(VaultError::Decryption {
                reason: "synthetic nonce mismatch".to_owned(),
            });
        }

        String::from_utf8(plaintext.to_vec()).map_err(|e| VaultError::Decryption {
            reason: format!("plaintext is not UTF-8: {e}"),
        })
    }

    fn synthetic_nonce(
        &self,
        header: &[u8],
        plaintext: &[u8],
    ) -> Result<[u8; NONCE_LEN], VaultError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.siv_key.0).map_err(|e| {
            VaultError::Encryption {
                reason: format!("invalid synthetic-IV key: {e}"),
            }
        })?;
        mac.update(header);
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        Ok(nonce)
    }
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("key_id", &uuid::Uuid::from_bytes(self.key_id))
            .field("algorithm", &ALGORITHM)
            .field("key_material", &"[REDACTED]")
            .finish()
    }
}

fn header(key_id: &[u8; KEY_ID_LEN]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = DETERMINISTIC_MARKER;
    header[1..=KEY_ID_LEN].copy_from_slice(key_id);
    header[HEADER_LEN - 1] = VALUE_TYPE_STRING;
    header
}

/// An encrypted field value.
///
/// Serializes as an extended-JSON binary of subtype 6 (encrypted value):
/// `{"$binary": {"base64": "...", "subType": "06"}}`.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedValue(Vec<u8>);

impl EncryptedValue {
    /// Wrap raw envelope bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw envelope bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key id recorded in the envelope header, if the envelope is long enough.
    #[must_use]
    pub fn key_id(&self) -> Option<uuid::Uuid> {
        let bytes: [u8; KEY_ID_LEN] = self.0.get(1..=KEY_ID_LEN)?.try_into().ok()?;
        Some(uuid::Uuid::from_bytes(bytes))
    }

    /// Base64 encoding of the envelope.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    /// Decode a base64 envelope.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::MalformedCiphertext`] if the input is not base64.
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        BASE64
            .decode(encoded.trim())
            .map(Self)
            .map_err(|e| VaultError::MalformedCiphertext {
                reason: format!("not valid base64: {e}"),
            })
    }
}

impl fmt::Debug for EncryptedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedValue")
            .field("key_id", &self.key_id())
            .field("len", &self.0.len())
            .finish()
    }
}

const ENCRYPTED_SUBTYPE: &str = "06";

#[derive(Serialize, Deserialize)]
struct ExtendedBinary {
    #[serde(rename = "$binary")]
    binary: BinaryBody,
}

#[derive(Serialize, Deserialize)]
struct BinaryBody {
    base64: String,
    #[serde(rename = "subType")]
    sub_type: String,
}

impl Serialize for EncryptedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ExtendedBinary {
            binary: BinaryBody {
                base64: self.to_base64(),
                sub_type: ENCRYPTED_SUBTYPE.to_owned(),
            },
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EncryptedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ext = ExtendedBinary::deserialize(deserializer)?;
        if ext.binary.sub_type != ENCRYPTED_SUBTYPE {
            return Err(serde::de::Error::custom(format!(
                "expected binary subtype {ENCRYPTED_SUBTYPE}, got {}",
                ext.binary.sub_type
            )));
        }
        Self::from_base64(&ext.binary.base64).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn context() -> (MasterKey, EncryptionContext) {
        let master = MasterKey::generate();
        let ctx = EncryptionContext::initialize(&master.to_base64()).unwrap();
        (master, ctx)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (_, ctx) = context();
        for plaintext in ["s3cr3t-P@ss", "ü-ñ-漢字", "x"] {
            let ct = ctx.encrypt(plaintext).unwrap();
            assert_eq!(ctx.decrypt(&ct).unwrap(), plaintext);
        }
    }

    #[test]
    fn encryption_is_deterministic_within_context() {
        let (_, ctx) = context();
        let a = ctx.encrypt("same password").unwrap();
        let b = ctx.encrypt("same password").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, ctx.encrypt("other password").unwrap());
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let (_, ctx) = context();
        let ct = ctx.encrypt("hunter2").unwrap();
        assert!(!ct.as_bytes().windows(7).any(|w| w == b"hunter2"));
        assert_eq!(ct.as_bytes().len(), MIN_ENVELOPE_LEN + "hunter2".len());
    }

    #[test]
    fn envelope_carries_key_id() {
        let (_, ctx) = context();
        let ct = ctx.encrypt("pw").unwrap();
        assert_eq!(ct.key_id(), Some(uuid::Uuid::from_bytes(*ctx.key_id())));
        assert_eq!(ct.as_bytes()[0], DETERMINISTIC_MARKER);
    }

    #[test]
    fn key_id_uses_all_sixteen_random_bytes() {
        let (master, _) = context();
        let ids: Vec<[u8; KEY_ID_LEN]> = (0..16)
            .map(|_| *EncryptionContext::from_master_key(&master).unwrap().key_id())
            .collect();
        // No fixed version nibble or variant bits.
        assert!(ids.iter().any(|id| id[6] >> 4 != 4));
        assert!(ids.iter().any(|id| id[8] >> 6 != 0b10));
    }

    #[test]
    fn later_context_with_same_master_key_decrypts() {
        let (master, first) = context();
        let ct = first.encrypt("persisted").unwrap();

        let second = EncryptionContext::from_master_key(&master).unwrap();
        assert_ne!(first.key_id(), second.key_id());
        assert_eq!(second.decrypt(&ct).unwrap(), "persisted");
    }

    #[test]
    fn different_master_key_cannot_decrypt() {
        let (_, ctx) = context();
        let (_, other) = context();
        let ct = ctx.encrypt("secret").unwrap();
        assert!(matches!(
            other.decrypt(&ct),
            Err(VaultError::Decryption { .. })
        ));
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let (_, ctx) = context();
        let mut bytes = ctx.encrypt("secret").unwrap().as_bytes().to_vec();
        bytes[3] ^= 0xFF;
        let result = ctx.decrypt(&EncryptedValue::from_bytes(bytes));
        assert!(matches!(result, Err(VaultError::Decryption { .. })));
    }

    #[test]
    fn tampered_body_fails_authentication() {
        let (_, ctx) = context();
        let mut bytes = ctx.encrypt("secret").unwrap().as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let result = ctx.decrypt(&EncryptedValue::from_bytes(bytes));
        assert!(matches!(result, Err(VaultError::Decryption { .. })));
    }

    #[test]
    fn truncated_envelope_is_malformed() {
        let (_, ctx) = context();
        let result = ctx.decrypt(&EncryptedValue::from_bytes(vec![0x01; 20]));
        assert!(matches!(result, Err(VaultError::MalformedCiphertext { .. })));
    }

    #[test]
    fn unknown_marker_is_malformed() {
        let (_, ctx) = context();
        let mut bytes = ctx.encrypt("secret").unwrap().as_bytes().to_vec();
        bytes[0] = 0x02;
        let err = ctx.decrypt(&EncryptedValue::from_bytes(bytes)).unwrap_err();
        assert!(err.to_string().contains("marker"));
    }

    #[test]
    fn master_key_rejects_bad_base64() {
        let err = EncryptionContext::initialize("not base64!!").unwrap_err();
        assert!(matches!(err, VaultError::KeyMaterial { .. }));
    }

    #[test]
    fn master_key_rejects_wrong_length() {
        let short = BASE64.encode([7u8; 32]);
        let err = EncryptionContext::initialize(&short).unwrap_err();
        assert!(err.to_string().contains("expected 96 bytes, got 32"));
    }

    #[test]
    fn master_key_base64_roundtrip() {
        let master = MasterKey::generate();
        let encoded = master.to_base64();
        assert_eq!(BASE64.decode(encoded.as_str()).unwrap().len(), MASTER_KEY_LEN);
        let decoded = MasterKey::from_base64(&format!("  {}\n", encoded.as_str())).unwrap();
        assert_eq!(decoded.0, master.0);
    }

    #[test]
    fn debug_output_is_redacted() {
        let (master, ctx) = context();
        assert!(format!("{master:?}").contains("[REDACTED]"));
        let debug = format!("{ctx:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains(ALGORITHM));
    }

    #[test]
    fn encrypted_value_serializes_as_extended_binary() {
        let (_, ctx) = context();
        let ct = ctx.encrypt("pw").unwrap();
        let json = serde_json::to_value(&ct).unwrap();
        assert_eq!(json["$binary"]["subType"], "06");
        assert_eq!(json["$binary"]["base64"], ct.to_base64());

        let back: EncryptedValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, ct);
    }

    #[test]
    fn encrypted_value_rejects_other_subtypes() {
        let json = serde_json::json!({"$binary": {"base64": "AAAA", "subType": "00"}});
        assert!(serde_json::from_value::<EncryptedValue>(json).is_err());
    }
}
