// src/backend/utils/crypto.rs
// Record encryption, the beneficiary key layer, and id/digest helpers.

use crate::error::{AfterselfError, Result};
use crate::models::common::Timestamp;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use elliptic_curve::sec1::ToEncodedPoint;
use p256::ecdh::EphemeralSecret;
use p256::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use ulid::Ulid;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const RECORD_MAGIC: &[u8; 4] = b"AFSV";
const RECORD_VERSION: u8 = 1;
const RECORD_HEADER_LEN: usize = RECORD_MAGIC.len() + 1 + NONCE_LEN;

const BENEFICIARY_MAGIC: &[u8; 4] = b"AFSB";
const BENEFICIARY_VERSION: u8 = 1;
const EPHEMERAL_POINT_LEN: usize = 65; // uncompressed SEC1
const BENEFICIARY_HEADER_LEN: usize = BENEFICIARY_MAGIC.len() + 1 + EPHEMERAL_POINT_LEN + NONCE_LEN;
const BENEFICIARY_KDF_LABEL: &[u8] = b"afterself-beneficiary-v1";

/// Primary symmetric key of the vault.
#[derive(Clone)]
pub struct VaultKey([u8; KEY_LEN]);

impl VaultKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(encoded: &str) -> Result<Self> {
        let decoded = hex::decode(encoded.trim())
            .map_err(|e| AfterselfError::Config(format!("vault key is not valid hex: {e}")))?;
        let bytes: [u8; KEY_LEN] = decoded
            .try_into()
            .map_err(|_| AfterselfError::Config(format!("vault key must be {KEY_LEN} bytes")))?;
        Ok(Self(bytes))
    }

    /// Reads the hex-encoded key at `path`, or creates one there (mode 0600) if absent.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let encoded = fs::read_to_string(path)?;
            return Self::from_hex(&encoded);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let key = Self::generate();
        let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
        file.write_all(hex::encode(key.0).as_bytes())?;
        file.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(key)
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// AES-256-GCM sealing of vault records. Frame: magic | version | nonce | ciphertext+tag.
/// The record label is bound as associated data so records cannot be swapped.
#[derive(Clone)]
pub struct RecordCipher {
    cipher: Aes256Gcm,
}

impl RecordCipher {
    pub fn new(key: &VaultKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)),
        }
    }

    pub fn seal(&self, label: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: label.as_bytes(),
                },
            )
            .map_err(|_| AfterselfError::InternalError(format!("failed to seal record {label}")))?;

        let mut framed = Vec::with_capacity(RECORD_HEADER_LEN + ciphertext.len());
        framed.extend_from_slice(RECORD_MAGIC);
        framed.push(RECORD_VERSION);
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    pub fn open(&self, label: &str, framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < RECORD_HEADER_LEN + TAG_LEN {
            return Err(AfterselfError::integrity(label, "record is truncated"));
        }
        if &framed[..RECORD_MAGIC.len()] != RECORD_MAGIC {
            return Err(AfterselfError::integrity(label, "bad record magic"));
        }
        if framed[RECORD_MAGIC.len()] != RECORD_VERSION {
            return Err(AfterselfError::integrity(label, "unsupported record version"));
        }
        let nonce = &framed[RECORD_MAGIC.len() + 1..RECORD_HEADER_LEN];
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: &framed[RECORD_HEADER_LEN..],
                    aad: label.as_bytes(),
                },
            )
            .map_err(|_| AfterselfError::integrity(label, "authentication failed"))
    }
}

/// The beneficiary's P-256 public key, used for the inner plan layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BeneficiaryKey(PublicKey);

impl BeneficiaryKey {
    pub fn from_public_key(key: PublicKey) -> Self {
        Self(key)
    }

    pub fn from_sec1_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| AfterselfError::Config(format!("beneficiary key is not valid hex: {e}")))?;
        PublicKey::from_sec1_bytes(&bytes)
            .map(Self)
            .map_err(|_| AfterselfError::Config("beneficiary key is not a valid P-256 point".to_string()))
    }

    pub fn to_sec1_hex(&self) -> String {
        hex::encode(self.0.to_encoded_point(false).as_bytes())
    }
}

fn beneficiary_cipher(shared: &[u8], ephemeral_point: &[u8]) -> Aes256Gcm {
    let digest = Sha256::new()
        .chain_update(BENEFICIARY_KDF_LABEL)
        .chain_update(shared)
        .chain_update(ephemeral_point)
        .finalize();
    Aes256Gcm::new(&digest)
}

/// ECIES-style wrap: ephemeral ECDH against the beneficiary key, SHA-256 KDF, AES-256-GCM.
pub fn wrap_for_beneficiary(key: &BeneficiaryKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_point = ephemeral.public_key().to_encoded_point(false);
    let shared = ephemeral.diffie_hellman(&key.0);
    let cipher = beneficiary_cipher(shared.raw_secret_bytes().as_slice(), ephemeral_point.as_bytes());

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| AfterselfError::InternalError("failed to wrap plan for beneficiary".to_string()))?;

    let mut framed = Vec::with_capacity(BENEFICIARY_HEADER_LEN + ciphertext.len());
    framed.extend_from_slice(BENEFICIARY_MAGIC);
    framed.push(BENEFICIARY_VERSION);
    framed.extend_from_slice(ephemeral_point.as_bytes());
    framed.extend_from_slice(&nonce);
    framed.extend_from_slice(&ciphertext);
    Ok(framed)
}

/// Beneficiary-side decryption; needs only the beneficiary's secret key.
pub fn unwrap_for_beneficiary(secret: &SecretKey, framed: &[u8]) -> Result<Vec<u8>> {
    const LABEL: &str = "beneficiary plan";
    if framed.len() < BENEFICIARY_HEADER_LEN + TAG_LEN
        || &framed[..BENEFICIARY_MAGIC.len()] != BENEFICIARY_MAGIC
        || framed[BENEFICIARY_MAGIC.len()] != BENEFICIARY_VERSION
    {
        return Err(AfterselfError::integrity(LABEL, "malformed beneficiary envelope"));
    }
    let point_start = BENEFICIARY_MAGIC.len() + 1;
    let point = &framed[point_start..point_start + EPHEMERAL_POINT_LEN];
    let nonce = &framed[point_start + EPHEMERAL_POINT_LEN..BENEFICIARY_HEADER_LEN];

    let ephemeral = PublicKey::from_sec1_bytes(point)
        .map_err(|_| AfterselfError::integrity(LABEL, "invalid ephemeral key"))?;
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
    beneficiary_cipher(shared.raw_secret_bytes().as_slice(), point)
        .decrypt(Nonce::from_slice(nonce), &framed[BENEFICIARY_HEADER_LEN..])
        .map_err(|_| AfterselfError::integrity(LABEL, "authentication failed"))
}

/// Generates a ULID string anchored at `now`.
pub fn generate_ulid(now: Timestamp) -> String {
    Ulid::from_parts(now, rand::random::<u128>()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cipher() -> RecordCipher {
        RecordCipher::new(&VaultKey::from_bytes([7u8; KEY_LEN]))
    }

    #[test]
    fn seal_then_open_returns_identical_plaintext() {
        let cipher = cipher();
        let sealed = cipher.seal("switch_state", b"armed").unwrap();
        assert_eq!(cipher.open("switch_state", &sealed).unwrap(), b"armed");
    }

    #[test]
    fn each_seal_uses_a_fresh_nonce() {
        let cipher = cipher();
        let a = cipher.seal("plan", b"same").unwrap();
        let b = cipher.seal("plan", b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn record_label_is_authenticated() {
        let cipher = cipher();
        let sealed = cipher.seal("heartbeat", b"{}").unwrap();
        let err = cipher.open("switch_state", &sealed).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = cipher().seal("plan", b"secret").unwrap();
        let other = RecordCipher::new(&VaultKey::from_bytes([8u8; KEY_LEN]));
        assert!(other.open("plan", &sealed).unwrap_err().is_integrity());
    }

    #[test]
    fn truncated_record_is_an_integrity_failure() {
        let sealed = cipher().seal("plan", b"secret").unwrap();
        assert!(cipher().open("plan", &sealed[..10]).unwrap_err().is_integrity());
    }

    #[test]
    fn beneficiary_roundtrip_needs_only_the_secret_key() {
        let secret = SecretKey::random(&mut OsRng);
        let key = BeneficiaryKey::from_public_key(secret.public_key());
        let wrapped = wrap_for_beneficiary(&key, b"plan bytes").unwrap();
        assert_eq!(unwrap_for_beneficiary(&secret, &wrapped).unwrap(), b"plan bytes");

        let stranger = SecretKey::random(&mut OsRng);
        assert!(unwrap_for_beneficiary(&stranger, &wrapped).unwrap_err().is_integrity());
    }

    #[test]
    fn beneficiary_key_hex_roundtrip() {
        let secret = SecretKey::random(&mut OsRng);
        let key = BeneficiaryKey::from_public_key(secret.public_key());
        assert_eq!(BeneficiaryKey::from_sec1_hex(&key.to_sec1_hex()).unwrap(), key);
        assert!(matches!(
            BeneficiaryKey::from_sec1_hex("04abcd"),
            Err(AfterselfError::Config(_))
        ));
    }

    #[test]
    fn vault_key_is_created_once_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("master.key");
        let created = VaultKey::load_or_create(&path).unwrap();
        let reloaded = VaultKey::load_or_create(&path).unwrap();
        assert_eq!(created.0, reloaded.0);
    }

    proptest! {
        #[test]
        fn any_single_bit_flip_is_detected(
            plaintext in proptest::collection::vec(any::<u8>(), 0..256),
            bit in any::<usize>(),
        ) {
            let cipher = cipher();
            let mut sealed = cipher.seal("action_plan", &plaintext).unwrap();
            let bit = bit % (sealed.len() * 8);
            sealed[bit / 8] ^= 1 << (bit % 8);
            let err = cipher.open("action_plan", &sealed).unwrap_err();
            prop_assert!(err.is_integrity());
        }
    }
}
