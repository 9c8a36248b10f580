use std::fmt;
use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as SealingPublicKey, StaticSecret};

use crate::errors::{ChainError, ChainResult};

/// 32-byte SHA-256 digest, hex-encoded wherever it is serialized or shown.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest32(pub [u8; 32]);

impl Digest32 {
    pub const ZERO: Digest32 = Digest32([0u8; 32]);

    /// SHA-256 of an arbitrary byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        Digest32(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> ChainResult<Self> {
        let bytes = hex::decode(value)
            .map_err(|err| ChainError::Crypto(format!("invalid digest encoding: {err}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainError::Crypto("digest must encode exactly 32 bytes".to_string()))?;
        Ok(Digest32(bytes))
    }
}

impl fmt::Debug for Digest32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest32({})", self.to_hex())
    }
}

impl fmt::Display for Digest32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for Digest32 {
    fn from(value: [u8; 32]) -> Self {
        Digest32(value)
    }
}

impl Serialize for Digest32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest32::from_hex(&raw).map_err(D::Error::custom)
    }
}

/// Hash `label || bytes`; every digest family in the crate carries its own
/// label so values from one context never collide with another.
pub fn domain_hash(label: &[u8], bytes: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(bytes);
    Digest32(hasher.finalize().into())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<SigningKey> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &SigningKey) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.verifying_key().to_bytes()),
        secret_key: hex::encode(keypair.to_bytes()),
    };
    write_stored(path, &stored)
}

pub fn load_keypair(path: &Path) -> ChainResult<SigningKey> {
    let stored = read_stored(path)?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    let secret_bytes: [u8; 32] = secret_bytes
        .try_into()
        .map_err(|_| ChainError::Config("secret key must encode exactly 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&secret_bytes))
}

pub fn sign_message(keypair: &SigningKey, message: &[u8]) -> Signature {
    keypair.sign(message)
}

pub fn verify_signature(
    public_key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> ChainResult<()> {
    public_key
        .verify(message, signature)
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

pub fn public_key_from_hex(data: &str) -> ChainResult<VerifyingKey> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Config(format!("invalid public key encoding: {err}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ChainError::Config("public key must encode exactly 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|err| ChainError::Config(format!("invalid public key bytes: {err}")))
}

pub fn signature_from_hex(data: &str) -> ChainResult<Signature> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Config(format!("invalid signature encoding: {err}")))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| ChainError::Config("signature must encode exactly 64 bytes".to_string()))?;
    Ok(Signature::from_bytes(&bytes))
}

pub fn signature_to_hex(signature: &Signature) -> String {
    hex::encode(signature.to_bytes())
}

/// X25519 keypair an enclave presents as its sealing identity; secrets
/// released by the broker are encrypted to the public half.
pub fn generate_sealing_keypair() -> StaticSecret {
    StaticSecret::random_from_rng(OsRng)
}

pub fn save_sealing_keypair(path: &Path, secret: &StaticSecret) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(SealingPublicKey::from(secret).as_bytes()),
        secret_key: hex::encode(secret.to_bytes()),
    };
    write_stored(path, &stored)
}

pub fn load_sealing_keypair(path: &Path) -> ChainResult<StaticSecret> {
    let stored = read_stored(path)?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid sealing key encoding: {err}")))?;
    let secret_bytes: [u8; 32] = secret_bytes
        .try_into()
        .map_err(|_| ChainError::Config("sealing key must encode exactly 32 bytes".to_string()))?;
    Ok(StaticSecret::from(secret_bytes))
}

pub fn load_or_generate_sealing_keypair(path: &Path) -> ChainResult<StaticSecret> {
    if path.exists() {
        load_sealing_keypair(path)
    } else {
        let secret = generate_sealing_keypair();
        save_sealing_keypair(path, &secret)?;
        Ok(secret)
    }
}

pub fn sealing_public_key_from_hex(data: &str) -> ChainResult<SealingPublicKey> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Config(format!("invalid sealing key encoding: {err}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ChainError::Config("sealing key must encode exactly 32 bytes".to_string()))?;
    Ok(SealingPublicKey::from(bytes))
}

fn write_stored(path: &Path, stored: &StoredKeypair) -> ChainResult<()> {
    let encoded = toml::to_string_pretty(stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

fn read_stored(path: &Path) -> ChainResult<StoredKeypair> {
    let raw = fs::read_to_string(path)?;
    toml::from_str(&raw).map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn keypair_roundtrips_through_disk() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("keys").join("attestor.toml");
        let keypair = generate_keypair();
        save_keypair(&path, &keypair).expect("save");

        let loaded = load_keypair(&path).expect("load");
        assert_eq!(loaded.to_bytes(), keypair.to_bytes());

        let message = b"release request";
        let signature = sign_message(&keypair, message);
        verify_signature(&loaded.verifying_key(), message, &signature).expect("verify");
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let keypair = generate_keypair();
        let signature = sign_message(&keypair, b"claim");
        assert!(verify_signature(&keypair.verifying_key(), b"other claim", &signature).is_err());
    }

    #[test]
    fn sealing_keypair_roundtrips_through_disk() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("sealing.toml");
        let secret = generate_sealing_keypair();
        save_sealing_keypair(&path, &secret).expect("save");

        let loaded = load_sealing_keypair(&path).expect("load");
        assert_eq!(loaded.to_bytes(), secret.to_bytes());
        assert_eq!(
            SealingPublicKey::from(&loaded).as_bytes(),
            SealingPublicKey::from(&secret).as_bytes()
        );
    }

    #[test]
    fn digest_hex_roundtrip() {
        let digest = Digest32::of(b"stepchain");
        let parsed = Digest32::from_hex(&digest.to_hex()).expect("parse");
        assert_eq!(parsed, digest);
        assert!(Digest32::from_hex("abcd").is_err());
    }

    #[test]
    fn empty_input_digest_matches_known_vector() {
        assert_eq!(
            Digest32::of(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn domain_labels_separate_digests() {
        let payload = b"same payload";
        assert_ne!(
            domain_hash(b"label-a", payload),
            domain_hash(b"label-b", payload)
        );
    }
}
