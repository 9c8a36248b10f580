//! Secret broker: releases proving key material to attested trainers.
//!
//! A trainer presents an [`AttestationClaim`] signed by the attestation
//! authority. The broker checks the signature, the measurement allowlist and
//! the nonce freshness window, records the verdict in a hash-chained
//! decision log, and on acceptance returns the secret sealed to the claim's
//! X25519 sealing key. The plaintext secret never crosses the broker
//! boundary.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey as SealingPublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::{
    domain_hash, public_key_from_hex, sealing_public_key_from_hex, sign_message,
    signature_from_hex, signature_to_hex, verify_signature, Digest32,
};
use crate::errors::{ChainError, ChainResult};
use crate::types::now_ms;

const CLAIM_DOMAIN: &[u8] = b"stepchain.attestation-claim";
const FINGERPRINT_DOMAIN: &[u8] = b"stepchain.claim-fingerprint";
const SEALING_INFO: &[u8] = b"stepchain.sealed-secret.v1";
const SEALING_ALGORITHM: &str = "chacha20poly1305";
const NONCE_LEN: usize = 12;

/// Release policy for one broker instance. Persisted as TOML next to the
/// broker's key material.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerPolicy {
    /// Hex-encoded Ed25519 key of the attestation authority.
    pub authority_key: String,
    /// Hex-encoded measurements the broker will release secrets to.
    #[serde(default)]
    pub allowed_measurements: Vec<String>,
    /// Maximum age (and clock skew) of an acceptable claim.
    #[serde(default = "default_nonce_window_ms")]
    pub nonce_window_ms: u64,
}

fn default_nonce_window_ms() -> u64 {
    120_000
}

impl BrokerPolicy {
    pub fn new(authority_key: String, allowed_measurements: Vec<String>) -> Self {
        Self {
            authority_key,
            allowed_measurements,
            nonce_window_ms: default_nonce_window_ms(),
        }
    }

    pub fn load(path: &Path) -> ChainResult<Self> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|err| ChainError::Config(format!("failed to parse broker policy: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("failed to encode broker policy: {err}")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn allows(&self, measurement: &Digest32) -> bool {
        let hex = measurement.to_hex();
        self.allowed_measurements
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(&hex))
    }
}

/// Claim a trainer presents when requesting key material. The signature is
/// produced by the attestation authority over [`Self::signing_message`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttestationClaim {
    pub measurement: Digest32,
    /// Hex-encoded random nonce; makes each claim unique within the window.
    pub nonce: String,
    pub issued_at_ms: u64,
    /// Hex-encoded X25519 public key secrets are sealed to.
    pub sealing_key: String,
    /// Hex-encoded Ed25519 signature over [`Self::signing_message`].
    pub signature: String,
}

impl AttestationClaim {
    /// Byte string the authority signs. Covers every field except the
    /// signature itself.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            CLAIM_DOMAIN.len() + 32 + self.nonce.len() + 8 + self.sealing_key.len(),
        );
        bytes.extend_from_slice(CLAIM_DOMAIN);
        bytes.extend_from_slice(self.measurement.as_bytes());
        bytes.extend_from_slice(self.nonce.as_bytes());
        bytes.extend_from_slice(&self.issued_at_ms.to_le_bytes());
        bytes.extend_from_slice(self.sealing_key.as_bytes());
        bytes
    }

    /// Stable identifier for this claim in the decision log.
    pub fn fingerprint(&self) -> Digest32 {
        domain_hash(FINGERPRINT_DOMAIN, &self.signing_message())
    }
}

/// Produce a signed claim for a local trainer. Stands in for a hardware
/// attestor: the measurement is whatever the caller reports, and the
/// authority key plays the role of the attestation service.
pub fn issue_claim(
    authority: &SigningKey,
    measurement: Digest32,
    sealing_key: &SealingPublicKey,
) -> AttestationClaim {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    let mut claim = AttestationClaim {
        measurement,
        nonce: hex::encode(nonce),
        issued_at_ms: now_ms(),
        sealing_key: hex::encode(sealing_key.as_bytes()),
        signature: String::new(),
    };
    claim.signature = signature_to_hex(&sign_message(authority, &claim.signing_message()));
    claim
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct SealingMetadata {
    algorithm: String,
    /// Base64-encoded AEAD nonce.
    nonce: String,
    /// Hex-encoded ephemeral X25519 public key for the DH exchange.
    ephemeral_key: String,
}

/// Secret sealed to one recipient. Only the holder of the sealing secret
/// whose public half appeared in the claim can open it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedSecret {
    /// Hex-encoded measurement the secret was released to; bound into the
    /// AEAD as associated data.
    pub recipient_measurement: String,
    cipher: SealingMetadata,
    /// Base64-encoded ciphertext.
    pub ciphertext: String,
}

impl SealedSecret {
    pub fn unseal(&self, sealing_secret: &StaticSecret) -> ChainResult<Zeroizing<Vec<u8>>> {
        if self.cipher.algorithm != SEALING_ALGORITHM {
            return Err(ChainError::Crypto(format!(
                "unsupported sealing algorithm {}",
                self.cipher.algorithm
            )));
        }
        let measurement = Digest32::from_hex(&self.recipient_measurement)?;
        let nonce = BASE64
            .decode(&self.cipher.nonce)
            .map_err(|err| ChainError::Crypto(format!("invalid nonce encoding: {err}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(ChainError::Crypto(format!(
                "invalid nonce length: expected {NONCE_LEN}, found {}",
                nonce.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|err| ChainError::Crypto(format!("invalid ciphertext encoding: {err}")))?;
        let ephemeral = sealing_public_key_from_hex(&self.cipher.ephemeral_key)?;

        let shared = sealing_secret.diffie_hellman(&ephemeral);
        let key = derive_sealing_key(ephemeral.as_bytes(), shared.as_bytes())?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext.as_ref(),
                    aad: measurement.as_bytes(),
                },
            )
            .map_err(|_| ChainError::Crypto("sealed secret authentication failed".to_string()))?;
        Ok(Zeroizing::new(plaintext))
    }
}

fn derive_sealing_key(salt: &[u8], shared: &[u8]) -> ChainResult<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(Some(salt), shared)
        .expand(SEALING_INFO, key.as_mut())
        .map_err(|_| ChainError::Crypto("sealing key derivation failed".to_string()))?;
    Ok(key)
}

/// Seal `plaintext` to `recipient` with an ephemeral X25519 exchange. The
/// measurement rides along as associated data so a secret sealed for one
/// measurement cannot be presented as sealed for another.
pub fn seal_secret(
    recipient: &SealingPublicKey,
    measurement: &Digest32,
    plaintext: &[u8],
) -> ChainResult<SealedSecret> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = SealingPublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let key = derive_sealing_key(ephemeral_public.as_bytes(), shared.as_bytes())?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: measurement.as_bytes(),
            },
        )
        .map_err(|err| ChainError::Crypto(format!("sealing failed: {err}")))?;

    Ok(SealedSecret {
        recipient_measurement: measurement.to_hex(),
        cipher: SealingMetadata {
            algorithm: SEALING_ALGORITHM.to_string(),
            nonce: BASE64.encode(nonce),
            ephemeral_key: hex::encode(ephemeral_public.as_bytes()),
        },
        ciphertext: BASE64.encode(ciphertext),
    })
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecisionVerdict {
    Released,
    Rejected,
}

/// Immutable broker decision persisted as JSONL with hash chaining.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionRecord {
    pub index: u64,
    pub timestamp_ms: u64,
    pub claim_fingerprint: String,
    pub measurement: String,
    pub verdict: DecisionVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub prev_hash: String,
    pub entry_hash: String,
}

#[derive(Serialize)]
struct DecisionRecordDigest<'a> {
    index: u64,
    timestamp_ms: u64,
    claim_fingerprint: &'a str,
    measurement: &'a str,
    verdict: &'a DecisionVerdict,
    reason: Option<&'a str>,
    prev_hash: &'a str,
}

struct DecisionState {
    next_index: u64,
    prev_hash: Digest32,
}

/// Append-only decision log. Every verdict extends the hash chain, so a
/// removed or altered entry breaks verification.
pub struct DecisionLog {
    path: PathBuf,
    state: Mutex<DecisionState>,
}

impl DecisionLog {
    /// Open (or create) a log at `path`, verifying any existing chain.
    pub fn open(path: impl Into<PathBuf>) -> ChainResult<Self> {
        let path = path.into();
        let state = Self::load_state(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &self,
        claim: &AttestationClaim,
        verdict: DecisionVerdict,
        reason: Option<String>,
    ) -> ChainResult<DecisionRecord> {
        let mut guard = self.state.lock();
        let index = guard.next_index;
        let prev_hash = guard.prev_hash.to_hex();
        let timestamp_ms = now_ms();
        let claim_fingerprint = claim.fingerprint().to_hex();
        let measurement = claim.measurement.to_hex();
        let digest = DecisionRecordDigest {
            index,
            timestamp_ms,
            claim_fingerprint: &claim_fingerprint,
            measurement: &measurement,
            verdict: &verdict,
            reason: reason.as_deref(),
            prev_hash: &prev_hash,
        };
        let entry_hash = hash_decision(&digest)?;
        let record = DecisionRecord {
            index,
            timestamp_ms,
            claim_fingerprint,
            measurement,
            verdict,
            reason,
            prev_hash,
            entry_hash: entry_hash.to_hex(),
        };

        persist(&self.path, &record)?;

        guard.prev_hash = entry_hash;
        guard.next_index = guard.next_index.saturating_add(1);
        Ok(record)
    }

    /// Validate the full chain for the log at `path`. A missing file is an
    /// empty, valid log.
    pub fn verify_chain(path: impl AsRef<Path>) -> ChainResult<()> {
        let mut prev_hash = Digest32::ZERO;
        let reader = match File::open(path.as_ref()) {
            Ok(file) => BufReader::new(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for line in reader.lines() {
            let line = line?;
            let entry: DecisionRecord = serde_json::from_str(&line)?;
            let expected_prev = prev_hash.to_hex();
            if entry.prev_hash != expected_prev {
                return Err(ChainError::Crypto(format!(
                    "decision chain mismatch at {}: expected prev_hash {} but found {}",
                    entry.index, expected_prev, entry.prev_hash
                )));
            }
            let digest = DecisionRecordDigest {
                index: entry.index,
                timestamp_ms: entry.timestamp_ms,
                claim_fingerprint: &entry.claim_fingerprint,
                measurement: &entry.measurement,
                verdict: &entry.verdict,
                reason: entry.reason.as_deref(),
                prev_hash: &entry.prev_hash,
            };
            let hash = hash_decision(&digest)?;
            if entry.entry_hash != hash.to_hex() {
                return Err(ChainError::Crypto(format!(
                    "decision chain mismatch at {}: expected entry_hash {} but found {}",
                    entry.index,
                    hash.to_hex(),
                    entry.entry_hash
                )));
            }
            prev_hash = hash;
        }

        Ok(())
    }

    /// All records in the log at `path`, oldest first.
    pub fn load_records(path: impl AsRef<Path>) -> ChainResult<Vec<DecisionRecord>> {
        let reader = match File::open(path.as_ref()) {
            Ok(file) => BufReader::new(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn load_state(path: &Path) -> ChainResult<DecisionState> {
        if !path.exists() {
            return Ok(DecisionState {
                next_index: 0,
                prev_hash: Digest32::ZERO,
            });
        }

        Self::verify_chain(path)?;

        let records = Self::load_records(path)?;
        match records.last() {
            Some(last) => Ok(DecisionState {
                next_index: last.index.saturating_add(1),
                prev_hash: Digest32::from_hex(&last.entry_hash).unwrap_or(Digest32::ZERO),
            }),
            None => Ok(DecisionState {
                next_index: 0,
                prev_hash: Digest32::ZERO,
            }),
        }
    }
}

fn persist(path: &Path, record: &DecisionRecord) -> ChainResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec(record)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&json)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn hash_decision(digest: &DecisionRecordDigest<'_>) -> ChainResult<Digest32> {
    Ok(Digest32::of(&serde_json::to_vec(digest)?))
}

/// Claim fingerprints that were rejected and later released. A healthy log
/// never contains one: a claim that failed policy should keep failing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionAnomaly {
    pub claim_fingerprint: String,
    pub rejected_index: u64,
    pub accepted_index: u64,
}

pub fn find_decision_anomalies(records: &[DecisionRecord]) -> Vec<DecisionAnomaly> {
    let mut last_rejection: HashMap<&str, u64> = HashMap::new();
    let mut anomalies = Vec::new();
    for record in records {
        match record.verdict {
            DecisionVerdict::Rejected => {
                last_rejection.insert(record.claim_fingerprint.as_str(), record.index);
            }
            DecisionVerdict::Released => {
                if let Some(&rejected_index) = last_rejection.get(record.claim_fingerprint.as_str())
                {
                    anomalies.push(DecisionAnomaly {
                        claim_fingerprint: record.claim_fingerprint.clone(),
                        rejected_index,
                        accepted_index: record.index,
                    });
                }
            }
        }
    }
    anomalies
}

/// Broker holding one secret and the policy governing its release.
pub struct SecretBroker {
    policy: BrokerPolicy,
    authority_key: VerifyingKey,
    secret: Zeroizing<Vec<u8>>,
    decisions: DecisionLog,
}

impl SecretBroker {
    pub fn new(
        policy: BrokerPolicy,
        secret: Zeroizing<Vec<u8>>,
        decisions: DecisionLog,
    ) -> ChainResult<Self> {
        let authority_key = public_key_from_hex(&policy.authority_key)?;
        Ok(Self {
            policy,
            authority_key,
            secret,
            decisions,
        })
    }

    pub fn decisions(&self) -> &DecisionLog {
        &self.decisions
    }

    /// Evaluate `claim` and, if the policy admits it, return the secret
    /// sealed to the claim's sealing key. Every verdict lands in the
    /// decision log before this returns.
    pub fn request_secret(&self, claim: &AttestationClaim) -> ChainResult<SealedSecret> {
        match self.evaluate(claim) {
            Err(reason) => {
                warn!(
                    fingerprint = %claim.fingerprint(),
                    %reason,
                    "attestation claim rejected"
                );
                self.decisions
                    .append(claim, DecisionVerdict::Rejected, Some(reason.clone()))?;
                Err(ChainError::AttestationRejected(reason))
            }
            Ok(sealing_key) => {
                let sealed = seal_secret(&sealing_key, &claim.measurement, &self.secret)?;
                self.decisions
                    .append(claim, DecisionVerdict::Released, None)?;
                info!(
                    fingerprint = %claim.fingerprint(),
                    measurement = %claim.measurement,
                    "secret released to attested recipient"
                );
                Ok(sealed)
            }
        }
    }

    fn evaluate(&self, claim: &AttestationClaim) -> Result<SealingPublicKey, String> {
        let signature = signature_from_hex(&claim.signature)
            .map_err(|_| "malformed claim signature".to_string())?;
        if verify_signature(&self.authority_key, &claim.signing_message(), &signature).is_err() {
            return Err("claim signature does not verify against the attestation authority".into());
        }
        if !self.policy.allows(&claim.measurement) {
            return Err(format!(
                "measurement {} is not allowlisted",
                claim.measurement
            ));
        }
        let age_ms = now_ms().abs_diff(claim.issued_at_ms);
        if age_ms > self.policy.nonce_window_ms {
            return Err(format!(
                "claim is outside the freshness window ({age_ms}ms from issue)"
            ));
        }
        sealing_public_key_from_hex(&claim.sealing_key)
            .map_err(|_| "malformed sealing key".to_string())
    }
}
