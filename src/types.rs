//! Shared data model: run identifiers, public-input vectors, step records
//! and the published run manifest.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{domain_hash, Digest32};
use crate::errors::{ChainError, ChainResult};

const RUN_SEED_DOMAIN: &[u8] = b"stepchain.run-seed";
const RECORD_DOMAIN: &[u8] = b"stepchain.step-record";
const LINK_DOMAIN: &[u8] = b"stepchain.chain-link";
const HYPER_DOMAIN: &[u8] = b"stepchain.hyperparams";
const CIRCUIT_DOMAIN: &[u8] = b"stepchain.circuit-id";

/// Opaque identifier for one training run. Assigned at run start, never
/// reused; doubles as the derivation input for the run's chain seed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(value: impl Into<String>) -> Self {
        RunId(value.into())
    }

    /// Fresh identifier: millisecond timestamp plus a random suffix so two
    /// runs started in the same instant never collide.
    pub fn generate() -> Self {
        let mut suffix = [0u8; 4];
        OsRng.fill_bytes(&mut suffix);
        RunId(format!("run-{}-{}", now_ms(), hex::encode(suffix)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Chain seed used as `prev_link` of step 0. Derived, not stored, so any
    /// verifier can recompute it from the run id alone.
    pub fn seed(&self) -> Digest32 {
        domain_hash(RUN_SEED_DOMAIN, self.0.as_bytes())
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunId({})", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        RunId(value.to_string())
    }
}

/// One field-element-sized value. Stored big-endian in 32 bytes, hex-encoded
/// in every serialized form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldElement(pub [u8; 32]);

impl FieldElement {
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        FieldElement(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> ChainResult<Self> {
        let bytes = hex::decode(value)
            .map_err(|err| ChainError::Crypto(format!("invalid field element encoding: {err}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            ChainError::Crypto("field element must encode exactly 32 bytes".to_string())
        })?;
        Ok(FieldElement(bytes))
    }
}

impl fmt::Debug for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldElement({})", self.to_hex())
    }
}

impl From<Digest32> for FieldElement {
    fn from(value: Digest32) -> Self {
        FieldElement(value.0)
    }
}

impl Serialize for FieldElement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FieldElement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FieldElement::from_hex(&raw).map_err(D::Error::custom)
    }
}

/// Ordered public-input vector for one step. The byte encoding is the plain
/// concatenation of the elements in order; digests over it therefore commit
/// to both the values and their positions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicInputs(Vec<FieldElement>);

impl PublicInputs {
    pub fn new(elements: Vec<FieldElement>) -> Self {
        PublicInputs(elements)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn elements(&self) -> &[FieldElement] {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() * 32);
        for element in &self.0 {
            bytes.extend_from_slice(element.as_bytes());
        }
        bytes
    }
}

/// Typed layout of the per-step public inputs, in the order they appear in
/// the vector: weights commitment, gradient commitment, hyper-parameter
/// commitment, step index, circuit identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepPublicInputs {
    pub weights_commitment: Digest32,
    pub gradient_commitment: Digest32,
    pub hyper_commitment: Digest32,
    pub step_index: u64,
    pub circuit_id: Digest32,
}

impl StepPublicInputs {
    pub fn to_vector(&self) -> PublicInputs {
        PublicInputs::new(vec![
            FieldElement::from(self.weights_commitment),
            FieldElement::from(self.gradient_commitment),
            FieldElement::from(self.hyper_commitment),
            FieldElement::from_u64(self.step_index),
            FieldElement::from(self.circuit_id),
        ])
    }
}

/// Commitment to the fixed-point hyper-parameters of one step.
pub fn hyper_commitment(
    learning_rate_micros: i64,
    beta1_micros: i64,
    beta2_micros: i64,
    epsilon_nanos: i64,
) -> Digest32 {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(&learning_rate_micros.to_le_bytes());
    bytes.extend_from_slice(&beta1_micros.to_le_bytes());
    bytes.extend_from_slice(&beta2_micros.to_le_bytes());
    bytes.extend_from_slice(&epsilon_nanos.to_le_bytes());
    domain_hash(HYPER_DOMAIN, &bytes)
}

/// Stable identifier for a circuit name, carried in the public inputs so a
/// proof cannot be replayed against a different circuit.
pub fn circuit_id(name: &str) -> Digest32 {
    domain_hash(CIRCUIT_DOMAIN, name.as_bytes())
}

/// One ledger entry. Immutable once appended; `record_digest` is the Merkle
/// leaf and `prev_link` chains the record to its predecessor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: u64,
    pub public_inputs: PublicInputs,
    pub proof_hash: Digest32,
    pub prev_link: Digest32,
    pub record_digest: Digest32,
}

impl StepRecord {
    pub fn build(
        step_index: u64,
        public_inputs: PublicInputs,
        proof_hash: Digest32,
        prev_link: Digest32,
    ) -> Self {
        let record_digest = compute_record_digest(step_index, &public_inputs, &proof_hash, &prev_link);
        StepRecord {
            step_index,
            public_inputs,
            proof_hash,
            prev_link,
            record_digest,
        }
    }

    /// Digest the successor's `prev_link` must equal. Deliberately excludes
    /// the step index: the chain binds contents, the ledger binds order.
    pub fn link_digest(&self) -> Digest32 {
        let mut bytes = Vec::with_capacity(64 + self.public_inputs.len() * 32);
        bytes.extend_from_slice(self.proof_hash.as_bytes());
        bytes.extend_from_slice(&self.public_inputs.to_bytes());
        bytes.extend_from_slice(self.prev_link.as_bytes());
        domain_hash(LINK_DOMAIN, &bytes)
    }

    /// True when the stored `record_digest` matches a recomputation over the
    /// other four fields.
    pub fn digest_consistent(&self) -> bool {
        compute_record_digest(
            self.step_index,
            &self.public_inputs,
            &self.proof_hash,
            &self.prev_link,
        ) == self.record_digest
    }
}

pub fn compute_record_digest(
    step_index: u64,
    public_inputs: &PublicInputs,
    proof_hash: &Digest32,
    prev_link: &Digest32,
) -> Digest32 {
    let mut bytes = Vec::with_capacity(72 + public_inputs.len() * 32);
    bytes.extend_from_slice(&step_index.to_le_bytes());
    bytes.extend_from_slice(&public_inputs.to_bytes());
    bytes.extend_from_slice(proof_hash.as_bytes());
    bytes.extend_from_slice(prev_link.as_bytes());
    domain_hash(RECORD_DOMAIN, &bytes)
}

/// Anchor fields replicated into the manifest after a successful anchor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorStamp {
    pub counter: u64,
    pub accepted_at_ms: u64,
}

/// Published per-run manifest, written next to the step log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub num_steps: u64,
    pub merkle_root: Digest32,
    pub created_at_ms: u64,
    pub steps_file: String,
    pub proofs_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorStamp>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inputs() -> PublicInputs {
        StepPublicInputs {
            weights_commitment: Digest32::of(b"weights"),
            gradient_commitment: Digest32::of(b"gradients"),
            hyper_commitment: hyper_commitment(1_000, 900_000, 999_000, 10),
            step_index: 3,
            circuit_id: circuit_id("adam"),
        }
        .to_vector()
    }

    #[test]
    fn record_digest_covers_every_field() {
        let seed = RunId::new("run-a").seed();
        let record = StepRecord::build(3, sample_inputs(), Digest32::of(b"proof"), seed);
        assert!(record.digest_consistent());

        let mut tampered = record.clone();
        tampered.proof_hash = Digest32::of(b"other proof");
        assert!(!tampered.digest_consistent());

        let mut reordered = record;
        reordered.step_index = 4;
        assert!(!reordered.digest_consistent());
    }

    #[test]
    fn link_digest_ignores_step_index_but_binds_contents() {
        let seed = RunId::new("run-a").seed();
        let record = StepRecord::build(3, sample_inputs(), Digest32::of(b"proof"), seed);
        let mut renumbered = record.clone();
        renumbered.step_index = 7;
        assert_eq!(record.link_digest(), renumbered.link_digest());

        let mut tampered = record.clone();
        tampered.proof_hash = Digest32::of(b"forged");
        assert_ne!(record.link_digest(), tampered.link_digest());
    }

    #[test]
    fn run_seed_is_stable_per_run_id() {
        assert_eq!(RunId::new("run-a").seed(), RunId::new("run-a").seed());
        assert_ne!(RunId::new("run-a").seed(), RunId::new("run-b").seed());
    }

    #[test]
    fn generated_run_ids_are_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
    }

    #[test]
    fn step_record_serializes_digests_as_hex() {
        let seed = RunId::new("run-a").seed();
        let record = StepRecord::build(0, sample_inputs(), Digest32::of(b"proof"), seed);
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["step_index"], 0);
        assert_eq!(
            json["proof_hash"].as_str().expect("hex string"),
            Digest32::of(b"proof").to_hex()
        );
        let parsed: StepRecord = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, record);
    }

    #[test]
    fn field_element_u64_uses_big_endian_tail() {
        let element = FieldElement::from_u64(0x0102);
        assert_eq!(element.as_bytes()[30], 0x01);
        assert_eq!(element.as_bytes()[31], 0x02);
        assert_eq!(&element.as_bytes()[..24], &[0u8; 24]);
    }
}
