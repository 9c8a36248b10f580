//! Boundary to the proving/verification engine.
//!
//! Everything the rest of the crate knows about proofs lives behind
//! [`ProofBackend`]: opaque byte blobs in, opaque byte blobs out, plus a
//! boolean verify. Witness and proof blobs travel inside canonical bincode
//! envelopes so a blob from one backend or circuit is never mistaken for
//! another's. Oversized step witnesses may be split into chunks, proved
//! independently and folded back into a single aggregated proof; the ledger
//! never sees the difference.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::Digest32;
use crate::errors::{ChainError, ChainResult};
use crate::types::PublicInputs;

mod ezkl;
mod mock;

pub use ezkl::EzklCliBackend;
pub use mock::MockBackend;

pub const WITNESS_FORMAT_VERSION: u16 = 1;
pub const PROOF_FORMAT_VERSION: u16 = 1;

fn canonical_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_little_endian()
}

/// Which proving engine produced or consumes an artifact.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Mock,
    EzklCli,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Mock => f.write_str("mock"),
            BackendKind::EzklCli => f.write_str("ezkl-cli"),
        }
    }
}

/// Declarative description of the circuit to set up: which optimizer step it
/// encodes, how wide the flattened parameter vectors are, and the row budget
/// handed to the proving engine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitSpec {
    pub name: String,
    pub dimension: usize,
    pub logrows: u32,
}

impl CircuitSpec {
    pub fn new(name: impl Into<String>, dimension: usize, logrows: u32) -> Self {
        Self {
            name: name.into(),
            dimension,
            logrows,
        }
    }

    pub fn circuit_id(&self) -> Digest32 {
        crate::types::circuit_id(&self.name)
    }
}

/// Backend-specific compiled form of a circuit. Inline blobs suit engines
/// that compile in-process; directory artifacts suit engines driven through
/// an external toolchain.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CircuitArtifact {
    Inline(Vec<u8>),
    Directory(PathBuf),
}

impl fmt::Debug for CircuitArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitArtifact::Inline(bytes) => write!(f, "CircuitArtifact::Inline(len={})", bytes.len()),
            CircuitArtifact::Directory(path) => {
                write!(f, "CircuitArtifact::Directory({})", path.display())
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompiledCircuit {
    pub spec: CircuitSpec,
    pub backend: BackendKind,
    pub artifact: CircuitArtifact,
}

impl CompiledCircuit {
    pub fn circuit_id(&self) -> Digest32 {
        self.spec.circuit_id()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WitnessHeader {
    pub version: u16,
    pub backend: BackendKind,
    pub circuit: String,
}

impl WitnessHeader {
    pub fn new(backend: BackendKind, circuit: impl Into<String>) -> Self {
        Self {
            version: WITNESS_FORMAT_VERSION,
            backend,
            circuit: circuit.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProofHeader {
    pub version: u16,
    pub backend: BackendKind,
    pub circuit: String,
}

impl ProofHeader {
    pub fn new(backend: BackendKind, circuit: impl Into<String>) -> Self {
        Self {
            version: PROOF_FORMAT_VERSION,
            backend,
            circuit: circuit.into(),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, H, T> {
    header: &'a H,
    payload: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeOwned<H, T> {
    header: H,
    payload: T,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessBytes(pub Vec<u8>);

impl fmt::Debug for WitnessBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WitnessBytes(len={})", self.0.len())
    }
}

impl WitnessBytes {
    pub fn encode<T: Serialize>(header: &WitnessHeader, payload: &T) -> ChainResult<Self> {
        let bytes = canonical_options().serialize(&Envelope { header, payload })?;
        Ok(Self(bytes))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> ChainResult<(WitnessHeader, T)> {
        let envelope: EnvelopeOwned<WitnessHeader, T> = canonical_options().deserialize(&self.0)?;
        Ok((envelope.header, envelope.payload))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for WitnessBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBytes(pub Vec<u8>);

impl fmt::Debug for ProofBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProofBytes(len={})", self.0.len())
    }
}

impl ProofBytes {
    pub fn encode<T: Serialize>(header: &ProofHeader, payload: &T) -> ChainResult<Self> {
        let bytes = canonical_options().serialize(&Envelope { header, payload })?;
        Ok(Self(bytes))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> ChainResult<(ProofHeader, T)> {
        let envelope: EnvelopeOwned<ProofHeader, T> = canonical_options().deserialize(&self.0)?;
        Ok((envelope.header, envelope.payload))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn digest(&self) -> Digest32 {
        Digest32::of(&self.0)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for ProofBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvingKey(pub Vec<u8>);

impl fmt::Debug for ProvingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProvingKey(len={})", self.0.len())
    }
}

impl ProvingKey {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyingKey(pub Vec<u8>);

impl fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyingKey(len={})", self.0.len())
    }
}

impl VerifyingKey {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

/// Flattened fixed-point state of one optimizer step, the payload the
/// circuit consumes. The four vectors share one length; hyper-parameters
/// ride along in micro/nano units so the encoding stays integral.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepWitness {
    pub weights: Vec<i64>,
    pub gradients: Vec<i64>,
    pub first_moments: Vec<i64>,
    pub second_moments: Vec<i64>,
    pub learning_rate_micros: i64,
    pub beta1_micros: i64,
    pub beta2_micros: i64,
    pub epsilon_nanos: i64,
    pub step: u64,
    pub chunk_index: u32,
    pub chunk_count: u32,
}

impl StepWitness {
    pub fn vector_len(&self) -> usize {
        self.weights.len()
    }

    /// Partition the vectors into `chunks` contiguous blocks. Hyper-parameter
    /// fields are replicated into every block; `chunk_index`/`chunk_count`
    /// record the block's place so chunk proofs cannot be reordered.
    pub fn split(&self, chunks: usize) -> Vec<StepWitness> {
        let len = self.vector_len();
        let chunks = chunks.clamp(1, len.max(1));
        if chunks == 1 {
            let mut whole = self.clone();
            whole.chunk_index = 0;
            whole.chunk_count = 1;
            return vec![whole];
        }

        let stride = len.div_ceil(chunks);
        let mut parts = Vec::with_capacity(chunks);
        for index in 0..chunks {
            let start = index * stride;
            let end = (start + stride).min(len);
            parts.push(StepWitness {
                weights: self.weights[start..end].to_vec(),
                gradients: self.gradients[start..end].to_vec(),
                first_moments: self.first_moments[start..end].to_vec(),
                second_moments: self.second_moments[start..end].to_vec(),
                learning_rate_micros: self.learning_rate_micros,
                beta1_micros: self.beta1_micros,
                beta2_micros: self.beta2_micros,
                epsilon_nanos: self.epsilon_nanos,
                step: self.step,
                chunk_index: index as u32,
                chunk_count: chunks as u32,
            });
        }
        parts
    }

    pub fn encode(&self, backend: BackendKind, circuit: &str) -> ChainResult<WitnessBytes> {
        WitnessBytes::encode(&WitnessHeader::new(backend, circuit), self)
    }
}

/// Capability interface to the proving engine. Implementations must be safe
/// to share across the prover and any number of parallel audit threads.
pub trait ProofBackend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// One-time translation of a circuit description into the backend's
    /// compiled form.
    fn compile(&self, spec: &CircuitSpec) -> ChainResult<CompiledCircuit>;

    /// Derive the proving/verifying key pair for a compiled circuit.
    fn keygen(&self, circuit: &CompiledCircuit) -> ChainResult<(ProvingKey, VerifyingKey)>;

    fn prove(
        &self,
        circuit: &CompiledCircuit,
        key: &ProvingKey,
        witness: &WitnessBytes,
        public_inputs: &PublicInputs,
    ) -> ChainResult<ProofBytes>;

    /// `Ok(false)` means a well-formed rejection; `Err` is reserved for
    /// operational failures (missing artifacts, tool errors).
    fn verify(
        &self,
        circuit: &CompiledCircuit,
        key: &VerifyingKey,
        proof: &ProofBytes,
        public_inputs: &PublicInputs,
    ) -> ChainResult<bool>;

    /// Fold independent chunk proofs for one step into a single proof bound
    /// to the same public inputs.
    fn aggregate(
        &self,
        circuit: &CompiledCircuit,
        key: &ProvingKey,
        proofs: &[ProofBytes],
        public_inputs: &PublicInputs,
    ) -> ChainResult<ProofBytes>;
}

impl fmt::Debug for dyn ProofBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProofBackend({})", self.kind())
    }
}

/// Prove one logical step, chunking the witness when configured. The caller
/// always receives exactly one proof blob per step.
pub fn prove_step(
    backend: &dyn ProofBackend,
    circuit: &CompiledCircuit,
    key: &ProvingKey,
    witness: &StepWitness,
    public_inputs: &PublicInputs,
    chunks: usize,
) -> ChainResult<ProofBytes> {
    let parts = witness.split(chunks);
    if parts.len() == 1 {
        let encoded = parts[0].encode(backend.kind(), &circuit.spec.name)?;
        return backend.prove(circuit, key, &encoded, public_inputs);
    }

    let mut chunk_proofs = Vec::with_capacity(parts.len());
    for part in &parts {
        let encoded = part.encode(backend.kind(), &circuit.spec.name)?;
        chunk_proofs.push(backend.prove(circuit, key, &encoded, public_inputs)?);
    }
    tracing::debug!(
        chunks = parts.len(),
        circuit = %circuit.spec.name,
        "aggregating chunk proofs"
    );
    backend.aggregate(circuit, key, &chunk_proofs, public_inputs)
}

/// Construct the configured backend.
pub fn backend_for(
    kind: BackendKind,
    binary: &std::path::Path,
    key_dir: &std::path::Path,
) -> Arc<dyn ProofBackend> {
    match kind {
        BackendKind::Mock => Arc::new(MockBackend::new()),
        BackendKind::EzklCli => Arc::new(EzklCliBackend::new(binary, key_dir)),
    }
}

pub(crate) fn wrong_backend(expected: BackendKind, found: BackendKind) -> ChainError {
    ChainError::ProofRejected(format!(
        "artifact built for backend {found}, expected {expected}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_witness(len: usize) -> StepWitness {
        StepWitness {
            weights: (0..len as i64).collect(),
            gradients: (0..len as i64).map(|v| -v).collect(),
            first_moments: vec![0; len],
            second_moments: vec![1; len],
            learning_rate_micros: 1_000,
            beta1_micros: 900_000,
            beta2_micros: 999_000,
            epsilon_nanos: 10,
            step: 4,
            chunk_index: 0,
            chunk_count: 1,
        }
    }

    #[test]
    fn witness_envelope_roundtrip() {
        let witness = sample_witness(8);
        let bytes = witness.encode(BackendKind::Mock, "adam").expect("encode");
        let (header, decoded) = bytes.decode::<StepWitness>().expect("decode");
        assert_eq!(header, WitnessHeader::new(BackendKind::Mock, "adam"));
        assert_eq!(decoded, witness);
    }

    #[test]
    fn split_covers_every_element_in_order() {
        let witness = sample_witness(10);
        let parts = witness.split(3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].chunk_count, 3);
        let rejoined: Vec<i64> = parts.iter().flat_map(|p| p.weights.clone()).collect();
        assert_eq!(rejoined, witness.weights);
        let lengths: Vec<usize> = parts.iter().map(StepWitness::vector_len).collect();
        assert_eq!(lengths, vec![4, 4, 2]);
    }

    #[test]
    fn split_clamps_degenerate_chunk_counts() {
        let witness = sample_witness(3);
        assert_eq!(witness.split(0).len(), 1);
        assert_eq!(witness.split(1).len(), 1);
        assert_eq!(witness.split(16).len(), 3);
    }

    #[test]
    fn byte_newtypes_hide_contents_in_debug() {
        let proof = ProofBytes(vec![0xAB; 48]);
        assert_eq!(format!("{proof:?}"), "ProofBytes(len=48)");
        let witness = WitnessBytes(vec![1, 2, 3]);
        assert_eq!(format!("{witness:?}"), "WitnessBytes(len=3)");
    }
}
