//! Deterministic in-process backend for tests and local runs.
//!
//! Proofs are canonical envelopes whose payload commits to the verifying
//! key, the circuit identifier, the public inputs and (for aggregates) the
//! child proof digests. Verification recomputes the commitment, so tampered
//! public inputs or proof bytes fail exactly as they would against a real
//! engine. No zero-knowledge property is provided or implied.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::{domain_hash, Digest32};
use crate::errors::ChainResult;
use crate::types::PublicInputs;

use super::{
    wrong_backend, BackendKind, CircuitArtifact, CircuitSpec, CompiledCircuit, ProofBackend,
    ProofBytes, ProofHeader, ProvingKey, VerifyingKey, WitnessBytes,
};

const VK_DOMAIN: &[u8] = b"stepchain.mock.vk";
const PROOF_DOMAIN: &[u8] = b"stepchain.mock.proof";

#[derive(Debug, Default, Clone, Copy)]
pub struct MockBackend;

impl MockBackend {
    pub fn new() -> Self {
        MockBackend
    }

    fn verifying_digest(key_bytes: &[u8]) -> Digest32 {
        domain_hash(VK_DOMAIN, key_bytes)
    }

    fn commitment(
        verifying_digest: &Digest32,
        circuit_id: &Digest32,
        public_inputs: &PublicInputs,
        children: &[Digest32],
    ) -> Digest32 {
        let mut bytes = Vec::with_capacity(64 + public_inputs.len() * 32 + children.len() * 32);
        bytes.extend_from_slice(verifying_digest.as_bytes());
        bytes.extend_from_slice(circuit_id.as_bytes());
        bytes.extend_from_slice(&public_inputs.to_bytes());
        for child in children {
            bytes.extend_from_slice(child.as_bytes());
        }
        domain_hash(PROOF_DOMAIN, &bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct MockProofPayload {
    commitment: Digest32,
    witness_digest: Digest32,
    children: Vec<Digest32>,
}

impl ProofBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn compile(&self, spec: &CircuitSpec) -> ChainResult<CompiledCircuit> {
        let artifact = serde_json::to_vec(spec)?;
        Ok(CompiledCircuit {
            spec: spec.clone(),
            backend: BackendKind::Mock,
            artifact: CircuitArtifact::Inline(artifact),
        })
    }

    fn keygen(&self, circuit: &CompiledCircuit) -> ChainResult<(ProvingKey, VerifyingKey)> {
        if circuit.backend != BackendKind::Mock {
            return Err(wrong_backend(BackendKind::Mock, circuit.backend));
        }
        let mut secret = vec![0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let verifying = Self::verifying_digest(&secret);
        Ok((ProvingKey(secret), VerifyingKey(verifying.as_bytes().to_vec())))
    }

    fn prove(
        &self,
        circuit: &CompiledCircuit,
        key: &ProvingKey,
        witness: &WitnessBytes,
        public_inputs: &PublicInputs,
    ) -> ChainResult<ProofBytes> {
        if circuit.backend != BackendKind::Mock {
            return Err(wrong_backend(BackendKind::Mock, circuit.backend));
        }
        let verifying = Self::verifying_digest(key.as_slice());
        let payload = MockProofPayload {
            commitment: Self::commitment(&verifying, &circuit.circuit_id(), public_inputs, &[]),
            witness_digest: Digest32::of(witness.as_slice()),
            children: Vec::new(),
        };
        ProofBytes::encode(
            &ProofHeader::new(BackendKind::Mock, &circuit.spec.name),
            &payload,
        )
    }

    fn verify(
        &self,
        circuit: &CompiledCircuit,
        key: &VerifyingKey,
        proof: &ProofBytes,
        public_inputs: &PublicInputs,
    ) -> ChainResult<bool> {
        if circuit.backend != BackendKind::Mock {
            return Err(wrong_backend(BackendKind::Mock, circuit.backend));
        }
        let Ok((header, payload)) = proof.decode::<MockProofPayload>() else {
            return Ok(false);
        };
        if header.backend != BackendKind::Mock || header.circuit != circuit.spec.name {
            return Ok(false);
        }
        let Ok(key_bytes) = <[u8; 32]>::try_from(key.as_slice()) else {
            return Ok(false);
        };
        let verifying = Digest32::from(key_bytes);
        let expected = Self::commitment(
            &verifying,
            &circuit.circuit_id(),
            public_inputs,
            &payload.children,
        );
        Ok(payload.commitment == expected)
    }

    fn aggregate(
        &self,
        circuit: &CompiledCircuit,
        key: &ProvingKey,
        proofs: &[ProofBytes],
        public_inputs: &PublicInputs,
    ) -> ChainResult<ProofBytes> {
        if circuit.backend != BackendKind::Mock {
            return Err(wrong_backend(BackendKind::Mock, circuit.backend));
        }
        let children: Vec<Digest32> = proofs.iter().map(ProofBytes::digest).collect();
        let verifying = Self::verifying_digest(key.as_slice());
        let payload = MockProofPayload {
            commitment: Self::commitment(
                &verifying,
                &circuit.circuit_id(),
                public_inputs,
                &children,
            ),
            witness_digest: Digest32::of(b"aggregate"),
            children,
        };
        ProofBytes::encode(
            &ProofHeader::new(BackendKind::Mock, &circuit.spec.name),
            &payload,
        )
    }
}
