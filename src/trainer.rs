//! Synthetic Adam trainer.
//!
//! Drives a deterministic optimizer over a random objective so the proving
//! pipeline has realistic step witnesses to chew on. State lives in floats;
//! the witness carries the pre-step state quantized to fixed point at
//! [`QUANT_SCALE`], which is the representation the circuit works in.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::backend::StepWitness;
use crate::crypto::{domain_hash, Digest32};
use crate::types::{hyper_commitment, StepPublicInputs};

/// Fixed-point scale for quantized vectors: three decimal places.
pub const QUANT_SCALE: i64 = 1_000;

const VECTOR_DOMAIN: &[u8] = b"stepchain.vector-commitment";

/// Optimizer hyper-parameters in the integral units the circuit consumes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HyperParams {
    #[serde(default = "default_learning_rate_micros")]
    pub learning_rate_micros: i64,
    #[serde(default = "default_beta1_micros")]
    pub beta1_micros: i64,
    #[serde(default = "default_beta2_micros")]
    pub beta2_micros: i64,
    #[serde(default = "default_epsilon_nanos")]
    pub epsilon_nanos: i64,
}

fn default_learning_rate_micros() -> i64 {
    1_000
}

fn default_beta1_micros() -> i64 {
    900_000
}

fn default_beta2_micros() -> i64 {
    999_000
}

fn default_epsilon_nanos() -> i64 {
    10
}

impl Default for HyperParams {
    fn default() -> Self {
        HyperParams {
            learning_rate_micros: default_learning_rate_micros(),
            beta1_micros: default_beta1_micros(),
            beta2_micros: default_beta2_micros(),
            epsilon_nanos: default_epsilon_nanos(),
        }
    }
}

impl HyperParams {
    pub fn commitment(&self) -> Digest32 {
        hyper_commitment(
            self.learning_rate_micros,
            self.beta1_micros,
            self.beta2_micros,
            self.epsilon_nanos,
        )
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate_micros as f64 / 1e6
    }

    fn beta1(&self) -> f64 {
        self.beta1_micros as f64 / 1e6
    }

    fn beta2(&self) -> f64 {
        self.beta2_micros as f64 / 1e6
    }

    fn epsilon(&self) -> f64 {
        self.epsilon_nanos as f64 / 1e9
    }
}

/// Commitment over a quantized vector, little-endian element bytes in order.
pub fn commit_vector(values: &[i64]) -> Digest32 {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    domain_hash(VECTOR_DOMAIN, &bytes)
}

pub struct SyntheticTrainer {
    weights: Vec<f64>,
    first_moments: Vec<f64>,
    second_moments: Vec<f64>,
    completed_steps: u64,
    rng: StdRng,
    hyper: HyperParams,
}

impl SyntheticTrainer {
    /// Seeded construction; the same seed replays the same run exactly.
    pub fn new(dimension: usize, seed: u64, hyper: HyperParams) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = (0..dimension).map(|_| rng.gen_range(-1.0..1.0)).collect();
        SyntheticTrainer {
            weights,
            first_moments: vec![0.0; dimension],
            second_moments: vec![0.0; dimension],
            completed_steps: 0,
            rng,
            hyper,
        }
    }

    pub fn dimension(&self) -> usize {
        self.weights.len()
    }

    pub fn completed_steps(&self) -> u64 {
        self.completed_steps
    }

    pub fn hyper(&self) -> HyperParams {
        self.hyper
    }

    /// Run one optimizer step. The returned witness captures the state as
    /// it was when the step began, together with the gradients applied; the
    /// trainer's own state advances past it.
    pub fn next_witness(&mut self) -> StepWitness {
        let gradients: Vec<f64> = (0..self.weights.len())
            .map(|_| self.rng.gen_range(-1.0..1.0))
            .collect();
        let t = self.completed_steps + 1;

        let witness = StepWitness {
            weights: quantize_vec(&self.weights),
            gradients: quantize_vec(&gradients),
            first_moments: quantize_vec(&self.first_moments),
            second_moments: quantize_vec(&self.second_moments),
            learning_rate_micros: self.hyper.learning_rate_micros,
            beta1_micros: self.hyper.beta1_micros,
            beta2_micros: self.hyper.beta2_micros,
            epsilon_nanos: self.hyper.epsilon_nanos,
            step: t,
            chunk_index: 0,
            chunk_count: 1,
        };

        self.apply(&gradients, t);
        self.completed_steps = t;
        witness
    }

    /// Adam with bias correction; `t` counts from 1.
    fn apply(&mut self, gradients: &[f64], t: u64) {
        let beta1 = self.hyper.beta1();
        let beta2 = self.hyper.beta2();
        let lr = self.hyper.learning_rate();
        let eps = self.hyper.epsilon();
        let bias1 = 1.0 - beta1.powi(t as i32);
        let bias2 = 1.0 - beta2.powi(t as i32);

        for i in 0..self.weights.len() {
            let g = gradients[i];
            self.first_moments[i] = beta1 * self.first_moments[i] + (1.0 - beta1) * g;
            self.second_moments[i] = beta2 * self.second_moments[i] + (1.0 - beta2) * g * g;
            let m_hat = self.first_moments[i] / bias1;
            let v_hat = self.second_moments[i] / bias2;
            self.weights[i] -= lr * m_hat / (v_hat.sqrt() + eps);
        }
    }
}

/// Public-input vector for a step witness. `witness.step` counts optimizer
/// steps from 1; the ledger indexes from 0.
pub fn public_inputs_for(witness: &StepWitness, circuit_id: Digest32) -> StepPublicInputs {
    StepPublicInputs {
        weights_commitment: commit_vector(&witness.weights),
        gradient_commitment: commit_vector(&witness.gradients),
        hyper_commitment: hyper_commitment(
            witness.learning_rate_micros,
            witness.beta1_micros,
            witness.beta2_micros,
            witness.epsilon_nanos,
        ),
        step_index: witness.step.saturating_sub(1),
        circuit_id,
    }
}

fn quantize(value: f64) -> i64 {
    (value * QUANT_SCALE as f64).round() as i64
}

fn quantize_vec(values: &[f64]) -> Vec<i64> {
    values.iter().map(|value| quantize(*value)).collect()
}
