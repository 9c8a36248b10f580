//! HTTP anchor authority client.
//!
//! Protocol:
//!   GET  /runs/{run_id}/counter            -> 200 {"counter": n}
//!   POST /runs/{run_id}/anchors            -> 201 accepted
//!                                             200 already accepted
//!                                             409 {"current": n} conflict
//!   GET  /runs/{run_id}/anchors/{counter}  -> 200 anchor | 404
//!
//! Everything that is not one of these statuses, including connection
//! failures, maps to [`ChainError::Transport`] so callers can retry.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::RunId;

use super::{validate_submission, AnchorAuthority, AnchorRecord, AnchorSubmission, PutOutcome};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize)]
struct CounterResponse {
    counter: u64,
}

#[derive(Serialize, Deserialize)]
struct ConflictResponse {
    current: u64,
}

pub struct RemoteAuthority {
    base_url: String,
    verifies_inline: bool,
    client: Client,
}

impl RemoteAuthority {
    /// `verifies_inline` mirrors the deployment: a gateway fronting a
    /// hardware-backed verifier checks proofs itself, a plain registry does
    /// not.
    pub fn new(base_url: impl Into<String>, verifies_inline: bool) -> ChainResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(to_transport)?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(RemoteAuthority {
            base_url,
            verifies_inline,
            client,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/{}", self.base_url, suffix)
    }
}

fn to_transport(err: reqwest::Error) -> ChainError {
    ChainError::Transport(err.to_string())
}

impl AnchorAuthority for RemoteAuthority {
    fn describe(&self) -> String {
        format!("remote anchor authority at {}", self.base_url)
    }

    fn verifies_inline(&self) -> bool {
        self.verifies_inline
    }

    fn current_counter(&self, run_id: &RunId) -> ChainResult<u64> {
        let response = self
            .client
            .get(self.url(&format!("runs/{run_id}/counter")))
            .send()
            .map_err(to_transport)?;
        if !response.status().is_success() {
            return Err(ChainError::Transport(format!(
                "authority returned {} for counter query",
                response.status()
            )));
        }
        let body: CounterResponse = response.json().map_err(to_transport)?;
        Ok(body.counter)
    }

    fn conditional_put(&self, submission: &AnchorSubmission) -> ChainResult<PutOutcome> {
        validate_submission(submission)?;
        let response = self
            .client
            .post(self.url(&format!("runs/{}/anchors", submission.run_id)))
            .json(submission)
            .send()
            .map_err(to_transport)?;
        match response.status() {
            StatusCode::CREATED => Ok(PutOutcome::Accepted),
            StatusCode::OK => Ok(PutOutcome::AlreadyAccepted),
            StatusCode::CONFLICT => {
                let body: ConflictResponse = response.json().map_err(to_transport)?;
                Ok(PutOutcome::Conflict {
                    current: body.current,
                })
            }
            status => Err(ChainError::Transport(format!(
                "authority returned {status} for anchor submission"
            ))),
        }
    }

    fn anchor_at(&self, run_id: &RunId, counter: u64) -> ChainResult<Option<AnchorRecord>> {
        let response = self
            .client
            .get(self.url(&format!("runs/{run_id}/anchors/{counter}")))
            .send()
            .map_err(to_transport)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().map_err(to_transport)?)),
            status => Err(ChainError::Transport(format!(
                "authority returned {status} for anchor lookup"
            ))),
        }
    }
}
