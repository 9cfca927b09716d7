//! Promotion gate - issues a state-bound token only when compliance passed.
//!
//! The token is not a secret. It is a SHA-256 derivation of the run id and
//! the run-state hash, so anyone holding the artifacts can recompute it, and
//! any change to the route plan or compliance report yields a different one.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifacts::sha256_hex;
use crate::compliance::ComplianceReport;

const RUN_STATE_DOMAIN: &str = "taskgate/run-state/v1";
const PROMOTION_DOMAIN: &str = "taskgate/promotion/v1";

/// Bind the route plan and compliance report of a run into one hash.
pub fn run_state_hash(route_plan_hash: &str, compliance_report_hash: &str) -> String {
    sha256_hex(format!("{RUN_STATE_DOMAIN}\n{route_plan_hash}\n{compliance_report_hash}").as_bytes())
}

pub fn derive_token(run_id: &str, run_state_hash: &str) -> String {
    sha256_hex(format!("{PROMOTION_DOMAIN}\n{run_id}\n{run_state_hash}").as_bytes())
}

pub fn verify_token(token: &str, run_id: &str, run_state_hash: &str) -> bool {
    derive_token(run_id, run_state_hash) == token
}

/// Proof that a run's changes passed compliance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionToken {
    pub run_id: String,
    pub run_state_hash: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("promotion denied for {run_id}: {reason}")]
pub struct PromotionDenied {
    pub run_id: String,
    pub reason: String,
    pub unauthorized_paths: Vec<String>,
}

/// Issue a token iff the compliance report passed.
pub fn promote(
    compliance: &ComplianceReport,
    run_state_hash: &str,
) -> Result<PromotionToken, PromotionDenied> {
    if !compliance.passed() {
        let denied = PromotionDenied {
            run_id: compliance.run_id.clone(),
            reason: format!(
                "{} unauthorized path(s): {}",
                compliance.unauthorized_paths.len(),
                compliance.unauthorized_paths.join(", ")
            ),
            unauthorized_paths: compliance.unauthorized_paths.clone(),
        };
        tracing::warn!(run_id = %denied.run_id, reason = %denied.reason, "Promotion denied");
        return Err(denied);
    }

    let token = derive_token(&compliance.run_id, run_state_hash);
    tracing::info!(run_id = %compliance.run_id, "Promotion token issued");
    Ok(PromotionToken {
        run_id: compliance.run_id.clone(),
        run_state_hash: run_state_hash.to_string(),
        token,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionStatus {
    Promoted,
    Denied,
}

/// Promotion artifact: either a token or a denial, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionResult {
    pub run_id: String,
    pub status: PromotionStatus,
    pub token: Option<String>,
    pub denial_reason: Option<String>,
    pub unauthorized_paths: Vec<String>,
    pub run_state_hash: String,
}

impl PromotionResult {
    pub fn from_outcome(
        outcome: &Result<PromotionToken, PromotionDenied>,
        run_state_hash: &str,
    ) -> Self {
        match outcome {
            Ok(token) => Self {
                run_id: token.run_id.clone(),
                status: PromotionStatus::Promoted,
                token: Some(token.token.clone()),
                denial_reason: None,
                unauthorized_paths: Vec::new(),
                run_state_hash: run_state_hash.to_string(),
            },
            Err(denied) => Self {
                run_id: denied.run_id.clone(),
                status: PromotionStatus::Denied,
                token: None,
                denial_reason: Some(denied.reason.clone()),
                unauthorized_paths: denied.unauthorized_paths.clone(),
                run_state_hash: run_state_hash.to_string(),
            },
        }
    }

    pub fn is_promoted(&self) -> bool {
        self.status == PromotionStatus::Promoted
    }

    /// Recompute the token from the recorded run state.
    pub fn verify(&self) -> bool {
        match &self.token {
            Some(token) => verify_token(token, &self.run_id, &self.run_state_hash),
            None => false,
        }
    }
}
