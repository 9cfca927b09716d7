//! Router - scores (runner, model) candidates per step and plans or refuses.
//!
//! Planning is a pure function of the packet and the availability config.
//! Every step is evaluated in declared order and keeps its full diagnostics,
//! and the plan as a whole is `planned` only when every step resolved to
//! exactly one candidate.
//!
//! Scores are integers in `0..=100`:
//!
//! - capability: `70 * |covered ∩ required| / |required|`, where a tag is
//!   covered when both the runner and the model carry it
//! - cost fit: `10` per tier of headroom below `policy.max_cost_tier`
//! - escalation: `10 - 2 * ladder_index` for laddered models, else `0`
//!
//! The cost ceiling is a hard filter applied before scoring.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::availability::{AvailabilityConfig, CostTier, ModelSpec, Policy, RunnerSpec};
use crate::packet::{Mode, Step, TaskPacket};

const CAPABILITY_WEIGHT: u32 = 70;
const COST_FIT_PER_TIER: u32 = 10;
const ESCALATION_TOP: u32 = 10;
const ESCALATION_STEP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Planned,
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Planned,
    Refused,
}

/// Why a step was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalCode {
    NoCandidates,
    BelowMinTotalScore,
    AmbiguousTopCandidates,
    UnknownHintTarget,
}

impl RefusalCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoCandidates => "no_candidates",
            Self::BelowMinTotalScore => "below_min_total_score",
            Self::AmbiguousTopCandidates => "ambiguous_top_candidates",
            Self::UnknownHintTarget => "unknown_hint_target",
        }
    }
}

impl fmt::Display for RefusalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter that removed a (runner, model) pair from the candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EliminationFilter {
    HintMismatch,
    RunnerUnavailable,
    CapabilityMismatch,
    CostTierExceeded,
}

impl EliminationFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HintMismatch => "hint_mismatch",
            Self::RunnerUnavailable => "runner_unavailable",
            Self::CapabilityMismatch => "capability_mismatch",
            Self::CostTierExceeded => "cost_tier_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Elimination {
    pub runner: String,
    pub model: String,
    pub filter: EliminationFilter,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscores {
    pub capability: u32,
    pub cost_fit: u32,
    pub escalation: u32,
}

/// A scored (runner, model) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub runner: String,
    pub model: String,
    pub cost_tier: CostTier,
    /// Position in the escalation ladder, if laddered
    pub ladder_index: Option<usize>,
    /// Required tags this pair covers, in declared order
    pub matched_tags: Vec<String>,
    pub required_tags: usize,
    pub subscores: Subscores,
    pub total_score: u32,
}

impl Candidate {
    pub fn label(&self) -> String {
        format!("{}/{}", self.runner, self.model)
    }

    fn rank_key(&self) -> (Reverse<u32>, usize, &str, &str) {
        (
            Reverse(self.total_score),
            self.ladder_index.unwrap_or(usize::MAX),
            self.runner.as_str(),
            self.model.as_str(),
        )
    }
}

/// Routing decision for a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPlan {
    pub step_id: String,
    pub status: StepStatus,
    pub required_tags: Vec<String>,
    pub selected_candidate: Option<Candidate>,
    /// Surviving candidates, best first
    pub ranked_candidates: Vec<Candidate>,
    pub eliminated: Vec<Elimination>,
    pub refusal_code: Option<RefusalCode>,
    pub reasons: Vec<String>,
}

impl StepPlan {
    pub fn is_planned(&self) -> bool {
        self.status == StepStatus::Planned
    }
}

/// The kernel's routing decision for a whole packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePlan {
    pub packet_id: String,
    /// Content hash of the packet the plan was computed for
    pub packet_hash: String,
    pub mode: Mode,
    pub status: PlanStatus,
    /// Policy snapshot the plan was computed under
    pub policy: Policy,
    pub steps: Vec<StepPlan>,
}

impl RoutePlan {
    pub fn is_planned(&self) -> bool {
        self.status == PlanStatus::Planned
    }

    pub fn refused_steps(&self) -> impl Iterator<Item = &StepPlan> {
        self.steps.iter().filter(|s| !s.is_planned())
    }

    pub fn planned_step_ids(&self) -> BTreeSet<&str> {
        self.steps
            .iter()
            .filter(|s| s.is_planned())
            .map(|s| s.step_id.as_str())
            .collect()
    }
}

/// Router plans packets against one availability config.
pub struct Router {
    availability: AvailabilityConfig,
}

impl Router {
    pub fn new(availability: AvailabilityConfig) -> Self {
        Self { availability }
    }

    pub fn policy(&self) -> &Policy {
        &self.availability.policy
    }

    /// Build the route plan for a validated packet.
    pub fn plan(&self, packet: &TaskPacket) -> RoutePlan {
        let steps: Vec<StepPlan> = packet.steps.iter().map(|s| self.plan_step(s)).collect();
        let status = if steps.iter().all(StepPlan::is_planned) {
            PlanStatus::Planned
        } else {
            PlanStatus::Refused
        };

        tracing::info!(
            packet_id = %packet.id,
            status = ?status,
            steps = steps.len(),
            refused = steps.iter().filter(|s| !s.is_planned()).count(),
            "Route plan built"
        );

        RoutePlan {
            packet_id: packet.id.clone(),
            packet_hash: packet.content_hash(),
            mode: packet.mode,
            status,
            policy: self.availability.policy.clone(),
            steps,
        }
    }

    /// Plan a single step.
    pub fn plan_step(&self, step: &Step) -> StepPlan {
        let policy = &self.availability.policy;
        let mut plan = StepPlan {
            step_id: step.step_id.clone(),
            status: StepStatus::Refused,
            required_tags: step.requires.clone(),
            selected_candidate: None,
            ranked_candidates: Vec::new(),
            eliminated: Vec::new(),
            refusal_code: None,
            reasons: Vec::new(),
        };

        if let Some(hint) = &step.hint {
            let mut unknown = Vec::new();
            if !self.availability.runners.contains_key(&hint.runner) {
                unknown.push(format!("hinted runner '{}' is not declared", hint.runner));
            }
            if !self.availability.models.contains_key(&hint.model) {
                unknown.push(format!("hinted model '{}' is not declared", hint.model));
            }
            if !unknown.is_empty() {
                plan.refusal_code = Some(RefusalCode::UnknownHintTarget);
                plan.reasons = unknown;
                return plan;
            }
        }

        let required: BTreeSet<&str> = step.requires.iter().map(String::as_str).collect();
        let mut candidates = Vec::new();

        for (runner_name, runner) in &self.availability.runners {
            for (model_name, model) in &self.availability.models {
                match self.filter(step, &required, runner_name, runner, model_name, model) {
                    Some((filter, detail)) => plan.eliminated.push(Elimination {
                        runner: runner_name.clone(),
                        model: model_name.clone(),
                        filter,
                        detail,
                    }),
                    None => candidates.push(score(step, runner_name, runner, model_name, model, policy)),
                }
            }
        }

        candidates.sort_by(|a, b| a.rank_key().cmp(&b.rank_key()));
        plan.ranked_candidates = candidates;

        let refusal = match plan.ranked_candidates.as_slice() {
            [] => Some((
                RefusalCode::NoCandidates,
                "no candidate survived filtering".to_string(),
            )),
            [top, ..] if top.total_score < policy.min_total_score => Some((
                RefusalCode::BelowMinTotalScore,
                format!(
                    "no candidate meets min_total_score ({} scored {}, minimum is {})",
                    top.label(),
                    top.total_score,
                    policy.min_total_score
                ),
            )),
            [first, second, ..]
                if policy.stop_on_ambiguity && first.total_score == second.total_score =>
            {
                Some((
                    RefusalCode::AmbiguousTopCandidates,
                    format!(
                        "ambiguous: {} and {} tie at total_score {}",
                        first.label(),
                        second.label(),
                        first.total_score
                    ),
                ))
            }
            _ => None,
        };

        match refusal {
            Some((code, reason)) => {
                plan.refusal_code = Some(code);
                plan.reasons.push(reason);
                plan.reasons.extend(plan.eliminated.iter().map(|e| {
                    format!(
                        "eliminated {}/{} by {}: {}",
                        e.runner,
                        e.model,
                        e.filter.as_str(),
                        e.detail
                    )
                }));
                tracing::debug!(step_id = %step.step_id, code = %code, "Step refused");
            }
            None => {
                let top = plan.ranked_candidates[0].clone();
                plan.reasons.push(format!(
                    "selected {} with total_score {} (capability {}, cost_fit {}, escalation {})",
                    top.label(),
                    top.total_score,
                    top.subscores.capability,
                    top.subscores.cost_fit,
                    top.subscores.escalation
                ));
                tracing::debug!(
                    step_id = %step.step_id,
                    runner = %top.runner,
                    model = %top.model,
                    score = top.total_score,
                    "Step planned"
                );
                plan.status = StepStatus::Planned;
                plan.selected_candidate = Some(top);
            }
        }

        plan
    }

    /// First filter that eliminates the pair, checked in a fixed order.
    fn filter(
        &self,
        step: &Step,
        required: &BTreeSet<&str>,
        runner_name: &str,
        runner: &RunnerSpec,
        model_name: &str,
        model: &ModelSpec,
    ) -> Option<(EliminationFilter, String)> {
        let policy = &self.availability.policy;

        if let Some(hint) = &step.hint {
            if hint.runner != runner_name || hint.model != model_name {
                return Some((
                    EliminationFilter::HintMismatch,
                    format!("step is pinned to {}/{}", hint.runner, hint.model),
                ));
            }
        }
        if !runner.available {
            return Some((
                EliminationFilter::RunnerUnavailable,
                "runner is not available".to_string(),
            ));
        }
        if !runner.capabilities.iter().any(|c| required.contains(c.as_str())) {
            return Some((
                EliminationFilter::CapabilityMismatch,
                format!(
                    "runner carries none of the required tags [{}]",
                    step.requires.join(", ")
                ),
            ));
        }
        if model.cost_tier > policy.max_cost_tier {
            return Some((
                EliminationFilter::CostTierExceeded,
                format!(
                    "model cost tier {} exceeds max_cost_tier {}",
                    model.cost_tier, policy.max_cost_tier
                ),
            ));
        }
        None
    }
}

fn score(
    step: &Step,
    runner_name: &str,
    runner: &RunnerSpec,
    model_name: &str,
    model: &ModelSpec,
    policy: &Policy,
) -> Candidate {
    let matched_tags: Vec<String> = step
        .requires
        .iter()
        .filter(|t| runner.capabilities.contains(*t) && model.capabilities.contains(*t))
        .cloned()
        .collect();
    let required = step.requires.len() as u32;
    let capability = CAPABILITY_WEIGHT * matched_tags.len() as u32 / required.max(1);
    let cost_fit = COST_FIT_PER_TIER * (policy.max_cost_tier.rank() - model.cost_tier.rank());
    let ladder_index = policy.ladder_index(model_name);
    let escalation = ladder_index
        .map(|i| ESCALATION_TOP.saturating_sub(ESCALATION_STEP * i.min(ESCALATION_TOP as usize) as u32))
        .unwrap_or(0);

    Candidate {
        runner: runner_name.to_string(),
        model: model_name.to_string(),
        cost_tier: model.cost_tier,
        ladder_index,
        matched_tags,
        required_tags: step.requires.len(),
        subscores: Subscores {
            capability,
            cost_fit,
            escalation,
        },
        total_score: capability + cost_fit + escalation,
    }
}

/// Convenience wrapper for one-shot planning.
pub fn build_route_plan(packet: &TaskPacket, availability: &AvailabilityConfig) -> RoutePlan {
    Router::new(availability.clone()).plan(packet)
}
