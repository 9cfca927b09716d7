//! Manual-mode handoff chunks.
//!
//! When a packet asks for manual execution the kernel still plans, then
//! hands each planned step to an operator as a self-contained block.
//! Chunks are a pure function of the plan and never carry timestamps.

use serde::Serialize;

use crate::router::RoutePlan;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandoffChunk {
    pub step_id: String,
    pub runner: String,
    pub model: String,
    pub instructions: String,
    pub expected_artifacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandoffPlan {
    pub packet_id: String,
    pub chunks: Vec<HandoffChunk>,
}

impl HandoffPlan {
    /// Build one chunk per planned step, in step order.
    pub fn build(plan: &RoutePlan) -> Self {
        let chunks = plan
            .steps
            .iter()
            .filter_map(|step| {
                let selected = step.selected_candidate.as_ref()?;
                let sentinel = sentinel_name(&step.step_id);
                let instructions = [
                    format!("Runner: {}", selected.runner),
                    format!("Model: {}", selected.model),
                    format!("Packet: {}", plan.packet_id),
                    format!("Requires: {}", step.required_tags.join(", ")),
                    format!("After completion: create {sentinel} in the run directory"),
                ]
                .join("\n");
                Some(HandoffChunk {
                    step_id: step.step_id.clone(),
                    runner: selected.runner.clone(),
                    model: selected.model.clone(),
                    instructions,
                    expected_artifacts: vec![sentinel],
                })
            })
            .collect();

        Self {
            packet_id: plan.packet_id.clone(),
            chunks,
        }
    }

    /// Plain-text rendering for an operator terminal.
    pub fn render_text(&self) -> String {
        let total = self.chunks.len();
        self.chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                format!(
                    "HANDOFF CHUNK {}/{} ({})\n{}",
                    i + 1,
                    total,
                    chunk.step_id,
                    chunk.instructions
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// `STEP_<ID>.DONE` with the id upper-cased and non-alphanumerics collapsed.
pub fn sentinel_name(step_id: &str) -> String {
    let mut token = String::new();
    let mut pending_sep = false;
    for c in step_id.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !token.is_empty() {
                token.push('_');
            }
            pending_sep = false;
            token.push(c.to_ascii_uppercase());
        } else {
            pending_sep = true;
        }
    }
    if token.is_empty() {
        token.push_str("STEP");
    }
    format!("STEP_{token}.DONE")
}
