//! Refusal report - the structured, non-error decision not to proceed.

use serde::Serialize;

use crate::packet::InvalidPacket;
use crate::router::{Elimination, RefusalCode, RoutePlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalKind {
    InvalidPacket,
    RoutingRefused,
}

impl RefusalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPacket => "invalid_packet",
            Self::RoutingRefused => "routing_refused",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefusedStep {
    pub step_id: String,
    pub refusal_code: Option<RefusalCode>,
    pub reasons: Vec<String>,
    pub eliminated: Vec<Elimination>,
}

/// Why nothing was executed. Carries no execution evidence by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefusalReport {
    pub packet_id: Option<String>,
    pub reason_code: RefusalKind,
    pub message: String,
    pub invalid_packet: Option<InvalidPacket>,
    pub refused_steps: Vec<RefusedStep>,
}

impl RefusalReport {
    /// Report for a refused plan; `None` when the plan is planned.
    pub fn from_plan(plan: &RoutePlan) -> Option<Self> {
        if plan.is_planned() {
            return None;
        }
        let refused_steps: Vec<RefusedStep> = plan
            .refused_steps()
            .map(|step| RefusedStep {
                step_id: step.step_id.clone(),
                refusal_code: step.refusal_code,
                reasons: step.reasons.clone(),
                eliminated: step.eliminated.clone(),
            })
            .collect();
        let ids: Vec<&str> = refused_steps.iter().map(|s| s.step_id.as_str()).collect();
        Some(Self {
            packet_id: Some(plan.packet_id.clone()),
            reason_code: RefusalKind::RoutingRefused,
            message: format!(
                "{} of {} step(s) refused: {}",
                refused_steps.len(),
                plan.steps.len(),
                ids.join(", ")
            ),
            invalid_packet: None,
            refused_steps,
        })
    }

    pub fn invalid_packet(packet_id: Option<&str>, error: &InvalidPacket) -> Self {
        Self {
            packet_id: packet_id.map(str::to_string),
            reason_code: RefusalKind::InvalidPacket,
            message: error.to_string(),
            invalid_packet: Some(error.clone()),
            refused_steps: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::AvailabilityConfig;
    use crate::packet::validate;
    use crate::router::build_route_plan;
    use serde_json::json;

    #[test]
    fn planned_route_has_no_refusal_report() {
        let packet = validate(&json!({
            "id": "p",
            "mode": "auto",
            "steps": [{"step_id": "s", "requires": ["code_edit"]}],
            "allowlist": []
        }))
        .unwrap();
        let plan = build_route_plan(&packet, &AvailabilityConfig::default_template());
        assert!(plan.is_planned());
        assert!(RefusalReport::from_plan(&plan).is_none());
    }

    #[test]
    fn refused_route_lists_only_refused_steps() {
        let packet = validate(&json!({
            "id": "p",
            "mode": "auto",
            "steps": [
                {"step_id": "fine", "requires": ["code_edit"]},
                {"step_id": "exotic", "requires": ["fpga_synthesis"]}
            ],
            "allowlist": []
        }))
        .unwrap();
        let plan = build_route_plan(&packet, &AvailabilityConfig::default_template());
        let report = RefusalReport::from_plan(&plan).unwrap();
        assert_eq!(report.reason_code, RefusalKind::RoutingRefused);
        assert_eq!(report.refused_steps.len(), 1);
        assert_eq!(report.refused_steps[0].step_id, "exotic");
        assert_eq!(
            report.refused_steps[0].refusal_code,
            Some(RefusalCode::NoCandidates)
        );
        assert!(!report.refused_steps[0].eliminated.is_empty());
    }

    #[test]
    fn invalid_packet_report_carries_field() {
        let err = InvalidPacket::new("steps", "must not be empty");
        let report = RefusalReport::invalid_packet(Some("p"), &err);
        assert_eq!(report.invalid_packet.unwrap().field, "steps");
        assert_eq!(report.message, "steps: must not be empty");
    }
}
