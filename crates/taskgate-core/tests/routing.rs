use proptest::prelude::*;
use serde_json::json;

use taskgate_core::artifacts::{ArtifactWriter, TimestampMode};
use taskgate_core::router::EliminationFilter;
use taskgate_core::{
    build_route_plan, validate, AvailabilityConfig, CostTier, PlanStatus, RefusalCode, TaskPacket,
};

const TAGS: &[&str] = &["architecture", "code_edit", "docs", "refactor", "tests"];

fn packet_with(steps: &[(String, Vec<&str>)]) -> TaskPacket {
    let steps: Vec<_> = steps
        .iter()
        .map(|(id, requires)| json!({"step_id": id, "requires": requires}))
        .collect();
    validate(&json!({
        "id": "prop",
        "mode": "auto",
        "steps": steps,
        "allowlist": ["src/**"]
    }))
    .unwrap()
}

fn step_requirements() -> impl Strategy<Value = Vec<Vec<&'static str>>> {
    prop::collection::vec(prop::sample::subsequence(TAGS.to_vec(), 1..=3), 1..6)
}

fn numbered(requirements: Vec<Vec<&'static str>>) -> Vec<(String, Vec<&'static str>)> {
    requirements
        .into_iter()
        .enumerate()
        .map(|(i, r)| (format!("s{i}"), r))
        .collect()
}

fn cost_tier() -> impl Strategy<Value = CostTier> {
    prop_oneof![
        Just(CostTier::Low),
        Just(CostTier::Medium),
        Just(CostTier::High)
    ]
}

const SCENARIO: &str = r#"
runners:
  R1: { available: true, capabilities: [code_edit] }
models:
  M1: { capabilities: [code_edit], cost_tier: low, context: small }
  M2: { capabilities: [code_edit], cost_tier: high, context: large }
policy:
  max_cost_tier: medium
  min_total_score: 50
  stop_on_ambiguity: true
  escalation_ladder: [M2, M1]
"#;

#[test]
fn scenario_selects_cheap_model_and_excludes_expensive_one() {
    let availability = AvailabilityConfig::parse(SCENARIO, false).unwrap();
    let packet = packet_with(&[("edit".to_string(), vec!["code_edit"])]);
    let plan = build_route_plan(&packet, &availability);

    assert_eq!(plan.status, PlanStatus::Planned);
    let step = &plan.steps[0];
    let selected = step.selected_candidate.as_ref().unwrap();
    assert_eq!((selected.runner.as_str(), selected.model.as_str()), ("R1", "M1"));
    assert!(selected.total_score >= 50);
    assert!(step
        .eliminated
        .iter()
        .any(|e| e.model == "M2" && e.filter == EliminationFilter::CostTierExceeded));
}

#[test]
fn scenario_refuses_when_cheap_model_scores_too_low() {
    let availability =
        AvailabilityConfig::parse(&SCENARIO.replace("min_total_score: 50", "min_total_score: 100"), false)
            .unwrap();
    let packet = packet_with(&[("edit".to_string(), vec!["code_edit"])]);
    let plan = build_route_plan(&packet, &availability);

    assert_eq!(plan.status, PlanStatus::Refused);
    assert_eq!(plan.steps[0].refusal_code, Some(RefusalCode::BelowMinTotalScore));
    assert!(plan.steps[0].reasons[0].contains("no candidate meets min_total_score"));
}

#[test]
fn identical_inputs_write_byte_identical_route_plans() {
    let availability = AvailabilityConfig::default_template();
    let packet = packet_with(&[
        ("b".to_string(), vec!["code_edit", "tests"]),
        ("a".to_string(), vec!["docs"]),
    ]);

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), TimestampMode::Deterministic);
        let written = writer.write(&build_route_plan(&packet, &availability)).unwrap();
        outputs.push((
            std::fs::read(&written.json_path).unwrap(),
            std::fs::read(&written.markdown_path).unwrap(),
            written.content_hash,
        ));
    }
    assert_eq!(outputs[0], outputs[1]);
}

proptest! {
    #[test]
    fn step_order_matches_declared_order(
        ids in prop::collection::btree_set(0u16..500, 1..6)
            .prop_map(|ids| ids.into_iter().collect::<Vec<_>>())
            .prop_shuffle()
    ) {
        let steps: Vec<(String, Vec<&str>)> = ids
            .iter()
            .map(|n| (format!("step-{n}"), vec!["code_edit"]))
            .collect();
        let packet = packet_with(&steps);
        let plan = build_route_plan(&packet, &AvailabilityConfig::default_template());

        let planned: Vec<&str> = plan.steps.iter().map(|s| s.step_id.as_str()).collect();
        let declared: Vec<&str> = packet.steps.iter().map(|s| s.step_id.as_str()).collect();
        prop_assert_eq!(planned, declared);
    }

    #[test]
    fn raising_min_score_never_plans_more_steps(
        requirements in step_requirements(),
        low in 0u32..=100,
        bump in 0u32..=100,
    ) {
        let high = (low + bump).min(100);
        let packet = packet_with(&numbered(requirements));

        let mut lenient = AvailabilityConfig::default_template();
        lenient.policy.min_total_score = low;
        let mut strict = lenient.clone();
        strict.policy.min_total_score = high;

        let lenient_plan = build_route_plan(&packet, &lenient);
        let strict_plan = build_route_plan(&packet, &strict);
        let lenient_ids = lenient_plan.planned_step_ids();
        let strict_ids = strict_plan.planned_step_ids();
        prop_assert!(strict_ids.is_subset(&lenient_ids));
    }

    #[test]
    fn selected_cost_tier_never_exceeds_ceiling(
        requirements in step_requirements(),
        ceiling in cost_tier(),
        min_score in 0u32..=60,
    ) {
        let packet = packet_with(&numbered(requirements));
        let mut availability = AvailabilityConfig::default_template();
        availability.policy.max_cost_tier = ceiling;
        availability.policy.min_total_score = min_score;

        let plan = build_route_plan(&packet, &availability);
        for step in &plan.steps {
            for candidate in &step.ranked_candidates {
                prop_assert!(candidate.cost_tier <= ceiling);
            }
            if let Some(selected) = &step.selected_candidate {
                prop_assert!(selected.cost_tier <= ceiling);
            }
        }
    }

    #[test]
    fn plan_status_is_all_or_nothing(
        requirements in step_requirements(),
        min_score in 0u32..=100,
        stop_on_ambiguity in any::<bool>(),
    ) {
        let packet = packet_with(&numbered(requirements));
        let mut availability = AvailabilityConfig::default_template();
        availability.policy.min_total_score = min_score;
        availability.policy.stop_on_ambiguity = stop_on_ambiguity;

        let plan = build_route_plan(&packet, &availability);
        let refused = plan.refused_steps().count();
        prop_assert_eq!(plan.status == PlanStatus::Planned, refused == 0);
        prop_assert_eq!(plan.steps.len(), packet.steps.len());
        for step in &plan.steps {
            prop_assert_eq!(step.selected_candidate.is_some(), step.is_planned());
            prop_assert!(!step.reasons.is_empty());
        }
    }
}
