//! Markdown renderings, each derived from the same structure as its JSON.

use crate::artifacts::{Artifact, ArtifactMeta};
use crate::compliance::ComplianceReport;
use crate::handoff::HandoffPlan;
use crate::promotion::PromotionResult;
use crate::refusal::RefusalReport;
use crate::router::{Candidate, RoutePlan};

fn header(title: &str, meta: &ArtifactMeta) -> Vec<String> {
    vec![
        format!("# {title}"),
        String::new(),
        format!("- kernel_version: `{}`", meta.kernel_version),
        format!("- generated_at: `{}`", meta.generated_at),
    ]
}

fn finish(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn path_list(lines: &mut Vec<String>, paths: &[String]) {
    if paths.is_empty() {
        lines.push("- (none)".to_string());
    }
    lines.extend(paths.iter().map(|p| format!("- `{p}`")));
}

fn candidate_row(rank: usize, c: &Candidate) -> String {
    format!(
        "| {} | {} | {} | {} | {} | {} | {} | {} |",
        rank,
        c.runner,
        c.model,
        c.cost_tier,
        c.subscores.capability,
        c.subscores.cost_fit,
        c.subscores.escalation,
        c.total_score
    )
}

impl Artifact for RoutePlan {
    const NAME: &'static str = "ROUTE_PLAN";

    fn render_markdown(&self, meta: &ArtifactMeta) -> String {
        let mut lines = header("Route Plan", meta);
        lines.push(format!("- packet: `{}`", self.packet_id));
        lines.push(format!("- packet hash: `{}`", self.packet_hash));
        lines.push(format!("- mode: `{}`", self.mode));
        lines.push(format!("- status: **{}**", self.status_str()));
        lines.push(format!(
            "- policy: max_cost_tier `{}`, min_total_score `{}`, stop_on_ambiguity `{}`",
            self.policy.max_cost_tier, self.policy.min_total_score, self.policy.stop_on_ambiguity
        ));

        for step in &self.steps {
            lines.push(String::new());
            lines.push(format!("## Step `{}`", step.step_id));
            lines.push(String::new());
            lines.push(format!("- requires: {}", step.required_tags.join(", ")));
            match (&step.selected_candidate, step.refusal_code) {
                (Some(selected), _) => lines.push(format!(
                    "- selected: `{}` (total_score {})",
                    selected.label(),
                    selected.total_score
                )),
                (None, Some(code)) => lines.push(format!("- refused: `{code}`")),
                (None, None) => lines.push("- refused".to_string()),
            }

            if !step.ranked_candidates.is_empty() {
                lines.push(String::new());
                lines.push(
                    "| rank | runner | model | tier | capability | cost_fit | escalation | total |"
                        .to_string(),
                );
                lines.push("|---|---|---|---|---|---|---|---|".to_string());
                lines.extend(
                    step.ranked_candidates
                        .iter()
                        .enumerate()
                        .map(|(i, c)| candidate_row(i + 1, c)),
                );
            }

            lines.push(String::new());
            lines.push("Reasons:".to_string());
            lines.extend(step.reasons.iter().map(|r| format!("- {r}")));
        }
        finish(lines)
    }
}

impl RoutePlan {
    fn status_str(&self) -> &'static str {
        if self.is_planned() {
            "planned"
        } else {
            "refused"
        }
    }
}

impl Artifact for RefusalReport {
    const NAME: &'static str = "REFUSAL_REPORT";

    fn render_markdown(&self, meta: &ArtifactMeta) -> String {
        let mut lines = header("Refusal Report", meta);
        if let Some(id) = &self.packet_id {
            lines.push(format!("- packet: `{id}`"));
        }
        lines.push(format!("- reason_code: `{}`", self.reason_code.as_str()));
        lines.push(String::new());
        lines.push(self.message.clone());

        if let Some(invalid) = &self.invalid_packet {
            lines.push(String::new());
            lines.push(format!("Invalid field `{}`: {}", invalid.field, invalid.reason));
        }

        for step in &self.refused_steps {
            lines.push(String::new());
            let code = step.refusal_code.map(|c| c.as_str()).unwrap_or("refused");
            lines.push(format!("## Step `{}` ({code})", step.step_id));
            lines.push(String::new());
            lines.extend(step.reasons.iter().map(|r| format!("- {r}")));
        }
        finish(lines)
    }
}

impl Artifact for ComplianceReport {
    const NAME: &'static str = "COMPLIANCE_REPORT";

    fn render_markdown(&self, meta: &ArtifactMeta) -> String {
        let mut lines = header("Compliance Report", meta);
        lines.push(format!("- run: `{}`", self.run_id));
        lines.push(format!(
            "- status: **{}**",
            if self.passed() { "pass" } else { "fail" }
        ));
        lines.push(format!("- diff_hash: `{}`", self.diff_hash));

        lines.push(String::new());
        lines.push("## Declared patterns".to_string());
        lines.push(String::new());
        path_list(&mut lines, &self.declared_patterns);

        lines.push(String::new());
        lines.push("## Unauthorized paths".to_string());
        lines.push(String::new());
        path_list(&mut lines, &self.unauthorized_paths);

        lines.push(String::new());
        lines.push("## Allowed paths".to_string());
        lines.push(String::new());
        path_list(&mut lines, &self.allowed_paths);
        finish(lines)
    }
}

impl Artifact for PromotionResult {
    const NAME: &'static str = "PROMOTION";

    fn render_markdown(&self, meta: &ArtifactMeta) -> String {
        let mut lines = header("Promotion", meta);
        lines.push(format!("- run: `{}`", self.run_id));
        lines.push(format!("- run_state_hash: `{}`", self.run_state_hash));
        match (&self.token, &self.denial_reason) {
            (Some(token), _) => {
                lines.push("- status: **promoted**".to_string());
                lines.push(format!("- token: `{token}`"));
            }
            (None, reason) => {
                lines.push("- status: **denied**".to_string());
                if let Some(reason) = reason {
                    lines.push(format!("- reason: {reason}"));
                }
                lines.push(String::new());
                lines.push("## Unauthorized paths".to_string());
                lines.push(String::new());
                path_list(&mut lines, &self.unauthorized_paths);
            }
        }
        finish(lines)
    }
}

impl Artifact for HandoffPlan {
    const NAME: &'static str = "HANDOFF";

    fn render_markdown(&self, meta: &ArtifactMeta) -> String {
        let mut lines = header("Handoff", meta);
        lines.push(format!("- packet: `{}`", self.packet_id));
        lines.push(String::new());
        lines.push("```text".to_string());
        lines.push(self.render_text());
        lines.push("```".to_string());
        finish(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactWriter, TimestampMode, DETERMINISTIC_TIMESTAMP};
    use crate::availability::AvailabilityConfig;
    use crate::compliance::check;
    use crate::packet::validate;
    use crate::router::build_route_plan;
    use serde_json::json;

    fn meta() -> ArtifactMeta {
        ArtifactMeta {
            kernel_version: "0.0.0".into(),
            generated_at: DETERMINISTIC_TIMESTAMP.into(),
        }
    }

    #[test]
    fn route_plan_markdown_lists_steps_in_order() {
        let packet = validate(&json!({
            "id": "md",
            "mode": "auto",
            "steps": [
                {"step_id": "zz", "requires": ["code_edit"]},
                {"step_id": "aa", "requires": ["tests"]}
            ],
            "allowlist": []
        }))
        .unwrap();
        let plan = build_route_plan(&packet, &AvailabilityConfig::default_template());
        let md = plan.render_markdown(&meta());

        let zz = md.find("## Step `zz`").unwrap();
        let aa = md.find("## Step `aa`").unwrap();
        assert!(zz < aa);
        assert!(md.contains("status: **planned**"));
        assert!(md.contains("| 1 | claude_code | sonnet |"));
    }

    #[test]
    fn compliance_markdown_names_unauthorized_paths() {
        let report = check(
            "r",
            &["docs/b.md".to_string(), "src/a.py".to_string()],
            &["src/**.py".to_string()],
        )
        .unwrap();
        let md = report.render_markdown(&meta());
        assert!(md.contains("status: **fail**"));
        let unauthorized = md.find("## Unauthorized paths").unwrap();
        assert!(md[unauthorized..].contains("`docs/b.md`"));
    }

    #[test]
    fn writer_emits_json_and_markdown_pair() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), TimestampMode::Deterministic);
        let report = check("r", &["src/a.py".to_string()], &["src/*".to_string()]).unwrap();
        let written = writer.write(&report).unwrap();
        assert!(written.json_path.ends_with("COMPLIANCE_REPORT.json"));
        let md = std::fs::read_to_string(&written.markdown_path).unwrap();
        assert!(md.starts_with("# Compliance Report\n"));
        assert!(md.contains(DETERMINISTIC_TIMESTAMP));
    }
}
