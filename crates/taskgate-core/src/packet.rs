//! Task packet model and strict validation.
//!
//! A packet is accepted whole or refused whole. Validation walks the raw
//! document in order and reports the first violation it finds, naming the
//! offending field with a JSON-path-like locator (`steps[1].requires`).

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::artifacts::{canonical_json_bytes, sha256_hex};
use crate::compliance::AllowPattern;
use crate::error::{KernelError, Result};

const PACKET_KEYS: &[&str] = &["id", "mode", "steps", "allowlist"];
const STEP_KEYS: &[&str] = &["step_id", "requires", "runner", "model"];

/// Refusal of a malformed packet.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{field}: {reason}")]
pub struct InvalidPacket {
    pub field: String,
    pub reason: String,
}

impl InvalidPacket {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

type Validated<T> = std::result::Result<T, InvalidPacket>;

/// Execution mode declared by the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Manual,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit (runner, model) pair a step is pinned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteHint {
    pub runner: String,
    pub model: String,
}

/// One unit of declared work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub step_id: String,
    /// Required capability tags, in declared order
    pub requires: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<RouteHint>,
}

/// A packet that passed validation. Immutable for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskPacket {
    pub id: String,
    pub mode: Mode,
    pub steps: Vec<Step>,
    pub allowlist: Vec<String>,
}

impl TaskPacket {
    /// Load and validate a packet document (JSON, or YAML for `.yaml`/`.yml`).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| KernelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let packet = Self::parse(&content, is_yaml(path))?;
        tracing::debug!(
            packet_id = %packet.id,
            steps = packet.steps.len(),
            "Packet validated"
        );
        Ok(packet)
    }

    /// Parse packet text and validate it.
    pub fn parse(content: &str, yaml: bool) -> Validated<Self> {
        validate(&parse_raw(content, yaml)?)
    }

    /// The id a packet document declares, if it is a well-formed id, even
    /// when the rest of the document fails validation.
    pub fn declared_id(path: &Path) -> Option<String> {
        let content = std::fs::read_to_string(path).ok()?;
        let raw = parse_raw(&content, is_yaml(path)).ok()?;
        raw.get("id")
            .and_then(Value::as_str)
            .filter(|id| is_valid_id(id))
            .map(str::to_string)
    }

    /// SHA-256 of the canonical JSON form of the validated packet.
    pub fn content_hash(&self) -> String {
        let value = serde_json::json!({
            "id": self.id,
            "mode": self.mode,
            "steps": self.steps,
            "allowlist": self.allowlist,
        });
        sha256_hex(&canonical_json_bytes(&value))
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

fn parse_raw(content: &str, yaml: bool) -> Validated<Value> {
    if yaml {
        serde_yaml::from_str(content)
            .map_err(|e| InvalidPacket::new("$", format!("unparseable YAML: {e}")))
    } else {
        serde_json::from_str(content)
            .map_err(|e| InvalidPacket::new("$", format!("unparseable JSON: {e}")))
    }
}

/// Ids name run directories: `[A-Za-z0-9._-]`, no leading '.'.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Validate a raw packet document.
pub fn validate(raw: &Value) -> Validated<TaskPacket> {
    let obj = raw
        .as_object()
        .ok_or_else(|| InvalidPacket::new("$", "packet must be an object"))?;
    reject_unknown_keys(obj, PACKET_KEYS, "")?;

    let id = required_str(obj, "id", "id")?;
    if !is_valid_id(&id) {
        return Err(InvalidPacket::new(
            "id",
            "must contain only [A-Za-z0-9._-] and not start with '.'",
        ));
    }

    let mode = match required_str(obj, "mode", "mode")?.as_str() {
        "auto" => Mode::Auto,
        "manual" => Mode::Manual,
        other => {
            return Err(InvalidPacket::new(
                "mode",
                format!("must be 'auto' or 'manual', got '{other}'"),
            ))
        }
    };

    let raw_steps = obj
        .get("steps")
        .ok_or_else(|| InvalidPacket::new("steps", "is required"))?
        .as_array()
        .ok_or_else(|| InvalidPacket::new("steps", "must be an array"))?;
    if raw_steps.is_empty() {
        return Err(InvalidPacket::new("steps", "must not be empty"));
    }

    let mut seen_ids = BTreeSet::new();
    let mut steps = Vec::with_capacity(raw_steps.len());
    for (index, raw_step) in raw_steps.iter().enumerate() {
        let step = validate_step(index, raw_step)?;
        if !seen_ids.insert(step.step_id.clone()) {
            return Err(InvalidPacket::new(
                format!("steps[{index}].step_id"),
                format!("duplicate step_id '{}'", step.step_id),
            ));
        }
        steps.push(step);
    }

    let allowlist = string_list(obj, "allowlist", "allowlist")?;
    for (index, pattern) in allowlist.iter().enumerate() {
        AllowPattern::parse(pattern)
            .map_err(|reason| InvalidPacket::new(format!("allowlist[{index}]"), reason))?;
    }

    Ok(TaskPacket {
        id,
        mode,
        steps,
        allowlist,
    })
}

fn validate_step(index: usize, raw: &Value) -> Validated<Step> {
    let at = |key: &str| format!("steps[{index}].{key}");
    let obj = raw
        .as_object()
        .ok_or_else(|| InvalidPacket::new(format!("steps[{index}]"), "must be an object"))?;
    reject_unknown_keys(obj, STEP_KEYS, &format!("steps[{index}]."))?;

    let step_id = required_str(obj, "step_id", &at("step_id"))?;
    let requires = string_list(obj, "requires", &at("requires"))?;
    if requires.is_empty() {
        return Err(InvalidPacket::new(
            at("requires"),
            "must list at least one capability tag",
        ));
    }
    let mut tags = BTreeSet::new();
    for tag in &requires {
        if tag.trim().is_empty() {
            return Err(InvalidPacket::new(at("requires"), "tags must not be blank"));
        }
        if !tags.insert(tag.as_str()) {
            return Err(InvalidPacket::new(
                at("requires"),
                format!("duplicate tag '{tag}'"),
            ));
        }
    }

    let runner = optional_str(obj, "runner", &at("runner"))?;
    let model = optional_str(obj, "model", &at("model"))?;
    let hint = match (runner, model) {
        (Some(runner), Some(model)) => Some(RouteHint { runner, model }),
        (None, None) => None,
        (Some(_), None) => {
            return Err(InvalidPacket::new(
                at("model"),
                "a runner hint requires a model hint",
            ))
        }
        (None, Some(_)) => {
            return Err(InvalidPacket::new(
                at("runner"),
                "a model hint requires a runner hint",
            ))
        }
    };

    Ok(Step {
        step_id,
        requires,
        hint,
    })
}

fn reject_unknown_keys(obj: &Map<String, Value>, allowed: &[&str], prefix: &str) -> Validated<()> {
    // Map iteration is key-sorted, so the reported key is stable.
    match obj.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(InvalidPacket::new(
            format!("{prefix}{key}"),
            "unknown key",
        )),
        None => Ok(()),
    }
}

fn required_str(obj: &Map<String, Value>, key: &str, field: &str) -> Validated<String> {
    match optional_str(obj, key, field)? {
        Some(s) => Ok(s),
        None => Err(InvalidPacket::new(field, "is required")),
    }
}

fn optional_str(obj: &Map<String, Value>, key: &str, field: &str) -> Validated<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(InvalidPacket::new(field, "must not be blank"))
        }
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(InvalidPacket::new(field, "must be a string")),
    }
}

fn string_list(obj: &Map<String, Value>, key: &str, field: &str) -> Validated<Vec<String>> {
    let items = obj
        .get(key)
        .ok_or_else(|| InvalidPacket::new(field, "is required"))?
        .as_array()
        .ok_or_else(|| InvalidPacket::new(field, "must be an array of strings"))?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| InvalidPacket::new(format!("{field}[{i}]"), "must be a string"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "id": "pkt-1",
            "mode": "auto",
            "steps": [
                {"step_id": "edit", "requires": ["code_edit"]},
                {"step_id": "test", "requires": ["tests"], "runner": "r1", "model": "m1"}
            ],
            "allowlist": ["src/**.py"]
        })
    }

    #[test]
    fn accepts_well_formed_packet() {
        let packet = validate(&base()).unwrap();
        assert_eq!(packet.id, "pkt-1");
        assert_eq!(packet.mode, Mode::Auto);
        assert_eq!(packet.steps.len(), 2);
        assert_eq!(
            packet.steps[1].hint,
            Some(RouteHint {
                runner: "r1".into(),
                model: "m1".into()
            })
        );
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let mut raw = base();
        raw["priority"] = json!("high");
        let err = validate(&raw).unwrap_err();
        assert_eq!(err.field, "priority");
        assert_eq!(err.reason, "unknown key");
    }

    #[test]
    fn rejects_unknown_step_key() {
        let mut raw = base();
        raw["steps"][0]["timeout"] = json!(30);
        let err = validate(&raw).unwrap_err();
        assert_eq!(err.field, "steps[0].timeout");
    }

    #[test]
    fn rejects_empty_steps() {
        let mut raw = base();
        raw["steps"] = json!([]);
        assert_eq!(validate(&raw).unwrap_err().field, "steps");
    }

    #[test]
    fn rejects_step_without_tags() {
        let mut raw = base();
        raw["steps"][1]["requires"] = json!([]);
        assert_eq!(validate(&raw).unwrap_err().field, "steps[1].requires");
    }

    #[test]
    fn rejects_unknown_mode() {
        let mut raw = base();
        raw["mode"] = json!("yolo");
        let err = validate(&raw).unwrap_err();
        assert_eq!(err.field, "mode");
    }

    #[test]
    fn rejects_half_hint() {
        let mut raw = base();
        raw["steps"][0]["runner"] = json!("r1");
        assert_eq!(validate(&raw).unwrap_err().field, "steps[0].model");
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let mut raw = base();
        raw["steps"][1]["step_id"] = json!("edit");
        assert_eq!(validate(&raw).unwrap_err().field, "steps[1].step_id");
    }

    #[test]
    fn rejects_bad_allowlist_pattern() {
        let mut raw = base();
        raw["allowlist"] = json!(["src/**", "../escape/*"]);
        assert_eq!(validate(&raw).unwrap_err().field, "allowlist[1]");
    }

    #[test]
    fn rejects_id_that_cannot_name_a_directory() {
        let mut raw = base();
        raw["id"] = json!("../etc");
        assert_eq!(validate(&raw).unwrap_err().field, "id");
    }

    #[test]
    fn parses_yaml_packets() {
        let yaml = r#"
id: pkt-y
mode: manual
steps:
  - step_id: only
    requires: [docs]
allowlist: ["docs/*"]
"#;
        let packet = TaskPacket::parse(yaml, true).unwrap();
        assert_eq!(packet.mode, Mode::Manual);
        assert_eq!(packet.steps[0].requires, vec!["docs".to_string()]);
    }

    #[test]
    fn content_hash_tracks_the_allowlist() {
        let narrow = validate(&base()).unwrap();
        let mut raw = base();
        raw["allowlist"] = json!(["**"]);
        let wide = validate(&raw).unwrap();
        assert_eq!(narrow.content_hash(), validate(&base()).unwrap().content_hash());
        assert_ne!(narrow.content_hash(), wide.content_hash());
    }

    #[test]
    fn declared_id_survives_an_invalid_body() {
        let dir = tempfile::tempdir().unwrap();
        let bad_mode = dir.path().join("bad.json");
        std::fs::write(&bad_mode, r#"{"id": "pkt-7", "mode": "sometimes"}"#).unwrap();
        assert_eq!(TaskPacket::declared_id(&bad_mode).as_deref(), Some("pkt-7"));

        let bad_id = dir.path().join("escape.yaml");
        std::fs::write(&bad_id, "id: ../../etc\nmode: auto\n").unwrap();
        assert_eq!(TaskPacket::declared_id(&bad_id), None);
    }
}
