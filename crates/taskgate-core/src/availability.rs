//! Availability Resolver - runner/model capabilities and routing policy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifacts::write_atomic;

/// Errors loading the availability config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Syntax or schema violation (unknown key, unknown tier, wrong type)
    #[error("malformed config: {message}")]
    Malformed { message: String },

    /// Cross-reference or range violation
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Model cost tiers, ordered cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    Low,
    Medium,
    High,
}

impl CostTier {
    pub fn rank(self) -> u32 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for CostTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSize {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSpec {
    pub available: bool,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub cost_tier: CostTier,
    pub context: ContextSize,
}

/// Routing policy applied by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub max_cost_tier: CostTier,
    pub min_total_score: u32,
    pub stop_on_ambiguity: bool,
    /// Preferred models, most preferred first
    #[serde(default)]
    pub escalation_ladder: Vec<String>,
}

impl Policy {
    /// Position of a model in the escalation ladder.
    pub fn ladder_index(&self, model: &str) -> Option<usize> {
        self.escalation_ladder.iter().position(|m| m == model)
    }
}

/// Validated availability config, loaded once per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AvailabilityConfig {
    pub runners: BTreeMap<String, RunnerSpec>,
    pub models: BTreeMap<String, ModelSpec>,
    pub policy: Policy,
}

impl AvailabilityConfig {
    /// Load from a file; `.json` is parsed as JSON, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let json = path.extension().and_then(|e| e.to_str()) == Some("json");
        let config = Self::parse(&content, json)?;
        tracing::debug!(
            path = %path.display(),
            runners = config.runners.len(),
            models = config.models.len(),
            "Availability loaded"
        );
        Ok(config)
    }

    pub fn parse(content: &str, json: bool) -> Result<Self, ConfigError> {
        let config: Self = if json {
            serde_json::from_str(content).map_err(|e| ConfigError::Malformed {
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(content).map_err(|e| ConfigError::Malformed {
                message: e.to_string(),
            })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and cross-references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policy.min_total_score > 100 {
            return Err(ConfigError::Malformed {
                message: format!(
                    "policy.min_total_score must be within 0..=100, got {}",
                    self.policy.min_total_score
                ),
            });
        }
        if self.runners.is_empty() {
            return Err(ConfigError::invalid("runners", "at least one runner must be declared"));
        }
        if self.models.is_empty() {
            return Err(ConfigError::invalid("models", "at least one model must be declared"));
        }

        let mut seen = BTreeSet::new();
        for (index, model) in self.policy.escalation_ladder.iter().enumerate() {
            let field = format!("policy.escalation_ladder[{index}]");
            if !self.models.contains_key(model) {
                return Err(ConfigError::invalid(
                    field,
                    format!("references undeclared model '{model}'"),
                ));
            }
            if !seen.insert(model.as_str()) {
                return Err(ConfigError::invalid(field, format!("model '{model}' listed twice")));
            }
        }
        Ok(())
    }

    /// Default template: two runners, three models, medium cost cap.
    pub fn default_template() -> Self {
        let tags = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();

        let mut runners = BTreeMap::new();
        runners.insert(
            "claude_code".to_string(),
            RunnerSpec {
                available: true,
                capabilities: tags(&["code_edit", "docs", "refactor", "tests"]),
            },
        );
        runners.insert(
            "codex_cli".to_string(),
            RunnerSpec {
                available: true,
                capabilities: tags(&["code_edit", "tests"]),
            },
        );

        let mut models = BTreeMap::new();
        models.insert(
            "haiku".to_string(),
            ModelSpec {
                capabilities: tags(&["docs", "quick_commands"]),
                cost_tier: CostTier::Low,
                context: ContextSize::Medium,
            },
        );
        models.insert(
            "sonnet".to_string(),
            ModelSpec {
                capabilities: tags(&["code_edit", "refactor", "tests"]),
                cost_tier: CostTier::Medium,
                context: ContextSize::Large,
            },
        );
        models.insert(
            "opus".to_string(),
            ModelSpec {
                capabilities: tags(&["architecture", "code_edit", "refactor"]),
                cost_tier: CostTier::High,
                context: ContextSize::Large,
            },
        );

        Self {
            runners,
            models,
            policy: Policy {
                max_cost_tier: CostTier::Medium,
                min_total_score: 50,
                stop_on_ambiguity: false,
                escalation_ladder: vec!["sonnet".into(), "haiku".into(), "opus".into()],
            },
        }
    }

    /// Write the default template to `path` unless a file already exists.
    ///
    /// Returns `true` when a file was written.
    pub fn ensure_default(path: &Path) -> crate::error::Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        let yaml = serde_yaml::to_string(&Self::default_template()).map_err(|e| {
            ConfigError::Malformed {
                message: e.to_string(),
            }
        })?;
        write_atomic(path, yaml.as_bytes())?;
        tracing::info!(path = %path.display(), "Wrote default availability config");
        Ok(true)
    }
}
