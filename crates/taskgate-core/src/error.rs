//! Error taxonomy and the outcome categories the host maps to exit codes.

use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::availability::ConfigError;
use crate::changes::ChangeReportError;
use crate::packet::InvalidPacket;
use crate::run::{ExecutionError, TransitionError};

/// Coarse outcome category of a kernel invocation.
///
/// Refusals are expected decisions; only `Internal` signals that something
/// went wrong that nobody asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeCategory {
    Success,
    Refusal,
    Internal,
}

impl OutcomeCategory {
    /// Process exit code for this category.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Internal => 1,
            Self::Refusal => 2,
        }
    }
}

/// Errors surfaced by the kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid packet: {0}")]
    InvalidPacket(#[from] InvalidPacket),

    #[error("invalid availability config: {0}")]
    Config(#[from] ConfigError),

    #[error("artifact write failed: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("change report unreadable: {0}")]
    ChangeReport(#[from] ChangeReportError),

    #[error("illegal run transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("external execution interrupted: {0}")]
    Execution(#[from] ExecutionError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl KernelError {
    pub fn category(&self) -> OutcomeCategory {
        match self {
            // Malformed inputs are refused, never defaulted.
            Self::InvalidPacket(_) => OutcomeCategory::Refusal,
            Self::Config(ConfigError::Malformed { .. }) => OutcomeCategory::Refusal,
            // Cross-reference failures are semantic, not syntactic.
            Self::Config(ConfigError::Read { .. } | ConfigError::Invalid { .. })
            | Self::Artifact(_)
            | Self::ChangeReport(_)
            | Self::Transition(_)
            | Self::Execution(_)
            | Self::Io { .. } => OutcomeCategory::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_category() {
        assert_eq!(OutcomeCategory::Success.exit_code(), 0);
        assert_eq!(OutcomeCategory::Internal.exit_code(), 1);
        assert_eq!(OutcomeCategory::Refusal.exit_code(), 2);
    }

    #[test]
    fn invalid_packet_is_a_refusal() {
        let err = KernelError::from(InvalidPacket::new("steps", "must not be empty"));
        assert_eq!(err.category(), OutcomeCategory::Refusal);
    }

    #[test]
    fn io_failure_is_internal() {
        let err = KernelError::Io {
            path: "x".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert_eq!(err.category(), OutcomeCategory::Internal);
    }
}
