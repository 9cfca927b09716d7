//! Taskgate Core - deterministic routing, compliance and promotion kernel
//!
//! This crate turns a declarative task packet into either a routed
//! execution plan or a structured refusal, checks the changes an external
//! runner made against the packet's allow-list, and issues a state-bound
//! promotion token only when every change was authorized.

pub mod artifacts;
pub mod availability;
pub mod changes;
pub mod compliance;
pub mod config;
pub mod error;
pub mod handoff;
pub mod packet;
pub mod promotion;
pub mod refusal;
pub mod render;
pub mod router;
pub mod run;

pub use artifacts::{Artifact, ArtifactWriter, TimestampMode};
pub use availability::{AvailabilityConfig, ConfigError, CostTier};
pub use changes::ChangeReport;
pub use compliance::{ComplianceGate, ComplianceReport};
pub use config::KernelConfig;
pub use error::{KernelError, OutcomeCategory};
pub use handoff::HandoffPlan;
pub use packet::{validate, InvalidPacket, Mode, TaskPacket};
pub use promotion::{promote, verify_token, PromotionDenied, PromotionResult, PromotionToken};
pub use refusal::RefusalReport;
pub use router::{build_route_plan, Candidate, PlanStatus, RefusalCode, RoutePlan, Router};
pub use run::{CompileOutcome, Executor, Run, RunPhase};
