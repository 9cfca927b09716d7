//! Run state machine - carries one packet from plan to promotion.
//!
//! ```text
//! Compiled -> Executed -> Gated(pass) -> Promoted
//!                      -> Gated(fail) -> Blocked
//! ```
//!
//! No phase is skipped and no transition reverses. The only suspension point
//! is the [`Executor`], which the run awaits once per planned step.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::artifacts::{Artifact, ArtifactWriter};
use crate::availability::AvailabilityConfig;
use crate::changes::ChangeReport;
use crate::compliance::{ComplianceGate, ComplianceReport};
use crate::error::Result;
use crate::handoff::HandoffPlan;
use crate::packet::{InvalidPacket, Mode, TaskPacket};
use crate::promotion::{self, run_state_hash, PromotionResult};
use crate::refusal::RefusalReport;
use crate::router::{Candidate, RoutePlan, Router, StepPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Compiled,
    Executed,
    Gated { passed: bool },
    Promoted,
    Blocked,
}

impl RunPhase {
    pub fn can_transition(self, to: RunPhase) -> bool {
        matches!(
            (self, to),
            (Self::Compiled, Self::Executed)
                | (Self::Executed, Self::Gated { .. })
                | (Self::Gated { passed: true }, Self::Promoted)
                | (Self::Gated { passed: false }, Self::Blocked)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Promoted | Self::Blocked)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Compiled => "compiled",
            Self::Executed => "executed",
            Self::Gated { passed: true } => "gated(pass)",
            Self::Gated { passed: false } => "gated(fail)",
            Self::Promoted => "promoted",
            Self::Blocked => "blocked",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot move run from {from} to {to}")]
    Illegal { from: RunPhase, to: RunPhase },

    #[error("route plan for {packet_id} is refused; no run exists")]
    PlanNotPlanned { packet_id: String },

    #[error("route plan belongs to packet {plan} but packet is {packet}")]
    PacketMismatch { plan: String, packet: String },

    #[error("packet {packet_id} changed since its route plan was computed")]
    PacketChanged { packet_id: String },

    #[error("packet {packet_id} is in manual mode; its steps are handed off, not executed")]
    ManualMode { packet_id: String },

    #[error("run in {} was already gated", run_dir.display())]
    AlreadyGated { run_dir: PathBuf },

    #[error("run directory {} already holds artifacts: {}", run_dir.display(), existing.join(", "))]
    RunDirInUse {
        run_dir: PathBuf,
        existing: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("step {step_id} failed on {runner}/{model}: {message}")]
    StepFailed {
        step_id: String,
        runner: String,
        model: String,
        message: String,
    },

    #[error("step {step_id} has no selected candidate")]
    Unplanned { step_id: String },
}

/// The external collaborator that carries out a planned step.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute one step on its selected candidate and report what changed.
    async fn execute_step(
        &self,
        packet: &TaskPacket,
        step: &StepPlan,
        candidate: &Candidate,
    ) -> std::result::Result<ChangeReport, ExecutionError>;
}

/// Result of compiling a packet.
#[derive(Debug)]
pub enum CompileOutcome {
    Compiled(Box<Run>),
    Refused {
        plan: RoutePlan,
        refusal: RefusalReport,
    },
}

/// One packet's progress through the kernel.
#[derive(Debug)]
pub struct Run {
    packet: TaskPacket,
    plan: RoutePlan,
    plan_hash: String,
    writer: ArtifactWriter,
    phase: RunPhase,
    changes: Option<ChangeReport>,
    compliance: Option<ComplianceReport>,
    compliance_hash: Option<String>,
    promotion: Option<PromotionResult>,
}

impl Run {
    /// Plan `packet` and write the route plan, plus the refusal report or the
    /// manual handoff when they apply.
    ///
    /// The run directory must not hold artifacts from an earlier run.
    pub fn compile(
        packet: TaskPacket,
        availability: &AvailabilityConfig,
        writer: ArtifactWriter,
    ) -> Result<CompileOutcome> {
        let existing = writer.existing_artifacts()?;
        if !existing.is_empty() {
            return Err(TransitionError::RunDirInUse {
                run_dir: writer.out_dir().to_path_buf(),
                existing,
            }
            .into());
        }

        let plan = Router::new(availability.clone()).plan(&packet);
        let written = writer.write(&plan)?;

        if let Some(refusal) = RefusalReport::from_plan(&plan) {
            writer.write(&refusal)?;
            tracing::warn!(packet_id = %packet.id, message = %refusal.message, "Routing refused");
            return Ok(CompileOutcome::Refused { plan, refusal });
        }

        if packet.mode == Mode::Manual {
            let handoff = HandoffPlan::build(&plan);
            writer.write(&handoff)?;
            tracing::info!(
                packet_id = %packet.id,
                chunks = handoff.chunks.len(),
                "Handoff chunks written"
            );
        }

        Ok(CompileOutcome::Compiled(Box::new(Self {
            packet,
            plan,
            plan_hash: written.content_hash,
            writer,
            phase: RunPhase::Compiled,
            changes: None,
            compliance: None,
            compliance_hash: None,
            promotion: None,
        })))
    }

    /// Reattach to a previously written plan, e.g. from a later invocation.
    ///
    /// The packet must be the one the plan was computed for, and the run
    /// directory must not hold a compliance report or promotion yet.
    pub fn resume(
        packet: TaskPacket,
        plan: RoutePlan,
        plan_hash: String,
        writer: ArtifactWriter,
    ) -> std::result::Result<Self, TransitionError> {
        if plan.packet_id != packet.id {
            return Err(TransitionError::PacketMismatch {
                plan: plan.packet_id,
                packet: packet.id,
            });
        }
        if plan.packet_hash != packet.content_hash() {
            return Err(TransitionError::PacketChanged {
                packet_id: packet.id,
            });
        }
        if !plan.is_planned() {
            return Err(TransitionError::PlanNotPlanned {
                packet_id: plan.packet_id,
            });
        }
        let gated = [ComplianceReport::NAME, PromotionResult::NAME]
            .iter()
            .any(|name| writer.out_dir().join(format!("{name}.json")).exists());
        if gated {
            return Err(TransitionError::AlreadyGated {
                run_dir: writer.out_dir().to_path_buf(),
            });
        }
        Ok(Self {
            packet,
            plan,
            plan_hash,
            writer,
            phase: RunPhase::Compiled,
            changes: None,
            compliance: None,
            compliance_hash: None,
            promotion: None,
        })
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn packet(&self) -> &TaskPacket {
        &self.packet
    }

    pub fn plan(&self) -> &RoutePlan {
        &self.plan
    }

    /// SHA-256 of the written route plan JSON
    pub fn plan_hash(&self) -> &str {
        &self.plan_hash
    }

    pub fn writer(&self) -> &ArtifactWriter {
        &self.writer
    }

    pub fn changes(&self) -> Option<&ChangeReport> {
        self.changes.as_ref()
    }

    pub fn compliance(&self) -> Option<&ComplianceReport> {
        self.compliance.as_ref()
    }

    pub fn promotion(&self) -> Option<&PromotionResult> {
        self.promotion.as_ref()
    }

    fn advance(&mut self, to: RunPhase) -> std::result::Result<(), TransitionError> {
        if !self.phase.can_transition(to) {
            return Err(TransitionError::Illegal {
                from: self.phase,
                to,
            });
        }
        tracing::debug!(packet_id = %self.packet.id, from = %self.phase, to = %to, "Run transition");
        self.phase = to;
        Ok(())
    }

    /// Await the executor for every step in declared order.
    ///
    /// A failing step stops the run at `Compiled`; nothing is retried.
    pub async fn execute<E: Executor + ?Sized>(&mut self, executor: &E) -> Result<&ChangeReport> {
        if !self.phase.can_transition(RunPhase::Executed) {
            return Err(TransitionError::Illegal {
                from: self.phase,
                to: RunPhase::Executed,
            }
            .into());
        }
        if self.packet.mode == Mode::Manual {
            return Err(TransitionError::ManualMode {
                packet_id: self.packet.id.clone(),
            }
            .into());
        }

        let mut changes = ChangeReport::default();
        for step in &self.plan.steps {
            let candidate = step
                .selected_candidate
                .as_ref()
                .ok_or_else(|| ExecutionError::Unplanned {
                    step_id: step.step_id.clone(),
                })?;
            tracing::info!(
                step_id = %step.step_id,
                runner = %candidate.runner,
                model = %candidate.model,
                "Executing step"
            );
            match executor.execute_step(&self.packet, step, candidate).await {
                Ok(report) => changes.merge(report),
                Err(e) => {
                    tracing::warn!(step_id = %step.step_id, error = %e, "Step execution failed");
                    return Err(e.into());
                }
            }
        }

        self.advance(RunPhase::Executed)?;
        Ok(&*self.changes.insert(changes))
    }

    /// Admit a change report produced outside the kernel.
    pub fn record_execution(
        &mut self,
        report: ChangeReport,
    ) -> std::result::Result<(), TransitionError> {
        self.advance(RunPhase::Executed)?;
        self.changes = Some(report);
        Ok(())
    }

    /// Check the recorded changes against the packet allow-list.
    pub fn gate(&mut self) -> Result<&ComplianceReport> {
        if self.phase != RunPhase::Executed {
            return Err(TransitionError::Illegal {
                from: self.phase,
                to: RunPhase::Gated { passed: false },
            }
            .into());
        }

        let gate = ComplianceGate::new(&self.packet.allowlist)
            .map_err(|reason| InvalidPacket::new("allowlist", reason))?;
        let changed = self
            .changes
            .as_ref()
            .map(|c| c.changed_paths.as_slice())
            .unwrap_or_default();
        let report = gate.check(&self.packet.id, changed);
        let written = self.writer.write(&report)?;

        self.advance(RunPhase::Gated {
            passed: report.passed(),
        })?;
        self.compliance_hash = Some(written.content_hash);
        Ok(&*self.compliance.insert(report))
    }

    /// Issue the promotion token or record the denial.
    pub fn promote(&mut self) -> Result<&PromotionResult> {
        let (Some(report), Some(compliance_hash)) = (&self.compliance, &self.compliance_hash)
        else {
            return Err(TransitionError::Illegal {
                from: self.phase,
                to: RunPhase::Promoted,
            }
            .into());
        };
        let target = match self.phase {
            RunPhase::Gated { passed: true } => RunPhase::Promoted,
            RunPhase::Gated { passed: false } => RunPhase::Blocked,
            from => {
                return Err(TransitionError::Illegal {
                    from,
                    to: RunPhase::Promoted,
                }
                .into())
            }
        };

        let state = run_state_hash(&self.plan_hash, compliance_hash);
        let outcome = promotion::promote(report, &state);
        let result = PromotionResult::from_outcome(&outcome, &state);
        self.writer.write(&result)?;

        self.advance(target)?;
        Ok(&*self.promotion.insert(result))
    }

    /// Execute, gate and promote in one go.
    pub async fn run_to_completion<E: Executor + ?Sized>(
        &mut self,
        executor: &E,
    ) -> Result<RunPhase> {
        self.execute(executor).await?;
        self.gate()?;
        self.promote()?;
        Ok(self.phase)
    }
}
