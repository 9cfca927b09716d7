//! Taskgate CLI - routing, compliance and promotion kernel.
//!
//! Single binary that provides:
//! - `taskgate init` - write default config and availability
//! - `taskgate plan` - validate a packet and write its route plan
//! - `taskgate gate` - check a run's changes and promote or block it
//! - `taskgate verify-token` - recompute a run's promotion token
//!
//! Exit codes: 0 success, 2 refusal of any kind, 1 internal error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use taskgate_core::artifacts::sha256_file;
use taskgate_core::promotion::run_state_hash;
use taskgate_core::{
    verify_token, ArtifactWriter, AvailabilityConfig, ChangeReport, CompileOutcome, InvalidPacket,
    KernelConfig, KernelError, OutcomeCategory, PromotionResult, RefusalReport, RoutePlan, Run,
    RunPhase, TaskPacket, TimestampMode,
};

/// Refusals for packets whose id cannot name a run directory.
const INVALID_RUNS_DIR: &str = "_invalid";

#[derive(Parser)]
#[command(name = "taskgate")]
#[command(about = "Deterministic routing, compliance and promotion kernel", version)]
struct Cli {
    /// Project root directory
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a project with default config and availability
    Init,

    /// Validate a packet and write its route plan (or refusal)
    Plan {
        /// Task packet (JSON, or YAML by extension)
        #[arg(long)]
        packet: PathBuf,

        /// Availability config, overriding the project config
        #[arg(long)]
        availability: Option<PathBuf>,

        /// Run directory, defaults to <runs_dir>/<packet id>, or
        /// <runs_dir>/_invalid for a packet without a usable id
        #[arg(long)]
        out: Option<PathBuf>,

        /// deterministic | wallclock
        #[arg(long)]
        timestamp_mode: Option<TimestampMode>,
    },

    /// Check a run's changes against the allow-list and promote or block it
    Gate {
        #[arg(long)]
        packet: PathBuf,

        /// Run directory holding ROUTE_PLAN.json
        #[arg(long)]
        run_dir: PathBuf,

        /// JSON change report `{"changed_paths": [...]}`
        #[arg(long, conflicts_with = "git", required_unless_present = "git")]
        changes: Option<PathBuf>,

        /// Collect changes from this git worktree's status
        #[arg(long)]
        git: Option<PathBuf>,

        #[arg(long)]
        timestamp_mode: Option<TimestampMode>,
    },

    /// Recompute a run's promotion token from its artifacts
    VerifyToken {
        #[arg(long)]
        run_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(category) => ExitCode::from(category.exit_code()),
        Err(err) => {
            let category = categorize(&err);
            tracing::error!("Command failed: {err:#}");
            ExitCode::from(category.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<OutcomeCategory> {
    let project_root = match cli.project {
        Some(p) => p,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let mut config = KernelConfig::load_from_project(&project_root)
        .map_err(KernelError::from)
        .context("Failed to load kernel config")?;
    config.resolve_paths(&project_root);

    match cli.command {
        Commands::Init => init_project(&project_root, &config),
        Commands::Plan {
            packet,
            availability,
            out,
            timestamp_mode,
        } => plan(
            &config,
            &packet,
            availability.as_deref(),
            out,
            timestamp_mode.unwrap_or(config.timestamp_mode),
        ),
        Commands::Gate {
            packet,
            run_dir,
            changes,
            git,
            timestamp_mode,
        } => gate(
            &packet,
            &run_dir,
            changes.as_deref(),
            git.as_deref(),
            timestamp_mode.unwrap_or(config.timestamp_mode),
        ),
        Commands::VerifyToken { run_dir } => verify(&run_dir),
    }
}

/// Map a failure onto the exit-code contract.
fn categorize(err: &anyhow::Error) -> OutcomeCategory {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<KernelError>())
        .map(KernelError::category)
        .unwrap_or(OutcomeCategory::Internal)
}

fn init_project(project_root: &Path, config: &KernelConfig) -> Result<OutcomeCategory> {
    let wrote_config = KernelConfig::ensure_default(project_root)
        .context("Failed to write kernel config")?;
    let wrote_availability = AvailabilityConfig::ensure_default(&config.availability_path)
        .context("Failed to write availability config")?;

    println!("Initialized Taskgate project at {}", project_root.display());
    println!();
    for (wrote, path) in [
        (wrote_config, project_root.join(taskgate_core::config::CONFIG_FILE)),
        (wrote_availability, config.availability_path.clone()),
    ] {
        let state = if wrote { "created" } else { "kept" };
        println!("  {state}: {}", path.display());
    }
    println!();
    println!("Next steps:");
    println!("  1. Describe runners and models in the availability config");
    println!("  2. Run: taskgate plan --packet <packet.json>");

    Ok(OutcomeCategory::Success)
}

fn plan(
    config: &KernelConfig,
    packet_path: &Path,
    availability_path: Option<&Path>,
    out: Option<PathBuf>,
    timestamp_mode: TimestampMode,
) -> Result<OutcomeCategory> {
    let packet = match TaskPacket::load(packet_path) {
        Ok(packet) => packet,
        Err(KernelError::InvalidPacket(invalid)) => {
            tracing::warn!(packet = %packet_path.display(), error = %invalid, "Packet refused");
            println!("refused: invalid packet: {invalid}");
            write_invalid_packet_refusal(config, packet_path, out, timestamp_mode, &invalid)?;
            return Ok(OutcomeCategory::Refusal);
        }
        Err(err) => return Err(err).context("Failed to load packet"),
    };

    let availability_path = availability_path.unwrap_or(config.availability_path.as_path());
    let availability = AvailabilityConfig::load(availability_path)
        .map_err(KernelError::from)
        .with_context(|| format!("Failed to load availability from {}", availability_path.display()))?;

    let run_dir = out.unwrap_or_else(|| config.run_dir(&packet.id));
    let writer = ArtifactWriter::new(&run_dir, timestamp_mode);

    match Run::compile(packet, &availability, writer)? {
        CompileOutcome::Compiled(run) => {
            println!("planned: {}", run_dir.join("ROUTE_PLAN.json").display());
            for step in &run.plan().steps {
                if let Some(selected) = &step.selected_candidate {
                    println!(
                        "  {} -> {} (score {})",
                        step.step_id,
                        selected.label(),
                        selected.total_score
                    );
                }
            }
            Ok(OutcomeCategory::Success)
        }
        CompileOutcome::Refused { refusal, .. } => {
            println!("refused: {}", refusal.message);
            println!("  see {}", run_dir.join("REFUSAL_REPORT.md").display());
            Ok(OutcomeCategory::Refusal)
        }
    }
}

/// Record an invalid-packet refusal where the run would have lived.
///
/// A run directory that already holds artifacts is left untouched. The
/// shared `_invalid` directory is overwritten by each refusal.
fn write_invalid_packet_refusal(
    config: &KernelConfig,
    packet_path: &Path,
    out: Option<PathBuf>,
    timestamp_mode: TimestampMode,
    invalid: &InvalidPacket,
) -> Result<()> {
    let declared_id = TaskPacket::declared_id(packet_path);
    let (dir, shared) = match (out, &declared_id) {
        (Some(dir), _) => (dir, false),
        (None, Some(id)) => (config.run_dir(id), false),
        (None, None) => (config.runs_dir.join(INVALID_RUNS_DIR), true),
    };

    let writer = ArtifactWriter::new(&dir, timestamp_mode);
    let existing = writer.existing_artifacts().map_err(KernelError::from)?;
    if !shared && !existing.is_empty() {
        tracing::warn!(
            run_dir = %dir.display(),
            "Run directory already holds artifacts; refusal report not written"
        );
        return Ok(());
    }

    writer
        .write(&RefusalReport::invalid_packet(declared_id.as_deref(), invalid))
        .map_err(KernelError::from)
        .context("Failed to write refusal report")?;
    println!("  see {}", dir.join("REFUSAL_REPORT.md").display());
    Ok(())
}

fn gate(
    packet_path: &Path,
    run_dir: &Path,
    changes: Option<&Path>,
    git: Option<&Path>,
    timestamp_mode: TimestampMode,
) -> Result<OutcomeCategory> {
    let packet = TaskPacket::load(packet_path).context("Failed to load packet")?;

    let plan_path = run_dir.join("ROUTE_PLAN.json");
    let plan_bytes = std::fs::read(&plan_path)
        .with_context(|| format!("Failed to read {}", plan_path.display()))?;
    let plan: RoutePlan = serde_json::from_slice(&plan_bytes)
        .with_context(|| format!("Failed to parse {}", plan_path.display()))?;
    let plan_hash = sha256_file(&plan_path).map_err(KernelError::from)?;

    let report = match (changes, git) {
        (Some(path), _) => ChangeReport::load(path).map_err(KernelError::from)?,
        (None, Some(worktree)) => {
            ChangeReport::from_git_worktree(worktree).map_err(KernelError::from)?
        }
        (None, None) => bail!("either --changes or --git is required"),
    };

    let writer = ArtifactWriter::new(run_dir, timestamp_mode);
    let mut run = Run::resume(packet, plan, plan_hash, writer).map_err(KernelError::from)?;
    run.record_execution(report).map_err(KernelError::from)?;

    let compliance = run.gate()?;
    if !compliance.passed() {
        println!("compliance: fail");
        for path in &compliance.unauthorized_paths {
            println!("  unauthorized: {path}");
        }
    } else {
        println!("compliance: pass");
    }

    let promotion = run.promote()?;
    if let Some(token) = &promotion.token {
        println!("promoted: {token}");
    } else if let Some(reason) = &promotion.denial_reason {
        println!("denied: {reason}");
    }

    Ok(match run.phase() {
        RunPhase::Promoted => OutcomeCategory::Success,
        _ => OutcomeCategory::Refusal,
    })
}

fn verify(run_dir: &Path) -> Result<OutcomeCategory> {
    let promotion_path = run_dir.join("PROMOTION.json");
    let bytes = std::fs::read(&promotion_path)
        .with_context(|| format!("Failed to read {}", promotion_path.display()))?;
    let promotion: PromotionResult = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {}", promotion_path.display()))?;

    let Some(token) = &promotion.token else {
        println!("no token: promotion was denied");
        return Ok(OutcomeCategory::Refusal);
    };

    let plan_hash = sha256_file(&run_dir.join("ROUTE_PLAN.json")).map_err(KernelError::from)?;
    let compliance_hash =
        sha256_file(&run_dir.join("COMPLIANCE_REPORT.json")).map_err(KernelError::from)?;
    let state = run_state_hash(&plan_hash, &compliance_hash);

    if state != promotion.run_state_hash {
        println!("mismatch: artifacts changed since the token was issued");
        return Ok(OutcomeCategory::Refusal);
    }
    if !verify_token(token, &promotion.run_id, &state) {
        println!("mismatch: token does not match run state");
        return Ok(OutcomeCategory::Refusal);
    }

    println!("valid: {token}");
    Ok(OutcomeCategory::Success)
}
