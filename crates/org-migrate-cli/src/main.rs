//! org-migrate CLI - plan, back up, reconcile and roll back record migrations.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use org_migrate::{Config, MigrateError, ObjectRole, Orchestrator, PlanScope, RunWindow};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "org-migrate")]
#[command(about = "Phase-ordered record migration planning, backup and rollback")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the phase graph
    Check,

    /// Write transfer plan documents
    Plan {
        /// Plan a single phase (default: every phase)
        #[arg(long)]
        phase: Option<u32>,
    },

    /// Look up missing source ids of the selected master records
    ResolveSelection,

    /// Snapshot target records a migration will touch
    Backup {
        /// Phase to back up (default: every phase)
        #[arg(long)]
        phase: Option<u32>,

        /// Back up the objects of this plan document instead of re-planning
        #[arg(long)]
        plan: Option<PathBuf>,
    },

    /// Identify records created by a completed migration
    Reconcile {
        /// Backup manifest of the migration
        #[arg(long)]
        manifest: PathBuf,

        /// When the migration started (RFC 3339)
        #[arg(long, requires = "finished_at")]
        started_at: Option<DateTime<Utc>>,

        /// When the migration finished (RFC 3339)
        #[arg(long, requires = "started_at")]
        finished_at: Option<DateTime<Utc>>,

        /// Username the migration wrote records as (default: target.username)
        #[arg(long)]
        username: Option<String>,
    },

    /// Write the rollback plan for a backup
    Rollback {
        /// Backup manifest of the migration
        #[arg(long)]
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);
    let orchestrator = Orchestrator::new(config)?;

    match cli.command {
        Commands::Check => {
            let graph = orchestrator.graph();
            if cli.output_json {
                let phases: Vec<_> = graph
                    .phases()
                    .iter()
                    .map(|phase| {
                        serde_json::json!({
                            "phase": phase.number,
                            "description": phase.description,
                            "objects": phase.entries.iter().map(|e| serde_json::json!({
                                "objectType": e.object_type,
                                "slave": e.role.is_slave(),
                            })).collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "valid": true,
                        "configHash": orchestrator.config().hash(),
                        "phases": phases,
                    }))?
                );
            } else {
                println!("Configuration is valid");
                for phase in graph.phases() {
                    println!("\nPhase {}: {}", phase.number, phase.description);
                    for entry in &phase.entries {
                        match &entry.role {
                            ObjectRole::Master => println!("  {} (master)", entry.object_type),
                            ObjectRole::Slave { parents } => {
                                let parents: Vec<String> = parents
                                    .iter()
                                    .map(|p| format!("{}.{}", p.parent, p.child_field))
                                    .collect();
                                println!("  {} (follows {})", entry.object_type, parents.join(", "));
                            }
                        }
                    }
                }
            }
        }

        Commands::Plan { phase } => {
            let scope = phase.map(PlanScope::Phase).unwrap_or(PlanScope::All);
            let written = orchestrator.plan(scope)?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&written)?);
            } else {
                for phase in &written {
                    println!(
                        "Phase {}: {} objects -> {}",
                        phase.phase,
                        phase.objects.len(),
                        phase.path.display()
                    );
                    for object in &phase.objects {
                        println!("  + {}", object);
                    }
                    for skipped in &phase.skipped {
                        println!("  - {} ({})", skipped.object_type, skipped.reason);
                    }
                }
            }
        }

        Commands::ResolveSelection => {
            let report = orchestrator.connect()?.resolve_selection().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Resolved selection for {} objects, completed with {} warnings",
                    report.objects.len(),
                    report.warnings.len()
                );
                for warning in &report.warnings {
                    println!("  ! {}: {}", warning.object_type, warning.message);
                }
            }
        }

        Commands::Backup { phase, plan } => {
            let outcome = orchestrator
                .connect()?
                .backup(phase, plan.as_deref())
                .await?;

            if cli.output_json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "manifestPath": outcome.manifest_path,
                        "manifest": outcome.manifest,
                        "warnings": outcome.warnings,
                    }))?
                );
            } else {
                println!("{}", outcome.summary());
                for object in &outcome.manifest.objects {
                    println!(
                        "  {} [{}]: {} records",
                        object.object_type, object.operation, object.record_count
                    );
                }
                for warning in &outcome.warnings {
                    println!("  ! {}: {}", warning.object_type, warning.message);
                }
            }
        }

        Commands::Reconcile {
            manifest,
            started_at,
            finished_at,
            username,
        } => {
            let window = match (started_at, finished_at) {
                (Some(started_at), Some(finished_at)) => {
                    if finished_at <= started_at {
                        return Err(MigrateError::Config(
                            "--finished-at must be after --started-at".to_string(),
                        ));
                    }
                    Some(RunWindow {
                        started_at,
                        finished_at,
                        username,
                    })
                }
                _ => None,
            };
            let outcome = orchestrator
                .connect()?
                .reconcile(&manifest, window)
                .await?;

            if cli.output_json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "reconciled": outcome.reconciled,
                        "warnings": outcome.warnings,
                    }))?
                );
            } else {
                println!("{}", outcome.summary());
                for object in &outcome.reconciled {
                    println!(
                        "  {}: {} created records ({:?}){}",
                        object.object_type,
                        object.created_count,
                        object.strategy,
                        if object.imprecise_actor { " [imprecise actor]" } else { "" }
                    );
                }
                for warning in &outcome.warnings {
                    println!("  ! {}: {}", warning.object_type, warning.message);
                }
            }
        }

        Commands::Rollback { manifest } => {
            let outcome = orchestrator.rollback(&manifest)?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&outcome.plan)?);
            } else {
                println!("{}", outcome.plan.summary());
                println!("  Plan: {}", outcome.plan_path.display());
                for object in &outcome.plan.objects {
                    println!(
                        "  {} {} -> {}",
                        object.object_type, object.original_operation, object.operation
                    );
                }
                for skipped in &outcome.plan.skipped {
                    println!("  - {} ({})", skipped.object_type, skipped.reason);
                }
            }
        }
    }

    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
