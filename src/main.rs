//! Topicflow - file-backed workflow orchestration.
//!
//! Thin command-line front-end over the workflow state machine.

#![allow(clippy::single_match_else)]

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use topicflow::core::Config;
use topicflow::workflow::{parse_result, StepBackup, StepCompletion, WorkflowDefinition};
use topicflow::App;

/// File-backed workflow orchestration for topics
#[derive(Parser)]
#[command(name = "topicflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the default locations
    #[arg(short, long, global = true, env = "TOPICFLOW_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the workflow document for a topic
    Init {
        /// Topic identifier
        topic: String,
    },

    /// Show workflow progress
    Status {
        /// Topic identifier
        topic: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the next pending step
    Next {
        /// Topic identifier
        topic: String,
    },

    /// Check whether a step's dependencies are completed
    Deps {
        /// Topic identifier
        topic: String,

        /// Step identifier
        step: String,
    },

    /// Mark a step as in progress
    Start {
        /// Topic identifier
        topic: String,

        /// Step identifier
        step: String,
    },

    /// Mark a step as completed with a JSON result
    Complete {
        /// Topic identifier
        topic: String,

        /// Step identifier
        step: String,

        /// Result object, e.g. '{"files": 3}'
        #[arg(default_value = "{}")]
        result: String,
    },

    /// Mark a step as failed
    Fail {
        /// Topic identifier
        topic: String,

        /// Step identifier
        step: String,

        /// Error message
        message: String,
    },

    /// Print a JSON snapshot of a step for later rollback
    Backup {
        /// Topic identifier
        topic: String,

        /// Step identifier
        step: String,
    },

    /// Restore a step from a snapshot printed by `backup`
    Rollback {
        /// Topic identifier
        topic: String,

        /// Step identifier
        step: String,

        /// Snapshot JSON
        backup: String,
    },

    /// Report whether a step is safe to re-run
    Idempotent {
        /// Topic identifier
        topic: String,

        /// Step identifier
        step: String,
    },

    /// Show the audit log
    Audit {
        /// Topic identifier
        topic: String,

        /// Only show the most recent entries
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the steps of the workflow definition grouped into parallel levels
    Plan,

    /// Validate a workflow definition
    Validate {
        /// Definition file (defaults to the configured one)
        path: Option<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Completions { shell } => {
            cmd_completions(shell);
            Ok(())
        }
        Commands::Validate { path } => cmd_validate(cli.config.as_ref(), path),
        command => {
            let app = load_app(cli.config.as_ref())?;
            run(&app, command)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_file(path),
        None => Config::load(),
    }
}

fn load_app(config_path: Option<&PathBuf>) -> Result<App> {
    App::from_config(load_config(config_path)?)
}

fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Init { topic } => cmd_init(app, &topic),
        Commands::Status { topic, format } => cmd_status(app, &topic, &format),
        Commands::Next { topic } => cmd_next(app, &topic),
        Commands::Deps { topic, step } => cmd_deps(app, &topic, &step),
        Commands::Start { topic, step } => cmd_start(app, &topic, &step),
        Commands::Complete { topic, step, result } => cmd_complete(app, &topic, &step, &result),
        Commands::Fail { topic, step, message } => cmd_fail(app, &topic, &step, &message),
        Commands::Backup { topic, step } => cmd_backup(app, &topic, &step),
        Commands::Rollback { topic, step, backup } => cmd_rollback(app, &topic, &step, &backup),
        Commands::Idempotent { topic, step } => cmd_idempotent(app, &topic, &step),
        Commands::Audit { topic, limit, format } => cmd_audit(app, &topic, limit, &format),
        Commands::Plan => cmd_plan(app),
        Commands::Validate { .. } | Commands::Completions { .. } => Ok(()),
    }
}

/// Create a topic's workflow document.
fn cmd_init(app: &App, topic: &str) -> Result<()> {
    let doc = app.workflow.initialize(topic)?;
    println!(
        "Initialized workflow for '{topic}': {} phases, {} steps",
        doc.phases.len(),
        doc.total_steps()
    );
    println!("  Document: {}", app.workflow.document_path(topic).display());
    if let Some(step) = &doc.current_step {
        println!("  First step: {step}");
    }
    Ok(())
}

/// Show progress.
fn cmd_status(app: &App, topic: &str, format: &str) -> Result<()> {
    let status = app.workflow.status(topic)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        _ => {
            println!("Topic: {}", status.topic);
            println!("Current phase: {}", status.current_phase.as_deref().unwrap_or("-"));
            println!("Current step: {}", status.current_step.as_deref().unwrap_or("-"));
            println!("Progress: {}/{} steps", status.completed_steps, status.total_steps);
            println!();
            for phase in &status.phases {
                println!(
                    "  {:<13} {} {}/{} ({}%)",
                    format!("[{}]", phase.status),
                    phase.phase_id,
                    phase.completed,
                    phase.total,
                    phase.percent()
                );
            }
            if status.complete {
                println!("\nWorkflow complete");
            }
        }
    }
    Ok(())
}

/// Print the next pending step.
fn cmd_next(app: &App, topic: &str) -> Result<()> {
    match app.workflow.next_pending_step(topic)? {
        Some(step) => println!("{step}"),
        None => println!("All steps completed"),
    }
    Ok(())
}

/// Check dependencies; exits with 1 when they are not satisfied.
fn cmd_deps(app: &App, topic: &str, step: &str) -> Result<()> {
    let check = app.workflow.validate_dependencies(topic, step)?;
    println!("{}", check.reason);
    if !check.valid {
        std::process::exit(1);
    }
    Ok(())
}

/// Mark a step as started.
fn cmd_start(app: &App, topic: &str, step: &str) -> Result<()> {
    let started = app.workflow.start(topic, step)?;
    println!("Step {} is {}", started.id, started.status);
    Ok(())
}

/// Complete a step; exits with 1 when its criteria are not met.
fn cmd_complete(app: &App, topic: &str, step: &str, raw: &str) -> Result<()> {
    let result = parse_result(raw).context("Invalid step result")?;

    match app.workflow.complete(topic, step, result)? {
        StepCompletion::Completed { phase_completed, workflow_completed, next_step } => {
            println!("Step {step} completed");
            if phase_completed {
                println!("Phase completed");
            }
            if workflow_completed {
                println!("Workflow completed");
            } else if let Some(next) = next_step {
                println!("Next step: {next}");
            }
            Ok(())
        }
        StepCompletion::Rejected { failed_criteria } => {
            eprintln!("Completion criteria not met for {step}: {}", failed_criteria.join(", "));
            std::process::exit(1);
        }
    }
}

/// Mark a step as failed.
fn cmd_fail(app: &App, topic: &str, step: &str, message: &str) -> Result<()> {
    app.workflow.fail(topic, step, message)?;
    println!("Step {step} marked as failed");
    Ok(())
}

/// Print a step snapshot as JSON; `{}` when the step does not exist.
fn cmd_backup(app: &App, topic: &str, step: &str) -> Result<()> {
    match app.workflow.backup(topic, step)? {
        Some(backup) => println!("{}", serde_json::to_string_pretty(&backup)?),
        None => println!("{{}}"),
    }
    Ok(())
}

/// Restore a step from a snapshot.
fn cmd_rollback(app: &App, topic: &str, step: &str, raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw).context("Invalid backup JSON")?;
    let backup: Option<StepBackup> = match value {
        Value::Null => None,
        Value::Object(ref map) if map.is_empty() => None,
        other => Some(serde_json::from_value(other).context("Invalid backup JSON")?),
    };

    if app.workflow.rollback(topic, step, backup.as_ref())? {
        println!("Step {step} rolled back");
    } else {
        println!("Nothing to roll back for {step}");
    }
    Ok(())
}

/// Print whether a step is safe to re-run.
fn cmd_idempotent(app: &App, topic: &str, step: &str) -> Result<()> {
    println!("{}", app.workflow.is_step_idempotent(topic, step)?);
    Ok(())
}

/// Show the audit log.
fn cmd_audit(app: &App, topic: &str, limit: Option<usize>, format: &str) -> Result<()> {
    let entries = app.workflow.audit_log(topic, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            for entry in &entries {
                let details = if entry.details.is_empty() {
                    String::new()
                } else {
                    Value::Object(entry.details.clone()).to_string()
                };
                println!(
                    "{} {:<7} {:<11} {}/{} {}",
                    entry.timestamp.to_rfc3339(),
                    entry.level.to_string(),
                    entry.action.to_string(),
                    entry.phase_id,
                    entry.step_id,
                    details
                );
            }
            println!("\nTotal: {} entries", entries.len());
        }
    }
    Ok(())
}

/// Print execution levels of the configured definition.
fn cmd_plan(app: &App) -> Result<()> {
    for (idx, level) in app.plan()?.iter().enumerate() {
        let steps: Vec<&str> = level.iter().map(String::as_str).collect();
        println!("Level {}: {}", idx + 1, steps.join(", "));
    }
    Ok(())
}

/// Validate a definition file.
fn cmd_validate(config_path: Option<&PathBuf>, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => load_config(config_path)?.definition_path(),
    };

    let definition = WorkflowDefinition::load(&path)?;
    println!(
        "Workflow definition is valid: {} phases, {} steps",
        definition.phases().len(),
        definition.total_steps()
    );
    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "topicflow", &mut io::stdout());
}
