//! Computation command handlers
//!
//! Start, stop and inspect computations directly against the scheduler store.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use flowline_core::domain::run::{ClusterSelection, RunState};
use flowline_core::domain::task::TaskState;
use flowline_core::dto::computation::StartComputation;
use flowline_scheduler::graph_source::StaticGraphSource;
use flowline_scheduler::service;
use uuid::Uuid;

use super::read_pipeline;
use crate::config::Config;

/// Computation subcommands
#[derive(Subcommand)]
pub enum ComputationCommands {
    /// Start a computation of the pipeline in a file
    Start {
        /// Path to the pipeline JSON file
        file: String,

        /// Id of the requesting user
        #[arg(short, long, env = "FLOWLINE_USER_ID", default_value = "0")]
        user: i64,

        /// Only run these nodes and their ancestors (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        nodes: Vec<String>,

        /// Rerun selected nodes even if identical outputs exist
        #[arg(short, long)]
        force: bool,

        /// Request on-demand capacity instead of the static cluster
        #[arg(long)]
        on_demand: bool,
    },
    /// Stop the latest computation of a project
    Stop {
        /// Project ID
        project: Uuid,
    },
    /// Show the latest computation of a project
    Status {
        /// Project ID
        project: Uuid,
    },
}

pub async fn handle_computation_command(command: ComputationCommands, config: &Config) -> Result<()> {
    match command {
        ComputationCommands::Start {
            file,
            user,
            nodes,
            force,
            on_demand,
        } => start_computation(config, &file, user, nodes, force, on_demand).await,
        ComputationCommands::Stop { project } => stop_computation(config, project).await,
        ComputationCommands::Status { project } => show_status(config, project).await,
    }
}

async fn start_computation(
    config: &Config,
    path: &str,
    user_id: i64,
    nodes: Vec<String>,
    force_rerun: bool,
    on_demand: bool,
) -> Result<()> {
    let graph = read_pipeline(path)?;
    let project_id = graph.project_id;
    let graphs = StaticGraphSource::from(graph);

    let req = StartComputation {
        project_id,
        user_id,
        node_subset: (!nodes.is_empty()).then_some(nodes),
        force_rerun,
        cluster_selection: if on_demand {
            ClusterSelection::OnDemand
        } else {
            ClusterSelection::Static
        },
    };

    let ctx = config.connect().await?;
    let run_id = service::start_computation(&ctx, &graphs, req)
        .await
        .context("Failed to start computation")?;

    println!("{}", "✓ Computation started".green().bold());
    println!("  Project: {}", project_id.to_string().cyan());
    println!("  Run:     {}", run_id.to_string().cyan());
    Ok(())
}

async fn stop_computation(config: &Config, project_id: Uuid) -> Result<()> {
    let ctx = config.connect().await?;
    service::stop_computation(&ctx, project_id)
        .await
        .context("Failed to stop computation")?;

    println!("{}", "✓ Computation stopped".green().bold());
    Ok(())
}

async fn show_status(config: &Config, project_id: Uuid) -> Result<()> {
    let ctx = config.connect().await?;
    let status = service::get_computation_status(&ctx, project_id)
        .await
        .context("Failed to fetch computation status")?;

    let run = &status.run;
    println!("{}", "Computation".bold());
    println!("  Run:       {}", run.id.to_string().cyan());
    println!("  Iteration: {}", run.iteration);
    println!("  State:     {}", colorize_run_state(run.state));
    println!("  Cluster:   {}", run.cluster_selection.as_str());
    println!("  Created:   {}", run.created_at.to_rfc3339().dimmed());
    if let Some(ended_at) = run.ended_at {
        println!("  Ended:     {}", ended_at.to_rfc3339().dimmed());
    }
    if run.cancel_requested && !run.state.is_terminal() {
        println!("  {}", "Cancellation requested".yellow());
    }

    println!();
    println!(
        "{:<24} {:<24} {:>7} {:>9}",
        "NODE".bold(),
        "STATE".bold(),
        "ATTEMPT".bold(),
        "PROGRESS".bold()
    );
    println!("{}", "─".repeat(68).dimmed());
    for task in &status.tasks {
        println!(
            "{:<24} {:<24} {:>7} {:>8.0}%",
            task.node_id,
            colorize_task_state(task.state),
            task.attempt_count,
            task.progress * 100.0
        );
        if let Some(error) = &task.error {
            println!("  {} {}", "↳".dimmed(), error.message.red());
        }
    }

    Ok(())
}

fn colorize_run_state(state: RunState) -> ColoredString {
    let text = state.as_str();
    match state {
        RunState::Success => text.green(),
        RunState::Failed => text.red(),
        RunState::Aborted => text.yellow(),
        RunState::Started | RunState::Pending => text.blue(),
        _ => text.normal(),
    }
}

fn colorize_task_state(state: TaskState) -> ColoredString {
    let text = state.as_str();
    match state {
        TaskState::Success => text.green(),
        TaskState::Failed => text.red(),
        TaskState::Aborted => text.yellow(),
        TaskState::Started | TaskState::Pending => text.blue(),
        TaskState::Retry | TaskState::Unknown => text.magenta(),
        _ => text.dimmed(),
    }
}
