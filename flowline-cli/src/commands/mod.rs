//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod computation;
mod pipeline;

pub use computation::ComputationCommands;
pub use pipeline::PipelineCommands;

use anyhow::{Context, Result};
use clap::Subcommand;
use flowline_core::domain::pipeline::ProjectGraph;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start, stop and inspect computations
    Computation {
        #[command(subcommand)]
        command: ComputationCommands,
    },
    /// Pipeline file tools
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
}

/// Route a command to its handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Computation { command } => {
            computation::handle_computation_command(command, config).await
        }
        Commands::Pipeline { command } => pipeline::handle_pipeline_command(command),
    }
}

/// Read a project graph from a JSON pipeline file
fn read_pipeline(path: &str) -> Result<ProjectGraph> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse pipeline file: {}", path))
}
