//! Pipeline command handlers
//!
//! Offline checks of pipeline files.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use flowline_core::dag::{PipelineDag, Selection};

use super::read_pipeline;

/// Pipeline subcommands
#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Validate a pipeline file and print its execution order
    Validate {
        /// Path to the pipeline JSON file
        file: String,

        /// Only check these nodes and their ancestors (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        nodes: Vec<String>,
    },
}

pub fn handle_pipeline_command(command: PipelineCommands) -> Result<()> {
    match command {
        PipelineCommands::Validate { file, nodes } => validate_pipeline(&file, nodes),
    }
}

fn validate_pipeline(path: &str, nodes: Vec<String>) -> Result<()> {
    let graph = read_pipeline(path)?;
    let selection = Selection {
        nodes: (!nodes.is_empty()).then_some(nodes),
        force_rerun: false,
    };

    let dag = match PipelineDag::build(&graph, &selection) {
        Ok(dag) => dag,
        Err(e) => {
            println!("{} {}", "✗ Invalid pipeline:".red().bold(), e);
            anyhow::bail!("pipeline validation failed");
        }
    };

    println!("{}", "✓ Pipeline is valid".green().bold());
    println!("  Project: {}", graph.project_id.to_string().cyan());
    println!("  Nodes:   {}", dag.len());
    println!();
    println!("{}", "Execution order:".bold());
    for (i, node) in dag.nodes().iter().enumerate() {
        let upstream = if node.upstream.is_empty() {
            String::new()
        } else {
            format!("(after {})", node.upstream.join(", "))
        };
        println!(
            "  {:>3}. {} {} {}",
            i + 1,
            node.id().cyan(),
            node.spec.image.to_string().dimmed(),
            upstream.dimmed()
        );
    }

    Ok(())
}
