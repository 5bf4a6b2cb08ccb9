//! # nodeflow-cli
//!
//! Developer CLI for nodeflow: validate workflow JSON files and run them
//! locally over the in-memory run store with the built-in executors.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nodeflow_core::{Engine, ExecutorRegistry, Workflow};
use nodeflow_runstore::InMemoryRunStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "nodeflow")]
#[command(about = "nodeflow CLI - validate and run workflow graphs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow JSON file
    Validate {
        /// Path to the workflow file ({"nodes": [...], "edges": [...]})
        file: PathBuf,
    },

    /// Run a workflow
    Run {
        /// Path to the workflow file
        file: PathBuf,

        /// Trigger input as JSON
        #[arg(short, long)]
        input: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Run { file, input } => run(&file, input.as_deref()).await,
    }
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut workflow: Workflow =
        serde_json::from_str(&text).with_context(|| format!("invalid workflow in {}", file.display()))?;
    if workflow.id.is_empty() {
        workflow.id = file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow".to_string());
    }
    Ok(workflow)
}

fn validate(file: &Path) -> Result<()> {
    let workflow = load_workflow(file)?;
    workflow.validate()?;

    let entries: Vec<&str> = workflow
        .entry_nodes()
        .iter()
        .map(|n| n.id.as_str())
        .collect();
    println!(
        "✓ '{}' is valid: {} nodes, {} edges",
        workflow.id,
        workflow.nodes.len(),
        workflow.edges.len()
    );
    if entries.is_empty() {
        println!("  warning: no entry nodes; a run would finish immediately");
    } else {
        println!("  entry nodes: {}", entries.join(", "));
    }
    Ok(())
}

async fn run(file: &Path, input: Option<&str>) -> Result<()> {
    let workflow = load_workflow(file)?;
    let input = input
        .map(serde_json::from_str)
        .transpose()
        .context("invalid --input JSON")?;

    let mut registry = ExecutorRegistry::new();
    nodeflow_prebuilt::register_defaults(&mut registry);

    let engine = Engine::new(workflow, Arc::new(registry), Arc::new(InMemoryRunStore::new()))?;
    let outcome = engine.run(input).await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        bail!("run failed");
    }
    Ok(())
}
