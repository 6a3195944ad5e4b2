//! Command-line interface of `ferryman`, built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--max-workflows`, `-v`)
//! and a [`Command`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Orchestrates dataset transfers to cloud object storage.
#[derive(Debug, Parser)]
#[command(name = "ferryman", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the orchestrator configuration (defaults to ./ferryman.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides max_concurrent_workflows from the configuration.
    #[arg(long, global = true)]
    pub max_workflows: Option<usize>,

    /// Raises log verbosity; repeat for more (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Default tracing filter directive for the chosen verbosity.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolves every workflow in a project file and prints its step plan.
    Validate {
        /// Project definition, JSON or TOML.
        file: PathBuf,
    },

    /// Runs a simulated workflow end to end.
    Demo {
        /// Simulate a dataset that should be bundled before upload.
        #[arg(long)]
        bundle: bool,

        /// Number of transient engine failures to inject into the transfer.
        #[arg(long, default_value_t = 0)]
        failures: u32,
    },

    /// Lists stored pipeline definitions.
    Pipelines,

    /// Prints one stored pipeline definition.
    ShowPipeline {
        id: String,
    },
}
