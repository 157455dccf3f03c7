use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Operator and demo front end for the layered task-pool dispatcher.
#[derive(Debug, Parser)]
#[command(name = "layerpool", version, about)]
pub struct CliArgs {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "LAYERPOOL_LOG", default_value = "info", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the per-layer pool sizing table.
    Layers {
        /// CPU count to size for (defaults to the detected count).
        #[arg(long)]
        cpus: Option<usize>,
    },

    /// Run simulated work through every layer and print metrics as JSON.
    Demo {
        /// TOML dispatcher config.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of tasks to submit.
        #[arg(long, default_value_t = 200)]
        tasks: usize,

        /// Percentage of attempts that fail.
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u8).range(0..=100))]
        fail_rate: u8,
    },
}
