//! CLI command definitions using clap

use crate::output::OutputFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// DualGPU - keep LLM engines warm across GPUs
#[derive(Parser)]
#[command(name = "dualgpu")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json, table)
    #[arg(short = 'o', long, global = true, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short = 'c', long, global = true, env = "DUALGPU_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine pool until Ctrl-C
    Serve,

    /// Load a model through the pool and run one prompt
    Run {
        /// Model path or hub id
        model: String,

        /// Backend kind (llamacpp, vllm, transformers, mock, auto)
        #[arg(short, long, default_value = "auto")]
        backend: String,

        /// Launch parameter as key=value; repeatable
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Prompt to send once the model is loaded
        #[arg(long, default_value = "Hello, how are you today?")]
        prompt: String,

        /// Maximum tokens to generate
        #[arg(long, default_value_t = 64)]
        max_tokens: u32,
    },

    /// Query or clear benchmark history
    #[command(subcommand)]
    Bench(BenchCommands),

    /// Show GPU telemetry from nvidia-smi
    Gpus,

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
pub enum BenchCommands {
    /// Most recent records for one model label
    Recent {
        /// Model label, e.g. `/models/m.gguf@llamacpp`
        label: String,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Models ranked by average tokens per second
    Fastest {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Delete records for one label, or all records
    Clear {
        label: Option<String>,
    },
}
