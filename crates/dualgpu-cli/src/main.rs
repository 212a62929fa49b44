//! DualGPU CLI - run, serve and benchmark pooled LLM engines

mod cli;
mod commands;
mod config;
mod context;
mod output;

use clap::Parser;
use cli::{BenchCommands, Cli, Commands};
use colored::Colorize;
use context::CliContext;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    if let Err(err) = rt.block_on(run_command_async(cli)) {
        eprintln!("{} {:#}", "error:".red().bold(), err);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_command_async(cli: Cli) -> anyhow::Result<()> {
    let ctx = CliContext::load(cli.config.as_deref(), cli.output)?;

    match cli.command {
        Commands::Serve => commands::serve::run(&ctx).await?,

        Commands::Run {
            model,
            backend,
            params,
            prompt,
            max_tokens,
        } => {
            commands::run::run(&ctx, &model, &backend, &params, &prompt, max_tokens).await?;
        }

        Commands::Bench(bench) => match bench {
            BenchCommands::Recent { label, limit } => {
                commands::bench::recent(&ctx, &label, limit).await?;
            }
            BenchCommands::Fastest { limit } => commands::bench::fastest(&ctx, limit).await?,
            BenchCommands::Clear { label } => {
                commands::bench::clear(&ctx, label.as_deref()).await?;
            }
        },

        Commands::Gpus => commands::gpus::run(&ctx).await?,

        Commands::Config => commands::config::run(&ctx)?,
    }

    Ok(())
}
