//! `dualgpu config` command implementation

use crate::context::CliContext;

/// Print the effective configuration as JSON.
pub fn run(ctx: &CliContext) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&ctx.config)?);
    Ok(())
}
