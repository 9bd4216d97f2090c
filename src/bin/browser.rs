//! Browser runner: 30 steps, prints the first content block, always closes
//! the MCP sessions it opened.

use std::process::ExitCode;

use clap::Parser;
use mimalloc::MiMalloc;

use mcp_runner::config::{Cli, Variant, load_environment};

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    let env_file = load_environment();
    let cli = Cli::parse();
    mcp_runner::telemetry::init(!cli.quiet);

    if let Some(path) = env_file {
        tracing::debug!(path = %path.display(), "Loaded environment file");
    }

    match mcp_runner::run_variant(Variant::Browser, &cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
