//! Basic runner: 10 steps, prints the whole result, leaves sessions open.

use std::process::ExitCode;

use clap::Parser;
use mimalloc::MiMalloc;

use mcp_runner::config::{Cli, Variant, load_environment};

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env (if present) before clap reads env-backed flags.
    let env_file = load_environment();
    let cli = Cli::parse();
    mcp_runner::telemetry::init(!cli.quiet);

    if let Some(path) = env_file {
        tracing::debug!(path = %path.display(), "Loaded environment file");
    }

    match mcp_runner::run_variant(Variant::Basic, &cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
