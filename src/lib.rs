//! MCP agent runner
//!
//! Points a tool-using language-model agent at the MCP servers declared in a
//! JSON configuration file, asks it one question within a step budget, prints
//! the answer and releases the server sessions.
//!
//! # Architecture
//!
//! - **Runner**: the setup → run → extract → cleanup lifecycle
//! - **Agent**: model/tool loop bounded by a step budget
//! - **LLM**: streaming drivers for the Anthropic Messages and Chat Completions APIs
//! - **MCP Client**: lazy sessions, tool discovery and execution via Model Context Protocol
//!
//! # Modules
//!
//! - [`agent`]: agent loop, step budget and run results
//! - [`config`]: environment loading, CLI and layered runner settings
//! - [`llm`]: LLM driver traits and implementations
//! - [`mcp`]: MCP client configuration and sessions
//! - [`normalized`]: unified streaming event model
//! - [`runner`]: lifecycle state machine and result printing

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::default_trait_access)]

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod normalized;
pub mod runner;
pub mod telemetry;

pub use error::{Result, RunnerError};

use crate::config::{Cli, RunnerConfig, Variant, load_llm_settings};
use crate::runner::Runner;

/// Run a variant end to end, printing the result to stdout.
///
/// Expects the environment to be loaded already (see [`config::load_environment`]).
pub async fn run_variant(variant: Variant, cli: &Cli) -> Result<()> {
    let config = RunnerConfig::load_with_cli(variant, cli)
        .map_err(|e| RunnerError::Config(anyhow::Error::new(e)))?;
    let settings = load_llm_settings(&config.model);

    tracing::info!(
        name: "runner.start",
        variant = ?variant,
        max_steps = %config.max_steps,
        ensure_cleanup = config.ensure_cleanup,
        "Starting runner"
    );

    let mut runner = Runner::new(config);
    let mut stdout = std::io::stdout().lock();
    runner.run(settings, &mut stdout).await
}
