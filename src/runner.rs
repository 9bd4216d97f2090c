//! Bounded agent-invocation lifecycle.
//!
//! `Idle → Configuring → Running → (Succeeded | Failed) → CleanedUp → Terminated`
//!
//! `CleanedUp` is only reached when cleanup is enabled and at least one
//! session was open.

use std::io::Write;
use std::sync::Arc;

use crate::agent::{Agent, AgentRun, RunResult};
use crate::config::{ResultExtraction, RunnerConfig};
use crate::error::{Result, RunnerError};
use crate::llm::{LlmSettings, ModelHandle};
use crate::mcp::McpClient;

/// Lifecycle state of a [`Runner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Configuring,
    Running,
    Succeeded,
    Failed,
    CleanedUp,
    Terminated,
}

/// Drives one agent run from configuration to cleanup.
#[derive(Debug)]
pub struct Runner {
    config: RunnerConfig,
    trail: Vec<RunState>,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            trail: vec![RunState::Idle],
        }
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        self.trail.last().copied().unwrap_or(RunState::Idle)
    }

    /// Every state visited so far, in order.
    pub fn trail(&self) -> &[RunState] {
        &self.trail
    }

    fn transition(&mut self, to: RunState) {
        tracing::debug!(name: "runner.state", from = ?self.state(), to = ?to, "Runner state change");
        self.trail.push(to);
    }

    /// Build the client, model and agent from configuration, then [`Runner::execute`].
    pub async fn run<W: Write>(&mut self, settings: LlmSettings, out: &mut W) -> Result<()> {
        self.transition(RunState::Configuring);

        let path = self.config.resolved_config_path();
        let client = match McpClient::from_config_file(&path) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                self.transition(RunState::Failed);
                self.transition(RunState::Terminated);
                return Err(RunnerError::Config(e));
            }
        };
        tracing::info!(
            name: "runner.configured",
            config = %path.display(),
            servers = ?client.server_names(),
            model = %settings.model,
            "MCP client created"
        );

        let model = ModelHandle::new(settings);
        let agent = Agent::builder(model, Arc::clone(&client))
            .max_steps(self.config.max_steps)
            .verbose(self.config.verbose)
            .disallowed_tools(self.config.disallowed_tools.clone())
            .build();

        self.execute(&client, &agent, out).await
    }

    /// Run the agent, print the extracted result and, when enabled, close the
    /// client's sessions whatever the outcome.
    ///
    /// A cleanup failure replaces the run's own outcome; a run error that is
    /// replaced this way is logged.
    pub async fn execute<A, W>(&mut self, client: &McpClient, agent: &A, out: &mut W) -> Result<()>
    where
        A: AgentRun + ?Sized,
        W: Write,
    {
        if self.state() == RunState::Idle {
            self.transition(RunState::Configuring);
        }
        self.transition(RunState::Running);

        let outcome = self.run_and_print(agent, out).await;
        match &outcome {
            Ok(()) => self.transition(RunState::Succeeded),
            Err(e) => {
                tracing::error!(error = %e, "Agent run failed");
                self.transition(RunState::Failed);
            }
        }

        if self.config.ensure_cleanup && client.has_sessions().await {
            if let Err(e) = client.close_all_sessions().await {
                if let Err(run_err) = &outcome {
                    tracing::error!(error = %run_err, "Run error superseded by cleanup failure");
                }
                self.transition(RunState::Terminated);
                return Err(RunnerError::Cleanup(e));
            }
            self.transition(RunState::CleanedUp);
        }

        self.transition(RunState::Terminated);
        outcome
    }

    async fn run_and_print<A, W>(&self, agent: &A, out: &mut W) -> Result<()>
    where
        A: AgentRun + ?Sized,
        W: Write,
    {
        let result = agent
            .run(&self.config.query, Some(self.config.max_steps))
            .await?;
        let text = extract(&result, self.config.extraction)?;
        write_result(out, &text, self.config.extraction)?;
        Ok(())
    }
}

/// Turn a run result into printable text.
pub fn extract(result: &RunResult, extraction: ResultExtraction) -> Result<String> {
    match extraction {
        ResultExtraction::Display => Ok(result.to_string()),
        ResultExtraction::FirstBlockText => match result {
            RunResult::Structured(blocks) => blocks
                .first()
                .map(|b| b.text.clone())
                .ok_or_else(|| RunnerError::ResultShape("result payload is empty".to_string())),
            RunResult::Text(_) => Err(RunnerError::ResultShape(
                "expected content blocks, got plain text".to_string(),
            )),
        },
    }
}

/// Print the result block for the extraction mode.
pub fn write_result<W: Write>(
    out: &mut W,
    text: &str,
    extraction: ResultExtraction,
) -> std::io::Result<()> {
    match extraction {
        ResultExtraction::FirstBlockText => writeln!(out, "\nRESULT:\n\n{text}\n\n")?,
        ResultExtraction::Display => writeln!(out, "\nResult: {text}")?,
    }
    out.flush()
}
