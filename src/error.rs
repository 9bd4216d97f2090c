//! Error types for the runner.

use thiserror::Error;

/// Failure of one agent run, from configuration through cleanup.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Configuration file or settings could not be loaded.
    #[error("Configuration error: {0:#}")]
    Config(#[source] anyhow::Error),

    /// The agent was asked to run with a step budget of zero.
    #[error("Step budget must be at least 1, got {0}")]
    InvalidStepBudget(usize),

    /// A tool server session could not be opened.
    #[error("Failed to open MCP session '{server}': {source:#}")]
    Session {
        /// Server name from the configuration file.
        server: String,
        /// Underlying transport or handshake error.
        #[source]
        source: anyhow::Error,
    },

    /// Tool discovery on the open sessions failed.
    #[error("Tool discovery failed: {0:#}")]
    Tools(#[source] anyhow::Error),

    /// The model backend failed (network, authentication, rate limiting).
    #[error("Model error: {0:#}")]
    Model(#[source] anyhow::Error),

    /// The agent used every step without producing a final answer.
    #[error("Agent stopped after reaching the maximum number of steps ({steps})")]
    StepBudgetExhausted {
        /// Number of steps performed.
        steps: usize,
    },

    /// The result did not have the shape the extraction expected.
    #[error("Unexpected result shape: {0}")]
    ResultShape(String),

    /// Closing the client's sessions failed.
    #[error("Failed to close MCP sessions: {0:#}")]
    Cleanup(#[source] anyhow::Error),

    /// Writing the result failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;
