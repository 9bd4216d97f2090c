use crate::agent::StepBudget;
use crate::llm::{DEFAULT_MAX_TOKENS, LlmProtocol, LlmSettings, Provider};
use clap::Parser;
use config::{Config, Environment};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Model used by both runners.
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20240620";

/// Query asked by both runners.
pub const DEFAULT_QUERY: &str = "Find the best restaurant in London USING GOOGLE SEARCH";

/// Directory relative configuration paths are resolved against.
pub const RUNNER_DIR: &str = env!("CARGO_MANIFEST_DIR");

/// Optional overrides. Running without arguments reproduces the fixed behavior.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// MCP configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum number of agent steps
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// Query to run instead of the built-in one
    #[arg(long)]
    pub query: Option<String>,

    /// Model identifier
    #[arg(long, env = "LLM_MODEL")]
    pub model: Option<String>,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// How the run result is turned into printable text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultExtraction {
    /// Text of the first block of a structured result.
    FirstBlockText,
    /// The result as-is.
    Display,
}

/// The two fixed runner setups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Browser search: 30 steps, first-block extraction, guaranteed cleanup.
    Browser,
    /// Basic: 10 steps, whole result printed, no cleanup.
    Basic,
}

impl Variant {
    fn config_path(self) -> &'static str {
        match self {
            Self::Browser => "config/browser_mcp.json",
            Self::Basic => "browser_mcp.json",
        }
    }

    fn max_steps(self) -> i64 {
        match self {
            Self::Browser => 30,
            Self::Basic => 10,
        }
    }

    fn extraction(self) -> &'static str {
        match self {
            Self::Browser => "first_block_text",
            Self::Basic => "display",
        }
    }

    fn ensure_cleanup(self) -> bool {
        matches!(self, Self::Browser)
    }
}

/// Immutable settings for one run.
#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    pub config_path: PathBuf,
    pub model: String,
    pub query: String,
    pub max_steps: StepBudget,
    pub verbose: bool,
    pub ensure_cleanup: bool,
    pub extraction: ResultExtraction,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
}

impl RunnerConfig {
    /// Fixed settings of a variant, ignoring environment and arguments.
    pub fn for_variant(variant: Variant) -> Result<Self, config::ConfigError> {
        Self::builder(variant)?.build()?.try_deserialize()
    }

    /// Layering: variant defaults, then `MCP_RUNNER__*` variables, then CLI.
    pub fn load_from_args<I, T>(variant: Variant, args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Self::load_with_cli(variant, &cli)
    }

    pub fn load_with_cli(variant: Variant, cli: &Cli) -> Result<Self, config::ConfigError> {
        let mut builder = Self::builder(variant)?.add_source(
            Environment::with_prefix("MCP_RUNNER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("disallowed_tools"),
        );

        if let Some(path) = &cli.config {
            // Paths given on the command line are relative to the working directory.
            let path = if path.is_relative() {
                std::env::current_dir()
                    .map_err(|e| config::ConfigError::Message(e.to_string()))?
                    .join(path)
            } else {
                path.clone()
            };
            builder = builder.set_override("config_path", path.to_string_lossy().to_string())?;
        }
        if let Some(steps) = cli.max_steps {
            builder = builder.set_override("max_steps", steps as u64)?;
        }
        if let Some(query) = &cli.query {
            builder = builder.set_override("query", query.clone())?;
        }
        if let Some(model) = &cli.model {
            builder = builder.set_override("model", model.clone())?;
        }
        if cli.quiet {
            builder = builder.set_override("verbose", false)?;
        }

        builder.build()?.try_deserialize()
    }

    fn builder(
        variant: Variant,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        Config::builder()
            .set_default("config_path", variant.config_path())?
            .set_default("model", DEFAULT_MODEL)?
            .set_default("query", DEFAULT_QUERY)?
            .set_default("max_steps", variant.max_steps())?
            .set_default("verbose", true)?
            .set_default("ensure_cleanup", variant.ensure_cleanup())?
            .set_default("extraction", variant.extraction())?
            .set_default("disallowed_tools", Vec::<String>::new())
    }

    /// Configuration path, with relative paths resolved against [`RUNNER_DIR`].
    pub fn resolved_config_path(&self) -> PathBuf {
        if self.config_path.is_absolute() {
            self.config_path.clone()
        } else {
            Path::new(RUNNER_DIR).join(&self.config_path)
        }
    }
}

/// Load `.env` next to the runner's configuration, falling back to the
/// working directory or its parents. Variables that are already set keep
/// their values, so repeated calls are harmless.
pub fn load_environment() -> Option<PathBuf> {
    load_environment_in(RUNNER_DIR)
}

/// Load `dir/.env` if it exists, otherwise search from the working directory.
/// Returns the file that was loaded.
pub fn load_environment_in(dir: impl AsRef<Path>) -> Option<PathBuf> {
    let path = dir.as_ref().join(".env");
    match dotenvy::from_path(&path) {
        Ok(()) => Some(path),
        Err(e) if e.not_found() => dotenvy::dotenv().ok(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to load environment file");
            dotenvy::dotenv().ok()
        }
    }
}

/// Load a specific env file without overriding variables that are already set.
pub fn load_environment_from(path: impl AsRef<Path>) -> anyhow::Result<()> {
    dotenvy::from_path(path.as_ref())?;
    Ok(())
}

/// Build model settings for `model` from the environment. Nothing is
/// validated: a missing key only fails once the model is called.
pub fn load_llm_settings(model: &str) -> LlmSettings {
    let base_url = std::env::var("LLM_BASE_URL")
        .ok()
        .filter(|s| !s.trim().is_empty());

    let provider = base_url
        .as_deref()
        .map_or(Provider::Anthropic, Provider::detect_from_url);
    let base_url = base_url.unwrap_or_else(|| provider.default_base_url().to_string());

    let key_var = match provider {
        Provider::Anthropic => "ANTHROPIC_API_KEY",
        _ => "OPENAI_API_KEY",
    };
    let api_key = std::env::var(key_var)
        .or_else(|_| std::env::var("LLM_API_KEY"))
        .ok()
        .filter(|s| !s.trim().is_empty());

    let protocol = std::env::var("LLM_PROTOCOL")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LlmProtocol::Auto);

    let max_tokens = std::env::var("LLM_MAX_TOKENS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_MAX_TOKENS);

    LlmSettings {
        base_url,
        api_key,
        model: model.to_string(),
        protocol,
        provider,
        max_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_defaults() {
        let browser = RunnerConfig::for_variant(Variant::Browser).unwrap();
        assert_eq!(browser.max_steps.get(), 30);
        assert!(browser.ensure_cleanup);
        assert_eq!(browser.extraction, ResultExtraction::FirstBlockText);
        assert_eq!(browser.config_path, PathBuf::from("config/browser_mcp.json"));
        assert_eq!(browser.model, DEFAULT_MODEL);
        assert_eq!(browser.query, DEFAULT_QUERY);
        assert!(browser.verbose);

        let basic = RunnerConfig::for_variant(Variant::Basic).unwrap();
        assert_eq!(basic.max_steps.get(), 10);
        assert!(!basic.ensure_cleanup);
        assert_eq!(basic.extraction, ResultExtraction::Display);
        assert_eq!(basic.config_path, PathBuf::from("browser_mcp.json"));
    }

    #[test]
    fn test_relative_path_resolves_against_runner_dir() {
        let cfg = RunnerConfig::for_variant(Variant::Basic).unwrap();
        assert_eq!(
            cfg.resolved_config_path(),
            Path::new(RUNNER_DIR).join("browser_mcp.json")
        );
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli {
            config: Some(PathBuf::from("/tmp/other.json")),
            max_steps: Some(3),
            query: Some("q".to_string()),
            model: None,
            quiet: true,
        };
        let cfg = RunnerConfig::load_with_cli(Variant::Browser, &cli).unwrap();
        assert_eq!(cfg.resolved_config_path(), PathBuf::from("/tmp/other.json"));
        assert_eq!(cfg.max_steps.get(), 3);
        assert_eq!(cfg.query, "q");
        assert!(!cfg.verbose);
        assert!(cfg.ensure_cleanup);
    }

    #[test]
    fn test_zero_steps_rejected() {
        let cli = Cli {
            max_steps: Some(0),
            ..Cli::default()
        };
        assert!(RunnerConfig::load_with_cli(Variant::Basic, &cli).is_err());
    }
}
