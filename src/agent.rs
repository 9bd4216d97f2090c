//! Tool-using agent bounded by a step budget.
//!
//! One step is one model call plus execution of the tool calls it requested:
//! 1. Send the conversation and the available tools to the model
//! 2. Collect assistant text and completed tool calls from the stream
//! 3. No tool calls: the text is the final answer
//! 4. Otherwise execute the calls via MCP, append the results, next step
//!
//! The run fails with [`RunnerError::StepBudgetExhausted`] when the budget is
//! used up without a final answer.

use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RunnerError};
use crate::llm::{LlmRequest, Message, ModelHandle, ToolCall, ToolCallFunction};
use crate::mcp::McpClient;
use crate::normalized::NormalizedEvent;

/// Prompt used when the caller does not provide one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to tools \
provided by MCP servers. Use them to gather the information needed to answer the user's \
request, then give a concise final answer without calling further tools.";

/// Maximum number of steps an agent may take. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct StepBudget(NonZeroUsize);

impl StepBudget {
    /// # Errors
    ///
    /// Returns [`RunnerError::InvalidStepBudget`] for zero.
    pub fn new(steps: usize) -> Result<Self> {
        NonZeroUsize::new(steps)
            .map(Self)
            .ok_or(RunnerError::InvalidStepBudget(steps))
    }

    #[must_use]
    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl TryFrom<usize> for StepBudget {
    type Error = RunnerError;

    fn try_from(steps: usize) -> Result<Self> {
        Self::new(steps)
    }
}

impl From<StepBudget> for usize {
    fn from(budget: StepBudget) -> Self {
        budget.get()
    }
}

impl fmt::Display for StepBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One block of the final answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ContentBlock {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

/// Outcome of one [`AgentRun::run`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// Sequence of content blocks.
    Structured(Vec<ContentBlock>),
    /// Plain string.
    Text(String),
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Structured(blocks) => {
                for (i, block) in blocks.iter().enumerate() {
                    if i > 0 {
                        f.write_str("\n")?;
                    }
                    f.write_str(&block.text)?;
                }
                Ok(())
            }
        }
    }
}

/// Something that answers a query within a step budget.
#[async_trait]
pub trait AgentRun: Send + Sync {
    /// Run `query`. `max_steps` overrides the agent's own budget.
    async fn run(&self, query: &str, max_steps: Option<StepBudget>) -> Result<RunResult>;
}

/// Agent bound to a model and an MCP client.
pub struct Agent {
    model: ModelHandle,
    client: Arc<McpClient>,
    max_steps: StepBudget,
    verbose: bool,
    system_prompt: String,
    disallowed_tools: HashSet<String>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.model.model_id())
            .field("client", &self.client)
            .field("max_steps", &self.max_steps)
            .field("verbose", &self.verbose)
            .field("disallowed_tools", &self.disallowed_tools)
            .finish()
    }
}

/// Builder for [`Agent`].
#[derive(Debug)]
pub struct AgentBuilder {
    model: ModelHandle,
    client: Arc<McpClient>,
    max_steps: StepBudget,
    verbose: bool,
    system_prompt: Option<String>,
    disallowed_tools: HashSet<String>,
}

impl AgentBuilder {
    #[must_use]
    pub fn max_steps(mut self, max_steps: StepBudget) -> Self {
        self.max_steps = max_steps;
        self
    }

    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Tools (namespaced or raw names) the agent must neither see nor call.
    #[must_use]
    pub fn disallowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disallowed_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn build(self) -> Agent {
        Agent {
            model: self.model,
            client: self.client,
            max_steps: self.max_steps,
            verbose: self.verbose,
            system_prompt: self
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            disallowed_tools: self.disallowed_tools,
        }
    }
}

/// Assistant output of one model call.
#[derive(Debug, Default)]
struct Turn {
    text: String,
    tool_calls: Vec<ToolCall>,
}

impl Agent {
    /// Start building an agent. The default budget is 5 steps.
    #[must_use]
    pub fn builder(model: ModelHandle, client: Arc<McpClient>) -> AgentBuilder {
        AgentBuilder {
            model,
            client,
            max_steps: StepBudget(NonZeroUsize::MIN.saturating_add(4)),
            verbose: false,
            system_prompt: None,
            disallowed_tools: HashSet::new(),
        }
    }

    fn is_disallowed(&self, namespaced: &str, raw: &str) -> bool {
        self.disallowed_tools.contains(namespaced) || self.disallowed_tools.contains(raw)
    }

    /// Open every configured session unless some are already open.
    async fn ensure_sessions(&self) -> Result<()> {
        if self.client.has_sessions().await {
            return Ok(());
        }
        self.client.create_all_sessions().await
    }

    /// Drain one model response.
    async fn next_turn(&self, req: LlmRequest) -> Result<Turn> {
        let stream = self.model.stream(req).await.map_err(RunnerError::Model)?;
        futures::pin_mut!(stream);

        let mut turn = Turn::default();
        while let Some(event) = stream.next().await {
            match event.map_err(RunnerError::Model)? {
                NormalizedEvent::MessageDelta { text } => turn.text.push_str(&text),
                NormalizedEvent::ToolCallComplete {
                    id,
                    name,
                    arguments_json,
                    ..
                } => turn.tool_calls.push(ToolCall {
                    id,
                    call_type: "function".to_string(),
                    function: ToolCallFunction {
                        name,
                        arguments: arguments_json,
                    },
                }),
                NormalizedEvent::Error { message, code } => {
                    return Err(RunnerError::Model(match code {
                        Some(code) => anyhow!("{code}: {message}"),
                        None => anyhow!(message),
                    }));
                }
                NormalizedEvent::Done => break,
                NormalizedEvent::ToolCallDelta { .. } | NormalizedEvent::Usage { .. } => {}
            }
        }
        Ok(turn)
    }

    async fn execute_tool(&self, allowed: &HashSet<String>, call: &ToolCall) -> String {
        let name = &call.function.name;
        if !allowed.contains(name) {
            tracing::warn!(tool_name = %name, "Model requested an unavailable tool");
            return format!("Error: tool '{name}' is not available");
        }

        let arguments: serde_json::Value = serde_json::from_str(&call.function.arguments)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        match self.client.call_namespaced_tool(name, arguments).await {
            Ok(result) => {
                let content = serde_json::to_string(&result).unwrap_or_default();
                tracing::debug!(
                    tool_id = %call.id,
                    tool_name = %name,
                    result_length = content.len(),
                    "Tool call succeeded"
                );
                content
            }
            Err(e) => {
                tracing::error!(tool_id = %call.id, tool_name = %name, error = %e, "Tool call failed");
                format!("Error: {e}")
            }
        }
    }
}

#[async_trait]
impl AgentRun for Agent {
    async fn run(&self, query: &str, max_steps: Option<StepBudget>) -> Result<RunResult> {
        let run_id = Uuid::new_v4().to_string();
        let budget = max_steps.unwrap_or(self.max_steps).get();

        self.ensure_sessions().await?;

        let tools: Vec<_> = self
            .client
            .list_tools()
            .await
            .map_err(RunnerError::Tools)?
            .into_iter()
            .filter(|t| !self.is_disallowed(&t.namespaced_name, &t.tool.name))
            .collect();
        let allowed: HashSet<String> = tools.iter().map(|t| t.namespaced_name.clone()).collect();
        let tools_json: Vec<serde_json::Value> = tools.iter().map(|t| t.openai_json()).collect();

        tracing::info!(
            run_id = %run_id,
            model = %self.model.model_id(),
            tool_count = tools_json.len(),
            max_steps = budget,
            "Starting agent run"
        );

        let mut messages = vec![Message::user(query)];

        for step in 1..=budget {
            if self.verbose {
                tracing::info!(run_id = %run_id, step, max_steps = budget, "Agent step");
            } else {
                tracing::debug!(run_id = %run_id, step, max_steps = budget, "Agent step");
            }

            let turn = self
                .next_turn(LlmRequest {
                    system: Some(self.system_prompt.clone()),
                    messages: messages.clone(),
                    tools: tools_json.clone(),
                })
                .await?;

            if turn.tool_calls.is_empty() {
                tracing::info!(run_id = %run_id, steps = step, "Agent produced a final answer");
                let blocks = if turn.text.is_empty() {
                    Vec::new()
                } else {
                    vec![ContentBlock::text(turn.text)]
                };
                return Ok(RunResult::Structured(blocks));
            }

            for tc in &turn.tool_calls {
                if self.verbose {
                    tracing::info!(
                        run_id = %run_id,
                        step,
                        tool_id = %tc.id,
                        tool_name = %tc.function.name,
                        "Tool call to execute"
                    );
                }
            }

            let text = (!turn.text.is_empty()).then_some(turn.text);
            messages.push(Message::assistant_tool_calls(text, turn.tool_calls.clone()));

            for tc in &turn.tool_calls {
                let content = self.execute_tool(&allowed, tc).await;
                messages.push(Message::tool_result(tc.id.clone(), content));
            }
        }

        tracing::warn!(run_id = %run_id, max_steps = budget, "Step budget exhausted");
        Err(RunnerError::StepBudgetExhausted { steps: budget })
    }
}
