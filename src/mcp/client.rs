use crate::error::RunnerError;
use crate::mcp::config::{
    McpConfig, McpServerEntry, expand_env_map, expand_env_placeholders, load_mcp_config,
};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use rmcp::{
    model::CallToolRequestParam,
    service::ServiceExt,
    transport::{StreamableHttpClientTransport, TokioChildProcess},
};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
};
use tokio::{
    process::Command,
    sync::{Mutex, RwLock},
};
use url::Url;

/// A tool advertised by one MCP server.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool under its namespaced name (`server__tool`).
#[derive(Debug, Clone, PartialEq)]
pub struct NamespacedTool {
    pub namespaced_name: String,
    pub server: String,
    pub tool: ToolSpec,
}

impl NamespacedTool {
    /// Tool definition in `OpenAI` function schema format.
    pub fn openai_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.namespaced_name,
                "description": self.tool.description,
                "parameters": self.tool.input_schema
            }
        })
    }
}

/// A live connection to one MCP server.
#[async_trait]
pub trait McpSession: Send + Sync {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>>;
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
    /// Shut the session down. Calls after the first are no-ops.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Opens sessions for configured servers.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        entry: &McpServerEntry,
    ) -> anyhow::Result<Arc<dyn McpSession>>;
}

type DynClientService = rmcp::service::RunningService<
    rmcp::service::RoleClient,
    Box<dyn rmcp::service::DynService<rmcp::service::RoleClient>>,
>;

/// Session backed by an `rmcp` running client service.
struct RmcpSession {
    server_name: String,
    service: RwLock<Option<DynClientService>>,
}

#[async_trait]
impl McpSession for RmcpSession {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        let guard = self.service.read().await;
        let svc = guard
            .as_ref()
            .ok_or_else(|| anyhow!("session '{}' is closed", self.server_name))?;

        let result = svc
            .list_tools(Default::default())
            .await
            .with_context(|| format!("tools/list failed for MCP server '{}'", self.server_name))?;

        Ok(result
            .tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name.to_string(),
                description: t.description.as_deref().unwrap_or("").to_string(),
                input_schema: serde_json::Value::Object((*t.input_schema).clone()),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let guard = self.service.read().await;
        let svc = guard
            .as_ref()
            .ok_or_else(|| anyhow!("session '{}' is closed", self.server_name))?;

        let res = svc
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: arguments.as_object().cloned(),
            })
            .await
            .with_context(|| format!("tools/call failed for {}::{name}", self.server_name))?;

        Ok(serde_json::to_value(res)?)
    }

    async fn close(&self) -> anyhow::Result<()> {
        let Some(svc) = self.service.write().await.take() else {
            return Ok(());
        };
        svc.cancel()
            .await
            .with_context(|| format!("failed to stop MCP server '{}'", self.server_name))?;
        Ok(())
    }
}

/// Connects over stdio child processes or streamable HTTP using `rmcp`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RmcpConnector;

#[async_trait]
impl SessionConnector for RmcpConnector {
    async fn connect(
        &self,
        name: &str,
        entry: &McpServerEntry,
    ) -> anyhow::Result<Arc<dyn McpSession>> {
        let svc = match entry {
            McpServerEntry::Stdio { command, args, env } => {
                let env = expand_env_map(env);

                let mut cmd = Command::new(expand_env_placeholders(command));
                cmd.args(args.iter().map(|a| expand_env_placeholders(a)));

                for (k, v) in env {
                    cmd.env(k, v);
                }

                let transport = TokioChildProcess::new(cmd)?;
                ().into_dyn()
                    .serve(transport)
                    .await
                    .with_context(|| format!("failed to connect stdio MCP server '{name}'"))?
            }

            McpServerEntry::RemoteHttp { url, env } => {
                let url = expand_url(url, env);
                // Keep the URL out of logs, it may carry credentials.
                let u = Url::parse(&url)
                    .with_context(|| format!("invalid url for remote MCP '{name}'"))?;

                let transport = StreamableHttpClientTransport::from_uri(u.to_string());
                ().into_dyn()
                    .serve(transport)
                    .await
                    .with_context(|| format!("failed to connect remote MCP server '{name}'"))?
            }
        };

        Ok(Arc::new(RmcpSession {
            server_name: name.to_string(),
            service: RwLock::new(Some(svc)),
        }))
    }
}

/// Expand placeholders in a remote URL. Entry-local `env` values win over the
/// process environment.
fn expand_url(url: &str, env: &HashMap<String, String>) -> String {
    let mut out = url.to_string();
    for (k, v) in expand_env_map(env) {
        out = out.replace(&format!("${{{k}}}"), &v);
    }
    expand_env_placeholders(&out)
}

/// Owns the sessions to the servers declared in an MCP configuration.
///
/// Construction only parses configuration; sessions are opened on demand by
/// [`McpClient::create_session`] / [`McpClient::create_all_sessions`] and must
/// be released with [`McpClient::close_all_sessions`].
pub struct McpClient {
    config: McpConfig,
    connector: Arc<dyn SessionConnector>,
    sessions: Mutex<BTreeMap<String, Arc<dyn McpSession>>>,
    // namespaced_tool_name -> (server_name, tool_name)
    tool_index: Mutex<HashMap<String, (String, String)>>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("servers", &self.config.server_names())
            .finish()
    }
}

impl McpClient {
    pub fn from_config_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let cfg = load_mcp_config(path)?;
        Ok(Self::from_config(cfg))
    }

    pub fn from_config(config: McpConfig) -> Self {
        Self::with_connector(config, Arc::new(RmcpConnector))
    }

    pub fn with_connector(config: McpConfig, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            config,
            connector,
            sessions: Mutex::new(BTreeMap::new()),
            tool_index: Mutex::new(HashMap::new()),
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        self.config.server_names()
    }

    /// Open a session to `name`, or return the already open one.
    pub async fn create_session(&self, name: &str) -> anyhow::Result<Arc<dyn McpSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(name) {
            return Ok(Arc::clone(existing));
        }

        let entry = self
            .config
            .mcp_servers
            .get(name)
            .ok_or_else(|| anyhow!("server '{name}' is not in the MCP configuration"))?;

        let session = self.connector.connect(name, entry).await?;
        tracing::info!(name: "mcp.session.opened", server = %name, "MCP session opened");
        sessions.insert(name.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Open a session to every configured server, stopping at the first
    /// server that cannot be reached.
    pub async fn create_all_sessions(&self) -> crate::Result<()> {
        for name in self.server_names() {
            self.create_session(&name)
                .await
                .map_err(|source| RunnerError::Session {
                    server: name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    pub async fn get_session(&self, name: &str) -> Option<Arc<dyn McpSession>> {
        self.sessions.lock().await.get(name).cloned()
    }

    /// Names of the currently open sessions.
    pub async fn active_sessions(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn has_sessions(&self) -> bool {
        !self.sessions.lock().await.is_empty()
    }

    pub async fn close_session(&self, name: &str) -> anyhow::Result<()> {
        let removed = self.sessions.lock().await.remove(name);
        self.tool_index
            .lock()
            .await
            .retain(|_, (server, _)| server.as_str() != name);

        if let Some(session) = removed {
            session.close().await?;
            tracing::info!(name: "mcp.session.closed", server = %name, "MCP session closed");
        }
        Ok(())
    }

    /// Close every open session. The session set is drained first, so a second
    /// call does nothing. Every session is attempted; the first error is returned.
    pub async fn close_all_sessions(&self) -> anyhow::Result<()> {
        let drained = std::mem::take(&mut *self.sessions.lock().await);
        self.tool_index.lock().await.clear();

        let mut first_err: Option<anyhow::Error> = None;
        for (name, session) in drained {
            match session.close().await {
                Ok(()) => {
                    tracing::info!(name: "mcp.session.closed", server = %name, "MCP session closed");
                }
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "Failed to close MCP session");
                    if first_err.is_none() {
                        first_err = Some(e.context(format!("closing session '{name}'")));
                    }
                }
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// List tools of all open sessions under namespaced names.
    pub async fn list_tools(&self) -> anyhow::Result<Vec<NamespacedTool>> {
        let sessions: Vec<(String, Arc<dyn McpSession>)> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut all_tools = Vec::new();
        let mut index = HashMap::new();

        for (server_name, session) in sessions {
            for tool in session.list_tools().await? {
                let ns_name = sanitize_tool_name(&format!("{server_name}__{}", tool.name));
                if let Some((owner, _)) = index.get(&ns_name) {
                    tracing::warn!(
                        tool_name = %ns_name,
                        server = %server_name,
                        kept_from = %owner,
                        "Skipping tool whose namespaced name is already taken"
                    );
                    continue;
                }
                index.insert(ns_name.clone(), (server_name.clone(), tool.name.clone()));
                all_tools.push(NamespacedTool {
                    namespaced_name: ns_name,
                    server: server_name.clone(),
                    tool,
                });
            }
        }

        *self.tool_index.lock().await = index;
        Ok(all_tools)
    }

    /// Execute a namespaced tool, e.g. "`playwright__browser_navigate`".
    /// Names are resolved against the last [`McpClient::list_tools`] call.
    pub async fn call_namespaced_tool(
        &self,
        namespaced_tool: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let (server_name, raw_tool_name) = self
            .tool_index
            .lock()
            .await
            .get(namespaced_tool)
            .cloned()
            .ok_or_else(|| anyhow!("unknown tool: {namespaced_tool}"))?;

        let session = self
            .get_session(&server_name)
            .await
            .ok_or_else(|| anyhow!("missing session for server: {server_name}"))?;

        session.call_tool(&raw_tool_name, arguments).await
    }
}

/// Restrict tool names to `[a-zA-Z0-9_-]`, which every model API accepts.
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSession {
        closes: Arc<AtomicUsize>,
        fail_close: bool,
    }

    #[async_trait]
    impl McpSession for FakeSession {
        async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
            Ok(vec![ToolSpec {
                name: "browser.navigate".to_string(),
                description: "Open a URL".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }])
        }

        async fn call_tool(
            &self,
            name: &str,
            arguments: serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "tool": name, "args": arguments }))
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(anyhow!("boom"))
            } else {
                Ok(())
            }
        }
    }

    struct FakeConnector {
        connects: AtomicUsize,
        closes: Arc<AtomicUsize>,
        fail_close: bool,
        refuse: Option<&'static str>,
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(
            &self,
            name: &str,
            _entry: &McpServerEntry,
        ) -> anyhow::Result<Arc<dyn McpSession>> {
            if self.refuse == Some(name) {
                anyhow::bail!("connection refused");
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeSession {
                closes: Arc::clone(&self.closes),
                fail_close: self.fail_close,
            }))
        }
    }

    fn config() -> McpConfig {
        McpConfig::from_json(
            r#"{"mcpServers": {
                "a": {"command": "true"},
                "b": {"command": "true"}
            }}"#,
        )
        .unwrap()
    }

    fn client(fail_close: bool) -> (McpClient, Arc<FakeConnector>) {
        client_with(config(), fail_close)
    }

    fn client_with(config: McpConfig, fail_close: bool) -> (McpClient, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector {
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            fail_close,
            refuse: None,
        });
        let c = McpClient::with_connector(config, Arc::clone(&connector) as Arc<dyn SessionConnector>);
        (c, connector)
    }

    #[tokio::test]
    async fn test_no_sessions_until_requested() {
        let (client, connector) = client(false);
        assert!(!client.has_sessions().await);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_create_session_is_reused() {
        let (client, connector) = client(false);
        client.create_session("a").await.unwrap();
        client.create_session("a").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(client.active_sessions().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_unknown_server_is_rejected() {
        let (client, _) = client(false);
        assert!(client.create_session("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_close_all_sessions_drains_once() {
        let (client, connector) = client(false);
        client.create_all_sessions().await.unwrap();
        assert_eq!(client.active_sessions().await.len(), 2);

        client.close_all_sessions().await.unwrap();
        client.close_all_sessions().await.unwrap();

        assert!(!client.has_sessions().await);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_session_only_closes_that_server() {
        let (client, connector) = client(false);
        client.create_all_sessions().await.unwrap();
        assert_eq!(client.list_tools().await.unwrap().len(), 2);

        client.close_session("a").await.unwrap();
        assert_eq!(client.active_sessions().await, vec!["b"]);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);

        // Tools of the closed server are forgotten, the others still resolve.
        assert!(
            client
                .call_namespaced_tool("a__browser_navigate", serde_json::json!({}))
                .await
                .is_err()
        );
        assert!(
            client
                .call_namespaced_tool("b__browser_navigate", serde_json::json!({}))
                .await
                .is_ok()
        );

        client.close_session("a").await.unwrap();
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_all_sessions_names_failing_server() {
        let connector = Arc::new(FakeConnector {
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            fail_close: false,
            refuse: Some("b"),
        });
        let client = McpClient::with_connector(config(), connector);

        match client.create_all_sessions().await {
            Err(RunnerError::Session { server, .. }) => assert_eq!(server, "b"),
            other => panic!("expected session error, got {other:?}"),
        }
        assert_eq!(client.active_sessions().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_colliding_namespaced_names_keep_first_server() {
        let cfg = McpConfig::from_json(
            r#"{"mcpServers": {
                "a.b": {"command": "true"},
                "a_b": {"command": "true"}
            }}"#,
        )
        .unwrap();
        let (client, _) = client_with(cfg, false);
        client.create_all_sessions().await.unwrap();

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].namespaced_name, "a_b__browser_navigate");
        assert_eq!(tools[0].server, "a.b");
    }

    #[tokio::test]
    async fn test_close_errors_still_attempt_every_session() {
        let (client, connector) = client(true);
        client.create_all_sessions().await.unwrap();

        assert!(client.close_all_sessions().await.is_err());
        assert!(!client.has_sessions().await);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tools_are_namespaced_and_callable() {
        let (client, _) = client(false);
        client.create_session("a").await.unwrap();

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].namespaced_name, "a__browser_navigate");
        assert_eq!(tools[0].openai_json()["function"]["name"], "a__browser_navigate");

        let out = client
            .call_namespaced_tool("a__browser_navigate", serde_json::json!({"url": "x"}))
            .await
            .unwrap();
        assert_eq!(out["tool"], "browser.navigate");
        assert_eq!(out["args"]["url"], "x");

        assert!(client.call_namespaced_tool("missing", serde_json::json!({})).await.is_err());
    }

    #[test]
    fn test_sanitize_tool_name() {
        assert_eq!(sanitize_tool_name("srv__a.b:c"), "srv__a_b_c");
    }

    #[test]
    fn test_expand_url_prefers_entry_env() {
        let mut env = HashMap::new();
        env.insert("MCP_RUNNER_TEST_KEY".to_string(), "abc".to_string());
        assert_eq!(
            expand_url("https://x.test/mcp?key=${MCP_RUNNER_TEST_KEY}", &env),
            "https://x.test/mcp?key=abc"
        );
    }
}
