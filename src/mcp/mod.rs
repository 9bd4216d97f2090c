//! Model Context Protocol (MCP) client.
//!
//! [`client::McpClient`] owns sessions to stdio and HTTP-based MCP servers
//! declared in a JSON configuration file, discovers their tools and executes
//! tool calls on behalf of the agent.
//!
//! # Configuration
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "playwright": {
//!       "command": "npx",
//!       "args": ["@playwright/mcp@latest"],
//!       "env": { "DISPLAY": ":1" }
//!     },
//!     "search": {
//!       "url": "https://mcp.example.com/mcp?apiKey=${SEARCH_API_KEY}"
//!     }
//!   }
//! }
//! ```
//!
//! # Tool Namespacing
//!
//! Tools are namespaced by server name: `server_name__tool_name`
//! (e.g., `playwright__browser_navigate`).

pub mod client;
pub mod config;

pub use client::{McpClient, McpSession, NamespacedTool, RmcpConnector, SessionConnector, ToolSpec};
