//! Read-only summary of the installed asset bundle.
//!
//! The bundle installer resolves and unpacks assets before the harness
//! starts; the harness only reads `bundle.json` from the asset directory.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File name of the summary inside the asset directory.
pub const SUMMARY_FILE: &str = "bundle.json";

/// Identity and contents of the installed bundle. Immutable after start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleSummary {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl BundleSummary {
    /// Load `bundle.json` from an already-installed asset directory.
    pub fn load(asset_dir: &Path) -> Result<Self> {
        let path = asset_dir.join(SUMMARY_FILE);
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read bundle summary at {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse bundle summary at {}", path.display()))
    }
}

/// MCP server entry as declared by the bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(default)]
    pub loaded: bool,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub credential: Option<McpCredential>,
}

/// Stored credential for an MCP server. Only its expiry matters here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpCredential {
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}
