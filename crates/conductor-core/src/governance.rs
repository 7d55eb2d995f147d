use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scope of a tool permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionScope {
    Read,
    Write,
    Admin,
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for PermissionScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown permission scope: {}", other)),
        }
    }
}

/// An explicit permission for one agent to use one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPermission {
    pub tool_name: String,
    pub scope: PermissionScope,
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ToolPermission {
    /// Whether the permission has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Per-agent tool policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernancePolicy {
    #[serde(default)]
    pub require_approval: bool,
    /// Empty = every tool allowed; non-empty = allowlist only.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Always refused, regardless of any explicit permission.
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub max_executions_per_hour: Option<u32>,
    #[serde(default = "default_require_audit_log")]
    pub require_audit_log: bool,
}

fn default_require_audit_log() -> bool {
    true
}

impl Default for GovernancePolicy {
    fn default() -> Self {
        Self {
            require_approval: false,
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            max_executions_per_hour: None,
            require_audit_log: true,
        }
    }
}

/// Result of a governance check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionCheck {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Outcome recorded for an audited tool execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
}

/// One immutable audit log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub agent_name: String,
    pub tool_name: String,
    pub action: String,
    pub params: serde_json::Value,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dry_run: bool,
}

/// Selection criteria for audit log queries and exports.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub agent_id: Option<String>,
    pub tool_name: Option<String>,
    pub result: Option<AuditResult>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.agent_id.as_deref().map_or(true, |a| entry.agent_id == a)
            && self.tool_name.as_deref().map_or(true, |t| entry.tool_name == t)
            && self.result.map_or(true, |r| entry.result == r)
    }
}
