use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use conductor_core::clock::Clock;
use conductor_core::config::GovernanceConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::governance::{
    AuditEntry, AuditFilter, AuditResult, GovernancePolicy, PermissionCheck, PermissionScope,
    ToolPermission,
};
use conductor_core::traits::Tool;
use conductor_core::types::{ToolContext, ToolOutput};
use conductor_tools::registry::execute_with_timeout;

use crate::store::GovernanceStore;

/// Length of the rate-limit window in seconds.
const RATE_WINDOW_SECS: i64 = 3600;

/// A tool invocation submitted for governed execution.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub agent_id: String,
    pub agent_name: String,
    pub tool_name: String,
    pub params: serde_json::Value,
}

/// Executions counted for one (agent, tool) pair since `window_start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateWindow {
    agent_id: String,
    tool_name: String,
    window_start: DateTime<Utc>,
    count: u32,
}

impl RateWindow {
    fn is_current(&self, now: DateTime<Utc>) -> bool {
        now - self.window_start < Duration::seconds(RATE_WINDOW_SECS)
    }
}

#[derive(Default)]
struct State {
    permissions: HashMap<String, Vec<ToolPermission>>,
    policies: HashMap<String, GovernancePolicy>,
    audit_log: VecDeque<AuditEntry>,
    counters: HashMap<(String, String), RateWindow>,
    /// Bumped on every staged save so the store can drop stale writes.
    generation: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRef<'a> {
    permissions: &'a HashMap<String, Vec<ToolPermission>>,
    policies: &'a HashMap<String, GovernancePolicy>,
    counters: Vec<&'a RateWindow>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    #[serde(default)]
    permissions: HashMap<String, Vec<ToolPermission>>,
    #[serde(default)]
    policies: HashMap<String, GovernancePolicy>,
    #[serde(default)]
    counters: Vec<RateWindow>,
}

impl State {
    fn from_snapshot(s: Snapshot, generation: u64) -> Self {
        let counters = s
            .counters
            .into_iter()
            .map(|w| ((w.agent_id.clone(), w.tool_name.clone()), w))
            .collect();
        Self {
            permissions: s.permissions,
            policies: s.policies,
            audit_log: VecDeque::new(),
            counters,
            generation,
        }
    }
}

/// Store writes captured under the state lock and applied after it is
/// released.
#[derive(Default)]
struct StoreWrites {
    state: Option<(u64, String)>,
    audit: Option<String>,
}

impl StoreWrites {
    fn apply(self, store: &GovernanceStore, capacity: usize) {
        if let Some((generation, json)) = self.state {
            match store.save(generation, &json) {
                Ok(true) => {}
                Ok(false) => debug!(generation, "Skipped stale governance state write"),
                Err(e) => warn!(error = %e, "Failed to persist governance state"),
            }
        }
        if let Some(entry) = self.audit {
            if let Err(e) = store.append_audit(&entry, capacity) {
                warn!(error = %e, "Failed to persist audit entry");
            }
        }
    }
}

/// Per-agent tool permissions, policies, rate limits and the audit log.
///
/// One instance is shared by every executor in the process. All state lives
/// behind a single mutex that is never held across an `.await`.
pub struct GovernanceManager {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<GovernanceStore>>,
    default_max_per_hour: u32,
    capacity: usize,
    default_require_audit_log: bool,
}

impl GovernanceManager {
    /// In-memory governance seeded with the configured policies.
    pub fn new(config: &GovernanceConfig, clock: Arc<dyn Clock>) -> Self {
        let state = State {
            policies: config.policies.clone(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            clock,
            store: None,
            default_max_per_hour: config.max_executions_per_hour,
            capacity: config.audit_log_capacity.max(1),
            default_require_audit_log: config.require_audit_log,
        }
    }

    /// Governance backed by a durable store.
    ///
    /// The stored state is loaded first; configured policies then override
    /// stored ones for the agents they name. A missing or unreadable state
    /// row falls back to defaults, and unreadable audit rows are skipped.
    pub fn with_store(
        config: &GovernanceConfig,
        clock: Arc<dyn Clock>,
        store: GovernanceStore,
    ) -> Self {
        let mut state = match store.load() {
            Ok(Some((generation, json))) => match serde_json::from_str::<Snapshot>(&json) {
                Ok(snapshot) => State::from_snapshot(snapshot, generation),
                Err(e) => {
                    warn!(error = %e, "Governance state is corrupt, starting from defaults");
                    State {
                        generation,
                        ..Default::default()
                    }
                }
            },
            Ok(None) => State::default(),
            Err(e) => {
                warn!(error = %e, "Failed to load governance state, starting from defaults");
                State::default()
            }
        };
        for (agent, policy) in &config.policies {
            state.policies.insert(agent.clone(), policy.clone());
        }
        let capacity = config.audit_log_capacity.max(1);
        match store.load_audit(capacity) {
            Ok(rows) => {
                for row in rows {
                    match serde_json::from_str::<AuditEntry>(&row) {
                        Ok(entry) => state.audit_log.push_back(entry),
                        Err(e) => warn!(error = %e, "Skipping unreadable audit entry"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to load audit log"),
        }
        info!(
            entries = state.audit_log.len(),
            agents = state.permissions.len(),
            "Governance state loaded"
        );

        Self {
            state: Mutex::new(state),
            clock,
            store: Some(Arc::new(store)),
            default_max_per_hour: config.max_executions_per_hour,
            capacity,
            default_require_audit_log: config.require_audit_log,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Capture what the store needs after a mutation. `new_audit` marks the
    /// newest audit entry as not yet written.
    fn stage(&self, state: &mut State, new_audit: bool) -> StoreWrites {
        if self.store.is_none() {
            return StoreWrites::default();
        }
        state.generation += 1;
        let snapshot = SnapshotRef {
            permissions: &state.permissions,
            policies: &state.policies,
            counters: state.counters.values().collect(),
        };
        let state_json = match serde_json::to_string(&snapshot) {
            Ok(json) => Some((state.generation, json)),
            Err(e) => {
                warn!(error = %e, "Failed to serialize governance state");
                None
            }
        };
        let audit = if new_audit {
            state
                .audit_log
                .back()
                .and_then(|entry| match serde_json::to_string(entry) {
                    Ok(json) => Some(json),
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize audit entry");
                        None
                    }
                })
        } else {
            None
        };
        StoreWrites {
            state: state_json,
            audit,
        }
    }

    /// Best-effort save; failures are logged and otherwise ignored.
    fn flush(&self, writes: StoreWrites) {
        if let Some(store) = &self.store {
            writes.apply(store, self.capacity);
        }
    }

    /// `flush` on the blocking pool, for callers on the async runtime.
    async fn flush_async(&self, writes: StoreWrites) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let capacity = self.capacity;
        if let Err(e) = tokio::task::spawn_blocking(move || writes.apply(&store, capacity)).await {
            warn!(error = %e, "Governance persistence task failed");
        }
    }

    /// Whether `agent_id` may run `tool_name` right now.
    ///
    /// Checks, in order: deny-list, allow-list, hourly rate limit, then any
    /// explicit permission (revoked, expired, or missing when the policy
    /// requires approval). The first failing check wins.
    pub fn can_execute_tool(&self, agent_id: &str, tool_name: &str) -> PermissionCheck {
        let state = self.lock();
        self.check_locked(&state, agent_id, tool_name, self.clock.now())
    }

    fn check_locked(
        &self,
        state: &State,
        agent_id: &str,
        tool_name: &str,
        now: DateTime<Utc>,
    ) -> PermissionCheck {
        let policy = state.policies.get(agent_id);

        if let Some(p) = policy {
            if p.denied_tools.iter().any(|t| t == tool_name) {
                return PermissionCheck::deny(format!(
                    "Tool '{}' is denied for agent '{}'",
                    tool_name, agent_id
                ));
            }
            if !p.allowed_tools.is_empty() && !p.allowed_tools.iter().any(|t| t == tool_name) {
                return PermissionCheck::deny(format!(
                    "Tool '{}' is not in the allowed tools for agent '{}'",
                    tool_name, agent_id
                ));
            }
        }

        let limit = policy
            .and_then(|p| p.max_executions_per_hour)
            .unwrap_or(self.default_max_per_hour);
        if window_count(state, agent_id, tool_name, now) >= limit {
            return PermissionCheck::deny(format!(
                "Rate limit exceeded: {} executions per hour for tool '{}'",
                limit, tool_name
            ));
        }

        let permission = state
            .permissions
            .get(agent_id)
            .and_then(|perms| perms.iter().find(|p| p.tool_name == tool_name));
        match permission {
            Some(p) if !p.granted => PermissionCheck::deny(format!(
                "Permission for tool '{}' has been revoked",
                tool_name
            )),
            Some(p) if p.is_expired(now) => PermissionCheck::deny(format!(
                "Permission for tool '{}' has expired",
                tool_name
            )),
            None if policy.is_some_and(|p| p.require_approval) => PermissionCheck::deny(format!(
                "Tool '{}' requires approval for agent '{}'",
                tool_name, agent_id
            )),
            _ => PermissionCheck::allow(),
        }
    }

    /// Record an auto-approved permission. Refused only for deny-listed tools.
    pub fn request_permission(
        &self,
        agent_id: &str,
        tool_name: &str,
        scope: PermissionScope,
    ) -> bool {
        let writes = {
            let mut state = self.lock();
            let denied = state
                .policies
                .get(agent_id)
                .is_some_and(|p| p.denied_tools.iter().any(|t| t == tool_name));
            if denied {
                debug!(agent = %agent_id, tool = %tool_name, "Permission request refused by deny-list");
                return false;
            }
            let permission = ToolPermission {
                tool_name: tool_name.to_string(),
                scope,
                granted: true,
                granted_by: Some("auto".to_string()),
                granted_at: Some(self.clock.now()),
                expires_at: None,
            };
            upsert_permission(&mut state, agent_id, permission);
            self.stage(&mut state, false)
        };
        self.flush(writes);
        info!(agent = %agent_id, tool = %tool_name, scope = %scope, "Permission granted");
        true
    }

    /// Record a fully specified permission, replacing any for the same tool.
    pub fn grant_permission(&self, agent_id: &str, permission: ToolPermission) {
        let writes = {
            let mut state = self.lock();
            upsert_permission(&mut state, agent_id, permission);
            self.stage(&mut state, false)
        };
        self.flush(writes);
    }

    /// Mark the permission as revoked. Returns false if none was recorded.
    pub fn revoke_permission(&self, agent_id: &str, tool_name: &str) -> bool {
        let writes = {
            let mut state = self.lock();
            let found = state
                .permissions
                .get_mut(agent_id)
                .and_then(|perms| perms.iter_mut().find(|p| p.tool_name == tool_name))
                .map(|p| p.granted = false)
                .is_some();
            if !found {
                return false;
            }
            self.stage(&mut state, false)
        };
        self.flush(writes);
        info!(agent = %agent_id, tool = %tool_name, "Permission revoked");
        true
    }

    /// Append an audit entry and count it toward the rate limit (unless dry-run).
    pub fn log_execution(&self, entry: AuditEntry) {
        let writes = {
            let mut state = self.lock();
            let now = self.clock.now();
            let kept = self.record_locked(&mut state, entry, true, now);
            self.stage(&mut state, kept)
        };
        self.flush(writes);
    }

    /// Returns whether the entry was retained in the log.
    fn record_locked(
        &self,
        state: &mut State,
        entry: AuditEntry,
        count: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if count && !entry.dry_run {
            bump_counter(state, &entry.agent_id, &entry.tool_name, now);
        }
        let keep = entry.result == AuditResult::Denied
            || state
                .policies
                .get(&entry.agent_id)
                .map_or(self.default_require_audit_log, |p| p.require_audit_log);
        if !keep {
            return false;
        }
        state.audit_log.push_back(entry);
        while state.audit_log.len() > self.capacity {
            state.audit_log.pop_front();
        }
        true
    }

    /// The policy in force for an agent (default when none is set).
    pub fn get_policy(&self, agent_id: &str) -> GovernancePolicy {
        self.lock()
            .policies
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| GovernancePolicy {
                require_audit_log: self.default_require_audit_log,
                ..Default::default()
            })
    }

    pub fn set_policy(&self, agent_id: &str, policy: GovernancePolicy) {
        let writes = {
            let mut state = self.lock();
            state.policies.insert(agent_id.to_string(), policy);
            self.stage(&mut state, false)
        };
        self.flush(writes);
    }

    pub fn permissions(&self, agent_id: &str) -> Vec<ToolPermission> {
        self.lock()
            .permissions
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    /// All retained audit entries, oldest first.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.lock().audit_log.iter().cloned().collect()
    }

    pub fn audit_log_filtered(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.lock()
            .audit_log
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Matching audit entries as pretty JSON.
    pub fn export_audit_log(&self, filter: &AuditFilter) -> Result<String> {
        let entries = self.audit_log_filtered(filter);
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    /// Executions counted for the pair in the current window.
    pub fn execution_count(&self, agent_id: &str, tool_name: &str) -> u32 {
        let state = self.lock();
        window_count(&state, agent_id, tool_name, self.clock.now())
    }

    /// Run a tool through governance.
    ///
    /// Denials are audited before `GovernanceDenied` is returned. Tool errors
    /// are audited as failures and returned unchanged.
    pub async fn execute_tool(
        &self,
        request: ToolRequest,
        tool: Arc<dyn Tool>,
        ctx: ToolContext,
    ) -> Result<ToolOutput> {
        // Check and count in one critical section so concurrent callers
        // cannot both take the last slot.
        let denied = {
            let mut state = self.lock();
            let now = self.clock.now();
            let check = self.check_locked(&state, &request.agent_id, &request.tool_name, now);
            if check.allowed {
                bump_counter(&mut state, &request.agent_id, &request.tool_name, now);
                None
            } else {
                let reason = check.reason.unwrap_or_else(|| "denied".to_string());
                warn!(
                    agent = %request.agent_id,
                    tool = %request.tool_name,
                    reason = %reason,
                    "Tool execution denied"
                );
                let entry = self.entry(&request, AuditResult::Denied, Some(reason.clone()), now);
                let kept = self.record_locked(&mut state, entry, true, now);
                Some((reason, self.stage(&mut state, kept)))
            }
        };
        if let Some((reason, writes)) = denied {
            self.flush_async(writes).await;
            return Err(ConductorError::GovernanceDenied {
                tool: request.tool_name,
                reason,
            });
        }

        debug!(agent = %request.agent_id, tool = %request.tool_name, "Executing governed tool");
        let result = execute_with_timeout(&tool, request.params.clone(), ctx).await;

        let writes = {
            let mut state = self.lock();
            let now = self.clock.now();
            let entry = match &result {
                Ok(out) if out.success => self.entry(&request, AuditResult::Success, None, now),
                Ok(out) => {
                    self.entry(&request, AuditResult::Failure, Some(out.output.clone()), now)
                }
                Err(e) => self.entry(&request, AuditResult::Failure, Some(e.to_string()), now),
            };
            let kept = self.record_locked(&mut state, entry, false, now);
            self.stage(&mut state, kept)
        };
        self.flush_async(writes).await;
        result
    }

    fn entry(
        &self,
        request: &ToolRequest,
        result: AuditResult,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: now,
            agent_id: request.agent_id.clone(),
            agent_name: request.agent_name.clone(),
            tool_name: request.tool_name.clone(),
            action: "execute".to_string(),
            params: request.params.clone(),
            result,
            error,
            dry_run: false,
        }
    }
}

fn window_count(state: &State, agent_id: &str, tool_name: &str, now: DateTime<Utc>) -> u32 {
    state
        .counters
        .get(&(agent_id.to_string(), tool_name.to_string()))
        .filter(|w| w.is_current(now))
        .map_or(0, |w| w.count)
}

fn bump_counter(state: &mut State, agent_id: &str, tool_name: &str, now: DateTime<Utc>) {
    let window = state
        .counters
        .entry((agent_id.to_string(), tool_name.to_string()))
        .or_insert_with(|| RateWindow {
            agent_id: agent_id.to_string(),
            tool_name: tool_name.to_string(),
            window_start: now,
            count: 0,
        });
    if !window.is_current(now) {
        window.window_start = now;
        window.count = 0;
    }
    window.count = window.count.saturating_add(1);
}

fn upsert_permission(state: &mut State, agent_id: &str, permission: ToolPermission) {
    let perms = state.permissions.entry(agent_id.to_string()).or_default();
    match perms.iter_mut().find(|p| p.tool_name == permission.tool_name) {
        Some(existing) => *existing = permission,
        None => perms.push(permission),
    }
}
