#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use data_agent_domain::{truncate_chars, AgentError, LogEntry, GENESIS_HASH};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error};

const HASH_PREVIEW_CHARS: usize = 16;

/// One line read back from a log: its 1-based line number and either the
/// decoded entry or the reason it could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedLine {
    pub line: usize,
    pub entry: Result<LogEntry, String>,
}

/// Append-only hash-chained ledger.
///
/// Implementations serialize `append` so that reading the chain head and
/// writing the next entry happen as one step.
pub trait AuditLog: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn append(&self, entry_id: &str, event_type: &str, data: Value) -> Result<LogEntry>;

    /// Visit every stored entry in write order until the visitor breaks.
    #[allow(clippy::missing_errors_doc)]
    fn scan(&self, visit: &mut dyn FnMut(ScannedLine) -> ControlFlow<()>) -> Result<()>;

    /// Replay the chain from genesis, stopping at the first deviation.
    #[allow(clippy::missing_errors_doc)]
    fn verify_chain(&self) -> Result<ChainReport> {
        let mut verifier = ChainVerifier::new();
        let mut failure = None;
        self.scan(&mut |scanned| match verifier.check(&scanned) {
            Ok(()) => ControlFlow::Continue(()),
            Err(reason) => {
                failure = Some(reason);
                ControlFlow::Break(())
            }
        })?;
        Ok(match failure {
            Some(reason) => ChainReport::broken(verifier.verified(), reason),
            None => ChainReport::intact(verifier.verified()),
        })
    }

    /// Matching entries in write order. With a limit only the last N are kept.
    #[allow(clippy::missing_errors_doc)]
    fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        let mut corrupted = None;
        self.scan(&mut |scanned| match scanned.entry {
            Ok(entry) => {
                if filter.matches(&entry) {
                    entries.push(entry);
                }
                ControlFlow::Continue(())
            }
            Err(reason) => {
                corrupted = Some(format!("Corrupted log at line {}: {reason}", scanned.line));
                ControlFlow::Break(())
            }
        })?;
        if let Some(reason) = corrupted {
            return Err(anyhow!(reason));
        }
        if let Some(limit) = filter.limit.filter(|limit| *limit > 0) {
            let skip = entries.len().saturating_sub(limit);
            entries.drain(..skip);
        }
        Ok(entries)
    }

    #[allow(clippy::missing_errors_doc)]
    fn get_stats(&self) -> Result<AuditStats> {
        let mut stats = AuditStats::default();
        self.scan(&mut |scanned| {
            if let Ok(entry) = scanned.entry {
                stats.total_entries += 1;
                *stats.by_event_type.entry(entry.event_type).or_insert(0) += 1;
            }
            ControlFlow::Continue(())
        })?;
        let report = self.verify_chain()?;
        stats.chain_valid = report.valid;
        stats.chain_error = report.error;
        Ok(stats)
    }

    /// Verify the chain and turn a break into `AgentError::AuditChainBroken`.
    ///
    /// # Errors
    /// Returns `AuditChainBroken` when the chain fails verification or the
    /// log cannot be read at all.
    fn ensure_chain_intact(&self) -> Result<ChainReport, AgentError> {
        let report = self
            .verify_chain()
            .map_err(|err| AgentError::AuditChainBroken(format!("unable to read log: {err:#}")))?;
        match report.error {
            Some(reason) => {
                error!(reason = %reason, "audit chain verification failed");
                Err(AgentError::AuditChainBroken(reason))
            }
            None => Ok(report),
        }
    }
}

/// Incremental replay state. Feed lines in order; the first error is final.
#[derive(Debug, Clone)]
pub struct ChainVerifier {
    expected_parent: String,
    verified: usize,
}

impl Default for ChainVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            expected_parent: GENESIS_HASH.to_string(),
            verified: 0,
        }
    }

    #[must_use]
    pub fn verified(&self) -> usize {
        self.verified
    }

    /// Hash the next entry must carry as its parent.
    #[must_use]
    pub fn head(&self) -> &str {
        &self.expected_parent
    }

    /// # Errors
    /// Returns a human-readable reason naming the entry and line at fault.
    pub fn check(&mut self, scanned: &ScannedLine) -> Result<(), String> {
        let entry = scanned
            .entry
            .as_ref()
            .map_err(|reason| format!("Corrupted log at line {}: {reason}", scanned.line))?;
        let position = self.verified + 1;

        if entry.parent_hash != self.expected_parent {
            return Err(format!(
                "Chain break at entry {position} (line {}): expected parent {}..., got {}...",
                scanned.line,
                preview(&self.expected_parent),
                preview(&entry.parent_hash)
            ));
        }

        let computed = entry.recompute_hash();
        if computed != entry.entry_hash {
            return Err(format!(
                "Hash mismatch at entry {position} (line {}): stored={}..., computed={}...",
                scanned.line,
                preview(&entry.entry_hash),
                preview(&computed)
            ));
        }

        self.expected_parent.clone_from(&entry.entry_hash);
        self.verified = position;
        Ok(())
    }
}

fn preview(hash: &str) -> &str {
    truncate_chars(hash, HASH_PREVIEW_CHARS)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainReport {
    pub valid: bool,
    pub entries_verified: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChainReport {
    #[must_use]
    pub fn intact(entries_verified: usize) -> Self {
        Self {
            valid: true,
            entries_verified,
            error: None,
        }
    }

    #[must_use]
    pub fn broken(entries_verified: usize, reason: String) -> Self {
        Self {
            valid: false,
            entries_verified,
            error: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EntryFilter {
    pub event_type: Option<String>,
    pub entry_id_prefix: Option<String>,
    pub limit: Option<usize>,
}

impl EntryFilter {
    #[must_use]
    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.event_type
            .as_deref()
            .map_or(true, |wanted| entry.event_type == wanted)
            && self
                .entry_id_prefix
                .as_deref()
                .map_or(true, |prefix| entry.entry_id.starts_with(prefix))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditStats {
    pub total_entries: usize,
    pub by_event_type: BTreeMap<String, usize>,
    pub chain_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_error: Option<String>,
}

impl Default for AuditStats {
    fn default() -> Self {
        Self {
            total_entries: 0,
            by_event_type: BTreeMap::new(),
            chain_valid: true,
            chain_error: None,
        }
    }
}

/// Process-local log, used in tests and when no path is configured.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryAuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt previously written entries as-is, without re-verifying them.
    #[must_use]
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Copy of the stored entries.
    ///
    /// # Errors
    /// Returns an error if the internal lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<LogEntry>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| anyhow!("audit log lock poisoned"))?
            .clone())
    }
}

impl AuditLog for MemoryAuditLog {
    fn append(&self, entry_id: &str, event_type: &str, data: Value) -> Result<LogEntry> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("audit log lock poisoned"))?;
        let parent = entries
            .last()
            .map_or(GENESIS_HASH, |last| last.entry_hash.as_str())
            .to_string();
        let entry = LogEntry::seal(entry_id, event_type, data, &parent);
        entries.push(entry.clone());
        Ok(entry)
    }

    fn scan(&self, visit: &mut dyn FnMut(ScannedLine) -> ControlFlow<()>) -> Result<()> {
        let entries = self.snapshot()?;
        for (idx, entry) in entries.into_iter().enumerate() {
            let scanned = ScannedLine {
                line: idx + 1,
                entry: Ok(entry),
            };
            if visit(scanned).is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RequestSubmitted,
    PlanCreated,
    ToolCalled,
    ObservationRecorded,
    ArtifactGenerated,
    PolicyDecision,
    ErrorOccurred,
    RecipeRetrieved,
    RecipeStored,
    AnalysisCompleted,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 10] = [
        Self::RequestSubmitted,
        Self::PlanCreated,
        Self::ToolCalled,
        Self::ObservationRecorded,
        Self::ArtifactGenerated,
        Self::PolicyDecision,
        Self::ErrorOccurred,
        Self::RecipeRetrieved,
        Self::RecipeStored,
        Self::AnalysisCompleted,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestSubmitted => "request_submitted",
            Self::PlanCreated => "plan_created",
            Self::ToolCalled => "tool_called",
            Self::ObservationRecorded => "observation_recorded",
            Self::ArtifactGenerated => "artifact_generated",
            Self::PolicyDecision => "policy_decision",
            Self::ErrorOccurred => "error_occurred",
            Self::RecipeRetrieved => "recipe_retrieved",
            Self::RecipeStored => "recipe_stored",
            Self::AnalysisCompleted => "analysis_completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Block,
}

impl PolicyDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
        }
    }
}

/// Typed event writer over an [`AuditLog`]. Every entry id starts with the
/// request id followed by `-`, which is what request traces select on.
#[derive(Clone)]
pub struct AuditTracer {
    log: Arc<dyn AuditLog>,
}

impl std::fmt::Debug for AuditTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTracer").finish_non_exhaustive()
    }
}

impl AuditTracer {
    #[must_use]
    pub fn new(log: Arc<dyn AuditLog>) -> Self {
        Self { log }
    }

    #[must_use]
    pub fn log(&self) -> &Arc<dyn AuditLog> {
        &self.log
    }

    fn write(
        &self,
        request_id: &str,
        suffix: &str,
        event: AuditEventType,
        data: Value,
    ) -> Result<LogEntry> {
        let entry_id = format!("{request_id}-{suffix}");
        let entry = self.log.append(&entry_id, event.as_str(), data)?;
        debug!(entry_id = %entry.entry_id, event = event.as_str(), "audit entry appended");
        Ok(entry)
    }

    /// # Errors
    /// Propagates append failures from the underlying log.
    pub fn log_request(
        &self,
        request_id: &str,
        intent: &str,
        data_sources: Value,
    ) -> Result<LogEntry> {
        self.write(
            request_id,
            "request",
            AuditEventType::RequestSubmitted,
            json!({
                "request_id": request_id,
                "intent": intent,
                "data_sources": data_sources,
            }),
        )
    }

    /// # Errors
    /// Propagates append failures from the underlying log.
    pub fn log_plan(
        &self,
        request_id: &str,
        plan_id: &str,
        step_count: usize,
        estimated_cost: f64,
    ) -> Result<LogEntry> {
        self.write(
            request_id,
            &format!("plan-{plan_id}"),
            AuditEventType::PlanCreated,
            json!({
                "request_id": request_id,
                "plan_id": plan_id,
                "step_count": step_count,
                "estimated_cost": estimated_cost,
            }),
        )
    }

    /// # Errors
    /// Propagates append failures from the underlying log.
    pub fn log_tool_call(
        &self,
        request_id: &str,
        step_id: &str,
        tool_name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<LogEntry> {
        self.write(
            request_id,
            &format!("{step_id}-call"),
            AuditEventType::ToolCalled,
            json!({
                "step_id": step_id,
                "tool_name": tool_name,
                "arguments": arguments,
            }),
        )
    }

    /// # Errors
    /// Propagates append failures from the underlying log.
    pub fn log_observation(
        &self,
        request_id: &str,
        step_id: &str,
        status: &str,
        execution_time_ms: u64,
        retry_count: u32,
        error_message: Option<&str>,
    ) -> Result<LogEntry> {
        let mut data = json!({
            "step_id": step_id,
            "status": status,
            "execution_time_ms": execution_time_ms,
            "retry_count": retry_count,
        });
        if let (Some(message), Some(map)) = (error_message, data.as_object_mut()) {
            map.insert("error_message".to_string(), json!(message));
        }
        self.write(
            request_id,
            &format!("{step_id}-obs"),
            AuditEventType::ObservationRecorded,
            data,
        )
    }

    /// # Errors
    /// Propagates append failures from the underlying log.
    pub fn log_artifact(
        &self,
        request_id: &str,
        artifact_id: &str,
        artifact_type: &str,
        content_hash: &str,
        size_bytes: usize,
    ) -> Result<LogEntry> {
        self.write(
            request_id,
            &format!("{artifact_id}-artifact"),
            AuditEventType::ArtifactGenerated,
            json!({
                "artifact_id": artifact_id,
                "request_id": request_id,
                "artifact_type": artifact_type,
                "content_hash": content_hash,
                "size_bytes": size_bytes,
            }),
        )
    }

    /// # Errors
    /// Propagates append failures from the underlying log.
    pub fn log_policy_decision(
        &self,
        request_id: &str,
        decision_id: &str,
        policy_name: &str,
        decision: PolicyDecision,
        reason: &str,
        context: Option<Value>,
    ) -> Result<LogEntry> {
        let mut data = json!({
            "decision_id": decision_id,
            "policy_name": policy_name,
            "decision": decision.as_str(),
            "reason": reason,
        });
        if let (Some(context), Some(map)) = (context, data.as_object_mut()) {
            map.insert("context".to_string(), context);
        }
        self.write(
            request_id,
            &format!("{decision_id}-policy"),
            AuditEventType::PolicyDecision,
            data,
        )
    }

    /// # Errors
    /// Propagates append failures from the underlying log.
    pub fn log_error(
        &self,
        request_id: &str,
        error_type: &str,
        error_message: &str,
        context: Option<Value>,
    ) -> Result<LogEntry> {
        let mut data = json!({
            "error_type": error_type,
            "error_message": error_message,
        });
        if let (Some(context), Some(map)) = (context, data.as_object_mut()) {
            map.insert("context".to_string(), context);
        }
        self.write(
            request_id,
            &format!("{error_type}-error"),
            AuditEventType::ErrorOccurred,
            data,
        )
    }

    /// Record a cache lookup. `recipe_id` and `similarity` are absent on a miss.
    ///
    /// # Errors
    /// Propagates append failures from the underlying log.
    pub fn log_recipe_retrieval(
        &self,
        request_id: &str,
        schema_fingerprint: &str,
        recipe_id: Option<&str>,
        similarity: Option<f64>,
        candidates: usize,
    ) -> Result<LogEntry> {
        self.write(
            request_id,
            "recipe-retrieve",
            AuditEventType::RecipeRetrieved,
            json!({
                "recipe_id": recipe_id,
                "schema_fingerprint": schema_fingerprint,
                "similarity_score": similarity,
                "candidates": candidates,
            }),
        )
    }

    /// # Errors
    /// Propagates append failures from the underlying log.
    pub fn log_recipe_storage(
        &self,
        request_id: &str,
        recipe_id: &str,
        schema_fingerprint: &str,
        plan_id: &str,
        reused: bool,
    ) -> Result<LogEntry> {
        self.write(
            request_id,
            "recipe-store",
            AuditEventType::RecipeStored,
            json!({
                "recipe_id": recipe_id,
                "schema_fingerprint": schema_fingerprint,
                "plan_id": plan_id,
                "reused": reused,
            }),
        )
    }

    /// # Errors
    /// Propagates append failures from the underlying log.
    pub fn log_completion(
        &self,
        request_id: &str,
        status: &str,
        total_duration_ms: u64,
        artifact_count: usize,
    ) -> Result<LogEntry> {
        self.write(
            request_id,
            "complete",
            AuditEventType::AnalysisCompleted,
            json!({
                "request_id": request_id,
                "status": status,
                "total_duration_ms": total_duration_ms,
                "artifact_count": artifact_count,
            }),
        )
    }

    /// # Errors
    /// Returns an error if the log cannot be read.
    pub fn verify_integrity(&self) -> Result<ChainReport> {
        self.log.verify_chain()
    }

    /// All entries written for `request_id`, in write order.
    ///
    /// # Errors
    /// Returns an error if the log cannot be read or a line is corrupted.
    pub fn get_request_trace(&self, request_id: &str) -> Result<Vec<LogEntry>> {
        self.log.get_entries(&EntryFilter {
            entry_id_prefix: Some(format!("{request_id}-")),
            ..EntryFilter::default()
        })
    }
}
