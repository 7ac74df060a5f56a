#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Parent hash of the first entry in every audit chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Error-message fragments treated as transient failures.
pub const RECOVERABLE_PATTERNS: [&str; 5] =
    ["timeout", "connection", "temporary", "rate limit", "retry"];

pub const FILTER_BEFORE_AGGREGATE: &str = "filter_before_aggregate";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PlanId(pub Ulid);

impl PlanId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Short, lowercase prefix used to namespace step ids inside one plan.
    #[must_use]
    pub fn short(&self) -> String {
        let full = self.0.to_string().to_ascii_lowercase();
        let start = full.len().saturating_sub(8);
        full[start..].to_string()
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecipeId(pub Ulid);

impl RecipeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecipeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecipeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ToolKind {
    #[serde(rename = "sql_runner")]
    Query,
    #[serde(rename = "df_operations")]
    Transform,
    #[serde(rename = "plotter")]
    Chart,
    #[serde(rename = "profiler")]
    Profile,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::Query,
        ToolKind::Transform,
        ToolKind::Chart,
        ToolKind::Profile,
    ];

    /// Registry name of the tool backing this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "sql_runner",
            Self::Transform => "df_operations",
            Self::Chart => "plotter",
            Self::Profile => "profiler",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sql_runner" => Some(Self::Query),
            "df_operations" => Some(Self::Transform),
            "plotter" => Some(Self::Chart),
            "profiler" => Some(Self::Profile),
            _ => None,
        }
    }

    /// Fixed plan-time cost. No per-row modeling.
    #[must_use]
    pub fn estimated_cost(self) -> f64 {
        match self {
            Self::Query => 2.0,
            Self::Transform => 1.0,
            Self::Chart => 1.5,
            Self::Profile => 0.5,
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Aggregate,
    Filter,
    Sort,
    Join,
}

impl OperationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggregate => "aggregate",
            Self::Filter => "filter",
            Self::Sort => "sort",
            Self::Join => "join",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "aggregate" => Some(Self::Aggregate),
            "filter" => Some(Self::Filter),
            "sort" => Some(Self::Sort),
            "join" => Some(Self::Join),
            _ => None,
        }
    }

    /// Keyword classification of an operation's text, matched on whole
    /// words. Filtering is checked first, so "sum revenue where ..." is a
    /// filter step.
    #[must_use]
    pub fn classify(operation: &str) -> Option<Self> {
        let lower = operation.to_lowercase();
        let words: Vec<&str> = lower
            .split(|ch: char| !ch.is_alphanumeric() && ch != '_')
            .filter(|word| !word.is_empty())
            .collect();
        let has = |keywords: &[&str]| words.iter().any(|word| keywords.contains(word));
        if has(&["filter", "filtered", "filtering", "where"]) {
            Some(Self::Filter)
        } else if has(&[
            "aggregate",
            "aggregated",
            "aggregation",
            "group",
            "grouped",
            "groupby",
            "sum",
            "average",
            "count",
        ]) {
            Some(Self::Aggregate)
        } else if has(&["sort", "sorted", "order"]) {
            Some(Self::Sort)
        } else if has(&["join", "joined", "merge"]) {
            Some(Self::Join)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub step_id: String,
    pub operation: String,
    pub tool: ToolKind,
    pub dependencies: Vec<String>,
    pub estimated_cost: f64,
    pub invariants: Vec<String>,
}

impl PlanStep {
    #[must_use]
    pub fn has_invariant(&self, invariant: &str) -> bool {
        self.invariants.iter().any(|item| item == invariant)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub plan_id: PlanId,
    pub objective: String,
    pub steps: Vec<PlanStep>,
    pub total_cost: f64,
    pub deliverables: Vec<String>,
}

impl Plan {
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    /// Operation graph with plan-local ids, suitable for storing as a recipe
    /// and rebuilding into a fresh plan later.
    #[must_use]
    pub fn operation_graph(&self) -> Value {
        let prefix = format!("{}-", self.plan_id.short());
        let local = |step_id: &str| {
            step_id
                .strip_prefix(prefix.as_str())
                .unwrap_or(step_id)
                .to_string()
        };
        let steps: Vec<Value> = self
            .steps
            .iter()
            .map(|step| {
                serde_json::json!({
                    "id": local(&step.step_id),
                    "description": step.operation,
                    "dependencies": step
                        .dependencies
                        .iter()
                        .map(|dep| local(dep.as_str()))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        serde_json::json!({ "steps": steps })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Operation {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Operations as produced by an intent parser: either an explicit dependency
/// graph or a plain ordered list that is chained linearly.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum Operations {
    Graph(Vec<Operation>),
    Linear(Vec<String>),
}

impl Operations {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Graph(items) => items.len(),
            Self::Linear(items) => items.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild operations from a stored `{"steps":[{id, description, dependencies}]}` graph.
    ///
    /// # Errors
    /// Returns an error when the value does not have that shape.
    pub fn from_graph_value(value: &Value) -> Result<Self> {
        let steps = value
            .get("steps")
            .cloned()
            .ok_or_else(|| anyhow!("plan_structure is missing 'steps'"))?;
        let operations: Vec<Operation> = serde_json::from_value(steps)
            .map_err(|err| anyhow!("invalid plan_structure steps: {err}"))?;
        Ok(Self::Graph(operations))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ParsedIntent {
    pub objective: String,
    #[serde(default)]
    pub data_requirements: Vec<String>,
    pub operations: Operations,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub step_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutput {
    Table {
        columns: Vec<String>,
        rows: Vec<Map<String, Value>>,
    },
    Chart {
        path: String,
        chart_type: String,
    },
    Profile {
        table_name: Option<String>,
        columns: BTreeMap<String, String>,
    },
    Value {
        value: Value,
    },
}

impl ToolOutput {
    #[must_use]
    pub fn shape(&self) -> ResultShape {
        match self {
            Self::Table { columns, rows } => ResultShape::Tabular {
                row_count: rows.len(),
                column_count: columns.len(),
                columns: columns.clone(),
            },
            Self::Chart { .. } | Self::Profile { .. } | Self::Value { .. } => ResultShape::Opaque,
        }
    }

    #[must_use]
    pub fn artifact_type(&self) -> &'static str {
        match self {
            Self::Table { .. } => "table",
            Self::Chart { .. } => "chart",
            Self::Profile { .. } => "profile",
            Self::Value { .. } => "data",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultShape {
    Tabular {
        row_count: usize,
        column_count: usize,
        columns: Vec<String>,
    },
    #[default]
    Opaque,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ObservationStatus {
    Success,
    Failure,
    Partial,
}

impl ObservationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObservationMetadata {
    pub operation_type: Option<OperationType>,
    #[serde(default)]
    pub shape: ResultShape,
    pub error_kind: Option<ErrorKind>,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub sandbox_violations: Vec<String>,
    #[serde(default)]
    pub policy_violations: Vec<String>,
    pub pii_matches: usize,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub step_id: String,
    pub status: ObservationStatus,
    pub result: Option<ToolOutput>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub metadata: ObservationMetadata,
}

impl Observation {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ObservationStatus::Success
    }

    /// Failure observation carrying the kind in metadata.
    #[must_use]
    pub fn failure(step_id: &str, message: String, retry_count: u32, kind: ErrorKind) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: ObservationStatus::Failure,
            result: None,
            error_message: Some(message),
            retry_count,
            metadata: ObservationMetadata {
                error_kind: Some(kind),
                attempt: retry_count,
                ..ObservationMetadata::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Recoverable,
    NonRecoverable,
    Timeout,
    ResourceExceeded,
    PolicyBlocked,
    InvariantViolation,
    ToolNotFound,
    GroundingFailed,
}

impl ErrorKind {
    /// Initial classifier table: a message containing any recoverable pattern
    /// (case-insensitive) is transient, everything else is not.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if RECOVERABLE_PATTERNS
            .iter()
            .any(|pattern| lower.contains(pattern))
        {
            Self::Recoverable
        } else {
            Self::NonRecoverable
        }
    }

    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Recoverable | Self::Timeout)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recoverable => "recoverable",
            Self::NonRecoverable => "non_recoverable",
            Self::Timeout => "timeout",
            Self::ResourceExceeded => "resource_exceeded",
            Self::PolicyBlocked => "policy_blocked",
            Self::InvariantViolation => "invariant_violation",
            Self::ToolNotFound => "tool_not_found",
            Self::GroundingFailed => "grounding_failed",
        }
    }
}

/// Cooperative cancellation flag shared between a sandbox and the tool it
/// runs. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Error returned by a tool invocation. Tools that know the failure class set
/// `kind`; otherwise it is derived from the message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
    pub kind: Option<ErrorKind>,
}

impl ToolError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    #[must_use]
    pub fn with_kind(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind: Some(kind),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
            .unwrap_or_else(|| ErrorKind::classify(&self.message))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("plan validation failed: {0}")]
    PlanValidation(String),
    #[error("Tool '{tool}' not found in registry")]
    ToolNotFound { tool: String },
    #[error("Invariant violation on step {step_id}: {invariant}")]
    InvariantViolation { step_id: String, invariant: String },
    #[error("Max retries ({max_retries}) exceeded. Last error: {message}")]
    RecoverableTool { message: String, max_retries: u32 },
    #[error("Non-recoverable error: {0}")]
    NonRecoverableTool(String),
    #[error("Execution timeout: exceeded {seconds}s")]
    SandboxTimeout { seconds: f64 },
    #[error("Resource quota exceeded: {0}")]
    SandboxResourceExceeded(String),
    #[error("Policy violation ({severity}): {}", .violations.join("; "))]
    PolicyViolation {
        severity: Severity,
        violations: Vec<String>,
    },
    #[error("audit chain broken: {0}")]
    AuditChainBroken(String),
    #[error("intent parse failed: {0}")]
    IntentParse(String),
}

impl AgentError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PlanValidation(_) | Self::IntentParse(_) | Self::AuditChainBroken(_) => {
                ErrorKind::NonRecoverable
            }
            Self::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            Self::InvariantViolation { .. } => ErrorKind::InvariantViolation,
            Self::RecoverableTool { .. } => ErrorKind::Recoverable,
            Self::NonRecoverableTool(_) => ErrorKind::NonRecoverable,
            Self::SandboxTimeout { .. } => ErrorKind::Timeout,
            Self::SandboxResourceExceeded(_) => ErrorKind::ResourceExceeded,
            Self::PolicyViolation { .. } => ErrorKind::PolicyBlocked,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyResult {
    pub allowed: bool,
    pub violations: Vec<String>,
    pub severity: Severity,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PolicyResult {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            violations: Vec::new(),
            severity: Severity::None,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn deny(violation: String, severity: Severity) -> Self {
        Self {
            allowed: false,
            violations: vec![violation],
            severity,
            metadata: Map::new(),
        }
    }

    /// Record a violation, keeping the highest severity seen so far.
    pub fn add_violation(&mut self, violation: String, severity: Severity) {
        self.allowed = false;
        self.violations.push(violation);
        self.severity = self.severity.max(severity);
    }

    #[must_use]
    pub fn into_error(self) -> Option<AgentError> {
        if self.allowed {
            return None;
        }
        Some(AgentError::PolicyViolation {
            severity: self.severity,
            violations: self.violations,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PiiType {
    Ssn,
    CreditCard,
    Email,
    Phone,
}

impl PiiType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssn => "ssn",
            Self::CreditCard => "credit_card",
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PiiMatch {
    pub pii_type: PiiType,
    pub value: String,
    pub location: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceQuota {
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub max_execution_seconds: f64,
    pub max_rows: u64,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            max_memory_mb: 1024,
            max_cpu_percent: 80.0,
            max_execution_seconds: 30.0,
            max_rows: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxResult<T> {
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub execution_time_seconds: f64,
    pub peak_memory_mb: f64,
    pub avg_cpu_percent: f64,
    pub violations: Vec<String>,
    /// The worker was still running when the sandbox returned.
    pub worker_outstanding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub entry_id: String,
    pub timestamp: String,
    pub event_type: String,
    pub data: Value,
    pub parent_hash: String,
    pub entry_hash: String,
}

impl LogEntry {
    /// Build an entry chained onto `parent_hash`, stamping the current time.
    #[must_use]
    pub fn seal(entry_id: &str, event_type: &str, data: Value, parent_hash: &str) -> Self {
        let timestamp = audit_timestamp(now_utc());
        let entry_hash = compute_entry_hash(entry_id, &timestamp, event_type, &data, parent_hash);
        Self {
            entry_id: entry_id.to_string(),
            timestamp,
            event_type: event_type.to_string(),
            data,
            parent_hash: parent_hash.to_string(),
            entry_hash,
        }
    }

    /// Hash recomputed from the stored fields, ignoring `entry_hash`.
    #[must_use]
    pub fn recompute_hash(&self) -> String {
        compute_entry_hash(
            &self.entry_id,
            &self.timestamp,
            &self.event_type,
            &self.data,
            &self.parent_hash,
        )
    }
}

#[must_use]
pub fn compute_entry_hash(
    entry_id: &str,
    timestamp: &str,
    event_type: &str,
    data: &Value,
    parent_hash: &str,
) -> String {
    let material = serde_json::json!({
        "entry_id": entry_id,
        "timestamp": timestamp,
        "event_type": event_type,
        "data": data,
        "parent_hash": parent_hash,
    });
    hash_bytes(canonical_json(&material).as_bytes())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipe {
    pub recipe_id: RecipeId,
    pub schema_fingerprint: String,
    pub intent_template: String,
    pub intent_embedding: Vec<f32>,
    pub plan_structure: Value,
    pub tool_argument_templates: Value,
    pub success_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used_at: DateTimeUtc,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value through its canonical serialization.
#[must_use]
pub fn hash_json(value: &Value) -> String {
    hash_bytes(canonical_json(value).as_bytes())
}

/// Sorted keys at every depth, no whitespace, non-ASCII escaped as `\uXXXX`.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(text) => write_ascii_string(text, out),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            out.push('{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_ascii_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

fn write_ascii_string(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            ' '..='\u{7f}' => out.push(ch),
            _ => {
                let mut units = [0_u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
        }
    }
    out.push('"');
}

/// RFC 3339 UTC with microsecond precision and a `Z` suffix.
#[must_use]
pub fn audit_timestamp(value: DateTimeUtc) -> String {
    let utc = value.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second(),
        utc.microsecond()
    )
}

/// Format a timestamp as RFC 3339.
///
/// # Errors
/// Returns an error when the value cannot be formatted.
pub fn rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

/// Parse an RFC 3339 timestamp.
///
/// # Errors
/// Returns an error when the input is not RFC 3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Truncate to at most `max_chars` characters on a char boundary.
#[must_use]
pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
