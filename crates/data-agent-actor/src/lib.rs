#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use data_agent_domain::{
    AgentError, CancelToken, ErrorKind, Observation, ObservationMetadata, ObservationStatus, OperationType,
    PlanStep, ResourceQuota, ToolCall, ToolError, ToolKind, ToolOutput,
    FILTER_BEFORE_AGGREGATE,
};
use data_agent_policy::PolicyGate;
use data_agent_sandbox::Sandbox;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Name-indexed tool invocation capability. Long-running tools should poll
/// `cancel` and return once it is set.
pub trait ToolInvoker: Send + Sync {
    fn has_tool(&self, name: &str) -> bool;

    fn tool_names(&self) -> Vec<String>;

    #[allow(clippy::missing_errors_doc)]
    fn invoke(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        cancel: &CancelToken,
    ) -> Result<ToolOutput, ToolError>;
}

pub type ToolFn = Arc<
    dyn Fn(&Map<String, Value>, &CancelToken) -> Result<ToolOutput, ToolError> + Send + Sync,
>;

/// In-process registry of tool closures.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolFn>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool that runs to completion without observing
    /// cancellation.
    pub fn register<F>(&mut self, name: &str, tool: F) -> &mut Self
    where
        F: Fn(&Map<String, Value>) -> Result<ToolOutput, ToolError> + Send + Sync + 'static,
    {
        self.register_cancellable(name, move |arguments, _| tool(arguments))
    }

    pub fn register_cancellable<F>(&mut self, name: &str, tool: F) -> &mut Self
    where
        F: Fn(&Map<String, Value>, &CancelToken) -> Result<ToolOutput, ToolError>
            + Send
            + Sync
            + 'static,
    {
        self.tools.insert(name.to_string(), Arc::new(tool));
        self
    }
}

impl ToolInvoker for ToolRegistry {
    fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    fn invoke(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        cancel: &CancelToken,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| {
            ToolError::with_kind(
                AgentError::ToolNotFound {
                    tool: name.to_string(),
                }
                .to_string(),
                ErrorKind::ToolNotFound,
            )
        })?;
        tool(arguments, cancel)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchemaContext {
    pub database: Option<String>,
    pub table_name: Option<String>,
}

/// Append-only record of one request's final step observations, indexed by
/// step id, plus the bindings shared by every step.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLedger {
    observations: Vec<Observation>,
    by_step: BTreeMap<String, usize>,
    bindings: Map<String, Value>,
}

impl ExecutionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_bindings(bindings: Map<String, Value>) -> Self {
        Self {
            bindings,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn binding(&self, key: &str) -> Option<&Value> {
        self.bindings.get(key)
    }

    /// Append the observation for a step. A step already present is left
    /// untouched and `false` is returned.
    pub fn record(&mut self, observation: Observation) -> bool {
        if self.by_step.contains_key(&observation.step_id) {
            return false;
        }
        self.by_step
            .insert(observation.step_id.clone(), self.observations.len());
        self.observations.push(observation);
        true
    }

    #[must_use]
    pub fn get(&self, step_id: &str) -> Option<&Observation> {
        self.by_step
            .get(step_id)
            .and_then(|idx| self.observations.get(*idx))
    }

    /// Result of a step that succeeded.
    #[must_use]
    pub fn result_of(&self, step_id: &str) -> Option<&ToolOutput> {
        self.get(step_id)
            .filter(|obs| obs.is_success())
            .and_then(|obs| obs.result.as_ref())
    }

    #[must_use]
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActorSettings {
    pub max_retries: u32,
    pub quota: ResourceQuota,
    pub schema_context: SchemaContext,
    pub enforce_query_policy: bool,
    pub scan_results_for_pii: bool,
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            quota: ResourceQuota::default(),
            schema_context: SchemaContext::default(),
            enforce_query_policy: true,
            scan_results_for_pii: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSummary {
    pub total_executions: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f64,
    pub avg_retries: f64,
}

/// Grounds plan steps into tool calls and executes them with bounded retry.
pub struct Actor {
    tools: Arc<dyn ToolInvoker>,
    policy: PolicyGate,
    sandbox: Sandbox,
    settings: ActorSettings,
    history: Vec<Observation>,
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("settings", &self.settings)
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl Actor {
    #[must_use]
    pub fn new(
        tools: Arc<dyn ToolInvoker>,
        policy: PolicyGate,
        sandbox: Sandbox,
        settings: ActorSettings,
    ) -> Self {
        Self {
            tools,
            policy,
            sandbox,
            settings,
            history: Vec::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ActorSettings {
        &self.settings
    }

    /// Every attempt made so far, in order.
    #[must_use]
    pub fn history(&self) -> &[Observation] {
        &self.history
    }

    /// Resolve concrete arguments for `step` from its tool type and the
    /// results already in `ledger`, then check the step's invariants.
    ///
    /// # Errors
    /// Returns `AgentError::ToolNotFound` when the step's tool is not
    /// registered, or `AgentError::InvariantViolation` when a filtered
    /// aggregation has no successful filter among its dependencies.
    pub fn ground_step(
        &self,
        step: &PlanStep,
        ledger: &ExecutionLedger,
    ) -> Result<ToolCall, AgentError> {
        let tool_name = step.tool.as_str();
        if !self.tools.has_tool(tool_name) {
            return Err(AgentError::ToolNotFound {
                tool: tool_name.to_string(),
            });
        }

        let mut arguments = Map::new();
        let context = &self.settings.schema_context;
        match step.tool {
            ToolKind::Query => {
                arguments.insert("query".to_string(), json!(step.operation));
                if let Some(connection) = ledger.binding("connection") {
                    arguments.insert("connection".to_string(), connection.clone());
                }
                if let Some(database) = context
                    .database
                    .as_ref()
                    .map(|db| json!(db))
                    .or_else(|| ledger.binding("database").cloned())
                {
                    arguments.insert("database".to_string(), database);
                }
            }
            ToolKind::Transform => {
                arguments.insert("operation".to_string(), json!(step.operation));
                if let Some(op_type) = OperationType::classify(&step.operation) {
                    arguments.insert("operation_type".to_string(), json!(op_type.as_str()));
                }
                if let Some(data) = dependency_data(step, ledger) {
                    arguments.insert("data".to_string(), data);
                }
            }
            ToolKind::Chart => {
                arguments.insert("title".to_string(), json!(step.operation));
                arguments.insert("chart_type".to_string(), json!(chart_type(&step.operation)));
                if let Some(data) = dependency_data(step, ledger) {
                    arguments.insert("data".to_string(), data);
                }
            }
            ToolKind::Profile => {
                if let Some(table) = &context.table_name {
                    arguments.insert("table_name".to_string(), json!(table));
                }
                if let Some(connection) = ledger.binding("connection") {
                    arguments.insert("connection".to_string(), connection.clone());
                }
                if let Some(data) = dependency_data(step, ledger) {
                    arguments.insert("data".to_string(), data);
                }
            }
        }

        for invariant in &step.invariants {
            if !invariant.to_lowercase().contains("limit") {
                continue;
            }
            if let Some(limit) = invariant
                .split_once('=')
                .and_then(|(_, value)| value.trim().parse::<u64>().ok())
            {
                arguments.insert("limit".to_string(), json!(limit));
            }
        }

        self.validate_invariants(step, &arguments)?;

        debug!(step_id = %step.step_id, tool = tool_name, "step grounded");
        Ok(ToolCall {
            tool_name: tool_name.to_string(),
            arguments,
            step_id: step.step_id.clone(),
        })
    }

    fn validate_invariants(
        &self,
        step: &PlanStep,
        arguments: &Map<String, Value>,
    ) -> Result<(), AgentError> {
        let is_aggregate = arguments.get("operation_type").and_then(Value::as_str)
            == Some(OperationType::Aggregate.as_str());
        if !step.has_invariant(FILTER_BEFORE_AGGREGATE) || !is_aggregate {
            return Ok(());
        }
        let filtered = self.history.iter().any(|obs| {
            obs.is_success()
                && step.dependencies.contains(&obs.step_id)
                && obs.metadata.operation_type == Some(OperationType::Filter)
        });
        if filtered {
            Ok(())
        } else {
            Err(AgentError::InvariantViolation {
                step_id: step.step_id.clone(),
                invariant: format!(
                    "{FILTER_BEFORE_AGGREGATE}: no filtered dependency precedes this aggregation"
                ),
            })
        }
    }

    /// Invoke `tool_call` until it succeeds, fails with a non-retryable
    /// error, or `max_retries` retries have been spent. The initial call is
    /// attempt 0.
    pub fn execute_with_repair(&mut self, tool_call: &ToolCall, max_retries: u32) -> Observation {
        let mut attempt = 0;
        loop {
            let (observation, done) = self.attempt(tool_call, attempt, max_retries);
            self.history.push(observation.clone());
            if done {
                return observation;
            }
            attempt += 1;
        }
    }

    /// Ground then execute. Grounding failures become a failed observation
    /// without any invocation.
    pub fn execute_step(&mut self, step: &PlanStep, ledger: &ExecutionLedger) -> Observation {
        match self.ground_step(step, ledger) {
            Ok(call) => self.execute_with_repair(&call, self.settings.max_retries),
            Err(err) => self.record_grounding_failure(step, &err),
        }
    }

    /// Record a step that could not be grounded. Nothing is invoked.
    pub fn record_grounding_failure(&mut self, step: &PlanStep, err: &AgentError) -> Observation {
        let kind = match err.kind() {
            kind @ (ErrorKind::ToolNotFound | ErrorKind::InvariantViolation) => kind,
            _ => ErrorKind::GroundingFailed,
        };
        warn!(step_id = %step.step_id, error = %err, "grounding failed");
        let observation =
            Observation::failure(&step.step_id, format!("Grounding failed: {err}"), 0, kind);
        self.history.push(observation.clone());
        observation
    }

    fn attempt(&self, call: &ToolCall, attempt: u32, max_retries: u32) -> (Observation, bool) {
        let is_query = call.tool_name == ToolKind::Query.as_str();
        // A query with a WHERE clause counts as the filter step of its plan.
        let operation_type = call
            .arguments
            .get("operation_type")
            .and_then(Value::as_str)
            .and_then(OperationType::parse)
            .or_else(|| {
                call.arguments
                    .get("query")
                    .and_then(Value::as_str)
                    .filter(|_| is_query)
                    .and_then(OperationType::classify)
                    .filter(|op_type| *op_type == OperationType::Filter)
            });

        if self.settings.enforce_query_policy && is_query {
            let query = call
                .arguments
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let verdict = self.policy.check_query(query);
            if let Some(err) = verdict.clone().into_error() {
                let mut observation =
                    Observation::failure(&call.step_id, err.to_string(), attempt, ErrorKind::PolicyBlocked);
                observation.metadata.policy_violations = verdict.violations;
                return (observation, true);
            }
        }

        let tools = Arc::clone(&self.tools);
        let name = call.tool_name.clone();
        let arguments = call.arguments.clone();
        let outcome = self.sandbox.execute_in_sandbox(
            move |cancel| tools.invoke(&name, &arguments, cancel),
            &self.settings.quota,
        );

        let mut metadata = ObservationMetadata {
            operation_type,
            execution_time_ms: seconds_to_millis(outcome.execution_time_seconds),
            sandbox_violations: outcome.violations,
            attempt,
            ..ObservationMetadata::default()
        };

        match (outcome.success, outcome.result) {
            (true, Some(output)) => {
                metadata.shape = output.shape();
                if let Some(blocked) = self.inspect_output(&output, &mut metadata) {
                    let mut observation = Observation::failure(
                        &call.step_id,
                        blocked.to_string(),
                        attempt,
                        ErrorKind::PolicyBlocked,
                    );
                    observation.metadata = ObservationMetadata {
                        error_kind: Some(ErrorKind::PolicyBlocked),
                        ..metadata
                    };
                    return (observation, true);
                }
                let observation = Observation {
                    step_id: call.step_id.clone(),
                    status: ObservationStatus::Success,
                    result: Some(output),
                    error_message: None,
                    retry_count: attempt,
                    metadata,
                };
                (observation, true)
            }
            _ => {
                let message = outcome
                    .error
                    .unwrap_or_else(|| "tool returned no result".to_string());
                let kind = outcome
                    .error_kind
                    .unwrap_or_else(|| ErrorKind::classify(&message));
                metadata.error_kind = Some(kind);

                let (final_message, done) = if !kind.is_retryable() {
                    (AgentError::NonRecoverableTool(message).to_string(), true)
                } else if outcome.worker_outstanding {
                    // Retrying would run the tool alongside its previous attempt.
                    warn!(
                        step_id = %call.step_id,
                        attempt,
                        "timed-out tool is still running, not retrying"
                    );
                    (message, true)
                } else if attempt >= max_retries {
                    (
                        AgentError::RecoverableTool {
                            message,
                            max_retries,
                        }
                        .to_string(),
                        true,
                    )
                } else {
                    warn!(
                        step_id = %call.step_id,
                        attempt,
                        error = %message,
                        "recoverable tool failure, retrying"
                    );
                    (message, false)
                };

                let observation = Observation {
                    step_id: call.step_id.clone(),
                    status: ObservationStatus::Failure,
                    result: None,
                    error_message: Some(final_message),
                    retry_count: attempt,
                    metadata,
                };
                (observation, done)
            }
        }
    }

    // Post-invocation checks on tabular output. Returns the policy error when
    // the result must be withheld.
    fn inspect_output(
        &self,
        output: &ToolOutput,
        metadata: &mut ObservationMetadata,
    ) -> Option<AgentError> {
        let ToolOutput::Table { columns, rows } = output else {
            return None;
        };

        let max_rows = self.settings.quota.max_rows;
        if u64::try_from(rows.len()).unwrap_or(u64::MAX) > max_rows {
            metadata.sandbox_violations.push(format!(
                "Row count exceeded limit: {} > {max_rows}",
                rows.len()
            ));
        }

        let table = self
            .settings
            .schema_context
            .table_name
            .as_deref()
            .unwrap_or("result");
        if self.settings.schema_context.table_name.is_some() {
            let access = self.policy.validate_column_access(table, columns);
            if !access.allowed {
                metadata.policy_violations.clone_from(&access.violations);
                return access.into_error();
            }
        }

        if self.settings.scan_results_for_pii {
            let matches = self.policy.scan_rows_for_pii(rows, table);
            if !matches.is_empty() {
                warn!(matches = matches.len(), table, "pii detected in tool output");
            }
            metadata.pii_matches = matches.len();
        }
        None
    }

    /// Aggregate counts over every recorded attempt.
    #[must_use]
    pub fn get_execution_summary(&self) -> ExecutionSummary {
        let total = self.history.len();
        if total == 0 {
            return ExecutionSummary {
                total_executions: 0,
                successes: 0,
                failures: 0,
                success_rate: 0.0,
                avg_retries: 0.0,
            };
        }
        let successes = self.history.iter().filter(|obs| obs.is_success()).count();
        let failures = self
            .history
            .iter()
            .filter(|obs| obs.status == ObservationStatus::Failure)
            .count();
        let retries: u64 = self
            .history
            .iter()
            .map(|obs| u64::from(obs.retry_count))
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let (success_rate, avg_retries) = (
            successes as f64 / total as f64,
            retries as f64 / total as f64,
        );
        ExecutionSummary {
            total_executions: total,
            successes,
            failures,
            success_rate,
            avg_retries,
        }
    }
}

// Output of the last successful dependency, in declaration order.
fn dependency_data(step: &PlanStep, ledger: &ExecutionLedger) -> Option<Value> {
    step.dependencies
        .iter()
        .rev()
        .find_map(|dep| ledger.result_of(dep))
        .and_then(|output| serde_json::to_value(output).ok())
}

fn chart_type(operation: &str) -> &'static str {
    let lower = operation.to_lowercase();
    ["bar", "line", "scatter", "pie"]
        .into_iter()
        .find(|kind| lower.contains(kind))
        .unwrap_or("bar")
}

fn seconds_to_millis(seconds: f64) -> u64 {
    Duration::try_from_secs_f64(seconds)
        .ok()
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

#[cfg(test)]
mod tests {
    use super::{Actor, ActorSettings, ExecutionLedger, SchemaContext, ToolInvoker, ToolRegistry};
    use data_agent_domain::{
        CancelToken, ErrorKind, Observation, ObservationStatus, OperationType, PlanStep,
        ResourceQuota, ToolError, ToolKind, ToolOutput, FILTER_BEFORE_AGGREGATE,
    };
    use data_agent_policy::{PolicyConfig, PolicyGate};
    use data_agent_sandbox::Sandbox;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn table(columns: &[&str], rows: usize) -> ToolOutput {
        let mut row = Map::new();
        for column in columns {
            row.insert((*column).to_string(), json!(1));
        }
        ToolOutput::Table {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows: vec![row; rows],
        }
    }

    fn step(id: &str, tool: ToolKind, operation: &str, deps: &[&str], invariants: &[&str]) -> PlanStep {
        PlanStep {
            step_id: id.to_string(),
            operation: operation.to_string(),
            tool,
            dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
            estimated_cost: tool.estimated_cost(),
            invariants: invariants.iter().map(|i| (*i).to_string()).collect(),
        }
    }

    fn actor_with(registry: ToolRegistry, settings: ActorSettings) -> Actor {
        let policy = PolicyGate::new(&PolicyConfig::default()).unwrap_or_else(|_| unreachable!());
        Actor::new(Arc::new(registry), policy, Sandbox::new(), settings)
    }

    fn full_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register("sql_runner", |_| Ok(table(&["region", "sales"], 3)))
            .register("df_operations", |_| Ok(table(&["region", "total"], 2)))
            .register("plotter", |args| {
                Ok(ToolOutput::Chart {
                    path: "chart.png".to_string(),
                    chart_type: args
                        .get("chart_type")
                        .and_then(Value::as_str)
                        .unwrap_or("bar")
                        .to_string(),
                })
            })
            .register("profiler", |_| {
                Ok(ToolOutput::Value { value: json!({"rows": 3}) })
            });
        registry
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = ToolRegistry::new();
        registry.register("sql_runner", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ToolError::new("Connection timeout"))
            } else {
                Ok(table(&["a"], 1))
            }
        });
        let mut actor = actor_with(registry, ActorSettings::default());
        let observation = actor.execute_step(
            &step("s1", ToolKind::Query, "Query sales", &[], &[]),
            &ExecutionLedger::new(),
        );

        assert_eq!(observation.status, ObservationStatus::Success);
        assert_eq!(observation.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(actor.history().len(), 3);
    }

    #[test]
    fn non_recoverable_error_fails_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = ToolRegistry::new();
        registry.register("df_operations", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ToolError::new("column 'x' does not exist"))
        });
        let mut actor = actor_with(registry, ActorSettings::default());
        let observation = actor.execute_step(
            &step("s1", ToolKind::Transform, "Pivot table", &[], &[]),
            &ExecutionLedger::new(),
        );

        assert_eq!(observation.status, ObservationStatus::Failure);
        assert_eq!(observation.retry_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            observation.error_message.as_deref(),
            Some("Non-recoverable error: column 'x' does not exist")
        );
        assert_eq!(observation.metadata.error_kind, Some(ErrorKind::NonRecoverable));
    }

    #[test]
    fn retry_budget_is_bounded() {
        let mut registry = ToolRegistry::new();
        registry.register("df_operations", |_| Err(ToolError::new("temporary outage")));
        let mut actor = actor_with(registry, ActorSettings::default());
        let call = actor
            .ground_step(
                &step("s1", ToolKind::Transform, "Pivot table", &[], &[]),
                &ExecutionLedger::new(),
            )
            .unwrap_or_else(|_| unreachable!());
        let observation = actor.execute_with_repair(&call, 3);

        assert_eq!(observation.status, ObservationStatus::Failure);
        assert_eq!(observation.retry_count, 3);
        assert_eq!(
            observation.error_message.as_deref(),
            Some("Max retries (3) exceeded. Last error: temporary outage")
        );
        assert_eq!(actor.history().len(), 4);
    }

    #[test]
    fn explicit_tool_error_kind_overrides_message() {
        let mut registry = ToolRegistry::new();
        registry.register("df_operations", |_| {
            Err(ToolError::with_kind("connection string invalid", ErrorKind::NonRecoverable))
        });
        let mut actor = actor_with(registry, ActorSettings::default());
        let observation = actor.execute_step(
            &step("s1", ToolKind::Transform, "Pivot", &[], &[]),
            &ExecutionLedger::new(),
        );
        assert_eq!(observation.retry_count, 0);
        assert_eq!(actor.history().len(), 1);
    }

    #[test]
    fn missing_tool_fails_grounding() {
        let mut actor = actor_with(ToolRegistry::new(), ActorSettings::default());
        let observation = actor.execute_step(
            &step("s1", ToolKind::Chart, "Plot revenue", &[], &[]),
            &ExecutionLedger::new(),
        );
        assert_eq!(observation.status, ObservationStatus::Failure);
        assert_eq!(observation.metadata.error_kind, Some(ErrorKind::ToolNotFound));
        assert!(observation
            .error_message
            .as_deref()
            .is_some_and(|msg| msg.starts_with("Grounding failed: Tool 'plotter'")));
    }

    #[test]
    fn query_grounding_inherits_connection_and_limit() {
        let actor = actor_with(
            full_registry(),
            ActorSettings {
                schema_context: SchemaContext {
                    database: Some("warehouse".to_string()),
                    table_name: None,
                },
                ..ActorSettings::default()
            },
        );
        let mut bindings = Map::new();
        bindings.insert("connection".to_string(), json!("conn-1"));
        let ledger = ExecutionLedger::with_bindings(bindings);
        let call = actor
            .ground_step(
                &step("s1", ToolKind::Query, "Query sales", &[], &["row_limit=500"]),
                &ledger,
            )
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(call.tool_name, "sql_runner");
        assert_eq!(call.arguments.get("query"), Some(&json!("Query sales")));
        assert_eq!(call.arguments.get("connection"), Some(&json!("conn-1")));
        assert_eq!(call.arguments.get("database"), Some(&json!("warehouse")));
        assert_eq!(call.arguments.get("limit"), Some(&json!(500)));
    }

    #[test]
    fn chart_grounding_reads_dependency_result() {
        let actor = actor_with(full_registry(), ActorSettings::default());
        let mut ledger = ExecutionLedger::new();
        assert!(ledger.record(Observation {
            step_id: "s1".to_string(),
            status: ObservationStatus::Success,
            result: Some(table(&["region"], 1)),
            error_message: None,
            retry_count: 0,
            metadata: data_agent_domain::ObservationMetadata::default(),
        }));
        let call = actor
            .ground_step(
                &step("s2", ToolKind::Chart, "Line chart of sales", &["s1"], &[]),
                &ledger,
            )
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(call.arguments.get("chart_type"), Some(&json!("line")));
        assert_eq!(
            call.arguments.get("data").and_then(|d| d.get("kind")),
            Some(&json!("table"))
        );
    }

    #[test]
    fn filtered_aggregate_requires_prior_filter() {
        let mut actor = actor_with(full_registry(), ActorSettings::default());
        let ledger = ExecutionLedger::new();
        let aggregate = step(
            "agg",
            ToolKind::Transform,
            "Sum revenue by region",
            &["flt"],
            &[FILTER_BEFORE_AGGREGATE],
        );

        let blocked = actor.execute_step(&aggregate, &ledger);
        assert_eq!(blocked.metadata.error_kind, Some(ErrorKind::InvariantViolation));

        let filter = step("flt", ToolKind::Transform, "Filter rows by date", &[], &[FILTER_BEFORE_AGGREGATE]);
        let filtered = actor.execute_step(&filter, &ledger);
        assert!(filtered.is_success());
        assert_eq!(filtered.metadata.operation_type, Some(OperationType::Filter));

        let allowed = actor.execute_step(&aggregate, &ledger);
        assert!(allowed.is_success());
    }

    #[test]
    fn filter_mentioning_count_is_not_an_aggregate() {
        let mut actor = actor_with(full_registry(), ActorSettings::default());
        let mut ledger = ExecutionLedger::new();
        let query = actor.execute_step(
            &step("q", ToolKind::Query, "Query sales data", &[], &[]),
            &ledger,
        );
        assert!(query.is_success());
        assert!(ledger.record(query));

        let filter = actor.execute_step(
            &step(
                "f",
                ToolKind::Transform,
                "Filter rows where count > 5",
                &["q"],
                &[FILTER_BEFORE_AGGREGATE],
            ),
            &ledger,
        );
        assert!(filter.is_success());
        assert_eq!(filter.metadata.operation_type, Some(OperationType::Filter));
    }

    #[test]
    fn query_with_where_clause_satisfies_filter_invariant() {
        let mut actor = actor_with(full_registry(), ActorSettings::default());
        let mut ledger = ExecutionLedger::new();
        let query = actor.execute_step(
            &step(
                "q",
                ToolKind::Query,
                "Query sales where region = 'west'",
                &[],
                &[FILTER_BEFORE_AGGREGATE],
            ),
            &ledger,
        );
        assert!(query.is_success());
        assert_eq!(query.metadata.operation_type, Some(OperationType::Filter));
        assert!(ledger.record(query));

        let filtered_sum = actor.execute_step(
            &step(
                "s",
                ToolKind::Transform,
                "Sum revenue where amount > 0",
                &["q"],
                &[FILTER_BEFORE_AGGREGATE],
            ),
            &ledger,
        );
        assert!(filtered_sum.is_success());

        let grouped = actor.execute_step(
            &step(
                "g",
                ToolKind::Transform,
                "Sum revenue by region",
                &["q"],
                &[FILTER_BEFORE_AGGREGATE],
            ),
            &ledger,
        );
        assert!(grouped.is_success());
        assert_eq!(grouped.metadata.operation_type, Some(OperationType::Aggregate));
    }

    #[test]
    fn timed_out_attempts_never_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicU32::new(0));
        let (gauge, high_water, counter) =
            (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&calls));
        let mut registry = ToolRegistry::new();
        registry.register_cancellable("sql_runner", move |_, cancel| {
            counter.fetch_add(1, Ordering::SeqCst);
            let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
            high_water.fetch_max(now, Ordering::SeqCst);
            let started = Instant::now();
            while !cancel.is_cancelled() && started.elapsed() < Duration::from_millis(600) {
                thread::sleep(Duration::from_millis(5));
            }
            gauge.fetch_sub(1, Ordering::SeqCst);
            Ok(table(&["a"], 1))
        });
        let mut actor = actor_with(
            registry,
            ActorSettings {
                quota: ResourceQuota {
                    max_execution_seconds: 0.1,
                    ..ResourceQuota::default()
                },
                ..ActorSettings::default()
            },
        );
        let call = actor
            .ground_step(
                &step("s1", ToolKind::Query, "Query sales", &[], &[]),
                &ExecutionLedger::new(),
            )
            .unwrap_or_else(|_| unreachable!());
        let observation = actor.execute_with_repair(&call, 3);

        assert_eq!(observation.status, ObservationStatus::Failure);
        assert_eq!(observation.metadata.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(observation.retry_count, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timeout_with_running_worker_is_final() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = ToolRegistry::new();
        registry.register("sql_runner", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(400));
            Ok(table(&["a"], 1))
        });
        let policy = PolicyGate::new(&PolicyConfig::default()).unwrap_or_else(|_| unreachable!());
        let sandbox = Sandbox::new().with_cancel_grace(Duration::from_millis(10));
        let mut actor = Actor::new(
            Arc::new(registry),
            policy,
            sandbox,
            ActorSettings {
                quota: ResourceQuota {
                    max_execution_seconds: 0.05,
                    ..ResourceQuota::default()
                },
                ..ActorSettings::default()
            },
        );
        let observation = actor.execute_step(
            &step("s1", ToolKind::Query, "Query sales", &[], &[]),
            &ExecutionLedger::new(),
        );

        assert_eq!(observation.status, ObservationStatus::Failure);
        assert_eq!(observation.metadata.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(observation.retry_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(actor.history().len(), 1);
    }

    #[test]
    fn blocked_query_is_never_invoked() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = ToolRegistry::new();
        registry.register("sql_runner", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(table(&["a"], 1))
        });
        let mut actor = actor_with(registry, ActorSettings::default());
        let observation = actor.execute_step(
            &step("s1", ToolKind::Query, "Select rows then delete duplicates", &[], &[]),
            &ExecutionLedger::new(),
        );
        assert_eq!(observation.metadata.error_kind, Some(ErrorKind::PolicyBlocked));
        assert!(!observation.metadata.policy_violations.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn query_description_is_checked_as_sql_text() {
        let mut actor = actor_with(full_registry(), ActorSettings::default());
        let ledger = ExecutionLedger::new();
        let export = actor.execute_step(
            &step("s1", ToolKind::Query, "Fetch and export monthly totals", &[], &[]),
            &ledger,
        );
        assert_eq!(export.metadata.error_kind, Some(ErrorKind::PolicyBlocked));
        assert!(export
            .metadata
            .policy_violations
            .iter()
            .any(|v| v == "Dangerous operation blocked: EXPORT"));

        let exports = actor.execute_step(
            &step("s2", ToolKind::Query, "Fetch monthly exports", &[], &[]),
            &ledger,
        );
        assert!(exports.is_success());
    }

    #[test]
    fn blocked_column_withholds_result() {
        let mut registry = ToolRegistry::new();
        registry.register("sql_runner", |_| Ok(table(&["name", "password"], 1)));
        let mut actor = actor_with(
            registry,
            ActorSettings {
                schema_context: SchemaContext {
                    database: None,
                    table_name: Some("users".to_string()),
                },
                ..ActorSettings::default()
            },
        );
        let observation = actor.execute_step(
            &step("s1", ToolKind::Query, "Fetch users", &[], &[]),
            &ExecutionLedger::new(),
        );
        assert_eq!(observation.status, ObservationStatus::Failure);
        assert!(observation.result.is_none());
        assert_eq!(observation.metadata.error_kind, Some(ErrorKind::PolicyBlocked));
    }

    #[test]
    fn oversized_result_is_flagged_not_failed() {
        let mut registry = ToolRegistry::new();
        registry.register("sql_runner", |_| Ok(table(&["a"], 5)));
        let mut actor = actor_with(
            registry,
            ActorSettings {
                quota: ResourceQuota {
                    max_rows: 2,
                    ..ResourceQuota::default()
                },
                ..ActorSettings::default()
            },
        );
        let observation = actor.execute_step(
            &step("s1", ToolKind::Query, "Fetch rows", &[], &[]),
            &ExecutionLedger::new(),
        );
        assert!(observation.is_success());
        assert!(observation
            .metadata
            .sandbox_violations
            .iter()
            .any(|v| v.starts_with("Row count exceeded")));
    }

    #[test]
    fn pii_in_results_is_counted() {
        let mut registry = ToolRegistry::new();
        registry.register("sql_runner", |_| {
            let mut row = Map::new();
            row.insert("contact".to_string(), json!("alice@example.com"));
            Ok(ToolOutput::Table {
                columns: vec!["contact".to_string()],
                rows: vec![row],
            })
        });
        let mut actor = actor_with(registry, ActorSettings::default());
        let observation = actor.execute_step(
            &step("s1", ToolKind::Query, "Fetch contacts", &[], &[]),
            &ExecutionLedger::new(),
        );
        assert!(observation.is_success());
        assert_eq!(observation.metadata.pii_matches, 1);
    }

    #[test]
    fn ledger_is_append_only() {
        let mut ledger = ExecutionLedger::new();
        let first = Observation::failure("s1", "boom".to_string(), 0, ErrorKind::NonRecoverable);
        assert!(ledger.record(first.clone()));
        let mut second = first;
        second.error_message = Some("overwrite".to_string());
        assert!(!ledger.record(second));
        assert_eq!(
            ledger.get("s1").and_then(|obs| obs.error_message.as_deref()),
            Some("boom")
        );
        assert!(ledger.result_of("s1").is_none());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn registry_lists_tool_names() {
        let registry = full_registry();
        assert!(registry.has_tool("plotter"));
        assert_eq!(
            registry.tool_names(),
            vec!["df_operations", "plotter", "profiler", "sql_runner"]
        );
        assert!(registry
            .invoke("missing", &Map::new(), &CancelToken::new())
            .is_err());
    }

    #[test]
    fn summary_counts_every_attempt() {
        let mut actor = actor_with(full_registry(), ActorSettings::default());
        assert_eq!(actor.get_execution_summary().total_executions, 0);

        let ledger = ExecutionLedger::new();
        let _ = actor.execute_step(&step("s1", ToolKind::Query, "Query sales", &[], &[]), &ledger);
        let _ = actor.execute_step(&step("s2", ToolKind::Profile, "Profile schema", &[], &[]), &ledger);

        let summary = actor.get_execution_summary();
        assert_eq!(summary.total_executions, 2);
        assert_eq!(summary.successes, 2);
        assert!((summary.success_rate - 1.0).abs() < f64::EPSILON);
        assert!(summary.avg_retries.abs() < f64::EPSILON);
    }
}
