#![forbid(unsafe_code)]

pub mod config;
pub mod redact;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use data_agent_actor::{Actor, ExecutionLedger, ToolInvoker};
use data_agent_audit_core::{AuditLog, AuditTracer, ChainReport, PolicyDecision};
use data_agent_domain::{
    canonical_json, ensure_non_empty, hash_bytes, hash_json, truncate_chars, AgentError,
    ErrorKind, LogEntry, Observation, Operations, ParsedIntent, Plan, PlanId, PlanStep, RecipeId,
    ResultShape, ToolCall, ToolKind, ToolOutput,
};
use data_agent_planner::{execution_order, PlanBuilder};
use data_agent_policy::PolicyGate;
use data_agent_recipe_core::{
    combine_fingerprints, EmbeddingProvider, RecipeCache, RecipeStore, SchemaFingerprinter,
};
use data_agent_sandbox::Sandbox;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

pub use config::AgentConfig;
pub use redact::Redactor;

const MAX_REPORTED_FAILURES: usize = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DataSource {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Column name to declared type. Sources without columns take no part in
    /// recipe lookup.
    pub columns: BTreeMap<String, String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub request_id: String,
    pub intent: String,
    #[serde(default)]
    pub data_sources: Vec<DataSource>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl AnalysisRequest {
    #[must_use]
    pub fn new(intent: &str) -> Self {
        Self {
            request_id: Ulid::new().to_string(),
            intent: intent.to_string(),
            data_sources: Vec::new(),
            deliverables: Vec::new(),
            constraints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Success,
    Partial,
    Failure,
}

impl AnalysisStatus {
    /// SUCCESS with no failures, FAILURE when every step failed, PARTIAL otherwise.
    #[must_use]
    pub fn from_counts(total_steps: usize, failed_steps: usize) -> Self {
        if failed_steps == 0 {
            Self::Success
        } else if failed_steps < total_steps {
            Self::Partial
        } else {
            Self::Failure
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisMetrics {
    pub total_steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    pub total_retries: u64,
    pub execution_time_ms: u64,
    pub plan_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub artifact_id: String,
    pub artifact_type: String,
    pub step_id: String,
    pub content_hash: String,
    pub size_bytes: usize,
    pub metadata: Map<String, Value>,
    pub content: ToolOutput,
}

impl Artifact {
    /// # Errors
    /// Returns an error if the output cannot be serialized.
    pub fn from_output(step_id: &str, output: &ToolOutput) -> Result<Self> {
        let encoded = canonical_json(&serde_json::to_value(output)?);
        let mut metadata = Map::new();
        match output {
            ToolOutput::Table { columns, rows } => {
                metadata.insert("rows".to_string(), json!(rows.len()));
                metadata.insert("columns".to_string(), json!(columns));
            }
            ToolOutput::Chart { path, chart_type } => {
                metadata.insert("path".to_string(), json!(path));
                metadata.insert("chart_type".to_string(), json!(chart_type));
            }
            ToolOutput::Profile {
                table_name,
                columns,
            } => {
                metadata.insert("table_name".to_string(), json!(table_name));
                metadata.insert("column_count".to_string(), json!(columns.len()));
            }
            ToolOutput::Value { .. } => {}
        }
        Ok(Self {
            artifact_id: format!("art-{step_id}"),
            artifact_type: output.artifact_type().to_string(),
            step_id: step_id.to_string(),
            content_hash: hash_bytes(encoded.as_bytes()),
            size_bytes: encoded.len(),
            metadata,
            content: output.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedStep {
    pub step_id: String,
    pub operation: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResponse {
    pub request_id: String,
    pub status: AnalysisStatus,
    pub artifacts: Vec<Artifact>,
    pub summary: String,
    pub metrics: AnalysisMetrics,
    pub audit_log_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<PlanId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe_used: Option<RecipeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub observations: Vec<Observation>,
}

/// Turns free text into a structured intent.
pub trait IntentParser: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn parse(
        &self,
        intent: &str,
        data_sources: &[DataSource],
        tool_names: &[String],
    ) -> Result<ParsedIntent, AgentError>;
}

/// Parser for callers that already hold a JSON intent: the request text is
/// the structured intent itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredIntentParser;

impl IntentParser for StructuredIntentParser {
    fn parse(
        &self,
        intent: &str,
        _data_sources: &[DataSource],
        _tool_names: &[String],
    ) -> Result<ParsedIntent, AgentError> {
        parse_structured_intent(intent)
    }
}

/// Decode and check a structured intent document.
///
/// # Errors
/// Returns `AgentError::IntentParse` when the text is not valid JSON, lacks a
/// required field, or names no operations.
pub fn parse_structured_intent(text: &str) -> Result<ParsedIntent, AgentError> {
    let parsed: ParsedIntent = serde_json::from_str(text)
        .map_err(|err| AgentError::IntentParse(format!("invalid or incomplete JSON: {err}")))?;
    if parsed.objective.trim().is_empty() {
        return Err(AgentError::IntentParse(
            "invalid or incomplete JSON: objective is empty".to_string(),
        ));
    }
    if parsed.operations.is_empty() {
        return Err(AgentError::IntentParse(
            "invalid or incomplete JSON: no operations".to_string(),
        ));
    }
    Ok(parsed)
}

/// "{n} step(s) failed:" followed by at most five entries.
#[must_use]
pub fn format_errors(failed: &[FailedStep]) -> String {
    let mut lines = vec![format!("{} step(s) failed:", failed.len())];
    for step in failed.iter().take(MAX_REPORTED_FAILURES) {
        lines.push(format!(
            "- {}: {}",
            truncate_chars(&step.operation, 60),
            truncate_chars(&step.error, 100)
        ));
    }
    if failed.len() > MAX_REPORTED_FAILURES {
        lines.push(format!(
            "... and {} more",
            failed.len() - MAX_REPORTED_FAILURES
        ));
    }
    lines.join("\n")
}

#[must_use]
pub fn summarize(
    status: AnalysisStatus,
    total_steps: usize,
    failed_steps: usize,
    artifact_count: usize,
) -> String {
    match status {
        AnalysisStatus::Success => {
            format!("Analysis completed successfully. Generated {artifact_count} artifact(s).")
        }
        AnalysisStatus::Partial => format!(
            "Analysis partially completed. {}/{total_steps} steps succeeded.",
            total_steps - failed_steps
        ),
        AnalysisStatus::Failure => format!("Analysis failed. All {total_steps} steps failed."),
    }
}

/// Operations used when no intent parser is configured.
#[must_use]
pub fn fallback_operations(deliverables: &[String]) -> Operations {
    let wants_chart = deliverables
        .iter()
        .any(|deliverable| deliverable.to_lowercase().contains("chart"));
    let tail = if wants_chart {
        ["Aggregate data", "Create chart"]
    } else {
        ["Transform data", "Generate output"]
    };
    Operations::Linear(
        std::iter::once("Query data")
            .chain(tail)
            .map(str::to_string)
            .collect(),
    )
}

#[derive(Debug, Default)]
struct StepRun {
    observations: Vec<Observation>,
    artifacts: Vec<Artifact>,
    failed: Vec<FailedStep>,
    total_retries: u64,
    templates: Vec<Value>,
}

/// Top-level loop: recipe lookup, planning, execution, audit and caching.
pub struct Orchestrator {
    config: AgentConfig,
    tools: Arc<dyn ToolInvoker>,
    planner: PlanBuilder,
    policy: PolicyGate,
    sandbox: Sandbox,
    recipes: RecipeCache,
    tracer: AuditTracer,
    fingerprinter: SchemaFingerprinter,
    redactor: Redactor,
    intent_parser: Option<Arc<dyn IntentParser>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("tools", &self.tools.tool_names())
            .field("intent_parser", &self.intent_parser.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// # Errors
    /// Returns an error when the config is invalid or a policy pattern does
    /// not compile.
    pub fn new(
        config: AgentConfig,
        tools: Arc<dyn ToolInvoker>,
        audit_log: Arc<dyn AuditLog>,
        recipe_store: Arc<dyn RecipeStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            policy: PolicyGate::new(&config.policy)?,
            config,
            tools,
            planner: PlanBuilder::new(),
            sandbox: Sandbox::new(),
            recipes: RecipeCache::new(recipe_store, embedder),
            tracer: AuditTracer::new(audit_log),
            fingerprinter: SchemaFingerprinter::default(),
            redactor: Redactor::new()?,
            intent_parser: None,
        })
    }

    #[must_use]
    pub fn with_intent_parser(mut self, parser: Arc<dyn IntentParser>) -> Self {
        self.intent_parser = Some(parser);
        self
    }

    #[must_use]
    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn recipes(&self) -> &RecipeCache {
        &self.recipes
    }

    #[must_use]
    pub fn tracer(&self) -> &AuditTracer {
        &self.tracer
    }

    /// Run one request end to end. Failures are reported in the response,
    /// never as an `Err`.
    pub fn analyze(&self, request: &AnalysisRequest) -> AnalysisResponse {
        let started = Instant::now();
        match self.run(request, started) {
            Ok(response) => response,
            Err(err) => self.failure_response(request, started, &err),
        }
    }

    /// # Errors
    /// Returns an error if the audit log cannot be read.
    pub fn verify_audit_integrity(&self) -> Result<ChainReport> {
        self.tracer.verify_integrity()
    }

    /// # Errors
    /// Returns an error if the audit log cannot be read.
    pub fn get_request_trace(&self, request_id: &str) -> Result<Vec<LogEntry>> {
        self.tracer.get_request_trace(request_id)
    }

    fn run(&self, request: &AnalysisRequest, started: Instant) -> Result<AnalysisResponse> {
        ensure_non_empty("request_id", &request.request_id)?;
        ensure_non_empty("intent", &request.intent)?;
        let request_id = request.request_id.as_str();

        let sources = serde_json::to_value(&request.data_sources)?;
        self.tracer.log_request(
            request_id,
            &request.intent,
            self.redactor.redact_value(&sources),
        )?;

        let fingerprint = self.schema_fingerprint(&request.data_sources)?;
        let candidate = match &fingerprint {
            Some(fingerprint) => self.lookup_recipe(request_id, fingerprint, &request.intent)?,
            None => None,
        };

        let (plan, recipe_used) = self.plan_for(request, candidate)?;
        self.tracer.log_plan(
            request_id,
            &plan.plan_id.to_string(),
            plan.steps.len(),
            plan.total_cost,
        )?;

        let run = self.execute_plan(request_id, request, &plan)?;
        let total_steps = plan.steps.len();
        let status = AnalysisStatus::from_counts(total_steps, run.failed.len());

        if status == AnalysisStatus::Success {
            if let Some(fingerprint) = &fingerprint {
                self.store_recipe(request_id, fingerprint, request, &plan, recipe_used, &run)?;
            }
        }

        let execution_time_ms = elapsed_ms(started);
        self.tracer.log_completion(
            request_id,
            status.as_str(),
            execution_time_ms,
            run.artifacts.len(),
        )?;
        info!(
            request_id,
            status = status.as_str(),
            steps = total_steps,
            failed = run.failed.len(),
            execution_time_ms,
            "analysis completed"
        );

        Ok(AnalysisResponse {
            request_id: request_id.to_string(),
            status,
            summary: summarize(status, total_steps, run.failed.len(), run.artifacts.len()),
            metrics: AnalysisMetrics {
                total_steps,
                successful_steps: total_steps - run.failed.len(),
                failed_steps: run.failed.len(),
                total_retries: run.total_retries,
                execution_time_ms,
                plan_cost: plan.total_cost,
            },
            audit_log_ref: audit_log_ref(request_id),
            plan_id: Some(plan.plan_id),
            recipe_used,
            error_message: (!run.failed.is_empty()).then(|| format_errors(&run.failed)),
            artifacts: run.artifacts,
            observations: run.observations,
        })
    }

    fn failure_response(
        &self,
        request: &AnalysisRequest,
        started: Instant,
        err: &anyhow::Error,
    ) -> AnalysisResponse {
        let message = format!("{err:#}");
        warn!(request_id = %request.request_id, error = %message, "analysis failed");
        let error_type = match err.downcast_ref::<AgentError>() {
            Some(AgentError::IntentParse(_)) => "intent_parse_error",
            Some(AgentError::PlanValidation(_)) => "plan_validation_error",
            _ => "orchestration_error",
        };
        if let Err(log_err) = self.tracer.log_error(
            &request.request_id,
            error_type,
            &message,
            Some(json!({ "request_id": request.request_id })),
        ) {
            error!(
                request_id = %request.request_id,
                error = %log_err,
                "failed to record analysis failure in audit log"
            );
        }

        AnalysisResponse {
            request_id: request.request_id.clone(),
            status: AnalysisStatus::Failure,
            artifacts: Vec::new(),
            summary: format!("Analysis failed. {message}"),
            metrics: AnalysisMetrics {
                execution_time_ms: elapsed_ms(started),
                ..AnalysisMetrics::default()
            },
            audit_log_ref: audit_log_ref(&request.request_id),
            plan_id: None,
            recipe_used: None,
            error_message: Some(message),
            observations: Vec::new(),
        }
    }

    fn schema_fingerprint(&self, sources: &[DataSource]) -> Result<Option<String>> {
        let fingerprints = sources
            .iter()
            .filter(|source| !source.columns.is_empty())
            .map(|source| self.fingerprinter.fingerprint(&source.columns))
            .collect::<Result<Vec<_>>>()?;
        Ok(combine_fingerprints(&fingerprints))
    }

    // Best candidate for reuse, if it clears the similarity threshold.
    fn lookup_recipe(
        &self,
        request_id: &str,
        fingerprint: &str,
        intent: &str,
    ) -> Result<Option<(RecipeId, Value)>> {
        let scored = self
            .recipes
            .retrieve_recipes(fingerprint, intent, self.config.recipe_top_k)?;
        let top = scored.first();
        let top_id = top.map(|s| s.recipe.recipe_id.to_string());
        self.tracer.log_recipe_retrieval(
            request_id,
            fingerprint,
            top_id.as_deref(),
            top.map(|s| s.similarity),
            scored.len(),
        )?;
        Ok(top
            .filter(|s| s.similarity >= self.config.recipe_min_similarity)
            .map(|s| (s.recipe.recipe_id, s.recipe.plan_structure.clone())))
    }

    fn plan_for(
        &self,
        request: &AnalysisRequest,
        candidate: Option<(RecipeId, Value)>,
    ) -> Result<(Plan, Option<RecipeId>)> {
        let deliverables = if request.deliverables.is_empty() {
            vec!["table".to_string()]
        } else {
            request.deliverables.clone()
        };

        if let Some((recipe_id, structure)) = candidate {
            let rebuilt = Operations::from_graph_value(&structure).and_then(|operations| {
                self.planner
                    .build_plan(
                        &request.intent,
                        &operations,
                        &deliverables,
                        &request.constraints,
                    )
                    .map_err(anyhow::Error::from)
            });
            match rebuilt {
                Ok(plan) => {
                    debug!(
                        recipe_id = %recipe_id,
                        plan_id = %plan.plan_id,
                        "plan rebuilt from recipe"
                    );
                    return Ok((plan, Some(recipe_id)));
                }
                Err(err) => {
                    warn!(
                        recipe_id = %recipe_id,
                        error = %err,
                        "stored recipe unusable, planning afresh"
                    );
                }
            }
        }

        let plan = match &self.intent_parser {
            Some(parser) => {
                let parsed = parser.parse(
                    &request.intent,
                    &request.data_sources,
                    &self.tools.tool_names(),
                )?;
                let deliverables =
                    if request.deliverables.is_empty() && !parsed.deliverables.is_empty() {
                        parsed.deliverables.clone()
                    } else {
                        deliverables
                    };
                let mut constraints = request.constraints.clone();
                for constraint in &parsed.constraints {
                    if !constraints.contains(constraint) {
                        constraints.push(constraint.clone());
                    }
                }
                self.planner.build_plan(
                    &parsed.objective,
                    &parsed.operations,
                    &deliverables,
                    &constraints,
                )?
            }
            None => self.planner.build_plan(
                &request.intent,
                &fallback_operations(&deliverables),
                &deliverables,
                &request.constraints,
            )?,
        };
        Ok((plan, None))
    }

    fn execute_plan(
        &self,
        request_id: &str,
        request: &AnalysisRequest,
        plan: &Plan,
    ) -> Result<StepRun> {
        let order = execution_order(plan)?;
        let mut actor = Actor::new(
            Arc::clone(&self.tools),
            self.policy.clone(),
            self.sandbox.clone(),
            self.config.actor_settings(),
        );
        let mut ledger = ExecutionLedger::with_bindings(bindings(&request.data_sources));
        let mut run = StepRun::default();

        for index in order {
            let Some(step) = plan.steps.get(index) else {
                continue;
            };
            let observation = match self.failed_dependency(step, &ledger) {
                Some(dependency) => {
                    debug!(
                        step_id = %step.step_id,
                        dependency,
                        "skipping step with failed dependency"
                    );
                    Observation::failure(
                        &step.step_id,
                        format!("Skipped: dependency {dependency} failed"),
                        0,
                        ErrorKind::NonRecoverable,
                    )
                }
                None => match actor.ground_step(step, &ledger) {
                    Ok(call) => {
                        self.tracer.log_tool_call(
                            request_id,
                            &step.step_id,
                            &call.tool_name,
                            &self.audit_arguments(&call.arguments),
                        )?;
                        run.templates.push(argument_template(plan, &call));
                        actor.execute_with_repair(&call, self.config.max_retries)
                    }
                    Err(err) => actor.record_grounding_failure(step, &err),
                },
            };
            self.record_observation(request_id, step, &observation, &mut run)?;
            run.observations.push(observation.clone());
            ledger.record(observation);
        }
        Ok(run)
    }

    fn failed_dependency<'a>(
        &self,
        step: &'a PlanStep,
        ledger: &ExecutionLedger,
    ) -> Option<&'a str> {
        if !self.config.short_circuit_failed_dependencies {
            return None;
        }
        step.dependencies
            .iter()
            .find(|dep| ledger.get(dep).is_some_and(|obs| !obs.is_success()))
            .map(String::as_str)
    }

    fn record_observation(
        &self,
        request_id: &str,
        step: &PlanStep,
        observation: &Observation,
        run: &mut StepRun,
    ) -> Result<()> {
        let error_message = observation.error_message.as_deref();
        if observation.metadata.error_kind == Some(ErrorKind::PolicyBlocked) {
            let policy_name = if step.tool == ToolKind::Query
                && observation.metadata.shape == ResultShape::Opaque
            {
                "query_safety"
            } else {
                "column_access"
            };
            self.tracer.log_policy_decision(
                request_id,
                &step.step_id,
                policy_name,
                PolicyDecision::Block,
                error_message.unwrap_or_default(),
                Some(json!({ "violations": observation.metadata.policy_violations })),
            )?;
        }

        self.tracer.log_observation(
            request_id,
            &step.step_id,
            observation.status.as_str(),
            observation.metadata.execution_time_ms,
            observation.retry_count,
            error_message,
        )?;
        run.total_retries += u64::from(observation.retry_count);

        if observation.is_success() {
            if let Some(output) = &observation.result {
                let artifact = Artifact::from_output(&step.step_id, output)?;
                self.tracer.log_artifact(
                    request_id,
                    &artifact.artifact_id,
                    &artifact.artifact_type,
                    &artifact.content_hash,
                    artifact.size_bytes,
                )?;
                run.artifacts.push(artifact);
            }
        } else {
            run.failed.push(FailedStep {
                step_id: step.step_id.clone(),
                operation: step.operation.clone(),
                error: error_message.unwrap_or("unknown error").to_string(),
            });
        }
        Ok(())
    }

    fn store_recipe(
        &self,
        request_id: &str,
        fingerprint: &str,
        request: &AnalysisRequest,
        plan: &Plan,
        recipe_used: Option<RecipeId>,
        run: &StepRun,
    ) -> Result<()> {
        let (recipe_id, reused) = match recipe_used {
            Some(recipe_id) => {
                if !self.recipes.mark_reused(recipe_id)? {
                    warn!(recipe_id = %recipe_id, "reused recipe no longer stored");
                }
                (recipe_id, true)
            }
            None => (
                self.recipes.save_recipe(
                    fingerprint,
                    &request.intent,
                    plan.operation_graph(),
                    Value::Array(run.templates.clone()),
                )?,
                false,
            ),
        };
        self.tracer.log_recipe_storage(
            request_id,
            &recipe_id.to_string(),
            fingerprint,
            &plan.plan_id.to_string(),
            reused,
        )
        .map(|_| ())
    }

    // Redacted arguments with inlined dependency data replaced by its hash.
    fn audit_arguments(&self, arguments: &Map<String, Value>) -> Map<String, Value> {
        let mut redacted = self.redactor.redact_map(arguments);
        if let Some(data) = arguments.get("data") {
            redacted.insert(
                "data".to_string(),
                json!({
                    "kind": data.get("kind").cloned().unwrap_or(Value::Null),
                    "content_hash": hash_json(data),
                }),
            );
        }
        redacted
    }
}

fn bindings(sources: &[DataSource]) -> Map<String, Value> {
    let mut bindings = Map::new();
    if let Some(connection) = sources.iter().find_map(|s| s.connection.as_ref()) {
        bindings.insert("connection".to_string(), json!(connection));
    }
    if let Some(database) = sources.iter().find_map(|s| s.database.as_ref()) {
        bindings.insert("database".to_string(), json!(database));
    }
    bindings
}

fn argument_template(plan: &Plan, call: &ToolCall) -> Value {
    let prefix = format!("{}-", plan.plan_id.short());
    json!({
        "id": call.step_id.strip_prefix(prefix.as_str()).unwrap_or(&call.step_id),
        "tool": call.tool_name,
        "arguments": call.arguments.keys().collect::<Vec<_>>(),
    })
}

fn audit_log_ref(request_id: &str) -> String {
    format!("audit:{request_id}")
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::{
        fallback_operations, format_errors, parse_structured_intent, AgentConfig,
        AnalysisRequest, AnalysisStatus, DataSource, FailedStep, IntentParser, Orchestrator,
        StructuredIntentParser,
    };
    use data_agent_actor::ToolRegistry;
    use data_agent_audit_core::{AuditLog, MemoryAuditLog};
    use data_agent_audit_jsonl::JsonlAuditLog;
    use data_agent_domain::{
        AgentError, ErrorKind, Operation, Operations, ParsedIntent, ToolError, ToolOutput,
    };
    use data_agent_recipe_core::{HashingEmbeddingProvider, MemoryRecipeStore, RecipeStore};
    use data_agent_recipe_sqlite::SqliteRecipeStore;
    use serde_json::{json, Map, Value};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use ulid::Ulid;

    fn table(columns: &[&str]) -> ToolOutput {
        let mut row = Map::new();
        for column in columns {
            row.insert((*column).to_string(), json!(10));
        }
        ToolOutput::Table {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows: vec![row; 2],
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register("sql_runner", |_| Ok(table(&["region", "sales"])))
            .register("df_operations", |_| Ok(table(&["region", "total"])))
            .register("plotter", |_| {
                Ok(ToolOutput::Chart {
                    path: "out/chart.png".to_string(),
                    chart_type: "bar".to_string(),
                })
            })
            .register("profiler", |_| {
                Ok(ToolOutput::Value {
                    value: json!({"rows": 2}),
                })
            });
        registry
    }

    struct Harness {
        orchestrator: Orchestrator,
        log: Arc<MemoryAuditLog>,
        store: Arc<MemoryRecipeStore>,
    }

    fn harness_with(registry: ToolRegistry, config: AgentConfig) -> Harness {
        let log = Arc::new(MemoryAuditLog::new());
        let store = Arc::new(MemoryRecipeStore::new());
        let embedder = HashingEmbeddingProvider::new(64).unwrap_or_else(|_| unreachable!());
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(registry),
            log.clone(),
            store.clone(),
            Arc::new(embedder),
        );
        assert!(orchestrator.is_ok());
        Harness {
            orchestrator: orchestrator.unwrap_or_else(|_| unreachable!()),
            log,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(registry(), AgentConfig::default())
    }

    fn sales_source() -> DataSource {
        DataSource {
            name: "sales".to_string(),
            source_type: "sql".to_string(),
            connection: Some("postgresql://analyst:s3cret@db/sales".to_string()),
            columns: BTreeMap::from([
                ("region".to_string(), "varchar".to_string()),
                ("sales".to_string(), "int64".to_string()),
            ]),
            ..DataSource::default()
        }
    }

    fn request(intent: &str, deliverables: &[&str]) -> AnalysisRequest {
        AnalysisRequest {
            deliverables: deliverables.iter().map(|d| (*d).to_string()).collect(),
            ..AnalysisRequest::new(intent)
        }
    }

    fn event_types(log: &MemoryAuditLog) -> Vec<String> {
        let entries = log.snapshot().unwrap_or_else(|_| unreachable!());
        entries.into_iter().map(|entry| entry.event_type).collect()
    }

    struct FixedParser(Result<ParsedIntent, AgentError>);

    impl IntentParser for FixedParser {
        fn parse(
            &self,
            _intent: &str,
            _data_sources: &[DataSource],
            _tool_names: &[String],
        ) -> Result<ParsedIntent, AgentError> {
            self.0.clone()
        }
    }

    fn graph_intent(operations: &[(&str, &str, &[&str])]) -> ParsedIntent {
        ParsedIntent {
            objective: "test objective".to_string(),
            data_requirements: Vec::new(),
            operations: Operations::Graph(
                operations
                    .iter()
                    .map(|(id, description, deps)| Operation {
                        id: (*id).to_string(),
                        description: (*description).to_string(),
                        dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
                    })
                    .collect(),
            ),
            deliverables: Vec::new(),
            constraints: Vec::new(),
        }
    }

    #[test]
    fn fallback_plan_runs_to_success() {
        let h = harness();
        let response = h.orchestrator.analyze(&request("Show sales by region", &["charts"]));

        assert_eq!(response.status, AnalysisStatus::Success);
        assert_eq!(response.metrics.total_steps, 3);
        assert_eq!(response.artifacts.len(), 3);
        assert_eq!(
            response.summary,
            "Analysis completed successfully. Generated 3 artifact(s)."
        );
        assert_eq!(response.artifacts[2].artifact_type, "chart");
        assert!(response.error_message.is_none());
        assert!(response.recipe_used.is_none());

        let events = event_types(&h.log);
        assert_eq!(events.first().map(String::as_str), Some("request_submitted"));
        assert_eq!(events.get(1).map(String::as_str), Some("plan_created"));
        assert_eq!(events.last().map(String::as_str), Some("analysis_completed"));
        assert_eq!(events.iter().filter(|e| *e == "tool_called").count(), 3);
        assert_eq!(events.iter().filter(|e| *e == "artifact_generated").count(), 3);

        let report = h.orchestrator.verify_audit_integrity();
        assert!(report.is_ok());
        assert!(report.unwrap_or_else(|_| unreachable!()).valid);
    }

    #[test]
    fn fallback_operations_follow_deliverables() {
        let with_chart = fallback_operations(&["charts".to_string()]);
        assert_eq!(
            with_chart,
            Operations::Linear(vec![
                "Query data".to_string(),
                "Aggregate data".to_string(),
                "Create chart".to_string()
            ])
        );
        let plain = fallback_operations(&["table".to_string()]);
        assert_eq!(
            plain,
            Operations::Linear(vec![
                "Query data".to_string(),
                "Transform data".to_string(),
                "Generate output".to_string()
            ])
        );
    }

    #[test]
    fn successful_analysis_is_cached_then_reused() {
        let h = harness();
        let mut first = request("Total sales per region", &["table"]);
        first.data_sources = vec![sales_source()];
        let response = h.orchestrator.analyze(&first);
        assert_eq!(response.status, AnalysisStatus::Success);
        assert!(response.recipe_used.is_none());
        let stats = h.store.stats().unwrap_or_else(|_| unreachable!());
        assert_eq!(stats.total_recipes, 1);

        let mut second = request("Total sales per region", &["table"]);
        second.data_sources = vec![sales_source()];
        let reused = h.orchestrator.analyze(&second);
        assert_eq!(reused.status, AnalysisStatus::Success);
        assert!(reused.recipe_used.is_some());
        assert_eq!(reused.metrics.total_steps, response.metrics.total_steps);

        let stats = h.store.stats().unwrap_or_else(|_| unreachable!());
        assert_eq!(stats.total_recipes, 1);
        assert_eq!(stats.total_success_count, 2);

        let trace = h
            .orchestrator
            .get_request_trace(&second.request_id)
            .unwrap_or_else(|_| unreachable!());
        let stored = trace
            .iter()
            .find(|entry| entry.event_type == "recipe_stored")
            .map(|entry| entry.data["reused"].clone());
        assert_eq!(stored, Some(json!(true)));
    }

    #[test]
    fn unrelated_intent_does_not_reuse_recipe() {
        let h = harness_with(
            registry(),
            AgentConfig {
                recipe_min_similarity: 0.99,
                ..AgentConfig::default()
            },
        );
        let mut first = request("Total sales per region", &["table"]);
        first.data_sources = vec![sales_source()];
        h.orchestrator.analyze(&first);

        let mut second = request("chart monthly churn of premium accounts", &["table"]);
        second.data_sources = vec![sales_source()];
        let response = h.orchestrator.analyze(&second);
        assert!(response.recipe_used.is_none());
        let stats = h.store.stats().unwrap_or_else(|_| unreachable!());
        assert_eq!(stats.total_recipes, 2);
    }

    #[test]
    fn credentials_are_redacted_in_audit_but_passed_to_tools() {
        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = Arc::clone(&seen);
        let mut tools = registry();
        tools.register("sql_runner", move |args| {
            if let Ok(mut seen) = sink.lock() {
                seen.push(args.get("connection").cloned().unwrap_or(Value::Null));
            }
            Ok(table(&["region", "sales"]))
        });
        let h = harness_with(tools, AgentConfig::default());
        let mut req = request("Sales overview", &["table"]);
        req.data_sources = vec![sales_source()];
        h.orchestrator.analyze(&req);

        let seen = seen.lock().map(|v| v.clone()).unwrap_or_default();
        assert_eq!(seen, vec![json!("postgresql://analyst:s3cret@db/sales")]);

        let entries = h.log.snapshot().unwrap_or_else(|_| unreachable!());
        let serialized = serde_json::to_string(&entries).unwrap_or_default();
        assert!(!serialized.contains("s3cret"));
        assert!(serialized.contains("postgresql://[REDACTED]@db/sales"));
    }

    #[test]
    fn failing_chart_step_yields_partial_result() {
        let mut tools = registry();
        tools.register("plotter", |_| Err(ToolError::new("renderer crashed")));
        let h = harness_with(tools, AgentConfig::default());
        let mut req = request("Sales chart", &["charts"]);
        req.data_sources = vec![sales_source()];
        let response = h.orchestrator.analyze(&req);

        assert_eq!(response.status, AnalysisStatus::Partial);
        assert_eq!(
            response.summary,
            "Analysis partially completed. 2/3 steps succeeded."
        );
        let message = response.error_message.unwrap_or_default();
        assert!(message.starts_with("1 step(s) failed:\n- Create chart: Non-recoverable error"));
        assert_eq!(h.store.stats().unwrap_or_default().total_recipes, 0);
    }

    #[test]
    fn transient_errors_count_as_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut tools = registry();
        tools.register("sql_runner", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ToolError::new("connection reset by peer"))
            } else {
                Ok(table(&["region", "sales"]))
            }
        });
        let h = harness_with(tools, AgentConfig::default());
        let response = h.orchestrator.analyze(&request("Sales", &["table"]));
        assert_eq!(response.status, AnalysisStatus::Success);
        assert_eq!(response.metrics.total_retries, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn blocked_query_is_logged_as_policy_decision() {
        let h = harness();
        let parser = FixedParser(Ok(graph_intent(&[(
            "q",
            "Query users; DROP TABLE users",
            &[],
        )])));
        let orchestrator = h.orchestrator.with_intent_parser(Arc::new(parser));
        let response = orchestrator.analyze(&request("drop everything", &["table"]));

        assert_eq!(response.status, AnalysisStatus::Failure);
        assert_eq!(response.summary, "Analysis failed. All 1 steps failed.");
        assert_eq!(
            response.observations[0].metadata.error_kind,
            Some(ErrorKind::PolicyBlocked)
        );
        let decision = h
            .log
            .snapshot()
            .unwrap_or_default()
            .into_iter()
            .find(|entry| entry.event_type == "policy_decision");
        let decision = decision.unwrap_or_else(|| unreachable!());
        assert_eq!(decision.data["decision"], json!("block"));
        assert_eq!(decision.data["policy_name"], json!("query_safety"));
    }

    #[test]
    fn short_circuit_skips_dependents_of_failed_steps() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut tools = registry();
        tools
            .register("sql_runner", |_| Err(ToolError::new("syntax error near FROM")))
            .register("df_operations", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(table(&["x"]))
            });
        let h = harness_with(
            tools,
            AgentConfig {
                short_circuit_failed_dependencies: true,
                ..AgentConfig::default()
            },
        );
        let response = h.orchestrator.analyze(&request("Sales", &["table"]));
        assert_eq!(response.status, AnalysisStatus::Failure);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(response.observations[1]
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with("Skipped: dependency")));
    }

    #[test]
    fn failed_dependencies_still_run_by_default() {
        let mut tools = registry();
        tools.register("sql_runner", |_| Err(ToolError::new("syntax error near FROM")));
        let h = harness_with(tools, AgentConfig::default());
        let response = h.orchestrator.analyze(&request("Sales", &["table"]));
        assert_eq!(response.status, AnalysisStatus::Partial);
        assert_eq!(response.metrics.successful_steps, 2);
    }

    #[test]
    fn parser_failure_is_reported_and_audited() {
        let h = harness();
        let parser = FixedParser(Err(AgentError::IntentParse(
            "invalid or incomplete JSON: missing field `operations`".to_string(),
        )));
        let orchestrator = h.orchestrator.with_intent_parser(Arc::new(parser));
        let req = request("???", &["table"]);
        let response = orchestrator.analyze(&req);

        assert_eq!(response.status, AnalysisStatus::Failure);
        assert!(response.summary.starts_with("Analysis failed. intent parse failed"));
        let trace = orchestrator
            .get_request_trace(&req.request_id)
            .unwrap_or_default();
        let last = trace.last().unwrap_or_else(|| unreachable!());
        assert_eq!(last.event_type, "error_occurred");
        assert_eq!(last.data["error_type"], json!("intent_parse_error"));
    }

    #[test]
    fn cyclic_intent_fails_before_execution() {
        let h = harness();
        let parser = FixedParser(Ok(graph_intent(&[
            ("a", "Query data", &["b"]),
            ("b", "Transform data", &["a"]),
        ])));
        let orchestrator = h.orchestrator.with_intent_parser(Arc::new(parser));
        let response = orchestrator.analyze(&request("loop", &["table"]));
        assert_eq!(response.status, AnalysisStatus::Failure);
        assert!(response.observations.is_empty());
        assert!(!event_types(&h.log).contains(&"tool_called".to_string()));
    }

    #[test]
    fn empty_intent_is_rejected() {
        let h = harness();
        let response = h.orchestrator.analyze(&request("   ", &[]));
        assert_eq!(response.status, AnalysisStatus::Failure);
        assert!(response
            .error_message
            .is_some_and(|m| m.contains("intent MUST be non-empty")));
    }

    #[test]
    fn format_errors_caps_listed_steps() {
        let failed: Vec<FailedStep> = (0..7)
            .map(|i| FailedStep {
                step_id: format!("s{i}"),
                operation: format!("{}{i}", "x".repeat(80)),
                error: "e".repeat(150),
            })
            .collect();
        let formatted = format_errors(&failed);
        let lines: Vec<&str> = formatted.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "7 step(s) failed:");
        assert_eq!(lines[1], format!("- {}: {}", "x".repeat(60), "e".repeat(100)));
        assert_eq!(lines[6], "... and 2 more");
    }

    #[test]
    fn structured_intent_parsing() {
        let parsed = parse_structured_intent(
            r#"{"objective":"Sales","operations":[{"id":"op1","description":"Query sales data","dependencies":[]}],"constraints":["row_limit=500"]}"#,
        );
        assert!(parsed.is_ok());
        let parsed = parsed.unwrap_or_else(|_| unreachable!());
        assert_eq!(parsed.operations.len(), 1);

        for bad in ["not json", r#"{"objective":"x"}"#, r#"{"objective":"x","operations":[]}"#] {
            match parse_structured_intent(bad) {
                Err(AgentError::IntentParse(message)) => {
                    assert!(message.starts_with("invalid or incomplete JSON"));
                }
                other => panic!("unexpected: {other:?}"),
            }
        }

        let via_trait = StructuredIntentParser.parse(
            r#"{"objective":"x","operations":["Query data"]}"#,
            &[],
            &[],
        );
        assert!(via_trait.is_ok());
    }

    #[test]
    fn durable_stores_survive_reopen() {
        let dir = std::env::temp_dir().join(format!("data-agent-orchestrator-{}", Ulid::new()));
        let log_path = dir.join("audit.jsonl");
        let db_path = dir.join("recipes.db");

        let build = || {
            let log = JsonlAuditLog::open(&log_path).unwrap_or_else(|_| unreachable!());
            let store =
                SqliteRecipeStore::open_migrated(&db_path).unwrap_or_else(|_| unreachable!());
            let embedder = HashingEmbeddingProvider::new(64).unwrap_or_else(|_| unreachable!());
            Orchestrator::new(
                AgentConfig::default(),
                Arc::new(registry()),
                Arc::new(log),
                Arc::new(store),
                Arc::new(embedder),
            )
            .unwrap_or_else(|_| unreachable!())
        };

        let mut req = request("Revenue by region", &["table"]);
        req.data_sources = vec![sales_source()];
        assert_eq!(build().analyze(&req).status, AnalysisStatus::Success);

        let reopened = build();
        let mut again = request("Revenue by region", &["table"]);
        again.data_sources = vec![sales_source()];
        let response = reopened.analyze(&again);
        assert!(response.recipe_used.is_some());

        let report = reopened
            .verify_audit_integrity()
            .unwrap_or_else(|_| unreachable!());
        assert!(report.valid);
        assert!(report.entries_verified > 10);
        let log = reopened.tracer().log().clone();
        assert!(log.get_stats().is_ok_and(|stats| stats.chain_valid));
    }
}
