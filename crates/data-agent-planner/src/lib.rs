#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use data_agent_domain::{
    AgentError, Operation, Operations, ParsedIntent, Plan, PlanId, PlanStep, ToolKind,
    FILTER_BEFORE_AGGREGATE,
};
use tracing::debug;
use ulid::Ulid;

const QUERY_KEYWORDS: [&str; 4] = ["query", "select", "fetch", "sql"];
const CHART_KEYWORDS: [&str; 4] = ["plot", "chart", "visualize", "graph"];
const PROFILE_KEYWORDS: [&str; 3] = ["profile", "schema", "discover"];

/// Builds validated step DAGs from structured intents.
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder;

impl PlanBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Build a plan from an operation list.
    ///
    /// Graph operations are built in two passes: every step is created first,
    /// then declared dependency ids are resolved to step ids. Linear operations
    /// chain each step onto its predecessor.
    ///
    /// # Errors
    /// Returns `AgentError::PlanValidation` on duplicate operation ids, unknown
    /// dependency ids, or a dependency cycle.
    pub fn build_plan(
        &self,
        objective: &str,
        operations: &Operations,
        deliverables: &[String],
        constraints: &[String],
    ) -> Result<Plan, AgentError> {
        let plan_id = PlanId::new();
        let prefix = plan_id.short();

        let steps = match operations {
            Operations::Graph(items) => graph_steps(&prefix, items, constraints)?,
            Operations::Linear(items) => linear_steps(&prefix, items, constraints),
        };

        validate_dag(&steps)?;

        let total_cost = steps.iter().map(|step| step.estimated_cost).sum();
        debug!(
            plan_id = %plan_id,
            steps = steps.len(),
            total_cost,
            "plan built"
        );

        Ok(Plan {
            plan_id,
            objective: objective.to_string(),
            steps,
            total_cost,
            deliverables: deliverables.to_vec(),
        })
    }

    /// Build a plan from a parsed intent, using the intent's own constraints.
    ///
    /// # Errors
    /// Same as [`PlanBuilder::build_plan`].
    pub fn build_plan_from_intent(&self, intent: &ParsedIntent) -> Result<Plan, AgentError> {
        self.build_plan(
            &intent.objective,
            &intent.operations,
            &intent.deliverables,
            &intent.constraints,
        )
    }

    /// Return a copy of `plan` with one more step appended, re-validating the
    /// whole DAG before returning.
    ///
    /// # Errors
    /// Returns `AgentError::PlanValidation` when a dependency is not a step of
    /// `plan` or the result would contain a cycle.
    pub fn add_step(
        &self,
        plan: &Plan,
        operation: &str,
        dependencies: &[String],
        constraints: &[String],
    ) -> Result<Plan, AgentError> {
        let tool = select_tool(operation);
        let step = PlanStep {
            step_id: format!(
                "{}-{}",
                plan.plan_id.short(),
                Ulid::new().to_string().to_ascii_lowercase()
            ),
            operation: operation.to_string(),
            tool,
            dependencies: dependencies.to_vec(),
            estimated_cost: tool.estimated_cost(),
            invariants: extract_invariants(operation, constraints),
        };

        let mut next = plan.clone();
        next.total_cost = plan.total_cost + step.estimated_cost;
        next.steps.push(step);
        validate_dag(&next.steps)?;
        Ok(next)
    }
}

fn graph_steps(
    prefix: &str,
    operations: &[Operation],
    constraints: &[String],
) -> Result<Vec<PlanStep>, AgentError> {
    let mut id_map: BTreeMap<&str, String> = BTreeMap::new();
    let mut steps = Vec::with_capacity(operations.len());

    for operation in operations {
        let step_id = format!("{prefix}-{}", operation.id);
        if id_map.insert(operation.id.as_str(), step_id.clone()).is_some() {
            return Err(AgentError::PlanValidation(format!(
                "duplicate operation id '{}'",
                operation.id
            )));
        }
        let tool = select_tool(&operation.description);
        steps.push(PlanStep {
            step_id,
            operation: operation.description.clone(),
            tool,
            dependencies: Vec::new(),
            estimated_cost: tool.estimated_cost(),
            invariants: extract_invariants(&operation.description, constraints),
        });
    }

    for (step, operation) in steps.iter_mut().zip(operations) {
        for dep in &operation.dependencies {
            let resolved = id_map.get(dep.as_str()).ok_or_else(|| {
                AgentError::PlanValidation(format!(
                    "operation '{}' depends on unknown operation '{dep}'",
                    operation.id
                ))
            })?;
            step.dependencies.push(resolved.clone());
        }
    }

    Ok(steps)
}

fn linear_steps(prefix: &str, operations: &[String], constraints: &[String]) -> Vec<PlanStep> {
    let mut steps: Vec<PlanStep> = Vec::with_capacity(operations.len());
    for (idx, operation) in operations.iter().enumerate() {
        let tool = select_tool(operation);
        let dependencies = steps
            .last()
            .map(|prev| vec![prev.step_id.clone()])
            .unwrap_or_default();
        steps.push(PlanStep {
            step_id: format!("{prefix}-step-{idx}"),
            operation: operation.clone(),
            tool,
            dependencies,
            estimated_cost: tool.estimated_cost(),
            invariants: extract_invariants(operation, constraints),
        });
    }
    steps
}

/// Deterministic keyword classifier over an operation's text.
#[must_use]
pub fn select_tool(operation: &str) -> ToolKind {
    let lower = operation.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|word| lower.contains(word));
    if has(&QUERY_KEYWORDS) {
        ToolKind::Query
    } else if has(&CHART_KEYWORDS) {
        ToolKind::Chart
    } else if has(&PROFILE_KEYWORDS) {
        ToolKind::Profile
    } else {
        ToolKind::Transform
    }
}

/// Invariants for one step: a filter marker for filtering operations, plus
/// every row/limit constraint verbatim.
#[must_use]
pub fn extract_invariants(operation: &str, constraints: &[String]) -> Vec<String> {
    let lower = operation.to_lowercase();
    let mut invariants = Vec::new();
    if lower.contains("filter") || lower.contains("where") {
        invariants.push(FILTER_BEFORE_AGGREGATE.to_string());
    }
    for constraint in constraints {
        let constraint_lower = constraint.to_lowercase();
        if constraint_lower.contains("row") || constraint_lower.contains("limit") {
            invariants.push(constraint.clone());
        }
    }
    invariants
}

/// Check that step ids are unique, every dependency resolves, and the graph
/// is acyclic.
///
/// # Errors
/// Returns `AgentError::PlanValidation` describing the first problem found.
pub fn validate_dag(steps: &[PlanStep]) -> Result<(), AgentError> {
    let mut ids = BTreeSet::new();
    for step in steps {
        if !ids.insert(step.step_id.as_str()) {
            return Err(AgentError::PlanValidation(format!(
                "duplicate step id '{}'",
                step.step_id
            )));
        }
    }
    for step in steps {
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(AgentError::PlanValidation(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    step.step_id
                )));
            }
        }
    }
    detect_cycle(steps)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unvisited,
    OnStack,
    Done,
}

// Iterative DFS; a dependency found while still on the stack closes a cycle.
fn detect_cycle(steps: &[PlanStep]) -> Result<(), AgentError> {
    let index: BTreeMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(idx, step)| (step.step_id.as_str(), idx))
        .collect();
    let mut state = vec![Visit::Unvisited; steps.len()];

    for start in 0..steps.len() {
        if state[start] != Visit::Unvisited {
            continue;
        }
        state[start] = Visit::OnStack;
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

        while let Some(frame) = stack.last_mut() {
            let (node, cursor) = *frame;
            let Some(dep) = steps[node].dependencies.get(cursor) else {
                state[node] = Visit::Done;
                stack.pop();
                continue;
            };
            frame.1 += 1;
            let Some(&child) = index.get(dep.as_str()) else {
                continue;
            };
            match state[child] {
                Visit::OnStack => {
                    return Err(AgentError::PlanValidation(format!(
                        "dependency cycle detected: step '{}' depends on '{}' which is already on the path",
                        steps[node].step_id, steps[child].step_id
                    )));
                }
                Visit::Unvisited => {
                    state[child] = Visit::OnStack;
                    stack.push((child, 0));
                }
                Visit::Done => {}
            }
        }
    }
    Ok(())
}

/// Step indices in dependency order. Among ready steps the one declared
/// first runs first.
///
/// # Errors
/// Returns `AgentError::PlanValidation` if the plan is not a valid DAG.
pub fn execution_order(plan: &Plan) -> Result<Vec<usize>, AgentError> {
    validate_dag(&plan.steps)?;

    let mut remaining: BTreeMap<usize, BTreeSet<&str>> = plan
        .steps
        .iter()
        .enumerate()
        .map(|(idx, step)| {
            (
                idx,
                step.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    let mut order = Vec::with_capacity(plan.steps.len());

    while let Some(next) = remaining
        .iter()
        .find(|(_, deps)| deps.is_empty())
        .map(|(idx, _)| *idx)
    {
        remaining.remove(&next);
        let done = plan.steps[next].step_id.as_str();
        for deps in remaining.values_mut() {
            deps.remove(done);
        }
        order.push(next);
    }

    if remaining.is_empty() {
        Ok(order)
    } else {
        Err(AgentError::PlanValidation(
            "plan dependencies could not be ordered".to_string(),
        ))
    }
}
