#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use data_agent_audit_core::{AuditLog, EntryFilter};
use data_agent_audit_jsonl::JsonlAuditLog;
use data_agent_domain::{Recipe, RecipeId};
use data_agent_orchestrator::{parse_structured_intent, AgentConfig};
use data_agent_planner::{execution_order, PlanBuilder};
use data_agent_policy::PolicyGate;
use data_agent_recipe_core::{RecipeStore, SchemaFingerprinter};
use data_agent_recipe_sqlite::SqliteRecipeStore;
use serde::Serialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

/// Exit status for a failed integrity check, distinct from usage errors.
const EXIT_CHAIN_BROKEN: u8 = 2;
const EXIT_NOT_FOUND: u8 = 1;

#[derive(Debug, Parser)]
#[command(name = "data-agent")]
#[command(about = "Data analysis agent operator CLI")]
pub struct Cli {
    /// Agent config YAML; supplies default paths and the policy settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    Recipes {
        #[command(subcommand)]
        command: RecipesCommand,
    },
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    Fingerprint(FingerprintArgs),
    Plan(PlanArgs),
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    /// Walk the hash chain; exits with status 2 when it is broken.
    Verify(AuditLogArgs),
    Entries(AuditEntriesArgs),
    Stats(AuditLogArgs),
}

#[derive(Debug, Args)]
pub struct AuditLogArgs {
    #[arg(long)]
    log: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct AuditEntriesArgs {
    #[arg(long)]
    log: Option<PathBuf>,
    #[arg(long)]
    event_type: Option<String>,
    #[arg(long)]
    prefix: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum RecipesCommand {
    List(RecipesListArgs),
    Stats(RecipeDbArgs),
    Delete(RecipesDeleteArgs),
}

#[derive(Debug, Args)]
pub struct RecipeDbArgs {
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct RecipesListArgs {
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    fingerprint: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct RecipesDeleteArgs {
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    CheckQuery {
        #[arg(long)]
        sql: String,
    },
    CheckColumns {
        #[arg(long)]
        table: String,
        #[arg(long = "column", required = true)]
        columns: Vec<String>,
    },
}

#[derive(Debug, Args)]
pub struct FingerprintArgs {
    /// JSON object mapping column name to declared type.
    #[arg(long)]
    schema: PathBuf,
    /// Second schema to diff against.
    #[arg(long)]
    against: Option<PathBuf>,
    /// Hash declared types verbatim instead of normalizing them.
    #[arg(long)]
    raw_types: bool,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Structured intent JSON (objective, operations, deliverables, constraints).
    #[arg(long)]
    intent: PathBuf,
    #[arg(long = "constraint")]
    constraints: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RecipeSummary {
    recipe_id: String,
    schema_fingerprint: String,
    intent_template: String,
    step_count: usize,
    success_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    last_used_at: OffsetDateTime,
}

impl From<&Recipe> for RecipeSummary {
    fn from(recipe: &Recipe) -> Self {
        let step_count = recipe
            .plan_structure
            .get("steps")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        Self {
            recipe_id: recipe.recipe_id.to_string(),
            schema_fingerprint: recipe.schema_fingerprint.clone(),
            intent_template: recipe.intent_template.clone(),
            step_count,
            success_count: recipe.success_count,
            created_at: recipe.created_at,
            last_used_at: recipe.last_used_at,
        }
    }
}

/// Install the stderr subscriber. `RUST_LOG` applies only without `-v`.
pub fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Executes a parsed CLI invocation and prints its JSON result to stdout.
///
/// # Errors
/// Returns an error when the config, log, store, or an input file cannot be
/// read, or when the requested operation fails.
pub fn run_cli(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => AgentConfig::from_yaml_path(path)?,
        None => AgentConfig::default(),
    };
    match cli.command {
        Command::Audit { command } => run_audit(command, &config),
        Command::Recipes { command } => run_recipes(command, &config),
        Command::Policy { command } => run_policy(command, &config),
        Command::Fingerprint(args) => run_fingerprint(&args),
        Command::Plan(args) => run_plan(args),
    }
}

fn run_audit(command: AuditCommand, config: &AgentConfig) -> Result<ExitCode> {
    match command {
        AuditCommand::Verify(args) => {
            let log = open_audit_log(args.log.as_deref(), config)?;
            let report = log.verify_chain()?;
            print_json(&report)?;
            if report.valid {
                Ok(ExitCode::SUCCESS)
            } else {
                warn!(
                    path = %log.path().display(),
                    error = report.error.as_deref().unwrap_or_default(),
                    "audit chain broken"
                );
                Ok(ExitCode::from(EXIT_CHAIN_BROKEN))
            }
        }
        AuditCommand::Entries(args) => {
            let log = open_audit_log(args.log.as_deref(), config)?;
            let filter = EntryFilter {
                event_type: args.event_type,
                entry_id_prefix: args.prefix,
                limit: args.limit,
            };
            print_json(&log.get_entries(&filter)?)?;
            Ok(ExitCode::SUCCESS)
        }
        AuditCommand::Stats(args) => {
            let log = open_audit_log(args.log.as_deref(), config)?;
            print_json(&log.get_stats()?)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_recipes(command: RecipesCommand, config: &AgentConfig) -> Result<ExitCode> {
    match command {
        RecipesCommand::List(args) => {
            let store = open_recipe_store(args.db.as_deref(), config)?;
            let recipes = store.list_recipes(args.fingerprint.as_deref(), args.limit)?;
            let summaries: Vec<RecipeSummary> = recipes.iter().map(RecipeSummary::from).collect();
            print_json(&summaries)?;
            Ok(ExitCode::SUCCESS)
        }
        RecipesCommand::Stats(args) => {
            let store = open_recipe_store(args.db.as_deref(), config)?;
            print_json(&store.stats()?)?;
            Ok(ExitCode::SUCCESS)
        }
        RecipesCommand::Delete(args) => {
            let recipe_id = parse_recipe_id(&args.id)?;
            let store = open_recipe_store(args.db.as_deref(), config)?;
            let deleted = store.delete_recipe(recipe_id)?;
            print_json(&json!({
                "recipe_id": recipe_id.to_string(),
                "deleted": deleted,
            }))?;
            if deleted {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_NOT_FOUND))
            }
        }
    }
}

fn run_policy(command: PolicyCommand, config: &AgentConfig) -> Result<ExitCode> {
    let gate = PolicyGate::new(&config.policy)?;
    let result = match command {
        PolicyCommand::CheckQuery { sql } => gate.check_query(&sql),
        PolicyCommand::CheckColumns { table, columns } => {
            gate.validate_column_access(&table, &columns)
        }
    };
    print_json(&result)?;
    Ok(ExitCode::SUCCESS)
}

fn run_fingerprint(args: &FingerprintArgs) -> Result<ExitCode> {
    let fingerprinter = SchemaFingerprinter::new(!args.raw_types);
    let schema = read_schema(&args.schema)?;
    let fingerprint = fingerprinter.fingerprint(&schema)?;
    let mut output = json!({
        "fingerprint": fingerprint,
        "column_count": schema.len(),
        "normalized_types": !args.raw_types,
    });
    if let Some(path) = &args.against {
        let other = read_schema(path)?;
        let other_fingerprint = fingerprinter.fingerprint(&other)?;
        output["against"] = json!({
            "fingerprint": other_fingerprint,
            "matches": other_fingerprint == fingerprint,
            "diff": fingerprinter.schema_diff(&schema, &other),
        });
    }
    print_json(&output)?;
    Ok(ExitCode::SUCCESS)
}

fn run_plan(args: PlanArgs) -> Result<ExitCode> {
    let text = fs::read_to_string(&args.intent)
        .with_context(|| format!("failed to read intent {}", args.intent.display()))?;
    let mut intent = parse_structured_intent(&text)?;
    intent.constraints.extend(args.constraints);
    let plan = PlanBuilder::new().build_plan_from_intent(&intent)?;
    let order = execution_order(&plan)?;
    debug!(plan_id = %plan.plan_id, steps = plan.steps.len(), "plan built from intent file");
    let execution_order: Vec<&str> = order
        .iter()
        .filter_map(|index| plan.steps.get(*index))
        .map(|step| step.step_id.as_str())
        .collect();
    print_json(&json!({
        "plan": plan,
        "execution_order": execution_order,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn open_audit_log(path: Option<&Path>, config: &AgentConfig) -> Result<JsonlAuditLog> {
    JsonlAuditLog::open(path.unwrap_or(config.audit_log_path.as_path()))
}

fn open_recipe_store(path: Option<&Path>, config: &AgentConfig) -> Result<SqliteRecipeStore> {
    SqliteRecipeStore::open_migrated(path.unwrap_or(config.recipe_db_path.as_path()))
}

fn read_schema(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read schema {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| {
        format!(
            "schema {} must be a JSON object of column name to type",
            path.display()
        )
    })
}

fn parse_recipe_id(value: &str) -> Result<RecipeId> {
    Ulid::from_string(value)
        .map(RecipeId)
        .map_err(|err| anyhow!("invalid recipe id {value}: {err}"))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
