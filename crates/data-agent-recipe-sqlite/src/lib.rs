#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use data_agent_domain::{
    audit_timestamp, now_utc, parse_rfc3339, DateTimeUtc, Recipe, RecipeId,
};
use data_agent_recipe_core::{RecipeStats, RecipeStore};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::debug;
use ulid::Ulid;

const RECIPE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_RECIPES_V1: &str = "
CREATE TABLE IF NOT EXISTS recipes (
    recipe_id TEXT PRIMARY KEY,
    schema_fingerprint TEXT NOT NULL,
    intent_template TEXT NOT NULL,
    intent_embedding BLOB NOT NULL,
    plan_structure TEXT NOT NULL,
    tool_argument_templates TEXT NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_used_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recipes_schema_fp ON recipes(schema_fingerprint);
CREATE INDEX IF NOT EXISTS idx_recipes_last_used ON recipes(last_used_at DESC);
";

const RECIPE_COLUMNS: &str = "recipe_id, schema_fingerprint, intent_template, intent_embedding,
     plan_structure, tool_argument_templates, success_count, created_at, last_used_at";

/// SQLite-backed recipe store. Timestamps are stored fixed-width so that
/// `ORDER BY last_used_at` sorts chronologically.
#[derive(Debug)]
pub struct SqliteRecipeStore {
    conn: Mutex<Connection>,
}

impl SqliteRecipeStore {
    /// # Errors
    /// Returns an error if the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open and migrate in one step.
    ///
    /// # Errors
    /// Returns an error if opening or migrating fails.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("recipe store connection lock poisoned"))
    }

    /// # Errors
    /// Returns an error if any schema statement fails.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_RECIPES_V1)
            .context("failed to apply recipe schema")?;
        // CREATE TABLE IF NOT EXISTS leaves an existing table alone. Stores
        // created before argument templates were persisted have a `recipes`
        // table without this column.
        ensure_column(
            &conn,
            "recipes",
            "tool_argument_templates",
            "TEXT NOT NULL DEFAULT '[]'",
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![RECIPE_MIGRATION_VERSION, audit_timestamp(now_utc())],
        )
        .context("failed to register recipe schema migration")?;
        Ok(())
    }

    fn query_recipes(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Recipe>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).context("failed to prepare recipe query")?;
        let mut rows = stmt.query(args)?;
        let mut recipes = Vec::new();
        while let Some(row) = rows.next()? {
            recipes.push(recipe_from_row(row)?);
        }
        Ok(recipes)
    }
}

impl RecipeStore for SqliteRecipeStore {
    fn insert_recipe(&self, recipe: &Recipe) -> Result<()> {
        let plan_structure =
            serde_json::to_string(&recipe.plan_structure).context("failed to encode plan")?;
        let templates = serde_json::to_string(&recipe.tool_argument_templates)
            .context("failed to encode argument templates")?;
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO recipes({RECIPE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    recipe.recipe_id.to_string(),
                    recipe.schema_fingerprint,
                    recipe.intent_template,
                    encode_embedding(&recipe.intent_embedding),
                    plan_structure,
                    templates,
                    i64::from(recipe.success_count),
                    audit_timestamp(recipe.created_at),
                    audit_timestamp(recipe.last_used_at),
                ],
            )
            .with_context(|| format!("failed to insert recipe {}", recipe.recipe_id))?;
        debug!(recipe_id = %recipe.recipe_id, "recipe row inserted");
        Ok(())
    }

    fn recipes_for_fingerprint(&self, schema_fingerprint: &str) -> Result<Vec<Recipe>> {
        self.query_recipes(
            &format!("SELECT {RECIPE_COLUMNS} FROM recipes WHERE schema_fingerprint = ?1"),
            &[&schema_fingerprint],
        )
    }

    fn get_recipe(&self, recipe_id: RecipeId) -> Result<Option<Recipe>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {RECIPE_COLUMNS} FROM recipes WHERE recipe_id = ?1"),
            params![recipe_id.to_string()],
            |row| Ok(recipe_from_row(row)),
        )
        .optional()
        .context("failed to read recipe")?
        .transpose()
    }

    fn record_reuse(&self, recipe_id: RecipeId, used_at: DateTimeUtc) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE recipes
                 SET success_count = success_count + 1,
                     last_used_at = ?1
                 WHERE recipe_id = ?2",
                params![audit_timestamp(used_at), recipe_id.to_string()],
            )
            .context("failed to record recipe reuse")?;
        Ok(changed > 0)
    }

    fn delete_recipe(&self, recipe_id: RecipeId) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM recipes WHERE recipe_id = ?1",
                params![recipe_id.to_string()],
            )
            .context("failed to delete recipe")?;
        Ok(changed > 0)
    }

    fn list_recipes(&self, schema_fingerprint: Option<&str>, limit: usize) -> Result<Vec<Recipe>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        match schema_fingerprint {
            Some(fingerprint) => self.query_recipes(
                &format!(
                    "SELECT {RECIPE_COLUMNS} FROM recipes WHERE schema_fingerprint = ?1
                     ORDER BY last_used_at DESC LIMIT ?2"
                ),
                &[&fingerprint, &limit],
            ),
            None => self.query_recipes(
                &format!("SELECT {RECIPE_COLUMNS} FROM recipes ORDER BY last_used_at DESC LIMIT ?1"),
                &[&limit],
            ),
        }
    }

    fn stats(&self) -> Result<RecipeStats> {
        let conn = self.conn()?;
        let (total, unique, successes): (i64, i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT schema_fingerprint), COALESCE(SUM(success_count), 0)
                 FROM recipes",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("failed to compute recipe stats")?;
        Ok(RecipeStats {
            total_recipes: u64::try_from(total).unwrap_or_default(),
            unique_schemas: u64::try_from(unique).unwrap_or_default(),
            total_success_count: u64::try_from(successes).unwrap_or_default(),
        })
    }
}

/// Little-endian `f32` array.
#[must_use]
pub fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

/// # Errors
/// Returns an error when the blob length is not a multiple of four.
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(anyhow!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        ));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn recipe_from_row(row: &Row<'_>) -> Result<Recipe> {
    let recipe_id: String = row.get(0)?;
    let recipe_id = Ulid::from_string(&recipe_id)
        .map(RecipeId)
        .map_err(|err| anyhow!("invalid stored recipe_id '{recipe_id}': {err}"))?;
    let blob: Vec<u8> = row.get(3)?;
    let plan_structure: String = row.get(4)?;
    let templates: String = row.get(5)?;
    let success_count: i64 = row.get(6)?;
    let created_at: String = row.get(7)?;
    let last_used_at: String = row.get(8)?;

    Ok(Recipe {
        recipe_id,
        schema_fingerprint: row.get(1)?,
        intent_template: row.get(2)?,
        intent_embedding: decode_embedding(&blob)?,
        plan_structure: serde_json::from_str::<Value>(&plan_structure)
            .context("invalid stored plan_structure JSON")?,
        tool_argument_templates: serde_json::from_str::<Value>(&templates)
            .context("invalid stored tool_argument_templates JSON")?,
        success_count: u32::try_from(success_count)
            .with_context(|| format!("invalid success_count: {success_count}"))?,
        created_at: parse_rfc3339(&created_at)?,
        last_used_at: parse_rfc3339(&last_used_at)?,
    })
}

fn ensure_column(conn: &Connection, table: &str, column: &str, sql_type: &str) -> Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"), [])
        .with_context(|| format!("failed to add missing column {table}.{column}"))?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table info for {table}"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
