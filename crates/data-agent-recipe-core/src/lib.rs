#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use data_agent_domain::{ensure_non_empty, hash_bytes, now_utc, DateTimeUtc, Recipe, RecipeId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Declared column types folded onto canonical categories. Unlisted types
/// pass through lowercased.
pub const TYPE_NORMALIZATION: [(&str, &str); 12] = [
    ("int64", "integer"),
    ("int32", "integer"),
    ("int16", "integer"),
    ("int8", "integer"),
    ("float64", "float"),
    ("float32", "float"),
    ("object", "string"),
    ("string", "string"),
    ("bool", "boolean"),
    ("datetime64[ns]", "timestamp"),
    ("datetime64[ns, UTC]", "timestamp"),
    ("timedelta64[ns]", "interval"),
];

#[must_use]
pub fn normalize_type(dtype: &str) -> String {
    TYPE_NORMALIZATION
        .iter()
        .find(|(raw, _)| *raw == dtype)
        .map_or_else(|| dtype.to_lowercase(), |(_, canonical)| (*canonical).to_string())
}

/// Type name for a driver-level SQL type code.
#[must_use]
pub fn sql_type_name(type_code: Option<i64>) -> String {
    match type_code {
        None => "unknown".to_string(),
        Some(1..=3) => "integer".to_string(),
        Some(4 | 5) => "float".to_string(),
        Some(7 | 11) => "timestamp".to_string(),
        Some(8..=10 | 12) => "string".to_string(),
        Some(other) => format!("type_{other}"),
    }
}

/// Structural hash of a column-name to type mapping. Row values and
/// table names never contribute.
#[derive(Debug, Clone, Copy)]
pub struct SchemaFingerprinter {
    normalize_types: bool,
}

impl Default for SchemaFingerprinter {
    fn default() -> Self {
        Self {
            normalize_types: true,
        }
    }
}

impl SchemaFingerprinter {
    #[must_use]
    pub fn new(normalize_types: bool) -> Self {
        Self { normalize_types }
    }

    fn column_type(&self, dtype: &str) -> String {
        if self.normalize_types {
            normalize_type(dtype)
        } else {
            dtype.to_string()
        }
    }

    /// SHA-256 over `name:type` pairs sorted by name and joined with `,`.
    ///
    /// # Errors
    /// Returns an error for an empty schema.
    pub fn fingerprint(&self, columns: &BTreeMap<String, String>) -> Result<String> {
        if columns.is_empty() {
            return Err(anyhow!("cannot compute fingerprint for empty schema"));
        }
        let material = columns
            .iter()
            .map(|(name, dtype)| format!("{name}:{}", self.column_type(dtype)))
            .collect::<Vec<_>>()
            .join(",");
        Ok(hash_bytes(material.as_bytes()))
    }

    /// Fingerprint a result description of `(column name, type code)` pairs.
    ///
    /// # Errors
    /// Returns an error when no columns are described.
    pub fn fingerprint_type_codes(&self, columns: &[(String, Option<i64>)]) -> Result<String> {
        let schema = columns
            .iter()
            .map(|(name, code)| (name.clone(), sql_type_name(*code)))
            .collect();
        self.fingerprint(&schema)
    }

    #[must_use]
    pub fn schema_diff(
        &self,
        before: &BTreeMap<String, String>,
        after: &BTreeMap<String, String>,
    ) -> SchemaDiff {
        let added: Vec<String> = after
            .keys()
            .filter(|name| !before.contains_key(*name))
            .cloned()
            .collect();
        let removed: Vec<String> = before
            .keys()
            .filter(|name| !after.contains_key(*name))
            .cloned()
            .collect();
        let mut changed = BTreeMap::new();
        for (name, old_type) in before {
            let Some(new_type) = after.get(name) else {
                continue;
            };
            let (from, to) = (self.column_type(old_type), self.column_type(new_type));
            if from != to {
                changed.insert(name.clone(), TypeChange { from, to });
            }
        }
        let is_compatible = removed.is_empty() && changed.is_empty();
        SchemaDiff {
            added,
            removed,
            changed,
            is_compatible,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeChange {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: BTreeMap<String, TypeChange>,
    pub is_compatible: bool,
}

/// Composite key over several sources: sorted fingerprints joined by `-`,
/// then hashed. A single fingerprint is returned unchanged.
#[must_use]
pub fn combine_fingerprints(fingerprints: &[String]) -> Option<String> {
    match fingerprints {
        [] => None,
        [single] => Some(single.clone()),
        many => {
            let sorted: BTreeSet<&str> = many.iter().map(String::as_str).collect();
            let joined = sorted.into_iter().collect::<Vec<_>>().join("-");
            Some(hash_bytes(joined.as_bytes()))
        }
    }
}

/// Cosine of the angle between `a` and `b`; 0 for a zero-norm vector or
/// mismatched lengths.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum();
    let norm_a = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

pub trait EmbeddingProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Offline feature-hashing embedder over lowercase word unigrams and bigrams.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbeddingProvider {
    dimensions: usize,
}

impl HashingEmbeddingProvider {
    /// # Errors
    /// Returns an error when `dimensions` is zero.
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(anyhow!("embedding dimensions must be positive"));
        }
        Ok(Self { dimensions })
    }

    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

impl EmbeddingProvider for HashingEmbeddingProvider {
    fn provider_name(&self) -> &'static str {
        "hashing"
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect();
        let bigrams = words.windows(2).map(|pair| format!("{} {}", pair[0], pair[1]));
        let features = words.iter().map(|word| (*word).to_string()).chain(bigrams);

        let dims = u64::try_from(self.dimensions).context("embedding dimensions overflow")?;
        let mut vector = vec![0.0_f32; self.dimensions];
        for feature in features {
            let digest = Sha256::digest(feature.as_bytes());
            let mut bucket = [0_u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = usize::try_from(u64::from_le_bytes(bucket) % dims)
                .context("embedding bucket overflow")?;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            if let Some(slot) = vector.get_mut(idx) {
                *slot += sign;
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpEmbeddingConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Remote embedder speaking JSON over HTTP POST. Accepts either
/// `{"embedding": [...]}` or `{"data": [{"embedding": [...]}]}` replies.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    config: HttpEmbeddingConfig,
}

impl HttpEmbeddingProvider {
    /// # Errors
    /// Returns an error when the configured URL is empty.
    pub fn new(config: HttpEmbeddingConfig) -> Result<Self> {
        ensure_non_empty("embedding.url", &config.url)?;
        Ok(Self { config })
    }

    fn bearer_token(&self) -> Result<Option<String>> {
        self.config
            .auth_bearer_env
            .as_deref()
            .map(|env_name| {
                std::env::var(env_name).map_err(|_| {
                    anyhow!("missing env var '{env_name}' required by embedding.auth_bearer_env")
                })
            })
            .transpose()
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn provider_name(&self) -> &'static str {
        "http_json"
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build();
        let mut req = agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = self.bearer_token()? {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let mut outbound = json!({ "input": text });
        if let (Some(model), Some(map)) = (&self.config.model, outbound.as_object_mut()) {
            map.insert("model".to_string(), json!(model));
        }

        let body: Value = match req.send_json(&outbound) {
            Ok(response) => response
                .into_json()
                .context("embedding response is not JSON")?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("embedding request failed: http status {code}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("embedding transport failure: {err}"));
            }
        };
        parse_embedding(&body)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn parse_embedding(body: &Value) -> Result<Vec<f32>> {
    let values = body
        .get("embedding")
        .or_else(|| body.pointer("/data/0/embedding"))
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("embedding response has no embedding array"))?;
    values
        .iter()
        .map(|value| {
            value
                .as_f64()
                .map(|number| number as f32)
                .ok_or_else(|| anyhow!("embedding contains a non-numeric value"))
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipeStats {
    pub total_recipes: u64,
    pub unique_schemas: u64,
    pub total_success_count: u64,
}

/// Durable recipe storage. `record_reuse` must increment atomically.
pub trait RecipeStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn insert_recipe(&self, recipe: &Recipe) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn recipes_for_fingerprint(&self, schema_fingerprint: &str) -> Result<Vec<Recipe>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_recipe(&self, recipe_id: RecipeId) -> Result<Option<Recipe>>;

    /// Returns `false` when no recipe has this id.
    #[allow(clippy::missing_errors_doc)]
    fn record_reuse(&self, recipe_id: RecipeId, used_at: DateTimeUtc) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn delete_recipe(&self, recipe_id: RecipeId) -> Result<bool>;

    /// Most recently used first.
    #[allow(clippy::missing_errors_doc)]
    fn list_recipes(&self, schema_fingerprint: Option<&str>, limit: usize) -> Result<Vec<Recipe>>;

    #[allow(clippy::missing_errors_doc)]
    fn stats(&self) -> Result<RecipeStats>;
}

#[derive(Debug, Default)]
pub struct MemoryRecipeStore {
    recipes: Mutex<Vec<Recipe>>,
}

impl MemoryRecipeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Vec<Recipe>>> {
        self.recipes
            .lock()
            .map_err(|_| anyhow!("recipe store lock poisoned"))
    }
}

impl RecipeStore for MemoryRecipeStore {
    fn insert_recipe(&self, recipe: &Recipe) -> Result<()> {
        let mut recipes = self.guard()?;
        if recipes.iter().any(|r| r.recipe_id == recipe.recipe_id) {
            return Err(anyhow!("recipe {} already exists", recipe.recipe_id));
        }
        recipes.push(recipe.clone());
        Ok(())
    }

    fn recipes_for_fingerprint(&self, schema_fingerprint: &str) -> Result<Vec<Recipe>> {
        Ok(self
            .guard()?
            .iter()
            .filter(|r| r.schema_fingerprint == schema_fingerprint)
            .cloned()
            .collect())
    }

    fn get_recipe(&self, recipe_id: RecipeId) -> Result<Option<Recipe>> {
        Ok(self
            .guard()?
            .iter()
            .find(|r| r.recipe_id == recipe_id)
            .cloned())
    }

    fn record_reuse(&self, recipe_id: RecipeId, used_at: DateTimeUtc) -> Result<bool> {
        let mut recipes = self.guard()?;
        let Some(recipe) = recipes.iter_mut().find(|r| r.recipe_id == recipe_id) else {
            return Ok(false);
        };
        recipe.success_count = recipe.success_count.saturating_add(1);
        recipe.last_used_at = used_at;
        Ok(true)
    }

    fn delete_recipe(&self, recipe_id: RecipeId) -> Result<bool> {
        let mut recipes = self.guard()?;
        let before = recipes.len();
        recipes.retain(|r| r.recipe_id != recipe_id);
        Ok(recipes.len() != before)
    }

    fn list_recipes(&self, schema_fingerprint: Option<&str>, limit: usize) -> Result<Vec<Recipe>> {
        let mut listed: Vec<Recipe> = self
            .guard()?
            .iter()
            .filter(|r| schema_fingerprint.map_or(true, |fp| r.schema_fingerprint == fp))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        listed.truncate(limit);
        Ok(listed)
    }

    fn stats(&self) -> Result<RecipeStats> {
        let recipes = self.guard()?;
        let schemas: BTreeSet<&str> = recipes
            .iter()
            .map(|r| r.schema_fingerprint.as_str())
            .collect();
        Ok(RecipeStats {
            total_recipes: u64::try_from(recipes.len()).unwrap_or(u64::MAX),
            unique_schemas: u64::try_from(schemas.len()).unwrap_or(u64::MAX),
            total_success_count: recipes.iter().map(|r| u64::from(r.success_count)).sum(),
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoredRecipe {
    pub recipe: Recipe,
    pub similarity: f64,
}

/// Exact-fingerprint, embedding-ranked plan cache.
#[derive(Clone)]
pub struct RecipeCache {
    store: Arc<dyn RecipeStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl std::fmt::Debug for RecipeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipeCache")
            .field("embedder", &self.embedder.provider_name())
            .finish_non_exhaustive()
    }
}

impl RecipeCache {
    #[must_use]
    pub fn new(store: Arc<dyn RecipeStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, embedder }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RecipeStore> {
        &self.store
    }

    /// Embed `intent` and persist a new recipe with a success count of 1.
    ///
    /// # Errors
    /// Returns an error if the fingerprint is empty, embedding fails, or the
    /// store rejects the write.
    pub fn save_recipe(
        &self,
        schema_fingerprint: &str,
        intent: &str,
        plan_structure: Value,
        tool_argument_templates: Value,
    ) -> Result<RecipeId> {
        ensure_non_empty("schema_fingerprint", schema_fingerprint)?;
        let intent_embedding = self.embedder.embed(intent)?;
        let now = now_utc();
        let recipe = Recipe {
            recipe_id: RecipeId::new(),
            schema_fingerprint: schema_fingerprint.to_string(),
            intent_template: intent.to_string(),
            intent_embedding,
            plan_structure,
            tool_argument_templates,
            success_count: 1,
            created_at: now,
            last_used_at: now,
        };
        self.store.insert_recipe(&recipe)?;
        info!(recipe_id = %recipe.recipe_id, "recipe saved");
        Ok(recipe.recipe_id)
    }

    /// Recipes with exactly this fingerprint, most similar intent first.
    ///
    /// # Errors
    /// Returns an error if embedding or the store read fails.
    pub fn retrieve_recipes(
        &self,
        schema_fingerprint: &str,
        intent: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredRecipe>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let candidates = self.store.recipes_for_fingerprint(schema_fingerprint)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(intent)?;
        let mut scored: Vec<ScoredRecipe> = candidates
            .into_iter()
            .map(|recipe| ScoredRecipe {
                similarity: cosine_similarity(&query, &recipe.intent_embedding),
                recipe,
            })
            .collect();
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(top_k);
        debug!(
            candidates = scored.len(),
            best = scored.first().map(|s| s.similarity),
            "recipes retrieved"
        );
        Ok(scored)
    }

    /// # Errors
    /// Returns an error if the store update fails.
    pub fn mark_reused(&self, recipe_id: RecipeId) -> Result<bool> {
        self.store.record_reuse(recipe_id, now_utc())
    }
}
