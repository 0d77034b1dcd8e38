use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::paths::AppPaths;
use super::settings::AppConfig;
use super::validation::validate_config;
use crate::core::errors::ApiError;

const REDACT_PLACEHOLDER: &str = "****";

const SENSITIVE_PATTERNS: [&str; 10] = [
    "api_key",
    "secret",
    "password",
    "_token",
    "token_",
    "credential",
    "private_key",
    "access_key",
    "access_token",
    "bearer",
];

const SENSITIVE_WHITELIST: [&str; 4] = [
    "max_tokens",
    "context_window_tokens",
    "token_count",
    "tokens",
];

/// Environment variables that override a single dotted key of the merged tree.
const ENV_OVERRIDES: [(&str, &[&str]); 6] = [
    ("DOCQA_QDRANT_URL", &["vector_store", "url"]),
    ("DOCQA_QDRANT_API_KEY", &["vector_store", "api_key"]),
    ("DOCQA_LLM_BASE_URL", &["llm", "base_url"]),
    ("DOCQA_LLM_API_KEY", &["llm", "api_key"]),
    ("DOCQA_EMBEDDING_BASE_URL", &["embedding", "base_url"]),
    ("DOCQA_CONVERTER_URL", &["converter", "url"]),
];

#[derive(Clone)]
pub struct ConfigService {
    paths: Arc<AppPaths>,
}

impl ConfigService {
    pub fn new(paths: Arc<AppPaths>) -> Self {
        Self { paths }
    }

    pub fn config_path(&self) -> PathBuf {
        if let Ok(path) = env::var("DOCQA_CONFIG_PATH") {
            return PathBuf::from(path);
        }

        let user_config = self.paths.user_data_dir.join("config.yml");
        if user_config.exists() {
            return user_config;
        }

        self.paths.project_root.join("config.yml")
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.paths.secrets_path.clone()
    }

    /// Public config with secrets merged over it, before env overrides.
    pub fn load_tree(&self) -> Value {
        let public_config = load_yaml_file(&self.config_path());
        let secrets_config = load_yaml_file(&self.secrets_path());
        deep_merge(&public_config, &secrets_config)
    }

    pub fn load(&self) -> Result<AppConfig, ApiError> {
        let tree = apply_env_overrides(self.load_tree(), |key| env::var(key).ok());
        resolve(tree)
    }

    pub fn redact_sensitive_values(&self, value: &Value) -> Value {
        redact_sensitive_values(value)
    }
}

/// Validates a merged tree and turns it into the typed configuration.
pub fn resolve(tree: Value) -> Result<AppConfig, ApiError> {
    validate_config(&tree)?;
    serde_json::from_value(tree).map_err(|err| ApiError::BadRequest(format!("config: {err}")))
}

fn load_yaml_file(path: &Path) -> Value {
    if !path.exists() {
        return Value::Object(Map::new());
    }

    match fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<Value>(&contents) {
            Ok(value) => match value {
                Value::Object(_) => value,
                _ => Value::Object(Map::new()),
            },
            Err(err) => {
                tracing::warn!("Ignoring unparsable config {}: {}", path.display(), err);
                Value::Object(Map::new())
            }
        },
        Err(_) => Value::Object(Map::new()),
    }
}

fn apply_env_overrides<F>(mut tree: Value, lookup: F) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    for (var, path) in ENV_OVERRIDES {
        if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
            set_path(&mut tree, path, Value::String(value));
        }
    }

    if let Some(port) = lookup("PORT").and_then(|p| p.trim().parse::<u64>().ok()) {
        set_path(&mut tree, &["server", "port"], Value::from(port));
    }

    tree
}

fn set_path(tree: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut cursor = tree;
    for key in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        cursor = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(map) = cursor {
        map.insert(last.to_string(), value);
    }
}

fn deep_merge(base: &Value, override_value: &Value) -> Value {
    match (base, override_value) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged: Map<String, Value> = base_map.clone();
            for (key, value) in override_map {
                let merged_value = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        _ => override_value.clone(),
    }
}

fn redact_sensitive_values(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = Map::new();
            for (key, val) in map {
                if is_sensitive_key(key) && !val.is_null() {
                    redacted.insert(key.clone(), Value::String(REDACT_PLACEHOLDER.to_string()));
                } else {
                    redacted.insert(key.clone(), redact_sensitive_values(val));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive_values).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase();
    if SENSITIVE_WHITELIST
        .iter()
        .any(|allowed| *allowed == key_lower)
    {
        return false;
    }
    SENSITIVE_PATTERNS
        .iter()
        .any(|pattern| key_lower.contains(pattern))
}
