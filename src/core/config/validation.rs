use serde_json::{Map, Value};
use crate::core::errors::ApiError;

pub fn validate_config(config: &Value) -> Result<(), ApiError> {
    let root = config
        .as_object()
        .ok_or_else(|| config_type_error("root", "object"))?;

    if let Some(server) = expect_optional_object(root, "server")? {
        validate_optional_string_field(server, "server.host", "host")?;
        validate_u64_field(server, "server.port", "port", 1, 65535)?;
    }

    if let Some(store) = expect_optional_object(root, "vector_store")? {
        validate_enum_field(store, "vector_store.backend", "backend", &["qdrant", "memory"])?;
        validate_optional_string_field(store, "vector_store.url", "url")?;
        validate_optional_string_field(store, "vector_store.api_key", "api_key")?;
        validate_non_empty_string_field(store, "vector_store.collection", "collection")?;
        validate_enum_field(
            store,
            "vector_store.distance",
            "distance",
            &["cosine", "euclid", "dot"],
        )?;
        validate_u64_field(
            store,
            "vector_store.upsert_batch_size",
            "upsert_batch_size",
            1,
            10_000,
        )?;
        validate_u64_field(store, "vector_store.timeout_secs", "timeout_secs", 1, 3_600)?;
    }

    if let Some(embedding) = expect_optional_object(root, "embedding")? {
        validate_optional_string_field(embedding, "embedding.base_url", "base_url")?;
        validate_optional_string_field(embedding, "embedding.api_key", "api_key")?;
        validate_non_empty_string_field(embedding, "embedding.model", "model")?;
        validate_u64_field(embedding, "embedding.dimension", "dimension", 1, 65_536)?;
        validate_u64_field(embedding, "embedding.timeout_secs", "timeout_secs", 1, 3_600)?;
    }

    if let Some(llm) = expect_optional_object(root, "llm")? {
        validate_optional_string_field(llm, "llm.base_url", "base_url")?;
        validate_optional_string_field(llm, "llm.api_key", "api_key")?;
        validate_non_empty_string_field(llm, "llm.model", "model")?;
        validate_f64_field(llm, "llm.temperature", "temperature", 0.0, 2.0)?;
        validate_u64_field(llm, "llm.max_tokens", "max_tokens", 1, 1_000_000)?;
        validate_u64_field(
            llm,
            "llm.context_window_tokens",
            "context_window_tokens",
            128,
            10_000_000,
        )?;
        validate_u64_field(
            llm,
            "llm.connect_timeout_secs",
            "connect_timeout_secs",
            1,
            3_600,
        )?;
        validate_u64_field(llm, "llm.idle_timeout_secs", "idle_timeout_secs", 1, 86_400)?;
    }

    if let Some(chunking) = expect_optional_object(root, "chunking")? {
        validate_u64_field(chunking, "chunking.max_words", "max_words", 1, 100_000)?;
        validate_u64_field(chunking, "chunking.overlap_words", "overlap_words", 0, 100_000)?;
        validate_u64_field(chunking, "chunking.min_words", "min_words", 0, 100_000)?;

        let max = chunking.get("max_words").and_then(Value::as_u64).unwrap_or(500);
        let overlap = chunking
            .get("overlap_words")
            .and_then(Value::as_u64)
            .unwrap_or(50);
        if overlap >= max {
            return Err(ApiError::BadRequest(format!(
                "Invalid config at 'chunking.overlap_words': must be less than max_words ({})",
                max
            )));
        }
    }

    if let Some(retrieval) = expect_optional_object(root, "retrieval")? {
        validate_u64_field(retrieval, "retrieval.top_k", "top_k", 1, 1_000)?;
    }

    if let Some(retry) = expect_optional_object(root, "retry")? {
        validate_u64_field(retry, "retry.max_retries", "max_retries", 0, 100)?;
        validate_u64_field(
            retry,
            "retry.initial_delay_ms",
            "initial_delay_ms",
            1,
            600_000,
        )?;
        validate_u64_field(retry, "retry.multiplier", "multiplier", 1, 10)?;
        validate_u64_field(retry, "retry.max_delay_ms", "max_delay_ms", 1, 3_600_000)?;
    }

    if let Some(converter) = expect_optional_object(root, "converter")? {
        validate_optional_string_field(converter, "converter.url", "url")?;
        validate_u64_field(converter, "converter.timeout_secs", "timeout_secs", 1, 86_400)?;
        validate_bool_field(converter, "converter.do_ocr", "do_ocr")?;
        validate_bool_field(
            converter,
            "converter.do_table_structure",
            "do_table_structure",
        )?;
        validate_bool_field(
            converter,
            "converter.generate_picture_images",
            "generate_picture_images",
        )?;
    }

    if let Some(prompt) = expect_optional_object(root, "prompt")? {
        validate_optional_string_field(prompt, "prompt.system_instruction", "system_instruction")?;
    }

    Ok(())
}

fn expect_optional_object<'a>(
    root: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, ApiError> {
    match root.get(key) {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(config_type_error(key, "object")),
    }
}

fn validate_bool_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.as_bool().is_some() {
        return Ok(());
    }
    Err(config_type_error(path, "boolean"))
}

fn validate_u64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: u64,
    max: u64,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_u64() else {
        return Err(config_type_error(path, "integer"));
    };
    if number < min || number > max {
        return Err(ApiError::BadRequest(format!(
            "Invalid config at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

fn validate_f64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: f64,
    max: f64,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.is_null() {
        return Ok(());
    }
    let Some(number) = value.as_f64() else {
        return Err(config_type_error(path, "number"));
    };
    if number < min || number > max {
        return Err(ApiError::BadRequest(format!(
            "Invalid config at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

fn validate_non_empty_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(text) = value.as_str() else {
        return Err(config_type_error(path, "string"));
    };
    if text.trim().is_empty() {
        return Err(ApiError::BadRequest(format!(
            "Invalid config at '{}': value cannot be empty",
            path
        )));
    }
    Ok(())
}

fn validate_optional_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.is_null() || value.as_str().is_some() {
        return Ok(());
    }
    Err(config_type_error(path, "string"))
}

fn validate_enum_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    allowed: &[&str],
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(text) = value.as_str() else {
        return Err(config_type_error(path, "string"));
    };
    if allowed.contains(&text) {
        return Ok(());
    }
    Err(ApiError::BadRequest(format!(
        "Invalid config at '{}': must be one of {}",
        path,
        allowed.join(", ")
    )))
}

fn config_type_error(path: &str, expected: &str) -> ApiError {
    ApiError::BadRequest(format!(
        "Invalid config at '{}': expected {}",
        path, expected
    ))
}
