//! Filesystem capability handlers
//!
//! Services `fs/read_text_file` and `fs/write_text_file` requests from the
//! agent. Paths must be absolute; relative paths are rejected before any
//! filesystem access happens.

use std::path::Path;

use serde_json::{json, Value};
use tracing::debug;

use super::protocol::{codes, RpcError};

fn require_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, RpcError> {
    match params.get(name) {
        None => Err(RpcError::invalid_params(format!(
            "Missing required parameter '{name}'"
        ))),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(RpcError::new(
            codes::WRONG_TYPE,
            format!("Parameter '{name}' must be a string"),
        )),
    }
}

fn require_path(params: &Value) -> Result<&str, RpcError> {
    let path = require_str(params, "path")?;
    if !Path::new(path).is_absolute() {
        return Err(RpcError::invalid_params(format!(
            "Path must be absolute: '{path}'"
        )));
    }
    Ok(path)
}

fn io_error(path: &str, err: &std::io::Error) -> RpcError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            RpcError::new(codes::NOT_FOUND, format!("File not found: {path}"))
        }
        std::io::ErrorKind::PermissionDenied => RpcError::new(
            codes::PERMISSION_DENIED,
            format!("Permission denied: {path}"),
        ),
        _ => RpcError::new(codes::INTERNAL_ERROR, format!("I/O error on {path}: {err}")),
    }
}

/// Handle `fs/read_text_file`: return `{"content": ...}`, optionally
/// windowed by a 1-based `line` offset and a `limit` line count.
pub async fn read_text_file(params: Value) -> Result<Value, RpcError> {
    let path = require_path(&params)?;
    debug!("Agent reading {path}");

    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_error(path, &e))?;
    if !meta.is_file() {
        return Err(RpcError::new(
            codes::WRONG_TYPE,
            format!("Not a regular file: {path}"),
        ));
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| io_error(path, &e))?;
    let content = String::from_utf8(bytes).map_err(|_| {
        RpcError::new(
            codes::ENCODING_ERROR,
            format!("File is not valid UTF-8: {path}"),
        )
    })?;

    let line = params.get("line").and_then(Value::as_u64);
    let limit = params.get("limit").and_then(Value::as_u64);
    let content = match (line, limit) {
        (None, None) => content,
        (line, limit) => {
            let skip = line.map_or(0, |l| l.saturating_sub(1)) as usize;
            let take = limit.map_or(usize::MAX, |l| l as usize);
            content
                .lines()
                .skip(skip)
                .take(take)
                .collect::<Vec<_>>()
                .join("\n")
        }
    };

    Ok(json!({"content": content}))
}

/// Handle `fs/write_text_file`: write `content` to `path`, creating parent
/// directories as needed.
pub async fn write_text_file(params: Value) -> Result<Value, RpcError> {
    let path = require_path(&params)?;
    let content = require_str(&params, "content")?;
    debug!("Agent writing {} bytes to {path}", content.len());

    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(path, &e))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| io_error(path, &e))?;

    Ok(json!({"success": true}))
}
