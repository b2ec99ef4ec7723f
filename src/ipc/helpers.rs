use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

/// Trimmed string param; empty strings read as absent.
pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_f64() {
            Some(n) if n.is_finite() => Ok(Some(n)),
            _ => Err(err(
                &req.id,
                "bad_params",
                format!("{} must be a number", key),
                Some(json!({ "param": key, "value": v })),
            )),
        },
    }
}

pub fn term_param(req: &Request) -> Result<i64, serde_json::Value> {
    match req.params.get("term").and_then(|v| v.as_i64()) {
        Some(t) if t >= 1 => Ok(t),
        Some(t) => Err(err(
            &req.id,
            "bad_params",
            "term must be >= 1",
            Some(json!({ "term": t })),
        )),
        None => Err(err(&req.id, "bad_params", "missing term", None)),
    }
}
