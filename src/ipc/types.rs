use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::ctt::AnalysisReport;
use crate::matrix::ClampPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Last report computed for an analysis, keyed by the snapshot fingerprint.
#[derive(Debug, Clone)]
pub struct CachedReport {
    pub fingerprint: String,
    pub report: AnalysisReport,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub clamp_policy: ClampPolicy,
    pub analysis_cache: HashMap<String, CachedReport>,
}

impl AppState {
    pub fn new(clamp_policy: ClampPolicy) -> Self {
        Self {
            workspace: None,
            db: None,
            clamp_policy,
            analysis_cache: HashMap::new(),
        }
    }
}
