use crate::matrix::ClampPolicy;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key} must be a boolean (true/false/1/0), got {value:?}")]
    InvalidBool { key: &'static str, value: String },
    #[error("{key} must not be empty")]
    Empty { key: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub log_filter: String,
    pub log_json: bool,
    pub workspace: Option<PathBuf>,
    pub clamp_policy: ClampPolicy,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let log_filter = match vars.get("RAPORTD_LOG") {
            None => DEFAULT_LOG_FILTER.to_string(),
            Some(v) if v.trim().is_empty() => return Err(ConfigError::Empty { key: "RAPORTD_LOG" }),
            Some(v) => v.trim().to_string(),
        };
        let log_json = parse_bool(vars, "RAPORTD_LOG_JSON", false)?;
        let workspace = vars
            .get("RAPORTD_WORKSPACE")
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let clamp_policy = if parse_bool(vars, "RAPORTD_CLAMP_SCORES", false)? {
            ClampPolicy::Clamp
        } else {
            ClampPolicy::Reject
        };

        Ok(Self {
            log_filter,
            log_json,
            workspace,
            clamp_policy,
        })
    }
}

fn parse_bool(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = vars.get(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key,
            value: raw.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_without_env() {
        let s = Settings::from_map(&HashMap::new()).expect("settings");
        assert_eq!(s.log_filter, "info");
        assert!(!s.log_json);
        assert_eq!(s.workspace, None);
        assert_eq!(s.clamp_policy, ClampPolicy::Reject);
    }

    #[test]
    fn reads_overrides() {
        let s = Settings::from_map(&vars(&[
            ("RAPORTD_LOG", "raportd=debug"),
            ("RAPORTD_LOG_JSON", "TRUE"),
            ("RAPORTD_WORKSPACE", " /tmp/ws "),
            ("RAPORTD_CLAMP_SCORES", "1"),
        ]))
        .expect("settings");
        assert_eq!(s.log_filter, "raportd=debug");
        assert!(s.log_json);
        assert_eq!(s.workspace, Some(PathBuf::from("/tmp/ws")));
        assert_eq!(s.clamp_policy, ClampPolicy::Clamp);
    }

    #[test]
    fn rejects_garbage_bool() {
        let e = Settings::from_map(&vars(&[("RAPORTD_LOG_JSON", "maybe")])).unwrap_err();
        assert_eq!(
            e,
            ConfigError::InvalidBool {
                key: "RAPORTD_LOG_JSON",
                value: "maybe".to_string()
            }
        );
        assert!(Settings::from_map(&vars(&[("RAPORTD_LOG", " ")])).is_err());
    }
}
