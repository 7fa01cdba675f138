//! Pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Key→value environment handed to every task of a stage.
pub type Env = Map<String, Value>;

/// Environment key holding a spawn deadline in milliseconds.
pub const TIMEOUT_KEY: &str = "timeout";

/// Default namespace under which tasks see the environment.
pub const DEFAULT_ENV_NAMESPACE: &str = "env";

/// Options shared by every stage of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Maximum number of workers a single map or reduce stage keeps busy.
    pub max_workers: usize,
    /// Run tasks on the orchestrator when no worker capability exists.
    pub synchronous: bool,
    /// Base environment; stages layer their own entries on top.
    pub env: Env,
    /// Name under which tasks see the environment.
    pub env_namespace: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            synchronous: true,
            env: Env::new(),
            env_namespace: DEFAULT_ENV_NAMESPACE.to_string(),
        }
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Options {
    /// Defaults overridden by `FANOUT_MAX_WORKERS`, `FANOUT_SYNCHRONOUS`
    /// and `FANOUT_ENV_NAMESPACE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();

        if let Some(raw) = lookup("FANOUT_MAX_WORKERS") {
            options.max_workers = raw.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("FANOUT_MAX_WORKERS is not a number: {}", raw))
            })?;
        }

        if let Some(raw) = lookup("FANOUT_SYNCHRONOUS") {
            options.synchronous = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(Error::InvalidConfig(format!(
                        "FANOUT_SYNCHRONOUS is not a boolean: {}",
                        raw
                    )));
                }
            };
        }

        if let Some(ns) = lookup("FANOUT_ENV_NAMESPACE") {
            options.env_namespace = ns;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn with_env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    pub fn with_env_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.env.insert(key.into(), value);
        self
    }

    pub fn with_env_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.env_namespace = namespace.into();
        self
    }

    /// Reject option values the schedulers cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.env_namespace.is_empty() {
            return Err(Error::InvalidConfig(
                "env_namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Layer a stage environment over the pipeline environment.
    pub fn merged_env(&self, stage_env: Option<Env>) -> Env {
        let mut env = self.env.clone();
        if let Some(stage_env) = stage_env {
            env.extend(stage_env);
        }
        env
    }
}

/// Read the spawn deadline from a merged environment.
///
/// Any positive number of milliseconds, fractional or not, arms a deadline.
/// Zero, negative values and non-numbers mean no deadline.
pub fn stage_timeout(env: &Env) -> Option<Duration> {
    let millis = env.get(TIMEOUT_KEY).and_then(Value::as_f64)?;
    if millis <= 0.0 {
        return None;
    }
    // Saturates for values beyond u64 nanoseconds.
    Some(Duration::from_nanos((millis * 1_000_000.0).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert!(options.max_workers >= 1);
        assert!(options.synchronous);
        assert!(options.env.is_empty());
        assert_eq!(options.env_namespace, "env");
        options.validate().unwrap();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Options::default().with_max_workers(0).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_merge_stage_env_wins() {
        let options = Options::default()
            .with_env_value("a", json!(1))
            .with_env_value("b", json!(2));

        let mut stage = Env::new();
        stage.insert("b".into(), json!(20));
        stage.insert("timeout".into(), json!(100));

        let merged = options.merged_env(Some(stage));
        assert_eq!(merged["a"], json!(1));
        assert_eq!(merged["b"], json!(20));
        assert_eq!(stage_timeout(&merged), Some(Duration::from_millis(100)));

        // The pipeline options are untouched.
        assert_eq!(options.env["b"], json!(2));
        assert!(!options.env.contains_key("timeout"));
    }

    fn timeout_of(value: Value) -> Option<Duration> {
        let mut env = Env::new();
        env.insert(TIMEOUT_KEY.into(), value);
        stage_timeout(&env)
    }

    #[test]
    fn test_non_numeric_timeout_ignored() {
        assert_eq!(timeout_of(json!("soon")), None);
        assert_eq!(timeout_of(json!(null)), None);
        assert_eq!(stage_timeout(&Env::new()), None);
    }

    #[test]
    fn test_zero_timeout_means_none() {
        assert_eq!(timeout_of(json!(0)), None);
        assert_eq!(timeout_of(json!(0.0)), None);
    }

    #[test]
    fn test_negative_timeout_means_none() {
        assert_eq!(timeout_of(json!(-5)), None);
        assert_eq!(timeout_of(json!(-0.5)), None);
    }

    #[test]
    fn test_fractional_timeout() {
        assert_eq!(timeout_of(json!(20.0)), Some(Duration::from_millis(20)));
        assert_eq!(timeout_of(json!(1.5)), Some(Duration::from_micros(1500)));
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn test_lookup_overrides() {
        let options = Options::from_lookup(vars(&[
            ("FANOUT_MAX_WORKERS", " 3 "),
            ("FANOUT_SYNCHRONOUS", "off"),
            ("FANOUT_ENV_NAMESPACE", "globals"),
        ]))
        .unwrap();
        assert_eq!(options.max_workers, 3);
        assert!(!options.synchronous);
        assert_eq!(options.env_namespace, "globals");
    }

    #[test]
    fn test_lookup_without_variables_is_default() {
        assert_eq!(Options::from_lookup(vars(&[])).unwrap(), Options::default());
    }

    #[test]
    fn test_lookup_bad_worker_count() {
        let err = Options::from_lookup(vars(&[("FANOUT_MAX_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("FANOUT_MAX_WORKERS")));
    }

    #[test]
    fn test_lookup_bad_boolean() {
        let err = Options::from_lookup(vars(&[("FANOUT_SYNCHRONOUS", "maybe")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("FANOUT_SYNCHRONOUS")));
    }

    #[test]
    fn test_lookup_zero_workers_fails_validation() {
        let err = Options::from_lookup(vars(&[("FANOUT_MAX_WORKERS", "0")])).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidConfig("max_workers must be at least 1".to_string())
        );
    }

    #[test]
    fn test_lookup_empty_namespace_fails_validation() {
        let err = Options::from_lookup(vars(&[("FANOUT_ENV_NAMESPACE", "")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_from_env_reads_process_environment() {
        // Only checks the wiring; the variables are not set by the test suite.
        let expected = Options::from_lookup(|key| std::env::var(key).ok());
        assert_eq!(Options::from_env(), expected);
    }

    #[test]
    fn test_deserialize_partial() {
        let options: Options =
            serde_json::from_value(json!({"max_workers": 2, "env_namespace": "globals"})).unwrap();
        assert_eq!(options.max_workers, 2);
        assert_eq!(options.env_namespace, "globals");
        assert!(options.synchronous);
    }
}
