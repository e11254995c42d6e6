use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::workload::check::Check;

/// Configuration for a single scenario within multi-scenario runs
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct ScenarioConfig {
    /// Executor type (constant-arrival-rate, constant-vus)
    pub executor: Option<String>,
    /// Target arrivals per time_unit (constant-arrival-rate)
    pub rate: Option<u64>,
    /// Time unit for rate (e.g., "1s")
    #[serde(alias = "timeUnit")]
    pub time_unit: Option<String>,
    /// Duration of the scenario (e.g., "30s", "5m")
    pub duration: Option<String>,
    /// Concurrent workers (constant-vus), or pre-allocated workers
    /// (constant-arrival-rate)
    #[serde(alias = "vus", alias = "preAllocatedVUs")]
    pub workers: Option<usize>,
    /// In-flight ceiling for constant-arrival-rate
    #[serde(alias = "maxVUs")]
    pub max_workers: Option<usize>,
    /// Pause between iterations of a constant-vus worker (default none)
    pub pause: Option<String>,
}

/// One request template in the workload
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct RequestConfig {
    /// JSON-RPC method name
    pub method: String,
    /// Params object merged into the JSON-RPC envelope (default empty)
    pub params: Option<serde_json::Value>,
    /// Extra headers for this request
    pub headers: Option<HashMap<String, String>>,
    /// Per-request timeout override (e.g., "10s")
    pub timeout: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct WorkloadConfig {
    /// Selection policy: uniform-random (default) or round-robin
    pub selection: Option<String>,
    /// Request templates; must not be empty
    pub requests: Vec<RequestConfig>,
}

/// One declarative response check. Exactly one of `status`, `path` +
/// `equals`, or `path` + `exists` must be given.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct CheckConfig {
    pub name: String,
    /// Expected HTTP status code
    pub status: Option<u16>,
    /// Dot-separated JSON path into the response body (e.g., "result.pong")
    pub path: Option<String>,
    /// Expected value at `path`
    pub equals: Option<serde_json::Value>,
    /// Assert that `path` is present
    pub exists: Option<bool>,
}

impl CheckConfig {
    pub fn compile(&self) -> Result<Check> {
        if self.name.trim().is_empty() {
            anyhow::bail!("check name must not be empty");
        }
        match (&self.status, &self.path, &self.equals, self.exists) {
            (Some(code), None, None, None) => Ok(Check::status(&self.name, *code)),
            (None, Some(path), Some(expected), None) => {
                Ok(Check::json_equals(&self.name, path, expected.clone()))
            }
            (None, Some(path), None, Some(true)) => Ok(Check::json_exists(&self.name, path)),
            _ => anyhow::bail!(
                "check '{}' must specify exactly one of: status, path+equals, path+exists",
                self.name
            ),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct Config {
    /// Target base URL (env: BASE_URL, default http://localhost:8000)
    pub base_url: Option<String>,
    /// Global request timeout in milliseconds (env: TIMEOUT, default 30000)
    pub timeout: Option<u64>,
    /// Value of the X-API-KEY header (env: API_KEY)
    pub api_key: Option<String>,
    /// RPC endpoint path (default /rpc)
    pub rpc_path: Option<String>,

    // Single-scenario shorthand; ignored when `scenarios` is present
    /// Executor type (constant-arrival-rate, constant-vus)
    pub executor: Option<String>,
    /// Target arrivals per time_unit
    pub rate: Option<u64>,
    /// Time unit for rate (e.g., "1s")
    #[serde(alias = "timeUnit")]
    pub time_unit: Option<String>,
    /// Duration of the run (e.g., "30s", "5m")
    pub duration: Option<String>,
    /// Concurrent or pre-allocated workers
    #[serde(alias = "vus", alias = "preAllocatedVUs")]
    pub workers: Option<usize>,
    /// In-flight ceiling for constant-arrival-rate
    #[serde(alias = "maxVUs")]
    pub max_workers: Option<usize>,
    /// Pause between iterations of a constant-vus worker
    pub pause: Option<String>,

    /// Multiple scenarios with independent schedules, run concurrently
    pub scenarios: Option<HashMap<String, ScenarioConfig>>,
    /// The requests to issue
    pub workload: Option<WorkloadConfig>,
    /// Response checks; defaults to the JSON-RPC baseline when omitted
    pub checks: Option<Vec<CheckConfig>>,
    /// Pass/fail criteria over aggregate stats (k6: thresholds)
    #[serde(alias = "thresholds")]
    pub criteria: Option<HashMap<String, Vec<String>>>,
}

impl Config {
    /// Load a config file; the extension picks the format (.json is JSON,
    /// everything else parses as YAML).
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path.display(), e))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = if ext == "json" {
            serde_json::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?
        } else {
            serde_yaml::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?
        };
        Ok(config)
    }

    /// Overlay environment variables onto the file config. Env wins over
    /// the file; CLI flags are applied after this and win over both.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from<F: Fn(&str) -> Option<String>>(&mut self, get: F) {
        if let Some(url) = get("BASE_URL") {
            self.base_url = Some(url);
        }
        if let Some(raw) = get("TIMEOUT") {
            match raw.parse::<u64>() {
                Ok(ms) => self.timeout = Some(ms),
                Err(_) => tracing::warn!(value = %raw, "ignoring unparseable TIMEOUT"),
            }
        }
        if let Some(key) = get("API_KEY") {
            self.api_key = Some(key);
        }
    }

    /// The single-scenario shorthand fields viewed as a ScenarioConfig.
    pub fn top_level_scenario(&self) -> ScenarioConfig {
        ScenarioConfig {
            executor: self.executor.clone(),
            rate: self.rate,
            time_unit: self.time_unit.clone(),
            duration: self.duration.clone(),
            workers: self.workers,
            max_workers: self.max_workers,
            pause: self.pause.clone(),
        }
    }
}
