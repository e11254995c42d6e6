use std::fs;
use std::path::Path;

use anyhow::Result;

const DEFAULT_CONFIG: &str = r#"# Barrage scenario
# Run with: barrage run barrage.yaml

base_url: http://localhost:8000
timeout: 30000
api_key: secret

scenarios:
  rpc_rate:
    executor: constant-arrival-rate
    rate: 200
    time_unit: 1s
    duration: 5m
    workers: 100
    max_workers: 500

workload:
  selection: uniform-random
  requests:
    - method: system.ping
      params: {}

checks:
  - name: status is 200
    status: 200
  - name: jsonrpc version ok
    path: jsonrpc
    equals: "2.0"
  - name: has id
    path: id
    exists: true
  - name: pong is true
    path: result.pong
    equals: true

# Threshold expressions need spaces: "<stat> <op> <value>"
criteria:
  http_req_failed:
    - "rate < 0.01"
  http_req_duration:
    - "p95 < 200"
    - "p99 < 500"
"#;

/// Write a starter scenario config.
pub fn run_init(output: Option<&Path>) -> Result<()> {
    let path = output.unwrap_or(Path::new("barrage.yaml"));

    if path.exists() {
        anyhow::bail!(
            "File already exists: {:?}. Remove it first or choose a different output path.",
            path
        );
    }

    fs::write(path, DEFAULT_CONFIG)?;
    println!("Created {}", path.display());
    println!("Next: barrage run {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::Config;
    use crate::engine::RunPlan;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_resolves_to_a_plan() {
        let config: Config = serde_yaml::from_str(DEFAULT_CONFIG).unwrap();
        let plan = RunPlan::from_config(&config).unwrap();
        assert_eq!(plan.scenarios.len(), 1);
        assert_eq!(plan.checks.len(), 4);
        assert_eq!(plan.workload.len(), 1);
    }

    #[test]
    fn test_init_writes_starter_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("barrage.yaml");
        run_init(Some(&path)).unwrap();
        assert!(path.exists());

        // Refuses to clobber an existing file
        assert!(run_init(Some(&path)).is_err());
    }
}
