use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;

use crate::cli::config::{Config, ScenarioConfig};
use crate::stats::{Metric, ReportStats, StatsAggregator};
use crate::utils::parse_duration_str;
use crate::workload::check::{Check, CheckSet};
use crate::workload::{RequestSpec, SelectionPolicy, Workload};

pub mod executor;
pub mod http_client;
pub mod scheduler;

use executor::Executor;
use http_client::HttpClient;
use scheduler::ScheduleConfig;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_API_KEY: &str = "secret";
pub const DEFAULT_RPC_PATH: &str = "/rpc";

/// Everything a run needs, resolved and validated up front. Immutable once
/// constructed; configuration errors are fatal here, before any request is
/// issued.
pub struct RunPlan {
    pub base_url: String,
    pub rpc_path: String,
    pub api_key: String,
    pub timeout: Duration,
    pub scenarios: Vec<(String, ScheduleConfig)>,
    pub workload: Workload,
    pub checks: CheckSet,
    pub criteria: HashMap<String, Vec<String>>,
}

impl RunPlan {
    pub fn from_config(config: &Config) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let rpc_path = config
            .rpc_path
            .clone()
            .unwrap_or_else(|| DEFAULT_RPC_PATH.to_string());
        let api_key = config
            .api_key
            .clone()
            .unwrap_or_else(|| DEFAULT_API_KEY.to_string());
        let timeout = Duration::from_millis(config.timeout.unwrap_or(DEFAULT_TIMEOUT_MS));
        if timeout.is_zero() {
            anyhow::bail!("timeout must be greater than zero");
        }

        let mut scenarios = Vec::new();
        if let Some(map) = &config.scenarios {
            if map.is_empty() {
                anyhow::bail!("scenarios map must not be empty");
            }
            let mut names: Vec<_> = map.keys().cloned().collect();
            names.sort();
            for name in names {
                let schedule = build_schedule(&name, &map[&name])?;
                scenarios.push((name, schedule));
            }
        } else {
            let schedule = build_schedule("default", &config.top_level_scenario())?;
            scenarios.push(("default".to_string(), schedule));
        }

        let workload_config = config
            .workload
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("config needs a workload section"))?;
        let policy = match &workload_config.selection {
            None => SelectionPolicy::UniformRandom,
            Some(s) => SelectionPolicy::from_str(s).ok_or_else(|| {
                anyhow::anyhow!(
                    "unknown selection policy '{}' (expected uniform-random or round-robin)",
                    s
                )
            })?,
        };
        let specs = workload_config
            .requests
            .iter()
            .map(|r| {
                let timeout = match &r.timeout {
                    None => None,
                    Some(s) => Some(parse_duration_str(s).ok_or_else(|| {
                        anyhow::anyhow!("invalid timeout '{}' for method '{}'", s, r.method)
                    })?),
                };
                Ok(RequestSpec {
                    method: r.method.clone(),
                    params: r.params.clone().unwrap_or_else(|| serde_json::json!({})),
                    headers: r.headers.clone().unwrap_or_default(),
                    timeout,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let workload = Workload::new(specs, policy)?;

        let checks = match &config.checks {
            // Baseline mirrors the standard JSON-RPC response contract
            None => CheckSet::new(vec![
                Check::status("status is 200", 200),
                Check::json_equals("jsonrpc version ok", "jsonrpc", serde_json::json!("2.0")),
                Check::json_exists("has id", "id"),
            ]),
            Some(list) => {
                let compiled = list
                    .iter()
                    .map(|c| c.compile())
                    .collect::<Result<Vec<_>>>()?;
                CheckSet::new(compiled)
            }
        };

        let criteria = config.criteria.clone().unwrap_or_default();
        for (metric, exprs) in &criteria {
            validate_criteria_metric(metric, &checks)?;
            for expr in exprs {
                if crate::stats::parse_threshold(expr).is_none() {
                    anyhow::bail!(
                        "invalid threshold '{}' for metric '{}' (expected e.g. \"p95 < 200\", spaces required)",
                        expr,
                        metric
                    );
                }
            }
        }

        Ok(Self {
            base_url,
            rpc_path,
            api_key,
            timeout,
            scenarios,
            workload,
            checks,
            criteria,
        })
    }

    /// Sum of the in-flight ceilings across scenarios; sizes the runtime,
    /// the connection pool, and the metrics channel.
    pub fn total_workers(&self) -> usize {
        self.scenarios
            .iter()
            .map(|(_, s)| s.worker_ceiling())
            .sum::<usize>()
            .max(1)
    }
}

fn build_schedule(name: &str, sc: &ScenarioConfig) -> Result<ScheduleConfig> {
    let parse = |field: &str, value: &str| {
        parse_duration_str(value).ok_or_else(|| {
            anyhow::anyhow!("scenario '{}': invalid {} '{}'", name, field, value)
        })
    };
    let duration = parse("duration", sc.duration.as_deref().unwrap_or("10s"))?;

    let executor = sc.executor.as_deref().unwrap_or("constant-vus");
    let schedule = match executor {
        "constant-arrival-rate" => {
            let rate = sc.rate.ok_or_else(|| {
                anyhow::anyhow!("scenario '{}': constant-arrival-rate requires a rate", name)
            })?;
            let time_unit = parse("time_unit", sc.time_unit.as_deref().unwrap_or("1s"))?;
            let workers = sc.workers.unwrap_or(100);
            let max_workers = sc.max_workers.unwrap_or(workers.max(1));
            ScheduleConfig::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                workers,
                max_workers,
            }
        }
        "constant-vus" | "fixed-concurrency" => {
            let pause = match sc.pause.as_deref() {
                None => Duration::ZERO,
                Some(s) => parse("pause", s)?,
            };
            ScheduleConfig::FixedConcurrency {
                workers: sc.workers.unwrap_or(1),
                duration,
                pause,
            }
        }
        other => anyhow::bail!(
            "scenario '{}': unknown executor '{}' (expected constant-arrival-rate or constant-vus)",
            name,
            other
        ),
    };
    schedule
        .validate()
        .map_err(|e| anyhow::anyhow!("scenario '{}': {}", name, e))?;
    Ok(schedule)
}

fn validate_criteria_metric(metric: &str, checks: &CheckSet) -> Result<()> {
    match metric {
        "http_req_duration" | "http_req_failed" | "arrival_delay" => Ok(()),
        _ => {
            if let Some(name) = metric.strip_prefix("checks.") {
                if checks.names().any(|n| n == name) {
                    return Ok(());
                }
                anyhow::bail!("threshold references unknown check '{}'", name);
            }
            anyhow::bail!(
                "unknown threshold metric '{}' (expected http_req_duration, http_req_failed, arrival_delay, or checks.<name>)",
                metric
            );
        }
    }
}

pub struct Engine;

impl Engine {
    pub fn new() -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        Ok(Self)
    }

    /// Run every scenario in the plan to completion and produce the final
    /// report. Results stream over a bounded channel to a dedicated
    /// aggregation thread (single-writer); workers share nothing else.
    pub fn run_load_test(
        &self,
        plan: RunPlan,
        json_output: bool,
        export_json: Option<PathBuf>,
    ) -> Result<ReportStats> {
        let total_workers = plan.total_workers();
        let RunPlan {
            base_url,
            rpc_path,
            api_key,
            timeout,
            scenarios,
            workload,
            checks,
            criteria,
        } = plan;

        // Bounded channel: under extreme load, producers block briefly
        // instead of buffering without limit
        let channel_size = (total_workers * 10).clamp(1024, 100_000);
        let (tx, rx) = crossbeam_channel::bounded::<Metric>(channel_size);

        let agg_handle = std::thread::spawn(move || {
            let mut aggregator = StatsAggregator::new(checks);
            while let Ok(metric) = rx.recv() {
                aggregator.add(metric);
            }
            aggregator
        });

        let base_parallelism = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(8);
        let worker_threads = if total_workers > 1000 {
            (total_workers / 50).max(base_parallelism).min(64)
        } else {
            base_parallelism.max(4)
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .enable_all()
            .build()?;

        // Scale the connection pool with the worker ceiling, ~1 idle
        // connection per 5 workers
        let pool_size = (total_workers / 5).clamp(32, 2000);
        let client = {
            let _guard = runtime.enter();
            HttpClient::with_pool_size(pool_size)
        };
        let executor = Arc::new(Executor::new(
            client, &base_url, &rpc_path, api_key, timeout,
        )?);
        let workload = Arc::new(workload);

        let run_start = std::time::Instant::now();
        runtime.block_on(async {
            let mut running = JoinSet::new();
            for (name, schedule) in scenarios {
                tracing::info!(scenario = %name, "starting scenario");
                running.spawn(scheduler::run(
                    schedule,
                    executor.clone(),
                    workload.clone(),
                    tx.clone(),
                ));
            }
            while running.join_next().await.is_some() {}
        });
        tracing::info!(elapsed = ?run_start.elapsed(), "all scenarios complete");

        // Closing the channel lets the aggregation thread drain and return
        drop(tx);
        let aggregator = agg_handle
            .join()
            .map_err(|_| anyhow::anyhow!("aggregator thread panicked"))?;
        let report = aggregator.finalize(&criteria);

        if json_output {
            println!("{}", report.to_json());
        } else {
            report.print();
        }
        if let Some(path) = export_json {
            std::fs::write(path, report.to_json())?;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};

    const PONG_BODY: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"pong":true}}"#;

    fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Minimal keep-alive HTTP/1.1 fixture: answers every request on every
    /// connection with the same canned response.
    fn spawn_server(status_line: &'static str, body: &'static str) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                std::thread::spawn(move || serve_connection(stream, status_line, body));
            }
        });
        format!("http://{}", addr)
    }

    fn serve_connection(mut stream: std::net::TcpStream, status_line: &str, body: &str) {
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let header_end = loop {
                if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                    break pos + 4;
                }
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            };
            let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < header_end + content_length {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            buf.drain(..header_end + content_length);

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            if stream.write_all(response.as_bytes()).is_err() {
                return;
            }
        }
    }

    fn ping_workload() -> Workload {
        Workload::new(
            vec![RequestSpec::new("system.ping", json!({}))],
            SelectionPolicy::RoundRobin,
        )
        .unwrap()
    }

    fn baseline_checks() -> CheckSet {
        CheckSet::new(vec![
            Check::status("status is 200", 200),
            Check::json_equals("jsonrpc version ok", "jsonrpc", json!("2.0")),
            Check::json_exists("has id", "id"),
            Check::json_equals("pong is true", "result.pong", json!(true)),
        ])
    }

    fn plan_for(base_url: String, schedule: ScheduleConfig) -> RunPlan {
        let mut criteria = HashMap::new();
        criteria.insert(
            "http_req_failed".to_string(),
            vec!["rate < 0.01".to_string()],
        );
        RunPlan {
            base_url,
            rpc_path: "/rpc".to_string(),
            api_key: "secret".to_string(),
            timeout: Duration::from_secs(5),
            scenarios: vec![("test".to_string(), schedule)],
            workload: ping_workload(),
            checks: baseline_checks(),
            criteria,
        }
    }

    #[test]
    fn test_closed_loop_run_passes_on_healthy_responses() {
        let base_url = spawn_server("200 OK", PONG_BODY);
        let plan = plan_for(
            base_url,
            ScheduleConfig::FixedConcurrency {
                workers: 4,
                duration: Duration::from_millis(300),
                pause: Duration::ZERO,
            },
        );
        let report = Engine::new()
            .unwrap()
            .run_load_test(plan, false, None)
            .unwrap();

        assert!(report.total_requests > 0);
        assert_eq!(report.failed_requests, 0);
        assert_eq!(report.failure_rate, 0.0);
        assert!(report.passed());
        assert_eq!(report.checks.get("pong is true").unwrap().rate, 1.0);
        assert_eq!(
            report.status_codes.get(&200),
            Some(&report.total_requests)
        );
    }

    #[test]
    fn test_arrival_rate_dispatches_rate_times_duration() {
        let base_url = spawn_server("200 OK", PONG_BODY);
        let plan = plan_for(
            base_url,
            ScheduleConfig::ConstantArrivalRate {
                rate: 50,
                time_unit: Duration::from_secs(1),
                duration: Duration::from_secs(1),
                workers: 10,
                max_workers: 100,
            },
        );
        let report = Engine::new()
            .unwrap()
            .run_load_test(plan, false, None)
            .unwrap();

        // Queued-not-dropped: every scheduled instant dispatches exactly once
        assert_eq!(report.total_requests, 50);
        assert_eq!(report.arrival_delay.as_ref().unwrap().count, 50);
        assert!(report.passed());
    }

    #[test]
    fn test_non_json_body_records_protocol_errors() {
        let base_url = spawn_server("200 OK", "pong");
        let plan = plan_for(
            base_url,
            ScheduleConfig::FixedConcurrency {
                workers: 2,
                duration: Duration::from_millis(200),
                pause: Duration::ZERO,
            },
        );
        let report = Engine::new()
            .unwrap()
            .run_load_test(plan, false, None)
            .unwrap();

        assert!(report.total_requests > 0);
        assert_eq!(
            report.errors.get("protocol"),
            Some(&report.total_requests)
        );
        // Status check still passes; the JSON field checks all fail
        assert_eq!(report.checks.get("status is 200").unwrap().rate, 1.0);
        assert_eq!(report.checks.get("jsonrpc version ok").unwrap().rate, 0.0);
        assert!(!report.passed());
    }

    #[test]
    fn test_server_errors_fail_the_failure_rate_threshold() {
        let base_url = spawn_server(
            "500 Internal Server Error",
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"boom"}}"#,
        );
        let plan = plan_for(
            base_url,
            ScheduleConfig::FixedConcurrency {
                workers: 2,
                duration: Duration::from_millis(200),
                pause: Duration::ZERO,
            },
        );
        let report = Engine::new()
            .unwrap()
            .run_load_test(plan, false, None)
            .unwrap();

        assert!(report.total_requests > 0);
        assert_eq!(report.failure_rate, 1.0);
        assert_eq!(
            report.status_codes.get(&500),
            Some(&report.total_requests)
        );
        assert!(!report.passed());
    }

    #[test]
    fn test_plan_from_minimal_config() {
        let yaml = r#"
workload:
  requests:
    - method: system.ping
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let plan = RunPlan::from_config(&config).unwrap();
        assert_eq!(plan.base_url, DEFAULT_BASE_URL);
        assert_eq!(plan.timeout, Duration::from_secs(30));
        assert_eq!(plan.scenarios.len(), 1);
        assert_eq!(plan.scenarios[0].0, "default");
        // Baseline checks kick in when none are configured
        assert_eq!(plan.checks.len(), 3);
    }

    #[test]
    fn test_plan_resolves_scenarios_map() {
        let yaml = r#"
scenarios:
  rpc_rate:
    executor: constant-arrival-rate
    rate: 200
    time_unit: 1s
    duration: 5m
    workers: 100
    max_workers: 500
  smoke:
    executor: constant-vus
    workers: 500
    duration: 10m
    pause: 1s
workload:
  selection: round-robin
  requests:
    - method: system.ping
    - method: telegram.send
      params:
        to: "@channel"
        message: "hello"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let plan = RunPlan::from_config(&config).unwrap();
        assert_eq!(plan.scenarios.len(), 2);
        assert_eq!(
            plan.scenarios[0].1,
            ScheduleConfig::ConstantArrivalRate {
                rate: 200,
                time_unit: Duration::from_secs(1),
                duration: Duration::from_secs(300),
                workers: 100,
                max_workers: 500,
            }
        );
        assert_eq!(
            plan.scenarios[1].1,
            ScheduleConfig::FixedConcurrency {
                workers: 500,
                duration: Duration::from_secs(600),
                pause: Duration::from_secs(1),
            }
        );
        assert_eq!(plan.total_workers(), 1000);
    }

    #[test]
    fn test_plan_rejects_missing_workload() {
        let config: Config = serde_yaml::from_str("duration: 10s").unwrap();
        assert!(RunPlan::from_config(&config).is_err());
    }

    #[test]
    fn test_plan_rejects_zero_rate() {
        let yaml = r#"
executor: constant-arrival-rate
rate: 0
duration: 10s
workload:
  requests:
    - method: system.ping
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(RunPlan::from_config(&config).is_err());
    }

    #[test]
    fn test_plan_rejects_unknown_executor() {
        let yaml = r#"
executor: ramping-vus
duration: 10s
workload:
  requests:
    - method: system.ping
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(RunPlan::from_config(&config).is_err());
    }

    #[test]
    fn test_plan_rejects_bad_criteria() {
        let yaml = r#"
workload:
  requests:
    - method: system.ping
criteria:
  http_req_duration:
    - "p95<200"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(RunPlan::from_config(&config).is_err());

        let yaml = r#"
workload:
  requests:
    - method: system.ping
criteria:
  checks.nonexistent:
    - "rate > 0.9"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(RunPlan::from_config(&config).is_err());
    }
}
