use std::collections::HashMap;
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workload::check::CheckSet;

// Latency histograms track microseconds, up to one hour, 2 significant digits
const HIST_MAX_MICROS: u64 = 60 * 60 * 1000 * 1000;

/// Per-request error taxonomy. Non-2xx statuses are not errors at this
/// layer; they are recorded and counted by the aggregator's failure tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RequestError {
    /// Connection refused, reset, or otherwise failed before a response
    #[error("transport")]
    Transport,
    /// The per-request timeout elapsed
    #[error("timeout")]
    Timeout,
    /// A response arrived but its body was not valid JSON
    #[error("protocol")]
    Protocol,
}

/// The record of one dispatched request. Exactly one of success /
/// transport / timeout holds; a protocol error coexists with the received
/// status code. Owned by the aggregator once emitted.
#[derive(Debug, Clone)]
pub struct RequestResult {
    pub request_id: u64,
    pub method: String,
    pub duration: Duration,
    /// HTTP status, 0 when no response was received
    pub status: u16,
    pub body: Option<serde_json::Value>,
    pub error: Option<RequestError>,
}

impl RequestResult {
    /// Whether this result counts toward the failure tally: any captured
    /// error, or a response outside the 2xx range.
    pub fn failed(&self) -> bool {
        self.error.is_some() || !(200..300).contains(&self.status)
    }
}

/// Messages flowing from the dispatch side to the aggregation thread.
#[derive(Debug, Clone)]
pub enum Metric {
    Result(RequestResult),
    /// Lag between a scheduled dispatch instant and its actual start
    /// (backpressure under constant-arrival-rate saturation).
    ArrivalDelay { delay: Duration },
}

struct MethodStats {
    total_requests: usize,
    error_count: usize,
    total_duration: Duration,
    histogram: Histogram<u64>,
}

impl MethodStats {
    fn new() -> Self {
        Self {
            total_requests: 0,
            error_count: 0,
            total_duration: Duration::ZERO,
            histogram: Histogram::<u64>::new_with_bounds(1, HIST_MAX_MICROS, 2).unwrap(),
        }
    }
}

impl Default for MethodStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds RequestResults into running tallies. Single-writer: one
/// aggregation thread receives metrics over a channel and calls `add`;
/// nothing else mutates the state. Aggregation is order-independent, so
/// out-of-dispatch-order completion is fine.
pub struct StatsAggregator {
    checks: CheckSet,
    total_requests: usize,
    failed_requests: usize,
    total_duration: Duration,
    min_duration: Option<Duration>,
    max_duration: Duration,
    histogram: Histogram<u64>,
    status_codes: HashMap<u16, usize>,
    errors: HashMap<String, usize>,
    /// check name -> (total, passes)
    check_tallies: HashMap<String, (usize, usize)>,
    methods: HashMap<String, MethodStats>,
    arrival_delays: Histogram<u64>,
}

impl StatsAggregator {
    pub fn new(checks: CheckSet) -> Self {
        Self {
            checks,
            total_requests: 0,
            failed_requests: 0,
            total_duration: Duration::ZERO,
            min_duration: None,
            max_duration: Duration::ZERO,
            histogram: Histogram::<u64>::new_with_bounds(1, HIST_MAX_MICROS, 2).unwrap(),
            status_codes: HashMap::new(),
            errors: HashMap::new(),
            check_tallies: HashMap::new(),
            methods: HashMap::new(),
            arrival_delays: Histogram::<u64>::new_with_bounds(1, HIST_MAX_MICROS, 2).unwrap(),
        }
    }

    pub fn total_requests(&self) -> usize {
        self.total_requests
    }

    pub fn add(&mut self, metric: Metric) {
        match metric {
            Metric::Result(result) => self.add_result(result),
            Metric::ArrivalDelay { delay } => {
                let micros = delay.as_micros() as u64;
                let _ = self.arrival_delays.record(micros.max(1));
            }
        }
    }

    fn add_result(&mut self, result: RequestResult) {
        self.total_requests += 1;
        self.total_duration += result.duration;

        if self.min_duration.is_none_or(|min| result.duration < min) {
            self.min_duration = Some(result.duration);
        }
        if result.duration > self.max_duration {
            self.max_duration = result.duration;
        }

        let micros = result.duration.as_micros() as u64;
        let _ = self.histogram.record(micros.max(1));

        *self.status_codes.entry(result.status).or_insert(0) += 1;

        if let Some(err) = &result.error {
            *self.errors.entry(err.to_string()).or_insert(0) += 1;
        }
        if result.failed() {
            self.failed_requests += 1;
        }

        let method_stats = self.methods.entry(result.method.clone()).or_default();
        method_stats.total_requests += 1;
        method_stats.total_duration += result.duration;
        let _ = method_stats.histogram.record(micros.max(1));
        if result.failed() {
            method_stats.error_count += 1;
        }

        // All checks run on every result, none short-circuits
        for outcome in self.checks.evaluate(&result) {
            let entry = self.check_tallies.entry(outcome.name).or_insert((0, 0));
            entry.0 += 1;
            if outcome.passed {
                entry.1 += 1;
            }
        }
    }

    /// Render the final report and evaluate the configured thresholds.
    /// With zero recorded results every threshold is vacuously passed and
    /// the report is flagged as having no data.
    pub fn finalize(&self, criteria: &HashMap<String, Vec<String>>) -> ReportStats {
        let no_data = self.total_requests == 0;

        let avg_latency_ms = if no_data {
            0.0
        } else {
            self.total_duration.as_micros() as f64 / 1000.0 / self.total_requests as f64
        };
        let failure_rate = if no_data {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        };

        let methods = self
            .methods
            .iter()
            .map(|(name, stats)| {
                let avg = if stats.total_requests > 0 {
                    stats.total_duration.as_micros() as f64 / 1000.0 / stats.total_requests as f64
                } else {
                    0.0
                };
                (
                    name.clone(),
                    MethodReport {
                        total_requests: stats.total_requests,
                        error_count: stats.error_count,
                        avg_latency_ms: avg,
                        p95_latency_ms: stats.histogram.value_at_quantile(0.95) as f64 / 1000.0,
                        p99_latency_ms: stats.histogram.value_at_quantile(0.99) as f64 / 1000.0,
                    },
                )
            })
            .collect();

        let checks = self
            .check_tallies
            .iter()
            .map(|(name, (total, passes))| {
                let rate = if *total > 0 {
                    *passes as f64 / *total as f64
                } else {
                    0.0
                };
                (
                    name.clone(),
                    CheckReport {
                        total: *total,
                        passes: *passes,
                        rate,
                    },
                )
            })
            .collect();

        let arrival_delay = if self.arrival_delays.is_empty() {
            None
        } else {
            Some(ArrivalDelayReport {
                count: self.arrival_delays.len(),
                avg_ms: self.arrival_delays.mean() / 1000.0,
                p95_ms: self.arrival_delays.value_at_quantile(0.95) as f64 / 1000.0,
                max_ms: self.arrival_delays.max() as f64 / 1000.0,
            })
        };

        let mut thresholds = Vec::new();
        for (metric, exprs) in criteria {
            for expr in exprs {
                thresholds.push(self.evaluate_threshold(metric, expr, no_data));
            }
        }
        thresholds.sort_by(|a, b| (&a.metric, &a.expr).cmp(&(&b.metric, &b.expr)));

        ReportStats {
            no_data,
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            failure_rate,
            avg_latency_ms,
            min_latency_ms: self.min_duration.unwrap_or_default().as_millis(),
            max_latency_ms: self.max_duration.as_millis(),
            p50_latency_ms: self.histogram.value_at_quantile(0.5) as f64 / 1000.0,
            p90_latency_ms: self.histogram.value_at_quantile(0.9) as f64 / 1000.0,
            p95_latency_ms: self.histogram.value_at_quantile(0.95) as f64 / 1000.0,
            p99_latency_ms: self.histogram.value_at_quantile(0.99) as f64 / 1000.0,
            status_codes: self.status_codes.clone(),
            errors: self.errors.clone(),
            checks,
            methods,
            arrival_delay,
            thresholds,
        }
    }

    fn evaluate_threshold(&self, metric: &str, expr: &str, no_data: bool) -> ThresholdVerdict {
        let Some((stat, op, value)) = parse_threshold(expr) else {
            tracing::warn!(metric, expr, "invalid threshold expression, marking failed");
            return ThresholdVerdict {
                metric: metric.to_string(),
                expr: expr.to_string(),
                actual: 0.0,
                passed: false,
            };
        };

        // No data: nothing to divide, thresholds pass vacuously
        if no_data {
            return ThresholdVerdict {
                metric: metric.to_string(),
                expr: expr.to_string(),
                actual: 0.0,
                passed: true,
            };
        }

        let actual = self.metric_value(metric, &stat);
        let passed = match actual {
            Some(actual) => compare(actual, &op, value),
            None => {
                tracing::warn!(metric, stat, "unknown threshold metric, passing vacuously");
                true
            }
        };
        ThresholdVerdict {
            metric: metric.to_string(),
            expr: expr.to_string(),
            actual: actual.unwrap_or(0.0),
            passed,
        }
    }

    fn metric_value(&self, metric: &str, stat: &str) -> Option<f64> {
        match metric {
            "http_req_duration" => {
                let quantile = |q: f64| self.histogram.value_at_quantile(q) as f64 / 1000.0;
                match stat {
                    "p50" => Some(quantile(0.5)),
                    "p90" => Some(quantile(0.9)),
                    "p95" => Some(quantile(0.95)),
                    "p99" => Some(quantile(0.99)),
                    "avg" => Some(
                        self.total_duration.as_micros() as f64
                            / 1000.0
                            / self.total_requests.max(1) as f64,
                    ),
                    "min" => Some(self.min_duration.unwrap_or_default().as_micros() as f64 / 1000.0),
                    "max" => Some(self.max_duration.as_micros() as f64 / 1000.0),
                    _ => None,
                }
            }
            "http_req_failed" => match stat {
                "rate" => Some(self.failed_requests as f64 / self.total_requests.max(1) as f64),
                "count" => Some(self.failed_requests as f64),
                _ => None,
            },
            "arrival_delay" => {
                let quantile = |q: f64| self.arrival_delays.value_at_quantile(q) as f64 / 1000.0;
                match stat {
                    "p50" => Some(quantile(0.5)),
                    "p90" => Some(quantile(0.9)),
                    "p95" => Some(quantile(0.95)),
                    "p99" => Some(quantile(0.99)),
                    "avg" => Some(self.arrival_delays.mean() / 1000.0),
                    "max" => Some(self.arrival_delays.max() as f64 / 1000.0),
                    "count" => Some(self.arrival_delays.len() as f64),
                    _ => None,
                }
            }
            _ => {
                let name = metric.strip_prefix("checks.")?;
                let (total, passes) = self.check_tallies.get(name)?;
                match stat {
                    "rate" => Some(*passes as f64 / (*total).max(1) as f64),
                    "count" => Some(*total as f64),
                    _ => None,
                }
            }
        }
    }
}

/// Parse a threshold expression such as "p95 < 200" or "rate < 0.01".
/// Format is "<stat> <op> <value>" with spaces.
pub fn parse_threshold(expr: &str) -> Option<(String, String, f64)> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() != 3 {
        return None;
    }
    let op = parts[1];
    if !matches!(op, "<" | "<=" | ">" | ">=" | "==") {
        return None;
    }
    let value: f64 = parts[2].parse().ok()?;
    Some((parts[0].to_string(), op.to_string(), value))
}

fn compare(actual: f64, op: &str, value: f64) -> bool {
    match op {
        "<" => actual < value,
        "<=" => actual <= value,
        ">" => actual > value,
        ">=" => actual >= value,
        "==" => actual == value,
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub total: usize,
    pub passes: usize,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodReport {
    pub total_requests: usize,
    pub error_count: usize,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrivalDelayReport {
    pub count: u64,
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdVerdict {
    pub metric: String,
    pub expr: String,
    pub actual: f64,
    pub passed: bool,
}

/// The final run report: aggregate counts, latency percentiles, per-check
/// pass rates, and threshold verdicts. Created once at run end.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportStats {
    pub no_data: bool,
    pub total_requests: usize,
    pub failed_requests: usize,
    pub failure_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u128,
    pub max_latency_ms: u128,
    pub p50_latency_ms: f64,
    pub p90_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub status_codes: HashMap<u16, usize>,
    pub errors: HashMap<String, usize>,
    pub checks: HashMap<String, CheckReport>,
    pub methods: HashMap<String, MethodReport>,
    pub arrival_delay: Option<ArrivalDelayReport>,
    pub thresholds: Vec<ThresholdVerdict>,
}

impl ReportStats {
    /// The run passes when every configured threshold holds.
    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn print(&self) {
        println!("\n--- Run Summary ---");

        if self.no_data {
            println!("No metrics collected (no data).");
            println!("-------------------\n");
            return;
        }

        println!("Total Requests: {}", self.total_requests);
        println!(
            "Failed:         {} ({:.2}%)",
            self.failed_requests,
            self.failure_rate * 100.0
        );
        println!("Avg Latency:    {:.2} ms", self.avg_latency_ms);
        println!("Min Latency:    {} ms", self.min_latency_ms);
        println!("Max Latency:    {} ms", self.max_latency_ms);
        println!("P50 Latency:    {:.2} ms", self.p50_latency_ms);
        println!("P90 Latency:    {:.2} ms", self.p90_latency_ms);
        println!("P95 Latency:    {:.2} ms", self.p95_latency_ms);
        println!("P99 Latency:    {:.2} ms", self.p99_latency_ms);

        println!("\nStatus Codes:");
        let mut codes: Vec<_> = self.status_codes.iter().collect();
        codes.sort_by_key(|a| a.0);
        for (code, count) in codes {
            println!("  {}: {}", code, count);
        }

        if !self.errors.is_empty() {
            println!("\nErrors:");
            let mut errors: Vec<_> = self.errors.iter().collect();
            errors.sort_by_key(|a| a.0);
            for (err, count) in errors {
                println!("  {}: {}", err, count);
            }
        }

        if !self.methods.is_empty() {
            println!("\nMethods:");
            let mut methods: Vec<_> = self.methods.iter().collect();
            methods.sort_by_key(|a| a.0);
            for (name, stats) in methods {
                println!("  {}", name);
                println!("    Count: {}", stats.total_requests);
                println!("    P95:   {:.2} ms", stats.p95_latency_ms);
                if stats.error_count > 0 {
                    println!("    Errors: {}", stats.error_count);
                }
            }
        }

        if !self.checks.is_empty() {
            println!("\nChecks:");
            let mut checks: Vec<_> = self.checks.iter().collect();
            checks.sort_by_key(|a| a.0);
            for (name, report) in checks {
                let fails = report.total - report.passes;
                if fails > 0 {
                    println!(
                        "  ✗ {} : {:.2}% ({} passed, {} failed)",
                        name,
                        report.rate * 100.0,
                        report.passes,
                        fails
                    );
                } else {
                    println!("  ✓ {} : 100% ({} passed)", name, report.passes);
                }
            }
        }

        if let Some(delay) = &self.arrival_delay {
            println!("\nArrival Delay:");
            println!("  Count: {}", delay.count);
            println!("  Avg:   {:.2} ms", delay.avg_ms);
            println!("  P95:   {:.2} ms", delay.p95_ms);
            println!("  Max:   {:.2} ms", delay.max_ms);
        }

        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for verdict in &self.thresholds {
                let mark = if verdict.passed { "✓" } else { "✗" };
                println!(
                    "  {} {} {} (actual: {:.4})",
                    mark, verdict.metric, verdict.expr, verdict.actual
                );
            }
        }

        println!("-------------------\n");
    }
}
