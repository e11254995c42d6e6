use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;

pub mod check;

/// One logical JSON-RPC request. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: String,
    /// Params template, merged into the JSON-RPC envelope as-is. Must be an object.
    pub params: serde_json::Value,
    /// Extra headers applied on top of the harness defaults.
    pub headers: HashMap<String, String>,
    /// Per-request timeout override. Falls back to the global timeout.
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            params,
            headers: HashMap::new(),
            timeout: None,
        }
    }
}

/// How the next RequestSpec is picked for each dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    UniformRandom,
    RoundRobin,
}

impl SelectionPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "uniform-random" | "random" => Some(Self::UniformRandom),
            "round-robin" => Some(Self::RoundRobin),
            _ => None,
        }
    }
}

/// A non-empty sequence of request specs plus a selection policy.
///
/// `next()` is safe to call from any number of workers; the round-robin
/// cursor is the only internal state.
pub struct Workload {
    specs: Vec<Arc<RequestSpec>>,
    policy: SelectionPolicy,
    cursor: AtomicUsize,
}

impl Workload {
    pub fn new(specs: Vec<RequestSpec>, policy: SelectionPolicy) -> Result<Self> {
        if specs.is_empty() {
            anyhow::bail!("workload must contain at least one request");
        }
        for spec in &specs {
            if !spec.params.is_object() {
                anyhow::bail!("params for method '{}' must be a JSON object", spec.method);
            }
        }
        Ok(Self {
            specs: specs.into_iter().map(Arc::new).collect(),
            policy,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Pick the spec for the next dispatch according to the selection policy.
    pub fn next(&self) -> Arc<RequestSpec> {
        let idx = match self.policy {
            SelectionPolicy::UniformRandom => rand::thread_rng().gen_range(0..self.specs.len()),
            SelectionPolicy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % self.specs.len()
            }
        };
        self.specs[idx].clone()
    }
}
