use crate::stats::RequestResult;

/// What a single check asserts about a response.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckKind {
    /// HTTP status code equality.
    Status(u16),
    /// JSON field at `path` equals `expected`.
    JsonEquals {
        path: String,
        expected: serde_json::Value,
    },
    /// JSON field at `path` is present.
    JsonExists { path: String },
}

/// A named predicate over a RequestResult. Pure: never fails, never panics;
/// a missing field or unparseable body is a failed check.
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub name: String,
    pub kind: CheckKind,
}

impl Check {
    pub fn status(name: impl Into<String>, code: u16) -> Self {
        Self {
            name: name.into(),
            kind: CheckKind::Status(code),
        }
    }

    pub fn json_equals(
        name: impl Into<String>,
        path: impl Into<String>,
        expected: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            kind: CheckKind::JsonEquals {
                path: path.into(),
                expected,
            },
        }
    }

    pub fn json_exists(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: CheckKind::JsonExists { path: path.into() },
        }
    }

    pub fn passes(&self, result: &RequestResult) -> bool {
        match &self.kind {
            CheckKind::Status(code) => result.status == *code,
            CheckKind::JsonEquals { path, expected } => result
                .body
                .as_ref()
                .and_then(|body| lookup_path(body, path))
                .map(|v| v == expected)
                .unwrap_or(false),
            CheckKind::JsonExists { path } => result
                .body
                .as_ref()
                .and_then(|body| lookup_path(body, path))
                .is_some(),
        }
    }
}

/// Outcome of one check against one result. Derived, never persisted.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
}

/// Named checks applied to every response. Checks are independent: all of
/// them are evaluated on each result, none short-circuits.
#[derive(Debug, Clone, Default)]
pub struct CheckSet {
    checks: Vec<Check>,
}

impl CheckSet {
    pub fn new(checks: Vec<Check>) -> Self {
        Self { checks }
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.checks.iter().map(|c| c.name.as_str())
    }

    pub fn evaluate(&self, result: &RequestResult) -> Vec<CheckOutcome> {
        self.checks
            .iter()
            .map(|check| CheckOutcome {
                name: check.name.clone(),
                passed: check.passes(result),
            })
            .collect()
    }
}

/// Walk a dot-separated path ("result.pong") through nested JSON objects.
fn lookup_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
