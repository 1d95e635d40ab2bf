//! Quality and cost gate.
//!
//! Every brain response passes through the gate before publication. The
//! verdict is data (`passed` / `should_retry` / `reason`); the escalation
//! ladder decides what to do with it. Cost accounting happens before the
//! gate runs and is unconditional -- budgets bind even for failed
//! executions.

use hollon_db::models::{Organization, Task, TaskType};

use crate::brain::BrainResponse;

/// Substrings (case-insensitive) that mark an output as a failed run
/// regardless of length.
const FATAL_PATTERNS: [&str; 4] = ["error:", "fatal:", "permission denied", "command failed"];

/// Minimum useful output length, after trimming.
const MIN_OUTPUT_CHARS: usize = 10;

/// Fraction of the daily cap any single execution may spend.
pub const DEFAULT_EXECUTION_COST_FRACTION: f64 = 0.10;

/// Gate verdict for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub passed: bool,
    pub should_retry: bool,
    pub reason: String,
    /// Non-fatal observations, logged but not acted on.
    pub warnings: Vec<String>,
}

impl GateOutcome {
    fn pass(warnings: Vec<String>) -> Self {
        Self {
            passed: true,
            should_retry: false,
            reason: String::new(),
            warnings,
        }
    }

    fn fail_retry(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            should_retry: true,
            reason: reason.into(),
            warnings: Vec::new(),
        }
    }

    fn fail_no_retry(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            should_retry: false,
            reason: reason.into(),
            warnings: Vec::new(),
        }
    }
}

/// Gate configuration.
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    /// Per-execution spend ceiling as a fraction of the daily cap.
    pub execution_cost_fraction: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            execution_cost_fraction: DEFAULT_EXECUTION_COST_FRACTION,
        }
    }
}

/// Evaluate a brain response for a task.
///
/// Checks, in order:
///
/// - **Presence**: at least [`MIN_OUTPUT_CHARS`] trimmed characters, and
///   none of the fatal substrings. Violations fail with retry -- a
///   presence failure takes the normal retry ladder even when the
///   execution also blew the budget.
/// - **Shape**: implementation tasks are expected to contain code-like
///   indicators; absence is a warning only.
/// - **Budget**: a single execution may spend at most
///   `daily cap x execution_cost_fraction` sub-cents. Exceeding it fails
///   without retry (reason `cost`) and escalates at level 4.
pub fn evaluate(
    config: &GateConfig,
    org: &Organization,
    task: &Task,
    response: &BrainResponse,
) -> GateOutcome {
    let trimmed = response.output.trim();
    if trimmed.len() < MIN_OUTPUT_CHARS {
        return GateOutcome::fail_retry(format!(
            "output too short: {} chars after trimming",
            trimmed.len()
        ));
    }

    let lowered = trimmed.to_lowercase();
    for pattern in FATAL_PATTERNS {
        if lowered.contains(pattern) {
            return GateOutcome::fail_retry(format!("output matches fatal pattern {pattern:?}"));
        }
    }

    let mut warnings = Vec::new();
    if task.task_type == TaskType::Implementation && !looks_like_code(trimmed) {
        warnings.push("implementation output carries no code indicators".to_string());
    }

    let ceiling = (org.daily_cost_cap_sub_cents as f64 * config.execution_cost_fraction) as i64;
    if ceiling > 0 && response.cost.sub_cents > ceiling {
        return GateOutcome::fail_no_retry(format!(
            "cost: execution spent {} sub-cents, ceiling is {ceiling}",
            response.cost.sub_cents
        ));
    }

    GateOutcome::pass(warnings)
}

/// Heuristic code detector for implementation-task output.
fn looks_like_code(output: &str) -> bool {
    const KEYWORDS: [&str; 4] = ["function", "class", "import", "export"];
    output.contains(';')
        || output.contains('{')
        || output.contains('}')
        || KEYWORDS.iter().any(|kw| output.contains(kw))
}
