//! Brain gateway -- request/response to the external large-model service.
//!
//! The gateway owns transport lifecycle, forced termination on timeout,
//! envelope parsing, and sub-cent cost accounting. It deliberately does NOT
//! retry: retries are policy and belong to the execution cycle and the
//! escalation ladder.

pub mod envelope;
pub mod scripted;
pub mod subprocess;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoreError;

/// Cost of a single brain invocation, token counts plus the sub-cent total
/// derived from the provider's per-token rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrainCost {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub sub_cents: i64,
}

/// Response from one brain invocation.
#[derive(Debug, Clone)]
pub struct BrainResponse {
    pub output: String,
    pub duration: Duration,
    pub cost: BrainCost,
}

/// Per-token pricing for a provider, in sub-cents per million tokens.
/// Totals round up so partial tokens are never billed at zero.
#[derive(Debug, Clone, Copy)]
pub struct TokenRates {
    pub input_sub_cents_per_mtok: i64,
    pub output_sub_cents_per_mtok: i64,
}

impl TokenRates {
    /// Sub-cent cost of an invocation at these rates, rounded up.
    pub fn cost_sub_cents(&self, input_tokens: i64, output_tokens: i64) -> i64 {
        let input = div_ceil_i64(
            input_tokens.saturating_mul(self.input_sub_cents_per_mtok),
            1_000_000,
        );
        let output = div_ceil_i64(
            output_tokens.saturating_mul(self.output_sub_cents_per_mtok),
            1_000_000,
        );
        input + output
    }
}

/// Equivalent of the unstable `i64::div_ceil`.
fn div_ceil_i64(lhs: i64, rhs: i64) -> i64 {
    let d = lhs / rhs;
    let r = lhs % rhs;
    if (r > 0 && rhs > 0) || (r < 0 && rhs < 0) {
        d + 1
    } else {
        d
    }
}

/// Adapter interface for brain providers.
///
/// Implementors wrap a specific transport (subprocess stdio, HTTP) and
/// translate it into the common [`BrainResponse`] shape.
///
/// # Object Safety
///
/// This trait is object-safe so providers can be stored as
/// `Arc<dyn Brain>` in the [`BrainRegistry`].
#[async_trait]
pub trait Brain: Send + Sync {
    /// Provider name, matched against `agent.brain_provider`.
    fn name(&self) -> &str;

    /// Execute a single prompt with a hard timeout.
    ///
    /// On timeout the transport must be forcibly terminated before the
    /// error is returned. Fails with `Timeout`, `ProviderError`, or
    /// `ParseError`; never retries internally.
    async fn execute(&self, prompt: &str, timeout: Duration) -> Result<BrainResponse, CoreError>;
}

// Compile-time assertion: Brain must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Brain) {}
};

/// Registry of brain providers, keyed by name.
#[derive(Default)]
pub struct BrainRegistry {
    providers: HashMap<String, Arc<dyn Brain>>,
}

impl BrainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name. A later registration with
    /// the same name replaces the earlier one.
    pub fn register(&mut self, brain: Arc<dyn Brain>) {
        self.providers.insert(brain.name().to_string(), brain);
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Brain>> {
        self.providers.get(name).cloned()
    }

    /// Names of all registered providers, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for BrainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrainRegistry")
            .field("providers", &self.list())
            .finish()
    }
}
