//! Subprocess brain transport.
//!
//! Spawns the provider's CLI, writes the prompt to stdin, collects stdout,
//! and parses the result envelope. On timeout the child is killed before
//! the error is returned -- no orphaned provider processes. A per-provider
//! semaphore bounds concurrent invocations, since one provider is shared
//! across organizations.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::warn;

use super::envelope::parse_result_envelope;
use super::{Brain, BrainCost, BrainResponse, TokenRates};
use crate::error::CoreError;

/// Default cap on concurrent invocations per provider.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// A brain provider reached through a subprocess CLI.
#[derive(Debug, Clone)]
pub struct SubprocessBrain {
    name: String,
    /// Binary to execute; resolved via `$PATH` when not absolute.
    program: String,
    args: Vec<String>,
    /// Extra environment for the child, e.g. provider credentials.
    env: Vec<(String, String)>,
    rates: TokenRates,
    limiter: Arc<Semaphore>,
}

impl SubprocessBrain {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
        rates: TokenRates,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            env: Vec::new(),
            rates,
            limiter: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
        }
    }

    /// Add an environment variable passed to every invocation.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Override the concurrent-invocation cap.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.limiter = Arc::new(Semaphore::new(max.max(1)));
        self
    }
}

#[async_trait]
impl Brain for SubprocessBrain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, prompt: &str, timeout: Duration) -> Result<BrainResponse, CoreError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| CoreError::ProviderError("provider limiter closed".into()))?;
        let started = Instant::now();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| CoreError::ProviderError(format!("failed to spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| CoreError::ProviderError(format!("failed to write prompt: {e}")))?;
            // Close stdin so the provider starts processing.
            drop(stdin);
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CoreError::ProviderError(format!(
                    "provider process failed: {e}"
                )));
            }
            Err(_elapsed) => {
                // Dropping the wait future drops the child; kill_on_drop
                // terminates the process.
                warn!(provider = %self.name, ?timeout, "brain invocation timed out, child killed");
                return Err(CoreError::Timeout(timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::ProviderError(format!(
                "provider exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let envelope = parse_result_envelope(&stdout)?;

        let sub_cents = envelope.cost.sub_cents.unwrap_or_else(|| {
            self.rates
                .cost_sub_cents(envelope.cost.input_tokens, envelope.cost.output_tokens)
        });

        let duration = if envelope.duration_ms > 0 {
            Duration::from_millis(envelope.duration_ms)
        } else {
            started.elapsed()
        };

        Ok(BrainResponse {
            output: envelope.output,
            duration,
            cost: BrainCost {
                input_tokens: envelope.cost.input_tokens,
                output_tokens: envelope.cost.output_tokens,
                sub_cents,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates() -> TokenRates {
        TokenRates {
            input_sub_cents_per_mtok: 3_000,
            output_sub_cents_per_mtok: 15_000,
        }
    }

    #[tokio::test]
    async fn echo_provider_roundtrip() {
        // `cat` echoes the prompt back; feed it a valid envelope.
        let brain = SubprocessBrain::new("cat", "cat", vec![], rates());
        let prompt = r#"{"output": "hello", "success": true, "duration_ms": 5,
                         "cost": {"input_tokens": 100, "output_tokens": 50}}"#;
        let response = brain
            .execute(prompt, Duration::from_secs(5))
            .await
            .expect("cat should succeed");
        assert_eq!(response.output, "hello");
        assert_eq!(response.cost.input_tokens, 100);
        // Derived from rates since the envelope has no sub_cents.
        assert_eq!(response.cost.sub_cents, rates().cost_sub_cents(100, 50));
    }

    #[tokio::test]
    async fn missing_binary_is_provider_error() {
        let brain = SubprocessBrain::new(
            "ghost",
            "definitely-not-a-real-binary-7f3a",
            vec![],
            rates(),
        );
        let err = brain
            .execute("hi", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ProviderError(_)));
    }

    #[tokio::test]
    async fn hung_provider_times_out() {
        // `sleep 30` never writes an envelope; the timeout must fire.
        let brain = SubprocessBrain::new("sleepy", "sleep", vec!["30".to_string()], rates());
        let err = brain
            .execute("hi", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn non_envelope_output_is_parse_error() {
        let brain = SubprocessBrain::new("cat", "cat", vec![], rates());
        let err = brain
            .execute("just some text", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ParseError(_)));
    }
}
