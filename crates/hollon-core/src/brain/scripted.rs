//! Scripted in-process brain.
//!
//! Serves canned responses from a queue, in order, repeating the last one
//! when the queue runs dry. Used by the end-to-end tests and by
//! scheduler-disabled development runs where no real provider is wired up.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Brain, BrainCost, BrainResponse};
use crate::error::CoreError;

/// One canned reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Succeed with this output and cost.
    Output { text: String, cost: BrainCost },
    /// Fail with this error.
    Fail(String),
}

impl ScriptedReply {
    /// A successful reply with a default small cost.
    pub fn text(output: impl Into<String>) -> Self {
        Self::Output {
            text: output.into(),
            cost: BrainCost {
                input_tokens: 100,
                output_tokens: 50,
                sub_cents: 1,
            },
        }
    }

    /// A successful reply with an explicit sub-cent cost.
    pub fn text_with_cost(output: impl Into<String>, sub_cents: i64) -> Self {
        Self::Output {
            text: output.into(),
            cost: BrainCost {
                input_tokens: 100,
                output_tokens: 50,
                sub_cents,
            },
        }
    }
}

/// Deterministic brain that replays a scripted queue of replies.
pub struct ScriptedBrain {
    name: String,
    replies: Mutex<VecDeque<ScriptedReply>>,
    last: Mutex<Option<ScriptedReply>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBrain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replies: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply. Replies are served in FIFO order; the final reply is
    /// repeated once the queue is empty.
    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Prompts seen so far, for assertions on prompt composition.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Brain for ScriptedBrain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, prompt: &str, _timeout: Duration) -> Result<BrainResponse, CoreError> {
        self.prompts.lock().unwrap().push(prompt.to_string());

        let reply = {
            let mut queue = self.replies.lock().unwrap();
            match queue.pop_front() {
                Some(reply) => {
                    *self.last.lock().unwrap() = Some(reply.clone());
                    reply
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| ScriptedReply::Fail("scripted brain is empty".into())),
            }
        };

        match reply {
            ScriptedReply::Output { text, cost } => Ok(BrainResponse {
                output: text,
                duration: Duration::from_millis(1),
                cost,
            }),
            ScriptedReply::Fail(reason) => Err(CoreError::ProviderError(reason)),
        }
    }
}
