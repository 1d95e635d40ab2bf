//! In-process VCS host.
//!
//! Records branches and reviews in a mutex-guarded table and serves CI
//! verdicts from a scriptable queue. Backs the end-to-end tests and
//! scheduler-disabled development runs, where no external host is wired up.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{CiStatus, ReviewRef, VcsHost};
use crate::error::CoreError;

#[derive(Debug, Clone)]
struct ReviewState {
    branch: String,
    merged: bool,
    closed: bool,
}

#[derive(Default)]
struct HostState {
    next_number: i64,
    /// (project, branch) -> review number, for idempotent publish.
    by_branch: HashMap<(Uuid, String), i64>,
    reviews: HashMap<i64, ReviewState>,
    /// Scripted CI verdicts, served in order; defaults to passing when dry.
    ci_script: VecDeque<CiStatus>,
    /// Remaining merge attempts to reject.
    merge_failures: u32,
}

/// A host that lives entirely in process memory.
pub struct LocalVcsHost {
    state: Mutex<HostState>,
}

impl LocalVcsHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                next_number: 1,
                ..HostState::default()
            }),
        }
    }

    /// Queue a CI verdict. Verdicts are consumed by `ci_status` in FIFO
    /// order; when the queue is dry, CI reports passing.
    pub fn script_ci(&self, status: CiStatus) {
        self.state.lock().unwrap().ci_script.push_back(status);
    }

    /// Make the next `count` merge attempts fail with a transient error.
    pub fn fail_next_merges(&self, count: u32) {
        self.state.lock().unwrap().merge_failures = count;
    }

    /// Whether a review has been merged.
    pub fn is_merged(&self, review_number: i64) -> bool {
        self.state
            .lock()
            .unwrap()
            .reviews
            .get(&review_number)
            .is_some_and(|r| r.merged)
    }

    /// Total number of reviews ever opened.
    pub fn review_count(&self) -> usize {
        self.state.lock().unwrap().reviews.len()
    }
}

impl Default for LocalVcsHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VcsHost for LocalVcsHost {
    async fn publish(
        &self,
        project_id: Uuid,
        branch: &str,
        _title: &str,
    ) -> Result<ReviewRef, CoreError> {
        let mut state = self.state.lock().unwrap();

        let key = (project_id, branch.to_string());
        if let Some(&number) = state.by_branch.get(&key) {
            let review = &state.reviews[&number];
            if !review.closed && !review.merged {
                return Ok(ReviewRef {
                    number,
                    url: review_url(number),
                });
            }
        }

        let number = state.next_number;
        state.next_number += 1;
        state.by_branch.insert(key, number);
        state.reviews.insert(
            number,
            ReviewState {
                branch: branch.to_string(),
                merged: false,
                closed: false,
            },
        );

        Ok(ReviewRef {
            number,
            url: review_url(number),
        })
    }

    async fn merge(&self, _project_id: Uuid, review_number: i64) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();

        if state.merge_failures > 0 {
            state.merge_failures -= 1;
            return Err(CoreError::Transient(
                "host rejected merge: required check failing".into(),
            ));
        }

        let review = state
            .reviews
            .get_mut(&review_number)
            .ok_or_else(|| CoreError::NotFound(format!("review {review_number}")))?;

        if review.closed {
            return Err(CoreError::Conflict(format!(
                "review {review_number} is closed"
            )));
        }
        review.merged = true;
        Ok(())
    }

    async fn ci_status(
        &self,
        _project_id: Uuid,
        review_number: i64,
    ) -> Result<CiStatus, CoreError> {
        let mut state = self.state.lock().unwrap();

        if !state.reviews.contains_key(&review_number) {
            return Err(CoreError::NotFound(format!("review {review_number}")));
        }

        Ok(state.ci_script.pop_front().unwrap_or(CiStatus::Passing))
    }

    async fn close_review(&self, _project_id: Uuid, review_number: i64) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        let review = state
            .reviews
            .get_mut(&review_number)
            .ok_or_else(|| CoreError::NotFound(format!("review {review_number}")))?;
        review.closed = true;
        Ok(())
    }
}

fn review_url(number: i64) -> String {
    format!("local://reviews/{number}")
}
