//! Concurrency governor -- per-organization caps and the emergency stop.
//!
//! Consulted at the top of every execute tick. The only global mutable
//! state in the process is the in-flight deduplication set keyed by agent
//! id; it is rebuilt empty on process start, which is safe because the
//! claim CAS makes a duplicate invocation harmless.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use hollon_db::models::Organization;
use hollon_db::queries::{agents, escalations, executions, orgs};

/// Verdict for an organization at the top of an execute tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrgAdmission {
    /// Emergency stop is in effect; skip entirely.
    Stopped,
    /// A cost cap tripped on this tick; the stop flag has been flipped.
    CapTripped { reason: String },
    /// Execution may proceed with this many free concurrency slots.
    Slots(usize),
}

/// The governor.
#[derive(Debug, Default)]
pub struct Governor {
    in_flight: Mutex<HashSet<Uuid>>,
}

impl Governor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether an organization may execute this tick.
    ///
    /// Order matters: an already-stopped organization is skipped without
    /// touching the cost tables; a cap crossing flips the stop flag, files
    /// a level-4 escalation, and stops the population. Re-enabling is
    /// human-only.
    pub async fn admit(&self, pool: &PgPool, org: &Organization) -> Result<OrgAdmission> {
        if !org.autonomous_execution_enabled {
            return Ok(OrgAdmission::Stopped);
        }

        let today = Utc::now().date_naive();

        if org.daily_cost_cap_sub_cents > 0 {
            let spent = executions::daily_cost(pool, org.id, today).await?;
            if spent >= org.daily_cost_cap_sub_cents {
                return self.trip(pool, org, "daily cap reached").await;
            }
        }

        if org.monthly_cost_cap_sub_cents > 0 {
            let spent = executions::monthly_cost(pool, org.id, today).await?;
            if spent >= org.monthly_cost_cap_sub_cents {
                return self.trip(pool, org, "monthly cap reached").await;
            }
        }

        let active = agents::count_active_agents(pool, org.id).await?;
        let slots = (org.max_concurrent_agents as i64 - active).max(0) as usize;
        Ok(OrgAdmission::Slots(slots))
    }

    async fn trip(
        &self,
        pool: &PgPool,
        org: &Organization,
        reason: &str,
    ) -> Result<OrgAdmission> {
        warn!(org = %org.name, reason, "cost cap crossed, stopping autonomous execution");
        orgs::set_autonomous_execution(pool, org.id, false, Some(reason)).await?;
        escalations::insert_org_escalation(pool, org.id, 4, reason).await?;
        Ok(OrgAdmission::CapTripped {
            reason: reason.to_string(),
        })
    }

    /// Reserve an agent for one cycle. Returns `false` when the agent is
    /// already in flight (the same agent must never run two concurrent
    /// cycles from this process).
    pub fn try_begin(&self, agent_id: Uuid) -> bool {
        self.in_flight.lock().unwrap().insert(agent_id)
    }

    /// Release an agent's reservation after its cycle ends.
    pub fn finish(&self, agent_id: Uuid) {
        self.in_flight.lock().unwrap().remove(&agent_id);
    }

    /// Number of cycles currently in flight from this process.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_set_rejects_double_begin() {
        let governor = Governor::new();
        let agent = Uuid::new_v4();

        assert!(governor.try_begin(agent));
        assert!(!governor.try_begin(agent));
        assert_eq!(governor.in_flight_count(), 1);

        governor.finish(agent);
        assert!(governor.try_begin(agent));
    }

    #[test]
    fn finish_is_idempotent() {
        let governor = Governor::new();
        let agent = Uuid::new_v4();
        governor.finish(agent);
        assert!(governor.try_begin(agent));
        governor.finish(agent);
        governor.finish(agent);
        assert_eq!(governor.in_flight_count(), 0);
    }
}
