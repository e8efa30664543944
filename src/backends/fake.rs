//! In-memory CRM for engine and server tests.

use super::{Agent, CrmBackend, OwnerFilter, RecordQuery, WorkRecord};
use crate::crm::GatewayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct State {
    users: Vec<Agent>,
    counts: HashMap<String, u32>,
    failing_counts: HashSet<String>,
    records: Vec<WorkRecord>,
    fail_next_updates: u32,
    reject_updates: bool,
    update_delay: Option<Duration>,
    fail_list_users: bool,
    updates: Vec<(String, String)>,
    list_calls: u32,
    user_calls: u32,
}

/// Scriptable [`CrmBackend`]. Open-work counts are fixed by the test and do
/// not change when records are assigned.
#[derive(Default)]
pub struct FakeCrm {
    state: Mutex<State>,
}

fn fake_error(operation: &str, message: &str) -> GatewayError {
    GatewayError::Remote {
        operation: operation.to_string(),
        status: 500,
        code: None,
        message: message.to_string(),
    }
}

/// Same filter the CRM applies: status, owner, and strictly after the cutoff.
fn record_matches(record: &WorkRecord, query: &RecordQuery) -> bool {
    let owner_ok = match &query.owner {
        OwnerFilter::Unassigned => record.owner.is_none(),
        OwnerFilter::Agent(id) => record.owner.as_deref() == Some(id.as_str()),
    };
    let created_ok = match query.created_after {
        None => true,
        Some(cutoff) => DateTime::parse_from_rfc3339(&record.created_at)
            .map(|at| at.with_timezone(&Utc) > cutoff)
            .unwrap_or(false),
    };
    record.status == query.status && owner_ok && created_ok
}

impl FakeCrm {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Add an online user with `open` open records.
    pub fn user(self, id: &str, name: &str, open: u32) -> Self {
        self.with_state(|s| {
            s.users.push(Agent::new(id, name, ""));
            s.counts.insert(id.to_string(), open);
        });
        self
    }

    pub fn offline_user(self, id: &str, name: &str, open: u32) -> Self {
        self.with_state(|s| {
            let mut agent = Agent::new(id, name, "");
            agent.online = false;
            s.users.push(agent);
            s.counts.insert(id.to_string(), open);
        });
        self
    }

    /// Add an unassigned record created just now.
    pub fn record(self, id: &str, title: &str) -> Self {
        self.old_record(id, title, chrono::Duration::zero())
    }

    /// Add an unassigned record created `age` ago.
    pub fn old_record(self, id: &str, title: &str, age: chrono::Duration) -> Self {
        self.with_state(|s| {
            s.records.push(WorkRecord {
                id: id.to_string(),
                title: title.to_string(),
                created_at: (Utc::now() - age).to_rfc3339(),
                owner: None,
                status: "NEW".to_string(),
            })
        });
        self
    }

    pub fn set_count(&self, id: &str, open: u32) {
        self.with_state(|s| {
            s.counts.insert(id.to_string(), open);
        });
    }

    pub fn fail_count_for(&self, id: &str) {
        self.with_state(|s| {
            s.failing_counts.insert(id.to_string());
        });
    }

    pub fn fail_next_updates(&self, n: u32) {
        self.with_state(|s| s.fail_next_updates = n);
    }

    /// Hold each successful write for `delay` after applying it, as a slow
    /// CRM reply would.
    pub fn set_update_delay(&self, delay: Duration) {
        self.with_state(|s| s.update_delay = Some(delay));
    }

    pub fn reject_updates(&self, reject: bool) {
        self.with_state(|s| s.reject_updates = reject);
    }

    pub fn fail_list_users(&self, fail: bool) {
        self.with_state(|s| s.fail_list_users = fail);
    }

    /// Successful `(record_id, owner)` writes, in order.
    pub fn updates(&self) -> Vec<(String, String)> {
        self.with_state(|s| s.updates.clone())
    }

    pub fn owner_of(&self, record_id: &str) -> Option<String> {
        self.with_state(|s| {
            s.records
                .iter()
                .find(|r| r.id == record_id)
                .and_then(|r| r.owner.clone())
        })
    }

    pub fn list_calls(&self) -> u32 {
        self.with_state(|s| s.list_calls)
    }

    pub fn user_calls(&self) -> u32 {
        self.with_state(|s| s.user_calls)
    }
}

#[async_trait]
impl CrmBackend for FakeCrm {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_users(&self) -> Result<Vec<Agent>, GatewayError> {
        self.with_state(|s| {
            s.user_calls += 1;
            if s.fail_list_users {
                return Err(fake_error("user.get", "user listing down"));
            }
            Ok(s.users.clone())
        })
    }

    async fn list_work_records(&self, query: &RecordQuery) -> Result<Vec<WorkRecord>, GatewayError> {
        self.with_state(|s| {
            s.list_calls += 1;
            Ok(s.records
                .iter()
                .filter(|r| record_matches(r, query))
                .cloned()
                .collect())
        })
    }

    async fn count_work_records(&self, query: &RecordQuery) -> Result<u32, GatewayError> {
        self.with_state(|s| match &query.owner {
            OwnerFilter::Agent(id) if s.failing_counts.contains(id) => {
                Err(fake_error("crm.deal.list", "count failed"))
            }
            OwnerFilter::Agent(id) => Ok(s.counts.get(id).copied().unwrap_or(0)),
            OwnerFilter::Unassigned => {
                Ok(s.records.iter().filter(|r| record_matches(r, query)).count() as u32)
            }
        })
    }

    async fn update_work_record(&self, id: &str, owner: &str) -> Result<bool, GatewayError> {
        // Yield so concurrent callers can interleave with an in-flight write.
        tokio::task::yield_now().await;
        let result = self.with_state(|s| {
            if s.fail_next_updates > 0 {
                s.fail_next_updates -= 1;
                return Err(fake_error("crm.deal.update", "update failed"));
            }
            if s.reject_updates {
                return Ok(false);
            }
            if let Some(record) = s.records.iter_mut().find(|r| r.id == id) {
                record.owner = Some(owner.to_string());
            }
            s.updates.push((id.to_string(), owner.to_string()));
            Ok(true)
        });
        let delay = self.with_state(|s| s.update_delay);
        if let (Ok(true), Some(delay)) = (&result, delay) {
            tokio::time::sleep(delay).await;
        }
        result
    }
}
