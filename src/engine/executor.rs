//! Assignment executor: the single place that writes owners to the CRM.
//!
//! Holds the process-local dedup guard. A record ID enters the `assigned` set
//! only after the CRM confirms the write, so a failed attempt can be retried.
//! While a write is outstanding the ID sits in `in_flight`, which makes a
//! concurrent attempt on the same record report `AlreadyAssigned` instead of
//! issuing a second write.
//!
//! The remote write runs on its own task. Dropping the caller (a webhook
//! client hanging up, a timeout) does not abandon it: the task still records
//! the outcome in the guard before the in-flight mark is released.

use super::error::AssignError;
use crate::backends::CrmBackend;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct GuardState {
    assigned: HashSet<String>,
    in_flight: HashSet<String>,
}

type Guard = Arc<Mutex<GuardState>>;

fn lock(guard: &Mutex<GuardState>) -> MutexGuard<'_, GuardState> {
    guard.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct AssignmentExecutor {
    backend: Arc<dyn CrmBackend>,
    guard: Guard,
}

/// Clears the in-flight mark when the write task ends, however it ends.
struct InFlight {
    guard: Guard,
    record_id: String,
}

impl InFlight {
    /// Confirmed by the CRM. Marked assigned before the in-flight mark goes.
    fn confirm(self) {
        lock(&self.guard).assigned.insert(self.record_id.clone());
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.guard).in_flight.remove(&self.record_id);
    }
}

impl AssignmentExecutor {
    pub fn new(backend: Arc<dyn CrmBackend>) -> Self {
        Self {
            backend,
            guard: Arc::new(Mutex::new(GuardState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        lock(&self.guard)
    }

    /// Make `agent_id` the owner of `record_id`.
    pub async fn assign(&self, record_id: &str, agent_id: &str) -> Result<(), AssignError> {
        let in_flight = self.begin(record_id)?;

        let backend = Arc::clone(&self.backend);
        let (record, agent) = (record_id.to_string(), agent_id.to_string());
        let write = tokio::spawn(async move {
            let outcome = backend.update_work_record(&record, &agent).await;
            if matches!(outcome, Ok(true)) {
                in_flight.confirm();
            }
            outcome
        });

        let outcome = match write.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(record_id, agent_id, err = %e, "owner update task died");
                return Err(AssignError::RemoteFailure {
                    record_id: record_id.to_string(),
                    reason: format!("owner update task died: {e}"),
                    source: None,
                });
            }
        };

        match outcome {
            Ok(true) => {
                tracing::info!(record_id, agent_id, "record assigned");
                Ok(())
            }
            Ok(false) => {
                tracing::warn!(record_id, agent_id, "CRM declined owner update");
                Err(AssignError::RemoteFailure {
                    record_id: record_id.to_string(),
                    reason: "CRM declined the update".to_string(),
                    source: None,
                })
            }
            Err(e) => {
                tracing::warn!(record_id, agent_id, err = %e, "owner update failed");
                Err(AssignError::RemoteFailure {
                    record_id: record_id.to_string(),
                    reason: e.to_string(),
                    source: Some(e),
                })
            }
        }
    }

    fn begin(&self, record_id: &str) -> Result<InFlight, AssignError> {
        let mut state = self.state();
        if state.assigned.contains(record_id) || state.in_flight.contains(record_id) {
            tracing::debug!(record_id, "already assigned, skipping");
            return Err(AssignError::AlreadyAssigned {
                record_id: record_id.to_string(),
            });
        }
        state.in_flight.insert(record_id.to_string());
        Ok(InFlight {
            guard: Arc::clone(&self.guard),
            record_id: record_id.to_string(),
        })
    }

    pub fn is_assigned(&self, record_id: &str) -> bool {
        self.state().assigned.contains(record_id)
    }

    pub fn assigned_count(&self) -> usize {
        self.state().assigned.len()
    }
}
