//! Agent directory: who can take work, and how much they already have.

use crate::backends::{Agent, CrmBackend, RecordQuery};
use crate::crm::GatewayError;
use futures::future::join_all;
use std::sync::Arc;

pub struct AgentDirectory {
    backend: Arc<dyn CrmBackend>,
    open_status: String,
    require_online: bool,
}

impl AgentDirectory {
    pub fn new(backend: Arc<dyn CrmBackend>, open_status: &str, require_online: bool) -> Self {
        Self {
            backend,
            open_status: open_status.to_string(),
            require_online,
        }
    }

    /// Agents eligible for work. An empty list is not an error.
    pub async fn list_active_agents(&self) -> Result<Vec<Agent>, GatewayError> {
        let users = self.backend.list_users().await?;
        let total = users.len();
        let agents: Vec<Agent> = users
            .into_iter()
            .filter(|a| !self.require_online || a.online)
            .collect();
        tracing::debug!(
            total,
            eligible = agents.len(),
            require_online = self.require_online,
            "agents listed"
        );
        Ok(agents)
    }

    /// Fill in `open_work_count` for every agent.
    ///
    /// Count queries run concurrently. A failed count degrades to 0 for that
    /// agent; the output keeps the input order.
    pub async fn with_open_work_counts(&self, agents: Vec<Agent>) -> Vec<Agent> {
        let queries = agents.iter().map(|agent| {
            let query = RecordQuery::open_for(&agent.id, &self.open_status);
            let backend = self.backend.clone();
            async move { backend.count_work_records(&query).await }
        });
        let counts = join_all(queries).await;

        agents
            .into_iter()
            .zip(counts)
            .map(|(mut agent, count)| {
                let count = count.unwrap_or_else(|e| {
                    tracing::warn!(agent_id = %agent.id, err = %e, "open work count failed, using 0");
                    0
                });
                agent.open_work_count = Some(count);
                agent
            })
            .collect()
    }

    /// Active agents with their current load.
    pub async fn snapshot(&self) -> Result<Vec<Agent>, GatewayError> {
        let agents = self.list_active_agents().await?;
        Ok(self.with_open_work_counts(agents).await)
    }
}
