//! CRM backend abstraction: the logical calls the engine makes.
//!
//! Bitrix24 is the implementation shipped today. The engine only talks to the
//! [`CrmBackend`] trait, which is also where tests plug in an in-memory CRM.

pub mod bitrix;
#[cfg(test)]
pub mod fake;

use crate::crm::GatewayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A human agent who can receive work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub online: bool,
    /// Open records owned by this agent; `None` until counted.
    pub open_work_count: Option<u32>,
}

impl Agent {
    #[cfg(test)]
    pub fn new(id: &str, first_name: &str, last_name: &str) -> Self {
        Self {
            id: id.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            online: true,
            open_work_count: None,
        }
    }

    #[cfg(test)]
    pub fn with_count(mut self, count: u32) -> Self {
        self.open_work_count = Some(count);
        self
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// A lead or deal owned by the CRM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRecord {
    pub id: String,
    pub title: String,
    pub created_at: String,
    /// Owning agent ID; `None` is the CRM's "unassigned" sentinel.
    pub owner: Option<String>,
    pub status: String,
}

impl WorkRecord {
    pub fn is_unassigned(&self) -> bool {
        self.owner.is_none()
    }
}

/// Which CRM entity is being routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Deal,
    Lead,
}

impl EntityKind {
    pub fn list_method(&self) -> &'static str {
        match self {
            Self::Deal => "crm.deal.list",
            Self::Lead => "crm.lead.list",
        }
    }

    pub fn update_method(&self) -> &'static str {
        match self {
            Self::Deal => "crm.deal.update",
            Self::Lead => "crm.lead.update",
        }
    }

    /// Field holding the pipeline stage / status tag.
    pub fn status_field(&self) -> &'static str {
        match self {
            Self::Deal => "STAGE_ID",
            Self::Lead => "STATUS_ID",
        }
    }
}

impl FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deal" | "deals" => Ok(Self::Deal),
            "lead" | "leads" => Ok(Self::Lead),
            other => anyhow::bail!("unknown CRM entity: {other} (expected deal or lead)"),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deal => f.write_str("deal"),
            Self::Lead => f.write_str("lead"),
        }
    }
}

/// Owner constraint of a record query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerFilter {
    Unassigned,
    Agent(String),
}

/// Filter for listing or counting work records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub status: String,
    pub owner: OwnerFilter,
    pub created_after: Option<DateTime<Utc>>,
}

impl RecordQuery {
    /// Open records owned by `agent_id`.
    pub fn open_for(agent_id: &str, status: &str) -> Self {
        Self {
            status: status.to_string(),
            owner: OwnerFilter::Agent(agent_id.to_string()),
            created_after: None,
        }
    }

    /// Unassigned records created after `cutoff`.
    pub fn unassigned_since(status: &str, cutoff: DateTime<Utc>) -> Self {
        Self {
            status: status.to_string(),
            owner: OwnerFilter::Unassigned,
            created_after: Some(cutoff),
        }
    }
}

/// The calls the engine makes against a CRM.
#[async_trait]
pub trait CrmBackend: Send + Sync {
    /// Human-readable name (e.g. "bitrix24").
    fn name(&self) -> &str;

    /// All active user accounts, with their online flag filled in.
    async fn list_users(&self) -> Result<Vec<Agent>, GatewayError>;

    /// Records matching `query`, oldest first.
    async fn list_work_records(&self, query: &RecordQuery) -> Result<Vec<WorkRecord>, GatewayError>;

    /// Number of records matching `query`.
    async fn count_work_records(&self, query: &RecordQuery) -> Result<u32, GatewayError>;

    /// Set the owner of a record. `Ok(false)` means the CRM declined.
    async fn update_work_record(&self, id: &str, owner: &str) -> Result<bool, GatewayError>;
}

/// Build the configured backend.
pub fn from_config() -> anyhow::Result<Arc<dyn CrmBackend>> {
    let settings = crate::crm::CrmSettings::from_config()?;
    let entity = crate::config::get_or("crm.entity", EntityKind::Deal);
    let backend = bitrix::BitrixBackend::new(settings.client()?, entity);
    tracing::debug!(entity = %entity, "CRM backend configured");
    Ok(Arc::new(backend))
}
