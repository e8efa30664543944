//! Bitrix24 backend: maps the engine's calls onto REST methods.
//!
//! - users:   `user.get` (active accounts, `IS_ONLINE` decides availability)
//! - records: `crm.deal.list` / `crm.lead.list`, paginated through `start`
//! - counts:  the same list method with `select: [ID]`, reading `total`
//! - assign:  `crm.deal.update` / `crm.lead.update` on `ASSIGNED_BY_ID`

use super::{Agent, CrmBackend, EntityKind, OwnerFilter, RecordQuery, WorkRecord};
use crate::crm::types::{is_truthy, owner_from_wire, BitrixRecord, BitrixUser, Envelope};
use crate::crm::{CrmHttp, GatewayError};
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Upper bound on pages fetched by one list call (Bitrix pages hold 50 rows).
const MAX_PAGES: usize = 20;

pub struct BitrixBackend {
    http: CrmHttp,
    entity: EntityKind,
}

impl BitrixBackend {
    pub fn new(http: CrmHttp, entity: EntityKind) -> Self {
        Self { http, entity }
    }

    fn record_filter(&self, query: &RecordQuery) -> Value {
        let mut filter = serde_json::Map::new();
        filter.insert(self.entity.status_field().to_string(), json!(query.status));
        let owner = match &query.owner {
            OwnerFilter::Unassigned => json!(0),
            OwnerFilter::Agent(id) => json!(id),
        };
        filter.insert("ASSIGNED_BY_ID".to_string(), owner);
        if let Some(cutoff) = query.created_after {
            filter.insert(
                ">DATE_CREATE".to_string(),
                json!(cutoff.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        Value::Object(filter)
    }

    /// Paginated GET: follows `next` offsets until the last page.
    async fn list_all<T: DeserializeOwned>(
        &self,
        operation: &str,
        mut params: Value,
    ) -> Result<Vec<T>, GatewayError> {
        let mut all = Vec::new();
        for _ in 0..MAX_PAGES {
            let body = self.http.call(operation, Method::GET, &params).await?;
            let page: Envelope<Vec<T>> = decode(operation, body)?;
            all.extend(page.result);

            match (page.next, params.as_object_mut()) {
                (Some(next), Some(map)) => {
                    map.insert("start".to_string(), json!(next));
                }
                _ => return Ok(all),
            }
        }
        tracing::warn!(operation, pages = MAX_PAGES, "page limit reached, list truncated");
        Ok(all)
    }

    fn to_work_record(&self, raw: BitrixRecord) -> WorkRecord {
        let status = match self.entity {
            EntityKind::Deal => raw.stage_id,
            EntityKind::Lead => raw.status_id,
        };
        WorkRecord {
            id: raw.id,
            title: raw.title.unwrap_or_default(),
            created_at: raw.date_create.unwrap_or_default(),
            owner: owner_from_wire(raw.assigned_by_id),
            status: status.unwrap_or_default(),
        }
    }
}

fn decode<T: DeserializeOwned>(operation: &str, body: Value) -> Result<T, GatewayError> {
    serde_json::from_value(body).map_err(|e| GatewayError::Remote {
        operation: operation.to_string(),
        status: 200,
        code: None,
        message: format!("unexpected response shape: {e}"),
    })
}

#[async_trait]
impl CrmBackend for BitrixBackend {
    fn name(&self) -> &str {
        "bitrix24"
    }

    async fn list_users(&self) -> Result<Vec<Agent>, GatewayError> {
        let params = json!({ "FILTER": { "ACTIVE": true } });
        let users: Vec<BitrixUser> = self.list_all("user.get", params).await?;
        Ok(users
            .into_iter()
            .filter(|u| u.is_active())
            .map(|u| Agent {
                online: u.is_online(),
                id: u.id,
                first_name: u.name.unwrap_or_default(),
                last_name: u.last_name.unwrap_or_default(),
                open_work_count: None,
            })
            .collect())
    }

    async fn list_work_records(&self, query: &RecordQuery) -> Result<Vec<WorkRecord>, GatewayError> {
        let params = json!({
            "filter": self.record_filter(query),
            "select": ["ID", "TITLE", "ASSIGNED_BY_ID", "DATE_CREATE", self.entity.status_field()],
            "order": { "DATE_CREATE": "ASC" },
        });
        let raw: Vec<BitrixRecord> = self.list_all(self.entity.list_method(), params).await?;
        Ok(raw.into_iter().map(|r| self.to_work_record(r)).collect())
    }

    async fn count_work_records(&self, query: &RecordQuery) -> Result<u32, GatewayError> {
        let operation = self.entity.list_method();
        let params = json!({
            "filter": self.record_filter(query),
            "select": ["ID"],
        });
        let body = self.http.call(operation, Method::GET, &params).await?;
        let page: Envelope<Vec<Value>> = decode(operation, body)?;
        let total = page.total.unwrap_or(page.result.len() as u64);
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }

    async fn update_work_record(&self, id: &str, owner: &str) -> Result<bool, GatewayError> {
        let params = json!({
            "id": id,
            "fields": { "ASSIGNED_BY_ID": owner },
        });
        let body = self
            .http
            .call(self.entity.update_method(), Method::POST, &params)
            .await?;
        Ok(body.get("result").is_some_and(is_truthy))
    }
}
