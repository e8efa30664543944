//! Bitrix24 REST response types.
//!
//! Bitrix serializes most scalars as strings but is not consistent about it
//! (IDs come back as `"17"` from list methods and `17` from some webhooks), so
//! the ID-like fields accept either.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Standard response envelope of list methods.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub result: T,
    /// Total matching rows across all pages.
    #[serde(default)]
    pub total: Option<u64>,
    /// Offset of the next page, absent on the last page.
    #[serde(default)]
    pub next: Option<u64>,
}

/// A portal user as returned by `user.get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitrixUser {
    #[serde(rename = "ID", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "NAME", default)]
    pub name: Option<String>,
    #[serde(rename = "LAST_NAME", default)]
    pub last_name: Option<String>,
    #[serde(rename = "ACTIVE", default)]
    pub active: Option<Value>,
    #[serde(rename = "IS_ONLINE", default)]
    pub is_online: Option<Value>,
}

impl BitrixUser {
    pub fn is_active(&self) -> bool {
        self.active.as_ref().map(is_truthy).unwrap_or(true)
    }

    pub fn is_online(&self) -> bool {
        self.is_online.as_ref().map(is_truthy).unwrap_or(false)
    }
}

/// A deal or lead row from `crm.deal.list` / `crm.lead.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitrixRecord {
    #[serde(rename = "ID", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "TITLE", default)]
    pub title: Option<String>,
    #[serde(rename = "ASSIGNED_BY_ID", default, deserialize_with = "opt_string_or_number")]
    pub assigned_by_id: Option<String>,
    #[serde(rename = "DATE_CREATE", default)]
    pub date_create: Option<String>,
    /// Deal pipeline stage.
    #[serde(rename = "STAGE_ID", default)]
    pub stage_id: Option<String>,
    /// Lead status.
    #[serde(rename = "STATUS_ID", default)]
    pub status_id: Option<String>,
}

/// Bitrix flags arrive as `true`, `"Y"`, `"1"` or `"true"`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        Value::String(s) => matches!(s.as_str(), "Y" | "y" | "1" | "true"),
        _ => false,
    }
}

/// An owner ID of `0`, empty, or missing means "unassigned".
pub fn owner_from_wire(raw: Option<String>) -> Option<String> {
    raw.filter(|id| !id.is_empty() && id != "0")
}

pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
