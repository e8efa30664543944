//! CRM gateway: the HTTP edge of the system.

pub mod error;
pub mod http;
pub mod types;

pub use error::GatewayError;
pub use http::{CrmHttp, RetryPolicy};

use anyhow::Context;
use std::time::Duration;

/// Environment variable that overrides `crm.webhook_url`.
pub const WEBHOOK_URL_ENV: &str = "BITRIX24_WEBHOOK_URL";

/// Connection settings for the CRM.
#[derive(Debug, Clone)]
pub struct CrmSettings {
    pub webhook_url: String,
    pub policy: RetryPolicy,
    pub timeout: Duration,
}

impl CrmSettings {
    /// Load from config. The webhook URL embeds the access token, so it is
    /// normally supplied through `BITRIX24_WEBHOOK_URL` rather than a file.
    pub fn from_config() -> anyhow::Result<Self> {
        let webhook_url = std::env::var(WEBHOOK_URL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(Ok)
            .unwrap_or_else(|| crate::config::get("crm.webhook_url"))
            .with_context(|| {
                format!("CRM webhook URL not configured, set {WEBHOOK_URL_ENV} or crm.webhook_url")
            })?;

        let defaults = RetryPolicy::default();
        let policy = RetryPolicy {
            max_retries: crate::config::get_or("crm.max_retries", defaults.max_retries),
            backoff_unit: Duration::from_millis(crate::config::get_or(
                "crm.backoff_ms",
                defaults.backoff_unit.as_millis() as u64,
            )),
        };

        Ok(Self {
            webhook_url,
            policy,
            timeout: Duration::from_secs(crate::config::get_or("crm.timeout_seconds", 30)),
        })
    }

    pub fn client(&self) -> anyhow::Result<CrmHttp> {
        CrmHttp::new(&self.webhook_url, self.policy, self.timeout)
    }
}
