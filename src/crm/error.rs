//! Gateway error taxonomy.

use thiserror::Error;

/// Failure of a single CRM call after the retry policy has run.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Rate limited on every attempt; `attempts` counts all requests sent.
    #[error("CRM call {operation} still rate-limited after {attempts} attempts")]
    RateLimited { operation: String, attempts: u32 },

    /// Transport-level failure (connect, timeout, broken body). Not retried.
    #[error("CRM call {operation} failed: {source}")]
    Network {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    /// The CRM answered, but with an error status or an in-band error body.
    #[error("CRM call {operation} failed ({status}): {message}")]
    Remote {
        operation: String,
        status: u16,
        code: Option<String>,
        message: String,
    },
}

impl GatewayError {
    /// Whether this error came from exhausting the rate-limit retries.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
