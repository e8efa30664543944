//! Native `reqwest` client for the Bitrix24 REST webhook interface.
//!
//! Every remote call goes through [`CrmHttp::call`], which owns the retry
//! policy: HTTP 429 (and Bitrix's in-band `QUERY_LIMIT_EXCEEDED`) is retried
//! with linear backoff, every other failure propagates immediately.
//!
//! Reads and writes share the same policy. A write that was applied upstream
//! but still answered 429 will be sent again; the CRM is the only thing that
//! could deduplicate it.

use super::error::GatewayError;
use reqwest::{header, Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Bitrix error code for "too many requests" (sent with HTTP 503).
const QUERY_LIMIT_CODE: &str = "QUERY_LIMIT_EXCEEDED";

/// Longest slice of a raw response body kept in error messages.
const MAX_ERROR_BODY: usize = 300;

/// Linear rate-limit backoff: retry `n` waits `n * backoff_unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first rate-limited one.
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_unit: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based). Saturates at `Duration::MAX`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }
}

/// Result of a single HTTP exchange.
enum Attempt {
    Done(Value),
    RateLimited,
}

/// HTTP client for the CRM with connection pooling and the retry policy.
#[derive(Clone)]
pub struct CrmHttp {
    client: Client,
    base_url: String,
    policy: RetryPolicy,
}

impl CrmHttp {
    /// Create a client for a webhook base URL such as
    /// `https://portal.bitrix24.com/rest/1/<token>`.
    pub fn new(base_url: &str, policy: RetryPolicy, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("leadroute/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(4)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            policy,
        })
    }

    /// Invoke a REST method (`user.get`, `crm.deal.list`, ...) and return the
    /// full response envelope (`result`, `total`, `next`).
    ///
    /// `GET` encodes `params` as bracketed query pairs; other methods send
    /// them as a JSON body.
    pub async fn call(
        &self,
        operation: &str,
        method: Method,
        params: &Value,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}/{operation}", self.base_url);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.send_once(&url, operation, &method, params).await? {
                Attempt::Done(body) => return Ok(body),
                Attempt::RateLimited if attempts > self.policy.max_retries => {
                    tracing::warn!(operation, attempts, "CRM rate limit retries exhausted");
                    return Err(GatewayError::RateLimited {
                        operation: operation.to_string(),
                        attempts,
                    });
                }
                Attempt::RateLimited => {
                    let delay = self.policy.delay_for(attempts);
                    tracing::warn!(
                        operation,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "CRM rate limit hit, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        url: &str,
        operation: &str,
        method: &Method,
        params: &Value,
    ) -> Result<Attempt, GatewayError> {
        let network = |source| GatewayError::Network {
            operation: operation.to_string(),
            source,
        };

        let request = if *method == Method::GET {
            self.client.get(url).query(&query_pairs(params))
        } else {
            self.client.request(method.clone(), url).json(params)
        };

        let resp = request
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(network)?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(Attempt::RateLimited);
        }

        let text = resp.text().await.map_err(network)?;
        tracing::debug!(operation, %status, bytes = text.len(), "CRM response");
        parse_response(operation, status, &text)
    }
}

/// Classify a non-429 response: success envelope, rate limit, or remote error.
fn parse_response(operation: &str, status: StatusCode, text: &str) -> Result<Attempt, GatewayError> {
    let body: Option<Value> = serde_json::from_str(text).ok();
    let code = body
        .as_ref()
        .and_then(|b| b.get("error"))
        .and_then(|e| e.as_str())
        .map(str::to_string);

    if code.as_deref() == Some(QUERY_LIMIT_CODE) {
        return Ok(Attempt::RateLimited);
    }

    if status.is_success() && code.is_none() {
        return match body {
            Some(body) => Ok(Attempt::Done(body)),
            None => Err(GatewayError::Remote {
                operation: operation.to_string(),
                status: status.as_u16(),
                code: None,
                message: format!("invalid JSON response: {}", truncate(text)),
            }),
        };
    }

    let message = body
        .as_ref()
        .and_then(|b| b.get("error_description"))
        .and_then(|d| d.as_str())
        .map(str::to_string)
        .or_else(|| code.clone())
        .unwrap_or_else(|| truncate(text));

    Err(GatewayError::Remote {
        operation: operation.to_string(),
        status: status.as_u16(),
        code,
        message,
    })
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_ERROR_BODY).collect()
}

/// Flatten JSON params into PHP-style query pairs:
/// `{"filter": {"STATUS_ID": "NEW"}, "select": ["ID"]}` becomes
/// `filter[STATUS_ID]=NEW` and `select[0]=ID`.
pub fn query_pairs(params: &Value) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Value::Object(map) = params {
        for (key, value) in map {
            flatten_into(key.clone(), value, &mut pairs);
        }
    }
    pairs
}

fn flatten_into(prefix: String, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(format!("{prefix}[{key}]"), nested, out);
            }
        }
        Value::Array(items) => {
            for (idx, nested) in items.iter().enumerate() {
                flatten_into(format!("{prefix}[{idx}]"), nested, out);
            }
        }
        Value::String(s) => out.push((prefix, s.clone())),
        Value::Null => out.push((prefix, String::new())),
        other => out.push((prefix, other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_unit: Duration::from_millis(1),
        }
    }

    fn client(server: &MockServer, policy: RetryPolicy) -> CrmHttp {
        CrmHttp::new(&server.uri(), policy, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn delay_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3000));
        assert!(policy.delay_for(2) > policy.delay_for(1));
    }

    #[test]
    fn huge_backoff_unit_saturates() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_unit: Duration::from_secs(u64::MAX / 2),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(u64::MAX / 2));
        assert_eq!(policy.delay_for(3), Duration::MAX);
    }

    #[test]
    fn query_pairs_flatten_nested_params() {
        let pairs = query_pairs(&json!({
            "filter": { "STATUS_ID": "NEW", "ASSIGNED_BY_ID": 0 },
            "select": ["ID", "TITLE"],
            "start": 50
        }));
        assert!(pairs.contains(&("filter[STATUS_ID]".into(), "NEW".into())));
        assert!(pairs.contains(&("filter[ASSIGNED_BY_ID]".into(), "0".into())));
        assert!(pairs.contains(&("select[0]".into(), "ID".into())));
        assert!(pairs.contains(&("select[1]".into(), "TITLE".into())));
        assert!(pairs.contains(&("start".into(), "50".into())));
        assert_eq!(pairs.len(), 5);
    }

    #[test]
    fn query_pairs_ignore_non_object_root() {
        assert!(query_pairs(&json!(["ID"])).is_empty());
        assert!(query_pairs(&Value::Null).is_empty());
    }

    #[tokio::test]
    async fn success_returns_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/crm.deal.update"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": true })))
            .expect(1)
            .mount(&server)
            .await;

        let body = client(&server, fast_policy(3))
            .call("crm.deal.update", Method::POST, &json!({ "id": "1" }))
            .await
            .unwrap();
        assert_eq!(body["result"], json!(true));
    }

    #[tokio::test]
    async fn get_sends_params_as_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user.get"))
            .and(query_param("FILTER[ACTIVE]", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let body = client(&server, fast_policy(3))
            .call("user.get", Method::GET, &json!({ "FILTER": { "ACTIVE": true } }))
            .await
            .unwrap();
        assert_eq!(body["result"], json!([]));
    }

    #[tokio::test]
    async fn sustained_rate_limit_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/crm.deal.update"))
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&server)
            .await;

        let err = client(&server, fast_policy(3))
            .call("crm.deal.update", Method::POST, &json!({}))
            .await
            .unwrap_err();
        assert!(
            matches!(err, GatewayError::RateLimited { attempts: 4, .. }),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn rate_limit_recovers_before_retries_run_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/crm.deal.list"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/crm.deal.list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": [], "total": 0 })))
            .mount(&server)
            .await;

        let body = client(&server, fast_policy(3))
            .call("crm.deal.list", Method::GET, &json!({}))
            .await
            .unwrap();
        assert_eq!(body["total"], json!(0));
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
    }

    #[tokio::test]
    async fn retries_wait_linearly_increasing_delays() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user.get"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let policy = RetryPolicy {
            max_retries: 3,
            backoff_unit: Duration::from_millis(20),
        };
        let started = std::time::Instant::now();
        let err = client(&server, policy)
            .call("user.get", Method::GET, &json!({}))
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        // 20 + 40 + 60 ms of sleeping between the four requests
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn query_limit_body_counts_as_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/crm.deal.list"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "error": "QUERY_LIMIT_EXCEEDED",
                "error_description": "Too many requests"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let err = client(&server, fast_policy(1))
            .call("crm.deal.list", Method::GET, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/crm.deal.update"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, fast_policy(3))
            .call("crm.deal.update", Method::POST, &json!({}))
            .await
            .unwrap_err();
        match err {
            GatewayError::Remote {
                status, message, ..
            } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_band_error_is_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user.get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": "insufficient_scope",
                "error_description": "The request requires higher privileges"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, fast_policy(3))
            .call("user.get", Method::GET, &json!({}))
            .await
            .unwrap_err();
        match err {
            GatewayError::Remote { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("insufficient_scope"));
                assert_eq!(message, "The request requires higher privileges");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let http = CrmHttp::new("http://127.0.0.1:9", fast_policy(3), Duration::from_secs(2)).unwrap();
        let err = http
            .call("user.get", Method::GET, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Network { .. }), "got {err:?}");
    }
}
