//! HTTP transport for `offsync-server`.

use std::time::Duration;

use reqwest::{Client, Request, StatusCode};

use super::{SyncTransport, TransportError};
use crate::protocol::{PullQuery, PullResponse, PushEntry, PushRequest, PushResponse, PushResult};
use crate::util::compact_text;

/// Client for the `/v1/sync` endpoints
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    token: Option<String>,
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Builds a transport for an explicit server base URL.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let base_url = normalize_base_url(&base_url.into())?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| {
                TransportError::Connection(format!("Failed to construct HTTP client: {error}"))
            })?;
        Ok(Self {
            base_url,
            token: token.filter(|token| !token.trim().is_empty()),
            client,
            timeout,
        })
    }

    /// Returns the base URL this transport was configured with.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_push_request(&self, entries: &[PushEntry]) -> Result<Request, TransportError> {
        let mut request = self
            .client
            .post(format!("{}/v1/sync/push", self.base_url))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&PushRequest {
                entries: entries.to_vec(),
            });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request.build().map_err(|error| self.map_error(&error))
    }

    fn build_pull_request(
        &self,
        since: Option<&str>,
        limit: usize,
    ) -> Result<Request, TransportError> {
        let mut request = self
            .client
            .get(format!("{}/v1/sync/pull", self.base_url))
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&PullQuery {
                since: since.map(ToString::to_string),
                limit: Some(limit),
            });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request.build().map_err(|error| self.map_error(&error))
    }

    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        request: Request,
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|error| self.map_error(&error))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| TransportError::Decode(error.to_string()))
    }

    fn map_error(&self, error: &reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if error.is_decode() {
            TransportError::Decode(error.to_string())
        } else {
            TransportError::Connection(error.to_string())
        }
    }
}

impl SyncTransport for HttpTransport {
    async fn push(&self, entries: &[PushEntry]) -> Result<Vec<PushResult>, TransportError> {
        let request = self.build_push_request(entries)?;
        let response: PushResponse = self.execute(request).await?;
        Ok(response.results)
    }

    async fn pull(
        &self,
        since: Option<&str>,
        limit: usize,
    ) -> Result<PullResponse, TransportError> {
        let request = self.build_pull_request(since, limit)?;
        self.execute(request).await
    }
}

fn http_error(status: StatusCode, body: &str) -> TransportError {
    // Servers answer errors as {"error": "..."}; fall back to the raw body
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("error")?.as_str().map(ToString::to_string))
        .unwrap_or_else(|| compact_text(body));
    TransportError::Http {
        status: status.as_u16(),
        message,
    }
}

fn normalize_base_url(raw: &str) -> Result<String, TransportError> {
    let base = raw.trim().trim_end_matches('/').to_string();
    if base.is_empty() {
        return Err(TransportError::Connection(
            "Server URL must not be empty".to_string(),
        ));
    }
    if !crate::util::is_http_url(&base) {
        return Err(TransportError::Connection(
            "Server URL must include http:// or https://".to_string(),
        ));
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Operation, Record};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn transport(token: Option<&str>) -> HttpTransport {
        HttpTransport::new(
            "https://sync.example.com/",
            token.map(ToString::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url("").is_err());
        assert!(normalize_base_url("sync.example.com").is_err());
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        assert_eq!(transport(None).base_url(), "https://sync.example.com");
    }

    #[test]
    fn push_request_shape_is_correct() {
        let record = Record::new(json!({"name": "Acme"}), "device-a", 1);
        let entry = PushEntry {
            sequence: 1,
            op: Operation::Create,
            entity_id: record.id,
            base_version: 0,
            origin_id: "device-a".into(),
            idempotency_key: "key".into(),
            record,
        };
        let request = transport(Some("secret"))
            .build_push_request(&[entry])
            .unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(
            request.url().as_str(),
            "https://sync.example.com/v1/sync/push"
        );
        let auth = request
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(auth, "Bearer secret");
    }

    #[test]
    fn pull_request_carries_watermark() {
        let request = transport(None).build_pull_request(Some("42"), 100).unwrap();

        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(
            request.url().as_str(),
            "https://sync.example.com/v1/sync/pull?since=42&limit=100"
        );
        assert!(request
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .is_none());
    }

    #[test]
    fn blank_token_is_ignored() {
        let request = transport(Some("  ")).build_pull_request(None, 10).unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://sync.example.com/v1/sync/pull?limit=10"
        );
        assert!(request
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .is_none());
    }

    #[test]
    fn http_error_prefers_json_message() {
        let error = http_error(StatusCode::UNAUTHORIZED, r#"{"error":"Invalid token"}"#);
        assert_eq!(
            error,
            TransportError::Http {
                status: 401,
                message: "Invalid token".into()
            }
        );

        let error = http_error(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(
            error,
            TransportError::Http {
                status: 502,
                message: "upstream down".into()
            }
        );
    }
}
