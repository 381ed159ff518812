//! Generic REST provider adapter.
//!
//! Talks to any service exposing a small resource API:
//!
//! - `POST   {base}/resources`       create, returns `{physical_id, outputs}`
//! - `PUT    {base}/resources/{id}`  update, returns `{physical_id, outputs}`
//! - `DELETE {base}/resources/{id}`  delete
//!
//! Status codes are mapped onto [`ProviderError`] so the executor can decide
//! what is safe to retry.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, header};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use super::traits::{Provider, ProviderOp, Provisioned, ResourceRequest};
use crate::error::ProviderError;
use crate::state::StateRecord;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Fallback delay when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// REST provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResourceBody<'a> {
    kind: &'a str,
    name: &'a str,
    properties: &'a BTreeMap<String, Value>,
}

impl HttpProvider {
    /// Creates a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ProviderError> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(base_url: &str, token: Option<String>, timeout_secs: u64) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    fn physical_id(previous: &StateRecord) -> Result<&str, ProviderError> {
        previous
            .physical_id
            .as_deref()
            .ok_or_else(|| ProviderError::NotFound {
                physical_id: format!("<none recorded for {}>", previous.identity),
            })
    }

    async fn send(&self, op: ProviderOp, builder: reqwest::RequestBuilder) -> Result<Response, ProviderError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("{op} request failed: {e}")))?;

        let status = response.status();
        trace!("Provider {op} answered {status}");

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationFailed {
                message: format!("{op} rejected with status {status}"),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::api(
                op.to_string(),
                status.as_u16(),
                body,
                status.is_server_error(),
            ));
        }

        Ok(response)
    }

    async fn provisioned(op: ProviderOp, response: Response) -> Result<Provisioned, ProviderError> {
        let provisioned: Provisioned = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse {op} response: {e}"),
        })?;

        if provisioned.physical_id.is_empty() {
            return Err(ProviderError::InvalidResponse {
                message: format!("{op} response carried an empty physical id"),
            });
        }
        Ok(provisioned)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, request: &ResourceRequest) -> Result<Provisioned, ProviderError> {
        debug!("POST {}/resources for {}", self.base_url, request.id);
        let body = ResourceBody {
            kind: request.id.kind(),
            name: request.id.name(),
            properties: &request.properties,
        };

        let builder = self
            .client
            .post(format!("{}/resources", self.base_url))
            .json(&body);
        let response = self.send(ProviderOp::Create, builder).await?;
        Self::provisioned(ProviderOp::Create, response).await
    }

    async fn update(
        &self,
        request: &ResourceRequest,
        previous: &StateRecord,
    ) -> Result<Provisioned, ProviderError> {
        let physical_id = Self::physical_id(previous)?;
        debug!("PUT {}/resources/{physical_id} for {}", self.base_url, request.id);
        let body = ResourceBody {
            kind: request.id.kind(),
            name: request.id.name(),
            properties: &request.properties,
        };

        let builder = self
            .client
            .put(format!("{}/resources/{physical_id}", self.base_url))
            .json(&body);
        let response = self.send(ProviderOp::Update, builder).await?;
        Self::provisioned(ProviderOp::Update, response).await
    }

    async fn delete(&self, previous: &StateRecord) -> Result<(), ProviderError> {
        let physical_id = Self::physical_id(previous)?;
        debug!("DELETE {}/resources/{physical_id} for {}", self.base_url, previous.identity);

        let builder = self
            .client
            .delete(format!("{}/resources/{physical_id}", self.base_url));
        match self.send(ProviderOp::Delete, builder).await {
            Ok(_) => Ok(()),
            Err(ProviderError::Api { status: 404, .. }) => Err(ProviderError::NotFound {
                physical_id: physical_id.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceId;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ResourceRequest {
        ResourceRequest {
            id: ResourceId::parse("database.main").expect("valid"),
            properties: BTreeMap::from([(String::from("engine"), json!("postgres"))]),
        }
    }

    fn record(physical_id: &str) -> StateRecord {
        let mut record = StateRecord::new(request().id, request().properties);
        record.physical_id = Some(physical_id.to_string());
        record
    }

    #[tokio::test]
    async fn test_create_sends_resource_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "kind": "database",
                "name": "main",
                "properties": {"engine": "postgres"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "physical_id": "db-42",
                "outputs": {"endpoint": "db-42.internal:5432"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), Some(String::from("secret"))).expect("client");
        let provisioned = provider.create(&request()).await.expect("create");

        assert_eq!(provisioned.physical_id, "db-42");
        assert_eq!(provisioned.outputs["endpoint"], json!("db-42.internal:5432"));
    }

    #[tokio::test]
    async fn test_update_targets_physical_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/resources/db-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"physical_id": "db-42"})))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).expect("client");
        let provisioned = provider.update(&request(), &record("db-42")).await.expect("update");
        assert_eq!(provisioned.physical_id, "db-42");
        assert!(provisioned.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad engine"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/resources/db-1"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/resources/db-2"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).expect("client");

        let unavailable = provider.create(&request()).await.expect_err("503");
        assert!(unavailable.is_retryable());

        let rejected = provider.update(&request(), &record("db-42")).await.expect_err("422");
        assert_eq!(rejected, ProviderError::api("update", 422, "bad engine", false));

        let limited = provider.delete(&record("db-1")).await.expect_err("429");
        assert_eq!(limited, ProviderError::RateLimited { retry_after_secs: 7 });

        let denied = provider.delete(&record("db-2")).await.expect_err("401");
        assert!(matches!(denied, ProviderError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_resource_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/resources/db-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).expect("client");
        let err = provider.delete(&record("db-gone")).await.expect_err("404");
        assert_eq!(
            err,
            ProviderError::NotFound {
                physical_id: String::from("db-gone")
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_response_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).expect("client");
        let err = provider.create(&request()).await.expect_err("invalid");
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }
}
