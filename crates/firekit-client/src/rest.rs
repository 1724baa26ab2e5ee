//! REST/JSON transport.
//!
//! Production-grade transport with:
//! - Shared token cache across pooled clients
//! - HTTP client tuning (pooling, timeouts)
//! - Observability (tracing spans, metrics)
//!
//! Unary RPCs map to `POST {base}/{database}/documents:{verb}`; queries map
//! to `POST {base}/{parent}:runQuery`. Server-streaming RPCs return a JSON
//! array on REST, which is replayed as a stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, info_span, Instrument};

use crate::config::FirestoreConfig;
use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_request;
use crate::pool::ClientFactory;
use crate::token_cache::{ServiceAccountSource, TokenCache};
use crate::transport::{CallOptions, JsonStream, Method, SharedTransport, Transport};

/// Token the emulator accepts as a fully privileged caller.
const EMULATOR_TOKEN: &str = "owner";

/// How requests are authenticated.
#[derive(Clone)]
pub enum Credentials {
    OAuth(Arc<TokenCache>),
    Emulator,
}

impl Credentials {
    async fn token(&self) -> FirestoreResult<String> {
        match self {
            Credentials::OAuth(cache) => cache.get_token().await,
            Credentials::Emulator => Ok(EMULATOR_TOKEN.to_string()),
        }
    }

    async fn invalidate(&self) {
        if let Credentials::OAuth(cache) = self {
            cache.invalidate().await;
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// One pooled REST client.
pub struct RestTransport {
    http: Client,
    base_url: String,
    credentials: Credentials,
}

impl RestTransport {
    pub fn new(http: Client, base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    /// Split the routing field out of the body and build the route.
    fn route(&self, method: Method, mut request: serde_json::Value) -> FirestoreResult<(String, serde_json::Value)> {
        let field = method.routing_field();
        let resource = request
            .as_object_mut()
            .and_then(|body| body.remove(field))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| {
                FirestoreError::invalid_argument(format!(
                    "{} request is missing `{}`",
                    method.name(),
                    field
                ))
            })?;

        let url = match method {
            Method::RunQuery => format!("{}/{}:{}", self.base_url, resource, method.name()),
            _ => format!("{}/{}/documents:{}", self.base_url, resource, method.name()),
        };
        Ok((url, request))
    }

    fn is_access_token_expired(body: &str) -> bool {
        body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
    }

    fn build(&self, url: &str, body: &serde_json::Value, options: &CallOptions, token: &str) -> RequestBuilder {
        let mut builder = self.http.post(url).bearer_auth(token).json(body);
        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    /// Send a request, refreshing the token once if the server reports it expired.
    async fn send(&self, url: &str, body: &serde_json::Value, options: &CallOptions) -> FirestoreResult<Response> {
        let token = self.credentials.token().await?;
        let response = self.build(url, body, options, &token).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::check(response).await;
        }

        let text = response.text().await.unwrap_or_default();
        if !Self::is_access_token_expired(&text) {
            return Err(FirestoreError::from_rest_error_body(401, &text));
        }

        debug!("Access token expired, refreshing and resending");
        self.credentials.invalidate().await;
        let token = self.credentials.token().await?;
        let response = self.build(url, body, options, &token).send().await?;
        Self::check(response).await
    }

    async fn check(response: Response) -> FirestoreResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(secs) = retry_after {
                return Err(FirestoreError::RateLimited(secs * 1000));
            }
        }

        let body = response.text().await.unwrap_or_default();
        Err(FirestoreError::from_rest_error_body(status.as_u16(), &body))
    }

    async fn execute_request<T, F>(&self, method: Method, options: &CallOptions, fut: F) -> FirestoreResult<T>
    where
        F: std::future::Future<Output = FirestoreResult<T>>,
    {
        let span = info_span!(
            "firestore_request",
            method = method.name(),
            request_tag = %options.request_tag
        );

        let start = Instant::now();
        let result = fut.instrument(span).await;
        let latency_ms = start.elapsed().as_millis() as f64;

        let status = match &result {
            Ok(_) => "OK",
            Err(e) => e.code().map(|c| c.as_str()).unwrap_or("UNKNOWN"),
        };
        record_request(method.name(), status, latency_ms);

        result
    }
}

/// Turn one element of a streamed REST response into an item or an error.
fn stream_item(item: serde_json::Value) -> FirestoreResult<serde_json::Value> {
    match item.get("error") {
        Some(error) => Err(FirestoreError::from_rest_error_body(
            500,
            &serde_json::json!({ "error": error }).to_string(),
        )),
        None => Ok(item),
    }
}

#[async_trait]
impl Transport for RestTransport {
    async fn invoke_unary(
        &self,
        method: Method,
        request: serde_json::Value,
        options: &CallOptions,
    ) -> FirestoreResult<serde_json::Value> {
        let (url, body) = self.route(method, request)?;
        self.execute_request(method, options, async {
            let response = self.send(&url, &body, options).await?;
            let text = response.text().await?;
            if text.trim().is_empty() {
                return Ok(serde_json::json!({}));
            }
            Ok(serde_json::from_str(&text)?)
        })
        .await
    }

    async fn invoke_stream(
        &self,
        method: Method,
        request: serde_json::Value,
        options: &CallOptions,
    ) -> FirestoreResult<JsonStream> {
        let (url, body) = self.route(method, request)?;
        let items: Vec<serde_json::Value> = self
            .execute_request(method, options, async {
                let response = self.send(&url, &body, options).await?;
                Ok(response.json().await?)
            })
            .await?;

        debug!(method = method.name(), items = items.len(), "Received streamed response");
        Ok(Box::pin(futures::stream::iter(items.into_iter().map(stream_item))))
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Creates one HTTP client per pool entry, all sharing the same credentials.
pub struct RestTransportFactory {
    base_url: String,
    timeout: Duration,
    connect_timeout: Duration,
    credentials: Credentials,
}

impl RestTransportFactory {
    /// Resolve credentials for `config`: the emulator needs none, production
    /// loads the service account named by `GOOGLE_APPLICATION_CREDENTIALS`.
    pub fn from_config(config: &FirestoreConfig) -> FirestoreResult<Self> {
        let credentials = if config.is_emulator() {
            Credentials::Emulator
        } else {
            let source = ServiceAccountSource::from_env()?;
            Credentials::OAuth(Arc::new(TokenCache::new(Arc::new(source))))
        };
        Ok(Self::with_credentials(config, credentials))
    }

    pub fn with_credentials(config: &FirestoreConfig, credentials: Credentials) -> Self {
        Self {
            base_url: config.base_url(),
            timeout: config.timeout,
            connect_timeout: config.connect_timeout,
            credentials,
        }
    }
}

impl ClientFactory<SharedTransport> for RestTransportFactory {
    fn create(&self) -> FirestoreResult<SharedTransport> {
        let http = Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("firekit-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FirestoreError::Network)?;

        Ok(Arc::new(RestTransport::new(
            http,
            self.base_url.clone(),
            self.credentials.clone(),
        )))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use firekit_models::Code;
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn emulator_transport(server: &MockServer) -> RestTransport {
        let config = FirestoreConfig::new("proj")
            .with_database("db1")
            .with_emulator(server.address().to_string());
        let factory = RestTransportFactory::with_credentials(&config, Credentials::Emulator);
        RestTransport::new(Client::new(), factory.base_url, Credentials::Emulator)
    }

    fn options() -> CallOptions {
        CallOptions {
            request_tag: "test".to_string(),
            headers: vec![(
                "google-cloud-resource-prefix".to_string(),
                "projects/proj/databases/db1".to_string(),
            )],
        }
    }

    #[tokio::test]
    async fn test_unary_routes_database_into_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/proj/databases/db1/documents:commit"))
            .and(header("authorization", "Bearer owner"))
            .and(header("google-cloud-resource-prefix", "projects/proj/databases/db1"))
            .and(body_json(json!({ "writes": [] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "commitTime": "2024-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = emulator_transport(&server);
        let response = transport
            .invoke_unary(
                Method::Commit,
                json!({ "database": "projects/proj/databases/db1", "writes": [] }),
                &options(),
            )
            .await
            .unwrap();
        assert_eq!(response["commitTime"], "2024-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_query_routes_parent_into_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/proj/databases/db1/documents/users/alice:runQuery"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "document": { "name": "projects/proj/databases/db1/documents/users/alice/posts/p1" } },
                { "readTime": "2024-01-01T00:00:00Z" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let transport = emulator_transport(&server);
        let stream = transport
            .invoke_stream(
                Method::RunQuery,
                json!({
                    "parent": "projects/proj/databases/db1/documents/users/alice",
                    "structuredQuery": { "from": [] }
                }),
                &options(),
            )
            .await
            .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.is_ok()));
    }

    #[tokio::test]
    async fn test_error_body_maps_to_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": { "code": 409, "message": "Transaction lock timeout", "status": "ABORTED" }
            })))
            .mount(&server)
            .await;

        let transport = emulator_transport(&server);
        let err = transport
            .invoke_unary(
                Method::Commit,
                json!({ "database": "projects/proj/databases/db1", "writes": [] }),
                &options(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(Code::Aborted));
    }

    #[tokio::test]
    async fn test_retry_after_is_honored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
            .mount(&server)
            .await;

        let transport = emulator_transport(&server);
        let err = transport
            .invoke_unary(
                Method::BatchWrite,
                json!({ "database": "projects/proj/databases/db1", "writes": [] }),
                &options(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.retry_after_ms(), Some(2000));
    }

    #[tokio::test]
    async fn test_missing_routing_field_is_rejected() {
        let server = MockServer::start().await;
        let transport = emulator_transport(&server);
        let err = transport
            .invoke_unary(Method::Commit, json!({ "writes": [] }), &options())
            .await
            .unwrap_err();
        assert!(matches!(err, FirestoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_stream_item_error_element() {
        let item = json!({ "error": { "code": 503, "message": "backend unavailable", "status": "UNAVAILABLE" } });
        assert_eq!(stream_item(item).unwrap_err().code(), Some(Code::Unavailable));
    }

    #[test]
    fn test_token_expiry_detection() {
        assert!(RestTransport::is_access_token_expired(r#"{"error":{"status":"UNAUTHENTICATED"}}"#));
        assert!(!RestTransport::is_access_token_expired("permission denied"));
    }
}
