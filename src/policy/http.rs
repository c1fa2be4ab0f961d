//! HTTP client for a remote policy inference service
//!
//! The service publishes its current model version at `GET /version` and
//! serves `POST /infer` with the normalized state.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::common::errors::{EngineError, Result};
use crate::common::traits::{NormalizedState, PolicyInference, RawPolicyOutput};

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    version: &'a str,
    state: &'a NormalizedState,
}

/// Remote policy inference over HTTP
#[derive(Debug, Clone)]
pub struct HttpPolicyClient {
    client: Client,
    base_url: String,
}

impl HttpPolicyClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PolicyInference for HttpPolicyClient {
    #[instrument(skip(self))]
    async fn current_version(&self) -> Result<String> {
        let url = format!("{}/version", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(EngineError::transient(
                "policy",
                format!("version endpoint returned {}", response.status()),
            ));
        }

        let body: VersionResponse = response.json().await?;
        if body.version.trim().is_empty() {
            return Err(EngineError::InvalidResponse("empty model version".into()));
        }
        Ok(body.version)
    }

    #[instrument(skip(self, state))]
    async fn infer(&self, version: &str, state: &NormalizedState) -> Result<RawPolicyOutput> {
        let url = format!("{}/infer", self.base_url);
        debug!("Requesting inference from {}", url);

        let response = self
            .client
            .post(&url)
            .json(&InferRequest { version, state })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::transient(
                "policy",
                format!("infer returned {}: {}", status, body),
            ));
        }

        // Unknown shapes still deserialize; validation happens in the adapter
        let raw: RawPolicyOutput = response.json().await?;
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state() -> NormalizedState {
        NormalizedState {
            pair: "BTC/USDT".into(),
            price_return: 0.01,
            price_zscore: 1.2,
            volume_ratio: 0.0,
            sentiment: 0.3,
            sentiment_confidence: 0.6,
        }
    }

    #[tokio::test]
    async fn test_version_and_infer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "ppo-17"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .and(body_partial_json(json!({"version": "ppo-17"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"direction": "BUY", "size_fraction": 0.25})),
            )
            .mount(&server)
            .await;

        let client = HttpPolicyClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let version = client.current_version().await.unwrap();
        assert_eq!(version, "ppo-17");

        let raw = client.infer(&version, &state()).await.unwrap();
        assert_eq!(raw, RawPolicyOutput::new("BUY", 0.25));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpPolicyClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let err = client.infer("v1", &state()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_fields_deserialize_for_validation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"action": "short"})))
            .mount(&server)
            .await;

        let client = HttpPolicyClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let raw = client.infer("v1", &state()).await.unwrap();
        assert_eq!(raw, RawPolicyOutput::default());
    }
}
