//! Firebase Realtime Database store over REST
//!
//! Layout under the configured root:
//! - `ledgers/<pair-key>`: one [`LedgerRecord`] per pair, written with ETag
//!   conditional requests
//! - `events/<pair-key>/<push-id>`: append-only event log; push ids sort
//!   chronologically

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::common::errors::{EngineError, Result};
use crate::common::traits::DurableStore;
use crate::common::types::{EventLogEntry, LedgerRecord, Revision};

const ETAG_HEADER: &str = "ETag";

#[derive(Debug, Deserialize)]
struct PushResponse {
    name: String,
}

/// Node-safe key for a pair; `/` is not allowed in RTDB keys
pub fn pair_key(pair: &str) -> String {
    pair.chars()
        .map(|c| match c {
            '/' | '.' | '#' | '$' | '[' | ']' => '-',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct FirebaseStore {
    client: Client,
    database_url: String,
    root: String,
    auth_token: Option<String>,
}

impl FirebaseStore {
    pub fn new(database_url: &str, root: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self> {
        if database_url.trim().is_empty() {
            return Err(EngineError::Configuration("Firebase database URL is empty".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            database_url: database_url.trim_end_matches('/').to_string(),
            root: root.trim_matches('/').to_string(),
            auth_token,
        })
    }

    fn node_url(&self, path: &str) -> String {
        format!("{}/{}/{}.json", self.database_url, self.root, path)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.query(&[("auth", token.as_str())]),
            None => request,
        }
    }

    fn etag(response: &reqwest::Response) -> Result<Revision> {
        response
            .headers()
            .get(ETAG_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(Revision::new)
            .ok_or_else(|| EngineError::InvalidResponse("Firebase response has no ETag".into()))
    }

    async fn failure(response: reqwest::Response, action: &str) -> EngineError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            EngineError::transient("store", format!("{} returned {}: {}", action, status, body))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            EngineError::Authentication(format!("{}: {}", action, body))
        } else {
            EngineError::InvalidResponse(format!("{} returned {}: {}", action, status, body))
        }
    }
}

#[async_trait]
impl DurableStore for FirebaseStore {
    #[instrument(skip(self))]
    async fn get_ledger(&self, pair: &str) -> Result<(Option<LedgerRecord>, Revision)> {
        let url = self.node_url(&format!("ledgers/{}", pair_key(pair)));
        let response = self
            .authed(self.client.get(&url))
            .header("X-Firebase-ETag", "true")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::failure(response, "ledger read").await);
        }

        let revision = Self::etag(&response)?;
        let record: Option<LedgerRecord> = response.json().await?;
        debug!("Read ledger for {} at revision {}", pair, revision);
        Ok((record, revision))
    }

    #[instrument(skip(self, record))]
    async fn put_ledger(
        &self,
        pair: &str,
        record: &LedgerRecord,
        expected: &Revision,
    ) -> Result<Revision> {
        let url = self.node_url(&format!("ledgers/{}", pair_key(pair)));
        let response = self
            .authed(self.client.put(&url))
            .header("X-Firebase-ETag", "true")
            .header("if-match", expected.as_str())
            .json(record)
            .send()
            .await?;

        if response.status() == StatusCode::PRECONDITION_FAILED {
            let actual = Self::etag(&response).unwrap_or_else(|_| Revision::new("unknown"));
            warn!("Ledger write for {} rejected: revision moved to {}", pair, actual);
            return Err(EngineError::VersionConflict {
                expected: expected.clone(),
                actual,
            });
        }
        if !response.status().is_success() {
            return Err(Self::failure(response, "ledger write").await);
        }
        Self::etag(&response)
    }

    #[instrument(skip(self, entry), fields(pair = %entry.pair, epoch = entry.epoch))]
    async fn append_event(&self, entry: &EventLogEntry) -> Result<()> {
        let url = self.node_url(&format!("events/{}", pair_key(&entry.pair)));
        let response = self.authed(self.client.post(&url)).json(entry).send().await?;
        if !response.status().is_success() {
            return Err(Self::failure(response, "event append").await);
        }
        let pushed: PushResponse = response.json().await?;
        debug!("Appended {} as {}", entry.kind.label(), pushed.name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recent_events(&self, pair: &str, limit: usize) -> Result<Vec<EventLogEntry>> {
        let url = self.node_url(&format!("events/{}", pair_key(pair)));
        let response = self
            .authed(self.client.get(&url))
            .query(&[("orderBy", "\"$key\"".to_string()), ("limitToLast", limit.to_string())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::failure(response, "event read").await);
        }

        // Keyed by push id; BTreeMap restores chronological order
        let events: Option<BTreeMap<String, EventLogEntry>> = response.json().await?;
        Ok(events.unwrap_or_default().into_values().collect())
    }
}
