//! `RemoteQueue` over HTTP + JSON with a bearer token.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url, header};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::types::{ClaimEnvelope, ClaimRequest, Heartbeat, WorkerRegistration};
use super::{QueueError, RemoteQueue};
use crate::job::{Job, JobFailure, JobReport};
use crate::snapshot::Counters;

#[derive(Debug, Clone)]
pub struct HttpQueueConfig {
    /// API root, e.g. `https://queue.example.com/api/v1`.
    pub base_url: String,
    pub token: Option<String>,
    /// Transport-level timeout; callers also bound each call.
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpQueue {
    base_url: Url,
    client: Client,
}

impl HttpQueue {
    pub fn new(config: HttpQueueConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(token) = config.token.as_deref().filter(|t| !t.trim().is_empty()) {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .context("queue token contains characters not allowed in a header")?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .user_agent(concat!("roost/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build queue HTTP client")?;

        let base_url = Url::parse(config.base_url.trim())
            .with_context(|| format!("invalid queue URL {:?}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("queue URL {:?} cannot carry a path", config.base_url);
        }

        Ok(Self { base_url, client })
    }

    /// Append `segments` to the API root, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, QueueError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| QueueError::Malformed(format!("queue URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send and return the status and body of a successful response.
    async fn send(&self, request: RequestBuilder) -> Result<(StatusCode, String), QueueError> {
        let response = request
            .send()
            .await
            .map_err(|e| QueueError::Transient(format!("request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| QueueError::Transient(format!("response read failed: {e}")))?;

        if status.is_success() {
            Ok((status, body))
        } else {
            Err(classify(status, body))
        }
    }

    async fn send_status_only(&self, request: RequestBuilder) -> Result<(), QueueError> {
        self.send(request).await.map(|_| ())
    }
}

/// Map a non-success status to a [`QueueError`].
pub fn classify(status: StatusCode, body: String) -> QueueError {
    let code = status.as_u16();
    match code {
        401 | 403 => QueueError::Unauthorized { status: code },
        408 | 429 => QueueError::Transient(format!("status {code}")),
        _ if status.is_server_error() => QueueError::Transient(format!("status {code}: {body}")),
        _ => QueueError::Rejected { status: code, body },
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, QueueError> {
    serde_json::from_str(body).map_err(|e| QueueError::Malformed(e.to_string()))
}

#[async_trait]
impl RemoteQueue for HttpQueue {
    async fn register_worker(&self, registration: &WorkerRegistration) -> Result<(), QueueError> {
        let req = self.client.post(self.endpoint(&["workers"])?).json(registration);
        self.send_status_only(req).await
    }

    async fn claim_job(&self, request: &ClaimRequest) -> Result<Option<Job>, QueueError> {
        let url = self.endpoint(&[
            "habitats",
            &request.habitat_id,
            "queues",
            &request.queue_id,
            "claim",
        ])?;
        let req = self.client.post(url).json(request);
        let (status, body) = self.send(req).await?;
        if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
            return Ok(None);
        }
        let envelope: ClaimEnvelope = decode(&body)?;
        if let Some(job) = &envelope.job {
            debug!(job_id = %job.id, backend = %job.backend_type, "claimed job");
        }
        Ok(envelope.job)
    }

    async fn start_job(&self, job_id: &str) -> Result<(), QueueError> {
        let req = self
            .client
            .post(self.endpoint(&["jobs", job_id, "start"])?)
            .json(&serde_json::json!({}));
        self.send_status_only(req).await
    }

    async fn complete_job(&self, job_id: &str, report: &JobReport) -> Result<(), QueueError> {
        let req = self
            .client
            .post(self.endpoint(&["jobs", job_id, "complete"])?)
            .json(report);
        self.send_status_only(req).await
    }

    async fn fail_job(&self, job_id: &str, failure: &JobFailure) -> Result<(), QueueError> {
        let req = self
            .client
            .post(self.endpoint(&["jobs", job_id, "fail"])?)
            .json(failure);
        self.send_status_only(req).await
    }

    async fn heartbeat(&self, beat: &Heartbeat) -> Result<(), QueueError> {
        let req = self
            .client
            .post(self.endpoint(&["workers", &beat.worker_id, "heartbeat"])?)
            .json(beat);
        self.send_status_only(req).await
    }

    async fn deregister_worker(&self, worker_id: &str, counters: &Counters) -> Result<(), QueueError> {
        let req = self
            .client
            .delete(self.endpoint(&["workers", worker_id])?)
            .json(counters);
        self.send_status_only(req).await
    }
}
