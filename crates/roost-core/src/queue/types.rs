//! Request and response bodies of the remote queue API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::snapshot::Counters;

/// Body of `POST workers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub habitat_id: String,
    pub queue_id: String,
    pub backend_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub name: String,
    pub version: String,
}

/// Claim request. Habitat and queue go in the path, the rest in the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    #[serde(skip)]
    pub habitat_id: String,
    #[serde(skip)]
    pub queue_id: String,
    pub worker_id: String,
    pub backend_types: Vec<String>,
}

/// Claim response: `{"job": {...}}` or `{"job": null}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimEnvelope {
    #[serde(default)]
    pub job: Option<Job>,
}

/// Body of `POST workers/{worker}/heartbeat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_job_id: Option<String>,
    pub counters: Counters,
    pub sent_at: DateTime<Utc>,
}
