//! Dashboard upload.
//!
//! Results are posted as one batch: a JSON array of [`DashboardRecord`]s sent
//! as the single URL-encoded form field `json` to
//! `<base_url>/result/add/json/`. Upload problems never abort a run; they are
//! reported through [`UploadOutcome`].

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DashboardConfig;
use crate::domain::AggregatedResult;

/// Path of the batch endpoint, relative to the dashboard base URL.
pub const ADD_RESULTS_PATH: &str = "result/add/json/";

pub const TIME_UNITS: &str = "seconds";
pub const TIME_UNITS_TITLE: &str = "Time";

/// One result in the dashboard's wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardRecord {
    #[serde(rename = "commitid")]
    pub commit_id_short: String,
    #[serde(rename = "commitid_long")]
    pub commit_id: String,
    pub project: String,
    pub branch: String,
    pub executable: String,
    pub executable_description: String,
    pub environment: String,
    pub benchmark: String,
    pub units: String,
    pub units_title: String,
    #[serde(rename = "result_value")]
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_date: Option<String>,
}

impl DashboardRecord {
    pub fn from_result(result: &AggregatedResult) -> Self {
        Self {
            commit_id_short: result.build.commit_id_short.clone(),
            commit_id: result.build.commit_id.clone(),
            project: result.build.project.clone(),
            branch: result.build.branch.clone(),
            executable: result.build.executable.clone(),
            executable_description: result.build.executable_description.clone(),
            environment: result.run.environment.clone(),
            benchmark: result.summary.name.clone(),
            units: TIME_UNITS.to_string(),
            units_title: TIME_UNITS_TITLE.to_string(),
            mean: result.summary.mean,
            min: result.summary.min,
            max: result.summary.max,
            std_dev: result.summary.std_dev,
            revision_date: None,
        }
    }

    /// Attach the commit date of the revision.
    pub fn with_revision_date(mut self, date: DateTime<FixedOffset>) -> Self {
        self.revision_date = Some(date.format("%Y-%m-%d %H:%M:%S").to_string());
        self
    }
}

/// What happened to an upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Nothing was sent; the request that would have been made.
    DryRun { url: String, payload: String },
    /// Server acknowledged the batch.
    Accepted { body: String },
    /// Server answered with an HTTP error.
    Rejected { status: u16, body: String },
    /// No usable response.
    Unreachable { error: String },
    /// Empty batch, nothing to send.
    Empty,
}

impl UploadOutcome {
    /// Whether the results are known to be stored by the dashboard.
    pub fn is_accepted(&self) -> bool {
        matches!(self, UploadOutcome::Accepted { .. })
    }

    /// Short label used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            UploadOutcome::DryRun { .. } => "dry_run",
            UploadOutcome::Accepted { .. } => "accepted",
            UploadOutcome::Rejected { .. } => "rejected",
            UploadOutcome::Unreachable { .. } => "unreachable",
            UploadOutcome::Empty => "empty",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UploadOutcome::Rejected { .. } | UploadOutcome::Unreachable { .. }
        )
    }
}

/// Destination for aggregated results.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, records: &[DashboardRecord]) -> UploadOutcome;
}

/// HTTP uploader for a Codespeed-style dashboard.
pub struct DashboardUploader {
    config: DashboardConfig,
    http_client: reqwest::Client,
}

impl DashboardUploader {
    pub fn new(config: DashboardConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("backfill/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            config,
            http_client,
        }
    }

    /// Full URL of the batch endpoint.
    pub fn endpoint(&self) -> String {
        let base = &self.config.url;
        if base.ends_with('/') {
            format!("{base}{ADD_RESULTS_PATH}")
        } else {
            format!("{base}/{ADD_RESULTS_PATH}")
        }
    }
}

#[async_trait]
impl ResultPublisher for DashboardUploader {
    async fn publish(&self, records: &[DashboardRecord]) -> UploadOutcome {
        if records.is_empty() {
            warn!("no results to upload");
            return UploadOutcome::Empty;
        }

        let url = self.endpoint();
        let payload = match serde_json::to_string(records) {
            Ok(p) => p,
            Err(e) => {
                return UploadOutcome::Unreachable {
                    error: format!("cannot encode results: {e}"),
                }
            }
        };

        if self.config.dry_run {
            info!(url = %url, records = records.len(), data = %payload, "dry run, would have sent request");
            return UploadOutcome::DryRun { url, payload };
        }

        debug!(url = %url, records = records.len(), "posting results");
        let response = match self
            .http_client
            .post(&url)
            .form(&[("json", payload.as_str())])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %url, error = %e, "upload failed");
                return UploadOutcome::Unreachable {
                    error: e.to_string(),
                };
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            info!(url = %url, status = status.as_u16(), response = %body, "server response");
            UploadOutcome::Accepted { body }
        } else {
            warn!(url = %url, status = status.as_u16(), response = %body, "upload rejected");
            UploadOutcome::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }
}
