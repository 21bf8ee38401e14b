//! CI status lookups for the `status_success` selection policy.
//!
//! Lookups are best-effort: any failure is reported as "no status" and the
//! revision is treated as not successful. Nothing is retried.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::CiStatusConfig;

/// The only state that qualifies a revision.
pub const SUCCESS_STATE: &str = "success";

/// Source of combined CI status per revision.
#[async_trait]
pub trait CiStatusSource: Send + Sync {
    /// Combined status string for the revision, `None` when unknown.
    async fn status(&self, revision: &str) -> Option<String>;
}

#[derive(Deserialize)]
struct CombinedStatus {
    state: String,
}

/// GitHub combined-status client.
pub struct GithubStatusClient {
    config: CiStatusConfig,
    http_client: reqwest::Client,
}

impl GithubStatusClient {
    pub fn new(config: CiStatusConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("backfill/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            config,
            http_client,
        }
    }

    fn status_url(&self, revision: &str) -> String {
        format!(
            "{}/repos/{}/commits/{}/status",
            self.config.api_url.trim_end_matches('/'),
            self.config.repo_slug,
            revision
        )
    }
}

#[async_trait]
impl CiStatusSource for GithubStatusClient {
    async fn status(&self, revision: &str) -> Option<String> {
        let url = self.status_url(revision);
        let mut request = self.http_client.get(&url);
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("token {token}"));
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(revision = %revision, error = %e, "CI status lookup failed");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(
                revision = %revision,
                status = response.status().as_u16(),
                "CI status lookup rejected"
            );
            return None;
        }

        match response.json::<CombinedStatus>().await {
            Ok(body) => {
                debug!(revision = %revision, state = %body.state, "CI status");
                Some(body.state)
            }
            Err(e) => {
                warn!(revision = %revision, error = %e, "CI status response unreadable");
                None
            }
        }
    }
}
