//! Jenkins build collaborator
//!
//! Triggers a job, follows the queue item to a build number, then polls the
//! build until it stops running. Both waits share one caller-supplied
//! deadline; running out of time is a [`BuildError::Timeout`], never a
//! build failure.

use crate::pipeline::collaborators::{BuildArtifact, BuildCollaborator, BuildInfo, BuildStatus, CollaboratorError};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Jenkins request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Jenkins API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected Jenkins response: {0}")]
    Parse(String),

    #[error("{what} timed out after {}s", .after.as_secs())]
    Timeout { what: String, after: Duration },
}

impl From<BuildError> for CollaboratorError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Request(e) => CollaboratorError::Transport(e.to_string()),
            BuildError::Api { status, message } => CollaboratorError::Rejected { status, body: message },
            BuildError::Parse(message) => CollaboratorError::InvalidResponse(message),
            BuildError::Timeout { what, after } => CollaboratorError::Timeout { operation: what, after },
        }
    }
}

#[derive(Debug, Clone)]
pub struct JenkinsConfig {
    pub url: String,
    pub username: String,
    pub api_token: String,
    pub poll_interval: Duration,
}

#[derive(Deserialize)]
struct QueueItem {
    executable: Option<Executable>,
}

#[derive(Deserialize)]
struct Executable {
    number: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildJson {
    #[serde(default)]
    building: bool,
    result: Option<String>,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    artifacts: Vec<ArtifactJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactJson {
    file_name: String,
    relative_path: String,
}

/// Queue id from the `Location` header Jenkins returns on trigger
pub fn queue_id_from_location(location: &str) -> Option<u64> {
    location.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

/// Call `check` every `interval` until it yields a value or `timeout` elapses
pub async fn poll_until<T, F, Fut>(what: &str, interval: Duration, timeout: Duration, mut check: F) -> Result<T, BuildError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, BuildError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(BuildError::Timeout {
                what: what.to_string(),
                after: timeout,
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[derive(Debug, Clone)]
pub struct JenkinsClient {
    base_url: String,
    username: String,
    api_token: String,
    poll_interval: Duration,
    client: Client,
}

impl JenkinsClient {
    pub fn new(config: JenkinsConfig) -> Result<Self, BuildError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username,
            api_token: config.api_token,
            poll_interval: config.poll_interval,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn console_url(&self, job: &str, build_number: u64) -> String {
        format!("{}/job/{}/{}/console", self.base_url, job, build_number)
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T, BuildError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BuildError::Api {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| BuildError::Parse(format!("Failed to parse JSON response: {}", e)))
    }

    /// Trigger `job`, returning the queue item id
    pub async fn trigger_build(&self, job: &str, parameters: &BTreeMap<String, String>) -> Result<u64, BuildError> {
        let url = if parameters.is_empty() {
            format!("{}/job/{}/build", self.base_url, job)
        } else {
            format!("{}/job/{}/buildWithParameters", self.base_url, job)
        };

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.api_token))
            .form(parameters)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(BuildError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| BuildError::Parse("trigger response has no queue Location".to_string()))?;
        queue_id_from_location(location)
            .ok_or_else(|| BuildError::Parse(format!("cannot read queue id from '{}'", location)))
    }

    /// Build number for a queue item, `None` while still queued
    pub async fn queued_build_number(&self, queue_id: u64) -> Result<Option<u64>, BuildError> {
        let url = format!("{}/queue/item/{}/api/json", self.base_url, queue_id);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.api_token))
            .send()
            .await?;
        if !response.status().is_success() {
            debug!("Queue item {} not readable yet ({})", queue_id, response.status());
            return Ok(None);
        }
        let item: QueueItem = self.handle_response(response).await?;
        Ok(item.executable.map(|e| e.number))
    }

    pub async fn build_info(&self, job: &str, build_number: u64) -> Result<BuildInfo, BuildError> {
        let url = format!("{}/job/{}/{}/api/json", self.base_url, job, build_number);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.api_token))
            .send()
            .await?;
        let build: BuildJson = self.handle_response(response).await?;

        Ok(BuildInfo {
            job_name: job.to_string(),
            build_number,
            status: BuildStatus::from_result(build.result.as_deref(), build.building),
            duration_ms: build.duration,
            console_url: self.console_url(job, build_number),
            artifacts: build
                .artifacts
                .into_iter()
                .map(|a| BuildArtifact {
                    file_name: a.file_name,
                    relative_path: a.relative_path,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl BuildCollaborator for JenkinsClient {
    async fn trigger_and_wait(
        &self,
        job: &str,
        parameters: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<BuildInfo, CollaboratorError> {
        let started = Instant::now();
        let queue_id = self.trigger_build(job, parameters).await?;
        info!("Triggered Jenkins job {} (queue item {})", job, queue_id);

        let build_number = poll_until(
            &format!("waiting for {} to leave the queue", job),
            self.poll_interval,
            timeout,
            move || self.queued_build_number(queue_id),
        )
        .await?;
        info!("Jenkins job {} started build #{}", job, build_number);

        let remaining = timeout.saturating_sub(started.elapsed());
        let build = poll_until(&format!("build {} #{}", job, build_number), self.poll_interval, remaining, move || async move {
            let info = self.build_info(job, build_number).await?;
            Ok::<_, BuildError>(match info.status {
                BuildStatus::Running | BuildStatus::Pending => None,
                _ => Some(info),
            })
        })
        .await?;

        info!(
            "Jenkins build {} #{} finished {} in {} ms",
            job, build.build_number, build.status, build.duration_ms
        );
        Ok(build)
    }
}
