//! HTTP worker collaborator
//!
//! A remote worker service hosts the design, dev, test and security agents
//! plus the deploy target. Each role is one [`HttpWorker`] pointing at the
//! same base URL:
//!
//! - `POST {base}/agents/{role}/tasks` runs a [`WorkTask`]
//! - `POST {base}/deploy` and `POST {base}/rollback` drive deployments

use crate::pipeline::collaborators::{
    CollaboratorError, DeployCollaborator, DeployRequest, DeployResult, SecurityCollaborator, WorkCollaborator,
    WorkTask,
};
use crate::pipeline::types::{Environment, WorkOutcome};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RollbackRequest<'a> {
    environment: Environment,
    target_version: &'a str,
    reason: &'a str,
    approver: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpWorker {
    base_url: String,
    role: String,
    timeout: Duration,
    client: Client,
}

impl HttpWorker {
    pub fn new(base_url: impl Into<String>, role: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let base_url = base_url.into();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            role: role.into(),
            timeout,
            client,
        })
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn task_url(&self) -> String {
        format!("{}/agents/{}/tasks", self.base_url, self.role)
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T, CollaboratorError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CollaboratorError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, url: &str, body: &B) -> Result<T, CollaboratorError> {
        let response = self.client.post(url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                CollaboratorError::Timeout {
                    operation: format!("{} worker call", self.role),
                    after: self.timeout,
                }
            } else {
                CollaboratorError::Transport(e.to_string())
            }
        })?;
        self.handle_response(response).await
    }

    async fn submit(&self, task: &WorkTask) -> Result<WorkOutcome, CollaboratorError> {
        debug!("Dispatching {:?} task {} to {} worker", task.kind, task.id, self.role);
        self.post(&self.task_url(), task).await
    }
}

#[async_trait]
impl WorkCollaborator for HttpWorker {
    async fn run(&self, task: &WorkTask) -> Result<WorkOutcome, CollaboratorError> {
        self.submit(task).await
    }
}

#[async_trait]
impl SecurityCollaborator for HttpWorker {
    async fn scan(&self, task: &WorkTask) -> Result<WorkOutcome, CollaboratorError> {
        self.submit(task).await
    }
}

#[async_trait]
impl DeployCollaborator for HttpWorker {
    async fn deploy(&self, request: &DeployRequest) -> Result<DeployResult, CollaboratorError> {
        self.post(&format!("{}/deploy", self.base_url), request).await
    }

    async fn rollback(
        &self,
        environment: Environment,
        target_version: &str,
        reason: &str,
        approver: &str,
    ) -> Result<DeployResult, CollaboratorError> {
        let body = RollbackRequest {
            environment,
            target_version,
            reason,
            approver,
        };
        self.post(&format!("{}/rollback", self.base_url), &body).await
    }
}

/// Stand-in used when no worker URL is configured; every call fails the stage
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredWorker;

impl UnconfiguredWorker {
    fn missing() -> CollaboratorError {
        CollaboratorError::NotConfigured("CHANGEGATE_WORKER_URL is not set".to_string())
    }
}

#[async_trait]
impl WorkCollaborator for UnconfiguredWorker {
    async fn run(&self, _task: &WorkTask) -> Result<WorkOutcome, CollaboratorError> {
        Err(Self::missing())
    }
}

#[async_trait]
impl SecurityCollaborator for UnconfiguredWorker {
    async fn scan(&self, _task: &WorkTask) -> Result<WorkOutcome, CollaboratorError> {
        Err(Self::missing())
    }
}

#[async_trait]
impl DeployCollaborator for UnconfiguredWorker {
    async fn deploy(&self, _request: &DeployRequest) -> Result<DeployResult, CollaboratorError> {
        Err(Self::missing())
    }

    async fn rollback(&self, _: Environment, _: &str, _: &str, _: &str) -> Result<DeployResult, CollaboratorError> {
        Err(Self::missing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::collaborators::{TaskContext, TaskKind};
    use axum::{extract::Path, http::StatusCode, routing::post, Json, Router};
    use pretty_assertions::assert_eq;

    async fn spawn_worker() -> String {
        async fn task(Path(role): Path<String>, Json(task): Json<WorkTask>) -> Result<Json<WorkOutcome>, StatusCode> {
            if role == "broken" {
                return Err(StatusCode::BAD_GATEWAY);
            }
            Ok(Json(
                WorkOutcome::ok(format!("{} handled {}", role, task.description))
                    .with_artifacts(vec!["src/lib.rs".to_string()]),
            ))
        }

        async fn deploy(Json(request): Json<DeployRequest>) -> Json<DeployResult> {
            if request.environment == Environment::Prod {
                Json(DeployResult::failed("prod cluster unreachable"))
            } else {
                Json(DeployResult::ok())
            }
        }

        let app = Router::new()
            .route("/agents/{role}/tasks", post(task))
            .route("/deploy", post(deploy));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn task(description: &str) -> WorkTask {
        WorkTask {
            id: "t-1".to_string(),
            kind: TaskKind::FixBug,
            description: description.to_string(),
            working_context: ".".to_string(),
            context: TaskContext::default(),
        }
    }

    #[test]
    fn test_task_url_trims_trailing_slash() {
        let worker = HttpWorker::new("http://workers.local/", "dev", DEFAULT_WORKER_TIMEOUT).unwrap();
        assert_eq!(worker.task_url(), "http://workers.local/agents/dev/tasks");
        assert_eq!(worker.role(), "dev");
    }

    #[tokio::test]
    async fn test_worker_round_trip() {
        let base = spawn_worker().await;
        let worker = HttpWorker::new(&base, "dev", DEFAULT_WORKER_TIMEOUT).unwrap();

        let outcome = WorkCollaborator::run(&worker, &task("null check")).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.content, "dev handled null check");
        assert_eq!(outcome.changed_artifacts, vec!["src/lib.rs".to_string()]);
    }

    #[tokio::test]
    async fn test_worker_error_status_is_rejected() {
        let base = spawn_worker().await;
        let worker = HttpWorker::new(&base, "broken", DEFAULT_WORKER_TIMEOUT).unwrap();

        let err = worker.scan(&task("scan")).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_deploy_result_is_passed_through() {
        let base = spawn_worker().await;
        let worker = HttpWorker::new(&base, "deploy", DEFAULT_WORKER_TIMEOUT).unwrap();
        let request = DeployRequest {
            run_id: None,
            environment: Environment::Prod,
            version: "1.0.3".to_string(),
            hash: String::new(),
            approvers: vec!["alice".to_string(), "bob".to_string()],
        };

        let result = worker.deploy(&request).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("prod cluster unreachable"));
    }

    #[tokio::test]
    async fn test_unconfigured_worker_fails() {
        let err = WorkCollaborator::run(&UnconfiguredWorker, &task("x")).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::NotConfigured(_)));
    }
}
