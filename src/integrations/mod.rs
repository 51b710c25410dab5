//! External collaborators
//!
//! HTTP-backed implementations of the collaborator traits: Jenkins for
//! builds, Artifactory for artifact storage and a generic worker service for
//! everything else.

pub mod artifactory;
pub mod jenkins;
pub mod worker;

pub use artifactory::{ArtifactError, ArtifactoryClient, ArtifactoryConfig};
pub use jenkins::{BuildError, JenkinsClient, JenkinsConfig};
pub use worker::{HttpWorker, UnconfiguredWorker};

use crate::config::Settings;
use crate::pipeline::collaborators::{ArtifactCollaborator, BuildCollaborator, CollaboratorError, Collaborators};
use std::sync::Arc;
use tracing::{info, warn};

/// Wire the collaborator bundle described by `settings`
pub fn collaborators_from_settings(settings: &Settings) -> Result<Collaborators, CollaboratorError> {
    let build: Option<Arc<dyn BuildCollaborator>> = match &settings.jenkins {
        Some(config) => {
            info!("Build collaborator: Jenkins at {}", config.url);
            Some(Arc::new(JenkinsClient::new(config.clone())?))
        }
        None => None,
    };

    let artifact: Option<Arc<dyn ArtifactCollaborator>> = match &settings.artifactory {
        Some(config) => {
            info!("Artifact collaborator: Artifactory at {} ({})", config.url, config.repository);
            Some(Arc::new(ArtifactoryClient::new(config.clone())?))
        }
        None => None,
    };

    let Some(worker) = &settings.worker else {
        warn!("CHANGEGATE_WORKER_URL not set; runs will fail at their first stage");
        return Ok(Collaborators {
            design: Arc::new(UnconfiguredWorker),
            dev: Arc::new(UnconfiguredWorker),
            test: Arc::new(UnconfiguredWorker),
            security: Arc::new(UnconfiguredWorker),
            build,
            artifact,
            deploy: Arc::new(UnconfiguredWorker),
        });
    };

    info!("Work collaborators: worker service at {}", worker.url);
    let role = |name: &str| HttpWorker::new(&worker.url, name, worker.timeout).map(Arc::new);
    Ok(Collaborators {
        design: role("design")?,
        dev: role("dev")?,
        test: role("test")?,
        security: role("security")?,
        build,
        artifact,
        deploy: role("deploy")?,
    })
}
