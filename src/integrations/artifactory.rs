//! Artifactory artifact collaborator
//!
//! Checksums are computed locally before the upload is sent, passed as
//! `X-Checksum-*` headers, and compared against whatever the server echoes
//! back. Properties travel as matrix parameters on the target URL.

use crate::pipeline::collaborators::{ArtifactCollaborator, ArtifactMetadata, CollaboratorError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_REPOSITORY: &str = "libs-release-local";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Artifactory request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Artifactory API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Cannot read artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("{algorithm} mismatch: computed {local}, server reported {remote}")]
    ChecksumMismatch {
        algorithm: &'static str,
        local: String,
        remote: String,
    },

    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),
}

impl From<ArtifactError> for CollaboratorError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::Request(e) => CollaboratorError::Transport(e.to_string()),
            ArtifactError::Api { status, message } => CollaboratorError::Rejected { status, body: message },
            ArtifactError::Io(e) => CollaboratorError::Io(e),
            mismatch @ ArtifactError::ChecksumMismatch { .. } => CollaboratorError::Integrity(mismatch.to_string()),
            ArtifactError::InvalidPath(p) => CollaboratorError::InvalidResponse(p),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactoryConfig {
    pub url: String,
    pub username: String,
    pub api_key: String,
    pub repository: String,
    pub timeout: Duration,
}

/// Locally computed digests of an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksums {
    pub sha256: String,
    pub md5: String,
}

impl Checksums {
    pub fn compute(bytes: &[u8]) -> Self {
        Self {
            sha256: format!("{:x}", Sha256::digest(bytes)),
            md5: format!("{:x}", md5::compute(bytes)),
        }
    }

    /// Compare against checksums the server reported, if any
    pub fn verify(&self, remote: &RemoteChecksums) -> Result<(), ArtifactError> {
        let pairs = [
            ("sha256", &self.sha256, remote.sha256.as_ref()),
            ("md5", &self.md5, remote.md5.as_ref()),
        ];
        for (algorithm, local, remote) in pairs {
            if let Some(remote) = remote {
                if !remote.eq_ignore_ascii_case(local) {
                    return Err(ArtifactError::ChecksumMismatch {
                        algorithm,
                        local: local.clone(),
                        remote: remote.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoteChecksums {
    pub sha256: Option<String>,
    pub md5: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    repo: Option<String>,
    path: Option<String>,
    download_uri: Option<String>,
    #[serde(default)]
    checksums: RemoteChecksums,
}

/// `;k=v;k2=v2` suffix carrying artifact properties
pub fn matrix_params(properties: &BTreeMap<String, String>) -> String {
    properties
        .iter()
        .map(|(k, v)| format!(";{}={}", k, v))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ArtifactoryClient {
    base_url: String,
    username: String,
    api_key: String,
    repository: String,
    client: Client,
}

impl ArtifactoryClient {
    pub fn new(config: ArtifactoryConfig) -> Result<Self, ArtifactError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username,
            api_key: config.api_key,
            repository: config.repository,
            client,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.api_key.is_empty() {
            request.basic_auth(&self.username, None::<&str>)
        } else {
            request.header("X-JFrog-Art-Api", &self.api_key)
        }
    }

    pub fn artifact_url(&self, repository: &str, target_path: &str, name: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url,
            repository,
            target_path.trim_matches('/'),
            name
        )
    }

    pub async fn upload_file(
        &self,
        path: &Path,
        repository: Option<&str>,
        target_path: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<ArtifactMetadata, ArtifactError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ArtifactError::InvalidPath(path.display().to_string()))?;
        let repository = repository.unwrap_or(&self.repository).to_string();

        let bytes = tokio::fs::read(path).await?;
        let checksums = Checksums::compute(&bytes);
        let size_bytes = bytes.len() as u64;

        let url = self.artifact_url(&repository, target_path, &name);
        let response = self
            .authorize(self.client.put(format!("{}{}", url, matrix_params(properties))))
            .header("X-Checksum-Sha256", &checksums.sha256)
            .header("X-Checksum-Md5", &checksums.md5)
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ArtifactError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await.unwrap_or_default();
        let echoed: Option<UploadResponse> = match serde_json::from_str(&body) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Artifactory upload response for {} not parseable: {}", name, e);
                None
            }
        };

        if let Some(echoed) = &echoed {
            checksums.verify(&echoed.checksums)?;
        }

        let target = format!("{}/{}", target_path.trim_matches('/'), name);
        let metadata = ArtifactMetadata {
            repository: echoed
                .as_ref()
                .and_then(|e| e.repo.clone())
                .unwrap_or_else(|| repository.clone()),
            path: echoed
                .as_ref()
                .and_then(|e| e.path.clone())
                .unwrap_or(target),
            size_bytes,
            sha256: checksums.sha256,
            md5: checksums.md5,
            download_uri: echoed.and_then(|e| e.download_uri).unwrap_or(url),
        };

        info!(
            "Uploaded {} ({} bytes) to {}, sha256 {}",
            metadata.path, metadata.size_bytes, metadata.repository, metadata.sha256
        );
        Ok(metadata)
    }
}

#[async_trait]
impl ArtifactCollaborator for ArtifactoryClient {
    async fn upload(
        &self,
        path: &Path,
        repository: Option<&str>,
        target_path: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<ArtifactMetadata, CollaboratorError> {
        Ok(self.upload_file(path, repository, target_path, properties).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_checksums_of_known_input() {
        let sums = Checksums::compute(b"hello");
        assert_eq!(
            sums.sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(sums.md5, "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let sums = Checksums::compute(b"hello");
        let tampered = RemoteChecksums {
            sha256: Some("00".repeat(32)),
            md5: None,
        };
        let err = sums.verify(&tampered).unwrap_err();
        assert!(matches!(err, ArtifactError::ChecksumMismatch { algorithm: "sha256", .. }));

        let echoed = RemoteChecksums {
            sha256: Some(sums.sha256.to_uppercase()),
            md5: Some(sums.md5.clone()),
        };
        assert!(sums.verify(&echoed).is_ok());
        assert!(sums.verify(&RemoteChecksums::default()).is_ok());
    }

    #[test]
    fn test_mismatch_maps_to_integrity_error() {
        let err: CollaboratorError = ArtifactError::ChecksumMismatch {
            algorithm: "md5",
            local: "a".into(),
            remote: "b".into(),
        }
        .into();
        assert!(matches!(err, CollaboratorError::Integrity(_)));
    }

    #[test]
    fn test_matrix_params_and_url() {
        let mut props = BTreeMap::new();
        props.insert("version".to_string(), "1.0.7".to_string());
        props.insert("pipeline_id".to_string(), "abc".to_string());
        assert_eq!(matrix_params(&props), ";pipeline_id=abc;version=1.0.7");
        assert_eq!(matrix_params(&BTreeMap::new()), "");

        let client = ArtifactoryClient::new(ArtifactoryConfig {
            url: "https://artifacts.local/artifactory/".to_string(),
            username: "ci".to_string(),
            api_key: String::new(),
            repository: DEFAULT_REPOSITORY.to_string(),
            timeout: Duration::from_secs(120),
        })
        .unwrap();
        assert_eq!(
            client.artifact_url(DEFAULT_REPOSITORY, "/app/1.0.7/", "app.tar.gz"),
            "https://artifacts.local/artifactory/libs-release-local/app/1.0.7/app.tar.gz"
        );
    }

    #[tokio::test]
    async fn test_upload_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = ArtifactoryClient::new(ArtifactoryConfig {
            url: "http://127.0.0.1:9".to_string(),
            username: String::new(),
            api_key: "k".to_string(),
            repository: DEFAULT_REPOSITORY.to_string(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();

        let err = client
            .upload_file(&dir.path().join("missing.bin"), None, "app/1.0.0", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Io(_)));
    }
}
