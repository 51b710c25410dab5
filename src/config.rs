//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use crate::integrations::artifactory::{ArtifactoryConfig, DEFAULT_REPOSITORY};
use crate::integrations::jenkins::{JenkinsConfig, DEFAULT_POLL_INTERVAL};
use crate::integrations::worker::DEFAULT_WORKER_TIMEOUT;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: 3000,
        }
    }
}

/// Where approvals, audit entries and deployment history are kept
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub audit_enabled: bool,
    pub summary_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./context_store"),
            audit_enabled: true,
            summary_cap: crate::audit::DEFAULT_SUMMARY_CAP,
        }
    }
}

/// Governance knobs
#[derive(Debug, Clone)]
pub struct GovernanceConfig {
    /// Identities allowed to give the second prod approval; empty means anyone
    pub prod_approvers: Vec<String>,
    pub build_timeout: Duration,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            prod_approvers: Vec::new(),
            build_timeout: crate::pipeline::orchestrator::DEFAULT_BUILD_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub url: String,
    pub timeout: Duration,
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub governance: GovernanceConfig,
    pub worker: Option<WorkerConfig>,
    pub jenkins: Option<JenkinsConfig>,
    pub artifactory: Option<ArtifactoryConfig>,
    pub cors: CorsConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup, unset keys falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let server = ServerConfig {
            host: var("HOST")
                .and_then(|h| h.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().host),
            port: var("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().port),
        };

        let store = StoreConfig {
            path: var("CHANGEGATE_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| StoreConfig::default().path),
            audit_enabled: match var("CHANGEGATE_AUDIT_ENABLED") {
                Some(v) => parse_bool("CHANGEGATE_AUDIT_ENABLED", &v)?,
                None => true,
            },
            summary_cap: parse_or("CHANGEGATE_SUMMARY_CAP", var("CHANGEGATE_SUMMARY_CAP"), StoreConfig::default().summary_cap)?,
        };

        let governance = GovernanceConfig {
            prod_approvers: var("CHANGEGATE_PROD_APPROVERS")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            build_timeout: seconds_or("JENKINS_TIMEOUT", var("JENKINS_TIMEOUT"), GovernanceConfig::default().build_timeout)?,
        };

        let worker = match var("CHANGEGATE_WORKER_URL") {
            Some(url) => Some(WorkerConfig {
                url: validate_url("CHANGEGATE_WORKER_URL", &url)?,
                timeout: seconds_or("CHANGEGATE_WORKER_TIMEOUT", var("CHANGEGATE_WORKER_TIMEOUT"), DEFAULT_WORKER_TIMEOUT)?,
            }),
            None => None,
        };

        let jenkins = match var("JENKINS_URL") {
            Some(url) => Some(JenkinsConfig {
                url: validate_url("JENKINS_URL", &url)?,
                username: var("JENKINS_USERNAME").ok_or_else(|| ConfigError::MissingVar("JENKINS_USERNAME".to_string()))?,
                api_token: var("JENKINS_API_TOKEN").ok_or_else(|| ConfigError::MissingVar("JENKINS_API_TOKEN".to_string()))?,
                poll_interval: seconds_or("JENKINS_POLL_INTERVAL", var("JENKINS_POLL_INTERVAL"), DEFAULT_POLL_INTERVAL)?,
            }),
            None => None,
        };

        let artifactory = match var("ARTIFACTORY_URL") {
            Some(url) => Some(ArtifactoryConfig {
                url: validate_url("ARTIFACTORY_URL", &url)?,
                username: var("ARTIFACTORY_USERNAME").unwrap_or_default(),
                api_key: var("ARTIFACTORY_API_KEY").unwrap_or_default(),
                repository: var("ARTIFACTORY_REPOSITORY").unwrap_or_else(|| DEFAULT_REPOSITORY.to_string()),
                timeout: seconds_or("ARTIFACTORY_TIMEOUT", var("ARTIFACTORY_TIMEOUT"), Duration::from_secs(120))?,
            }),
            None => None,
        };

        let cors = CorsConfig {
            allowed_origins: var("ALLOWED_ORIGINS")
                .map(|s| split_list(&s))
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        Ok(Self {
            server,
            store,
            governance,
            worker,
            jenkins,
            artifactory,
            cors,
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn validate_url(key: &str, value: &str) -> Result<String, ConfigError> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(value.trim_end_matches('/').to_string()),
        Ok(parsed) => Err(ConfigError::InvalidValue(format!(
            "{} must be an http(s) URL, got scheme '{}'",
            key,
            parsed.scheme()
        ))),
        Err(e) => Err(ConfigError::InvalidValue(format!("{} is not a valid URL: {}", key, e))),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue(format!("{} must be a boolean, got '{}'", key, other))),
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} has an invalid value '{}'", key, v))),
        None => Ok(default),
    }
}

fn seconds_or(key: &str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        Some(v) => parse_or::<u64>(key, Some(v), 0).map(Duration::from_secs),
        None => Ok(default),
    }
}
