//! Thin client for the Portainer REST API.
//!
//! All endpoint/container/image queries go through here; responses are
//! deserialized into explicit records with defaults for missing fields, so
//! the rest of the crate never touches raw JSON from Portainer.

use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortainerError {
    #[error("portainer returned HTTP {status} for \"{service}\"")]
    Http { status: StatusCode, service: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("invalid API key")]
    InvalidApiKey,
}

pub struct PortainerClient {
    http: reqwest::Client,
    base_url: String,
    connected: AtomicBool,
}

impl PortainerClient {
    pub fn new(
        host: &str,
        api_key: &str,
        use_ssl: bool,
        verify_ssl: bool,
    ) -> Result<Self, PortainerError> {
        let protocol = if use_ssl { "https" } else { "http" };
        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(api_key).map_err(|_| PortainerError::InvalidApiKey)?;
        key.set_sensitive(true);
        headers.insert("X-API-Key", key);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(use_ssl && !verify_ssl)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: format!("{protocol}://{host}/api/"),
            connected: AtomicBool::new(false),
        })
    }

    /// Whether the last query reached the server and got a 200.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn connection_test(&self) -> Result<(), PortainerError> {
        self.endpoints().await.map(|_| ())
    }

    pub async fn endpoints(&self) -> Result<Vec<Endpoint>, PortainerError> {
        self.get("endpoints", &[]).await
    }

    pub async fn containers(&self, endpoint_id: i64) -> Result<Vec<ContainerSummary>, PortainerError> {
        self.get(
            &format!("endpoints/{endpoint_id}/docker/containers/json"),
            &[("all", "true")],
        )
        .await
    }

    pub async fn container_detail(
        &self,
        endpoint_id: i64,
        container_id: &str,
    ) -> Result<ContainerDetail, PortainerError> {
        self.get(
            &format!("endpoints/{endpoint_id}/docker/containers/{container_id}/json"),
            &[("all", "true")],
        )
        .await
    }

    pub async fn images(&self, endpoint_id: i64) -> Result<Vec<ImageSummary>, PortainerError> {
        self.get(&format!("endpoints/{endpoint_id}/docker/images/json"), &[])
            .await
    }

    pub async fn docker_info(&self, endpoint_id: i64) -> Result<DockerInfo, PortainerError> {
        self.get(&format!("endpoints/{endpoint_id}/docker/info"), &[])
            .await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        service: &str,
        query: &[(&str, &str)],
    ) -> Result<T, PortainerError> {
        debug!("portainer query: {service} {query:?}");
        let url = format!("{}{service}", self.base_url);
        let response = match self.http.get(&url).query(query).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!("portainer unable to fetch \"{service}\" (no response)");
                self.connected.store(false, Ordering::Relaxed);
                return Err(error.into());
            }
        };
        let status = response.status();
        if status != StatusCode::OK {
            warn!("portainer unable to fetch \"{service}\" ({status})");
            // a 500 from one docker endpoint does not mean the server is gone
            if status != StatusCode::INTERNAL_SERVER_ERROR {
                self.connected.store(false, Ordering::Relaxed);
            }
            return Err(PortainerError::Http {
                status,
                service: service.to_string(),
            });
        }
        self.connected.store(true, Ordering::Relaxed);
        Ok(response.json().await?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "Id", default)]
    pub id: i64,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Type", default)]
    pub kind: i64,
    /// 1 means up, everything else is treated as unreachable.
    #[serde(rename = "Status", default)]
    pub status: i64,
    #[serde(rename = "Snapshots", default)]
    pub snapshots: Vec<EndpointStats>,
}

/// Aggregated environment statistics from the endpoint's latest snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointStats {
    #[serde(rename = "DockerVersion", default)]
    pub docker_version: String,
    #[serde(rename = "Swarm", default)]
    pub swarm: bool,
    #[serde(rename = "TotalCPU", default)]
    pub total_cpu: i64,
    #[serde(rename = "TotalMemory", default)]
    pub total_memory: i64,
    #[serde(rename = "RunningContainerCount", default)]
    pub running_containers: i64,
    #[serde(rename = "StoppedContainerCount", default)]
    pub stopped_containers: i64,
    #[serde(rename = "HealthyContainerCount", default)]
    pub healthy_containers: i64,
    #[serde(rename = "UnhealthyContainerCount", default)]
    pub unhealthy_containers: i64,
    #[serde(rename = "VolumeCount", default)]
    pub volumes: i64,
    #[serde(rename = "ImageCount", default)]
    pub images: i64,
    #[serde(rename = "ServiceCount", default)]
    pub services: i64,
    #[serde(rename = "StackCount", default)]
    pub stacks: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "ImageID", default)]
    pub image_id: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
    #[serde(rename = "HostConfig", default)]
    pub host_config: SummaryHostConfig,
}

impl ContainerSummary {
    /// Docker reports names with a leading slash.
    pub fn display_name(&self) -> String {
        self.names
            .first()
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryHostConfig {
    #[serde(rename = "NetworkMode", default)]
    pub network_mode: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerDetail {
    #[serde(rename = "State", default)]
    pub state: DetailState,
    #[serde(rename = "HostConfig", default)]
    pub host_config: DetailHostConfig,
}

impl ContainerDetail {
    pub fn health_status(&self) -> String {
        self.state
            .health
            .as_ref()
            .map(|health| health.status.clone())
            .filter(|status| !status.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn restart_policy(&self) -> String {
        self.host_config
            .restart_policy
            .as_ref()
            .map(|policy| policy.name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetailState {
    #[serde(rename = "Health", default)]
    pub health: Option<Health>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Health {
    #[serde(rename = "Status", default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetailHostConfig {
    #[serde(rename = "RestartPolicy", default)]
    pub restart_policy: Option<RestartPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestartPolicy {
    #[serde(rename = "Name", default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageSummary {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Architecture", default)]
    pub architecture: String,
    #[serde(rename = "Os", default)]
    pub os: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerInfo {
    #[serde(rename = "Architecture", default)]
    pub architecture: String,
    #[serde(rename = "OSType", default)]
    pub os_type: String,
}
