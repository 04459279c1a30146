//! Registry clients for the three API flavors an image can live on:
//! Docker Hub, GHCR and generic v2 registries.

use crate::manifest;
use crate::reference::{DOCKER_IO, DOCKER_IO_REGISTRY, GHCR_IO, ImageReference};
use log::debug;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry returned HTTP {status} for {url}")]
    Http { status: StatusCode, url: String },
    #[error("no matching platform manifest found for arch={arch} os={os}")]
    NoMatchingPlatform { arch: String, os: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Registry flavor, selected from the registry host of an [`ImageReference`].
#[derive(Debug, Clone)]
enum Provider {
    DockerHub {
        repository: String,
    },
    Ghcr {
        repository: String,
        configured_token: Option<String>,
    },
    Generic {
        repository: String,
        host: String,
    },
}

impl Provider {
    fn manifest_url(&self, tag_or_digest: &str) -> String {
        match self {
            Provider::DockerHub { repository } => {
                format!("https://{DOCKER_IO_REGISTRY}/v2/{repository}/manifests/{tag_or_digest}")
            }
            Provider::Ghcr { repository, .. } => {
                format!("https://{GHCR_IO}/v2/{repository}/manifests/{tag_or_digest}")
            }
            Provider::Generic { repository, host } => {
                let scheme = if is_plain_http_host(host) { "http" } else { "https" };
                format!("{scheme}://{host}/v2/{repository}/manifests/{tag_or_digest}")
            }
        }
    }

    fn host(&self) -> &str {
        match self {
            Provider::DockerHub { .. } => DOCKER_IO,
            Provider::Ghcr { .. } => GHCR_IO,
            Provider::Generic { host, .. } => host,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    /// None means the token never expires (user-supplied credential).
    expires: Option<Instant>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// Client for one image repository on one registry. Holds the bearer token
/// between requests for the lifetime of the instance.
pub struct RegistryClient {
    http: reqwest::Client,
    provider: Provider,
    token: Option<CachedToken>,
}

impl RegistryClient {
    /// Pure mapping from registry host to provider flavor. An empty host is
    /// treated as Docker Hub.
    pub fn for_registry(
        http: reqwest::Client,
        reference: &ImageReference,
        ghcr_token: Option<String>,
    ) -> Self {
        let repository = reference.repository.clone();
        let provider = match reference.registry.as_str() {
            "" | DOCKER_IO | DOCKER_IO_REGISTRY => Provider::DockerHub { repository },
            GHCR_IO => Provider::Ghcr {
                repository,
                configured_token: ghcr_token.or_else(|| std::env::var("GHCR_TOKEN").ok()),
            },
            host => Provider::Generic {
                repository,
                host: host.to_string(),
            },
        };
        let token = match &provider {
            Provider::Ghcr {
                configured_token: Some(token),
                ..
            } => Some(CachedToken {
                token: token.clone(),
                expires: None,
            }),
            _ => None,
        };
        Self {
            http,
            provider,
            token,
        }
    }

    /// Registry host used in user-facing status descriptions.
    pub fn registry_host(&self) -> &str {
        self.provider.host()
    }

    /// Fetch the manifest for `tag`. A manifest list is resolved to the
    /// single entry matching (arch, os) when both are given; no matching
    /// entry is an error.
    pub async fn get_manifest(
        &mut self,
        tag: &str,
        arch: Option<&str>,
        os: Option<&str>,
    ) -> Result<Value, RegistryError> {
        let token = self.valid_token().await?;
        let url = self.provider.manifest_url(tag);
        let manifest = self
            .fetch_json(&url, &manifest::list_accept_header(), token.as_deref())
            .await?;
        if let (Some(arch), Some(os)) = (arch, os) {
            if manifest::is_manifest_list(&manifest) {
                return self.platform_manifest(arch, os, &manifest, token.as_deref()).await;
            }
        }
        Ok(manifest)
    }

    async fn platform_manifest(
        &self,
        arch: &str,
        os: &str,
        manifest_list: &Value,
        token: Option<&str>,
    ) -> Result<Value, RegistryError> {
        let arch = manifest::normalize_arch(arch);
        let Some(digest) = manifest::platform_digest(manifest_list, arch, os) else {
            return Err(RegistryError::NoMatchingPlatform {
                arch: arch.to_string(),
                os: os.to_string(),
            });
        };
        debug!("resolved platform {os}/{arch} to {digest}");
        let url = self.provider.manifest_url(digest);
        self.fetch_json(&url, &manifest::manifest_accept_header(), token)
            .await
    }

    async fn valid_token(&mut self) -> Result<Option<String>, RegistryError> {
        if let Some(cached) = &self.token {
            match cached.expires {
                None => return Ok(Some(cached.token.clone())),
                Some(expires) if Instant::now() < expires => {
                    return Ok(Some(cached.token.clone()));
                }
                _ => {}
            }
        }
        self.fetch_token().await
    }

    async fn fetch_token(&mut self) -> Result<Option<String>, RegistryError> {
        let (url, token_is_optional) = match &self.provider {
            Provider::DockerHub { repository } => (
                format!(
                    "https://auth.{DOCKER_IO}/token?service=registry.{DOCKER_IO}&scope=repository:{repository}:pull"
                ),
                false,
            ),
            // anonymous tokens only work for public images
            Provider::Ghcr { repository, .. } => (
                format!(
                    "https://{GHCR_IO}/token?service={GHCR_IO}&scope=repository:{repository}:pull"
                ),
                true,
            ),
            Provider::Generic { .. } => return Ok(None),
        };
        let response = self.http.get(&url).send().await?;
        if response.status() != StatusCode::OK {
            if token_is_optional {
                // the manifest fetch will answer 401 for private images
                debug!("anonymous token fetch failed ({url})");
                return Ok(None);
            }
            return Err(RegistryError::Http {
                status: response.status(),
                url,
            });
        }
        let data: TokenResponse = response.json().await?;
        self.cache_token(&data);
        Ok(data.token)
    }

    fn cache_token(&mut self, data: &TokenResponse) {
        // renew slightly before the advertised expiry
        let expires = Instant::now() + Duration::from_secs(data.expires_in.saturating_sub(30));
        self.token = data.token.clone().map(|token| CachedToken {
            token,
            expires: Some(expires),
        });
    }

    async fn fetch_json(
        &self,
        url: &str,
        accept: &str,
        token: Option<&str>,
    ) -> Result<Value, RegistryError> {
        let mut request = self.http.get(url).header(ACCEPT, accept);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(RegistryError::Http {
                status: response.status(),
                url: url.to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

/// Local registries are commonly served without TLS.
fn is_plain_http_host(host: &str) -> bool {
    let bare = host.split(':').next().unwrap_or(host);
    bare == "localhost" || bare.parse::<Ipv4Addr>().is_ok()
}
