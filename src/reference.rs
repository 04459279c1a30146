use std::fmt::{Display, Formatter};

pub const DOCKER_IO: &str = "docker.io";
pub const DOCKER_IO_REGISTRY: &str = "registry-1.docker.io";
pub const GHCR_IO: &str = "ghcr.io";

/// A docker-style image name split into registry host, repository path and tag.
/// E.g. "ghcr.io/home-assistant/home-assistant:dev"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, possibly with a port. "docker.io" when the name carries
    /// no explicit registry.
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Parse an image name as it appears on a container record.
    ///
    /// Total over arbitrary strings: never panics, the repository falls back
    /// to "unknown" and the tag to "latest".
    pub fn parse(image_name: &str) -> Self {
        // a digest suffix pins the image, the tag is what gets compared
        let image_name = image_name
            .split_once('@')
            .map_or(image_name, |(name, _digest)| name);

        if image_name.is_empty() {
            return Self {
                registry: DOCKER_IO.to_string(),
                repository: "unknown".to_string(),
                tag: "latest".to_string(),
            };
        }

        let (repo, tag) = split_repo_and_tag(image_name);
        let (registry, repo) = detect_registry(repo);
        let repo = prepend_library_if_needed(&registry, repo);

        Self {
            registry,
            repository: repo,
            tag: tag.to_string(),
        }
    }

    /// Canonical "registry/repository:tag" string, used as cache key.
    pub fn image_key(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl Display for ImageReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.image_key())
    }
}

fn split_repo_and_tag(image_name: &str) -> (&str, &str) {
    match image_name.rsplit_once(':') {
        // e.g. localhost:5000/nginx - the colon belongs to the registry port
        Some((_, right)) if right.contains('/') => (image_name, "latest"),
        Some((_, "")) => (image_name.trim_end_matches(':'), "latest"),
        Some((repo, tag)) => (repo, tag),
        None => (image_name, "latest"),
    }
}

fn detect_registry(repo: &str) -> (String, String) {
    if let Some((first, rest)) = repo.split_once('/') {
        if first.contains('.') || first.contains(':') {
            return (first.to_string(), rest.to_string());
        }
    }
    (DOCKER_IO.to_string(), repo.to_string())
}

fn prepend_library_if_needed(registry: &str, repo: String) -> String {
    let dockerio_registries = [
        DOCKER_IO,
        DOCKER_IO_REGISTRY,
        "docker.io:443",
        "registry-1.docker.io:443",
        "",
    ];
    if dockerio_registries.contains(&registry) && !repo.contains('/') {
        return format!("library/{repo}");
    }
    repo
}
