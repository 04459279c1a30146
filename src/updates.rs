//! Update-check service: daily schedule, verdict/response caches and the
//! orchestration tying image parsing, registry queries and digest comparison
//! together.
//!
//! One instance lives inside a coordinator and owns all schedule state; it is
//! never shared across coordinator instances and is dropped (resetting to
//! "never checked") when the coordinator goes away.

use crate::coordinator::ContainerRecord;
use crate::manifest;
use crate::portainer::PortainerClient;
use crate::reference::ImageReference;
use crate::registry::{RegistryClient, RegistryError};
use chrono::{DateTime, Duration, Local, NaiveTime};
use log::{debug, error, info, warn};
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// Registry responses older than this are dropped wholesale.
const CACHE_MAX_AGE_SECS: i64 = 86_400;

/// Closed set of per-container verdict codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum UpdateStatus {
    UpToDate = 0,
    UpdateAvailable = 1,
    NotChecked = 2,
    Unauthorized = 401,
    NotFound = 404,
    RateLimited = 429,
    Error = 500,
}

impl UpdateStatus {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn description(self, registry: Option<&str>) -> String {
        let registry = registry.unwrap_or("unknown");
        match self {
            UpdateStatus::UpToDate => "No update available.".to_string(),
            UpdateStatus::UpdateAvailable => "Update available!".to_string(),
            UpdateStatus::NotChecked => "Update status not yet checked.".to_string(),
            UpdateStatus::Unauthorized => format!(
                "Unauthorized (registry credentials required or invalid) for registry {registry}."
            ),
            UpdateStatus::NotFound => format!("Image not found on registry ({registry})."),
            UpdateStatus::RateLimited => "Registry rate limit reached.".to_string(),
            UpdateStatus::Error => "Registry/internal error.".to_string(),
        }
    }
}

impl Display for UpdateStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description(None))
    }
}

/// Outcome of one `check_image_updates` call.
///
/// `registry_used` is true only when this call performed a live registry
/// request; verdicts served from cache report false so the daily schedule
/// only advances on genuine network traffic.
#[derive(Debug, Clone)]
pub struct UpdateCheckResult {
    pub status: UpdateStatus,
    pub status_description: String,
    pub manifest: Value,
    pub registry_used: bool,
}

impl UpdateCheckResult {
    fn plain(status: UpdateStatus, registry_used: bool) -> Self {
        Self {
            status,
            status_description: status.description(None),
            manifest: Value::Object(Default::default()),
            registry_used,
        }
    }
}

pub struct UpdateService {
    http: reqwest::Client,
    enabled: bool,
    check_time: NaiveTime,
    ghcr_token: Option<String>,
    /// Verdict per container id; superseded by fresh checks, cleared only on
    /// force-check.
    cached_update_results: HashMap<String, UpdateCheckResult>,
    /// Raw registry response per image key; shared between containers running
    /// the same image, expired after [`CACHE_MAX_AGE_SECS`].
    cached_registry_responses: HashMap<String, Value>,
    last_update_check: Option<DateTime<Local>>,
    force_update_requested: bool,
}

impl UpdateService {
    pub fn new(
        http: reqwest::Client,
        enabled: bool,
        check_time: NaiveTime,
        ghcr_token: Option<String>,
    ) -> Self {
        Self {
            http,
            enabled,
            check_time,
            ghcr_token,
            cached_update_results: HashMap::new(),
            cached_registry_responses: HashMap::new(),
            last_update_check: None,
            force_update_requested: false,
        }
    }

    pub async fn check_image_updates(
        &mut self,
        api: &PortainerClient,
        endpoint_id: i64,
        container: &ContainerRecord,
    ) -> UpdateCheckResult {
        self.check_image_updates_at(api, endpoint_id, container, Local::now())
            .await
    }

    /// Check one container, consulting schedule and caches as of `now`.
    pub async fn check_image_updates_at(
        &mut self,
        api: &PortainerClient,
        endpoint_id: i64,
        container: &ContainerRecord,
        now: DateTime<Local>,
    ) -> UpdateCheckResult {
        if container.image.is_empty() {
            error!(
                "container {}: no image name, skipping update check",
                container.name
            );
            let result = UpdateCheckResult::plain(UpdateStatus::Error, false);
            self.cached_update_results
                .insert(container.id.clone(), result.clone());
            return result;
        }

        let reference = ImageReference::parse(&container.image);
        let image_key = reference.image_key();
        debug!(
            "container {}: parsed image '{}' -> {image_key}",
            container.name, container.image
        );

        let should_check = self.should_check_at(now);
        self.invalidate_cache_at(now);

        if !should_check {
            return match self.cached_update_results.get(&container.id) {
                Some(result) => UpdateCheckResult {
                    registry_used: false,
                    ..result.clone()
                },
                None => {
                    debug!(
                        "container {}: no cached verdict (new container or not yet checked)",
                        container.name
                    );
                    UpdateCheckResult::plain(UpdateStatus::NotChecked, false)
                }
            };
        }

        let result = match self
            .registry_response(api, endpoint_id, &reference, &image_key)
            .await
        {
            Ok((manifest, registry_used)) => {
                let status = if update_available(&manifest, container) {
                    info!(
                        "update available: {} ({})",
                        container.name, container.image
                    );
                    UpdateStatus::UpdateAvailable
                } else {
                    debug!("no update: {} ({})", container.name, container.image);
                    UpdateStatus::UpToDate
                };
                UpdateCheckResult {
                    status,
                    status_description: status.description(None),
                    manifest,
                    registry_used,
                }
            }
            Err(verdict) => verdict,
        };
        self.cached_update_results
            .insert(container.id.clone(), result.clone());
        result
    }

    /// Fetch the registry response for an image, serving repeats of the same
    /// image from cache. Returns the manifest and whether a live request was
    /// made; failures come back pre-shaped as an error verdict.
    async fn registry_response(
        &mut self,
        api: &PortainerClient,
        endpoint_id: i64,
        reference: &ImageReference,
        image_key: &str,
    ) -> Result<(Value, bool), UpdateCheckResult> {
        if let Some(cached) = self.cached_registry_responses.get(image_key) {
            debug!("registry response for {image_key} served from cache");
            return Ok((cached.clone(), false));
        }

        let (arch, os) = self.resolve_arch_os(api, endpoint_id, image_key).await;
        let mut registry =
            RegistryClient::for_registry(self.http.clone(), reference, self.ghcr_token.clone());
        match registry
            .get_manifest(&reference.tag, Some(&arch), Some(&os))
            .await
        {
            Ok(mut manifest) => {
                manifest::annotate_image_id(&mut manifest);
                self.cached_registry_responses
                    .insert(image_key.to_string(), manifest.clone());
                Ok((manifest, true))
            }
            Err(error) => Err(error_verdict(&error, registry.registry_host(), image_key)),
        }
    }

    /// Architecture and OS for the manifest-list resolution, taken from the
    /// endpoint's local image inventory with the endpoint defaults as
    /// fallback.
    async fn resolve_arch_os(
        &self,
        api: &PortainerClient,
        endpoint_id: i64,
        image_key: &str,
    ) -> (String, String) {
        let mut arch = None;
        let mut os = None;
        match api.images(endpoint_id).await {
            Ok(images) => {
                for image in images {
                    if image.repo_tags.iter().any(|tag| tag == image_key) || image.id == image_key
                    {
                        arch = non_empty(image.architecture);
                        os = non_empty(image.os);
                        break;
                    }
                }
            }
            Err(error) => debug!("unable to list endpoint {endpoint_id} images: {error}"),
        }
        if arch.is_none() || os.is_none() {
            match api.docker_info(endpoint_id).await {
                Ok(info) => {
                    arch = arch.or_else(|| non_empty(info.architecture));
                    os = os.or_else(|| non_empty(info.os_type));
                }
                Err(error) => debug!("unable to fetch endpoint {endpoint_id} info: {error}"),
            }
        }
        let arch = arch.unwrap_or_else(|| "amd64".to_string());
        let os = os.unwrap_or_else(|| "linux".to_string());
        (manifest::normalize_arch(&arch).to_string(), os)
    }

    pub fn should_check_updates(&self) -> bool {
        self.should_check_at(Local::now())
    }

    /// One real check per calendar day at the configured time, plus unlimited
    /// forced checks.
    fn should_check_at(&self, now: DateTime<Local>) -> bool {
        if !self.enabled {
            return false;
        }
        if self.force_update_requested {
            return true;
        }
        match self.last_update_check {
            None => true,
            Some(last) => {
                let scheduled = self.scheduled_for(now);
                last < scheduled && now >= scheduled
            }
        }
    }

    pub fn next_update_check(&self) -> Option<DateTime<Local>> {
        self.next_update_check_at(Local::now())
    }

    fn next_update_check_at(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        if !self.enabled {
            return None;
        }
        let today = self.scheduled_for(now);
        if now < today {
            Some(today)
        } else {
            Some(today + Duration::days(1))
        }
    }

    fn scheduled_for(&self, now: DateTime<Local>) -> DateTime<Local> {
        now.date_naive()
            .and_time(self.check_time)
            .and_local_timezone(Local)
            .earliest()
            .unwrap_or(now)
    }

    fn invalidate_cache_at(&mut self, now: DateTime<Local>) {
        match self.last_update_check {
            None => self.cached_registry_responses.clear(),
            Some(last) if (now - last).num_seconds() > CACHE_MAX_AGE_SECS => {
                debug!("registry response cache expired");
                self.cached_registry_responses.clear();
            }
            _ => {}
        }
    }

    /// Arm a forced check: bypass the schedule and drop every cached verdict
    /// and registry response so the next cycle hits the registries again.
    pub fn arm_force_check(&mut self) {
        self.force_update_requested = true;
        self.cached_update_results.clear();
        self.cached_registry_responses.clear();
        self.last_update_check = Some(Local::now());
    }

    pub fn clear_force_check(&mut self) {
        self.force_update_requested = false;
    }

    /// Record that the current refresh cycle made at least one live registry
    /// request. Cache-served cycles leave the timestamp untouched.
    pub fn record_registry_check(&mut self) {
        self.last_update_check = Some(Local::now());
    }

    pub fn last_update_check(&self) -> Option<DateTime<Local>> {
        self.last_update_check
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

fn error_verdict(error: &RegistryError, registry: &str, image_key: &str) -> UpdateCheckResult {
    let status = match error {
        RegistryError::Http { status, .. } if *status == StatusCode::UNAUTHORIZED => {
            warn!(
                "unauthorized (HTTP 401) from registry '{registry}' for image '{image_key}', check credentials"
            );
            UpdateStatus::Unauthorized
        }
        RegistryError::Http { status, .. } if *status == StatusCode::NOT_FOUND => {
            info!("image '{image_key}' not found on registry '{registry}' (HTTP 404)");
            UpdateStatus::NotFound
        }
        RegistryError::Http { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS => {
            warn!("rate limit (HTTP 429) from registry for image '{image_key}'");
            UpdateStatus::RateLimited
        }
        RegistryError::NoMatchingPlatform { .. } => {
            warn!("no matching platform manifest for image '{image_key}' on '{registry}': {error}");
            UpdateStatus::NotFound
        }
        _ => {
            warn!("failed to fetch registry data for image '{image_key}': {error}");
            UpdateStatus::Error
        }
    };
    UpdateCheckResult {
        status,
        status_description: status.description(Some(registry)),
        manifest: Value::Object(Default::default()),
        registry_used: true,
    }
}

fn update_available(manifest: &Value, container: &ContainerRecord) -> bool {
    let registry_id = normalize_image_id(
        manifest
            .get("Id")
            .and_then(Value::as_str)
            .unwrap_or_default(),
    );
    let container_id = normalize_image_id(&container.image_id);
    !registry_id.is_empty() && !container_id.is_empty() && registry_id != container_id
}

/// Strip the "sha256:" prefix so daemon-reported and registry-reported ids
/// compare equal.
pub fn normalize_image_id(image_id: &str) -> &str {
    image_id.strip_prefix("sha256:").unwrap_or(image_id)
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn service(enabled: bool) -> UpdateService {
        UpdateService::new(
            reqwest::Client::new(),
            enabled,
            NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            None,
        )
    }

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_disabled_feature_never_checks() {
        let service = service(false);
        assert!(!service.should_check_at(local(2026, 8, 7, 2, 30, 0)));
        assert!(service.next_update_check_at(local(2026, 8, 7, 2, 30, 0)).is_none());
        assert!(!service.should_check_updates());
        assert!(service.next_update_check().is_none());
    }

    #[test]
    fn test_first_run_checks_immediately() {
        let service = service(true);
        // before and after the scheduled time of day
        assert!(service.should_check_at(local(2026, 8, 7, 0, 30, 0)));
        assert!(service.should_check_at(local(2026, 8, 7, 13, 0, 0)));
        // with no check on record the wall clock does not matter
        assert!(service.should_check_updates());
    }

    #[test]
    fn test_check_due_once_per_day() {
        let mut service = service(true);
        // checked yesterday evening; today's 02:00 has passed
        service.last_update_check = Some(local(2026, 8, 6, 22, 0, 0));
        assert!(service.should_check_at(local(2026, 8, 7, 2, 0, 0)));
        assert!(service.should_check_at(local(2026, 8, 7, 9, 0, 0)));

        // after recording today's check nothing is due until tomorrow
        service.last_update_check = Some(local(2026, 8, 7, 2, 0, 5));
        assert!(!service.should_check_at(local(2026, 8, 7, 9, 0, 0)));
        assert!(!service.should_check_at(local(2026, 8, 7, 23, 59, 0)));
        assert!(service.should_check_at(local(2026, 8, 8, 2, 0, 1)));
    }

    #[test]
    fn test_due_stays_due_until_recorded() {
        let mut service = service(true);
        service.last_update_check = Some(local(2026, 8, 6, 2, 0, 5));
        let mut now = local(2026, 8, 7, 2, 0, 1);
        for _ in 0..10 {
            assert!(service.should_check_at(now));
            now += Duration::hours(2);
        }
    }

    #[test]
    fn test_not_due_before_scheduled_time() {
        let mut service = service(true);
        service.last_update_check = Some(local(2026, 8, 6, 2, 0, 5));
        assert!(!service.should_check_at(local(2026, 8, 7, 1, 59, 59)));
    }

    #[test]
    fn test_force_overrides_schedule() {
        let mut service = service(true);
        service.last_update_check = Some(local(2026, 8, 7, 2, 0, 5));
        assert!(!service.should_check_at(local(2026, 8, 7, 9, 0, 0)));
        service.arm_force_check();
        assert!(service.should_check_at(local(2026, 8, 7, 9, 0, 0)));
        service.clear_force_check();
        assert!(!service.should_check_at(local(2026, 8, 7, 9, 0, 0)));
    }

    #[test]
    fn test_force_clears_caches() {
        let mut service = service(true);
        service
            .cached_update_results
            .insert("abc".to_string(), UpdateCheckResult::plain(UpdateStatus::UpToDate, true));
        service
            .cached_registry_responses
            .insert("docker.io/library/nginx:latest".to_string(), json!({}));
        service.arm_force_check();
        assert!(service.cached_update_results.is_empty());
        assert!(service.cached_registry_responses.is_empty());
    }

    #[test]
    fn test_next_update_check_rolls_over_to_tomorrow() {
        let service = service(true);
        assert_eq!(
            service.next_update_check_at(local(2026, 8, 7, 1, 0, 0)),
            Some(local(2026, 8, 7, 2, 0, 0))
        );
        assert_eq!(
            service.next_update_check_at(local(2026, 8, 7, 14, 0, 0)),
            Some(local(2026, 8, 8, 2, 0, 0))
        );
    }

    #[test]
    fn test_cache_expiry_boundary() {
        let mut service = service(true);
        let checked_at = local(2026, 8, 6, 2, 0, 0);
        service.last_update_check = Some(checked_at);
        service
            .cached_registry_responses
            .insert("docker.io/library/nginx:latest".to_string(), json!({}));

        service.invalidate_cache_at(checked_at + Duration::seconds(86_400));
        assert_eq!(service.cached_registry_responses.len(), 1);

        service.invalidate_cache_at(checked_at + Duration::seconds(86_401));
        assert!(service.cached_registry_responses.is_empty());
    }

    #[test]
    fn test_cache_cleared_when_never_checked() {
        let mut service = service(true);
        service
            .cached_registry_responses
            .insert("docker.io/library/nginx:latest".to_string(), json!({}));
        service.invalidate_cache_at(local(2026, 8, 7, 9, 0, 0));
        assert!(service.cached_registry_responses.is_empty());
    }

    #[test]
    fn test_normalize_image_id() {
        assert_eq!(normalize_image_id("sha256:abc123"), "abc123");
        assert_eq!(normalize_image_id("abc123"), "abc123");
        assert_eq!(normalize_image_id(""), "");
    }

    #[test]
    fn test_update_available_comparison() {
        let container = ContainerRecord {
            image_id: "sha256:aaa".to_string(),
            ..Default::default()
        };
        let same = json!({"Id": "sha256:aaa"});
        let different = json!({"Id": "sha256:bbb"});
        let missing = json!({});
        assert!(!update_available(&same, &container));
        assert!(update_available(&different, &container));
        assert!(!update_available(&missing, &container));

        let no_id = ContainerRecord::default();
        assert!(!update_available(&different, &no_id));
    }

    #[test]
    fn test_error_verdicts_stay_in_closed_set() {
        let errors = [
            RegistryError::Http {
                status: StatusCode::UNAUTHORIZED,
                url: "https://ghcr.io/v2/foo/bar/manifests/latest".to_string(),
            },
            RegistryError::Http {
                status: StatusCode::NOT_FOUND,
                url: "u".to_string(),
            },
            RegistryError::Http {
                status: StatusCode::TOO_MANY_REQUESTS,
                url: "u".to_string(),
            },
            RegistryError::Http {
                status: StatusCode::BAD_GATEWAY,
                url: "u".to_string(),
            },
            RegistryError::NoMatchingPlatform {
                arch: "arm64".to_string(),
                os: "linux".to_string(),
            },
        ];
        let expected = [
            UpdateStatus::Unauthorized,
            UpdateStatus::NotFound,
            UpdateStatus::RateLimited,
            UpdateStatus::Error,
            UpdateStatus::NotFound,
        ];
        for (error, expected) in errors.iter().zip(expected) {
            let verdict = error_verdict(error, "ghcr.io", "ghcr.io/foo/bar:latest");
            assert_eq!(verdict.status, expected);
            assert!(verdict.registry_used);
        }
    }

    #[test]
    fn test_status_codes_and_descriptions() {
        assert_eq!(UpdateStatus::UpToDate.code(), 0);
        assert_eq!(UpdateStatus::UpdateAvailable.code(), 1);
        assert_eq!(UpdateStatus::NotChecked.code(), 2);
        assert_eq!(UpdateStatus::Unauthorized.code(), 401);
        assert_eq!(UpdateStatus::NotFound.code(), 404);
        assert_eq!(UpdateStatus::RateLimited.code(), 429);
        assert_eq!(UpdateStatus::Error.code(), 500);
        assert_eq!(
            UpdateStatus::NotFound.description(Some("ghcr.io")),
            "Image not found on registry (ghcr.io)."
        );
        assert_eq!(UpdateStatus::UpdateAvailable.to_string(), "Update available!");
    }
}
