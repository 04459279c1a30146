//! Periodic refresh of endpoint/container inventory with optional per
//! container features, publishing snapshots to subscribers.

use crate::notifications::UpdateEvent;
use crate::portainer::{ContainerSummary, Endpoint, EndpointStats, PortainerClient, PortainerError};
use crate::updates::{UpdateService, UpdateStatus};
use log::{debug, error, info};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::timeout;

/// A refresh cycle waits this long for the previous one before giving up on
/// the tick.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
const COMPOSE_VERSION_LABEL: &str = "com.docker.compose.version";

#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    pub health_check: bool,
    pub restart_policy: bool,
    pub update_check: bool,
}

impl Features {
    fn any(&self) -> bool {
        self.health_check || self.restart_policy || self.update_check
    }
}

/// One Portainer environment with the stats of its latest snapshot.
#[derive(Debug, Clone, Default)]
pub struct EndpointSnapshot {
    pub id: i64,
    pub name: String,
    pub kind: i64,
    pub status: i64,
    pub stats: EndpointStats,
}

impl From<Endpoint> for EndpointSnapshot {
    fn from(endpoint: Endpoint) -> Self {
        let stats = endpoint.snapshots.into_iter().next().unwrap_or_default();
        Self {
            id: endpoint.id,
            name: endpoint.name,
            kind: endpoint.kind,
            status: endpoint.status,
            stats,
        }
    }
}

/// Optional per-container attributes filled in by the feature polls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomAttributes {
    pub health_status: Option<String>,
    pub restart_policy: Option<String>,
    pub update_status: Option<u16>,
    pub update_description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub state: String,
    pub network: String,
    pub compose_stack: String,
    pub compose_service: String,
    pub compose_version: String,
    /// Name of the endpoint the container runs on.
    pub environment: String,
    pub endpoint_id: i64,
    pub custom: CustomAttributes,
}

impl ContainerRecord {
    fn from_summary(summary: ContainerSummary, endpoint: &EndpointSnapshot) -> Self {
        let name = summary.display_name();
        let label = |key: &str| summary.labels.get(key).cloned().unwrap_or_default();
        Self {
            name,
            compose_stack: label(COMPOSE_PROJECT_LABEL),
            compose_service: label(COMPOSE_SERVICE_LABEL),
            compose_version: label(COMPOSE_VERSION_LABEL),
            network: summary.host_config.network_mode,
            environment: endpoint.name.clone(),
            endpoint_id: endpoint.id,
            id: summary.id,
            image: summary.image,
            image_id: summary.image_id,
            state: summary.state,
            custom: CustomAttributes::default(),
        }
    }
}

/// The combined inventory published after every refresh cycle. Containers are
/// keyed by "{endpoint id}{container id}" so ids stay unique across
/// environments.
#[derive(Debug, Clone, Default)]
pub struct PortainerData {
    pub endpoints: HashMap<i64, EndpointSnapshot>,
    pub containers: HashMap<String, ContainerRecord>,
}

struct Inner {
    data: PortainerData,
    updates: UpdateService,
}

pub struct Coordinator {
    api: PortainerClient,
    features: Features,
    inner: Mutex<Inner>,
    publisher: watch::Sender<PortainerData>,
    events: Option<mpsc::Sender<UpdateEvent>>,
}

impl Coordinator {
    pub fn new(
        api: PortainerClient,
        features: Features,
        updates: UpdateService,
        events: Option<mpsc::Sender<UpdateEvent>>,
    ) -> Self {
        let (publisher, _) = watch::channel(PortainerData::default());
        Self {
            api,
            features,
            inner: Mutex::new(Inner {
                data: PortainerData::default(),
                updates,
            }),
            publisher,
            events,
        }
    }

    /// Receive a snapshot after every completed refresh cycle.
    pub fn subscribe(&self) -> watch::Receiver<PortainerData> {
        self.publisher.subscribe()
    }

    /// Run one refresh cycle. At most one cycle runs at a time; when a
    /// previous cycle still holds the lock after [`LOCK_TIMEOUT`] the tick is
    /// skipped silently.
    pub async fn refresh(&self) -> Result<(), PortainerError> {
        let Ok(mut inner) = timeout(LOCK_TIMEOUT, self.inner.lock()).await else {
            debug!("refresh already in progress, skipping this tick");
            return Ok(());
        };

        let endpoints = self.get_endpoints().await?;
        let containers = self.get_containers(&endpoints, &mut inner.updates).await?;
        info!(
            "refreshed {} endpoints, {} containers",
            endpoints.len(),
            containers.len()
        );

        self.notify_new_updates(&inner.data.containers, &containers)
            .await;

        let endpoints = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.id, endpoint))
            .collect();
        inner.data = PortainerData {
            endpoints,
            containers,
        };
        self.publisher.send_replace(inner.data.clone());
        Ok(())
    }

    async fn get_endpoints(&self) -> Result<Vec<EndpointSnapshot>, PortainerError> {
        let endpoints = self.api.endpoints().await?;
        Ok(endpoints.into_iter().map(EndpointSnapshot::from).collect())
    }

    async fn get_containers(
        &self,
        endpoints: &[EndpointSnapshot],
        updates: &mut UpdateService,
    ) -> Result<HashMap<String, ContainerRecord>, PortainerError> {
        let mut records = HashMap::new();
        let mut registry_checked = false;
        for endpoint in endpoints {
            if endpoint.status != 1 {
                debug!("endpoint {} ({}) is down, skipping", endpoint.id, endpoint.name);
                continue;
            }
            let summaries = self.api.containers(endpoint.id).await?;
            for summary in summaries {
                let mut record = ContainerRecord::from_summary(summary, endpoint);
                if self.features.any() {
                    self.apply_container_detail(endpoint.id, &mut record).await?;
                    if self.features.update_check {
                        let result = updates
                            .check_image_updates(&self.api, endpoint.id, &record)
                            .await;
                        registry_checked |= result.registry_used;
                        record.custom.update_status = Some(result.status.code());
                        record.custom.update_description = Some(result.status_description);
                    }
                }
                records.insert(format!("{}{}", endpoint.id, record.id), record);
            }
        }
        if registry_checked {
            updates.record_registry_check();
        }
        Ok(records)
    }

    async fn apply_container_detail(
        &self,
        endpoint_id: i64,
        record: &mut ContainerRecord,
    ) -> Result<(), PortainerError> {
        let detail = self.api.container_detail(endpoint_id, &record.id).await?;
        if self.features.health_check {
            record.custom.health_status = Some(detail.health_status());
        }
        if self.features.restart_policy {
            record.custom.restart_policy = Some(detail.restart_policy());
        }
        Ok(())
    }

    async fn notify_new_updates(
        &self,
        previous: &HashMap<String, ContainerRecord>,
        current: &HashMap<String, ContainerRecord>,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        let available = Some(UpdateStatus::UpdateAvailable.code());
        for (key, record) in current {
            if record.custom.update_status != available {
                continue;
            }
            let seen_before = previous
                .get(key)
                .is_some_and(|old| old.custom.update_status == available);
            if !seen_before {
                let _ = events
                    .send(UpdateEvent {
                        container: record.name.clone(),
                        image: record.image.clone(),
                        description: record.custom.update_description.clone().unwrap_or_default(),
                    })
                    .await;
            }
        }
    }

    /// Run a single forced check cycle, bypassing the daily schedule. A no-op
    /// when the update-check feature is disabled.
    pub async fn force_update_check(&self) -> Result<(), PortainerError> {
        {
            let mut inner = self.inner.lock().await;
            if !inner.updates.enabled() {
                error!("force update check requested but update check feature is disabled");
                return Ok(());
            }
            info!("force update check initiated for all containers");
            inner.updates.arm_force_check();
        }
        let result = self.refresh().await;
        self.inner.lock().await.updates.clear_force_check();
        result
    }

    /// Next scheduled check as an ISO-8601 timestamp, or "disabled".
    pub async fn next_update_check(&self) -> String {
        match self.inner.lock().await.updates.next_update_check() {
            Some(next) => next.to_rfc3339(),
            None => "disabled".to_string(),
        }
    }

    /// Timestamp of the last cycle that reached a registry, or "never".
    pub async fn last_update_check(&self) -> String {
        match self.inner.lock().await.updates.last_update_check() {
            Some(last) => last.to_rfc3339(),
            None => "never".to_string(),
        }
    }

    pub fn connected(&self) -> bool {
        self.api.connected()
    }
}
