//! Pod observation feeding the document status
//!
//! A second watch follows the pods carrying this device's owner labels and
//! folds what they report into the EdgeDeployment status subresource. The
//! tracker holds the only cross-event state, a per-module map keyed by the
//! module label value, behind its own lock. Status publication is strictly
//! best effort: a failed patch is logged and the next pod event publishes a
//! fresh snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::client::WorkloadClient;
use crate::config::OperatorConfig;
use crate::crd::{EdgeDeploymentStatus, ModuleRuntimeStatus, ModuleState};
use crate::watch::{EventHandler, WatchDelta};
use crate::{MODULE_LABEL, PROXY_CONTAINER_NAME};

/// Tracks module runtime state from pod events
pub struct StatusTracker {
    resource_name: String,
    client: Arc<dyn WorkloadClient>,
    state: Mutex<BTreeMap<String, ModuleRuntimeStatus>>,
}

impl StatusTracker {
    /// Create a tracker publishing onto the device's document
    pub fn new(config: &OperatorConfig, client: Arc<dyn WorkloadClient>) -> Self {
        Self {
            resource_name: config.resource_name.clone(),
            client,
            state: Mutex::new(BTreeMap::new()),
        }
    }

    /// The current per-module view
    pub async fn snapshot(&self) -> BTreeMap<String, ModuleRuntimeStatus> {
        self.state.lock().await.clone()
    }

    async fn upsert(&self, module: String, status: ModuleRuntimeStatus) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.insert(module, status);
            state.clone()
        };
        self.publish(snapshot).await;
    }

    async fn remove(&self, module: &str) {
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.remove(module).is_none() {
                return;
            }
            state.clone()
        };
        self.publish(snapshot).await;
    }

    async fn publish(&self, modules: BTreeMap<String, ModuleRuntimeStatus>) {
        let status = EdgeDeploymentStatus::from_modules(modules);
        if let Err(error) = self
            .client
            .patch_edge_deployment_status(&self.resource_name, &status)
            .await
        {
            warn!(document = %self.resource_name, %error, "status patch failed");
        }
    }
}

#[async_trait]
impl EventHandler<Pod> for StatusTracker {
    async fn handle(&self, delta: WatchDelta<Pod>) -> crate::Result<()> {
        let pod = match &delta {
            WatchDelta::Applied(pod) | WatchDelta::Deleted(pod) => pod,
        };
        let Some(module) = pod.labels().get(MODULE_LABEL).cloned() else {
            debug!(pod = %pod.name_any(), "pod has no module label, ignoring");
            return Ok(());
        };

        match delta {
            WatchDelta::Applied(pod) => self.upsert(module, observe(&pod)).await,
            WatchDelta::Deleted(_) => self.remove(&module).await,
        }
        Ok(())
    }
}

/// Derive one module's runtime state from its pod.
///
/// The module container is the one that is not the proxy sidecar; its
/// container state is the primary signal, the pod phase is the fallback
/// while the kubelet has not reported containers yet.
fn observe(pod: &Pod) -> ModuleRuntimeStatus {
    let Some(status) = pod.status.as_ref() else {
        return unknown();
    };

    let container = status
        .container_statuses
        .as_ref()
        .and_then(|list| list.iter().find(|c| c.name != PROXY_CONTAINER_NAME));
    let Some(container) = container else {
        return from_phase(status);
    };

    let restart_count = container.restart_count.max(0) as u32;
    if let Some(state) = &container.state {
        if state.running.is_some() {
            return ModuleRuntimeStatus {
                state: ModuleState::Running,
                restart_count,
                exit_code: None,
                reason: None,
            };
        }
        if let Some(terminated) = &state.terminated {
            let state = if terminated.exit_code == 0 {
                ModuleState::Succeeded
            } else {
                ModuleState::Failed
            };
            return ModuleRuntimeStatus {
                state,
                restart_count,
                exit_code: Some(terminated.exit_code),
                reason: terminated.reason.clone(),
            };
        }
        if let Some(waiting) = &state.waiting {
            return ModuleRuntimeStatus {
                state: ModuleState::Pending,
                restart_count,
                exit_code: last_exit_code(container),
                reason: waiting.reason.clone(),
            };
        }
    }

    let mut fallback = from_phase(status);
    fallback.restart_count = restart_count;
    fallback
}

/// Exit code of the previous run, reported while the container waits to
/// restart.
fn last_exit_code(container: &ContainerStatus) -> Option<i32> {
    container
        .last_state
        .as_ref()
        .and_then(|s| s.terminated.as_ref())
        .map(|t| t.exit_code)
}

fn from_phase(status: &PodStatus) -> ModuleRuntimeStatus {
    let state = match status.phase.as_deref() {
        Some("Pending") => ModuleState::Pending,
        Some("Running") => ModuleState::Running,
        Some("Succeeded") => ModuleState::Succeeded,
        Some("Failed") => ModuleState::Failed,
        _ => ModuleState::Unknown,
    };
    ModuleRuntimeStatus {
        state,
        restart_count: 0,
        exit_code: None,
        reason: status.reason.clone(),
    }
}

fn unknown() -> ModuleRuntimeStatus {
    ModuleRuntimeStatus {
        state: ModuleState::Unknown,
        restart_count: 0,
        exit_code: None,
        reason: None,
    }
}
