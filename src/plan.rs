//! Pure diff between desired and live object sets
//!
//! Planning is a function: it mutates nothing and talks to no one. The
//! engine lists the live objects, builds the desired ones, and hands both
//! here; the plan that comes back says exactly which objects to create,
//! replace, or delete. Keeping the decision pure is what lets the tests
//! drive whole reconciliation scenarios without a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::fingerprint::{fingerprint, read_fingerprint};
use crate::model::BuiltModule;
use crate::names::sanitize_dns_label;
use crate::{DEVICE_LABEL, FINGERPRINT_ANNOTATION, HUB_LABEL};

/// Owned objects currently in the cluster, listed fresh each cycle
#[derive(Clone, Debug, Default)]
pub struct LiveSet {
    /// Deployments matching the owner selector
    pub deployments: Vec<Deployment>,
    /// Services matching the owner selector
    pub services: Vec<Service>,
    /// ServiceAccounts matching the owner selector
    pub service_accounts: Vec<ServiceAccount>,
}

/// The mutations one reconciliation cycle must apply
///
/// ServiceAccounts never update in place and live exactly as long as their
/// workload: a deleted or replaced workload puts its account in
/// `account_prunes`, a created or replaced workload puts it in
/// `account_creates`. Prunes run to completion before anything else so the
/// recreate observes the delete.
#[derive(Clone, Debug, Default)]
pub struct ReconcilePlan {
    /// ServiceAccounts to delete first, for removed or changed modules
    pub account_prunes: Vec<String>,
    /// ServiceAccounts to create
    pub account_creates: Vec<ServiceAccount>,
    /// Deployments to create
    pub deployment_creates: Vec<Deployment>,
    /// Deployments to replace, live resource version carried
    pub deployment_updates: Vec<Deployment>,
    /// Deployments to delete
    pub deployment_deletes: Vec<String>,
    /// Services to create
    pub service_creates: Vec<Service>,
    /// Services to replace, live resource version carried
    pub service_updates: Vec<Service>,
    /// Services to delete
    pub service_deletes: Vec<String>,
}

impl ReconcilePlan {
    /// True when the cycle has nothing to do
    pub fn is_empty(&self) -> bool {
        self.mutation_count() == 0
    }

    /// Total number of mutations the plan will apply
    pub fn mutation_count(&self) -> usize {
        self.account_prunes.len()
            + self.account_creates.len()
            + self.deployment_creates.len()
            + self.deployment_updates.len()
            + self.deployment_deletes.len()
            + self.service_creates.len()
            + self.service_updates.len()
            + self.service_deletes.len()
    }
}

/// Compute the plan converging the cluster onto the desired modules.
///
/// `desired` is keyed by sanitized object name. Live objects that slipped
/// through the selector without carrying this operator's exact owner
/// labels are left alone.
pub fn build_plan(
    config: &OperatorConfig,
    desired: &BTreeMap<String, BuiltModule>,
    live: &LiveSet,
) -> crate::Result<ReconcilePlan> {
    let mut plan = ReconcilePlan::default();

    let mut live_deployments = index_owned(&live.deployments, config, "Deployment");
    let mut live_services = index_owned(&live.services, config, "Service");
    let mut live_accounts = index_owned(&live.service_accounts, config, "ServiceAccount");

    for (name, built) in desired {
        let decision =
            diff_deployment(config, name, built, live_deployments.remove(name), &mut plan)?;
        plan_account(name, built, decision, live_accounts.remove(name), &mut plan);
        diff_service(name, built, live_services.remove(name), &mut plan)?;
    }

    // whatever remains live has no desired counterpart
    plan.deployment_deletes.extend(live_deployments.into_keys());
    plan.service_deletes.extend(live_services.into_keys());
    plan.account_prunes.extend(live_accounts.into_keys());

    Ok(plan)
}

/// What one cycle does with a desired workload.
#[derive(Clone, Copy, Debug, PartialEq)]
enum WorkloadDecision {
    Create,
    Update,
    Keep,
}

/// Index live objects by name, dropping anything this operator does not own.
fn index_owned<'a, K: ResourceExt>(
    objects: &'a [K],
    config: &OperatorConfig,
    kind: &str,
) -> BTreeMap<String, &'a K> {
    let mut owned = BTreeMap::new();
    for obj in objects {
        let name = obj.name_any();
        if !is_owned(obj.labels(), config) {
            warn!(kind, name = %name, "listed object lacks this device's owner labels, leaving it alone");
            continue;
        }
        owned.insert(name, obj);
    }
    owned
}

fn is_owned(labels: &BTreeMap<String, String>, config: &OperatorConfig) -> bool {
    labels.get(DEVICE_LABEL).is_some_and(|v| v == &config.device)
        && labels.get(HUB_LABEL).is_some_and(|v| v == &config.hub)
}

fn diff_deployment(
    config: &OperatorConfig,
    name: &str,
    built: &BuiltModule,
    live: Option<&Deployment>,
    plan: &mut ReconcilePlan,
) -> crate::Result<WorkloadDecision> {
    let Some(live) = live else {
        plan.deployment_creates.push(built.deployment.clone());
        return Ok(WorkloadDecision::Create);
    };

    if read_fingerprint(live)? == read_fingerprint(&built.deployment)? {
        debug!(name, "deployment up to date");
        return Ok(WorkloadDecision::Keep);
    }

    if is_self_image_rollout(config, name, &built.deployment, live)? {
        info!(name, "skipping self update, image references are equivalent");
        return Ok(WorkloadDecision::Keep);
    }

    let mut updated = built.deployment.clone();
    updated.metadata.resource_version = live.metadata.resource_version.clone();
    plan.deployment_updates.push(updated);
    Ok(WorkloadDecision::Update)
}

/// Tie the account lifecycle to the workload decision.
///
/// In-place account update is not supported, so a replaced workload gets a
/// pruned and recreated account even when the account content is unchanged.
/// A kept workload whose account went missing gets it back.
fn plan_account(
    name: &str,
    built: &BuiltModule,
    decision: WorkloadDecision,
    live: Option<&ServiceAccount>,
    plan: &mut ReconcilePlan,
) {
    match decision {
        WorkloadDecision::Keep => {
            if live.is_none() {
                plan.account_creates.push(built.service_account.clone());
            }
        }
        WorkloadDecision::Create | WorkloadDecision::Update => {
            if live.is_some() {
                plan.account_prunes.push(name.to_string());
            }
            plan.account_creates.push(built.service_account.clone());
        }
    }
}

fn diff_service(
    name: &str,
    built: &BuiltModule,
    live: Option<&Service>,
    plan: &mut ReconcilePlan,
) -> crate::Result<()> {
    match (&built.service, live) {
        (Some(service), None) => plan.service_creates.push(service.clone()),
        (None, Some(_)) => plan.service_deletes.push(name.to_string()),
        (Some(service), Some(live)) => {
            if read_fingerprint(live)? != read_fingerprint(service)? {
                let mut updated = service.clone();
                updated.metadata.resource_version = live.metadata.resource_version.clone();
                plan.service_updates.push(updated);
            }
        }
        (None, None) => {}
    }
    Ok(())
}

/// Whether a drifted deployment is this operator's own, differing only in
/// how the image is written.
///
/// The device runtime and the cluster routinely spell the same image
/// differently (`docker.io/library/` prefix, explicit `:latest`). Replacing
/// the operator's own deployment over a spelling difference would kill the
/// reconciliation mid-cycle, so that one update is skipped. Any real
/// difference still rolls out.
fn is_self_image_rollout(
    config: &OperatorConfig,
    name: &str,
    desired: &Deployment,
    live: &Deployment,
) -> crate::Result<bool> {
    let Some(self_module) = config.self_module.as_deref() else {
        return Ok(false);
    };
    if name != sanitize_dns_label(self_module) {
        return Ok(false);
    }

    // the stamp holds the full applied object, so it can be parsed back
    // and compared field by field
    let Some(stamp) = live.annotations().get(FINGERPRINT_ANNOTATION) else {
        return Ok(false);
    };
    let applied: Deployment = match serde_json::from_str(stamp) {
        Ok(applied) => applied,
        Err(_) => return Ok(false),
    };

    Ok(fingerprint(&normalize_images(desired))? == fingerprint(&normalize_images(&applied))?)
}

fn normalize_images(deployment: &Deployment) -> Deployment {
    let mut normalized = deployment.clone();
    let pod = normalized
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut());
    if let Some(pod) = pod {
        for container in &mut pod.containers {
            if let Some(image) = container.image.as_mut() {
                *image = normalize_image_reference(image);
            }
        }
    }
    normalized
}

/// Reduce an image reference to its shortest equivalent spelling.
fn normalize_image_reference(image: &str) -> String {
    let image = image
        .strip_prefix("docker.io/library/")
        .or_else(|| image.strip_prefix("docker.io/"))
        .unwrap_or(image);
    match image.rsplit_once(':') {
        Some((repository, "latest")) => repository.to_string(),
        _ => image.to_string(),
    }
}
