//! The reconciliation engine
//!
//! One cycle at a time: an accepted document event takes the engine lock,
//! resolves identities, builds the desired object set, lists the live set
//! fresh, diffs the two, and applies the plan in phases. Overlapping events
//! queue on the lock rather than interleave.
//!
//! Failures inside a cycle abandon it; nothing is retried per object. The
//! next event re-lists live state and recomputes a correct diff, so
//! convergence is idempotent across cycles even when a single cycle dies
//! halfway through.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::backup::BackupStore;
use crate::client::WorkloadClient;
use crate::config::OperatorConfig;
use crate::crd::{EdgeDeployment, EdgeDeploymentSpec, ModuleRuntime, ModuleSpec};
use crate::identity::IdentityProvider;
use crate::model::{BuiltModule, ModuleBuilder};
use crate::plan::{build_plan, LiveSet, ReconcilePlan};
use crate::watch::{EventHandler, WatchDelta};

/// State carried between cycles, guarded by the engine lock
///
/// `current` is only an identity baseline. Cluster diffing never consults
/// it; that is always against a fresh live listing.
#[derive(Default)]
struct EngineState {
    current: BTreeMap<String, ModuleSpec>,
}

/// Reconciles EdgeDeployment documents into cluster objects
pub struct EdgeReconciler {
    config: OperatorConfig,
    client: Arc<dyn WorkloadClient>,
    identity: Arc<dyn IdentityProvider>,
    backup: Arc<dyn BackupStore>,
    state: Mutex<EngineState>,
}

impl EdgeReconciler {
    /// Create an engine over the given collaborators
    pub fn new(
        config: OperatorConfig,
        client: Arc<dyn WorkloadClient>,
        identity: Arc<dyn IdentityProvider>,
        backup: Arc<dyn BackupStore>,
    ) -> Self {
        Self {
            config,
            client,
            identity,
            backup,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Reconcile the restored backup before the watches start.
    ///
    /// A device rebooting without connectivity to its document source still
    /// brings its last applied modules up. Failures are logged, never fatal;
    /// the live watch supersedes whatever happens here.
    pub async fn bootstrap(&self) {
        let Some(spec) = self.backup.restore().await else {
            info!("no backup to restore, waiting for the first document");
            return;
        };
        info!(modules = spec.modules.len(), "reconciling restored module set");
        let doc = EdgeDeployment::new(&self.config.resource_name, spec);
        if let Err(error) = self.converge(&doc).await {
            warn!(%error, "restored module set did not converge, watching anyway");
        }
    }

    /// Whether this document is the one this device reconciles.
    fn accepts(&self, doc: &EdgeDeployment) -> bool {
        let name = doc.name_any();
        if name == self.config.resource_name {
            return true;
        }
        info!(
            document = %name,
            expected = %self.config.resource_name,
            "ignoring document for another device"
        );
        false
    }

    /// Run one full reconciliation cycle for an applied document.
    #[instrument(skip(self, doc), fields(document = %doc.name_any()))]
    async fn converge(&self, doc: &EdgeDeployment) -> crate::Result<()> {
        let mut state = self.state.lock().await;

        doc.spec.validate()?;

        // desired modules, unsupported types logged and dropped
        let mut modules: BTreeMap<&String, &ModuleSpec> = BTreeMap::new();
        for (name, module) in &doc.spec.modules {
            match module.runtime() {
                ModuleRuntime::Docker(_) => {
                    modules.insert(name, module);
                }
                ModuleRuntime::Unsupported(module_type) => {
                    error!(module = %name, module_type, "unsupported module type, skipping");
                }
            }
        }

        let desired_names: BTreeSet<String> = modules.keys().map(|n| n.to_string()).collect();
        let current_names: BTreeSet<String> = state.current.keys().cloned().collect();
        let identities = match self.identity.resolve(&desired_names, &current_names).await {
            Ok(identities) => identities,
            Err(error) => {
                warn!(%error, "identity resolution failed, treating as no identities");
                BTreeMap::new()
            }
        };

        let builder = ModuleBuilder::new(&self.config);
        let mut desired: BTreeMap<String, BuiltModule> = BTreeMap::new();
        let mut applied: BTreeMap<String, ModuleSpec> = BTreeMap::new();
        for (name, module) in modules {
            let Some(identity) = identities.get(name.as_str()) else {
                warn!(module = %name, "no identity this cycle, excluding module");
                continue;
            };
            match builder.build(name, module, identity) {
                Ok(built) => {
                    desired.insert(built.deployment.name_any(), built);
                    applied.insert(name.clone(), module.clone());
                }
                Err(error) => {
                    error!(module = %name, %error, "module failed to build, excluding it");
                }
            }
        }

        let live = self.list_live().await?;
        let plan = build_plan(&self.config, &desired, &live)?;
        if plan.is_empty() {
            debug!("cluster already converged");
        } else {
            info!(
                account_prunes = plan.account_prunes.len(),
                account_creates = plan.account_creates.len(),
                creates = plan.deployment_creates.len() + plan.service_creates.len(),
                updates = plan.deployment_updates.len() + plan.service_updates.len(),
                deletes = plan.deployment_deletes.len() + plan.service_deletes.len(),
                "applying plan"
            );
        }
        self.execute(&plan).await?;

        state.current = applied;
        self.backup
            .save(&EdgeDeploymentSpec {
                modules: state.current.clone(),
            })
            .await;
        Ok(())
    }

    /// Remove every owned object after the document is deleted.
    #[instrument(skip(self))]
    async fn purge(&self) -> crate::Result<()> {
        let mut state = self.state.lock().await;

        let live = self.list_live().await?;
        let plan = build_plan(&self.config, &BTreeMap::new(), &live)?;
        info!(
            deletes = plan.mutation_count(),
            "document deleted, removing all owned objects"
        );
        self.execute(&plan).await?;

        state.current.clear();
        self.backup.clear().await;
        Ok(())
    }

    async fn list_live(&self) -> crate::Result<LiveSet> {
        let selector = self.config.owner_selector();
        let (deployments, services, service_accounts) = tokio::try_join!(
            self.client.list_deployments(&selector),
            self.client.list_services(&selector),
            self.client.list_service_accounts(&selector),
        )?;
        Ok(LiveSet {
            deployments,
            services,
            service_accounts,
        })
    }

    /// Apply a plan phase by phase.
    ///
    /// Account prunes must be observably finished before any create runs:
    /// accounts cannot be updated in place, so a recreate racing its own
    /// delete would collide on the name. Within each phase all calls fan
    /// out concurrently and join.
    async fn execute(&self, plan: &ReconcilePlan) -> crate::Result<()> {
        let client = &*self.client;

        try_join_all(
            plan.account_prunes
                .iter()
                .map(|name| client.delete_service_account(name)),
        )
        .await?;

        try_join_all(
            plan.deployment_deletes
                .iter()
                .map(|name| client.delete_deployment(name)),
        )
        .await?;
        try_join_all(
            plan.service_deletes
                .iter()
                .map(|name| client.delete_service(name)),
        )
        .await?;

        try_join_all(
            plan.account_creates
                .iter()
                .map(|account| client.create_service_account(account)),
        )
        .await?;
        try_join_all(
            plan.deployment_creates
                .iter()
                .map(|deployment| client.create_deployment(deployment)),
        )
        .await?;
        try_join_all(
            plan.service_creates
                .iter()
                .map(|service| client.create_service(service)),
        )
        .await?;

        try_join_all(plan.deployment_updates.iter().map(|deployment| {
            let name = deployment.name_any();
            async move { client.replace_deployment(&name, deployment).await }
        }))
        .await?;
        try_join_all(plan.service_updates.iter().map(|service| {
            let name = service.name_any();
            async move { client.replace_service(&name, service).await }
        }))
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EventHandler<EdgeDeployment> for EdgeReconciler {
    async fn handle(&self, delta: WatchDelta<EdgeDeployment>) -> crate::Result<()> {
        match delta {
            WatchDelta::Applied(doc) => {
                if !self.accepts(&doc) {
                    return Ok(());
                }
                self.converge(&doc).await
            }
            WatchDelta::Deleted(doc) => {
                if !self.accepts(&doc) {
                    return Ok(());
                }
                self.purge().await
            }
        }
    }
}
