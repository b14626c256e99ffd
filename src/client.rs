//! Cluster client seam used by the engine
//!
//! Reconciliation talks to the cluster through [`WorkloadClient`] so tests
//! can drive whole cycles against a mock. The real implementation is a thin
//! mapping onto namespaced typed APIs; the only policy it carries is
//! tolerance of deletes racing other deleters.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::{EdgeDeployment, EdgeDeploymentStatus};
use crate::Error;

/// Trait abstracting cluster operations for reconciliation
///
/// This trait allows mocking the cluster in tests while using the real
/// client in production. Lists take a label selector; everything else is
/// named within the operator's namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// List owned Deployments matching the selector
    async fn list_deployments(&self, selector: &str) -> Result<Vec<Deployment>, Error>;

    /// Create a Deployment
    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Replace a Deployment, carrying the live resource version
    async fn replace_deployment(&self, name: &str, deployment: &Deployment) -> Result<(), Error>;

    /// Delete a Deployment; absence is not an error
    async fn delete_deployment(&self, name: &str) -> Result<(), Error>;

    /// List owned Services matching the selector
    async fn list_services(&self, selector: &str) -> Result<Vec<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<(), Error>;

    /// Replace a Service, carrying the live resource version
    async fn replace_service(&self, name: &str, service: &Service) -> Result<(), Error>;

    /// Delete a Service; absence is not an error
    async fn delete_service(&self, name: &str) -> Result<(), Error>;

    /// List owned ServiceAccounts matching the selector
    async fn list_service_accounts(&self, selector: &str) -> Result<Vec<ServiceAccount>, Error>;

    /// Create a ServiceAccount
    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), Error>;

    /// Delete a ServiceAccount; absence is not an error
    async fn delete_service_account(&self, name: &str) -> Result<(), Error>;

    /// Merge-patch the status subresource of an EdgeDeployment
    async fn patch_edge_deployment_status(
        &self,
        name: &str,
        status: &EdgeDeploymentStatus,
    ) -> Result<(), Error>;
}

/// Real cluster client implementation
pub struct KubeWorkloadClient {
    client: Client,
    namespace: String,
}

impl KubeWorkloadClient {
    /// Create a client scoped to the operator's namespace
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn service_accounts(&self) -> Api<ServiceAccount> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn edge_deployments(&self) -> Api<EdgeDeployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Treat 404 on delete as success; the object being gone is the goal.
fn tolerate_absent(result: Result<(), kube::Error>) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn list_deployments(&self, selector: &str) -> Result<Vec<Deployment>, Error> {
        let params = ListParams::default().labels(selector);
        Ok(self.deployments().list(&params).await?.items)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.deployments()
            .create(&PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn replace_deployment(&self, name: &str, deployment: &Deployment) -> Result<(), Error> {
        self.deployments()
            .replace(name, &PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), Error> {
        tolerate_absent(
            self.deployments()
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn list_services(&self, selector: &str) -> Result<Vec<Service>, Error> {
        let params = ListParams::default().labels(selector);
        Ok(self.services().list(&params).await?.items)
    }

    async fn create_service(&self, service: &Service) -> Result<(), Error> {
        self.services()
            .create(&PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn replace_service(&self, name: &str, service: &Service) -> Result<(), Error> {
        self.services()
            .replace(name, &PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), Error> {
        tolerate_absent(
            self.services()
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn list_service_accounts(&self, selector: &str) -> Result<Vec<ServiceAccount>, Error> {
        let params = ListParams::default().labels(selector);
        Ok(self.service_accounts().list(&params).await?.items)
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), Error> {
        self.service_accounts()
            .create(&PostParams::default(), account)
            .await?;
        Ok(())
    }

    async fn delete_service_account(&self, name: &str) -> Result<(), Error> {
        tolerate_absent(
            self.service_accounts()
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn patch_edge_deployment_status(
        &self,
        name: &str,
        status: &EdgeDeploymentStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({
            "status": status
        });

        self.edge_deployments()
            .patch_status(
                name,
                &PatchParams::apply(crate::FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerate_absent_swallows_404_only() {
        assert!(tolerate_absent(Ok(())).is_ok());

        let gone = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(tolerate_absent(Err(gone)).is_ok());

        let forbidden = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "denied".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        assert!(tolerate_absent(Err(forbidden)).is_err());
    }
}
