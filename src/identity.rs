//! Module identity resolution at the provisioning boundary
//!
//! Every module runs under an identity minted by an external provisioning
//! subsystem. This crate only consumes identities: the engine hands the
//! provider the set of desired module names plus the set it applied last
//! time, and gets back whatever identities exist. Credential issuance,
//! rotation, and revocation all live on the far side of [`IdentityProvider`].

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// A resolved module identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleIdentity {
    /// Unsanitized module id as the provisioning subsystem knows it
    pub module_id: String,
    /// Generation id, changes when the identity is re-provisioned
    pub generation_id: String,
    /// Which subsystem manages this identity
    pub managed_by: String,
}

impl ModuleIdentity {
    /// Create an identity managed by the edge orchestrator
    pub fn new(module_id: impl Into<String>, generation_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            generation_id: generation_id.into(),
            managed_by: "gantry".to_string(),
        }
    }
}

/// Trait for resolving module identities
///
/// This trait abstracts the provisioning subsystem for testability. The
/// desired and current name sets together let the provider create missing
/// identities and retire orphaned ones in a single round trip.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve identities for the given module names
    ///
    /// Returns a map keyed by module name. Names absent from the result have
    /// no identity this cycle; the engine excludes them rather than failing.
    async fn resolve(
        &self,
        desired: &BTreeSet<String>,
        current: &BTreeSet<String>,
    ) -> crate::Result<BTreeMap<String, ModuleIdentity>>;
}

/// Identity provider for clusters where credentials are provisioned out of band
///
/// Mints deterministic identities from the device identity so the operator
/// can run standalone: module id is the module name, generation id is fixed
/// per device. Anything that needs real credential lifecycle plugs in its
/// own [`IdentityProvider`].
pub struct LocalIdentityProvider {
    device_id: String,
}

impl LocalIdentityProvider {
    /// Create a provider scoped to one device
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn resolve(
        &self,
        desired: &BTreeSet<String>,
        _current: &BTreeSet<String>,
    ) -> crate::Result<BTreeMap<String, ModuleIdentity>> {
        Ok(desired
            .iter()
            .map(|name| {
                let identity = ModuleIdentity::new(name.clone(), format!("{}-0", self.device_id));
                (name.clone(), identity)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_provider_covers_every_desired_module() {
        let provider = LocalIdentityProvider::new("dev1");
        let desired: BTreeSet<String> = ["telemetry", "camera"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let identities = provider.resolve(&desired, &BTreeSet::new()).await.unwrap();
        assert_eq!(identities.len(), 2);
        assert_eq!(identities["camera"].module_id, "camera");
        assert_eq!(identities["camera"].generation_id, "dev1-0");
        assert_eq!(identities["camera"].managed_by, "gantry");
    }

    #[tokio::test]
    async fn test_local_provider_ignores_retired_names() {
        let provider = LocalIdentityProvider::new("dev1");
        let desired: BTreeSet<String> = [String::from("telemetry")].into_iter().collect();
        let current: BTreeSet<String> = [String::from("old-module")].into_iter().collect();

        let identities = provider.resolve(&desired, &current).await.unwrap();
        assert!(identities.contains_key("telemetry"));
        assert!(!identities.contains_key("old-module"));
    }
}
