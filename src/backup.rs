//! Durable backup of the last applied module set
//!
//! An edge device can reboot while the hub that feeds it documents is
//! unreachable. The engine persists the module set it last applied into a
//! Secret; at startup the restored copy drives one reconciliation before
//! the watches take over. Everything here is best effort: a device that
//! cannot back up still reconciles, it just starts cold next time.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::EdgeDeploymentSpec;

/// Key inside the backup Secret holding the serialized deployment spec
const BACKUP_KEY: &str = "spec";

/// Trait for persisting the last applied deployment spec
///
/// Mocked in engine tests; the Secret-backed implementation is the only
/// real one. None of the operations return errors: callers have nothing
/// useful to do with a failed backup beyond what is logged here.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Read the backup once at startup
    async fn restore(&self) -> Option<EdgeDeploymentSpec>;

    /// Persist the module set a successful cycle applied
    async fn save(&self, spec: &EdgeDeploymentSpec);

    /// Drop the backup after the document is deleted
    async fn clear(&self);
}

/// Backup store writing to a namespaced Secret
pub struct SecretBackupStore {
    secrets: Api<Secret>,
    name: String,
}

impl SecretBackupStore {
    /// Create a store writing to the named Secret
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            secrets: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }
}

#[async_trait]
impl BackupStore for SecretBackupStore {
    async fn restore(&self) -> Option<EdgeDeploymentSpec> {
        let secret = match self.secrets.get(&self.name).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                info!(secret = %self.name, "no backup present");
                return None;
            }
            Err(error) => {
                warn!(secret = %self.name, %error, "backup read failed, starting cold");
                return None;
            }
        };
        extract(&self.name, &secret)
    }

    async fn save(&self, spec: &EdgeDeploymentSpec) {
        let secret = match render(&self.name, spec) {
            Ok(secret) => secret,
            Err(error) => {
                warn!(secret = %self.name, %error, "module set did not serialize, backup skipped");
                return;
            }
        };

        let params = PatchParams::apply(crate::FIELD_MANAGER).force();
        match self
            .secrets
            .patch(&self.name, &params, &Patch::Apply(&secret))
            .await
        {
            Ok(_) => debug!(secret = %self.name, "backup written"),
            Err(error) => warn!(secret = %self.name, %error, "backup write failed"),
        }
    }

    async fn clear(&self) {
        match self.secrets.delete(&self.name, &DeleteParams::default()).await {
            Ok(_) => info!(secret = %self.name, "backup cleared"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(error) => warn!(secret = %self.name, %error, "backup clear failed"),
        }
    }
}

fn render(name: &str, spec: &EdgeDeploymentSpec) -> crate::Result<Secret> {
    let payload = serde_json::to_string(spec)?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some([(BACKUP_KEY.to_string(), payload)].into()),
        ..Default::default()
    })
}

fn extract(name: &str, secret: &Secret) -> Option<EdgeDeploymentSpec> {
    let Some(bytes) = secret.data.as_ref().and_then(|data| data.get(BACKUP_KEY)) else {
        warn!(secret = %name, "backup secret has no spec key, ignoring it");
        return None;
    };
    match serde_json::from_slice(&bytes.0) {
        Ok(spec) => Some(spec),
        Err(error) => {
            warn!(secret = %name, %error, "backup is unreadable, ignoring it");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn sample_spec() -> EdgeDeploymentSpec {
        serde_json::from_value(serde_json::json!({
            "modules": {
                "telemetry": {
                    "settings": { "image": "img/telemetry:1.0" }
                }
            }
        }))
        .unwrap()
    }

    /// Story: the backup Secret survived but its payload was mangled. The
    /// store logs and reports no backup instead of refusing to start.
    #[test]
    fn story_corrupt_backup_falls_back_to_cold_start() {
        let mut secret = Secret::default();
        assert!(extract("backup", &secret).is_none(), "no data map");

        secret.data = Some(BTreeMap::from([(
            "wrong-key".to_string(),
            ByteString(b"{}".to_vec()),
        )]));
        assert!(extract("backup", &secret).is_none(), "missing key");

        secret.data = Some(BTreeMap::from([(
            BACKUP_KEY.to_string(),
            ByteString(b"not json at all".to_vec()),
        )]));
        assert!(extract("backup", &secret).is_none(), "garbage payload");
    }

    #[test]
    fn test_rendered_backup_restores_the_same_spec() {
        let spec = sample_spec();
        let secret = render("backup", &spec).unwrap();

        // the server moves string_data into data; simulate that
        let stored = Secret {
            data: Some(
                secret
                    .string_data
                    .unwrap()
                    .into_iter()
                    .map(|(k, v)| (k, ByteString(v.into_bytes())))
                    .collect(),
            ),
            ..Default::default()
        };

        assert_eq!(extract("backup", &stored), Some(spec));
    }
}
