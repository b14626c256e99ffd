//! Operator configuration resolved once at startup
//!
//! All environment-derived state is read exactly once, validated, and
//! carried in an [`OperatorConfig`] that is passed explicitly to everything
//! that needs it. Nothing in the crate reads the environment after startup.

use std::time::Duration;

use crate::identity::ModuleIdentity;
use crate::names::{sanitize_label_value, sanitize_resource_name};
use crate::{DEVICE_LABEL, HUB_LABEL};

/// How network exposures with host-port bindings are published
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExternalServiceMode {
    /// Publish on a cluster-allocated node port
    #[default]
    NodePort,
    /// Publish through the cluster's load balancer integration
    LoadBalancer,
}

impl ExternalServiceMode {
    /// Parse the configured mode, case-insensitively
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nodeport" => Ok(Self::NodePort),
            "loadbalancer" => Ok(Self::LoadBalancer),
            other => Err(crate::Error::config(format!(
                "unknown external service mode '{other}', expected NodePort or LoadBalancer"
            ))),
        }
    }

    /// The service type string written into generated Services
    pub fn service_type(&self) -> &'static str {
        match self {
            Self::NodePort => "NodePort",
            Self::LoadBalancer => "LoadBalancer",
        }
    }
}

/// Proxy sidecar settings, fixed per operator instance
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Sidecar container image
    pub image: String,
    /// ConfigMap backing the sidecar configuration volume
    pub config_map: String,
    /// Path the sidecar configuration is mounted at
    pub config_path: String,
    /// ConfigMap holding the trust bundle mounted into the sidecar
    pub trust_bundle_config_map: String,
    /// Path the trust bundle is mounted at
    pub trust_bundle_path: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            image: "gantry/proxy:latest".to_string(),
            config_map: "gantry-proxy-config".to_string(),
            config_path: "/etc/gantry/proxy".to_string(),
            trust_bundle_config_map: "gantry-trust-bundle".to_string(),
            trust_bundle_path: "/etc/gantry/trust".to_string(),
        }
    }
}

/// Operator configuration, resolved once and passed explicitly
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Raw device id as registered with the hub
    pub device_id: String,
    /// Raw hub name
    pub hub_name: String,
    /// Namespace all owned objects live in
    pub namespace: String,
    /// Sanitized device label value
    pub device: String,
    /// Sanitized hub label value
    pub hub: String,
    /// Expected name of the device's EdgeDeployment resource
    pub resource_name: String,
    /// Proxy sidecar settings
    pub proxy: ProxyConfig,
    /// Host directory holding the workload API socket
    pub workload_socket_host_path: String,
    /// Mount path of the workload socket inside containers
    pub workload_socket_mount_path: String,
    /// Workload API endpoint handed to modules
    pub workload_uri: String,
    /// Service type used once a module requests host-port bindings
    pub external_mode: ExternalServiceMode,
    /// Interval between forced re-list reconciles
    pub resync_interval: Duration,
    /// Module name of the orchestrator's own workload, if it runs as one
    pub self_module: Option<String>,
}

impl OperatorConfig {
    /// Validate raw identity inputs and derive the sanitized forms
    pub fn resolve(
        device_id: impl Into<String>,
        hub_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> crate::Result<Self> {
        let device_id = device_id.into();
        let hub_name = hub_name.into();
        let namespace = namespace.into();

        if device_id.is_empty() {
            return Err(crate::Error::config("device id must not be empty"));
        }
        if hub_name.is_empty() {
            return Err(crate::Error::config("hub name must not be empty"));
        }

        let device = sanitize_label_value(&device_id);
        let hub = sanitize_label_value(&hub_name);
        if device.is_empty() || hub.is_empty() {
            return Err(crate::Error::config(format!(
                "device '{device_id}' or hub '{hub_name}' sanitizes to an empty label value"
            )));
        }

        let resource_name = sanitize_resource_name(&format!("{hub_name}-{device_id}"));

        Ok(Self {
            device_id,
            hub_name,
            namespace,
            device,
            hub,
            resource_name,
            proxy: ProxyConfig::default(),
            workload_socket_host_path: "/var/run/gantry/workload".to_string(),
            workload_socket_mount_path: "/var/run/gantry".to_string(),
            workload_uri: "unix:///var/run/gantry/workload.sock".to_string(),
            external_mode: ExternalServiceMode::default(),
            resync_interval: Duration::from_secs(300),
            self_module: None,
        })
    }

    /// Label selector matching every object this operator owns
    pub fn owner_selector(&self) -> String {
        format!("{DEVICE_LABEL}={},{HUB_LABEL}={}", self.device, self.hub)
    }

    /// Name of the Secret holding the last-known-good deployment
    pub fn backup_secret_name(&self) -> String {
        format!("{}-gantry-backup", self.device)
    }

    /// Environment injected into every module container
    ///
    /// These are the orchestration-side variables a module needs to find its
    /// identity and the workload API. Module-authored environment always
    /// layers on top of (and may not be overridden by) this list, so the
    /// list is applied last by the model builder.
    pub fn injected_env(&self, module_name: &str, identity: &ModuleIdentity) -> Vec<(String, String)> {
        vec![
            ("GANTRY_DEVICEID".to_string(), self.device_id.clone()),
            ("GANTRY_HUBNAME".to_string(), self.hub_name.clone()),
            ("GANTRY_MODULEID".to_string(), identity.module_id.clone()),
            (
                "GANTRY_MODULEGENERATIONID".to_string(),
                identity.generation_id.clone(),
            ),
            ("GANTRY_WORKLOADURI".to_string(), self.workload_uri.clone()),
            ("GANTRY_APIVERSION".to_string(), "2024-07-01".to_string()),
            ("GANTRY_MODULENAME".to_string(), module_name.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Identity Resolution
    // =========================================================================

    #[test]
    fn test_resolve_sanitizes_device_and_hub() {
        let config = OperatorConfig::resolve("Edge_Device-01", "Plant.Hub", "edge").unwrap();
        assert_eq!(config.device, "edge_device-01");
        assert_eq!(config.hub, "plant.hub");
        // resource names drop underscores entirely; label values keep them
        assert_eq!(config.resource_name, "plant.hub-edgedevice-01");
    }

    #[test]
    fn test_resolve_rejects_empty_identities() {
        assert!(OperatorConfig::resolve("", "hub", "ns").is_err());
        assert!(OperatorConfig::resolve("dev", "", "ns").is_err());
        assert!(OperatorConfig::resolve("$$$", "hub", "ns").is_err());
    }

    #[test]
    fn test_owner_selector_uses_sanitized_pair() {
        let config = OperatorConfig::resolve("Dev1", "Hub1", "edge").unwrap();
        assert_eq!(
            config.owner_selector(),
            "gantry.dev/device=dev1,gantry.dev/hub=hub1"
        );
    }

    #[test]
    fn test_backup_secret_name_is_device_scoped() {
        let config = OperatorConfig::resolve("dev1", "hub1", "edge").unwrap();
        assert_eq!(config.backup_secret_name(), "dev1-gantry-backup");
    }

    // =========================================================================
    // External Service Mode
    // =========================================================================

    #[test]
    fn test_external_mode_parses_case_insensitively() {
        assert_eq!(
            ExternalServiceMode::parse("loadbalancer").unwrap(),
            ExternalServiceMode::LoadBalancer
        );
        assert_eq!(
            ExternalServiceMode::parse("NodePort").unwrap(),
            ExternalServiceMode::NodePort
        );
        assert!(ExternalServiceMode::parse("ingress").is_err());
    }

    // =========================================================================
    // Injected Environment
    // =========================================================================

    #[test]
    fn test_injected_env_names_the_module_identity() {
        let config = OperatorConfig::resolve("dev1", "hub1", "edge").unwrap();
        let identity = ModuleIdentity::new("telemetry", "gen-1");
        let env = config.injected_env("telemetry", &identity);

        let find = |k: &str| {
            env.iter()
                .find(|(name, _)| name == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(find("GANTRY_MODULEID"), Some("telemetry"));
        assert_eq!(find("GANTRY_MODULEGENERATIONID"), Some("gen-1"));
        assert_eq!(find("GANTRY_DEVICEID"), Some("dev1"));
        assert_eq!(find("GANTRY_WORKLOADURI"), Some(config.workload_uri.as_str()));
    }
}
