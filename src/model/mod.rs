//! Translation from module specs to native cluster objects
//!
//! The model builder turns one (module, identity) pair into the objects the
//! engine converges: a Deployment running the module container next to the
//! fixed proxy sidecar, an optional Service when the module exposes ports,
//! and a ServiceAccount binding the module identity. Built objects are
//! stamped with their configuration fingerprint before they leave here.

mod exposure;
mod workload;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use tracing::warn;

use crate::config::OperatorConfig;
use crate::crd::{DockerSettings, ImagePullPolicy, ModuleRuntime, ModuleSpec};
use crate::fingerprint;
use crate::identity::ModuleIdentity;
use crate::names::{sanitize_annotation_key, sanitize_dns_label, sanitize_label_value};
use crate::{DEVICE_LABEL, HUB_LABEL, MODULE_LABEL};

/// Name of the volume carrying the workload API socket
pub(crate) const SOCKET_VOLUME: &str = "gantry-workload-socket";

/// Name of the volume carrying the proxy sidecar configuration
pub(crate) const PROXY_CONFIG_VOLUME: &str = "gantry-proxy-config";

/// Name of the volume carrying the trust bundle
pub(crate) const TRUST_BUNDLE_VOLUME: &str = "gantry-trust-bundle";

/// The objects generated for one module
#[derive(Clone, Debug)]
pub struct BuiltModule {
    /// Workload template running the module and its sidecar
    pub deployment: Deployment,
    /// Network exposure, present only when the module has translatable ports
    pub service: Option<Service>,
    /// Identity binding for the module
    pub service_account: ServiceAccount,
}

/// Everything the per-kind builders need about one module
pub(crate) struct ModuleContext<'a> {
    /// Original module name
    pub name: &'a str,
    /// Sanitized object name, shared by all generated objects
    pub sanitized: String,
    /// Owner labels stamped on every object
    pub labels: BTreeMap<String, String>,
    /// Sanitized docker labels, carried as annotations
    pub annotations: BTreeMap<String, String>,
    /// The module being translated
    pub module: &'a ModuleSpec,
    /// Its docker settings, already type-checked
    pub settings: &'a DockerSettings,
    /// Its resolved identity
    pub identity: &'a ModuleIdentity,
    /// Operator configuration
    pub config: &'a OperatorConfig,
}

/// Builds cluster objects from module specs
pub struct ModuleBuilder<'a> {
    config: &'a OperatorConfig,
}

impl<'a> ModuleBuilder<'a> {
    /// Create a builder over the given operator configuration
    pub fn new(config: &'a OperatorConfig) -> Self {
        Self { config }
    }

    /// Build the cluster objects for one module
    ///
    /// The caller filters unsupported module types ahead of time; hitting
    /// one here is an error, not a skip.
    pub fn build(
        &self,
        name: &str,
        module: &ModuleSpec,
        identity: &ModuleIdentity,
    ) -> crate::Result<BuiltModule> {
        let settings = match module.runtime() {
            ModuleRuntime::Docker(settings) => settings,
            ModuleRuntime::Unsupported(module_type) => {
                return Err(crate::Error::validation(format!(
                    "module '{name}' has unsupported type '{module_type}'"
                )));
            }
        };

        let sanitized = sanitize_dns_label(name);
        if sanitized.is_empty() {
            return Err(crate::Error::validation(format!(
                "module name '{name}' sanitizes to an empty object name"
            )));
        }

        let labels = BTreeMap::from([
            (MODULE_LABEL.to_string(), sanitize_label_value(name)),
            (DEVICE_LABEL.to_string(), self.config.device.clone()),
            (HUB_LABEL.to_string(), self.config.hub.clone()),
        ]);

        let mut annotations = BTreeMap::new();
        for (key, value) in &settings.create_options.labels {
            let sanitized_key = sanitize_annotation_key(key);
            if sanitized_key.is_empty() {
                warn!(module = %name, key = %key, "docker label key sanitizes away, skipping");
                continue;
            }
            annotations.insert(sanitized_key, value.clone());
        }

        let ctx = ModuleContext {
            name,
            sanitized,
            labels,
            annotations,
            module,
            settings,
            identity,
            config: self.config,
        };

        let mut deployment = workload::build_deployment(&ctx);
        let mut service_account = workload::build_service_account(&ctx);
        let mut service = exposure::build_service(&ctx);

        fingerprint::stamp(&mut deployment)?;
        fingerprint::stamp(&mut service_account)?;
        if let Some(svc) = service.as_mut() {
            fingerprint::stamp(svc)?;
        }

        Ok(BuiltModule {
            deployment,
            service,
            service_account,
        })
    }
}

/// Parse a `<port>/<protocol>` map key.
///
/// Unknown protocols fall back to TCP with a warning; a key without a
/// protocol means TCP. An unusable port number skips the entry entirely.
pub(crate) fn parse_port_key(module: &str, key: &str) -> Option<(i32, &'static str)> {
    let (port_part, proto_part) = key.split_once('/').unwrap_or((key, "tcp"));
    let port: u16 = match port_part.parse() {
        Ok(port) if port > 0 => port,
        _ => {
            warn!(module = %module, key = %key, "unusable port in key, skipping");
            return None;
        }
    };
    let protocol = match proto_part.to_ascii_lowercase().as_str() {
        "tcp" => "TCP",
        "udp" => "UDP",
        "sctp" => "SCTP",
        other => {
            warn!(
                module = %module,
                key = %key,
                protocol = %other,
                "unknown protocol, defaulting to TCP"
            );
            "TCP"
        }
    };
    Some((i32::from(port), protocol))
}

/// Pull policy for a container image.
///
/// A policy declared on the module wins. Otherwise floating references (no
/// tag, or `:latest`) are pulled every time so the device picks up
/// re-pushed images; pinned tags are cached.
pub(crate) fn image_pull_policy(declared: Option<ImagePullPolicy>, image: &str) -> &'static str {
    match declared {
        Some(ImagePullPolicy::OnCreate) => return "Always",
        Some(ImagePullPolicy::Never) => return "Never",
        None => {}
    }
    let tag = image
        .rsplit_once(':')
        .filter(|(_, tag)| !tag.contains('/'))
        .map(|(_, tag)| tag);
    match tag {
        None | Some("latest") => "Always",
        Some(_) => "IfNotPresent",
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::FINGERPRINT_ANNOTATION;
    use kube::ResourceExt;

    // =========================================================================
    // Built Object Identity
    // =========================================================================

    /// Story: Every generated object carries the owner labels and a fingerprint
    ///
    /// The device+hub pair is the ownership selector; without it an object
    /// is invisible to reconciliation. The fingerprint annotation is what
    /// future cycles diff against.
    #[test]
    fn story_built_objects_carry_owner_labels_and_fingerprint() {
        let config = make_config();
        let builder = ModuleBuilder::new(&config);
        let module = make_module("cam:1.0");

        let built = builder
            .build("Camera_Front", &module, &make_identity("Camera_Front"))
            .unwrap();

        assert_eq!(built.deployment.name_any(), "camerafront");
        assert_eq!(built.service_account.name_any(), "camerafront");

        for labels in [
            built.deployment.labels(),
            built.service_account.labels(),
        ] {
            assert_eq!(labels[DEVICE_LABEL], "dev1");
            assert_eq!(labels[HUB_LABEL], "hub1");
            assert_eq!(labels[MODULE_LABEL], "camera_front");
        }
        assert!(built
            .deployment
            .annotations()
            .contains_key(FINGERPRINT_ANNOTATION));
        assert!(built
            .service_account
            .annotations()
            .contains_key(FINGERPRINT_ANNOTATION));
        // no ports declared, no exposure generated
        assert!(built.service.is_none());
    }

    /// Story: Unsupported module types are the caller's responsibility
    #[test]
    fn story_unsupported_type_is_an_error_here() {
        let config = make_config();
        let builder = ModuleBuilder::new(&config);
        let mut module = make_module("fw:1");
        module.module_type = "wasm".to_string();

        let err = builder
            .build("fw", &module, &make_identity("fw"))
            .unwrap_err();
        assert!(err.to_string().contains("unsupported type"));
    }

    #[test]
    fn test_unusable_module_name_is_rejected() {
        let config = make_config();
        let builder = ModuleBuilder::new(&config);
        let module = make_module("a:1");

        assert!(builder.build("_$_", &module, &make_identity("x")).is_err());
    }

    // =========================================================================
    // Port Key Parsing
    // =========================================================================

    #[test]
    fn test_port_key_parses_known_protocols() {
        assert_eq!(parse_port_key("m", "8080/tcp"), Some((8080, "TCP")));
        assert_eq!(parse_port_key("m", "53/UDP"), Some((53, "UDP")));
        assert_eq!(parse_port_key("m", "9000/sctp"), Some((9000, "SCTP")));
    }

    #[test]
    fn test_port_key_unknown_protocol_defaults_to_tcp() {
        assert_eq!(parse_port_key("m", "8080/http"), Some((8080, "TCP")));
    }

    #[test]
    fn test_port_key_without_protocol_means_tcp() {
        assert_eq!(parse_port_key("m", "9000"), Some((9000, "TCP")));
    }

    #[test]
    fn test_port_key_rejects_unusable_ports() {
        assert_eq!(parse_port_key("m", "0/tcp"), None);
        assert_eq!(parse_port_key("m", "banana/tcp"), None);
        assert_eq!(parse_port_key("m", "70000/tcp"), None);
        assert_eq!(parse_port_key("m", "/tcp"), None);
    }

    // =========================================================================
    // Image Pull Policy
    // =========================================================================

    #[test]
    fn test_floating_images_always_pull() {
        assert_eq!(image_pull_policy(None, "cam"), "Always");
        assert_eq!(image_pull_policy(None, "cam:latest"), "Always");
        assert_eq!(image_pull_policy(None, "registry:5000/cam"), "Always");
    }

    #[test]
    fn test_pinned_images_cache() {
        assert_eq!(image_pull_policy(None, "cam:1.2.3"), "IfNotPresent");
        assert_eq!(image_pull_policy(None, "registry:5000/cam:1.2"), "IfNotPresent");
    }

    #[test]
    fn test_declared_policy_overrides_tag_heuristic() {
        assert_eq!(
            image_pull_policy(Some(ImagePullPolicy::OnCreate), "cam:1.2.3"),
            "Always"
        );
        assert_eq!(
            image_pull_policy(Some(ImagePullPolicy::Never), "cam:latest"),
            "Never"
        );
    }
}
