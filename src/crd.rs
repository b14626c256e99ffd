//! EdgeDeployment Custom Resource Definition
//!
//! The EdgeDeployment CRD describes the complete desired workload state of
//! one edge device: a set of named modules, each with a container image,
//! runtime creation options, and an optional registry credential. The
//! reconciliation engine consumes exactly one EdgeDeployment, the one whose
//! name matches the configured device id after sanitization.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::names::sanitize_dns_label;

/// Desired state of an EdgeDeployment
///
/// Module names are map keys, so uniqueness is structural. The names are
/// foreign identifiers; everything derived from them (object names, selector
/// values, volume names) goes through the sanitizers first.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gantry.dev",
    version = "v1alpha1",
    kind = "EdgeDeployment",
    plural = "edgedeployments",
    shortname = "ed",
    status = "EdgeDeploymentStatus",
    namespaced,
    printcolumn = r#"{"name":"Modules","type":"integer","jsonPath":".status.moduleCount"}"#,
    printcolumn = r#"{"name":"Running","type":"integer","jsonPath":".status.runningCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeploymentSpec {
    /// Modules to run on the device, keyed by module name
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleSpec>,
}

impl EdgeDeploymentSpec {
    /// Validate the deployment document
    ///
    /// Sanitization is lossy, so two distinct module names may collapse to
    /// the same object name. That collision has to be rejected up front;
    /// detecting it later would look like one module flapping between two
    /// configurations.
    pub fn validate(&self) -> Result<(), crate::Error> {
        let mut seen: BTreeMap<String, &str> = BTreeMap::new();
        for name in self.modules.keys() {
            let sanitized = sanitize_dns_label(name);
            if sanitized.is_empty() {
                return Err(crate::Error::validation(format!(
                    "module name '{name}' sanitizes to an empty object name"
                )));
            }
            if let Some(prev) = seen.insert(sanitized, name) {
                return Err(crate::Error::validation(format!(
                    "module names '{prev}' and '{name}' collide after sanitization"
                )));
            }
        }
        Ok(())
    }
}

/// A single module in the deployment document
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    /// Module version as declared by the author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Runtime type; only `docker` modules are translatable
    #[serde(default = "default_module_type", rename = "type")]
    pub module_type: String,

    /// Desired run state of the module
    #[serde(default)]
    pub desired_status: DesiredStatus,

    /// Restart policy as declared by the author
    ///
    /// Carried for fidelity of the module description. Workloads run under
    /// the platform's own restart semantics, which admit no other policy.
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Declared image pull policy, overriding the tag-derived default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<ImagePullPolicy>,

    /// Environment variables declared directly on the module
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Container runtime settings
    pub settings: DockerSettings,
}

impl ModuleSpec {
    /// Checked view over the runtime settings of this module
    ///
    /// The engine never matches on the raw `type` string; unsupported types
    /// surface here, once, as [`ModuleRuntime::Unsupported`].
    pub fn runtime(&self) -> ModuleRuntime<'_> {
        if self.module_type == "docker" {
            ModuleRuntime::Docker(&self.settings)
        } else {
            ModuleRuntime::Unsupported(&self.module_type)
        }
    }
}

fn default_module_type() -> String {
    "docker".to_string()
}

/// Tagged view over a module's runtime settings
#[derive(Debug)]
pub enum ModuleRuntime<'a> {
    /// A docker module with translatable settings
    Docker(&'a DockerSettings),
    /// A module whose type this operator cannot translate
    Unsupported(&'a str),
}

/// Desired run state of a module
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DesiredStatus {
    /// The module should be running
    #[default]
    Running,
    /// The module should be present but stopped
    Stopped,
}

/// Restart policy declared on a module
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Always restart the module
    #[default]
    Always,
    /// Restart only on failure
    OnFailure,
    /// Never restart
    Never,
}

/// Image pull policy declared on a module
///
/// Absent means the pull behavior is derived from the image tag.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ImagePullPolicy {
    /// Pull the image whenever the container is created
    OnCreate,
    /// Never pull; the image must already be present on the node
    Never,
}

/// Container runtime settings of a docker module
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DockerSettings {
    /// Container image reference
    pub image: String,

    /// Registry credentials for pulling the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RegistryAuth>,

    /// Container creation options
    #[serde(default, skip_serializing_if = "CreateOptions::is_empty")]
    pub create_options: CreateOptions,
}

/// Registry credential reference for image pulls
///
/// Either names an existing pull secret or carries the credential identity
/// the pull-secret name is derived from.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAuth {
    /// Registry user name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Registry password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Registry server address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,

    /// Name of an existing image-pull secret, overriding the derived name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

impl RegistryAuth {
    /// Name of the image-pull secret for these credentials
    ///
    /// An explicit secret name wins; otherwise the name is derived from the
    /// credential identity (`<username>-<server>`), sanitized. Credentials
    /// without enough identity to name a secret yield `None`.
    pub fn pull_secret_name(&self) -> Option<String> {
        if let Some(name) = &self.secret_name {
            let sanitized = sanitize_dns_label(name);
            return (!sanitized.is_empty()).then_some(sanitized);
        }
        match (&self.username, &self.server_address) {
            (Some(user), Some(server)) => {
                let sanitized = sanitize_dns_label(&format!("{user}-{server}"));
                (!sanitized.is_empty()).then_some(sanitized)
            }
            _ => None,
        }
    }
}

/// Container creation options of a docker module
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateOptions {
    /// Environment entries in `KEY=VALUE` form
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Container ports to expose, keyed `<port>/<protocol>`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, PortOptions>,

    /// Docker labels, carried onto generated objects as annotations
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Host-level container options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
}

impl CreateOptions {
    /// True when no option is set
    pub fn is_empty(&self) -> bool {
        self.env.is_empty()
            && self.exposed_ports.is_empty()
            && self.labels.is_empty()
            && self.host_config.is_none()
    }
}

/// Per-port options in the exposed-ports map
///
/// The runtime writes empty objects here; the key carries all the data.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PortOptions {}

/// Host-level container options
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    /// Run the container privileged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,

    /// Bind mounts in `host[:container[:ro]]` string form
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<String>,

    /// Structured mounts
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSpec>,

    /// Host port remappings, keyed `<container port>/<protocol>`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
}

/// One host-port binding for a container port
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    /// Host port, as the runtime writes it
    pub host_port: String,

    /// Host interface address, ignored by the translation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
}

/// A structured mount request
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MountSpec {
    /// Mount kind: `bind` or `volume`
    #[serde(rename = "type")]
    pub mount_type: String,

    /// Host path (bind) or volume name (volume)
    pub source: String,

    /// Path inside the container
    pub target: String,

    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

/// Status for an EdgeDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeploymentStatus {
    /// Modules in the last accepted document
    #[serde(default)]
    pub module_count: u32,

    /// Modules whose pods currently report running
    #[serde(default)]
    pub running_count: u32,

    /// Per-module runtime state observed from pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub modules: BTreeMap<String, ModuleRuntimeStatus>,
}

impl EdgeDeploymentStatus {
    /// Build a status from the observed per-module map
    pub fn from_modules(modules: BTreeMap<String, ModuleRuntimeStatus>) -> Self {
        let running_count = modules
            .values()
            .filter(|m| m.state == ModuleState::Running)
            .count() as u32;
        Self {
            module_count: modules.len() as u32,
            running_count,
            modules,
        }
    }
}

/// Runtime state of one module, derived from its pod
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRuntimeStatus {
    /// Coarse runtime state
    pub state: ModuleState,

    /// Restart count reported by the pod
    #[serde(default)]
    pub restart_count: u32,

    /// Exit code of the last termination, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Human-readable detail from the pod status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Coarse module runtime state
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ModuleState {
    /// Pod exists but is not running yet
    Pending,
    /// Pod reports running
    Running,
    /// Pod terminated with a failure
    Failed,
    /// Pod terminated successfully
    Succeeded,
    /// No usable signal from the pod
    #[default]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_module(image: &str) -> ModuleSpec {
        ModuleSpec {
            version: Some("1.0".to_string()),
            module_type: "docker".to_string(),
            desired_status: DesiredStatus::Running,
            restart_policy: RestartPolicy::Always,
            image_pull_policy: None,
            environment: BTreeMap::new(),
            settings: DockerSettings {
                image: image.to_string(),
                auth: None,
                create_options: CreateOptions::default(),
            },
        }
    }

    // =========================================================================
    // Deployment Document Parsing
    // =========================================================================

    /// Story: A minimal deployment document parses with defaults filled in
    ///
    /// Authors write the smallest document that names an image. Everything
    /// else (type, desired status, restart policy) defaults sensibly.
    #[test]
    fn story_minimal_document_parses_with_defaults() {
        let doc = serde_json::json!({
            "modules": {
                "telemetry": {
                    "settings": { "image": "registry.example.com/telemetry:1.2" }
                }
            }
        });

        let spec: EdgeDeploymentSpec = serde_json::from_value(doc).unwrap();
        let module = &spec.modules["telemetry"];
        assert_eq!(module.module_type, "docker");
        assert_eq!(module.desired_status, DesiredStatus::Running);
        assert_eq!(module.restart_policy, RestartPolicy::Always);
        assert_eq!(module.image_pull_policy, None);
        assert!(matches!(module.runtime(), ModuleRuntime::Docker(_)));
    }

    /// Story: Full docker create options round through the camelCase schema
    #[test]
    fn story_create_options_parse_camel_case() {
        let doc = serde_json::json!({
            "image": "cam:2",
            "createOptions": {
                "env": ["MODE=field"],
                "exposedPorts": { "8080/tcp": {} },
                "labels": { "vendor": "acme" },
                "hostConfig": {
                    "privileged": true,
                    "binds": ["/var/cam:/data:ro"],
                    "portBindings": { "8080/tcp": [ { "hostPort": "9090" } ] }
                }
            }
        });

        let settings: DockerSettings = serde_json::from_value(doc).unwrap();
        let opts = &settings.create_options;
        assert_eq!(opts.env, vec!["MODE=field".to_string()]);
        assert!(opts.exposed_ports.contains_key("8080/tcp"));
        let host = opts.host_config.as_ref().unwrap();
        assert_eq!(host.privileged, Some(true));
        assert_eq!(host.port_bindings["8080/tcp"][0].host_port, "9090");
    }

    // =========================================================================
    // Runtime Type Checking
    // =========================================================================

    /// Story: Unsupported module types surface as a tagged view, not a panic
    ///
    /// A document written for a different runtime still parses; the checked
    /// accessor is where "this operator cannot run that" becomes visible.
    #[test]
    fn story_unsupported_type_is_tagged_not_fatal() {
        let mut module = sample_module("fw:1");
        module.module_type = "wasm".to_string();

        match module.runtime() {
            ModuleRuntime::Unsupported(t) => assert_eq!(t, "wasm"),
            ModuleRuntime::Docker(_) => panic!("wasm must not be treated as docker"),
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Story: Sanitization collisions between module names are caught up front
    ///
    /// 'cam_a' and 'cam.a' both sanitize to 'cama'. Accepting the document
    /// would make two modules fight over one Deployment name.
    #[test]
    fn story_validation_rejects_sanitization_collisions() {
        let mut spec = EdgeDeploymentSpec::default();
        spec.modules.insert("cam_a".to_string(), sample_module("a:1"));
        spec.modules.insert("cam.a".to_string(), sample_module("a:2"));

        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("collide"));
    }

    /// Story: Module names that sanitize away entirely are rejected
    #[test]
    fn story_validation_rejects_unusable_names() {
        let mut spec = EdgeDeploymentSpec::default();
        spec.modules.insert("_$_".to_string(), sample_module("a:1"));

        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("empty object name"));
    }

    #[test]
    fn test_validation_accepts_distinct_modules() {
        let mut spec = EdgeDeploymentSpec::default();
        spec.modules
            .insert("telemetry".to_string(), sample_module("t:1"));
        spec.modules.insert("camera".to_string(), sample_module("c:1"));
        assert!(spec.validate().is_ok());
    }

    // =========================================================================
    // Pull Secret Naming
    // =========================================================================

    #[test]
    fn test_pull_secret_name_derived_from_identity() {
        let auth = RegistryAuth {
            username: Some("Fleet".to_string()),
            password: Some("secret".to_string()),
            server_address: Some("registry.example.com".to_string()),
            secret_name: None,
        };
        assert_eq!(
            auth.pull_secret_name().as_deref(),
            Some("fleet-registryexamplecom")
        );
    }

    #[test]
    fn test_pull_secret_name_explicit_override_wins() {
        let auth = RegistryAuth {
            username: Some("fleet".to_string()),
            server_address: Some("registry.example.com".to_string()),
            password: None,
            secret_name: Some("My-Pull-Secret".to_string()),
        };
        assert_eq!(auth.pull_secret_name().as_deref(), Some("my-pull-secret"));
    }

    #[test]
    fn test_pull_secret_name_absent_without_identity() {
        let auth = RegistryAuth::default();
        assert_eq!(auth.pull_secret_name(), None);
    }

    // =========================================================================
    // Status Summaries
    // =========================================================================

    #[test]
    fn test_status_counts_running_modules() {
        let mut modules = BTreeMap::new();
        modules.insert(
            "telemetry".to_string(),
            ModuleRuntimeStatus {
                state: ModuleState::Running,
                restart_count: 0,
                exit_code: None,
                reason: None,
            },
        );
        modules.insert(
            "camera".to_string(),
            ModuleRuntimeStatus {
                state: ModuleState::Failed,
                restart_count: 3,
                exit_code: Some(137),
                reason: Some("OOMKilled".to_string()),
            },
        );

        let status = EdgeDeploymentStatus::from_modules(modules);
        assert_eq!(status.module_count, 2);
        assert_eq!(status.running_count, 1);
    }
}
