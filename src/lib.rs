//! Gantry - edge-device workload orchestrator for Kubernetes
//!
//! Gantry keeps the workload state of a single edge device, described by an
//! EdgeDeployment custom resource, converged with the live state of the
//! cluster it runs in. Each module in the deployment document becomes a
//! Deployment (module container plus a fixed proxy sidecar), an optional
//! Service, and a ServiceAccount carrying the module identity.
//!
//! # Architecture
//!
//! Two independent watch loops drive the operator:
//! - The document watch feeds the reconciliation engine, which diffs
//!   desired objects against the live set and converges them.
//! - The pod watch feeds the status tracker, which reports per-module
//!   runtime state back onto the EdgeDeployment status subresource.
//!
//! # Modules
//!
//! - [`crd`] - EdgeDeployment Custom Resource Definition and module model
//! - [`names`] - sanitizers mapping foreign identifiers into cluster naming grammars
//! - [`identity`] - module identity resolution at the provisioning boundary
//! - [`model`] - translation from module specs to native cluster objects
//! - [`fingerprint`] - configuration fingerprints driving update decisions
//! - [`plan`] - pure diff/partition of desired against live objects
//! - [`reconcile`] - the serialized reconciliation engine
//! - [`watch`] - resilient list+watch loops with restart semantics
//! - [`status`] - pod-derived module runtime state reporting
//! - [`backup`] - last-known-good deployment persistence
//! - [`client`] - cluster client seam used by the engine
//! - [`config`] - operator configuration resolved once at startup
//! - [`error`] - error types for the operator

#![deny(missing_docs)]

pub mod backup;
pub mod client;
pub mod config;
pub mod crd;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod model;
pub mod names;
pub mod plan;
pub mod reconcile;
pub mod status;
pub mod watch;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-Known Keys
// =============================================================================
// Labels and annotations gantry stamps onto every object it owns. The
// device+hub pair doubles as the ownership selector: nothing outside that
// selector is ever listed, diffed, or deleted.

/// Label carrying the sanitized module name on every owned object
pub const MODULE_LABEL: &str = "gantry.dev/module";

/// Label carrying the sanitized device id on every owned object
pub const DEVICE_LABEL: &str = "gantry.dev/device";

/// Label carrying the sanitized hub name on every owned object
pub const HUB_LABEL: &str = "gantry.dev/hub";

/// Annotation holding the configuration fingerprint of an owned object
pub const FINGERPRINT_ANNOTATION: &str = "gantry.dev/config-fingerprint";

/// Annotation holding the unsanitized module id on identity bindings
pub const MODULE_ID_ANNOTATION: &str = "gantry.dev/module-id";

/// Annotation holding the identity generation id on identity bindings
pub const GENERATION_ID_ANNOTATION: &str = "gantry.dev/generation-id";

/// Name of the proxy sidecar container injected into every workload
pub const PROXY_CONTAINER_NAME: &str = "gantry-proxy";

/// Field manager name used for server-side apply of the CRD
pub const FIELD_MANAGER: &str = "gantry-operator";
