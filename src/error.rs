//! Error types for the gantry operator

use thiserror::Error;

/// Main error type for gantry operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for deployment specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error at startup
    #[error("config error: {0}")]
    Config(String),

    /// Module identity resolution error
    #[error("identity error: {0}")]
    Identity(String),

    /// Watch stream establishment or consumption error
    #[error("watch error: {0}")]
    Watch(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an identity error with the given message
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }

    /// Create a watch error with the given message
    pub fn watch(msg: impl Into<String>) -> Self {
        Self::Watch(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation in Reconciliation
    // ==========================================================================
    //
    // These tests demonstrate how errors flow through the system during a
    // reconcile cycle. Each error type represents a different failure category
    // with specific handling requirements.

    /// Story: Validation catches malformed deployment specs before any cluster call
    ///
    /// When a deployment document names two modules that sanitize to the same
    /// object name, or carries an empty device id, the validation layer rejects
    /// it with a clear message instead of racing the cluster into a bad state.
    #[test]
    fn story_validation_rejects_malformed_deployment() {
        let err = Error::validation("module names 'cam_a' and 'cam.a' collide after sanitization");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("collide"));

        let err = Error::validation("device id must not be empty");
        assert!(err.to_string().contains("must not be empty"));

        match Error::validation("any message") {
            Error::Validation(msg) => assert_eq!(msg, "any message"),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: Configuration errors stop the process before any watch opens
    ///
    /// Missing device/hub identity is unrecoverable. The operator exits with
    /// a config error rather than reconciling objects it cannot label.
    #[test]
    fn story_config_errors_are_fatal_at_startup() {
        let err = Error::config("GANTRY_DEVICE_ID is not set");
        assert!(err.to_string().contains("config error"));
        assert!(err.to_string().contains("GANTRY_DEVICE_ID"));

        match Error::config("missing hub") {
            Error::Config(msg) => assert_eq!(msg, "missing hub"),
            _ => panic!("Expected Config variant"),
        }
    }

    /// Story: Identity failures abandon the cycle, not the process
    ///
    /// The identity provider lives outside this process. When it fails, the
    /// engine excludes the affected modules from the current cycle and the
    /// next event retries from a fresh listing.
    #[test]
    fn story_identity_errors_name_the_module() {
        let err = Error::identity("no identity returned for module 'telemetry'");
        assert!(err.to_string().contains("identity error"));
        assert!(err.to_string().contains("telemetry"));
    }

    /// Story: Watch errors distinguish fatal startup from recoverable restarts
    ///
    /// Initial establishment failure is fatal. Later stream closures restart
    /// the loop under backoff; the message carries enough context to tell the
    /// two apart in logs.
    #[test]
    fn story_watch_errors_carry_context() {
        let err = Error::watch("initial list of edgedeployments failed: connection refused");
        assert!(err.to_string().contains("watch error"));
        assert!(err.to_string().contains("initial list"));

        match Error::watch("stream closed") {
            Error::Watch(msg) => assert_eq!(msg, "stream closed"),
            _ => panic!("Expected Watch variant"),
        }
    }

    /// Story: Errors are categorized for proper handling in the engine
    ///
    /// Different error types map to the handling strategies of the reconcile
    /// loop (abandon cycle, crash, log and continue).
    #[test]
    fn story_error_categorization_for_engine_handling() {
        fn categorize(err: &Error) -> &'static str {
            match err {
                Error::Validation(_) => "reject_event",
                Error::Config(_) => "fatal",
                Error::Identity(_) => "exclude_module",
                Error::Watch(_) => "restart_or_fatal",
                Error::Kube(_) => "abandon_cycle",
                Error::Serialization(_) => "abandon_cycle",
                _ => "abandon_cycle",
            }
        }

        assert_eq!(categorize(&Error::validation("bad spec")), "reject_event");
        assert_eq!(categorize(&Error::config("no device id")), "fatal");
        assert_eq!(
            categorize(&Error::identity("provider down")),
            "exclude_module"
        );
        assert_eq!(categorize(&Error::watch("closed")), "restart_or_fatal");
    }
}
