//! Error types for the service catalog controller
//!
//! Errors carry the kind and name of the resource involved so a failure in a
//! worker log can be traced back to the object without extra context.

use catalog_osb::BrokerError;
use thiserror::Error;

/// Main error type for catalog operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The addressed resource does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource key
        name: String,
    },

    /// An optimistic update lost against a concurrent write
    #[error("conflict updating {kind} {name}: resource version is stale")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Resource key
        name: String,
    },

    /// Create of a resource that already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Resource key
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// A broker call failed
    #[error("broker {operation} failed: {source}")]
    Broker {
        /// Operation being performed (e.g. "provision")
        operation: String,
        /// The broker error
        source: BrokerError,
    },

    /// A referenced resource is missing or unusable
    #[error("reference error: {message}")]
    Reference {
        /// Kind of the referenced resource
        kind: String,
        /// Name of the referenced resource
        name: String,
        /// Description of what is wrong
        message: String,
    },

    /// User parameters could not be interpreted
    #[error("invalid parameters: {message}")]
    Parameters {
        /// Description of what is wrong
        message: String,
    },

    /// An asynchronous operation has not completed yet
    #[error("operation in progress for {resource}: {message}")]
    OperationInProgress {
        /// Key of the resource being polled
        resource: String,
        /// Latest description from the broker
        message: String,
    },

    /// Catalog or spec content violates an invariant
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Key of the resource being validated
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "queue", "manager")
        context: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Wrap a broker error with the operation that produced it
    pub fn broker(operation: impl Into<String>, source: BrokerError) -> Self {
        Self::Broker {
            operation: operation.into(),
            source,
        }
    }

    /// Create a reference error
    pub fn reference(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Reference {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a parameters error
    pub fn parameters(msg: impl Into<String>) -> Self {
        Self::Parameters {
            message: msg.into(),
        }
    }

    /// Create an operation-in-progress error
    pub fn in_progress(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::OperationInProgress {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Map a kube error for a specific object, lifting 404/409 into typed variants
    pub fn from_kube(kind: &str, name: &str, source: kube::Error) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, name),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::already_exists(kind, name)
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(kind, name),
            _ => Self::Kube { source },
        }
    }

    /// True for a missing resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for a lost optimistic update
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if this error is transient
    ///
    /// Conflicts, transport failures and in-progress operations clear on their
    /// own. Parameter, validation and serialization errors need a spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::NotFound { .. } => true,
            Error::Conflict { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::Serialization { .. } => false,
            Error::Broker { source, .. } => source.as_http().is_none(),
            Error::Reference { .. } => true,
            Error::Parameters { .. } => false,
            Error::OperationInProgress { .. } => true,
            Error::Validation { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Label for metrics: "transient" or "permanent"
    pub fn error_type(&self) -> &'static str {
        if self.is_retryable() {
            "transient"
        } else {
            "permanent"
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: how failures surface to the worker loop
    // ==========================================================================

    /// Story: a broker that is down is retried, a broker that says no is not
    #[test]
    fn story_broker_rejections_are_permanent_but_outages_are_not() {
        let outage = Error::broker("provision", BrokerError::transport("connection refused"));
        assert!(outage.is_retryable());
        assert!(outage.to_string().contains("broker provision failed"));

        let rejection = Error::broker("provision", BrokerError::status(400));
        assert!(!rejection.is_retryable());
        assert_eq!(rejection.error_type(), "permanent");
    }

    /// Story: concurrent edits lose the optimistic race and retry with fresh state
    #[test]
    fn story_stale_writes_surface_as_conflicts() {
        let err = Error::from_kube("ServiceInstance", "shop/db", api_error(409, "Conflict"));
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("shop/db"));

        let err = Error::from_kube("ServiceClass", "svc-1", api_error(409, "AlreadyExists"));
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    /// Story: deleting something already gone is recognizable
    #[test]
    fn story_missing_objects_are_typed() {
        let err = Error::from_kube("ServicePlan", "plan-1", api_error(404, "NotFound"));
        assert!(err.is_not_found());

        let err = Error::from_kube("ServicePlan", "plan-1", api_error(403, "Forbidden"));
        assert!(matches!(err, Error::Kube { .. }));
        assert!(!err.is_retryable());
    }

    /// Story: bad user input waits for a spec edit
    #[test]
    fn story_parameter_errors_need_a_spec_change() {
        let err = Error::parameters("parameters must be a JSON object");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("JSON object"));

        let err = Error::validation("broker-a", "service svc-1 has no plans");
        assert!(!err.is_retryable());
    }

    #[test]
    fn in_progress_is_retryable() {
        let err = Error::in_progress("shop/db", "50% done");
        assert!(err.is_retryable());
        assert_eq!(err.error_type(), "transient");
    }

    #[test]
    fn serde_errors_convert() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn internal_error_includes_context() {
        let err = Error::internal("manager", "watch stream ended");
        assert!(err.to_string().contains("[manager]"));
        assert!(err.is_retryable());
    }
}
