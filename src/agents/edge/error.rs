//! Convergence error taxonomy

use thiserror::Error;

use super::types::{Component, RecordType, ReportedError};

/// Errors that abort a convergence run
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Topology failed validation before any provider call
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// No authoritative zone exists for the domain (create it out of band)
    #[error("No authoritative zone found for {domain}")]
    ZoneNotFound { domain: String },

    /// Certificate authority rejected the request or validation timed out
    #[error("Certificate {certificate_id} failed validation: {reason}")]
    CertificateValidationFailed {
        certificate_id: String,
        reason: String,
    },

    /// Existing store policy contains statements not managed by this engine
    #[error("Policy conflict on {store}: {detail}")]
    PolicyConflict { store: String, detail: String },

    /// Name is held by a record set this engine did not create
    #[error("Alias conflict: {record_type} {name} is owned by an unrelated record set")]
    AliasConflict {
        name: String,
        record_type: RecordType,
    },

    /// Any other provider failure, tagged with the component that hit it
    #[error("Provisioning error in {component}: {message}")]
    Provisioning {
        component: Component,
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ConvergeError {
    pub fn provisioning(component: Component, err: anyhow::Error) -> Self {
        ConvergeError::Provisioning {
            component,
            message: format!("{:#}", err),
            source: err.into(),
        }
    }

    /// Short machine-readable name of the error class
    pub fn kind(&self) -> &'static str {
        match self {
            ConvergeError::InvalidTopology(_) => "InvalidTopology",
            ConvergeError::ZoneNotFound { .. } => "ZoneNotFound",
            ConvergeError::CertificateValidationFailed { .. } => "CertificateValidationFailed",
            ConvergeError::PolicyConflict { .. } => "PolicyConflict",
            ConvergeError::AliasConflict { .. } => "AliasConflict",
            ConvergeError::Provisioning { .. } => "ProvisioningError",
        }
    }

    /// Whether re-running without operator action can succeed
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ConvergeError::CertificateValidationFailed { .. } | ConvergeError::Provisioning { .. }
        )
    }

    pub fn to_reported(&self) -> ReportedError {
        ReportedError {
            kind: self.kind().to_string(),
            message: self.to_string(),
            retryable: self.retryable(),
        }
    }
}

/// Attach the owning component to provider failures
pub trait ComponentContext<T> {
    fn within(self, component: Component) -> Result<T, ConvergeError>;
}

impl<T> ComponentContext<T> for anyhow::Result<T> {
    fn within(self, component: Component) -> Result<T, ConvergeError> {
        self.map_err(|e| ConvergeError::provisioning(component, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_provisioning_error_keeps_component_and_chain() {
        let result: anyhow::Result<()> =
            Err(anyhow::anyhow!("throttled")).context("Failed to create distribution");
        let err = result.within(Component::Distribution).unwrap_err();

        assert_eq!(err.kind(), "ProvisioningError");
        assert!(err.retryable());
        let message = err.to_string();
        assert!(message.contains("distribution"));
        assert!(message.contains("throttled"));
    }

    #[test]
    fn test_fatal_errors_are_not_retryable() {
        let zone = ConvergeError::ZoneNotFound {
            domain: "example.test".to_string(),
        };
        let alias = ConvergeError::AliasConflict {
            name: "www.example.test".to_string(),
            record_type: RecordType::A,
        };

        assert!(!zone.retryable());
        assert!(!alias.retryable());
        assert_eq!(alias.to_reported().kind, "AliasConflict");
    }
}
