//! Error taxonomy for the run engine.
//!
//! Validation errors are fatal and surface to the caller. Backend failures are
//! wrapped into a single [`FrameworkError`] carrying the raw server message.
//! Observation failures never leave the monitor.

use thiserror::Error;

use crate::lifecycle::RunState;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("spec not found for runtime={runtime} kind={kind} entity={entity}")]
    SpecNotFound {
        runtime: String,
        kind: String,
        entity: String,
    },

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("invalid transition from {current} to {target} (available: {available:?})")]
    InvalidTransition {
        current: RunState,
        target: RunState,
        available: Vec<RunState>,
    },

    #[error(transparent)]
    Framework(#[from] FrameworkError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Validation problems that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::SpecNotFound { .. }
                | Error::InvalidSpec(_)
                | Error::ConfigError(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(..) | Error::Framework(FrameworkError::NotFound { .. })
        )
    }
}

impl From<crate::fsm::InvalidTransitionError<RunState>> for Error {
    fn from(err: crate::fsm::InvalidTransitionError<RunState>) -> Self {
        Error::InvalidTransition {
            current: err.current,
            target: err.target,
            available: err.available,
        }
    }
}

/// Failure talking to the backing cluster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameworkError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("k8s error ({code}): {message}")]
    Backend { code: u16, message: String },

    #[error("k8s error: {0}")]
    Transport(String),
}

impl FrameworkError {
    /// Map a client error for the named object, keeping the server message.
    pub fn from_kube(err: &kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 404 => FrameworkError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(response) => FrameworkError::Backend {
                code: response.code,
                message: response.message.clone(),
            },
            other => FrameworkError::Transport(other.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FrameworkError::NotFound { .. })
    }
}

/// True when the client error is an API response with the given status code.
pub fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: message.into(),
            reason: "Test".into(),
            code,
        })
    }

    #[test]
    fn not_found_is_typed() {
        let err = FrameworkError::from_kube(&api_error(404, "jobs \"x\" not found"), "Job", "x");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Job x not found");
    }

    #[test]
    fn backend_error_keeps_server_message() {
        let err = FrameworkError::from_kube(&api_error(422, "spec.template invalid"), "Job", "x");
        assert_eq!(
            err,
            FrameworkError::Backend {
                code: 422,
                message: "spec.template invalid".into()
            }
        );
        assert!(err.to_string().contains("spec.template invalid"));
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::InvalidArgument("x".into()).is_fatal());
        assert!(!Error::Framework(FrameworkError::Transport("x".into())).is_fatal());
        assert!(Error::NotFound("run", "r1".into()).is_not_found());
    }

    #[test]
    fn status_helper_matches_code() {
        assert!(is_status(&api_error(409, "exists"), 409));
        assert!(!is_status(&api_error(500, "boom"), 409));
    }
}
