//! Error types for the local invocation emulator.

use std::path::PathBuf;

/// Errors surfaced by the emulator core.
///
/// Everything raised while initializing or invoking a function ends up
/// here; the router turns it into a structured failure response.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid runtime name {runtime}")]
    UnsupportedRuntime { runtime: String },

    #[error("invalid mount configuration for {subject}: {reason}")]
    MountConfig { subject: String, reason: String },

    #[error("failed to stage code from {}: {source:#}", path.display())]
    Staging {
        path: PathBuf,
        source: anyhow::Error,
    },

    #[error("container engine {op} failed: {source:#}")]
    ContainerEngine {
        op: &'static str,
        source: anyhow::Error,
    },

    #[error("{0} not support")]
    ProtocolRejection(String),

    #[error("function {function} did not respond within {timeout_secs}s")]
    InvokeTimeout { function: String, timeout_secs: u64 },

    #[error("function {0} has been terminated")]
    LifecycleTerminated(String),

    #[error("function {0} not found")]
    FunctionNotFound(String),
}

impl Error {
    pub fn mount(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MountConfig {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    pub fn engine(op: &'static str, source: anyhow::Error) -> Self {
        Self::ContainerEngine { op, source }
    }

    /// Machine-readable code carried in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedRuntime { .. } => "UNSUPPORTED_RUNTIME",
            Self::MountConfig { .. } => "MOUNT_CONFIG_ERROR",
            Self::Staging { .. } => "STAGING_ERROR",
            Self::ContainerEngine { .. } => "CONTAINER_ENGINE_ERROR",
            Self::ProtocolRejection(_) => "PROTOCOL_NOT_SUPPORTED",
            Self::InvokeTimeout { .. } => "INVOKE_TIMEOUT",
            Self::LifecycleTerminated(_) => "FUNCTION_TERMINATED",
            Self::FunctionNotFound(_) => "FUNCTION_NOT_FOUND",
        }
    }

    /// Errors that abort a lifecycle's `init()`. The lifecycle stays
    /// uninitialized and the next request starts over.
    pub fn is_init_failure(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedRuntime { .. } |
                Self::MountConfig { .. } |
                Self::Staging { .. } |
                Self::ContainerEngine { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let err = Error::UnsupportedRuntime {
            runtime: "cobol85".to_string(),
        };
        assert_eq!(err.to_string(), "invalid runtime name cobol85");

        let err = Error::mount("bad.host:/x", "address does not match host:/path");
        assert!(err.to_string().contains("bad.host:/x"));
        assert_eq!(err.code(), "MOUNT_CONFIG_ERROR");
    }

    #[test]
    fn test_init_failure_classification() {
        assert!(Error::engine("pull", anyhow::anyhow!("boom")).is_init_failure());
        assert!(!Error::ProtocolRejection("websocket".into()).is_init_failure());
        assert!(
            !Error::InvokeTimeout {
                function: "svc/fn".into(),
                timeout_secs: 3
            }
            .is_init_failure()
        );
    }

    #[test]
    fn test_protocol_rejection_message() {
        let err = Error::ProtocolRejection("websocket".into());
        assert_eq!(err.to_string(), "websocket not support");
    }
}
