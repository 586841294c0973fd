//! Error types for the Harvester provider

use thiserror::Error;

/// Result type alias using the provider Error
pub type Result<T> = std::result::Result<T, Error>;

/// Provider error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Resource not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid ID {0}")]
    InvalidId(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Validation(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Timeout after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("the public keys of keypair(s) {} are not present in cloud-init ssh_authorized_keys", .0.join(", "))]
    KeyPairsNotInUserData(Vec<String>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// True for 404 answers from the API server and for local lookups that found nothing.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound { kind, id } => {
                tonic::Status::not_found(format!("{} {} not found", kind, id))
            }
            Error::InvalidId(msg) | Error::InvalidConfig(msg) | Error::Validation(msg) => {
                tonic::Status::invalid_argument(msg)
            }
            Error::Timeout { what, seconds } => tonic::Status::deadline_exceeded(format!(
                "timed out after {}s waiting for {}",
                seconds, what
            )),
            _ => tonic::Status::internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(Error::not_found("Setting", "foo").is_not_found());
        assert!(!Error::InvalidId("a/b/c".into()).is_not_found());

        let api = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "virtualmachineimages.harvesterhci.io \"x\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(Error::from(api).is_not_found());
    }

    #[test]
    fn test_keypair_message_lists_offenders() {
        let err = Error::KeyPairsNotInUserData(vec!["default/a".into(), "default/b".into()]);
        let msg = err.to_string();
        assert!(msg.contains("default/a, default/b"));
        assert!(msg.contains("ssh_authorized_keys"));
    }

    #[test]
    fn test_status_mapping() {
        let status: tonic::Status = Error::InvalidId("a/b/c".into()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
