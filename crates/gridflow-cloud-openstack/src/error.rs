//! OpenStack provider error types

use gridflow_core::ProviderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpenStackError {
    #[error("openstack CLI not found. Please install: pip install python-openstackclient")]
    CliNotFound,

    #[error("openstack command failed: {0}")]
    CommandFailed(String),

    #[error("unexpected openstack output: {0}")]
    UnexpectedOutput(String),

    #[error("unsupported resource kind: {0}")]
    Unsupported(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OpenStackError>;

impl From<OpenStackError> for ProviderError {
    fn from(err: OpenStackError) -> Self {
        match err {
            OpenStackError::CommandFailed(stderr) => classify(&stderr),
            other => ProviderError::Fatal(other.to_string()),
        }
    }
}

/// Maps CLI stderr onto the provider error taxonomy.
///
/// Quota and validation errors are fatal, missing resources are `NotFound`,
/// rate limits and unavailable endpoints are transient.
pub fn classify(stderr: &str) -> ProviderError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("quota") || lower.contains("exceeded") || lower.contains("(http 413)") {
        return ProviderError::Fatal(message);
    }

    let not_found = lower.contains("could not be found")
        || lower.contains("not found")
        || lower.contains("no such")
        || (lower.starts_with("no ") && lower.contains("with a name or id"))
        || lower.contains("(http 404)");
    if not_found {
        return ProviderError::NotFound(message);
    }

    let transient = [
        "timed out",
        "timeout",
        "(http 429)",
        "(http 500)",
        "(http 502)",
        "(http 503)",
        "(http 504)",
        "unable to establish connection",
        "connection reset",
        "connection refused",
        "temporarily unavailable",
        "service unavailable",
        "is in use",
        "(http 409)",
    ];
    if transient.iter().any(|pattern| lower.contains(pattern)) {
        return ProviderError::Transient(message);
    }

    ProviderError::Fatal(message)
}
