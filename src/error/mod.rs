//! Error types for registry client operations

pub mod handlers;

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// A CA bundle could not be read from disk
    #[error("Reading CA certificates from '{}': {source}", .path.display())]
    ReadCertificates {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A CA bundle was readable but held no usable certificate
    #[error("Adding CA certificates from '{}': {reason}", .path.display())]
    ParseCertificates { path: PathBuf, reason: String },

    /// The HTTP transport could not be assembled
    #[error("Building HTTP transport: {0}")]
    TransportBuild(#[source] reqwest::Error),

    /// A credential source held malformed data
    #[error("Credentials for {host}: {message}")]
    Credentials { host: String, message: String },

    /// Malformed or policy-violating reference string
    #[error("Invalid reference '{reference}': {reason}")]
    Reference { reference: String, reason: String },

    /// Network or TLS failure from the HTTP layer
    #[error("{context} ({url}): {source}")]
    Transport {
        context: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success or malformed registry response
    #[error("{operation} {target}: {message}")]
    Protocol {
        operation: String,
        target: String,
        status: Option<u16>,
        message: String,
    },

    /// Retry budget spent; carries only the final failure
    #[error("Retried {attempts} times: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<RegistryError>,
    },

    /// Retry loop stopped by its cancellation token
    #[error("Cancelled after {attempts} attempt(s)")]
    Cancelled {
        attempts: u32,
        #[source]
        last: Option<Box<RegistryError>>,
    },

    /// Operation label wrapped around a write/tag failure
    #[error("{operation}: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: Box<RegistryError>,
    },
}

impl RegistryError {
    pub fn reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        RegistryError::Reference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        RegistryError::Protocol {
            operation: operation.into(),
            target: target.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Wraps `self` with an operation label such as `Writing image`
    pub fn labelled(self, operation: &'static str) -> Self {
        RegistryError::Operation {
            operation,
            source: Box::new(self),
        }
    }

    /// HTTP status reported by the registry, looking through wrappers
    pub fn status(&self) -> Option<u16> {
        match self {
            RegistryError::Protocol { status, .. } => *status,
            RegistryError::RetryExhausted { source, .. }
            | RegistryError::Operation { source, .. } => source.status(),
            RegistryError::Cancelled { last, .. } => last.as_ref().and_then(|e| e.status()),
            _ => None,
        }
    }

    /// True for failures raised while loading certificates or building the transport
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RegistryError::ReadCertificates { .. }
                | RegistryError::ParseCertificates { .. }
                | RegistryError::TransportBuild(_)
                | RegistryError::Credentials { .. }
        )
    }
}
