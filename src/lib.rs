use std::fmt;

use thiserror::Error;

/// Classification of everything that can stop a reconciliation pass.
///
/// Every stage reports through one of these kinds; the retry router in
/// [`retry`] turns the kind into a status condition and a requeue decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A missing spec field was defaulted and written back.
    SpecUpdate,
    /// A child resource did not exist and was created.
    ResourceCreate,
    /// A drifted child resource was corrected.
    ResourceUpdate,
    /// A dependency exists but is not ready yet.
    ResourceWaiting,
    /// An owned resource is in a permanently bad state.
    ResourceInvalid,
    /// User supplied configuration breaks a business rule.
    SpecInvalid,
    /// Anything unclassified.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SpecUpdate => "SpecUpdate",
            ErrorKind::ResourceCreate => "ResourceCreate",
            ErrorKind::ResourceUpdate => "ResourceUpdate",
            ErrorKind::ResourceWaiting => "ResourceWaiting",
            ErrorKind::ResourceInvalid => "ResourceInvalid",
            ErrorKind::SpecInvalid => "SpecInvalid",
            ErrorKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind}: {message}")]
    Reconcile { kind: ErrorKind, message: String },

    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("HTTP Error: {0}")]
    HTTPError(#[source] http::Error),

    #[error("Reqwest Error: {0}")]
    ReqwestError(#[source] reqwest::Error),

    #[error("URL Parse Error: {0}")]
    URLParseError(#[source] url::ParseError),

    #[error("Service Request Error: {0}")]
    ServiceRequestError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::Reconcile { kind, .. } => kind.as_str().to_lowercase(),
            _ => format!("{self:?}").to_lowercase(),
        }
    }

    /// Kind used by the retry router. Anything that is not a classified
    /// reconcile error is a bug or an infrastructure failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Reconcile { kind, .. } => *kind,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn reconcile(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Reconcile {
            kind,
            message: message.into(),
        }
    }

    pub fn spec_update(message: impl Into<String>) -> Self {
        Self::reconcile(ErrorKind::SpecUpdate, message)
    }

    pub fn resource_create(message: impl Into<String>) -> Self {
        Self::reconcile(ErrorKind::ResourceCreate, message)
    }

    pub fn resource_update(message: impl Into<String>) -> Self {
        Self::reconcile(ErrorKind::ResourceUpdate, message)
    }

    pub fn resource_waiting(message: impl Into<String>) -> Self {
        Self::reconcile(ErrorKind::ResourceWaiting, message)
    }

    pub fn resource_invalid(message: impl Into<String>) -> Self {
        Self::reconcile(ErrorKind::ResourceInvalid, message)
    }

    pub fn spec_invalid(message: impl Into<String>) -> Self {
        Self::reconcile(ErrorKind::SpecInvalid, message)
    }

    /// Message suitable for a status condition.
    pub fn message(&self) -> String {
        match self {
            Error::Reconcile { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Expose all SonarQube cluster components used by main
pub mod sonarqube;
pub use crate::sonarqube::crd::*;

/// Expose all SonarQube server components used by main
pub mod server;
pub use crate::server::crd::*;

/// Generic reconciliation pass shared by both kinds
pub mod engine;
pub use engine::{Context, Outcome};

/// Object store abstraction over the Kubernetes API
pub mod store;
pub use store::{KubeStore, Store};

/// Child resource synthesis and drift correction
pub mod drift;
pub mod resources;

/// Conditions and status writes
pub mod status;
pub use status::Phase;

/// Error routing
pub mod retry;

pub mod membership;
pub mod properties;
pub mod revision;

/// Health checks against running servers
pub mod api_client;

/// Environment configuration
pub mod config;
pub use config::Config;

/// Log and trace integrations
pub mod telemetry;

/// Run all controllers
pub mod run;
pub use run::*;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub mod fixtures;
