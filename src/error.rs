//! Custom error types for cuo.

use thiserror::Error;

/// Errors that can occur during staged compose upgrades.
#[derive(Error, Debug)]
pub enum CuoError {
    #[error("Registry unavailable after {attempts} attempts: {reason}")]
    RegistryUnavailable { attempts: u32, reason: String },

    #[error("Tag does not match the version grammar: {0}")]
    TagParse(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Running image tag for {service} is not a version: {tag}")]
    VersionUnparsable { service: String, tag: String },

    #[error("Invalid downgrade: target {target} is lower than current {current}")]
    InvalidDowngrade { current: String, target: String },

    #[error("No upgrade path available: {0}")]
    NoPathAvailable(String),

    #[error("Descriptor write failed: {0}")]
    DescriptorWrite(String),

    #[error("Descriptor lock for {service} is held by another session: {path}")]
    LockHeld { service: String, path: String },

    #[error("[{0}] control plane error: {1}")]
    ControlPlane(String, String),
}

impl CuoError {
    /// Create a control plane error from any error type, tagged with the
    /// component that produced it.
    pub fn control_plane<E: std::fmt::Display>(component: &str, err: E) -> Self {
        Self::ControlPlane(component.to_string(), err.to_string())
    }

    /// Returns true if this error is transient and should be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RegistryUnavailable { .. } | Self::ControlPlane(_, _)
        )
    }
}
