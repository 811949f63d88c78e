//! Error taxonomy for the disk-mapper crates.

use std::path::PathBuf;
use thiserror::Error;

pub type DiskMapperResult<T> = Result<T, DiskMapperError>;

#[derive(Debug, Error)]
pub enum DiskMapperError {
    #[error("{0}")]
    UnsupportedPlatform(String),

    #[error("unable to determine state disk path: {0}")]
    DiskPathResolution(String),

    #[error("initializing crypt device for disk {device:?}: {reason}")]
    CryptInit { device: PathBuf, reason: String },

    #[error("formatting disk: {0}")]
    Format(String),

    #[error("mapping disk as {target:?}: {reason}")]
    Map { target: String, reason: String },

    #[error("unmapping {target:?}: {reason}")]
    Unmap { target: String, reason: String },

    #[error("unable to close crypt device: {0}")]
    Close(String),

    #[error("key broker rejected the request: {0}")]
    KeyRejected(String),

    #[error("key broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("key exchange gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("attestation failed: {0}")]
    Attestation(String),

    #[error("instance metadata unavailable: {0}")]
    Metadata(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Command(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DiskMapperError {
    /// True for failures the key-exchange loop recovers from by retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DiskMapperError::KeyRejected(_)
                | DiskMapperError::BrokerUnavailable(_)
                | DiskMapperError::Attestation(_)
                | DiskMapperError::Metadata(_)
        )
    }
}
