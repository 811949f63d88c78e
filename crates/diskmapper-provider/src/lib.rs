#![forbid(unsafe_code)]

//! Capability contracts shared across disk-mapper.
//!
//! Workflows in `diskmapper-core` are written against these traits so the
//! crypt backend, the cloud metadata clients, and the attestation issuers can
//! be swapped (or faked in tests) without touching orchestration.

pub mod attest;
pub mod crypt;
pub mod metadata;

use std::fmt;
use std::str::FromStr;

pub use attest::{AttestationQuote, PcrValue, QuoteIssuer};
pub use crypt::CryptDevice;
pub use metadata::{InstanceMetadata, ProviderMetadata};

const AZURE_STATE_DISK_PATH: &str = "/dev/disk/azure/scsi1/lun0";
const GCP_STATE_DISK_PATH: &str = "/dev/disk/by-id/google-state-disk";
const QEMU_STATE_DISK_PATH: &str = "/dev/vda";

/// Cloud platform the node image is booted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Azure,
    Gcp,
    Qemu,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Azure, Platform::Gcp, Platform::Qemu];

    /// Lowercase identifier used on the command line and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Azure => "azure",
            Platform::Gcp => "gcp",
            Platform::Qemu => "qemu",
        }
    }

    /// Raw device reference for the state disk.
    ///
    /// On Azure and GCP this is a udev-managed symlink that must be resolved
    /// before use; on QEMU it is the block device itself.
    pub fn state_disk_reference(self) -> &'static str {
        match self {
            Platform::Azure => AZURE_STATE_DISK_PATH,
            Platform::Gcp => GCP_STATE_DISK_PATH,
            Platform::Qemu => QEMU_STATE_DISK_PATH,
        }
    }

    /// Whether `state_disk_reference` is a symlink that needs resolving.
    pub fn disk_reference_is_symlink(self) -> bool {
        !matches!(self, Platform::Qemu)
    }

    /// Whether the platform exposes a cloud metadata service.
    pub fn has_metadata_service(self) -> bool {
        !matches!(self, Platform::Qemu)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a platform identifier is not one of `azure`, `gcp`, `qemu`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPlatform(pub String);

impl fmt::Display for UnknownPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "csp {:?} is not supported (expected one of: azure, gcp, qemu)",
            self.0
        )
    }
}

impl std::error::Error for UnknownPlatform {}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "azure" => Ok(Platform::Azure),
            "gcp" => Ok(Platform::Gcp),
            "qemu" => Ok(Platform::Qemu),
            _ => Err(UnknownPlatform(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("Azure".parse::<Platform>().unwrap(), Platform::Azure);
        assert_eq!("GCP".parse::<Platform>().unwrap(), Platform::Gcp);
        assert_eq!("qEmU".parse::<Platform>().unwrap(), Platform::Qemu);
    }

    #[test]
    fn surrounding_whitespace_is_not_accepted() {
        for input in [" qemu ", "azure\n", "\tgcp"] {
            assert!(input.parse::<Platform>().is_err(), "{input:?}");
        }
    }

    #[test]
    fn parse_rejects_unknown_identifiers() {
        for input in ["", "aws", "azure-sev", "q e m u"] {
            let err = input.parse::<Platform>().unwrap_err();
            assert_eq!(err.0, input);
        }
    }

    #[test]
    fn only_qemu_uses_a_static_device() {
        for platform in Platform::ALL {
            assert!(!platform.state_disk_reference().is_empty());
            assert_eq!(
                platform.disk_reference_is_symlink(),
                platform != Platform::Qemu
            );
        }
        assert_eq!(Platform::Qemu.state_disk_reference(), "/dev/vda");
    }
}
