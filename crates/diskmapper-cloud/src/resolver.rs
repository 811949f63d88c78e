//! Maps a platform identifier onto the state disk and its capabilities.

use crate::azure::AzureMetadata;
use crate::gcp::GcpMetadata;
use crate::qemu::FakeMetadata;
use crate::vtpm::{TpmSettings, VtpmQuoteIssuer};
use diskmapper_core::error::{DiskMapperError, DiskMapperResult};
use diskmapper_core::{BootTarget, DiskMapperConfig};
use diskmapper_provider::{InstanceMetadata, Platform, ProviderMetadata};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const FALLBACK_HOSTNAME: &str = "qemu";

/// Metadata client for whichever platform was resolved.
#[derive(Debug, Clone)]
pub enum PlatformMetadata {
    Azure(AzureMetadata),
    Gcp(GcpMetadata),
    Qemu(FakeMetadata),
}

impl ProviderMetadata for PlatformMetadata {
    type Error = DiskMapperError;

    fn self_instance(&self) -> DiskMapperResult<InstanceMetadata> {
        match self {
            PlatformMetadata::Azure(client) => client.self_instance(),
            PlatformMetadata::Gcp(client) => client.self_instance(),
            PlatformMetadata::Qemu(fake) => fake.self_instance(),
        }
    }

    fn supported(&self) -> bool {
        match self {
            PlatformMetadata::Azure(client) => client.supported(),
            PlatformMetadata::Gcp(client) => client.supported(),
            PlatformMetadata::Qemu(fake) => fake.supported(),
        }
    }
}

/// Endpoints and TPM access used when constructing capabilities.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub azure_imds_url: String,
    pub gcp_metadata_url: String,
    pub metadata_timeout: Duration,
    pub tpm: TpmSettings,
}

impl ResolverSettings {
    pub fn from_config(config: &DiskMapperConfig) -> Self {
        Self {
            azure_imds_url: config.metadata.azure_imds_url.clone(),
            gcp_metadata_url: config.metadata.gcp_metadata_url.clone(),
            metadata_timeout: config.metadata_timeout(),
            tpm: TpmSettings::from_config(config),
        }
    }
}

pub struct PlatformResolver {
    root: PathBuf,
    settings: ResolverSettings,
}

impl PlatformResolver {
    pub fn new(settings: ResolverSettings) -> Self {
        Self {
            root: PathBuf::from("/"),
            settings,
        }
    }

    /// Resolve device references below `root` instead of `/`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Parse `csp` and build the boot target for it.
    ///
    /// Fails with `UnsupportedPlatform` for unknown identifiers and with
    /// `DiskPathResolution` when the disk symlink or metadata client cannot
    /// be set up. Nothing on the disk is touched.
    pub fn resolve(
        &self,
        csp: &str,
    ) -> DiskMapperResult<BootTarget<VtpmQuoteIssuer, PlatformMetadata>> {
        let platform: Platform = csp
            .parse()
            .map_err(|err: diskmapper_provider::UnknownPlatform| {
                DiskMapperError::UnsupportedPlatform(err.to_string())
            })?;
        self.resolve_platform(platform)
    }

    pub fn resolve_platform(
        &self,
        platform: Platform,
    ) -> DiskMapperResult<BootTarget<VtpmQuoteIssuer, PlatformMetadata>> {
        let device_path = self.state_disk_path(platform)?;
        let metadata = self.metadata(platform)?;
        let issuer = VtpmQuoteIssuer::new(platform, self.settings.tpm.clone());
        info!(
            "resolved {platform} state disk to {}",
            device_path.display()
        );
        Ok(BootTarget {
            device_path,
            issuer,
            metadata,
        })
    }

    /// Real device path of the state disk on `platform`.
    pub fn state_disk_path(&self, platform: Platform) -> DiskMapperResult<PathBuf> {
        let reference = self.rooted(platform.state_disk_reference());
        if !platform.disk_reference_is_symlink() {
            return Ok(reference);
        }
        fs::canonicalize(&reference).map_err(|err| {
            DiskMapperError::DiskPathResolution(format!(
                "resolving {}: {err}",
                reference.display()
            ))
        })
    }

    fn metadata(&self, platform: Platform) -> DiskMapperResult<PlatformMetadata> {
        let timeout = self.settings.metadata_timeout;
        Ok(match platform {
            Platform::Azure => PlatformMetadata::Azure(AzureMetadata::new(
                self.settings.azure_imds_url.clone(),
                timeout,
            )?),
            Platform::Gcp => PlatformMetadata::Gcp(GcpMetadata::new(
                self.settings.gcp_metadata_url.clone(),
                timeout,
            )?),
            Platform::Qemu => {
                warn!("cloud services are not supported on QEMU");
                PlatformMetadata::Qemu(FakeMetadata::new(self.hostname()))
            }
        })
    }

    fn hostname(&self) -> String {
        fs::read_to_string(self.rooted("/etc/hostname"))
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string())
    }

    fn rooted(&self, absolute: &str) -> PathBuf {
        self.root.join(Path::new(absolute.trim_start_matches('/')))
    }
}
