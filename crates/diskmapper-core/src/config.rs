//! Configuration model for the disk-mapper service.

use crate::error::{DiskMapperError, DiskMapperResult};
use log::info;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/disk-mapper.toml";
pub const DEFAULT_MAPPED_NAME: &str = "state";
pub const DEFAULT_AZURE_IMDS_URL: &str =
    "http://169.254.169.254/metadata/instance?api-version=2021-02-01";
pub const DEFAULT_GCP_METADATA_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/";
const MAX_PCR_INDEX: u32 = 23;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskCfg {
    #[serde(default = "default_mapped_name")]
    pub mapped_name: String,
    #[serde(default)]
    pub cryptsetup_path: Option<String>,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

/// Device-mapper target names become `/dev/mapper/<name>`.
pub fn check_mapped_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("must not be empty".to_string());
    }
    if name == "." || name == ".." || name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(format!(
            "must not be '.', '..', or contain '/' or whitespace: {name:?}"
        ));
    }
    Ok(())
}

fn default_mapped_name() -> String {
    DEFAULT_MAPPED_NAME.to_string()
}

fn default_command_timeout_secs() -> u64 {
    120
}

impl Default for DiskCfg {
    fn default() -> Self {
        Self {
            mapped_name: default_mapped_name(),
            cryptsetup_path: None,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerCfg {
    /// Base URLs tried in order on every attempt.
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// PEM bundle to trust in addition to the system roots.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for BrokerCfg {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
            ca_cert_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryCfg {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// 0 keeps polling until the broker answers.
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_poll_interval_secs() -> u64 {
    20
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationCfg {
    /// TCTI string handed to tpm2-tools, e.g. `device:/dev/tpmrm0`.
    #[serde(default)]
    pub tpm_device: Option<String>,
    #[serde(default = "default_pcrs")]
    pub pcrs: Vec<u32>,
    #[serde(default = "default_tools_timeout_secs")]
    pub tools_timeout_secs: u64,
}

fn default_pcrs() -> Vec<u32> {
    (0..=MAX_PCR_INDEX).collect()
}

fn default_tools_timeout_secs() -> u64 {
    30
}

impl Default for AttestationCfg {
    fn default() -> Self {
        Self {
            tpm_device: None,
            pcrs: default_pcrs(),
            tools_timeout_secs: default_tools_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataCfg {
    #[serde(default = "default_azure_imds_url")]
    pub azure_imds_url: String,
    #[serde(default = "default_gcp_metadata_url")]
    pub gcp_metadata_url: String,
    #[serde(default = "default_metadata_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_azure_imds_url() -> String {
    DEFAULT_AZURE_IMDS_URL.to_string()
}

fn default_gcp_metadata_url() -> String {
    DEFAULT_GCP_METADATA_URL.to_string()
}

fn default_metadata_timeout_secs() -> u64 {
    5
}

impl Default for MetadataCfg {
    fn default() -> Self {
        Self {
            azure_imds_url: default_azure_imds_url(),
            gcp_metadata_url: default_gcp_metadata_url(),
            timeout_secs: default_metadata_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskMapperConfig {
    #[serde(default)]
    pub disk: DiskCfg,

    #[serde(default)]
    pub broker: BrokerCfg,

    #[serde(default)]
    pub retry: RetryCfg,

    #[serde(default)]
    pub attestation: AttestationCfg,

    #[serde(default)]
    pub metadata: MetadataCfg,

    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl DiskMapperConfig {
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Read and parse a TOML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> DiskMapperResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            DiskMapperError::InvalidConfig(format!("reading {}: {err}", path.display()))
        })?;
        let mut cfg = toml::from_str::<Self>(&contents)?;
        cfg.path = Some(path.to_path_buf());
        Ok(cfg)
    }

    /// Like [`load`](Self::load), but a missing file at the system default
    /// path yields built-in defaults. Explicit paths must exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> DiskMapperResult<Self> {
        let path = path.as_ref();
        if path == Self::default_path() && !path.exists() {
            info!(
                "no configuration at {}; using built-in defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Collect human-readable problems; empty means usable.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if let Err(issue) = check_mapped_name(&self.disk.mapped_name) {
            issues.push(format!("disk.mapped_name {issue}"));
        }
        if self.disk.command_timeout_secs == 0 {
            issues.push("disk.command_timeout_secs must be greater than 0".to_string());
        }

        for endpoint in &self.broker.endpoints {
            match Url::parse(endpoint) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                Ok(url) => issues.push(format!(
                    "broker.endpoints entry {endpoint:?} uses unsupported scheme {}",
                    url.scheme()
                )),
                Err(err) => issues.push(format!(
                    "broker.endpoints entry {endpoint:?} is not a valid URL: {err}"
                )),
            }
        }
        if self.broker.request_timeout_secs == 0 {
            issues.push("broker.request_timeout_secs must be greater than 0".to_string());
        }

        if self.retry.poll_interval_secs == 0 {
            issues.push("retry.poll_interval_secs must be greater than 0".to_string());
        }

        if self.attestation.pcrs.is_empty() {
            issues.push("attestation.pcrs must select at least one register".to_string());
        }
        for pcr in &self.attestation.pcrs {
            if *pcr > MAX_PCR_INDEX {
                issues.push(format!(
                    "attestation.pcrs index {pcr} is out of range (0-{MAX_PCR_INDEX})"
                ));
            }
        }
        if self.attestation.tools_timeout_secs == 0 {
            issues.push("attestation.tools_timeout_secs must be greater than 0".to_string());
        }

        if self.metadata.timeout_secs == 0 {
            issues.push("metadata.timeout_secs must be greater than 0".to_string());
        }

        issues
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.disk.command_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.request_timeout_secs)
    }

    pub fn tools_timeout(&self) -> Duration {
        Duration::from_secs(self.attestation.tools_timeout_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.retry.poll_interval_secs)
    }

    /// `None` when retries are unbounded.
    pub fn max_attempts(&self) -> Option<u32> {
        match self.retry.max_attempts {
            0 => None,
            n => Some(n),
        }
    }
}
