//! GCE metadata server client.

use crate::http::{get_text, metadata_client};
use diskmapper_core::error::{DiskMapperError, DiskMapperResult};
use diskmapper_provider::{InstanceMetadata, ProviderMetadata};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;

const FLAVOR: (&str, &str) = ("Metadata-Flavor", "Google");

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceInstance {
    name: String,
    /// `projects/<number>/zones/<zone>`
    zone: String,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Deserialize)]
struct NetworkInterface {
    #[serde(default)]
    ip: String,
}

#[derive(Debug, Clone)]
pub struct GcpMetadata {
    client: Client,
    base_url: String,
}

impl GcpMetadata {
    /// `base_url` is the `computeMetadata/v1/` root.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> DiskMapperResult<Self> {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            client: metadata_client(timeout)?,
            base_url,
        })
    }
}

impl ProviderMetadata for GcpMetadata {
    type Error = DiskMapperError;

    fn self_instance(&self) -> DiskMapperResult<InstanceMetadata> {
        let instance = get_text(
            &self.client,
            &format!("{}instance/?recursive=true", self.base_url),
            FLAVOR,
        )?;
        let project = get_text(
            &self.client,
            &format!("{}project/project-id", self.base_url),
            FLAVOR,
        )?;
        parse_instance(&instance, project.trim())
    }

    fn supported(&self) -> bool {
        true
    }
}

fn parse_instance(body: &str, project: &str) -> DiskMapperResult<InstanceMetadata> {
    let instance: GceInstance = serde_json::from_str(body)
        .map_err(|err| DiskMapperError::Metadata(format!("parsing GCE metadata: {err}")))?;
    if project.is_empty() {
        return Err(DiskMapperError::Metadata("GCE metadata returned no project id".into()));
    }

    let zone = instance
        .zone
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let region = zone
        .rsplit_once('-')
        .map(|(region, _)| region.to_string())
        .unwrap_or_else(|| zone.clone());

    Ok(InstanceMetadata {
        provider_id: format!("gce://{project}/{zone}/{}", instance.name),
        name: instance.name,
        region,
        private_ips: instance
            .network_interfaces
            .into_iter()
            .map(|nic| nic.ip)
            .filter(|ip| !ip.is_empty())
            .collect(),
    })
}
