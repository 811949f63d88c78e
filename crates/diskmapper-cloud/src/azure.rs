//! Azure Instance Metadata Service client.

use crate::http::{get_text, metadata_client};
use diskmapper_core::error::{DiskMapperError, DiskMapperResult};
use diskmapper_provider::{InstanceMetadata, ProviderMetadata};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize)]
struct ImdsDocument {
    compute: Compute,
    #[serde(default)]
    network: Network,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Compute {
    name: String,
    #[serde(default)]
    location: String,
    resource_id: String,
}

#[derive(Default, Deserialize)]
struct Network {
    #[serde(default)]
    interface: Vec<Interface>,
}

#[derive(Deserialize)]
struct Interface {
    #[serde(default)]
    ipv4: Option<Ipv4>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ipv4 {
    #[serde(default)]
    ip_address: Vec<IpAddress>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpAddress {
    #[serde(default)]
    private_ip_address: String,
}

#[derive(Debug, Clone)]
pub struct AzureMetadata {
    client: Client,
    url: String,
}

impl AzureMetadata {
    pub fn new(url: impl Into<String>, timeout: Duration) -> DiskMapperResult<Self> {
        Ok(Self {
            client: metadata_client(timeout)?,
            url: url.into(),
        })
    }
}

impl ProviderMetadata for AzureMetadata {
    type Error = DiskMapperError;

    fn self_instance(&self) -> DiskMapperResult<InstanceMetadata> {
        let body = get_text(&self.client, &self.url, ("Metadata", "true"))?;
        parse_instance(&body)
    }

    fn supported(&self) -> bool {
        true
    }
}

fn parse_instance(body: &str) -> DiskMapperResult<InstanceMetadata> {
    let doc: ImdsDocument = serde_json::from_str(body)
        .map_err(|err| DiskMapperError::Metadata(format!("parsing Azure IMDS response: {err}")))?;

    let private_ips = doc
        .network
        .interface
        .into_iter()
        .filter_map(|iface| iface.ipv4)
        .flat_map(|ipv4| ipv4.ip_address)
        .map(|addr| addr.private_ip_address)
        .filter(|ip| !ip.is_empty())
        .collect();

    Ok(InstanceMetadata {
        name: doc.compute.name,
        provider_id: format!("azure://{}", doc.compute.resource_id),
        region: doc.compute.location,
        private_ips,
    })
}
