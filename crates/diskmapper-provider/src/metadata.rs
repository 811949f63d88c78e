//! Cloud instance metadata contract.

use serde::{Deserialize, Serialize};
use std::error::Error;

/// Identity of the running instance as reported by the cloud provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub name: String,
    /// Provider-scoped unique identifier (e.g. `gce://project/zone/name`).
    pub provider_id: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub private_ips: Vec<String>,
}

/// Read access to the instance metadata service.
pub trait ProviderMetadata {
    type Error: Error + Send + Sync + 'static;

    /// Metadata describing the instance this process runs on.
    fn self_instance(&self) -> Result<InstanceMetadata, Self::Error>;

    /// False when the platform has no metadata service and results are placeholders.
    fn supported(&self) -> bool;
}
