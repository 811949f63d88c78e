use diskmapper_core::error::{DiskMapperError, DiskMapperResult};
use diskmapper_provider::{InstanceMetadata, ProviderMetadata};

/// Stand-in for platforms without a metadata service.
///
/// Reports the host name only; `supported` is always false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMetadata {
    name: String,
}

impl FakeMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ProviderMetadata for FakeMetadata {
    type Error = DiskMapperError;

    fn self_instance(&self) -> DiskMapperResult<InstanceMetadata> {
        Ok(InstanceMetadata {
            name: self.name.clone(),
            provider_id: format!("qemu:///{}", self.name),
            ..Default::default()
        })
    }

    fn supported(&self) -> bool {
        false
    }
}
