//! State-disk bootstrap orchestration.

mod bootstrap;

#[cfg(test)]
mod tests;

use std::fmt;
use std::path::PathBuf;

pub use bootstrap::DiskBootstrap;

pub const MAPPER_DIR: &str = "/dev/mapper";

/// Position of the boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Init,
    Probing,
    ExistingDisk,
    NewDisk,
    Mapped,
    Failed,
}

impl BootState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BootState::Mapped | BootState::Failed)
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BootState::Init => "init",
            BootState::Probing => "probing",
            BootState::ExistingDisk => "existing-disk",
            BootState::NewDisk => "new-disk",
            BootState::Mapped => "mapped",
            BootState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Which branch the bootstrap took after probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFlow {
    /// Disk already carried a LUKS2 header; only mapped.
    Existing,
    /// Disk was blank; formatted, then mapped.
    New,
}

/// Everything the platform resolver hands to the bootstrap.
pub struct BootTarget<I, M> {
    pub device_path: PathBuf,
    pub issuer: I,
    pub metadata: M,
}

/// Outcome of a successful bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub flow: DiskFlow,
    pub disk_uuid: String,
    pub mapped_device: PathBuf,
    pub transitions: Vec<BootState>,
}

/// Path under which the kernel exposes an activated mapping.
pub fn mapped_device_path(target: &str) -> PathBuf {
    PathBuf::from(MAPPER_DIR).join(target)
}
