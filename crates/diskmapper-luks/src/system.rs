//! `CryptDevice` implementation over the host `cryptsetup` binary.

use crate::command::CryptsetupCommand;
use diskmapper_core::error::{DiskMapperError, DiskMapperResult};
use diskmapper_core::exec::locate_binary;
use diskmapper_core::DiskMapperConfig;
use diskmapper_provider::CryptDevice;
use log::{debug, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];

/// Factory for [`CryptSession`]s sharing one resolved `cryptsetup` binary.
#[derive(Debug, Clone)]
pub struct CryptsetupDevice {
    cryptsetup: CryptsetupCommand,
}

impl CryptsetupDevice {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            cryptsetup: CryptsetupCommand::new(binary.into(), timeout),
        }
    }

    /// Resolve `cryptsetup` from `[disk] cryptsetup_path`, well-known paths, then `PATH`.
    pub fn from_config(config: &DiskMapperConfig) -> DiskMapperResult<Self> {
        let binary = locate_binary(
            config.disk.cryptsetup_path.as_deref(),
            DEFAULT_CRYPTSETUP_PATHS,
            "cryptsetup",
        )?;
        Ok(Self::new(binary, config.command_timeout()))
    }

    pub fn binary(&self) -> &Path {
        self.cryptsetup.binary()
    }

    /// Acquire the device at `path`. No session exists unless this succeeds.
    pub fn open(&self, path: &Path) -> DiskMapperResult<CryptSession> {
        let handle = File::open(path).map_err(|err| DiskMapperError::CryptInit {
            device: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        debug!("opened crypt device {}", path.display());
        Ok(CryptSession {
            device: path.to_path_buf(),
            handle: Some(handle),
            cryptsetup: self.cryptsetup.clone(),
        })
    }

    /// Deactivate `target` without opening any device.
    pub fn unmap(&self, target: &str) -> DiskMapperResult<()> {
        self.cryptsetup.close_mapping(target)
    }
}

/// Exclusive handle on one state disk between `open` and `close`.
#[derive(Debug)]
pub struct CryptSession {
    device: PathBuf,
    handle: Option<File>,
    cryptsetup: CryptsetupCommand,
}

impl CryptSession {
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn ensure_open(&self) -> DiskMapperResult<()> {
        if self.handle.is_none() {
            return Err(DiskMapperError::Close(format!(
                "crypt device {} used after close",
                self.device.display()
            )));
        }
        Ok(())
    }
}

impl CryptDevice for CryptSession {
    type Error = DiskMapperError;

    fn device_path(&self) -> &Path {
        &self.device
    }

    fn is_luks(&self) -> bool {
        self.handle.is_some() && self.cryptsetup.is_luks2(&self.device)
    }

    fn disk_uuid(&self) -> DiskMapperResult<String> {
        self.ensure_open()?;
        self.cryptsetup.luks_uuid(&self.device)
    }

    fn format(&mut self, passphrase: &[u8], uuid: &str) -> DiskMapperResult<()> {
        self.ensure_open().map_err(|err| DiskMapperError::Format(err.to_string()))?;
        self.cryptsetup.luks_format(&self.device, passphrase, uuid)
    }

    fn map(&mut self, target: &str, passphrase: &[u8]) -> DiskMapperResult<()> {
        self.ensure_open().map_err(|err| DiskMapperError::Map {
            target: target.to_string(),
            reason: err.to_string(),
        })?;
        self.cryptsetup.open_mapping(&self.device, target, passphrase)
    }

    fn unmap(&mut self, target: &str) -> DiskMapperResult<()> {
        self.cryptsetup.close_mapping(target)
    }

    fn close(&mut self) -> DiskMapperResult<()> {
        match self.handle.take() {
            Some(handle) => {
                drop(handle);
                debug!("closed crypt device {}", self.device.display());
                Ok(())
            }
            None => Err(DiskMapperError::Close(format!(
                "crypt device {} holds no resources",
                self.device.display()
            ))),
        }
    }
}

impl Drop for CryptSession {
    fn drop(&mut self) {
        if self.handle.take().is_some() {
            warn!(
                "crypt device {} released without an explicit close",
                self.device.display()
            );
        }
    }
}
