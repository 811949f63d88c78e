//! Contract for a single block device managed as a LUKS2 volume.
//!
//! An implementor is the open session: obtaining one acquires the device,
//! `close` (or drop) releases it. The bootstrap workflow owns exactly one
//! session per state disk for the whole boot sequence.

use std::error::Error;

/// Operations the bootstrap workflow needs from an opened crypt device.
pub trait CryptDevice {
    type Error: Error + Send + Sync + 'static;

    /// Path of the underlying block device.
    fn device_path(&self) -> &std::path::Path;

    /// Return true only when a valid LUKS2 header can be loaded.
    ///
    /// Any failure to read or parse the header is reported as `false`, which
    /// conflates a missing header with a corrupt one.
    fn is_luks(&self) -> bool;

    /// Header UUID, lowercase.
    fn disk_uuid(&self) -> Result<String, Self::Error>;

    /// Initialise the device as LUKS2 and enroll `passphrase` in keyslot 0.
    ///
    /// `uuid` is written into the header so the volume's identity is known
    /// before the format happens. Must only be called when `is_luks` is false.
    fn format(&mut self, passphrase: &[u8], uuid: &str) -> Result<(), Self::Error>;

    /// Activate the volume as `/dev/mapper/<target>` using keyslot 0.
    fn map(&mut self, target: &str, passphrase: &[u8]) -> Result<(), Self::Error>;

    /// Deactivate `target`. Fails when the mapping is not active.
    fn unmap(&mut self, target: &str) -> Result<(), Self::Error>;

    /// Release the device. A second call reports failure.
    fn close(&mut self) -> Result<(), Self::Error>;
}
