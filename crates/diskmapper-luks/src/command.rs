//! Execution wrapper for invoking `cryptsetup`.
//!
//! Shell integration stays here so the session logic is testable against a
//! fake binary with deterministic output.

use diskmapper_core::error::{DiskMapperError, DiskMapperResult};
use diskmapper_core::exec::{BoundedCommand, CommandOutput};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Duration;

const KEYSLOT: u32 = 0;

/// Fixed LUKS2 format parameters for the state disk.
///
/// Argon2id settings follow the low-memory recommendation of RFC 9106 §7 so
/// formatting stays usable on small VMs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Luks2Params {
    pub sector_size: u32,
    pub cipher: &'static str,
    pub key_size_bits: u32,
    pub pbkdf: &'static str,
    /// Argon2id time budget; cryptsetup benchmarks the iteration count against it.
    pub iter_time_ms: u32,
    pub memory_kib: u32,
    pub parallel: u32,
    pub keyslot: u32,
}

impl Default for Luks2Params {
    fn default() -> Self {
        Self {
            sector_size: 4096,
            cipher: "aes-xts-plain64",
            key_size_bits: 512,
            pbkdf: "argon2id",
            iter_time_ms: 2000,
            memory_kib: 64 * 1024,
            parallel: 4,
            keyslot: KEYSLOT,
        }
    }
}

impl Luks2Params {
    fn format_args(&self, device: &str, uuid: &str) -> Vec<String> {
        vec![
            "luksFormat".into(),
            "--type".into(),
            "luks2".into(),
            "--batch-mode".into(),
            "--sector-size".into(),
            self.sector_size.to_string(),
            "--cipher".into(),
            self.cipher.into(),
            "--key-size".into(),
            self.key_size_bits.to_string(),
            "--pbkdf".into(),
            self.pbkdf.into(),
            "--iter-time".into(),
            self.iter_time_ms.to_string(),
            "--pbkdf-memory".into(),
            self.memory_kib.to_string(),
            "--pbkdf-parallel".into(),
            self.parallel.to_string(),
            "--key-slot".into(),
            self.keyslot.to_string(),
            "--uuid".into(),
            uuid.into(),
            "--key-file".into(),
            "-".into(),
            device.into(),
        ]
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CryptsetupCommand {
    inner: BoundedCommand,
    params: Luks2Params,
}

impl CryptsetupCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            inner: BoundedCommand::new(binary, timeout),
            params: Luks2Params::default(),
        }
    }

    pub(crate) fn binary(&self) -> &Path {
        self.inner.binary()
    }

    /// Exit status of `isLuks`; any failure (including spawn errors) is `false`.
    pub(crate) fn is_luks2(&self, device: &Path) -> bool {
        let device = device.to_string_lossy();
        match self.run(&["isLuks", "--type", "luks2", &*device], None) {
            Ok(out) => {
                if !out.success() {
                    debug!("isLuks {device}: {}", out.diagnostic());
                }
                out.success()
            }
            Err(err) => {
                debug!("isLuks {device} could not run: {err}");
                false
            }
        }
    }

    pub(crate) fn luks_uuid(&self, device: &Path) -> DiskMapperResult<String> {
        let device = device.to_string_lossy();
        let out = self.run(&["luksUUID", &*device], None)?;
        if !out.success() {
            return Err(DiskMapperError::Command(format!(
                "cryptsetup could not read the LUKS header UUID of `{device}`: {} (exit code {})",
                or_no_output(&out.diagnostic()),
                out.status
            )));
        }
        let uuid = out.stdout_string().to_ascii_lowercase();
        if uuid.is_empty() {
            return Err(DiskMapperError::Command(format!(
                "cryptsetup reported an empty UUID for `{device}`"
            )));
        }
        Ok(uuid)
    }

    pub(crate) fn luks_format(
        &self,
        device: &Path,
        passphrase: &[u8],
        uuid: &str,
    ) -> DiskMapperResult<()> {
        if passphrase.is_empty() {
            return Err(DiskMapperError::Format(
                "refusing to format with an empty passphrase".into(),
            ));
        }

        let device = device.to_string_lossy();
        let p = &self.params;
        info!(
            "formatting {device} as LUKS2 ({}, {}-bit key, {} ms, {} KiB, {} lanes)",
            p.cipher, p.key_size_bits, p.iter_time_ms, p.memory_kib, p.parallel
        );

        let args = p.format_args(&device, uuid);
        let out = self
            .run(&args, Some(passphrase))
            .map_err(|err| {
                DiskMapperError::Format(format!("cryptsetup luksFormat on `{device}`: {err}"))
            })?;
        if !out.success() {
            let message = classify_format_failure(&device, &out.diagnostic());
            return Err(DiskMapperError::Format(format!(
                "{message} (exit code {})",
                out.status
            )));
        }

        // The enrolled keyslot must open with the same passphrase.
        let slot = p.keyslot.to_string();
        let out = self.run(
            &[
                "open",
                "--test-passphrase",
                "--type",
                "luks2",
                "--key-slot",
                slot.as_str(),
                "--key-file",
                "-",
                &*device,
            ],
            Some(passphrase),
        )
        .map_err(|err| {
            DiskMapperError::Format(format!("verifying keyslot {slot} on `{device}`: {err}"))
        })?;
        if !out.success() {
            return Err(DiskMapperError::Format(format!(
                "keyslot {slot} addition failed on `{device}`: {} (exit code {})",
                or_no_output(&out.diagnostic()),
                out.status
            )));
        }
        Ok(())
    }

    pub(crate) fn open_mapping(
        &self,
        device: &Path,
        name: &str,
        passphrase: &[u8],
    ) -> DiskMapperResult<()> {
        let device = device.to_string_lossy();
        let slot = self.params.keyslot.to_string();
        let out = self.run(
            &[
                "open",
                "--type",
                "luks2",
                "--key-slot",
                slot.as_str(),
                "--key-file",
                "-",
                &*device,
                name,
            ],
            Some(passphrase),
        )
        .map_err(|err| DiskMapperError::Map {
            target: name.to_string(),
            reason: format!("cryptsetup open `{device}`: {err}"),
        })?;
        if out.success() {
            return Ok(());
        }

        let message = classify_open_failure(name, &device, &out.diagnostic());
        Err(DiskMapperError::Map {
            target: name.to_string(),
            reason: format!("{message} (exit code {})", out.status),
        })
    }

    pub(crate) fn close_mapping(&self, name: &str) -> DiskMapperResult<()> {
        let out = self
            .run(&["close", name], None)
            .map_err(|err| DiskMapperError::Unmap {
                target: name.to_string(),
                reason: err.to_string(),
            })?;
        if out.success() {
            return Ok(());
        }

        let message = classify_close_failure(name, &out.diagnostic());
        Err(DiskMapperError::Unmap {
            target: name.to_string(),
            reason: format!("{message} (exit code {})", out.status),
        })
    }

    fn run<S: AsRef<str>>(&self, args: &[S], input: Option<&[u8]>) -> DiskMapperResult<CommandOutput> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        self.inner.run(&args, input)
    }
}

fn or_no_output(diagnostic: &str) -> String {
    let trimmed = diagnostic.trim();
    if trimmed.is_empty() {
        "no additional output".to_string()
    } else {
        trimmed.to_string()
    }
}

fn mentions_permission(lower: &str) -> bool {
    lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
}

fn mentions_missing(lower: &str) -> bool {
    lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("cannot open device")
}

fn classify_open_failure(name: &str, device: &str, diagnostic: &str) -> String {
    let diagnostic = or_no_output(diagnostic);
    let lower = diagnostic.to_ascii_lowercase();

    if lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("keyslot")
        || lower.contains("key slot")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
    {
        return format!(
            "cryptsetup rejected the key for `{device}` (keyslot {KEYSLOT}): {diagnostic}"
        );
    }

    if lower.contains("not a valid luks device") || lower.contains("is not a luks device") {
        return format!("`{device}` does not carry a valid LUKS2 header: {diagnostic}");
    }

    if mentions_permission(&lower) {
        return format!(
            "cryptsetup could not map `{device}` as `{name}`: {diagnostic}. This requires root privileges"
        );
    }

    if mentions_missing(&lower) {
        return format!("cryptsetup could not access `{device}`: {diagnostic}");
    }

    if lower.contains("already exists") || lower.contains("already in use") {
        return format!("mapping `{name}` is already active: {diagnostic}");
    }

    format!("cryptsetup failed to map `{device}` as `{name}`: {diagnostic}")
}

fn classify_format_failure(device: &str, diagnostic: &str) -> String {
    let diagnostic = or_no_output(diagnostic);
    let lower = diagnostic.to_ascii_lowercase();

    if mentions_permission(&lower) {
        return format!(
            "cryptsetup could not format `{device}`: {diagnostic}. This requires root privileges"
        );
    }

    if lower.contains("in use") || lower.contains("busy") {
        return format!("`{device}` is busy and cannot be formatted: {diagnostic}");
    }

    if mentions_missing(&lower) {
        return format!("cryptsetup could not access `{device}`: {diagnostic}");
    }

    if lower.contains("memory") {
        return format!(
            "argon2id could not allocate its memory budget while formatting `{device}`: {diagnostic}"
        );
    }

    format!("cryptsetup failed to format `{device}`: {diagnostic}")
}

fn classify_close_failure(name: &str, diagnostic: &str) -> String {
    let diagnostic = or_no_output(diagnostic);
    let lower = diagnostic.to_ascii_lowercase();

    if lower.contains("not active")
        || lower.contains("does not exist")
        || lower.contains("doesn't exist")
    {
        return format!("mapping `{name}` is not active: {diagnostic}");
    }

    if mentions_permission(&lower) {
        return format!(
            "cryptsetup could not close mapping `{name}`: {diagnostic}. This requires root privileges"
        );
    }

    if lower.contains("busy") || lower.contains("in use") {
        return format!("mapping `{name}` is still in use: {diagnostic}");
    }

    format!("cryptsetup failed to close mapping `{name}`: {diagnostic}")
}
