use super::*;
use crate::error::{DiskMapperError, DiskMapperResult};
use crate::keyservice::{CancelToken, KeyBroker, KeyExchangeClient, KeyRequest, RetryPolicy, Sleeper};
use crate::passphrase::Passphrase;
use diskmapper_provider::{
    AttestationQuote, CryptDevice, InstanceMetadata, Platform, ProviderMetadata, QuoteIssuer,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// LUKS state of a simulated block device, shared across "reboots".
#[derive(Default)]
struct DiskState {
    header: Option<(String, Vec<u8>)>,
    active: HashSet<String>,
    open_sessions: usize,
    format_calls: usize,
    map_calls: usize,
    fail_format: bool,
}

#[derive(Clone, Default)]
struct SimulatedDisk {
    state: Arc<Mutex<DiskState>>,
}

impl SimulatedDisk {
    fn open(&self, path: &Path) -> DiskMapperResult<SimulatedSession> {
        self.state.lock().unwrap().open_sessions += 1;
        Ok(SimulatedSession {
            path: path.to_path_buf(),
            disk: self.clone(),
            open: true,
        })
    }

    fn header_uuid(&self) -> Option<String> {
        self.state.lock().unwrap().header.as_ref().map(|(uuid, _)| uuid.clone())
    }
}

struct SimulatedSession {
    path: PathBuf,
    disk: SimulatedDisk,
    open: bool,
}

impl CryptDevice for SimulatedSession {
    type Error = DiskMapperError;

    fn device_path(&self) -> &Path {
        &self.path
    }

    fn is_luks(&self) -> bool {
        self.disk.state.lock().unwrap().header.is_some()
    }

    fn disk_uuid(&self) -> DiskMapperResult<String> {
        self.disk
            .header_uuid()
            .ok_or_else(|| DiskMapperError::Command("no LUKS header".into()))
    }

    fn format(&mut self, passphrase: &[u8], uuid: &str) -> DiskMapperResult<()> {
        let mut state = self.disk.state.lock().unwrap();
        assert!(state.header.is_none(), "format called on a formatted disk");
        state.format_calls += 1;
        if state.fail_format {
            return Err(DiskMapperError::Format("simulated I/O error".into()));
        }
        state.header = Some((uuid.to_string(), passphrase.to_vec()));
        Ok(())
    }

    fn map(&mut self, target: &str, passphrase: &[u8]) -> DiskMapperResult<()> {
        let mut state = self.disk.state.lock().unwrap();
        state.map_calls += 1;
        match &state.header {
            Some((_, key)) if key.as_slice() == passphrase => {
                state.active.insert(target.to_string());
                Ok(())
            }
            _ => Err(DiskMapperError::Map {
                target: target.to_string(),
                reason: "no key available with this passphrase".into(),
            }),
        }
    }

    fn unmap(&mut self, target: &str) -> DiskMapperResult<()> {
        if self.disk.state.lock().unwrap().active.remove(target) {
            Ok(())
        } else {
            Err(DiskMapperError::Unmap {
                target: target.to_string(),
                reason: "not active".into(),
            })
        }
    }

    fn close(&mut self) -> DiskMapperResult<()> {
        if !self.open {
            return Err(DiskMapperError::Close("already closed".into()));
        }
        self.open = false;
        self.disk.state.lock().unwrap().open_sessions -= 1;
        Ok(())
    }
}

/// Issues one key per disk identity and returns it on every later request.
#[derive(Clone, Default)]
struct KeyVault {
    keys: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl KeyBroker for KeyVault {
    fn request_key(&self, request: &KeyRequest) -> DiskMapperResult<Passphrase> {
        self.requests.lock().unwrap().push(request.disk_uuid.clone());
        let mut keys = self.keys.lock().unwrap();
        let next = keys.len() as u8 + 1;
        let key = keys
            .entry(request.disk_uuid.clone())
            .or_insert_with(|| vec![next; 32]);
        Ok(Passphrase::new(key.clone()))
    }
}

/// Releases a key, then trips the token as a termination signal would.
struct ReleaseThenCancel {
    vault: KeyVault,
    cancel: CancelToken,
}

impl KeyBroker for ReleaseThenCancel {
    fn request_key(&self, request: &KeyRequest) -> DiskMapperResult<Passphrase> {
        let key = self.vault.request_key(request)?;
        self.cancel.cancel();
        Ok(key)
    }
}

struct AlwaysReject;

impl KeyBroker for AlwaysReject {
    fn request_key(&self, _request: &KeyRequest) -> DiskMapperResult<Passphrase> {
        Err(DiskMapperError::KeyRejected("policy mismatch".into()))
    }
}

struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration, cancel: &CancelToken) -> DiskMapperResult<()> {
        cancel.check()
    }
}

struct QemuIssuer;

impl QuoteIssuer for QemuIssuer {
    type Error = DiskMapperError;

    fn platform(&self) -> Platform {
        Platform::Qemu
    }

    fn issue(&self, user_data: &[u8]) -> DiskMapperResult<AttestationQuote> {
        Ok(AttestationQuote {
            platform: Platform::Qemu,
            message: b"attest".to_vec(),
            signature: b"sig".to_vec(),
            ak_public: b"ak".to_vec(),
            ak_cert: None,
            qualifying_data: user_data.to_vec(),
            pcrs: Vec::new(),
        })
    }
}

struct FakeMetadata;

impl ProviderMetadata for FakeMetadata {
    type Error = DiskMapperError;

    fn self_instance(&self) -> DiskMapperResult<InstanceMetadata> {
        Ok(InstanceMetadata::default())
    }

    fn supported(&self) -> bool {
        false
    }
}

fn client<B: KeyBroker>(broker: B) -> KeyExchangeClient<B, NoSleep> {
    KeyExchangeClient::with_sleeper(
        broker,
        RetryPolicy::bounded(Duration::from_secs(1), 3),
        CancelToken::new(),
        NoSleep,
    )
}

fn qemu_target() -> DiskMapperResult<BootTarget<QemuIssuer, FakeMetadata>> {
    Ok(BootTarget {
        device_path: PathBuf::from("/dev/vda"),
        issuer: QemuIssuer,
        metadata: FakeMetadata,
    })
}

#[test]
fn blank_disk_is_formatted_then_reopened_on_reboot() {
    let disk = SimulatedDisk::default();
    let vault = KeyVault::default();

    let first_boot = client(vault.clone());
    let mut machine = DiskBootstrap::new(&first_boot, "state");
    let report = machine.run(qemu_target, |path| disk.open(path)).unwrap();

    assert_eq!(report.flow, DiskFlow::New);
    assert_eq!(
        report.transitions,
        vec![
            BootState::Init,
            BootState::Probing,
            BootState::NewDisk,
            BootState::Mapped
        ]
    );
    assert_eq!(report.mapped_device, PathBuf::from("/dev/mapper/state"));
    assert_eq!(disk.header_uuid().as_deref(), Some(report.disk_uuid.as_str()));
    {
        let state = disk.state.lock().unwrap();
        assert_eq!(state.format_calls, 1);
        assert_eq!(state.map_calls, 1);
        assert_eq!(state.open_sessions, 0);
        assert!(state.active.contains("state"));
    }
    // Reboot: kernel mappings do not survive.
    disk.state.lock().unwrap().active.clear();

    let second_boot = client(vault.clone());
    let mut machine = DiskBootstrap::new(&second_boot, "state");
    let rebooted = machine.run(qemu_target, |path| disk.open(path)).unwrap();

    assert_eq!(rebooted.flow, DiskFlow::Existing);
    assert_eq!(rebooted.disk_uuid, report.disk_uuid);
    assert_eq!(
        rebooted.transitions,
        vec![
            BootState::Init,
            BootState::Probing,
            BootState::ExistingDisk,
            BootState::Mapped
        ]
    );
    let state = disk.state.lock().unwrap();
    assert_eq!(state.format_calls, 1, "existing disk must not be reformatted");
    assert_eq!(state.map_calls, 2);
    assert_eq!(state.open_sessions, 0);
    assert_eq!(
        *vault.requests.lock().unwrap(),
        vec![report.disk_uuid.clone(), report.disk_uuid]
    );
}

#[test]
fn wrong_key_fails_mapping_and_leaves_header_untouched() {
    let disk = SimulatedDisk::default();
    let enrolled = ("1c9a3d0e-0000-4000-8000-00000000beef".to_string(), vec![0xaa; 32]);
    disk.state.lock().unwrap().header = Some(enrolled.clone());

    let vault = KeyVault::default();
    let boot = client(vault);
    let mut machine = DiskBootstrap::new(&boot, "state");
    let err = machine.run(qemu_target, |path| disk.open(path)).unwrap_err();

    assert!(matches!(err, DiskMapperError::Map { .. }), "{err}");
    assert_eq!(machine.state(), BootState::Failed);
    assert_eq!(
        machine.transitions(),
        &[
            BootState::Init,
            BootState::Probing,
            BootState::ExistingDisk,
            BootState::Failed
        ]
    );
    let state = disk.state.lock().unwrap();
    assert_eq!(state.header, Some(enrolled));
    assert_eq!(state.format_calls, 0);
    assert!(state.active.is_empty());
    assert_eq!(state.open_sessions, 0);
}

#[test]
fn format_failure_is_fatal_and_still_closes_the_session() {
    let disk = SimulatedDisk::default();
    disk.state.lock().unwrap().fail_format = true;

    let boot = client(KeyVault::default());
    let mut machine = DiskBootstrap::new(&boot, "state");
    let err = machine.run(qemu_target, |path| disk.open(path)).unwrap_err();

    assert!(matches!(err, DiskMapperError::Format(_)), "{err}");
    assert_eq!(machine.state(), BootState::Failed);
    let state = disk.state.lock().unwrap();
    assert_eq!(state.map_calls, 0);
    assert_eq!(state.open_sessions, 0);
}

#[test]
fn exhausted_key_exchange_fails_without_touching_the_disk() {
    let disk = SimulatedDisk::default();
    let boot = client(AlwaysReject);
    let mut machine = DiskBootstrap::new(&boot, "state");
    let err = machine.run(qemu_target, |path| disk.open(path)).unwrap_err();

    assert!(
        matches!(err, DiskMapperError::RetriesExhausted { attempts: 3, .. }),
        "{err}"
    );
    let state = disk.state.lock().unwrap();
    assert_eq!(state.format_calls, 0);
    assert_eq!(state.open_sessions, 0);
}

#[test]
fn resolver_and_open_failures_never_reach_probing() {
    let boot = client(KeyVault::default());

    let mut machine = DiskBootstrap::new(&boot, "state");
    let err = machine
        .run(
            || -> DiskMapperResult<BootTarget<QemuIssuer, FakeMetadata>> {
                Err(DiskMapperError::DiskPathResolution("dangling symlink".into()))
            },
            |_path: &Path| -> DiskMapperResult<SimulatedSession> {
                panic!("device must not be opened when resolution fails")
            },
        )
        .unwrap_err();
    assert!(matches!(err, DiskMapperError::DiskPathResolution(_)));
    assert_eq!(machine.transitions(), &[BootState::Init, BootState::Failed]);

    let mut machine = DiskBootstrap::new(&boot, "state");
    let err = machine
        .run(qemu_target, |path: &Path| -> DiskMapperResult<SimulatedSession> {
            Err(DiskMapperError::CryptInit {
                device: path.to_path_buf(),
                reason: "permission denied".into(),
            })
        })
        .unwrap_err();
    assert!(matches!(err, DiskMapperError::CryptInit { .. }));
    assert_eq!(machine.transitions(), &[BootState::Init, BootState::Failed]);
}

#[test]
fn a_machine_runs_only_once() {
    let disk = SimulatedDisk::default();
    let boot = client(KeyVault::default());
    let mut machine = DiskBootstrap::new(&boot, "state");
    machine.run(qemu_target, |path| disk.open(path)).unwrap();
    assert!(machine.state().is_terminal());
    assert!(machine.run(qemu_target, |path| disk.open(path)).is_err());
}

#[test]
fn cancellation_after_key_release_stops_before_touching_the_disk() {
    let disk = SimulatedDisk::default();
    let cancel = CancelToken::new();
    let boot = KeyExchangeClient::with_sleeper(
        ReleaseThenCancel {
            vault: KeyVault::default(),
            cancel: cancel.clone(),
        },
        RetryPolicy::unbounded(Duration::from_secs(1)),
        cancel,
        NoSleep,
    );

    let mut machine = DiskBootstrap::new(&boot, "state");
    let err = machine.run(qemu_target, |path| disk.open(path)).unwrap_err();

    assert!(matches!(err, DiskMapperError::Cancelled), "{err}");
    assert_eq!(
        machine.transitions(),
        &[
            BootState::Init,
            BootState::Probing,
            BootState::NewDisk,
            BootState::Failed
        ]
    );
    let state = disk.state.lock().unwrap();
    assert_eq!(state.format_calls, 0);
    assert_eq!(state.map_calls, 0);
    assert_eq!(state.open_sessions, 0);
}

#[test]
fn cancellation_before_mapping_an_existing_disk_leaves_it_unmapped() {
    let disk = SimulatedDisk::default();
    let vault = KeyVault::default();
    client(vault.clone())
        .request_key(&QemuIssuer, &FakeMetadata, "5d2c8e7a-0000-4000-8000-000000000001")
        .unwrap();
    let key = vault.keys.lock().unwrap().values().next().cloned().unwrap();
    disk.state.lock().unwrap().header =
        Some(("5d2c8e7a-0000-4000-8000-000000000001".to_string(), key));

    let cancel = CancelToken::new();
    let boot = KeyExchangeClient::with_sleeper(
        ReleaseThenCancel {
            vault,
            cancel: cancel.clone(),
        },
        RetryPolicy::unbounded(Duration::from_secs(1)),
        cancel,
        NoSleep,
    );
    let mut machine = DiskBootstrap::new(&boot, "state");
    let err = machine.run(qemu_target, |path| disk.open(path)).unwrap_err();

    assert!(matches!(err, DiskMapperError::Cancelled), "{err}");
    assert_eq!(machine.state(), BootState::Failed);
    let state = disk.state.lock().unwrap();
    assert_eq!(state.map_calls, 0);
    assert!(state.active.is_empty());
    assert_eq!(state.open_sessions, 0);
}
