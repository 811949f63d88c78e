use super::{mapped_device_path, BootState, BootTarget, BootstrapReport, DiskFlow};
use crate::error::{DiskMapperError, DiskMapperResult};
use crate::keyservice::{KeyBroker, KeyExchangeClient, Sleeper};
use crate::passphrase::Passphrase;
use diskmapper_provider::{CryptDevice, ProviderMetadata, QuoteIssuer};
use log::{debug, error, info, warn};
use std::path::Path;
use uuid::Uuid;

/// Drives one state disk from `Init` to `Mapped` (or `Failed`).
///
/// The crypt session is opened once and closed on every path out of
/// [`run`](Self::run), including failures after the open. Cancellation is
/// honoured inside the key exchange and again before `format` and `map`.
pub struct DiskBootstrap<'a, B, S> {
    client: &'a KeyExchangeClient<B, S>,
    mapped_name: String,
    state: BootState,
    transitions: Vec<BootState>,
}

impl<'a, B: KeyBroker, S: Sleeper> DiskBootstrap<'a, B, S> {
    pub fn new(client: &'a KeyExchangeClient<B, S>, mapped_name: impl Into<String>) -> Self {
        Self {
            client,
            mapped_name: mapped_name.into(),
            state: BootState::Init,
            transitions: vec![BootState::Init],
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Every state entered so far, starting with `Init`.
    pub fn transitions(&self) -> &[BootState] {
        &self.transitions
    }

    /// Resolve the platform, open the device, and take it to `Mapped`.
    ///
    /// `resolve` yields the device path plus the attestation capabilities;
    /// `open` acquires the crypt session for that path.
    pub fn run<R, O, I, M, D>(&mut self, resolve: R, open: O) -> DiskMapperResult<BootstrapReport>
    where
        R: FnOnce() -> DiskMapperResult<BootTarget<I, M>>,
        O: FnOnce(&Path) -> DiskMapperResult<D>,
        I: QuoteIssuer<Error = DiskMapperError>,
        M: ProviderMetadata<Error = DiskMapperError>,
        D: CryptDevice<Error = DiskMapperError>,
    {
        if self.state != BootState::Init {
            return Err(DiskMapperError::Command(format!(
                "bootstrap already ran (state {})",
                self.state
            )));
        }

        let outcome = self.drive(resolve, open);
        if let Err(err) = &outcome {
            error!("state disk bootstrap failed in {}: {err}", self.state);
            self.enter(BootState::Failed);
        }
        outcome
    }

    fn drive<R, O, I, M, D>(&mut self, resolve: R, open: O) -> DiskMapperResult<BootstrapReport>
    where
        R: FnOnce() -> DiskMapperResult<BootTarget<I, M>>,
        O: FnOnce(&Path) -> DiskMapperResult<D>,
        I: QuoteIssuer<Error = DiskMapperError>,
        M: ProviderMetadata<Error = DiskMapperError>,
        D: CryptDevice<Error = DiskMapperError>,
    {
        let target = resolve()?;
        info!(
            "preparing state disk {} on {}",
            target.device_path.display(),
            target.issuer.platform()
        );

        let mut session = open(&target.device_path)?;
        self.enter(BootState::Probing);

        let result = self.probe_and_map(&mut session, &target.issuer, &target.metadata);
        let closed = session.close();

        match (result, closed) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!("releasing crypt device after failure: {close_err}");
                Err(err)
            }
        }
    }

    fn probe_and_map<I, M, D>(
        &mut self,
        session: &mut D,
        issuer: &I,
        metadata: &M,
    ) -> DiskMapperResult<BootstrapReport>
    where
        I: QuoteIssuer<Error = DiskMapperError>,
        M: ProviderMetadata<Error = DiskMapperError>,
        D: CryptDevice<Error = DiskMapperError>,
    {
        let (flow, disk_uuid, passphrase) = if session.is_luks() {
            self.enter(BootState::ExistingDisk);
            let disk_uuid = session.disk_uuid()?;
            info!("found LUKS2 state disk {disk_uuid}; requesting its key");
            let passphrase = self.client.request_key(issuer, metadata, &disk_uuid)?;
            (DiskFlow::Existing, disk_uuid, passphrase)
        } else {
            self.enter(BootState::NewDisk);
            let disk_uuid = Uuid::new_v4().to_string();
            info!("state disk is not LUKS2; initialising it as {disk_uuid}");
            let passphrase = self.client.request_key(issuer, metadata, &disk_uuid)?;
            self.client.cancel_token().check()?;
            format_disk(session, &passphrase, &disk_uuid)?;
            (DiskFlow::New, disk_uuid, passphrase)
        };

        self.client.cancel_token().check()?;
        map_disk(session, &self.mapped_name, passphrase)?;
        self.enter(BootState::Mapped);

        let mapped_device = mapped_device_path(&self.mapped_name);
        info!(
            "state disk {disk_uuid} mapped at {}",
            mapped_device.display()
        );
        Ok(BootstrapReport {
            flow,
            disk_uuid,
            mapped_device,
            transitions: self.transitions.clone(),
        })
    }

    fn enter(&mut self, next: BootState) {
        debug!("bootstrap: {} -> {next}", self.state);
        self.state = next;
        self.transitions.push(next);
    }
}

fn format_disk<D>(session: &mut D, passphrase: &Passphrase, disk_uuid: &str) -> DiskMapperResult<()>
where
    D: CryptDevice<Error = DiskMapperError>,
{
    session.format(passphrase.as_bytes(), disk_uuid)?;
    let written = session.disk_uuid()?;
    if written != disk_uuid {
        return Err(DiskMapperError::Format(format!(
            "header UUID {written} does not match requested {disk_uuid}"
        )));
    }
    Ok(())
}

/// Consumes the passphrase so it is zeroed as soon as the mapping attempt returns.
fn map_disk<D>(session: &mut D, target: &str, passphrase: Passphrase) -> DiskMapperResult<()>
where
    D: CryptDevice<Error = DiskMapperError>,
{
    session.map(target, passphrase.as_bytes())
}
