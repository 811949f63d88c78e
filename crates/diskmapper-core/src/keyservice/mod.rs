//! Attestation-gated retrieval of the state disk passphrase.
//!
//! Every attempt gathers fresh instance metadata, binds a new nonce and the
//! disk identity into a fresh quote, and hands both to a [`KeyBroker`].
//! Failures are logged and retried at a fixed interval; the bound on attempts
//! is explicit in [`RetryPolicy`].

mod http;

pub use http::HttpKeyBroker;

use crate::error::{DiskMapperError, DiskMapperResult};
use crate::passphrase::Passphrase;
use diskmapper_provider::{AttestationQuote, InstanceMetadata, ProviderMetadata, QuoteIssuer};
use log::{debug, error, info, warn};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const NONCE_LEN: usize = 32;
const QUOTE_DOMAIN: &[u8] = b"disk-mapper/state-disk-key";
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// How often and how many times to ask the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub poll_interval: Duration,
    /// `None` retries until the broker accepts or the token is cancelled.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            max_attempts: None,
        }
    }

    pub fn bounded(poll_interval: Duration, max_attempts: u32) -> Self {
        Self {
            poll_interval,
            max_attempts: Some(max_attempts.max(1)),
        }
    }
}

/// Shared flag used to abandon the retry loop from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> DiskMapperResult<()> {
        if self.is_cancelled() {
            Err(DiskMapperError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Waits out the poll interval between attempts.
pub trait Sleeper {
    /// Block for `duration`, returning `Cancelled` as soon as `cancel` trips.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> DiskMapperResult<()>;
}

/// Real-time sleeper that wakes periodically to observe cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleep;

impl Sleeper for ThreadSleep {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> DiskMapperResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Body submitted to the broker on each attempt.
#[derive(Debug, Clone, Serialize)]
pub struct KeyRequest {
    pub disk_uuid: String,
    #[serde(with = "hex::serde")]
    pub nonce: Vec<u8>,
    pub quote: AttestationQuote,
    pub metadata: InstanceMetadata,
}

/// Transport to the remote key broker.
///
/// Implementations report a policy refusal as `KeyRejected` and anything else
/// (transport, status, body) as `BrokerUnavailable`.
pub trait KeyBroker {
    fn request_key(&self, request: &KeyRequest) -> DiskMapperResult<Passphrase>;
}

impl<T: KeyBroker + ?Sized> KeyBroker for &T {
    fn request_key(&self, request: &KeyRequest) -> DiskMapperResult<Passphrase> {
        (**self).request_key(request)
    }
}

impl<T: KeyBroker + ?Sized> KeyBroker for Box<T> {
    fn request_key(&self, request: &KeyRequest) -> DiskMapperResult<Passphrase> {
        (**self).request_key(request)
    }
}

/// Derive the quote's qualifying data from the disk identity and nonce.
pub fn qualifying_data(disk_uuid: &str, nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(QUOTE_DOMAIN);
    hasher.update(disk_uuid.as_bytes());
    hasher.update(nonce);
    hasher.finalize().into()
}

pub struct KeyExchangeClient<B, S = ThreadSleep> {
    broker: B,
    policy: RetryPolicy,
    cancel: CancelToken,
    sleeper: S,
}

impl<B: KeyBroker> KeyExchangeClient<B, ThreadSleep> {
    pub fn new(broker: B, policy: RetryPolicy, cancel: CancelToken) -> Self {
        Self::with_sleeper(broker, policy, cancel, ThreadSleep)
    }
}

impl<B: KeyBroker, S: Sleeper> KeyExchangeClient<B, S> {
    pub fn with_sleeper(broker: B, policy: RetryPolicy, cancel: CancelToken, sleeper: S) -> Self {
        Self {
            broker,
            policy,
            cancel,
            sleeper,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Obtain the passphrase for `disk_uuid`, retrying until accepted.
    ///
    /// Returns `Cancelled` when the token trips and `RetriesExhausted` when a
    /// bounded policy runs out. No other error escapes.
    pub fn request_key<I, M>(
        &self,
        issuer: &I,
        metadata: &M,
        disk_uuid: &str,
    ) -> DiskMapperResult<Passphrase>
    where
        I: QuoteIssuer<Error = DiskMapperError>,
        M: ProviderMetadata<Error = DiskMapperError>,
    {
        let mut attempts: u32 = 0;
        loop {
            self.cancel.check()?;
            attempts += 1;

            let err = match self.attempt(issuer, metadata, disk_uuid) {
                Ok(passphrase) => {
                    info!("key broker released the key for disk {disk_uuid} (attempt {attempts})");
                    return Ok(passphrase);
                }
                Err(DiskMapperError::Cancelled) => return Err(DiskMapperError::Cancelled),
                Err(err) => err,
            };

            if err.is_transient() {
                warn!("key exchange attempt {attempts} for disk {disk_uuid} failed: {err}");
            } else {
                error!("key exchange attempt {attempts} for disk {disk_uuid} failed: {err}");
            }

            if let Some(max) = self.policy.max_attempts {
                if attempts >= max {
                    return Err(DiskMapperError::RetriesExhausted {
                        attempts,
                        last_error: err.to_string(),
                    });
                }
            }

            debug!("retrying key exchange in {:?}", self.policy.poll_interval);
            self.sleeper.sleep(self.policy.poll_interval, &self.cancel)?;
        }
    }

    fn attempt<I, M>(
        &self,
        issuer: &I,
        metadata: &M,
        disk_uuid: &str,
    ) -> DiskMapperResult<Passphrase>
    where
        I: QuoteIssuer<Error = DiskMapperError>,
        M: ProviderMetadata<Error = DiskMapperError>,
    {
        let instance = metadata.self_instance()?;

        let mut nonce = vec![0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let quote = issuer.issue(&qualifying_data(disk_uuid, &nonce))?;

        let request = KeyRequest {
            disk_uuid: disk_uuid.to_string(),
            nonce,
            quote,
            metadata: instance,
        };
        self.broker.request_key(&request)
    }
}
