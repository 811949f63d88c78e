//! Core building blocks for the disk-mapper boot service.
//!
//! Configuration, the key-broker client, and the state-disk workflow live here
//! so the binary only has to resolve the platform and wire things together.

pub mod config;
pub mod error;
pub mod exec;
pub mod keyservice;
pub mod logging;
pub mod passphrase;
pub mod workflow;

pub use config::DiskMapperConfig;
pub use error::{DiskMapperError, DiskMapperResult};
pub use keyservice::{CancelToken, KeyBroker, KeyExchangeClient, RetryPolicy};
pub use passphrase::Passphrase;
pub use workflow::{BootState, BootTarget, BootstrapReport, DiskBootstrap, DiskFlow};
