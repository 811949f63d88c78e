#![forbid(unsafe_code)]

//! Cloud platform integration for disk-mapper.
//!
//! [`PlatformResolver`] turns a `--csp` value into the state disk path plus
//! the attestation issuer and metadata client for that platform.

mod azure;
mod gcp;
mod http;
mod qemu;
mod resolver;
mod vtpm;

pub use azure::AzureMetadata;
pub use gcp::GcpMetadata;
pub use qemu::FakeMetadata;
pub use resolver::{PlatformMetadata, PlatformResolver, ResolverSettings};
pub use vtpm::{TpmSettings, VtpmQuoteIssuer};
