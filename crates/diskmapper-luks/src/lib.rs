#![forbid(unsafe_code)]

//! LUKS2 backend for the state disk.
//!
//! Integrates with the host via `cryptsetup` (isLuks/luksUUID/luksFormat/
//! open/close). Key material is always fed on stdin.

mod command;
mod system;

pub use command::Luks2Params;
pub use system::{CryptSession, CryptsetupDevice, DEFAULT_CRYPTSETUP_PATHS};
