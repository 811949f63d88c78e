//! Secret key material for the state disk.

use crate::error::{DiskMapperError, DiskMapperResult};
use std::fmt;
use zeroize::Zeroizing;

/// Passphrase released by the key broker.
///
/// The buffer is zeroed on drop. There is deliberately no `Display` and the
/// `Debug` impl only reports the length.
pub struct Passphrase(Zeroizing<Vec<u8>>);

impl Passphrase {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Decode a hex-encoded passphrase as delivered on the wire.
    pub fn from_hex(encoded: &str) -> DiskMapperResult<Self> {
        let decoded = Zeroizing::new(hex::decode(encoded.trim()).map_err(|_| {
            DiskMapperError::BrokerUnavailable("passphrase is not valid hex".into())
        })?);
        if decoded.is_empty() {
            return Err(DiskMapperError::BrokerUnavailable(
                "broker returned an empty passphrase".into(),
            ));
        }
        Ok(Self(decoded))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Passphrase(<redacted {} bytes>)", self.0.len())
    }
}
