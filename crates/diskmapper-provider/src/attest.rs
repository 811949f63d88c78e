//! Remote-attestation evidence and the issuer contract that produces it.

use crate::Platform;
use serde::{Deserialize, Serialize};
use std::error::Error;

/// A single measured register captured alongside a quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrValue {
    pub index: u32,
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
}

/// Platform-specific evidence of the current measured-boot state.
///
/// Opaque to this crate beyond its fields; the key broker owns verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationQuote {
    pub platform: Platform,
    /// Signed `TPMS_ATTEST` structure.
    #[serde(with = "hex::serde")]
    pub message: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    /// Public area of the attestation key that signed `message`.
    #[serde(with = "hex::serde")]
    pub ak_public: Vec<u8>,
    /// Cloud-provisioned AK certificate (DER), when the platform has one.
    #[serde(default, with = "optional_hex")]
    pub ak_cert: Option<Vec<u8>>,
    #[serde(with = "hex::serde")]
    pub qualifying_data: Vec<u8>,
    pub pcrs: Vec<PcrValue>,
}

/// Produces fresh attestation quotes. Implementations must not cache.
pub trait QuoteIssuer {
    type Error: Error + Send + Sync + 'static;

    /// Platform whose attestation format this issuer speaks.
    fn platform(&self) -> Platform;

    /// Produce a quote over the current measurements bound to `user_data`.
    fn issue(&self, user_data: &[u8]) -> Result<AttestationQuote, Self::Error>;
}

impl Serialize for Platform {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

mod optional_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|hex_str| hex::decode(hex_str).map_err(serde::de::Error::custom))
            .transpose()
    }
}
