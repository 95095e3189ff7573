/// Bech32 account addresses
///
/// Addresses are a one-byte version plus a 20-byte identifier, displayed as a
/// bech32 string. Miners authorize with the string form; the coinbase codec
/// carries the 21-byte binary form.

use bech32::{FromBase32, ToBase32, Variant};
use thiserror::Error;

pub const IDENTIFIER_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("bech32 decode failed: {0}")]
    Bech32(#[from] bech32::Error),
    #[error("wrong human-readable part '{0}'")]
    WrongHrp(String),
    #[error("unsupported address version {0}")]
    WrongVersion(u8),
    #[error("identifier must be {IDENTIFIER_LEN} bytes, got {0}")]
    WrongLength(usize),
    #[error("empty data part")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub version: u8,
    pub identifier: [u8; IDENTIFIER_LEN],
}

impl Address {
    pub fn new(version: u8, identifier: [u8; IDENTIFIER_LEN]) -> Self {
        Self { version, identifier }
    }

    /// Decode a bech32 string, requiring the configured HRP, version 0 and a
    /// 20-byte identifier. This is the miner-authorize validation path.
    pub fn decode(s: &str, expected_hrp: &str) -> Result<Self, AddressError> {
        let (hrp, data, _variant) = bech32::decode(s)?;
        if hrp != expected_hrp {
            return Err(AddressError::WrongHrp(hrp));
        }
        let version = data.first().ok_or(AddressError::Empty)?.to_u8();
        if version != 0 {
            return Err(AddressError::WrongVersion(version));
        }
        let program = Vec::<u8>::from_base32(&data[1..])?;
        let identifier: [u8; IDENTIFIER_LEN] = program
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::WrongLength(program.len()))?;
        Ok(Self { version, identifier })
    }

    pub fn encode(&self, hrp: &str) -> Result<String, AddressError> {
        let mut data = vec![bech32::u5::try_from_u8(self.version)?];
        data.extend(self.identifier.to_base32());
        Ok(bech32::encode(hrp, data, Variant::Bech32)?)
    }

    /// 21-byte wire form used inside transaction outputs.
    pub fn to_bytes(&self) -> [u8; 21] {
        let mut out = [0u8; 21];
        out[0] = self.version;
        out[1..].copy_from_slice(&self.identifier);
        out
    }

    pub fn from_bytes(bytes: &[u8; 21]) -> Self {
        let mut identifier = [0u8; IDENTIFIER_LEN];
        identifier.copy_from_slice(&bytes[1..]);
        Self { version: bytes[0], identifier }
    }
}
