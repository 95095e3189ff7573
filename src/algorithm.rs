/// Proof-of-work algorithm registry
///
/// Each stratum listener serves exactly one algorithm. The numeric id doubles
/// as the JSON-RPC password when talking to the node, so the mapping here has
/// to stay stable across releases.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256d,
    Scrypt,
    Blake3,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [Algorithm::Sha256d, Algorithm::Scrypt, Algorithm::Blake3];

    pub fn id(self) -> u32 {
        match self {
            Algorithm::Sha256d => 1,
            Algorithm::Scrypt => 2,
            Algorithm::Blake3 => 3,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Algorithm::Sha256d),
            2 => Some(Algorithm::Scrypt),
            3 => Some(Algorithm::Blake3),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Sha256d => "sha256d",
            Algorithm::Scrypt => "scrypt",
            Algorithm::Blake3 => "blake3",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256d" | "sha256" => Some(Algorithm::Sha256d),
            "scrypt" => Some(Algorithm::Scrypt),
            "blake3" => Some(Algorithm::Blake3),
            _ => None,
        }
    }

    /// Algorithm-specific proof-of-work digest of the 80-byte block header.
    pub fn work_hash(self, header: &[u8]) -> [u8; 32] {
        match self {
            Algorithm::Sha256d => {
                let first = Sha256::digest(header);
                let second = Sha256::digest(first);
                second.into()
            }
            Algorithm::Scrypt => {
                // Litecoin-style parameters: N=1024 (log2 = 10), r=1, p=1.
                let params = scrypt::Params::new(10, 1, 1, 32).expect("static scrypt params");
                let mut out = [0u8; 32];
                scrypt::scrypt(header, header, &params, &mut out).expect("static output length");
                out
            }
            Algorithm::Blake3 => *blake3::hash(header).as_bytes(),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Algorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Algorithm::from_name(&name)
            .ok_or_else(|| de::Error::custom(format!("unknown algorithm '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trip() {
        for algo in Algorithm::ALL {
            assert_eq!(Algorithm::from_id(algo.id()), Some(algo));
            assert_eq!(Algorithm::from_name(algo.name()), Some(algo));
        }
        assert_eq!(Algorithm::from_id(0), None);
    }

    #[test]
    fn work_hashes_differ_per_algorithm() {
        let header = [7u8; 80];
        let a = Algorithm::Sha256d.work_hash(&header);
        let b = Algorithm::Scrypt.work_hash(&header);
        let c = Algorithm::Blake3.work_hash(&header);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn sha256d_matches_known_vector() {
        // sha256d("") is a standard reference value.
        let digest = Algorithm::Sha256d.work_hash(b"");
        assert_eq!(
            hex::encode(digest),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }
}
