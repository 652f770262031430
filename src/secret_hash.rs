use crate::secret::Secret;
use bitcoin::hashes::{sha256, Hash};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{self, Debug},
    str::FromStr,
};

/// The one-way hash pinning a swap to its secret.
///
/// Once set on a swap it must never change to a different value for the
/// lifetime of that swap.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct SecretHash([u8; Self::SIZE]);

impl SecretHash {
    pub const SIZE: usize = 32;

    /// Hashes the given secret with a single round of SHA-256.
    pub fn new(secret: Secret) -> Self {
        let hash = sha256::Hash::hash(secret.raw_secret());
        SecretHash(hash.into_inner())
    }

    pub fn hash_of_slice(candidate: &[u8]) -> [u8; Self::SIZE] {
        sha256::Hash::hash(candidate).into_inner()
    }

    pub fn raw(&self) -> &[u8; Self::SIZE] {
        &self.0
    }
}

impl Debug for SecretHash {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&format!("SecretHash({:x})", self))
    }
}

impl From<Secret> for SecretHash {
    fn from(secret: Secret) -> Self {
        SecretHash::new(secret)
    }
}

impl From<[u8; Self::SIZE]> for SecretHash {
    fn from(hash: [u8; Self::SIZE]) -> Self {
        SecretHash(hash)
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&format!("{:x}", self))
    }
}

impl fmt::LowerHex for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(hex::encode(self.0).as_str())
    }
}

#[derive(PartialEq, Debug, thiserror::Error)]
pub enum FromErr {
    #[error("invalid length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error(transparent)]
    FromHex(#[from] hex::FromHexError),
}

impl FromStr for SecretHash {
    type Err = FromErr;

    fn from_str(s: &str) -> Result<Self, <Self as FromStr>::Err> {
        let vec = hex::decode(s)?;
        if vec.len() != Self::SIZE {
            return Err(FromErr::InvalidLength {
                expected: Self::SIZE,
                got: vec.len(),
            });
        }
        let mut data = [0; Self::SIZE];
        data.copy_from_slice(&vec[..Self::SIZE]);
        Ok(SecretHash(data))
    }
}

impl Serialize for SecretHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:x}", self))
    }
}

impl<'de> Deserialize<'de> for SecretHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SecretHash::from_str(&s)
            .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(&s), &"hex encoded 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_of_secret_matches_sha256() {
        let secret = Secret::from(*b"hello world, you are beautiful!!");
        let hash = SecretHash::new(secret);

        assert_eq!(hash.raw(), &SecretHash::hash_of_slice(secret.raw_secret()));
    }

    #[test]
    fn rejects_hash_of_wrong_length() {
        let result = SecretHash::from_str("abcdef");

        assert_eq!(
            result.unwrap_err(),
            FromErr::InvalidLength {
                expected: 32,
                got: 3
            }
        );
    }

    #[test]
    fn round_trip_serialization() {
        let hash = SecretHash::new(Secret::from(*b"hello world, you are beautiful!!"));

        let json = serde_json::to_string(&hash).unwrap();
        let deserialized = serde_json::from_str::<SecretHash>(&json).unwrap();

        assert_eq!(deserialized, hash);
    }
}
