use crate::secret_hash::SecretHash;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

#[derive(PartialEq, Debug, thiserror::Error)]
pub enum FromErr {
    #[error("invalid length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error(transparent)]
    FromHex(#[from] hex::FromHexError),
}

/// The preimage a swap initiator commits to; revealing it on-chain is what
/// makes the two legs of a swap atomic.
#[derive(Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct Secret([u8; Self::SIZE]);

impl Secret {
    // Both values need to stay the same!
    pub const SIZE: usize = 32;
    pub const SIZE_U8: u8 = 32;

    pub fn from_vec(vec: &[u8]) -> Result<Secret, FromErr> {
        if vec.len() != Self::SIZE {
            return Err(FromErr::InvalidLength {
                expected: Self::SIZE,
                got: vec.len(),
            });
        }
        let mut data = [0; Self::SIZE];
        data.copy_from_slice(&vec[..Self::SIZE]);
        Ok(Secret(data))
    }

    pub fn raw_secret(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    pub fn hash(&self) -> SecretHash {
        SecretHash::new(*self)
    }
}

impl From<[u8; Self::SIZE]> for Secret {
    fn from(secret: [u8; Self::SIZE]) -> Self {
        Secret(secret)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([***])")
    }
}

impl fmt::LowerHex for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(hex::encode(self.0).as_str())
    }
}

impl FromStr for Secret {
    type Err = FromErr;

    fn from_str(s: &str) -> Result<Self, <Self as FromStr>::Err> {
        let vec = hex::decode(s)?;
        Self::from_vec(&vec)
    }
}

impl Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:x}", self))
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Secret::from_str(&s)
            .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(&s), &"hex encoded 32 bytes"))
    }
}
