use std::{
    borrow::Borrow,
    fmt::{Debug, Display, Formatter, LowerHex, Result as FmtResult},
    ops::Deref,
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Wrapper type around [`bytes::Bytes`] to deserialize/serialize from/to hex strings.
///
/// Hashes are kept in the byte order the node reports them in, so displaying a hash yields the
/// same hex the node prints (prefixed with `0x`).
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bytes(pub bytes::Bytes);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Failed to parse bytes: {0}")]
pub struct ParseBytesError(String);

impl Bytes {
    pub fn new() -> Self {
        Self(bytes::Bytes::new())
    }

    /// A byte string of `len` zeros. Used as the parent hash of genesis blocks.
    pub fn zero(len: usize) -> Self {
        Self::from(vec![0u8; len])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Bytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Bytes(0x{})", hex::encode(self.0.as_ref()))
    }
}

impl Display for Bytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "0x{}", hex::encode(self.0.as_ref()))
    }
}

impl LowerHex for Bytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if f.alternate() {
            write!(f, "0x")?;
        }
        write!(f, "{}", hex::encode(self.0.as_ref()))
    }
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Borrow<[u8]> for Bytes {
    fn borrow(&self) -> &[u8] {
        self.0.borrow()
    }
}

impl From<bytes::Bytes> for Bytes {
    fn from(src: bytes::Bytes) -> Self {
        Self(src)
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(src: Vec<u8>) -> Self {
        Self(src.into())
    }
}

impl From<&[u8]> for Bytes {
    fn from(src: &[u8]) -> Self {
        Self(bytes::Bytes::copy_from_slice(src))
    }
}

impl<const N: usize> From<[u8; N]> for Bytes {
    fn from(src: [u8; N]) -> Self {
        src.to_vec().into()
    }
}

impl<const N: usize> From<&[u8; N]> for Bytes {
    fn from(src: &[u8; N]) -> Self {
        src.to_vec().into()
    }
}

/// Panics on invalid hex. Only meant for literals, use [`Bytes::from_str`] for input data.
impl From<&str> for Bytes {
    fn from(value: &str) -> Self {
        Bytes::from_str(value).unwrap_or_else(|err| panic!("invalid hex literal {value}: {err}"))
    }
}

impl FromStr for Bytes {
    type Err = ParseBytesError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let stripped = value
            .strip_prefix("0x")
            .unwrap_or(value);
        hex::decode(stripped)
            .map(Into::into)
            .map_err(|e| ParseBytesError(format!("'{value}': {e}")))
    }
}

impl Serialize for Bytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0.as_ref())))
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Bytes::from_str(&value).map_err(serde::de::Error::custom)
    }
}
