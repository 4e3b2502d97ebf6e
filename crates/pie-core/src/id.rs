//! Peer identifiers and identity hashing
//!
//! An [`Id`] is a 192-bit identifier stored as a fixed-length big-endian byte
//! array. Identifiers are derived from certificate DER bytes with SHAKE-256,
//! the same extendable-output primitive used for the shorter identity hashes
//! signed during the handshake.
//!
//! Bit `0` is the most significant bit of byte `0`. The routing trie branches
//! on bits in that order, so sharing a longer prefix with a target means a
//! smaller XOR distance.

use crate::error::{Error, Result};
use crate::{ID_BITS, ID_LEN, MAX_HASH_LEN};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha3::Shake256;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use std::fmt;

/// Hash `data` with SHAKE-256 into `hash_len` bytes
///
/// The output length is chosen by the caller: 24 bytes for peer identifiers,
/// 20 bytes for user identity hashes and 50 bytes for server identity hashes.
///
/// # Examples
///
/// ```
/// use pie_core::hash_bytes;
///
/// let short = hash_bytes(b"certificate", 20);
/// let long = hash_bytes(b"certificate", 50);
/// assert_eq!(short.len(), 20);
/// assert_eq!(&long[..20], &short[..]);
/// ```
#[must_use]
pub fn hash_bytes(data: &[u8], hash_len: usize) -> Vec<u8> {
    debug_assert!(hash_len <= MAX_HASH_LEN);
    let mut hasher = Shake256::default();
    hasher.update(data);
    let mut reader = hasher.finalize_xof();
    let mut out = vec![0u8; hash_len];
    reader.read(&mut out);
    out
}

/// 192-bit peer identifier
///
/// Equality and ordering follow big-endian byte comparison. The all-zero
/// identifier stands for "not yet known" until the peer's certificate has
/// been seen.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Id([u8; ID_LEN]);

impl Id {
    /// The unknown identifier
    pub const ZERO: Self = Self([0u8; ID_LEN]);

    /// Create an identifier from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Create an identifier from a slice that must be exactly [`ID_LEN`] bytes
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] for any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; ID_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidMessage(format!(
                "identifier must be {ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Derive the identifier of a certificate
    #[must_use]
    pub fn from_cert_der(cert_der: &[u8]) -> Self {
        let hash = hash_bytes(cert_der, ID_LEN);
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Generate a random identifier
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Parse a hex-encoded identifier
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] if the string is not valid hex of the
    /// right length.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidMessage(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Bit `i`, counting from the most significant bit
    ///
    /// # Examples
    ///
    /// ```
    /// use pie_core::Id;
    ///
    /// let mut bytes = [0u8; 24];
    /// bytes[0] = 0b0100_0000;
    /// let id = Id::from_bytes(bytes);
    /// assert_eq!(id.bit(0), 0);
    /// assert_eq!(id.bit(1), 1);
    /// ```
    #[must_use]
    pub fn bit(&self, i: usize) -> usize {
        debug_assert!(i < ID_BITS);
        usize::from((self.0[i / 8] >> (7 - i % 8)) & 1)
    }

    /// XOR distance to another identifier
    #[must_use]
    pub fn distance(&self, other: &Id) -> Id {
        let mut result = [0u8; ID_LEN];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Id(result)
    }

    /// Returns true for the unknown identifier
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Raw big-endian bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Owned copy of the bytes, as carried in wire messages
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
