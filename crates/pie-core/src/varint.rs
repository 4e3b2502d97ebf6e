//! Unsigned LEB128 varints, as used for frame length prefixes.
//!
//! Seven payload bits per byte, least significant group first, high bit set
//! on every byte but the last. A `u64` takes at most ten bytes.

/// Longest encoding of a `u64`
pub const MAX_VARINT_LEN: usize = 10;

/// Varint decoding failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// Value does not fit in 64 bits
    Overflow,
}

/// Append the encoding of `value` to `out`
pub fn encode_into(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Number of bytes needed to encode `value`
#[must_use]
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Decode a varint from the start of `bytes`
///
/// Returns `Ok(None)` when `bytes` ends before the varint does, otherwise
/// the value and the number of bytes consumed.
///
/// # Errors
///
/// Returns [`VarintError::Overflow`] if the encoding exceeds 64 bits.
///
/// # Examples
///
/// ```
/// use pie_core::varint::decode;
///
/// assert_eq!(decode(&[0xAC, 0x02]), Ok(Some((300, 2))));
/// assert_eq!(decode(&[0xAC]), Ok(None));
/// ```
pub fn decode(bytes: &[u8]) -> Result<Option<(u64, usize)>, VarintError> {
    let mut value = 0u64;
    for (n, &byte) in bytes.iter().enumerate().take(MAX_VARINT_LEN) {
        if n == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(VarintError::Overflow);
        }
        value |= u64::from(byte & 0x7F) << (7 * n);
        if byte & 0x80 == 0 {
            return Ok(Some((value, n + 1)));
        }
    }
    if bytes.len() >= MAX_VARINT_LEN {
        return Err(VarintError::Overflow);
    }
    Ok(None)
}
