use ethereum_types::{H160, H256, U256};

use super::{constants::RLP_NULL, error::RLPDecodeError};

/// Trait for decoding RLP encoded slices of data.
/// Implementors provide [`decode_unfinished`](RLPDecode::decode_unfinished), which
/// returns the decoded value along with the remaining bytes;
/// consumers normally call [`decode`](RLPDecode::decode).
pub trait RLPDecode: Sized {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let (decoded, remaining) = Self::decode_unfinished(rlp)?;
        if !remaining.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }
        Ok(decoded)
    }
}

/// Splits an RLP item off the front of `data`.
/// Returns `(is_list, payload, remaining)` where `payload` excludes the prefix.
pub fn decode_rlp_item(data: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let first = *data.first().ok_or(RLPDecodeError::InvalidLength)?;
    match first {
        // Single byte, value is itself
        0x00..=0x7f => Ok((false, &data[..1], &data[1..])),
        // Short string
        0x80..=0xb7 => {
            let len = (first - 0x80) as usize;
            split_payload(data, 1, len, false)
        }
        // Long string
        0xb8..=0xbf => {
            let (offset, len) = decode_long_length(data, first - 0xb7)?;
            split_payload(data, offset, len, false)
        }
        // Short list
        0xc0..=0xf7 => {
            let len = (first - 0xc0) as usize;
            split_payload(data, 1, len, true)
        }
        // Long list
        0xf8..=0xff => {
            let (offset, len) = decode_long_length(data, first - 0xf7)?;
            split_payload(data, offset, len, true)
        }
    }
}

fn decode_long_length(data: &[u8], len_of_len: u8) -> Result<(usize, usize), RLPDecodeError> {
    let len_of_len = len_of_len as usize;
    let len_bytes = data
        .get(1..1 + len_of_len)
        .ok_or(RLPDecodeError::InvalidLength)?;
    // Canonical form forbids leading zeros in the length
    if len_bytes.first() == Some(&0) {
        return Err(RLPDecodeError::MalformedData);
    }
    let mut len = 0usize;
    for byte in len_bytes {
        len = len
            .checked_mul(256)
            .and_then(|l| l.checked_add(*byte as usize))
            .ok_or(RLPDecodeError::InvalidLength)?;
    }
    Ok((1 + len_of_len, len))
}

fn split_payload(
    data: &[u8],
    offset: usize,
    len: usize,
    is_list: bool,
) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let payload = data
        .get(offset..offset + len)
        .ok_or(RLPDecodeError::InvalidLength)?;
    Ok((is_list, payload, &data[offset + len..]))
}

/// Decodes a byte-string item, returning its payload and the remaining bytes.
pub fn decode_bytes(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    match decode_rlp_item(data)? {
        (false, payload, remaining) => Ok((payload, remaining)),
        (true, _, _) => Err(RLPDecodeError::UnexpectedList),
    }
}

/// Returns the next item of `data` including its prefix, plus the remaining bytes.
pub fn get_item_with_prefix(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (_, payload, remaining) = decode_rlp_item(data)?;
    let total = data.len() - remaining.len();
    debug_assert!(payload.len() <= total);
    Ok((&data[..total], remaining))
}

fn static_left_pad<const N: usize>(bytes: &[u8]) -> Result<[u8; N], RLPDecodeError> {
    if bytes.len() > N {
        return Err(RLPDecodeError::InvalidLength);
    }
    // Canonical integers carry no leading zeros
    if bytes.first() == Some(&0) {
        return Err(RLPDecodeError::MalformedData);
    }
    let mut padded = [0u8; N];
    padded[N - bytes.len()..].copy_from_slice(bytes);
    Ok(padded)
}

impl RLPDecode for u8 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let first = rlp.first().ok_or(RLPDecodeError::InvalidLength)?;
        match first {
            0x00..=0x7f => Ok((*first, &rlp[1..])),
            &RLP_NULL => Ok((0, &rlp[1..])),
            x if *x == RLP_NULL + 1 && rlp.len() >= 2 => Ok((rlp[1], &rlp[2..])),
            _ => Err(RLPDecodeError::MalformedData),
        }
    }
}

impl RLPDecode for u64 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let padded = static_left_pad(bytes)?;
        Ok((u64::from_be_bytes(padded), rest))
    }
}

impl RLPDecode for U256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let padded: [u8; 32] = static_left_pad(bytes)?;
        Ok((U256::from_big_endian(&padded), rest))
    }
}

impl RLPDecode for Vec<u8> {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((bytes.to_vec(), rest))
    }
}

impl<const N: usize> RLPDecode for [u8; N] {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let value = bytes
            .try_into()
            .map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl RLPDecode for H256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H256(value), rest))
    }
}

impl RLPDecode for H160 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H160(value), rest))
    }
}
