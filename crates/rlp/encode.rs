use bytes::BufMut;
use ethereum_types::{H160, H256, U256};

use super::constants::RLP_NULL;

/// Function for encoding a value to RLP.
/// For encoding the value into a buffer directly, use [`RLPEncode::encode`].
pub fn encode<T: RLPEncode>(value: T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

/// Struct implementing `BufMut`, but only counting the number of bytes pushed into the buffer.
#[derive(Debug, Clone, Copy, Default)]
struct ByteCounter {
    count: usize,
}

unsafe impl BufMut for ByteCounter {
    fn remaining_mut(&self) -> usize {
        usize::MAX - self.count
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.count += cnt;
    }

    fn chunk_mut(&mut self) -> &mut bytes::buf::UninitSlice {
        unreachable!("all `BufMut` methods used for counting are reimplemented")
    }

    fn put<T: bytes::buf::Buf>(&mut self, src: T)
    where
        Self: Sized,
    {
        self.count += src.remaining();
    }

    fn put_bytes(&mut self, _val: u8, cnt: usize) {
        self.count += cnt;
    }

    fn put_slice(&mut self, src: &[u8]) {
        self.count += src.len()
    }

    fn put_u8(&mut self, _val: u8) {
        self.count += 1;
    }
}

pub trait RLPEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn length(&self) -> usize {
        // Run the `encode` function, but only counting the bytes pushed.
        let mut counter = ByteCounter::default();
        self.encode(&mut counter);
        counter.count
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Writes the RLP prefix for a payload of the given length.
/// The payload bytes themselves must be written right after.
pub fn encode_length(total_len: usize, buf: &mut dyn BufMut) {
    if total_len < 56 {
        buf.put_u8(0xc0 + total_len as u8);
    } else {
        let be = total_len.to_be_bytes();
        let skip = be.iter().take_while(|b| **b == 0).count();
        buf.put_u8(0xf7 + (be.len() - skip) as u8);
        buf.put_slice(&be[skip..]);
    }
}

fn encode_unsigned_be(value_be: &[u8], buf: &mut dyn BufMut) {
    let skip = value_be.iter().take_while(|b| **b == 0).count();
    let value_be = &value_be[skip..];
    match value_be {
        // Zero encodes as the empty string
        [] => buf.put_u8(RLP_NULL),
        [single] if *single < RLP_NULL => buf.put_u8(*single),
        bytes => {
            buf.put_u8(RLP_NULL + bytes.len() as u8);
            buf.put_slice(bytes);
        }
    }
}

impl RLPEncode for u8 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned_be(&[*self], buf);
    }
}

impl RLPEncode for u64 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned_be(&self.to_be_bytes(), buf);
    }
}

impl RLPEncode for usize {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned_be(&self.to_be_bytes(), buf);
    }
}

impl RLPEncode for U256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned_be(&self.to_big_endian(), buf);
    }
}

impl RLPEncode for [u8] {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            [single] if *single < RLP_NULL => buf.put_u8(*single),
            bytes if bytes.len() < 56 => {
                buf.put_u8(RLP_NULL + bytes.len() as u8);
                buf.put_slice(bytes);
            }
            bytes => {
                let be = bytes.len().to_be_bytes();
                let skip = be.iter().take_while(|b| **b == 0).count();
                buf.put_u8(0xb7 + (be.len() - skip) as u8);
                buf.put_slice(&be[skip..]);
                buf.put_slice(bytes);
            }
        }
    }
}

impl RLPEncode for Vec<u8> {
    fn encode(&self, buf: &mut dyn BufMut) {
        <[u8] as RLPEncode>::encode(self, buf)
    }
}

impl<const N: usize> RLPEncode for [u8; N] {
    fn encode(&self, buf: &mut dyn BufMut) {
        <[u8] as RLPEncode>::encode(self, buf)
    }
}

impl RLPEncode for H256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        <[u8] as RLPEncode>::encode(self.as_bytes(), buf)
    }
}

impl RLPEncode for H160 {
    fn encode(&self, buf: &mut dyn BufMut) {
        <[u8] as RLPEncode>::encode(self.as_bytes(), buf)
    }
}

impl<T: RLPEncode + ?Sized> RLPEncode for &T {
    fn encode(&self, buf: &mut dyn BufMut) {
        (*self).encode(buf)
    }
}
