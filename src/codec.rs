//! Fixed-layout record decoding helpers
//!
//! The on-flash dump format and the ELF core file are both streams of packed
//! little-endian records. Record shapes are described as [`bytemuck::Pod`]
//! structs by the modules that own them; the helpers here do the
//! bounds-checked decoding and the 4-byte alignment math shared by all of
//! them.

use std::mem::size_of;

use bytemuck::AnyBitPattern;

use crate::error::Error;

/// Rounds `len` up to the next multiple of 4.
pub fn align4(len: u32) -> u32 {
    (len + 3) & !3
}

/// Appends zero bytes to `buf` until its length is a multiple of 4.
pub fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Decodes a packed record from the front of `buf`.
pub fn read_pod<T: AnyBitPattern>(buf: &[u8]) -> Result<T, Error> {
    if buf.len() < size_of::<T>() {
        return Err(Error::MalformedInput {
            expected: size_of::<T>(),
            actual: buf.len(),
        });
    }

    Ok(bytemuck::pod_read_unaligned(&buf[..size_of::<T>()]))
}

/// Decodes `count` little-endian words from the front of `buf`.
pub fn read_words(buf: &[u8], count: usize) -> Result<Vec<u32>, Error> {
    if buf.len() < count * 4 {
        return Err(Error::MalformedInput {
            expected: count * 4,
            actual: buf.len(),
        });
    }

    Ok(buf[..count * 4]
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes(word.try_into().unwrap()))
        .collect())
}
