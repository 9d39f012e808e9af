//! Octet Encoding Rules helpers.
//!
//! ILP packets use a small subset of OER: fixed-width integers and
//! variable-length octet strings with a length prefix that is either a single
//! byte (< 128) or `0x80 | n` followed by `n` big-endian length bytes.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use std::io::{self, Read};

const HIGH_BIT: u8 = 0x80;
const LOWER_SEVEN_BITS: u8 = 0x7f;

/// Reads a variable-length length prefix from the cursor.
pub fn read_var_len(reader: &mut impl Read) -> io::Result<usize> {
    let first = reader.read_u8()?;
    if first & HIGH_BIT == 0 {
        return Ok(usize::from(first));
    }
    let num_bytes = usize::from(first & LOWER_SEVEN_BITS);
    if num_bytes == 0 || num_bytes > 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "length prefix too long",
        ));
    }
    let mut length: u64 = 0;
    for _ in 0..num_bytes {
        length = length
            .checked_shl(8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "length overflow"))?
            | u64::from(reader.read_u8()?);
    }
    Ok(length as usize)
}

/// Reads a var-octet-string into an owned buffer.
pub fn read_var_octet_string(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let length = read_var_len(reader)?;
    let mut contents = vec![0u8; length];
    reader.read_exact(&mut contents)?;
    Ok(contents)
}

/// Appends a var-octet-string (length prefix + contents).
pub fn put_var_octet_string(buf: &mut BytesMut, contents: &[u8]) {
    put_var_len(buf, contents.len());
    buf.put_slice(contents);
}

/// Appends only the length prefix.
pub fn put_var_len(buf: &mut BytesMut, length: usize) {
    if length < usize::from(HIGH_BIT) {
        buf.put_u8(length as u8);
        return;
    }
    let length_be = (length as u64).to_be_bytes();
    let leading_zero_bytes = length_be.iter().take_while(|b| **b == 0).count();
    let num_bytes = length_be.len() - leading_zero_bytes;
    buf.put_u8(HIGH_BIT | num_bytes as u8);
    buf.put_slice(&length_be[leading_zero_bytes..]);
}

/// Number of bytes the length prefix for `length` will occupy.
pub fn var_len_size(length: usize) -> usize {
    if length < usize::from(HIGH_BIT) {
        1
    } else {
        let bits = 64 - (length as u64).leading_zeros() as usize;
        1 + (bits + 7) / 8
    }
}

pub fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    reader.read_u64::<BigEndian>()
}

/// Reads a variable-length unsigned integer (a var-octet-string holding the
/// minimal big-endian encoding).
pub fn read_var_uint(reader: &mut impl Read) -> io::Result<u64> {
    let bytes = read_var_octet_string(reader)?;
    if bytes.len() > 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "var uint too large",
        ));
    }
    let mut value: u64 = 0;
    for byte in bytes {
        value = value << 8 | u64::from(byte);
    }
    Ok(value)
}

/// Appends a variable-length unsigned integer.
pub fn put_var_uint(buf: &mut BytesMut, value: u64) {
    let be = value.to_be_bytes();
    let leading_zero_bytes = be.iter().take_while(|b| **b == 0).count();
    // zero still takes one octet
    let start = leading_zero_bytes.min(be.len() - 1);
    put_var_octet_string(buf, &be[start..]);
}
