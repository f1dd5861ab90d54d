//! Wire primitives
//!
//! All integers are little-endian. Sizes use the compact form:
//!
//! ```text
//! size < 255   : u8(size)
//! size >= 255  : u8(255) i32(size)
//! ```
//!
//! Strings are a size followed by UTF-8 bytes. Operation arguments and
//! results travel inside an encapsulation:
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+------ - -
//! |        size (i32, incl. header)   | enc maj| enc min| data...
//! +--------+--------+--------+--------+--------+--------+------ - -
//! ```

use crate::error::{Result, WireError};
use crate::types::Context;
use bytes::{Buf, BufMut, Bytes};

/// Encoding major version
pub const ENCODING_MAJOR: u8 = 1;
/// Encoding minor version
pub const ENCODING_MINOR: u8 = 0;

/// Size of the encapsulation header (size + version)
pub const ENCAPSULATION_HEADER_SIZE: usize = 6;

fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(WireError::BufferUnderflow {
            needed,
            have: buf.remaining(),
        });
    }
    Ok(())
}

/// Write a compact size
pub fn put_size<B: BufMut>(buf: &mut B, size: usize) {
    if size < 255 {
        buf.put_u8(size as u8);
    } else {
        buf.put_u8(255);
        buf.put_i32_le(size as i32);
    }
}

/// Read a compact size
pub fn get_size<B: Buf>(buf: &mut B) -> Result<usize> {
    ensure(buf, 1)?;
    let small = buf.get_u8();
    if small < 255 {
        return Ok(small as usize);
    }
    ensure(buf, 4)?;
    let size = buf.get_i32_le();
    if size < 0 {
        return Err(WireError::InvalidSize(size));
    }
    Ok(size as usize)
}

/// Encoded length of a compact size
pub fn size_len(size: usize) -> usize {
    if size < 255 {
        1
    } else {
        5
    }
}

pub fn put_bool<B: BufMut>(buf: &mut B, value: bool) {
    buf.put_u8(value as u8);
}

pub fn get_bool<B: Buf>(buf: &mut B) -> Result<bool> {
    ensure(buf, 1)?;
    Ok(buf.get_u8() != 0)
}

pub fn put_i32<B: BufMut>(buf: &mut B, value: i32) {
    buf.put_i32_le(value);
}

pub fn get_i32<B: Buf>(buf: &mut B) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

/// Write a string (size + UTF-8 bytes)
pub fn put_string<B: BufMut>(buf: &mut B, value: &str) {
    put_size(buf, value.len());
    buf.put_slice(value.as_bytes());
}

/// Read a string
pub fn get_string<B: Buf>(buf: &mut B) -> Result<String> {
    let len = get_size(buf)?;
    ensure(buf, len)?;
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    Ok(String::from_utf8(data)?)
}

/// Write a sequence of strings
pub fn put_string_seq<B: BufMut, S: AsRef<str>>(buf: &mut B, values: &[S]) {
    put_size(buf, values.len());
    for value in values {
        put_string(buf, value.as_ref());
    }
}

/// Read a sequence of strings
pub fn get_string_seq<B: Buf>(buf: &mut B) -> Result<Vec<String>> {
    let count = get_size(buf)?;
    // Every string needs at least one byte, so a count beyond the
    // remaining data is corrupt.
    ensure(buf, count)?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(get_string(buf)?);
    }
    Ok(values)
}

/// Write a request context as a string dictionary.
///
/// Keys are written in sorted order so equal contexts encode identically.
pub fn put_context<B: BufMut>(buf: &mut B, context: &Context) {
    put_size(buf, context.len());
    let mut entries: Vec<_> = context.iter().collect();
    entries.sort();
    for (key, value) in entries {
        put_string(buf, key);
        put_string(buf, value);
    }
}

/// Read a request context. An empty dictionary decodes to an empty map.
pub fn get_context<B: Buf>(buf: &mut B) -> Result<Context> {
    let count = get_size(buf)?;
    ensure(buf, count.saturating_mul(2))?;
    let mut context = Context::with_capacity(count);
    for _ in 0..count {
        let key = get_string(buf)?;
        let value = get_string(buf)?;
        context.insert(key, value);
    }
    Ok(context)
}

/// Wrap `data` in an encapsulation
pub fn put_encapsulation<B: BufMut>(buf: &mut B, data: &[u8]) {
    buf.put_i32_le((data.len() + ENCAPSULATION_HEADER_SIZE) as i32);
    buf.put_u8(ENCODING_MAJOR);
    buf.put_u8(ENCODING_MINOR);
    buf.put_slice(data);
}

/// Read an encapsulation and return its payload
pub fn get_encapsulation<B: Buf>(buf: &mut B) -> Result<Bytes> {
    ensure(buf, ENCAPSULATION_HEADER_SIZE)?;
    let size = buf.get_i32_le();
    if size < ENCAPSULATION_HEADER_SIZE as i32 {
        return Err(WireError::InvalidSize(size));
    }
    let major = buf.get_u8();
    let minor = buf.get_u8();
    if major != ENCODING_MAJOR || minor > ENCODING_MINOR {
        return Err(WireError::UnsupportedEncoding { major, minor });
    }
    let len = size as usize - ENCAPSULATION_HEADER_SIZE;
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}
