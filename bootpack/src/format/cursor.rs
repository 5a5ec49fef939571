// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Bounds-checked sequential access to little-endian header data.
//!
//! Fixed-size string fields are NUL-terminated on disk. Reading truncates at
//! the first NUL byte and ignores everything after it. Writing requires room
//! for at least one NUL byte and rejects strings that contain one.

use std::{mem, str};

use bstr::ByteSlice;
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Truncated input at offset {offset}: need {needed} bytes, but only {remaining} remain")]
    TruncatedInput {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("{field:?} field has invalid encoding ({reason}): {data:?}", data = .data.as_bstr())]
    InvalidEncoding {
        field: &'static str,
        reason: &'static str,
        data: Vec<u8>,
    },
    #[error("{field:?} field is too long ({len} >= {size}): {value:?}")]
    FieldTooLong {
        field: &'static str,
        size: usize,
        len: usize,
        value: String,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Decode a NUL-terminated string from a fixed-size field.
pub fn decode_cstring(field: &'static str, data: &[u8]) -> Result<String> {
    let end = data.find_byte(0).unwrap_or(data.len());
    let data = &data[..end];

    str::from_utf8(data)
        .map(|s| s.to_owned())
        .map_err(|_| Error::InvalidEncoding {
            field,
            reason: "not UTF-8",
            data: data.to_vec(),
        })
}

/// Encode a string into a fixed-size, NUL-terminated field.
pub fn encode_cstring<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N]> {
    if value.len() >= N {
        return Err(Error::FieldTooLong {
            field,
            size: N,
            len: value.len(),
            value: value.to_owned(),
        });
    } else if value.as_bytes().contains(&0) {
        return Err(Error::InvalidEncoding {
            field,
            reason: "embedded NUL",
            data: value.as_bytes().to_vec(),
        });
    }

    let mut result = [0u8; N];
    result[..value.len()].copy_from_slice(value.as_bytes());

    Ok(result)
}

/// Sequential reader over an in-memory buffer.
#[derive(Clone, Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn truncated(&self, needed: usize) -> Error {
        Error::TruncatedInput {
            offset: self.offset,
            needed,
            remaining: self.remaining(),
        }
    }

    pub fn read_fixed(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(self.truncated(n));
        }

        let data = &self.data[self.offset..self.offset + n];
        self.offset += n;

        Ok(data)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_fixed(N)?);
        Ok(buf)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_cstring(&mut self, field: &'static str, n: usize) -> Result<String> {
        let data = self.read_fixed(n)?;
        decode_cstring(field, data)
    }

    /// Read a raw on-disk structure.
    pub fn read_struct<T: FromBytes>(&mut self) -> Result<T> {
        let size = mem::size_of::<T>();
        let (value, _) =
            T::read_from_prefix(&self.data[self.offset..]).map_err(|_| self.truncated(size))?;
        self.offset += size;

        Ok(value)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_fixed(n).map(|_| ())
    }
}

/// Sequential writer into a growable buffer.
#[derive(Clone, Debug, Default)]
pub struct ByteWriter {
    data: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn write_fixed(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_fixed(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_fixed(&value.to_le_bytes());
    }

    pub fn write_cstring(&mut self, field: &'static str, value: &str, n: usize) -> Result<()> {
        if value.len() >= n {
            return Err(Error::FieldTooLong {
                field,
                size: n,
                len: value.len(),
                value: value.to_owned(),
            });
        } else if value.as_bytes().contains(&0) {
            return Err(Error::InvalidEncoding {
                field,
                reason: "embedded NUL",
                data: value.as_bytes().to_vec(),
            });
        }

        self.write_fixed(value.as_bytes());
        self.data.resize(self.data.len() + n - value.len(), 0);

        Ok(())
    }

    pub fn write_struct<T: IntoBytes + Immutable>(&mut self, value: &T) {
        self.write_fixed(value.as_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}
