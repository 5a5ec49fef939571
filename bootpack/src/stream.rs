// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Write};

use crate::util;

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Common function for writing a structure to a writer.
pub trait ToWriter<W: Write>: Sized {
    type Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error>;
}

/// A writer wrapper that tracks how many bytes have been written so that
/// output can be zero-filled up to planned offsets without requiring the
/// underlying writer to be seekable.
pub struct CountingWriter<W> {
    inner: W,
    offset: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Write zeros until the output reaches `offset`. Fails if more than
    /// `offset` bytes were already written.
    pub fn pad_to(&mut self, offset: u64) -> io::Result<u64> {
        let Some(size) = offset.checked_sub(self.offset) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Already wrote {} bytes, past offset {offset}", self.offset),
            ));
        };

        let mut remain = size;

        while remain > 0 {
            let n = remain.min(util::ZEROS.len() as u64) as usize;
            self.write_all(&util::ZEROS[..n])?;
            remain -= n as u64;
        }

        Ok(size)
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
