// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The boot signature region: a fixed-size block appended to a boot image that
//! holds one or more certificates back to back, followed by zero padding. Each
//! certificate is a vbmeta image whose length is given by its own header.

use std::{fmt, io, iter::FusedIterator, mem};

use thiserror::Error;
use tracing::debug;
use zerocopy::big_endian;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::cursor::ByteReader,
    util::NumBytes,
};

/// Size of the certificate region.
pub const CERTIFICATE_REGION_SIZE: usize = 16 * 1024;

pub const VBMETA_MAGIC: [u8; 4] = *b"AVB0";

/// Size of the fixed vbmeta header that precedes the authentication and
/// auxiliary blocks.
pub const VBMETA_HEADER_SIZE: u64 = 256;

/// Certificate names produced when certifying a boot image.
pub const BOOT_CERTIFICATE_NAME: &str = "boot";
pub const GENERIC_KERNEL_CERTIFICATE_NAME: &str = "generic_kernel";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Certificates ({size} bytes) exceed region size ({limit} bytes)")]
    RegionOverflow { size: usize, limit: usize },
    #[error("Certificate at offset {offset} needs {needed} bytes, but only {remaining} remain")]
    TruncatedCertificate {
        offset: usize,
        needed: u64,
        remaining: usize,
    },
    #[error("Failed to generate {0:?} certificate")]
    Sign(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The leading portion of the vbmeta header. All fields are big-endian.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawPreamble {
    /// Magic value. This should be equal to [`VBMETA_MAGIC`].
    magic: [u8; 4],
    required_libavb_version_major: big_endian::U32,
    required_libavb_version_minor: big_endian::U32,
    authentication_data_block_size: big_endian::U64,
    auxiliary_data_block_size: big_endian::U64,
}

/// Scan a region for certificates. Scanning stops at the first position that
/// does not begin with [`VBMETA_MAGIC`]. A certificate whose declared length
/// would run past the end of the region produces one error and ends the scan.
pub fn scan(region: &[u8]) -> CertificateScanner<'_> {
    CertificateScanner {
        region,
        offset: 0,
        done: false,
    }
}

pub struct CertificateScanner<'a> {
    region: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> CertificateScanner<'a> {
    /// Offset of the first byte not consumed by a certificate.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn next_certificate(&mut self) -> Result<Option<&'a [u8]>> {
        let region = self.region;
        let data = &region[self.offset..];

        if !data.starts_with(&VBMETA_MAGIC) {
            return Ok(None);
        }

        let truncated = |needed| Error::TruncatedCertificate {
            offset: self.offset,
            needed,
            remaining: data.len(),
        };

        let preamble = ByteReader::new(data)
            .read_struct::<RawPreamble>()
            .map_err(|_| truncated(mem::size_of::<RawPreamble>() as u64))?;

        let size = VBMETA_HEADER_SIZE
            .checked_add(preamble.authentication_data_block_size.get())
            .and_then(|s| s.checked_add(preamble.auxiliary_data_block_size.get()))
            .ok_or_else(|| truncated(u64::MAX))?;

        if size > data.len() as u64 {
            return Err(truncated(size));
        }

        debug!(
            "Found certificate at offset {} ({size} bytes, libavb {}.{})",
            self.offset,
            preamble.required_libavb_version_major.get(),
            preamble.required_libavb_version_minor.get(),
        );

        let size = size as usize;
        self.offset += size;

        Ok(Some(&data[..size]))
    }
}

impl<'a> Iterator for CertificateScanner<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.next_certificate() {
            Ok(Some(c)) => Some(Ok(c)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for CertificateScanner<'_> {}

/// An ordered list of opaque certificates.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CertificateBlock {
    pub certificates: Vec<Vec<u8>>,
}

impl fmt::Debug for CertificateBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBlock")
            .field(
                "certificates",
                &self
                    .certificates
                    .iter()
                    .map(|c| NumBytes(c.len()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CertificateBlock {
    /// Collect every certificate in a region.
    pub fn from_region(region: &[u8]) -> Result<Self> {
        let certificates = scan(region)
            .map(|c| c.map(|c| c.to_vec()))
            .collect::<Result<_>>()?;

        Ok(Self { certificates })
    }

    /// Total length of all certificates.
    pub fn content_size(&self) -> usize {
        self.certificates.iter().map(|c| c.len()).sum()
    }

    /// Concatenate the certificates and zero-pad the result to exactly
    /// `region_size` bytes.
    pub fn to_region(&self, region_size: usize) -> Result<Vec<u8>> {
        let size = self.content_size();
        if size > region_size {
            return Err(Error::RegionOverflow {
                size,
                limit: region_size,
            });
        }

        let mut region = Vec::with_capacity(region_size);
        for certificate in &self.certificates {
            region.extend_from_slice(certificate);
        }
        region.resize(region_size, 0);

        Ok(region)
    }
}

/// If `image` ends with a certificate region, split it into the image data and
/// the region. This only looks at the raw bytes. Use
/// [`crate::format::image::split_certificate_region`] for data with a header.
pub fn split_region(image: &[u8]) -> Option<(&[u8], &[u8])> {
    if image.len() <= CERTIFICATE_REGION_SIZE {
        return None;
    }

    let (data, region) = image.split_at(image.len() - CERTIFICATE_REGION_SIZE);

    match scan(region).next() {
        Some(Ok(_)) => Some((data, region)),
        _ => None,
    }
}

/// Produces a certificate for a blob of data. Implementations typically invoke
/// an external signing tool.
pub trait CertificateSigner {
    fn generate_certificate(&self, data: &[u8], name: &str) -> io::Result<Vec<u8>>;
}

/// Append a certificate region containing the `boot` certificate for `image`
/// and the `generic_kernel` certificate for `kernel`. `image` is signed as-is,
/// so any existing trailer should be removed first.
pub fn certify(image: &[u8], kernel: &[u8], signer: &impl CertificateSigner) -> Result<Vec<u8>> {
    let block = CertificateBlock {
        certificates: vec![
            signer
                .generate_certificate(image, BOOT_CERTIFICATE_NAME)
                .map_err(|e| Error::Sign(BOOT_CERTIFICATE_NAME, e))?,
            signer
                .generate_certificate(kernel, GENERIC_KERNEL_CERTIFICATE_NAME)
                .map_err(|e| Error::Sign(GENERIC_KERNEL_CERTIFICATE_NAME, e))?,
        ],
    };
    let region = block.to_region(CERTIFICATE_REGION_SIZE)?;

    debug!(
        "Certified {:?} with {:?} of certificates",
        NumBytes(image.len()),
        NumBytes(block.content_size()),
    );

    let mut result = Vec::with_capacity(image.len() + region.len());
    result.extend_from_slice(image);
    result.extend_from_slice(&region);

    Ok(result)
}
