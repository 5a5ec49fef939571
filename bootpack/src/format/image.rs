// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    fmt,
    io::{self, Read, Write},
};

use ring::digest::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    format::{
        bootimage::{self, BOOT_MAGIC, BootHeader, HeaderExt},
        certificate::{self, CERTIFICATE_REGION_SIZE, CertificateBlock, VBMETA_MAGIC},
        layout::{SectionKind, SectionLayout},
        vendorboot::{self, VENDOR_BOOT_MAGIC, VendorBootHeader},
    },
    stream::{CountingWriter, FromReader, ToWriter},
    util::NumBytes,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown image format: {0:?}")]
    UnknownFormat([u8; 8]),
    #[error("{kind} section ({offset}+{size}) extends past the end of the image ({image_size})")]
    TruncatedSection {
        kind: SectionKind,
        offset: u64,
        size: u64,
        image_size: usize,
    },
    #[error("{kind} section is not supported by {header_kind} v{version} images")]
    UnsupportedSection {
        kind: SectionKind,
        header_kind: &'static str,
        version: u32,
    },
    #[error("{0} section is too large")]
    SectionTooLarge(SectionKind),
    #[error("Boot image error")]
    Boot(#[from] bootimage::Error),
    #[error("Vendor boot image error")]
    VendorBoot(#[from] vendorboot::Error),
    #[error("Certificate region error")]
    Certificate(#[from] certificate::Error),
    #[error("Failed to read image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write image data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Header of either a boot image or a vendor boot image.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ImageHeader {
    Boot(BootHeader),
    VendorBoot(VendorBootHeader),
}

impl ImageHeader {
    /// Parse a header, detecting the image kind by its magic. Vendor v4
    /// headers need the data through the end of the ramdisk table.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut magic = [0u8; 8];
        let n = data.len().min(magic.len());
        magic[..n].copy_from_slice(&data[..n]);

        if magic == BOOT_MAGIC {
            Ok(Self::Boot(BootHeader::from_bytes(data)?))
        } else if magic == VENDOR_BOOT_MAGIC {
            Ok(Self::VendorBoot(VendorBootHeader::from_bytes(data)?))
        } else {
            Err(Error::UnknownFormat(magic))
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::Boot(h) => Ok(h.to_bytes()?),
            Self::VendorBoot(h) => Ok(h.to_bytes()?),
        }
    }

    pub fn layout(&self) -> Result<SectionLayout> {
        match self {
            Self::Boot(h) => Ok(h.layout()?),
            Self::VendorBoot(h) => Ok(h.layout()?),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Boot(_) => "boot",
            Self::VendorBoot(_) => "vendor_boot",
        }
    }

    /// Sections whose contents are supplied by the caller. This excludes the
    /// header and the vendor ramdisk table, which are generated.
    pub fn data_sections(&self) -> Vec<SectionKind> {
        let sections = match self {
            Self::Boot(BootHeader::V0Through2(h)) => h.sections(),
            Self::Boot(BootHeader::V3Through4(h)) => h.sections(),
            Self::VendorBoot(h) => h.sections().unwrap_or_default(),
        };

        sections
            .into_iter()
            .map(|(k, _)| k)
            .filter(|k| *k != SectionKind::VendorRamdiskTable)
            .collect()
    }
}

impl fmt::Display for ImageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boot(h) => h.fmt(f),
            Self::VendorBoot(h) => h.fmt(f),
        }
    }
}

impl HeaderExt for ImageHeader {
    fn header_version(&self) -> u32 {
        match self {
            Self::Boot(h) => h.header_version(),
            Self::VendorBoot(h) => h.header_version(),
        }
    }

    fn header_size(&self) -> u32 {
        match self {
            Self::Boot(h) => h.header_size(),
            Self::VendorBoot(h) => h.header_size(),
        }
    }

    fn page_size(&self) -> u32 {
        match self {
            Self::Boot(h) => h.page_size(),
            Self::VendorBoot(h) => h.page_size(),
        }
    }
}

fn trailer_start(layout: &SectionLayout, data_size: usize) -> usize {
    usize::try_from(layout.total_size())
        .unwrap_or(usize::MAX)
        .min(data_size)
}

/// Split raw image data at the end of the layout declared by its header. The
/// second half is the trailer.
pub fn split_trailer(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let layout = ImageHeader::from_bytes(data)?.layout()?;
    Ok(data.split_at(trailer_start(&layout, data.len())))
}

/// Raw image data split around a certificate region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionSplit<'a> {
    /// Everything before the region.
    pub image: &'a [u8],
    pub region: Option<&'a [u8]>,
    /// Everything after the region, or the trailer if there is no region.
    pub rest: &'a [u8],
}

/// Locate the certificate region in raw image data. If the data parses as an
/// image, only a region at the start of the trailer counts, so sections
/// declared by the header are never matched. Otherwise, the last
/// [`CERTIFICATE_REGION_SIZE`] bytes are checked.
pub fn split_certificate_region(data: &[u8]) -> RegionSplit<'_> {
    let (image, trailer) = match split_trailer(data) {
        Ok(s) => s,
        Err(e) => {
            debug!("Scanning unparsed data for certificate region: {e}");

            let (image, region) = match certificate::split_region(data) {
                Some((image, region)) => (image, Some(region)),
                None => (data, None),
            };

            return RegionSplit {
                image,
                region,
                rest: &[],
            };
        }
    };

    if trailer.len() >= CERTIFICATE_REGION_SIZE {
        let (region, rest) = trailer.split_at(CERTIFICATE_REGION_SIZE);

        if matches!(certificate::scan(region).next(), Some(Ok(_))) {
            return RegionSplit {
                image,
                region: Some(region),
                rest,
            };
        }
    }

    RegionSplit {
        image,
        region: None,
        rest: trailer,
    }
}

/// A complete boot or vendor boot image.
///
/// The size fields in the header are informational only. When writing, they
/// are recomputed from [`Self::sections`], along with the v1 recovery dtbo
/// offset and the v0-v2 image ID.
#[derive(Clone, PartialEq, Eq)]
pub struct BootImage {
    pub header: ImageHeader,
    pub sections: BTreeMap<SectionKind, Vec<u8>>,
    /// Data following the last section, such as a certificate region or an
    /// AVB footer.
    pub trailer: Vec<u8>,
}

impl fmt::Debug for BootImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImage")
            .field("header", &self.header)
            .field(
                "sections",
                &self
                    .sections
                    .iter()
                    .map(|(k, v)| (k, NumBytes(v.len())))
                    .collect::<BTreeMap<_, _>>(),
            )
            .field("trailer", &NumBytes(self.trailer.len()))
            .finish()
    }
}

impl BootImage {
    pub fn new(header: ImageHeader) -> Self {
        Self {
            header,
            sections: BTreeMap::new(),
            trailer: vec![],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = ImageHeader::from_bytes(data)?;
        let layout = header.layout()?;

        debug!(
            "Detected {} v{} image with page size {}",
            header.kind_name(),
            header.header_version(),
            layout.page_size(),
        );

        let mut sections = BTreeMap::new();

        for section in layout.iter() {
            trace!(
                "{} section: offset={}, size={}",
                section.kind, section.offset, section.size,
            );

            if matches!(
                section.kind,
                SectionKind::Header | SectionKind::VendorRamdiskTable,
            ) {
                continue;
            }

            let slice = usize::try_from(section.offset)
                .ok()
                .zip(usize::try_from(section.end()).ok())
                .and_then(|(start, end)| data.get(start..end))
                .ok_or(Error::TruncatedSection {
                    kind: section.kind,
                    offset: section.offset,
                    size: section.size,
                    image_size: data.len(),
                })?;

            sections.insert(section.kind, slice.to_vec());
        }

        let trailer = data[trailer_start(&layout, data.len())..].to_vec();

        if !trailer.is_empty() {
            debug!("Preserving {} bytes of trailing data", trailer.len());
        }

        Ok(Self {
            header,
            sections,
            trailer,
        })
    }

    pub fn section(&self, kind: SectionKind) -> &[u8] {
        self.sections
            .get(&kind)
            .map(|d| d.as_slice())
            .unwrap_or_default()
    }

    fn section_size(&self, kind: SectionKind) -> Result<u32> {
        u32::try_from(self.section(kind).len()).map_err(|_| Error::SectionTooLarge(kind))
    }

    /// SHA-1 digest of every v0-v2 section followed by its size, zero-padded
    /// to the size of the ID field.
    fn legacy_id(&self, header_version: u32) -> [u8; 32] {
        let mut kinds = vec![SectionKind::Kernel, SectionKind::Ramdisk, SectionKind::Second];
        if header_version >= 1 {
            kinds.push(SectionKind::RecoveryDtbo);
        }
        if header_version >= 2 {
            kinds.push(SectionKind::Dtb);
        }

        let mut context = Context::new(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY);

        for kind in kinds {
            let data = self.section(kind);
            context.update(data);
            context.update(&(data.len() as u32).to_le_bytes());
        }

        let digest = context.finish();
        let mut id = [0u8; 32];
        id[..digest.as_ref().len()].copy_from_slice(digest.as_ref());

        id
    }

    /// Return a copy of the header with all fields derived from the section
    /// data filled in.
    pub fn synced_header(&self) -> Result<ImageHeader> {
        let supported = self.header.data_sections();

        if let Some(kind) = self.sections.keys().find(|k| !supported.contains(k)) {
            return Err(Error::UnsupportedSection {
                kind: *kind,
                header_kind: self.header.kind_name(),
                version: self.header.header_version(),
            });
        }

        let mut header = self.header.clone();

        match &mut header {
            ImageHeader::Boot(BootHeader::V0Through2(h)) => {
                h.kernel_size = self.section_size(SectionKind::Kernel)?;
                h.ramdisk_size = self.section_size(SectionKind::Ramdisk)?;
                h.second_size = self.section_size(SectionKind::Second)?;

                if let Some(v1) = &mut h.v1_extra {
                    v1.recovery_dtbo_size = self.section_size(SectionKind::RecoveryDtbo)?;
                }
                if let Some(v2) = &mut h.v2_extra {
                    v2.dtb_size = self.section_size(SectionKind::Dtb)?;
                }

                let layout = h.layout()?;

                if let Some(v1) = &mut h.v1_extra {
                    v1.recovery_dtbo_offset = layout
                        .get(SectionKind::RecoveryDtbo)
                        .map_or(0, |s| s.offset);
                }

                let id = self.legacy_id(h.header_version());
                h.set_id_bytes(&id);
            }
            ImageHeader::Boot(BootHeader::V3Through4(h)) => {
                h.kernel_size = self.section_size(SectionKind::Kernel)?;
                h.ramdisk_size = self.section_size(SectionKind::Ramdisk)?;

                if let Some(v4) = &mut h.v4_extra {
                    v4.signature_size = self.section_size(SectionKind::BootSignature)?;
                }
            }
            ImageHeader::VendorBoot(h) => {
                h.vendor_ramdisk_size = self.section_size(SectionKind::VendorRamdisk)?;
                h.dtb_size = self.section_size(SectionKind::Dtb)?;

                if let Some(v4) = &mut h.v4_extra {
                    v4.bootconfig_size = self.section_size(SectionKind::VendorBootconfig)?;
                }
            }
        }

        Ok(header)
    }

    /// Recompute the header fields that are derived from the section data.
    pub fn sync_header(&mut self) -> Result<()> {
        self.header = self.synced_header()?;
        Ok(())
    }

    /// Collect the certificates from the v4 boot signature section or, if
    /// there is none, from a certificate region at the start of the trailer.
    pub fn certificates(&self) -> Result<CertificateBlock> {
        if let Some(data) = self.sections.get(&SectionKind::BootSignature) {
            return Ok(CertificateBlock::from_region(data)?);
        }

        if self.trailer.starts_with(&VBMETA_MAGIC) {
            let n = self.trailer.len().min(CERTIFICATE_REGION_SIZE);
            return Ok(CertificateBlock::from_region(&self.trailer[..n])?);
        }

        Ok(CertificateBlock::default())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = vec![];
        self.to_writer(&mut data)?;
        Ok(data)
    }
}

impl<R: Read> FromReader<R> for BootImage {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut data = vec![];
        reader
            .read_to_end(&mut data)
            .map_err(|e| Error::DataRead("Image::data", e))?;

        Self::from_bytes(&data)
    }
}

impl<W: Write> ToWriter<W> for BootImage {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        let header = self.synced_header()?;
        let layout = header.layout()?;

        let table = match &header {
            ImageHeader::VendorBoot(h) => h.table_to_bytes()?,
            ImageHeader::Boot(_) => vec![],
        };

        let header_data = header.to_bytes()?;
        let mut writer = CountingWriter::new(writer);

        for section in layout.iter() {
            writer
                .pad_to(section.offset)
                .map_err(|e| Error::DataWrite("Image::section_padding", e))?;

            let data: &[u8] = match section.kind {
                SectionKind::Header => &header_data,
                SectionKind::VendorRamdiskTable => &table,
                kind => self.section(kind),
            };

            trace!(
                "Writing {} section at offset {}: {:?}",
                section.kind,
                section.offset,
                NumBytes(data.len()),
            );

            writer
                .write_all(data)
                .map_err(|e| Error::DataWrite("Image::section", e))?;
        }

        writer
            .pad_to(layout.total_size())
            .map_err(|e| Error::DataWrite("Image::section_padding", e))?;

        if !self.trailer.is_empty() {
            if self.trailer.len() < CERTIFICATE_REGION_SIZE
                && self.trailer.starts_with(&VBMETA_MAGIC)
            {
                warn!("Trailing certificate region is smaller than expected");
            }

            writer
                .write_all(&self.trailer)
                .map_err(|e| Error::DataWrite("Image::trailer", e))?;
        }

        Ok(())
    }
}
