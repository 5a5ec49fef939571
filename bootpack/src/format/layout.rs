// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::padding;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Page size must not be zero")]
    PageSizeZero,
    #[error("{0} section overflowed integer bounds during calculations")]
    IntOverflow(SectionKind),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Header,
    Kernel,
    Ramdisk,
    Second,
    RecoveryDtbo,
    Dtb,
    BootSignature,
    VendorRamdisk,
    VendorRamdiskTable,
    VendorBootconfig,
}

impl SectionKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Kernel => "kernel",
            Self::Ramdisk => "ramdisk",
            Self::Second => "second",
            Self::RecoveryDtbo => "recovery_dtbo",
            Self::Dtb => "dtb",
            Self::BootSignature => "boot_signature",
            Self::VendorRamdisk => "vendor_ramdisk",
            Self::VendorRamdiskTable => "vendor_ramdisk_table",
            Self::VendorBootconfig => "vendor_bootconfig",
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Position of one section within an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    pub offset: u64,
    pub size: u64,
}

impl Section {
    /// Offset of the first byte after this section's data, excluding padding.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Page-aligned positions of every non-empty section in an image, in on-disk
/// order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionLayout {
    page_size: u32,
    sections: Vec<Section>,
    total_size: u64,
}

impl SectionLayout {
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn get(&self, kind: SectionKind) -> Option<&Section> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Size of the image, including the padding after the last section.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

/// Round `n` up to the next multiple of `page_size`.
pub fn page_align(n: u64, page_size: u32) -> Option<u64> {
    if page_size == 0 {
        return None;
    }

    padding::round(n, page_size.into())
}

/// Lay out sections back to back, each starting on a page boundary.
///
/// The header always occupies the first slot and is padded to the page size.
/// Sections with a size of zero are not assigned a slot.
pub fn plan(
    page_size: u32,
    header_size: u32,
    sections: &[(SectionKind, u64)],
) -> Result<SectionLayout> {
    if page_size == 0 {
        return Err(Error::PageSizeZero);
    }

    let header_size = u64::from(header_size);
    let mut result = Vec::with_capacity(sections.len() + 1);
    let mut offset = page_align(header_size.max(1), page_size)
        .ok_or(Error::IntOverflow(SectionKind::Header))?;

    result.push(Section {
        kind: SectionKind::Header,
        offset: 0,
        size: offset,
    });

    for &(kind, size) in sections {
        if size == 0 {
            continue;
        }

        result.push(Section { kind, offset, size });

        offset = page_align(size, page_size)
            .and_then(|s| offset.checked_add(s))
            .ok_or(Error::IntOverflow(kind))?;
    }

    Ok(SectionLayout {
        page_size,
        sections: result,
        total_size: offset,
    })
}
