// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, mem};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::little_endian;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        bootimage::{COMPONENT_MAX_SIZE, HeaderExt},
        cursor::{self, ByteReader, ByteWriter},
        layout::{self, SectionKind, SectionLayout},
    },
    util::{self, OutOfBoundsError},
};

pub const VENDOR_BOOT_MAGIC: [u8; 8] = *b"VNDRBOOT";
pub const VENDOR_BOOT_ARGS_SIZE: usize = 2048;
pub const VENDOR_BOOT_NAME_SIZE: usize = 16;

pub const VENDOR_RAMDISK_NAME_SIZE: usize = 32;
pub const VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE: usize = 16;
pub const VENDOR_RAMDISK_TABLE_ENTRY_SIZE: u32 = 108;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    BadMagic([u8; 8]),
    #[error("Unsupported header version: {0}")]
    UnsupportedVersion(u32),
    #[error("{0:?} field is out of range")]
    FieldOutOfRange(&'static str, #[source] OutOfBoundsError),
    #[error("{0:?} overflowed integer bounds during calculations")]
    IntOverflow(&'static str),
    #[error("Page size must not be zero")]
    PageSizeZero,
    #[error("Invalid header size: {actual} != {expected}")]
    InvalidHeaderSize { expected: u32, actual: u32 },
    #[error(
        "Ramdisk table size {table_size} does not match {entry_count} entries of {entry_size} bytes"
    )]
    TableSizeMismatch {
        table_size: u32,
        entry_size: u32,
        entry_count: u32,
    },
    #[error("Unsupported ramdisk table entry size: {0}")]
    UnsupportedEntrySize(u32),
    #[error("Ramdisk table entry [{index}] offset is {actual}, but should be {expected}")]
    EntryOffsetMismatch {
        index: usize,
        expected: u32,
        actual: u32,
    },
    #[error("Total ramdisk table size {actual} != vendor ramdisk size {expected}")]
    RamdiskSizeMismatch { expected: u32, actual: u32 },
    #[error("Board ID index {index} is out of range (0..{len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Failed to compute section layout")]
    Layout(#[from] layout::Error),
    #[error(transparent)]
    Cursor(#[from] cursor::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn check_component_size(field: &'static str, size: u32) -> Result<u32> {
    util::check_bounds(size, ..=COMPONENT_MAX_SIZE).map_err(|e| Error::FieldOutOfRange(field, e))
}

/// Raw on-disk layout for the vendor v3 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV3 {
    /// Magic value. This should be equal to [`VENDOR_BOOT_MAGIC`].
    magic: [u8; 8],
    header_version: little_endian::U32,
    page_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    vendor_ramdisk_size: little_endian::U32,
    cmdline: [u8; VENDOR_BOOT_ARGS_SIZE],
    tags_addr: little_endian::U32,
    name: [u8; VENDOR_BOOT_NAME_SIZE],
    header_size: little_endian::U32,
    dtb_size: little_endian::U32,
    dtb_addr: little_endian::U64,
}

/// Raw on-disk layout for the extra vendor v4 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV4Extra {
    vendor_ramdisk_table_size: little_endian::U32,
    vendor_ramdisk_table_entry_num: little_endian::U32,
    vendor_ramdisk_table_entry_size: little_endian::U32,
    bootconfig_size: little_endian::U32,
}

/// Raw on-disk layout for the vendor v4 ramdisk table entry.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawVendorV4RamdiskTableEntry {
    ramdisk_size: little_endian::U32,
    ramdisk_offset: little_endian::U32,
    ramdisk_type: little_endian::U32,
    ramdisk_name: [u8; VENDOR_RAMDISK_NAME_SIZE],
    board_id: [little_endian::U32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RamdiskType {
    #[default]
    None,
    Platform,
    Recovery,
    Dlkm,
    #[serde(untagged)]
    Unknown(u32),
}

impl RamdiskType {
    pub fn from_raw(value: u32) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Platform,
            2 => Self::Recovery,
            3 => Self::Dlkm,
            v => Self::Unknown(v),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Platform => 1,
            Self::Recovery => 2,
            Self::Dlkm => 3,
            Self::Unknown(v) => v,
        }
    }

    /// Look up a type by its lowercase name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "platform" => Some(Self::Platform),
            "recovery" => Some(Self::Recovery),
            "dlkm" => Some(Self::Dlkm),
            _ => None,
        }
    }

    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::None => Some("none"),
            Self::Platform => Some("platform"),
            Self::Recovery => Some("recovery"),
            Self::Dlkm => Some("dlkm"),
            Self::Unknown(_) => None,
        }
    }
}

/// One ramdisk fragment in a vendor v4 image. The offset is relative to the
/// start of the vendor ramdisk section.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct RamdiskTableEntry {
    #[serde(skip)]
    pub ramdisk_size: u32,
    #[serde(skip)]
    pub ramdisk_offset: u32,
    pub ramdisk_type: RamdiskType,
    pub ramdisk_name: String,
    pub board_id: [u32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
}

impl RamdiskTableEntry {
    pub fn get_board_id(&self, index: usize) -> Result<u32> {
        self.board_id
            .get(index)
            .copied()
            .ok_or(Error::IndexOutOfRange {
                index,
                len: self.board_id.len(),
            })
    }

    pub fn set_board_id(&mut self, index: usize, value: u32) -> Result<()> {
        let len = self.board_id.len();
        let item = self
            .board_id
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange { index, len })?;
        *item = value;

        Ok(())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct VendorV4Extra {
    pub ramdisk_table: Vec<RamdiskTableEntry>,
    #[serde(skip)]
    pub bootconfig_size: u32,
}

/// Header for vendor boot image versions 3 and 4.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct VendorBootHeader {
    pub page_size: u32,
    pub kernel_addr: u32,
    pub ramdisk_addr: u32,
    #[serde(skip)]
    pub vendor_ramdisk_size: u32,
    pub cmdline: String,
    pub tags_addr: u32,
    pub name: String,
    #[serde(skip)]
    pub dtb_size: u32,
    pub dtb_addr: u64,
    pub v4_extra: Option<VendorV4Extra>,
}

impl fmt::Display for VendorBootHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Vendor boot image v{} header:", self.header_version())?;
        writeln!(f, "- Page size:           {}", self.page_size)?;
        writeln!(f, "- Kernel address:      {:#x}", self.kernel_addr)?;
        writeln!(f, "- Ramdisk address:     {:#x}", self.ramdisk_addr)?;
        writeln!(f, "- Vendor ramdisk size: {}", self.vendor_ramdisk_size)?;
        writeln!(f, "- Vendor cmdline:      {:?}", self.cmdline)?;
        writeln!(f, "- Kernel tags address: {:#x}", self.tags_addr)?;
        writeln!(f, "- Name:                {:?}", self.name)?;
        writeln!(f, "- Device tree size:    {}", self.dtb_size)?;
        write!(f, "- Device tree address: {:#x}", self.dtb_addr)?;

        if let Some(v4) = &self.v4_extra {
            for (i, entry) in v4.ramdisk_table.iter().enumerate() {
                writeln!(f)?;
                writeln!(f, "- Ramdisk [{i}]:")?;
                writeln!(f, "  - Size:     {}", entry.ramdisk_size)?;
                writeln!(f, "  - Offset:   {}", entry.ramdisk_offset)?;
                writeln!(f, "  - Type:     {:?}", entry.ramdisk_type)?;
                writeln!(f, "  - Name:     {:?}", entry.ramdisk_name)?;
                write!(f, "  - Board ID: {:?}", entry.board_id)?;
            }

            writeln!(f)?;
            write!(f, "- Bootconfig size:     {}", v4.bootconfig_size)?;
        }

        Ok(())
    }
}

impl VendorBootHeader {
    /// Parse a vendor boot image header. For v4 images with a non-empty ramdisk
    /// table, `data` must extend through the table section.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);

        let raw_v3 = reader.read_struct::<RawVendorV3>()?;

        if raw_v3.magic != VENDOR_BOOT_MAGIC {
            return Err(Error::BadMagic(raw_v3.magic));
        }

        let header_version = raw_v3.header_version.get();
        if !(3..=4).contains(&header_version) {
            return Err(Error::UnsupportedVersion(header_version));
        }

        let page_size = raw_v3.page_size.get();
        if page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let mut header = Self {
            page_size,
            kernel_addr: raw_v3.kernel_addr.get(),
            ramdisk_addr: raw_v3.ramdisk_addr.get(),
            vendor_ramdisk_size: check_component_size(
                "Vendor::V3::vendor_ramdisk_size",
                raw_v3.vendor_ramdisk_size.get(),
            )?,
            cmdline: cursor::decode_cstring("Vendor::V3::cmdline", &raw_v3.cmdline)?,
            tags_addr: raw_v3.tags_addr.get(),
            name: cursor::decode_cstring("Vendor::V3::name", &raw_v3.name)?,
            dtb_size: check_component_size("Vendor::V3::dtb_size", raw_v3.dtb_size.get())?,
            dtb_addr: raw_v3.dtb_addr.get(),
            v4_extra: None,
        };

        let mut table_info = None;

        if header_version == 4 {
            let raw_v4 = reader.read_struct::<RawVendorV4Extra>()?;

            let table_size = raw_v4.vendor_ramdisk_table_size.get();
            let entry_count = raw_v4.vendor_ramdisk_table_entry_num.get();
            let entry_size = raw_v4.vendor_ramdisk_table_entry_size.get();

            let mismatch = Error::TableSizeMismatch {
                table_size,
                entry_size,
                entry_count,
            };

            if entry_size == 0 {
                return Err(Error::UnsupportedEntrySize(entry_size));
            } else if table_size % entry_size != 0 || table_size / entry_size != entry_count {
                return Err(mismatch);
            } else if entry_size != VENDOR_RAMDISK_TABLE_ENTRY_SIZE {
                return Err(Error::UnsupportedEntrySize(entry_size));
            }

            header.v4_extra = Some(VendorV4Extra {
                ramdisk_table: vec![],
                bootconfig_size: check_component_size(
                    "Vendor::V4::bootconfig_size",
                    raw_v4.bootconfig_size.get(),
                )?,
            });

            table_info = Some((table_size, entry_count));
        }

        let header_size = raw_v3.header_size.get();
        if reader.offset() != header_size as usize {
            return Err(Error::InvalidHeaderSize {
                expected: reader.offset() as u32,
                actual: header_size,
            });
        }

        if let Some((table_size, entry_count)) = table_info {
            let layout = layout::plan(
                page_size,
                header_size,
                &header.sections_with_table_size(table_size.into()),
            )?;

            let mut table = vec![];

            if let Some(section) = layout.get(SectionKind::VendorRamdiskTable) {
                let mut reader = ByteReader::new(data);
                reader.skip(section.offset as usize)?;

                for _ in 0..entry_count {
                    let raw = reader.read_struct::<RawVendorV4RamdiskTableEntry>()?;

                    table.push(RamdiskTableEntry {
                        ramdisk_size: raw.ramdisk_size.get(),
                        ramdisk_offset: raw.ramdisk_offset.get(),
                        ramdisk_type: RamdiskType::from_raw(raw.ramdisk_type.get()),
                        ramdisk_name: cursor::decode_cstring(
                            "Vendor::V4::ramdisk_name",
                            &raw.ramdisk_name,
                        )?,
                        board_id: raw.board_id.map(|id| id.get()),
                    });
                }
            }

            if let Some(v4) = &mut header.v4_extra {
                v4.ramdisk_table = table;
            }

            header.validate_table()?;
        }

        Ok(header)
    }

    /// Serialize the fixed-size header. The ramdisk table is a separate
    /// section. See [`Self::table_to_bytes`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        check_component_size("Vendor::V3::vendor_ramdisk_size", self.vendor_ramdisk_size)?;
        check_component_size("Vendor::V3::dtb_size", self.dtb_size)?;

        let mut writer = ByteWriter::new();

        writer.write_struct(&RawVendorV3 {
            magic: VENDOR_BOOT_MAGIC,
            header_version: self.header_version().into(),
            page_size: self.page_size.into(),
            kernel_addr: self.kernel_addr.into(),
            ramdisk_addr: self.ramdisk_addr.into(),
            vendor_ramdisk_size: self.vendor_ramdisk_size.into(),
            cmdline: cursor::encode_cstring("Vendor::V3::cmdline", &self.cmdline)?,
            tags_addr: self.tags_addr.into(),
            name: cursor::encode_cstring("Vendor::V3::name", &self.name)?,
            header_size: self.header_size().into(),
            dtb_size: self.dtb_size.into(),
            dtb_addr: self.dtb_addr.into(),
        });

        if let Some(v4) = &self.v4_extra {
            self.validate_table()?;
            check_component_size("Vendor::V4::bootconfig_size", v4.bootconfig_size)?;

            writer.write_struct(&RawVendorV4Extra {
                vendor_ramdisk_table_size: self.table_size()?.into(),
                vendor_ramdisk_table_entry_num: (v4.ramdisk_table.len() as u32).into(),
                vendor_ramdisk_table_entry_size: VENDOR_RAMDISK_TABLE_ENTRY_SIZE.into(),
                bootconfig_size: v4.bootconfig_size.into(),
            });
        }

        Ok(writer.into_inner())
    }

    /// Serialize the ramdisk table section. This is empty for v3 images.
    pub fn table_to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = ByteWriter::new();

        if let Some(v4) = &self.v4_extra {
            for entry in &v4.ramdisk_table {
                writer.write_struct(&RawVendorV4RamdiskTableEntry {
                    ramdisk_size: entry.ramdisk_size.into(),
                    ramdisk_offset: entry.ramdisk_offset.into(),
                    ramdisk_type: entry.ramdisk_type.to_raw().into(),
                    ramdisk_name: cursor::encode_cstring(
                        "Vendor::V4::ramdisk_name",
                        &entry.ramdisk_name,
                    )?,
                    board_id: entry.board_id.map(|id| id.into()),
                });
            }
        }

        Ok(writer.into_inner())
    }

    /// Size of the ramdisk table section in bytes.
    pub fn table_size(&self) -> Result<u32> {
        let count = self.v4_extra.as_ref().map_or(0, |v4| v4.ramdisk_table.len());

        u32::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(VENDOR_RAMDISK_TABLE_ENTRY_SIZE))
            .ok_or(Error::IntOverflow("Vendor::V4::vendor_ramdisk_table_size"))
    }

    /// Append a ramdisk fragment to the v4 ramdisk table. The fragment is
    /// placed after all existing fragments and the total vendor ramdisk size
    /// is updated to match.
    pub fn add_ramdisk(
        &mut self,
        size: u32,
        ramdisk_type: RamdiskType,
        name: &str,
        board_id: [u32; VENDOR_RAMDISK_TABLE_ENTRY_BOARD_ID_SIZE],
    ) -> Result<&mut RamdiskTableEntry> {
        let version = self.header_version();
        let Some(v4) = &mut self.v4_extra else {
            return Err(Error::UnsupportedVersion(version));
        };

        cursor::encode_cstring::<VENDOR_RAMDISK_NAME_SIZE>("Vendor::V4::ramdisk_name", name)?;

        let offset = v4
            .ramdisk_table
            .iter()
            .try_fold(0u32, |total, e| total.checked_add(e.ramdisk_size))
            .ok_or(Error::IntOverflow("Vendor::V4::ramdisk_offset"))?;
        let total = offset
            .checked_add(size)
            .ok_or(Error::IntOverflow("Vendor::V3::vendor_ramdisk_size"))?;
        check_component_size("Vendor::V3::vendor_ramdisk_size", total)?;

        v4.ramdisk_table.push(RamdiskTableEntry {
            ramdisk_size: size,
            ramdisk_offset: offset,
            ramdisk_type,
            ramdisk_name: name.to_owned(),
            board_id,
        });
        self.vendor_ramdisk_size = total;

        let index = v4.ramdisk_table.len() - 1;
        Ok(&mut v4.ramdisk_table[index])
    }

    /// Recompute each table entry's offset from the sizes of the preceding
    /// entries and set the vendor ramdisk size to their sum.
    pub fn update_ramdisk_offsets(&mut self) -> Result<()> {
        let Some(v4) = &mut self.v4_extra else {
            return Ok(());
        };
        if v4.ramdisk_table.is_empty() {
            return Ok(());
        }

        let mut offset = 0u32;

        for entry in &mut v4.ramdisk_table {
            entry.ramdisk_offset = offset;
            offset = offset
                .checked_add(entry.ramdisk_size)
                .ok_or(Error::IntOverflow("Vendor::V4::ramdisk_offset"))?;
        }

        self.vendor_ramdisk_size = offset;

        Ok(())
    }

    /// Ensure that table entries are contiguous and cover the entire vendor
    /// ramdisk section.
    fn validate_table(&self) -> Result<()> {
        let Some(v4) = &self.v4_extra else {
            return Ok(());
        };
        if v4.ramdisk_table.is_empty() {
            return Ok(());
        }

        let mut offset = 0u32;

        for (index, entry) in v4.ramdisk_table.iter().enumerate() {
            if entry.ramdisk_offset != offset {
                return Err(Error::EntryOffsetMismatch {
                    index,
                    expected: offset,
                    actual: entry.ramdisk_offset,
                });
            }

            offset = offset
                .checked_add(entry.ramdisk_size)
                .ok_or(Error::IntOverflow("Vendor::V4::ramdisk_offset"))?;
        }

        if offset != self.vendor_ramdisk_size {
            return Err(Error::RamdiskSizeMismatch {
                expected: self.vendor_ramdisk_size,
                actual: offset,
            });
        }

        Ok(())
    }

    fn sections_with_table_size(&self, table_size: u64) -> Vec<(SectionKind, u64)> {
        let mut result = vec![
            (SectionKind::VendorRamdisk, self.vendor_ramdisk_size.into()),
            (SectionKind::Dtb, self.dtb_size.into()),
        ];

        if let Some(v4) = &self.v4_extra {
            result.push((SectionKind::VendorRamdiskTable, table_size));
            result.push((SectionKind::VendorBootconfig, v4.bootconfig_size.into()));
        }

        result
    }

    /// Section sizes in on-disk order.
    pub fn sections(&self) -> Result<Vec<(SectionKind, u64)>> {
        Ok(self.sections_with_table_size(self.table_size()?.into()))
    }

    /// Compute the position of every section described by this header.
    pub fn layout(&self) -> Result<SectionLayout> {
        Ok(layout::plan(
            self.page_size,
            self.header_size(),
            &self.sections()?,
        )?)
    }

    pub fn set_header_version(&mut self, version: u32) -> Result<()> {
        match version {
            3 => self.v4_extra = None,
            4 => {
                self.v4_extra.get_or_insert_with(Default::default);
            }
            v => return Err(Error::UnsupportedVersion(v)),
        }

        Ok(())
    }
}

impl HeaderExt for VendorBootHeader {
    fn header_version(&self) -> u32 {
        if self.v4_extra.is_some() {
            4
        } else {
            3
        }
    }

    fn header_size(&self) -> u32 {
        let mut size = mem::size_of::<RawVendorV3>();

        if self.v4_extra.is_some() {
            size += mem::size_of::<RawVendorV4Extra>();
        }

        size as u32
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_sizes() {
        assert_eq!(mem::size_of::<RawVendorV3>(), 2112);
        assert_eq!(
            mem::size_of::<RawVendorV3>() + mem::size_of::<RawVendorV4Extra>(),
            2128,
        );
        assert_eq!(
            mem::size_of::<RawVendorV4RamdiskTableEntry>(),
            VENDOR_RAMDISK_TABLE_ENTRY_SIZE as usize,
        );
    }

    #[test]
    fn ramdisk_type_names() {
        assert_eq!(RamdiskType::from_name("DLKM"), Some(RamdiskType::Dlkm));
        assert_eq!(RamdiskType::from_name("bogus"), None);
        assert_eq!(RamdiskType::from_raw(7), RamdiskType::Unknown(7));
        assert_eq!(RamdiskType::Unknown(7).to_raw(), 7);
        assert_eq!(RamdiskType::Recovery.name(), Some("recovery"));
    }
}
