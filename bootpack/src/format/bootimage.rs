// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, mem};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::little_endian;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        cursor::{self, ByteReader, ByteWriter},
        layout::{self, SectionKind, SectionLayout},
    },
    util::{self, OutOfBoundsError},
};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;
pub const BOOT_EXTRA_ARGS_SIZE: usize = 1024;
pub const BOOT_V3_ARGS_SIZE: usize = BOOT_ARGS_SIZE + BOOT_EXTRA_ARGS_SIZE;

/// Fixed page size for v3 and newer boot images.
pub const PAGE_SIZE: u32 = 4096;

/// Offset of the header version field. Both the v0-v2 and v3+ layouts place it
/// at the same position.
pub const HEADER_VERSION_OFFSET: usize = 40;

/// Size of the boot signature region in v4 images.
pub const BOOT_SIGNATURE_SIZE: u32 = 16 * 1024;

/// Maximum size of any individual boot image component, like the kernel. This
/// limit is currently 64 MiB, which should be sufficient since there is no
/// known device where the entire boot image exceeds this size.
pub const COMPONENT_MAX_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    BadMagic([u8; 8]),
    #[error("Unsupported header version: {0}")]
    UnsupportedVersion(u32),
    #[error("{0:?} field is out of range")]
    FieldOutOfRange(&'static str, #[source] OutOfBoundsError),
    #[error("Page size must not be zero")]
    PageSizeZero,
    #[error("Invalid header size: {actual} != {expected}")]
    InvalidHeaderSize { expected: u32, actual: u32 },
    #[error("Failed to compute section layout")]
    Layout(#[from] layout::Error),
    #[error(transparent)]
    Cursor(#[from] cursor::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Fields shared by every header kind.
pub trait HeaderExt {
    fn header_version(&self) -> u32;

    fn header_size(&self) -> u32;

    fn page_size(&self) -> u32;
}

/// Packed OS version and security patch level.
///
/// The upper 21 bits hold the version as three 7-bit components. The lower 11
/// bits hold the patch level as a 7-bit year offset from 2000 and a 4-bit
/// month. Either half is zero when unset.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct OsVersionPatch(pub u32);

impl OsVersionPatch {
    const PATCH_LEVEL_BITS: u32 = 11;
    const PATCH_LEVEL_MASK: u32 = (1 << Self::PATCH_LEVEL_BITS) - 1;

    pub fn new(major: u32, minor: u32, patch: u32, year: u32, month: u32) -> Result<Self> {
        Self::default()
            .with_version(major, minor, patch)?
            .with_patch_level(year, month)
    }

    pub fn with_version(self, major: u32, minor: u32, patch: u32) -> Result<Self> {
        let major = util::check_bounds(major, ..=127)
            .map_err(|e| Error::FieldOutOfRange("os_version::major", e))?;
        let minor = util::check_bounds(minor, ..=127)
            .map_err(|e| Error::FieldOutOfRange("os_version::minor", e))?;
        let patch = util::check_bounds(patch, ..=127)
            .map_err(|e| Error::FieldOutOfRange("os_version::patch", e))?;

        let version = (major << 14) | (minor << 7) | patch;

        Ok(Self(
            (version << Self::PATCH_LEVEL_BITS) | (self.0 & Self::PATCH_LEVEL_MASK),
        ))
    }

    pub fn with_patch_level(self, year: u32, month: u32) -> Result<Self> {
        let year = util::check_bounds(year, 2000..=2127)
            .map_err(|e| Error::FieldOutOfRange("os_version::year", e))?;
        let month = util::check_bounds(month, 1..=12)
            .map_err(|e| Error::FieldOutOfRange("os_version::month", e))?;

        let level = ((year - 2000) << 4) | month;

        Ok(Self((self.0 & !Self::PATCH_LEVEL_MASK) | level))
    }

    /// Get the (major, minor, patch) version if set.
    pub fn version(self) -> Option<(u32, u32, u32)> {
        let v = self.0 >> Self::PATCH_LEVEL_BITS;
        if v == 0 {
            return None;
        }

        Some(((v >> 14) & 0x7f, (v >> 7) & 0x7f, v & 0x7f))
    }

    /// Get the (year, month) patch level if set.
    pub fn patch_level(self) -> Option<(u32, u32)> {
        let p = self.0 & Self::PATCH_LEVEL_MASK;
        if p == 0 {
            return None;
        }

        Some(((p >> 4) + 2000, p & 0xf))
    }
}

impl fmt::Debug for OsVersionPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self} ({:#x})", self.0)
    }
}

impl fmt::Display for OsVersionPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version() {
            Some((a, b, c)) => write!(f, "{a}.{b}.{c}")?,
            None => write!(f, "<no version>")?,
        }

        match self.patch_level() {
            Some((y, m)) => write!(f, " [{y:04}-{m:02}]"),
            None => write!(f, " [<no patch level>]"),
        }
    }
}

/// Read the header version of a boot image without validating anything else.
pub fn peek_header_version(data: &[u8]) -> Result<u32> {
    let mut reader = ByteReader::new(data);
    let magic = reader.read_array::<8>()?;
    if magic != BOOT_MAGIC {
        return Err(Error::BadMagic(magic));
    }

    reader.skip(HEADER_VERSION_OFFSET - magic.len())?;

    Ok(reader.read_u32()?)
}

fn check_component_size(field: &'static str, size: u32) -> Result<u32> {
    util::check_bounds(size, ..=COMPONENT_MAX_SIZE).map_err(|e| Error::FieldOutOfRange(field, e))
}

/// Raw on-disk layout for the v0 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV0 {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_size: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    second_size: little_endian::U32,
    second_addr: little_endian::U32,
    tags_addr: little_endian::U32,
    page_size: little_endian::U32,
    header_version: little_endian::U32,
    os_version: little_endian::U32,
    name: [u8; BOOT_NAME_SIZE],
    cmdline: [u8; BOOT_ARGS_SIZE],
    id: [little_endian::U32; 8],
    extra_cmdline: [u8; BOOT_EXTRA_ARGS_SIZE],
}

/// Raw on-disk layout for the extra v1 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV1Extra {
    recovery_dtbo_size: little_endian::U32,
    recovery_dtbo_offset: little_endian::U64,
    header_size: little_endian::U32,
}

/// Raw on-disk layout for the extra v2 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV2Extra {
    dtb_size: little_endian::U32,
    dtb_addr: little_endian::U64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct V1Extra {
    #[serde(skip)]
    pub recovery_dtbo_size: u32,
    #[serde(skip)]
    pub recovery_dtbo_offset: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct V2Extra {
    #[serde(skip)]
    pub dtb_size: u32,
    pub dtb_addr: u64,
}

/// Header for boot image versions 0 through 2. The version is determined by
/// which of the `v*_extra` fields are present.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct BootHeaderV0Through2 {
    #[serde(skip)]
    pub kernel_size: u32,
    pub kernel_addr: u32,
    #[serde(skip)]
    pub ramdisk_size: u32,
    pub ramdisk_addr: u32,
    #[serde(skip)]
    pub second_size: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub os_version: OsVersionPatch,
    pub name: String,
    pub cmdline: String,
    #[serde(skip)]
    pub id: [u32; 8],
    pub extra_cmdline: String,
    pub v1_extra: Option<V1Extra>,
    pub v2_extra: Option<V2Extra>,
}

impl fmt::Display for BootHeaderV0Through2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Boot image v{} header:", self.header_version())?;
        writeln!(f, "- Kernel size:          {}", self.kernel_size)?;
        writeln!(f, "- Kernel address:       {:#x}", self.kernel_addr)?;
        writeln!(f, "- Ramdisk size:         {}", self.ramdisk_size)?;
        writeln!(f, "- Ramdisk address:      {:#x}", self.ramdisk_addr)?;
        writeln!(f, "- Second stage size:    {}", self.second_size)?;
        writeln!(f, "- Second stage address: {:#x}", self.second_addr)?;
        writeln!(f, "- Kernel tags address:  {:#x}", self.tags_addr)?;
        writeln!(f, "- Page size:            {}", self.page_size)?;
        writeln!(f, "- OS version:           {}", self.os_version)?;
        writeln!(f, "- Name:                 {:?}", self.name)?;
        writeln!(f, "- Kernel cmdline:       {:?}", self.cmdline)?;
        writeln!(f, "- ID:                   {}", hex::encode(self.id_bytes()))?;
        write!(f, "- Extra kernel cmdline: {:?}", self.extra_cmdline)?;

        if let Some(v1) = &self.v1_extra {
            writeln!(f)?;
            writeln!(f, "- Recovery dtbo size:   {}", v1.recovery_dtbo_size)?;
            write!(f, "- Recovery dtbo offset: {}", v1.recovery_dtbo_offset)?;
        }

        if let Some(v2) = &self.v2_extra {
            writeln!(f)?;
            writeln!(f, "- Device tree size:     {}", v2.dtb_size)?;
            write!(f, "- Device tree address:  {:#x}", v2.dtb_addr)?;
        }

        Ok(())
    }
}

impl BootHeaderV0Through2 {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);

        let raw_v0 = reader.read_struct::<RawV0>()?;

        if raw_v0.magic != BOOT_MAGIC {
            return Err(Error::BadMagic(raw_v0.magic));
        }

        let header_version = raw_v0.header_version.get();
        if header_version > 2 {
            return Err(Error::UnsupportedVersion(header_version));
        }

        let kernel_size = check_component_size("Boot::V0::kernel_size", raw_v0.kernel_size.get())?;
        let ramdisk_size =
            check_component_size("Boot::V0::ramdisk_size", raw_v0.ramdisk_size.get())?;
        let second_size = check_component_size("Boot::V0::second_size", raw_v0.second_size.get())?;

        let page_size = raw_v0.page_size.get();
        if page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let name = cursor::decode_cstring("Boot::V0::name", &raw_v0.name)?;
        let cmdline = cursor::decode_cstring("Boot::V0::cmdline", &raw_v0.cmdline)?;
        let extra_cmdline =
            cursor::decode_cstring("Boot::V0::extra_cmdline", &raw_v0.extra_cmdline)?;

        let mut header_size = None;

        let v1_extra = if header_version >= 1 {
            let raw_v1 = reader.read_struct::<RawV1Extra>()?;

            header_size = Some(raw_v1.header_size.get());

            Some(V1Extra {
                recovery_dtbo_size: check_component_size(
                    "Boot::V1::recovery_dtbo_size",
                    raw_v1.recovery_dtbo_size.get(),
                )?,
                recovery_dtbo_offset: raw_v1.recovery_dtbo_offset.get(),
            })
        } else {
            None
        };

        let v2_extra = if header_version == 2 {
            let raw_v2 = reader.read_struct::<RawV2Extra>()?;

            Some(V2Extra {
                dtb_size: check_component_size("Boot::V2::dtb_size", raw_v2.dtb_size.get())?,
                dtb_addr: raw_v2.dtb_addr.get(),
            })
        } else {
            None
        };

        if let Some(size) = header_size {
            if reader.offset() != size as usize {
                return Err(Error::InvalidHeaderSize {
                    expected: reader.offset() as u32,
                    actual: size,
                });
            }
        }

        Ok(Self {
            kernel_size,
            kernel_addr: raw_v0.kernel_addr.get(),
            ramdisk_size,
            ramdisk_addr: raw_v0.ramdisk_addr.get(),
            second_size,
            second_addr: raw_v0.second_addr.get(),
            tags_addr: raw_v0.tags_addr.get(),
            page_size,
            os_version: OsVersionPatch(raw_v0.os_version.get()),
            name,
            cmdline,
            id: raw_v0.id.map(|id| id.get()),
            extra_cmdline,
            v1_extra,
            v2_extra,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        check_component_size("Boot::V0::kernel_size", self.kernel_size)?;
        check_component_size("Boot::V0::ramdisk_size", self.ramdisk_size)?;
        check_component_size("Boot::V0::second_size", self.second_size)?;

        if self.page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let mut writer = ByteWriter::new();

        let raw_v0 = RawV0 {
            magic: BOOT_MAGIC,
            kernel_size: self.kernel_size.into(),
            kernel_addr: self.kernel_addr.into(),
            ramdisk_size: self.ramdisk_size.into(),
            ramdisk_addr: self.ramdisk_addr.into(),
            second_size: self.second_size.into(),
            second_addr: self.second_addr.into(),
            tags_addr: self.tags_addr.into(),
            page_size: self.page_size.into(),
            header_version: self.header_version().into(),
            os_version: self.os_version.0.into(),
            name: cursor::encode_cstring("Boot::V0::name", &self.name)?,
            cmdline: cursor::encode_cstring("Boot::V0::cmdline", &self.cmdline)?,
            id: self.id.map(|id| id.into()),
            extra_cmdline: cursor::encode_cstring("Boot::V0::extra_cmdline", &self.extra_cmdline)?,
        };
        writer.write_struct(&raw_v0);

        if let Some(v1) = &self.v1_extra {
            check_component_size("Boot::V1::recovery_dtbo_size", v1.recovery_dtbo_size)?;

            writer.write_struct(&RawV1Extra {
                recovery_dtbo_size: v1.recovery_dtbo_size.into(),
                recovery_dtbo_offset: v1.recovery_dtbo_offset.into(),
                header_size: self.header_size().into(),
            });
        }

        if let Some(v2) = &self.v2_extra {
            check_component_size("Boot::V2::dtb_size", v2.dtb_size)?;

            writer.write_struct(&RawV2Extra {
                dtb_size: v2.dtb_size.into(),
                dtb_addr: v2.dtb_addr.into(),
            });
        }

        Ok(writer.into_inner())
    }

    /// Raw bytes of the legacy image ID.
    pub fn id_bytes(&self) -> [u8; 32] {
        let mut result = [0u8; 32];
        for (chunk, word) in result.chunks_exact_mut(4).zip(self.id) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        result
    }

    /// Set the legacy image ID from raw bytes. The ID is a digest stored as
    /// little-endian words.
    pub fn set_id_bytes(&mut self, data: &[u8; 32]) {
        for (word, chunk) in self.id.iter_mut().zip(data.chunks_exact(4)) {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(chunk);
            *word = u32::from_le_bytes(buf);
        }
    }

    /// Section sizes in on-disk order.
    pub fn sections(&self) -> Vec<(SectionKind, u64)> {
        let mut result = vec![
            (SectionKind::Kernel, self.kernel_size.into()),
            (SectionKind::Ramdisk, self.ramdisk_size.into()),
            (SectionKind::Second, self.second_size.into()),
        ];

        if let Some(v1) = &self.v1_extra {
            result.push((SectionKind::RecoveryDtbo, v1.recovery_dtbo_size.into()));
        }
        if let Some(v2) = &self.v2_extra {
            result.push((SectionKind::Dtb, v2.dtb_size.into()));
        }

        result
    }

    /// Compute the position of every section described by this header.
    pub fn layout(&self) -> Result<SectionLayout> {
        Ok(layout::plan(
            self.page_size,
            self.header_size(),
            &self.sections(),
        )?)
    }

    /// Switch to a different header version, adding or removing the
    /// version-specific fields.
    pub fn set_header_version(&mut self, version: u32) -> Result<()> {
        if version > 2 {
            return Err(Error::UnsupportedVersion(version));
        }

        if version >= 1 {
            self.v1_extra.get_or_insert_with(Default::default);
        } else {
            self.v1_extra = None;
        }

        if version == 2 {
            self.v2_extra.get_or_insert_with(Default::default);
        } else {
            self.v2_extra = None;
        }

        Ok(())
    }
}

impl HeaderExt for BootHeaderV0Through2 {
    fn header_version(&self) -> u32 {
        if self.v2_extra.is_some() {
            2
        } else if self.v1_extra.is_some() {
            1
        } else {
            0
        }
    }

    fn header_size(&self) -> u32 {
        let version = self.header_version();
        let mut size = mem::size_of::<RawV0>();

        if version >= 1 {
            size += mem::size_of::<RawV1Extra>();
        }
        if version == 2 {
            size += mem::size_of::<RawV2Extra>();
        }

        size as u32
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }
}

/// Raw on-disk layout for the v3 image header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV3 {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    ramdisk_size: little_endian::U32,
    os_version: little_endian::U32,
    header_size: little_endian::U32,
    reserved: [little_endian::U32; 4],
    header_version: little_endian::U32,
    cmdline: [u8; BOOT_V3_ARGS_SIZE],
}

/// Raw on-disk layout for the extra v4 image header fields.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawV4Extra {
    signature_size: little_endian::U32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct V4Extra {
    #[serde(skip)]
    pub signature_size: u32,
}

/// Header for boot image versions 3 and 4.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct BootHeaderV3Through4 {
    #[serde(skip)]
    pub kernel_size: u32,
    #[serde(skip)]
    pub ramdisk_size: u32,
    pub os_version: OsVersionPatch,
    pub reserved: [u32; 4],
    pub cmdline: String,
    pub v4_extra: Option<V4Extra>,
}

impl fmt::Display for BootHeaderV3Through4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Boot image v{} header:", self.header_version())?;
        writeln!(f, "- Kernel size:       {}", self.kernel_size)?;
        writeln!(f, "- Ramdisk size:      {}", self.ramdisk_size)?;
        writeln!(f, "- OS version:        {}", self.os_version)?;
        writeln!(f, "- Reserved:          {:?}", self.reserved)?;
        write!(f, "- Kernel cmdline:    {:?}", self.cmdline)?;

        if let Some(v4) = &self.v4_extra {
            writeln!(f)?;
            write!(f, "- Signature size:    {}", v4.signature_size)?;
        }

        Ok(())
    }
}

impl BootHeaderV3Through4 {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);

        let raw_v3 = reader.read_struct::<RawV3>()?;

        if raw_v3.magic != BOOT_MAGIC {
            return Err(Error::BadMagic(raw_v3.magic));
        }

        let header_version = raw_v3.header_version.get();
        if !(3..=4).contains(&header_version) {
            return Err(Error::UnsupportedVersion(header_version));
        }

        let kernel_size = check_component_size("Boot::V3::kernel_size", raw_v3.kernel_size.get())?;
        let ramdisk_size =
            check_component_size("Boot::V3::ramdisk_size", raw_v3.ramdisk_size.get())?;
        let cmdline = cursor::decode_cstring("Boot::V3::cmdline", &raw_v3.cmdline)?;

        let v4_extra = if header_version == 4 {
            let raw_v4 = reader.read_struct::<RawV4Extra>()?;

            let signature_size =
                util::check_bounds(raw_v4.signature_size.get(), ..=BOOT_SIGNATURE_SIZE)
                    .map_err(|e| Error::FieldOutOfRange("Boot::V4::signature_size", e))?;

            Some(V4Extra { signature_size })
        } else {
            None
        };

        let header_size = raw_v3.header_size.get();
        if reader.offset() != header_size as usize {
            return Err(Error::InvalidHeaderSize {
                expected: reader.offset() as u32,
                actual: header_size,
            });
        }

        Ok(Self {
            kernel_size,
            ramdisk_size,
            os_version: OsVersionPatch(raw_v3.os_version.get()),
            reserved: raw_v3.reserved.map(|r| r.get()),
            cmdline,
            v4_extra,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        check_component_size("Boot::V3::kernel_size", self.kernel_size)?;
        check_component_size("Boot::V3::ramdisk_size", self.ramdisk_size)?;

        let mut writer = ByteWriter::new();

        writer.write_struct(&RawV3 {
            magic: BOOT_MAGIC,
            kernel_size: self.kernel_size.into(),
            ramdisk_size: self.ramdisk_size.into(),
            os_version: self.os_version.0.into(),
            header_size: self.header_size().into(),
            reserved: self.reserved.map(|r| r.into()),
            header_version: self.header_version().into(),
            cmdline: cursor::encode_cstring("Boot::V3::cmdline", &self.cmdline)?,
        });

        if let Some(v4) = &self.v4_extra {
            util::check_bounds(v4.signature_size, ..=BOOT_SIGNATURE_SIZE)
                .map_err(|e| Error::FieldOutOfRange("Boot::V4::signature_size", e))?;

            writer.write_struct(&RawV4Extra {
                signature_size: v4.signature_size.into(),
            });
        }

        Ok(writer.into_inner())
    }

    /// Section sizes in on-disk order.
    pub fn sections(&self) -> Vec<(SectionKind, u64)> {
        let mut result = vec![
            (SectionKind::Kernel, self.kernel_size.into()),
            (SectionKind::Ramdisk, self.ramdisk_size.into()),
        ];

        if let Some(v4) = &self.v4_extra {
            result.push((SectionKind::BootSignature, v4.signature_size.into()));
        }

        result
    }

    pub fn layout(&self) -> Result<SectionLayout> {
        Ok(layout::plan(PAGE_SIZE, self.header_size(), &self.sections())?)
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

impl HeaderExt for BootHeaderV3Through4 {
    fn header_version(&self) -> u32 {
        if self.v4_extra.is_some() {
            4
        } else {
            3
        }
    }

    fn header_size(&self) -> u32 {
        let mut size = mem::size_of::<RawV3>();

        if self.v4_extra.is_some() {
            size += mem::size_of::<RawV4Extra>();
        }

        size as u32
    }

    fn page_size(&self) -> u32 {
        PAGE_SIZE
    }
}

/// A boot image header of any supported version.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum BootHeader {
    V0Through2(BootHeaderV0Through2),
    V3Through4(BootHeaderV3Through4),
}

impl BootHeader {
    /// Parse a boot image header. The header version is read first to
    /// determine which layout applies.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        match peek_header_version(data)? {
            0..=2 => BootHeaderV0Through2::from_bytes(data).map(Self::V0Through2),
            3..=4 => BootHeaderV3Through4::from_bytes(data).map(Self::V3Through4),
            v => Err(Error::UnsupportedVersion(v)),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::V0Through2(h) => h.to_bytes(),
            Self::V3Through4(h) => h.to_bytes(),
        }
    }

    pub fn os_version(&self) -> OsVersionPatch {
        match self {
            Self::V0Through2(h) => h.os_version,
            Self::V3Through4(h) => h.os_version,
        }
    }

    pub fn set_os_version(&mut self, value: OsVersionPatch) {
        match self {
            Self::V0Through2(h) => h.os_version = value,
            Self::V3Through4(h) => h.os_version = value,
        }
    }

    pub fn layout(&self) -> Result<SectionLayout> {
        match self {
            Self::V0Through2(h) => h.layout(),
            Self::V3Through4(h) => h.layout(),
        }
    }

    /// Switch to a different header version within the same layout family.
    pub fn set_header_version(&mut self, version: u32) -> Result<()> {
        match self {
            Self::V0Through2(h) => h.set_header_version(version),
            Self::V3Through4(h) => h.set_header_version(version),
        }
    }
}

impl fmt::Display for BootHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V0Through2(h) => h.fmt(f),
            Self::V3Through4(h) => h.fmt(f),
        }
    }
}

impl HeaderExt for BootHeader {
    fn header_version(&self) -> u32 {
        match self {
            Self::V0Through2(h) => h.header_version(),
            Self::V3Through4(h) => h.header_version(),
        }
    }

    fn header_size(&self) -> u32 {
        match self {
            Self::V0Through2(h) => h.header_size(),
            Self::V3Through4(h) => h.header_size(),
        }
    }

    fn page_size(&self) -> u32 {
        match self {
            Self::V0Through2(h) => h.page_size(),
            Self::V3Through4(h) => h.page_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_sizes() {
        assert_eq!(mem::size_of::<RawV0>(), 1632);
        assert_eq!(mem::size_of::<RawV0>() + mem::size_of::<RawV1Extra>(), 1648);
        assert_eq!(
            mem::size_of::<RawV0>() + mem::size_of::<RawV1Extra>() + mem::size_of::<RawV2Extra>(),
            1660,
        );
        assert_eq!(mem::size_of::<RawV3>(), 1580);
        assert_eq!(mem::size_of::<RawV3>() + mem::size_of::<RawV4Extra>(), 1584);
    }

    #[test]
    fn id_bytes_are_little_endian_words() {
        let mut header = BootHeaderV0Through2::default();
        let mut data = [0u8; 32];
        data[0] = 0x78;
        data[1] = 0x56;
        data[2] = 0x34;
        data[3] = 0x12;
        data[31] = 0xff;

        header.set_id_bytes(&data);
        assert_eq!(header.id[0], 0x12345678);
        assert_eq!(header.id[7], 0xff000000);
        assert_eq!(header.id_bytes(), data);
    }
}
