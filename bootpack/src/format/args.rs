// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Conversion between image headers and the option/value pairs accepted by an
//! external image packer. Addresses are captured as offsets from a base of
//! zero so that replaying the options reproduces the original addresses.

use std::{collections::BTreeMap, sync::LazyLock};

use num_traits::Num;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::{
    bootimage::{self, BOOT_ARGS_SIZE, BootHeader, HeaderExt, OsVersionPatch},
    image::ImageHeader,
    vendorboot,
};

/// Load address base assumed by the packer when `base` is not given.
pub const DEFAULT_BASE: u32 = 0x10000000;

/// Page sizes accepted by the `pagesize` option.
pub const PAGE_SIZES: [u32; 4] = [2048, 4096, 8192, 16384];

static OS_VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,3})(?:\.(\d{1,3})(?:\.(\d{1,3}))?)?$").unwrap());
static OS_PATCH_LEVEL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})(?:-(\d{2}))?$").unwrap());

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown option: {0:?}")]
    UnknownOption(String),
    #[error("Invalid value for {option:?}: {value:?}: {reason}")]
    InvalidValue {
        option: String,
        value: String,
        reason: &'static str,
    },
    #[error("Cannot change {header_kind} v{from} header to v{to}")]
    UnsupportedVersion {
        header_kind: &'static str,
        from: u32,
        to: u32,
    },
    #[error("Boot image header error")]
    Boot(#[from] bootimage::Error),
    #[error("Vendor boot image header error")]
    VendorBoot(#[from] vendorboot::Error),
}

type Result<T> = std::result::Result<T, Error>;

const BOOT_V0_OPTIONS: &[&str] = &[
    "base",
    "board",
    "cmdline",
    "header_version",
    "kernel_offset",
    "os_patch_level",
    "os_version",
    "pagesize",
    "ramdisk_offset",
    "second_offset",
    "tags_offset",
];
const BOOT_V2_OPTIONS: &[&str] = &["dtb_offset"];
const BOOT_V3_OPTIONS: &[&str] = &["cmdline", "header_version", "os_patch_level", "os_version"];
const VENDOR_OPTIONS: &[&str] = &[
    "base",
    "board",
    "dtb_offset",
    "header_version",
    "kernel_offset",
    "pagesize",
    "ramdisk_offset",
    "tags_offset",
    "vendor_cmdline",
];

/// Options understood for a particular header.
pub fn known_options(header: &ImageHeader) -> Vec<&'static str> {
    let mut result = match header {
        ImageHeader::Boot(BootHeader::V0Through2(_)) => BOOT_V0_OPTIONS.to_vec(),
        ImageHeader::Boot(BootHeader::V3Through4(_)) => BOOT_V3_OPTIONS.to_vec(),
        ImageHeader::VendorBoot(_) => VENDOR_OPTIONS.to_vec(),
    };

    if let ImageHeader::Boot(BootHeader::V0Through2(h)) = header {
        if h.v2_extra.is_some() {
            result.extend_from_slice(BOOT_V2_OPTIONS);
        }
    }

    result.sort_unstable();
    result
}

fn invalid(option: &str, value: &str, reason: &'static str) -> Error {
    Error::InvalidValue {
        option: option.to_owned(),
        value: value.to_owned(),
        reason,
    }
}

/// Parse an integer with an optional `0x` prefix.
fn parse_int<T: Num>(option: &str, value: &str) -> Result<T> {
    let (digits, radix) = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (value, 10),
    };

    T::from_str_radix(digits, radix).map_err(|_| invalid(option, value, "Not a valid integer"))
}

fn parse_os_version(option: &str, value: &str) -> Result<(u32, u32, u32)> {
    let captures = OS_VERSION_REGEX
        .captures(value)
        .ok_or_else(|| invalid(option, value, "Expected A[.B[.C]]"))?;

    let mut parts = [0u32; 3];
    for (part, capture) in parts.iter_mut().zip(captures.iter().skip(1)) {
        if let Some(m) = capture {
            *part = parse_int(option, m.as_str())?;
        }
    }

    Ok((parts[0], parts[1], parts[2]))
}

fn parse_os_patch_level(option: &str, value: &str) -> Result<(u32, u32)> {
    let captures = OS_PATCH_LEVEL_REGEX
        .captures(value)
        .ok_or_else(|| invalid(option, value, "Expected YYYY-MM[-DD]"))?;

    // The day is accepted but not stored.
    let year = parse_int(option, &captures[1])?;
    let month = parse_int(option, &captures[2])?;

    Ok((year, month))
}

/// Split a combined command line into the primary and extra fields of a v0-v2
/// header. The primary field keeps one byte for the NUL terminator.
fn split_cmdline(cmdline: &str) -> (&str, &str) {
    let mut index = cmdline.len().min(BOOT_ARGS_SIZE - 1);
    while !cmdline.is_char_boundary(index) {
        index -= 1;
    }

    cmdline.split_at(index)
}

/// Packer options captured from an image header, keyed by option name without
/// the leading `--`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ArgumentMap(pub BTreeMap<String, String>);

impl ArgumentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn get_int<T: Num>(&self, key: &str) -> Result<Option<T>> {
        self.get(key).map(|v| parse_int(key, v)).transpose()
    }

    fn get_page_size(&self) -> Result<Option<u32>> {
        let Some(page_size) = self.get_int::<u32>("pagesize")? else {
            return Ok(None);
        };

        if !PAGE_SIZES.contains(&page_size) {
            return Err(invalid(
                "pagesize",
                self.get("pagesize").unwrap_or_default(),
                "Page size must be 2048, 4096, 8192, or 16384",
            ));
        }

        Ok(Some(page_size))
    }

    fn get_addr(&self, key: &str, base: u32) -> Result<Option<u32>> {
        let Some(offset) = self.get_int::<u32>(key)? else {
            return Ok(None);
        };

        base.checked_add(offset)
            .map(Some)
            .ok_or_else(|| invalid(key, self.get(key).unwrap_or_default(), "Address overflow"))
    }

    fn get_addr64(&self, key: &str, base: u32) -> Result<Option<u64>> {
        let Some(offset) = self.get_int::<u64>(key)? else {
            return Ok(None);
        };

        u64::from(base)
            .checked_add(offset)
            .map(Some)
            .ok_or_else(|| invalid(key, self.get(key).unwrap_or_default(), "Address overflow"))
    }

    fn capture_os_version(&mut self, os_version: OsVersionPatch) {
        if let Some((a, b, c)) = os_version.version() {
            self.insert("os_version", format!("{a}.{b}.{c}"));
        }
        if let Some((y, m)) = os_version.patch_level() {
            self.insert("os_patch_level", format!("{y:04}-{m:02}"));
        }
    }

    fn apply_os_version(&self, mut os_version: OsVersionPatch) -> Result<OsVersionPatch> {
        if let Some(value) = self.get("os_version") {
            let (a, b, c) = parse_os_version("os_version", value)?;
            os_version = os_version.with_version(a, b, c)?;
        }
        if let Some(value) = self.get("os_patch_level") {
            let (y, m) = parse_os_patch_level("os_patch_level", value)?;
            os_version = os_version.with_patch_level(y, m)?;
        }

        Ok(os_version)
    }

    /// Capture every packer option that describes `header`.
    pub fn capture(header: &ImageHeader) -> Self {
        let mut result = Self::new();

        result.insert("header_version", header.header_version().to_string());

        match header {
            ImageHeader::Boot(BootHeader::V0Through2(h)) => {
                result.capture_os_version(h.os_version);
                result.insert("pagesize", format!("{:#010x}", h.page_size));
                result.insert("base", format!("{:#010x}", 0));
                result.insert("kernel_offset", format!("{:#010x}", h.kernel_addr));
                result.insert("ramdisk_offset", format!("{:#010x}", h.ramdisk_addr));
                result.insert("second_offset", format!("{:#010x}", h.second_addr));
                result.insert("tags_offset", format!("{:#010x}", h.tags_addr));
                if let Some(v2) = &h.v2_extra {
                    result.insert("dtb_offset", format!("{:#018x}", v2.dtb_addr));
                }
                result.insert("board", h.name.clone());
                result.insert("cmdline", format!("{}{}", h.cmdline, h.extra_cmdline));
            }
            ImageHeader::Boot(BootHeader::V3Through4(h)) => {
                result.capture_os_version(h.os_version);
                result.insert("cmdline", h.cmdline.clone());
            }
            ImageHeader::VendorBoot(h) => {
                result.insert("pagesize", format!("{:#010x}", h.page_size));
                result.insert("base", format!("{:#010x}", 0));
                result.insert("kernel_offset", format!("{:#010x}", h.kernel_addr));
                result.insert("ramdisk_offset", format!("{:#010x}", h.ramdisk_addr));
                result.insert("tags_offset", format!("{:#010x}", h.tags_addr));
                result.insert("dtb_offset", format!("{:#018x}", h.dtb_addr));
                result.insert("board", h.name.clone());
                result.insert("vendor_cmdline", h.cmdline.clone());
            }
        }

        result
    }

    /// Switch `header` to the version requested by the `header_version`
    /// option, if present. Versions outside of the header's family are
    /// rejected.
    fn apply_header_version(&self, header: &mut ImageHeader) -> Result<()> {
        let Some(version) = self.get_int::<u32>("header_version")? else {
            return Ok(());
        };

        let header_kind = header.kind_name();
        let current = header.header_version();
        let unsupported = || Error::UnsupportedVersion {
            header_kind,
            from: current,
            to: version,
        };

        match header {
            ImageHeader::Boot(BootHeader::V0Through2(h)) if version <= 2 => {
                h.set_header_version(version)?
            }
            ImageHeader::Boot(BootHeader::V3Through4(h)) if (3..=4).contains(&version) => {
                h.set_header_version(version)?
            }
            ImageHeader::VendorBoot(h) if (3..=4).contains(&version) => {
                h.set_header_version(version)?
            }
            _ => return Err(unsupported()),
        }

        Ok(())
    }

    /// Apply every option to `header`. Offsets are added to `base`, or to
    /// [`DEFAULT_BASE`] if `base` is absent. On error, `header` is left
    /// unchanged.
    pub fn apply(&self, header: &mut ImageHeader) -> Result<()> {
        let mut new_header = header.clone();

        self.apply_header_version(&mut new_header)?;

        let known = known_options(&new_header);
        if let Some(key) = self.0.keys().find(|k| !known.contains(&k.as_str())) {
            return Err(Error::UnknownOption(key.clone()));
        }

        let base = self.get_int::<u32>("base")?.unwrap_or(DEFAULT_BASE);

        match &mut new_header {
            ImageHeader::Boot(BootHeader::V0Through2(h)) => {
                h.os_version = self.apply_os_version(h.os_version)?;

                if let Some(page_size) = self.get_page_size()? {
                    h.page_size = page_size;
                }
                if let Some(addr) = self.get_addr("kernel_offset", base)? {
                    h.kernel_addr = addr;
                }
                if let Some(addr) = self.get_addr("ramdisk_offset", base)? {
                    h.ramdisk_addr = addr;
                }
                if let Some(addr) = self.get_addr("second_offset", base)? {
                    h.second_addr = addr;
                }
                if let Some(addr) = self.get_addr("tags_offset", base)? {
                    h.tags_addr = addr;
                }
                if let Some(addr) = self.get_addr64("dtb_offset", base)? {
                    if let Some(v2) = &mut h.v2_extra {
                        v2.dtb_addr = addr;
                    }
                }
                if let Some(board) = self.get("board") {
                    h.name = board.to_owned();
                }
                if let Some(cmdline) = self.get("cmdline") {
                    let (cmdline, extra_cmdline) = split_cmdline(cmdline);
                    h.cmdline = cmdline.to_owned();
                    h.extra_cmdline = extra_cmdline.to_owned();
                }
            }
            ImageHeader::Boot(BootHeader::V3Through4(h)) => {
                h.os_version = self.apply_os_version(h.os_version)?;

                if let Some(cmdline) = self.get("cmdline") {
                    h.cmdline = cmdline.to_owned();
                }
            }
            ImageHeader::VendorBoot(h) => {
                if let Some(page_size) = self.get_page_size()? {
                    h.page_size = page_size;
                }
                if let Some(addr) = self.get_addr("kernel_offset", base)? {
                    h.kernel_addr = addr;
                }
                if let Some(addr) = self.get_addr("ramdisk_offset", base)? {
                    h.ramdisk_addr = addr;
                }
                if let Some(addr) = self.get_addr("tags_offset", base)? {
                    h.tags_addr = addr;
                }
                if let Some(addr) = self.get_addr64("dtb_offset", base)? {
                    h.dtb_addr = addr;
                }
                if let Some(board) = self.get("board") {
                    h.name = board.to_owned();
                }
                if let Some(cmdline) = self.get("vendor_cmdline") {
                    h.cmdline = cmdline.to_owned();
                }
            }
        }

        *header = new_header;

        Ok(())
    }

    /// Split into options that apply to `header` and everything else. The
    /// `header_version` option, if valid, is taken into account when deciding
    /// which options are known.
    pub fn partition_known(&self, header: &ImageHeader) -> (Self, Self) {
        let mut target = header.clone();
        if self.apply_header_version(&mut target).is_err() {
            target = header.clone();
        }

        let known = known_options(&target);
        let (known, unknown): (BTreeMap<_, _>, BTreeMap<_, _>) = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .partition(|(k, _)| known.contains(&k.as_str()));

        (Self(known), Self(unknown))
    }

    /// Render as `--key value` pairs.
    pub fn to_args(&self) -> Vec<String> {
        self.0
            .iter()
            .flat_map(|(k, v)| [format!("--{k}"), v.clone()])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn int_parsing() {
        assert_eq!(parse_int::<u32>("x", "0x00001000").unwrap(), 4096);
        assert_eq!(parse_int::<u32>("x", "4096").unwrap(), 4096);
        assert_matches!(
            parse_int::<u32>("x", "0xzz"),
            Err(Error::InvalidValue { reason: "Not a valid integer", .. })
        );
        assert_matches!(parse_int::<u32>("x", ""), Err(Error::InvalidValue { .. }));
    }

    #[test]
    fn os_version_parsing() {
        assert_eq!(parse_os_version("v", "12").unwrap(), (12, 0, 0));
        assert_eq!(parse_os_version("v", "11.2").unwrap(), (11, 2, 0));
        assert_eq!(parse_os_version("v", "11.2.3").unwrap(), (11, 2, 3));
        assert_matches!(parse_os_version("v", "1.2.3.4"), Err(Error::InvalidValue { .. }));

        assert_eq!(parse_os_patch_level("p", "2022-03").unwrap(), (2022, 3));
        assert_eq!(parse_os_patch_level("p", "2022-03-05").unwrap(), (2022, 3));
        assert_matches!(parse_os_patch_level("p", "22-03"), Err(Error::InvalidValue { .. }));
    }

    #[test]
    fn cmdline_split() {
        let short = "console=ttyS0";
        assert_eq!(split_cmdline(short), (short, ""));

        let long = "a".repeat(600);
        let (first, rest) = split_cmdline(&long);
        assert_eq!(first.len(), BOOT_ARGS_SIZE - 1);
        assert_eq!(rest.len(), 600 - (BOOT_ARGS_SIZE - 1));

        // Never split inside a multi-byte character.
        let multibyte = format!("{}é", "a".repeat(BOOT_ARGS_SIZE - 2));
        let (first, rest) = split_cmdline(&multibyte);
        assert_eq!(first.len(), BOOT_ARGS_SIZE - 2);
        assert_eq!(rest, "é");
    }
}
