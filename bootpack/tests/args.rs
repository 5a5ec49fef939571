/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::collections::BTreeMap;

use assert_matches::assert_matches;
use bootpack::format::{
    args::{self, ArgumentMap, DEFAULT_BASE, Error},
    bootimage::{
        self, BootHeader, BootHeaderV0Through2, BootHeaderV3Through4, HeaderExt, OsVersionPatch,
        V1Extra, V2Extra,
    },
    image::ImageHeader,
    vendorboot::VendorBootHeader,
};

fn map(pairs: &[(&str, &str)]) -> ArgumentMap {
    let mut result = ArgumentMap::new();
    for (k, v) in pairs {
        result.insert(*k, *v);
    }
    result
}

fn v0_header() -> ImageHeader {
    ImageHeader::Boot(BootHeader::V0Through2(BootHeaderV0Through2 {
        page_size: 2048,
        ..Default::default()
    }))
}

fn v3_header() -> ImageHeader {
    ImageHeader::Boot(BootHeader::V3Through4(BootHeaderV3Through4 {
        os_version: OsVersionPatch::new(11, 0, 0, 2021, 1).unwrap(),
        cmdline: "console=ttyS0".to_owned(),
        ..Default::default()
    }))
}

fn vendor_v3_header() -> ImageHeader {
    ImageHeader::VendorBoot(VendorBootHeader {
        page_size: 4096,
        kernel_addr: 0x00008000,
        ramdisk_addr: 0x01000000,
        cmdline: "androidboot.console=ttyS0".to_owned(),
        tags_addr: 0x00000100,
        name: "board".to_owned(),
        dtb_addr: 0x01f00000,
        ..Default::default()
    })
}

fn boot_v0(header: &ImageHeader) -> &BootHeaderV0Through2 {
    match header {
        ImageHeader::Boot(BootHeader::V0Through2(h)) => h,
        h => panic!("Unexpected header: {h:?}"),
    }
}

#[test]
fn capture_boot_v3() {
    let args = ArgumentMap::capture(&v3_header());

    assert_eq!(
        args,
        map(&[
            ("cmdline", "console=ttyS0"),
            ("header_version", "3"),
            ("os_patch_level", "2021-01"),
            ("os_version", "11.0.0"),
        ]),
    );

    // Unset halves are omitted.
    let args = ArgumentMap::capture(&ImageHeader::Boot(BootHeader::V3Through4(
        BootHeaderV3Through4::default(),
    )));
    assert_eq!(args, map(&[("cmdline", ""), ("header_version", "3")]));
}

#[test]
fn capture_vendor_v3() {
    let args = ArgumentMap::capture(&vendor_v3_header());

    assert_eq!(
        args,
        map(&[
            ("base", "0x00000000"),
            ("board", "board"),
            ("dtb_offset", "0x0000000001f00000"),
            ("header_version", "3"),
            ("kernel_offset", "0x00008000"),
            ("pagesize", "0x00001000"),
            ("ramdisk_offset", "0x01000000"),
            ("tags_offset", "0x00000100"),
            ("vendor_cmdline", "androidboot.console=ttyS0"),
        ]),
    );
}

#[test]
fn capture_and_apply_v2() {
    let original = ImageHeader::Boot(BootHeader::V0Through2(BootHeaderV0Through2 {
        kernel_addr: 0x10008000,
        ramdisk_addr: 0x11000000,
        second_addr: 0x10f00000,
        tags_addr: 0x10000100,
        page_size: 4096,
        os_version: OsVersionPatch::new(13, 0, 0, 2023, 4).unwrap(),
        name: "board".to_owned(),
        cmdline: "c".repeat(511),
        extra_cmdline: "extra".to_owned(),
        v1_extra: Some(V1Extra::default()),
        v2_extra: Some(V2Extra {
            dtb_addr: 0x11f00000,
            ..Default::default()
        }),
        ..Default::default()
    }));

    let args = ArgumentMap::capture(&original);
    assert_eq!(args.get("header_version"), Some("2"));
    assert_eq!(args.get("dtb_offset"), Some("0x0000000011f00000"));
    assert_eq!(args.get("cmdline").map(str::len), Some(516));

    let mut header = v0_header();
    args.apply(&mut header).unwrap();

    assert_eq!(header, original);
    assert_eq!(ArgumentMap::capture(&header), args);
}

#[test]
fn offsets_are_relative_to_base() {
    let mut header = v0_header();
    map(&[("kernel_offset", "0x00008000")])
        .apply(&mut header)
        .unwrap();
    assert_eq!(boot_v0(&header).kernel_addr, DEFAULT_BASE + 0x8000);

    map(&[("base", "0x80000000"), ("tags_offset", "256")])
        .apply(&mut header)
        .unwrap();
    assert_eq!(boot_v0(&header).tags_addr, 0x80000100);
    assert_eq!(boot_v0(&header).kernel_addr, DEFAULT_BASE + 0x8000);

    // Base alone changes nothing.
    let before = header.clone();
    map(&[("base", "0x40000000")]).apply(&mut header).unwrap();
    assert_eq!(header, before);

    let mut header = vendor_v3_header();
    map(&[("dtb_offset", "0x0000000001f00000")])
        .apply(&mut header)
        .unwrap();
    let ImageHeader::VendorBoot(h) = &header else {
        unreachable!();
    };
    assert_eq!(h.dtb_addr, 0x11f00000);
}

#[test]
fn invalid_values() {
    let mut header = v0_header();
    let before = header.clone();

    assert_matches!(
        map(&[("base", "0xffffffff"), ("kernel_offset", "1")]).apply(&mut header),
        Err(Error::InvalidValue { option, reason: "Address overflow", .. })
            if option == "kernel_offset"
    );
    assert_matches!(
        map(&[("pagesize", "big")]).apply(&mut header),
        Err(Error::InvalidValue { option, .. }) if option == "pagesize"
    );
    assert_matches!(
        map(&[("pagesize", "1024")]).apply(&mut header),
        Err(Error::InvalidValue { option, value, .. })
            if option == "pagesize" && value == "1024"
    );
    assert_matches!(
        map(&[("pagesize", "0x3000")]).apply(&mut header),
        Err(Error::InvalidValue { option, .. }) if option == "pagesize"
    );
    assert_matches!(
        map(&[("os_version", "12.0.0"), ("os_patch_level", "March")]).apply(&mut header),
        Err(Error::InvalidValue { option, value, .. })
            if option == "os_patch_level" && value == "March"
    );
    assert_matches!(
        map(&[("os_version", "200")]).apply(&mut header),
        Err(Error::Boot(bootimage::Error::FieldOutOfRange("os_version::major", _)))
    );

    assert_eq!(header, before);

    map(&[("pagesize", "0x4000")]).apply(&mut header).unwrap();
    assert_eq!(boot_v0(&header).page_size, 16384);
}

#[test]
fn unknown_options() {
    let mut header = v3_header();
    let before = header.clone();

    assert_matches!(
        map(&[("cmdline", "quiet"), ("pagesize", "4096")]).apply(&mut header),
        Err(Error::UnknownOption(o)) if o == "pagesize"
    );
    assert_eq!(header, before);

    // dtb_offset only exists for v2 headers.
    let mut header = v0_header();
    assert_matches!(
        map(&[("dtb_offset", "0")]).apply(&mut header),
        Err(Error::UnknownOption(o)) if o == "dtb_offset"
    );
    map(&[("dtb_offset", "0"), ("header_version", "2")])
        .apply(&mut header)
        .unwrap();
    assert_eq!(header.header_version(), 2);
}

#[test]
fn header_version_changes() {
    let mut header = v3_header();

    assert_matches!(
        map(&[("header_version", "2")]).apply(&mut header),
        Err(Error::UnsupportedVersion {
            header_kind: "boot",
            from: 3,
            to: 2,
        })
    );
    assert_eq!(header.header_version(), 3);

    map(&[("header_version", "4")]).apply(&mut header).unwrap();
    assert_eq!(header.header_version(), 4);
    assert_eq!(header.header_size(), 1584);

    let mut header = vendor_v3_header();
    assert_matches!(
        map(&[("header_version", "5")]).apply(&mut header),
        Err(Error::UnsupportedVersion {
            header_kind: "vendor_boot",
            from: 3,
            to: 5,
        })
    );

    let mut header = v0_header();
    assert_matches!(
        map(&[("header_version", "3")]).apply(&mut header),
        Err(Error::UnsupportedVersion { from: 0, to: 3, .. })
    );
}

#[test]
fn known_and_unknown() {
    let header = v0_header();
    let args = map(&[("cmdline", "quiet"), ("dtb_offset", "0"), ("foo", "bar")]);

    let (known, unknown) = args.partition_known(&header);
    assert_eq!(known, map(&[("cmdline", "quiet")]));
    assert_eq!(unknown, map(&[("dtb_offset", "0"), ("foo", "bar")]));

    let mut args = args;
    args.insert("header_version", "2");
    let (known, unknown) = args.partition_known(&header);
    assert_eq!(
        known,
        map(&[("cmdline", "quiet"), ("dtb_offset", "0"), ("header_version", "2")]),
    );
    assert_eq!(unknown, map(&[("foo", "bar")]));

    assert!(args::known_options(&v3_header()).contains(&"os_patch_level"));
    assert!(!args::known_options(&v3_header()).contains(&"board"));
}

#[test]
fn command_line_rendering() {
    let args = map(&[("cmdline", "console=ttyS0 quiet"), ("base", "0x00000000")]);

    assert_eq!(
        args.to_args(),
        ["--base", "0x00000000", "--cmdline", "console=ttyS0 quiet"],
    );
    assert!(ArgumentMap::new().to_args().is_empty());
}

#[test]
fn toml_round_trip() {
    let args = ArgumentMap::capture(&vendor_v3_header());

    let data = toml_edit::ser::to_string_pretty(&args).unwrap();
    assert!(data.contains("pagesize = \"0x00001000\""));

    let new_args: ArgumentMap = toml_edit::de::from_str(&data).unwrap();
    assert_eq!(new_args, args);

    let raw: BTreeMap<String, String> = toml_edit::de::from_str(&data).unwrap();
    assert_eq!(raw.len(), args.len());
}
