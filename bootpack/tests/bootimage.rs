/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::io::Cursor;

use assert_matches::assert_matches;
use bootpack::{
    format::{
        bootimage::{
            self, BOOT_SIGNATURE_SIZE, BootHeader, BootHeaderV0Through2, BootHeaderV3Through4,
            HeaderExt, OsVersionPatch, V1Extra, V2Extra, V4Extra,
        },
        certificate::{CERTIFICATE_REGION_SIZE, CertificateBlock},
        cursor,
        image::{self, BootImage, ImageHeader},
        layout::{Section, SectionKind},
    },
    stream::{FromReader, ToWriter},
};

fn repeat(s: &str, max_len: usize) -> String {
    assert!(!s.is_empty());

    let mut result = s.repeat(max_len / s.len());
    result.push_str(&s[..max_len % s.len()]);

    result
}

fn v0_header() -> BootHeaderV0Through2 {
    BootHeaderV0Through2 {
        kernel_addr: 0x01234567,
        ramdisk_addr: 0x09abcdef,
        second_addr: 0x02468ace,
        tags_addr: 0x13579bdf,
        page_size: 4096,
        os_version: OsVersionPatch(0x76543210),
        name: repeat("Name", 15),
        cmdline: repeat("Cmdline", 511),
        extra_cmdline: repeat("ExtraCmdline", 1023),
        ..Default::default()
    }
}

fn v0_image(header: BootHeaderV0Through2) -> BootImage {
    let mut image = BootImage::new(ImageHeader::Boot(BootHeader::V0Through2(header)));
    image
        .sections
        .insert(SectionKind::Kernel, b"kernel data".to_vec());
    image
        .sections
        .insert(SectionKind::Ramdisk, b"ramdisk data".to_vec());
    image
        .sections
        .insert(SectionKind::Second, b"second data".to_vec());
    image
}

/// Make a vbmeta-style certificate with the given block sizes.
fn fake_certificate(auth: u64, aux: u64, fill: u8) -> Vec<u8> {
    let mut data = vec![fill; (256 + auth + aux) as usize];
    data[..4].copy_from_slice(b"AVB0");
    data[4..8].copy_from_slice(&1u32.to_be_bytes());
    data[8..12].copy_from_slice(&0u32.to_be_bytes());
    data[12..20].copy_from_slice(&auth.to_be_bytes());
    data[20..28].copy_from_slice(&aux.to_be_bytes());
    data
}

/// Write the image, parse it back, and make sure that re-serializing the
/// parsed image is byte-for-byte identical.
fn round_trip(mut image: BootImage, expected_version: u32) -> Vec<u8> {
    image.sync_header().unwrap();
    assert_eq!(image.header.header_version(), expected_version);

    let mut writer = Cursor::new(Vec::new());
    image.to_writer(&mut writer).unwrap();
    let data = writer.into_inner();

    let layout = image.header.layout().unwrap();
    assert_eq!(data.len() as u64, layout.total_size());

    let new_image = BootImage::from_reader(Cursor::new(&data)).unwrap();
    assert_eq!(new_image, image);
    assert_eq!(new_image.to_bytes().unwrap(), data);

    data
}

#[test]
fn round_trip_v0() {
    let data = round_trip(v0_image(v0_header()), 0);

    assert_eq!(&data[..8], b"ANDROID!");
    // Header + 3 single-page sections.
    assert_eq!(data.len(), 4 * 4096);
    assert_eq!(&data[4096..4107], b"kernel data");
    assert_eq!(&data[8192..8204], b"ramdisk data");
    assert_eq!(&data[12288..12299], b"second data");
}

#[test]
fn round_trip_v1() {
    let mut header = v0_header();
    header.v1_extra = Some(V1Extra::default());

    let mut image = v0_image(header);
    image
        .sections
        .insert(SectionKind::RecoveryDtbo, b"recovery_dtbo data".to_vec());

    let data = round_trip(image, 1);
    let image = BootImage::from_bytes(&data).unwrap();

    let ImageHeader::Boot(BootHeader::V0Through2(h)) = &image.header else {
        panic!("Unexpected header: {:?}", image.header);
    };
    assert_eq!(h.header_size(), 1648);
    // Header + kernel + ramdisk + second.
    assert_eq!(h.v1_extra.as_ref().unwrap().recovery_dtbo_offset, 4 * 4096);
    assert_eq!(&data[4 * 4096..4 * 4096 + 18], b"recovery_dtbo data");
}

#[test]
fn round_trip_v2() {
    let mut header = v0_header();
    header.page_size = 2048;
    header.v1_extra = Some(V1Extra::default());
    header.v2_extra = Some(V2Extra {
        dtb_addr: 0x0123456789abcdef,
        ..Default::default()
    });

    let mut image = v0_image(header);
    image.sections.insert(SectionKind::Dtb, b"dtb data".to_vec());

    let data = round_trip(image, 2);
    let image = BootImage::from_bytes(&data).unwrap();

    let ImageHeader::Boot(BootHeader::V0Through2(h)) = &image.header else {
        panic!("Unexpected header: {:?}", image.header);
    };
    assert_eq!(h.header_size(), 1660);
    // No recovery dtbo, so the offset is zero and there is no gap.
    assert_eq!(h.v1_extra.as_ref().unwrap().recovery_dtbo_offset, 0);
    assert_eq!(
        image.header.layout().unwrap().get(SectionKind::Dtb),
        Some(&Section {
            kind: SectionKind::Dtb,
            offset: 4 * 2048,
            size: 8,
        }),
    );
}

#[test]
fn legacy_id_is_recomputed() {
    let mut header = v0_header();
    header.id = [0xdeadbeef; 8];
    header.v1_extra = Some(V1Extra::default());
    header.v2_extra = Some(V2Extra::default());

    let mut image = v0_image(header);
    image.sections.insert(SectionKind::Dtb, b"dtb".to_vec());
    image.sync_header().unwrap();

    let ImageHeader::Boot(BootHeader::V0Through2(h)) = &image.header else {
        unreachable!();
    };

    assert_eq!(
        hex::encode(&h.id_bytes()[..20]),
        "21649821cafd030b8d203d5e091460984af7d487",
    );
    // The unused tail of the ID field is zero.
    assert!(h.id_bytes()[20..].iter().all(|b| *b == 0));
}

#[test]
fn legacy_id_known_digest() {
    let mut image = BootImage::new(ImageHeader::Boot(BootHeader::V0Through2(
        BootHeaderV0Through2 {
            page_size: 2048,
            ..Default::default()
        },
    )));
    image.sections.insert(SectionKind::Kernel, b"kernel".to_vec());

    let data = image.to_bytes().unwrap();

    // The ID field follows the name and cmdline fields.
    assert_eq!(
        hex::encode(&data[576..596]),
        "60067de1d2eb258e0ac325958c397c91729819d2",
    );
    assert_eq!(data[596..608], [0u8; 12]);
}

#[test]
fn round_trip_v3() {
    let header = BootHeaderV3Through4 {
        os_version: OsVersionPatch::new(12, 0, 0, 2022, 3).unwrap(),
        reserved: [0x00112233, 0x44556677, 0x8899aabb, 0xccddeeff],
        cmdline: repeat("Cmdline", 1535),
        ..Default::default()
    };

    let mut image = BootImage::new(ImageHeader::Boot(BootHeader::V3Through4(header)));
    image.sections.insert(SectionKind::Kernel, vec![0x11; 4096]);
    image.sections.insert(SectionKind::Ramdisk, vec![0x22; 4096]);

    let data = round_trip(image.clone(), 3);
    assert_eq!(data.len(), 12288);

    image.sync_header().unwrap();
    let layout = image.header.layout().unwrap();
    assert_eq!(
        layout
            .iter()
            .map(|s| (s.kind, s.offset, s.size))
            .collect::<Vec<_>>(),
        [
            (SectionKind::Header, 0, 4096),
            (SectionKind::Kernel, 4096, 4096),
            (SectionKind::Ramdisk, 8192, 4096),
        ],
    );
    assert_eq!(layout.total_size(), 12288);
}

#[test]
fn round_trip_v4() {
    let header = BootHeaderV3Through4 {
        os_version: OsVersionPatch::new(14, 1, 2, 2024, 6).unwrap(),
        cmdline: "console=ttyS0".to_owned(),
        v4_extra: Some(V4Extra::default()),
        ..Default::default()
    };

    let block = CertificateBlock {
        certificates: vec![fake_certificate(64, 32, 0xaa), fake_certificate(0, 8, 0xbb)],
    };

    let mut image = BootImage::new(ImageHeader::Boot(BootHeader::V3Through4(header)));
    image.sections.insert(SectionKind::Kernel, b"kernel".to_vec());
    image.sections.insert(SectionKind::Ramdisk, b"ramdisk".to_vec());
    image.sections.insert(
        SectionKind::BootSignature,
        block.to_region(CERTIFICATE_REGION_SIZE).unwrap(),
    );

    let data = round_trip(image, 4);
    let image = BootImage::from_bytes(&data).unwrap();

    assert_eq!(image.header.header_size(), 1584);
    assert_eq!(image.header.page_size(), 4096);
    assert_eq!(image.certificates().unwrap(), block);

    let ImageHeader::Boot(BootHeader::V3Through4(h)) = &image.header else {
        unreachable!();
    };
    assert_eq!(h.v4_extra.as_ref().unwrap().signature_size, BOOT_SIGNATURE_SIZE);
}

#[test]
fn trailer_is_preserved() {
    let mut data = round_trip(v0_image(v0_header()), 0);
    let image_size = data.len();
    data.extend_from_slice(b"AVBf trailing data");

    let image = BootImage::from_bytes(&data).unwrap();
    assert_eq!(image.trailer, b"AVBf trailing data");
    assert_eq!(image.to_bytes().unwrap(), data);

    // Trailing certificate regions are found too.
    let block = CertificateBlock {
        certificates: vec![fake_certificate(16, 16, 0xcc)],
    };
    data.truncate(image_size);
    data.extend_from_slice(&block.to_region(CERTIFICATE_REGION_SIZE).unwrap());

    let image = BootImage::from_bytes(&data).unwrap();
    assert_eq!(image.certificates().unwrap(), block);
}

#[test]
fn cmdline_terminator() {
    let header = BootHeaderV0Through2 {
        page_size: 2048,
        cmdline: "c".repeat(511),
        ..Default::default()
    };
    let data = header.to_bytes().unwrap();
    // Command line starts after magic, 10 words and name.
    assert_eq!(&data[64..575], "c".repeat(511).as_bytes());
    assert_eq!(data[575], 0);

    let header = BootHeaderV0Through2 {
        page_size: 2048,
        cmdline: "c".repeat(512),
        ..Default::default()
    };
    assert_matches!(
        header.to_bytes(),
        Err(bootimage::Error::Cursor(cursor::Error::FieldTooLong {
            size: 512,
            len: 512,
            ..
        }))
    );

    let header = BootHeaderV3Through4 {
        cmdline: "c".repeat(1536),
        ..Default::default()
    };
    assert_matches!(
        header.to_bytes(),
        Err(bootimage::Error::Cursor(cursor::Error::FieldTooLong { .. }))
    );
}

#[test]
fn embedded_nul_is_rejected() {
    let header = BootHeaderV0Through2 {
        page_size: 2048,
        name: "a\0b".to_owned(),
        ..Default::default()
    };
    assert_matches!(
        header.to_bytes(),
        Err(bootimage::Error::Cursor(cursor::Error::InvalidEncoding { .. }))
    );
}

#[test]
fn os_version_packing() {
    let value = OsVersionPatch::new(12, 0, 0, 2022, 3).unwrap();
    assert_eq!(value.0, (((12 << 14) << 11) | (22 << 4) | 3));
    assert_eq!(value.version(), Some((12, 0, 0)));
    assert_eq!(value.patch_level(), Some((2022, 3)));
    assert_eq!(value.to_string(), "12.0.0 [2022-03]");

    assert_eq!(OsVersionPatch::default().version(), None);
    assert_eq!(OsVersionPatch::default().patch_level(), None);

    assert_matches!(
        OsVersionPatch::new(128, 0, 0, 2022, 3),
        Err(bootimage::Error::FieldOutOfRange("os_version::major", _))
    );
    assert_matches!(
        OsVersionPatch::new(12, 0, 0, 1999, 3),
        Err(bootimage::Error::FieldOutOfRange("os_version::year", _))
    );
    assert_matches!(
        OsVersionPatch::new(12, 0, 0, 2022, 13),
        Err(bootimage::Error::FieldOutOfRange("os_version::month", _))
    );
}

#[test]
fn bad_input() {
    let mut data = vec![0u8; 4096];
    data[..8].copy_from_slice(b"NOTBOOT!");
    assert_matches!(
        BootHeader::from_bytes(&data),
        Err(bootimage::Error::BadMagic(m)) if &m == b"NOTBOOT!"
    );
    assert_matches!(
        BootImage::from_bytes(&data),
        Err(image::Error::UnknownFormat(m)) if &m == b"NOTBOOT!"
    );

    let mut data = v0_header().to_bytes().unwrap();
    data[40..44].copy_from_slice(&5u32.to_le_bytes());
    assert_matches!(
        BootHeader::from_bytes(&data),
        Err(bootimage::Error::UnsupportedVersion(5))
    );

    let data = v0_header().to_bytes().unwrap();
    assert_matches!(
        BootHeader::from_bytes(&data[..100]),
        Err(bootimage::Error::Cursor(cursor::Error::TruncatedInput {
            offset: 0,
            remaining: 100,
            ..
        }))
    );

    let mut header = v0_header();
    header.v1_extra = Some(V1Extra::default());
    let mut data = header.to_bytes().unwrap();
    // header_size is the last field of the v1 extension.
    data[1644..1648].copy_from_slice(&0u32.to_le_bytes());
    assert_matches!(
        BootHeader::from_bytes(&data),
        Err(bootimage::Error::InvalidHeaderSize {
            expected: 1648,
            actual: 0,
        })
    );

    let mut data = v0_header().to_bytes().unwrap();
    // page_size
    data[36..40].copy_from_slice(&0u32.to_le_bytes());
    assert_matches!(
        BootHeader::from_bytes(&data),
        Err(bootimage::Error::PageSizeZero)
    );
}

#[test]
fn truncated_section() {
    let data = round_trip(v0_image(v0_header()), 0);

    assert_matches!(
        BootImage::from_bytes(&data[..4100]),
        Err(image::Error::TruncatedSection {
            kind: SectionKind::Kernel,
            offset: 4096,
            ..
        })
    );
}

#[test]
fn unsupported_section() {
    let mut image = v0_image(v0_header());
    image.sections.insert(SectionKind::Dtb, b"dtb".to_vec());

    assert_matches!(
        image.to_bytes(),
        Err(image::Error::UnsupportedSection {
            kind: SectionKind::Dtb,
            version: 0,
            ..
        })
    );
}

#[test]
fn header_version_change() {
    let mut header = BootHeader::V0Through2(v0_header());

    header.set_header_version(2).unwrap();
    assert_eq!(header.header_version(), 2);
    assert_eq!(header.header_size(), 1660);

    header.set_header_version(0).unwrap();
    assert_eq!(header.header_size(), 1632);

    assert_matches!(
        header.set_header_version(3),
        Err(bootimage::Error::UnsupportedVersion(3))
    );
}

#[test]
fn header_toml_round_trip() {
    let mut header = v0_header();
    header.v1_extra = Some(V1Extra::default());
    let header = ImageHeader::Boot(BootHeader::V0Through2(header));

    let data = toml_edit::ser::to_string_pretty(&header).unwrap();
    let new_header: ImageHeader = toml_edit::de::from_str(&data).unwrap();

    assert_eq!(new_header, header);

    // Fields derived on pack are not written.
    let mut derived = header.clone();
    let ImageHeader::Boot(BootHeader::V0Through2(h)) = &mut derived else {
        unreachable!();
    };
    h.id = [0x12345678; 8];
    h.v1_extra = Some(V1Extra {
        recovery_dtbo_size: 100,
        recovery_dtbo_offset: 0x4000,
    });

    let derived_data = toml_edit::ser::to_string_pretty(&derived).unwrap();
    assert_eq!(derived_data, data);
    assert!(!data.contains("id ="));
    assert!(!data.contains("recovery_dtbo_offset"));
}
