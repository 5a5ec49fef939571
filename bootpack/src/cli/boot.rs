/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info};

use crate::{
    cli::{status, warning},
    format::{
        args::ArgumentMap,
        bootimage::HeaderExt,
        image::{BootImage, ImageHeader},
        layout::SectionKind,
    },
    stream::{FromReader, ToWriter},
};

const HEADER_FILE: &str = "header.toml";
const ARGS_FILE: &str = "mkbootimg_args.toml";
const TRAILER_FILE: &str = "trailer";

fn read_image(path: &Path) -> Result<BootImage> {
    let file = File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))?;
    let reader = BufReader::new(file);
    let image = BootImage::from_reader(reader)
        .with_context(|| format!("Failed to read boot image: {path:?}"))?;

    Ok(image)
}

fn write_image(path: &Path, image: &BootImage) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("Failed to open for writing: {path:?}"))?;
    let mut writer = BufWriter::new(file);
    image
        .to_writer(&mut writer)
        .with_context(|| format!("Failed to write boot image: {path:?}"))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush boot image: {path:?}"))?;

    Ok(())
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data =
        fs::read_to_string(path).with_context(|| format!("Failed to read TOML: {path:?}"))?;
    let value =
        toml_edit::de::from_str(&data).with_context(|| format!("Failed to parse TOML: {path:?}"))?;

    Ok(value)
}

fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = toml_edit::ser::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize TOML: {path:?}"))?;
    fs::write(path, data).with_context(|| format!("Failed to write TOML: {path:?}"))?;

    Ok(())
}

fn read_data_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    let data = match fs::read(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read data: {path:?}"))?,
    };

    Ok(Some(data))
}

fn write_data_if_not_empty(path: &Path, data: &[u8]) -> Result<()> {
    if !data.is_empty() {
        fs::write(path, data).with_context(|| format!("Failed to write data: {path:?}"))?;
    }

    Ok(())
}

/// Path of one vendor ramdisk table fragment.
fn fragment_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{}.{index}", SectionKind::VendorRamdisk.name()))
}

fn has_ramdisk_table(header: &ImageHeader) -> bool {
    match header {
        ImageHeader::VendorBoot(h) => h
            .v4_extra
            .as_ref()
            .is_some_and(|v4| !v4.ramdisk_table.is_empty()),
        ImageHeader::Boot(_) => false,
    }
}

fn parse_key_value(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected <key>=<value>: {s:?}"))?;

    Ok((key.to_owned(), value.to_owned()))
}

fn apply_overrides(header: &mut ImageHeader, overrides: &[(String, String)]) -> Result<()> {
    if overrides.is_empty() {
        return Ok(());
    }

    let mut args = ArgumentMap::new();
    for (key, value) in overrides {
        args.insert(key.clone(), value.clone());
    }

    let (known, unknown) = args.partition_known(header);
    for key in unknown.0.keys() {
        warning!("Ignoring option not applicable to this image: {key:?}");
    }

    known.apply(header).context("Failed to apply option overrides")?;

    Ok(())
}

fn display_info(cli: &BootCli, image: &BootImage) {
    if !cli.quiet {
        if cli.debug {
            println!("{image:#?}");
        } else {
            println!("{}", image.header);
        }
    }
}

fn unpack_subcommand(boot_cli: &BootCli, cli: &UnpackCli) -> Result<()> {
    let image = read_image(&cli.input)?;
    display_info(boot_cli, &image);

    let dir = &cli.output_dir;
    fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {dir:?}"))?;

    write_toml(&dir.join(HEADER_FILE), &image.header)?;
    write_toml(&dir.join(ARGS_FILE), &ArgumentMap::capture(&image.header))?;

    for (kind, data) in &image.sections {
        if *kind == SectionKind::VendorRamdisk {
            if let ImageHeader::VendorBoot(h) = &image.header {
                if let Some(v4) = h.v4_extra.as_ref().filter(|_| has_ramdisk_table(&image.header))
                {
                    for (i, entry) in v4.ramdisk_table.iter().enumerate() {
                        let start = entry.ramdisk_offset as usize;
                        let end = start + entry.ramdisk_size as usize;
                        let fragment = data
                            .get(start..end)
                            .ok_or_else(|| anyhow!("Ramdisk fragment #{i} is out of bounds"))?;

                        write_data_if_not_empty(&fragment_path(dir, i), fragment)?;
                    }

                    continue;
                }
            }
        }

        debug!("Writing {kind} section");
        write_data_if_not_empty(&dir.join(kind.name()), data)?;
    }

    write_data_if_not_empty(&dir.join(TRAILER_FILE), &image.trailer)?;

    status!("Unpacked {} image to {dir:?}", image.header.kind_name());

    Ok(())
}

fn pack_subcommand(boot_cli: &BootCli, cli: &PackCli) -> Result<()> {
    let dir = &cli.input_dir;

    let mut header: ImageHeader = read_toml(&dir.join(HEADER_FILE))?;

    let args_path = dir.join(ARGS_FILE);
    if args_path.exists() {
        let args: ArgumentMap = read_toml(&args_path)?;
        args.apply(&mut header)
            .with_context(|| format!("Failed to apply arguments: {args_path:?}"))?;
    }

    apply_overrides(&mut header, &cli.set)?;

    let use_table = has_ramdisk_table(&header);
    let mut image = BootImage::new(header);

    for kind in image.header.data_sections() {
        if kind == SectionKind::VendorRamdisk && use_table {
            continue;
        }

        if let Some(data) = read_data_if_exists(&dir.join(kind.name()))? {
            info!("Loaded {kind} section: {} bytes", data.len());
            image.sections.insert(kind, data);
        }
    }

    if let ImageHeader::VendorBoot(h) = &mut image.header {
        if use_table {
            let mut ramdisk = vec![];

            if let Some(v4) = &mut h.v4_extra {
                for (i, entry) in v4.ramdisk_table.iter_mut().enumerate() {
                    let data = read_data_if_exists(&fragment_path(dir, i))?.unwrap_or_default();
                    entry.ramdisk_size = u32::try_from(data.len())
                        .with_context(|| format!("Ramdisk fragment #{i} is too large"))?;
                    ramdisk.extend_from_slice(&data);
                }
            }

            h.update_ramdisk_offsets()?;
            image.sections.insert(SectionKind::VendorRamdisk, ramdisk);
        }
    }

    if let Some(trailer) = read_data_if_exists(&dir.join(TRAILER_FILE))? {
        image.trailer = trailer;
    }

    image.sync_header()?;
    display_info(boot_cli, &image);
    write_image(&cli.output, &image)?;

    status!("Packed image to {:?}", cli.output);

    Ok(())
}

fn repack_subcommand(boot_cli: &BootCli, cli: &RepackCli) -> Result<()> {
    let mut image = read_image(&cli.input)?;

    apply_overrides(&mut image.header, &cli.set)?;

    if cli.drop_trailer && !image.trailer.is_empty() {
        info!("Dropping {} bytes of trailing data", image.trailer.len());
        image.trailer.clear();
    }

    image.sync_header()?;
    display_info(boot_cli, &image);
    write_image(&cli.output, &image)?;

    Ok(())
}

fn info_subcommand(boot_cli: &BootCli, cli: &InfoCli) -> Result<()> {
    let image = read_image(&cli.input)?;
    display_info(boot_cli, &image);

    if cli.layout {
        let layout = image.header.layout()?;

        println!("Layout (page size {}):", image.header.page_size());
        for section in layout.iter() {
            println!(
                "- {:<20} offset={:#010x} size={}",
                section.kind.name(),
                section.offset,
                section.size,
            );
        }
        println!("- Total size: {}", layout.total_size());
        println!("- Trailer size: {}", image.trailer.len());
    }

    if cli.args {
        for pair in ArgumentMap::capture(&image.header).to_args().chunks(2) {
            println!("{} {:?}", pair[0], pair[1]);
        }
    }

    Ok(())
}

pub fn boot_main(cli: &BootCli) -> Result<()> {
    match &cli.command {
        BootCommand::Unpack(c) => unpack_subcommand(cli, c),
        BootCommand::Pack(c) => pack_subcommand(cli, c),
        BootCommand::Repack(c) => repack_subcommand(cli, c),
        BootCommand::Info(c) => info_subcommand(cli, c),
    }
}

/// Unpack a boot or vendor boot image.
///
/// The output directory will contain `header.toml`, `mkbootimg_args.toml`,
/// and one file per non-empty section. Vendor v4 images with a ramdisk table
/// have one `vendor_ramdisk.<index>` file per table entry instead of a single
/// `vendor_ramdisk` file.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output directory.
    #[arg(short, long, value_name = "DIR", value_parser, default_value = ".")]
    output_dir: PathBuf,
}

/// Pack a boot or vendor boot image from an unpacked directory.
///
/// Missing section files are treated as empty sections.
#[derive(Debug, Parser)]
struct PackCli {
    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Path to input directory.
    #[arg(short, long, value_name = "DIR", value_parser, default_value = ".")]
    input_dir: PathBuf,

    /// Override a packer option (eg. `os_patch_level=2024-01`).
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
    set: Vec<(String, String)>,
}

/// Repack an image, recomputing the derived header fields.
#[derive(Debug, Parser)]
struct RepackCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Override a packer option (eg. `os_patch_level=2024-01`).
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
    set: Vec<(String, String)>,

    /// Discard any data after the last section.
    #[arg(long)]
    drop_trailer: bool,
}

/// Display image header information.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Also show the section layout.
    #[arg(long)]
    layout: bool,

    /// Also show the equivalent packer options.
    #[arg(long)]
    args: bool,
}

#[derive(Debug, Subcommand)]
enum BootCommand {
    Unpack(UnpackCli),
    Pack(PackCli),
    Repack(RepackCli),
    Info(InfoCli),
}

/// Pack or unpack boot images.
#[derive(Debug, Parser)]
pub struct BootCli {
    #[command(subcommand)]
    command: BootCommand,

    /// Don't print image header information.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print image header information in debug format.
    #[arg(short, long, global = true)]
    debug: bool,
}
