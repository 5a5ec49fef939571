// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use crate::{
    cli::{status, warning},
    format::{
        certificate::{self, CERTIFICATE_REGION_SIZE, CertificateBlock, CertificateSigner},
        image::{self, BootImage},
        layout::SectionKind,
    },
    util::NumBytes,
};

/// Signs data by running an external program. The program receives the
/// certificate name as its last argument and the data to sign on stdin, and
/// must write the certificate to stdout.
struct CommandSigner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CertificateSigner for CommandSigner {
    fn generate_certificate(&self, data: &[u8], name: &str) -> io::Result<Vec<u8>> {
        debug!("Running {:?} for {name:?} certificate", self.program);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("Signer stdin is not piped"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("Signer stdout is not piped"))?;

        let mut certificate = vec![];

        // Write from a separate thread so a signer that streams its output
        // cannot deadlock on a full pipe.
        thread::scope(|s| {
            let writer = s.spawn(move || stdin.write_all(data));
            let read_result = stdout.read_to_end(&mut certificate);

            writer
                .join()
                .map_err(|_| io::Error::other("Signer stdin thread panicked"))??;
            read_result.map(|_| ())
        })?;

        let status = child.wait()?;
        if !status.success() {
            return Err(io::Error::other(format!("Signer failed: {status}")));
        }

        Ok(certificate)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read file: {path:?}"))
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("Failed to write file: {path:?}"))
}

/// Find the certificates in either the boot signature section of a v4 image or
/// a certificate region following the image.
fn load_certificates(path: &Path) -> Result<CertificateBlock> {
    let data = read_file(path)?;

    if let Ok(image) = BootImage::from_bytes(&data) {
        return image
            .certificates()
            .with_context(|| format!("Failed to scan certificates: {path:?}"));
    }

    let Some(region) = image::split_certificate_region(&data).region else {
        bail!("Not a boot image and no certificate region found: {path:?}");
    };

    debug!("Found trailing certificate region");
    CertificateBlock::from_region(region)
        .with_context(|| format!("Failed to scan certificate region: {path:?}"))
}

fn list_subcommand(cli: &ListCli) -> Result<()> {
    let block = load_certificates(&cli.input)?;

    if block.certificates.is_empty() {
        warning!("No certificates found");
    }

    for (i, certificate) in block.certificates.iter().enumerate() {
        println!("Certificate #{i}: {:?}", NumBytes(certificate.len()));

        if let Some(dir) = &cli.output_dir {
            let path = dir.join(format!("certificate.{i}"));
            write_file(&path, certificate)?;
        }
    }

    Ok(())
}

fn strip_subcommand(cli: &StripCli) -> Result<()> {
    let data = read_file(&cli.input)?;
    let split = image::split_certificate_region(&data);

    if split.region.is_none() {
        bail!("Image has no trailing certificate region: {:?}", cli.input);
    }

    let mut output = split.image.to_vec();
    output.extend_from_slice(split.rest);
    write_file(&cli.output, &output)?;

    status!("Removed {CERTIFICATE_REGION_SIZE} byte certificate region");

    Ok(())
}

fn append_subcommand(cli: &AppendCli) -> Result<()> {
    let data = read_file(&cli.input)?;
    let split = image::split_certificate_region(&data);

    if split.region.is_some() {
        info!("Replacing existing certificate region");
    }

    let block = CertificateBlock {
        certificates: cli
            .certificate
            .iter()
            .map(|p| read_file(p))
            .collect::<Result<_>>()?,
    };
    let region = block
        .to_region(CERTIFICATE_REGION_SIZE)
        .context("Failed to build certificate region")?;

    let mut output = split.image.to_vec();
    output.extend_from_slice(&region);
    output.extend_from_slice(split.rest);
    write_file(&cli.output, &output)?;

    status!(
        "Appended {} certificates ({:?})",
        block.certificates.len(),
        NumBytes(block.content_size()),
    );

    Ok(())
}

fn certify_subcommand(cli: &CertifyCli) -> Result<()> {
    let data = read_file(&cli.input)?;
    let image = BootImage::from_bytes(&data)
        .with_context(|| format!("Failed to read boot image: {:?}", cli.input))?;

    let kernel = image.section(SectionKind::Kernel);
    if kernel.is_empty() {
        bail!("Image has no kernel: {:?}", cli.input);
    }

    // Only the header and sections are signed. Existing certificates and
    // footers are discarded.
    let (plain, trailer) = image::split_trailer(&data)
        .with_context(|| format!("Failed to read boot image: {:?}", cli.input))?;
    if !trailer.is_empty() {
        info!("Discarding {:?} of trailing data", NumBytes(trailer.len()));
    }

    let signer = CommandSigner {
        program: cli.signer.clone(),
        args: cli.signer_args.clone(),
    };

    let output = certificate::certify(plain, kernel, &signer)
        .with_context(|| format!("Failed to certify image: {:?}", cli.input))?;
    write_file(&cli.output, &output)?;

    status!("Certified image written to {:?}", cli.output);

    Ok(())
}

pub fn cert_main(cli: &CertCli) -> Result<()> {
    match &cli.command {
        CertCommand::List(c) => list_subcommand(c),
        CertCommand::Strip(c) => strip_subcommand(c),
        CertCommand::Append(c) => append_subcommand(c),
        CertCommand::Certify(c) => certify_subcommand(c),
    }
}

/// List the certificates in an image.
#[derive(Debug, Parser)]
struct ListCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Write each certificate to `<DIR>/certificate.<index>`.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output_dir: Option<PathBuf>,
}

/// Remove the trailing certificate region from an image.
#[derive(Debug, Parser)]
struct StripCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

/// Append a certificate region built from existing certificate files.
#[derive(Debug, Parser)]
struct AppendCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Certificate to include. May be specified multiple times.
    #[arg(short, long, value_name = "FILE", value_parser)]
    certificate: Vec<PathBuf>,
}

/// Generate the `boot` and `generic_kernel` certificates with an external
/// signer and append them to an image.
#[derive(Debug, Parser)]
struct CertifyCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Signing program.
    #[arg(long, value_name = "PROGRAM", value_parser)]
    signer: PathBuf,

    /// Arguments to pass to the signing program before the certificate name.
    #[arg(long, value_name = "ARG", value_parser, allow_hyphen_values = true)]
    signer_args: Vec<OsString>,
}

#[derive(Debug, Subcommand)]
enum CertCommand {
    List(ListCli),
    Strip(StripCli),
    Append(AppendCli),
    Certify(CertifyCli),
}

/// Inspect or modify boot image certificate regions.
#[derive(Debug, Parser)]
pub struct CertCli {
    #[command(subcommand)]
    command: CertCommand,
}
