/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli::{boot, cert};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Boot(boot::BootCli),
    Cert(cert::CertCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output. `RUST_LOG` takes precedence.
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    pub log_level: LogLevel,
}

/// Log to stderr so that stdout remains usable for command output.
pub fn init_logging(log_level: LogLevel) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(log_level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .init();
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::Boot(c) => boot::boot_main(&c),
        Command::Cert(c) => cert::cert_main(&c),
    }
}
