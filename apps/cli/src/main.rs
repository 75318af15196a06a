use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pxitp_core::session::{self, SessionConfig};
use pxitp_core::{DeviceConfig, HidrawTransport, ParseFlags, TouchDevice, TracingObserver};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "PixArt touchpad firmware tool", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a firmware container and print its contents
    Info {
        file: PathBuf,
        /// Skip CRC verification
        #[arg(long)]
        ignore_checksum: bool,
    },
    /// Read the firmware version from a device
    Version {
        /// hidraw node, e.g. /dev/hidraw3
        #[arg(long)]
        device: PathBuf,
        /// Session config (TOML); only its [device] table is used
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Write a firmware container to a device
    Update {
        /// hidraw node, e.g. /dev/hidraw3
        #[arg(long)]
        device: PathBuf,
        file: PathBuf,
        /// Session config (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Skip CRC verification of the container
        #[arg(long)]
        ignore_checksum: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load_from_file(path),
        None => Ok(SessionConfig::default()),
    }
}

fn flags(ignore_checksum: bool) -> ParseFlags {
    if ignore_checksum {
        ParseFlags::IGNORE_CHECKSUM
    } else {
        ParseFlags::empty()
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Info {
            file,
            ignore_checksum,
        } => {
            let container = session::load_firmware(&file, flags(ignore_checksum))?;
            print!("{container}");
        }
        Command::Version { device, config } => {
            let config = load_config(config.as_ref())?;
            let transport = HidrawTransport::open(&device)?;
            let mut dev = TouchDevice::new(transport, config.device);
            dev.setup()?;
            let mode = if dev.is_bootloader() {
                "bootloader"
            } else {
                "runtime"
            };
            println!(
                "{} ({mode}, part 0x{:04x})",
                dev.version().unwrap_or("unknown"),
                dev.read_part_id()?
            );
        }
        Command::Update {
            device,
            file,
            config,
            ignore_checksum,
        } => {
            let mut config = load_config(config.as_ref())?;
            config.device_path = device;
            config.firmware_path = file;
            config.ignore_checksum |= ignore_checksum;
            session::run(&config, Arc::new(TracingObserver))?;
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting pxitp...");

    if let Err(e) = run(args.command) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_command() {
        let args = Args::try_parse_from([
            "pxitp",
            "-v",
            "update",
            "--device",
            "/dev/hidraw3",
            "fw.bin",
            "--ignore-checksum",
        ])
        .unwrap();
        assert!(args.verbose);
        match args.command {
            Command::Update {
                device,
                file,
                config,
                ignore_checksum,
            } => {
                assert_eq!(device, PathBuf::from("/dev/hidraw3"));
                assert_eq!(file, PathBuf::from("fw.bin"));
                assert!(config.is_none());
                assert!(ignore_checksum);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_version_requires_device() {
        assert!(Args::try_parse_from(["pxitp", "version"]).is_err());
    }

    #[test]
    fn test_default_config_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.device, DeviceConfig::default());
    }
}
