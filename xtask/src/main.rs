use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pxitp_core::firmware::{FirmwareBuilder, UpdateType};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the test suite
    Test,
    /// Run the CLI
    Run {
        /// Arguments passed through to pxitp
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Wrap a raw flash image into an FWHD container
    Pack {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Target flash address
        #[arg(long, default_value = "0", value_parser = parse_u32)]
        target: u32,
        /// File version, e.g. 0x0105
        #[arg(long, default_value = "0", value_parser = parse_u16)]
        file_version: u16,
        /// IC part id, e.g. 0x0274
        #[arg(long, default_value = "0", value_parser = parse_u16)]
        part_id: u16,
        /// Section update type (0 general, 3 param)
        #[arg(long, default_value_t = 0)]
        update_type: u8,
    },
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let v = parse_u32(s)?;
    u16::try_from(v).map_err(|e| e.to_string())
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let mut full = vec!["run", "-p", "pxitp-cli", "--"];
            full.extend(args.iter().map(String::as_str));
            cargo(&full, "Run")?;
        }
        Commands::Pack {
            input,
            output,
            target,
            file_version,
            part_id,
            update_type,
        } => {
            let data = std::fs::read(input)
                .with_context(|| format!("reading {}", input.display()))?;
            let sectors = data.len().div_ceil(4096);
            let container = FirmwareBuilder::new()
                .file_version(*file_version)
                .ic_part_id(*part_id)
                .flash_sector_count(u16::try_from(sectors).context("image too large")?)
                .internal_section(UpdateType::from(*update_type), *target, &data)
                .build()?;
            std::fs::write(output, container.bytes())?;
            println!(
                "Wrote {} ({} bytes, version {})",
                output.display(),
                container.size(),
                container.version()
            );
        }
    }

    Ok(())
}
