//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

#[derive(Parser)]
#[command(name = "dotboot")]
#[command(author, version, about = "SPI flash bootloader client", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write an image to flash and verify it
    Flash {
        /// Bootloader connection (serial path, dev=PATH[,baud=N],
        /// ip=HOST:PORT, or sim:)
        #[arg(short, long, default_value = "/dev/ttyACM0")]
        port: String,

        /// Image file to write
        #[arg(short, long, default_value = "build/top.bit")]
        image: PathBuf,

        /// Flash address to write at (hex or decimal)
        #[arg(short, long, default_value = "0x200000", value_parser = parse_hex_u32)]
        address: u32,
    },

    /// Print the flash chip's JEDEC ID
    Id {
        /// Bootloader connection (serial path, dev=PATH[,baud=N],
        /// ip=HOST:PORT, or sim:)
        #[arg(short, long, default_value = "/dev/ttyACM0")]
        port: String,
    },
}
