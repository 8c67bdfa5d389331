//! dotboot command-line entry point

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use dotboot::programmer::{FlashProgress, Programmer};
use dotboot::transport::{Connection, Transport};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let result = match cli.command {
        Commands::Flash {
            port,
            image,
            address,
        } => run_flash(&port, &image, address),
        Commands::Id { port } => run_id(&port),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open_programmer(port: &str) -> Result<Programmer<Box<dyn Transport>>, Box<dyn std::error::Error>>
{
    let transport = Connection::parse(port)?.open()?;
    let mut programmer = Programmer::new(transport);
    programmer.ping()?;
    Ok(programmer)
}

fn run_flash(port: &str, image: &Path, address: u32) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(image)?;
    log::info!("Read {} bytes from {:?}", data.len(), image);

    let mut programmer = open_programmer(port)?;
    let mut progress = IndicatifProgress::new();
    let mismatches = programmer.flash_image(&data, address, &mut progress)?;

    if mismatches.is_empty() {
        println!("Flashed {} bytes at 0x{:06X}", data.len(), address);
        Ok(())
    } else {
        for m in &mismatches {
            eprintln!(
                "Verification failed for the {} byte page at 0x{:06X}",
                m.expected.len(),
                m.address
            );
        }
        Err(format!("{} pages failed verification", mismatches.len()).into())
    }
}

fn run_id(port: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut programmer = open_programmer(port)?;
    let id = programmer.read_jedec_id()?;
    println!("JEDEC ID: {:02X} {:02X} {:02X}", id[0], id[1], id[2]);
    Ok(())
}

/// Progress reporter using an indicatif progress bar
struct IndicatifProgress {
    bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    fn new() -> Self {
        Self { bar: None }
    }
}

impl FlashProgress for IndicatifProgress {
    fn begin(&mut self, total_bytes: usize) {
        let pb = ProgressBar::new(total_bytes as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] \
                     {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) Flashing",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self.bar = Some(pb);
    }

    fn page_programmed(&mut self, bytes_done: usize) {
        if let Some(pb) = &self.bar {
            pb.set_position(bytes_done as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish_with_message("Flash complete");
        }
    }
}
