//! Writes the avrflash(1) man page
//!
//! Usage: cargo run --bin gen-manpage -- [output-dir]

use clap::CommandFactory;
use std::fs;
use std::path::PathBuf;

#[allow(dead_code)]
#[path = "../cli.rs"]
mod cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = std::env::args().nth(1).map_or_else(|| PathBuf::from("man"), PathBuf::from);
    fs::create_dir_all(&output_dir)?;

    let mut page = Vec::new();
    clap_mangen::Man::new(cli::Cli::command())
        .section("1")
        .render(&mut page)?;

    let path = output_dir.join("avrflash.1");
    fs::write(&path, page)?;
    println!("wrote {} (view with: man -l {})", path.display(), path.display());
    Ok(())
}
