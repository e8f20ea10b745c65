//! CLI argument parsing

use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Generate dynamic help text for the programmer argument
fn programmer_help() -> String {
    format!(
        "Programmer to use; ? lists programmers, ?type lists drivers [available: {}]",
        avrflash_prog::programmer_names_short()
    )
}

/// Parse a -B value into seconds
fn parse_bitclock(s: &str) -> Result<f64, String> {
    avrflash_term::parse_sck_period(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
#[command(name = "avrflash")]
#[command(author, version, about = "AVR microcontroller programmer", long_about = None)]
#[command(disable_help_flag = true, disable_version_flag = true)]
pub struct Cli {
    /// Part id or description; ? lists parts
    #[arg(short = 'p', value_name = "PART")]
    pub part: Option<String>,

    #[arg(short = 'c', value_name = "PROGRAMMER", help = programmer_help())]
    pub programmer: Option<String>,

    /// Connection: usb, usb:SN, a serial device, an adapter id[:sn] or usb:vid:pid[:sn]
    #[arg(short = 'P', value_name = "PORT")]
    pub port: Option<String>,

    /// Serial baud rate
    #[arg(short = 'b', value_name = "BAUD")]
    pub baud: Option<u32>,

    /// Bit clock period; bare numbers are microseconds, Hz/kHz/MHz give a frequency
    #[arg(short = 'B', value_name = "BITCLOCK", value_parser = parse_bitclock)]
    pub bitclock: Option<f64>,

    /// Part catalogue file; +file merges into the current catalogue
    #[arg(short = 'C', value_name = "FILE", action = ArgAction::Append)]
    pub config: Vec<String>,

    /// Disable auto erase for flash
    #[arg(short = 'D')]
    pub no_auto_erase: bool,

    /// Keep trailing 0xff bytes of flash images
    #[arg(short = 'A')]
    pub keep_trailing_ff: bool,

    /// Perform a chip erase
    #[arg(short = 'e')]
    pub erase: bool,

    /// Programmer pin states on exit
    #[arg(short = 'E', value_name = "EXITSPEC", action = ArgAction::Append)]
    pub exitspec: Vec<String>,

    /// Override invalid signature or initialisation checks; verify mismatches only warn
    #[arg(short = 'F')]
    pub force: bool,

    /// ISP clock delay
    #[arg(short = 'i', value_name = "DELAY")]
    pub isp_delay: Option<u32>,

    /// Write log messages to this file
    #[arg(short = 'l', value_name = "LOGFILE")]
    pub logfile: Option<PathBuf>,

    /// Do not write anything to the device
    #[arg(short = 'n')]
    pub no_write: bool,

    /// Perform RC oscillator calibration
    #[arg(short = 'O')]
    pub osccal: bool,

    /// Touch the port at 1200 baud before opening it, to start a bootloader
    #[arg(short = 'r')]
    pub touch: bool,

    /// Quieter output; repeat to also hide progress bars
    #[arg(short = 'q', action = ArgAction::Count)]
    pub quiet: u8,

    /// Enter the interactive terminal
    #[arg(short = 't', action = ArgAction::Count)]
    pub terminal: u8,

    /// Run one terminal command line
    #[arg(short = 'T', value_name = "CMD", action = ArgAction::Append)]
    pub terminal_cmd: Vec<String>,

    /// Memory operation mem:op:file[:fmt]; op is r, w or v
    #[arg(short = 'U', value_name = "UPDATE", action = ArgAction::Append)]
    pub update: Vec<String>,

    /// More verbose output; repeat for more
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Do not verify after writing
    #[arg(short = 'V')]
    pub no_verify: bool,

    /// Extended programmer parameter; -x help lists them
    #[arg(short = 'x', value_name = "EXTPARAM", action = ArgAction::Append)]
    pub extparams: Vec<String>,

    /// Print help
    #[arg(short = '?', long = "help", action = ArgAction::Help)]
    pub help: Option<bool>,

    /// Print version
    #[arg(long = "version", action = ArgAction::Version)]
    pub version: Option<bool>,
}
