//! Interactive terminal for reading and writing AVR memories
//!
//! The terminal runs on top of an open [`Session`]: reads and writes go
//! through the session's page cache, so changes only reach the device on
//! `flush`, `quit` or the end of the session.
//!
//! # Example Session
//!
//! ```text
//! avrflash> dump eeprom 0 16
//! 0000  ff ff ff ff ff ff ff ff  ff ff ff ff ff ff ff ff  |................|
//!
//! avrflash> write eeprom 0 0x1234 "hi"
//! avrflash> dump eeprom 0 8
//! 0000  34 12 68 69 00 ff ff ff                           |4.hi....        |
//!
//! avrflash> quit
//! ```

#![warn(missing_docs)]

mod commands;
mod data;
mod error;
pub mod helper;
mod tokenize;

pub use commands::{find_command, hexdump_line, Command, Flow, Terminal, COMMANDS};
pub use data::{parse_datum, parse_frequency, parse_int, parse_sck_period, Datum};
pub use error::{Result, TermError};
pub use tokenize::split_commands;

use std::path::PathBuf;

use colored::Colorize;
use directories::ProjectDirs;
use log::warn;
use rustyline::config::Configurer;
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::Editor;

use crate::helper::TermHelper;

fn history_path() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("", "", "avrflash") {
        let mut path = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&path).ok();
        path.push("term_history");
        path
    } else {
        PathBuf::from(".avrflash_history")
    }
}

/// Run the interactive terminal until `quit` or end of input
///
/// Command errors are printed and the terminal carries on. End of input
/// behaves like `quit`.
pub fn run_interactive(term: &mut Terminal<'_>) -> Result<()> {
    let mut rl = Editor::<TermHelper, FileHistory>::new().map_err(|e| TermError::Readline(e.to_string()))?;
    rl.set_helper(Some(TermHelper::new()));
    rl.set_auto_add_history(false);

    let history = history_path();
    if rl.load_history(&history).is_err() {
        // first run
    }

    println!(
        "Type {} for available commands, {} to leave.",
        "help".bright_cyan(),
        "quit".bright_cyan()
    );
    let prompt = format!("{} ", "avrflash>".bright_green().bold());

    loop {
        if let Err(e) = term.keep_alive() {
            warn!("keep alive failed: {}", e);
        }
        match rl.readline(&prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line.as_str());
                match term.run_line(&line) {
                    Ok(Flow::Quit) => break,
                    Ok(Flow::Continue) => {}
                    Err(e) => eprintln!("{}: {}", "error".bright_red().bold(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                term.quit()?;
                break;
            }
            Err(err) => {
                if let Err(e) = rl.save_history(&history) {
                    warn!("cannot save history: {}", e);
                }
                return Err(TermError::Readline(err.to_string()));
            }
        }
    }

    if let Err(e) = rl.save_history(&history) {
        warn!("cannot save history: {}", e);
    }
    Ok(())
}
