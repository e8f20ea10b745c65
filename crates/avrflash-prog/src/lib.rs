//! avrflash-prog - Programmer registry for avrflash
//!
//! Maps `-c` names to drivers compiled in through cargo features and finds
//! USB-to-serial bridges for `-P`.
//!
//! # Example
//!
//! ```no_run
//! use avrflash_core::part::PartDatabase;
//! use avrflash_prog::{open, serialadapter, ProgrammerOptions};
//!
//! let db = PartDatabase::builtin()?;
//! let part = db.find("m328p").unwrap();
//! let port = serialadapter::setport("ch340", db.serial_adapters())?;
//! let opts = ProgrammerOptions {
//!     port: Some(port),
//!     ..Default::default()
//! };
//! let pgm = open("jtagmkii_isp", &opts, part)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod registry;
pub mod serialadapter;

pub use registry::{
    available_programmers, driver_help, extparam_help, find_programmer, open, programmer_help,
    programmer_names_short, wants_help, ProgrammerInfo, ProgrammerOptions,
};
