//! avrflash-ft245r - FTDI FT245R/FT232R bit-bang programmer support
//!
//! The FT245R's synchronous bit-bang mode turns its eight data lines into a
//! slow but cheap ISP or TPI programmer. Every SPI bit costs two USB bytes,
//! so paged flash access is pipelined to keep the chip busy.
//!
//! # Example
//!
//! ```no_run
//! use avrflash_ft245r::{Ft245r, Ft245rConfig};
//!
//! let mut config = Ft245rConfig::default();
//! config.apply_extparams(&["reset=~4".to_string()])?;
//! let pgm = Ft245r::open(&config)?;
//! # Ok::<(), avrflash_core::Error>(())
//! ```
//!
//! # Programmer Options
//!
//! - `sck=<n>`, `sdo=<n>`, `sdi=<n>`, `reset=<n>` - ISP pins (default 0, 2, 1, 4)
//! - `buff=<n>`, `vcc=<n>`, `errled=<n>`, `pgmled=<n>` - optional pins
//!
//! Prefix a bit number with `~` for an active-low pin.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod device;
mod error;
pub mod link;

pub use device::{default_pins, Ft245r, Ft245rConfig, DEFAULT_BITCLOCK_HZ, EXTPARAM_HELP};
pub use error::{Ft245rError, Result};
pub use link::{BitbangAdapter, DeviceSelection, FtdiLink};
