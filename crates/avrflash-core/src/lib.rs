//! avrflash-core - Core library for AVR microcontroller programming
//!
//! This crate holds everything that does not depend on a particular
//! programmer: the part catalogue, ISP opcode templates, the generic
//! memory algorithms, the byte-level page cache, file formats, the update
//! planner and the disassembler used by the terminal.
//!
//! Drivers implement [`programmer::Programmer`] and get the rest for free.
//!
//! # Example
//!
//! ```ignore
//! use avrflash_core::{part::PartDatabase, progress::NoProgress, session::Session, update::*};
//!
//! fn upload(pgm: Box<dyn avrflash_core::programmer::Programmer>) -> avrflash_core::Result<()> {
//!     let db = PartDatabase::builtin()?;
//!     let part = db.find("m328p").cloned().unwrap();
//!     let mut session = Session::new(pgm, part, UpdateFlags::default());
//!     session.start()?;
//!     session.check_signature(&db, false)?;
//!     session.do_op(&MemUpdate::parse("flash:w:blink.hex")?, &mut NoProgress)?;
//!     session.finish(&mut NoProgress)
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod avr;
pub mod cache;
pub mod disasm;
pub mod error;
pub mod fileio;
pub mod opcode;
pub mod part;
pub mod programmer;
pub mod progress;
pub mod session;
pub mod tpi;
pub mod update;

pub use error::{Error, ErrorKind, Result};
