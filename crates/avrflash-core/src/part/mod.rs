//! Part descriptions and the part catalogue

pub mod database;
mod types;

pub use database::{PartDatabase, PartDbError, SerialAdapter};
pub use types::*;
