//! Programmer abstraction and shared driver building blocks

pub mod bitbang;
pub mod pipeline;
mod traits;

pub use traits::*;
