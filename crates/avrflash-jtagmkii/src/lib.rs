//! avrflash-jtagmkii - Atmel JTAG ICE mkII and AVR Dragon support
//!
//! Talks the ICE's framed binary protocol over a serial line or USB and
//! drives the target through JTAG, debugWIRE, PDI or (wrapped) ISP.
//!
//! # Example
//!
//! ```no_run
//! use avrflash_jtagmkii::{open_port, Interface, JtagMkIIConfig};
//!
//! let config = JtagMkIIConfig {
//!     interface: Interface::Pdi,
//!     ..Default::default()
//! };
//! let ice = open_port("usb", config)?;
//! println!("firmware {:04x}", ice.sign_on().fwver);
//! # Ok::<(), avrflash_jtagmkii::JtagError>(())
//! ```
//!
//! # Programmer Options
//!
//! - `jtagchain=UB,UA,BB,BA` - JTAG daisy chain position (JTAG only)
//! - `rtsdtr=low|high` - Drive DTR/RTS while programming (PDI only)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod descriptor;
mod device;
mod error;
pub mod framer;
pub mod mapper;
pub mod protocol;
pub mod transport;

pub use device::{Interface, JtagMkII, JtagMkIIConfig, SignOn, EXTPARAM_HELP};
pub use error::{JtagError, Result};
pub use transport::serial::SerialTransport;
pub use transport::usb::UsbTransport;
pub use transport::Transport;

/// Open an ICE from a `-P` port string
///
/// `usb` picks the first ICE, `usb:SERIAL` one with a matching serial
/// number; anything else is a serial device path.
pub fn open_port(port: &str, mut config: JtagMkIIConfig) -> Result<JtagMkII<Box<dyn Transport>>> {
    let transport: Box<dyn Transport> = if port == "usb" || port.starts_with("usb:") {
        let serial = port.strip_prefix("usb:").filter(|s| !s.is_empty());
        config.usb_serial = serial.is_some();
        let usb = UsbTransport::open(serial, config.dragon)?;
        config.dragon |= usb.is_dragon();
        Box::new(usb)
    } else {
        Box::new(SerialTransport::open(port)?)
    };
    JtagMkII::open(transport, config)
}
