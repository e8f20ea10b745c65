//! Programmer trait definitions
//!
//! Every hardware driver implements [`Programmer`]. Only a handful of
//! operations are mandatory; the rest default to `Unsupported` (or to a
//! no-op where skipping the step is harmless) so that drivers only spell
//! out what their hardware can do.

use crate::error::{Error, ErrorKind, Result};
use crate::part::{Memory, Part, ProgModes};

/// Programmer status LEDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    /// Ready
    Rdy,
    /// Error
    Err,
    /// Programming in progress
    Pgm,
    /// Verifying
    Vfy,
}

/// Operations a programmer driver provides
///
/// Paged operations transfer `buf.len()` bytes starting at `addr`, which is
/// relative to the start of `mem`. Drivers must not assume `buf` aliases
/// `mem.buf`.
pub trait Programmer {
    /// Short driver name used in messages (`jtagmkii`, `ft245r`, ...)
    fn name(&self) -> &str;

    /// Programming interfaces this programmer drives
    fn prog_modes(&self) -> ProgModes;

    /// Prepare the target for programming and enter programming mode
    fn initialize(&mut self, part: &Part) -> Result<()>;

    /// Enable the programmer's buffers or power before `initialize`
    fn enable(&mut self, _part: &Part) -> Result<()> {
        Ok(())
    }

    /// Leave programming mode; the target keeps running
    fn disable(&mut self) -> Result<()> {
        Ok(())
    }

    /// Issue the program-enable handshake
    fn program_enable(&mut self, part: &Part) -> Result<()>;

    /// Erase flash (and, depending on fuses, EEPROM)
    ///
    /// Bootloaders that cannot erase themselves return `SoftFail`.
    fn chip_erase(&mut self, part: &Part) -> Result<()>;

    /// Read one byte
    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: usize) -> Result<u8>;

    /// Write one byte
    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: usize, value: u8) -> Result<()>;

    /// True if `paged_load`/`paged_write` are implemented
    fn has_paged_access(&self) -> bool {
        false
    }

    /// Read `buf.len()` bytes starting at `addr` with page-sized transfers
    fn paged_load(
        &mut self,
        _part: &Part,
        _mem: &Memory,
        _page_size: usize,
        _addr: usize,
        _buf: &mut [u8],
    ) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "paged load"))
    }

    /// Write `data` starting at `addr` with page-sized transfers
    fn paged_write(
        &mut self,
        _part: &Part,
        _mem: &Memory,
        _page_size: usize,
        _addr: usize,
        _data: &[u8],
    ) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "paged write"))
    }

    /// True if `page_erase` is implemented
    fn has_page_erase(&self) -> bool {
        false
    }

    /// Erase the page containing `addr`
    fn page_erase(&mut self, _part: &Part, _mem: &Memory, _addr: usize) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "page erase"))
    }

    /// Send a raw 4-byte ISP instruction and return the 4 reply bytes
    fn cmd(&mut self, _cmd: &[u8; 4]) -> Result<[u8; 4]> {
        Err(Error::new(ErrorKind::Unsupported, "raw ISP commands"))
    }

    /// Send a TPI command and receive `res.len()` reply bytes
    fn cmd_tpi(&mut self, _cmd: &[u8], _res: &mut [u8]) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "TPI commands"))
    }

    /// Full-duplex SPI transfer (`rx` may be shorter than `tx`)
    fn spi(&mut self, _tx: &[u8], _rx: &mut [u8]) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "direct SPI"))
    }

    /// Set the ISP clock period in seconds
    fn set_sck_period(&mut self, _period: f64) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "setting the bit clock"))
    }

    /// Current ISP clock period in seconds
    fn sck_period(&mut self) -> Result<f64> {
        Err(Error::new(ErrorKind::Unsupported, "reading the bit clock"))
    }

    /// Set the target supply voltage
    fn set_vtarget(&mut self, _volts: f64) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "setting the target voltage"))
    }

    /// Measure the target supply voltage
    fn vtarget(&mut self) -> Result<f64> {
        Err(Error::new(ErrorKind::Unsupported, "reading the target voltage"))
    }

    /// Set an analog reference voltage
    fn set_varef(&mut self, _channel: u32, _volts: f64) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "setting the reference voltage"))
    }

    /// Set the oscillator frequency supplied to the target
    fn set_fosc(&mut self, _hz: f64) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "setting the oscillator"))
    }

    /// Programmer parameters as name/value pairs for display
    fn parms(&mut self) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    /// Read the target chip revision
    fn read_chip_rev(&mut self, _part: &Part) -> Result<u8> {
        Err(Error::new(ErrorKind::Unsupported, "reading the chip revision"))
    }

    /// Read the System Information Block (UPDI)
    fn read_sib(&mut self, _part: &Part) -> Result<String> {
        Err(Error::new(ErrorKind::Unsupported, "reading the SIB"))
    }

    /// Keep the link alive while the terminal is idle
    fn term_keep_alive(&mut self, _part: &Part) -> Result<()> {
        Ok(())
    }

    /// Called once all updates are done, before `disable`
    fn end_programming(&mut self, _part: &Part) -> Result<()> {
        Ok(())
    }

    /// Switch a status LED
    fn set_led(&mut self, _led: Led, _on: bool) -> Result<()> {
        Ok(())
    }

    /// True if the programmer refuses to change `addr` (bootloader areas)
    fn readonly(&self, _part: &Part, _mem: &Memory, _addr: usize) -> bool {
        false
    }

    /// Patch an input image before it is written
    ///
    /// Returns the new number of meaningful bytes. Default is the identity.
    fn flash_readhook(&mut self, _part: &Part, _mem: &mut Memory, size: usize) -> Result<usize> {
        Ok(size)
    }

    /// Release the hardware; called once at the end of a session
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Convenience queries on any programmer
pub trait ProgrammerExt: Programmer {
    /// True if the programmer talks to a resident bootloader
    fn is_spm(&self) -> bool {
        self.prog_modes().contains(ProgModes::SPM)
    }

    /// True if the programmer can drive at least one of the part's modes
    fn supports_part(&self, part: &Part) -> bool {
        self.prog_modes().intersects(part.prog_modes)
    }
}

impl<P: Programmer + ?Sized> ProgrammerExt for P {}

impl Programmer for Box<dyn Programmer> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn prog_modes(&self) -> ProgModes {
        (**self).prog_modes()
    }
    fn initialize(&mut self, part: &Part) -> Result<()> {
        (**self).initialize(part)
    }
    fn enable(&mut self, part: &Part) -> Result<()> {
        (**self).enable(part)
    }
    fn disable(&mut self) -> Result<()> {
        (**self).disable()
    }
    fn program_enable(&mut self, part: &Part) -> Result<()> {
        (**self).program_enable(part)
    }
    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        (**self).chip_erase(part)
    }
    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: usize) -> Result<u8> {
        (**self).read_byte(part, mem, addr)
    }
    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: usize, value: u8) -> Result<()> {
        (**self).write_byte(part, mem, addr, value)
    }
    fn has_paged_access(&self) -> bool {
        (**self).has_paged_access()
    }
    fn paged_load(
        &mut self,
        part: &Part,
        mem: &Memory,
        page_size: usize,
        addr: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        (**self).paged_load(part, mem, page_size, addr, buf)
    }
    fn paged_write(
        &mut self,
        part: &Part,
        mem: &Memory,
        page_size: usize,
        addr: usize,
        data: &[u8],
    ) -> Result<()> {
        (**self).paged_write(part, mem, page_size, addr, data)
    }
    fn has_page_erase(&self) -> bool {
        (**self).has_page_erase()
    }
    fn page_erase(&mut self, part: &Part, mem: &Memory, addr: usize) -> Result<()> {
        (**self).page_erase(part, mem, addr)
    }
    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        (**self).cmd(cmd)
    }
    fn cmd_tpi(&mut self, cmd: &[u8], res: &mut [u8]) -> Result<()> {
        (**self).cmd_tpi(cmd, res)
    }
    fn spi(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        (**self).spi(tx, rx)
    }
    fn set_sck_period(&mut self, period: f64) -> Result<()> {
        (**self).set_sck_period(period)
    }
    fn sck_period(&mut self) -> Result<f64> {
        (**self).sck_period()
    }
    fn set_vtarget(&mut self, volts: f64) -> Result<()> {
        (**self).set_vtarget(volts)
    }
    fn vtarget(&mut self) -> Result<f64> {
        (**self).vtarget()
    }
    fn set_varef(&mut self, channel: u32, volts: f64) -> Result<()> {
        (**self).set_varef(channel, volts)
    }
    fn set_fosc(&mut self, hz: f64) -> Result<()> {
        (**self).set_fosc(hz)
    }
    fn parms(&mut self) -> Result<Vec<(String, String)>> {
        (**self).parms()
    }
    fn read_chip_rev(&mut self, part: &Part) -> Result<u8> {
        (**self).read_chip_rev(part)
    }
    fn read_sib(&mut self, part: &Part) -> Result<String> {
        (**self).read_sib(part)
    }
    fn term_keep_alive(&mut self, part: &Part) -> Result<()> {
        (**self).term_keep_alive(part)
    }
    fn end_programming(&mut self, part: &Part) -> Result<()> {
        (**self).end_programming(part)
    }
    fn set_led(&mut self, led: Led, on: bool) -> Result<()> {
        (**self).set_led(led, on)
    }
    fn readonly(&self, part: &Part, mem: &Memory, addr: usize) -> bool {
        (**self).readonly(part, mem, addr)
    }
    fn flash_readhook(&mut self, part: &Part, mem: &mut Memory, size: usize) -> Result<usize> {
        (**self).flash_readhook(part, mem, size)
    }
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
