//! USB link to an FT245R/FT232R in synchronous bit-bang mode
//!
//! In synchronous bit-bang mode the chip clocks out one byte per bit-clock
//! and latches its pins at the same time, so every byte written produces
//! exactly one byte to read. Writes are split into blocks no larger than
//! the chip's receive FIFO and the samples of each block are collected
//! before the next one goes out.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use avrflash_core::programmer::bitbang::BitbangLink;
use avrflash_core::Result as CoreResult;
use ftdi::{find_by_vid_pid, BitMode, Device, Interface};
use nusb::MaybeFuture;

use crate::error::{Ft245rError, Result};

/// FTDI vendor ID
pub const FTDI_VID: u16 = 0x0403;
/// FT245R/FT232R product ID
pub const FT245R_PID: u16 = 0x6001;

/// Bytes written before their samples are collected
const BLOCK: usize = 128;
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Which FT245R to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelection {
    /// N-th matching device
    Index(usize),
    /// Device with this USB serial number
    Serial(String),
}

impl DeviceSelection {
    /// Interpret a `-P` port string
    ///
    /// `usb:ftN` selects the N-th device, `usb:SERIAL` a serial number;
    /// anything else means the first device.
    pub fn parse(port: &str) -> Self {
        match port.strip_prefix("usb:") {
            Some(rest) if rest.starts_with("ft") => rest[2..]
                .parse()
                .map(DeviceSelection::Index)
                .unwrap_or(DeviceSelection::Index(0)),
            Some(sn) if !sn.is_empty() => DeviceSelection::Serial(sn.to_string()),
            _ => DeviceSelection::Index(0),
        }
    }
}

/// Adapter controls beyond the byte stream
pub trait BitbangAdapter: BitbangLink {
    /// Set the adapter's baud rate (bit-clock)
    fn set_baud(&mut self, baud: u32) -> CoreResult<()>;

    /// Leave bit-bang mode and release the pins
    fn shutdown(&mut self) -> CoreResult<()> {
        Ok(())
    }
}

/// An opened FT245R
pub struct FtdiLink {
    device: Device,
    rx: VecDeque<u8>,
    last_out: u8,
}

impl FtdiLink {
    /// Open the selected device in synchronous bit-bang mode
    ///
    /// `mask` selects the output pins and `initial` is driven right away.
    pub fn open(selection: &DeviceSelection, mask: u8, baud: u32, initial: u8) -> Result<Self> {
        let devices: Vec<_> = nusb::list_devices()
            .wait()
            .map_err(|e| Ft245rError::OpenFailed(e.to_string()))?
            .filter(|d| d.vendor_id() == FTDI_VID && d.product_id() == FT245R_PID)
            .collect();
        let position = match selection {
            DeviceSelection::Index(n) => (*n < devices.len()).then_some(*n),
            DeviceSelection::Serial(sn) => devices
                .iter()
                .position(|d| d.serial_number().is_some_and(|s| s.eq_ignore_ascii_case(sn))),
        };
        let position = position.ok_or_else(|| {
            Ft245rError::DeviceNotFound(match selection {
                DeviceSelection::Index(n) => format!(" at index {} ({} present)", n, devices.len()),
                DeviceSelection::Serial(sn) => format!(" with serial number {}", sn),
            })
        })?;
        // libftdi's VID/PID opener always takes the first match
        if position != 0 {
            return Err(Ft245rError::OpenFailed(format!(
                "selected FT245R is device {} of {}; only the first one can be opened",
                position,
                devices.len()
            )));
        }
        let info = &devices[position];
        log::info!(
            "Opening FT245R at bus {} address {}",
            info.busnum(),
            info.device_address()
        );

        let mut device = find_by_vid_pid(FTDI_VID, FT245R_PID)
            .interface(Interface::A)
            .open()
            .map_err(|e| Ft245rError::OpenFailed(e.to_string()))?;

        device
            .usb_reset()
            .map_err(|e| Ft245rError::ConfigFailed(format!("USB reset failed: {}", e)))?;
        device
            .set_latency_timer(1)
            .map_err(|e| Ft245rError::ConfigFailed(format!("set latency timer failed: {}", e)))?;
        device
            .set_bitmode(mask, BitMode::SyncBB)
            .map_err(|e| Ft245rError::ConfigFailed(format!("set sync bit-bang mode failed: {}", e)))?;

        let mut link = Self {
            device,
            rx: VecDeque::new(),
            last_out: initial,
        };
        link.set_baud_raw(baud)?;
        link.purge()?;
        link.send_blocks(&[initial], false)?;
        Ok(link)
    }

    fn set_baud_raw(&mut self, baud: u32) -> Result<()> {
        log::debug!("ft245r: baud rate {}", baud);
        self.device
            .set_baud_rate(baud)
            .map_err(|e| Ft245rError::ConfigFailed(format!("set baud rate {} failed: {}", baud, e)))
    }

    /// Drop anything the chip has buffered
    fn purge(&mut self) -> Result<()> {
        self.rx.clear();
        let mut scratch = [0u8; 256];
        let deadline = Instant::now() + Duration::from_millis(20);
        while Instant::now() < deadline {
            match self.device.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Err(Ft245rError::TransferFailed(format!("read failed: {}", e))),
            }
        }
        Ok(())
    }

    /// Write one block and read back its samples
    fn exchange(&mut self, block: &[u8], keep: bool) -> Result<()> {
        self.device
            .write_all(block)
            .map_err(|e| Ft245rError::TransferFailed(format!("write failed: {}", e)))?;
        if let Some(&b) = block.last() {
            self.last_out = b;
        }

        let mut samples = vec![0u8; block.len()];
        let mut total = 0;
        let deadline = Instant::now() + READ_TIMEOUT;
        while total < samples.len() {
            match self.device.read(&mut samples[total..]) {
                Ok(0) if Instant::now() > deadline => {
                    return Err(Ft245rError::TransferFailed(format!(
                        "timed out after {} of {} samples",
                        total,
                        samples.len()
                    )));
                }
                Ok(0) => std::thread::sleep(Duration::from_micros(100)),
                Ok(n) => total += n,
                Err(e) => return Err(Ft245rError::TransferFailed(format!("read failed: {}", e))),
            }
        }
        if keep {
            self.rx.extend(samples);
        }
        Ok(())
    }

    fn send_blocks(&mut self, buf: &[u8], keep: bool) -> Result<()> {
        for block in buf.chunks(BLOCK) {
            self.exchange(block, keep)?;
        }
        log::trace!("ft245r: sent {} bytes", buf.len());
        Ok(())
    }
}

impl BitbangLink for FtdiLink {
    fn send(&mut self, buf: &[u8]) -> CoreResult<()> {
        Ok(self.send_blocks(buf, true)?)
    }

    fn send_and_discard(&mut self, buf: &[u8]) -> CoreResult<()> {
        Ok(self.send_blocks(buf, false)?)
    }

    fn recv(&mut self, buf: &mut [u8]) -> CoreResult<()> {
        if self.rx.len() < buf.len() {
            return Err(Ft245rError::TransferFailed(format!(
                "asked for {} samples, {} available",
                buf.len(),
                self.rx.len()
            ))
            .into());
        }
        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(())
    }

    fn read_pins(&mut self) -> CoreResult<u8> {
        let out = self.last_out;
        self.send_blocks(&[out], true)?;
        Ok(self.rx.pop_back().unwrap_or(0))
    }

    fn sleep_us(&mut self, us: u64) -> CoreResult<()> {
        std::thread::sleep(Duration::from_micros(us));
        Ok(())
    }
}

impl BitbangAdapter for FtdiLink {
    fn set_baud(&mut self, baud: u32) -> CoreResult<()> {
        Ok(self.set_baud_raw(baud)?)
    }

    fn shutdown(&mut self) -> CoreResult<()> {
        self.device
            .set_bitmode(0, BitMode::SyncBB)
            .map_err(Ft245rError::from)?;
        self.device
            .set_bitmode(0, BitMode::Reset)
            .map_err(Ft245rError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_selection() {
        assert_eq!(DeviceSelection::parse("usb"), DeviceSelection::Index(0));
        assert_eq!(DeviceSelection::parse("usb:ft2"), DeviceSelection::Index(2));
        assert_eq!(
            DeviceSelection::parse("usb:A9048BQ1"),
            DeviceSelection::Serial("A9048BQ1".into())
        );
        assert_eq!(DeviceSelection::parse("/dev/ttyUSB0"), DeviceSelection::Index(0));
    }
}
