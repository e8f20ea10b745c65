//! Byte transports carrying JTAG ICE mkII frames
//!
//! The ICE is reachable through an RS-232 port or over USB bulk endpoints.
//! Both present the same byte stream to the framer.

use std::time::Duration;

use crate::error::Result;

/// Transport trait for reading and writing bytes
pub trait Transport {
    /// Write all bytes
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`
    ///
    /// Returns the number of bytes read, or 0 on timeout.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Discard any pending input
    fn drain(&mut self) -> Result<()>;

    /// Switch the host side to a new baud rate (serial only)
    fn set_baud(&mut self, _baud: u32) -> Result<()> {
        Ok(())
    }

    /// Drive the DTR and RTS lines (serial only)
    fn set_dtr_rts(&mut self, _high: bool) -> Result<()> {
        Ok(())
    }

    /// True if the link is USB
    fn is_usb(&self) -> bool {
        false
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read_timeout(buf, timeout)
    }
    fn drain(&mut self) -> Result<()> {
        (**self).drain()
    }
    fn set_baud(&mut self, baud: u32) -> Result<()> {
        (**self).set_baud(baud)
    }
    fn set_dtr_rts(&mut self, high: bool) -> Result<()> {
        (**self).set_dtr_rts(high)
    }
    fn is_usb(&self) -> bool {
        (**self).is_usb()
    }
}

pub mod serial {
    //! Serial port transport

    use super::*;
    use crate::error::JtagError;
    use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
    use std::io::{Read, Write};

    /// Baud rate the ICE uses after power-up
    pub const INITIAL_BAUD: u32 = 19200;

    /// Serial port transport
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
    }

    impl SerialTransport {
        /// Open a serial port at the ICE's power-up rate
        pub fn open(device: &str) -> Result<Self> {
            let port = serialport::new(device, INITIAL_BAUD)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_secs(5))
                .open()?;

            log::info!("Opened serial port {} at {} baud", device, INITIAL_BAUD);

            Ok(Self { port })
        }
    }

    impl Transport for SerialTransport {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.port.write_all(data)?;
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            self.port.set_timeout(timeout)?;
            match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(JtagError::from(e)),
            }
        }

        fn drain(&mut self) -> Result<()> {
            self.port.clear(ClearBuffer::Input)?;
            Ok(())
        }

        fn set_baud(&mut self, baud: u32) -> Result<()> {
            self.port.set_baud_rate(baud)?;
            log::debug!("jtagmkii: host side now at {} baud", baud);
            Ok(())
        }

        fn set_dtr_rts(&mut self, high: bool) -> Result<()> {
            self.port.write_data_terminal_ready(high)?;
            self.port.write_request_to_send(high)?;
            Ok(())
        }
    }
}

pub mod usb {
    //! USB bulk transport
    //!
    //! A single IN transfer is kept in flight. When a read times out the
    //! transfer stays queued and is picked up by the next read, so no
    //! packet is lost.

    use super::*;
    use crate::error::JtagError;
    use crate::protocol::*;
    use nusb::transfer::{Buffer, Bulk, In, Out};
    use nusb::{Endpoint, MaybeFuture};

    /// USB bulk transport
    pub struct UsbTransport {
        out_ep: Endpoint<Bulk, Out>,
        in_ep: Endpoint<Bulk, In>,
        rx: Vec<u8>,
        rx_pos: usize,
        is_dragon: bool,
    }

    impl UsbTransport {
        /// Open the first JTAG ICE mkII or AVR Dragon, optionally by serial number
        ///
        /// A serial number also matches as a suffix of the device's full one.
        pub fn open(serial: Option<&str>, dragon: bool) -> Result<Self> {
            let pid = if dragon {
                USB_DEVICE_AVRDRAGON
            } else {
                USB_DEVICE_JTAGICEMKII
            };
            let device_info = nusb::list_devices()
                .wait()
                .map_err(|e| JtagError::OpenFailed(e.to_string()))?
                .filter(|d| d.vendor_id() == USB_VENDOR_ATMEL && d.product_id() == pid)
                .find(|d| match serial {
                    None => true,
                    Some(sn) => d
                        .serial_number()
                        .is_some_and(|s| s.eq_ignore_ascii_case(sn) || s.ends_with(sn)),
                })
                .ok_or_else(|| {
                    JtagError::DeviceNotFound(match serial {
                        Some(sn) => format!(" with serial number {}", sn),
                        None => format!(" (VID:{:04x} PID:{:04x})", USB_VENDOR_ATMEL, pid),
                    })
                })?;

            log::info!(
                "Opening {} at bus {} address {}",
                if dragon { "AVR Dragon" } else { "JTAG ICE mkII" },
                device_info.busnum(),
                device_info.device_address()
            );

            let device = device_info
                .open()
                .wait()
                .map_err(|e| JtagError::OpenFailed(e.to_string()))?;
            let interface = device
                .claim_interface(0)
                .wait()
                .map_err(|e| JtagError::OpenFailed(e.to_string()))?;
            let out_ep = interface
                .endpoint::<Bulk, Out>(USB_WRITE_EP)
                .map_err(|e| JtagError::OpenFailed(e.to_string()))?;
            let in_ep = interface
                .endpoint::<Bulk, In>(USB_READ_EP)
                .map_err(|e| JtagError::OpenFailed(e.to_string()))?;

            Ok(Self {
                out_ep,
                in_ep,
                rx: Vec::new(),
                rx_pos: 0,
                is_dragon: dragon,
            })
        }

        /// True if opened with the Dragon's product ID
        pub fn is_dragon(&self) -> bool {
            self.is_dragon
        }

        fn submit_in(&mut self) {
            if self.in_ep.pending() == 0 {
                let mut buf = Buffer::new(USB_MAX_XFER);
                buf.set_requested_len(USB_MAX_XFER);
                self.in_ep.submit(buf);
            }
        }

        fn send_packet(&mut self, data: &[u8]) -> Result<()> {
            let mut buf = Buffer::new(data.len());
            buf.extend_from_slice(data);
            let completion = self.out_ep.transfer_blocking(buf, Duration::from_secs(10));
            match completion.status {
                Ok(()) if completion.actual_len == data.len() => Ok(()),
                Ok(()) => Err(JtagError::TransferFailed(format!(
                    "wrote {} out of {} bytes",
                    completion.actual_len,
                    data.len()
                ))),
                Err(e) => Err(JtagError::TransferFailed(format!("bulk write: {:?}", e))),
            }
        }
    }

    impl Transport for UsbTransport {
        // A frame must end with a short packet, so a frame that fills the
        // last packet is followed by a zero-length one.
        fn write(&mut self, data: &[u8]) -> Result<()> {
            for chunk in data.chunks(USB_MAX_XFER) {
                self.send_packet(chunk)?;
            }
            if data.len() % USB_MAX_XFER == 0 {
                self.send_packet(&[])?;
            }
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            if self.rx_pos >= self.rx.len() {
                self.submit_in();
                let Some(completion) = self.in_ep.wait_next_complete(timeout) else {
                    return Ok(0);
                };
                completion
                    .status
                    .map_err(|e| JtagError::TransferFailed(format!("bulk read: {:?}", e)))?;
                self.rx.clear();
                self.rx
                    .extend_from_slice(&completion.buffer[..completion.actual_len]);
                self.rx_pos = 0;
            }
            let n = buf.len().min(self.rx.len() - self.rx_pos);
            buf[..n].copy_from_slice(&self.rx[self.rx_pos..self.rx_pos + n]);
            self.rx_pos += n;
            Ok(n)
        }

        fn drain(&mut self) -> Result<()> {
            self.rx.clear();
            self.rx_pos = 0;
            self.in_ep.cancel_all();
            while self.in_ep.pending() > 0 {
                let _ = self.in_ep.wait_next_complete(Duration::from_secs(1));
            }
            Ok(())
        }

        fn is_usb(&self) -> bool {
            true
        }
    }

    impl Drop for UsbTransport {
        fn drop(&mut self) {
            let _ = self.drain();
        }
    }
}

#[cfg(test)]
pub(crate) mod loopback {
    //! In-memory transport used by the framer and driver tests

    use super::*;
    use std::collections::VecDeque;

    /// Records what is written and serves scripted input
    #[derive(Default)]
    pub struct Loopback {
        pub written: Vec<u8>,
        pub input: VecDeque<u8>,
    }

    impl Transport for Loopback {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.input.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn drain(&mut self) -> Result<()> {
            self.input.clear();
            Ok(())
        }
    }
}
