//! Bit-shift engine for synchronous bit-bang adapters
//!
//! Adapters such as the FT245R in synchronous bit-bang mode clock out one
//! host byte per bit-clock and sample their inputs at the same time, handing
//! back one byte for every byte sent. An SPI bit therefore takes [`CYCLES`]
//! host bytes that differ only in the SCK bit: SCK low with the SDO bit set
//! up, then SCK high. SDI is valid after the rising edge, so the sample for
//! a bit is found [`CYCLES`] bytes after the start of its pair.
//!
//! This module only composes and decodes byte streams; the adapter driver
//! owns the actual I/O through [`BitbangLink`].

use std::fmt;

use crate::error::{Error, ErrorKind, Result};

/// Host bytes per SPI bit
pub const CYCLES: usize = 2;

/// Host bytes per 4-byte ISP instruction
pub const INSTR_BYTES: usize = 4 * 8 * CYCLES;

/// Maximum host bytes sent before waiting for the adapter
pub const FRAGMENT_SIZE: usize = 8 * INSTR_BYTES;

/// Instructions per fragment
pub const INSTRS_PER_FRAGMENT: usize = FRAGMENT_SIZE / INSTR_BYTES;

/// Outstanding fragments before the engine forces a drain
pub const REQ_OUTSTANDINGS: usize = 10;

/// Byte-stream I/O to a synchronous bit-bang adapter
pub trait BitbangLink {
    /// Queue bytes for output; their samples will be read back with `recv`
    fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Queue bytes for output and drop the samples they produce
    fn send_and_discard(&mut self, buf: &[u8]) -> Result<()>;

    /// Receive `buf.len()` samples for bytes sent earlier with `send`
    fn recv(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Read the current input pin state
    fn read_pins(&mut self) -> Result<u8>;

    /// Push out pending bytes and wait `us` microseconds
    fn sleep_us(&mut self, us: u64) -> Result<()>;
}

/// Logical pins of a bit-bang adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pin {
    /// ISP clock
    Sck,
    /// Data to the target (MOSI)
    Sdo,
    /// Data from the target (MISO)
    Sdi,
    /// Target reset
    Reset,
    /// Buffer enable
    Buff,
    /// Target supply
    Vcc,
    /// Error LED
    LedErr,
    /// Programming LED
    LedPgm,
}

impl Pin {
    /// All pins in table order
    pub const ALL: [Pin; 8] = [
        Pin::Sck,
        Pin::Sdo,
        Pin::Sdi,
        Pin::Reset,
        Pin::Buff,
        Pin::Vcc,
        Pin::LedErr,
        Pin::LedPgm,
    ];

    /// Name used in `-x` pin overrides
    pub fn name(self) -> &'static str {
        match self {
            Pin::Sck => "sck",
            Pin::Sdo => "sdo",
            Pin::Sdi => "sdi",
            Pin::Reset => "reset",
            Pin::Buff => "buff",
            Pin::Vcc => "vcc",
            Pin::LedErr => "errled",
            Pin::LedPgm => "pgmled",
        }
    }

    /// Look up a pin by name (`mosi`/`miso` are accepted as aliases)
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mosi" => Some(Pin::Sdo),
            "miso" => Some(Pin::Sdi),
            _ => Self::ALL.into_iter().find(|p| p.name() == name),
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Assignment of a logical pin to an adapter data bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinDef {
    /// Data bus bit, `None` if the pin is not connected
    pub bit: Option<u8>,
    /// Active low
    pub inverted: bool,
}

impl PinDef {
    /// Pin on data bit `bit`
    pub const fn on(bit: u8) -> Self {
        Self {
            bit: Some(bit),
            inverted: false,
        }
    }

    /// Bit mask on the data bus (0 if unconnected)
    pub fn mask(&self) -> u8 {
        self.bit.map_or(0, |b| 1 << b)
    }

    /// Parse `3`, `~3` (inverted) or an empty string (unconnected)
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        let (inverted, num) = match s.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let bit: u8 = num
            .parse()
            .map_err(|_| Error::new(ErrorKind::IllegalParam, format!("bad pin number '{}'", s)))?;
        if bit > 7 {
            return Err(Error::new(
                ErrorKind::IllegalParam,
                format!("pin {} out of range 0..7", bit),
            ));
        }
        Ok(Self {
            bit: Some(bit),
            inverted,
        })
    }
}

impl fmt::Display for PinDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bit {
            None => write!(f, "(not used)"),
            Some(b) if self.inverted => write!(f, "~{}", b),
            Some(b) => write!(f, "{}", b),
        }
    }
}

/// Pin map of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinMap {
    pins: [PinDef; 8],
}

impl PinMap {
    /// Assignment of `pin`
    pub fn get(&self, pin: Pin) -> PinDef {
        self.pins[pin.index()]
    }

    /// Change the assignment of `pin`
    pub fn set(&mut self, pin: Pin, def: PinDef) {
        self.pins[pin.index()] = def;
    }

    /// Builder-style `set`
    pub fn with(mut self, pin: Pin, def: PinDef) -> Self {
        self.set(pin, def);
        self
    }

    /// Direction mask: every connected pin except SDI is an output
    pub fn output_mask(&self) -> u8 {
        Pin::ALL
            .iter()
            .filter(|p| **p != Pin::Sdi)
            .fold(0, |m, p| m | self.get(*p).mask())
    }

    /// Check that the ISP pins are connected and do not share bits
    pub fn validate(&self) -> Result<()> {
        let mut used = 0u8;
        for pin in [Pin::Sck, Pin::Sdo, Pin::Sdi, Pin::Reset] {
            let mask = self.get(pin).mask();
            if mask == 0 {
                return Err(Error::new(
                    ErrorKind::IllegalParam,
                    format!("pin {} must be assigned", pin.name()),
                ));
            }
            if used & mask != 0 {
                return Err(Error::new(
                    ErrorKind::IllegalParam,
                    format!("pin {} shares a data bit with another pin", pin.name()),
                ));
            }
            used |= mask;
        }
        Ok(())
    }

    /// One line per connected pin, for `parms` and `-v`
    pub fn describe(&self) -> Vec<(String, String)> {
        Pin::ALL
            .iter()
            .map(|p| (p.name().to_string(), self.get(*p).to_string()))
            .collect()
    }
}

/// Composes host byte streams and decodes the sampled replies
#[derive(Debug, Clone)]
pub struct BitShifter {
    pins: PinMap,
    out: u8,
}

impl BitShifter {
    /// Create an engine with all outputs at their inactive level
    pub fn new(pins: PinMap) -> Self {
        let mut s = Self { pins, out: 0 };
        for pin in Pin::ALL {
            if pin != Pin::Sdi {
                s.set_pin(pin, false);
            }
        }
        s
    }

    /// Pin map in use
    pub fn pins(&self) -> &PinMap {
        &self.pins
    }

    /// Current output byte
    pub fn out(&self) -> u8 {
        self.out
    }

    /// Drive `pin` to the logical level `on` and return the new output byte
    ///
    /// Unconnected pins are ignored.
    pub fn set_pin(&mut self, pin: Pin, on: bool) -> u8 {
        let def = self.pins.get(pin);
        let mask = def.mask();
        if mask != 0 {
            if on != def.inverted {
                self.out |= mask;
            } else {
                self.out &= !mask;
            }
        }
        self.out
    }

    /// Logical level of `pin` in a sampled byte
    pub fn get_pin(&self, sample: u8, pin: Pin) -> bool {
        let def = self.pins.get(pin);
        (sample & def.mask() != 0) != def.inverted
    }

    /// Append one bit: SCK low with SDO set, then SCK high
    pub fn push_bit(&mut self, buf: &mut Vec<u8>, bit: bool) {
        self.set_pin(Pin::Sdo, bit);
        buf.push(self.set_pin(Pin::Sck, false));
        buf.push(self.set_pin(Pin::Sck, true));
    }

    /// Append one byte, MSB first
    pub fn push_byte(&mut self, buf: &mut Vec<u8>, byte: u8) {
        for i in (0..8).rev() {
            self.push_bit(buf, (byte >> i) & 1 != 0);
        }
    }

    /// Terminate a command sequence with SCK low
    pub fn push_sck_low(&mut self, buf: &mut Vec<u8>) {
        buf.push(self.set_pin(Pin::Sck, false));
    }

    /// Terminate a fragment that more fragments follow by repeating the last byte
    ///
    /// The extra byte lets the last bit's sample be read back.
    pub fn push_stretch(&mut self, buf: &mut Vec<u8>) {
        let last = buf.last().copied().unwrap_or(self.out);
        buf.push(last);
    }

    /// Host bytes for a complete instruction sequence
    pub fn encode_cmd(&mut self, cmd: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(cmd.len() * 8 * CYCLES + 1);
        for &b in cmd {
            self.push_byte(&mut buf, b);
        }
        self.push_sck_low(&mut buf);
        buf
    }

    /// Decode the byte at `offset` (in instruction bytes) from sampled data
    pub fn extract_byte(&self, samples: &[u8], offset: usize) -> u8 {
        let base = offset * 8 * CYCLES;
        let mut r = 0u8;
        for j in 0..8 {
            let pos = base + CYCLES + j * CYCLES;
            if samples
                .get(pos)
                .is_some_and(|s| self.get_pin(*s, Pin::Sdi))
            {
                r |= 0x80 >> j;
            }
        }
        r
    }

    /// Send an instruction and return the bytes clocked back
    pub fn transfer<L: BitbangLink + ?Sized>(&mut self, link: &mut L, cmd: &[u8]) -> Result<Vec<u8>> {
        let tx = self.encode_cmd(cmd);
        let mut rx = vec![0u8; tx.len()];
        link.send(&tx)?;
        link.recv(&mut rx)?;
        Ok((0..cmd.len()).map(|i| self.extract_byte(&rx, i)).collect())
    }

    // ------------------------------------------------------------------
    // TPI
    // ------------------------------------------------------------------

    /// Append one TPI frame: start, 8 data bits LSB first, even parity, 2 stop bits
    pub fn push_tpi_byte(&mut self, buf: &mut Vec<u8>, byte: u8) {
        self.push_bit(buf, false);
        let mut parity = false;
        for i in 0..8 {
            let bit = (byte >> i) & 1 != 0;
            parity ^= bit;
            self.push_bit(buf, bit);
        }
        self.push_bit(buf, parity);
        self.push_bit(buf, true);
        self.push_bit(buf, true);
    }

    /// Host bytes that clock 16 idle bits while receiving a TPI frame
    pub fn encode_tpi_rx(&mut self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 * 8 * CYCLES);
        self.push_byte(&mut buf, 0xFF);
        self.push_byte(&mut buf, 0xFF);
        buf
    }

    /// Collect the 16 sampled line bits of a TPI receive, LSB first
    pub fn extract_tpi_bits(&self, samples: &[u8]) -> u32 {
        let mut res = 0u32;
        for j in 0..16 {
            // sample on the rising edge, skipping the falling one
            let pos = j * CYCLES + 1;
            if samples
                .get(pos)
                .is_some_and(|s| self.get_pin(*s, Pin::Sdi))
            {
                res |= 1 << j;
            }
        }
        res
    }

    /// Send one TPI byte, discarding what is clocked back
    pub fn tpi_tx<L: BitbangLink + ?Sized>(&mut self, link: &mut L, byte: u8) -> Result<()> {
        let mut buf = Vec::with_capacity(12 * CYCLES);
        self.push_tpi_byte(&mut buf, byte);
        link.send_and_discard(&buf)
    }

    /// Receive one TPI byte
    pub fn tpi_rx<L: BitbangLink + ?Sized>(&mut self, link: &mut L) -> Result<u8> {
        let tx = self.encode_tpi_rx();
        let mut rx = vec![0u8; tx.len()];
        link.send(&tx)?;
        link.recv(&mut rx)?;
        decode_tpi_frame(self.extract_tpi_bits(&rx))
    }
}

/// Decode a TPI frame from line bits sampled LSB first
///
/// Up to 4 idle (1) bits may precede the start bit.
pub fn decode_tpi_frame(res: u32) -> Result<u8> {
    let mut m = 1u32;
    while m & res != 0 {
        m <<= 1;
    }
    if m >= 0x10 {
        return Err(Error::new(
            ErrorKind::BadFrame,
            format!("TPI start bit missing (res=0x{:04x})", res),
        ));
    }
    let mut byte = 0u8;
    let mut parity = false;
    for i in 0..8 {
        m <<= 1;
        let bit = res & m != 0;
        parity ^= bit;
        if bit {
            byte |= 1 << i;
        }
    }
    m <<= 1;
    if (res & m != 0) != parity {
        return Err(Error::new(ErrorKind::BadFrame, "TPI parity bit wrong"));
    }
    if res & (m << 1) == 0 || res & (m << 2) == 0 {
        return Err(Error::new(ErrorKind::BadFrame, "TPI stop bits wrong"));
    }
    Ok(byte)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pins() -> PinMap {
        PinMap::default()
            .with(Pin::Sck, PinDef::on(0))
            .with(Pin::Sdi, PinDef::on(1))
            .with(Pin::Sdo, PinDef::on(2))
            .with(Pin::Reset, PinDef::on(4))
    }

    /// Build the samples an AVR would clock back with `reply` on SDI
    fn samples_for(reply: &[u8]) -> Vec<u8> {
        let mut s = vec![0u8; reply.len() * 8 * CYCLES + 1];
        for (i, byte) in reply.iter().enumerate() {
            for j in 0..8 {
                if byte & (0x80 >> j) != 0 {
                    s[i * 8 * CYCLES + CYCLES + j * CYCLES] |= 1 << 1;
                }
            }
        }
        s
    }

    #[test]
    fn test_instruction_is_64_bytes_with_32_clocks() {
        let mut e = BitShifter::new(pins());
        let buf = e.encode_cmd(&[0xAC, 0x53, 0x00, 0x00]);
        assert_eq!(buf.len(), INSTR_BYTES + 1);
        let rising = buf.windows(2).filter(|w| w[0] & 1 == 0 && w[1] & 1 != 0).count();
        assert_eq!(rising, 32);
        // each pair differs only in SCK
        for pair in buf[..INSTR_BYTES].chunks(2) {
            assert_eq!(pair[0] ^ pair[1], 0x01);
        }
        assert_eq!(buf.last().unwrap() & 1, 0);
        // first bit of 0xAC is 1, second 0
        assert_ne!(buf[1] & 0x04, 0);
        assert_eq!(buf[3] & 0x04, 0);
    }

    #[test]
    fn test_extract_reply() {
        let e = BitShifter::new(pins());
        let samples = samples_for(&[0x00, 0xAC, 0x53, 0x1E]);
        assert_eq!(e.extract_byte(&samples, 2), 0x53);
        assert_eq!(e.extract_byte(&samples, 3), 0x1E);
    }

    #[test]
    fn test_inverted_pins() {
        let map = pins().with(Pin::Reset, PinDef::parse("~4").unwrap());
        let mut e = BitShifter::new(map);
        // reset inactive means the inverted line is high
        assert_ne!(e.out() & 0x10, 0);
        e.set_pin(Pin::Reset, true);
        assert_eq!(e.out() & 0x10, 0);
        assert_eq!(map.output_mask(), 0x15);
        assert!(map.validate().is_ok());
        assert!(PinMap::default().validate().is_err());
        assert!(PinDef::parse("9").is_err());
    }

    #[test]
    fn test_tpi_frame() {
        let mut e = BitShifter::new(pins());
        let mut buf = Vec::new();
        e.push_tpi_byte(&mut buf, 0x80);
        assert_eq!(buf.len(), 12 * CYCLES);

        // two idle bits, start, 0x80 LSB first, parity 1, two stops
        let mut res = 0b11u32;
        res |= 0x80 << 3;
        res |= 1 << 11;
        res |= 0b11 << 12;
        res |= 0xFFFF_C000 & 0xFFFF;
        assert_eq!(decode_tpi_frame(res).unwrap(), 0x80);

        let bad_parity = res & !(1 << 11);
        assert_eq!(
            decode_tpi_frame(bad_parity).unwrap_err().kind(),
            ErrorKind::BadFrame
        );
        assert!(decode_tpi_frame(0xFFFF).is_err());
    }
}
