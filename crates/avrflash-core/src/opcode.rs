//! ISP opcode templates
//!
//! An opcode is a 32-bit serial programming instruction described bit by bit.
//! Bit 31 is the most significant bit of the first byte sent. Each bit is
//! either a fixed value, ignored, or carries an address, input or output bit.

use std::fmt;

use crate::error::{Error, ErrorKind, Result};

/// Kind of instruction an opcode template implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Read byte (unpaged memories)
    Read,
    /// Read low byte of a flash word
    ReadLo,
    /// Read high byte of a flash word
    ReadHi,
    /// Write byte
    Write,
    /// Write low byte of a flash word
    WriteLo,
    /// Write high byte of a flash word
    WriteHi,
    /// Load low byte into the page buffer
    LoadpageLo,
    /// Load high byte into the page buffer
    LoadpageHi,
    /// Load extended address byte
    LoadExtAddr,
    /// Commit the page buffer
    Writepage,
    /// Chip erase
    ChipErase,
    /// Programming enable
    PgmEnable,
}

impl OpKind {
    /// Number of opcode kinds
    pub const COUNT: usize = 12;

    /// All kinds in table order
    pub const ALL: [OpKind; Self::COUNT] = [
        OpKind::Read,
        OpKind::ReadLo,
        OpKind::ReadHi,
        OpKind::Write,
        OpKind::WriteLo,
        OpKind::WriteHi,
        OpKind::LoadpageLo,
        OpKind::LoadpageHi,
        OpKind::LoadExtAddr,
        OpKind::Writepage,
        OpKind::ChipErase,
        OpKind::PgmEnable,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Catalogue name of this kind
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::ReadLo => "read_lo",
            OpKind::ReadHi => "read_hi",
            OpKind::Write => "write",
            OpKind::WriteLo => "write_lo",
            OpKind::WriteHi => "write_hi",
            OpKind::LoadpageLo => "loadpage_lo",
            OpKind::LoadpageHi => "loadpage_hi",
            OpKind::LoadExtAddr => "load_ext_addr",
            OpKind::Writepage => "writepage",
            OpKind::ChipErase => "chip_erase",
            OpKind::PgmEnable => "pgm_enable",
        }
    }

    /// Look up a kind by its catalogue name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

/// Meaning of a single instruction bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitSpec {
    /// Don't care, sent as 0
    #[default]
    Ignore,
    /// Fixed value
    Value(bool),
    /// Address bit n
    Address(u8),
    /// Input data bit n
    Input(u8),
    /// Output data bit n
    Output(u8),
}

/// A 32-bit instruction template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    /// Bit specs indexed by bit number (0 is the LSB of the last byte)
    bits: [BitSpec; 32],
}

fn byte_and_mask(bit: usize) -> (usize, u8) {
    (3 - bit / 8, 1 << (bit % 8))
}

impl Opcode {
    /// Parse a template like `"1010 1100 0101 0011 xxxx xxxx xxxx xxxx"`
    ///
    /// Tokens are separated by whitespace; the first token is bit 31.
    /// Runs of single-character specs may be written without spaces.
    pub fn parse(s: &str) -> Result<Self> {
        let mut specs = Vec::with_capacity(32);
        for token in s.split_whitespace() {
            let first = token.as_bytes()[0];
            let numbered = token.len() > 1 && token[1..].bytes().all(|b| b.is_ascii_digit());
            if matches!(first, b'a' | b'i' | b'o') && numbered {
                let n: u8 = token[1..]
                    .parse()
                    .map_err(|_| Error::new(ErrorKind::Parse, format!("bad bit spec '{}'", token)))?;
                if n > 31 {
                    return Err(Error::new(ErrorKind::Parse, format!("bit number {} too large", n)));
                }
                specs.push(match first {
                    b'a' => BitSpec::Address(n),
                    b'i' => BitSpec::Input(n),
                    _ => BitSpec::Output(n),
                });
                continue;
            }
            for c in token.chars() {
                // A lone a/i/o takes its bit number from its position in the byte
                let positional = (31usize.saturating_sub(specs.len()) % 8) as u8;
                specs.push(match c {
                    '0' => BitSpec::Value(false),
                    '1' => BitSpec::Value(true),
                    'x' | 'X' => BitSpec::Ignore,
                    'a' => BitSpec::Address(positional),
                    'i' => BitSpec::Input(positional),
                    'o' => BitSpec::Output(positional),
                    _ => {
                        return Err(Error::new(
                            ErrorKind::Parse,
                            format!("bad bit spec '{}' in opcode '{}'", c, s),
                        ))
                    }
                });
            }
        }
        if specs.len() != 32 {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("opcode '{}' has {} bits, expected 32", s, specs.len()),
            ));
        }

        let mut bits = [BitSpec::Ignore; 32];
        for (pos, spec) in specs.into_iter().enumerate() {
            let bitno = 31 - pos;
            bits[bitno] = spec;
        }
        Ok(Self { bits })
    }

    /// Spec for bit `n`
    pub fn bit(&self, n: usize) -> BitSpec {
        self.bits[n]
    }

    /// Write the fixed bits into `cmd`
    pub fn set_bits(&self, cmd: &mut [u8; 4]) {
        for (i, spec) in self.bits.iter().enumerate() {
            if let BitSpec::Value(v) = spec {
                let (j, mask) = byte_and_mask(i);
                if *v {
                    cmd[j] |= mask;
                } else {
                    cmd[j] &= !mask;
                }
            }
        }
    }

    /// Place the address bits of `addr` into `cmd`
    pub fn set_addr(&self, cmd: &mut [u8; 4], addr: u32) {
        for (i, spec) in self.bits.iter().enumerate() {
            if let BitSpec::Address(n) = spec {
                let (j, mask) = byte_and_mask(i);
                if (addr >> n) & 1 != 0 {
                    cmd[j] |= mask;
                } else {
                    cmd[j] &= !mask;
                }
            }
        }
    }

    /// Place the data bits of `data` into `cmd`
    pub fn set_input(&self, cmd: &mut [u8; 4], data: u8) {
        for (i, spec) in self.bits.iter().enumerate() {
            if let BitSpec::Input(n) = spec {
                let (j, mask) = byte_and_mask(i);
                if (data >> n) & 1 != 0 {
                    cmd[j] |= mask;
                } else {
                    cmd[j] &= !mask;
                }
            }
        }
    }

    /// Extract the output data bits from the reply `res`
    pub fn get_output(&self, res: &[u8; 4]) -> u8 {
        let mut data = 0u8;
        for (i, spec) in self.bits.iter().enumerate() {
            if let BitSpec::Output(n) = spec {
                let (j, mask) = byte_and_mask(i);
                if res[j] & mask != 0 && *n < 8 {
                    data |= 1 << n;
                }
            }
        }
        data
    }

    /// Index of the reply byte carrying output bit 0, used for write polling
    pub fn output_byte_index(&self) -> Option<usize> {
        self.bits.iter().enumerate().find_map(|(i, spec)| match spec {
            BitSpec::Output(_) => Some(3 - i / 8),
            _ => None,
        })
    }

    /// Highest address bit used by the template
    pub fn max_address_bit(&self) -> Option<u8> {
        self.bits
            .iter()
            .filter_map(|s| match s {
                BitSpec::Address(n) => Some(*n),
                _ => None,
            })
            .max()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pos in 0..32 {
            if pos > 0 && pos % 8 == 0 {
                write!(f, "  ")?;
            } else if pos > 0 {
                write!(f, " ")?;
            }
            match self.bits[31 - pos] {
                BitSpec::Ignore => write!(f, "x")?,
                BitSpec::Value(v) => write!(f, "{}", v as u8)?,
                BitSpec::Address(n) => write!(f, "a{}", n)?,
                BitSpec::Input(n) => write!(f, "i{}", n)?,
                BitSpec::Output(n) => write!(f, "o{}", n)?,
            }
        }
        Ok(())
    }
}

/// Table of opcode templates for one memory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpcodeSet {
    ops: [Option<Opcode>; OpKind::COUNT],
}

impl OpcodeSet {
    /// Template for `kind`, if defined
    pub fn get(&self, kind: OpKind) -> Option<&Opcode> {
        self.ops[kind.index()].as_ref()
    }

    /// Define or replace the template for `kind`
    pub fn set(&mut self, kind: OpKind, op: Opcode) {
        self.ops[kind.index()] = Some(op);
    }

    /// True if `kind` is defined
    pub fn has(&self, kind: OpKind) -> bool {
        self.ops[kind.index()].is_some()
    }

    /// True if no template is defined
    pub fn is_empty(&self) -> bool {
        self.ops.iter().all(|o| o.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Classic ATmega flash read_lo: 0010 0000 000a15..a8 a7..a0 o7..o0
    const READ_LO: &str = "0 0 1 0 0 0 0 0  0 0 a13 a12 a11 a10 a9 a8  \
                           a7 a6 a5 a4 a3 a2 a1 a0  o o o o o o o o";

    #[test]
    fn test_parse_positional_outputs() {
        let op = Opcode::parse(READ_LO).unwrap();
        assert_eq!(op.bit(31), BitSpec::Value(false));
        assert_eq!(op.bit(29), BitSpec::Value(true));
        assert_eq!(op.bit(8), BitSpec::Address(0));
        assert_eq!(op.bit(21), BitSpec::Address(13));
        assert_eq!(op.bit(7), BitSpec::Output(7));
        assert_eq!(op.bit(0), BitSpec::Output(0));
        assert_eq!(op.get_output(&[0, 0, 0, 0x81]), 0x81);
    }

    #[test]
    fn test_set_addr_and_bits() {
        let op = Opcode::parse(
            "0010 0000 xx a13 a12 a11 a10 a9 a8 a7 a6 a5 a4 a3 a2 a1 a0 o7 o6 o5 o4 o3 o2 o1 o0",
        )
        .unwrap();
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        op.set_addr(&mut cmd, 0x1234);
        assert_eq!(cmd, [0x20, 0x12, 0x34, 0x00]);
        assert_eq!(op.get_output(&[0, 0, 0, 0xA5]), 0xA5);
        assert_eq!(op.output_byte_index(), Some(3));
    }

    #[test]
    fn test_set_input() {
        let op = Opcode::parse(
            "1100 0000 xxxx xxxx xxxx xx a9 a8 a7 a6 a5 a4 a3 a2 a1 a0 \
             i7 i6 i5 i4 i3 i2 i1 i0",
        );
        assert!(op.is_err());

        let op = Opcode::parse(
            "1100 0000 xxxx xx a9 a8 a7 a6 a5 a4 a3 a2 a1 a0 i7 i6 i5 i4 i3 i2 i1 i0",
        )
        .unwrap();
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        op.set_addr(&mut cmd, 0x3FF);
        op.set_input(&mut cmd, 0x5A);
        assert_eq!(cmd, [0xC0, 0x03, 0xFF, 0x5A]);
    }

    #[test]
    fn test_parse_grouped_runs() {
        let op = Opcode::parse("0101 0000 0000 0000 xxxx xxxx oooo oooo").unwrap();
        assert_eq!(op.bit(30), BitSpec::Value(true));
        assert_eq!(op.bit(15), BitSpec::Ignore);
        for n in 0..8 {
            assert_eq!(op.bit(n), BitSpec::Output(n as u8));
        }
        assert_eq!(op.get_output(&[0, 0, 0, 0x62]), 0x62);

        let op = Opcode::parse("1010 1100 111x xxxx xxxx xxxx 11ii iiii").unwrap();
        assert_eq!(op.bit(7), BitSpec::Value(true));
        assert_eq!(op.bit(5), BitSpec::Input(5));
        assert_eq!(op.bit(0), BitSpec::Input(0));
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        op.set_input(&mut cmd, 0x2A);
        assert_eq!(cmd, [0xAC, 0xE0, 0x00, 0xEA]);

        let op = Opcode::parse("0000 0000 aaaa aaaa xxxx xxxx xxxx xxxx").unwrap();
        assert_eq!(op.bit(23), BitSpec::Address(7));
        assert_eq!(op.bit(16), BitSpec::Address(0));
    }

    #[test]
    fn test_parse_numbered_among_runs() {
        let op = Opcode::parse("0100 0000 000x xxxx xx a5 a4 a3 a2 a1 a0 iiii iiii").unwrap();
        assert_eq!(op.bit(13), BitSpec::Address(5));
        assert_eq!(op.bit(8), BitSpec::Address(0));
        assert_eq!(op.bit(7), BitSpec::Input(7));

        let op = Opcode::parse(
            "0010 0000 000 a12 a11 a10 a9 a8 a7 a6 a5 a4 a3 a2 a1 a0 o7 oooo ooo",
        )
        .unwrap();
        assert_eq!(op.bit(20), BitSpec::Address(12));
        assert_eq!(op.bit(7), BitSpec::Output(7));
        assert_eq!(op.bit(3), BitSpec::Output(3));
        assert!(Opcode::parse("0000 0000 0000 0000 0000 0000 o7x oooo ooo").is_err());
    }

    #[test]
    fn test_bad_specs() {
        assert!(Opcode::parse("1010").is_err());
        assert!(Opcode::parse("a40 0000000 00000000 00000000 00000000").is_err());
        assert_eq!(OpKind::from_name("loadpage_hi"), Some(OpKind::LoadpageHi));
        assert_eq!(OpKind::from_name("bogus"), None);
    }
}
