//! Tiny Programming Interface (TPI) NVM access
//!
//! These routines drive the NVM controller of reduced-core parts through a
//! programmer's [`Programmer::cmd_tpi`] primitive. The programmer only has
//! to frame single bytes; addressing, command selection and busy polling
//! happen here.

use log::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::part::{MemKind, Memory, Part};
use crate::programmer::Programmer;

/// Serial LoaD from data space using indirect addressing
pub const CMD_SLD: u8 = 0x20;
/// SLD with post-increment
pub const CMD_SLD_PI: u8 = 0x24;
/// Serial STore to data space using indirect addressing
pub const CMD_SST: u8 = 0x60;
/// SST with post-increment
pub const CMD_SST_PI: u8 = 0x64;
/// Serial STore to Pointer Register (low bit selects the byte)
pub const CMD_SSTPR: u8 = 0x68;
/// Serial IN from I/O space
pub const CMD_SIN: u8 = 0x10;
/// Serial OUT to I/O space
pub const CMD_SOUT: u8 = 0x90;
/// Serial LoaD from Control and Status space
pub const CMD_SLDCS: u8 = 0x80;
/// Serial STore to Control and Status space
pub const CMD_SSTCS: u8 = 0xC0;
/// Serial KEY
pub const CMD_SKEY: u8 = 0xE0;

/// Identification register
pub const REG_TPIIR: u8 = 0x0F;
/// Physical layer control register
pub const REG_TPIPCR: u8 = 0x02;
/// Status register
pub const REG_TPISR: u8 = 0x00;
/// TPISR: NVM programming enabled
pub const TPISR_NVMEN: u8 = 1 << 1;

/// Expected TPIIR value
pub const IDENT_CODE: u8 = 0x80;

/// NVM controller status register
pub const IOREG_NVMCSR: u8 = 0x32;
/// NVMCSR: controller busy
pub const NVMCSR_BSY: u8 = 0x80;
/// NVM controller command register
pub const IOREG_NVMCMD: u8 = 0x33;

/// No operation (read)
pub const NVMCMD_NO_OPERATION: u8 = 0x00;
/// Chip erase
pub const NVMCMD_CHIP_ERASE: u8 = 0x10;
/// Section erase
pub const NVMCMD_SECTION_ERASE: u8 = 0x14;
/// Word write
pub const NVMCMD_WORD_WRITE: u8 = 0x1D;

/// Guard time setting used when entering programming mode
pub const GUARD_TIME: u8 = 0x07;

/// SKEY instruction followed by the NVM programming key
pub const SKEY_CMD: [u8; 9] = [CMD_SKEY, 0xFF, 0x88, 0xD8, 0xCD, 0x45, 0xAB, 0x89, 0x12];

const BUSY_POLLS: usize = 1000;

/// Map an I/O register address into the SIN/SOUT operand field
pub const fn sio_addr(x: u8) -> u8 {
    ((x & 0x30) << 1) | (x & 0x0F)
}

/// True while the NVM controller is busy
pub fn nvm_busy<P: Programmer + ?Sized>(pgm: &mut P) -> Result<bool> {
    let mut res = [0u8; 1];
    pgm.cmd_tpi(&[CMD_SIN | sio_addr(IOREG_NVMCSR)], &mut res)?;
    Ok(res[0] & NVMCSR_BSY != 0)
}

/// Wait for the NVM controller to become idle
pub fn wait_nvm_ready<P: Programmer + ?Sized>(pgm: &mut P) -> Result<()> {
    for _ in 0..BUSY_POLLS {
        if !nvm_busy(pgm)? {
            return Ok(());
        }
    }
    Err(Error::new(ErrorKind::Timeout, "TPI NVM controller stays busy"))
}

/// Load NVMCMD and the pointer register for an access at `addr` in `mem`
pub fn setup_rw<P: Programmer + ?Sized>(
    pgm: &mut P,
    mem: &Memory,
    addr: usize,
    nvmcmd: u8,
) -> Result<()> {
    let ptr = mem.offset as usize + addr;
    pgm.cmd_tpi(&[CMD_SOUT | sio_addr(IOREG_NVMCMD), nvmcmd], &mut [])?;
    pgm.cmd_tpi(&[CMD_SSTPR, (ptr & 0xFF) as u8], &mut [])?;
    pgm.cmd_tpi(&[CMD_SSTPR | 1, ((ptr >> 8) & 0xFF) as u8], &mut [])
}

/// Enter NVM programming mode
pub fn program_enable<P: Programmer + ?Sized>(pgm: &mut P, part: &Part, guard_time: u8) -> Result<()> {
    if !part.is_tpi() {
        return Err(Error::new(ErrorKind::Unsupported, format!("{} has no TPI", part.desc)));
    }
    pgm.cmd_tpi(&[CMD_SSTCS | REG_TPIPCR, guard_time], &mut [])?;

    let mut res = [0u8; 1];
    pgm.cmd_tpi(&[CMD_SLDCS | REG_TPIIR], &mut res)?;
    if res[0] != IDENT_CODE {
        return Err(Error::new(
            ErrorKind::HardFail,
            format!("TPIIR not correct (0x{:02x})", res[0]),
        ));
    }

    pgm.cmd_tpi(&SKEY_CMD, &mut [])?;

    for _ in 0..10 {
        match pgm.cmd_tpi(&[CMD_SLDCS | REG_TPISR], &mut res) {
            Ok(()) if res[0] & TPISR_NVMEN != 0 => return Ok(()),
            Ok(()) => {}
            Err(e) => debug!("TPISR read failed: {}", e),
        }
    }
    Err(Error::new(
        ErrorKind::HardFail,
        "target does not reply when enabling TPI external programming mode",
    ))
}

/// Erase flash through the NVM controller
pub fn chip_erase<P: Programmer + ?Sized>(pgm: &mut P, part: &Part) -> Result<()> {
    let flash = part
        .flash()
        .ok_or_else(|| Error::new(ErrorKind::Unsupported, format!("no flash to erase on {}", part.desc)))?;
    let cmd = [
        CMD_SSTPR,
        ((flash.offset & 0xFF) | 1) as u8,
        CMD_SSTPR | 1,
        ((flash.offset >> 8) & 0xFF) as u8,
        CMD_SOUT | sio_addr(IOREG_NVMCMD),
        NVMCMD_CHIP_ERASE,
        CMD_SST,
        0xFF,
    ];
    wait_nvm_ready(pgm)?;
    pgm.cmd_tpi(&cmd, &mut [])?;
    wait_nvm_ready(pgm)
}

/// Read one byte
pub fn read_byte<P: Programmer + ?Sized>(pgm: &mut P, mem: &Memory, addr: usize) -> Result<u8> {
    wait_nvm_ready(pgm)?;
    setup_rw(pgm, mem, addr, NVMCMD_NO_OPERATION)?;
    let mut res = [0u8; 1];
    pgm.cmd_tpi(&[CMD_SLD], &mut res)?;
    Ok(res[0])
}

/// Read `buf.len()` bytes starting at `addr` with post-increment loads
pub fn read_block<P: Programmer + ?Sized>(
    pgm: &mut P,
    mem: &Memory,
    addr: usize,
    buf: &mut [u8],
) -> Result<()> {
    wait_nvm_ready(pgm)?;
    setup_rw(pgm, mem, addr, NVMCMD_NO_OPERATION)?;
    for b in buf.iter_mut() {
        let mut res = [0u8; 1];
        pgm.cmd_tpi(&[CMD_SLD_PI], &mut res)?;
        *b = res[0];
    }
    Ok(())
}

/// Write one byte
///
/// Flash is word-written only, so single bytes may only go to the
/// configuration section. A fuse write erases the section first.
pub fn write_byte<P: Programmer + ?Sized>(
    pgm: &mut P,
    mem: &Memory,
    addr: usize,
    data: u8,
) -> Result<()> {
    if mem.in_flash() {
        return Err(Error::new(
            ErrorKind::Unsupported,
            "TPI flash is written in words, not bytes",
        ));
    }
    if (mem.offset as usize + addr) & 1 != 0 {
        return Err(Error::new(
            ErrorKind::IllegalParam,
            format!("TPI byte writes need an even address, got 0x{:04x}", addr),
        ));
    }

    wait_nvm_ready(pgm)?;
    if mem.kind.is_fuse() {
        setup_rw(pgm, mem, addr | 1, NVMCMD_SECTION_ERASE)?;
        pgm.cmd_tpi(&[CMD_SST, 0xFF], &mut [])?;
        wait_nvm_ready(pgm)?;
    }

    setup_rw(pgm, mem, addr, NVMCMD_WORD_WRITE)?;
    // the high byte write starts the word write
    pgm.cmd_tpi(&[CMD_SST_PI, data], &mut [])?;
    pgm.cmd_tpi(&[CMD_SST_PI, data], &mut [])?;
    wait_nvm_ready(pgm)
}

/// Write the tagged words of `buf` (one memory image) with word writes
///
/// Words are written low byte first; a word is written if either byte is
/// tagged. Returns the number of bytes covered.
pub fn write_words<P: Programmer + ?Sized>(
    pgm: &mut P,
    mem: &Memory,
    buf: &[u8],
    tags: &[u8],
    size: usize,
) -> Result<usize> {
    const CHUNK: usize = 2;
    let size = size.div_ceil(CHUNK) * CHUNK;
    let size = size.min(buf.len());

    wait_nvm_ready(pgm)?;
    setup_rw(pgm, mem, 0, NVMCMD_WORD_WRITE)?;
    let mut next = 0;
    for i in (0..size).step_by(CHUNK) {
        let wanted = tags[i..(i + CHUNK).min(size)]
            .iter()
            .any(|t| t & crate::part::TAG_ALLOCATED != 0);
        if !wanted {
            continue;
        }
        if next != i {
            setup_rw(pgm, mem, i, NVMCMD_WORD_WRITE)?;
        }
        for b in &buf[i..(i + CHUNK).min(size)] {
            pgm.cmd_tpi(&[CMD_SST_PI, *b], &mut [])?;
        }
        next = i + CHUNK;
        wait_nvm_ready(pgm)?;
    }
    Ok(size)
}

/// True for memories the TPI path reads with post-increment loads
pub fn is_block_readable(mem: &Memory) -> bool {
    mem.in_flash() || matches!(mem.kind, MemKind::Signature | MemKind::Calibration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::ProgModes;
    use std::collections::VecDeque;

    /// Records TPI traffic and answers loads from a queue
    #[derive(Default)]
    struct TpiLog {
        sent: Vec<Vec<u8>>,
        replies: VecDeque<u8>,
    }

    impl Programmer for TpiLog {
        fn name(&self) -> &str {
            "tpilog"
        }
        fn prog_modes(&self) -> ProgModes {
            ProgModes::TPI
        }
        fn initialize(&mut self, _part: &Part) -> Result<()> {
            Ok(())
        }
        fn program_enable(&mut self, _part: &Part) -> Result<()> {
            Ok(())
        }
        fn chip_erase(&mut self, _part: &Part) -> Result<()> {
            Ok(())
        }
        fn read_byte(&mut self, _part: &Part, _mem: &Memory, _addr: usize) -> Result<u8> {
            Ok(0)
        }
        fn write_byte(&mut self, _: &Part, _: &Memory, _: usize, _: u8) -> Result<()> {
            Ok(())
        }
        fn cmd_tpi(&mut self, cmd: &[u8], res: &mut [u8]) -> Result<()> {
            self.sent.push(cmd.to_vec());
            for r in res.iter_mut() {
                // NVMCSR polls read idle unless a reply is queued
                *r = if cmd[0] == CMD_SIN | sio_addr(IOREG_NVMCSR) {
                    0
                } else {
                    self.replies.pop_front().unwrap_or(0)
                };
            }
            Ok(())
        }
    }

    #[test]
    fn test_sio_addr() {
        assert_eq!(sio_addr(IOREG_NVMCSR), 0x62);
        assert_eq!(sio_addr(IOREG_NVMCMD), 0x63);
    }

    #[test]
    fn test_read_byte_sets_pointer() {
        let mut pgm = TpiLog::default();
        pgm.replies.push_back(0x5A);
        let mut mem = Memory::new("flash", 1024, 16);
        mem.offset = 0x4000;
        assert_eq!(read_byte(&mut pgm, &mem, 0x123).unwrap(), 0x5A);
        assert!(pgm.sent.contains(&vec![CMD_SSTPR, 0x23]));
        assert!(pgm.sent.contains(&vec![CMD_SSTPR | 1, 0x41]));
        assert_eq!(pgm.sent.last().unwrap(), &vec![CMD_SLD]);
    }

    #[test]
    fn test_write_words_skips_untagged() {
        let mut pgm = TpiLog::default();
        let mem = Memory::new("flash", 8, 8);
        let buf = [1, 2, 3, 4, 5, 6, 7, 8];
        let tags = [0, 0, 1, 0, 0, 0, 0, 1];
        write_words(&mut pgm, &mem, &buf, &tags, 8).unwrap();
        let stores: Vec<u8> = pgm
            .sent
            .iter()
            .filter(|c| c[0] == CMD_SST_PI)
            .map(|c| c[1])
            .collect();
        assert_eq!(stores, vec![3, 4, 7, 8]);
    }

    #[test]
    fn test_byte_write_rejects_flash() {
        let mut pgm = TpiLog::default();
        let mem = Memory::new("flash", 8, 8);
        assert_eq!(
            write_byte(&mut pgm, &mem, 0, 1).unwrap_err().kind(),
            ErrorKind::Unsupported
        );
        let fuse = Memory::new("fuse", 1, 1);
        assert_eq!(
            write_byte(&mut pgm, &fuse, 1, 1).unwrap_err().kind(),
            ErrorKind::IllegalParam
        );
    }
}
