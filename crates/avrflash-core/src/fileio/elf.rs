//! ELF input via `goblin`
//!
//! Loadable segments are taken at their physical (load) address, which
//! avr-gcc sets to the flat section addresses: flash at 0, EEPROM at
//! 0x810000, fuses at 0x820000 and so on.

use goblin::elf::header::EM_AVR;
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use log::{debug, warn};

use super::{Chunk, Image};
use crate::error::{Error, ErrorKind, Result};

pub(super) fn decode(bytes: &[u8]) -> Result<Image> {
    let elf = Elf::parse(bytes).map_err(|e| Error::new(ErrorKind::Parse, format!("ELF: {}", e)))?;
    if elf.header.e_machine != EM_AVR {
        warn!("ELF file is not for AVR (e_machine {})", elf.header.e_machine);
    }

    let mut image = Image::new();
    for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD && ph.p_filesz > 0) {
        let start = ph.p_offset as usize;
        let end = start + ph.p_filesz as usize;
        let data = bytes.get(start..end).ok_or_else(|| {
            Error::new(ErrorKind::Parse, format!("ELF: segment at 0x{:x} exceeds file", ph.p_paddr))
        })?;
        debug!("ELF segment: {} bytes at 0x{:06x}", data.len(), ph.p_paddr);
        image.push(Chunk {
            addr: ph.p_paddr as u32,
            data: data.to_vec(),
        });
    }
    image.sort_by_key(|c| c.addr);
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ELF32 little-endian AVR executable with one load segment
    fn tiny_elf(paddr: u32, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        // e_ident
        f.extend_from_slice(b"\x7fELF");
        f.extend_from_slice(&[1, 1, 1, 0]);
        f.extend_from_slice(&[0; 8]);
        f.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        f.extend_from_slice(&(EM_AVR).to_le_bytes());
        f.extend_from_slice(&1u32.to_le_bytes());
        f.extend_from_slice(&0u32.to_le_bytes()); // entry
        f.extend_from_slice(&52u32.to_le_bytes()); // phoff
        f.extend_from_slice(&0u32.to_le_bytes()); // shoff
        f.extend_from_slice(&0u32.to_le_bytes()); // flags
        f.extend_from_slice(&52u16.to_le_bytes());
        f.extend_from_slice(&32u16.to_le_bytes());
        f.extend_from_slice(&1u16.to_le_bytes());
        f.extend_from_slice(&40u16.to_le_bytes());
        f.extend_from_slice(&0u16.to_le_bytes());
        f.extend_from_slice(&0u16.to_le_bytes());
        // program header
        let off = 52 + 32;
        f.extend_from_slice(&PT_LOAD.to_le_bytes());
        f.extend_from_slice(&(off as u32).to_le_bytes());
        f.extend_from_slice(&(0x80_0000 | paddr).to_le_bytes()); // vaddr
        f.extend_from_slice(&paddr.to_le_bytes());
        f.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        f.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        f.extend_from_slice(&5u32.to_le_bytes());
        f.extend_from_slice(&1u32.to_le_bytes());
        f.extend_from_slice(payload);
        f
    }

    #[test]
    fn test_load_segment_uses_paddr() {
        let image = decode(&tiny_elf(0x81_0000, &[0xDE, 0xAD])).unwrap();
        assert_eq!(image, vec![Chunk { addr: 0x81_0000, data: vec![0xDE, 0xAD] }]);
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(decode(b"\x7fELFjunk").unwrap_err().kind(), ErrorKind::Parse);
    }
}
