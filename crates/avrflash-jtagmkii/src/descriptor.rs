//! Device descriptors shipped to the ICE before programming
//!
//! Classic AVRs get the 298-byte device descriptor (296 bytes for old
//! firmware, which lacks the trailing EECR address). XMEGA parts on
//! firmware 7.00 or later get the 50-byte XMEGA parameter block instead.

use avrflash_core::part::{MemKind, Part, PartFlags, ProgModes};

/// Full descriptor length
pub const DESCRIPTOR_LEN: usize = 298;
/// Descriptor length understood by firmware before 4.0
pub const DESCRIPTOR_LEN_OLD: usize = 296;
/// Length of the XMEGA parameter block
pub const XMEGA_PARAMS_LEN: usize = 50;

/// Largest page the ICE accepts in one memory command
pub const MAX_PAGE: usize = 256;

/// Descriptor length for a firmware version, or `None` if the mode takes none
///
/// Returns the length together with a flag asking for an upgrade warning.
pub fn descriptor_len(fwver: u16, is_dragon: bool, spi_mode: bool) -> (Option<usize>, bool) {
    if spi_mode {
        return (None, false);
    }
    if !is_dragon && fwver < 0x0400 {
        (Some(DESCRIPTOR_LEN_OLD), fwver < 0x0310)
    } else {
        (Some(DESCRIPTOR_LEN), false)
    }
}

/// Classic device descriptor
///
/// Only the fields the part catalogue knows are filled; the I/O maps stay
/// zero, which tells the ICE to allow access to every register.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// On-chip debug register address
    pub idr: u8,
    /// SPMCR address
    pub spmcr: u8,
    /// RAMPZ address
    pub rampz: u8,
    /// Flash page size in bytes
    pub flash_page_size: u16,
    /// EEPROM page size in bytes
    pub eeprom_page_size: u8,
    /// Flash size in bytes
    pub flash_size: u32,
    /// debugWIRE EEPROM access instructions
    pub eeprom_instr: [u8; 20],
    /// debugWIRE flash access instructions
    pub flash_instr: [u8; 3],
    /// Number of flash pages
    pub flash_pages: u16,
    /// Part accepts a full page bitstream
    pub allow_full_page_bitstream: bool,
    /// Start of the smallest boot loader section, in words
    pub start_smallest_boot: u16,
    /// Part supports page programming over JTAG
    pub enable_page_programming: bool,
    /// 0x02 for XMEGA-style caches, else 0
    pub cache_type: u8,
    /// EIND address
    pub eind: u8,
    /// EECR address
    pub eecr: u16,
}

impl DeviceDescriptor {
    /// Fill the descriptor from the part definition
    pub fn from_part(part: &Part) -> Self {
        let mut dd = DeviceDescriptor {
            idr: part.idr,
            spmcr: part.spmcr,
            rampz: part.rampz,
            eind: part.eind,
            eecr: if part.eecr != 0 { u16::from(part.eecr) } else { 0x3F },
            allow_full_page_bitstream: part.flags.contains(PartFlags::ALLOW_FULL_PAGE_BITSTREAM),
            enable_page_programming: part.flags.contains(PartFlags::ENABLE_PAGE_PROGRAMMING),
            cache_type: if part.is_pdi_or_updi() { 0x02 } else { 0x00 },
            ..Default::default()
        };
        if let Some(flash) = part.memory_by_kind(MemKind::Flash) {
            let page = flash.page_size.max(1);
            dd.flash_size = flash.size as u32;
            dd.flash_page_size = page as u16;
            dd.flash_pages = (flash.size / page) as u16;
            if part.boot_section_size > 0 {
                dd.start_smallest_boot =
                    ((flash.size as u32).saturating_sub(part.boot_section_size) / 2) as u16;
            }
            if part.prog_modes.contains(ProgModes::DEBUGWIRE) {
                dd.flash_instr = part.flash_instr;
                dd.eeprom_instr = part.eeprom_instr;
            }
        }
        if let Some(eeprom) = part.eeprom() {
            dd.eeprom_page_size = eeprom.page_size as u8;
        }
        dd
    }

    /// Serialise to `len` bytes (298 or 296)
    pub fn to_bytes(&self, len: usize) -> Vec<u8> {
        let mut b = Vec::with_capacity(DESCRIPTOR_LEN);
        // Read/write I/O maps and their extended counterparts
        b.resize(4 * 8 + 4 * 52, 0);
        b.push(self.idr);
        b.push(self.spmcr);
        b.push(self.rampz);
        b.extend_from_slice(&self.flash_page_size.to_le_bytes());
        b.push(self.eeprom_page_size);
        b.extend_from_slice(&[0; 4]); // boot address
        b.extend_from_slice(&[0; 2]); // upper extended I/O location
        b.extend_from_slice(&self.flash_size.to_le_bytes());
        b.extend_from_slice(&self.eeprom_instr);
        b.extend_from_slice(&self.flash_instr);
        b.extend_from_slice(&[0; 2]); // SPH, SPL
        b.extend_from_slice(&self.flash_pages.to_le_bytes());
        b.extend_from_slice(&[0; 2]); // DWDR, DW base PC
        b.push(u8::from(self.allow_full_page_bitstream));
        b.extend_from_slice(&self.start_smallest_boot.to_le_bytes());
        b.push(u8::from(self.enable_page_programming));
        b.push(self.cache_type);
        b.extend_from_slice(&[0; 2]); // SRAM start
        b.extend_from_slice(&[0; 3]); // reset type, PC masks
        b.push(self.eind);
        b.extend_from_slice(&self.eecr.to_le_bytes());
        debug_assert_eq!(b.len(), DESCRIPTOR_LEN);
        b.truncate(len);
        b
    }
}

/// XMEGA NVM layout for CMND_SET_XMEGA_PARAMS
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmegaParams {
    /// Application section offset
    pub app_offset: u32,
    /// Boot section offset
    pub boot_offset: u32,
    /// EEPROM offset
    pub eeprom_offset: u32,
    /// First fuse, aligned down to 16 bytes
    pub fuse_offset: u32,
    /// Lock byte offset
    pub lock_offset: u32,
    /// User signature row offset
    pub usersig_offset: u32,
    /// Production signature row offset
    pub prodsig_offset: u32,
    /// Application section size
    pub app_size: u32,
    /// Boot section size
    pub boot_size: u16,
    /// Flash page size
    pub flash_page_size: u16,
    /// EEPROM size
    pub eeprom_size: u16,
    /// EEPROM page size
    pub eeprom_page_size: u8,
    /// NVM controller base address
    pub nvm_base: u16,
    /// MCU control base address
    pub mcu_base: u16,
}

impl XmegaParams {
    /// Collect the layout from the part's memories
    pub fn from_part(part: &Part) -> Self {
        let mut xp = XmegaParams {
            nvm_base: part.nvm_base as u16,
            mcu_base: part.mcu_base as u16,
            ..Default::default()
        };
        let mut have_fuse = false;
        for m in &part.memories {
            match m.kind {
                MemKind::Flash => xp.flash_page_size = m.page_size as u16,
                MemKind::Eeprom => {
                    xp.eeprom_page_size = m.page_size as u8;
                    xp.eeprom_size = m.size as u16;
                    xp.eeprom_offset = m.offset;
                }
                MemKind::Application => {
                    xp.app_size = m.size as u32;
                    xp.app_offset = m.offset;
                }
                MemKind::Boot => {
                    xp.boot_size = m.size as u16;
                    xp.boot_offset = m.offset;
                }
                MemKind::Fuse if !have_fuse => {
                    have_fuse = true;
                    xp.fuse_offset = m.offset & !15;
                }
                MemKind::Lock => xp.lock_offset = m.offset,
                MemKind::UserRow => xp.usersig_offset = m.offset,
                MemKind::SigRow => xp.prodsig_offset = m.offset,
                _ => {}
            }
        }
        xp
    }

    /// Serialise the 50-byte block
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(XMEGA_PARAMS_LEN);
        b.extend_from_slice(&0x0002u16.to_le_bytes());
        b.push((XMEGA_PARAMS_LEN - 3) as u8);
        for off in [
            self.app_offset,
            self.boot_offset,
            self.eeprom_offset,
            self.fuse_offset,
            self.lock_offset,
            self.usersig_offset,
            self.prodsig_offset,
            crate::protocol::DATA_OFFSET,
        ] {
            b.extend_from_slice(&off.to_le_bytes());
        }
        b.extend_from_slice(&self.app_size.to_le_bytes());
        b.extend_from_slice(&self.boot_size.to_le_bytes());
        b.extend_from_slice(&self.flash_page_size.to_le_bytes());
        b.extend_from_slice(&self.eeprom_size.to_le_bytes());
        b.push(self.eeprom_page_size);
        b.extend_from_slice(&self.nvm_base.to_le_bytes());
        b.extend_from_slice(&self.mcu_base.to_le_bytes());
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrflash_core::part::PartDatabase;

    #[test]
    fn test_descriptor_length_selection() {
        assert_eq!(descriptor_len(0x0700, false, false), (Some(298), false));
        assert_eq!(descriptor_len(0x0312, false, false), (Some(296), false));
        assert_eq!(descriptor_len(0x0300, false, false), (Some(296), true));
        assert_eq!(descriptor_len(0x0300, true, false), (Some(298), false));
        assert_eq!(descriptor_len(0x0700, false, true), (None, false));
    }

    #[test]
    fn test_descriptor_fields() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m328p").unwrap();
        let dd = DeviceDescriptor::from_part(part);
        let b = dd.to_bytes(DESCRIPTOR_LEN);
        assert_eq!(b.len(), 298);
        assert_eq!(u16::from_le_bytes([b[243], b[244]]), 128);
        assert_eq!(u32::from_le_bytes([b[252], b[253], b[254], b[255]]), 32768);
        assert_eq!(u16::from_le_bytes([b[281], b[282]]), 256);
        assert_eq!(dd.to_bytes(DESCRIPTOR_LEN_OLD).len(), 296);
        assert_eq!(dd.cache_type, 0);
    }

    #[test]
    fn test_xmega_params_block() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("x128a1").unwrap();
        let xp = XmegaParams::from_part(part);
        let b = xp.to_bytes();
        assert_eq!(b.len(), XMEGA_PARAMS_LEN);
        assert_eq!(&b[..3], &[0x02, 0x00, 47]);
        assert_eq!(xp.app_offset, 0x80_0000);
        assert_eq!(xp.boot_offset, 0x82_0000);
        assert_eq!(u32::from_le_bytes([b[31], b[32], b[33], b[34]]), 0x100_0000);
        assert_eq!(xp.fuse_offset & 15, 0);
    }
}
