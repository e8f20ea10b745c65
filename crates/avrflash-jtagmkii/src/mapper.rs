//! Memory type and address selection for memory commands
//!
//! XMEGA firmware 7.00 and later addresses the application and boot
//! sections separately and does not want the memory's offset in the
//! command; everything older takes flat addresses.

use avrflash_core::part::{MemKind, Memory, Part};

use crate::protocol::*;

/// Firmware version from which XMEGA addressing is section relative
pub const FW_SECTION_RELATIVE: u16 = 0x0700;

/// Maps memory-relative addresses to memory types and command addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapper {
    fwver: u16,
    xmega: bool,
    flash_offset: u32,
    boot_start: u32,
}

impl MemoryMapper {
    /// Mapper for a part on firmware `fwver`
    pub fn new(part: &Part, fwver: u16) -> Self {
        let xmega = part.is_pdi_or_updi();
        let flash = part.memory_by_kind(MemKind::Flash);
        let boot_start = match (flash, part.memory_by_kind(MemKind::Boot)) {
            (Some(f), Some(b)) if xmega => b.offset - f.offset,
            _ => u32::MAX,
        };
        Self {
            fwver,
            xmega,
            flash_offset: flash.map_or(0, |f| f.offset),
            boot_start,
        }
    }

    /// Offset of the boot section from the start of flash (`u32::MAX` if none)
    pub fn boot_start(&self) -> u32 {
        self.boot_start
    }

    fn section_relative(&self) -> bool {
        self.xmega && self.fwver >= FW_SECTION_RELATIVE
    }

    /// Memory type for a flash address
    pub fn mtype(&self, addr: u32) -> u8 {
        if self.xmega {
            if addr >= self.boot_start {
                MTYPE_BOOT_FLASH
            } else {
                MTYPE_FLASH
            }
        } else {
            MTYPE_FLASH_PAGE
        }
    }

    /// Address to put into a memory command for `addr` within `mem`
    pub fn memaddr(&self, mem: &Memory, addr: u32) -> u32 {
        if self.section_relative() {
            if addr >= self.boot_start {
                addr - self.boot_start
            } else {
                addr
            }
        } else {
            addr + mem.offset
        }
    }

    /// Memory type and command address for an address in a flash section
    ///
    /// `flash`, `application`, `apptable` and `boot` all resolve through
    /// their position inside the flash array.
    pub fn flash_target(&self, mem: &Memory, addr: u32) -> (u8, u32) {
        let flat = if self.xmega {
            mem.offset.saturating_sub(self.flash_offset) + addr
        } else {
            addr
        };
        let mtype = match mem.kind {
            MemKind::Flash => self.mtype(flat),
            _ if self.xmega => self.mtype(flat),
            _ => MTYPE_SPM,
        };
        let address = if self.section_relative() {
            if flat >= self.boot_start {
                flat - self.boot_start
            } else {
                flat
            }
        } else {
            addr + mem.offset
        };
        (mtype, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrflash_core::part::PartDatabase;

    #[test]
    fn test_classic_flat_addresses() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m2560").unwrap();
        let flash = part.flash().unwrap();
        let m = MemoryMapper::new(part, 0x0700);
        assert_eq!(m.boot_start(), u32::MAX);
        assert_eq!(m.mtype(0x1F000), MTYPE_FLASH_PAGE);
        assert_eq!(m.memaddr(flash, 0x1F000), 0x1F000);
        assert_eq!(m.flash_target(flash, 0x100), (MTYPE_FLASH_PAGE, 0x100));
    }

    #[test]
    fn test_xmega_new_firmware_is_section_relative() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("x128a1").unwrap();
        let m = MemoryMapper::new(part, 0x0700);
        assert_eq!(m.boot_start(), 0x20000);

        let flash = part.memory("flash").unwrap();
        assert_eq!(m.mtype(0x1FE00), MTYPE_FLASH);
        assert_eq!(m.mtype(0x20000), MTYPE_BOOT_FLASH);
        assert_eq!(m.memaddr(flash, 0x20100), 0x100);
        assert_eq!(m.memaddr(flash, 0x100), 0x100);
        assert_eq!(m.flash_target(flash, 0x20100), (MTYPE_BOOT_FLASH, 0x100));

        let boot = part.memory("boot").unwrap();
        assert_eq!(m.flash_target(boot, 0x200), (MTYPE_BOOT_FLASH, 0x200));
        let apptable = part.memory("apptable").unwrap();
        assert_eq!(m.flash_target(apptable, 0), (MTYPE_FLASH, 0x1E000));
    }

    #[test]
    fn test_xmega_old_firmware_adds_offset() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("x128a1").unwrap();
        let m = MemoryMapper::new(part, 0x0600);
        let flash = part.memory("flash").unwrap();
        assert_eq!(m.memaddr(flash, 0x20100), 0x820100);
        assert_eq!(m.flash_target(flash, 0x20100), (MTYPE_BOOT_FLASH, 0x820100));
        let eeprom = part.memory("eeprom").unwrap();
        assert_eq!(m.memaddr(eeprom, 4), 0x8C0004);
    }
}
