//! Part and memory type definitions

use bitflags::bitflags;

use crate::opcode::OpcodeSet;

bitflags! {
    /// Programming interfaces a part supports or a programmer drives
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProgModes: u32 {
        /// In-system programming over SPI
        const ISP        = 1 << 0;
        /// High-voltage parallel programming
        const PP         = 1 << 1;
        /// High-voltage serial programming
        const HVSP       = 1 << 2;
        /// debugWire single-wire debug interface
        const DEBUGWIRE  = 1 << 3;
        /// Program and Debug Interface (XMEGA)
        const PDI        = 1 << 4;
        /// Unified Program and Debug Interface
        const UPDI       = 1 << 5;
        /// JTAG (mkII-style classic parts)
        const JTAG       = 1 << 6;
        /// JTAG mkI protocol
        const JTAGMKI    = 1 << 7;
        /// JTAG on XMEGA parts
        const XMEGAJTAG  = 1 << 8;
        /// JTAG on AVR32 parts
        const AVR32JTAG  = 1 << 9;
        /// aWire (AVR32)
        const AWIRE      = 1 << 10;
        /// Self-programming through a resident bootloader (SPM)
        const SPM        = 1 << 11;
        /// Bootloader protocol
        const BOOTLOADER = 1 << 12;
        /// Tiny Programming Interface
        const TPI        = 1 << 13;
    }
}

impl ProgModes {
    /// Parse a mode name as used in the catalogue
    pub fn from_mode_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "isp" => Self::ISP,
            "pp" => Self::PP,
            "hvsp" => Self::HVSP,
            "debugwire" | "dw" => Self::DEBUGWIRE,
            "pdi" => Self::PDI,
            "updi" => Self::UPDI,
            "jtag" => Self::JTAG,
            "jtagmki" => Self::JTAGMKI,
            "xmegajtag" => Self::XMEGAJTAG,
            "avr32jtag" => Self::AVR32JTAG,
            "awire" => Self::AWIRE,
            "spm" => Self::SPM,
            "bootloader" => Self::BOOTLOADER,
            "tpi" => Self::TPI,
            _ => return None,
        })
    }

    /// Space separated list of the set mode names
    pub fn names(self) -> String {
        const NAMES: [(ProgModes, &str); 14] = [
            (ProgModes::ISP, "ISP"),
            (ProgModes::PP, "PP"),
            (ProgModes::HVSP, "HVSP"),
            (ProgModes::DEBUGWIRE, "debugWIRE"),
            (ProgModes::PDI, "PDI"),
            (ProgModes::UPDI, "UPDI"),
            (ProgModes::JTAG, "JTAG"),
            (ProgModes::JTAGMKI, "JTAGmkI"),
            (ProgModes::XMEGAJTAG, "XMEGAJTAG"),
            (ProgModes::AVR32JTAG, "AVR32JTAG"),
            (ProgModes::AWIRE, "aWire"),
            (ProgModes::SPM, "SPM"),
            (ProgModes::BOOTLOADER, "bootloader"),
            (ProgModes::TPI, "TPI"),
        ];
        NAMES
            .iter()
            .filter(|(m, _)| self.contains(*m))
            .map(|(_, n)| *n)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

bitflags! {
    /// Miscellaneous part flags consumed by programmer descriptors
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PartFlags: u32 {
        /// JTAG programmer may stream a whole page as one bitstream
        const ALLOW_FULL_PAGE_BITSTREAM = 1 << 0;
        /// JTAG page programming is enabled
        const ENABLE_PAGE_PROGRAMMING   = 1 << 1;
        /// Part is an AVR32
        const AVR32                     = 1 << 2;
    }
}

/// Semantic class of a memory, derived from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    /// Whole program flash
    Flash,
    /// XMEGA application section
    Application,
    /// XMEGA application table section
    Apptable,
    /// XMEGA boot section
    Boot,
    /// Data EEPROM
    Eeprom,
    /// A single fuse byte (`lfuse`, `fuse0`, `efuse`, ...)
    Fuse,
    /// All fuses as one memory
    Fuses,
    /// Lock bits
    Lock,
    /// User signature row
    UserRow,
    /// Boot row (AVR-Dx/Ex)
    BootRow,
    /// Production signature row
    SigRow,
    /// Oscillator calibration bytes
    Calibration,
    /// Device signature
    Signature,
    /// I/O register space
    Io,
    /// Internal SRAM
    Sram,
    /// Anything else
    Other,
}

impl MemKind {
    /// Classify a canonical memory name
    pub fn from_name(name: &str) -> Self {
        match name {
            "flash" => MemKind::Flash,
            "application" => MemKind::Application,
            "apptable" => MemKind::Apptable,
            "boot" => MemKind::Boot,
            "eeprom" => MemKind::Eeprom,
            "fuses" => MemKind::Fuses,
            "lock" => MemKind::Lock,
            "usersig" => MemKind::UserRow,
            "bootrow" => MemKind::BootRow,
            "prodsig" => MemKind::SigRow,
            "calibration" => MemKind::Calibration,
            "signature" => MemKind::Signature,
            "io" => MemKind::Io,
            "sram" => MemKind::Sram,
            "wdtcfg" | "bodcfg" | "osccfg" | "syscfg0" | "syscfg1" | "append" | "bootend"
            | "codesize" | "pdicfg" => MemKind::Fuse,
            n if n.ends_with("fuse") || n.starts_with("fuse") => MemKind::Fuse,
            _ => MemKind::Other,
        }
    }

    /// True for memories that live in program flash
    pub fn in_flash(self) -> bool {
        matches!(
            self,
            MemKind::Flash | MemKind::Application | MemKind::Apptable | MemKind::Boot
        )
    }

    /// True for any fuse memory
    pub fn is_fuse(self) -> bool {
        matches!(self, MemKind::Fuse | MemKind::Fuses)
    }

    /// True for memories that survive chip erase and are written by the user
    pub fn is_user_type(self) -> bool {
        matches!(self, MemKind::UserRow | MemKind::BootRow)
    }
}

/// Byte tag: this byte was explicitly set by the input
pub const TAG_ALLOCATED: u8 = 1;

/// A named memory region of a part
#[derive(Debug, Clone, PartialEq)]
pub struct Memory {
    /// Canonical name
    pub name: String,
    /// Semantic class
    pub kind: MemKind,
    /// Size in bytes
    pub size: usize,
    /// Page size in bytes (1 if unpaged)
    pub page_size: usize,
    /// Offset of the memory in the flat device address space
    pub offset: u32,
    /// Preferred read chunk for programmers that read in blocks
    pub readsize: usize,
    /// Memory supports paged loads and writes
    pub paged: bool,
    /// Memory cannot be written
    pub readonly: bool,
    /// Minimum programming delay in microseconds
    pub min_write_delay: u32,
    /// Maximum programming delay in microseconds
    pub max_write_delay: u32,
    /// Values read back while a write is still in progress
    pub readback: [u8; 2],
    /// Bits that carry information (fuses, lock bits)
    pub bitmask: u8,
    /// Factory default, if known
    pub initval: Option<u8>,
    /// ISP instruction templates
    pub ops: OpcodeSet,
    /// Contents
    pub buf: Vec<u8>,
    /// Per-byte tags, see [`TAG_ALLOCATED`]
    pub tags: Vec<u8>,
}

impl Memory {
    /// Create a memory of `size` bytes filled with 0xFF
    pub fn new(name: &str, size: usize, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            name: name.to_string(),
            kind: MemKind::from_name(name),
            size,
            page_size,
            offset: 0,
            readsize: 0,
            paged: page_size > 1,
            readonly: false,
            min_write_delay: 0,
            max_write_delay: 0,
            readback: [0xFF, 0xFF],
            bitmask: 0xFF,
            initval: None,
            ops: OpcodeSet::default(),
            buf: vec![0xFF; size],
            tags: vec![0; size],
        }
    }

    /// Number of pages
    pub fn num_pages(&self) -> usize {
        self.size / self.page_size.max(1)
    }

    /// True if the memory is part of program flash
    pub fn in_flash(&self) -> bool {
        self.kind.in_flash()
    }

    /// True for the EEPROM
    pub fn is_eeprom(&self) -> bool {
        self.kind == MemKind::Eeprom
    }

    /// True if the memory may use the paged programmer interface
    ///
    /// Paged types are flash sections, EEPROM and the signature/boot rows.
    pub fn is_paged_type(&self) -> bool {
        self.in_flash()
            || matches!(
                self.kind,
                MemKind::Eeprom | MemKind::UserRow | MemKind::BootRow | MemKind::SigRow
            )
    }

    /// Page-geometry check for paged access: power-of-two page dividing the size
    pub fn has_page_geometry(&self) -> bool {
        self.page_size > 0
            && self.page_size.is_power_of_two()
            && self.size > 0
            && self.size % self.page_size == 0
            && self.is_paged_type()
    }

    /// Base address of the page containing `addr`
    pub fn page_base(&self, addr: usize) -> usize {
        addr & !(self.page_size.max(1) - 1)
    }

    /// Clear all tags and set contents to 0xFF
    pub fn clear(&mut self) {
        self.buf.iter_mut().for_each(|b| *b = 0xFF);
        self.tags.iter_mut().for_each(|t| *t = 0);
    }

    /// Mask a value with the memory's bitmask
    pub fn masked(&self, value: u8) -> u8 {
        value & self.bitmask
    }
}

/// A microcontroller part description
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    /// Short id (`m328p`)
    pub id: String,
    /// Description (`ATmega328P`)
    pub desc: String,
    /// Family identifier (UPDI/PDI parts)
    pub family_id: String,
    /// Supported programming modes
    pub prog_modes: ProgModes,
    /// Misc flags
    pub flags: PartFlags,
    /// Device signature
    pub signature: [u8; 3],
    /// Chip erase delay in microseconds
    pub chip_erase_delay: u32,
    /// Index of the poll byte in the programming response
    pub pollindex: u8,
    /// Expected poll value
    pub pollvalue: u8,
    /// Delay after reset before programming enable, in milliseconds
    pub reset_delay_ms: u32,
    /// debugWire flash instruction blob
    pub flash_instr: [u8; 3],
    /// debugWire EEPROM instruction blob
    pub eeprom_instr: [u8; 20],
    /// Size of the smallest boot section in bytes (0 if none)
    pub boot_section_size: u32,
    /// Number of selectable boot section sizes
    pub n_boot_sections: u32,
    /// On-chip debug revision
    pub ocd_rev: u8,
    /// SPMCR register address
    pub spmcr: u8,
    /// RAMPZ register address
    pub rampz: u8,
    /// OCD data register address
    pub idr: u8,
    /// EECR register address (0 means default 0x3F)
    pub eecr: u8,
    /// EIND register address
    pub eind: u8,
    /// NVM controller base (PDI/UPDI)
    pub nvm_base: u32,
    /// MCU control base (PDI/UPDI)
    pub mcu_base: u32,
    /// Part-level ISP instruction templates (pgm_enable, chip_erase)
    pub ops: OpcodeSet,
    /// Memories in catalogue order
    pub memories: Vec<Memory>,
}

/// Alias table: alternative name and the canonical memory name it resolves to
pub const MEMORY_ALIASES: &[(&str, &str)] = &[
    ("fuse", "fuses"),
    ("lockbits", "lock"),
    ("sig", "signature"),
    ("osccal", "calibration"),
    ("userrow", "usersig"),
    ("usersignature", "usersig"),
    ("sigrow", "prodsig"),
    ("fuse0", "wdtcfg"),
    ("fuse1", "bodcfg"),
    ("fuse2", "osccfg"),
    ("fuse5", "syscfg0"),
    ("fuse6", "syscfg1"),
    ("fuse7", "append"),
    ("fuse8", "bootend"),
];

/// Names any part may use; used by the planner to tell typos from absent memories
const KNOWN_MEMORIES: &[&str] = &[
    "flash", "application", "apptable", "boot", "eeprom", "fuses", "lfuse", "hfuse",
    "efuse", "fuse0", "fuse1", "fuse2", "fuse4", "fuse5", "fuse6", "fuse7", "fuse8",
    "fusea", "wdtcfg", "bodcfg", "osccfg", "syscfg0", "syscfg1", "append", "bootend",
    "codesize", "pdicfg", "lock", "usersig", "bootrow", "prodsig", "calibration",
    "signature", "io", "sram", "sernum", "tempsense", "osc16err", "osc20err",
];

/// True if `name` (or an alias of it) is a memory name known to any part
pub fn is_known_memory_name(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    KNOWN_MEMORIES.contains(&name.as_str()) || MEMORY_ALIASES.iter().any(|(a, _)| *a == name)
}

impl Part {
    /// Index of the memory called `name`, resolving aliases
    pub fn memory_index(&self, name: &str) -> Option<usize> {
        let name = name.to_ascii_lowercase();
        if let Some(i) = self.memories.iter().position(|m| m.name == name) {
            return Some(i);
        }
        MEMORY_ALIASES
            .iter()
            .filter(|(alias, _)| *alias == name)
            .find_map(|(_, canonical)| self.memories.iter().position(|m| m.name == *canonical))
            .or_else(|| {
                // Reverse direction: canonical name asked, part uses the alias spelling
                MEMORY_ALIASES
                    .iter()
                    .filter(|(_, canonical)| *canonical == name)
                    .find_map(|(alias, _)| self.memories.iter().position(|m| m.name == *alias))
            })
    }

    /// Memory called `name`, resolving aliases
    pub fn memory(&self, name: &str) -> Option<&Memory> {
        self.memory_index(name).map(|i| &self.memories[i])
    }

    /// Mutable memory called `name`, resolving aliases
    pub fn memory_mut(&mut self, name: &str) -> Option<&mut Memory> {
        self.memory_index(name).map(move |i| &mut self.memories[i])
    }

    /// First memory of the given kind
    pub fn memory_by_kind(&self, kind: MemKind) -> Option<&Memory> {
        self.memories.iter().find(|m| m.kind == kind)
    }

    /// The program flash (or application section if there is no `flash`)
    pub fn flash(&self) -> Option<&Memory> {
        self.memory_by_kind(MemKind::Flash)
            .or_else(|| self.memory_by_kind(MemKind::Application))
    }

    /// The EEPROM
    pub fn eeprom(&self) -> Option<&Memory> {
        self.memory_by_kind(MemKind::Eeprom)
    }

    /// True for XMEGA-style parts (PDI, or UPDI-based AVR8X)
    pub fn is_pdi_or_updi(&self) -> bool {
        self.prog_modes.intersects(ProgModes::PDI | ProgModes::UPDI)
    }

    /// True for parts with XMEGA NVM layout
    pub fn is_xmega(&self) -> bool {
        self.prog_modes.contains(ProgModes::PDI)
    }

    /// True for reduced-core TPI parts
    pub fn is_tpi(&self) -> bool {
        self.prog_modes.contains(ProgModes::TPI)
    }

    /// Default memory for a bare `-U file` update
    pub fn default_update_memory(&self) -> &'static str {
        if self.memory("flash").is_none() && self.memory("application").is_some() {
            "application"
        } else {
            "flash"
        }
    }

    /// Clear all memory buffers and tags
    pub fn clear_buffers(&mut self) {
        for m in &mut self.memories {
            m.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part() -> Part {
        let mut fuses = Memory::new("fuses", 3, 1);
        fuses.bitmask = 0xFF;
        Part {
            id: "t".into(),
            desc: "Test".into(),
            family_id: String::new(),
            prog_modes: ProgModes::ISP,
            flags: PartFlags::empty(),
            signature: [0x1E, 0x95, 0x0F],
            chip_erase_delay: 9000,
            pollindex: 3,
            pollvalue: 0x53,
            reset_delay_ms: 0,
            flash_instr: [0; 3],
            eeprom_instr: [0; 20],
            boot_section_size: 0,
            n_boot_sections: 0,
            ocd_rev: 0,
            spmcr: 0,
            rampz: 0,
            idr: 0,
            eecr: 0,
            eind: 0,
            nvm_base: 0,
            mcu_base: 0,
            ops: OpcodeSet::default(),
            memories: vec![Memory::new("flash", 1024, 64), fuses, Memory::new("lock", 1, 1)],
        }
    }

    #[test]
    fn test_alias_lookup() {
        let p = part();
        assert_eq!(p.memory("fuse").unwrap().name, "fuses");
        assert_eq!(p.memory("LockBits").unwrap().name, "lock");
        assert!(p.memory("eeprom").is_none());
        assert_eq!(p.memory_index("flash"), Some(0));
    }

    #[test]
    fn test_kinds() {
        assert_eq!(MemKind::from_name("hfuse"), MemKind::Fuse);
        assert_eq!(MemKind::from_name("fuse5"), MemKind::Fuse);
        assert!(MemKind::from_name("boot").in_flash());
        assert!(MemKind::from_name("bootrow").is_user_type());
        assert!(is_known_memory_name("userrow"));
        assert!(!is_known_memory_name("flsh"));
    }

    #[test]
    fn test_page_geometry() {
        let m = Memory::new("flash", 1024, 64);
        assert!(m.has_page_geometry());
        assert_eq!(m.num_pages(), 16);
        assert_eq!(m.page_base(130), 128);
        let f = Memory::new("lfuse", 1, 1);
        assert!(!f.has_page_geometry());
        let odd = Memory::new("eeprom", 100, 3);
        assert!(!odd.has_page_geometry());
    }

    #[test]
    fn test_mode_names() {
        let m = ProgModes::ISP | ProgModes::DEBUGWIRE;
        assert_eq!(m.names(), "ISP debugWIRE");
        assert_eq!(ProgModes::from_mode_name("updi"), Some(ProgModes::UPDI));
    }
}
