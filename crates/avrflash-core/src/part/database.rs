//! Part catalogue for runtime loading and lookup
//!
//! Parts and serial adapters are described in RON files. A part may name a
//! `parent` whose fields and memories it inherits; fields it sets itself
//! override the parent's, and memories override by name. Ids starting with
//! `.` are templates that only exist to be inherited from.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use once_cell::sync::Lazy;

use super::types::{Memory, Part, PartFlags, ProgModes};
use crate::error::{Error, ErrorKind};
use crate::opcode::{OpKind, Opcode, OpcodeSet};

/// Built-in catalogue shipped with the crate
const BUILTIN_CATALOGUE: &str = include_str!("../../parts/avr.ron");

static BUILTIN: Lazy<Result<PartDatabase, String>> = Lazy::new(|| {
    let mut db = PartDatabase::new();
    db.load_ron(BUILTIN_CATALOGUE)
        .map(|_| db)
        .map_err(|e| e.to_string())
});

/// Error type for catalogue operations
#[derive(Debug)]
pub enum PartDbError {
    /// I/O error reading files
    Io(io::Error),
    /// RON parsing error
    Parse(ron::error::SpannedError),
    /// Validation error
    Validation(String),
}

impl From<io::Error> for PartDbError {
    fn from(e: io::Error) -> Self {
        PartDbError::Io(e)
    }
}

impl From<ron::error::SpannedError> for PartDbError {
    fn from(e: ron::error::SpannedError) -> Self {
        PartDbError::Parse(e)
    }
}

impl std::fmt::Display for PartDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartDbError::Io(e) => write!(f, "I/O error: {}", e),
            PartDbError::Parse(e) => write!(f, "Parse error: {}", e),
            PartDbError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for PartDbError {}

impl From<PartDbError> for Error {
    #[track_caller]
    fn from(e: PartDbError) -> Self {
        let kind = match e {
            PartDbError::Io(_) => ErrorKind::Io,
            _ => ErrorKind::Parse,
        };
        Error::new(kind, e.to_string())
    }
}

// ============================================================================
// RON deserialization types (intermediate format)
// ============================================================================

/// Memory definition in RON format
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
struct MemoryDef {
    name: String,
    size: Option<usize>,
    page_size: Option<usize>,
    offset: Option<u32>,
    readsize: Option<usize>,
    paged: Option<bool>,
    readonly: Option<bool>,
    min_write_delay: Option<u32>,
    max_write_delay: Option<u32>,
    readback: Option<(u8, u8)>,
    bitmask: Option<u8>,
    initval: Option<u8>,
    ops: HashMap<String, String>,
}

impl MemoryDef {
    /// Overlay `other` onto `self`
    fn merge(&mut self, other: &MemoryDef) {
        macro_rules! take {
            ($($f:ident),*) => { $( if other.$f.is_some() { self.$f = other.$f.clone(); } )* };
        }
        take!(size, page_size, offset, readsize, paged, readonly, min_write_delay,
              max_write_delay, readback, bitmask, initval);
        for (k, v) in &other.ops {
            self.ops.insert(k.clone(), v.clone());
        }
    }

    fn build(&self, part: &str) -> Result<Memory, PartDbError> {
        let size = self.size.ok_or_else(|| {
            PartDbError::Validation(format!("{}: memory {} has no size", part, self.name))
        })?;
        let page_size = self.page_size.unwrap_or(1).max(1);
        if page_size > 1 && size % page_size != 0 {
            return Err(PartDbError::Validation(format!(
                "{}: memory {} size {} is not a multiple of page size {}",
                part, self.name, size, page_size
            )));
        }

        let mut mem = Memory::new(&self.name, size, page_size);
        mem.offset = self.offset.unwrap_or(0);
        mem.readsize = self.readsize.unwrap_or(0);
        mem.paged = self.paged.unwrap_or(page_size > 1);
        mem.readonly = self.readonly.unwrap_or(false);
        mem.min_write_delay = self.min_write_delay.unwrap_or(0);
        mem.max_write_delay = self.max_write_delay.unwrap_or(0);
        if let Some((a, b)) = self.readback {
            mem.readback = [a, b];
        }
        mem.bitmask = self.bitmask.unwrap_or(0xFF);
        mem.initval = self.initval;

        mem.ops = build_ops(&self.ops, &format!("{} {}", part, self.name))?;
        Ok(mem)
    }
}

fn build_ops(defs: &HashMap<String, String>, owner: &str) -> Result<OpcodeSet, PartDbError> {
    let mut ops = OpcodeSet::default();
    for (name, template) in defs {
        let kind = OpKind::from_name(name).ok_or_else(|| {
            PartDbError::Validation(format!("{}: unknown opcode '{}'", owner, name))
        })?;
        let op = Opcode::parse(template)
            .map_err(|e| PartDbError::Validation(format!("{} {}: {}", owner, name, e)))?;
        ops.set(kind, op);
    }
    Ok(ops)
}

/// Part definition in RON format; every field may be inherited
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
struct PartDef {
    id: String,
    parent: Option<String>,
    desc: Option<String>,
    family_id: Option<String>,
    prog_modes: Option<Vec<String>>,
    signature: Option<(u8, u8, u8)>,
    chip_erase_delay: Option<u32>,
    pollindex: Option<u8>,
    pollvalue: Option<u8>,
    reset_delay_ms: Option<u32>,
    flash_instr: Option<Vec<u8>>,
    eeprom_instr: Option<Vec<u8>>,
    boot_section_size: Option<u32>,
    n_boot_sections: Option<u32>,
    ocd_rev: Option<u8>,
    spmcr: Option<u8>,
    rampz: Option<u8>,
    idr: Option<u8>,
    eecr: Option<u8>,
    eind: Option<u8>,
    nvm_base: Option<u32>,
    mcu_base: Option<u32>,
    allow_full_page_bitstream: Option<bool>,
    enable_page_programming: Option<bool>,
    ops: HashMap<String, String>,
    memories: Vec<MemoryDef>,
}

impl PartDef {
    fn merge(&mut self, child: &PartDef) {
        macro_rules! take {
            ($($f:ident),*) => { $( if child.$f.is_some() { self.$f = child.$f.clone(); } )* };
        }
        take!(desc, family_id, prog_modes, signature, chip_erase_delay, pollindex, pollvalue,
              reset_delay_ms, flash_instr, eeprom_instr, boot_section_size, n_boot_sections,
              ocd_rev, spmcr, rampz, idr, eecr, eind, nvm_base, mcu_base,
              allow_full_page_bitstream, enable_page_programming);
        self.id = child.id.clone();
        self.parent = child.parent.clone();
        for (k, v) in &child.ops {
            self.ops.insert(k.clone(), v.clone());
        }
        for m in &child.memories {
            match self.memories.iter_mut().find(|x| x.name == m.name) {
                Some(existing) => existing.merge(m),
                None => self.memories.push(m.clone()),
            }
        }
    }

    fn build(&self) -> Result<Part, PartDbError> {
        let mut prog_modes = ProgModes::empty();
        for name in self.prog_modes.iter().flatten() {
            prog_modes |= ProgModes::from_mode_name(name).ok_or_else(|| {
                PartDbError::Validation(format!("{}: unknown programming mode '{}'", self.id, name))
            })?;
        }

        let mut flash_instr = [0u8; 3];
        if let Some(fi) = &self.flash_instr {
            if fi.len() != flash_instr.len() {
                return Err(PartDbError::Validation(format!(
                    "{}: flash_instr must have 3 bytes",
                    self.id
                )));
            }
            flash_instr.copy_from_slice(fi);
        }
        let mut eeprom_instr = [0u8; 20];
        if let Some(ei) = &self.eeprom_instr {
            if ei.len() != eeprom_instr.len() {
                return Err(PartDbError::Validation(format!(
                    "{}: eeprom_instr must have 20 bytes",
                    self.id
                )));
            }
            eeprom_instr.copy_from_slice(ei);
        }

        let mut flags = PartFlags::empty();
        if self.allow_full_page_bitstream.unwrap_or(false) {
            flags |= PartFlags::ALLOW_FULL_PAGE_BITSTREAM;
        }
        if self.enable_page_programming.unwrap_or(true) {
            flags |= PartFlags::ENABLE_PAGE_PROGRAMMING;
        }

        let memories = self
            .memories
            .iter()
            .map(|m| m.build(&self.id))
            .collect::<Result<Vec<_>, _>>()?;

        let (s0, s1, s2) = self.signature.unwrap_or((0, 0, 0));
        Ok(Part {
            id: self.id.clone(),
            desc: self.desc.clone().unwrap_or_else(|| self.id.clone()),
            family_id: self.family_id.clone().unwrap_or_default(),
            prog_modes,
            flags,
            signature: [s0, s1, s2],
            chip_erase_delay: self.chip_erase_delay.unwrap_or(0),
            pollindex: self.pollindex.unwrap_or(0),
            pollvalue: self.pollvalue.unwrap_or(0x53),
            reset_delay_ms: self.reset_delay_ms.unwrap_or(0),
            flash_instr,
            eeprom_instr,
            boot_section_size: self.boot_section_size.unwrap_or(0),
            n_boot_sections: self.n_boot_sections.unwrap_or(0),
            ocd_rev: self.ocd_rev.unwrap_or(0),
            spmcr: self.spmcr.unwrap_or(0),
            rampz: self.rampz.unwrap_or(0),
            idr: self.idr.unwrap_or(0),
            eecr: self.eecr.unwrap_or(0),
            eind: self.eind.unwrap_or(0),
            nvm_base: self.nvm_base.unwrap_or(0),
            mcu_base: self.mcu_base.unwrap_or(0),
            ops: build_ops(&self.ops, &self.id)?,
            memories,
        })
    }
}

/// USB-to-serial adapter definition (RON format and runtime)
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct SerialAdapter {
    /// Adapter id as used with `-P`
    pub id: String,
    /// Description
    #[serde(default)]
    pub desc: String,
    /// USB vendor id
    pub vid: u16,
    /// USB product ids
    pub pids: Vec<u16>,
    /// Serial number, if this entry describes one particular adapter
    #[serde(default)]
    pub sn: Option<String>,
}

/// Top-level catalogue file
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
struct CatalogueDef {
    parts: Vec<PartDef>,
    serial_adapters: Vec<SerialAdapter>,
}

// ============================================================================
// Part database
// ============================================================================

/// Runtime part catalogue
#[derive(Debug, Clone, Default)]
pub struct PartDatabase {
    defs: Vec<PartDef>,
    parts: Vec<Part>,
    adapters: Vec<SerialAdapter>,
}

impl PartDatabase {
    /// Create an empty catalogue
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the built-in catalogue
    pub fn builtin() -> Result<Self, PartDbError> {
        BUILTIN
            .as_ref()
            .cloned()
            .map_err(|e| PartDbError::Validation(format!("built-in catalogue: {}", e)))
    }

    /// Load definitions from a RON file, merging with what is loaded
    pub fn load_file(&mut self, path: &Path) -> Result<usize, PartDbError> {
        let content = fs::read_to_string(path)?;
        self.load_ron(&content)
    }

    /// Load definitions from a RON string, merging with what is loaded
    ///
    /// Parts with an id already present replace the earlier definition.
    /// Returns the number of parts defined by `content`.
    pub fn load_ron(&mut self, content: &str) -> Result<usize, PartDbError> {
        let def: CatalogueDef = ron::from_str(content)?;
        let count = def.parts.len();

        let mut defs = self.defs.clone();
        for part in def.parts {
            if part.id.is_empty() {
                return Err(PartDbError::Validation("part without id".into()));
            }
            match defs.iter_mut().find(|d| d.id == part.id) {
                Some(existing) => *existing = part,
                None => defs.push(part),
            }
        }
        let parts = resolve_all(&defs)?;

        for adapter in def.serial_adapters {
            match self.adapters.iter_mut().find(|a| a.id == adapter.id) {
                Some(existing) => *existing = adapter,
                None => self.adapters.push(adapter),
            }
        }
        self.defs = defs;
        self.parts = parts;
        Ok(count)
    }

    /// Load all RON files from a directory
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, PartDbError> {
        let mut total = 0;

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == "ron") {
                total += self.load_file(&path)?;
            }
        }

        Ok(total)
    }

    /// All parts, templates excluded
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|p| !p.id.starts_with('.'))
    }

    /// Number of parts, templates excluded
    pub fn len(&self) -> usize {
        self.parts().count()
    }

    /// Check if the catalogue has no parts
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find a part by id or description (case-insensitive, exact)
    pub fn find(&self, name: &str) -> Option<&Part> {
        self.parts()
            .find(|p| p.id.eq_ignore_ascii_case(name) || p.desc.eq_ignore_ascii_case(name))
    }

    /// Find parts whose signature matches
    pub fn find_by_signature(&self, sig: [u8; 3]) -> Vec<&Part> {
        self.parts().filter(|p| p.signature == sig).collect()
    }

    /// Serial adapters
    pub fn serial_adapters(&self) -> &[SerialAdapter] {
        &self.adapters
    }

    /// Find a serial adapter by id
    pub fn find_adapter(&self, id: &str) -> Option<&SerialAdapter> {
        self.adapters.iter().find(|a| a.id.eq_ignore_ascii_case(id))
    }
}

fn resolve_all(defs: &[PartDef]) -> Result<Vec<Part>, PartDbError> {
    let by_id: HashMap<&str, &PartDef> = defs.iter().map(|d| (d.id.as_str(), d)).collect();
    defs.iter()
        .map(|d| resolve(d, &by_id, 0)?.build())
        .collect()
}

fn resolve(
    def: &PartDef,
    by_id: &HashMap<&str, &PartDef>,
    depth: usize,
) -> Result<PartDef, PartDbError> {
    if depth > 16 {
        return Err(PartDbError::Validation(format!(
            "{}: parent chain too deep or cyclic",
            def.id
        )));
    }
    match &def.parent {
        None => Ok(def.clone()),
        Some(parent_id) => {
            let parent = by_id.get(parent_id.as_str()).ok_or_else(|| {
                PartDbError::Validation(format!("{}: unknown parent '{}'", def.id, parent_id))
            })?;
            let mut merged = resolve(parent, by_id, depth + 1)?;
            merged.merge(def);
            Ok(merged)
        }
    }
}
