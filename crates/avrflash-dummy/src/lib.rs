//! avrflash-dummy - Simulated AVR target for testing
//!
//! This crate provides a programmer that keeps the memories of a catalogue
//! part in host memory. Flash behaves like NOR flash: page writes can only
//! clear bits, so rewriting programmed bytes needs a page or chip erase.
//! EEPROM and fuse writes replace the stored value.
//!
//! It is selectable as `-c dummy` and used by the tests of the page cache,
//! the update planner and the terminal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use avrflash_core::error::{Error, ErrorKind, Result};
use avrflash_core::part::{MemKind, Memory, Part, ProgModes};
use avrflash_core::programmer::{Led, Programmer};

/// Help text for `-x help`
pub const EXTPARAM_HELP: &str = "\
dummy extended parameters:
  -x bootloader           chip erase fails softly, as with a bootloader
  -x pgerase              programmer supports page erase
  -x readonly=<a>[-<b>]   flash bytes a..=b are write protected
  -x help                 show this help";

/// Simulation knobs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DummyConfig {
    /// Behave like a bootloader that cannot erase itself
    pub bootloader: bool,
    /// Provide page erase
    pub page_erase: bool,
    /// Write protected flash address ranges (inclusive)
    pub readonly: Vec<(usize, usize)>,
}

fn parse_addr(s: &str) -> Result<usize> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| Error::new(ErrorKind::IllegalParam, format!("invalid address {}", s)))
}

impl DummyConfig {
    /// Build a configuration from `-x` parameters
    pub fn from_params(params: &[String]) -> Result<Self> {
        let mut config = Self::default();
        for p in params {
            let (key, value) = match p.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (p.as_str(), None),
            };
            match (key, value) {
                ("bootloader", None) => config.bootloader = true,
                ("pgerase", None) => config.page_erase = true,
                ("readonly", Some(v)) => {
                    let range = match v.split_once('-') {
                        Some((lo, hi)) => (parse_addr(lo)?, parse_addr(hi)?),
                        None => {
                            let a = parse_addr(v)?;
                            (a, a)
                        }
                    };
                    if range.0 > range.1 {
                        return Err(Error::new(
                            ErrorKind::IllegalParam,
                            format!("empty readonly range {}", v),
                        ));
                    }
                    config.readonly.push(range);
                }
                _ => {
                    return Err(Error::new(
                        ErrorKind::IllegalParam,
                        format!("invalid extended parameter -x {}; use -x help", p),
                    ))
                }
            }
        }
        Ok(config)
    }
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicUsize,
    writes: AtomicUsize,
    erases: AtomicUsize,
}

/// Shared view on the simulated wire traffic
///
/// Clones observe the same counters, so a test can keep one after the
/// programmer has been boxed into a session.
#[derive(Debug, Clone, Default)]
pub struct Traffic(Arc<Counters>);

impl Traffic {
    /// Read transactions (byte reads and page loads)
    pub fn reads(&self) -> usize {
        self.0.reads.load(Ordering::Relaxed)
    }

    /// Write transactions (byte writes and page writes)
    pub fn writes(&self) -> usize {
        self.0.writes.load(Ordering::Relaxed)
    }

    /// Page and chip erases
    pub fn erases(&self) -> usize {
        self.0.erases.load(Ordering::Relaxed)
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.0.reads.store(0, Ordering::Relaxed);
        self.0.writes.store(0, Ordering::Relaxed);
        self.0.erases.store(0, Ordering::Relaxed);
    }

    fn read(&self) {
        self.0.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write(&self) {
        self.0.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn erase(&self) {
        self.0.erases.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-memory programmer and target
pub struct DummyProgrammer {
    config: DummyConfig,
    /// Contents per canonical memory name; flash sections live in "flash"
    mems: HashMap<String, Vec<u8>>,
    flash_offset: Option<u32>,
    traffic: Traffic,
    leds: [bool; 4],
    vtarget: f64,
    varef: f64,
    fosc: f64,
    sck_period: f64,
    enabled: bool,
}

fn initial_contents(part: &Part, mem: &Memory) -> Vec<u8> {
    match mem.kind {
        MemKind::Signature => (0..mem.size).map(|i| part.signature[i % 3]).collect(),
        MemKind::Calibration => vec![0x5A; mem.size],
        MemKind::SigRow => (0..mem.size).map(|i| (i as u8).wrapping_mul(0x11)).collect(),
        MemKind::Fuse | MemKind::Fuses | MemKind::Lock => {
            vec![mem.initval.unwrap_or(0xFF); mem.size]
        }
        _ => vec![0xFF; mem.size],
    }
}

impl DummyProgrammer {
    /// Simulate `part` with the given knobs
    pub fn new(part: &Part, config: DummyConfig) -> Self {
        let flash_offset = part.flash().map(|f| f.offset);
        let mems = part
            .memories
            .iter()
            .filter(|m| !(m.in_flash() && flash_offset.is_some() && m.kind != MemKind::Flash))
            .map(|m| (m.name.clone(), initial_contents(part, m)))
            .collect();
        Self {
            config,
            mems,
            flash_offset,
            traffic: Traffic::default(),
            leds: [false; 4],
            vtarget: 5.0,
            varef: 5.0,
            fosc: 0.0,
            sck_period: 1e-6,
            enabled: false,
        }
    }

    /// Handle on the traffic counters
    pub fn traffic(&self) -> Traffic {
        self.traffic.clone()
    }

    /// Raw simulated contents of a memory
    pub fn contents(&self, name: &str) -> Option<&[u8]> {
        self.mems.get(name).map(Vec::as_slice)
    }

    /// Preload simulated contents, e.g. to fake programmed flash
    pub fn preload(&mut self, name: &str, addr: usize, data: &[u8]) -> Result<()> {
        let store = self
            .mems
            .get_mut(name)
            .ok_or_else(|| Error::new(ErrorKind::IllegalParam, format!("no memory {}", name)))?;
        let end = addr + data.len();
        if end > store.len() {
            return Err(Error::new(ErrorKind::IllegalParam, "preload beyond end of memory"));
        }
        store[addr..end].copy_from_slice(data);
        Ok(())
    }

    /// Storage name and base index for `mem`
    fn locate(&self, mem: &Memory) -> (String, usize) {
        match self.flash_offset {
            Some(fo) if mem.in_flash() && mem.kind != MemKind::Flash => {
                ("flash".to_string(), mem.offset.saturating_sub(fo) as usize)
            }
            _ => (mem.name.clone(), 0),
        }
    }

    fn store(&mut self, mem: &Memory, addr: usize, len: usize) -> Result<&mut [u8]> {
        let (name, base) = self.locate(mem);
        let store = self
            .mems
            .get_mut(&name)
            .ok_or_else(|| Error::new(ErrorKind::Unsupported, format!("memory {} not simulated", name)))?;
        let (start, end) = (base + addr, base + addr + len);
        if len > mem.size || addr > mem.size - len || end > store.len() {
            return Err(Error::new(
                ErrorKind::IllegalParam,
                format!("{} access 0x{:04x}+{} out of range", mem.name, addr, len),
            ));
        }
        Ok(&mut store[start..end])
    }

    fn protected(&self, mem: &Memory, addr: usize) -> bool {
        if !mem.in_flash() {
            return false;
        }
        let (_, base) = self.locate(mem);
        let a = base + addr;
        self.config.readonly.iter().any(|&(lo, hi)| (lo..=hi).contains(&a))
    }

    fn program(&mut self, mem: &Memory, addr: usize, data: &[u8]) -> Result<()> {
        let replace = !mem.in_flash() && !matches!(mem.kind, MemKind::UserRow | MemKind::BootRow);
        let protected: Vec<bool> = (0..data.len()).map(|i| self.protected(mem, addr + i)).collect();
        let store = self.store(mem, addr, data.len())?;
        for (i, (&b, cell)) in data.iter().zip(store.iter_mut()).enumerate() {
            if protected[i] {
                continue;
            }
            *cell = if replace { b } else { *cell & b };
        }
        Ok(())
    }
}

impl Programmer for DummyProgrammer {
    fn name(&self) -> &str {
        "dummy"
    }

    fn prog_modes(&self) -> ProgModes {
        if self.config.bootloader {
            ProgModes::SPM | ProgModes::BOOTLOADER
        } else {
            ProgModes::all() - ProgModes::SPM - ProgModes::BOOTLOADER
        }
    }

    fn initialize(&mut self, part: &Part) -> Result<()> {
        log::debug!("dummy: simulating {}", part.desc);
        self.program_enable(part)
    }

    fn enable(&mut self, _part: &Part) -> Result<()> {
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        self.enabled = false;
        Ok(())
    }

    fn program_enable(&mut self, _part: &Part) -> Result<()> {
        Ok(())
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        if self.config.bootloader {
            return Err(Error::new(ErrorKind::SoftFail, "bootloader cannot erase the chip"));
        }
        self.traffic.erase();
        if let Some(flash) = part.flash() {
            let flash = flash.clone();
            let protected: Vec<bool> = (0..flash.size).map(|a| self.protected(&flash, a)).collect();
            let store = self.store(&flash, 0, flash.size)?;
            for (b, p) in store.iter_mut().zip(protected) {
                if !p {
                    *b = 0xFF;
                }
            }
        }
        if let Some(ee) = self.mems.get_mut("eeprom") {
            ee.fill(0xFF);
        }
        if let Some(lock) = part.memory("lock") {
            let value = lock.initval.unwrap_or(0xFF);
            if let Some(l) = self.mems.get_mut("lock") {
                l.fill(value);
            }
        }
        Ok(())
    }

    fn read_byte(&mut self, _part: &Part, mem: &Memory, addr: usize) -> Result<u8> {
        self.traffic.read();
        Ok(self.store(mem, addr, 1)?[0])
    }

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: usize, value: u8) -> Result<()> {
        let current = self.store(mem, addr, 1)?[0];
        if mem.readonly {
            if current == value {
                return Ok(());
            }
            return Err(Error::new(
                ErrorKind::ReadOnly,
                format!("cannot write to read-only memory {} of {}", mem.name, part.desc),
            ));
        }
        self.traffic.write();
        self.program(mem, addr, &[value])
    }

    fn has_paged_access(&self) -> bool {
        true
    }

    fn paged_load(
        &mut self,
        _part: &Part,
        mem: &Memory,
        _page_size: usize,
        addr: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        self.traffic.read();
        buf.copy_from_slice(self.store(mem, addr, buf.len())?);
        Ok(())
    }

    fn paged_write(
        &mut self,
        _part: &Part,
        mem: &Memory,
        _page_size: usize,
        addr: usize,
        data: &[u8],
    ) -> Result<()> {
        if mem.readonly {
            return Err(Error::new(ErrorKind::ReadOnly, format!("{} is read-only", mem.name)));
        }
        self.traffic.write();
        self.program(mem, addr, data)
    }

    fn has_page_erase(&self) -> bool {
        self.config.page_erase
    }

    fn page_erase(&mut self, _part: &Part, mem: &Memory, addr: usize) -> Result<()> {
        if !self.config.page_erase {
            return Err(Error::new(ErrorKind::Unsupported, "page erase not enabled"));
        }
        self.traffic.erase();
        let base = mem.page_base(addr);
        let len = mem.page_size.max(1).min(mem.size - base);
        let protected: Vec<bool> = (0..len).map(|i| self.protected(mem, base + i)).collect();
        for (b, p) in self.store(mem, base, len)?.iter_mut().zip(protected) {
            if !p {
                *b = 0xFF;
            }
        }
        Ok(())
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        self.traffic.read();
        let mut res = [0xFF, cmd[0], cmd[1], cmd[2]];
        if cmd[0] == 0x30 {
            let idx = (cmd[2] & 3) as usize;
            res[3] = self
                .mems
                .get("signature")
                .and_then(|s| s.get(idx).copied())
                .unwrap_or(0xFF);
        }
        Ok(res)
    }

    fn set_sck_period(&mut self, period: f64) -> Result<()> {
        self.sck_period = period;
        Ok(())
    }

    fn sck_period(&mut self) -> Result<f64> {
        Ok(self.sck_period)
    }

    fn set_vtarget(&mut self, volts: f64) -> Result<()> {
        if !(0.0..=6.0).contains(&volts) {
            return Err(Error::new(ErrorKind::IllegalParam, format!("{:.1} V out of range", volts)));
        }
        self.vtarget = volts;
        Ok(())
    }

    fn vtarget(&mut self) -> Result<f64> {
        Ok(self.vtarget)
    }

    fn set_varef(&mut self, _channel: u32, volts: f64) -> Result<()> {
        if volts > self.vtarget {
            return Err(Error::new(ErrorKind::IllegalParam, "Varef must not exceed Vtarget"));
        }
        self.varef = volts;
        Ok(())
    }

    fn set_fosc(&mut self, hz: f64) -> Result<()> {
        self.fosc = hz;
        Ok(())
    }

    fn parms(&mut self) -> Result<Vec<(String, String)>> {
        Ok(vec![
            ("Vtarget".into(), format!("{:.1} V", self.vtarget)),
            ("Varef".into(), format!("{:.1} V", self.varef)),
            ("Oscillator".into(), if self.fosc == 0.0 { "off".into() } else { format!("{:.3} Hz", self.fosc) }),
            ("SCK period".into(), format!("{:.1} us", self.sck_period * 1e6)),
        ])
    }

    fn read_chip_rev(&mut self, part: &Part) -> Result<u8> {
        if part.prog_modes.contains(ProgModes::UPDI) {
            Ok(0x01)
        } else {
            Err(Error::new(ErrorKind::Unsupported, "chip revision needs UPDI"))
        }
    }

    fn read_sib(&mut self, part: &Part) -> Result<String> {
        if part.prog_modes.contains(ProgModes::UPDI) {
            Ok(format!("{:<7}P:0D:1-3M2 (01.59B20.0)", part.family_id))
        } else {
            Err(Error::new(ErrorKind::Unsupported, "system information block needs UPDI"))
        }
    }

    fn term_keep_alive(&mut self, _part: &Part) -> Result<()> {
        Ok(())
    }

    fn set_led(&mut self, led: Led, on: bool) -> Result<()> {
        self.leds[led as usize] = on;
        Ok(())
    }

    fn readonly(&self, _part: &Part, mem: &Memory, addr: usize) -> bool {
        self.protected(mem, addr)
    }

    fn close(&mut self) -> Result<()> {
        log::debug!("dummy: closed, {} writes", self.traffic.writes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrflash_core::cache::PageCache;
    use avrflash_core::part::PartDatabase;
    use avrflash_core::progress::NoProgress;
    use avrflash_core::session::Session;
    use avrflash_core::update::{MemUpdate, UpdateFlags};

    fn part(id: &str) -> Part {
        PartDatabase::builtin().unwrap().find(id).unwrap().clone()
    }

    #[test]
    fn test_params() {
        let params = vec!["bootloader".to_string(), "readonly=0x1e00-0x1fff".to_string()];
        let config = DummyConfig::from_params(&params).unwrap();
        assert!(config.bootloader);
        assert!(!config.page_erase);
        assert_eq!(config.readonly, vec![(0x1E00, 0x1FFF)]);

        assert!(DummyConfig::from_params(&["frobnicate".to_string()]).is_err());
        assert!(DummyConfig::from_params(&["readonly=9-3".to_string()]).is_err());
    }

    #[test]
    fn test_flash_writes_only_clear_bits() {
        let p = part("t85");
        let mut pgm = DummyProgrammer::new(&p, DummyConfig::default());
        let flash = p.flash().unwrap().clone();
        pgm.paged_write(&p, &flash, 64, 0, &[0x0F; 64]).unwrap();
        pgm.paged_write(&p, &flash, 64, 0, &[0xF0; 64]).unwrap();
        assert_eq!(pgm.contents("flash").unwrap()[0], 0x00);

        let ee = p.eeprom().unwrap().clone();
        pgm.write_byte(&p, &ee, 3, 0x0F).unwrap();
        pgm.write_byte(&p, &ee, 3, 0xF0).unwrap();
        assert_eq!(pgm.contents("eeprom").unwrap()[3], 0xF0);
    }

    #[test]
    fn test_cache_coherence_after_flush() {
        for config in [DummyConfig::default(), DummyConfig { page_erase: true, ..Default::default() }] {
            let p = part("t85");
            let mut pgm = DummyProgrammer::new(&p, config);
            pgm.preload("flash", 0, &[0x00; 128]).unwrap();
            let flash = p.flash().unwrap().clone();
            let mut cache = PageCache::new();

            cache.write_byte(&mut pgm, &p, &flash, 5, 0xA5).unwrap();
            cache.write_byte(&mut pgm, &p, &flash, 100, 0x3C).unwrap();
            cache.flush(&mut pgm, &p, &mut NoProgress).unwrap();
            cache.reset();

            assert_eq!(cache.read_byte(&mut pgm, &p, &flash, 5).unwrap(), 0xA5);
            assert_eq!(cache.read_byte(&mut pgm, &p, &flash, 100).unwrap(), 0x3C);
            // untouched bytes survive the erase cycle
            assert_eq!(cache.read_byte(&mut pgm, &p, &flash, 6).unwrap(), 0x00);
        }
    }

    #[test]
    fn test_page_erase_used_for_set_bits() {
        let p = part("t85");
        let mut pgm = DummyProgrammer::new(&p, DummyConfig { page_erase: true, ..Default::default() });
        pgm.preload("flash", 64, &[0x00; 64]).unwrap();
        let traffic = pgm.traffic();
        let flash = p.flash().unwrap().clone();
        let mut cache = PageCache::new();
        cache.write_byte(&mut pgm, &p, &flash, 64, 0xFF).unwrap();
        cache.flush(&mut pgm, &p, &mut NoProgress).unwrap();
        assert_eq!(pgm.contents("flash").unwrap()[64], 0xFF);
        assert_eq!(pgm.contents("flash").unwrap()[65], 0x00);
        assert!(traffic.erases() >= 1);
    }

    #[test]
    fn test_readonly_write_of_same_value_is_silent() {
        let p = part("m328p");
        let mut pgm = DummyProgrammer::new(&p, DummyConfig::default());
        let traffic = pgm.traffic();
        let sig = p.memory("signature").unwrap().clone();
        pgm.write_byte(&p, &sig, 0, p.signature[0]).unwrap();
        assert_eq!(traffic.writes(), 0);
        let err = pgm.write_byte(&p, &sig, 0, !p.signature[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadOnly);
        assert_eq!(traffic.writes(), 0);
    }

    #[test]
    fn test_protected_flash_reports_soft_fail() {
        let p = part("t85");
        let config = DummyConfig { readonly: vec![(0x1F00, 0x1FFF)], ..Default::default() };
        let mut pgm = DummyProgrammer::new(&p, config);
        let flash = p.flash().unwrap().clone();
        let mut cache = PageCache::new();
        let err = cache.write_byte(&mut pgm, &p, &flash, 0x1F10, 0x00).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SoftFail);
        cache.write_byte(&mut pgm, &p, &flash, 0x10, 0x00).unwrap();
    }

    #[test]
    fn test_xmega_sections_share_flash() {
        let p = part("x128a1");
        let mut pgm = DummyProgrammer::new(&p, DummyConfig::default());
        let boot = p.memory("boot").unwrap().clone();
        pgm.write_byte(&p, &boot, 0, 0x12).unwrap();
        assert_eq!(pgm.contents("flash").unwrap()[0x20000], 0x12);
        assert!(pgm.contents("boot").is_none());
    }

    #[test]
    fn test_session_upload_and_readback() {
        let p = part("m328p");
        let pgm = DummyProgrammer::new(&p, DummyConfig::default());
        let mut s = Session::new(Box::new(pgm), p, UpdateFlags::default());
        s.start().unwrap();
        s.chip_erase().unwrap();
        let upd = MemUpdate::parse("flash:w:0x0c,0x94,0x5c,0x00:m").unwrap();
        s.do_op(&upd, &mut NoProgress).unwrap();
        let flash = s.part.memory_index("flash").unwrap();
        assert_eq!(s.read_byte(flash, 2).unwrap(), 0x5C);

        let fuse = MemUpdate::parse("hfuse:w:0xd9:m").unwrap();
        s.do_op(&fuse, &mut NoProgress).unwrap();
        s.finish(&mut NoProgress).unwrap();
    }

    #[test]
    fn test_bootloader_erase_is_delayed() {
        let p = part("m328p");
        let pgm = DummyProgrammer::new(&p, DummyConfig { bootloader: true, ..Default::default() });
        let mut s = Session::new(Box::new(pgm), p, UpdateFlags::default());
        s.chip_erase().unwrap();
        assert!(s.erase_pending());
        s.do_op(&MemUpdate::parse("flash:w:1,2,3:m").unwrap(), &mut NoProgress).unwrap();
        assert!(!s.erase_pending());
    }
}
