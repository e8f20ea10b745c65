//! Page cache for byte-level access to paged memories
//!
//! Byte reads and writes from the terminal and the update planner go
//! through this cache whenever the programmer has paged access to the
//! memory. Each cached memory keeps the last contents read from the
//! device (`copy`) next to the pending contents (`cont`); [`PageCache::flush`]
//! writes back every page where the two differ, erasing pages or the whole
//! chip when the memory behaves like NOR flash.
//!
//! Flash, EEPROM, the user row and the boot row are cached. Other memories
//! pass straight through to the programmer.

use log::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::part::{MemKind, Memory, Part};
use crate::progress::Progress;
use crate::programmer::{Led, Programmer, ProgrammerExt};

/// Cached memory classes, in flush order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSlot {
    /// Program flash (all flash sections share one cache)
    Flash,
    /// EEPROM
    Eeprom,
    /// Boot row
    BootRow,
    /// User row / user signature
    UserRow,
}

impl CacheSlot {
    const ALL: [CacheSlot; 4] = [
        CacheSlot::Flash,
        CacheSlot::Eeprom,
        CacheSlot::BootRow,
        CacheSlot::UserRow,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Slot caching `mem`, if any
    pub fn for_memory(mem: &Memory) -> Option<Self> {
        if mem.is_eeprom() {
            Some(CacheSlot::Eeprom)
        } else if mem.in_flash() {
            Some(CacheSlot::Flash)
        } else {
            match mem.kind {
                MemKind::BootRow => Some(CacheSlot::BootRow),
                MemKind::UserRow => Some(CacheSlot::UserRow),
                _ => None,
            }
        }
    }

    /// The memory whose geometry defines this slot
    fn base_memory(self, part: &Part) -> Option<&Memory> {
        match self {
            CacheSlot::Flash => part.flash(),
            CacheSlot::Eeprom => part.eeprom(),
            CacheSlot::BootRow => part.memory_by_kind(MemKind::BootRow),
            CacheSlot::UserRow => part.memory_by_kind(MemKind::UserRow),
        }
    }

    fn is_user_type(self) -> bool {
        matches!(self, CacheSlot::BootRow | CacheSlot::UserRow)
    }
}

#[derive(Debug, Clone)]
struct CachedMem {
    size: usize,
    page_size: usize,
    offset: u32,
    /// Pending contents
    cont: Vec<u8>,
    /// Device contents as last read or written
    copy: Vec<u8>,
    iscached: Vec<bool>,
}

impl CachedMem {
    fn page_changed(&self, n: usize) -> bool {
        let ps = self.page_size;
        self.cont[n..n + ps] != self.copy[n..n + ps]
    }
}

/// True if `mem` can be accessed page-wise through `pgm`
pub fn has_paged_access<P: Programmer + ?Sized>(pgm: &P, mem: &Memory) -> bool {
    pgm.has_paged_access() && mem.has_page_geometry()
}

fn all_ff(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0xFF)
}

/// True if `result` could come from NOR-programming `data` over `old`
fn is_and(result: &[u8], old: &[u8], data: &[u8]) -> bool {
    result
        .iter()
        .zip(old.iter().zip(data))
        .all(|(r, (o, d))| *r == o & d)
}

/// Read the page containing `addr` into `buf`, falling back to byte reads
pub fn read_page_default<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: usize,
    buf: &mut [u8],
) -> Result<()> {
    if !has_paged_access(pgm, mem) || addr >= mem.size {
        return Err(Error::new(
            ErrorKind::IllegalParam,
            format!("no paged access to {} at 0x{:04x}", mem.name, addr),
        ));
    }
    let ps = mem.page_size;
    let base = mem.page_base(addr);
    let buf = &mut buf[..ps];
    match pgm.paged_load(part, mem, ps, base, buf) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("paged load of {} failed ({}), reading bytes", mem.name, e);
            for (i, b) in buf.iter_mut().enumerate() {
                *b = pgm.read_byte(part, mem, base + i)?;
            }
            Ok(())
        }
    }
}

/// Write one page of `data` to the page containing `addr`
pub fn write_page_default<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: usize,
    data: &[u8],
) -> Result<()> {
    if !has_paged_access(pgm, mem) || addr >= mem.size {
        return Err(Error::new(
            ErrorKind::IllegalParam,
            format!("no paged access to {} at 0x{:04x}", mem.name, addr),
        ));
    }
    let ps = mem.page_size;
    pgm.paged_write(part, mem, ps, mem.page_base(addr), &data[..ps])
}

/// Byte-level cache over the paged memories of one part
#[derive(Debug, Clone, Default)]
pub struct PageCache {
    slots: [Option<CachedMem>; 4],
}

impl PageCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// True if any page holds changes not yet written
    pub fn is_dirty(&self) -> bool {
        self.slots.iter().flatten().any(|cm| {
            (0..cm.size)
                .step_by(cm.page_size)
                .enumerate()
                .any(|(pg, n)| cm.iscached[pg] && cm.page_changed(n))
        })
    }

    /// Drop all cached pages and pending writes
    pub fn reset(&mut self) {
        self.slots = Default::default();
    }

    fn init<P: Programmer + ?Sized>(&mut self, slot: CacheSlot, pgm: &mut P, part: &Part) -> Result<()> {
        if self.slots[slot.index()].is_some() {
            return Ok(());
        }
        let base = slot
            .base_memory(part)
            .filter(|m| has_paged_access(pgm, m))
            .ok_or_else(|| Error::new(ErrorKind::Unsupported, "memory cannot be cached"))?;
        let npages = base.size / base.page_size;
        self.slots[slot.index()] = Some(CachedMem {
            size: base.size,
            page_size: base.page_size,
            offset: base.offset,
            cont: vec![0xFF; base.size],
            copy: vec![0xFF; base.size],
            iscached: vec![false; npages],
        });
        if pgm.is_spm() && slot == CacheSlot::Flash {
            // a vector bootloader may patch the reset vector page
            let base = base.clone();
            self.load_page(slot, pgm, part, &base, 0)?;
        }
        Ok(())
    }

    fn cache_addr(&self, slot: CacheSlot, mem: &Memory, addr: usize) -> Result<usize> {
        let cm = self.slots[slot.index()]
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::IllegalState, "cache not initialised"))?;
        let caddr = addr as i64 + i64::from(mem.offset) - i64::from(cm.offset);
        if caddr < 0 || caddr as usize >= cm.size {
            return Err(Error::new(
                ErrorKind::IllegalParam,
                format!(
                    "{} cache address 0x{:04x} out of range [0, 0x{:04x}]",
                    mem.name,
                    caddr,
                    cm.size - 1
                ),
            ));
        }
        if mem.page_size != cm.page_size {
            return Err(Error::new(
                ErrorKind::IllegalParam,
                format!(
                    "{} page size {} incompatible with cache page size {}",
                    mem.name, mem.page_size, cm.page_size
                ),
            ));
        }
        Ok(caddr as usize)
    }

    fn slot_mut(&mut self, slot: CacheSlot) -> Result<&mut CachedMem> {
        self.slots[slot.index()]
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::IllegalState, "cache not initialised"))
    }

    /// Ensure the page holding cache address `caddr` is loaded
    fn load_page<P: Programmer + ?Sized>(
        &mut self,
        slot: CacheSlot,
        pgm: &mut P,
        part: &Part,
        mem: &Memory,
        caddr: usize,
    ) -> Result<()> {
        let cm = self.slot_mut(slot)?;
        let ps = cm.page_size;
        let pgno = caddr / ps;
        if cm.iscached[pgno] {
            return Ok(());
        }
        let cbase = caddr & !(ps - 1);
        let mut page = vec![0u8; ps];
        let maddr = cbase as i64 + i64::from(cm.offset) - i64::from(mem.offset);
        read_page_default(pgm, part, mem, maddr as usize, &mut page).map_err(|e| {
            e.with_context(format!("unable to read {} page at addr 0x{:04x}", mem.name, maddr))
        })?;
        let cm = self.slot_mut(slot)?;
        cm.cont[cbase..cbase + ps].copy_from_slice(&page);
        cm.copy[cbase..cbase + ps].copy_from_slice(&page);
        cm.iscached[pgno] = true;
        Ok(())
    }

    /// Write the pending page at cache address `cbase` and read it back into `copy`
    fn write_page<P: Programmer + ?Sized>(
        &mut self,
        slot: CacheSlot,
        pgm: &mut P,
        part: &Part,
        mem: &Memory,
        cbase: usize,
    ) -> Result<()> {
        pgm.set_led(Led::Pgm, true)?;
        let cm = self.slot_mut(slot)?;
        let ps = cm.page_size;
        let maddr = (cbase as i64 + i64::from(cm.offset) - i64::from(mem.offset)) as usize;
        let data = cm.cont[cbase..cbase + ps].to_vec();
        let old = cm.copy[cbase..cbase + ps].to_vec();

        let mut readback = vec![0u8; ps];
        let res = match write_page_default(pgm, part, mem, maddr, &data) {
            Ok(()) => read_page_default(pgm, part, mem, maddr, &mut readback).map_err(|e| {
                e.with_context(format!("unable to read {} page at addr 0x{:04x}", mem.name, maddr))
            }),
            Err(e) => {
                debug!("page write of {} failed ({}), writing bytes", mem.name, e);
                readback.copy_from_slice(&old);
                let mut res = Ok(());
                for i in 0..ps {
                    if data[i] == old[i] {
                        continue;
                    }
                    let r = pgm
                        .write_byte(part, mem, maddr + i, data[i])
                        .and_then(|_| pgm.read_byte(part, mem, maddr + i));
                    match r {
                        Ok(b) => readback[i] = b,
                        Err(e) => {
                            res = Err(e.with_context(format!(
                                "{} access error at addr 0x{:04x}",
                                mem.name,
                                maddr + i
                            )));
                            break;
                        }
                    }
                }
                res
            }
        };
        let cm = self.slot_mut(slot)?;
        cm.copy[cbase..cbase + ps].copy_from_slice(&readback);
        match res {
            Ok(()) => pgm.set_led(Led::Pgm, false),
            Err(e) => {
                let _ = pgm.set_led(Led::Err, true);
                Err(e)
            }
        }
    }

    /// Read a byte, loading its page on a miss
    ///
    /// Memories without paged access are read directly.
    pub fn read_byte<P: Programmer + ?Sized>(
        &mut self,
        pgm: &mut P,
        part: &Part,
        mem: &Memory,
        addr: usize,
    ) -> Result<u8> {
        let slot = match CacheSlot::for_memory(mem) {
            Some(slot) if has_paged_access(pgm, mem) => slot,
            _ => return pgm.read_byte(part, mem, addr),
        };
        if addr >= mem.size {
            self.flush(pgm, part, &mut crate::progress::NoProgress)?;
            return Ok(0);
        }
        self.init(slot, pgm, part)?;
        let caddr = self.cache_addr(slot, mem, addr)?;
        self.load_page(slot, pgm, part, mem, caddr)?;
        Ok(self.slot_mut(slot)?.cont[caddr])
    }

    /// Write a byte into the pending contents
    ///
    /// Equal values are a no-op. A byte the programmer reports as read-only
    /// gives `SoftFail`. Memories without paged access are written
    /// directly. An address past the end flushes the cache.
    pub fn write_byte<P: Programmer + ?Sized>(
        &mut self,
        pgm: &mut P,
        part: &Part,
        mem: &Memory,
        addr: usize,
        data: u8,
    ) -> Result<()> {
        let slot = match CacheSlot::for_memory(mem) {
            Some(slot) if has_paged_access(pgm, mem) => slot,
            _ => return pgm.write_byte(part, mem, addr, data),
        };
        if addr >= mem.size {
            return self.flush(pgm, part, &mut crate::progress::NoProgress);
        }
        self.init(slot, pgm, part)?;
        let caddr = self.cache_addr(slot, mem, addr)?;
        self.load_page(slot, pgm, part, mem, caddr)?;
        if self.slot_mut(slot)?.cont[caddr] == data {
            return Ok(());
        }
        if pgm.readonly(part, mem, addr) {
            return Err(Error::new(
                ErrorKind::SoftFail,
                format!("{} address 0x{:04x} is write protected", mem.name, addr),
            ));
        }
        self.slot_mut(slot)?.cont[caddr] = data;
        Ok(())
    }

    /// Write all changed pages back to the device
    pub fn flush<P: Programmer + ?Sized>(
        &mut self,
        pgm: &mut P,
        part: &Part,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let mut zopaddr: [Option<usize>; 4] = [None; 4];
        let mut pgerase = [false; 4];
        let mut chpages = 0usize;

        // count changed pages and find one that needs a cleared bit set
        for slot in CacheSlot::ALL {
            let Some(cm) = &self.slots[slot.index()] else {
                continue;
            };
            for (pg, n) in (0..cm.size).step_by(cm.page_size).enumerate() {
                if cm.iscached[pg] && cm.page_changed(n) {
                    chpages += 1;
                    let ps = cm.page_size;
                    let (cont, copy) = (&cm.cont[n..n + ps], &cm.copy[n..n + ps]);
                    if zopaddr[slot.index()].is_none() && !is_and(cont, copy, cont) {
                        zopaddr[slot.index()] = Some(n);
                    }
                }
            }
        }
        if chpages == 0 {
            return Ok(());
        }
        info!("synching cache to device");

        // probe page erase and decide whether a chip erase is needed
        let mut chiperase = false;
        for slot in CacheSlot::ALL {
            let Some(mem) = slot.base_memory(part).cloned() else {
                continue;
            };
            if self.init(slot, pgm, part).is_err() {
                continue;
            }
            let Some(n) = zopaddr[slot.index()] else {
                continue;
            };
            if chiperase {
                continue;
            }
            self.write_page(slot, pgm, part, &mem, n)?;
            if !self.slot_mut(slot)?.page_changed(n) {
                chpages -= 1;
                continue;
            }
            // probably NOR memory: try page erase
            if pgm.has_page_erase() && pgm.page_erase(part, &mem, self.mem_addr(slot, &mem, n)?).is_ok() {
                self.write_page(slot, pgm, part, &mem, n)?;
                if !self.slot_mut(slot)?.page_changed(n) {
                    pgerase[slot.index()] = true;
                    chpages -= 1;
                    continue;
                }
            }
            if !slot.is_user_type() {
                chiperase = true;
            }
        }
        if chpages == 0 {
            return Ok(());
        }

        if chiperase {
            info!("reading/chip erase/writing cycle needed");
            self.chip_erase_cycle(pgm, part, progress)?;
        }

        let nwr: usize = self
            .slots
            .iter()
            .flatten()
            .map(|cm| {
                (0..cm.size)
                    .step_by(cm.page_size)
                    .enumerate()
                    .filter(|(pg, n)| cm.iscached[*pg] && cm.page_changed(*n))
                    .count()
            })
            .sum();
        progress.start("Writing", nwr);
        let mut iwr = 0;
        for slot in CacheSlot::ALL {
            let Some(mem) = slot.base_memory(part).cloned() else {
                continue;
            };
            let Some(cm) = &self.slots[slot.index()] else {
                continue;
            };
            let pages: Vec<usize> = (0..cm.size)
                .step_by(cm.page_size)
                .enumerate()
                .filter(|(pg, n)| cm.iscached[*pg] && cm.page_changed(*n))
                .map(|(_, n)| n)
                .collect();
            for n in pages {
                if !chiperase && pgerase[slot.index()] {
                    let maddr = self.mem_addr(slot, &mem, n)?;
                    if let Err(e) = pgm.page_erase(part, &mem, maddr) {
                        warn!("page erase of {} at 0x{:04x} failed: {}", mem.name, maddr, e);
                    }
                }
                let res = self.write_page(slot, pgm, part, &mem, n);
                if let Err(e) = res {
                    progress.finish();
                    return Err(e);
                }
                if self.slot_mut(slot)?.page_changed(n) {
                    progress.finish();
                    return Err(Error::new(
                        ErrorKind::VerifyMismatch,
                        format!("verification mismatch at {} page addr 0x{:04x}", mem.name, n),
                    ));
                }
                iwr += 1;
                progress.update(iwr);
            }
        }
        progress.finish();
        Ok(())
    }

    fn mem_addr(&self, slot: CacheSlot, mem: &Memory, cbase: usize) -> Result<usize> {
        let cm = self.slots[slot.index()]
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::IllegalState, "cache not initialised"))?;
        Ok((cbase as i64 + i64::from(cm.offset) - i64::from(mem.offset)) as usize)
    }

    /// Read all uncached flash/EEPROM pages, erase the chip and fix up the copies
    fn chip_erase_cycle<P: Programmer + ?Sized>(
        &mut self,
        pgm: &mut P,
        part: &Part,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let erasable = [CacheSlot::Flash, CacheSlot::Eeprom];

        let nrd: usize = erasable
            .iter()
            .filter_map(|s| self.slots[s.index()].as_ref())
            .map(|cm| cm.iscached.iter().filter(|c| !**c).count())
            .sum();
        progress.start("Reading", nrd);
        let mut ird = 0;
        for slot in erasable {
            let Some(mem) = slot.base_memory(part).cloned() else {
                continue;
            };
            let Some(cm) = &self.slots[slot.index()] else {
                continue;
            };
            let missing: Vec<usize> = (0..cm.size)
                .step_by(cm.page_size)
                .enumerate()
                .filter(|(pg, _)| !cm.iscached[*pg])
                .map(|(_, n)| n)
                .collect();
            for n in missing {
                self.load_page(slot, pgm, part, &mem, n)?;
                ird += 1;
                progress.update(ird);
            }
        }
        progress.finish();

        pgm.chip_erase(part)
            .map_err(|e| e.with_context("chip erase failed"))?;

        for slot in erasable {
            let Some(mem) = slot.base_memory(part).cloned() else {
                continue;
            };
            let Some(cm) = self.slots[slot.index()].as_mut() else {
                continue;
            };
            let ps = cm.page_size;
            if slot == CacheSlot::Flash {
                cm.copy.fill(0xFF);
                if pgm.is_spm() {
                    // bootloaders will not overwrite themselves
                    let start = guess_boot_start(part, cm.size, ps);
                    for n in (start..cm.size).step_by(ps) {
                        let maddr = self.mem_addr(slot, &mem, n)?;
                        let mut page = vec![0u8; ps];
                        read_page_default(pgm, part, &mem, maddr, &mut page).map_err(|e| {
                            e.with_context(format!("flash read failed at addr 0x{:04x}", n))
                        })?;
                        self.slot_mut(slot)?.copy[n..n + ps].copy_from_slice(&page);
                    }
                }
            } else {
                // find out whether the chip erase zapped the EEPROM
                let Some(n) = (0..cm.size).step_by(ps).find(|&n| !all_ff(&cm.copy[n..n + ps])) else {
                    continue;
                };
                let maddr = self.mem_addr(slot, &mem, n)?;
                let mut page = vec![0u8; ps];
                read_page_default(pgm, part, &mem, maddr, &mut page)
                    .map_err(|e| e.with_context(format!("EEPROM read failed at addr 0x{:04x}", n)))?;
                let cm = self.slot_mut(slot)?;
                cm.copy[n..n + ps].copy_from_slice(&page);
                if all_ff(&page) {
                    cm.copy.fill(0xFF);
                }
            }
        }
        Ok(())
    }

    /// Erase the chip and update the cache to match
    ///
    /// Flash reads as erased afterwards without reloading. Cached EEPROM
    /// pages are checked to find out whether the erase zapped the EEPROM.
    /// A `SoftFail` from the programmer is returned unchanged.
    pub fn chip_erase<P: Programmer + ?Sized>(&mut self, pgm: &mut P, part: &Part) -> Result<()> {
        pgm.chip_erase(part)?;

        for slot in [CacheSlot::Flash, CacheSlot::Eeprom] {
            let Some(mem) = slot.base_memory(part).cloned() else {
                continue;
            };
            if !has_paged_access(pgm, &mem) {
                continue;
            }
            self.init(slot, pgm, part)?;
            let spm = pgm.is_spm();
            let cm = self.slot_mut(slot)?;
            let ps = cm.page_size;

            if slot == CacheSlot::Flash {
                if spm {
                    cm.iscached.fill(false);
                } else {
                    cm.copy.fill(0xFF);
                    cm.cont.fill(0xFF);
                    cm.iscached.fill(true);
                }
                continue;
            }

            let probe = (0..cm.size)
                .step_by(ps)
                .enumerate()
                .find(|(pg, n)| cm.iscached[*pg] && !all_ff(&cm.copy[*n..*n + ps]))
                .map(|(_, n)| n);
            let mut erased = false;
            if let Some(n) = probe {
                let maddr = self.mem_addr(slot, &mem, n)?;
                let mut page = vec![0u8; ps];
                read_page_default(pgm, part, &mem, maddr, &mut page)?;
                let cm = self.slot_mut(slot)?;
                cm.copy[n..n + ps].copy_from_slice(&page);
                erased = all_ff(&page);
            }
            let cm = self.slot_mut(slot)?;
            if erased {
                cm.copy.fill(0xFF);
                cm.cont.fill(0xFF);
                cm.iscached.fill(true);
            } else {
                // discard previous writes but keep what is cached
                for (pg, n) in (0..cm.size).step_by(ps).enumerate() {
                    if cm.iscached[pg] {
                        let page = cm.copy[n..n + ps].to_vec();
                        cm.cont[n..n + ps].copy_from_slice(&page);
                    }
                }
            }
        }
        Ok(())
    }

    /// Erase one page and reload it from the device
    ///
    /// Fails unless the page reads back as all 0xFF afterwards.
    pub fn page_erase<P: Programmer + ?Sized>(
        &mut self,
        pgm: &mut P,
        part: &Part,
        mem: &Memory,
        addr: usize,
    ) -> Result<()> {
        let slot = CacheSlot::for_memory(mem)
            .filter(|_| has_paged_access(pgm, mem) && addr < mem.size)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::Unsupported,
                    format!("cannot erase {} page at 0x{:04x}", mem.name, addr),
                )
            })?;
        if mem.page_size == 1 {
            pgm.write_byte(part, mem, addr, 0xFF)?;
        } else {
            pgm.page_erase(part, mem, addr)?;
        }
        self.init(slot, pgm, part)?;
        let caddr = self.cache_addr(slot, mem, addr)?;
        let cm = self.slot_mut(slot)?;
        let ps = cm.page_size;
        cm.iscached[caddr / ps] = false;
        self.load_page(slot, pgm, part, mem, caddr)?;
        let cbase = caddr & !(ps - 1);
        if all_ff(&self.slot_mut(slot)?.cont[cbase..cbase + ps]) {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::HardFail,
                format!("{} page at 0x{:04x} not erased", mem.name, addr),
            ))
        }
    }

    /// Chip erase, emulated by writing 0xFF over flash if the programmer cannot erase
    ///
    /// Returns `true` when the erase was emulated; the emulated erase is
    /// only pending in the cache until the next flush.
    pub fn chip_erase_or_emulate<P: Programmer + ?Sized>(
        &mut self,
        pgm: &mut P,
        part: &Part,
    ) -> Result<bool> {
        match self.chip_erase(pgm, part) {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == ErrorKind::SoftFail => {
                let flash = part
                    .flash()
                    .ok_or_else(|| Error::new(ErrorKind::Unsupported, "part has no flash"))?
                    .clone();
                for addr in 0..flash.size {
                    if pgm.readonly(part, &flash, addr) {
                        continue;
                    }
                    match self.write_byte(pgm, part, &flash, addr, 0xFF) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::SoftFail => {}
                        Err(e) => return Err(e),
                    }
                }
                info!("erasing emulated; undo with abort");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

/// A coarse guess where a bootloader might start (tends to underestimate)
fn guess_boot_start(part: &Part, size: usize, page_size: usize) -> usize {
    if part.prog_modes.contains(crate::part::ProgModes::UPDI) {
        return 0;
    }
    let mut start = 0usize;
    if part.n_boot_sections > 0 && part.boot_section_size > 0 {
        let boot = (part.boot_section_size as usize) << (part.n_boot_sections - 1);
        start = size.saturating_sub(boot);
    }
    if start <= size / 2 || start >= size {
        start = if size > 32768 { size - 16384 } else { size * 3 / 4 };
    }
    start & !(page_size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{PartDatabase, ProgModes};

    /// NOR-behaving paged target: page writes AND into the array
    struct NorSim {
        flash: Vec<u8>,
        eeprom: Vec<u8>,
        page_erase: bool,
        erases: usize,
        page_writes: usize,
        protected: Option<usize>,
    }

    impl NorSim {
        fn new(part: &Part) -> Self {
            Self {
                flash: vec![0xFF; part.flash().unwrap().size],
                eeprom: vec![0xFF; part.eeprom().unwrap().size],
                page_erase: false,
                erases: 0,
                page_writes: 0,
                protected: None,
            }
        }

        fn array(&mut self, mem: &Memory) -> &mut Vec<u8> {
            if mem.is_eeprom() {
                &mut self.eeprom
            } else {
                &mut self.flash
            }
        }
    }

    impl Programmer for NorSim {
        fn name(&self) -> &str {
            "norsim"
        }
        fn prog_modes(&self) -> ProgModes {
            ProgModes::ISP
        }
        fn initialize(&mut self, _part: &Part) -> Result<()> {
            Ok(())
        }
        fn program_enable(&mut self, _part: &Part) -> Result<()> {
            Ok(())
        }
        fn chip_erase(&mut self, _part: &Part) -> Result<()> {
            self.erases += 1;
            self.flash.fill(0xFF);
            Ok(())
        }
        fn read_byte(&mut self, _part: &Part, mem: &Memory, addr: usize) -> Result<u8> {
            Ok(self.array(mem)[addr])
        }
        fn write_byte(&mut self, _part: &Part, mem: &Memory, addr: usize, value: u8) -> Result<()> {
            self.array(mem)[addr] = value;
            Ok(())
        }
        fn has_paged_access(&self) -> bool {
            true
        }
        fn paged_load(&mut self, _: &Part, mem: &Memory, _: usize, addr: usize, buf: &mut [u8]) -> Result<()> {
            let n = buf.len();
            buf.copy_from_slice(&self.array(mem)[addr..addr + n]);
            Ok(())
        }
        fn paged_write(&mut self, _: &Part, mem: &Memory, _: usize, addr: usize, data: &[u8]) -> Result<()> {
            self.page_writes += 1;
            let eeprom = mem.is_eeprom();
            let arr = self.array(mem);
            for (i, d) in data.iter().enumerate() {
                if eeprom {
                    arr[addr + i] = *d;
                } else {
                    arr[addr + i] &= *d;
                }
            }
            Ok(())
        }
        fn has_page_erase(&self) -> bool {
            self.page_erase
        }
        fn page_erase(&mut self, _: &Part, mem: &Memory, addr: usize) -> Result<()> {
            let ps = mem.page_size;
            let base = mem.page_base(addr);
            self.array(mem)[base..base + ps].fill(0xFF);
            Ok(())
        }
        fn readonly(&self, _: &Part, mem: &Memory, addr: usize) -> bool {
            mem.in_flash() && self.protected == Some(addr)
        }
    }

    fn t85() -> Part {
        PartDatabase::builtin().unwrap().find("t85").unwrap().clone()
    }

    #[test]
    fn test_write_flush_read_back() {
        let part = t85();
        let flash = part.flash().unwrap().clone();
        let mut sim = NorSim::new(&part);
        let mut cache = PageCache::new();

        cache.write_byte(&mut sim, &part, &flash, 0x41, 0x5A).unwrap();
        assert!(cache.is_dirty());
        assert_eq!(sim.flash[0x41], 0xFF);
        cache.flush(&mut sim, &part, &mut crate::progress::NoProgress).unwrap();
        assert_eq!(sim.flash[0x41], 0x5A);
        assert!(!cache.is_dirty());
        assert_eq!(cache.read_byte(&mut sim, &part, &flash, 0x41).unwrap(), 0x5A);
    }

    #[test]
    fn test_equal_write_is_noop() {
        let part = t85();
        let flash = part.flash().unwrap().clone();
        let mut sim = NorSim::new(&part);
        let mut cache = PageCache::new();
        cache.write_byte(&mut sim, &part, &flash, 3, 0xFF).unwrap();
        assert!(!cache.is_dirty());
        cache.flush(&mut sim, &part, &mut crate::progress::NoProgress).unwrap();
        assert_eq!(sim.page_writes, 0);
    }

    #[test]
    fn test_readonly_address_soft_fails() {
        let part = t85();
        let flash = part.flash().unwrap().clone();
        let mut sim = NorSim::new(&part);
        sim.protected = Some(7);
        let mut cache = PageCache::new();
        let err = cache.write_byte(&mut sim, &part, &flash, 7, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SoftFail);
    }

    #[test]
    fn test_zero_to_one_uses_page_erase() {
        let part = t85();
        let flash = part.flash().unwrap().clone();
        let mut sim = NorSim::new(&part);
        sim.page_erase = true;
        sim.flash[0x80] = 0x00;
        let mut cache = PageCache::new();
        cache.write_byte(&mut sim, &part, &flash, 0x80, 0x0F).unwrap();
        cache.flush(&mut sim, &part, &mut crate::progress::NoProgress).unwrap();
        assert_eq!(sim.flash[0x80], 0x0F);
        assert_eq!(sim.erases, 0);
    }

    #[test]
    fn test_zero_to_one_without_page_erase_needs_chip_erase() {
        let part = t85();
        let flash = part.flash().unwrap().clone();
        let mut sim = NorSim::new(&part);
        sim.flash[0x10] = 0x00;
        sim.flash[0x1000] = 0x12;
        let mut cache = PageCache::new();
        cache.write_byte(&mut sim, &part, &flash, 0x10, 0xAA).unwrap();
        cache.flush(&mut sim, &part, &mut crate::progress::NoProgress).unwrap();
        assert_eq!(sim.erases, 1);
        assert_eq!(sim.flash[0x10], 0xAA);
        // untouched contents survive the erase cycle
        assert_eq!(sim.flash[0x1000], 0x12);
    }

    #[test]
    fn test_reset_discards_pending() {
        let part = t85();
        let ee = part.eeprom().unwrap().clone();
        let mut sim = NorSim::new(&part);
        let mut cache = PageCache::new();
        cache.write_byte(&mut sim, &part, &ee, 2, 0x33).unwrap();
        cache.reset();
        cache.flush(&mut sim, &part, &mut crate::progress::NoProgress).unwrap();
        assert_eq!(sim.eeprom[2], 0xFF);
    }

    #[test]
    fn test_chip_erase_presets_flash() {
        let part = t85();
        let flash = part.flash().unwrap().clone();
        let mut sim = NorSim::new(&part);
        sim.flash[0] = 0;
        let mut cache = PageCache::new();
        cache.chip_erase(&mut sim, &part).unwrap();
        let loads_before = sim.page_writes;
        assert_eq!(cache.read_byte(&mut sim, &part, &flash, 0).unwrap(), 0xFF);
        assert_eq!(sim.page_writes, loads_before);
    }

    #[test]
    fn test_guess_boot_start() {
        let part = t85();
        assert_eq!(guess_boot_start(&part, 8192, 64), 6144);
        let mut m = part.clone();
        m.boot_section_size = 512;
        m.n_boot_sections = 4;
        assert_eq!(guess_boot_start(&m, 32768, 128), 28672);
    }
}
