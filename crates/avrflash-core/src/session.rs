//! One programming session: a programmer, a part and the state between updates
//!
//! Everything that must survive from one update to the next lives here:
//! the page cache, a pending chip erase that a bootloader could not carry
//! out, the run flags and the terminal's next dump address per memory.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::avr;
use crate::cache::PageCache;
use crate::error::{Error, ErrorKind, Result};
use crate::fileio::{self, FileFormat, MemSelect};
use crate::part::{Part, PartDatabase, TAG_ALLOCATED};
use crate::progress::Progress;
use crate::programmer::{Led, Programmer, ProgrammerExt};
use crate::update::{is_multi_memory, memory_list, memstats, Filestats, MemUpdate, Update, UpdateFlags, UpdateOp};

/// A chip erase the programmer could not do yet
///
/// Bootloaders cannot erase themselves. Such an erase is promised and
/// redeemed by the first flash upload, which then erases every page it
/// writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingErase;

/// State of one programmer/part pairing
pub struct Session {
    /// The open programmer
    pub pgm: Box<dyn Programmer>,
    /// The selected part; memory buffers hold the last file or read
    pub part: Part,
    /// Byte-level cache used by the terminal and delayed erases
    pub cache: PageCache,
    /// Run options
    pub flags: UpdateFlags,
    pending_erase: Option<PendingErase>,
    dump_next: HashMap<String, usize>,
}

impl Session {
    /// Create a session on an open programmer
    pub fn new(pgm: Box<dyn Programmer>, part: Part, flags: UpdateFlags) -> Self {
        Self {
            pgm,
            part,
            cache: PageCache::new(),
            flags,
            pending_erase: None,
            dump_next: HashMap::new(),
        }
    }

    fn trim(&self) -> bool {
        !self.flags.contains(UpdateFlags::KEEP_TRAILING_FF)
    }

    /// Enable the programmer and put the target into programming mode
    pub fn start(&mut self) -> Result<()> {
        self.pgm.enable(&self.part)?;
        self.pgm.initialize(&self.part)
    }

    /// Read the device signature and compare it with the part
    ///
    /// All-0xFF or all-0x00 answers are retried twice with growing delays.
    /// With `force` a mismatch is only logged.
    pub fn check_signature(&mut self, db: &PartDatabase, force: bool) -> Result<[u8; 3]> {
        let mut wait = Duration::from_millis(10);
        let mut attempt = 0;
        let sig = loop {
            thread::sleep(wait);
            let sig = avr::read_signature(&mut *self.pgm, &self.part)?;
            let blank = sig.iter().all(|&b| b == 0xFF) || sig.iter().all(|&b| b == 0);
            attempt += 1;
            if !blank {
                break sig;
            }
            if attempt < 3 {
                info!("device signature = {:02x}{:02x}{:02x} (retrying)", sig[0], sig[1], sig[2]);
                wait *= 5;
                continue;
            }
            if !force {
                return Err(Error::new(
                    ErrorKind::SignatureMismatch,
                    "invalid device signature; double check connections and try again, or use -F to override",
                ));
            }
            warn!("invalid device signature");
            break sig;
        };

        if let Some(idx) = self.part.memory_index("signature") {
            let mem = &mut self.part.memories[idx];
            for (i, b) in sig.iter().enumerate().take(mem.size) {
                mem.buf[i] = *b;
            }
        }

        let probably = db
            .find_by_signature(sig)
            .first()
            .map(|p| format!(" (probably {})", p.id))
            .unwrap_or_default();
        info!("device signature = 0x{:02x}{:02x}{:02x}{}", sig[0], sig[1], sig[2], probably);

        if sig != self.part.signature {
            let expected = self.part.signature;
            let msg = format!(
                "expected signature for {} is {:02X} {:02X} {:02X}",
                self.part.desc, expected[0], expected[1], expected[2]
            );
            if !force {
                return Err(Error::new(
                    ErrorKind::SignatureMismatch,
                    format!("{}; double check chip or use -F to override this check", msg),
                ));
            }
            warn!("{}", msg);
        }
        Ok(sig)
    }

    /// Decide whether writing `updates` calls for an erase cycle first
    ///
    /// XMEGA parts with page erase keep auto erase for each page. Otherwise
    /// auto erase turns into one chip erase when flash is written.
    pub fn wants_auto_erase(&mut self, updates: &[Update]) -> bool {
        if !self.flags.contains(UpdateFlags::AUTO_ERASE) {
            return false;
        }
        if self.part.is_xmega() && self.pgm.has_page_erase() && !updates.is_empty() {
            info!(
                "programmer supports page erase for XMEGA devices; each page will be erased \
                 before programming it, but no chip erase is performed"
            );
            return false;
        }
        self.flags.remove(UpdateFlags::AUTO_ERASE);
        let flash = self.part.default_update_memory();
        let writes_flash = updates.iter().any(|u| match u {
            Update::Memory(m) => m.op == UpdateOp::Write && m.memstr_for(&self.part) == flash,
            Update::Terminal(_) => false,
        });
        if writes_flash {
            info!(
                "\"{}\" memory has been specified, an erase cycle will be performed; \
                 to disable this feature, specify the -D option",
                flash
            );
        }
        writes_flash
    }

    /// Erase the chip
    ///
    /// A programmer that cannot erase right now (a bootloader) leaves a
    /// pending erase for the next flash upload instead.
    pub fn chip_erase(&mut self) -> Result<()> {
        if self.flags.contains(UpdateFlags::NOWRITE) {
            warn!("conflicting -e and -n options specified, NOT erasing chip");
            return Ok(());
        }
        info!("erasing chip");
        match self.cache.chip_erase(&mut *self.pgm, &self.part) {
            Err(e) if e.kind() == ErrorKind::SoftFail => {
                info!("delaying chip erase until first -U upload to flash");
                self.pending_erase = Some(PendingErase);
                Ok(())
            }
            other => other,
        }
    }

    /// True while a delayed chip erase has not been carried out
    pub fn erase_pending(&self) -> bool {
        self.pending_erase.is_some()
    }

    /// Terminal dump position for `mem`
    pub fn dump_next(&self, mem: &str) -> usize {
        self.dump_next.get(mem).copied().unwrap_or(0)
    }

    /// Remember where the next terminal dump of `mem` starts
    pub fn set_dump_next(&mut self, mem: &str, addr: usize) {
        self.dump_next.insert(mem.to_string(), addr);
    }

    /// Read a byte through the page cache
    pub fn read_byte(&mut self, idx: usize, addr: usize) -> Result<u8> {
        let mem = &self.part.memories[idx];
        self.cache.read_byte(&mut *self.pgm, &self.part, mem, addr)
    }

    /// Write a byte through the page cache
    pub fn write_byte(&mut self, idx: usize, addr: usize, value: u8) -> Result<()> {
        let mem = &self.part.memories[idx];
        self.cache.write_byte(&mut *self.pgm, &self.part, mem, addr, value)
    }

    /// Write pending cache contents to the device
    pub fn flush(&mut self, progress: &mut dyn Progress) -> Result<()> {
        self.cache.flush(&mut *self.pgm, &self.part, progress)
    }

    /// Execute one memory update
    pub fn do_op(&mut self, upd: &MemUpdate, progress: &mut dyn Progress) -> Result<()> {
        let memstr = upd.memstr_for(&self.part);
        if is_multi_memory(&memstr) {
            let list = memory_list(&self.part, &memstr)?;
            if list.is_empty() {
                return Err(Error::new(ErrorKind::SoftFail, format!("no memories in {}", memstr)));
            }
            return self.do_multi(upd, &list, progress);
        }
        let Some(idx) = self.part.memory_index(&memstr) else {
            warn!("skipping -U {}:... as memory not defined for part {}", memstr, self.part.desc);
            return Err(Error::new(
                ErrorKind::SoftFail,
                format!("{} not defined for part {}", memstr, self.part.desc),
            ));
        };
        // pending terminal writes must land before the device is accessed directly
        self.flush(progress)?;
        let res = match upd.op {
            UpdateOp::Read => self.read_to_file(upd, idx, progress),
            UpdateOp::Write => self.write_from_file(upd, idx, progress),
            UpdateOp::Verify => self.verify_file(upd, idx, None, progress),
        };
        self.cache.reset();
        res
    }

    fn read_to_file(&mut self, upd: &MemUpdate, idx: usize, progress: &mut dyn Progress) -> Result<()> {
        if upd.format == FileFormat::Immediate {
            return Err(Error::new(ErrorKind::IllegalParam, "invalid file format 'immediate' for output"));
        }
        let name = self.part.memories[idx].name.clone();
        info!("reading {} memory ...", name);
        avr::read_mem(&mut *self.pgm, &mut self.part, idx, None, progress)
            .map_err(|e| e.with_context(format!("unable to read all of {} memory", name)))?;
        let size = avr::mem_hiaddr(&self.part.memories[idx], self.trim());
        if size == 0 {
            info!("flash is empty, resulting file has no contents");
        }
        info!("writing output file {}", upd.filename);
        fileio::write_file(upd.format, &upd.filename, &self.part, MemSelect::Single(idx), &[size])
    }

    fn log_stats(&self, idx: usize, fs: &Filestats) {
        info!("{}", fs.summary());
        if self.part.memories[idx].page_size > 1 {
            info!("{}", fs.page_summary());
        }
    }

    /// Load the file for `idx` and compute its statistics
    fn load_input(&mut self, upd: &MemUpdate, select: MemSelect<'_>) -> Result<Vec<usize>> {
        let trim = self.trim();
        fileio::read_file(upd.format, &upd.filename, &mut self.part, select, trim)
            .map_err(|e| e.with_context(format!("read from file {} failed", upd.filename)))
    }

    fn write_from_file(&mut self, upd: &MemUpdate, idx: usize, progress: &mut dyn Progress) -> Result<()> {
        let sizes = self.load_input(upd, MemSelect::Single(idx))?;
        info!("reading input file {} for {}", upd.filename, self.part.memories[idx].name);
        self.write_loaded(upd, idx, sizes[0], progress)
    }

    /// Write memory `idx` whose buffer already holds the input
    fn write_loaded(&mut self, upd: &MemUpdate, idx: usize, size: usize, progress: &mut dyn Progress) -> Result<()> {
        let fs = memstats(&self.part.memories[idx], size)?;
        self.log_stats(idx, &fs);

        let mut size = size;
        if self.part.memories[idx].in_flash() {
            let mut mem = self.part.memories[idx].clone();
            let hooked = self.pgm.flash_readhook(&self.part, &mut mem, size);
            self.part.memories[idx] = mem;
            size = hooked.map_err(|e| e.with_context(format!("readhook for file {} failed", upd.filename)))?;
            let patched = memstats(&self.part.memories[idx], size)?;
            if patched != fs {
                info!(
                    "preparing flash input for device{}",
                    if self.pgm.is_spm() { " bootloader" } else { "" }
                );
                debug!("{}", patched.summary());
            }
        }

        let name = self.part.memories[idx].name.clone();
        info!("writing {} byte{} {} ...", fs.nbytes, if fs.nbytes == 1 { "" } else { "s" }, name);

        if self.flags.contains(UpdateFlags::NOWRITE) {
            fileio::write_file(FileFormat::Ihex, fileio::STDIO, &self.part, MemSelect::Single(idx), &[size])?;
        } else if self.pending_erase.is_some() && self.part.memories[idx].in_flash() {
            self.redeem_erase(idx, size, progress)?;
        } else {
            let auto_erase = self.flags.contains(UpdateFlags::AUTO_ERASE);
            avr::write_mem(&mut *self.pgm, &self.part, idx, size, auto_erase, progress)
                .map_err(|e| e.with_context(format!("unable to write {} memory", name)))?;
        }
        info!("{} byte{} of {} written", fs.nbytes, if fs.nbytes == 1 { "" } else { "s" }, name);

        if self.flags.contains(UpdateFlags::VERIFY) && !self.flags.contains(UpdateFlags::NOWRITE) {
            let vsize = fs.lastaddr.map_or(0, |a| a + 1);
            self.verify_file(upd, idx, Some((vsize, fs)), progress)?;
        }
        Ok(())
    }

    /// Write the touched flash pages through the cache, erasing untagged bytes
    fn redeem_erase(&mut self, idx: usize, size: usize, progress: &mut dyn Progress) -> Result<()> {
        let mem = self.part.memories[idx].clone();
        let ps = mem.page_size.max(1);
        for base in (0..size.min(mem.size)).step_by(ps) {
            let end = (base + ps).min(mem.size);
            if !mem.tags[base..end].iter().any(|t| t & TAG_ALLOCATED != 0) {
                continue;
            }
            for a in base..end {
                let value = if mem.tags[a] & TAG_ALLOCATED != 0 {
                    mem.buf[a]
                } else {
                    0xFF
                };
                match self.cache.write_byte(&mut *self.pgm, &self.part, &mem, a, value) {
                    Err(e) if e.kind() == ErrorKind::SoftFail => {}
                    other => other?,
                }
            }
        }
        self.cache.flush(&mut *self.pgm, &self.part, progress)?;
        self.pending_erase = None;
        info!("delayed chip erase carried out for the uploaded pages");
        Ok(())
    }

    /// Verify memory `idx`; `written` carries size and stats after a write
    fn verify_file(
        &mut self,
        upd: &MemUpdate,
        idx: usize,
        written: Option<(usize, Filestats)>,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let name = self.part.memories[idx].name.clone();
        self.pgm.set_led(Led::Vfy, true)?;
        info!("verifying {} memory against {}", name, upd.filename);

        let (size, fs) = match written {
            Some(w) => w,
            None => {
                let sizes = self.load_input(upd, MemSelect::Single(idx))?;
                let fs = memstats(&self.part.memories[idx], sizes[0])?;
                debug!("input file {} contains {} bytes", upd.filename, fs.nbytes);
                (sizes[0], fs)
            }
        };

        let res = self.verify_loaded(idx, size, progress);
        match res {
            Ok(()) => {
                info!("{} byte{} of {} verified", fs.verified(), if fs.verified() == 1 { "" } else { "s" }, name);
                self.pgm.set_led(Led::Vfy, false)
            }
            Err(e) if e.kind() == ErrorKind::VerifyMismatch && self.flags.contains(UpdateFlags::FORCE) => {
                warn!("{}; continuing due to -F", e);
                self.pgm.set_led(Led::Vfy, false)
            }
            Err(e) => {
                let _ = self.pgm.set_led(Led::Err, true);
                let _ = self.pgm.set_led(Led::Vfy, false);
                Err(e)
            }
        }
    }

    fn verify_loaded(&mut self, idx: usize, size: usize, progress: &mut dyn Progress) -> Result<()> {
        let mut device = self.part.clone();
        let tags = self.part.memories[idx].tags.clone();
        let name = self.part.memories[idx].name.clone();
        avr::read_mem(&mut *self.pgm, &mut device, idx, Some(&tags), progress)
            .map_err(|e| e.with_context(format!("unable to read all of {} memory", name)))?;
        avr::verify(&*self.pgm, &device, &self.part, &name, size).map(|_| ())
    }

    fn do_multi(&mut self, upd: &MemUpdate, list: &[usize], progress: &mut dyn Progress) -> Result<()> {
        self.flush(progress)?;
        let res = match upd.op {
            UpdateOp::Read => {
                if !upd.format.is_multi_capable() {
                    return Err(Error::new(
                        ErrorKind::IllegalParam,
                        format!("{} format cannot hold multiple memories", upd.format),
                    ));
                }
                let mut sizes = Vec::with_capacity(list.len());
                for &idx in list {
                    let name = self.part.memories[idx].name.clone();
                    info!("reading {} memory ...", name);
                    avr::read_mem(&mut *self.pgm, &mut self.part, idx, None, progress)
                        .map_err(|e| e.with_context(format!("unable to read all of {} memory", name)))?;
                    // empty flash is recorded faithfully in multi-memory dumps
                    sizes.push(avr::mem_hiaddr(&self.part.memories[idx], false));
                }
                info!("writing output file {}", upd.filename);
                fileio::write_file(upd.format, &upd.filename, &self.part, MemSelect::Multi(list), &sizes)
            }
            UpdateOp::Write | UpdateOp::Verify => {
                let sizes = self.load_input(upd, MemSelect::Multi(list))?;
                info!("reading input file {} for {} memories", upd.filename, list.len());
                let mut first_err = None;
                for (&idx, &size) in list.iter().zip(&sizes) {
                    if !self.part.memories[idx].tags.iter().any(|&t| t != 0) {
                        debug!("no data for {} in {}", self.part.memories[idx].name, upd.filename);
                        continue;
                    }
                    let r = if upd.op == UpdateOp::Write {
                        if self.part.memories[idx].readonly {
                            self.verify_file(upd, idx, Some((size, memstats(&self.part.memories[idx], size)?)), progress)
                        } else {
                            self.write_loaded(upd, idx, size, progress)
                        }
                    } else {
                        let fs = memstats(&self.part.memories[idx], size)?;
                        self.verify_file(upd, idx, Some((size, fs)), progress)
                    };
                    if let Err(e) = r {
                        if !e.is_soft() {
                            first_err.get_or_insert(e);
                            break;
                        }
                        warn!("{}", e);
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        };
        self.cache.reset();
        res
    }

    /// Flush the cache and release the programmer
    ///
    /// Fails if a delayed chip erase was never carried out.
    pub fn finish(&mut self, progress: &mut dyn Progress) -> Result<()> {
        let flushed = self.flush(progress);
        if let Err(e) = &flushed {
            warn!("cannot flush cache: {}", e);
        }
        let _ = self.pgm.end_programming(&self.part);
        let _ = self.pgm.disable();
        let _ = self.pgm.set_led(Led::Rdy, false);
        self.pgm.close()?;
        flushed?;
        if self.pending_erase.is_some() {
            return Err(Error::new(
                ErrorKind::HardFail,
                "chip erase was delayed but no flash upload followed",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{Memory, ProgModes};
    use crate::progress::NoProgress;

    /// Paged RAM target; optionally a bootloader that cannot chip erase
    struct RamTarget {
        mems: HashMap<String, Vec<u8>>,
        signature: [u8; 3],
        bootloader: bool,
        page_writes: usize,
    }

    impl RamTarget {
        fn new(part: &Part) -> Self {
            let mems = part.memories.iter().map(|m| (m.name.clone(), vec![0xFF; m.size])).collect();
            Self {
                mems,
                signature: part.signature,
                bootloader: false,
                page_writes: 0,
            }
        }
    }

    impl Programmer for RamTarget {
        fn name(&self) -> &str {
            "ram"
        }
        fn prog_modes(&self) -> ProgModes {
            if self.bootloader {
                ProgModes::SPM
            } else {
                ProgModes::ISP
            }
        }
        fn initialize(&mut self, _part: &Part) -> Result<()> {
            Ok(())
        }
        fn program_enable(&mut self, _part: &Part) -> Result<()> {
            Ok(())
        }
        fn chip_erase(&mut self, _part: &Part) -> Result<()> {
            if self.bootloader {
                return Err(Error::new(ErrorKind::SoftFail, "bootloader cannot erase"));
            }
            if let Some(f) = self.mems.get_mut("flash") {
                f.fill(0xFF);
            }
            Ok(())
        }
        fn read_byte(&mut self, _part: &Part, mem: &Memory, addr: usize) -> Result<u8> {
            if mem.name == "signature" {
                return Ok(self.signature[addr]);
            }
            Ok(self.mems[&mem.name][addr])
        }
        fn write_byte(&mut self, _part: &Part, mem: &Memory, addr: usize, value: u8) -> Result<()> {
            self.mems.get_mut(&mem.name).unwrap()[addr] = value;
            Ok(())
        }
        fn has_paged_access(&self) -> bool {
            true
        }
        fn paged_load(&mut self, _: &Part, mem: &Memory, _: usize, addr: usize, buf: &mut [u8]) -> Result<()> {
            let n = buf.len();
            buf.copy_from_slice(&self.mems[&mem.name][addr..addr + n]);
            Ok(())
        }
        fn paged_write(&mut self, _: &Part, mem: &Memory, _: usize, addr: usize, data: &[u8]) -> Result<()> {
            self.page_writes += 1;
            self.mems.get_mut(&mem.name).unwrap()[addr..addr + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    fn session(bootloader: bool) -> Session {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("t85").unwrap().clone();
        let mut target = RamTarget::new(&part);
        target.bootloader = bootloader;
        Session::new(Box::new(target), part, UpdateFlags::default())
    }

    #[test]
    fn test_write_and_verify_immediate() {
        let mut s = session(false);
        let upd = MemUpdate::parse("eeprom:w:0x12,0x34:m").unwrap();
        s.do_op(&upd, &mut NoProgress).unwrap();
        assert_eq!(s.read_byte(s.part.memory_index("eeprom").unwrap(), 1).unwrap(), 0x34);

        let upd = MemUpdate::parse("eeprom:v:0x12,0x35:m").unwrap();
        let err = s.do_op(&upd, &mut NoProgress).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VerifyMismatch);
    }

    #[test]
    fn test_forced_verify_mismatch_only_warns() {
        let mut s = session(false);
        let upd = MemUpdate::parse("eeprom:w:0x12,0x34:m").unwrap();
        s.do_op(&upd, &mut NoProgress).unwrap();

        let mismatch = MemUpdate::parse("eeprom:v:0x12,0x35:m").unwrap();
        assert_eq!(s.do_op(&mismatch, &mut NoProgress).unwrap_err().kind(), ErrorKind::VerifyMismatch);

        s.flags.insert(UpdateFlags::FORCE);
        s.do_op(&mismatch, &mut NoProgress).unwrap();
        s.finish(&mut NoProgress).unwrap();
    }

    #[test]
    fn test_unknown_memory_for_part_is_soft() {
        let mut s = session(false);
        let upd = MemUpdate::parse("bootrow:w:1:m").unwrap();
        assert!(s.do_op(&upd, &mut NoProgress).unwrap_err().is_soft());
    }

    #[test]
    fn test_signature_check() {
        let db = PartDatabase::builtin().unwrap();
        let mut s = session(false);
        assert_eq!(s.check_signature(&db, false).unwrap(), s.part.signature);

        s.part.signature = [0x1E, 0x00, 0x00];
        let err = s.check_signature(&db, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureMismatch);
        assert!(s.check_signature(&db, true).is_ok());
    }

    #[test]
    fn test_delayed_erase_redeemed_by_flash_upload() {
        let mut s = session(true);
        s.chip_erase().unwrap();
        assert!(s.erase_pending());

        let upd = MemUpdate::parse("flash:w:0x0c,0x94:m").unwrap();
        s.do_op(&upd, &mut NoProgress).unwrap();
        assert!(!s.erase_pending());
        let flash = s.part.memory_index("flash").unwrap();
        assert_eq!(s.read_byte(flash, 0).unwrap(), 0x0C);
        assert_eq!(s.read_byte(flash, 2).unwrap(), 0xFF);
        s.finish(&mut NoProgress).unwrap();
    }

    #[test]
    fn test_unredeemed_erase_fails_finish() {
        let mut s = session(true);
        s.chip_erase().unwrap();
        assert_eq!(s.finish(&mut NoProgress).unwrap_err().kind(), ErrorKind::HardFail);
    }

    #[test]
    fn test_auto_erase_only_for_flash_writes() {
        let mut s = session(false);
        let ee = [Update::parse("eeprom:w:1:m").unwrap()];
        assert!(!s.wants_auto_erase(&ee));

        let mut s = session(false);
        let fl = [Update::parse("flash:w:1:m").unwrap()];
        assert!(s.wants_auto_erase(&fl));
        assert!(!s.flags.contains(UpdateFlags::AUTO_ERASE));
    }

    #[test]
    fn test_terminal_writes_flushed_before_update() {
        let mut s = session(false);
        let ee = s.part.memory_index("eeprom").unwrap();
        s.write_byte(ee, 10, 0x5A).unwrap();
        let dir = std::env::temp_dir().join(format!("avrflash-session-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let out = dir.join("ee.bin");
        let upd = MemUpdate::parse(&format!("eeprom:r:{}:r", out.display())).unwrap();
        s.do_op(&upd, &mut NoProgress).unwrap();
        let data = std::fs::read(&out).unwrap();
        assert_eq!(data[10], 0x5A);
        assert_eq!(data.len(), 512);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
