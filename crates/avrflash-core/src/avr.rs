//! Generic AVR memory operations
//!
//! Two layers live here. The `*_default` functions implement single-byte
//! and page commits in terms of a programmer's raw ISP [`Programmer::cmd`],
//! for drivers that shift instructions themselves. The memory-level
//! functions ([`read_mem`], [`write_mem`], [`verify`]) move whole memories
//! between a [`Part`]'s buffers and any programmer, choosing paged or
//! byte-wise access from what the programmer offers.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::opcode::{OpKind, Opcode};
use crate::part::{Memory, Part, TAG_ALLOCATED};
use crate::progress::Progress;
use crate::programmer::{Led, Programmer};
use crate::tpi;

/// Write attempts before a polled byte write is reported failed
const WRITE_TRIES: usize = 5;

fn usleep(us: u32) {
    if us > 0 {
        thread::sleep(Duration::from_micros(u64::from(us)));
    }
}

fn is_tagged(tags: &[u8], i: usize) -> bool {
    tags.get(i).is_some_and(|t| t & TAG_ALLOCATED != 0)
}

fn missing_op(mem: &Memory, what: &str) -> Error {
    Error::new(
        ErrorKind::Unsupported,
        format!("memory {} has no {} instruction", mem.name, what),
    )
}

/// Issue the load-extended-address instruction if the memory has one
pub fn load_ext_addr<P: Programmer + ?Sized>(pgm: &mut P, mem: &Memory, caddr: u32) -> Result<()> {
    if let Some(op) = mem.ops.get(OpKind::LoadExtAddr) {
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        op.set_addr(&mut cmd, caddr);
        pgm.cmd(&cmd)?;
    }
    Ok(())
}

fn issue<P: Programmer + ?Sized>(
    pgm: &mut P,
    op: &Opcode,
    caddr: u32,
    input: Option<u8>,
) -> Result<[u8; 4]> {
    let mut cmd = [0u8; 4];
    op.set_bits(&mut cmd);
    op.set_addr(&mut cmd, caddr);
    if let Some(data) = input {
        op.set_input(&mut cmd, data);
    }
    pgm.cmd(&cmd)
}

/// Send the part's programming-enable instruction and check the echo
///
/// The echo at `pollindex` must equal `pollvalue`.
pub fn program_enable_default<P: Programmer + ?Sized>(pgm: &mut P, part: &Part) -> Result<()> {
    let op = part
        .ops
        .get(OpKind::PgmEnable)
        .ok_or_else(|| Error::new(ErrorKind::Unsupported, format!("{} has no pgm_enable instruction", part.desc)))?;
    let res = issue(pgm, op, 0, None)?;
    let idx = usize::from(part.pollindex.clamp(1, 4)) - 1;
    if res[idx] == part.pollvalue {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::HardFail,
            format!(
                "program enable: target does not answer (0x{:02x} != 0x{:02x})",
                res[idx], part.pollvalue
            ),
        ))
    }
}

/// Erase the chip with the part's chip-erase instruction
///
/// Waits `chip_erase_delay` and re-initialises the target afterwards.
pub fn chip_erase_default<P: Programmer + ?Sized>(pgm: &mut P, part: &Part) -> Result<()> {
    if part.is_tpi() {
        return tpi::chip_erase(pgm, part);
    }
    let op = part
        .ops
        .get(OpKind::ChipErase)
        .ok_or_else(|| Error::new(ErrorKind::Unsupported, format!("{} has no chip_erase instruction", part.desc)))?;
    pgm.set_led(Led::Pgm, true)?;
    issue(pgm, op, 0, None)?;
    usleep(part.chip_erase_delay);
    pgm.initialize(part)?;
    pgm.set_led(Led::Pgm, false)
}

/// Read one byte with ISP instructions
///
/// Flash is word addressed: odd addresses use `read_hi`.
pub fn read_byte_default<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: usize,
) -> Result<u8> {
    if part.is_tpi() {
        return tpi::read_byte(pgm, mem, addr);
    }

    let (op, caddr) = if mem.ops.has(OpKind::ReadLo) {
        let kind = if addr & 1 != 0 {
            OpKind::ReadHi
        } else {
            OpKind::ReadLo
        };
        (mem.ops.get(kind), (addr / 2) as u32)
    } else {
        (mem.ops.get(OpKind::Read), addr as u32)
    };
    let op = op.ok_or_else(|| missing_op(mem, "read"))?;

    load_ext_addr(pgm, mem, caddr)?;
    let res = issue(pgm, op, caddr, None)?;
    Ok(op.get_output(&res))
}

/// Merge the unused bits of a fuse or lock byte with their factory values
///
/// Without a known factory value the current contents are read.
pub fn bitmask_data<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: usize,
    data: u8,
) -> u8 {
    let mask = mem.bitmask;
    if mask == 0 || mask == 0xFF {
        return data;
    }
    let was = match mem.initval {
        Some(v) => v,
        None => pgm.read_byte(part, mem, addr).unwrap_or(0xFF),
    };
    (was & !mask) | (data & mask)
}

/// Write one byte with ISP instructions
///
/// Paged memories only load the page buffer; [`write_page`] commits it.
/// Unpaged writes are skipped when the byte already holds `data`, and are
/// polled for completion otherwise.
pub fn write_byte_default<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: usize,
    data: u8,
) -> Result<()> {
    if mem.readonly {
        return match pgm.read_byte(part, mem, addr) {
            Ok(is) if is == data => Ok(()),
            _ => Err(Error::new(
                ErrorKind::ReadOnly,
                format!("cannot write to read-only memory {} of {}", mem.name, part.desc),
            )),
        };
    }

    let data = bitmask_data(pgm, part, mem, addr, data);

    if part.is_tpi() {
        return tpi::write_byte(pgm, mem, addr, data);
    }

    let mut readable = true;
    if !mem.paged {
        match pgm.read_byte(part, mem, addr) {
            Ok(b) if b == data => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Unsupported => readable = false,
            Err(e) => return Err(e),
        }
    }

    let (op, caddr) = if mem.ops.has(OpKind::WriteLo) {
        let kind = if addr & 1 != 0 {
            OpKind::WriteHi
        } else {
            OpKind::WriteLo
        };
        (mem.ops.get(kind), (addr / 2) as u32)
    } else if mem.paged && mem.ops.has(OpKind::LoadpageLo) {
        let kind = if addr & 1 != 0 {
            OpKind::LoadpageHi
        } else {
            OpKind::LoadpageLo
        };
        // EEPROM page buffers are byte addressed
        let caddr = if mem.ops.has(OpKind::LoadpageHi) {
            addr / 2
        } else {
            addr
        };
        (mem.ops.get(kind), caddr as u32)
    } else {
        (mem.ops.get(OpKind::Write), addr as u32)
    };
    let op = op.ok_or_else(|| missing_op(mem, "write"))?;

    pgm.set_led(Led::Pgm, true)?;
    issue(pgm, op, caddr, Some(data))?;

    if mem.paged {
        return pgm.set_led(Led::Pgm, false);
    }

    if !readable || !(mem.ops.has(OpKind::Read) || mem.ops.has(OpKind::ReadLo)) {
        usleep(mem.max_write_delay);
        return pgm.set_led(Led::Pgm, false);
    }

    let mut tries = 0;
    loop {
        let done = if mem.readback.contains(&data) {
            // cannot poll for a value the chip also reads back while busy
            usleep(mem.max_write_delay);
            pgm.read_byte(part, mem, addr)? == data
        } else {
            let start = Instant::now();
            let budget = Duration::from_micros(u64::from(mem.max_write_delay.max(1)));
            loop {
                if pgm.read_byte(part, mem, addr)? == data {
                    break true;
                }
                if start.elapsed() > budget {
                    break false;
                }
            }
        };
        if done {
            return pgm.set_led(Led::Pgm, false);
        }
        tries += 1;
        if tries > WRITE_TRIES {
            pgm.set_led(Led::Err, true)?;
            return Err(Error::new(
                ErrorKind::HardFail,
                format!("{} write at 0x{:04x} did not complete", mem.name, addr),
            ));
        }
        debug!("rewriting {} at 0x{:04x}, try {}", mem.name, addr, tries + 1);
        issue(pgm, op, caddr, Some(data))?;
    }
}

/// Commit the page buffer for the page containing `addr`
pub fn write_page<P: Programmer + ?Sized>(
    pgm: &mut P,
    _part: &Part,
    mem: &Memory,
    addr: usize,
) -> Result<()> {
    let op = mem
        .ops
        .get(OpKind::Writepage)
        .ok_or_else(|| missing_op(mem, "writepage"))?;
    let caddr = if mem.ops.has(OpKind::LoadpageHi) || mem.ops.has(OpKind::ReadLo) {
        addr / 2
    } else {
        addr
    } as u32;
    load_ext_addr(pgm, mem, caddr)?;
    issue(pgm, op, caddr, None)?;
    usleep(mem.max_write_delay);
    Ok(())
}

/// Read the three signature bytes
pub fn read_signature<P: Programmer + ?Sized>(pgm: &mut P, part: &Part) -> Result<[u8; 3]> {
    let mem = part
        .memory("signature")
        .ok_or_else(|| Error::new(ErrorKind::Unsupported, format!("{} has no signature memory", part.desc)))?;
    let mut sig = [0u8; 3];
    for (i, b) in sig.iter_mut().enumerate() {
        *b = pgm
            .read_byte(part, mem, i)
            .map_err(|e| e.with_context("reading signature"))?;
    }
    Ok(sig)
}

/// Number of meaningful bytes in a memory image
///
/// For flash memories this is the index after the last non-0xFF byte,
/// rounded up to a whole word. Other memories, and flash with `trim`
/// off, report their full size.
pub fn mem_hiaddr(mem: &Memory, trim: bool) -> usize {
    if !trim || !mem.in_flash() {
        return mem.size;
    }
    match mem.buf.iter().rposition(|&b| b != 0xFF) {
        Some(i) => (i + 2) & !1,
        None => 0,
    }
}

fn check_cancel(progress: &dyn Progress) -> Result<()> {
    if progress.cancelled() {
        Err(Error::new(ErrorKind::HardFail, "interrupted"))
    } else {
        Ok(())
    }
}

/// Read a whole memory into the part's buffer
///
/// With `vtags` only bytes (or pages) tagged there are read, as needed for
/// verifying against an input file. Untouched bytes read as 0xFF.
pub fn read_mem<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &mut Part,
    idx: usize,
    vtags: Option<&[u8]>,
    progress: &mut dyn Progress,
) -> Result<()> {
    let mut buf = std::mem::take(&mut part.memories[idx].buf);
    buf.fill(0xFF);
    progress.start("Reading", buf.len());
    let res = read_into(pgm, &*part, &part.memories[idx], &mut buf, vtags, progress);
    progress.finish();
    part.memories[idx].buf = buf;
    res
}

fn read_into<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    buf: &mut [u8],
    vtags: Option<&[u8]>,
    progress: &mut dyn Progress,
) -> Result<()> {
    let size = buf.len();
    let wanted = |i: usize| vtags.map_or(true, |t| is_tagged(t, i));
    let ps = mem.page_size;
    let pageable = ps > 1 && size % ps == 0;

    pgm.set_led(Led::Pgm, true)?;

    if part.is_tpi() && pageable {
        let mut i = 0;
        while i < size {
            if !wanted(i) {
                i += 1;
                continue;
            }
            let start = i;
            while i < size && wanted(i) {
                i += 1;
            }
            check_cancel(progress)?;
            tpi::read_block(pgm, mem, start, &mut buf[start..i])
                .map_err(|e| e.with_context(format!("reading {} at 0x{:04x}", mem.name, start)))?;
            progress.update(i);
        }
        return pgm.set_led(Led::Pgm, false);
    }

    if pgm.has_paged_access() && pageable {
        let mut failed = false;
        for base in (0..size).step_by(ps) {
            check_cancel(progress)?;
            if !(base..base + ps).any(wanted) {
                debug!("skipping {} page {}: no interesting data", mem.name, base / ps);
                continue;
            }
            if let Err(e) = pgm.paged_load(part, mem, ps, base, &mut buf[base..base + ps]) {
                if e.kind() == ErrorKind::Unsupported {
                    debug!("paged load of {} not available, reading bytes", mem.name);
                } else {
                    warn!("paged load of {} failed ({}), reading bytes", mem.name, e);
                }
                failed = true;
                break;
            }
            progress.update(base + ps);
        }
        if !failed {
            return pgm.set_led(Led::Pgm, false);
        }
    }

    for i in 0..size {
        if !wanted(i) {
            continue;
        }
        if i % 256 == 0 {
            check_cancel(progress)?;
        }
        buf[i] = pgm
            .read_byte(part, mem, i)
            .map_err(|e| e.with_context(format!("reading {} at 0x{:04x}", mem.name, i)))?;
        progress.update(i + 1);
    }
    pgm.set_led(Led::Pgm, false)
}

/// Write the tagged bytes of a memory's buffer to the device
///
/// `size` limits the write to the first `size` bytes. Returns the number
/// of bytes covered. Partially tagged pages are padded with the device's
/// current contents so bytes outside the input keep their values.
pub fn write_mem<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    idx: usize,
    size: usize,
    auto_erase: bool,
    progress: &mut dyn Progress,
) -> Result<usize> {
    let mem = &part.memories[idx];
    let size = size.min(mem.size);
    progress.start("Writing", size);
    pgm.set_led(Led::Pgm, true)?;
    let res = write_inner(pgm, part, mem, size, auto_erase, progress);
    progress.finish();
    match &res {
        Ok(_) => pgm.set_led(Led::Pgm, false)?,
        Err(_) => {
            let _ = pgm.set_led(Led::Err, true);
        }
    }
    res
}

fn write_inner<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    size: usize,
    auto_erase: bool,
    progress: &mut dyn Progress,
) -> Result<usize> {
    let ps = mem.page_size;
    let pageable = ps > 1 && mem.size % ps == 0;

    if part.is_tpi() && pageable {
        return tpi::write_words(pgm, mem, &mem.buf, &mem.tags, size);
    }

    if pgm.has_paged_access() && pageable {
        if paged_write_all(pgm, part, mem, size, auto_erase, progress)? {
            return Ok(size);
        }
        debug!("falling back to byte writes for {}", mem.name);
    }

    let paged = mem.in_flash() && mem.paged;
    let wsize = if paged { size.div_ceil(2) * 2 } else { size };
    let mut page_tainted = false;
    let mut first_err: Option<Error> = None;

    for i in 0..wsize.min(mem.size) {
        if i % 256 == 0 {
            check_cancel(progress)?;
        }
        let do_write = if paged {
            is_tagged(&mem.tags, i & !1) || is_tagged(&mem.tags, i | 1)
        } else {
            is_tagged(&mem.tags, i)
        };
        let mut flush_page = false;
        if paged {
            page_tainted |= do_write;
            if i % ps == ps - 1 || i == wsize - 1 {
                flush_page = page_tainted;
                page_tainted = false;
            }
        }

        if do_write {
            if let Err(e) = pgm.write_byte(part, mem, i, mem.buf[i]) {
                error!("writing {} at 0x{:04x} failed: {}", mem.name, i, e);
                first_err.get_or_insert(e);
            }
        }
        if flush_page {
            if let Err(e) = write_page(pgm, part, mem, i) {
                error!(
                    "page {} (addresses 0x{:04x} - 0x{:04x}) failed to write: {}",
                    i / ps,
                    i - i % ps,
                    i,
                    e
                );
                first_err.get_or_insert(e);
            }
        }
        progress.update(i + 1);
    }

    match first_err {
        Some(e) => Err(e.with_context(format!("writing {}", mem.name))),
        None => Ok(wsize),
    }
}

/// Paged write of all tagged pages; `Ok(false)` asks for the byte fallback
fn paged_write_all<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    size: usize,
    auto_erase: bool,
    progress: &mut dyn Progress,
) -> Result<bool> {
    let ps = mem.page_size;
    let csize = size.div_ceil(ps) * ps;
    let mut buf = mem.buf[..csize].to_vec();
    let mut tags = mem.tags[..csize].to_vec();
    let mut page = vec![0u8; ps];

    // fill holes from the device so bytes outside the input survive
    for base in (0..csize).step_by(ps) {
        let nset = (base..base + ps).filter(|&i| is_tagged(&tags, i)).count();
        if nset == 0 || nset == ps {
            continue;
        }
        match pgm.paged_load(part, mem, ps, base, &mut page) {
            Ok(()) => {
                debug!("padding {} [0x{:04x}, 0x{:04x}]", mem.name, base, base + ps - 1);
                for i in base..base + ps {
                    if !is_tagged(&tags, i) {
                        tags[i] |= TAG_ALLOCATED;
                        buf[i] = page[i - base];
                    }
                }
            }
            Err(e) => debug!(
                "cannot read {} [0x{:04x}, 0x{:04x}] to pad page: {}",
                mem.name,
                base,
                base + ps - 1,
                e
            ),
        }
    }

    for base in (0..csize).step_by(ps) {
        check_cancel(progress)?;
        if !(base..base + ps).any(|i| is_tagged(&tags, i)) {
            debug!("skipping {} page {}: no interesting data", mem.name, base / ps);
            continue;
        }
        let mut rc = Ok(());
        if auto_erase && pgm.has_page_erase() {
            rc = pgm.page_erase(part, mem, base);
        }
        if rc.is_ok() {
            rc = pgm.paged_write(part, mem, ps, base, &buf[base..base + ps]);
        }
        if let Err(e) = rc {
            if e.kind() != ErrorKind::Unsupported {
                warn!("paged write of {} page {} failed: {}", mem.name, base / ps, e);
            }
            return Ok(false);
        }
        progress.update(base + ps);
    }
    Ok(true)
}

/// Compare what was read from the device with the intended contents
///
/// Only bytes tagged in `expected` are compared, under the memory's
/// bitmask. Differences at addresses the programmer reports read-only are
/// warnings. Returns the number of bytes compared.
pub fn verify<P: Programmer + ?Sized>(
    pgm: &P,
    device: &Part,
    expected: &Part,
    mem_name: &str,
    size: usize,
) -> Result<usize> {
    let a = device
        .memory(mem_name)
        .ok_or_else(|| Error::new(ErrorKind::IllegalParam, format!("memory {} not defined for part {}", mem_name, device.desc)))?;
    let b = expected
        .memory(mem_name)
        .ok_or_else(|| Error::new(ErrorKind::IllegalParam, format!("memory {} not defined for part {}", mem_name, expected.desc)))?;

    let mut size = size;
    if a.size < size {
        warn!(
            "requested verification for {} bytes but {} only contains {}",
            size, mem_name, a.size
        );
        size = a.size;
    }

    const MAX_REPORTS: usize = 10;
    let mut verror = 0usize;
    let mut vroerror = 0usize;
    let mut first: Option<(usize, u8, u8)> = None;

    for i in 0..size {
        let (dev, inp) = (a.buf[i], b.buf[i]);
        if !is_tagged(&b.tags, i) || dev == inp {
            continue;
        }
        if pgm.readonly(device, a, i) {
            if vroerror < MAX_REPORTS {
                warn!(
                    "device 0x{:02x} != input 0x{:02x} at addr 0x{:04x} (read only location)",
                    dev, inp, i
                );
            } else if vroerror == MAX_REPORTS {
                warn!("suppressing further mismatches in read-only areas");
            }
            vroerror += 1;
        } else if a.masked(dev) != a.masked(inp) {
            if verror < MAX_REPORTS {
                error!("device 0x{:02x} != input 0x{:02x} at addr 0x{:04x}", dev, inp, i);
            } else if verror == MAX_REPORTS {
                warn!("suppressing further verification errors");
            }
            first.get_or_insert((i, dev, inp));
            verror += 1;
        } else {
            warn!(
                "ignoring mismatch in unused bits of {} (device 0x{:02x} != input 0x{:02x})",
                mem_name, dev, inp
            );
        }
    }

    if let Some((addr, dev, inp)) = first {
        return Err(Error::new(
            ErrorKind::VerifyMismatch,
            format!(
                "{} {} mismatch{}, first: device 0x{:02x} != input 0x{:02x} at addr 0x{:04x}",
                verror,
                mem_name,
                if verror == 1 { "" } else { "es" },
                dev,
                inp,
                addr
            ),
        ));
    }
    if vroerror > 0 && mem_name == "flash" {
        info!("{} mismatches in read-only areas, expected for vectors and/or bootloader", vroerror);
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{PartDatabase, ProgModes};
    use crate::progress::NoProgress;

    /// ISP target decoding the classic mega instruction set
    struct IspSim {
        flash: Vec<u8>,
        eeprom: Vec<u8>,
        page: Vec<u8>,
        page_words: usize,
        ext: u32,
        cmds: usize,
        writepages: Vec<usize>,
    }

    impl IspSim {
        fn new(flash: usize, page: usize) -> Self {
            Self {
                flash: vec![0xFF; flash],
                eeprom: vec![0xFF; 1024],
                page: vec![0xFF; page],
                page_words: page / 2,
                ext: 0,
                cmds: 0,
                writepages: Vec::new(),
            }
        }
    }

    impl Programmer for IspSim {
        fn name(&self) -> &str {
            "ispsim"
        }
        fn prog_modes(&self) -> ProgModes {
            ProgModes::ISP
        }
        fn initialize(&mut self, _part: &Part) -> Result<()> {
            Ok(())
        }
        fn program_enable(&mut self, part: &Part) -> Result<()> {
            program_enable_default(self, part)
        }
        fn chip_erase(&mut self, part: &Part) -> Result<()> {
            chip_erase_default(self, part)
        }
        fn read_byte(&mut self, part: &Part, mem: &Memory, addr: usize) -> Result<u8> {
            read_byte_default(self, part, mem, addr)
        }
        fn write_byte(&mut self, part: &Part, mem: &Memory, addr: usize, value: u8) -> Result<()> {
            write_byte_default(self, part, mem, addr, value)
        }
        fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
            self.cmds += 1;
            let word = (self.ext << 16) as usize | (cmd[1] as usize) << 8 | cmd[2] as usize;
            let mut res = [0, cmd[0], cmd[1], cmd[2]];
            match cmd[0] {
                0xAC if cmd[1] == 0x53 => res[2] = 0x53,
                0xAC if cmd[1] & 0xE0 == 0x80 => {
                    self.flash.fill(0xFF);
                    self.eeprom.fill(0xFF);
                }
                0x20 => res[3] = self.flash[word * 2],
                0x28 => res[3] = self.flash[word * 2 + 1],
                0x40 => self.page[(cmd[2] as usize % self.page_words) * 2] = cmd[3],
                0x48 => self.page[(cmd[2] as usize % self.page_words) * 2 + 1] = cmd[3],
                0x4C => {
                    let base = (word & !(self.page_words - 1)) * 2;
                    for (i, b) in self.page.iter_mut().enumerate() {
                        self.flash[base + i] &= *b;
                        *b = 0xFF;
                    }
                    self.writepages.push(base);
                }
                0x4D => self.ext = u32::from(cmd[2]),
                0xA0 => res[3] = self.eeprom[word & 0x3FF],
                0xC0 => self.eeprom[word & 0x3FF] = cmd[3],
                _ => {}
            }
            Ok(res)
        }
    }

    fn m328p() -> Part {
        PartDatabase::builtin().unwrap().find("m328p").unwrap().clone()
    }

    #[test]
    fn test_program_enable_checks_echo() {
        let part = m328p();
        let mut sim = IspSim::new(32768, 128);
        program_enable_default(&mut sim, &part).unwrap();
    }

    #[test]
    fn test_read_byte_word_addressing() {
        let part = m328p();
        let mut sim = IspSim::new(32768, 128);
        sim.flash[0x100] = 0x0C;
        sim.flash[0x101] = 0x94;
        let flash = part.memory("flash").unwrap();
        assert_eq!(read_byte_default(&mut sim, &part, flash, 0x100).unwrap(), 0x0C);
        assert_eq!(read_byte_default(&mut sim, &part, flash, 0x101).unwrap(), 0x94);
    }

    #[test]
    fn test_unpaged_write_skips_equal_value() {
        let mut part = m328p();
        let ee = part.memory_mut("eeprom").unwrap();
        assert!(!ee.paged);
        ee.max_write_delay = 0;
        let ee = part.memory("eeprom").unwrap().clone();
        let mut sim = IspSim::new(32768, 128);
        sim.eeprom[5] = 0x42;
        write_byte_default(&mut sim, &part, &ee, 5, 0x42).unwrap();
        assert_eq!(sim.cmds, 1);
        write_byte_default(&mut sim, &part, &ee, 6, 0x17).unwrap();
        assert_eq!(sim.eeprom[6], 0x17);
    }

    #[test]
    fn test_bytewise_flash_write_commits_pages() {
        let mut part = m328p();
        let idx = part.memory_index("flash").unwrap();
        {
            let flash = &mut part.memories[idx];
            flash.max_write_delay = 0;
            for (i, b) in [0x12u8, 0x34, 0x56].iter().enumerate() {
                flash.buf[i] = *b;
                flash.tags[i] = TAG_ALLOCATED;
            }
            flash.buf[130] = 0x78;
            flash.tags[130] = TAG_ALLOCATED;
        }
        let mut sim = IspSim::new(32768, 128);
        write_mem(&mut sim, &part, idx, 131, false, &mut NoProgress).unwrap();
        assert_eq!(sim.writepages, vec![0, 128]);
        assert_eq!(&sim.flash[..4], &[0x12, 0x34, 0x56, 0xFF]);
        assert_eq!(sim.flash[130], 0x78);

        read_mem(&mut sim, &mut part, idx, None, &mut NoProgress).unwrap();
        assert_eq!(mem_hiaddr(&part.memories[idx], true), 132);
        assert_eq!(mem_hiaddr(&part.memories[idx], false), 32768);
    }

    #[test]
    fn test_verify_reports_first_mismatch() {
        let part = m328p();
        let mut device = part.clone();
        let mut expected = part.clone();
        {
            let e = expected.memory_mut("flash").unwrap();
            e.buf[0] = 0x11;
            e.buf[1] = 0x22;
            e.tags[0] = TAG_ALLOCATED;
            e.tags[1] = TAG_ALLOCATED;
            let d = device.memory_mut("flash").unwrap();
            d.buf[0] = 0x11;
            d.buf[1] = 0x23;
        }
        let sim = IspSim::new(16, 8);
        let err = verify(&sim, &device, &expected, "flash", 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VerifyMismatch);
        assert!(err.context().contains("device 0x23 != input 0x22 at addr 0x0001"));

        // lock bits only compare the used bits
        expected.memory_mut("lock").unwrap().buf[0] = 0xFC;
        expected.memory_mut("lock").unwrap().tags[0] = TAG_ALLOCATED;
        device.memory_mut("lock").unwrap().buf[0] = 0x3C;
        assert_eq!(verify(&sim, &device, &expected, "lock", 1).unwrap(), 1);
    }

    #[test]
    fn test_mem_hiaddr_empty() {
        let mem = Memory::new("flash", 64, 8);
        assert_eq!(mem_hiaddr(&mem, true), 0);
        let mut mem = mem;
        mem.buf[4] = 0;
        assert_eq!(mem_hiaddr(&mem, true), 6);
    }
}
