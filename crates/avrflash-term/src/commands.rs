//! Terminal commands
//!
//! Every handler receives the full argument vector, command word first.
//! Command words may be abbreviated; an exact name always wins and an
//! ambiguous abbreviation is rejected with the candidates.

use std::collections::HashMap;
use std::io::Write;

use log::{error, info, warn, LevelFilter};

use avrflash_core::avr;
use avrflash_core::disasm;
use avrflash_core::error::{Error, ErrorKind};
use avrflash_core::fileio::{self, Chunk, FileFormat};
use avrflash_core::part::MemKind;
use avrflash_core::programmer::Led;
use avrflash_core::progress::{NoProgress, Progress};
use avrflash_core::session::Session;

use crate::data::{parse_datum, parse_frequency, parse_int, parse_sck_period};
use crate::error::{Result, TermError};
use crate::tokenize::split_commands;

/// Default number of bytes shown by `dump`
const DUMP_LEN: usize = 256;
/// Default number of bytes decoded by `disasm`
const DISASM_LEN: usize = 64;
/// Reads at least this long show a progress bar
const PROGRESS_MIN: usize = 1024;

/// What the caller should do after a command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next line
    Continue,
    /// Leave the terminal
    Quit,
}

type Handler = fn(&mut Terminal<'_>, &[String]) -> Result<Flow>;

/// A terminal command
#[derive(Debug)]
pub struct Command {
    /// Full command word
    pub name: &'static str,
    /// Argument synopsis
    pub usage: &'static str,
    /// One-line description
    pub help: &'static str,
    run: Handler,
}

/// All terminal commands in help order
pub static COMMANDS: &[Command] = &[
    Command { name: "dump", usage: "dump <mem> [<addr> [<len>]] | dump <mem> [<addr>] ...", help: "display memory contents", run: cmd_dump },
    Command { name: "read", usage: "read <mem> [<addr> [<len>]]", help: "alias for dump", run: cmd_dump },
    Command { name: "disasm", usage: "disasm <mem> [<addr> [<len>]]", help: "disassemble flash contents", run: cmd_disasm },
    Command { name: "write", usage: "write <mem> <addr> <data>... | write <mem> <addr> <len> <data>... ...", help: "write data to memory", run: cmd_write },
    Command { name: "save", usage: "save <mem> {<addr> <len>} <file>[:<format>]", help: "save memory segments to a file", run: cmd_save },
    Command { name: "flush", usage: "flush", help: "synchronise pending writes with the device", run: cmd_flush },
    Command { name: "abort", usage: "abort", help: "discard pending writes", run: cmd_abort },
    Command { name: "erase", usage: "erase [<mem> [<addr> <len>]]", help: "chip erase, or fill a memory range with 0xff", run: cmd_erase },
    Command { name: "pgerase", usage: "pgerase <mem> <addr>", help: "erase one page of flash or EEPROM", run: cmd_pgerase },
    Command { name: "config", usage: "config", help: "show fuse and lock bytes", run: cmd_config },
    Command { name: "sig", usage: "sig", help: "display the device signature", run: cmd_sig },
    Command { name: "part", usage: "part", help: "display the part description", run: cmd_part },
    Command { name: "send", usage: "send <b1> <b2> <b3> <b4>", help: "send a raw command to the programmer", run: cmd_send },
    Command { name: "parms", usage: "parms", help: "display programmer parameters", run: cmd_parms },
    Command { name: "vtarg", usage: "vtarg [<volts>]", help: "show or set the target voltage", run: cmd_vtarg },
    Command { name: "varef", usage: "varef [<channel>] <volts>", help: "set the analog reference voltage", run: cmd_varef },
    Command { name: "fosc", usage: "fosc <freq>[M|k] | off", help: "set the oscillator frequency", run: cmd_fosc },
    Command { name: "sck", usage: "sck [<period>[us|Hz|kHz|MHz]]", help: "show or set the SCK period", run: cmd_sck },
    Command { name: "spi", usage: "spi", help: "enter direct SPI mode", run: cmd_spi },
    Command { name: "pgm", usage: "pgm", help: "return to programming mode", run: cmd_pgm },
    Command { name: "verbose", usage: "verbose [<level>]", help: "show or change the verbosity", run: cmd_verbose },
    Command { name: "quell", usage: "quell [<level>]", help: "show or change progress output suppression", run: cmd_quell },
    Command { name: "help", usage: "help", help: "show this help", run: cmd_help },
    Command { name: "?", usage: "?", help: "same as help", run: cmd_help },
    Command { name: "quit", usage: "quit", help: "flush pending writes and leave the terminal", run: cmd_quit },
    Command { name: "q", usage: "q", help: "same as quit", run: cmd_quit },
];

/// Look up a command by name or unique abbreviation
pub fn find_command(word: &str) -> Result<&'static Command> {
    let word = word.to_ascii_lowercase();
    if let Some(cmd) = COMMANDS.iter().find(|c| c.name == word) {
        return Ok(cmd);
    }
    let matches: Vec<&Command> = COMMANDS.iter().filter(|c| c.name.starts_with(&word)).collect();
    match matches.as_slice() {
        [cmd] => Ok(cmd),
        [] => Err(TermError::InvalidArgument(format!("invalid command {}; type help for a list", word))),
        many => Err(TermError::InvalidArgument(format!(
            "command {} is ambiguous: {}",
            word,
            many.iter().map(|c| c.name).collect::<Vec<_>>().join(", ")
        ))),
    }
}

/// Terminal state on top of a programming session
pub struct Terminal<'a> {
    session: &'a mut Session,
    progress: &'a mut dyn Progress,
    out: &'a mut dyn Write,
    labels: HashMap<u32, String>,
    last_mem: Option<String>,
    dump_len: HashMap<String, usize>,
    disasm_next: HashMap<String, usize>,
    spi_mode: bool,
    quell: u32,
}

impl<'a> Terminal<'a> {
    /// Create a terminal writing its output to `out`
    pub fn new(session: &'a mut Session, progress: &'a mut dyn Progress, out: &'a mut dyn Write) -> Self {
        Self {
            session,
            progress,
            out,
            labels: HashMap::new(),
            last_mem: None,
            dump_len: HashMap::new(),
            disasm_next: HashMap::new(),
            spi_mode: false,
            quell: 0,
        }
    }

    /// Execute every command on a line
    ///
    /// Stops at the first failing command.
    pub fn run_line(&mut self, line: &str) -> Result<Flow> {
        let mut flow = Flow::Continue;
        for args in split_commands(line)? {
            flow = self.run_command(&args)?;
            if flow == Flow::Quit {
                break;
            }
        }
        self.out.flush()?;
        Ok(flow)
    }

    /// Execute one tokenised command
    pub fn run_command(&mut self, args: &[String]) -> Result<Flow> {
        let Some(word) = args.first() else {
            return Ok(Flow::Continue);
        };
        let cmd = find_command(word)?;
        if args.get(1).is_some_and(|a| a == "-?" || a == "-h") {
            writeln!(self.out, "Syntax: {}\nFunction: {}", cmd.usage, cmd.help)?;
            return Ok(Flow::Continue);
        }

        // LED failures must not hide the command result
        let _ = self.session.pgm.set_led(Led::Err, false);
        let _ = self.session.pgm.set_led(Led::Pgm, true);
        let result = (cmd.run)(self, args);
        if result.is_err() {
            let _ = self.session.pgm.set_led(Led::Err, true);
        }
        let _ = self.session.pgm.set_led(Led::Pgm, false);

        match result {
            Err(TermError::Usage(_)) => Err(TermError::Usage(format!("Syntax: {}", cmd.usage))),
            r => r,
        }
    }

    /// Keep the programmer's connection alive between prompts
    pub fn keep_alive(&mut self) -> Result<()> {
        let s = &mut *self.session;
        s.pgm.term_keep_alive(&s.part)?;
        Ok(())
    }

    /// Leave SPI mode and write pending changes
    pub fn quit(&mut self) -> Result<()> {
        if self.spi_mode {
            self.spi_mode = false;
            let s = &mut *self.session;
            s.pgm.initialize(&s.part)?;
        }
        self.flush_cache()
    }

    fn flush_cache(&mut self) -> Result<()> {
        let mut silent = NoProgress;
        let progress: &mut dyn Progress = if self.quell > 0 { &mut silent } else { &mut *self.progress };
        self.session.flush(progress)?;
        Ok(())
    }

    fn memory(&self, name: &str) -> Result<usize> {
        let part = &self.session.part;
        part.memory_index(name).ok_or_else(|| {
            TermError::InvalidArgument(format!("memory {} not defined for part {}", name, part.desc))
        })
    }

    // Read `len` bytes starting at `addr`, wrapping around at the end of the memory
    fn read_region(&mut self, idx: usize, addr: usize, len: usize) -> Result<Vec<u8>> {
        let size = self.session.part.memories[idx].size;
        let mut silent = NoProgress;
        let progress: &mut dyn Progress = if self.quell > 0 || len < PROGRESS_MIN {
            &mut silent
        } else {
            &mut *self.progress
        };
        progress.start("Reading", len);
        let mut data = Vec::with_capacity(len);
        for i in 0..len {
            match self.session.read_byte(idx, (addr + i) % size) {
                Ok(b) => data.push(b),
                Err(e) => {
                    progress.finish();
                    let name = &self.session.part.memories[idx].name;
                    return Err(e.with_context(format!("reading {} address 0x{:05x}", name, (addr + i) % size)).into());
                }
            }
            if i % 256 == 255 {
                progress.update(i + 1);
            }
        }
        progress.update(len);
        progress.finish();
        Ok(data)
    }

    // Write the given bytes through the cache and check each one by reading it back
    fn write_region(&mut self, idx: usize, addr: usize, data: &[Option<u8>]) -> Result<()> {
        let mut failed = 0usize;
        for (i, value) in data.iter().enumerate() {
            let Some(value) = *value else {
                continue;
            };
            let a = addr + i;
            let soft = match self.session.write_byte(idx, a, value) {
                Ok(()) => false,
                Err(e) if e.kind() == ErrorKind::SoftFail => {
                    warn!("{}", e.context());
                    true
                }
                Err(e) => {
                    let name = &self.session.part.memories[idx].name;
                    return Err(e.with_context(format!("writing {} address 0x{:05x}", name, a)).into());
                }
            };
            let cell = self.session.read_byte(idx, a)?;
            let mem = &self.session.part.memories[idx];
            if mem.masked(cell) != mem.masked(value) {
                if soft {
                    warn!("{} address 0x{:05x} keeps 0x{:02x}", mem.name, a, cell);
                } else {
                    error!(
                        "verification error writing 0x{:02x} to {} address 0x{:05x}: cell is 0x{:02x}",
                        value, mem.name, a, cell
                    );
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(Error::new(ErrorKind::VerifyMismatch, format!("{} bytes failed to verify", failed)).into());
        }
        Ok(())
    }
}

fn usage() -> TermError {
    TermError::Usage(String::new())
}

/// Resolve an address argument; negative values count from the top
fn resolve_addr(arg: &str, size: usize) -> Result<usize> {
    let a = parse_int(arg)?;
    let addr = if a < 0 { size as i64 + a } else { a };
    if addr < 0 || addr >= size as i64 {
        return Err(TermError::InvalidArgument(format!(
            "address {} is out of range [0, 0x{:04x}]",
            arg,
            size.saturating_sub(1)
        )));
    }
    Ok(addr as usize)
}

/// Resolve a length argument; negative values leave out the last |len|-1 bytes
fn resolve_len(arg: &str, size: usize, addr: usize) -> Result<usize> {
    let l = parse_int(arg)?;
    let len = if l < 0 { size as i64 + l + 1 - addr as i64 } else { l };
    if len < 0 {
        return Err(TermError::InvalidArgument(format!("invalid effective length {}", len)));
    }
    Ok(len as usize)
}

fn addr_width(size: usize) -> usize {
    if size > 0x10000 {
        5
    } else {
        4
    }
}

/// Format one hexdump line of up to 16 bytes
pub fn hexdump_line(addr: usize, width: usize, bytes: &[u8]) -> String {
    let mut hex = String::new();
    for i in 0..16 {
        if i == 8 {
            hex.push(' ');
        }
        match bytes.get(i) {
            Some(b) => hex.push_str(&format!("{:02x} ", b)),
            None => hex.push_str("   "),
        }
    }
    let ascii: String = bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect();
    format!("{:0w$x}  {} |{:<16}|", addr, hex, ascii, w = width)
}

fn hexdump(size: usize, start: usize, data: &[u8]) -> Vec<String> {
    let width = addr_width(size);
    data.chunks(16)
        .enumerate()
        .map(|(n, chunk)| hexdump_line((start + 16 * n) % size, width, chunk))
        .collect()
}

fn cmd_dump(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() > 4 {
        return Err(usage());
    }
    let name = match args.get(1) {
        Some(m) => m.clone(),
        None => t.last_mem.clone().ok_or_else(usage)?,
    };
    let idx = t.memory(&name)?;
    let (mname, size) = {
        let m = &t.session.part.memories[idx];
        (m.name.clone(), m.size)
    };
    if size == 0 {
        return Err(TermError::InvalidArgument(format!("memory {} has zero size", mname)));
    }

    let mut addr = t.session.dump_next(&mname);
    let mut len = t.dump_len.get(&mname).copied().unwrap_or(DUMP_LEN.min(size));
    let fill = args.last().is_some_and(|a| a == "...");
    match args.len() {
        3 if fill => {
            addr = 0;
            len = size;
        }
        3 => addr = resolve_addr(&args[2], size)?,
        4 if fill => {
            addr = resolve_addr(&args[2], size)?;
            len = size - addr;
        }
        4 => {
            addr = resolve_addr(&args[2], size)?;
            len = resolve_len(&args[3], size, addr)?;
            if len == 0 {
                return Ok(Flow::Continue);
            }
        }
        _ => {}
    }
    if addr >= size {
        addr = 0;
    }
    let len = len.min(size);

    let data = t.read_region(idx, addr, len)?;
    for line in hexdump(size, addr, &data) {
        writeln!(t.out, "{}", line)?;
    }
    writeln!(t.out)?;

    t.dump_len.insert(mname.clone(), len);
    t.session.set_dump_next(&mname, (addr + len) % size);
    t.last_mem = Some(mname);
    Ok(Flow::Continue)
}

fn cmd_disasm(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() < 2 || args.len() > 4 {
        return Err(usage());
    }
    let idx = t.memory(&args[1])?;
    let (mname, size, in_flash) = {
        let m = &t.session.part.memories[idx];
        (m.name.clone(), m.size, m.in_flash())
    };
    if !in_flash {
        return Err(TermError::InvalidArgument(format!("cannot disassemble {}; use a flash memory", mname)));
    }
    let mut addr = t.disasm_next.get(&mname).copied().unwrap_or(0);
    let mut len = DISASM_LEN.min(size);
    if let Some(a) = args.get(2) {
        addr = resolve_addr(a, size)? & !1;
    }
    if let Some(l) = args.get(3) {
        len = resolve_len(l, size, addr)?;
    }
    let len = len.min(size - addr);
    let data = t.read_region(idx, addr, len)?;
    for line in disasm::disassemble(&data, addr as u32, &t.labels) {
        writeln!(t.out, "{}", line)?;
    }
    t.disasm_next.insert(mname, (addr + len) % size);
    Ok(Flow::Continue)
}

// Split "file:f" into the path and an explicit format
fn split_format(spec: &str) -> Result<(&str, Option<FileFormat>)> {
    let bytes = spec.as_bytes();
    if bytes.len() > 2 && bytes[bytes.len() - 2] == b':' {
        let c = char::from(bytes[bytes.len() - 1]);
        let fmt = FileFormat::from_char(c)
            .ok_or_else(|| TermError::InvalidArgument(format!("invalid file format :{} in {}", c, spec)))?;
        return Ok((&spec[..spec.len() - 2], Some(fmt)));
    }
    Ok((spec, None))
}

fn cmd_write(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() < 3 {
        return Err(usage());
    }
    let idx = t.memory(&args[1])?;
    let (mname, size) = {
        let m = &t.session.part.memories[idx];
        (m.name.clone(), m.size)
    };

    // "write <mem> <data>" only makes sense for one-byte memories and files
    let (addr, first) = if args.len() == 3 {
        if size > 1 && parse_datum(&args[2])?.is_some() {
            return Err(usage());
        }
        (0, 2)
    } else {
        (resolve_addr(&args[2], size)?, 3)
    };

    let fill = args.last().is_some_and(|a| a == "...");
    let (len, items) = if fill {
        if args.len() < 6 {
            return Err(usage());
        }
        let len = resolve_len(&args[3], size, addr)?;
        (Some(len), &args[4..args.len() - 1])
    } else {
        (None, &args[first..])
    };

    let mut buf: Vec<Option<u8>> = Vec::new();
    let mut last: Vec<u8> = Vec::new();
    for item in items {
        match parse_datum(item)? {
            Some(d) => {
                if let Some(w) = &d.warning {
                    warn!("{}", w);
                }
                buf.extend(d.bytes.iter().copied().map(Some));
                last = d.bytes;
            }
            None => {
                let (path, fmt) = split_format(item)?;
                let base = buf.len();
                for chunk in fileio::decode(fmt.unwrap_or(FileFormat::Auto), path)? {
                    let start = base + chunk.addr as usize;
                    let end = start + chunk.data.len();
                    if buf.len() < end {
                        buf.resize(end, None);
                    }
                    for (slot, b) in buf[start..end].iter_mut().zip(&chunk.data) {
                        *slot = Some(*b);
                    }
                }
                last.clear();
            }
        }
    }

    if let Some(len) = len {
        if last.is_empty() {
            return Err(TermError::InvalidArgument("fill needs a data item before ...".to_string()));
        }
        while buf.len() < len {
            buf.extend(last.iter().copied().map(Some));
        }
        buf.truncate(len);
    }
    if buf.is_empty() {
        return Err(TermError::InvalidArgument("no data to write".to_string()));
    }
    if addr + buf.len() > size {
        warn!(
            "{} bytes would exceed the {} size of {}; clipping",
            buf.len(),
            mname,
            size
        );
        buf.truncate(size - addr);
    }

    t.write_region(idx, addr, &buf)?;
    Ok(Flow::Continue)
}

fn cmd_save(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() < 3 || (args.len() - 3) % 2 != 0 {
        return Err(usage());
    }
    let idx = t.memory(&args[1])?;
    let (mname, size) = {
        let m = &t.session.part.memories[idx];
        (m.name.clone(), m.size)
    };
    let (path, fmt) = split_format(&args[args.len() - 1])?;
    let fmt = fmt.unwrap_or(FileFormat::Raw);

    let mut segments = Vec::new();
    if args.len() == 3 {
        segments.push((0, size));
    }
    for pair in args[2..args.len() - 1].chunks(2) {
        let addr = resolve_addr(&pair[0], size)?;
        let len = resolve_len(&pair[1], size, addr)?;
        if addr + len > size {
            return Err(TermError::InvalidArgument(format!(
                "segment 0x{:04x}+{} exceeds {} size {}",
                addr, len, mname, size
            )));
        }
        segments.push((addr, len));
    }

    let mut image = Vec::new();
    let mut total = 0;
    for (addr, len) in segments {
        let data = t.read_region(idx, addr, len)?;
        total += data.len();
        image.push(Chunk { addr: addr as u32, data });
    }
    let bytes = fileio::encode(fmt, &image)?;
    fileio::write_output(path, &bytes)?;
    info!("saved {} bytes of {} to {} ({})", total, mname, path, fmt.description());
    Ok(Flow::Continue)
}

fn cmd_flush(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() > 1 {
        return Err(usage());
    }
    t.flush_cache()?;
    Ok(Flow::Continue)
}

fn cmd_abort(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() > 1 {
        return Err(usage());
    }
    t.session.cache.reset();
    info!("pending writes discarded");
    Ok(Flow::Continue)
}

// "erase <mem> <addr> <len>" is "write <mem> <addr> <len> 0xff ..."
fn fill_args(mem: &str, addr: &str, len: &str) -> Vec<String> {
    ["write", mem, addr, len, "0xff", "..."].iter().map(|s| s.to_string()).collect()
}

fn cmd_erase(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    match args.len() {
        1 => {
            info!("erasing chip");
            let s = &mut *t.session;
            s.cache.chip_erase_or_emulate(&mut *s.pgm, &s.part)?;
            Ok(Flow::Continue)
        }
        2 => cmd_write(t, &fill_args(&args[1], "0", "-1")),
        4 => cmd_write(t, &fill_args(&args[1], &args[2], &args[3])),
        _ => Err(usage()),
    }
}

fn cmd_pgerase(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() != 3 {
        return Err(usage());
    }
    let idx = t.memory(&args[1])?;
    let size = t.session.part.memories[idx].size;
    let addr = resolve_addr(&args[2], size)?;
    let s = &mut *t.session;
    if !s.pgm.has_page_erase() {
        return Err(TermError::InvalidArgument(format!("{} cannot erase single pages", s.pgm.name())));
    }
    let mem = &s.part.memories[idx];
    s.cache.page_erase(&mut *s.pgm, &s.part, mem, addr)?;
    Ok(Flow::Continue)
}

fn cmd_config(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() > 1 {
        return Err(TermError::InvalidArgument(
            "fuse bitfields are not described for this part; use write <fuse> <value>".to_string(),
        ));
    }
    let fuses: Vec<(usize, String, usize)> = t
        .session
        .part
        .memories
        .iter()
        .enumerate()
        .filter(|(_, m)| matches!(m.kind, MemKind::Fuse | MemKind::Lock) && m.size > 0)
        .map(|(i, m)| (i, m.name.clone(), m.size))
        .collect();
    if fuses.is_empty() {
        writeln!(t.out, "part has no fuses")?;
        return Ok(Flow::Continue);
    }
    for (idx, name, size) in fuses {
        let data = t.read_region(idx, 0, size.min(8))?;
        let value = data.iter().rev().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        writeln!(t.out, "{:<10} 0x{:0w$x}", name, value, w = 2 * data.len())?;
    }
    Ok(Flow::Continue)
}

fn cmd_sig(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() > 1 {
        return Err(usage());
    }
    let s = &mut *t.session;
    let sig = avr::read_signature(&mut *s.pgm, &s.part)?;
    writeln!(t.out, "Device signature = 0x{:02x}{:02x}{:02x}", sig[0], sig[1], sig[2])?;
    Ok(Flow::Continue)
}

fn cmd_part(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() > 1 {
        return Err(usage());
    }
    let p = &t.session.part;
    writeln!(t.out, "AVR part          : {}", p.desc)?;
    writeln!(t.out, "Part id           : {}", p.id)?;
    writeln!(t.out, "Signature         : 0x{:02x}{:02x}{:02x}", p.signature[0], p.signature[1], p.signature[2])?;
    writeln!(t.out, "Programming modes : {}", p.prog_modes.names())?;
    writeln!(t.out)?;
    writeln!(t.out, "{:<12} {:>8} {:>8} {:>10}", "Memory", "Size", "Pg size", "Offset")?;
    for m in &p.memories {
        writeln!(t.out, "{:<12} {:>8} {:>8} {:>#10x}", m.name, m.size, m.page_size, m.offset)?;
    }
    Ok(Flow::Continue)
}

fn cmd_send(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    let bytes = args[1..]
        .iter()
        .map(|a| {
            let v = parse_int(a)?;
            u8::try_from(v).map_err(|_| TermError::InvalidArgument(format!("{} is not a byte", a)))
        })
        .collect::<Result<Vec<u8>>>()?;

    let reply = if t.spi_mode {
        if bytes.is_empty() || bytes.len() > 4 {
            return Err(usage());
        }
        let mut rx = vec![0u8; bytes.len()];
        t.session.pgm.spi(&bytes, &mut rx)?;
        rx
    } else {
        let cmd: [u8; 4] = bytes.as_slice().try_into().map_err(|_| usage())?;
        t.session.pgm.cmd(&cmd)?.to_vec()
    };
    let hex: Vec<String> = reply.iter().map(|b| format!("{:02x}", b)).collect();
    writeln!(t.out, "results: {}", hex.join(" "))?;
    Ok(Flow::Continue)
}

fn cmd_parms(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() > 1 {
        return Err(usage());
    }
    let parms = t.session.pgm.parms()?;
    if parms.is_empty() {
        writeln!(t.out, "{} has no parameters to show", t.session.pgm.name())?;
    }
    for (k, v) in parms {
        writeln!(t.out, "{:<20}: {}", k, v)?;
    }
    Ok(Flow::Continue)
}

fn parse_volts(s: &str) -> Result<f64> {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| TermError::InvalidArgument(format!("invalid voltage {}", s)))
}

fn cmd_vtarg(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    match args.len() {
        1 => {
            let v = t.session.pgm.vtarget()?;
            writeln!(t.out, "Vtarget = {:.1} V", v)?;
        }
        2 => t.session.pgm.set_vtarget(parse_volts(&args[1])?)?,
        _ => return Err(usage()),
    }
    Ok(Flow::Continue)
}

fn cmd_varef(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    let (channel, volts) = match args.len() {
        2 => (0, parse_volts(&args[1])?),
        3 => {
            let ch = u32::try_from(parse_int(&args[1])?)
                .map_err(|_| TermError::InvalidArgument(format!("invalid channel {}", args[1])))?;
            (ch, parse_volts(&args[2])?)
        }
        _ => return Err(usage()),
    };
    t.session.pgm.set_varef(channel, volts)?;
    Ok(Flow::Continue)
}

fn cmd_fosc(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() != 2 {
        return Err(usage());
    }
    let hz = if args[1].eq_ignore_ascii_case("off") { 0.0 } else { parse_frequency(&args[1])? };
    t.session.pgm.set_fosc(hz)?;
    Ok(Flow::Continue)
}

fn cmd_sck(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    match args.len() {
        1 => {
            let period = t.session.pgm.sck_period()?;
            writeln!(t.out, "SCK period = {:.1} us ({:.3} kHz)", period * 1e6, 1e-3 / period)?;
        }
        2 => t.session.pgm.set_sck_period(parse_sck_period(&args[1])?)?,
        _ => return Err(usage()),
    }
    Ok(Flow::Continue)
}

fn cmd_spi(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() > 1 {
        return Err(usage());
    }
    let s = &mut *t.session;
    s.pgm.end_programming(&s.part)?;
    t.spi_mode = true;
    Ok(Flow::Continue)
}

fn cmd_pgm(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    if args.len() > 1 {
        return Err(usage());
    }
    t.spi_mode = false;
    let s = &mut *t.session;
    s.pgm.initialize(&s.part)?;
    Ok(Flow::Continue)
}

fn verbosity() -> i64 {
    match log::max_level() {
        LevelFilter::Off => -3,
        LevelFilter::Error => -2,
        LevelFilter::Warn => -1,
        LevelFilter::Info => 0,
        LevelFilter::Debug => 1,
        LevelFilter::Trace => 2,
    }
}

fn cmd_verbose(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    match args.len() {
        1 => writeln!(t.out, "Verbosity level: {}", verbosity())?,
        2 => {
            let level = match parse_int(&args[1])? {
                n if n < 0 => {
                    return Err(TermError::InvalidArgument("verbosity level must not be negative".to_string()))
                }
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            };
            log::set_max_level(level);
            writeln!(t.out, "New verbosity level: {}", verbosity())?;
        }
        _ => return Err(usage()),
    }
    Ok(Flow::Continue)
}

fn cmd_quell(t: &mut Terminal<'_>, args: &[String]) -> Result<Flow> {
    match args.len() {
        1 => writeln!(t.out, "Quell level: {}", t.quell)?,
        2 => {
            t.quell = u32::try_from(parse_int(&args[1])?)
                .map_err(|_| TermError::InvalidArgument("quell level must not be negative".to_string()))?;
            writeln!(t.out, "New quell level: {}", t.quell)?;
        }
        _ => return Err(usage()),
    }
    Ok(Flow::Continue)
}

fn cmd_help(t: &mut Terminal<'_>, _args: &[String]) -> Result<Flow> {
    writeln!(t.out, "Valid commands:")?;
    for cmd in COMMANDS {
        writeln!(t.out, "  {:<8} : {}", cmd.name, cmd.help)?;
    }
    writeln!(t.out, "\nUse <cmd> -? for the syntax of a command. Commands may be abbreviated.")?;
    Ok(Flow::Continue)
}

fn cmd_quit(t: &mut Terminal<'_>, _args: &[String]) -> Result<Flow> {
    t.quit()?;
    Ok(Flow::Quit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrflash_core::part::PartDatabase;
    use avrflash_core::update::UpdateFlags;
    use avrflash_dummy::{DummyConfig, DummyProgrammer};

    fn session(id: &str, config: DummyConfig) -> Session {
        let part = PartDatabase::builtin().unwrap().find(id).unwrap().clone();
        let pgm = DummyProgrammer::new(&part, config);
        let mut s = Session::new(Box::new(pgm), part, UpdateFlags::default());
        s.start().unwrap();
        s
    }

    fn run(s: &mut Session, line: &str) -> Result<String> {
        let mut out = Vec::new();
        let mut progress = NoProgress;
        let mut t = Terminal::new(s, &mut progress, &mut out);
        t.run_line(line)?;
        drop(t);
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_find_command() {
        assert_eq!(find_command("du").unwrap().name, "dump");
        assert_eq!(find_command("WRITE").unwrap().name, "write");
        assert_eq!(find_command("q").unwrap().name, "q");
        assert_eq!(find_command("pge").unwrap().name, "pgerase");
        let err = find_command("pg").unwrap_err().to_string();
        assert!(err.contains("ambiguous"), "{}", err);
        assert!(err.contains("pgerase") && err.contains("pgm"), "{}", err);
        assert!(find_command("d").is_err());
        assert!(find_command("frobnicate").is_err());
    }

    #[test]
    fn test_hexdump_line() {
        let line = hexdump_line(0x10, 4, b"AB\x00C");
        assert!(line.starts_with("0010  41 42 00 43 "));
        assert!(line.ends_with("|AB.C            |"));
        assert!(hexdump_line(0x10000, 5, &[0]).starts_with("10000  00"));
    }

    #[test]
    fn test_write_and_dump_eeprom() {
        let mut s = session("m328p", DummyConfig::default());
        run(&mut s, "write eeprom 0 0x12 0x3456 'A'").unwrap();
        let out = run(&mut s, "dump eeprom 0 8").unwrap();
        assert!(out.starts_with("0000  12 56 34 41 ff ff ff ff"), "{}", out);
        assert_eq!(s.dump_next("eeprom"), 8);
    }

    #[test]
    fn test_dump_continues_and_wraps() {
        let mut s = session("m328p", DummyConfig::default());
        let mut out = Vec::new();
        let mut progress = NoProgress;
        let mut t = Terminal::new(&mut s, &mut progress, &mut out);
        t.run_line("dump eeprom -16 16").unwrap();
        t.run_line("dump").unwrap();
        drop(t);
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("03f0  ff"));
        assert!(out.contains("0000  ff"));
        assert_eq!(s.dump_next("eeprom"), 16);
    }

    #[test]
    fn test_negative_length() {
        let mut s = session("m328p", DummyConfig::default());
        let out = run(&mut s, "dump eeprom 0x3e0 -1").unwrap();
        assert_eq!(out.lines().filter(|l| !l.is_empty()).count(), 2);
        assert_eq!(s.dump_next("eeprom"), 0);
    }

    #[test]
    fn test_fill_and_abort() {
        let mut s = session("m328p", DummyConfig::default());
        run(&mut s, "write eeprom 0x10 8 0xaa ...").unwrap();
        let ee = s.part.memory_index("eeprom").unwrap();
        assert_eq!(s.read_byte(ee, 0x17).unwrap(), 0xAA);
        assert_eq!(s.read_byte(ee, 0x18).unwrap(), 0xFF);

        run(&mut s, "abort").unwrap();
        assert_eq!(s.read_byte(ee, 0x10).unwrap(), 0xFF);
    }

    #[test]
    fn test_flush_reaches_device() {
        let mut s = session("m328p", DummyConfig::default());
        run(&mut s, "write eeprom 5 \"hi\"; flush; abort").unwrap();
        let ee = s.part.memory_index("eeprom").unwrap();
        assert_eq!(s.read_byte(ee, 5).unwrap(), b'h');
        assert_eq!(s.read_byte(ee, 7).unwrap(), 0);
    }

    #[test]
    fn test_write_clips_at_end() {
        let mut s = session("m328p", DummyConfig::default());
        run(&mut s, "write eeprom -1 0x11223344L").unwrap();
        let ee = s.part.memory_index("eeprom").unwrap();
        assert_eq!(s.read_byte(ee, 0x3FF).unwrap(), 0x44);
    }

    #[test]
    fn test_erase_range() {
        let mut s = session("m328p", DummyConfig::default());
        run(&mut s, "write eeprom 0 1 2 3 4").unwrap();
        run(&mut s, "erase eeprom 1 2").unwrap();
        let ee = s.part.memory_index("eeprom").unwrap();
        let bytes: Vec<u8> = (0..4).map(|a| s.read_byte(ee, a).unwrap()).collect();
        assert_eq!(bytes, vec![1, 0xFF, 0xFF, 4]);
    }

    #[test]
    fn test_chip_erase_emulated_for_bootloader() {
        let mut s = session("m328p", DummyConfig { bootloader: true, ..Default::default() });
        run(&mut s, "write flash 0 0x00; flush").unwrap();
        run(&mut s, "erase").unwrap();
        let flash = s.part.memory_index("flash").unwrap();
        assert_eq!(s.read_byte(flash, 0).unwrap(), 0xFF);
    }

    #[test]
    fn test_sig_and_part() {
        let mut s = session("m328p", DummyConfig::default());
        let out = run(&mut s, "sig").unwrap();
        assert_eq!(out.trim(), "Device signature = 0x1e950f");
        let out = run(&mut s, "part").unwrap();
        assert!(out.contains("ATmega328P"));
        assert!(out.contains("eeprom"));
    }

    #[test]
    fn test_usage_errors() {
        let mut s = session("m328p", DummyConfig::default());
        assert!(matches!(run(&mut s, "pgerase flash"), Err(TermError::Usage(_))));
        assert!(matches!(run(&mut s, "send 1 2"), Err(TermError::Usage(_))));
        assert!(run(&mut s, "dump nosuchmem").is_err());
        assert!(run(&mut s, "write eeprom 0x400 1").is_err());
        let out = run(&mut s, "dump -?").unwrap();
        assert!(out.starts_with("Syntax: dump"));
    }

    #[test]
    fn test_save_hex() {
        let mut s = session("m328p", DummyConfig::default());
        let path = std::env::temp_dir().join(format!("avrflash-term-save-{}.hex", std::process::id()));
        let line = format!("write eeprom 0 0xde 0xad; save eeprom 0 2 {}:i", path.display());
        run(&mut s, &line).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(text.contains(":02000000DEAD"), "{}", text);
    }

    #[test]
    fn test_disasm() {
        let mut s = session("m328p", DummyConfig::default());
        run(&mut s, "write flash 0 0x0c 0x94 0x34 0x00").unwrap();
        let out = run(&mut s, "disasm flash 0 4").unwrap();
        assert!(out.contains("jmp"), "{}", out);
        assert!(run(&mut s, "disasm eeprom").is_err());
    }

    #[test]
    fn test_quit_flushes() {
        let mut s = session("m328p", DummyConfig::default());
        let mut out = Vec::new();
        let mut progress = NoProgress;
        let mut t = Terminal::new(&mut s, &mut progress, &mut out);
        assert_eq!(t.run_line("write eeprom 0 0x42; quit; dump eeprom").unwrap(), Flow::Quit);
        drop(t);
        s.cache.reset();
        let ee = s.part.memory_index("eeprom").unwrap();
        assert_eq!(s.read_byte(ee, 0).unwrap(), 0x42);
        assert!(!String::from_utf8(out).unwrap().contains("0000"));
    }
}
