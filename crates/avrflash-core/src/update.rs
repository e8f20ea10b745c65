//! Update requests: parsing, dry run checks and file statistics
//!
//! An update is either a memory operation (`-U mem:op:file[:fmt]`) or a
//! terminal session (`-t`, `-T cmd`). Execution lives in
//! [`Session`](crate::session::Session); this module holds what can be
//! decided before the programmer is touched.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::Path;

use bitflags::bitflags;
use log::{info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::fileio::{self, FileFormat, STDIO};
use crate::part::{is_known_memory_name, MemKind, Memory, Part, TAG_ALLOCATED};

/// What to do with a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    /// Read the device into a file
    Read,
    /// Write a file to the device
    Write,
    /// Compare the device with a file
    Verify,
}

impl UpdateOp {
    fn as_char(self) -> char {
        match self {
            UpdateOp::Read => 'r',
            UpdateOp::Write => 'w',
            UpdateOp::Verify => 'v',
        }
    }
}

bitflags! {
    /// Options that apply to every update of a run
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpdateFlags: u32 {
        /// Do not write to the device (`-n`)
        const NOWRITE = 1 << 0;
        /// Erase pages or the chip as needed before writing flash
        const AUTO_ERASE = 1 << 1;
        /// Verify after each write
        const VERIFY = 1 << 2;
        /// Keep trailing 0xFF bytes of flash images (`-A`)
        const KEEP_TRAILING_FF = 1 << 3;
        /// Report verification mismatches as warnings (`-F`)
        const FORCE = 1 << 4;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        UpdateFlags::AUTO_ERASE | UpdateFlags::VERIFY
    }
}

/// A memory operation from `-U`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemUpdate {
    /// Memory name or list; `None` means the part's default memory
    pub memstr: Option<String>,
    /// Operation
    pub op: UpdateOp,
    /// File name, `-` for stdio, or the data for immediate mode
    pub filename: String,
    /// File format
    pub format: FileFormat,
}

impl MemUpdate {
    /// Parse `mem:op:file[:fmt]` or `file[:fmt]`
    ///
    /// Memory names never contain colons and the op is one character, so
    /// only a single character between the first two colons selects the
    /// long form. Anything else is a file name, which may itself contain
    /// colons (`C:/dir/file.hex`).
    pub fn parse(s: &str) -> Result<Self> {
        let mut memstr = None;
        let mut op = UpdateOp::Write;
        let mut rest = s;

        if let Some(fc) = s.find(':') {
            let b = s.as_bytes();
            if b.len() > fc + 2 && b[fc + 2] == b':' {
                op = match b[fc + 1] {
                    b'r' => UpdateOp::Read,
                    b'w' => UpdateOp::Write,
                    b'v' => UpdateOp::Verify,
                    c => {
                        return Err(Error::new(
                            ErrorKind::Parse,
                            format!(
                                "invalid I/O mode :{}: in -U {}; I/O mode can be r, w or v",
                                c as char, s
                            ),
                        ))
                    }
                };
                memstr = Some(s[..fc].to_string());
                rest = &s[fc + 3..];
            }
        }

        let mut format = if op == UpdateOp::Read {
            FileFormat::Raw
        } else {
            FileFormat::Auto
        };
        let mut filename = rest;
        let fb = rest.as_bytes();
        if fb.len() > 2 && fb[fb.len() - 2] == b':' {
            let c = fb[fb.len() - 1] as char;
            format = FileFormat::from_char(c).ok_or_else(|| {
                let known: Vec<String> = FileFormat::ALL
                    .iter()
                    .map(|f| format!(":{} {}", f.as_char(), f.description()))
                    .collect();
                Error::new(
                    ErrorKind::Parse,
                    format!("invalid file format :{} in -U {}; known formats are {}", c, s, known.join(", ")),
                )
            })?;
            filename = &rest[..rest.len() - 2];
        }

        Ok(Self {
            memstr,
            op,
            filename: filename.to_string(),
            format,
        })
    }

    /// Memory string, falling back to the part's default memory
    pub fn memstr_for(&self, part: &Part) -> String {
        self.memstr
            .clone()
            .unwrap_or_else(|| part.default_update_memory().to_string())
    }
}

/// One step of a run, in command line order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// `-U`
    Memory(MemUpdate),
    /// `-t` when `None`, `-T cmd` otherwise
    Terminal(Option<String>),
}

impl Update {
    /// Parse a `-U` argument
    pub fn parse(s: &str) -> Result<Self> {
        MemUpdate::parse(s).map(Update::Memory)
    }

    /// Interactive terminal update (`-t`)
    pub fn interactive() -> Self {
        Update::Terminal(None)
    }

    /// One-line terminal update (`-T cmd`)
    pub fn command(cmd: impl Into<String>) -> Self {
        Update::Terminal(Some(cmd.into()))
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Update::Terminal(None) => write!(f, "-t interactive terminal"),
            Update::Terminal(Some(cmd)) => write!(f, "-T {}", cmd),
            Update::Memory(u) => write!(
                f,
                "-U {}:{}:{}:{}",
                u.memstr.as_deref().unwrap_or("flash"),
                u.op.as_char(),
                u.filename,
                u.format.as_char()
            ),
        }
    }
}

/// True if `memstr` names several memories (`all`, lists, subtractions)
pub fn is_multi_memory(memstr: &str) -> bool {
    memstr.contains(',')
        || matches!(memstr, "all" | "ALL" | "etc")
        || memstr.starts_with('-')
        || memstr.starts_with('\\')
}

fn is_image_memory(part: &Part, m: &Memory) -> bool {
    if matches!(m.kind, MemKind::Io | MemKind::Sram | MemKind::Other) {
        return false;
    }
    // flash sections are already covered by flash itself
    !(m.kind.in_flash() && m.kind != MemKind::Flash && part.memory_by_kind(MemKind::Flash).is_some())
}

/// Resolve a memory list to part memory indices, in list order
///
/// `ALL` is every memory that belongs in an image, `all` the writable
/// ones, `etc` the writable ones not named earlier in the list. A
/// `-mem` or `\mem` entry removes a memory. Names unknown to every part
/// are errors; names this part lacks are skipped with a warning.
pub fn memory_list(part: &Part, memstr: &str) -> Result<Vec<usize>> {
    let all = |writable_only: bool| -> Vec<usize> {
        part.memories
            .iter()
            .enumerate()
            .filter(|(_, m)| is_image_memory(part, m) && !(writable_only && m.readonly))
            .map(|(i, _)| i)
            .collect()
    };

    let mut list: Vec<usize> = Vec::new();
    for item in memstr.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (remove, name) = match item.strip_prefix('-').or_else(|| item.strip_prefix('\\')) {
            Some(n) => (true, n),
            None => (false, item),
        };
        let found: Vec<usize> = match name {
            "ALL" => all(false),
            "all" => all(true),
            "etc" => all(true).into_iter().filter(|i| !list.contains(i)).collect(),
            n => match part.memory_index(n) {
                Some(i) => vec![i],
                None if is_known_memory_name(n) => {
                    warn!("skipping {} as memory not defined for part {}", n, part.desc);
                    continue;
                }
                None => {
                    return Err(Error::new(ErrorKind::IllegalParam, format!("unknown memory {}", n)))
                }
            },
        };
        if remove {
            list.retain(|i| !found.contains(i));
        } else {
            for i in found {
                if !list.contains(&i) {
                    list.push(i);
                }
            }
        }
    }
    Ok(list)
}

/// Statistics of an input image in a memory buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Filestats {
    /// First tagged address
    pub firstaddr: usize,
    /// Last tagged address, `None` for an empty image
    pub lastaddr: Option<usize>,
    /// Tagged bytes below the meaningful size
    pub nbytes: usize,
    /// Maximal runs of tagged bytes
    pub nsections: usize,
    /// Pages holding at least one tagged byte
    pub npages: usize,
    /// Untagged bytes inside those pages
    pub nfill: usize,
    /// Tagged bytes cut off as trailing 0xFF
    pub ntrailing: usize,
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

impl Filestats {
    /// "with N bytes in M sections within [a, b]"
    pub fn summary(&self) -> String {
        let interval = match self.lastaddr {
            None => "[none]".to_string(),
            Some(last) if last == self.firstaddr => format!("[0x{:04x}]", last),
            Some(last) => format!("[0x{:04x}, 0x{:04x}]", self.firstaddr, last),
        };
        format!(
            "with {} byte{} in {} section{} within {}",
            self.nbytes,
            plural(self.nbytes),
            self.nsections,
            plural(self.nsections),
            interval
        )
    }

    /// "using N pages and M pad bytes[, cutting off K trailing 0xff bytes]"
    pub fn page_summary(&self) -> String {
        let mut s = format!(
            "using {} page{} and {} pad byte{}",
            self.npages,
            plural(self.npages),
            self.nfill,
            plural(self.nfill)
        );
        if self.ntrailing > 0 {
            s.push_str(&format!(
                ", cutting off {} trailing 0xff byte{}",
                self.ntrailing,
                plural(self.ntrailing)
            ));
        }
        s
    }

    /// Bytes covered by a verify after a write
    pub fn verified(&self) -> usize {
        self.nbytes + self.ntrailing
    }
}

/// Page statistics of `mem` after an input file filled `size` bytes
///
/// Tagged bytes at or above `size` are trailing 0xFF bytes that a flash
/// write skips.
pub fn memstats(mem: &Memory, size: usize) -> Result<Filestats> {
    if size > mem.size {
        return Err(Error::new(
            ErrorKind::IllegalParam,
            format!("size {} at odds with {} size {}", size, mem.name, mem.size),
        ));
    }
    let ps = mem.page_size.max(1);
    let mut st = Filestats::default();
    let mut firstset = false;
    let mut insection = false;

    for base in (0..mem.size).step_by(ps) {
        let mut pageset = false;
        for (pgi, addr) in (base..(base + ps).min(mem.size)).enumerate() {
            if mem.tags[addr] & TAG_ALLOCATED != 0 {
                if !firstset {
                    firstset = true;
                    st.firstaddr = addr;
                }
                st.lastaddr = Some(addr);
                if addr < size {
                    st.nbytes += 1;
                    if !pageset {
                        pageset = true;
                        st.nfill += pgi;
                        st.npages += 1;
                    }
                    if !insection {
                        insection = true;
                        st.nsections += 1;
                    }
                } else {
                    st.ntrailing += 1;
                    if pageset {
                        st.nfill += 1;
                    }
                }
            } else {
                insection = false;
                if pageset {
                    st.nfill += 1;
                }
            }
        }
    }
    Ok(st)
}

/// Files and terminal commands seen by earlier dry runs of this run
#[derive(Debug, Clone, Default)]
pub struct DryRunHistory {
    written: Vec<String>,
    terminal_cmds: Vec<String>,
    interactive: bool,
}

impl DryRunHistory {
    fn may_have_created(&self, filename: &str) -> bool {
        self.written.iter().any(|w| w == filename)
            || self.terminal_cmds.iter().any(|c| c.contains(filename))
            || self.interactive
    }
}

fn is_ok_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| !m.is_dir()).unwrap_or(false)
}

fn is_readable(filename: &str) -> bool {
    filename == STDIO || (is_ok_file(Path::new(filename)) && fs::File::open(filename).is_ok())
}

fn is_writeable(filename: &str) -> bool {
    if filename.is_empty() {
        return false;
    }
    if filename == STDIO {
        return true;
    }
    let path = Path::new(filename);
    if path.exists() {
        return is_ok_file(path) && OpenOptions::new().append(true).open(path).is_ok();
    }
    match fs::File::create(path) {
        Ok(_) => {
            let _ = fs::remove_file(path);
            true
        }
        Err(_) => false,
    }
}

fn worse(acc: &mut Option<Error>, e: Error) {
    let replace = match acc {
        None => true,
        Some(prev) => prev.is_soft() && !e.is_soft(),
    };
    if replace {
        *acc = Some(e);
    }
}

/// Check an update before any programming happens
///
/// Resolves `format=auto` for readable input files. Returns a `SoftFail`
/// error for problems that may resolve themselves later in the run (a
/// file another update creates) and a hard error for those that cannot.
pub fn dryrun(part: Option<&Part>, upd: &mut Update, history: &mut DryRunHistory) -> Result<()> {
    let u = match upd {
        Update::Terminal(None) => {
            history.interactive = true;
            return Ok(());
        }
        Update::Terminal(Some(cmd)) => {
            history.terminal_cmds.push(cmd.clone());
            return Ok(());
        }
        Update::Memory(u) => u,
    };

    let mut failure: Option<Error> = None;
    let memstr = match (&u.memstr, part) {
        (Some(m), _) => m.clone(),
        (None, Some(p)) => p.default_update_memory().to_string(),
        (None, None) => "flash".to_string(),
    };

    if is_multi_memory(&memstr) {
        if let Some(p) = part {
            if let Err(e) = memory_list(p, &memstr) {
                worse(&mut failure, e);
            }
        }
    } else if !is_known_memory_name(&memstr) {
        worse(&mut failure, Error::new(ErrorKind::IllegalParam, format!("unknown memory {}", memstr)));
    } else if part.is_some_and(|p| p.memory(&memstr).is_none()) {
        worse(&mut failure, Error::new(ErrorKind::SoftFail, format!("{} not defined for part", memstr)));
    }

    let mut known = false;
    if (u.op != UpdateOp::Read || u.format == FileFormat::Auto) && u.format != FileFormat::Immediate {
        known = history.may_have_created(&u.filename);
        if !known && !is_readable(&u.filename) {
            worse(
                &mut failure,
                Error::new(ErrorKind::SoftFail, format!("file {} is not readable", u.filename)),
            );
            known = true;
        }
    }

    if !known && u.format == FileFormat::Auto && u.op != UpdateOp::Read {
        if u.filename == STDIO {
            worse(
                &mut failure,
                Error::new(
                    ErrorKind::IllegalParam,
                    "cannot auto detect file format for stdin/out, specify explicitly",
                ),
            );
        } else {
            match fileio::autodetect(&u.filename) {
                Ok(fmt) => {
                    u.format = fmt;
                    info!("input file {} auto detected as {}", u.filename, fmt);
                }
                Err(e) => worse(&mut failure, Error::new(ErrorKind::SoftFail, e.context().to_string())),
            }
        }
    }

    if u.op == UpdateOp::Read {
        if u.format == FileFormat::Immediate || u.format == FileFormat::Elf {
            worse(
                &mut failure,
                Error::new(ErrorKind::IllegalParam, format!("invalid file format {} for output", u.format)),
            );
        } else if !is_writeable(&u.filename) {
            worse(
                &mut failure,
                Error::new(ErrorKind::SoftFail, format!("file {} is not writeable", u.filename)),
            );
        } else if u.filename != STDIO {
            history.written.push(u.filename.clone());
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
