//! Reading and writing memory images
//!
//! Every decoder turns a file into an [`Image`], a list of address-tagged
//! chunks, and every encoder turns an [`Image`] back into a file. Mapping
//! chunks onto part memories happens here, so the codecs never look at a
//! [`Part`].
//!
//! Multi-memory images place each memory at a fixed offset in one flat
//! address space, the same layout avr-gcc uses for its ELF sections.

mod elf;
mod ihex;
mod srec;
mod text;

use std::fmt;
use std::fs;
use std::io::{Read, Write};

use log::{debug, warn};

use crate::avr::mem_hiaddr;
use crate::error::{Error, ErrorKind, Result};
use crate::part::{MemKind, Memory, Part, TAG_ALLOCATED};

/// File name standing for stdin or stdout
pub const STDIO: &str = "-";

/// Image file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// Detect from the file contents
    Auto,
    /// Intel HEX
    Ihex,
    /// Intel HEX with an ASCII comment after each record
    IhexComments,
    /// Motorola S-record
    Srec,
    /// ELF executable (input only)
    Elf,
    /// Raw binary
    Raw,
    /// Data given in place of the file name
    Immediate,
    /// Text: binary numbers (`0b...`)
    Binary,
    /// Text: decimal numbers
    Decimal,
    /// Text: hexadecimal numbers (`0x...`)
    Hex,
    /// Text: octal numbers (`0...`)
    Octal,
}

impl FileFormat {
    /// All formats, in help order
    pub const ALL: [FileFormat; 11] = [
        FileFormat::Auto,
        FileFormat::Ihex,
        FileFormat::IhexComments,
        FileFormat::Srec,
        FileFormat::Elf,
        FileFormat::Raw,
        FileFormat::Immediate,
        FileFormat::Binary,
        FileFormat::Decimal,
        FileFormat::Hex,
        FileFormat::Octal,
    ];

    /// Format for a `-U` format letter
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'a' => FileFormat::Auto,
            'i' => FileFormat::Ihex,
            'I' => FileFormat::IhexComments,
            's' => FileFormat::Srec,
            'e' => FileFormat::Elf,
            'r' => FileFormat::Raw,
            'm' => FileFormat::Immediate,
            'b' => FileFormat::Binary,
            'd' => FileFormat::Decimal,
            'h' => FileFormat::Hex,
            'o' => FileFormat::Octal,
            _ => return None,
        })
    }

    /// The `-U` format letter
    pub fn as_char(self) -> char {
        match self {
            FileFormat::Auto => 'a',
            FileFormat::Ihex => 'i',
            FileFormat::IhexComments => 'I',
            FileFormat::Srec => 's',
            FileFormat::Elf => 'e',
            FileFormat::Raw => 'r',
            FileFormat::Immediate => 'm',
            FileFormat::Binary => 'b',
            FileFormat::Decimal => 'd',
            FileFormat::Hex => 'h',
            FileFormat::Octal => 'o',
        }
    }

    /// Human readable name
    pub fn description(self) -> &'static str {
        match self {
            FileFormat::Auto => "auto detect",
            FileFormat::Ihex => "Intel Hex",
            FileFormat::IhexComments => "Intel Hex with comments",
            FileFormat::Srec => "Motorola S-Record",
            FileFormat::Elf => "ELF",
            FileFormat::Raw => "raw binary",
            FileFormat::Immediate => "immediate",
            FileFormat::Binary => "0b-binary byte list",
            FileFormat::Decimal => "decimal byte list",
            FileFormat::Hex => "0x-hexadecimal byte list",
            FileFormat::Octal => "octal byte list",
        }
    }

    /// True if the format can carry data for several memories
    pub fn is_multi_capable(self) -> bool {
        matches!(
            self,
            FileFormat::Ihex | FileFormat::IhexComments | FileFormat::Srec | FileFormat::Elf
        )
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A run of bytes at an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Address of the first byte
    pub addr: u32,
    /// The bytes
    pub data: Vec<u8>,
}

/// Address-tagged contents of an image file
pub type Image = Vec<Chunk>;

/// The memories a file is read into or written from
#[derive(Debug, Clone, Copy)]
pub enum MemSelect<'a> {
    /// One memory, addressed from 0
    Single(usize),
    /// Several memories at their flat image offsets
    Multi(&'a [usize]),
}

impl MemSelect<'_> {
    fn indices(&self) -> Vec<usize> {
        match self {
            MemSelect::Single(i) => vec![*i],
            MemSelect::Multi(list) => list.to_vec(),
        }
    }
}

/// Offset of `mem` in a multi-memory image
///
/// Flash sections share the flash window at 0. Fuses are laid out by fuse
/// number and the signature row holds signature then calibration.
pub fn image_base(part: &Part, mem: &Memory) -> Option<u32> {
    let base = match mem.kind {
        k if k.in_flash() => {
            let flash_off = part.flash().map_or(0, |f| f.offset);
            return Some(mem.offset.saturating_sub(flash_off));
        }
        MemKind::Eeprom => 0x81_0000,
        MemKind::Fuses => 0x82_0000,
        MemKind::Fuse => 0x82_0000 + fuse_index(part, mem)?,
        MemKind::Lock => 0x83_0000,
        MemKind::Signature => 0x84_0000,
        MemKind::Calibration => 0x84_0003,
        MemKind::SigRow => 0x84_0000 + sigrow_offset(part, mem),
        MemKind::UserRow => 0x85_0000,
        MemKind::BootRow => 0x86_0000,
        _ => return None,
    };
    Some(base)
}

fn fuse_index(part: &Part, mem: &Memory) -> Option<u32> {
    let named = match mem.name.as_str() {
        "lfuse" | "fuse" => Some(0),
        "hfuse" => Some(1),
        "efuse" => Some(2),
        n => n.strip_prefix("fuse").and_then(|d| d.parse().ok()),
    };
    if named.is_some() {
        return named;
    }
    // fuses identified by function sit at their offset from the first fuse
    let first = part
        .memories
        .iter()
        .filter(|m| m.kind == MemKind::Fuse)
        .map(|m| m.offset)
        .min()?;
    Some(mem.offset - first)
}

fn sigrow_offset(part: &Part, mem: &Memory) -> u32 {
    match part.memory_by_kind(MemKind::Signature) {
        Some(sig) if sig.offset > 0 && mem.offset >= sig.offset => mem.offset - sig.offset,
        _ => 0,
    }
}

/// Guess the format of an input file from its first line
pub fn autodetect(path: &str) -> Result<FileFormat> {
    if path == STDIO {
        return Err(Error::new(
            ErrorKind::IllegalParam,
            "cannot auto detect file format for stdin/out, specify explicitly",
        ));
    }
    let data = fs::read(path).map_err(|e| Error::from(e).with_context(format!("cannot read {}", path)))?;
    detect_bytes(&data).ok_or_else(|| {
        Error::new(
            ErrorKind::Parse,
            format!("cannot determine file format for {}, specify explicitly", path),
        )
    })
}

/// Guess the format of file contents
///
/// ELF is recognised by its magic and Intel HEX and S-records by a first
/// line that looks like a record. A line of numbers is a text dump and
/// anything else is raw binary.
pub fn detect_bytes(data: &[u8]) -> Option<FileFormat> {
    if data.starts_with(b"\x7fELF") {
        return Some(FileFormat::Elf);
    }
    if data.is_empty() {
        return None;
    }
    let line_end = data.iter().position(|&b| b == b'\n').unwrap_or(data.len());
    let line = &data[..line_end];
    if line.iter().any(|&b| b > 127) {
        return Some(FileFormat::Raw);
    }
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end();
    if ihex::looks_like_record(line) {
        return Some(FileFormat::Ihex);
    }
    if srec::looks_like_record(line) {
        return Some(FileFormat::Srec);
    }
    text::detect_radix(line).or(Some(FileFormat::Raw))
}

fn read_input(path: &str) -> Result<Vec<u8>> {
    if path == STDIO {
        let mut data = Vec::new();
        std::io::stdin().read_to_end(&mut data)?;
        Ok(data)
    } else {
        fs::read(path).map_err(|e| Error::from(e).with_context(format!("cannot read {}", path)))
    }
}

/// Write `data` to `path`, or to stdout for `-`
pub fn write_output(path: &str, data: &[u8]) -> Result<()> {
    if path == STDIO {
        let mut out = std::io::stdout().lock();
        out.write_all(data)?;
        out.flush()?;
        Ok(())
    } else {
        fs::write(path, data).map_err(|e| Error::from(e).with_context(format!("cannot write {}", path)))
    }
}

/// Decode an image from `path` (or the immediate data in `path`)
pub fn decode(fmt: FileFormat, path: &str) -> Result<Image> {
    let fmt = match fmt {
        FileFormat::Auto => autodetect(path)?,
        f => f,
    };
    debug!("reading {} as {}", path, fmt);
    match fmt {
        FileFormat::Immediate => text::decode_numbers(path),
        FileFormat::Ihex | FileFormat::IhexComments => ihex::decode(&String::from_utf8_lossy(&read_input(path)?)),
        FileFormat::Srec => srec::decode(&String::from_utf8_lossy(&read_input(path)?)),
        FileFormat::Elf => elf::decode(&read_input(path)?),
        FileFormat::Raw => Ok(vec![Chunk { addr: 0, data: read_input(path)? }]),
        FileFormat::Binary | FileFormat::Decimal | FileFormat::Hex | FileFormat::Octal => {
            text::decode_numbers(&String::from_utf8_lossy(&read_input(path)?))
        }
        FileFormat::Auto => Err(Error::new(ErrorKind::IllegalParam, "unresolved auto format")),
    }
}

/// Encode `image` in `fmt`
pub fn encode(fmt: FileFormat, image: &Image) -> Result<Vec<u8>> {
    match fmt {
        FileFormat::Ihex => ihex::encode(image, false).map(String::into_bytes),
        FileFormat::IhexComments => ihex::encode(image, true).map(String::into_bytes),
        FileFormat::Srec => Ok(srec::encode(image).into_bytes()),
        FileFormat::Raw => {
            let end = image.iter().map(|c| c.addr as usize + c.data.len()).max().unwrap_or(0);
            let mut out = vec![0xFF; end];
            for c in image {
                out[c.addr as usize..c.addr as usize + c.data.len()].copy_from_slice(&c.data);
            }
            Ok(out)
        }
        FileFormat::Binary | FileFormat::Decimal | FileFormat::Hex | FileFormat::Octal => {
            Ok(text::encode_numbers(image, fmt).into_bytes())
        }
        FileFormat::Elf | FileFormat::Immediate | FileFormat::Auto => Err(Error::new(
            ErrorKind::Unsupported,
            format!("invalid file format {} for output", fmt),
        )),
    }
}

/// Read a file into the buffers of the selected memories
///
/// The selected memories are cleared first; every byte from the file is
/// tagged. Returns, per selected memory, the number of meaningful bytes:
/// for flash with `trim` this excludes trailing 0xFF bytes.
pub fn read_file(
    fmt: FileFormat,
    path: &str,
    part: &mut Part,
    select: MemSelect<'_>,
    trim: bool,
) -> Result<Vec<usize>> {
    let real_fmt = match fmt {
        FileFormat::Auto => autodetect(path)?,
        f => f,
    };
    if matches!(select, MemSelect::Multi(_)) && !real_fmt.is_multi_capable() {
        return Err(Error::new(
            ErrorKind::IllegalParam,
            format!("{} format cannot hold multiple memories", real_fmt),
        ));
    }
    let image = decode(real_fmt, path)?;
    let indices = select.indices();
    for &i in &indices {
        part.memories[i].clear();
    }
    // ELF always uses flat section addresses
    let flat = real_fmt == FileFormat::Elf || matches!(select, MemSelect::Multi(_));
    scatter(&image, part, &indices, flat, path)?;

    Ok(indices
        .iter()
        .map(|&i| {
            let mem = &part.memories[i];
            let hi = mem.tags.iter().rposition(|&t| t & TAG_ALLOCATED != 0).map_or(0, |p| p + 1);
            hi.min(mem_hiaddr(mem, trim))
        })
        .collect())
}

fn scatter(image: &Image, part: &mut Part, indices: &[usize], flat: bool, path: &str) -> Result<()> {
    let windows: Vec<(usize, u32, u32)> = if flat {
        indices
            .iter()
            .filter_map(|&i| {
                let m = &part.memories[i];
                image_base(part, m).map(|b| (i, b, b + m.size as u32))
            })
            .collect()
    } else {
        let i = indices[0];
        vec![(i, 0, part.memories[i].size as u32)]
    };

    let mut ignored = 0usize;
    for chunk in image {
        for (k, &b) in chunk.data.iter().enumerate() {
            let addr = chunk.addr + k as u32;
            match windows.iter().find(|(_, lo, hi)| (*lo..*hi).contains(&addr)) {
                Some(&(i, lo, _)) => {
                    let mem = &mut part.memories[i];
                    let a = (addr - lo) as usize;
                    mem.buf[a] = b;
                    mem.tags[a] |= TAG_ALLOCATED;
                }
                None if flat => ignored += 1,
                None => {
                    let mem = &part.memories[indices[0]];
                    return Err(Error::new(
                        ErrorKind::IllegalParam,
                        format!(
                            "address 0x{:04x} in {} out of range for {} of size {}",
                            addr, path, mem.name, mem.size
                        ),
                    ));
                }
            }
        }
    }
    if ignored > 0 {
        warn!("{}: {} bytes outside the selected memories ignored", path, ignored);
    }
    Ok(())
}

/// Collect the first `sizes[k]` bytes of each selected memory into an image
pub fn gather(part: &Part, select: MemSelect<'_>, sizes: &[usize]) -> Result<Image> {
    let mut image = Image::new();
    match select {
        MemSelect::Single(i) => {
            let mem = &part.memories[i];
            let n = sizes.first().copied().unwrap_or(mem.size).min(mem.size);
            image.push(Chunk { addr: 0, data: mem.buf[..n].to_vec() });
        }
        MemSelect::Multi(list) => {
            for (k, &i) in list.iter().enumerate() {
                let mem = &part.memories[i];
                let n = sizes.get(k).copied().unwrap_or(mem.size).min(mem.size);
                if n == 0 {
                    continue;
                }
                let base = image_base(part, mem).ok_or_else(|| {
                    Error::new(
                        ErrorKind::Unsupported,
                        format!("{} has no place in a multi-memory image", mem.name),
                    )
                })?;
                image.push(Chunk { addr: base, data: mem.buf[..n].to_vec() });
            }
        }
    }
    Ok(image)
}

/// Write the selected memories to a file
pub fn write_file(
    fmt: FileFormat,
    path: &str,
    part: &Part,
    select: MemSelect<'_>,
    sizes: &[usize],
) -> Result<()> {
    if matches!(select, MemSelect::Multi(_)) && !fmt.is_multi_capable() {
        return Err(Error::new(
            ErrorKind::IllegalParam,
            format!("{} format cannot hold multiple memories", fmt),
        ));
    }
    let image = gather(part, select, sizes)?;
    let bytes = encode(fmt, &image)?;
    write_output(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::PartDatabase;

    fn m328p() -> Part {
        PartDatabase::builtin().unwrap().find("m328p").unwrap().clone()
    }

    #[test]
    fn test_format_letters() {
        for f in FileFormat::ALL {
            assert_eq!(FileFormat::from_char(f.as_char()), Some(f));
        }
        assert_eq!(FileFormat::from_char('x'), None);
    }

    #[test]
    fn test_detect() {
        assert_eq!(detect_bytes(b"\x7fELF\x01\x01"), Some(FileFormat::Elf));
        assert_eq!(detect_bytes(b":100000000C9434000C9446000C9446000C944600AA\n"), Some(FileFormat::Ihex));
        assert_eq!(detect_bytes(b"S1130000285F245F2212226A000424290008237C2A\n"), Some(FileFormat::Srec));
        assert_eq!(detect_bytes(b"0x12, 0x34, 0x56\n"), Some(FileFormat::Hex));
        assert_eq!(detect_bytes(&[0x0C, 0x94, 0x34, 0x00]), Some(FileFormat::Raw));
    }

    #[test]
    fn test_image_bases() {
        let part = m328p();
        assert_eq!(image_base(&part, part.flash().unwrap()), Some(0));
        assert_eq!(image_base(&part, part.eeprom().unwrap()), Some(0x81_0000));
        assert_eq!(image_base(&part, part.memory("hfuse").unwrap()), Some(0x82_0001));
        assert_eq!(image_base(&part, part.memory("lock").unwrap()), Some(0x83_0000));
    }

    #[test]
    fn test_scatter_multi_memory() {
        let mut part = m328p();
        let flash = part.memory_index("flash").unwrap();
        let ee = part.memory_index("eeprom").unwrap();
        let image = vec![
            Chunk { addr: 0x10, data: vec![1, 2] },
            Chunk { addr: 0x81_0004, data: vec![0xAB] },
        ];
        scatter(&image, &mut part, &[flash, ee], true, "test").unwrap();
        assert_eq!(part.memories[flash].buf[0x10..0x12], [1, 2]);
        assert_eq!(part.memories[ee].buf[4], 0xAB);
        assert_eq!(part.memories[ee].tags[4], TAG_ALLOCATED);
        assert_eq!(part.memories[ee].tags[3], 0);
    }

    #[test]
    fn test_scatter_single_out_of_range() {
        let mut part = m328p();
        let ee = part.memory_index("eeprom").unwrap();
        let image = vec![Chunk { addr: 1023, data: vec![1, 2] }];
        let err = scatter(&image, &mut part, &[ee], false, "test").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalParam);
    }

    #[test]
    fn test_read_immediate_trims_flash() {
        let mut part = m328p();
        let flash = part.memory_index("flash").unwrap();
        let sizes = read_file(
            FileFormat::Immediate,
            "0x0c 0x94 0xff 0xff",
            &mut part,
            MemSelect::Single(flash),
            true,
        )
        .unwrap();
        assert_eq!(sizes, vec![2]);
        let sizes = read_file(
            FileFormat::Immediate,
            "0x0c 0x94 0xff 0xff",
            &mut part,
            MemSelect::Single(flash),
            false,
        )
        .unwrap();
        assert_eq!(sizes, vec![4]);
    }

    #[test]
    fn test_raw_is_single_memory_only() {
        let mut part = m328p();
        let list = [0, 1];
        let err = read_file(FileFormat::Raw, "-", &mut part, MemSelect::Multi(&list), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalParam);
    }

    #[test]
    fn test_gather_multi_skips_empty() {
        let mut part = m328p();
        let flash = part.memory_index("flash").unwrap();
        let ee = part.memory_index("eeprom").unwrap();
        part.memories[ee].buf[0] = 0x42;
        let image = gather(&part, MemSelect::Multi(&[flash, ee]), &[0, 1]).unwrap();
        assert_eq!(image, vec![Chunk { addr: 0x81_0000, data: vec![0x42] }]);
    }
}
