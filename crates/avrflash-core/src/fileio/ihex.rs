//! Intel HEX on top of the `ihex` crate

use ihex::{Reader, ReaderOptions, Record};

use super::{Chunk, Image};
use crate::error::{Error, ErrorKind, Result};

const RECORD_SIZE: usize = 32;

fn parse_err(e: impl std::fmt::Display) -> Error {
    Error::new(ErrorKind::Parse, format!("Intel HEX: {}", e))
}

/// True if `line` is a well-formed data-carrying record prefix
pub(super) fn looks_like_record(line: &str) -> bool {
    let b = line.as_bytes();
    if b.len() < 11 || b[0] != b':' || !b[1..3].iter().all(u8::is_ascii_hexdigit) {
        return false;
    }
    let Ok(n) = u8::from_str_radix(&line[1..3], 16) else {
        return false;
    };
    let ndigits = 2 * n as usize + 8;
    b.len() >= 3 + ndigits && b[3..3 + ndigits].iter().all(u8::is_ascii_hexdigit)
}

/// Decode records; `//` comments and blank lines are skipped
pub(super) fn decode(text: &str) -> Result<Image> {
    let cleaned: Vec<&str> = text
        .lines()
        .map(|l| l.split("//").next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .collect();
    let cleaned = cleaned.join("\n");

    let opts = ReaderOptions {
        stop_after_first_error: true,
        stop_after_eof: true,
    };
    let mut image = Image::new();
    let mut upper: u32 = 0;
    for rec in Reader::new_with_options(&cleaned, opts) {
        match rec.map_err(parse_err)? {
            Record::Data { offset, value } => {
                let addr = upper + u32::from(offset);
                match image.last_mut() {
                    Some(last) if last.addr + last.data.len() as u32 == addr => last.data.extend_from_slice(&value),
                    _ => image.push(Chunk { addr, data: value }),
                }
            }
            Record::ExtendedSegmentAddress(seg) => upper = u32::from(seg) << 4,
            Record::ExtendedLinearAddress(hi) => upper = u32::from(hi) << 16,
            Record::EndOfFile => break,
            Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
        }
    }
    Ok(image)
}

fn ascii_comment(addr: u32, data: &[u8]) -> String {
    let mut s = format!("{:width$} // {:05x}> ", "", addr, width = 2 * (RECORD_SIZE - data.len()));
    for &b in data {
        let c = b & 0x7F;
        s.push(match c {
            b' ' => '_',
            c if c < b' ' || c == 0x7F => '.',
            c => c as char,
        });
    }
    s
}

/// Encode as 32-byte data records with extended linear address records
pub(super) fn encode(image: &Image, comments: bool) -> Result<String> {
    let mut records = Vec::new();
    let mut addrs = Vec::new();
    let mut upper: Option<u16> = None;

    for chunk in image {
        let mut addr = chunk.addr;
        let mut rest = chunk.data.as_slice();
        while !rest.is_empty() {
            let hi = (addr >> 16) as u16;
            if upper != Some(hi) && !(upper.is_none() && hi == 0) {
                records.push(Record::ExtendedLinearAddress(hi));
                addrs.push(None);
            }
            upper = Some(hi);
            let lo = (addr & 0xFFFF) as usize;
            let n = rest.len().min(RECORD_SIZE).min(0x1_0000 - lo);
            records.push(Record::Data {
                offset: lo as u16,
                value: rest[..n].to_vec(),
            });
            addrs.push(Some(addr));
            addr += n as u32;
            rest = &rest[n..];
        }
    }
    records.push(Record::EndOfFile);

    if !comments {
        let mut out = ihex::create_object_file_representation(&records).map_err(parse_err)?;
        if !out.ends_with('\n') {
            out.push('\n');
        }
        return Ok(out);
    }
    let mut out = String::new();
    for (rec, addr) in records.iter().zip(addrs.iter().chain(std::iter::once(&None))) {
        out.push_str(&rec.to_record_string().map_err(parse_err)?);
        if let (Some(a), Record::Data { value, .. }) = (addr, rec) {
            out.push_str(&ascii_comment(*a, value));
        }
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_extended_linear() {
        let text = ":02000004008179\n:02000400ABCD82\n:00000001FF\n";
        let image = decode(text).unwrap();
        assert_eq!(image, vec![Chunk { addr: 0x81_0004, data: vec![0xAB, 0xCD] }]);
    }

    #[test]
    fn test_encode_splits_at_64k() {
        let image = vec![Chunk { addr: 0xFFF0, data: vec![0x11; 0x20] }];
        let text = encode(&image, false).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with(":10FFF000"));
        assert_eq!(lines[1], ":020000040001F9");
        assert!(lines[2].starts_with(":10000000"));
        assert_eq!(*lines.last().unwrap(), ":00000001FF");
        assert_eq!(decode(&text).unwrap(), image);
    }

    #[test]
    fn test_comments_are_ignored_on_read() {
        let image = vec![Chunk { addr: 0, data: b"Hi there".to_vec() }];
        let text = encode(&image, true).unwrap();
        assert!(text.lines().next().unwrap().ends_with("// 00000> Hi_there"));
        assert_eq!(decode(&text).unwrap(), image);
    }

    #[test]
    fn test_bad_checksum() {
        let err = decode(":0100000012EE\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }
}
