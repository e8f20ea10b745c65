//! Byte lists as text: immediate data and the `b`/`d`/`h`/`o` dumps

use super::{Chunk, FileFormat, Image};
use crate::error::{Error, ErrorKind, Result};

const SEPARATORS: &[char] = &[',', ' ', '\t', '\n', '\r', '\x0b', '\x0c'];

/// Parse one byte value in any radix (`0x`, `0b`, leading `0` octal, decimal)
///
/// Negative values down to -128 are stored as two's complement.
pub fn parse_byte(tok: &str) -> Option<u8> {
    let (neg, t) = match tok.strip_prefix('-') {
        Some(t) => (true, t),
        None => (false, tok.strip_prefix('+').unwrap_or(tok)),
    };
    let lower = t.to_ascii_lowercase();
    let v = if let Some(h) = lower.strip_prefix("0x") {
        u32::from_str_radix(h, 16).ok()?
    } else if let Some(b) = lower.strip_prefix("0b") {
        u32::from_str_radix(b, 2).ok()?
    } else if lower.len() > 1 && lower.starts_with('0') {
        u32::from_str_radix(&lower[1..], 8).ok()?
    } else {
        lower.parse::<u32>().ok()?
    };
    if neg {
        (v <= 128).then(|| (v as u8).wrapping_neg())
    } else {
        u8::try_from(v).ok()
    }
}

fn tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split(SEPARATORS).filter(|t| !t.is_empty())
}

/// Decode a byte list into one chunk at address 0
///
/// Blank lines and `#` comments are skipped.
pub(super) fn decode_numbers(text: &str) -> Result<Image> {
    let mut data = Vec::new();
    for line in text.lines() {
        for tok in tokens(line) {
            if tok.starts_with('#') {
                break;
            }
            let b = parse_byte(tok)
                .ok_or_else(|| Error::new(ErrorKind::Parse, format!("invalid data {} in byte list", tok)))?;
            data.push(b);
        }
    }
    Ok(vec![Chunk { addr: 0, data }])
}

fn render(b: u8, fmt: FileFormat) -> String {
    match fmt {
        FileFormat::Hex => format!("0x{:02x}", b),
        FileFormat::Binary => format!("0b{:b}", b),
        // small octal values are indistinguishable from decimal anyway
        FileFormat::Octal if b >= 8 => format!("0{:o}", b),
        _ => b.to_string(),
    }
}

/// Encode all bytes as one comma separated line
pub(super) fn encode_numbers(image: &Image, fmt: FileFormat) -> String {
    let mut out = image
        .iter()
        .flat_map(|c| c.data.iter())
        .map(|&b| render(b, fmt))
        .collect::<Vec<_>>()
        .join(",");
    out.push('\n');
    out
}

/// Radix of a line of numbers, or `None` if the line is not a byte list
pub(super) fn detect_radix(line: &str) -> Option<FileFormat> {
    let line = line.trim_start();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    // hex, bin, oct, dec
    let mut counts = [0usize; 4];
    for tok in tokens(line) {
        if tok.starts_with('#') {
            break;
        }
        parse_byte(tok)?;
        let t = tok.trim_start_matches(['-', '+']).to_ascii_lowercase();
        let idx = if t.starts_with("0x") {
            0
        } else if t.starts_with("0b") {
            1
        } else if t.len() > 1 && t.starts_with('0') {
            2
        } else {
            3
        };
        counts[idx] += 1;
    }
    if counts.iter().sum::<usize>() == 0 {
        return None;
    }
    let fmts = [FileFormat::Hex, FileFormat::Binary, FileFormat::Octal, FileFormat::Decimal];
    let i0 = if counts[0] >= counts[1] { 0 } else { 1 };
    let i2 = if counts[2] > counts[3] { 2 } else { 3 };
    Some(fmts[if counts[i0] >= counts[i2] { i0 } else { i2 }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_radixes() {
        assert_eq!(parse_byte("0x1F"), Some(0x1F));
        assert_eq!(parse_byte("0b101"), Some(5));
        assert_eq!(parse_byte("017"), Some(15));
        assert_eq!(parse_byte("0"), Some(0));
        assert_eq!(parse_byte("-1"), Some(0xFF));
        assert_eq!(parse_byte("256"), None);
        assert_eq!(parse_byte("zz"), None);
    }

    #[test]
    fn test_decode_skips_comments() {
        let image = decode_numbers("# header\n1, 2 3 # tail\n0x04\n").unwrap();
        assert_eq!(image[0].data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_encode_octal_small_values_plain() {
        let image = vec![Chunk { addr: 0, data: vec![7, 8, 255] }];
        assert_eq!(encode_numbers(&image, FileFormat::Octal), "7,010,0377\n");
        assert_eq!(encode_numbers(&image, FileFormat::Hex), "0x07,0x08,0xff\n");
    }

    #[test]
    fn test_detect_radix_majority() {
        assert_eq!(detect_radix("0x01,0x02,3"), Some(FileFormat::Hex));
        assert_eq!(detect_radix("1,2,3"), Some(FileFormat::Decimal));
        assert_eq!(detect_radix("012,013"), Some(FileFormat::Octal));
        assert_eq!(detect_radix("hello world"), None);
    }
}
