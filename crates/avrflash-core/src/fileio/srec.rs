//! Motorola S-record codec

use std::fmt::Write;

use super::{Chunk, Image};
use crate::error::{Error, ErrorKind, Result};

const RECORD_SIZE: usize = 32;

/// True if `line` looks like an S-record with a complete payload
pub(super) fn looks_like_record(line: &str) -> bool {
    let b = line.as_bytes();
    if b.len() < 10 || b[0] != b'S' || !b[1].is_ascii_digit() || !b[2..4].iter().all(u8::is_ascii_hexdigit) {
        return false;
    }
    let Ok(n) = u8::from_str_radix(&line[2..4], 16) else {
        return false;
    };
    let ndigits = 2 * n as usize;
    b.len() >= 4 + ndigits && b[4..4 + ndigits].iter().all(u8::is_ascii_hexdigit)
}

fn hex_bytes(s: &str, lineno: usize) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::new(ErrorKind::Parse, format!("S-record line {}: odd number of digits", lineno)));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| Error::new(ErrorKind::Parse, format!("S-record line {}: bad hex digit", lineno)))
        })
        .collect()
}

/// Decode S0..S9 records, verifying counts and checksums
pub(super) fn decode(text: &str) -> Result<Image> {
    let mut image = Image::new();
    for (n, line) in text.lines().enumerate() {
        let lineno = n + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bad = |what: &str| Error::new(ErrorKind::Parse, format!("S-record line {}: {}", lineno, what));
        if !line.starts_with('S') || line.len() < 4 {
            return Err(bad("not a record"));
        }
        let kind = line.as_bytes()[1];
        let body = hex_bytes(&line[2..], lineno)?;
        let count = body[0] as usize;
        if body.len() != count + 1 {
            return Err(bad("record length mismatch"));
        }
        let sum = body[..count].iter().fold(0u8, |a, &b| a.wrapping_add(b));
        if !sum != body[count] {
            return Err(bad("checksum mismatch"));
        }
        let alen = match kind {
            b'1' | b'9' => 2,
            b'2' | b'8' => 3,
            b'3' | b'7' => 4,
            b'0' | b'5' | b'6' => continue,
            _ => return Err(bad("unknown record type")),
        };
        if kind >= b'7' {
            break;
        }
        if count < alen + 1 {
            return Err(bad("record too short"));
        }
        let addr = body[1..=alen].iter().fold(0u32, |a, &b| (a << 8) | u32::from(b));
        let data = &body[1 + alen..count];
        match image.last_mut() {
            Some(last) if last.addr + last.data.len() as u32 == addr => last.data.extend_from_slice(data),
            _ => image.push(Chunk { addr, data: data.to_vec() }),
        }
    }
    Ok(image)
}

fn record(out: &mut String, kind: u8, alen: usize, addr: u32, data: &[u8]) {
    let count = (alen + data.len() + 1) as u8;
    let abytes = &addr.to_be_bytes()[4 - alen..];
    let sum = abytes.iter().chain(data).fold(count, |a, &b| a.wrapping_add(b));
    let _ = write!(out, "S{}{:02X}", kind, count);
    for b in abytes.iter().chain(data) {
        let _ = write!(out, "{:02X}", b);
    }
    let _ = writeln!(out, "{:02X}", !sum);
}

/// Encode with the shortest address width that fits the image
pub(super) fn encode(image: &Image) -> String {
    let top = image.iter().map(|c| c.addr as u64 + c.data.len() as u64).max().unwrap_or(0);
    let (kind, alen, term) = if top <= 0x1_0000 {
        (1, 2, 9)
    } else if top <= 0x100_0000 {
        (2, 3, 8)
    } else {
        (3, 4, 7)
    };

    let mut out = String::new();
    record(&mut out, 0, 2, 0, b"avrflash");
    for chunk in image {
        for (i, part) in chunk.data.chunks(RECORD_SIZE).enumerate() {
            record(&mut out, kind, alen, chunk.addr + (i * RECORD_SIZE) as u32, part);
        }
    }
    record(&mut out, term, alen, 0, &[]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_record() {
        let image = decode("S1130000285F245F2212226A000424290008237C2A\nS9030000FC\n").unwrap();
        assert_eq!(image.len(), 1);
        assert_eq!(image[0].addr, 0);
        assert_eq!(image[0].data[..4], [0x28, 0x5F, 0x24, 0x5F]);
        assert_eq!(image[0].data.len(), 16);
    }

    #[test]
    fn test_checksum_rejected() {
        let err = decode("S1130000285F245F2212226A000424290008237C2B\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_encode_picks_s2_for_eeprom_window() {
        let image = vec![Chunk { addr: 0x81_0000, data: vec![1, 2, 3] }];
        let text = encode(&image);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[1].starts_with("S207810000010203"));
        assert!(lines[2].starts_with("S804"));
        assert_eq!(decode(&text).unwrap(), image);
    }
}
