//! Parsing of `write` data items and numeric arguments
//!
//! Integers take an optional case-insensitive size suffix: `HH` one byte,
//! `H` or `S` two, `L` four and `LL` eight; `U` marks them unsigned.
//! Floating point numbers are written as 32-bit floats unless suffixed
//! with `D`. Everything is stored little-endian.

use crate::error::{Result, TermError};

/// Bytes produced by one data item
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    /// Little-endian representation
    pub bytes: Vec<u8>,
    /// Set when the value had to be truncated or reinterpreted
    pub warning: Option<String>,
}

impl Datum {
    fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, warning: None }
    }
}

/// Parse an address, length or byte argument
///
/// Accepts an optional sign and `0x`, `0b` or leading-zero octal notation.
pub fn parse_int(s: &str) -> Result<i64> {
    let t = s.trim();
    let (neg, body) = match t.as_bytes().first() {
        Some(b'-') => (true, &t[1..]),
        Some(b'+') => (false, &t[1..]),
        _ => (false, t),
    };
    let magnitude = parse_magnitude(body).ok_or_else(|| TermError::InvalidArgument(format!("invalid number {}", s)))?;
    let v = i64::try_from(magnitude).map_err(|_| TermError::InvalidArgument(format!("{} is out of range", s)))?;
    Ok(if neg { -v } else { v })
}

fn parse_magnitude(body: &str) -> Option<u64> {
    let lower = body.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = lower.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).ok()
    } else if lower.len() > 1 && lower.starts_with('0') {
        u64::from_str_radix(&lower[1..], 8).ok()
    } else {
        lower.parse().ok()
    }
}

/// Byte width requested by an integer suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IntSuffix {
    width: Option<usize>,
    unsigned: bool,
}

fn split_int_suffix(s: &str) -> (&str, IntSuffix) {
    let upper = s.to_ascii_uppercase();
    let mut end = upper.len();
    let mut unsigned = false;
    let mut width = None;

    // none of the suffix letters is a hex digit
    let strip = |suffix: &str, end: &mut usize| {
        if upper[..*end].ends_with(suffix) && *end > suffix.len() {
            *end -= suffix.len();
            true
        } else {
            false
        }
    };
    if strip("U", &mut end) {
        unsigned = true;
    }
    for (suffix, w) in [("LL", 8), ("HH", 1), ("L", 4), ("H", 2), ("S", 2)] {
        if strip(suffix, &mut end) {
            width = Some(w);
            break;
        }
    }
    if !unsigned && strip("U", &mut end) {
        unsigned = true;
    }
    (&s[..end], IntSuffix { width, unsigned })
}

fn min_unsigned_width(v: u64) -> usize {
    match v {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFFFF_FFFF => 4,
        _ => 8,
    }
}

fn min_signed_width(v: i64) -> usize {
    if i8::try_from(v).is_ok() {
        1
    } else if i16::try_from(v).is_ok() {
        2
    } else if i32::try_from(v).is_ok() {
        4
    } else {
        8
    }
}

fn fits(v: i128, width: usize) -> bool {
    let bits = 8 * width as u32;
    let umax = (1i128 << bits) - 1;
    let smin = -(1i128 << (bits - 1));
    (smin..=umax).contains(&v)
}

fn parse_integer(token: &str) -> Option<Datum> {
    let (body, suffix) = split_int_suffix(token);
    let (neg, digits) = match body.as_bytes().first() {
        Some(b'-') => (true, &body[1..]),
        Some(b'+') => (false, &body[1..]),
        _ => (false, body),
    };
    if digits.is_empty() || !digits.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    let magnitude = parse_magnitude(digits)?;
    let lower = digits.to_ascii_lowercase();
    let radix_digits = if let Some(h) = lower.strip_prefix("0x") {
        Some((h.len(), 4))
    } else {
        lower.strip_prefix("0b").map(|b| (b.len(), 1))
    };

    let value: i128 = if neg { -(magnitude as i128) } else { magnitude as i128 };
    let mut warning = None;
    let width = match suffix.width {
        Some(w) => {
            if !fits(value, w) {
                warning = Some(format!("{} does not fit into {} byte{}", token, w, if w == 1 { "" } else { "s" }));
            }
            w
        }
        None => match radix_digits {
            // 0x/0b literals are sized by their digit count, leading zeros included
            Some((n, bits)) if !neg => match n * bits {
                0..=8 => 1,
                9..=16 => 2,
                17..=32 => 4,
                _ => 8,
            },
            _ if neg && suffix.unsigned => 8,
            _ if neg => min_signed_width(value as i64),
            _ => min_unsigned_width(magnitude),
        },
    };
    let raw = value as u64;
    Some(Datum {
        bytes: raw.to_le_bytes()[..width].to_vec(),
        warning,
    })
}

fn parse_float(token: &str) -> Option<Datum> {
    let upper = token.to_ascii_uppercase();
    let is_hex = upper.trim_start_matches(['+', '-']).starts_with("0X");
    let (body, double) = if is_hex {
        // D and F are hex digits; only an explicit exponent frees them up as suffixes
        match upper.find('P') {
            Some(p) if upper.ends_with('D') && p < upper.len() - 1 => (&token[..token.len() - 1], true),
            Some(p) if upper.ends_with('F') && p < upper.len() - 1 => (&token[..token.len() - 1], false),
            _ => (token, false),
        }
    } else if upper.ends_with('D') {
        (&token[..token.len() - 1], true)
    } else if upper.ends_with('F') && !upper.ends_with("INF") {
        (&token[..token.len() - 1], false)
    } else {
        (token, false)
    };

    let suffixed = body.len() < token.len();
    let value = if is_hex { parse_hex_float(body)? } else { parse_dec_float(body, suffixed)? };
    Some(Datum::new(if double {
        value.to_le_bytes().to_vec()
    } else {
        (value as f32).to_le_bytes().to_vec()
    }))
}

fn parse_dec_float(s: &str, suffixed: bool) -> Option<f64> {
    let t = s.trim_start_matches(['+', '-']).to_ascii_lowercase();
    let looks_float = suffixed || t.contains('.') || t.contains('e') || t == "inf" || t == "nan";
    if !looks_float || !t.starts_with(|c: char| c.is_ascii_digit() || c == '.' || c == 'i' || c == 'n') {
        return None;
    }
    s.parse().ok()
}

fn parse_hex_float(s: &str) -> Option<f64> {
    let (neg, t) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let t = t.get(2..)?;
    let lower = t.to_ascii_lowercase();
    let (mantissa, exp) = match lower.split_once('p') {
        Some((m, e)) => (m, e.parse::<i32>().ok()?),
        None => (lower.as_str(), 0),
    };
    if !mantissa.contains('.') && !lower.contains('p') {
        return None;
    }
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    let mut v = 0f64;
    for c in int.chars() {
        v = v * 16.0 + f64::from(c.to_digit(16)?);
    }
    let mut scale = 1.0 / 16.0;
    for c in frac.chars() {
        v += f64::from(c.to_digit(16)?) * scale;
        scale /= 16.0;
    }
    let v = v * 2f64.powi(exp);
    Some(if neg { -v } else { v })
}

/// Undo C escapes inside a quoted string or character
fn unescape(s: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let e = chars
            .next()
            .ok_or_else(|| TermError::InvalidArgument(format!("dangling backslash in {}", s)))?;
        let b = match e {
            'n' => b'\n',
            't' => b'\t',
            'r' => b'\r',
            'a' => 0x07,
            'b' => 0x08,
            'f' => 0x0C,
            'v' => 0x0B,
            'e' => 0x1B,
            'x' => {
                let mut v = 0u32;
                let mut n = 0;
                while let Some(d) = chars.peek().and_then(|c| c.to_digit(16)) {
                    if n == 2 {
                        break;
                    }
                    v = v * 16 + d;
                    n += 1;
                    chars.next();
                }
                if n == 0 {
                    return Err(TermError::InvalidArgument(format!("\\x without digits in {}", s)));
                }
                v as u8
            }
            '0'..='7' => {
                let mut v = e.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            v = v * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                v as u8
            }
            other => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                continue;
            }
        };
        out.push(b);
    }
    Ok(out)
}

/// Parse one `write` data item
///
/// Returns `Ok(None)` if the token is not data, in which case the caller
/// may treat it as a file name.
pub fn parse_datum(token: &str) -> Result<Option<Datum>> {
    if let Some(inner) = token.strip_prefix('"') {
        let inner = inner
            .strip_suffix('"')
            .ok_or_else(|| TermError::InvalidArgument(format!("unterminated string {}", token)))?;
        let mut bytes = unescape(inner)?;
        bytes.push(0);
        return Ok(Some(Datum::new(bytes)));
    }
    if let Some(inner) = token.strip_prefix('\'') {
        let inner = inner
            .strip_suffix('\'')
            .ok_or_else(|| TermError::InvalidArgument(format!("unterminated character {}", token)))?;
        let bytes = unescape(inner)?;
        if bytes.len() != 1 {
            return Err(TermError::InvalidArgument(format!("{} is not a single character", token)));
        }
        return Ok(Some(Datum::new(bytes)));
    }
    if let Some(path) = token.strip_prefix('@') {
        let bytes = std::fs::read(path)?;
        return Ok(Some(Datum::new(bytes)));
    }
    if let Some(d) = parse_integer(token) {
        return Ok(Some(d));
    }
    Ok(parse_float(token))
}

fn is_exponent(t: &str, i: usize) -> bool {
    let before = t[..i].chars().last().is_some_and(|p| p.is_ascii_digit());
    let after = t[i + 1..].starts_with(|n: char| n.is_ascii_digit() || n == '-' || n == '+');
    before && after
}

// Split "3.6864 MHz" into the number and its lower-case unit
fn split_unit(s: &str) -> (f64, String) {
    let t = s.trim();
    let end = t
        .char_indices()
        .find(|&(i, c)| c.is_ascii_alphabetic() && !(matches!(c, 'e' | 'E') && is_exponent(t, i)))
        .map_or(t.len(), |(i, _)| i);
    let v = t[..end].trim().parse().unwrap_or(f64::NAN);
    (v, t[end..].trim().to_ascii_lowercase())
}

/// Parse a frequency such as `8M`, `16000k`, `1e6` or `3.6864MHz`, in Hz
pub fn parse_frequency(s: &str) -> Result<f64> {
    let (v, unit) = split_unit(s);
    let scale = match unit.as_str() {
        "" | "hz" => 1.0,
        "k" | "khz" => 1e3,
        "m" | "mhz" => 1e6,
        _ => return Err(TermError::InvalidArgument(format!("invalid frequency {}", s))),
    };
    if !v.is_finite() || v < 0.0 {
        return Err(TermError::InvalidArgument(format!("invalid frequency {}", s)));
    }
    Ok(v * scale)
}

/// Parse an SCK setting, in seconds
///
/// A bare number is a period in microseconds; `Hz`, `kHz` and `MHz`
/// give a frequency instead.
pub fn parse_sck_period(s: &str) -> Result<f64> {
    let (v, unit) = split_unit(s);
    if !v.is_finite() || v <= 0.0 {
        return Err(TermError::InvalidArgument(format!("invalid SCK setting {}", s)));
    }
    match unit.as_str() {
        "" | "us" => Ok(v * 1e-6),
        "hz" => Ok(1.0 / v),
        "khz" => Ok(1.0 / (v * 1e3)),
        "mhz" => Ok(1.0 / (v * 1e6)),
        _ => Err(TermError::InvalidArgument(format!("invalid SCK unit in {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(token: &str) -> Vec<u8> {
        parse_datum(token).unwrap().unwrap().bytes
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("0x1f").unwrap(), 31);
        assert_eq!(parse_int("-16").unwrap(), -16);
        assert_eq!(parse_int("010").unwrap(), 8);
        assert_eq!(parse_int("0b101").unwrap(), 5);
        assert_eq!(parse_int("0").unwrap(), 0);
        assert!(parse_int("ten").is_err());
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(bytes("255"), [0xFF]);
        assert_eq!(bytes("256"), [0x00, 0x01]);
        assert_eq!(bytes("-1"), [0xFF]);
        assert_eq!(bytes("-129"), [0x7F, 0xFF]);
        assert_eq!(bytes("0x0001"), [0x01, 0x00]);
        assert_eq!(bytes("0x12345"), [0x45, 0x23, 0x01, 0x00]);
        assert_eq!(bytes("1L"), [1, 0, 0, 0]);
        assert_eq!(bytes("1hh"), [1]);
        assert_eq!(bytes("0x1234S"), [0x34, 0x12]);
        assert_eq!(bytes("-1U"), [0xFF; 8]);
        assert_eq!(bytes("7ULL"), [7, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_truncation_warns() {
        let d = parse_datum("300HH").unwrap().unwrap();
        assert_eq!(d.bytes, [0x2C]);
        assert!(d.warning.is_some());
        assert!(parse_datum("200HH").unwrap().unwrap().warning.is_none());
    }

    #[test]
    fn test_floats() {
        assert_eq!(bytes("1.5"), 1.5f32.to_le_bytes());
        assert_eq!(bytes("1.5F"), 1.5f32.to_le_bytes());
        assert_eq!(bytes("-2.25D"), (-2.25f64).to_le_bytes());
        assert_eq!(bytes("1e3"), 1000f32.to_le_bytes());
        assert_eq!(bytes("15D"), 15f64.to_le_bytes());
        assert_eq!(bytes("0x1.8p1"), 3f32.to_le_bytes());
        assert_eq!(bytes("0x1.8p0D"), 1.5f64.to_le_bytes());
    }

    #[test]
    fn test_strings_and_chars() {
        assert_eq!(bytes("\"hi\\n\""), [b'h', b'i', b'\n', 0]);
        assert_eq!(bytes("'A'"), [b'A']);
        assert_eq!(bytes("'\\x41'"), [0x41]);
        assert!(parse_datum("'AB'").is_err());
    }

    #[test]
    fn test_not_data() {
        assert_eq!(parse_datum("blink.hex").unwrap(), None);
        assert_eq!(parse_datum("...").unwrap(), None);
    }

    #[test]
    fn test_frequency_and_sck() {
        assert_eq!(parse_frequency("8M").unwrap(), 8e6);
        assert_eq!(parse_frequency("16000k").unwrap(), 16e6);
        assert_eq!(parse_frequency("1e6").unwrap(), 1e6);
        assert_eq!(parse_frequency("3.6864 MHz").unwrap(), 3.6864e6);
        assert!(parse_frequency("fast").is_err());

        assert!((parse_sck_period("10").unwrap() - 10e-6).abs() < 1e-12);
        assert!((parse_sck_period("125kHz").unwrap() - 8e-6).abs() < 1e-12);
        assert!((parse_sck_period("1MHz").unwrap() - 1e-6).abs() < 1e-12);
        assert!(parse_sck_period("0").is_err());
        assert!(parse_sck_period("5 parsecs").is_err());
    }
}
