//! USB-to-serial adapter discovery
//!
//! Serial programmers are usually reached through a cheap USB bridge whose
//! port name changes from one plug-in to the next. The catalogue knows the
//! bridges by VID/PID, so `-P ch340` or `-P ft232r:A9048BQ1` pick the port
//! without knowing its name.

use std::cmp::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use avrflash_core::error::{Error, ErrorKind};
use avrflash_core::part::SerialAdapter;
use serialport::{SerialPortType, UsbPortInfo};
use thiserror::Error;

/// How long `touch` waits for a bootloader to re-enumerate
const TOUCH_WAIT: Duration = Duration::from_millis(1600);
const TOUCH_POLL: Duration = Duration::from_millis(100);

/// Errors from adapter lookup
#[derive(Debug, Error)]
pub enum SerialAdapterError {
    /// More than one adapter matches
    #[error("{spec} matches {} serial adapters; use one of\n{}", .candidates.len(), .candidates.join("\n"))]
    Ambiguous {
        /// The `-P` argument
        spec: String,
        /// `-P` alternatives, one per matching port
        candidates: Vec<String>,
    },

    /// No adapter matches
    #[error("no serial adapter matches {spec}{}", suggest(.present))]
    NotFound {
        /// The `-P` argument
        spec: String,
        /// USB serial ports that are present
        present: Vec<String>,
    },

    /// Bad `usb:vid:pid` number
    #[error("invalid USB id in {0}")]
    BadId(String),

    /// Port enumeration or open failed
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

fn suggest(present: &[String]) -> String {
    if present.is_empty() {
        String::new()
    } else {
        format!("; USB serial ports present:\n{}", present.join("\n"))
    }
}

impl From<SerialAdapterError> for Error {
    #[track_caller]
    fn from(e: SerialAdapterError) -> Self {
        let kind = match e {
            SerialAdapterError::Serial(_) => ErrorKind::Io,
            _ => ErrorKind::IllegalParam,
        };
        Error::new(kind, e.to_string())
    }
}

/// Result type for adapter lookup
pub type Result<T> = std::result::Result<T, SerialAdapterError>;

/// A USB serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbSerialPort {
    /// Port name, such as `/dev/ttyUSB0` or `COM3`
    pub port: String,
    /// USB vendor id
    pub vid: u16,
    /// USB product id
    pub pid: u16,
    /// USB serial number, if the bridge has one
    pub sn: Option<String>,
}

impl UsbSerialPort {
    fn from_info(port: String, info: &UsbPortInfo) -> Self {
        Self {
            port,
            vid: info.vid,
            pid: info.pid,
            sn: info.serial_number.clone().filter(|s| !s.is_empty()),
        }
    }
}

/// Compare port names, treating digit runs as numbers
///
/// `/dev/ttyUSB2` sorts before `/dev/ttyUSB10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let na = a.iter().take_while(|c| c.is_ascii_digit()).count();
                let nb = b.iter().take_while(|c| c.is_ascii_digit()).count();
                let da = trim_zeros(&a[..na]);
                let db = trim_zeros(&b[..nb]);
                let ord = da.len().cmp(&db.len()).then_with(|| da.cmp(db));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[na..];
                b = &b[nb..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let zeros = digits.iter().take_while(|&&c| c == b'0').count();
    &digits[zeros.min(digits.len().saturating_sub(1))..]
}

/// List USB serial ports in natural order
pub fn enumerate() -> Result<Vec<UsbSerialPort>> {
    let mut ports: Vec<UsbSerialPort> = serialport::available_ports()?
        .into_iter()
        .filter_map(|p| match &p.port_type {
            SerialPortType::UsbPort(info) => Some(UsbSerialPort::from_info(p.port_name.clone(), info)),
            _ => None,
        })
        .collect();
    ports.sort_by(|a, b| natural_cmp(&a.port, &b.port));
    Ok(ports)
}

fn all_port_names() -> Result<Vec<String>> {
    let mut names: Vec<String> = serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect();
    names.sort_by(|a, b| natural_cmp(a, b));
    Ok(names)
}

/// A parsed adapter `-P` argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterSpec {
    /// A catalogue adapter id, optionally with a serial number
    Id {
        /// Adapter id
        id: String,
        /// Serial number; a leading `...` matches a tail
        sn: Option<String>,
    },
    /// Explicit `usb:vid:pid[:sn]`
    Usb {
        /// Vendor id
        vid: u16,
        /// Product id
        pid: u16,
        /// Serial number; a leading `...` matches a tail
        sn: Option<String>,
    },
}

impl AdapterSpec {
    /// Parse `spec` if it names a serial adapter
    ///
    /// Returns `Ok(None)` for anything else, such as a device path or a
    /// plain `usb`/`usb:SN` port of a USB programmer.
    pub fn parse(spec: &str, adapters: &[SerialAdapter]) -> Result<Option<Self>> {
        let mut fields = spec.split(':');
        let head = fields.next().unwrap_or_default();
        let rest: Vec<&str> = fields.collect();
        let sn = |s: Option<&&str>| s.filter(|s| !s.is_empty()).map(|s| s.to_string());

        if head.eq_ignore_ascii_case("usb") {
            if rest.len() < 2 || !rest[..2].iter().all(|f| is_hex_id(f)) {
                return Ok(None);
            }
            let id = |s: &str| u16::from_str_radix(s, 16).map_err(|_| SerialAdapterError::BadId(spec.into()));
            return Ok(Some(AdapterSpec::Usb {
                vid: id(rest[0])?,
                pid: id(rest[1])?,
                sn: sn(rest.get(2)),
            }));
        }
        if rest.len() > 1 || !adapters.iter().any(|a| a.id.eq_ignore_ascii_case(head)) {
            return Ok(None);
        }
        Ok(Some(AdapterSpec::Id {
            id: head.to_string(),
            sn: sn(rest.first()),
        }))
    }
}

fn is_hex_id(s: &str) -> bool {
    !s.is_empty() && s.len() <= 4 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn sn_matches(wanted: &str, actual: Option<&str>) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    match wanted.strip_prefix("...") {
        Some(tail) => actual.ends_with(tail),
        None => actual == wanted,
    }
}

/// Pick the port named by `spec` among `ports`
///
/// Exactly one match is required.
pub fn select(spec: &str, parsed: &AdapterSpec, adapters: &[SerialAdapter], ports: &[UsbSerialPort]) -> Result<String> {
    let matching: Vec<&UsbSerialPort> = ports
        .iter()
        .filter(|p| match parsed {
            AdapterSpec::Usb { vid, pid, sn } => {
                p.vid == *vid && p.pid == *pid && sn.as_deref().is_none_or(|s| sn_matches(s, p.sn.as_deref()))
            }
            AdapterSpec::Id { id, sn } => adapters.iter().filter(|a| a.id.eq_ignore_ascii_case(id)).any(|a| {
                a.vid == p.vid
                    && a.pids.contains(&p.pid)
                    && a.sn.as_deref().is_none_or(|s| sn_matches(s, p.sn.as_deref()))
                    && sn.as_deref().is_none_or(|s| sn_matches(s, p.sn.as_deref()))
            }),
        })
        .collect();

    match matching.as_slice() {
        [one] => {
            log::info!("{} is {}", spec, one.port);
            Ok(one.port.clone())
        }
        [] => Err(SerialAdapterError::NotFound {
            spec: spec.to_string(),
            present: ports.iter().map(|p| describe(p, None)).collect(),
        }),
        many => {
            let id = match parsed {
                AdapterSpec::Id { id, .. } => Some(id.as_str()),
                AdapterSpec::Usb { .. } => None,
            };
            Err(SerialAdapterError::Ambiguous {
                spec: spec.to_string(),
                candidates: many.iter().map(|p| describe(p, id)).collect(),
            })
        }
    }
}

/// The `-P` forms that select exactly this port
fn describe(p: &UsbSerialPort, id: Option<&str>) -> String {
    let mut out = format!("  -P {}", p.port);
    if let Some(sn) = &p.sn {
        if let Some(id) = id {
            out.push_str(&format!(", -P {}:{}", id, sn));
        }
        out.push_str(&format!(", -P usb:{:04x}:{:04x}:{}", p.vid, p.pid, sn));
    } else {
        out.push_str(&format!(" (usb:{:04x}:{:04x}, no serial number)", p.vid, p.pid));
    }
    out
}

/// Resolve an adapter `-P` argument to a port name
///
/// Arguments that do not name an adapter are returned unchanged.
pub fn setport(spec: &str, adapters: &[SerialAdapter]) -> Result<String> {
    match AdapterSpec::parse(spec, adapters)? {
        Some(parsed) => select(spec, &parsed, adapters, &enumerate()?),
        None => Ok(spec.to_string()),
    }
}

/// Toggle DTR/RTS on `port` at `baud` and follow a re-enumerating bootloader
///
/// Returns the port to use afterwards: the single port that appeared while
/// waiting, or `port` itself.
pub fn touch(port: &str, baud: u32) -> Result<String> {
    let before = all_port_names()?;
    {
        let mut sp = serialport::new(port, baud).timeout(Duration::from_millis(100)).open()?;
        sp.write_data_terminal_ready(true)?;
        sp.write_request_to_send(true)?;
        thread::sleep(Duration::from_millis(10));
        sp.write_data_terminal_ready(false)?;
        sp.write_request_to_send(false)?;
    }
    log::debug!("touched {} at {} baud", port, baud);

    let deadline = Instant::now() + TOUCH_WAIT;
    while Instant::now() < deadline {
        thread::sleep(TOUCH_POLL);
        let now = all_port_names()?;
        let new = new_ports(&before, &now);
        match new.as_slice() {
            [] => continue,
            [one] => {
                log::info!("{} re-enumerated as {}", port, one);
                return Ok(one.clone());
            }
            _ => {
                log::warn!("several new ports appeared after touching {}: {}", port, new.join(", "));
                break;
            }
        }
    }
    Ok(port.to_string())
}

fn new_ports(before: &[String], now: &[String]) -> Vec<String> {
    now.iter().filter(|p| !before.contains(p)).cloned().collect()
}
