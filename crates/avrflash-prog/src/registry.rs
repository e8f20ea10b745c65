//! Programmer registration and dispatch
//!
//! This module provides a centralized registry for all programmers, with support
//! for feature-gated inclusion and dynamic help text generation.

use avrflash_core::error::{Error, ErrorKind, Result};
use avrflash_core::part::Part;
use avrflash_core::programmer::Programmer;

/// Information about a programmer
#[derive(Debug, Clone, Copy)]
pub struct ProgrammerInfo {
    /// Primary name (used for matching)
    pub name: &'static str,
    /// Alternative names/aliases
    pub aliases: &'static [&'static str],
    /// Driver behind this programmer, as listed by `-c ?type`
    pub driver: &'static str,
    /// Short description
    pub description: &'static str,
    /// Port used when `-P` is absent
    pub default_port: &'static str,
    /// `-P` names a serial line unless it starts with `usb`
    pub serial: bool,
}

impl ProgrammerInfo {
    /// True if `name` is this programmer's name or one of its aliases
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// Settings shared by every driver
#[derive(Debug, Clone, Default)]
pub struct ProgrammerOptions {
    /// `-P`; the programmer's default port when `None`
    pub port: Option<String>,
    /// `-b`
    pub baud: Option<u32>,
    /// `-B` as a period in seconds
    pub bitclock: Option<f64>,
    /// `-i` in microseconds
    pub isp_delay: Option<u32>,
    /// `-x`, in command-line order
    pub extparams: Vec<String>,
}

/// Get information about all available programmers (enabled at compile time)
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_programmers() -> Vec<ProgrammerInfo> {
    let mut programmers = Vec::new();

    #[cfg(feature = "dummy")]
    programmers.push(ProgrammerInfo {
        name: "dummy",
        aliases: &[],
        driver: "dummy",
        description: "Simulated target in host memory for testing",
        default_port: "",
        serial: false,
    });

    #[cfg(feature = "jtagmkii")]
    {
        programmers.push(ProgrammerInfo {
            name: "jtagmkii",
            aliases: &["jtag2", "jtag2slow"],
            driver: "jtagmkii",
            description: "Atmel JTAG ICE mkII in JTAG mode",
            default_port: "usb",
            serial: true,
        });
        programmers.push(ProgrammerInfo {
            name: "jtagmkii_dw",
            aliases: &["jtag2dw"],
            driver: "jtagmkii_dw",
            description: "Atmel JTAG ICE mkII in debugWIRE mode",
            default_port: "usb",
            serial: true,
        });
        programmers.push(ProgrammerInfo {
            name: "jtagmkii_pdi",
            aliases: &["jtag2pdi"],
            driver: "jtagmkii_pdi",
            description: "Atmel JTAG ICE mkII in PDI mode",
            default_port: "usb",
            serial: true,
        });
        programmers.push(ProgrammerInfo {
            name: "jtagmkii_isp",
            aliases: &["jtag2isp"],
            driver: "jtagmkii_isp",
            description: "Atmel JTAG ICE mkII in ISP mode",
            default_port: "usb",
            serial: true,
        });
        programmers.push(ProgrammerInfo {
            name: "dragon_jtag",
            aliases: &[],
            driver: "dragon_jtag",
            description: "Atmel AVR Dragon in JTAG mode",
            default_port: "usb",
            serial: false,
        });
        programmers.push(ProgrammerInfo {
            name: "dragon_dw",
            aliases: &[],
            driver: "dragon_dw",
            description: "Atmel AVR Dragon in debugWIRE mode",
            default_port: "usb",
            serial: false,
        });
        programmers.push(ProgrammerInfo {
            name: "dragon_pdi",
            aliases: &[],
            driver: "dragon_pdi",
            description: "Atmel AVR Dragon in PDI mode",
            default_port: "usb",
            serial: false,
        });
        programmers.push(ProgrammerInfo {
            name: "dragon_isp",
            aliases: &[],
            driver: "dragon_isp",
            description: "Atmel AVR Dragon in ISP mode",
            default_port: "usb",
            serial: false,
        });
    }

    #[cfg(feature = "ft245r")]
    programmers.push(ProgrammerInfo {
        name: "ft245r",
        aliases: &["ft232r"],
        driver: "ftdi_syncbb",
        description: "FT245R/FT232R synchronous bit-bang (ISP and TPI) (sck=,sdo=,sdi=,reset=)",
        default_port: "usb",
        serial: false,
    });

    programmers
}

/// Generate help text listing all available programmers
pub fn programmer_help() -> String {
    let programmers = available_programmers();

    if programmers.is_empty() {
        return "No programmers available (recompile with programmer features enabled)".to_string();
    }

    let mut help = String::from("Valid programmers are:\n");
    for p in &programmers {
        let aliases = if p.aliases.is_empty() {
            String::new()
        } else {
            format!("/{}", p.aliases.join("/"))
        };
        help.push_str(&format!("  {:20} = {}\n", format!("{}{}", p.name, aliases), p.description));
    }
    help
}

/// Help text for `-c ?type`: the distinct drivers
pub fn driver_help() -> String {
    let mut help = String::from("Valid programmer types are:\n");
    let mut seen: Vec<&str> = Vec::new();
    for p in available_programmers() {
        if seen.contains(&p.driver) {
            continue;
        }
        seen.push(p.driver);
        help.push_str(&format!("  {:14} = {}\n", p.driver, p.description));
    }
    help
}

/// Generate a short list of programmer names for CLI help
pub fn programmer_names_short() -> String {
    let names: Vec<&str> = available_programmers().iter().map(|p| p.name).collect();
    names.join(", ")
}

/// Look up a programmer by name or alias
pub fn find_programmer(name: &str) -> Option<ProgrammerInfo> {
    available_programmers().into_iter().find(|p| p.matches(name))
}

/// True if `-x help` is among the extended parameters
pub fn wants_help(extparams: &[String]) -> bool {
    extparams.iter().any(|p| p == "help")
}

/// The `-x help` text of a programmer
#[allow(unused_variables)]
pub fn extparam_help(name: &str) -> Option<&'static str> {
    let info = find_programmer(name)?;
    match info.driver {
        #[cfg(feature = "dummy")]
        "dummy" => Some(avrflash_dummy::EXTPARAM_HELP),
        #[cfg(feature = "ft245r")]
        "ftdi_syncbb" => Some(avrflash_ft245r::EXTPARAM_HELP),
        #[cfg(feature = "jtagmkii")]
        _ if info.name.starts_with("jtagmkii") || info.name.starts_with("dragon") => {
            Some(avrflash_jtagmkii::EXTPARAM_HELP)
        }
        _ => None,
    }
}

/// Open a programmer by name
///
/// The port, rates and `-x` parameters are handed to the driver. The part
/// is only used by drivers that simulate a target.
#[allow(unused_variables)]
pub fn open(name: &str, opts: &ProgrammerOptions, part: &Part) -> Result<Box<dyn Programmer>> {
    let info = find_programmer(name).ok_or_else(|| unknown_programmer_error(name))?;
    let port = opts.port.as_deref().unwrap_or(info.default_port);

    if opts.isp_delay.is_some_and(|d| d > 0) {
        log::warn!("-i is not used by the {} programmer", info.name);
    }

    match info.driver {
        #[cfg(feature = "dummy")]
        "dummy" => {
            let config = avrflash_dummy::DummyConfig::from_params(&opts.extparams)?;
            log::debug!("Opening dummy programmer for {}", part.desc);
            Ok(Box::new(avrflash_dummy::DummyProgrammer::new(part, config)))
        }

        #[cfg(feature = "ft245r")]
        "ftdi_syncbb" => {
            use avrflash_ft245r::{DeviceSelection, Ft245r, Ft245rConfig};

            let mut config = Ft245rConfig {
                bitclock: opts.bitclock,
                selection: DeviceSelection::parse(port),
                ..Default::default()
            };
            config.apply_extparams(&opts.extparams)?;
            log::info!("Opening FT245R programmer...");
            let pgm = Ft245r::open(&config).map_err(|e| {
                e.with_context("cannot open FT245R (check permissions and unbind ftdi_sio)")
            })?;
            Ok(Box::new(pgm))
        }

        #[cfg(feature = "jtagmkii")]
        _ if info.name.starts_with("jtagmkii") || info.name.starts_with("dragon") => {
            use avrflash_jtagmkii::{open_port, Interface, JtagMkIIConfig};

            let interface = match info.name.rsplit('_').next() {
                Some("dw") => Interface::DebugWire,
                Some("pdi") => Interface::Pdi,
                Some("isp") => Interface::Isp,
                _ => Interface::Jtag,
            };
            let mut config = JtagMkIIConfig {
                interface,
                dragon: info.name.starts_with("dragon"),
                baud: opts.baud,
                bitclock: opts.bitclock,
                ..Default::default()
            };
            config.apply_extparams(&opts.extparams)?;
            log::info!("Opening {} on {}...", info.name, port);
            Ok(Box::new(open_port(port, config)?))
        }

        _ => Err(unknown_programmer_error(name)),
    }
}

fn unknown_programmer_error(name: &str) -> Error {
    let mut msg = format!("unknown programmer {}\n\n", name);
    msg.push_str(&programmer_help());
    msg.push_str("\nUse '-c ?' to list programmers");
    Error::new(ErrorKind::IllegalParam, msg)
}
