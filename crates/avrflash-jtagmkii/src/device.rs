//! JTAG ICE mkII / AVR Dragon driver
//!
//! One driver serves all four target interfaces of the ICE. JTAG, debugWIRE
//! and PDI use the ICE's own memory commands; ISP wraps STK500v2 commands
//! in `CMND_ISP_PACKET` and reuses the generic ISP byte routines.

use std::time::Duration;

use avrflash_core::avr;
use avrflash_core::opcode::OpKind;
use avrflash_core::part::{MemKind, Memory, Part, ProgModes};
use avrflash_core::programmer::Programmer;
use avrflash_core::{Error as CoreError, ErrorKind, Result as CoreResult};

use crate::descriptor::{descriptor_len, DeviceDescriptor, XmegaParams, MAX_PAGE};
use crate::error::{JtagError, Result};
use crate::framer::{Framer, DEFAULT_TIMEOUT};
use crate::mapper::{MemoryMapper, FW_SECTION_RELATIVE};
use crate::protocol::*;
use crate::transport::Transport;

const SIGN_ON_TRIES: usize = 10;
const SIGN_ON_TIMEOUT: Duration = Duration::from_secs(5);
const PAGED_WRITE_TIMEOUT: Duration = Duration::from_millis(200);
const PAGED_LOAD_TIMEOUT: Duration = Duration::from_millis(100);
const PAGE_ERASE_TIMEOUT: Duration = Duration::from_millis(100);
const PAGED_RETRIES: usize = 4;
const BYTE_RETRIES: usize = 3;

/// Help text for `-x help`
pub const EXTPARAM_HELP: &str = "\
  -x jtagchain=UB,UA,BB,BA  Setup the JTAG scan chain order (JTAG only)
  -x rtsdtr=low|high        Force RTS/DTR lines low or high during programming (PDI only)
  -x help                   Show this help menu and exit";

/// Target interface the ICE drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interface {
    /// IEEE 1149.1 JTAG
    #[default]
    Jtag,
    /// debugWIRE over the reset line
    DebugWire,
    /// XMEGA PDI
    Pdi,
    /// Classic ISP through the SPI pins
    Isp,
}

impl Interface {
    /// Human readable name
    pub fn name(self) -> &'static str {
        match self {
            Interface::Jtag => "JTAG",
            Interface::DebugWire => "debugWIRE",
            Interface::Pdi => "PDI",
            Interface::Isp => "ISP",
        }
    }

    /// Programming modes a part must offer for this interface
    pub fn prog_modes(self) -> ProgModes {
        match self {
            Interface::Jtag => {
                ProgModes::JTAG | ProgModes::JTAGMKI | ProgModes::XMEGAJTAG | ProgModes::AVR32JTAG
            }
            Interface::DebugWire => ProgModes::DEBUGWIRE,
            Interface::Pdi => ProgModes::PDI | ProgModes::UPDI,
            Interface::Isp => ProgModes::ISP,
        }
    }

    fn emulator_mode(self) -> u8 {
        match self {
            Interface::Jtag => EMULATOR_MODE_JTAG,
            Interface::DebugWire => EMULATOR_MODE_DEBUGWIRE,
            Interface::Pdi => EMULATOR_MODE_PDI,
            Interface::Isp => EMULATOR_MODE_SPI,
        }
    }
}

/// Connection options
#[derive(Debug, Clone, Default)]
pub struct JtagMkIIConfig {
    /// Target interface
    pub interface: Interface,
    /// Programmer is an AVR Dragon
    pub dragon: bool,
    /// Serial baud rate to switch to after sign-on
    pub baud: Option<u32>,
    /// JTAG bit clock period in seconds
    pub bitclock: Option<f64>,
    /// Units before, units after, bits before, bits after
    pub jtagchain: [u8; 4],
    /// Force DTR/RTS high (`true`) or low during programming
    pub rtsdtr: Option<bool>,
    /// `-P` selected a USB serial number
    pub usb_serial: bool,
}

impl JtagMkIIConfig {
    /// Apply `-x` parameters; returns `true` if help was requested
    pub fn apply_extparams(&mut self, params: &[String]) -> Result<bool> {
        for param in params {
            if let Some(chain) = param.strip_prefix("jtagchain=") {
                if self.interface != Interface::Jtag {
                    return Err(JtagError::InvalidParameter(format!(
                        "{} is only valid in JTAG mode",
                        param
                    )));
                }
                let values: Vec<u8> = chain
                    .split(',')
                    .map(|v| v.trim().parse::<u8>())
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|_| JtagError::InvalidParameter(format!("invalid JTAG chain '{}'", param)))?;
                self.jtagchain = values
                    .try_into()
                    .map_err(|_| JtagError::InvalidParameter(format!("invalid JTAG chain '{}'", param)))?;
                log::debug!(
                    "jtagmkii: JTAG chain: {} units before, {} units after, {} bits before, {} bits after",
                    self.jtagchain[0],
                    self.jtagchain[1],
                    self.jtagchain[2],
                    self.jtagchain[3]
                );
            } else if let Some(mode) = param.strip_prefix("rtsdtr=") {
                if self.interface != Interface::Pdi {
                    return Err(JtagError::InvalidParameter(format!(
                        "{} is only valid in PDI mode",
                        param
                    )));
                }
                self.rtsdtr = match mode.to_ascii_lowercase().as_str() {
                    "low" => Some(false),
                    "high" => Some(true),
                    _ => {
                        return Err(JtagError::InvalidParameter(
                            "RTS/DTR mode must be LOW or HIGH".into(),
                        ))
                    }
                };
            } else if param == "help" {
                return Ok(true);
            } else {
                return Err(JtagError::InvalidParameter(format!(
                    "invalid extended parameter '{}'",
                    param
                )));
            }
        }
        Ok(false)
    }
}

/// Contents of the sign-on response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOn {
    /// Communications protocol version
    pub protocol: u8,
    /// Main MCU firmware version (major << 8 | minor)
    pub m_mcu_fw: u16,
    /// Main MCU hardware version
    pub m_mcu_hw: u8,
    /// Slave MCU firmware version (major << 8 | minor)
    pub fwver: u16,
    /// Slave MCU hardware version
    pub hwver: u8,
    /// Serial number
    pub serial: [u8; 6],
    /// Device id string
    pub device_id: String,
}

impl SignOn {
    /// Parse an RSP_SIGN_ON payload
    pub fn parse(resp: &[u8]) -> Result<Self> {
        if resp.len() < 16 {
            return Err(JtagError::ShortResponse {
                command: "sign-on",
                len: resp.len(),
            });
        }
        let id = &resp[16..];
        let id = &id[..id.iter().position(|&b| b == 0).unwrap_or(id.len())];
        let mut serial = [0u8; 6];
        serial.copy_from_slice(&resp[10..16]);
        Ok(SignOn {
            protocol: resp[1],
            m_mcu_fw: u16::from(resp[4]) << 8 | u16::from(resp[3]),
            m_mcu_hw: resp[5],
            fwver: u16::from(resp[8]) << 8 | u16::from(resp[7]),
            hwver: resp[9],
            serial,
            device_id: String::from_utf8_lossy(id).into_owned(),
        })
    }

    /// Serial number as colon separated hex
    pub fn serial_string(&self) -> String {
        self.serial
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

fn fw_string(v: u16) -> String {
    format!("{}.{:02}", v >> 8, v & 0xFF)
}

/// One cached page of flash or EEPROM
#[derive(Debug, Default)]
struct CacheLine {
    base: Option<u32>,
    data: Vec<u8>,
}

impl CacheLine {
    fn invalidate(&mut self) {
        self.base = None;
    }

    fn get(&self, base: u32, offset: usize) -> Option<u8> {
        match self.base {
            Some(b) if b == base => self.data.get(offset).copied(),
            _ => None,
        }
    }
}

/// Index of a classic fuse byte as the ICE numbers them
fn fuse_index(mem: &Memory) -> u32 {
    match mem.name.as_str() {
        "lfuse" | "fuse" => 0,
        "hfuse" => 1,
        "efuse" => 2,
        n => n.strip_prefix("fuse").and_then(|d| d.parse().ok()).unwrap_or(0),
    }
}

/// JTAG ICE mkII programmer
pub struct JtagMkII<T: Transport> {
    framer: Framer<T>,
    config: JtagMkIIConfig,
    sign_on: SignOn,
    is_dragon: bool,
    descriptor_len: Option<usize>,
    mapper: Option<MemoryMapper>,
    prog_enabled: bool,
    recently_written: bool,
    page_erase_ok: bool,
    flash_cache: CacheLine,
    eeprom_cache: CacheLine,
    flash_pagesize: usize,
    eeprom_pagesize: usize,
    name: String,
}

impl<T: Transport> JtagMkII<T> {
    /// Sign on to the ICE and switch it to the configured interface
    pub fn open(transport: T, config: JtagMkIIConfig) -> Result<Self> {
        let name = format!(
            "{}{}",
            if config.dragon { "dragon" } else { "jtagmkii" },
            match (config.dragon, config.interface) {
                (false, Interface::Jtag) => "",
                (true, Interface::Jtag) => "_jtag",
                (_, Interface::DebugWire) => "_dw",
                (_, Interface::Pdi) => "_pdi",
                (_, Interface::Isp) => "_isp",
            }
        );
        let mut pgm = Self {
            framer: Framer::new(transport),
            is_dragon: config.dragon,
            config,
            sign_on: SignOn {
                protocol: 0,
                m_mcu_fw: 0,
                m_mcu_hw: 0,
                fwver: 0,
                hwver: 0,
                serial: [0; 6],
                device_id: String::new(),
            },
            descriptor_len: None,
            mapper: None,
            prog_enabled: false,
            recently_written: false,
            page_erase_ok: false,
            flash_cache: CacheLine::default(),
            eeprom_cache: CacheLine::default(),
            flash_pagesize: MAX_PAGE,
            eeprom_pagesize: 0,
            name,
        };
        pgm.framer.drain()?;
        let mode = pgm.config.interface.emulator_mode();
        pgm.getsync(mode)?;
        Ok(pgm)
    }

    /// Sign-on data of the connected ICE
    pub fn sign_on(&self) -> &SignOn {
        &self.sign_on
    }

    /// True if the ICE identified itself as an AVR Dragon
    pub fn is_dragon(&self) -> bool {
        self.is_dragon
    }

    /// True right after a write, until the next read
    pub fn recently_written(&self) -> bool {
        self.recently_written
    }

    fn is_dw(&self) -> bool {
        self.config.interface == Interface::DebugWire
    }

    fn exchange(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let resp = self.framer.round_trip(payload, timeout)?;
        if resp.is_empty() {
            return Err(JtagError::ShortResponse {
                command: "command",
                len: 0,
            });
        }
        Ok(resp)
    }

    fn expect(
        &mut self,
        command: &'static str,
        payload: &[u8],
        expected: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let resp = self.exchange(payload, timeout)?;
        if resp[0] != expected {
            return Err(JtagError::Refused {
                command,
                code: resp[0],
            });
        }
        Ok(resp)
    }

    /// Retry on timeout, optionally doubling the time budget each time
    fn expect_retry(
        &mut self,
        command: &'static str,
        payload: &[u8],
        expected: u8,
        mut timeout: Duration,
        retries: usize,
        doubling: bool,
    ) -> Result<Vec<u8>> {
        let mut tries = 0;
        loop {
            match self.expect(command, payload, expected, timeout) {
                Err(JtagError::Timeout) if tries < retries => {
                    tries += 1;
                    log::warn!("jtagmkii: {} timed out, retry {} of {}", command, tries, retries);
                    if doubling {
                        timeout *= 2;
                    }
                }
                other => return other,
            }
        }
    }

    /// Read a 4-byte emulator parameter
    pub fn get_parm(&mut self, parm: u8) -> Result<[u8; 4]> {
        let resp = self.expect("get parameter", &[CMND_GET_PARAMETER, parm], RSP_PARAMETER, DEFAULT_TIMEOUT)?;
        let mut value = [0u8; 4];
        let n = (resp.len() - 1).min(4);
        value[..n].copy_from_slice(&resp[1..1 + n]);
        Ok(value)
    }

    /// Write an emulator parameter
    pub fn set_parm(&mut self, parm: u8, value: &[u8]) -> Result<()> {
        let size = parm_size(parm)
            .ok_or_else(|| JtagError::InvalidParameter(format!("unknown parameter 0x{:02x}", parm)))?;
        let mut buf = vec![CMND_SET_PARAMETER, parm];
        buf.extend((0..size).map(|i| value.get(i).copied().unwrap_or(0)));
        self.expect("set parameter", &buf, RSP_OK, DEFAULT_TIMEOUT)?;
        Ok(())
    }

    fn read_sign_on(&mut self) -> Result<()> {
        let mut last = JtagError::Timeout;
        for attempt in 1..=SIGN_ON_TRIES {
            log::debug!("jtagmkii: sign-on attempt {} of {}", attempt, SIGN_ON_TRIES);
            match self.expect("sign-on", &[CMND_GET_SIGN_ON], RSP_SIGN_ON, SIGN_ON_TIMEOUT) {
                Ok(resp) => {
                    self.sign_on = SignOn::parse(&resp)?;
                    let s = &self.sign_on;
                    log::debug!("jtagmkii: communications protocol version {}", s.protocol);
                    log::debug!(
                        "jtagmkii: M_MCU firmware {} hardware {}",
                        fw_string(s.m_mcu_fw),
                        s.m_mcu_hw
                    );
                    log::debug!("jtagmkii: S_MCU firmware {} hardware {}", fw_string(s.fwver), s.hwver);
                    log::debug!("jtagmkii: serial number {}", s.serial_string());
                    log::debug!("jtagmkii: device id {}", s.device_id);
                    if s.hwver == HW_VERSION_DRAGON {
                        self.is_dragon = true;
                    }
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("jtagmkii: attempt {} of {}: sign-on command: {}", attempt, SIGN_ON_TRIES, e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn check_firmware(&mut self, mode: u8) -> Result<()> {
        let fw = self.sign_on.fwver;
        let (len, old) = descriptor_len(fw, self.is_dragon, mode == EMULATOR_MODE_SPI);
        if old {
            log::warn!("jtagmkii: S_MCU firmware version might be too old to work correctly");
        }
        self.descriptor_len = len;
        if let Some(len) = len {
            log::debug!("jtagmkii: using a {}-byte device descriptor", len);
        }
        if mode == EMULATOR_MODE_SPI && !self.is_dragon && fw < 0x040E {
            return Err(JtagError::Firmware(
                "ISP functionality requires firmware version >= 4.14".into(),
            ));
        }
        if mode == EMULATOR_MODE_PDI || mode == EMULATOR_MODE_JTAG_XMEGA {
            if !self.is_dragon && mode == EMULATOR_MODE_PDI && self.sign_on.hwver < 1 {
                return Err(JtagError::Firmware(
                    "Xmega PDI support requires hardware revision >= 1".into(),
                ));
            }
            if !self.is_dragon && fw < 0x0525 {
                return Err(JtagError::Firmware(
                    "Xmega support requires firmware version >= 5.37".into(),
                ));
            }
            if self.is_dragon && fw < 0x060B {
                return Err(JtagError::Firmware(
                    "Xmega support requires firmware version >= 6.11".into(),
                ));
            }
        }
        Ok(())
    }

    fn set_emulator_mode(&mut self, mode: u8) -> Result<()> {
        let mut tries = 0;
        loop {
            match self.set_parm(PAR_EMULATOR_MODE, &[mode]) {
                Ok(()) => return Ok(()),
                Err(e) if mode == EMULATOR_MODE_SPI => {
                    log::warn!("jtagmkii: ISP activation failed ({}), trying debugWIRE", e);
                    self.set_parm(PAR_EMULATOR_MODE, &[EMULATOR_MODE_DEBUGWIRE])?;
                    // MONCOM_DISABLE drops the target out of debugWIRE
                    if let Err(e) = self.reset(0x04) {
                        log::debug!("jtagmkii: reset after debugWIRE: {}", e);
                    }
                    tries += 1;
                    if tries > 3 {
                        return Err(JtagError::OpenFailed(
                            "unable to return from debugWIRE to ISP".into(),
                        ));
                    }
                    log::warn!("jtagmkii: target prepared for ISP, signed off");
                    log::warn!("jtagmkii: now retrying without power-cycling the target");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sign on, check firmware, set the emulator mode and synchronise
    fn getsync(&mut self, mode: u8) -> Result<()> {
        self.read_sign_on()?;
        self.check_firmware(mode)?;
        self.set_emulator_mode(mode)?;
        self.expect("get sync", &[CMND_GET_SYNC], RSP_OK, DEFAULT_TIMEOUT)?;
        Ok(())
    }

    fn reset(&mut self, flags: u8) -> Result<()> {
        if self.is_dw() {
            if let Err(e) = self.set_parm(PAR_TIMERS_RUNNING, &[0]) {
                log::debug!("jtagmkii: stopping timers: {}", e);
            }
            self.expect("forced stop", &[CMND_FORCED_STOP, 1], RSP_OK, DEFAULT_TIMEOUT)?;
        } else {
            self.expect("reset", &[CMND_RESET, flags], RSP_OK, DEFAULT_TIMEOUT)?;
        }
        Ok(())
    }

    fn enter_progmode(&mut self) -> Result<()> {
        if self.prog_enabled {
            return Ok(());
        }
        let mut ext_reset = false;
        let mut last = JtagError::Timeout;
        for _ in 0..2 {
            match self.expect("enter progmode", &[CMND_ENTER_PROGMODE], RSP_OK, DEFAULT_TIMEOUT) {
                Ok(_) => {
                    self.prog_enabled = true;
                    return Ok(());
                }
                Err(JtagError::Refused { code, .. }) if code == RSP_ILLEGAL_JTAG_ID && !ext_reset => {
                    log::warn!("jtagmkii: bad response to enter progmode command: {}", rsp_name(code));
                    log::warn!("jtagmkii: retrying with external reset applied");
                    if let Err(e) = self.set_parm(PAR_EXTERNAL_RESET, &[1]) {
                        log::debug!("jtagmkii: setting external reset: {}", e);
                    }
                    ext_reset = true;
                }
                Err(JtagError::Refused { code, .. }) if code == RSP_ILLEGAL_JTAG_ID => {
                    log::error!("jtagmkii: JTAGEN fuse disabled?");
                    return Err(JtagError::Refused {
                        command: "enter progmode",
                        code,
                    });
                }
                Err(e) => {
                    log::warn!("jtagmkii: enter progmode: {}", e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn leave_progmode(&mut self) -> Result<()> {
        if !self.prog_enabled {
            return Ok(());
        }
        if self.config.interface == Interface::Isp {
            self.isp_packet(&[ISP_LEAVE_PROGMODE, 1, 1], 2)?;
        } else {
            self.expect("leave progmode", &[CMND_LEAVE_PROGMODE], RSP_OK, DEFAULT_TIMEOUT)?;
        }
        self.recently_written = false;
        self.prog_enabled = false;
        if self.config.interface != Interface::Isp {
            if let Err(e) = self.reset(0x01) {
                log::debug!("jtagmkii: reset after leaving progmode: {}", e);
            }
        }
        Ok(())
    }

    /// Send a wrapped STK500v2 command; `answer` is the expected answer size
    fn isp_packet(&mut self, stk: &[u8], answer: u16) -> Result<Vec<u8>> {
        let mut buf = vec![CMND_ISP_PACKET];
        buf.extend_from_slice(&answer.to_le_bytes());
        buf.extend_from_slice(stk);
        let resp = self.expect("ISP packet", &buf, RSP_SPI_DATA, DEFAULT_TIMEOUT)?;
        if resp.len() < 3 || resp[1] != stk[0] || resp[2] != ISP_STATUS_OK {
            return Err(JtagError::Refused {
                command: "ISP packet",
                code: resp.get(2).copied().unwrap_or(RSP_FAILED),
            });
        }
        Ok(resp[1..].to_vec())
    }

    fn isp_program_enable(&mut self, part: &Part) -> Result<()> {
        if self.prog_enabled {
            return Ok(());
        }
        let mut cmd = [0u8; 4];
        if let Some(op) = part.ops.get(OpKind::PgmEnable) {
            op.set_bits(&mut cmd);
        }
        let stk = [
            ISP_ENTER_PROGMODE,
            200, // timeout
            100, // stabilisation delay
            25,  // command execution delay
            32,  // sync loops
            0,   // byte delay
            part.pollvalue,
            part.pollindex,
            cmd[0],
            cmd[1],
            cmd[2],
            cmd[3],
        ];
        self.isp_packet(&stk, 2)?;
        self.prog_enabled = true;
        Ok(())
    }

    fn set_devdescr(&mut self, part: &Part) -> Result<()> {
        let Some(len) = self.descriptor_len else {
            return Ok(());
        };
        let dd = DeviceDescriptor::from_part(part);
        let mut buf = vec![CMND_SET_DEVICE_DESCRIPTOR];
        buf.extend(dd.to_bytes(len));
        if let Err(e) = self.expect("set device descriptor", &buf, RSP_OK, DEFAULT_TIMEOUT) {
            log::error!("jtagmkii: {}", e);
        }
        Ok(())
    }

    fn set_xmega_params(&mut self, part: &Part) -> Result<()> {
        let mut buf = vec![CMND_SET_XMEGA_PARAMS];
        buf.extend(XmegaParams::from_part(part).to_bytes());
        if let Err(e) = self.expect("set xmega params", &buf, RSP_OK, DEFAULT_TIMEOUT) {
            log::error!("jtagmkii: {}", e);
        }
        Ok(())
    }

    fn switch_baud(&mut self) -> Result<()> {
        let Some(baud) = self.config.baud else {
            return Ok(());
        };
        if baud == crate::transport::serial::INITIAL_BAUD || self.framer.transport().is_usb() {
            return Ok(());
        }
        match baud_code(baud) {
            None => log::error!("jtagmkii: unsupported baudrate {}", baud),
            Some(code) => {
                log::debug!("jtagmkii: trying to set baudrate to {}", baud);
                self.set_parm(PAR_BAUD_RATE, &[code])?;
                self.framer.transport_mut().set_baud(baud)?;
            }
        }
        Ok(())
    }

    fn mapper(&self, part: &Part) -> MemoryMapper {
        self.mapper
            .unwrap_or_else(|| MemoryMapper::new(part, self.sign_on.fwver))
    }

    fn invalidate_caches(&mut self) {
        self.flash_cache.invalidate();
        self.eeprom_cache.invalidate();
    }

    fn read_memory(&mut self, mtype: u8, len: u32, addr: u32, timeout: Duration, retries: usize) -> Result<Vec<u8>> {
        let mut cmd = vec![CMND_READ_MEMORY, mtype];
        cmd.extend_from_slice(&len.to_le_bytes());
        cmd.extend_from_slice(&addr.to_le_bytes());
        let resp = self.expect_retry("read memory", &cmd, RSP_MEMORY, timeout, retries, timeout != DEFAULT_TIMEOUT)?;
        if resp.len() < 1 + len as usize {
            return Err(JtagError::ShortResponse {
                command: "read memory",
                len: resp.len(),
            });
        }
        self.recently_written = false;
        Ok(resp[1..1 + len as usize].to_vec())
    }

    fn write_memory(&mut self, mtype: u8, addr: u32, data: &[u8], timeout: Duration, retries: usize) -> Result<()> {
        let mut cmd = vec![CMND_WRITE_MEMORY, mtype];
        cmd.extend_from_slice(&(data.len() as u32).to_le_bytes());
        cmd.extend_from_slice(&addr.to_le_bytes());
        cmd.extend_from_slice(data);
        self.expect_retry("write memory", &cmd, RSP_OK, timeout, retries, timeout != DEFAULT_TIMEOUT)?;
        self.recently_written = true;
        Ok(())
    }

    fn data_offset(part: &Part) -> u32 {
        if part.is_pdi_or_updi() {
            DATA_OFFSET
        } else {
            0
        }
    }

    fn read_byte_native(&mut self, part: &Part, mem: &Memory, addr: usize) -> Result<u8> {
        if !self.is_dw() {
            self.enter_progmode()?;
        }
        let xmega = part.is_pdi_or_updi();
        let mut a = addr as u32 + mem.offset;
        let mtype;

        if mem.in_flash() {
            let page = self.flash_pagesize.max(1);
            let rel_base = (addr & !(page - 1)) as u32;
            let key = rel_base + mem.offset;
            if let Some(v) = self.flash_cache.get(key, addr & (page - 1)) {
                return Ok(v);
            }
            let (mtype, address) = self.mapper(part).flash_target(mem, rel_base);
            let data = self.read_memory(mtype, page as u32, address, DEFAULT_TIMEOUT, BYTE_RETRIES)?;
            self.flash_cache = CacheLine { base: Some(key), data };
            return Ok(self.flash_cache.data[addr & (page - 1)]);
        }

        match mem.kind {
            MemKind::Eeprom if self.is_dw() || xmega => mtype = MTYPE_EEPROM,
            MemKind::Eeprom => {
                let page = mem.page_size.max(1);
                let base = a & !(page as u32 - 1);
                if let Some(v) = self.eeprom_cache.get(base, a as usize & (page - 1)) {
                    return Ok(v);
                }
                let data = self.read_memory(MTYPE_EEPROM_PAGE, page as u32, base, DEFAULT_TIMEOUT, BYTE_RETRIES)?;
                self.eeprom_cache = CacheLine { base: Some(base), data };
                return Ok(self.eeprom_cache.data[a as usize & (page - 1)]);
            }
            MemKind::Fuse | MemKind::Fuses => {
                if self.is_dw() {
                    return Err(JtagError::InvalidParameter(format!(
                        "memory {} not accessible in debugWIRE mode",
                        mem.name
                    )));
                }
                mtype = MTYPE_FUSE_BITS;
                if !xmega && mem.kind == MemKind::Fuse {
                    a = fuse_index(mem);
                }
            }
            MemKind::Lock => {
                if self.is_dw() {
                    return Err(JtagError::InvalidParameter(format!(
                        "memory {} not accessible in debugWIRE mode",
                        mem.name
                    )));
                }
                mtype = MTYPE_LOCK_BITS;
            }
            MemKind::UserRow => mtype = MTYPE_USERSIG,
            MemKind::SigRow if xmega => mtype = MTYPE_PRODSIG,
            MemKind::SigRow => {
                mtype = if a & 1 != 0 { MTYPE_OSCCAL_BYTE } else { MTYPE_SIGN_JTAG };
                a /= 2;
            }
            MemKind::Calibration => {
                if self.is_dw() {
                    return Err(JtagError::InvalidParameter(
                        "calibration not accessible in debugWIRE mode".into(),
                    ));
                }
                mtype = MTYPE_OSCCAL_BYTE;
            }
            MemKind::Signature if self.is_dw() => {
                // debugWIRE has no window onto the signature; the ICE caches it
                return match addr {
                    0 => Ok(0x1E),
                    1 | 2 => Ok(self.get_parm(PAR_TARGET_SIGNATURE)?[2 - addr]),
                    _ => Err(JtagError::InvalidParameter(format!(
                        "illegal address {} for signature memory",
                        addr
                    ))),
                };
            }
            MemKind::Signature => mtype = MTYPE_SIGN_JTAG,
            MemKind::Io | MemKind::Sram => {
                mtype = MTYPE_FLASH;
                a += Self::data_offset(part);
            }
            _ => {
                return Err(JtagError::InvalidParameter(format!("unknown memory {}", mem.name)));
            }
        }
        Ok(self.read_memory(mtype, 1, a, DEFAULT_TIMEOUT, BYTE_RETRIES)?[0])
    }

    fn write_byte_native(&mut self, part: &Part, mem: &Memory, addr: usize, value: u8) -> CoreResult<()> {
        let xmega = part.is_pdi_or_updi();
        let mut a = addr as u32 + mem.offset;
        let mut data = vec![value];
        let mut need_progmode = true;
        let updi_family = part.family_id == "megaAVR" || part.family_id == "tinyAVR";
        let dw_unsupported = || {
            CoreError::new(
                ErrorKind::Unsupported,
                format!("memory {} in debugWIRE mode", mem.name),
            )
        };

        let mtype = if mem.in_flash() {
            if self.is_dw() {
                return Err(dw_unsupported());
            }
            if a & 1 != 0 {
                data = vec![0xFF, value];
                a &= !1;
            } else {
                data = vec![value, 0xFF];
            }
            need_progmode = !updi_family;
            self.flash_cache.invalidate();
            if xmega {
                MTYPE_FLASH
            } else {
                MTYPE_SPM
            }
        } else {
            match mem.kind {
                MemKind::Eeprom => {
                    need_progmode = !updi_family;
                    self.eeprom_cache.invalidate();
                    if xmega {
                        MTYPE_EEPROM_XMEGA
                    } else {
                        MTYPE_EEPROM
                    }
                }
                MemKind::Fuse | MemKind::Fuses => {
                    if self.is_dw() {
                        return Err(dw_unsupported());
                    }
                    if !xmega && mem.kind == MemKind::Fuse {
                        a = fuse_index(mem);
                    }
                    MTYPE_FUSE_BITS
                }
                MemKind::UserRow => MTYPE_USERSIG,
                MemKind::Lock => {
                    if self.is_dw() {
                        return Err(dw_unsupported());
                    }
                    MTYPE_LOCK_BITS
                }
                MemKind::Io | MemKind::Sram => {
                    a += Self::data_offset(part);
                    MTYPE_FLASH
                }
                _ if mem.readonly => {
                    return match self.read_byte(part, mem, addr) {
                        Ok(is) if is == value => Ok(()),
                        _ => Err(CoreError::new(
                            ErrorKind::ReadOnly,
                            format!("cannot write to read-only memory {} of {}", mem.name, part.desc),
                        )),
                    };
                }
                _ => {
                    return Err(CoreError::new(
                        ErrorKind::IllegalParam,
                        format!("unknown memory {}", mem.name),
                    ))
                }
            }
        };

        if need_progmode {
            self.enter_progmode()?;
        } else {
            self.leave_progmode()?;
        }
        self.write_memory(mtype, a, &data, DEFAULT_TIMEOUT, BYTE_RETRIES)?;
        Ok(())
    }

    /// Memory type for a paged command, or `None` for byte-wise fallback
    fn paged_mtype(&self, part: &Part, mem: &Memory, load: bool) -> Option<u8> {
        let xmega = part.is_pdi_or_updi();
        Some(match mem.kind {
            MemKind::Eeprom if self.is_dw() => return None,
            MemKind::Eeprom if load && xmega => MTYPE_EEPROM,
            MemKind::Eeprom if xmega => MTYPE_EEPROM_XMEGA,
            MemKind::Eeprom => MTYPE_EEPROM_PAGE,
            MemKind::SigRow if load => MTYPE_PRODSIG,
            MemKind::UserRow => MTYPE_USERSIG,
            _ if xmega => MTYPE_FLASH,
            _ => MTYPE_SPM,
        })
    }
}

impl<T: Transport> Programmer for JtagMkII<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn prog_modes(&self) -> ProgModes {
        self.config.interface.prog_modes()
    }

    fn enable(&mut self, part: &Part) -> CoreResult<()> {
        // Page erase only makes sense for XMEGA/AVR8X or classic parts with a user row
        self.page_erase_ok = matches!(self.config.interface, Interface::Jtag | Interface::Pdi)
            && (part.is_pdi_or_updi() || part.memory_by_kind(MemKind::UserRow).is_some());
        Ok(())
    }

    fn initialize(&mut self, part: &Part) -> CoreResult<()> {
        let iface = self.config.interface;
        if !part.prog_modes.intersects(iface.prog_modes()) {
            return Err(CoreError::new(
                ErrorKind::Unsupported,
                format!("part {} has no {} interface", part.desc, iface.name()),
            ));
        }

        if let Some(high) = self.config.rtsdtr {
            log::info!(
                "jtagmkii: forcing serial DTR/RTS handshake lines {}",
                if high { "HIGH" } else { "LOW" }
            );
            self.framer.transport_mut().set_dtr_rts(high)?;
        }

        self.switch_baud()?;

        if iface == Interface::Isp {
            return Ok(self.isp_program_enable(part)?);
        }

        if iface == Interface::Jtag {
            if let Some(period) = self.config.bitclock {
                log::debug!("jtagmkii: trying to set JTAG clock period to {:.1} us", period * 1e6);
                self.set_sck_period(period)?;
            }
            let chain = self.config.jtagchain;
            self.set_parm(PAR_DAISY_CHAIN_INFO, &chain)
                .map_err(|e| CoreError::from(e).with_context("unable to setup JTAG chain"))?;
            if part.is_pdi_or_updi() {
                self.getsync(EMULATOR_MODE_JTAG_XMEGA)?;
            }
        }

        let xmega = part.is_pdi_or_updi();
        let fw = self.sign_on.fwver;
        if fw >= FW_SECTION_RELATIVE && xmega {
            self.set_xmega_params(part)?;
        } else {
            self.set_devdescr(part)?;
        }

        if let Some(flash) = part.flash() {
            self.flash_pagesize = flash.page_size.clamp(1, MAX_PAGE);
        }
        if let Some(eeprom) = part.eeprom() {
            self.eeprom_pagesize = eeprom.page_size;
        }

        let mapper = MemoryMapper::new(part, fw);
        if xmega {
            match (part.memory_by_kind(MemKind::Flash), part.memory_by_kind(MemKind::Boot)) {
                (Some(flash), Some(boot)) => {
                    if fw < FW_SECTION_RELATIVE {
                        self.set_parm(PAR_PDI_OFFSET_START, &flash.offset.to_le_bytes())?;
                        self.set_parm(PAR_PDI_OFFSET_END, &boot.offset.to_le_bytes())?;
                    }
                }
                _ => log::error!("jtagmkii: cannot locate flash or boot memories in description"),
            }
        }
        self.mapper = Some(mapper);
        self.invalidate_caches();

        // Dragon firmware 7.24 garbles every answer after a RESET here
        if !(fw >= FW_SECTION_RELATIVE && xmega) {
            self.reset(0x01)?;
        }

        if xmega && part.is_xmega() {
            match self.read_chip_rev(part) {
                Ok(rev) => log::info!("silicon revision: {:x}.{:x}", rev >> 4, rev & 0x0F),
                Err(e) => log::debug!("jtagmkii: silicon revision: {}", e),
            }
        }
        Ok(())
    }

    fn disable(&mut self) -> CoreResult<()> {
        self.invalidate_caches();
        Ok(self.leave_progmode()?)
    }

    fn program_enable(&mut self, part: &Part) -> CoreResult<()> {
        if self.config.interface == Interface::Isp {
            return Ok(self.isp_program_enable(part)?);
        }
        Ok(self.enter_progmode()?)
    }

    fn chip_erase(&mut self, part: &Part) -> CoreResult<()> {
        match self.config.interface {
            Interface::DebugWire => {
                log::info!("chip erase not supported in debugWIRE mode");
                return Ok(());
            }
            Interface::Isp => return avr::chip_erase_default(self, part),
            _ => {}
        }
        self.enter_progmode()?;
        if part.is_pdi_or_updi() {
            self.expect(
                "chip erase",
                &[CMND_XMEGA_ERASE, XMEGA_ERASE_CHIP, 0, 0, 0, 0],
                RSP_OK,
                DEFAULT_TIMEOUT,
            )?;
        } else {
            self.expect("chip erase", &[CMND_CHIP_ERASE], RSP_OK, DEFAULT_TIMEOUT)?;
        }
        self.invalidate_caches();
        if !part.is_pdi_or_updi() {
            self.initialize(part)?;
        }
        self.recently_written = true;
        Ok(())
    }

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: usize) -> CoreResult<u8> {
        if self.config.interface == Interface::Isp {
            return avr::read_byte_default(self, part, mem, addr);
        }
        log::trace!("jtagmkii: read_byte {} 0x{:x}", mem.name, addr);
        Ok(self.read_byte_native(part, mem, addr)?)
    }

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: usize, value: u8) -> CoreResult<()> {
        if self.config.interface == Interface::Isp {
            return avr::write_byte_default(self, part, mem, addr, value);
        }
        log::trace!("jtagmkii: write_byte {} 0x{:x} = 0x{:02x}", mem.name, addr, value);
        self.write_byte_native(part, mem, addr, value)
    }

    fn has_paged_access(&self) -> bool {
        self.config.interface != Interface::Isp
    }

    fn paged_load(
        &mut self,
        part: &Part,
        mem: &Memory,
        page_size: usize,
        addr: usize,
        buf: &mut [u8],
    ) -> CoreResult<()> {
        if !self.is_dw() {
            self.enter_progmode()?;
        }
        let Some(fixed_mtype) = self.paged_mtype(part, mem, true) else {
            return Err(CoreError::new(
                ErrorKind::Unsupported,
                "paged EEPROM reads in debugWIRE mode",
            ));
        };
        let block = if mem.readsize > 0 { mem.readsize } else { page_size }.clamp(1, MAX_PAGE);
        let mapper = self.mapper(part);
        log::debug!("jtagmkii: paged_load {} {} bytes at 0x{:x}", mem.name, buf.len(), addr);

        for (i, chunk) in buf.chunks_mut(block).enumerate() {
            let a = (addr + i * block) as u32;
            let (mtype, address) = if mem.in_flash() {
                mapper.flash_target(mem, a)
            } else {
                (fixed_mtype, mapper.memaddr(mem, a))
            };
            let data = self.read_memory(mtype, chunk.len() as u32, address, PAGED_LOAD_TIMEOUT, PAGED_RETRIES)?;
            chunk.copy_from_slice(&data);
        }
        Ok(())
    }

    fn paged_write(
        &mut self,
        part: &Part,
        mem: &Memory,
        page_size: usize,
        addr: usize,
        data: &[u8],
    ) -> CoreResult<()> {
        if !self.is_dw() {
            self.enter_progmode()?;
        }
        let Some(fixed_mtype) = self.paged_mtype(part, mem, false) else {
            // debugWIRE cannot write EEPROM pages
            for (i, &b) in data.iter().enumerate() {
                self.write_byte(part, mem, addr + i, b)?;
            }
            return Ok(());
        };
        let page_size = if page_size == 0 { MAX_PAGE } else { page_size.min(MAX_PAGE) };
        let mapper = self.mapper(part);
        if mem.in_flash() {
            self.flash_cache.invalidate();
        } else if mem.is_eeprom() {
            self.eeprom_cache.invalidate();
        }
        log::debug!("jtagmkii: paged_write {} {} bytes at 0x{:x}", mem.name, data.len(), addr);

        for (i, chunk) in data.chunks(page_size).enumerate() {
            let a = (addr + i * page_size) as u32;
            let (mtype, address) = if mem.in_flash() {
                mapper.flash_target(mem, a)
            } else {
                (fixed_mtype, mapper.memaddr(mem, a))
            };
            // The ICE only writes whole pages
            let mut page = vec![0xFF; page_size];
            page[..chunk.len()].copy_from_slice(chunk);
            self.write_memory(mtype, address, &page, PAGED_WRITE_TIMEOUT, PAGED_RETRIES)?;
        }
        Ok(())
    }

    fn has_page_erase(&self) -> bool {
        self.page_erase_ok
    }

    fn page_erase(&mut self, part: &Part, mem: &Memory, addr: usize) -> CoreResult<()> {
        if !part.is_pdi_or_updi() && mem.kind != MemKind::UserRow {
            return Err(CoreError::new(
                ErrorKind::Unsupported,
                "page erase only available for AVR8X/XMEGAs or classic-part usersig mem",
            ));
        }
        if self.is_dw() {
            return Err(CoreError::new(ErrorKind::Unsupported, "page erase in debugWIRE mode"));
        }
        self.enter_progmode()?;
        let kind = match mem.kind {
            MemKind::Eeprom => XMEGA_ERASE_EEPROM_PAGE,
            MemKind::UserRow => XMEGA_ERASE_USERSIG,
            MemKind::Boot => XMEGA_ERASE_BOOT_PAGE,
            MemKind::Flash if self.mapper(part).mtype(addr as u32) != MTYPE_FLASH => XMEGA_ERASE_BOOT_PAGE,
            _ => XMEGA_ERASE_APP_PAGE,
        };
        // Page erase takes the flat address even on section relative firmware
        let mut cmd = vec![CMND_XMEGA_ERASE, kind];
        cmd.extend_from_slice(&(addr as u32 + mem.offset).to_le_bytes());
        self.expect_retry("page erase", &cmd, RSP_OK, PAGE_ERASE_TIMEOUT, PAGED_RETRIES, true)?;
        if mem.in_flash() {
            self.flash_cache.invalidate();
        } else if mem.is_eeprom() {
            self.eeprom_cache.invalidate();
        }
        Ok(())
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> CoreResult<[u8; 4]> {
        if self.config.interface != Interface::Isp {
            return Err(CoreError::new(ErrorKind::Unsupported, "raw ISP commands outside ISP mode"));
        }
        let mut stk = vec![ISP_SPI_MULTI, 4, 4, 0];
        stk.extend_from_slice(cmd);
        let resp = self.isp_packet(&stk, 3 + 4)?;
        if resp.len() < 6 {
            return Err(JtagError::ShortResponse {
                command: "SPI multi",
                len: resp.len(),
            }
            .into());
        }
        Ok([resp[2], resp[3], resp[4], resp[5]])
    }

    fn set_sck_period(&mut self, period: f64) -> CoreResult<()> {
        if self.config.interface != Interface::Jtag {
            return Err(CoreError::new(ErrorKind::Unsupported, "bit clock outside JTAG mode"));
        }
        let code = jtag_clock_code(period);
        Ok(self.set_parm(PAR_OCD_JTAG_CLK, &[code])?)
    }

    fn sck_period(&mut self) -> CoreResult<f64> {
        if self.config.interface != Interface::Jtag {
            return Err(CoreError::new(ErrorKind::Unsupported, "bit clock outside JTAG mode"));
        }
        Ok(jtag_clock_period(self.get_parm(PAR_OCD_JTAG_CLK)?[0]))
    }

    fn vtarget(&mut self) -> CoreResult<f64> {
        let v = self.get_parm(PAR_OCD_VTARGET)?;
        Ok(f64::from(u16::from_le_bytes([v[0], v[1]])) / 1000.0)
    }

    fn parms(&mut self) -> CoreResult<Vec<(String, String)>> {
        let mut out = vec![
            ("M_MCU firmware".to_string(), fw_string(self.sign_on.m_mcu_fw)),
            ("S_MCU firmware".to_string(), fw_string(self.sign_on.fwver)),
            ("S_MCU hardware".to_string(), self.sign_on.hwver.to_string()),
            ("Serial number".to_string(), self.sign_on.serial_string()),
        ];
        let v = self.vtarget()?;
        out.push(("Vtarget".to_string(), format!("{:.1} V", v)));
        if self.config.interface == Interface::Jtag {
            let code = self.get_parm(PAR_OCD_JTAG_CLK)?[0];
            let clk = 1.0 / jtag_clock_period(code);
            let text = if clk >= 1e6 {
                format!("{:.1} MHz", clk / 1e6)
            } else {
                format!("{:.1} kHz ({:.1} us)", clk / 1e3, 1e6 / clk)
            };
            out.push(("JTAG clock".to_string(), text));
        }
        Ok(out)
    }

    fn read_chip_rev(&mut self, part: &Part) -> CoreResult<u8> {
        if !part.is_xmega() {
            return Err(CoreError::new(
                ErrorKind::Unsupported,
                "target does not have a chip revision that can be read",
            ));
        }
        let io = part.memory_by_kind(MemKind::Io).cloned().unwrap_or_else(|| {
            let mut m = Memory::new("io", 0x1000, 1);
            m.kind = MemKind::Io;
            m
        });
        Ok(self.read_byte_native(part, &io, part.mcu_base as usize + 3)?)
    }

    fn close(&mut self) -> CoreResult<()> {
        if matches!(self.config.interface, Interface::Pdi | Interface::Jtag) {
            if let Err(e) = self.expect("go", &[CMND_GO], RSP_OK, DEFAULT_TIMEOUT) {
                log::error!("jtagmkii: {}", e);
            }
        }
        if let Err(e) = self.expect("sign-off", &[CMND_SIGN_OFF], RSP_OK, DEFAULT_TIMEOUT) {
            log::error!("jtagmkii: {}", e);
        }
        if self.config.rtsdtr.is_some() {
            log::info!("jtagmkii: releasing DTR/RTS handshake lines");
            self.framer.transport_mut().set_dtr_rts(false)?;
        }
        // Give the ICE time to re-enumerate before the next session
        if self.is_dragon {
            std::thread::sleep(Duration::from_millis(1500));
        } else if self.config.usb_serial {
            std::thread::sleep(Duration::from_millis(500));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrflash_core::part::PartDatabase;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    type Handler = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

    /// Decodes each written frame and queues the handler's answer
    struct FakeIce {
        handler: Handler,
        log: Rc<RefCell<Vec<Vec<u8>>>>,
        input: VecDeque<u8>,
    }

    impl Transport for FakeIce {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            let seq = u16::from_le_bytes([data[1], data[2]]);
            let len = u32::from_le_bytes([data[3], data[4], data[5], data[6]]) as usize;
            let payload = data[8..8 + len].to_vec();
            let answer = (self.handler)(&payload);
            self.log.borrow_mut().push(payload);
            self.input.extend(Framer::<FakeIce>::encode(seq, &answer));
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let n = buf.len().min(self.input.len());
            for b in buf.iter_mut().take(n) {
                *b = self.input.pop_front().unwrap();
            }
            Ok(n)
        }

        fn drain(&mut self) -> Result<()> {
            self.input.clear();
            Ok(())
        }
    }

    fn sign_on(fw_major: u8, fw_minor: u8, hw: u8) -> Vec<u8> {
        let mut r = vec![RSP_SIGN_ON, 1, 0xFF, fw_minor, fw_major, 0, 0xFF, fw_minor, fw_major, hw];
        r.extend_from_slice(&[0x00, 0xB0, 0x00, 0x00, 0x12, 0x34]);
        r.extend_from_slice(b"JTAGICE mkII\0");
        r
    }

    /// Answers like a well-behaved ICE; flash reads return the low address byte
    fn default_answer(fw: (u8, u8), payload: &[u8]) -> Vec<u8> {
        match payload[0] {
            CMND_GET_SIGN_ON => sign_on(fw.0, fw.1, 1),
            CMND_GET_PARAMETER if payload[1] == PAR_TARGET_SIGNATURE => vec![RSP_PARAMETER, 0x0F, 0x95, 0, 0],
            CMND_GET_PARAMETER => vec![RSP_PARAMETER, 0x88, 0x13, 0, 0],
            CMND_READ_MEMORY => {
                let len = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
                let addr = u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]);
                let mut r = vec![RSP_MEMORY];
                r.extend((addr..addr + len).map(|a| a as u8));
                r
            }
            _ => vec![RSP_OK],
        }
    }

    fn open(
        interface: Interface,
        fw: (u8, u8),
        mut extra: impl FnMut(&[u8]) -> Option<Vec<u8>> + 'static,
    ) -> Result<(JtagMkII<FakeIce>, Rc<RefCell<Vec<Vec<u8>>>>)> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let ice = FakeIce {
            handler: Box::new(move |p: &[u8]| extra(p).unwrap_or_else(|| default_answer(fw, p))),
            log: log.clone(),
            input: VecDeque::new(),
        };
        let config = JtagMkIIConfig {
            interface,
            ..Default::default()
        };
        JtagMkII::open(ice, config).map(|p| (p, log))
    }

    fn count(log: &Rc<RefCell<Vec<Vec<u8>>>>, cmd: u8) -> usize {
        log.borrow().iter().filter(|p| p[0] == cmd).count()
    }

    #[test]
    fn test_sign_on_parse() {
        let s = SignOn::parse(&sign_on(7, 0x12, 1)).unwrap();
        assert_eq!(s.fwver, 0x0712);
        assert_eq!(s.hwver, 1);
        assert_eq!(s.serial_string(), "00:b0:00:00:12:34");
        assert_eq!(s.device_id, "JTAGICE mkII");
        assert!(SignOn::parse(&[RSP_SIGN_ON, 1, 2]).is_err());
    }

    #[test]
    fn test_open_sets_emulator_mode_and_syncs() {
        let (pgm, log) = open(Interface::Jtag, (7, 0), |_| None).unwrap();
        let log = log.borrow();
        assert_eq!(log[0], vec![CMND_GET_SIGN_ON]);
        assert_eq!(log[1], vec![CMND_SET_PARAMETER, PAR_EMULATOR_MODE, EMULATOR_MODE_JTAG]);
        assert_eq!(log[2], vec![CMND_GET_SYNC]);
        assert_eq!(pgm.name(), "jtagmkii");
        assert!(!pgm.is_dragon());
    }

    #[test]
    fn test_sign_on_retries_then_succeeds() {
        let mut refusals = 3;
        let (pgm, log) = open(Interface::Jtag, (7, 0), move |p| {
            if p[0] == CMND_GET_SIGN_ON && refusals > 0 {
                refusals -= 1;
                Some(vec![RSP_FAILED])
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(count(&log, CMND_GET_SIGN_ON), 4);
        assert_eq!(pgm.sign_on().fwver, 0x0700);
    }

    #[test]
    fn test_dragon_detected_from_hardware_version() {
        let (pgm, _) = open(Interface::Pdi, (6, 11), |p| {
            (p[0] == CMND_GET_SIGN_ON).then(|| sign_on(6, 11, HW_VERSION_DRAGON))
        })
        .unwrap();
        assert!(pgm.is_dragon());
    }

    #[test]
    fn test_old_firmware_rejected_for_pdi() {
        let err = open(Interface::Pdi, (5, 0x20), |_| None).err().unwrap();
        assert!(matches!(err, JtagError::Firmware(_)));
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_isp_falls_back_to_debugwire_and_retries() {
        let mut first = true;
        let (_, log) = open(Interface::Isp, (7, 0), move |p| {
            if p[0] == CMND_SET_PARAMETER && p[2] == EMULATOR_MODE_SPI && first {
                first = false;
                Some(vec![0xA4])
            } else {
                None
            }
        })
        .unwrap();
        let log = log.borrow();
        assert!(log.contains(&vec![CMND_SET_PARAMETER, PAR_EMULATOR_MODE, EMULATOR_MODE_DEBUGWIRE]));
        assert!(log.contains(&vec![CMND_RESET, 0x04]));
        assert_eq!(
            log.iter()
                .filter(|p| **p == vec![CMND_SET_PARAMETER, PAR_EMULATOR_MODE, EMULATOR_MODE_SPI])
                .count(),
            2
        );
    }

    #[test]
    fn test_initialize_sends_descriptor_and_resets() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m2560").unwrap();
        let (mut pgm, log) = open(Interface::Jtag, (7, 0), |_| None).unwrap();
        pgm.enable(part).unwrap();
        pgm.initialize(part).unwrap();
        let log = log.borrow();
        let dd = log.iter().find(|p| p[0] == CMND_SET_DEVICE_DESCRIPTOR).unwrap();
        assert_eq!(dd.len(), 1 + 298);
        assert!(log.contains(&vec![CMND_SET_PARAMETER, PAR_DAISY_CHAIN_INFO, 0, 0, 0, 0]));
        assert_eq!(log.last().unwrap(), &vec![CMND_RESET, 0x01]);
        assert!(!pgm.has_page_erase());
    }

    #[test]
    fn test_initialize_rejects_part_without_interface() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m328p").unwrap();
        let (mut pgm, _) = open(Interface::Jtag, (7, 0), |_| None).unwrap();
        let err = pgm.initialize(part).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(err.context().contains("no JTAG interface"));
    }

    #[test]
    fn test_xmega_new_firmware_gets_params_and_no_reset() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("x128a1").unwrap();
        let (mut pgm, log) = open(Interface::Pdi, (7, 0), |_| None).unwrap();
        pgm.enable(part).unwrap();
        pgm.initialize(part).unwrap();
        let log = log.borrow();
        let xp = log.iter().find(|p| p[0] == CMND_SET_XMEGA_PARAMS).unwrap();
        assert_eq!(xp.len(), 1 + 50);
        assert_eq!(count_in(&log, CMND_SET_DEVICE_DESCRIPTOR), 0);
        assert_eq!(count_in(&log, CMND_RESET), 0);
        assert!(pgm.has_page_erase());
    }

    fn count_in(log: &[Vec<u8>], cmd: u8) -> usize {
        log.iter().filter(|p| p[0] == cmd).count()
    }

    #[test]
    fn test_flash_reads_served_from_page_cache() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m2560").unwrap();
        let flash = part.flash().unwrap();
        let (mut pgm, log) = open(Interface::Jtag, (7, 0), |_| None).unwrap();
        pgm.initialize(part).unwrap();
        for a in 0x100..0x110 {
            assert_eq!(pgm.read_byte(part, flash, a).unwrap(), a as u8);
        }
        assert_eq!(count(&log, CMND_READ_MEMORY), 1);
        let read = log.borrow().iter().find(|p| p[0] == CMND_READ_MEMORY).cloned().unwrap();
        assert_eq!(read[1], MTYPE_FLASH_PAGE);
        assert_eq!(&read[2..6], &256u32.to_le_bytes());
        assert_eq!(&read[6..10], &0x100u32.to_le_bytes());

        // A write invalidates the cached page
        pgm.write_byte(part, flash, 0x101, 0x00).unwrap();
        pgm.read_byte(part, flash, 0x102).unwrap();
        assert_eq!(count(&log, CMND_READ_MEMORY), 2);
    }

    #[test]
    fn test_odd_flash_byte_writes_high_half() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m2560").unwrap();
        let flash = part.flash().unwrap();
        let (mut pgm, log) = open(Interface::Jtag, (7, 0), |_| None).unwrap();
        pgm.write_byte(part, flash, 0x21, 0xAB).unwrap();
        let w = log.borrow().iter().find(|p| p[0] == CMND_WRITE_MEMORY).cloned().unwrap();
        assert_eq!(w[1], MTYPE_SPM);
        assert_eq!(&w[2..6], &2u32.to_le_bytes());
        assert_eq!(&w[6..10], &0x20u32.to_le_bytes());
        assert_eq!(&w[10..], &[0xFF, 0xAB]);
        assert!(pgm.recently_written());
    }

    #[test]
    fn test_paged_write_pads_partial_page() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m2560").unwrap();
        let flash = part.flash().unwrap();
        let (mut pgm, log) = open(Interface::Jtag, (7, 0), |_| None).unwrap();
        pgm.initialize(part).unwrap();
        let data = vec![0x11; 300];
        pgm.paged_write(part, flash, 256, 0x200, &data).unwrap();
        let writes: Vec<Vec<u8>> =
            log.borrow().iter().filter(|p| p[0] == CMND_WRITE_MEMORY).cloned().collect();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].len(), 10 + 256);
        assert_eq!(writes[1][1], MTYPE_FLASH_PAGE);
        assert_eq!(&writes[1][6..10], &0x300u32.to_le_bytes());
        assert_eq!(writes[1][10 + 43], 0x11);
        assert_eq!(writes[1][10 + 44], 0xFF);
    }

    #[test]
    fn test_paged_load_uses_readsize_blocks() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("x128a1").unwrap();
        let boot = part.memory("boot").unwrap();
        let (mut pgm, log) = open(Interface::Pdi, (7, 0), |_| None).unwrap();
        pgm.initialize(part).unwrap();
        log.borrow_mut().clear();
        let mut buf = vec![0u8; 512];
        pgm.paged_load(part, boot, 512, 0, &mut buf).unwrap();
        let reads: Vec<Vec<u8>> =
            log.borrow().iter().filter(|p| p[0] == CMND_READ_MEMORY).cloned().collect();
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[1][1], MTYPE_BOOT_FLASH);
        assert_eq!(&reads[1][6..10], &256u32.to_le_bytes());
        assert_eq!(buf[257], 1);
    }

    #[test]
    fn test_program_enable_retries_with_external_reset() {
        let mut refused = false;
        let (mut pgm, log) = open(Interface::Jtag, (7, 0), move |p| {
            if p[0] == CMND_ENTER_PROGMODE && !refused {
                refused = true;
                Some(vec![RSP_ILLEGAL_JTAG_ID])
            } else {
                None
            }
        })
        .unwrap();
        let db = PartDatabase::builtin().unwrap();
        pgm.program_enable(db.find("m2560").unwrap()).unwrap();
        assert!(log.borrow().contains(&vec![CMND_SET_PARAMETER, PAR_EXTERNAL_RESET, 1]));
        assert_eq!(count(&log, CMND_ENTER_PROGMODE), 2);
    }

    #[test]
    fn test_jtagen_disabled_reported() {
        let (mut pgm, _) = open(Interface::Jtag, (7, 0), |p| {
            (p[0] == CMND_ENTER_PROGMODE).then(|| vec![RSP_ILLEGAL_JTAG_ID])
        })
        .unwrap();
        let db = PartDatabase::builtin().unwrap();
        let err = pgm.program_enable(db.find("m2560").unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolRefused(RSP_ILLEGAL_JTAG_ID));
    }

    #[test]
    fn test_debugwire_signature_from_parameter() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m328p").unwrap();
        let sig = part.memory("signature").unwrap();
        let (mut pgm, _) = open(Interface::DebugWire, (7, 0), |_| None).unwrap();
        let bytes: Vec<u8> = (0..3).map(|a| pgm.read_byte(part, sig, a).unwrap()).collect();
        assert_eq!(bytes, vec![0x1E, 0x95, 0x0F]);
        assert!(pgm.chip_erase(part).is_ok());
    }

    #[test]
    fn test_xmega_chip_erase_command() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("x128a1").unwrap();
        let (mut pgm, log) = open(Interface::Pdi, (7, 0), |_| None).unwrap();
        pgm.chip_erase(part).unwrap();
        assert!(log
            .borrow()
            .contains(&vec![CMND_XMEGA_ERASE, XMEGA_ERASE_CHIP, 0, 0, 0, 0]));
    }

    #[test]
    fn test_page_erase_uses_flat_address() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("x128a1").unwrap();
        let flash = part.memory("flash").unwrap();
        let (mut pgm, log) = open(Interface::Pdi, (7, 0), |_| None).unwrap();
        pgm.initialize(part).unwrap();
        pgm.page_erase(part, flash, 0x20200).unwrap();
        let e = log.borrow().iter().rfind(|p| p[0] == CMND_XMEGA_ERASE).cloned().unwrap();
        assert_eq!(e[1], XMEGA_ERASE_BOOT_PAGE);
        assert_eq!(&e[2..6], &0x820200u32.to_le_bytes());
    }

    #[test]
    fn test_readonly_write_same_value_accepted() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m2560").unwrap();
        let sig = part.memory("signature").unwrap();
        let (mut pgm, log) = open(Interface::Jtag, (7, 0), |p| {
            (p[0] == CMND_READ_MEMORY).then(|| vec![RSP_MEMORY, 0x98])
        })
        .unwrap();
        pgm.write_byte(part, sig, 1, 0x98).unwrap();
        let err = pgm.write_byte(part, sig, 1, 0x00).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadOnly);
        assert_eq!(count(&log, CMND_WRITE_MEMORY), 0);
    }

    #[test]
    fn test_extparams() {
        let mut cfg = JtagMkIIConfig::default();
        assert!(!cfg.apply_extparams(&["jtagchain=1,2,3,4".into()]).unwrap());
        assert_eq!(cfg.jtagchain, [1, 2, 3, 4]);
        assert!(cfg.apply_extparams(&["jtagchain=1,2".into()]).is_err());
        assert!(cfg.apply_extparams(&["rtsdtr=high".into()]).is_err());
        assert!(cfg.apply_extparams(&["help".into()]).unwrap());

        let mut cfg = JtagMkIIConfig {
            interface: Interface::Pdi,
            ..Default::default()
        };
        cfg.apply_extparams(&["rtsdtr=LOW".into()]).unwrap();
        assert_eq!(cfg.rtsdtr, Some(false));
        assert!(cfg.apply_extparams(&["rtsdtr=medium".into()]).is_err());
        assert!(cfg.apply_extparams(&["bogus".into()]).is_err());
    }

    #[test]
    fn test_isp_mode_uses_wrapped_spi() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m328p").unwrap();
        let sig = part.memory("signature").unwrap();
        let (mut pgm, log) = open(Interface::Isp, (7, 0), |p| {
            if p[0] != CMND_ISP_PACKET {
                return None;
            }
            Some(match p[3] {
                ISP_SPI_MULTI => vec![RSP_SPI_DATA, ISP_SPI_MULTI, ISP_STATUS_OK, 0, 0x30, 0, 0x1E, ISP_STATUS_OK],
                cmd => vec![RSP_SPI_DATA, cmd, ISP_STATUS_OK],
            })
        })
        .unwrap();
        pgm.initialize(part).unwrap();
        assert!(!pgm.has_paged_access());
        assert_eq!(pgm.read_byte(part, sig, 0).unwrap(), 0x1E);
        let enter = log
            .borrow()
            .iter()
            .find(|p| p[0] == CMND_ISP_PACKET && p[3] == ISP_ENTER_PROGMODE)
            .cloned()
            .unwrap();
        assert_eq!(&enter[11..15], &[0xAC, 0x53, 0x00, 0x00]);
    }
}
