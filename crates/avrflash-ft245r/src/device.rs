//! FT245R ISP/TPI programmer
//!
//! Single instructions go through [`BitShifter::transfer`]. Paged flash
//! access is split into fragments of [`INSTRS_PER_FRAGMENT`] instructions
//! that are sent ahead of their replies and collected by a
//! [`RequestPipeline`].

use avrflash_core::avr;
use avrflash_core::opcode::{OpKind, Opcode};
use avrflash_core::part::{Memory, Part, ProgModes};
use avrflash_core::programmer::bitbang::{
    BitShifter, Pin, PinDef, PinMap, FRAGMENT_SIZE, INSTRS_PER_FRAGMENT,
};
use avrflash_core::programmer::pipeline::{Request, RequestPipeline};
use avrflash_core::programmer::{Led, Programmer};
use avrflash_core::tpi;
use avrflash_core::{Error, ErrorKind, Result};

use crate::error::Ft245rError;
use crate::link::{BitbangAdapter, DeviceSelection, FtdiLink};

/// Bit-clock used when none is given
pub const DEFAULT_BITCLOCK_HZ: f64 = 150_000.0;

const PGM_ENABLE_TRIES: usize = 4;

/// Help text for `-x help`
pub const EXTPARAM_HELP: &str = "\
ft245r extended parameters:
  -x <pin>=<n>   assign a pin to data bit n (0-7), ~n for active low, empty to disconnect
                 pins: sck, sdo (mosi), sdi (miso), reset, buff, vcc, errled, pgmled
  -x help        show this help";

/// Default wiring: SCK on TxD, SDI on RxD, SDO on RTS, RESET on DTR
pub fn default_pins() -> PinMap {
    PinMap::default()
        .with(Pin::Sck, PinDef::on(0))
        .with(Pin::Sdi, PinDef::on(1))
        .with(Pin::Sdo, PinDef::on(2))
        .with(Pin::Reset, PinDef::on(4))
}

/// Connection options
#[derive(Debug, Clone, PartialEq)]
pub struct Ft245rConfig {
    /// Pin assignment
    pub pins: PinMap,
    /// Bit-clock period in seconds
    pub bitclock: Option<f64>,
    /// Device to open
    pub selection: DeviceSelection,
}

impl Default for Ft245rConfig {
    fn default() -> Self {
        Self {
            pins: default_pins(),
            bitclock: None,
            selection: DeviceSelection::Index(0),
        }
    }
}

impl Ft245rConfig {
    /// Apply `-x` pin overrides; returns `true` if help was requested
    pub fn apply_extparams(&mut self, params: &[String]) -> Result<bool> {
        for param in params {
            if param == "help" {
                return Ok(true);
            }
            let (name, value) = param.split_once('=').ok_or_else(|| {
                Error::from(Ft245rError::InvalidParameter(format!(
                    "invalid extended parameter '{}'",
                    param
                )))
            })?;
            let pin = Pin::from_name(name).ok_or_else(|| {
                Error::from(Ft245rError::InvalidParameter(format!("unknown pin '{}'", name)))
            })?;
            self.pins.set(pin, PinDef::parse(value)?);
        }
        self.pins.validate()?;
        Ok(false)
    }

    fn baud(&self) -> u32 {
        let rate = match self.bitclock {
            Some(p) if p > 0.0 => 1.0 / p,
            _ => DEFAULT_BITCLOCK_HZ,
        };
        (rate / 2.0) as u32
    }
}

/// FT245R programmer over any bit-bang adapter
pub struct Ft245r<L: BitbangAdapter> {
    link: L,
    shifter: BitShifter,
    pipeline: RequestPipeline,
    baud: u32,
}

impl Ft245r<FtdiLink> {
    /// Open an FT245R according to `config`
    pub fn open(config: &Ft245rConfig) -> Result<Self> {
        config.pins.validate()?;
        let shifter = BitShifter::new(config.pins);
        let link = FtdiLink::open(
            &config.selection,
            config.pins.output_mask(),
            config.baud(),
            shifter.out(),
        )?;
        Ok(Self::with_shifter(link, shifter, config.baud()))
    }
}

impl<L: BitbangAdapter> Ft245r<L> {
    /// Drive an already opened adapter
    pub fn new(link: L, config: &Ft245rConfig) -> Result<Self> {
        config.pins.validate()?;
        Ok(Self::with_shifter(link, BitShifter::new(config.pins), config.baud()))
    }

    fn with_shifter(link: L, shifter: BitShifter, baud: u32) -> Self {
        log::debug!("ft245r: output mask 0x{:02x}", shifter.pins().output_mask());
        Self {
            link,
            shifter,
            pipeline: RequestPipeline::default(),
            baud,
        }
    }

    /// The adapter
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Drive `pin` and push the new output byte
    fn drive(&mut self, pin: Pin, on: bool) -> Result<()> {
        if self.shifter.pins().get(pin).mask() == 0 {
            return Ok(());
        }
        let out = self.shifter.set_pin(pin, on);
        self.link.send_and_discard(&[out])
    }

    fn pulse_reset(&mut self) -> Result<()> {
        self.drive(Pin::Reset, true)?;
        self.link.sleep_us(20)?;
        self.drive(Pin::Reset, false)?;
        self.link.sleep_us(20_000)
    }

    fn isp_command(op: &Opcode, caddr: u32, input: Option<u8>) -> [u8; 4] {
        let mut cmd = [0u8; 4];
        op.set_bits(&mut cmd);
        op.set_addr(&mut cmd, caddr);
        if let Some(data) = input {
            op.set_input(&mut cmd, data);
        }
        cmd
    }

    /// Close a fragment, send it and queue it for collection
    fn flush_fragment(&mut self, frag: &mut Vec<u8>, req_addr: usize, n: usize, last: bool, dest: &mut [u8]) -> Result<()> {
        if last {
            self.shifter.push_sck_low(frag);
        } else {
            self.shifter.push_stretch(frag);
        }
        self.link.send(frag)?;
        let req = Request {
            addr: req_addr,
            bytes: frag.len(),
            n,
        };
        frag.clear();
        self.pipeline.enqueue(&mut self.link, &self.shifter, dest, req)
    }

    fn flash_ops<'m>(mem: &'m Memory, lo: OpKind, hi: OpKind) -> Result<(&'m Opcode, &'m Opcode)> {
        match (mem.ops.get(lo), mem.ops.get(hi)) {
            (Some(lo), Some(hi)) => Ok((lo, hi)),
            _ => Err(Error::new(
                ErrorKind::Unsupported,
                format!("memory {} has no paged instructions", mem.name),
            )),
        }
    }

    fn check_paged(part: &Part, mem: &Memory) -> Result<()> {
        if part.is_tpi() || !mem.in_flash() || !mem.paged {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("paged access to {}", mem.name),
            ));
        }
        Ok(())
    }

    fn load_pipelined(&mut self, mem: &Memory, addr: usize, buf: &mut [u8]) -> Result<()> {
        let (lo, hi) = Self::flash_ops(mem, OpKind::ReadLo, OpKind::ReadHi)?;
        avr::load_ext_addr(self, mem, (addr / 2) as u32)?;

        let mut frag = Vec::with_capacity(FRAGMENT_SIZE + 1);
        let mut start = 0;
        let mut n = 0;
        for i in 0..buf.len() {
            let a = addr + i;
            let op = if a & 1 == 0 { lo } else { hi };
            for b in Self::isp_command(op, (a / 2) as u32, None) {
                self.shifter.push_byte(&mut frag, b);
            }
            n += 1;
            let last = i + 1 == buf.len();
            if n == INSTRS_PER_FRAGMENT || last {
                self.flush_fragment(&mut frag, start, n, last, buf)?;
                start = i + 1;
                n = 0;
            }
        }
        self.pipeline.drain(&mut self.link, &self.shifter, buf)
    }

    fn write_pipelined(&mut self, part: &Part, mem: &Memory, page_size: usize, addr: usize, data: &[u8]) -> Result<()> {
        let (lo, hi) = Self::flash_ops(mem, OpKind::LoadpageLo, OpKind::LoadpageHi)?;
        let page_size = page_size.max(2);
        avr::load_ext_addr(self, mem, (addr / 2) as u32)?;

        let mut frag = Vec::with_capacity(FRAGMENT_SIZE + 1);
        let mut n = 0;
        for (i, &byte) in data.iter().enumerate() {
            let a = addr + i;
            let op = if a & 1 == 0 { lo } else { hi };
            for b in Self::isp_command(op, (a / 2) as u32, Some(byte)) {
                self.shifter.push_byte(&mut frag, b);
            }
            n += 1;
            let page_end = (a + 1) % page_size == 0 || i + 1 == data.len();
            if n == INSTRS_PER_FRAGMENT || page_end {
                // writes decode nothing; the queue only paces the adapter
                self.flush_fragment(&mut frag, 0, 0, page_end, &mut [])?;
                n = 0;
            }
            if page_end {
                self.pipeline.drain(&mut self.link, &self.shifter, &mut [])?;
                avr::write_page(self, part, mem, a)?;
            }
        }
        Ok(())
    }
}

impl<L: BitbangAdapter> Programmer for Ft245r<L> {
    fn name(&self) -> &str {
        "ft245r"
    }

    fn prog_modes(&self) -> ProgModes {
        ProgModes::ISP | ProgModes::TPI
    }

    fn enable(&mut self, _part: &Part) -> Result<()> {
        self.drive(Pin::Buff, true)?;
        self.drive(Pin::Vcc, true)
    }

    fn disable(&mut self) -> Result<()> {
        self.drive(Pin::Reset, true)?;
        self.drive(Pin::Buff, false)
    }

    fn initialize(&mut self, part: &Part) -> Result<()> {
        self.drive(Pin::Sck, false)?;
        self.drive(Pin::Reset, true)?;
        self.link.sleep_us(5_000)?;
        self.drive(Pin::Reset, false)?;
        self.link.sleep_us(20_000)?;

        if part.is_tpi() {
            // TPI wakes up after at least 16 idle clocks with TPIDATA high
            let mut buf = Vec::with_capacity(16 * 2 + 1);
            for _ in 0..16 {
                self.shifter.push_bit(&mut buf, true);
            }
            self.shifter.push_sck_low(&mut buf);
            self.link.send_and_discard(&buf)?;
        }
        self.program_enable(part)
    }

    fn program_enable(&mut self, part: &Part) -> Result<()> {
        if part.is_tpi() {
            return tpi::program_enable(self, part, tpi::GUARD_TIME);
        }
        for attempt in 1..=PGM_ENABLE_TRIES {
            match avr::program_enable_default(self, part) {
                Ok(()) => return Ok(()),
                Err(e) => log::debug!("ft245r: program enable attempt {}: {}", attempt, e),
            }
            self.pulse_reset()?;
        }
        Err(Error::new(
            ErrorKind::HardFail,
            "device is not responding to program enable; check connection",
        ))
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        avr::chip_erase_default(self, part)
    }

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: usize) -> Result<u8> {
        avr::read_byte_default(self, part, mem, addr)
    }

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: usize, value: u8) -> Result<()> {
        avr::write_byte_default(self, part, mem, addr, value)
    }

    fn has_paged_access(&self) -> bool {
        true
    }

    fn paged_load(&mut self, part: &Part, mem: &Memory, _page_size: usize, addr: usize, buf: &mut [u8]) -> Result<()> {
        Self::check_paged(part, mem)?;
        let rc = self.load_pipelined(mem, addr, buf);
        if rc.is_err() {
            self.pipeline.clear();
        }
        rc
    }

    fn paged_write(&mut self, part: &Part, mem: &Memory, page_size: usize, addr: usize, data: &[u8]) -> Result<()> {
        Self::check_paged(part, mem)?;
        let rc = self.write_pipelined(part, mem, page_size, addr, data);
        if rc.is_err() {
            self.pipeline.clear();
        }
        rc
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        let res = self.shifter.transfer(&mut self.link, cmd)?;
        let mut out = [0u8; 4];
        out.copy_from_slice(&res[..4]);
        Ok(out)
    }

    fn cmd_tpi(&mut self, cmd: &[u8], res: &mut [u8]) -> Result<()> {
        for &b in cmd {
            self.shifter.tpi_tx(&mut self.link, b)?;
        }
        for r in res.iter_mut() {
            *r = self.shifter.tpi_rx(&mut self.link)?;
        }
        Ok(())
    }

    fn spi(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        let res = self.shifter.transfer(&mut self.link, tx)?;
        let n = rx.len().min(res.len());
        rx[..n].copy_from_slice(&res[..n]);
        Ok(())
    }

    fn set_sck_period(&mut self, period: f64) -> Result<()> {
        if period <= 0.0 {
            return Err(Error::new(ErrorKind::IllegalParam, "bit clock period must be positive"));
        }
        let baud = ((1.0 / period) / 2.0) as u32;
        self.link.set_baud(baud)?;
        self.baud = baud;
        Ok(())
    }

    fn sck_period(&mut self) -> Result<f64> {
        Ok(1.0 / (f64::from(self.baud) * 2.0))
    }

    fn parms(&mut self) -> Result<Vec<(String, String)>> {
        let mut out = vec![(
            "Bit clock".to_string(),
            format!("{:.1} kHz", f64::from(self.baud) * 2.0 / 1000.0),
        )];
        out.extend(self.shifter.pins().describe());
        Ok(out)
    }

    fn set_led(&mut self, led: Led, on: bool) -> Result<()> {
        match led {
            Led::Err => self.drive(Pin::LedErr, on),
            Led::Pgm => self.drive(Pin::LedPgm, on),
            _ => Ok(()),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.link.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrflash_core::part::PartDatabase;
    use avrflash_core::programmer::bitbang::BitbangLink;
    use std::collections::VecDeque;

    /// An ATmega328P on the other end of the wires
    ///
    /// Decodes instructions from SDO on rising SCK edges and answers on SDI
    /// in the sample after each edge.
    struct SimAvr {
        pins: PinMap,
        samples: VecDeque<u8>,
        sck: bool,
        bits: u32,
        nbits: u32,
        answer: [u8; 4],
        flash: Vec<u8>,
        page: Vec<u8>,
        instructions: Vec<[u8; 4]>,
        dead: bool,
        baud: u32,
    }

    impl SimAvr {
        fn new() -> Self {
            Self {
                pins: default_pins(),
                samples: VecDeque::new(),
                sck: false,
                bits: 0,
                nbits: 0,
                answer: [0; 4],
                flash: (0..32768u32).map(|i| (i * 7) as u8).collect(),
                page: vec![0xFF; 128],
                instructions: Vec::new(),
                dead: false,
                baud: 0,
            }
        }

        fn pin(&self, sample: u8, pin: Pin) -> bool {
            sample & self.pins.get(pin).mask() != 0
        }

        /// Work out the reply bytes once enough of the instruction is in
        fn prepare(&mut self, b: [u8; 4], nbits: u32) {
            if nbits == 16 && !self.dead {
                self.answer[2] = b[1];
            }
            if nbits == 24 {
                let word = ((b[1] as usize & 0x3F) << 8) | b[2] as usize;
                self.answer[3] = match b[0] {
                    0x30 => [0x1E, 0x95, 0x0F][b[2] as usize & 3],
                    0x20 => self.flash[2 * word],
                    0x28 => self.flash[2 * word + 1],
                    _ => 0,
                };
            }
        }

        fn execute(&mut self, b: [u8; 4]) {
            self.instructions.push(b);
            match b[0] {
                0x40 => self.page[2 * (b[2] as usize & 0x3F)] = b[3],
                0x48 => self.page[2 * (b[2] as usize & 0x3F) + 1] = b[3],
                0x4C => {
                    let base = 2 * ((((b[1] as usize) << 8) | b[2] as usize) & !63);
                    for (i, p) in self.page.iter_mut().enumerate() {
                        self.flash[base + i] &= *p;
                        *p = 0xFF;
                    }
                }
                0xAC if b[1] & 0x80 != 0 => self.flash.fill(0xFF),
                _ => {}
            }
        }

        fn clock(&mut self, buf: &[u8]) -> Vec<u8> {
            let mut rx = vec![0u8; buf.len()];
            for (i, &byte) in buf.iter().enumerate() {
                let sck = self.pin(byte, Pin::Sck);
                if sck && !self.sck {
                    let bit = self.pin(byte, Pin::Sdo);
                    self.bits = (self.bits << 1) | u32::from(bit);
                    self.nbits += 1;
                    let b = (self.bits << (32 - self.nbits)).to_be_bytes();
                    if self.nbits % 8 == 0 {
                        self.prepare(b, self.nbits);
                    }
                    let pos = self.nbits - 1;
                    let out = self.answer[pos as usize / 8] & (0x80 >> (pos % 8)) != 0;
                    if out {
                        if let Some(s) = rx.get_mut(i + 1) {
                            *s |= self.pins.get(Pin::Sdi).mask();
                        }
                    }
                    if self.nbits == 32 {
                        self.execute(self.bits.to_be_bytes());
                        self.bits = 0;
                        self.nbits = 0;
                        self.answer = [0; 4];
                    }
                }
                self.sck = sck;
            }
            rx
        }

        fn count(&self, opcode: u8) -> usize {
            self.instructions.iter().filter(|i| i[0] == opcode).count()
        }
    }

    impl BitbangLink for SimAvr {
        fn send(&mut self, buf: &[u8]) -> Result<()> {
            let rx = self.clock(buf);
            self.samples.extend(rx);
            Ok(())
        }

        fn send_and_discard(&mut self, buf: &[u8]) -> Result<()> {
            self.clock(buf);
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<()> {
            for b in buf.iter_mut() {
                *b = self.samples.pop_front().unwrap();
            }
            Ok(())
        }

        fn read_pins(&mut self) -> Result<u8> {
            Ok(0)
        }

        fn sleep_us(&mut self, _us: u64) -> Result<()> {
            Ok(())
        }
    }

    impl BitbangAdapter for SimAvr {
        fn set_baud(&mut self, baud: u32) -> Result<()> {
            self.baud = baud;
            Ok(())
        }
    }

    fn programmer(sim: SimAvr) -> Ft245r<SimAvr> {
        Ft245r::new(sim, &Ft245rConfig::default()).unwrap()
    }

    #[test]
    fn test_initialize_enables_programming() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m328p").unwrap();
        let mut pgm = programmer(SimAvr::new());
        pgm.initialize(part).unwrap();
        assert_eq!(pgm.link().count(0xAC), 1);
        assert_eq!(avr::read_signature(&mut pgm, part).unwrap(), [0x1E, 0x95, 0x0F]);
    }

    #[test]
    fn test_program_enable_gives_up_after_four_tries() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m328p").unwrap();
        let mut sim = SimAvr::new();
        sim.dead = true;
        let mut pgm = programmer(sim);
        let err = pgm.program_enable(part).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardFail);
        assert_eq!(pgm.link().count(0xAC), PGM_ENABLE_TRIES);
    }

    #[test]
    fn test_paged_load_is_pipelined() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m328p").unwrap();
        let flash = part.flash().unwrap();
        let mut pgm = programmer(SimAvr::new());
        let mut buf = vec![0u8; 128];
        pgm.paged_load(part, flash, 128, 0x100, &mut buf).unwrap();
        let expect: Vec<u8> = (0x100..0x180u32).map(|i| (i * 7) as u8).collect();
        assert_eq!(buf, expect);
        assert!(pgm.pipeline.is_empty());
        assert_eq!(pgm.link().count(0x20) + pgm.link().count(0x28), 128);
    }

    #[test]
    fn test_paged_write_commits_each_page() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m328p").unwrap();
        let flash = part.flash().unwrap();
        let mut sim = SimAvr::new();
        sim.flash.fill(0xFF);
        let mut pgm = programmer(sim);
        let data: Vec<u8> = (0..128u8).collect();
        pgm.paged_write(part, flash, 128, 0x80, &data).unwrap();
        assert_eq!(pgm.link().count(0x4C), 1);
        assert_eq!(&pgm.link().flash[0x80..0x100], &data[..]);
        assert_eq!(pgm.link().flash[0x7F], 0xFF);
    }

    #[test]
    fn test_eeprom_falls_back_to_bytes() {
        let db = PartDatabase::builtin().unwrap();
        let part = db.find("m328p").unwrap();
        let eeprom = part.eeprom().unwrap();
        let mut pgm = programmer(SimAvr::new());
        let err = pgm.paged_write(part, eeprom, 4, 0, &[1, 2, 3, 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_bitclock_sets_half_rate_baud() {
        let mut pgm = programmer(SimAvr::new());
        assert_eq!(pgm.baud, 75_000);
        pgm.set_sck_period(1.0 / 100_000.0).unwrap();
        assert_eq!(pgm.link().baud, 50_000);
    }

    #[test]
    fn test_pin_overrides() {
        let mut config = Ft245rConfig::default();
        assert!(!config
            .apply_extparams(&["reset=~3".into(), "pgmled=6".into()])
            .unwrap());
        assert_eq!(config.pins.get(Pin::Reset).to_string(), "~3");
        assert_eq!(config.pins.get(Pin::LedPgm).mask(), 0x40);
        assert!(config.apply_extparams(&["help".into()]).unwrap());
        assert!(config.apply_extparams(&["sdo=0".into()]).is_err());
        assert!(config.apply_extparams(&["clk=1".into()]).is_err());
    }
}
