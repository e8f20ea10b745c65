//! Request pipeliner for bit-bang adapters
//!
//! Paged reads and writes are sent as fragments of up to
//! [`INSTRS_PER_FRAGMENT`](super::bitbang::INSTRS_PER_FRAGMENT) instructions.
//! The samples for each fragment are collected later, in the same order the
//! fragments were sent, so the adapter never runs dry while the host decodes.

use std::collections::VecDeque;

use super::bitbang::{BitShifter, BitbangLink, REQ_OUTSTANDINGS};
use crate::error::Result;

/// One outstanding fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Index in the destination buffer of the first decoded byte
    pub addr: usize,
    /// Host bytes sent for this fragment
    pub bytes: usize,
    /// Instructions in the fragment; one decoded byte each
    pub n: usize,
}

/// In-order queue of outstanding fragments with a bounded window
#[derive(Debug)]
pub struct RequestPipeline {
    queue: VecDeque<Request>,
    window: usize,
    rx: Vec<u8>,
}

impl Default for RequestPipeline {
    fn default() -> Self {
        Self::new(REQ_OUTSTANDINGS)
    }
}

impl RequestPipeline {
    /// Create a pipeline allowing `window` outstanding fragments
    pub fn new(window: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(window + 1),
            window: window.max(1),
            rx: Vec::new(),
        }
    }

    /// Number of outstanding fragments
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Record a fragment that has just been sent
    ///
    /// If the window is full, the oldest fragment is retired first.
    pub fn enqueue<L: BitbangLink + ?Sized>(
        &mut self,
        link: &mut L,
        shifter: &BitShifter,
        dest: &mut [u8],
        req: Request,
    ) -> Result<()> {
        if self.queue.len() >= self.window {
            self.retire(link, shifter, dest)?;
        }
        self.queue.push_back(req);
        Ok(())
    }

    /// Collect the samples of the oldest fragment
    ///
    /// The reply byte of each instruction is its fourth byte. Returns
    /// `false` if nothing was outstanding.
    pub fn retire<L: BitbangLink + ?Sized>(
        &mut self,
        link: &mut L,
        shifter: &BitShifter,
        dest: &mut [u8],
    ) -> Result<bool> {
        let Some(req) = self.queue.pop_front() else {
            return Ok(false);
        };
        self.rx.resize(req.bytes, 0);
        link.recv(&mut self.rx)?;
        for j in 0..req.n {
            if let Some(slot) = dest.get_mut(req.addr + j) {
                *slot = shifter.extract_byte(&self.rx, j * 4 + 3);
            }
        }
        Ok(true)
    }

    /// Retire everything outstanding
    pub fn drain<L: BitbangLink + ?Sized>(
        &mut self,
        link: &mut L,
        shifter: &BitShifter,
        dest: &mut [u8],
    ) -> Result<()> {
        while self.retire(link, shifter, dest)? {}
        Ok(())
    }

    /// Forget outstanding fragments after an error
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::super::bitbang::{Pin, PinDef, PinMap, CYCLES, INSTR_BYTES};
    use super::*;

    /// Adapter loopback that answers each instruction with its address byte
    struct EchoAvr {
        pins: PinMap,
        pending: VecDeque<Vec<u8>>,
        recvs: usize,
    }

    impl EchoAvr {
        fn new(pins: PinMap) -> Self {
            Self {
                pins,
                pending: VecDeque::new(),
                recvs: 0,
            }
        }

        fn sdo(&self, b: u8) -> bool {
            b & self.pins.get(Pin::Sdo).mask() != 0
        }
    }

    impl BitbangLink for EchoAvr {
        fn send(&mut self, buf: &[u8]) -> Result<()> {
            let sdi = self.pins.get(Pin::Sdi).mask();
            let mut rx = vec![0u8; buf.len()];
            for instr in 0..buf.len() / INSTR_BYTES {
                let base = instr * INSTR_BYTES;
                // byte 2 of the instruction as clocked in on the rising edges
                let mut lo = 0u8;
                for j in 0..8 {
                    if self.sdo(buf[base + 2 * 8 * CYCLES + j * CYCLES + 1]) {
                        lo |= 0x80 >> j;
                    }
                }
                for j in 0..8 {
                    if lo & (0x80 >> j) != 0 {
                        rx[base + 3 * 8 * CYCLES + CYCLES + j * CYCLES] |= sdi;
                    }
                }
            }
            self.pending.push_back(rx);
            Ok(())
        }

        fn send_and_discard(&mut self, _buf: &[u8]) -> Result<()> {
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<()> {
            self.recvs += 1;
            let rx = self.pending.pop_front().unwrap();
            buf.copy_from_slice(&rx[..buf.len()]);
            Ok(())
        }

        fn read_pins(&mut self) -> Result<u8> {
            Ok(0)
        }

        fn sleep_us(&mut self, _us: u64) -> Result<()> {
            Ok(())
        }
    }

    fn pins() -> PinMap {
        PinMap::default()
            .with(Pin::Sck, PinDef::on(0))
            .with(Pin::Sdi, PinDef::on(1))
            .with(Pin::Sdo, PinDef::on(2))
            .with(Pin::Reset, PinDef::on(4))
    }

    #[test]
    fn test_window_forces_retire_in_order() {
        let mut link = EchoAvr::new(pins());
        let mut shifter = BitShifter::new(pins());
        let mut pipe = RequestPipeline::new(2);
        let mut dest = vec![0u8; 12];

        for frag in 0..3usize {
            let mut buf = Vec::new();
            for i in 0..4 {
                let addr = (frag * 4 + i) as u8;
                shifter.push_byte(&mut buf, 0x20);
                shifter.push_byte(&mut buf, 0);
                shifter.push_byte(&mut buf, addr);
                shifter.push_byte(&mut buf, 0);
            }
            shifter.push_stretch(&mut buf);
            link.send(&buf).unwrap();
            let req = Request {
                addr: frag * 4,
                bytes: buf.len(),
                n: 4,
            };
            pipe.enqueue(&mut link, &shifter, &mut dest, req).unwrap();
            assert!(pipe.len() <= 2);
        }
        assert_eq!(link.recvs, 1);
        pipe.drain(&mut link, &shifter, &mut dest).unwrap();
        assert!(pipe.is_empty());
        assert_eq!(dest, (0..12).collect::<Vec<u8>>());
    }

    #[test]
    fn test_retire_empty() {
        let mut link = EchoAvr::new(pins());
        let shifter = BitShifter::new(pins());
        let mut pipe = RequestPipeline::default();
        assert!(!pipe.retire(&mut link, &shifter, &mut []).unwrap());
    }
}
