//! Frame layer of the JTAG ICE mkII protocol
//!
//! ```text
//! 0x1B | seq (LE16) | length (LE32) | 0x0E | payload | crc (LE16)
//! ```
//!
//! The CRC covers everything before it. Sequence number 0xFFFF is reserved
//! for events the ICE sends on its own (breakpoints, target power changes).

use std::time::{Duration, Instant};

use crate::error::{JtagError, Result};
use crate::protocol::{crc16, EVENT_SEQ, MAX_MESSAGE, MESSAGE_START, TOKEN};
use crate::transport::Transport;

/// Default time budget for one exchange
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(100);

/// A received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number
    pub seq: u16,
    /// Payload, starting with the response code
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    SeqLo,
    SeqHi,
    Len(u8),
    Token,
    Data,
    CsumLo,
    CsumHi,
}

/// Builds, sends and receives frames over a [`Transport`]
pub struct Framer<T: Transport> {
    transport: T,
    seq: u16,
    rx: Vec<u8>,
    rx_pos: usize,
}

impl<T: Transport> Framer<T> {
    /// Wrap a transport, starting at sequence number 0
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            seq: 0,
            rx: Vec::new(),
            rx_pos: 0,
        }
    }

    /// Sequence number of the next command
    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Discard buffered and pending input
    pub fn drain(&mut self) -> Result<()> {
        self.rx.clear();
        self.rx_pos = 0;
        self.transport.drain()
    }

    /// Encode a frame carrying `payload` with sequence number `seq`
    pub fn encode(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(payload.len() + 10);
        buf.push(MESSAGE_START);
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.push(TOKEN);
        buf.extend_from_slice(payload);
        let crc = crc16(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Send `payload` with the current sequence number
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        log::trace!(
            "jtagmkii: send seq {} [{}]",
            self.seq,
            payload.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
        );
        let frame = Self::encode(self.seq, payload);
        self.transport.write(&frame)
    }

    fn next_byte(&mut self, deadline: Instant) -> Result<u8> {
        while self.rx_pos >= self.rx.len() {
            let now = Instant::now();
            if now >= deadline {
                return Err(JtagError::Timeout);
            }
            let mut buf = [0u8; 64];
            let n = self.transport.read_timeout(&mut buf, deadline - now)?;
            self.rx.clear();
            self.rx.extend_from_slice(&buf[..n]);
            self.rx_pos = 0;
        }
        let b = self.rx[self.rx_pos];
        self.rx_pos += 1;
        Ok(b)
    }

    /// Receive one frame
    ///
    /// Returns `None` for a frame whose declared length exceeds
    /// [`MAX_MESSAGE`]; its payload is drained and dropped.
    pub fn recv_frame(&mut self, deadline: Instant) -> Result<Option<Frame>> {
        let mut state = State::Start;
        let mut header = Vec::with_capacity(8);
        let mut seq: u16 = 0;
        let mut len: u32 = 0;
        let mut payload = Vec::new();
        let mut crc_lo = 0u8;

        loop {
            let c = self.next_byte(deadline)?;
            state = match state {
                State::Start if c == MESSAGE_START => {
                    header.clear();
                    header.push(c);
                    State::SeqLo
                }
                State::Start => State::Start,
                State::SeqLo => {
                    header.push(c);
                    seq = u16::from(c);
                    State::SeqHi
                }
                State::SeqHi => {
                    header.push(c);
                    seq |= u16::from(c) << 8;
                    len = 0;
                    State::Len(0)
                }
                State::Len(i) => {
                    header.push(c);
                    len |= u32::from(c) << (8 * i);
                    if i < 3 {
                        State::Len(i + 1)
                    } else {
                        State::Token
                    }
                }
                State::Token if c == TOKEN => {
                    header.push(c);
                    if len as usize > MAX_MESSAGE {
                        log::warn!(
                            "jtagmkii: frame of {} bytes exceeds {}, dropping it",
                            len,
                            MAX_MESSAGE
                        );
                        for _ in 0..len as usize + 2 {
                            self.next_byte(deadline)?;
                        }
                        return Ok(None);
                    }
                    payload = Vec::with_capacity(len as usize);
                    if len == 0 {
                        State::CsumLo
                    } else {
                        State::Data
                    }
                }
                State::Token => State::Start,
                State::Data => {
                    payload.push(c);
                    if payload.len() == len as usize {
                        State::CsumLo
                    } else {
                        State::Data
                    }
                }
                State::CsumLo => {
                    crc_lo = c;
                    State::CsumHi
                }
                State::CsumHi => {
                    let received = u16::from_le_bytes([crc_lo, c]);
                    header.extend_from_slice(&payload);
                    let computed = crc16(&header);
                    if computed != received {
                        return Err(JtagError::BadCrc { computed, received });
                    }
                    log::trace!(
                        "jtagmkii: recv seq {} [{}]",
                        seq,
                        payload.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
                    );
                    return Ok(Some(Frame { seq, payload }));
                }
            };
        }
    }

    /// Receive the response to the last command
    ///
    /// Events and frames with another sequence number are skipped. The
    /// sequence number advances once the matching frame arrives.
    pub fn recv(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        loop {
            let Some(frame) = self.recv_frame(deadline)? else {
                continue;
            };
            if frame.seq == EVENT_SEQ {
                log::debug!(
                    "jtagmkii: event 0x{:02x} ignored",
                    frame.payload.first().copied().unwrap_or(0)
                );
                continue;
            }
            if frame.seq != self.seq {
                log::info!(
                    "jtagmkii: got wrong sequence number, {} != {}",
                    frame.seq,
                    self.seq
                );
                continue;
            }
            self.seq = self.seq.wrapping_add(1);
            if self.seq == EVENT_SEQ {
                self.seq = 0;
            }
            return Ok(frame.payload);
        }
    }

    /// Send a command and wait for its response within `timeout`
    pub fn round_trip(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        self.send(payload)?;
        self.recv(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::Loopback;

    fn framer_with(input: &[u8]) -> Framer<Loopback> {
        let mut lb = Loopback::default();
        lb.input.extend(input);
        Framer::new(lb)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(10)
    }

    #[test]
    fn test_send_layout() {
        let mut f = framer_with(&[]);
        f.send(&[0xA5]).unwrap();
        let w = &f.transport().written;
        assert_eq!(&w[..9], &[0x1B, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x0E, 0xA5]);
        let crc = crc16(&w[..9]);
        assert_eq!(&w[9..], &crc.to_le_bytes());
    }

    #[test]
    fn test_round_trip_skips_events_and_stale_frames() {
        let mut input = Framer::<Loopback>::encode(EVENT_SEQ, &[0xE0, 0x01]);
        input.extend(Framer::<Loopback>::encode(7, &[0x80]));
        input.extend([0x00, 0x42]);
        input.extend(Framer::<Loopback>::encode(0, &[0x81, 0x12]));
        let mut f = framer_with(&input);
        assert_eq!(f.round_trip(&[0x03, 0x01], DEFAULT_TIMEOUT).unwrap(), vec![0x81, 0x12]);
        assert_eq!(f.seq(), 1);
    }

    #[test]
    fn test_bad_crc() {
        let mut input = Framer::<Loopback>::encode(0, &[0x80]);
        let last = input.len() - 1;
        input[last] ^= 0xFF;
        let mut f = framer_with(&input);
        assert!(matches!(f.recv(soon()), Err(JtagError::BadCrc { .. })));
    }

    #[test]
    fn test_timeout_on_partial_frame() {
        let input = Framer::<Loopback>::encode(0, &[0x80, 1, 2, 3]);
        let mut f = framer_with(&input[..6]);
        assert!(matches!(f.recv(soon()), Err(JtagError::Timeout)));
    }

    #[test]
    fn test_sequence_wraps_before_event_number() {
        let mut input = Vec::new();
        input.extend(Framer::<Loopback>::encode(0xFFFE, &[0x80]));
        input.extend(Framer::<Loopback>::encode(0, &[0x80]));
        let mut f = framer_with(&input);
        f.seq = 0xFFFE;
        f.recv(soon()).unwrap();
        assert_eq!(f.seq(), 0);
        f.recv(soon()).unwrap();
        assert_eq!(f.seq(), 1);
    }

    #[test]
    fn test_oversized_frame_dropped() {
        let len = (MAX_MESSAGE + 1) as u32;
        let mut input = vec![0x1B, 0x00, 0x00];
        input.extend(len.to_le_bytes());
        input.push(0x0E);
        input.extend(std::iter::repeat(0u8).take(len as usize + 2));
        input.extend(Framer::<Loopback>::encode(0, &[0x80]));
        let mut f = framer_with(&input);
        assert_eq!(f.recv(Instant::now() + Duration::from_secs(5)).unwrap(), vec![0x80]);
    }

    #[test]
    fn test_garbage_before_start_is_skipped() {
        let mut input = vec![0x00, 0x0E, 0x1B, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x55];
        input.extend(Framer::<Loopback>::encode(0, &[0x80]));
        let mut f = framer_with(&input);
        assert_eq!(f.recv(soon()).unwrap(), vec![0x80]);
    }
}
