//! Component E: the packet encoder / transmitter.
//!
//! The reference hardware pulls payload bytes from the endpoint FIFO one
//! at a time with a `data_valid`/`data_get` handshake, since the FIFO
//! might not have its next byte ready yet. In this behavioral model the
//! endpoint buffer (`crate::endpoint`) is already a fully materialized
//! `VecDeque`, so nothing is lost by handing the encoder the whole
//! payload up front at `start()` and precomputing the entire
//! SYNC..EOP bitstream as a queue of line states that `tick()` then
//! drains one recovered-bit-time at a time -- the same externally
//! observable timing (`oe` high from SYNC through EOP, one state per
//! tick, `pkt_end` on the last EOP sample) without a generator.

use std::collections::VecDeque;

use crate::codec::{bit_stuff, crc16, nrzi_encode, LineState, Pid};

const SYNC_BITS: [bool; 8] = [false, false, false, false, false, false, false, true];

/// What follows the PID byte for a given packet, mirroring §6's three
/// packet shapes.
#[derive(Debug, Clone)]
pub enum TxPayload {
    /// Handshake packets carry nothing past the PID.
    None,
    /// Token packets carry an 11-bit `{endp, addr}` field plus CRC5.
    Token { addr: u8, endp: u8 },
    /// Data packets carry the payload bytes plus a trailing CRC16.
    Data { bytes: Vec<u8> },
}

fn byte_bits(byte: u8) -> [bool; 8] {
    let mut out = [false; 8];
    for i in 0..8 {
        out[i] = (byte >> i) & 1 == 1;
    }
    out
}

/// One tick's worth of transmitter output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxTick {
    pub state: LineState,
    pub oe: bool,
    /// Set on the tick carrying the final EOP sample.
    pub pkt_end: bool,
}

pub struct TxPipeline {
    queue: VecDeque<LineState>,
}

impl TxPipeline {
    pub fn new() -> Self {
        TxPipeline {
            queue: VecDeque::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Begin transmitting a packet: SYNC, PID (+ complement), the
    /// payload fields appropriate to `payload`, bit-stuffed and
    /// NRZI-encoded, followed by EOP (`SE0 SE0 J`).
    pub fn start(&mut self, pid: Pid, payload: TxPayload) {
        use bitvec::prelude::*;

        let mut logical = BitVec::new();
        for b in byte_bits(pid.encode_byte()) {
            logical.push(b);
        }

        match payload {
            TxPayload::None => {}
            TxPayload::Token { addr, endp } => {
                let field: u16 = (addr as u16 & 0x7F) | ((endp as u16 & 0xF) << 7);
                for i in 0..11 {
                    logical.push((field >> i) & 1 == 1);
                }
                let crc = crate::codec::crc5(field, 11);
                for i in 0..5 {
                    logical.push((crc >> i) & 1 == 1);
                }
            }
            TxPayload::Data { bytes } => {
                for &byte in &bytes {
                    for b in byte_bits(byte) {
                        logical.push(b);
                    }
                }
                let crc = crc16(&bytes);
                for b in byte_bits((crc & 0xFF) as u8) {
                    logical.push(b);
                }
                for b in byte_bits((crc >> 8) as u8) {
                    logical.push(b);
                }
            }
        }

        let stuffed = bit_stuff(&logical);
        let mut full = BitVec::new();
        for b in SYNC_BITS {
            full.push(b);
        }
        full.extend_from_bitslice(&stuffed);

        self.queue = nrzi_encode(&full).into_iter().collect();
        self.queue.push_back(LineState::Se0);
        self.queue.push_back(LineState::Se0);
        self.queue.push_back(LineState::J);
    }

    /// Advance one recovered-bit tick. When idle, the line floats at
    /// `J` with `oe` deasserted.
    pub fn tick(&mut self) -> TxTick {
        match self.queue.pop_front() {
            Some(state) => TxTick {
                state,
                oe: true,
                pkt_end: self.queue.is_empty(),
            },
            None => TxTick {
                state: LineState::J,
                oe: false,
                pkt_end: false,
            },
        }
    }
}

impl Default for TxPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nrzi::Destuffer;

    fn drain(tx: &mut TxPipeline) -> Vec<LineState> {
        let mut out = Vec::new();
        loop {
            let t = tx.tick();
            if !t.oe {
                break;
            }
            out.push(t.state);
            if t.pkt_end {
                break;
            }
        }
        out
    }

    #[test]
    fn handshake_asserts_oe_through_eop() {
        let mut tx = TxPipeline::new();
        tx.start(Pid::Ack, TxPayload::None);
        let states = drain(&mut tx);
        // SYNC(8) + PID(16, stuffed unlikely to add bits here) + EOP(3)
        assert!(states.len() >= 8 + 16 + 3);
        assert_eq!(states[states.len() - 3..], [LineState::Se0, LineState::Se0, LineState::J]);
        assert!(tx.tick().oe == false);
    }

    #[test]
    fn bit_stuffing_on_transmit_inserts_after_six_ones() {
        // A byte ending in two 0 bits (wire LSB-first) followed by a
        // byte of 0x3F (six 1 bits LSB-first) reproduces the scenario
        // from §8(g): six consecutive 1s straddling/within payload
        // bytes, forcing a stuff bit.
        let mut tx = TxPipeline::new();
        tx.start(
            Pid::Data0,
            TxPayload::Data {
                bytes: vec![0x00, 0x3F],
            },
        );
        let states = drain(&mut tx);

        // Feed the whole transmission through the destuffer/NRZI decode
        // path to recover the logical (unstuffed) bitstream and confirm
        // it matches PID + 0x00 + 0x3F + CRC16, i.e. the stuff bit was
        // inserted and is transparently removed on the receive side.
        let mut d = Destuffer::new();
        let mut bits = Vec::new();
        // skip SYNC's 8 samples; destuffer should not be primed with
        // them (mirrors RxPipeline resetting the destuffer after SYNC).
        for &s in &states[8..states.len() - 3] {
            let ev = d.step(s);
            if let Some(b) = ev.bit {
                bits.push(b);
            }
        }
        let mut recovered_bytes = Vec::new();
        for chunk in bits.chunks(8) {
            if chunk.len() < 8 {
                break;
            }
            let mut byte = 0u8;
            for (i, &b) in chunk.iter().enumerate() {
                byte |= (b as u8) << i;
            }
            recovered_bytes.push(byte);
        }
        assert_eq!(recovered_bytes[0], Pid::Data0.encode_byte());
        assert_eq!(recovered_bytes[1], 0x00);
        assert_eq!(recovered_bytes[2], 0x3F);
        let crc = crc16(&[0x00, 0x3F]);
        assert_eq!(recovered_bytes[3], (crc & 0xFF) as u8);
        assert_eq!(recovered_bytes[4], (crc >> 8) as u8);
    }
}
