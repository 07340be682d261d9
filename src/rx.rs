//! Component C (packet framer) and component D (packet decoder), wired
//! together the way the teacher keeps its header-framing and
//! byte-decoding in one `Decoder`/`DecoderState` pair: the framer's
//! state *is* the decoder's state, since nothing downstream of SYNC can
//! be decoded independently of knowing whether a packet is active.

use crate::codec::{crc16_check, crc5_check, LineState, Pid, PidCategory};
use crate::nrzi::Destuffer;

/// A fully decoded packet header, emitted once enough of the packet has
/// arrived to dispatch it (§4.F: immediately after the PID byte for
/// DATA/HANDSHAKE, after the token fields for TOKEN).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedHeader {
    pub pid_nibble: u8,
    pub pid: Option<Pid>,
    pub pid_ok: bool,
    pub category: PidCategory,
    pub addr: Option<u8>,
    pub endp: Option<u8>,
    pub token_payload: Option<u16>,
}

/// One observable event produced by the RX pipeline on a given tick.
/// Several may fire on the same tick (e.g. `Decoded` and `PktEnd` for a
/// zero-field handshake whose EOP immediately follows the PID byte).
#[derive(Debug, Clone, PartialEq)]
pub enum RxEvent {
    PktStart,
    Decoded(DecodedHeader),
    DataStrobe(u8),
    PktEnd { pkt_good: bool },
}

#[derive(Debug, Clone)]
enum State {
    Idle,
    /// Shift register search for the 8-bit SYNC pattern `00000001`.
    SyncSearch { shreg: u8, count: u8 },
    Pid { shreg: u8, count: u8 },
    /// Token fields: 11 bits of payload followed by 5 bits of CRC5.
    TokenFields { value: u32, count: u8, header: PartialHeader },
    /// Data payload: accumulated byte-at-a-time until EOP arrives.
    DataBytes {
        cur: u8,
        bits: u8,
        bytes: Vec<u8>,
        header: PartialHeader,
    },
    /// PID-only packets (handshake, or any category with no further
    /// fields) waiting purely for EOP.
    AwaitEop { header: PartialHeader },
}

#[derive(Debug, Clone, Copy)]
struct PartialHeader {
    pid_nibble: u8,
    pid: Option<Pid>,
    pid_ok: bool,
    category: PidCategory,
}

/// Packet framer + decoder (components C and D).
pub struct RxPipeline {
    state: State,
    destuff: Destuffer,
    se0_run: u8,
    bitstuff_error_seen: bool,
    active: bool,
}

impl RxPipeline {
    pub fn new() -> Self {
        RxPipeline {
            state: State::Idle,
            destuff: Destuffer::new(),
            se0_run: 0,
            bitstuff_error_seen: false,
            active: false,
        }
    }

    /// Whether the pipeline currently considers a packet in progress
    /// (from the clock after SYNC completes until EOP). Exposed as
    /// `pkt_active` in §4.C.
    pub fn pkt_active(&self) -> bool {
        self.active
    }

    /// Hard reset, used by the controller whenever the transmitter
    /// asserts output-enable (to avoid decoding our own loopback).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn start_packet(&mut self) {
        self.destuff.reset();
        self.se0_run = 0;
        self.bitstuff_error_seen = false;
        self.active = true;
        self.state = State::Pid { shreg: 0, count: 0 };
    }

    fn abort_to_idle(&mut self) {
        self.destuff.reset();
        self.se0_run = 0;
        self.active = false;
        self.state = State::Idle;
    }

    /// Feed one recovered (bit-strobed) line sample. Returns whatever
    /// events this tick produced, in order.
    pub fn tick(&mut self, raw: LineState) -> Vec<RxEvent> {
        let mut events = Vec::new();

        if raw == LineState::Se1 {
            // Never legitimate; treated as a line error (§7).
            self.abort_to_idle();
            return events;
        }

        // EOP watch runs independent of decode sub-state once a packet
        // is active, and also continues through dribble per the
        // conservative interpretation of the spec's open question on
        // bit-stuff-during-dribble.
        if self.active {
            if raw == LineState::Se0 {
                self.se0_run += 1;
                return events;
            } else if self.se0_run >= 2 {
                // SE0 SE0 <non-SE0> observed: EOP.
                let pkt_good = self.finish_packet(&mut events);
                events.push(RxEvent::PktEnd { pkt_good });
                self.abort_to_idle();
                return events;
            } else {
                self.se0_run = 0;
            }
        } else if raw == LineState::Se0 {
            // SE0 before SYNC completes (IDLE or mid SYNC_SEARCH) is
            // spurious or an incomplete SYNC: return to IDLE without
            // emitting pkt_start (§4.C).
            self.abort_to_idle();
            return events;
        }

        let destuff_ev = self.destuff.step(raw);
        if destuff_ev.bitstuff_error {
            self.bitstuff_error_seen = true;
        }
        let bit = match destuff_ev.bit {
            Some(b) => b,
            None => return events, // stuffed bit swallowed, or SE0/SE1 (handled above)
        };

        match &mut self.state {
            State::Idle => {
                self.state = State::SyncSearch { shreg: bit as u8, count: 1 };
            }
            State::SyncSearch { shreg, count } => {
                *shreg = (*shreg << 1) | (bit as u8);
                *count = count.saturating_add(1);
                if *count >= 8 {
                    if *shreg == 0b0000_0001 {
                        self.start_packet();
                        events.push(RxEvent::PktStart);
                    } else {
                        // SYNC never completed; stay searching from
                        // scratch rather than losing incoming bits.
                        self.state = State::Idle;
                    }
                }
            }
            State::Pid { shreg, count } => {
                *shreg = (*shreg << 1) | (bit as u8);
                *count += 1;
                if *count == 8 {
                    // Bits arrive LSB-first on the wire; shreg currently
                    // holds them MSB-first (oldest in the high bit), so
                    // reverse to recover the transmitted byte.
                    let byte = shreg.reverse_bits();
                    let (pid, pid_ok) = Pid::decode_byte(byte);
                    let pid_nibble = byte & 0xF;
                    let category = match pid_nibble & 0x3 {
                        0b01 => PidCategory::Token,
                        0b11 => PidCategory::Data,
                        0b10 => PidCategory::Handshake,
                        _ => PidCategory::Special,
                    };
                    let header = PartialHeader {
                        pid_nibble,
                        pid,
                        pid_ok,
                        category,
                    };

                    match category {
                        PidCategory::Token => {
                            self.state = State::TokenFields {
                                value: 0,
                                count: 0,
                                header,
                            };
                        }
                        PidCategory::Data => {
                            events.push(RxEvent::Decoded(DecodedHeader {
                                pid_nibble,
                                pid,
                                pid_ok,
                                category,
                                addr: None,
                                endp: None,
                                token_payload: None,
                            }));
                            self.state = State::DataBytes {
                                cur: 0,
                                bits: 0,
                                bytes: Vec::new(),
                                header,
                            };
                        }
                        PidCategory::Handshake | PidCategory::Special => {
                            events.push(RxEvent::Decoded(DecodedHeader {
                                pid_nibble,
                                pid,
                                pid_ok,
                                category,
                                addr: None,
                                endp: None,
                                token_payload: None,
                            }));
                            self.state = State::AwaitEop { header };
                        }
                    }
                }
            }
            State::TokenFields { value, count, header } => {
                *value |= (bit as u32) << *count;
                *count += 1;
                if *count == 16 {
                    let payload = (*value & 0x7FF) as u16;
                    let crc5_ok = crc5_check(*value as u16, 16);
                    let addr = (payload & 0x7F) as u8;
                    let endp = ((payload >> 7) & 0xF) as u8;
                    let mut header = *header;
                    header.pid_ok = header.pid_ok && crc5_ok;
                    events.push(RxEvent::Decoded(DecodedHeader {
                        pid_nibble: header.pid_nibble,
                        pid: header.pid,
                        pid_ok: header.pid_ok,
                        category: header.category,
                        addr: Some(addr),
                        endp: Some(endp),
                        token_payload: Some(payload),
                    }));
                    self.state = State::AwaitEop { header };
                }
            }
            State::DataBytes { cur, bits, bytes, .. } => {
                *cur |= (bit as u8) << *bits;
                *bits += 1;
                if *bits == 8 {
                    bytes.push(*cur);
                    events.push(RxEvent::DataStrobe(*cur));
                    *cur = 0;
                    *bits = 0;
                }
            }
            State::AwaitEop { .. } => {
                // Dribble bits (up to 6 trailing 1s); nothing to do but
                // wait for EOP, which is detected above from raw state.
            }
        }

        events
    }

    /// Compute `pkt_good` for the packet that just ended, from whichever
    /// sub-state we were in.
    fn finish_packet(&mut self, events: &mut Vec<RxEvent>) -> bool {
        let _ = events;
        if self.bitstuff_error_seen {
            return false;
        }
        match &self.state {
            State::TokenFields { .. } => {
                // EOP arrived before the token's 16 fixed bits were
                // read: malformed, never good.
                false
            }
            State::AwaitEop { header } => match header.category {
                PidCategory::Token => {
                    // A full token always transitions Token -> AwaitEop
                    // once fields complete; by the time we're here the
                    // CRC5 check already happened in TokenFields and was
                    // folded into `pid_ok` there, so re-derive nothing:
                    // treat as good iff pid_ok (carries the crc5 result).
                    header.pid_ok
                }
                PidCategory::Handshake | PidCategory::Special => header.pid_ok,
                PidCategory::Data => unreachable!("data packets end via DataBytes"),
            },
            State::DataBytes { bytes, .. } => bytes.len() >= 2 && crc16_check(bytes),
            _ => false,
        }
    }
}

impl Default for RxPipeline {
    fn default() -> Self {
        Self::new()
    }
}
