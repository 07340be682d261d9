//! Component A (line-state sampler) and component B (NRZI decoder +
//! bit-destuffer). Both operate on [`crate::codec::LineState`]; the
//! translation from raw differential pins to a `LineState` value is the
//! FPGA I/O buffer glue named as an external collaborator in the spec
//! and is out of scope here (§1 Non-goals).

use crate::codec::LineState;

/// Recovers a bit strobe from a raw 48 MHz line-state sample stream.
/// Free-runs at 4x oversampling and resynchronizes its phase to the most
/// recent line transition, per §4.A.
pub struct LineSampler {
    last: LineState,
    phase: u8,
}

impl LineSampler {
    const OVERSAMPLE: u8 = 4;

    pub fn new() -> Self {
        LineSampler {
            last: LineState::J,
            phase: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed one 48 MHz sample. Returns `(line_state, bit_strobe)`: the
    /// sampled state, and whether this tick is the recovered bit-rate
    /// strobe.
    pub fn tick(&mut self, raw: LineState) -> (LineState, bool) {
        let edge = raw != self.last;
        self.last = raw;
        if edge {
            // realign: the bit is considered recovered one oversample
            // tick after the edge that produced it.
            self.phase = 1;
            return (raw, false);
        }
        self.phase = (self.phase + 1) % Self::OVERSAMPLE;
        (raw, self.phase == 0)
    }
}

impl Default for LineSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of destuffing a single recovered line sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestuffEvent {
    /// The raw line state this sample carried, passed through so the
    /// framer can watch for SE0/SE1 independently of bit decoding.
    pub raw: LineState,

    /// `Some(bit)` if this sample decoded to a live (non-stuffed) data
    /// bit. `None` if the sample was SE0/SE1 (no NRZI bit), or if it was
    /// consumed as a stuff bit.
    pub bit: Option<bool>,

    /// Set if a stuffed position (the bit immediately after six
    /// consecutive 1s) was not 0. The bit is still swallowed.
    pub bitstuff_error: bool,
}

/// NRZI decoder and bit-destuffer (component B). Consumes already
/// bit-strobed line-state samples (the output of [`LineSampler`]).
pub struct Destuffer {
    prev: LineState,
    ones_run: u8,
}

impl Destuffer {
    pub fn new() -> Self {
        Destuffer {
            prev: LineState::J,
            ones_run: 0,
        }
    }

    /// Reset to idle state. Called by the framer when starting a new
    /// packet, and importantly right after SYNC completes so that the
    /// run-length count used for stuffing never includes SYNC's bits
    /// (§6: stuffing applies to every bit between SYNC and EOP, SYNC
    /// itself is exempt).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn step(&mut self, raw: LineState) -> DestuffEvent {
        match raw {
            LineState::Se0 | LineState::Se1 => {
                // Not an NRZI data bit; the framer interprets these
                // directly. Held line state is irrelevant across SE0/SE1
                // since the next J/K redefines the baseline transition.
                self.prev = raw;
                DestuffEvent {
                    raw,
                    bit: None,
                    bitstuff_error: false,
                }
            }
            j_or_k => {
                let bit = self.prev == j_or_k;
                self.prev = j_or_k;

                if self.ones_run == 6 {
                    self.ones_run = 0;
                    DestuffEvent {
                        raw,
                        bit: None,
                        bitstuff_error: bit,
                    }
                } else {
                    if bit {
                        self.ones_run += 1;
                    } else {
                        self.ones_run = 0;
                    }
                    DestuffEvent {
                        raw,
                        bit: Some(bit),
                        bitstuff_error: false,
                    }
                }
            }
        }
    }
}

impl Default for Destuffer {
    fn default() -> Self {
        Self::new()
    }
}
