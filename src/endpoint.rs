//! Component G: the per-endpoint state table consulted and mutated by
//! the transaction FSM, and written to / read from across the
//! software boundary by [`crate::controller::Controller`].

use std::collections::{HashMap, VecDeque};

use crate::error::UsbCoreError;

/// Transfer direction an endpoint address is wired for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    Out,
    In,
    /// Expands to two independent table entries at configuration time:
    /// `epnum<<1|0` (OUT) and `epnum<<1|1` (IN), each with its own
    /// response/dtb/pending state, matching a control endpoint's
    /// simultaneous OUT (SETUP/OUT) and IN (IN) halves.
    BiDir,
}

/// The handshake an endpoint answers a transaction with, absent the
/// pending-overrides-ACK adjustment applied by [`EndpointTable::effective_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EndpointResponse {
    Ack,
    Nak,
    Stall,
}

/// Software-supplied configuration for one logical endpoint number.
/// `Default` yields a single bidirectional control endpoint 0, per the
/// model's minimum viable wiring.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub epnum: u8,
    pub direction: Direction,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            epnum: 0,
            direction: Direction::BiDir,
        }
    }
}

/// `epaddr = epnum<<1 | dir`, `dir` 1 for IN, 0 for OUT/control.
pub fn epaddr(epnum: u8, dir_in: bool) -> u8 {
    (epnum << 1) | (dir_in as u8)
}

#[derive(Debug)]
struct EndpointState {
    direction: Direction,
    response: EndpointResponse,
    dtb: bool,
    pending: bool,
    /// One-cycle pulse asserted by the FSM at commit; promoted into
    /// `pending` by the next call to [`EndpointTable::advance`], which
    /// the controller drives once per `usb_12` tick. Never observed
    /// `true` by software -- it lives entirely between two controller
    /// ticks.
    trigger: bool,
    /// IN: bytes queued by software, drained by the FSM/TX pipeline as
    /// they're transmitted.
    tx: VecDeque<u8>,
    /// OUT: the most recent packet's payload, CRC16 stripped, held
    /// until software reads it with [`EndpointTable::expect_data`].
    rx: Vec<u8>,
}

impl EndpointState {
    fn new(direction: Direction) -> Self {
        EndpointState {
            direction,
            response: EndpointResponse::Nak,
            dtb: false,
            pending: false,
            trigger: false,
            tx: VecDeque::new(),
            rx: Vec::new(),
        }
    }
}

/// The full set of configured endpoints, indexed by `epaddr`.
pub struct EndpointTable {
    entries: HashMap<u8, EndpointState>,
}

impl EndpointTable {
    pub fn new(configs: &[EndpointConfig]) -> Self {
        let mut entries = HashMap::new();
        for cfg in configs {
            match cfg.direction {
                Direction::Out => {
                    entries.insert(epaddr(cfg.epnum, false), EndpointState::new(Direction::Out));
                }
                Direction::In => {
                    entries.insert(epaddr(cfg.epnum, true), EndpointState::new(Direction::In));
                }
                Direction::BiDir => {
                    entries.insert(epaddr(cfg.epnum, false), EndpointState::new(Direction::Out));
                    entries.insert(epaddr(cfg.epnum, true), EndpointState::new(Direction::In));
                }
            }
        }
        EndpointTable { entries }
    }

    fn get(&self, epaddr: u8) -> Result<&EndpointState, UsbCoreError> {
        self.entries
            .get(&epaddr)
            .ok_or(UsbCoreError::UnknownEndpoint { epaddr })
    }

    fn get_mut(&mut self, epaddr: u8) -> Result<&mut EndpointState, UsbCoreError> {
        self.entries
            .get_mut(&epaddr)
            .ok_or(UsbCoreError::UnknownEndpoint { epaddr })
    }

    pub fn exists(&self, epaddr: u8) -> bool {
        self.entries.contains_key(&epaddr)
    }

    pub fn direction(&self, epaddr: u8) -> Result<Direction, UsbCoreError> {
        Ok(self.get(epaddr)?.direction)
    }

    pub fn response(&self, epaddr: u8) -> Result<EndpointResponse, UsbCoreError> {
        Ok(self.get(epaddr)?.response)
    }

    pub fn set_response(
        &mut self,
        epaddr: u8,
        response: EndpointResponse,
    ) -> Result<(), UsbCoreError> {
        self.get_mut(epaddr)?.response = response;
        Ok(())
    }

    /// The response the FSM actually acts on for the next transaction:
    /// a configured ACK is downgraded to NAK while a prior trigger is
    /// still unacknowledged by software, so the host retries rather
    /// than the core silently accepting data software hasn't drained
    /// yet (or re-sending data it has already consumed).
    pub fn effective_response(&self, epaddr: u8) -> Result<EndpointResponse, UsbCoreError> {
        let ep = self.get(epaddr)?;
        Ok(if ep.pending && ep.response == EndpointResponse::Ack {
            EndpointResponse::Nak
        } else {
            ep.response
        })
    }

    pub fn dtb(&self, epaddr: u8) -> Result<bool, UsbCoreError> {
        Ok(self.get(epaddr)?.dtb)
    }

    pub fn set_dtb(&mut self, epaddr: u8, value: bool) -> Result<(), UsbCoreError> {
        self.get_mut(epaddr)?.dtb = value;
        Ok(())
    }

    pub fn toggle_dtb(&mut self, epaddr: u8) -> Result<(), UsbCoreError> {
        let ep = self.get_mut(epaddr)?;
        ep.dtb = !ep.dtb;
        Ok(())
    }

    pub fn pending(&self, epaddr: u8) -> Result<bool, UsbCoreError> {
        Ok(self.get(epaddr)?.pending)
    }

    /// Assert `trigger` for `epaddr`: the FSM's side of a commit (§3,
    /// §4.G). `pending` itself only rises on the next [`Self::advance`]
    /// call, one `usb_12` tick later.
    pub fn set_trigger(&mut self, epaddr: u8) -> Result<(), UsbCoreError> {
        self.get_mut(epaddr)?.trigger = true;
        Ok(())
    }

    /// Advance the trigger-to-pending pipeline by one `usb_12` tick:
    /// any endpoint whose `trigger` was asserted on the previous call
    /// has it promoted to `pending` now, and `trigger` is cleared.
    /// Called exactly once per tick by [`crate::controller::Controller`],
    /// regardless of whether that tick also carried an RX/TX event, so
    /// that `trigger` is a true one-cycle pulse (§8 invariant 2).
    pub fn advance(&mut self) {
        for ep in self.entries.values_mut() {
            if ep.trigger {
                ep.pending = true;
                ep.trigger = false;
            }
        }
    }

    pub fn trigger(&self, epaddr: u8) -> Result<bool, UsbCoreError> {
        Ok(self.get(epaddr)?.trigger)
    }

    /// Software's acknowledgement that it has observed the most recent
    /// commit on `epaddr`. Requires `trigger=0` (the commit that set
    /// `pending` must have already been promoted) and `pending=1`
    /// (there must be something to clear) -- both preconditions of the
    /// software-facing contract in §4.G, surfaced as an error rather
    /// than silently ignored so a caller racing the hardware notices.
    pub fn clear_pending(&mut self, epaddr: u8) -> Result<(), UsbCoreError> {
        let ep = self.get(epaddr)?;
        if ep.trigger {
            return Err(UsbCoreError::ClearPendingWhileTriggered { epaddr });
        }
        if !ep.pending {
            return Err(UsbCoreError::ClearPendingNotPending { epaddr });
        }
        self.get_mut(epaddr)?.pending = false;
        Ok(())
    }

    /// Queue bytes for transmission on an IN endpoint. Errors if
    /// `epaddr` is not configured for IN.
    pub fn set_data(&mut self, epaddr: u8, bytes: &[u8]) -> Result<(), UsbCoreError> {
        let ep = self.get_mut(epaddr)?;
        if ep.direction != Direction::In {
            return Err(UsbCoreError::WrongDirection {
                epaddr,
                expected: Direction::In,
            });
        }
        ep.tx.clear();
        ep.tx.extend(bytes.iter().copied());
        Ok(())
    }

    /// Snapshot the bytes currently queued for an IN endpoint, without
    /// consuming them (the FSM reads this when priming the TX
    /// pipeline; the buffer is only cleared on the next `set_data`).
    pub fn peek_tx_data(&self, epaddr: u8) -> Result<Vec<u8>, UsbCoreError> {
        Ok(self.get(epaddr)?.tx.iter().copied().collect())
    }

    /// Commit a successfully received OUT packet's payload (CRC16
    /// already stripped by the caller). Errors if `epaddr` is not
    /// configured for OUT.
    pub fn commit_rx(&mut self, epaddr: u8, bytes: Vec<u8>) -> Result<(), UsbCoreError> {
        let ep = self.get_mut(epaddr)?;
        if ep.direction != Direction::Out {
            return Err(UsbCoreError::WrongDirection {
                epaddr,
                expected: Direction::Out,
            });
        }
        ep.rx = bytes;
        Ok(())
    }

    /// Read back (and clear) the most recently committed OUT payload.
    /// Errors if `epaddr` is not configured for OUT.
    pub fn expect_data(&mut self, epaddr: u8) -> Result<Vec<u8>, UsbCoreError> {
        let ep = self.get_mut(epaddr)?;
        if ep.direction != Direction::Out {
            return Err(UsbCoreError::WrongDirection {
                epaddr,
                expected: Direction::Out,
            });
        }
        Ok(std::mem::take(&mut ep.rx))
    }

    /// Convenience wrapper around [`Self::expect_data`] for scenario
    /// replay and tests: read back the committed payload and assert it
    /// matches `want`, surfacing a mismatch as a catchable error rather
    /// than a panic.
    pub fn expect_data_eq(&mut self, epaddr: u8, want: &[u8]) -> Result<(), UsbCoreError> {
        let got = self.expect_data(epaddr)?;
        if got == want {
            Ok(())
        } else {
            Err(UsbCoreError::ExpectDataMismatch {
                epaddr,
                want: want.len(),
                got: got.len(),
            })
        }
    }

    /// Reset every endpoint to its power-on defaults (NAK, DATA0,
    /// no pending trigger, empty buffers), keeping the configured set
    /// of endpoints and their directions. Used by `Controller::bus_reset`.
    pub fn reset_all(&mut self) {
        for ep in self.entries.values_mut() {
            ep.response = EndpointResponse::Nak;
            ep.dtb = false;
            ep.pending = false;
            ep.trigger = false;
            ep.tx.clear();
            ep.rx.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> EndpointTable {
        EndpointTable::new(&[EndpointConfig {
            epnum: 0,
            direction: Direction::BiDir,
        }])
    }

    #[test]
    fn bidir_expands_to_independent_entries() {
        let mut t = table();
        assert!(t.exists(epaddr(0, false)));
        assert!(t.exists(epaddr(0, true)));
        t.set_response(epaddr(0, false), EndpointResponse::Stall).unwrap();
        // OUT and IN halves of a BiDir endpoint are independent table
        // entries; mutating one must not affect the other.
        assert_eq!(t.response(epaddr(0, true)).unwrap(), EndpointResponse::Nak);
        assert_eq!(t.response(epaddr(0, false)).unwrap(), EndpointResponse::Stall);
    }

    #[test]
    fn pending_overrides_ack() {
        let mut t = table();
        let ea = epaddr(0, true);
        t.set_response(ea, EndpointResponse::Ack).unwrap();
        t.set_trigger(ea).unwrap();
        // trigger is a same-tick pulse; pending only rises on the next
        // tick, i.e. after `advance` runs.
        assert!(!t.pending(ea).unwrap());
        assert_eq!(t.effective_response(ea).unwrap(), EndpointResponse::Ack);
        t.advance();
        assert!(t.pending(ea).unwrap());
        assert_eq!(t.effective_response(ea).unwrap(), EndpointResponse::Nak);
        t.clear_pending(ea).unwrap();
        assert_eq!(t.effective_response(ea).unwrap(), EndpointResponse::Ack);
    }

    #[test]
    fn clear_pending_requires_trigger_clear_and_something_pending() {
        let mut t = table();
        let ea = epaddr(0, true);
        assert!(matches!(
            t.clear_pending(ea),
            Err(UsbCoreError::ClearPendingNotPending { .. })
        ));
        t.set_trigger(ea).unwrap();
        assert!(matches!(
            t.clear_pending(ea),
            Err(UsbCoreError::ClearPendingWhileTriggered { .. })
        ));
        t.advance();
        t.clear_pending(ea).unwrap();
    }

    #[test]
    fn set_data_on_out_endpoint_errors() {
        let mut t = table();
        let err = t.set_data(epaddr(0, false), &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, UsbCoreError::WrongDirection { .. }));
    }

    #[test]
    fn unknown_endpoint_errors() {
        let t = table();
        assert!(matches!(
            t.response(epaddr(5, false)),
            Err(UsbCoreError::UnknownEndpoint { .. })
        ));
    }
}
