//! Component F: the per-transaction state machine that couples the RX
//! and TX pipelines to the endpoint table. One `Fsm` instance drives
//! the single shared bus (the core owns one endpoint table and runs a
//! single active transaction at a time, per §4.F); nothing here ever
//! runs two transactions concurrently.
//!
//! Device address matching is out of scope (§1 Non-goals: "enumeration
//! policy above endpoint-0"), so every token is treated as addressed
//! to this device regardless of its `addr` field.

use crate::codec::{Pid, PidCategory};
use crate::endpoint::{epaddr, EndpointResponse, EndpointTable};
use crate::rx::{DecodedHeader, RxEvent};
use crate::tx::{TxPayload, TxPipeline};

/// The transaction FSM's externally visible state, named after §4.F's
/// state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FsmState {
    WaitToken,
    RecvToken,
    PollResponse,
    WaitData,
    RecvData,
    SendData,
    WaitHand,
    SendHand,
    /// Reached on a protocol violation the core has no recovery path
    /// for at this layer (e.g. a DATA packet with neither DATA0 nor
    /// DATA1 arriving where a handshake was expected). Only cleared by
    /// [`Fsm::reset`], which the controller calls on `bus_reset`.
    Error,
}

#[derive(Debug, Clone, Copy)]
enum TokenKind {
    In,
    Out,
    Setup,
    Sof,
}

struct ActiveTransaction {
    kind: TokenKind,
    /// epaddr this transaction addresses, already resolved to a
    /// concrete OUT or IN entry.
    epaddr: u8,
    data_bytes: Vec<u8>,
}

/// The transaction FSM.
pub struct Fsm {
    state: FsmState,
    txn: Option<ActiveTransaction>,
    /// Decoded token header cached between the token's `Decoded` event
    /// and its closing `PktEnd`, since dispatch needs the latter's
    /// `pkt_good` to know whether the token survived its CRC5 check.
    pending_header: Option<DecodedHeader>,
}

impl Fsm {
    pub fn new() -> Self {
        Fsm {
            state: FsmState::WaitToken,
            txn: None,
            pending_header: None,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    /// Return to `WAIT_TOKEN` unconditionally. The only way out of
    /// `ERROR`, and also used by the controller's `bus_reset`.
    pub fn reset(&mut self) {
        self.state = FsmState::WaitToken;
        self.txn = None;
    }

    fn to_error(&mut self) {
        self.state = FsmState::Error;
        self.txn = None;
    }

    /// Feed one RX pipeline event. `endpoints` and `tx` are mutated as
    /// the transaction progresses (queuing a handshake or data packet
    /// for transmission, committing received data, setting `pending`).
    pub fn on_rx_event(&mut self, event: &RxEvent, endpoints: &mut EndpointTable, tx: &mut TxPipeline) {
        if self.state == FsmState::Error {
            return;
        }

        match (self.state, event) {
            (FsmState::WaitToken, RxEvent::PktStart) => {
                self.state = FsmState::RecvToken;
            }

            (FsmState::RecvToken, RxEvent::Decoded(header)) => {
                if header.category != PidCategory::Token {
                    // A non-token PID where a token was expected: the
                    // packet is simply not for us to act on; let the
                    // framer's own pkt_end drive us back to WAIT_TOKEN.
                    return;
                }
                // Cached via the subsequent PktEnd; nothing to do yet
                // besides remember which header this transaction is.
                self.pending_header = Some(*header);
            }

            (FsmState::RecvToken, RxEvent::PktEnd { pkt_good }) => {
                let header = self.pending_header.take();
                if !pkt_good || header.is_none() {
                    self.state = FsmState::WaitToken;
                    return;
                }
                let header = header.unwrap();
                self.begin_transaction(header, endpoints, tx);
            }

            (FsmState::WaitData, RxEvent::PktStart) => {
                self.state = FsmState::RecvData;
            }

            // The framer always emits PktStart before Decoded, so by the
            // time a header is decoded we're already in RecvData; that's
            // where the PID category actually gets checked.
            (FsmState::RecvData, RxEvent::Decoded(header)) => {
                if header.category != PidCategory::Data {
                    self.to_error();
                }
            }
            (FsmState::RecvData, RxEvent::DataStrobe(byte)) => {
                if let Some(txn) = &mut self.txn {
                    txn.data_bytes.push(*byte);
                }
            }
            (FsmState::RecvData, RxEvent::PktEnd { pkt_good }) => {
                self.finish_data_stage(*pkt_good, endpoints, tx);
            }

            (FsmState::WaitHand, RxEvent::Decoded(header)) => {
                if header.category == PidCategory::Handshake {
                    if let Some(txn) = &self.txn {
                        if matches!(txn.kind, TokenKind::In) && header.pid == Some(Pid::Ack) {
                            let _ = endpoints.toggle_dtb(txn.epaddr);
                            let _ = endpoints.set_trigger(txn.epaddr);
                        }
                        // NAK (or no response at all, handled by the
                        // framer timing out the token some other way):
                        // data stays queued, dtb untouched, the host
                        // will retry the IN transaction later.
                    }
                }
            }
            (FsmState::WaitHand, RxEvent::PktEnd { .. }) => {
                self.state = FsmState::WaitToken;
                self.txn = None;
            }

            _ => {}
        }
    }

    /// Notify the FSM that the TX pipeline just emitted the final EOP
    /// sample of the packet it was sending.
    pub fn on_tx_pkt_end(&mut self) {
        match self.state {
            FsmState::SendData => self.state = FsmState::WaitHand,
            FsmState::SendHand => self.state = FsmState::WaitToken,
            _ => {}
        }
    }

    fn begin_transaction(&mut self, header: DecodedHeader, endpoints: &mut EndpointTable, tx: &mut TxPipeline) {
        let pid = match header.pid {
            Some(p) => p,
            None => {
                self.state = FsmState::WaitToken;
                return;
            }
        };
        let endp = header.endp.unwrap_or(0);

        match pid {
            Pid::Sof => {
                // A broadcast; no per-endpoint handshake.
                self.state = FsmState::WaitToken;
            }
            Pid::In => {
                let ea = epaddr(endp, true);
                let response = match endpoints.effective_response(ea) {
                    Ok(r) => r,
                    Err(_) => {
                        self.state = FsmState::WaitToken;
                        return;
                    }
                };
                self.txn = Some(ActiveTransaction {
                    kind: TokenKind::In,
                    epaddr: ea,
                    data_bytes: Vec::new(),
                });
                match response {
                    EndpointResponse::Stall => self.start_handshake(Pid::Stall, tx),
                    EndpointResponse::Nak => self.start_handshake(Pid::Nak, tx),
                    EndpointResponse::Ack => {
                        let bytes = endpoints.peek_tx_data(ea).unwrap_or_default();
                        let dtb = endpoints.dtb(ea).unwrap_or(false);
                        let data_pid = if dtb { Pid::Data1 } else { Pid::Data0 };
                        tx.start(data_pid, TxPayload::Data { bytes });
                        self.state = FsmState::SendData;
                    }
                }
            }
            Pid::Out | Pid::Setup => {
                let ea = epaddr(endp, false);
                self.txn = Some(ActiveTransaction {
                    kind: if matches!(pid, Pid::Setup) {
                        TokenKind::Setup
                    } else {
                        TokenKind::Out
                    },
                    epaddr: ea,
                    data_bytes: Vec::new(),
                });
                self.state = FsmState::WaitData;
            }
            _ => {
                // Any other PID where a token is expected is malformed
                // at a layer the framer should already have rejected
                // (pid_ok would be false); treat defensively as no-op.
                self.state = FsmState::WaitToken;
            }
        }
    }

    fn start_handshake(&mut self, pid: Pid, tx: &mut TxPipeline) {
        tx.start(pid, TxPayload::None);
        self.state = FsmState::SendHand;
    }

    fn finish_data_stage(&mut self, pkt_good: bool, endpoints: &mut EndpointTable, tx: &mut TxPipeline) {
        let txn = match self.txn.take() {
            Some(t) => t,
            None => {
                self.to_error();
                return;
            }
        };

        if !pkt_good {
            // Malformed data: the device stays silent (no handshake);
            // the host will time out and retry the whole transaction.
            self.state = FsmState::WaitToken;
            return;
        }

        let ea = txn.epaddr;

        if matches!(txn.kind, TokenKind::Setup) {
            // A well-formed SETUP stage is always accepted regardless
            // of the endpoint's configured response (STALL included):
            // the control pipe must never reject a SETUP. Commit, then
            // reinitialize both halves of this endpoint number to
            // DATA1/NAK.
            let mut payload = txn.data_bytes;
            let keep = payload.len().saturating_sub(2);
            payload.truncate(keep);
            let _ = endpoints.commit_rx(ea, payload);
            let ea_in = ea | 1;
            let _ = endpoints.set_dtb(ea, true);
            let _ = endpoints.set_dtb(ea_in, true);
            let _ = endpoints.set_response(ea, EndpointResponse::Nak);
            let _ = endpoints.set_response(ea_in, EndpointResponse::Nak);
            let _ = endpoints.set_trigger(ea);
            self.start_handshake(Pid::Ack, tx);
            return;
        }

        let response = endpoints.effective_response(ea).unwrap_or(EndpointResponse::Nak);
        match response {
            EndpointResponse::Stall => self.start_handshake(Pid::Stall, tx),
            EndpointResponse::Nak => self.start_handshake(Pid::Nak, tx),
            EndpointResponse::Ack => {
                // data_bytes includes the trailing CRC16; strip it
                // before committing, mirroring the wire-level payload
                // software actually asked for.
                let mut payload = txn.data_bytes;
                let keep = payload.len().saturating_sub(2);
                payload.truncate(keep);
                let _ = endpoints.commit_rx(ea, payload);
                let _ = endpoints.toggle_dtb(ea);
                let _ = endpoints.set_trigger(ea);
                self.start_handshake(Pid::Ack, tx);
            }
        }
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}
