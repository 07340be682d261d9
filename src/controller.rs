//! Top-level wiring: components A-H assembled into the single public
//! entry point software drives. `Controller::tick` is the usb_48
//! boundary (§2's `usb_48` domain); internally it only advances the
//! usb_12 bit-rate pipelines (B-F) on the sampler's recovered bit
//! strobe, and everything else is the `sys`-domain accessor API below.
//!
//! The RX and TX pipelines are wired so that, on any given tick, each
//! reads only the *other's previous tick's* output rather than this
//! tick's: while transmitting, incoming samples are not fed to the RX
//! pipeline at all (we don't decode our own loopback), and the RX
//! pipeline is reset the moment the FSM asserts a new transmission,
//! breaking the RX -> FSM -> TX -> I/O -> RX cycle the spec calls out.

use crate::codec::LineState;
use crate::endpoint::{EndpointConfig, EndpointResponse, EndpointTable};
use crate::error::UsbCoreError;
use crate::fsm::{Fsm, FsmState};
use crate::nrzi::LineSampler;
use crate::rx::RxPipeline;
use crate::tx::TxPipeline;

/// A cycle-accurate behavioral model of a USB 1.1 device-side
/// controller core: line sampling, NRZI/bit-stuff codec, packet
/// framing, and the per-endpoint transaction FSM, all driven by a
/// single `tick` call per `usb_48` clock.
pub struct Controller {
    sampler: LineSampler,
    rx: RxPipeline,
    tx: TxPipeline,
    fsm: Fsm,
    endpoints: EndpointTable,
    pullup_enabled: bool,
}

impl Controller {
    pub fn new(configs: &[EndpointConfig]) -> Self {
        Controller {
            sampler: LineSampler::new(),
            rx: RxPipeline::new(),
            tx: TxPipeline::new(),
            fsm: Fsm::new(),
            endpoints: EndpointTable::new(configs),
            pullup_enabled: true,
        }
    }

    /// Advance one `usb_48` clock. `raw` is the differential line
    /// state presented by the FPGA I/O buffer glue (an external
    /// collaborator; translating physical `usb_p`/`usb_n` pins into
    /// this enum is out of scope, per §1). Returns the state this core
    /// wants to drive onto the bus, or `None` while it is receiving
    /// (and the line should be left to its pull resistor).
    pub fn tick(&mut self, raw: LineState) -> Option<LineState> {
        if !self.pullup_enabled {
            // A disabled pullup is a permanent SE0 as far as the
            // framer is concerned: it can never observe a SYNC and so
            // never leaves IDLE.
            self.rx.reset();
            return None;
        }

        let (sampled, strobe) = self.sampler.tick(raw);
        if !strobe {
            return None;
        }

        // usb_12 ticks once per recovered bit regardless of which of
        // RX/TX is active below; promote any trigger a commit raised
        // last usb_12 tick into `pending` now, so the one-cycle pulse
        // is honored even across tx/rx branch changes.
        self.endpoints.advance();

        if !self.tx.is_idle() {
            let out = self.tx.tick();
            if out.pkt_end {
                self.fsm.on_tx_pkt_end();
            }
            return Some(out.state);
        }

        for event in self.rx.tick(sampled) {
            self.fsm.on_rx_event(&event, &mut self.endpoints, &mut self.tx);
        }

        if !self.tx.is_idle() {
            // The FSM just queued a reply; make sure the framer starts
            // clean once our own transmission finishes.
            self.rx.reset();
        }

        None
    }

    pub fn fsm_state(&self) -> FsmState {
        self.fsm.state()
    }

    pub fn pkt_active(&self) -> bool {
        self.rx.pkt_active()
    }

    pub fn pullup_enabled(&self) -> bool {
        self.pullup_enabled
    }

    pub fn set_pullup_enabled(&mut self, enabled: bool) {
        self.pullup_enabled = enabled;
    }

    pub fn set_response(&mut self, epaddr: u8, response: EndpointResponse) -> Result<(), UsbCoreError> {
        self.endpoints.set_response(epaddr, response)
    }

    pub fn response(&self, epaddr: u8) -> Result<EndpointResponse, UsbCoreError> {
        self.endpoints.response(epaddr)
    }

    pub fn set_data(&mut self, epaddr: u8, bytes: &[u8]) -> Result<(), UsbCoreError> {
        self.endpoints.set_data(epaddr, bytes)
    }

    pub fn expect_data(&mut self, epaddr: u8) -> Result<Vec<u8>, UsbCoreError> {
        self.endpoints.expect_data(epaddr)
    }

    pub fn expect_data_eq(&mut self, epaddr: u8, want: &[u8]) -> Result<(), UsbCoreError> {
        self.endpoints.expect_data_eq(epaddr, want)
    }

    pub fn pending(&self, epaddr: u8) -> Result<bool, UsbCoreError> {
        self.endpoints.pending(epaddr)
    }

    pub fn clear_pending(&mut self, epaddr: u8) -> Result<(), UsbCoreError> {
        self.endpoints.clear_pending(epaddr)
    }

    pub fn trigger(&self, epaddr: u8) -> Result<bool, UsbCoreError> {
        self.endpoints.trigger(epaddr)
    }

    pub fn dtb(&self, epaddr: u8) -> Result<bool, UsbCoreError> {
        self.endpoints.dtb(epaddr)
    }

    pub fn set_dtb(&mut self, epaddr: u8, value: bool) -> Result<(), UsbCoreError> {
        self.endpoints.set_dtb(epaddr, value)
    }

    /// An explicit bus reset: distinct from the FSM's own
    /// `ERROR`-recovery reset, this also clears every endpoint back to
    /// its power-on defaults and discards any in-flight transmission,
    /// the way a real device reacts to the host holding SE0 for the
    /// USB 1.1 reset interval.
    pub fn bus_reset(&mut self) {
        self.sampler.reset();
        self.rx.reset();
        self.tx = TxPipeline::new();
        self.fsm.reset();
        self.endpoints.reset_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{bit_stuff, crc16, crc5, nrzi_encode, Pid};
    use crate::endpoint::{epaddr, Direction};
    use bitvec::prelude::*;

    const SYNC_BITS: [bool; 8] = [false, false, false, false, false, false, false, true];

    fn byte_bits(byte: u8) -> Vec<bool> {
        (0..8).map(|i| (byte >> i) & 1 == 1).collect()
    }

    fn token_wire(pid: Pid, addr: u8, endp: u8) -> Vec<LineState> {
        let mut logical = BitVec::new();
        for b in byte_bits(pid.encode_byte()) {
            logical.push(b);
        }
        let payload: u16 = (addr as u16 & 0x7F) | ((endp as u16 & 0xF) << 7);
        let crc = crc5(payload, 11);
        for i in 0..11 {
            logical.push((payload >> i) & 1 == 1);
        }
        for i in 0..5 {
            logical.push((crc >> i) & 1 == 1);
        }
        let stuffed = bit_stuff(&logical);
        let mut full = BitVec::new();
        for b in SYNC_BITS {
            full.push(b);
        }
        full.extend_from_bitslice(&stuffed);
        let mut states = nrzi_encode(&full);
        states.push(LineState::Se0);
        states.push(LineState::Se0);
        states.push(LineState::J);
        states
    }

    fn handshake_wire(pid: Pid) -> Vec<LineState> {
        let mut logical = BitVec::new();
        for b in byte_bits(pid.encode_byte()) {
            logical.push(b);
        }
        let stuffed = bit_stuff(&logical);
        let mut full = BitVec::new();
        for b in SYNC_BITS {
            full.push(b);
        }
        full.extend_from_bitslice(&stuffed);
        let mut states = nrzi_encode(&full);
        states.push(LineState::Se0);
        states.push(LineState::Se0);
        states.push(LineState::J);
        states
    }

    fn data_wire(pid: Pid, payload: &[u8]) -> Vec<LineState> {
        let mut logical = BitVec::new();
        for b in byte_bits(pid.encode_byte()) {
            logical.push(b);
        }
        for &byte in payload {
            for b in byte_bits(byte) {
                logical.push(b);
            }
        }
        let crc = crc16(payload);
        for b in byte_bits((crc & 0xFF) as u8) {
            logical.push(b);
        }
        for b in byte_bits((crc >> 8) as u8) {
            logical.push(b);
        }
        let stuffed = bit_stuff(&logical);
        let mut full = BitVec::new();
        for b in SYNC_BITS {
            full.push(b);
        }
        full.extend_from_bitslice(&stuffed);
        let mut states = nrzi_encode(&full);
        states.push(LineState::Se0);
        states.push(LineState::Se0);
        states.push(LineState::J);
        states
    }

    /// Feed a sequence of bit-strobe-rate line states to the
    /// controller at its natural 4x-oversampled input rate (each logical
    /// state held for four 48 MHz ticks so the sampler's strobe lines up).
    fn drive(ctrl: &mut Controller, states: &[LineState]) -> Vec<Option<LineState>> {
        let mut out = Vec::new();
        for &s in states {
            for _ in 0..4 {
                out.push(ctrl.tick(s));
            }
        }
        out
    }

    fn default_controller() -> Controller {
        Controller::new(&[EndpointConfig {
            epnum: 0,
            direction: Direction::BiDir,
        }])
    }

    #[test]
    fn in_transaction_end_to_end_drives_data_then_sees_host_ack() {
        let mut ctrl = default_controller();
        let ea = epaddr(0, true);
        ctrl.set_response(ea, EndpointResponse::Ack).unwrap();
        ctrl.set_data(ea, &[0xDE, 0xAD]).unwrap();

        let token = token_wire(Pid::In, 0x01, 0);
        drive(&mut ctrl, &token);
        assert_eq!(ctrl.fsm_state(), FsmState::SendData);

        // Drain whatever the controller wants to drive back; there's
        // no bound on ticks needed since TxPipeline empties in its own
        // time, so just tick enough times to exhaust it.
        let mut driven_any = false;
        for _ in 0..2000 {
            if let Some(_) = ctrl.tick(LineState::J) {
                driven_any = true;
            }
            if ctrl.fsm_state() == FsmState::WaitHand {
                break;
            }
        }
        assert!(driven_any);
        assert_eq!(ctrl.fsm_state(), FsmState::WaitHand);

        let dtb_before = ctrl.dtb(ea).unwrap();
        drive(&mut ctrl, &handshake_wire(Pid::Ack));
        assert_eq!(ctrl.fsm_state(), FsmState::WaitToken);
        assert_ne!(ctrl.dtb(ea).unwrap(), dtb_before);
    }

    #[test]
    fn out_transaction_end_to_end_commits_payload() {
        let mut ctrl = default_controller();
        let ea = epaddr(0, false);
        ctrl.set_response(ea, EndpointResponse::Ack).unwrap();

        drive(&mut ctrl, &token_wire(Pid::Out, 0x01, 0));
        assert_eq!(ctrl.fsm_state(), FsmState::WaitData);

        drive(&mut ctrl, &data_wire(Pid::Data0, &[1, 2, 3, 4]));
        assert_eq!(ctrl.fsm_state(), FsmState::SendHand);
        // `trigger` rose on the commit tick; give the endpoint table one
        // more usb_12 tick (a handful of idle 48 MHz samples) to promote
        // it into `pending`.
        for _ in 0..8 {
            ctrl.tick(LineState::J);
        }
        assert!(ctrl.pending(ea).unwrap());
        assert_eq!(ctrl.expect_data(ea).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn disabled_pullup_never_leaves_idle() {
        let mut ctrl = default_controller();
        ctrl.set_pullup_enabled(false);
        for tick_out in drive(&mut ctrl, &token_wire(Pid::In, 1, 0)) {
            assert!(tick_out.is_none());
        }
        assert_eq!(ctrl.fsm_state(), FsmState::WaitToken);
        assert!(!ctrl.pkt_active());
    }

    #[test]
    fn bus_reset_clears_endpoint_state() {
        let mut ctrl = default_controller();
        let ea = epaddr(0, true);
        ctrl.set_response(ea, EndpointResponse::Stall).unwrap();
        ctrl.bus_reset();
        assert_eq!(ctrl.response(ea).unwrap(), EndpointResponse::Nak);
        assert_eq!(ctrl.fsm_state(), FsmState::WaitToken);
    }
}
