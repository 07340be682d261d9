//! Scenario-replay CLI: reads a JSON-encoded sequence of host-injected
//! packets and software-collaborator calls, drives a [`Controller`]
//! tick-by-tick, and prints the resulting FSM transitions and endpoint
//! commits. Exists to replay the literal scenarios documented in the
//! core's test suite outside of `cargo test`, mirroring how the
//! teacher's `itm-decode`/`itmdump` binaries exist only to run the
//! library's `Decoder` over a file instead of inside a test.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bitvec::prelude::*;
use serde::Deserialize;
use structopt::StructOpt;

use usb11_core::codec::{bit_stuff, crc16, crc5, nrzi_encode, LineState, Pid};
use usb11_core::endpoint::{Direction, EndpointConfig};
use usb11_core::{Controller, EndpointResponse};

#[derive(StructOpt)]
#[structopt(name = "usbsim", about = "Replay a USB 1.1 device-core scenario script")]
struct Opt {
    /// Path to a JSON scenario file (see `ScenarioStep` for the shape).
    scenario: PathBuf,

    /// Endpoint numbers and directions to configure before replay, as
    /// `epnum:dir` pairs (`dir` one of `out`, `in`, `bidir`). Defaults
    /// to a single bidirectional control endpoint 0.
    #[structopt(long = "endpoint")]
    endpoints: Vec<String>,
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ScenarioStep {
    SetResponse { epaddr: u8, response: EndpointResponse },
    SetData { epaddr: u8, bytes: Vec<u8> },
    SetDtb { epaddr: u8, value: bool },
    ClearPending { epaddr: u8 },
    Token { pid: Pid, addr: u8, endp: u8 },
    Handshake { pid: Pid },
    Data { pid: Pid, payload: Vec<u8> },
    /// Advance the bus with the line held idle (`J`), in bit-strobe
    /// periods, without injecting a packet -- useful to let the
    /// controller finish driving a reply before the next host action.
    RunIdle { ticks: u32 },
    BusReset,
}

fn parse_endpoints(specs: &[String]) -> Result<Vec<EndpointConfig>> {
    if specs.is_empty() {
        return Ok(vec![EndpointConfig::default()]);
    }
    specs
        .iter()
        .map(|spec| {
            let (num, dir) = spec
                .split_once(':')
                .with_context(|| format!("malformed --endpoint {spec:?}, expected epnum:dir"))?;
            let epnum: u8 = num.parse().with_context(|| format!("bad endpoint number in {spec:?}"))?;
            let direction = match dir {
                "out" => Direction::Out,
                "in" => Direction::In,
                "bidir" => Direction::BiDir,
                other => anyhow::bail!("unknown endpoint direction {other:?} in {spec:?}"),
            };
            Ok(EndpointConfig { epnum, direction })
        })
        .collect()
}

fn byte_bits(byte: u8) -> Vec<bool> {
    (0..8).map(|i| (byte >> i) & 1 == 1).collect()
}

const SYNC_BITS: [bool; 8] = [false, false, false, false, false, false, false, true];

fn framed(logical: &BitSlice) -> Vec<LineState> {
    let stuffed = bit_stuff(logical);
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
    framed(&logical)
}

fn handshake_wire(pid: Pid) -> Vec<LineState> {
    let mut logical = BitVec::new();
    for b in byte_bits(pid.encode_byte()) {
        logical.push(b);
    }
    framed(&logical)
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
    framed(&logical)
}

fn drive(ctrl: &mut Controller, states: &[LineState]) {
    let before = ctrl.fsm_state();
    for &s in states {
        for _ in 0..4 {
            ctrl.tick(s);
        }
    }
    let after = ctrl.fsm_state();
    if before != after {
        println!("fsm: {before:?} -> {after:?}");
    }
}

fn run_idle(ctrl: &mut Controller, ticks: u32) {
    let before = ctrl.fsm_state();
    for _ in 0..ticks {
        ctrl.tick(LineState::J);
    }
    let after = ctrl.fsm_state();
    if before != after {
        println!("fsm: {before:?} -> {after:?}");
    }
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    let configs = parse_endpoints(&opt.endpoints)?;
    let mut ctrl = Controller::new(&configs);

    let raw = fs::read_to_string(&opt.scenario)
        .with_context(|| format!("reading scenario file {:?}", opt.scenario))?;
    let steps: Vec<ScenarioStep> =
        serde_json::from_str(&raw).with_context(|| format!("parsing scenario file {:?}", opt.scenario))?;

    for step in steps {
        match step {
            ScenarioStep::SetResponse { epaddr, response } => {
                ctrl.set_response(epaddr, response)?;
                println!("set_response epaddr={epaddr:#04x} -> {response:?}");
            }
            ScenarioStep::SetData { epaddr, bytes } => {
                println!("set_data epaddr={epaddr:#04x} bytes={bytes:?}");
                ctrl.set_data(epaddr, &bytes)?;
            }
            ScenarioStep::SetDtb { epaddr, value } => {
                ctrl.set_dtb(epaddr, value)?;
                println!("set_dtb epaddr={epaddr:#04x} -> {value}");
            }
            ScenarioStep::ClearPending { epaddr } => {
                ctrl.clear_pending(epaddr)?;
                println!("clear_pending epaddr={epaddr:#04x}");
            }
            ScenarioStep::Token { pid, addr, endp } => {
                println!("host -> token pid={pid:?} addr={addr} endp={endp}");
                drive(&mut ctrl, &token_wire(pid, addr, endp));
            }
            ScenarioStep::Handshake { pid } => {
                println!("host -> handshake pid={pid:?}");
                drive(&mut ctrl, &handshake_wire(pid));
            }
            ScenarioStep::Data { pid, payload } => {
                println!("host -> data pid={pid:?} payload={payload:?}");
                drive(&mut ctrl, &data_wire(pid, &payload));
            }
            ScenarioStep::RunIdle { ticks } => run_idle(&mut ctrl, ticks),
            ScenarioStep::BusReset => {
                ctrl.bus_reset();
                println!("bus_reset");
            }
        }
    }

    Ok(())
}
