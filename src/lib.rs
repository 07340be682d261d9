//! A cycle-accurate behavioral model of a USB 1.1 low-/full-speed
//! device-side controller core.
//!
//! The crate is organized the way the gateware it models is: a
//! receive pipeline (line sampling -> NRZI decode/bit-destuff ->
//! packet framing/PID decode), a transmit pipeline (framing -> NRZI
//! encode/bit-stuff), and a transaction state machine that couples the
//! two to a per-endpoint state table. Everything is sans-I/O: no
//! thread, socket, or timer is ever touched here. [`Controller::tick`]
//! is the only entry point that advances simulated time; every other
//! method is a `sys`-domain accessor a caller uses between ticks.
//!
//! Out of scope, matching the core this model describes: hub/host
//! behavior, high-speed or SuperSpeed USB, suspend/resume signaling,
//! and enumeration policy above endpoint 0 (device address matching is
//! not performed -- every token is treated as addressed to this
//! device).

pub mod codec;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod fsm;
pub mod nrzi;
pub mod rx;
pub mod tx;

pub use codec::{LineState, Pid, PidCategory};
pub use controller::Controller;
pub use endpoint::{epaddr, Direction, EndpointConfig, EndpointResponse};
pub use error::UsbCoreError;
pub use fsm::FsmState;
pub use rx::{DecodedHeader, RxEvent};
pub use tx::{TxPayload, TxTick};
