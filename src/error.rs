//! Errors that can only arise from programmer misuse of the software
//! boundary (§9A.2). Every wire-level condition -- a bad CRC, a
//! dropped bit, a stalled endpoint -- is data the core reports through
//! its normal event/state surface, never a `Result::Err`; `Err` is
//! reserved for calls the caller had no business making.

use crate::endpoint::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UsbCoreError {
    #[error("epaddr {epaddr:#04x} is not a configured endpoint")]
    UnknownEndpoint { epaddr: u8 },

    #[error("epaddr {epaddr:#04x} is not configured for {expected:?}")]
    WrongDirection { epaddr: u8, expected: Direction },

    #[error("expect_data on epaddr {epaddr:#04x} found {got} bytes, expected {want}")]
    ExpectDataMismatch {
        epaddr: u8,
        want: usize,
        got: usize,
    },

    #[error("clear_pending on epaddr {epaddr:#04x} called while trigger is still asserted")]
    ClearPendingWhileTriggered { epaddr: u8 },

    #[error("clear_pending on epaddr {epaddr:#04x} called but nothing is pending")]
    ClearPendingNotPending { epaddr: u8 },
}
