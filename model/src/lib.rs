// Licensed under the Apache-2.0 license

//! Emulated serial NOR flash for exercising the access layer.
//!
//! [`chip::NorChip`] models the device itself: JEDEC command set, erased
//! state of all-1 bits, program pulses that can only clear bits, the
//! write-enable latch and busy time. [`transport::ModelTransport`] drives a
//! chip through the `flash-hil` transport contract and records every
//! physical command so tests can inspect addresses and lengths.

pub mod chip;
pub mod transport;

pub use chip::{ChipError, Command, NorChip, Opcode, PartInfo};
pub use transport::{ModelTransport, StuckTransport, TransportCall};
