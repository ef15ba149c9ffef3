// Licensed under the Apache-2.0 license

use flash_hil::TransportError;
use thiserror::Error;

/// Failures of the access layer. Nothing here is retried internally;
/// recovery policy (retry, fall back to chip erase, abort) belongs to the
/// caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashAccessError {
    #[error("range {address:#x}+{len} exceeds device capacity {capacity:#x}")]
    OutOfRange {
        address: u32,
        len: usize,
        capacity: u32,
    },
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("device still busy after sector/chip erase poll budget")]
    EraseTimeout,
    #[error("device still busy after page program poll budget")]
    WriteTimeout,
    #[error("erase rejected by device protection")]
    EraseProtected,
    #[error("program rejected by device protection")]
    WriteProtected,
}

/// A failed write, with the exact number of bytes that had been programmed
/// before the failing page. Callers can resume from `written`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("wrote {written} bytes, then: {source}")]
pub struct WriteError {
    pub written: usize,
    #[source]
    pub source: FlashAccessError,
}
