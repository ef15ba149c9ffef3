// Licensed under the Apache-2.0 license

//! Geometry-aware access layer for serial NOR flash.
//!
//! Presents byte-addressable read, write and erase over a transport whose
//! physical primitives are arbitrary-length reads, page-confined program
//! pulses that can only clear bits, and sector/chip erases that reset whole
//! regions to all-1 bits. The layer splits unaligned multi-page writes into
//! page-confined programs, rounds erase addresses down to sector bases, and
//! bounds every busy wait.
//!
//! Erase-before-write stays with the caller: the layer never erases on its
//! own, so an update engine can erase a sector once and then batch several
//! non-contiguous page writes into it.
//!
//! ```plain
//!     update engine
//!   ┌───────────────┐
//!   │  SpiNorFlash  │   byte ranges in, aligned commands out
//!   └───────────────┘
//!  flash_hil::SpiNorTransport
//! ```

mod error;
mod geometry;
mod nor;

pub use error::{FlashAccessError, WriteError};
pub use geometry::{FlashGeometry, GeometryError, PAGE_SIZE, SECTOR_SIZE};
pub use nor::{SpiNorFlash, PROGRAM_POLL_BUDGET, SECTOR_ERASE_POLL_BUDGET};
