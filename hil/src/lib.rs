// Licensed under the Apache-2.0 license

//! Hardware interface for serial NOR flash transports.
//!
//! A transport wraps one physical bus variant (single, quad or octo lane
//! SPI) and exposes the command-level primitives of the chip: identify,
//! arbitrary-length read, page program, sector/chip erase and a bounded
//! status poll. The geometry-aware access layer in `flash-driver` sits on
//! top of this trait and never talks to the bus directly.

use thiserror::Error;

/// JEDEC identification of a flash part, `(manufacturer << 8) | product`.
///
/// Obtained once via [`SpiNorTransport::probe`] and cached by the access
/// layer for the lifetime of the instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceId(pub u16);

impl DeviceId {
    pub fn new(manufacturer: u8, product: u8) -> Self {
        DeviceId(u16::from_be_bytes([manufacturer, product]))
    }

    pub fn manufacturer(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn product(&self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

/// Lane configuration a concrete transport drives. Selected when the board
/// is configured, not negotiated at runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BusWidth {
    #[default]
    Single,
    Quad,
    Octo,
}

/// Outcome of a bounded busy poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ready {
    /// The device finished its in-flight program/erase.
    Ready,
    /// The poll budget elapsed with the device still busy.
    Busy,
}

/// Bus-level failures reported by a transport. The access layer maps these
/// onto its own taxonomy; it never retries them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bus transfer failed: {0}")]
    Bus(&'static str),
    #[error("no response from device")]
    NoDevice,
    #[error("device reports protection fault")]
    Protected,
}

/// Synchronous command-level access to one serial NOR flash chip.
///
/// All operations block until the transfer itself completes; waiting out a
/// program or erase is the caller's job via [`poll_ready`].
///
/// [`poll_ready`]: SpiNorTransport::poll_ready
pub trait SpiNorTransport {
    /// Issue the identification command and return the composed id.
    fn probe(&mut self) -> Result<DeviceId, TransportError>;

    /// Deselect the chip and put it in a low-power state. Idempotent.
    fn release(&mut self);

    /// Read `buf.len()` bytes starting at `address`. No alignment
    /// constraints; reads are native to the hardware.
    fn read_bytes(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Write-enable the chip and program `data` at `address`. The range
    /// must lie within a single physical page; the hardware wraps silently
    /// otherwise, so callers split beforehand.
    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), TransportError>;

    /// Write-enable the chip and issue a sector erase for the sector
    /// containing `address`.
    fn erase_sector(&mut self, address: u32) -> Result<(), TransportError>;

    /// Write-enable the chip and issue a whole-device erase.
    fn erase_chip(&mut self) -> Result<(), TransportError>;

    /// Poll the busy flag, spending at most `budget` status reads. Returns
    /// [`Ready::Busy`] when the budget elapses; never blocks unboundedly.
    fn poll_ready(&mut self, budget: u32) -> Result<Ready, TransportError>;

    /// Largest single read transfer the bus supports. The access layer
    /// chunks longer reads.
    fn max_transfer_len(&self) -> usize {
        usize::MAX
    }

    /// Lane configuration of this transport.
    fn bus_width(&self) -> BusWidth {
        BusWidth::Single
    }
}
