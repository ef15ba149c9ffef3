// Licensed under the Apache-2.0 license

//! `flash-hil` transport implementations over the chip model.

use bitfield::Bit;
use log::trace;

use flash_hil::{BusWidth, DeviceId, Ready, SpiNorTransport, TransportError};

use crate::chip::{ChipError, Command, NorChip, Opcode, SR1_WIP_BIT};

/// One physical command issued through the transport, as seen by tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    Probe,
    Read { address: u32, len: usize },
    ProgramPage { address: u32, len: usize },
    EraseSector { address: u32 },
    EraseChip,
    Release,
}

fn bus_error(err: ChipError) -> TransportError {
    match err {
        ChipError::Protected => TransportError::Protected,
        ChipError::PoweredDown => TransportError::NoDevice,
        ChipError::InvalidOpcode(_) => TransportError::Bus("invalid opcode"),
        ChipError::MissingAddress => TransportError::Bus("missing address phase"),
        ChipError::InvalidAddress(_) => TransportError::Bus("address beyond device"),
        ChipError::ChipBusy => TransportError::Bus("device busy"),
        ChipError::WriteDisabled => TransportError::Bus("write enable latch clear"),
        ChipError::CrossPageProgram => TransportError::Bus("program crosses page"),
        ChipError::EraseAddressUnaligned => TransportError::Bus("erase address unaligned"),
    }
}

/// Single-lane transport driving an emulated [`NorChip`].
///
/// Records every command so tests can check which physical operations an
/// access-layer call produced. An optional single-transfer ceiling and a
/// program-failure knob let tests exercise read chunking and partial-write
/// reporting.
pub struct ModelTransport {
    chip: NorChip,
    calls: Vec<TransportCall>,
    max_transfer: usize,
    programs_before_failure: Option<usize>,
}

impl ModelTransport {
    pub fn new(chip: NorChip) -> Self {
        ModelTransport {
            chip,
            calls: Vec::new(),
            max_transfer: usize::MAX,
            programs_before_failure: None,
        }
    }

    /// Cap single read transfers at `len` bytes.
    pub fn with_max_transfer(mut self, len: usize) -> Self {
        self.max_transfer = len;
        self
    }

    /// Let the next `count` page programs succeed, then fail one with a
    /// transient bus fault. Later programs succeed again.
    pub fn fail_programs_after(&mut self, count: usize) {
        self.programs_before_failure = Some(count);
    }

    pub fn calls(&self) -> &[TransportCall] {
        &self.calls
    }

    /// Only the page-program commands, in issue order.
    pub fn program_calls(&self) -> Vec<(u32, usize)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::ProgramPage { address, len } => Some((*address, *len)),
                _ => None,
            })
            .collect()
    }

    pub fn chip(&self) -> &NorChip {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut NorChip {
        &mut self.chip
    }

    fn execute(&mut self, cmd: &Command) -> Result<Vec<u8>, TransportError> {
        self.chip.execute(cmd).map_err(bus_error)
    }
}

impl SpiNorTransport for ModelTransport {
    fn probe(&mut self) -> Result<DeviceId, TransportError> {
        self.calls.push(TransportCall::Probe);
        if self.chip.is_powered_down() {
            self.execute(&Command::simple(Opcode::ReleasePowerDown))?;
        }
        let id = self.execute(&Command::read_reg(Opcode::Rdid, 3))?;
        trace!("probe: jedec id {:02x?}", id);
        // Manufacturer byte plus capacity code, the two bytes boards key on.
        Ok(DeviceId::new(id[0], id[2]))
    }

    fn release(&mut self) {
        self.calls.push(TransportCall::Release);
        if !self.chip.is_powered_down() {
            let _ = self.execute(&Command::simple(Opcode::PowerDown));
        }
    }

    fn read_bytes(&mut self, address: u32, buf: &mut [u8]) -> Result<(), TransportError> {
        self.calls.push(TransportCall::Read {
            address,
            len: buf.len(),
        });
        if buf.len() > self.max_transfer {
            return Err(TransportError::Bus("transfer exceeds bus limit"));
        }
        let out = self.execute(&Command::read_data(address, buf.len()))?;
        buf.copy_from_slice(&out);
        Ok(())
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), TransportError> {
        self.calls.push(TransportCall::ProgramPage {
            address,
            len: data.len(),
        });
        match self.programs_before_failure.as_mut() {
            Some(0) => {
                self.programs_before_failure = None;
                return Err(TransportError::Bus("injected program failure"));
            }
            Some(remaining) => *remaining -= 1,
            None => {}
        }
        trace!("program page: {:#x} + {}", address, data.len());
        self.execute(&Command::simple(Opcode::WriteEnable))?;
        self.execute(&Command::program(address, data))?;
        Ok(())
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), TransportError> {
        self.calls.push(TransportCall::EraseSector { address });
        trace!("sector erase: {:#x}", address);
        self.execute(&Command::simple(Opcode::WriteEnable))?;
        self.execute(&Command::erase_sector(address))?;
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<(), TransportError> {
        self.calls.push(TransportCall::EraseChip);
        trace!("chip erase");
        self.execute(&Command::simple(Opcode::WriteEnable))?;
        self.execute(&Command::simple(Opcode::ChipErase))?;
        Ok(())
    }

    fn poll_ready(&mut self, budget: u32) -> Result<Ready, TransportError> {
        for _ in 0..budget {
            self.chip.tick(1);
            let status = self.execute(&Command::read_reg(Opcode::Rdsr1, 1))?;
            if !status[0].bit(SR1_WIP_BIT) {
                return Ok(Ready::Ready);
            }
        }
        Ok(Ready::Busy)
    }

    fn max_transfer_len(&self) -> usize {
        self.max_transfer
    }

    fn bus_width(&self) -> BusWidth {
        BusWidth::Single
    }
}

/// Transport whose device never leaves the busy state. Programs and erases
/// are accepted, the subsequent poll always reports busy.
pub struct StuckTransport;

impl SpiNorTransport for StuckTransport {
    fn probe(&mut self) -> Result<DeviceId, TransportError> {
        Ok(DeviceId::new(0xef, 0x14))
    }

    fn release(&mut self) {}

    fn read_bytes(&mut self, _address: u32, buf: &mut [u8]) -> Result<(), TransportError> {
        buf.fill(crate::chip::ERASED);
        Ok(())
    }

    fn program_page(&mut self, _address: u32, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn erase_sector(&mut self, _address: u32) -> Result<(), TransportError> {
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn poll_ready(&mut self, _budget: u32) -> Result<Ready, TransportError> {
        Ok(Ready::Busy)
    }
}
