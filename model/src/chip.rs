// Licensed under the Apache-2.0 license

//! JEDEC SPI NOR chip model.

use bitfield::BitMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Value of every byte after an erase.
pub const ERASED: u8 = 0xff;

/// Status register 1, write-in-progress bit.
pub const SR1_WIP_BIT: usize = 0;
/// Status register 1, write-enable-latch bit.
pub const SR1_WEL_BIT: usize = 1;

/// The subset of the JEDEC command set the model implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    PageProgram = 0x02,
    Read = 0x03,
    Rdsr1 = 0x05,
    WriteEnable = 0x06,
    SectorErase = 0x20,
    Rdid = 0x9f,
    ReleasePowerDown = 0xab,
    PowerDown = 0xb9,
    ChipErase = 0xc7,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChipError {
    InvalidOpcode(u8),
    MissingAddress,
    InvalidAddress(u32),
    /// The device is mid program/erase; only status reads are accepted.
    ChipBusy,
    PoweredDown,
    /// Program or erase issued without a preceding write enable.
    WriteDisabled,
    /// A page program whose bytes would wrap past the page end.
    CrossPageProgram,
    /// Sector erase address not on a sector boundary.
    EraseAddressUnaligned,
    Protected,
}

/// Static description of one supported flash part.
#[derive(Clone, Copy, Debug)]
pub struct PartInfo {
    pub part_name: &'static str,
    /// RDID response: manufacturer, memory type, capacity code.
    pub id: [u8; 3],
    pub chip_size: u32,
    pub page_size: u32,
    pub sector_size: u32,
    /// Busy time charged per operation, in poll ticks.
    pub program_ticks: u64,
    pub sector_erase_ticks: u64,
    pub chip_erase_ticks: u64,
}

pub const SUPPORTED_FLASH: &[PartInfo] = &[
    PartInfo {
        part_name: "w25q80dv",
        id: [0xef, 0x40, 0x14],
        chip_size: 1024 * 1024,
        page_size: 256,
        sector_size: 4096,
        program_ticks: 2,
        sector_erase_ticks: 50,
        chip_erase_ticks: 12_800,
    },
    PartInfo {
        part_name: "w25q32jv",
        id: [0xef, 0x40, 0x16],
        chip_size: 4 * 1024 * 1024,
        page_size: 256,
        sector_size: 4096,
        program_ticks: 2,
        sector_erase_ticks: 50,
        chip_erase_ticks: 51_200,
    },
];

/// One command transaction: opcode, optional address, payload in, bytes out.
///
/// The opcode is carried as the raw wire byte; the model decodes it the way
/// the real device would and rejects bytes it does not implement.
pub struct Command<'a> {
    pub opcode: u8,
    pub address: Option<u32>,
    pub write_data: &'a [u8],
    pub read_len: usize,
}

impl<'a> Command<'a> {
    /// Opcode-only command (write enable, power down, chip erase).
    pub fn simple(opcode: Opcode) -> Self {
        Command {
            opcode: opcode.into(),
            address: None,
            write_data: &[],
            read_len: 0,
        }
    }

    /// Register read without an address phase.
    pub fn read_reg(opcode: Opcode, read_len: usize) -> Self {
        Command {
            read_len,
            ..Command::simple(opcode)
        }
    }

    pub fn read_data(address: u32, read_len: usize) -> Self {
        Command {
            address: Some(address),
            read_len,
            ..Command::simple(Opcode::Read)
        }
    }

    pub fn program(address: u32, data: &'a [u8]) -> Self {
        Command {
            opcode: Opcode::PageProgram.into(),
            address: Some(address),
            write_data: data,
            read_len: 0,
        }
    }

    pub fn erase_sector(address: u32) -> Self {
        Command {
            address: Some(address),
            ..Command::simple(Opcode::SectorErase)
        }
    }
}

/// Emulated NOR flash device.
///
/// Contents start erased. Programming ANDs the payload into the array, so a
/// program pulse can only clear bits; restoring a 1 requires erasing the
/// whole containing sector. Program and erase leave the chip busy for the
/// part's tick cost; time passes through [`NorChip::tick`].
pub struct NorChip {
    info: PartInfo,
    data: Vec<u8>,
    write_enable: bool,
    busy: u64,
    powered_down: bool,
    protected: bool,
}

impl NorChip {
    pub fn new(name: &str) -> Option<Self> {
        let info = *SUPPORTED_FLASH.iter().find(|f| f.part_name == name)?;
        Some(Self::from_part(info))
    }

    pub fn from_part(info: PartInfo) -> Self {
        NorChip {
            info,
            data: vec![ERASED; info.chip_size as usize],
            write_enable: false,
            busy: 0,
            powered_down: false,
            protected: false,
        }
    }

    pub fn part(&self) -> &PartInfo {
        &self.info
    }

    pub fn is_busy(&self) -> bool {
        self.busy > 0
    }

    pub fn is_powered_down(&self) -> bool {
        self.powered_down
    }

    /// Engage or release the software write protection of the whole array.
    pub fn set_protected(&mut self, on: bool) {
        self.protected = on;
    }

    /// Let `time` poll ticks pass, draining any in-flight program/erase.
    pub fn tick(&mut self, time: u64) {
        self.busy = self.busy.saturating_sub(time);
    }

    /// Raw view of the array, for test assertions.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    fn require_address(cmd: &Command) -> Result<u32, ChipError> {
        cmd.address.ok_or(ChipError::MissingAddress)
    }

    fn check_span(&self, address: u32, len: usize) -> Result<(), ChipError> {
        if u64::from(address) + len as u64 > u64::from(self.info.chip_size) {
            return Err(ChipError::InvalidAddress(address));
        }
        Ok(())
    }

    fn require_write_enable(&self) -> Result<(), ChipError> {
        if !self.write_enable {
            return Err(ChipError::WriteDisabled);
        }
        if self.protected {
            return Err(ChipError::Protected);
        }
        Ok(())
    }

    fn status1(&self) -> u8 {
        let mut status = 0u8;
        status.set_bit(SR1_WIP_BIT, self.busy > 0);
        status.set_bit(SR1_WEL_BIT, self.write_enable);
        status
    }

    /// Execute one command transaction, returning the bytes clocked out.
    pub fn execute(&mut self, cmd: &Command) -> Result<Vec<u8>, ChipError> {
        let opcode: Opcode = cmd
            .opcode
            .try_into()
            .map_err(|_| ChipError::InvalidOpcode(cmd.opcode))?;

        if self.powered_down && opcode != Opcode::ReleasePowerDown {
            return Err(ChipError::PoweredDown);
        }
        if self.busy > 0 && opcode != Opcode::Rdsr1 {
            return Err(ChipError::ChipBusy);
        }

        match opcode {
            Opcode::Rdid => Ok(self.info.id.to_vec()),
            Opcode::Rdsr1 => Ok(vec![self.status1()]),
            Opcode::WriteEnable => {
                self.write_enable = true;
                Ok(Vec::new())
            }
            Opcode::Read => {
                let address = Self::require_address(cmd)?;
                self.check_span(address, cmd.read_len)?;
                let start = address as usize;
                Ok(self.data[start..start + cmd.read_len].to_vec())
            }
            Opcode::PageProgram => {
                self.require_write_enable()?;
                let address = Self::require_address(cmd)?;
                self.check_span(address, cmd.write_data.len())?;
                if cmd.write_data.is_empty() {
                    return Err(ChipError::InvalidAddress(address));
                }
                // The real device wraps within the page; the model rejects
                // instead so a bad split is caught, not masked.
                let mask = !(self.info.page_size - 1);
                let last = address + (cmd.write_data.len() as u32 - 1);
                if address & mask != last & mask {
                    return Err(ChipError::CrossPageProgram);
                }
                let start = address as usize;
                for (offset, byte) in cmd.write_data.iter().enumerate() {
                    self.data[start + offset] &= *byte;
                }
                self.busy = self.info.program_ticks;
                self.write_enable = false;
                Ok(Vec::new())
            }
            Opcode::SectorErase => {
                self.require_write_enable()?;
                let address = Self::require_address(cmd)?;
                self.check_span(address, 1)?;
                if address % self.info.sector_size != 0 {
                    return Err(ChipError::EraseAddressUnaligned);
                }
                let start = address as usize;
                let end = start + self.info.sector_size as usize;
                self.data[start..end].fill(ERASED);
                self.busy = self.info.sector_erase_ticks;
                self.write_enable = false;
                Ok(Vec::new())
            }
            Opcode::ChipErase => {
                self.require_write_enable()?;
                self.data.fill(ERASED);
                self.busy = self.info.chip_erase_ticks;
                self.write_enable = false;
                Ok(Vec::new())
            }
            Opcode::PowerDown => {
                self.powered_down = true;
                Ok(Vec::new())
            }
            Opcode::ReleasePowerDown => {
                self.powered_down = false;
                Ok(Vec::new())
            }
        }
    }
}
