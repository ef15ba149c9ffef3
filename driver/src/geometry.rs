// Licensed under the Apache-2.0 license

use thiserror::Error;

/// Default erase granularity in bytes.
pub const SECTOR_SIZE: u32 = 4096;
/// Default program granularity in bytes.
pub const PAGE_SIZE: u32 = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("{name} must be a nonzero power of two, got {value}")]
    NotPowerOfTwo { name: &'static str, value: u32 },
    #[error("page size {page_size} does not divide sector size {sector_size}")]
    PageSectorMismatch { page_size: u32, sector_size: u32 },
    #[error("sector size {sector_size} does not divide total size {total_size}")]
    SectorTotalMismatch { sector_size: u32, total_size: u32 },
}

/// Immutable physical layout of one flash part.
///
/// `page_size` divides `sector_size` divides `total_size`; all three are
/// powers of two. Validated once at construction, so the access layer can
/// mask and divide without re-checking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashGeometry {
    page_size: u32,
    sector_size: u32,
    total_size: u32,
}

impl FlashGeometry {
    pub fn new(page_size: u32, sector_size: u32, total_size: u32) -> Result<Self, GeometryError> {
        for (name, value) in [
            ("page size", page_size),
            ("sector size", sector_size),
            ("total size", total_size),
        ] {
            if value == 0 || !value.is_power_of_two() {
                return Err(GeometryError::NotPowerOfTwo { name, value });
            }
        }
        if sector_size % page_size != 0 {
            return Err(GeometryError::PageSectorMismatch {
                page_size,
                sector_size,
            });
        }
        if total_size % sector_size != 0 {
            return Err(GeometryError::SectorTotalMismatch {
                sector_size,
                total_size,
            });
        }
        Ok(FlashGeometry {
            page_size,
            sector_size,
            total_size,
        })
    }

    /// Default 256-byte pages and 4 KiB sectors.
    pub fn with_total_size(total_size: u32) -> Result<Self, GeometryError> {
        Self::new(PAGE_SIZE, SECTOR_SIZE, total_size)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn sector_count(&self) -> u32 {
        self.total_size / self.sector_size
    }

    /// Base address of the sector containing `address`.
    pub fn sector_base(&self, address: u32) -> u32 {
        address & !(self.sector_size - 1)
    }

    /// True when `address..address+len` lies within the device.
    pub fn contains(&self, address: u32, len: usize) -> bool {
        u64::from(address) + len as u64 <= u64::from(self.total_size)
    }
}
