// Licensed under the Apache-2.0 license

//! The access layer proper: byte ranges in, aligned physical commands out.

use log::{trace, warn};

use flash_hil::{DeviceId, Ready, SpiNorTransport, TransportError};

use crate::error::{FlashAccessError, WriteError};
use crate::geometry::FlashGeometry;

/// Status polls granted to one page program.
pub const PROGRAM_POLL_BUDGET: u32 = 64;
/// Status polls granted to one sector erase.
pub const SECTOR_ERASE_POLL_BUDGET: u32 = 1024;

/// Byte-addressable view of one serial NOR flash chip.
///
/// Owns the transport and the cached [`DeviceId`]; several instances can
/// coexist for several chips. All operations are synchronous and take
/// `&mut self`; callers that share an instance across execution contexts
/// wrap it in their own lock, the bus has no reentrancy.
pub struct SpiNorFlash<T: SpiNorTransport> {
    transport: T,
    geometry: FlashGeometry,
    device_id: Option<DeviceId>,
}

fn program_error(err: TransportError) -> FlashAccessError {
    match err {
        TransportError::Protected => FlashAccessError::WriteProtected,
        other => FlashAccessError::Transport(other),
    }
}

fn erase_error(err: TransportError) -> FlashAccessError {
    match err {
        TransportError::Protected => FlashAccessError::EraseProtected,
        other => FlashAccessError::Transport(other),
    }
}

impl<T: SpiNorTransport> SpiNorFlash<T> {
    pub fn new(transport: T, geometry: FlashGeometry) -> Self {
        SpiNorFlash {
            transport,
            geometry,
            device_id: None,
        }
    }

    pub fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    /// The id cached by the last successful [`probe`](Self::probe), if any.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.device_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Identify the chip. The first successful call touches the bus; the
    /// id is then cached until [`release`](Self::release).
    pub fn probe(&mut self) -> Result<DeviceId, FlashAccessError> {
        if let Some(id) = self.device_id {
            return Ok(id);
        }
        let id = self.transport.probe()?;
        trace!(
            "probed flash {:#06x} over {:?} lanes",
            id.0,
            self.transport.bus_width()
        );
        self.device_id = Some(id);
        Ok(id)
    }

    /// Put the chip in its low-power idle state and drop the cached id.
    /// Safe to call without a prior probe, and repeatedly.
    pub fn release(&mut self) {
        self.transport.release();
        self.device_id = None;
    }

    /// Erase the **entire sector containing** `address`; the address is
    /// rounded down to the sector base internally. Everything previously
    /// programmed in that sector is lost, which is why writers erase once
    /// and then batch page writes instead of calling this per write.
    pub fn sector_erase(&mut self, address: u32) -> Result<(), FlashAccessError> {
        if !self.geometry.contains(address, 1) {
            return Err(FlashAccessError::OutOfRange {
                address,
                len: 1,
                capacity: self.geometry.total_size(),
            });
        }
        let base = self.geometry.sector_base(address);
        trace!("sector erase {:#x} (requested {:#x})", base, address);
        self.transport.erase_sector(base).map_err(erase_error)?;
        match self
            .transport
            .poll_ready(SECTOR_ERASE_POLL_BUDGET)
            .map_err(erase_error)?
        {
            Ready::Ready => Ok(()),
            Ready::Busy => {
                warn!("sector erase at {:#x} timed out", base);
                Err(FlashAccessError::EraseTimeout)
            }
        }
    }

    /// Erase the whole device. The poll budget scales with the sector
    /// count; a chip erase is far slower than a single sector erase.
    pub fn chip_erase(&mut self) -> Result<(), FlashAccessError> {
        let budget = SECTOR_ERASE_POLL_BUDGET.saturating_mul(self.geometry.sector_count());
        trace!("chip erase, poll budget {}", budget);
        self.transport.erase_chip().map_err(erase_error)?;
        match self.transport.poll_ready(budget).map_err(erase_error)? {
            Ready::Ready => Ok(()),
            Ready::Busy => {
                warn!("chip erase timed out");
                Err(FlashAccessError::EraseTimeout)
            }
        }
    }

    /// Read `buf.len()` bytes starting at `address`. No alignment
    /// constraints. When any chunk fails the whole operation has failed;
    /// chunks read before the failure are left in `buf` but carry no
    /// partial-success meaning.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashAccessError> {
        if buf.is_empty() {
            return Ok(());
        }
        if !self.geometry.contains(address, buf.len()) {
            return Err(FlashAccessError::OutOfRange {
                address,
                len: buf.len(),
                capacity: self.geometry.total_size(),
            });
        }
        // Only the transport's single-transfer ceiling forces a split here.
        let max_chunk = self.transport.max_transfer_len().max(1);
        let mut done = 0;
        while done < buf.len() {
            let chunk = max_chunk.min(buf.len() - done);
            self.transport
                .read_bytes(address + done as u32, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Program `data` starting at `address`, assuming the target range was
    /// erased beforehand. The range is split into page-confined sub-ranges
    /// because a page-program command that crosses a page boundary wraps
    /// silently in hardware. On failure, `WriteError::written` is the exact
    /// count of bytes already programmed, so callers can resume or abort.
    ///
    /// No implicit erase happens here; see [`sector_erase`](Self::sector_erase).
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), WriteError> {
        if data.is_empty() {
            return Ok(());
        }
        if !self.geometry.contains(address, data.len()) {
            return Err(WriteError {
                written: 0,
                source: FlashAccessError::OutOfRange {
                    address,
                    len: data.len(),
                    capacity: self.geometry.total_size(),
                },
            });
        }

        let page_size = self.geometry.page_size() as usize;
        let mut written = 0;
        while written < data.len() {
            let chunk_address = address + written as u32;
            let page_offset = chunk_address as usize % page_size;
            let chunk_len = (page_size - page_offset).min(data.len() - written);

            #[cfg(debug_assertions)]
            self.debug_check_erased(chunk_address, chunk_len);

            self.transport
                .program_page(chunk_address, &data[written..written + chunk_len])
                .map_err(|err| WriteError {
                    written,
                    source: program_error(err),
                })?;
            match self
                .transport
                .poll_ready(PROGRAM_POLL_BUDGET)
                .map_err(|err| WriteError {
                    written,
                    source: program_error(err),
                })? {
                Ready::Ready => {}
                Ready::Busy => {
                    warn!("page program at {:#x} timed out", chunk_address);
                    return Err(WriteError {
                        written,
                        source: FlashAccessError::WriteTimeout,
                    });
                }
            }
            written += chunk_len;
        }
        Ok(())
    }

    /// Erase-before-write is a caller contract this layer cannot enforce
    /// cheaply in production, so debug builds read the target range back
    /// and assert it is erased, surfacing silent corruption early.
    #[cfg(debug_assertions)]
    fn debug_check_erased(&mut self, address: u32, len: usize) {
        let mut target = vec![0u8; len];
        if self.transport.read_bytes(address, &mut target).is_ok() {
            debug_assert!(
                target.iter().all(|byte| *byte == 0xff),
                "programming non-erased flash at {address:#x}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flash_model::{ModelTransport, NorChip, StuckTransport, TransportCall};

    const CHIP: &str = "w25q80dv";

    fn flash() -> SpiNorFlash<ModelTransport> {
        let chip = NorChip::new(CHIP).unwrap();
        let geometry = FlashGeometry::new(
            chip.part().page_size,
            chip.part().sector_size,
            chip.part().chip_size,
        )
        .unwrap();
        SpiNorFlash::new(ModelTransport::new(chip), geometry)
    }

    #[test]
    fn test_probe_is_cached() {
        let mut flash = flash();
        let first = flash.probe().unwrap();
        let second = flash.probe().unwrap();
        assert_eq!(first, second);
        let probes = flash
            .transport()
            .calls()
            .iter()
            .filter(|call| **call == TransportCall::Probe)
            .count();
        assert_eq!(probes, 1);
        assert_eq!(flash.device_id(), Some(first));
    }

    #[test]
    fn test_release_invalidates_cached_id() {
        let mut flash = flash();
        let id = flash.probe().unwrap();
        flash.release();
        assert_eq!(flash.device_id(), None);
        // Next probe goes to the bus again and wakes the chip.
        assert_eq!(flash.probe().unwrap(), id);
        let probes = flash
            .transport()
            .calls()
            .iter()
            .filter(|call| **call == TransportCall::Probe)
            .count();
        assert_eq!(probes, 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut flash = flash();
        flash.release();
        flash.release();
        assert_eq!(flash.device_id(), None);
    }

    #[test]
    fn test_out_of_range_issues_no_commands() {
        let mut flash = flash();
        let capacity = flash.geometry().total_size();

        let mut buf = [0u8; 32];
        let err = flash.read(capacity - 16, &mut buf).unwrap_err();
        assert!(matches!(err, FlashAccessError::OutOfRange { .. }));

        let err = flash.write(capacity - 16, &[0u8; 32]).unwrap_err();
        assert_eq!(err.written, 0);
        assert!(matches!(err.source, FlashAccessError::OutOfRange { .. }));

        let err = flash.sector_erase(capacity).unwrap_err();
        assert!(matches!(err, FlashAccessError::OutOfRange { .. }));

        assert!(flash.transport().calls().is_empty());
    }

    #[test]
    fn test_zero_length_ops_are_noops() {
        let mut flash = flash();
        flash.read(0, &mut []).unwrap();
        flash.write(0, &[]).unwrap();
        assert!(flash.transport().calls().is_empty());
    }

    #[test]
    fn test_unaligned_write_splits_at_page_boundary() {
        let mut flash = flash();
        flash.sector_erase(0x1000).unwrap();

        let data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        flash.write(0x1000 + 10, &data).unwrap();

        // Bytes [10, 256) of the first page, then [0, 54) of the next.
        assert_eq!(
            flash.transport().program_calls(),
            vec![(0x100a, 246), (0x1100, 54)]
        );

        let mut readback = vec![0u8; 300];
        flash.read(0x100a, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn test_write_within_one_page_is_one_program() {
        let mut flash = flash();
        flash.sector_erase(0).unwrap();
        flash.write(0x20, &[1, 2, 3, 4]).unwrap();
        assert_eq!(flash.transport().program_calls(), vec![(0x20, 4)]);
    }

    #[test]
    fn test_programs_never_cross_page_boundaries() {
        let mut flash = flash();
        let page = flash.geometry().page_size();
        flash.sector_erase(0x3000).unwrap();
        flash.sector_erase(0x4000).unwrap();

        // Awkward offsets and lengths around page and sector edges,
        // disjoint so every target byte is still erased.
        let cases = [(0x3001, 700), (0x33ff, 2), (0x3aab, 257), (0x3f00, 512)];
        for (address, len) in cases {
            let data = vec![0xa5u8; len];
            flash.write(address, &data).unwrap();
        }

        for (address, len) in flash.transport().program_calls() {
            let last = address + len as u32 - 1;
            assert_eq!(address / page, last / page, "program spans pages");
        }
    }

    #[test]
    fn test_batched_writes_after_single_erase() {
        let mut flash = flash();
        flash.sector_erase(0x2000).unwrap();

        // Non-contiguous writes into one erased sector, no re-erase between.
        flash.write(0x2000, &[0x11; 16]).unwrap();
        flash.write(0x2800, &[0x22; 16]).unwrap();
        flash.write(0x2ff0, &[0x33; 16]).unwrap();

        let erases = flash
            .transport()
            .calls()
            .iter()
            .filter(|call| matches!(call, TransportCall::EraseSector { .. }))
            .count();
        assert_eq!(erases, 1);

        let mut buf = [0u8; 16];
        flash.read(0x2800, &mut buf).unwrap();
        assert_eq!(buf, [0x22; 16]);
    }

    #[test]
    fn test_sector_erase_rounds_down_and_spares_neighbors() {
        let mut flash = flash();
        flash.sector_erase(0).unwrap();
        flash.sector_erase(0x1000).unwrap();

        flash.write(0x0ff0, &[0x5a; 16]).unwrap();
        flash.write(0x1000, &[0xc3; 16]).unwrap();

        // Mid-sector address erases the whole containing sector.
        flash.sector_erase(0x1abc).unwrap();

        let mut erased = [0u8; 16];
        flash.read(0x1000, &mut erased).unwrap();
        assert_eq!(erased, [0xff; 16]);

        let mut neighbor = [0u8; 16];
        flash.read(0x0ff0, &mut neighbor).unwrap();
        assert_eq!(neighbor, [0x5a; 16]);
    }

    #[test]
    fn test_chip_erase_clears_everything() {
        let mut flash = flash();
        flash.write(0x5000, &[0x77; 64]).unwrap();
        flash.chip_erase().unwrap();

        let mut buf = [0u8; 64];
        flash.read(0x5000, &mut buf).unwrap();
        assert_eq!(buf, [0xff; 64]);
    }

    #[test]
    fn test_read_is_chunked_to_transport_limit() {
        let chip = NorChip::new(CHIP).unwrap();
        let geometry = FlashGeometry::new(
            chip.part().page_size,
            chip.part().sector_size,
            chip.part().chip_size,
        )
        .unwrap();
        let transport = ModelTransport::new(chip).with_max_transfer(16);
        let mut flash = SpiNorFlash::new(transport, geometry);

        let mut buf = [0u8; 100];
        flash.read(0x123, &mut buf).unwrap();

        let reads: Vec<usize> = flash
            .transport()
            .calls()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Read { len, .. } => Some(*len),
                _ => None,
            })
            .collect();
        assert_eq!(reads.len(), 7);
        assert!(reads.iter().all(|len| *len <= 16));
        assert_eq!(reads.iter().sum::<usize>(), 100);
    }

    #[test]
    fn test_partial_write_reports_bytes_programmed() {
        let mut flash = flash();
        flash.sector_erase(0x2000).unwrap();
        flash.transport_mut().fail_programs_after(1);

        let data = vec![0x42u8; 600];
        let err = flash.write(0x2000, &data).unwrap_err();
        // The first full page landed; the second program failed.
        assert_eq!(err.written, 256);
        assert!(matches!(err.source, FlashAccessError::Transport(_)));

        let mut buf = [0u8; 256];
        flash.read(0x2000, &mut buf).unwrap();
        assert_eq!(buf, [0x42; 256]);
    }

    #[test]
    fn test_stuck_device_times_out_instead_of_hanging() {
        let geometry = FlashGeometry::with_total_size(1 << 20).unwrap();
        let mut flash = SpiNorFlash::new(StuckTransport, geometry);

        let err = flash.write(0, &[0u8; 4]).unwrap_err();
        assert_eq!(err.written, 0);
        assert_eq!(err.source, FlashAccessError::WriteTimeout);

        assert_eq!(
            flash.sector_erase(0).unwrap_err(),
            FlashAccessError::EraseTimeout
        );
        assert_eq!(
            flash.chip_erase().unwrap_err(),
            FlashAccessError::EraseTimeout
        );
    }

    /// Accepts every command; the protection fault only shows up when the
    /// status register is polled afterwards.
    struct PollProtectedTransport;

    impl SpiNorTransport for PollProtectedTransport {
        fn probe(&mut self) -> Result<DeviceId, TransportError> {
            Ok(DeviceId::new(0xef, 0x14))
        }

        fn release(&mut self) {}

        fn read_bytes(&mut self, _address: u32, buf: &mut [u8]) -> Result<(), TransportError> {
            buf.fill(0xff);
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
            Err(TransportError::Protected)
        }
    }

    #[test]
    fn test_protection_during_status_poll_is_classified() {
        let geometry = FlashGeometry::with_total_size(1 << 20).unwrap();
        let mut flash = SpiNorFlash::new(PollProtectedTransport, geometry);

        let err = flash.write(0, &[0u8; 4]).unwrap_err();
        assert_eq!(err.written, 0);
        assert_eq!(err.source, FlashAccessError::WriteProtected);

        assert_eq!(
            flash.sector_erase(0).unwrap_err(),
            FlashAccessError::EraseProtected
        );
        assert_eq!(
            flash.chip_erase().unwrap_err(),
            FlashAccessError::EraseProtected
        );
    }

    #[test]
    fn test_protected_device_surfaces_protection_errors() {
        let mut flash = flash();
        flash.transport_mut().chip_mut().set_protected(true);

        let err = flash.write(0, &[0u8; 4]).unwrap_err();
        assert_eq!(err.written, 0);
        assert_eq!(err.source, FlashAccessError::WriteProtected);

        assert_eq!(
            flash.sector_erase(0).unwrap_err(),
            FlashAccessError::EraseProtected
        );
        assert_eq!(
            flash.chip_erase().unwrap_err(),
            FlashAccessError::EraseProtected
        );
    }
}
