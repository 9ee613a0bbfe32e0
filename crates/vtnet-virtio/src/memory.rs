//! Guest physical memory.
//!
//! Device models never hold raw pointers into guest RAM. Descriptor buffers are exposed as
//! `IoSlice`/`IoSliceMut` views that live only for the duration of a closure, so a buffer can
//! never be written past the length its descriptor declared.

use std::io::{IoSlice, IoSliceMut};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("guest range out of bounds: addr=0x{addr:x} len={len} size=0x{size:x}")]
    OutOfBounds { addr: u64, len: u64, size: u64 },

    #[error("guest buffers overlap at 0x{addr:x}")]
    Overlap { addr: u64 },
}

/// A contiguous guest-physical buffer, as described by a single virtqueue descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegion {
    pub addr: u64,
    pub len: u32,
}

impl GuestRegion {
    pub fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

/// Flat guest RAM mapped at guest-physical address 0.
///
/// Reads (TX buffers, descriptor tables) share the lock; writes (RX buffers, used ring) take it
/// exclusively.
#[derive(Debug)]
pub struct GuestRam {
    bytes: RwLock<Vec<u8>>,
}

impl GuestRam {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0; size]),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len() as u64
    }

    pub fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), GuestMemoryError> {
        let bytes = self
            .bytes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let range = checked_range(addr, out.len() as u64, bytes.len() as u64)?;
        out.copy_from_slice(&bytes[range]);
        Ok(())
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
        let mut bytes = self
            .bytes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let size = bytes.len() as u64;
        let range = checked_range(addr, data.len() as u64, size)?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Run `f` over read-only views of `regions`, in the order given.
    ///
    /// Guest memory stays locked while `f` runs, so `f` must not touch guest memory itself.
    pub fn with_slices<R>(
        &self,
        regions: &[GuestRegion],
        f: impl FnOnce(&[IoSlice<'_>]) -> R,
    ) -> Result<R, GuestMemoryError> {
        let bytes = self
            .bytes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let size = bytes.len() as u64;

        let mut slices = Vec::with_capacity(regions.len());
        for region in regions {
            let range = checked_range(region.addr, u64::from(region.len), size)?;
            slices.push(IoSlice::new(&bytes[range]));
        }
        Ok(f(&slices))
    }

    /// Run `f` over writable views of `regions`, in the order given. Guest memory is locked
    /// exclusively while `f` runs.
    ///
    /// Overlapping regions are rejected: handing out two mutable views of the same guest bytes is
    /// exactly what a hostile descriptor table would try.
    pub fn with_slices_mut<R>(
        &self,
        regions: &[GuestRegion],
        f: impl FnOnce(&mut [IoSliceMut<'_>]) -> R,
    ) -> Result<R, GuestMemoryError> {
        let mut bytes = self
            .bytes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let size = bytes.len() as u64;

        for region in regions {
            checked_range(region.addr, u64::from(region.len), size)?;
        }

        let mut order: Vec<usize> = (0..regions.len())
            .filter(|&i| regions[i].len != 0)
            .collect();
        order.sort_by_key(|&i| regions[i].addr);

        let mut views: Vec<&mut [u8]> = regions.iter().map(|_| Default::default()).collect();
        let mut rest: &mut [u8] = &mut bytes[..];
        let mut consumed = 0u64;
        for i in order {
            let region = regions[i];
            if region.addr < consumed {
                return Err(GuestMemoryError::Overlap { addr: region.addr });
            }
            let gap = (region.addr - consumed) as usize;
            let tail = std::mem::take(&mut rest);
            let (_, tail) = tail.split_at_mut(gap);
            let (view, tail) = tail.split_at_mut(region.len as usize);
            views[i] = view;
            rest = tail;
            consumed = region.addr + u64::from(region.len);
        }

        let mut slices: Vec<IoSliceMut<'_>> = views.into_iter().map(IoSliceMut::new).collect();
        Ok(f(&mut slices))
    }
}

fn checked_range(
    addr: u64,
    len: u64,
    size: u64,
) -> Result<std::ops::Range<usize>, GuestMemoryError> {
    let oob = GuestMemoryError::OutOfBounds { addr, len, size };
    let end = addr.checked_add(len).ok_or(oob)?;
    if end > size {
        return Err(oob);
    }
    Ok(addr as usize..end as usize)
}

pub fn read_u16_le(mem: &GuestRam, addr: u64) -> Result<u16, GuestMemoryError> {
    let mut buf = [0u8; 2];
    mem.read(addr, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u32_le(mem: &GuestRam, addr: u64) -> Result<u32, GuestMemoryError> {
    let mut buf = [0u8; 4];
    mem.read(addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64_le(mem: &GuestRam, addr: u64) -> Result<u64, GuestMemoryError> {
    let mut buf = [0u8; 8];
    mem.read(addr, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_u16_le(mem: &GuestRam, addr: u64, value: u16) -> Result<(), GuestMemoryError> {
    mem.write(addr, &value.to_le_bytes())
}

pub fn write_u32_le(mem: &GuestRam, addr: u64, value: u32) -> Result<(), GuestMemoryError> {
    mem.write(addr, &value.to_le_bytes())
}

pub fn write_u64_le(mem: &GuestRam, addr: u64, value: u64) -> Result<(), GuestMemoryError> {
    mem.write(addr, &value.to_le_bytes())
}
