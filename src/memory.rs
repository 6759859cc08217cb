//! Shared memory regions
//!
//! A [`SharedRegion`] is an owned mapping, either of a device file (shared with
//! the backend) or anonymous (the request buffer pool). All access goes through
//! vm-memory's volatile `Bytes` interface so reads of device-written memory are
//! never cached or elided by the compiler.

use std::fs::File;
use std::sync::atomic::Ordering;

use vm_memory::{ByteValued, Bytes, FileOffset, MmapRegion, VolatileMemory, VolatileSlice};

use crate::{Error, Result};

pub const PAGE_SIZE: usize = 0x1000;

/// Round `val` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// An owned memory mapping, unmapped on drop.
#[derive(Debug)]
pub struct SharedRegion {
    mmap: MmapRegion,
}

impl SharedRegion {
    /// Map `size` bytes of `file` read-write and shared, starting at offset 0.
    pub fn map_file(file: &File, size: usize) -> Result<Self> {
        let file_offset = FileOffset::new(file.try_clone()?, 0);
        let mmap = MmapRegion::<()>::from_file(file_offset, size)
            .map_err(|e| Error::Memory(format!("Failed to map {} bytes: {}", size, e)))?;
        Ok(Self { mmap })
    }

    /// Allocate a zeroed anonymous mapping of `size` bytes.
    pub fn anonymous(size: usize) -> Result<Self> {
        let mmap = MmapRegion::<()>::new(size).map_err(|e| {
            Error::Memory(format!("Failed to allocate {} bytes: {}", size, e))
        })?;
        Ok(Self { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Process address of `offset`, as handed to the device in descriptors.
    pub fn addr_of(&self, offset: usize) -> u64 {
        self.mmap.as_ptr() as u64 + offset as u64
    }

    fn slice(&self) -> VolatileSlice<'_> {
        self.mmap.as_volatile_slice()
    }

    pub fn read_obj<T: ByteValued>(&self, offset: usize) -> Result<T> {
        self.slice().read_obj(offset).map_err(|e| {
            Error::Memory(format!("Failed to read object at offset {:#x}: {}", offset, e))
        })
    }

    pub fn write_obj<T: ByteValued>(&self, val: T, offset: usize) -> Result<()> {
        self.slice().write_obj(val, offset).map_err(|e| {
            Error::Memory(format!("Failed to write object at offset {:#x}: {}", offset, e))
        })
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.slice().read_slice(buf, offset).map_err(|e| {
            Error::Memory(format!(
                "Failed to read {} bytes at offset {:#x}: {}",
                buf.len(),
                offset,
                e
            ))
        })
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.slice().write_slice(data, offset).map_err(|e| {
            Error::Memory(format!(
                "Failed to write {} bytes at offset {:#x}: {}",
                data.len(),
                offset,
                e
            ))
        })
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero(&self, offset: usize, len: usize) -> Result<()> {
        self.write_bytes(offset, &vec![0u8; len])
    }

    /// Atomic 16-bit load; `offset` must be 2-byte aligned.
    pub fn load_u16(&self, offset: usize, order: Ordering) -> Result<u16> {
        self.slice().load(offset, order).map_err(|e| {
            Error::Memory(format!("Failed to load u16 at offset {:#x}: {}", offset, e))
        })
    }

    /// Atomic 16-bit store; `offset` must be 2-byte aligned.
    pub fn store_u16(&self, val: u16, offset: usize, order: Ordering) -> Result<()> {
        self.slice().store(val, offset, order).map_err(|e| {
            Error::Memory(format!("Failed to store u16 at offset {:#x}: {}", offset, e))
        })
    }
}

/// Volatile view of `len` bytes at a raw process address taken from a descriptor.
///
/// # Safety
///
/// `addr..addr + len` must stay mapped and writable for `'a`, which holds for
/// request buffers while their chain is in flight.
pub unsafe fn raw_slice<'a>(addr: u64, len: usize) -> VolatileSlice<'a> {
    VolatileSlice::new(addr as *mut u8, len)
}
