//! Split-ring element types
//!
//! Field layouts follow the virtio 1.x split virtqueue: 16-byte descriptors and
//! 8-byte used-ring elements, little-endian.

use bitflags::bitflags;
use virtio_bindings::virtio_ring::{VRING_DESC_F_INDIRECT, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE};
use vm_memory::ByteValued;

bitflags! {
    /// Split-ring descriptor flags.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DescFlags: u16 {
        /// This marks a buffer as continuing via the next field.
        const NEXT = VRING_DESC_F_NEXT as u16;
        /// This marks a buffer as device write-only (otherwise device read-only).
        const WRITE = VRING_DESC_F_WRITE as u16;
        /// The buffer contains a list of buffer descriptors (never produced here).
        const INDIRECT = VRING_DESC_F_INDIRECT as u16;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Address of the buffer in the driver's address space.
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    /// Next descriptor of the chain, or of the free list while unused.
    pub next: u16,
}

// SAFETY: plain integers, `repr(C)`, no padding.
unsafe impl ByteValued for Descriptor {}

const _: () = assert!(std::mem::size_of::<Descriptor>() == 16);

impl Descriptor {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(addr: u64, len: u32, flags: DescFlags, next: u16) -> Self {
        Self {
            addr,
            len,
            flags: flags.bits(),
            next,
        }
    }

    #[inline]
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn has_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }

    #[inline]
    pub fn is_write_only(&self) -> bool {
        self.flags().contains(DescFlags::WRITE)
    }
}

/// One completion on the used ring.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsedElem {
    /// Head index of the retired chain (u32 for padding reasons).
    pub id: u32,
    /// Bytes the device wrote into the chain's write-only buffers.
    pub len: u32,
}

// SAFETY: plain integers, `repr(C)`, no padding.
unsafe impl ByteValued for UsedElem {}

const _: () = assert!(std::mem::size_of::<UsedElem>() == 8);

impl UsedElem {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// One buffer of a chain to submit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u32,
    /// Device may write into this buffer.
    pub writable: bool,
}

impl Segment {
    pub fn readable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            writable: false,
        }
    }

    pub fn writable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            writable: true,
        }
    }
}
