//! Split-ring memory layout
//!
//! The ring occupies one contiguous span of a [`SharedRegion`]:
//!
//! ```text
//! base                       descriptor table   N x 16 bytes
//! base + 16N                 avail ring         flags, idx, ring[N] (u16), used_event
//! align4(avail end)          used ring          flags, idx, ring[N] {id, len}, avail_event
//! ```
//!
//! Both sides of the protocol go through [`RingMemory`]: the driver publishes
//! chains and reaps completions, the device (see `devices::virtio_blk`) reads
//! the avail side and writes the used side.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::memory::{align_up, SharedRegion};
use crate::virtq::{Descriptor, UsedElem};
use crate::{Error, Result};

/// Largest queue the split ring format allows.
pub const MAX_QUEUE_SIZE: u32 = 1 << 15;

const RING_HEADER: usize = 4;
const EVENT_SLOT: usize = 2;

/// Byte offsets of the three ring parts, relative to the start of the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingLayout {
    pub size: u16,
    pub desc_offset: usize,
    pub avail_offset: usize,
    pub used_offset: usize,
    pub end: usize,
}

impl RingLayout {
    /// Compute the layout of a ring of `size` entries starting at `base`.
    pub fn new(base: usize, size: u32) -> Result<Self> {
        if size == 0 || size > MAX_QUEUE_SIZE || !size.is_power_of_two() {
            return Err(Error::InvalidCapacity(size));
        }
        let n = size as usize;
        let desc_offset = base;
        let avail_offset = desc_offset + n * Descriptor::SIZE;
        let avail_end = avail_offset + RING_HEADER + n * 2 + EVENT_SLOT;
        let used_offset = align_up(avail_end, 4);
        let end = used_offset + RING_HEADER + n * UsedElem::SIZE + EVENT_SLOT;

        Ok(Self {
            size: size as u16,
            desc_offset,
            avail_offset,
            used_offset,
            end,
        })
    }

    /// Bytes spanned by the ring itself.
    pub fn ring_bytes(&self) -> usize {
        self.end - self.desc_offset
    }

    #[inline]
    fn mask(&self) -> u16 {
        self.size - 1
    }

    fn desc(&self, index: u16) -> usize {
        self.desc_offset + index as usize * Descriptor::SIZE
    }

    fn avail_idx(&self) -> usize {
        self.avail_offset + 2
    }

    fn avail_slot(&self, idx: u16) -> usize {
        self.avail_offset + RING_HEADER + (idx & self.mask()) as usize * 2
    }

    fn used_idx(&self) -> usize {
        self.used_offset + 2
    }

    fn used_slot(&self, idx: u16) -> usize {
        self.used_offset + RING_HEADER + (idx & self.mask()) as usize * UsedElem::SIZE
    }
}

/// A ring laid out inside a shared region.
#[derive(Clone, Debug)]
pub struct RingMemory {
    region: Arc<SharedRegion>,
    layout: RingLayout,
}

impl RingMemory {
    pub fn new(region: Arc<SharedRegion>, layout: RingLayout) -> Result<Self> {
        if layout.end > region.len() {
            return Err(Error::Memory(format!(
                "ring of {} entries needs {} bytes, region has {}",
                layout.size,
                layout.end,
                region.len()
            )));
        }
        Ok(Self { region, layout })
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    /// Zero the whole ring: descriptors, both headers, all slots.
    pub fn clear(&self) -> Result<()> {
        self.region
            .zero(self.layout.desc_offset, self.layout.ring_bytes())
    }

    pub fn write_desc(&self, index: u16, desc: Descriptor) -> Result<()> {
        self.region.write_obj(desc, self.layout.desc(index))
    }

    pub fn read_desc(&self, index: u16) -> Result<Descriptor> {
        self.region.read_obj(self.layout.desc(index))
    }

    // Driver side.

    /// Place `head` in the avail slot for running index `idx`.
    pub fn write_avail_entry(&self, idx: u16, head: u16) -> Result<()> {
        self.region.write_obj(head, self.layout.avail_slot(idx))
    }

    /// Publish the avail index; release ordering covers every earlier write.
    pub fn publish_avail_idx(&self, idx: u16) -> Result<()> {
        self.region
            .store_u16(idx, self.layout.avail_idx(), Ordering::Release)
    }

    /// Device's used index; acquire ordering makes its entries visible.
    pub fn used_idx(&self) -> Result<u16> {
        self.region.load_u16(self.layout.used_idx(), Ordering::Acquire)
    }

    pub fn read_used_entry(&self, idx: u16) -> Result<UsedElem> {
        self.region.read_obj(self.layout.used_slot(idx))
    }

    // Device side.

    pub fn avail_idx(&self) -> Result<u16> {
        self.region.load_u16(self.layout.avail_idx(), Ordering::Acquire)
    }

    pub fn read_avail_entry(&self, idx: u16) -> Result<u16> {
        self.region.read_obj(self.layout.avail_slot(idx))
    }

    pub fn write_used_entry(&self, idx: u16, elem: UsedElem) -> Result<()> {
        self.region.write_obj(elem, self.layout.used_slot(idx))
    }

    pub fn publish_used_idx(&self, idx: u16) -> Result<()> {
        self.region
            .store_u16(idx, self.layout.used_idx(), Ordering::Release)
    }

    /// Raw copy of every ring byte.
    #[cfg(test)]
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.layout.ring_bytes()];
        self.region.read_bytes(self.layout.desc_offset, &mut buf)?;
        Ok(buf)
    }
}
