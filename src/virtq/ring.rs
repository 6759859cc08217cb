//! Driver side of a split virtqueue
//!
//! [`VirtqueueRing`] owns the descriptor free list and the producer half of the
//! ring. The descriptor table in shared memory is write-only from here: the
//! free list and chain links are tracked in a private shadow table, so a device
//! scribbling over the shared table can never corrupt allocation state.
//!
//! Ordering contract:
//! - descriptor and avail-slot writes happen before the avail index store
//!   (release), which happens before the notify call (full fence);
//! - the used index is loaded with acquire before any used entry is read.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::signal::DeviceSignal;
use crate::virtq::{DescFlags, Descriptor, RingMemory, Segment};
use crate::{Error, Result};

/// A retired chain reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub head: u16,
    pub bytes_written: u32,
}

/// Snapshot of the driver-side counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingState {
    pub free_head: u16,
    pub num_free: u16,
    pub last_used_seen: u16,
    pub avail_idx: u16,
    pub pending_notify: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChainState {
    /// Not the head of an outstanding chain.
    Idle,
    /// Published on the avail ring, not yet seen on the used ring.
    InFlight,
    /// Seen on the used ring, descriptors not yet returned.
    Retired,
}

pub struct VirtqueueRing {
    memory: RingMemory,
    signal: Arc<dyn DeviceSignal>,
    queue_index: u16,
    size: u16,
    descs: Vec<Descriptor>,
    in_use: Vec<bool>,
    chains: Vec<ChainState>,
    free_head: u16,
    num_free: u16,
    last_used_seen: u16,
    avail_idx: u16,
    pending_notify: u16,
}

impl VirtqueueRing {
    /// Take over `memory` and initialise an empty ring in it.
    pub fn new(memory: RingMemory, queue_index: u16, signal: Arc<dyn DeviceSignal>) -> Result<Self> {
        let size = memory.layout().size;
        if size == 0 || !size.is_power_of_two() {
            return Err(Error::InvalidCapacity(size as u32));
        }

        let n = size as usize;
        let mut ring = Self {
            memory,
            signal,
            queue_index,
            size,
            descs: vec![Descriptor::default(); n],
            in_use: vec![false; n],
            chains: vec![ChainState::Idle; n],
            free_head: 0,
            num_free: size,
            last_used_seen: 0,
            avail_idx: 0,
            pending_notify: 0,
        };
        ring.init()?;
        debug!("virtqueue {} initialised: size={}", queue_index, size);
        Ok(ring)
    }

    fn init(&mut self) -> Result<()> {
        self.memory.clear()?;
        for i in 0..self.size {
            // Last descriptor links to the end-of-chain sentinel, `size`.
            self.descs[i as usize] = Descriptor::new(0, 0, DescFlags::empty(), i + 1);
            self.memory.write_desc(i, self.descs[i as usize])?;
        }
        self.in_use.fill(false);
        self.chains.fill(ChainState::Idle);
        self.free_head = 0;
        self.num_free = self.size;
        self.last_used_seen = 0;
        self.avail_idx = 0;
        self.pending_notify = 0;
        Ok(())
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn queue_index(&self) -> u16 {
        self.queue_index
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// End-of-chain marker: never a valid descriptor index.
    pub fn sentinel(&self) -> u16 {
        self.size
    }

    pub fn state(&self) -> RingState {
        RingState {
            free_head: self.free_head,
            num_free: self.num_free,
            last_used_seen: self.last_used_seen,
            avail_idx: self.avail_idx,
            pending_notify: self.pending_notify,
        }
    }

    /// Head index the next successful `submit_chain` will return.
    pub fn peek_free_head(&self) -> Option<u16> {
        (self.num_free > 0 && self.free_head < self.size).then_some(self.free_head)
    }

    /// Chains published and not yet returned with `free_chain`.
    pub fn outstanding(&self) -> usize {
        self.chains.iter().filter(|s| **s != ChainState::Idle).count()
    }

    /// The free list in link order.
    pub fn free_list(&self) -> Vec<u16> {
        let mut out = Vec::with_capacity(self.num_free as usize);
        let mut idx = self.free_head;
        while idx < self.size && out.len() < self.size as usize {
            out.push(idx);
            idx = self.descs[idx as usize].next;
        }
        out
    }

    /// Descriptor indices of the chain starting at `head`.
    pub fn chain_of(&self, head: u16) -> Result<Vec<u16>> {
        if head >= self.size || !self.in_use[head as usize] {
            return Err(Error::Protocol(format!(
                "head {} is not an allocated descriptor",
                head
            )));
        }
        let mut chain = vec![head];
        let mut idx = head;
        while self.descs[idx as usize].has_next() {
            idx = self.descs[idx as usize].next;
            if idx >= self.size || !self.in_use[idx as usize] {
                return Err(Error::Protocol(format!(
                    "chain {} links to invalid descriptor {}",
                    head, idx
                )));
            }
            if chain.len() >= self.size as usize {
                return Err(Error::Protocol(format!("chain {} loops", head)));
            }
            chain.push(idx);
        }
        Ok(chain)
    }

    /// Allocate one descriptor per segment, link them and publish the head.
    ///
    /// All-or-nothing: on error neither the shared ring nor any counter changes.
    pub fn submit_chain(&mut self, segments: &[Segment]) -> Result<u16> {
        if segments.is_empty() {
            return Err(Error::InvalidRequest("empty descriptor chain".into()));
        }
        if segments.len() > self.num_free as usize {
            return Err(Error::QueueFull {
                needed: segments.len(),
                free: self.num_free as usize,
            });
        }

        let mut indices = Vec::with_capacity(segments.len());
        let mut cursor = self.free_head;
        for _ in 0..segments.len() {
            if cursor >= self.size || self.in_use[cursor as usize] {
                return Err(Error::Protocol(format!(
                    "free list corrupt at {} with {} descriptors counted free",
                    cursor, self.num_free
                )));
            }
            indices.push(cursor);
            cursor = self.descs[cursor as usize].next;
        }

        let head = indices[0];
        for (i, (&idx, seg)) in indices.iter().zip(segments).enumerate() {
            let mut flags = DescFlags::empty();
            if seg.writable {
                flags |= DescFlags::WRITE;
            }
            let next = match indices.get(i + 1) {
                Some(&next) => {
                    flags |= DescFlags::NEXT;
                    next
                }
                None => 0,
            };
            let desc = Descriptor::new(seg.addr, seg.len, flags, next);
            self.memory.write_desc(idx, desc)?;
            self.descs[idx as usize] = desc;
            self.in_use[idx as usize] = true;
        }
        self.free_head = cursor;
        self.num_free -= segments.len() as u16;
        self.chains[head as usize] = ChainState::InFlight;

        self.memory.write_avail_entry(self.avail_idx, head)?;
        // Descriptors and slot must be visible before the index moves.
        fence(Ordering::SeqCst);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.memory.publish_avail_idx(self.avail_idx)?;
        self.pending_notify = self.pending_notify.wrapping_add(1);

        trace!(
            "virtqueue {}: submitted chain head={} descs={:?} avail_idx={}",
            self.queue_index,
            head,
            indices,
            self.avail_idx
        );
        Ok(head)
    }

    /// Drain the used-ring entries visible right now.
    ///
    /// Each head is reported exactly once; a head that is out of range or not
    /// in flight is a protocol violation. That error is fatal for the ring:
    /// entries drained earlier in the same call are not returned and their
    /// chains stay retired until [`reclaim_all`](Self::reclaim_all).
    pub fn reap_completions(&mut self) -> Result<Vec<Completion>> {
        let used_idx = self.memory.used_idx()?;
        let pending = used_idx.wrapping_sub(self.last_used_seen);
        if pending > self.size {
            return Err(Error::Protocol(format!(
                "device reports {} completions on a ring of {}",
                pending, self.size
            )));
        }

        let mut done = Vec::with_capacity(pending as usize);
        while self.last_used_seen != used_idx {
            let elem = self.memory.read_used_entry(self.last_used_seen)?;
            if elem.id >= self.size as u32 {
                return Err(Error::Protocol(format!(
                    "used entry {} names head {} outside ring of {}",
                    self.last_used_seen, elem.id, self.size
                )));
            }
            let head = elem.id as u16;
            match self.chains[head as usize] {
                ChainState::InFlight => self.chains[head as usize] = ChainState::Retired,
                state => {
                    return Err(Error::Protocol(format!(
                        "used entry {} retires head {} which is {:?}",
                        self.last_used_seen, head, state
                    )))
                }
            }
            self.last_used_seen = self.last_used_seen.wrapping_add(1);
            trace!(
                "virtqueue {}: reaped head={} len={}",
                self.queue_index,
                head,
                elem.len
            );
            done.push(Completion {
                head,
                bytes_written: elem.len,
            });
        }
        Ok(done)
    }

    /// Return every descriptor of a retired chain to the free list.
    pub fn free_chain(&mut self, head: u16) -> Result<usize> {
        if head >= self.size || self.chains[head as usize] != ChainState::Retired {
            return Err(Error::Protocol(format!(
                "free_chain({}) on a chain that has not been retired",
                head
            )));
        }
        let chain = self.chain_of(head)?;

        // Chain links already run head..last; splice the tail onto the free list.
        for &idx in &chain {
            self.in_use[idx as usize] = false;
            self.descs[idx as usize].flags = 0;
        }
        if let Some(&last) = chain.last() {
            self.descs[last as usize].next = self.free_head;
        }
        self.free_head = head;
        self.num_free += chain.len() as u16;
        self.chains[head as usize] = ChainState::Idle;

        trace!(
            "virtqueue {}: freed chain head={} ({} descs), num_free={}",
            self.queue_index,
            head,
            chain.len(),
            self.num_free
        );
        Ok(chain.len())
    }

    /// Signal the device if anything was published since the last notify.
    ///
    /// Returns whether the device was signalled. If the signal fails the
    /// pending count is kept, so the next notify covers those chains too.
    pub fn notify(&mut self) -> Result<bool> {
        if self.pending_notify == 0 {
            return Ok(false);
        }
        // The avail index store must be visible before the device is kicked.
        fence(Ordering::SeqCst);
        self.signal.notify(self.queue_index)?;
        self.pending_notify = 0;
        Ok(true)
    }

    /// Forget every outstanding chain and reinitialise the ring.
    ///
    /// Only valid once the device has been reset and no longer reads the ring.
    /// Returns the number of chains that were outstanding.
    pub fn reclaim_all(&mut self) -> Result<usize> {
        let outstanding = self.outstanding();
        self.init()?;
        debug!(
            "virtqueue {}: reclaimed {} outstanding chains",
            self.queue_index, outstanding
        );
        Ok(outstanding)
    }

    #[cfg(test)]
    pub(crate) fn memory(&self) -> &RingMemory {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::memory::SharedRegion;
    use crate::virtq::{RingLayout, UsedElem};

    #[derive(Default)]
    struct CountingSignal {
        notifies: AtomicUsize,
    }

    impl DeviceSignal for CountingSignal {
        fn notify(&self, _queue_index: u16) -> io::Result<()> {
            self.notifies.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn reset(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn ring_memory(size: u32) -> RingMemory {
        let layout = RingLayout::new(16, size).unwrap();
        let region = Arc::new(SharedRegion::anonymous(layout.end).unwrap());
        RingMemory::new(region, layout).unwrap()
    }

    fn create_ring(size: u32) -> (VirtqueueRing, Arc<CountingSignal>) {
        let signal = Arc::new(CountingSignal::default());
        let ring = VirtqueueRing::new(ring_memory(size), 0, signal.clone()).unwrap();
        (ring, signal)
    }

    fn two_segments() -> [Segment; 2] {
        [
            Segment::readable(0x1000, 16),
            Segment::writable(0x2000, 513),
        ]
    }

    /// Device half: consume one avail entry and retire it.
    struct FakeDevice {
        memory: RingMemory,
        last_avail: u16,
        used_idx: u16,
    }

    impl FakeDevice {
        fn new(ring: &VirtqueueRing) -> Self {
            Self {
                memory: ring.memory().clone(),
                last_avail: 0,
                used_idx: 0,
            }
        }

        fn complete_next(&mut self, len: u32) -> u16 {
            assert_ne!(self.memory.avail_idx().unwrap(), self.last_avail);
            let head = self.memory.read_avail_entry(self.last_avail).unwrap();
            self.last_avail = self.last_avail.wrapping_add(1);
            self.retire(head, len);
            head
        }

        fn retire(&mut self, head: u16, len: u32) {
            self.memory
                .write_used_entry(self.used_idx, UsedElem { id: head as u32, len })
                .unwrap();
            self.used_idx = self.used_idx.wrapping_add(1);
            self.memory.publish_used_idx(self.used_idx).unwrap();
        }
    }

    #[test]
    fn test_init_rejects_non_power_of_two() {
        let region = Arc::new(SharedRegion::anonymous(4096).unwrap());
        // Bypass RingLayout validation to exercise the ring's own check.
        let layout = RingLayout {
            size: 6,
            desc_offset: 0,
            avail_offset: 96,
            used_offset: 116,
            end: 170,
        };
        let memory = RingMemory::new(region, layout).unwrap();
        let result = VirtqueueRing::new(memory, 0, Arc::new(CountingSignal::default()));
        assert!(matches!(result, Err(Error::InvalidCapacity(6))));
    }

    #[test]
    fn test_init_links_free_list() {
        let (ring, _) = create_ring(8);
        assert_eq!(ring.num_free(), 8);
        assert_eq!(ring.free_list(), (0..8).collect::<Vec<u16>>());
        assert_eq!(ring.memory().read_desc(7).unwrap().next, ring.sentinel());
        assert_eq!(ring.memory().avail_idx().unwrap(), 0);
        assert_eq!(ring.memory().used_idx().unwrap(), 0);
    }

    #[test]
    fn test_submit_links_chain_in_shared_table() {
        let (mut ring, _) = create_ring(8);
        let segs = [
            Segment::readable(0x1000, 16),
            Segment::readable(0x2000, 512),
            Segment::writable(0x3000, 1),
        ];
        let head = ring.submit_chain(&segs).unwrap();
        assert_eq!(head, 0);

        let d0 = ring.memory().read_desc(0).unwrap();
        let d1 = ring.memory().read_desc(1).unwrap();
        let d2 = ring.memory().read_desc(2).unwrap();
        assert_eq!((d0.addr, d0.len, d0.flags(), d0.next), (0x1000, 16, DescFlags::NEXT, 1));
        assert_eq!((d1.addr, d1.len, d1.flags(), d1.next), (0x2000, 512, DescFlags::NEXT, 2));
        assert_eq!(d2.flags(), DescFlags::WRITE);

        assert_eq!(ring.memory().read_avail_entry(0).unwrap(), head);
        assert_eq!(ring.memory().avail_idx().unwrap(), 1);
        assert_eq!(ring.state().pending_notify, 1);
    }

    #[test]
    fn test_num_free_tracks_segments_and_indices_disjoint() {
        let (mut ring, _) = create_ring(16);
        let mut seen = HashSet::new();
        let mut expected_free = 16u16;
        for len in [1usize, 3, 2, 4, 1, 5] {
            let segs: Vec<Segment> = (0..len)
                .map(|i| Segment::readable(0x1000 * i as u64, 8))
                .collect();
            let head = ring.submit_chain(&segs).unwrap();
            expected_free -= len as u16;
            assert_eq!(ring.num_free(), expected_free);
            for idx in ring.chain_of(head).unwrap() {
                assert!(idx < ring.size());
                assert!(seen.insert(idx), "descriptor {} handed out twice", idx);
            }
        }
        assert_eq!(seen.len(), 16);
        assert_eq!(ring.peek_free_head(), None);
    }

    #[test]
    fn test_allocate_free_round_trip_restores_shape() {
        let (mut ring, _) = create_ring(8);
        let mut device = FakeDevice::new(&ring);
        let before_list = ring.free_list();
        let before = ring.state();

        let head = ring.submit_chain(&two_segments()).unwrap();
        assert_eq!(ring.num_free(), 6);
        assert_eq!(device.complete_next(513), head);

        let done = ring.reap_completions().unwrap();
        assert_eq!(done, vec![Completion { head, bytes_written: 513 }]);
        assert_eq!(ring.free_chain(head).unwrap(), 2);

        assert_eq!(ring.free_list(), before_list);
        assert_eq!(ring.num_free(), before.num_free);
        assert_eq!(ring.state().free_head, before.free_head);
    }

    #[test]
    fn test_free_chain_returns_every_descriptor() {
        let (mut ring, _) = create_ring(4);
        let mut device = FakeDevice::new(&ring);
        let segs = [
            Segment::readable(0x1000, 16),
            Segment::readable(0x2000, 512),
            Segment::writable(0x3000, 1),
        ];
        // Repeat far more often than the ring is large: freeing only the head
        // would exhaust the ring on the second iteration.
        for _ in 0..64 {
            let head = ring.submit_chain(&segs).unwrap();
            device.complete_next(1);
            ring.reap_completions().unwrap();
            assert_eq!(ring.free_chain(head).unwrap(), 3);
            assert_eq!(ring.num_free(), 4);
        }
    }

    #[test]
    fn test_queue_full_leaves_state_unchanged() {
        let (mut ring, _) = create_ring(4);
        ring.submit_chain(&[Segment::readable(0x1000, 16)]).unwrap();
        ring.submit_chain(&two_segments()).unwrap();

        let state = ring.state();
        let bytes = ring.memory().snapshot().unwrap();
        let list = ring.free_list();

        let err = ring.submit_chain(&two_segments()).unwrap_err();
        assert!(matches!(err, Error::QueueFull { needed: 2, free: 1 }));
        assert!(err.is_retryable());

        assert_eq!(ring.state(), state);
        assert_eq!(ring.memory().snapshot().unwrap(), bytes);
        assert_eq!(ring.free_list(), list);
    }

    #[test]
    fn test_capacity_four_scenario() {
        let (mut ring, _) = create_ring(4);
        let mut device = FakeDevice::new(&ring);

        let first = ring.submit_chain(&two_segments()).unwrap();
        let second = ring.submit_chain(&two_segments()).unwrap();
        assert_ne!(first, second);
        assert_eq!(ring.num_free(), 0);
        assert!(matches!(
            ring.submit_chain(&two_segments()),
            Err(Error::QueueFull { needed: 2, free: 0 })
        ));

        device.complete_next(1);
        let done = ring.reap_completions().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].head, first);
        ring.free_chain(first).unwrap();
        assert_eq!(ring.num_free(), 2);

        let third = ring.submit_chain(&two_segments()).unwrap();
        assert_eq!(third, first);
        assert_eq!(ring.num_free(), 0);
    }

    #[test]
    fn test_reap_drains_only_visible_entries() {
        let (mut ring, _) = create_ring(8);
        let mut device = FakeDevice::new(&ring);
        let a = ring.submit_chain(&two_segments()).unwrap();
        let b = ring.submit_chain(&two_segments()).unwrap();

        assert!(ring.reap_completions().unwrap().is_empty());
        device.complete_next(1);
        assert_eq!(ring.reap_completions().unwrap()[0].head, a);
        assert!(ring.reap_completions().unwrap().is_empty());
        device.complete_next(1);
        assert_eq!(ring.reap_completions().unwrap()[0].head, b);
    }

    #[test]
    fn test_out_of_order_completions() {
        let (mut ring, _) = create_ring(8);
        let mut device = FakeDevice::new(&ring);
        let a = ring.submit_chain(&two_segments()).unwrap();
        let b = ring.submit_chain(&two_segments()).unwrap();

        device.retire(b, 7);
        device.retire(a, 9);
        let done = ring.reap_completions().unwrap();
        assert_eq!(
            done,
            vec![
                Completion { head: b, bytes_written: 7 },
                Completion { head: a, bytes_written: 9 },
            ]
        );
        ring.free_chain(a).unwrap();
        ring.free_chain(b).unwrap();
        assert_eq!(ring.num_free(), 8);
    }

    #[test]
    fn test_indices_wrap_at_u16() {
        let (mut ring, _) = create_ring(4);
        let mut device = FakeDevice::new(&ring);
        let rounds = u16::MAX as u32 + 10;
        for _ in 0..rounds {
            let head = ring.submit_chain(&two_segments()).unwrap();
            assert!(head < ring.size());
            device.complete_next(1);
            let done = ring.reap_completions().unwrap();
            assert_eq!(done.len(), 1);
            assert!(done[0].head < ring.size());
            ring.free_chain(done[0].head).unwrap();
        }
        let state = ring.state();
        assert_eq!(state.avail_idx, (rounds % 65536) as u16);
        assert_eq!(state.last_used_seen, state.avail_idx);
        assert_eq!(ring.num_free(), 4);
    }

    #[test]
    fn test_duplicate_retirement_is_protocol_violation() {
        let (mut ring, _) = create_ring(4);
        let mut device = FakeDevice::new(&ring);
        let head = ring.submit_chain(&two_segments()).unwrap();
        device.complete_next(1);
        ring.reap_completions().unwrap();

        device.retire(head, 1);
        assert!(matches!(ring.reap_completions(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_out_of_range_head_is_protocol_violation() {
        let (mut ring, _) = create_ring(4);
        let mut device = FakeDevice::new(&ring);
        ring.submit_chain(&two_segments()).unwrap();
        device.retire(4, 1);
        assert!(matches!(ring.reap_completions(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_free_chain_requires_retirement() {
        let (mut ring, _) = create_ring(4);
        let head = ring.submit_chain(&two_segments()).unwrap();
        assert!(matches!(ring.free_chain(head), Err(Error::Protocol(_))));
        assert!(matches!(ring.free_chain(9), Err(Error::Protocol(_))));
        assert_eq!(ring.num_free(), 2);
    }

    #[test]
    fn test_notify_only_when_pending() {
        let (mut ring, signal) = create_ring(4);
        assert!(!ring.notify().unwrap());
        assert_eq!(signal.notifies.load(Ordering::SeqCst), 0);

        ring.submit_chain(&[Segment::readable(0x1000, 16)]).unwrap();
        ring.submit_chain(&[Segment::readable(0x2000, 16)]).unwrap();
        assert!(ring.notify().unwrap());
        assert_eq!(signal.notifies.load(Ordering::SeqCst), 1);
        assert_eq!(ring.state().pending_notify, 0);

        assert!(!ring.notify().unwrap());
        assert_eq!(signal.notifies.load(Ordering::SeqCst), 1);
    }

    /// Fails the first notify, accepts the rest.
    #[derive(Default)]
    struct FailOnceSignal {
        calls: AtomicUsize,
    }

    impl DeviceSignal for FailOnceSignal {
        fn notify(&self, _queue_index: u16) -> io::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "kick lost"));
            }
            Ok(())
        }

        fn reset(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_notify_keeps_pending() {
        let signal = Arc::new(FailOnceSignal::default());
        let mut ring = VirtqueueRing::new(ring_memory(4), 0, signal.clone()).unwrap();
        ring.submit_chain(&two_segments()).unwrap();

        assert!(matches!(ring.notify(), Err(Error::Io(_))));
        assert_eq!(ring.state().pending_notify, 1);

        ring.submit_chain(&two_segments()).unwrap();
        assert_eq!(ring.state().pending_notify, 2);
        assert!(ring.notify().unwrap());
        assert_eq!(ring.state().pending_notify, 0);
        assert_eq!(signal.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reclaim_all_resets_ring() {
        let (mut ring, _) = create_ring(4);
        ring.submit_chain(&two_segments()).unwrap();
        ring.submit_chain(&[Segment::readable(0x1000, 16)]).unwrap();
        assert_eq!(ring.outstanding(), 2);

        assert_eq!(ring.reclaim_all().unwrap(), 2);
        assert_eq!(ring.num_free(), 4);
        assert_eq!(ring.outstanding(), 0);
        assert_eq!(ring.free_list(), vec![0, 1, 2, 3]);
        assert_eq!(ring.memory().avail_idx().unwrap(), 0);
    }

    #[test]
    fn test_publication_visible_to_device_thread() {
        let (mut ring, _) = create_ring(64);
        let memory = ring.memory().clone();
        let total = 2000u16;

        let device = std::thread::spawn(move || {
            let mut last_avail = 0u16;
            let mut used_idx = 0u16;
            while used_idx != total {
                let avail = memory.avail_idx().unwrap();
                while last_avail != avail {
                    let head = memory.read_avail_entry(last_avail).unwrap();
                    let desc = memory.read_desc(head).unwrap();
                    // Every published head must already carry its contents.
                    assert_eq!(desc.addr, 0xabc0_0000 + desc.len as u64);
                    memory
                        .write_used_entry(used_idx, UsedElem { id: head as u32, len: desc.len })
                        .unwrap();
                    used_idx = used_idx.wrapping_add(1);
                    memory.publish_used_idx(used_idx).unwrap();
                    last_avail = last_avail.wrapping_add(1);
                }
                std::thread::yield_now();
            }
        });

        let mut submitted = 0u16;
        let mut completed = 0u16;
        while completed < total {
            while submitted < total && ring.num_free() > 0 {
                let len = submitted as u32 + 1;
                ring.submit_chain(&[Segment::readable(0xabc0_0000 + len as u64, len)])
                    .unwrap();
                submitted += 1;
            }
            ring.notify().unwrap();
            for c in ring.reap_completions().unwrap() {
                ring.free_chain(c.head).unwrap();
                completed += 1;
            }
        }
        device.join().unwrap();
        assert_eq!(ring.num_free(), 64);
    }
}
