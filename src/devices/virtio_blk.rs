//! In-process virtio-blk backend (raw file disk).
//!
//! Serves the device half of a region created with [`create_region_file`]:
//! reads the avail ring, executes requests against a disk image and retires
//! them on the used ring. Used by the self-test and the integration tests in
//! place of a real device.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};
use virtio_bindings::virtio_blk::{VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP};
use vm_memory::{ByteValued, Bytes};

use crate::memory::{raw_slice, SharedRegion};
use crate::pool::{RequestHeader, RequestKind, SECTOR_SIZE};
use crate::signal::DeviceSignal;
use crate::transport::{region_size, ring_layout, DeviceConfig};
use crate::virtq::{Descriptor, RingMemory, UsedElem};
use crate::{Error, Result};

const S_OK: u8 = VIRTIO_BLK_S_OK as u8;
const S_IOERR: u8 = VIRTIO_BLK_S_IOERR as u8;
const S_UNSUPP: u8 = VIRTIO_BLK_S_UNSUPP as u8;

/// Create (or truncate) a region file for a ring of `queue_size` and write its
/// configuration header.
pub fn create_region_file<P: AsRef<Path>>(
    path: P,
    capacity_sectors: u64,
    feature_flags: u64,
    queue_size: u16,
) -> Result<()> {
    let path = path.as_ref();
    let size = region_size(&ring_layout(queue_size)?);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size as u64)?;

    let config = DeviceConfig {
        capacity_sectors,
        feature_flags,
    };
    file.write_all_at(config.as_slice(), 0)?;

    debug!(
        "Created virtio-blk region: path={}, size={} bytes, capacity={} sectors, features={:#x}",
        path.display(),
        size,
        capacity_sectors,
        feature_flags
    );
    Ok(())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BackendOptions {
    /// Reject writes with `UNSUPP`.
    pub read_only: bool,
    /// Ignore notifications until resumed.
    pub stalled: bool,
}

pub struct VirtioBlkBackend {
    // Keeps the mapping behind `ring` alive.
    _region: Arc<SharedRegion>,
    ring: RingMemory,
    disk: File,
    capacity_sectors: u64,
    options: BackendOptions,
    last_avail: u16,
    used_idx: u16,
    completed: Arc<AtomicU64>,
}

impl VirtioBlkBackend {
    /// Map `region` (laid out for `queue_size`) and serve it from `disk`.
    pub fn new(region: &Path, disk: &Path, queue_size: u16, options: BackendOptions) -> Result<Self> {
        let layout = ring_layout(queue_size)?;
        let region_file = OpenOptions::new().read(true).write(true).open(region)?;
        let shared = Arc::new(SharedRegion::map_file(&region_file, region_size(&layout))?);
        let config: DeviceConfig = shared.read_obj(0)?;
        let ring = RingMemory::new(shared.clone(), layout)?;

        let disk = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .open(disk)
            .map_err(|e| Error::Config(format!("virtio-blk open {}: {}", disk.display(), e)))?;

        debug!(
            "Creating virtio-blk backend: region={}, sectors={}, queue_size={}, {:?}",
            region.display(),
            config.capacity_sectors,
            queue_size,
            options
        );

        Ok(Self {
            _region: shared,
            ring,
            disk,
            capacity_sectors: config.capacity_sectors,
            options,
            last_avail: 0,
            used_idx: 0,
            completed: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn set_stalled(&mut self, stalled: bool) {
        self.options.stalled = stalled;
    }

    /// Requests retired since creation or the last reset.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Forget ring progress. The driver reinitialises the ring afterwards.
    pub fn reset(&mut self) {
        self.last_avail = 0;
        self.used_idx = 0;
        self.completed.store(0, Ordering::Relaxed);
        debug!("virtio-blk backend reset");
    }

    /// Retire every chain published on the avail ring. Returns how many.
    pub fn process_queue(&mut self) -> Result<usize> {
        if self.options.stalled {
            trace!("virtio-blk backend stalled, ignoring queue");
            return Ok(0);
        }

        let avail_idx = self.ring.avail_idx()?;
        let mut processed = 0;
        while self.last_avail != avail_idx {
            let head = self.ring.read_avail_entry(self.last_avail)?;
            let (status, written) = self.handle_request(head)?;

            self.ring.write_used_entry(
                self.used_idx,
                UsedElem {
                    id: head as u32,
                    len: written,
                },
            )?;
            self.used_idx = self.used_idx.wrapping_add(1);
            self.last_avail = self.last_avail.wrapping_add(1);
            self.completed.fetch_add(1, Ordering::Relaxed);
            self.ring.publish_used_idx(self.used_idx)?;

            if status != S_OK {
                trace!("virtio-blk request head={} completed with status={}", head, status);
            }
            processed += 1;
        }

        Ok(processed)
    }

    fn read_chain(&self, head: u16) -> Result<Option<Vec<Descriptor>>> {
        let size = self.ring.layout().size;
        let mut descs = Vec::new();
        let mut idx = head;
        loop {
            if idx >= size || descs.len() >= size as usize {
                return Ok(None);
            }
            let d = self.ring.read_desc(idx)?;
            descs.push(d);
            if !d.has_next() {
                return Ok(Some(descs));
            }
            idx = d.next;
        }
    }

    fn handle_request(&mut self, head: u16) -> Result<(u8, u32)> {
        let descs = match self.read_chain(head)? {
            Some(descs) if descs.len() == 2 => descs,
            _ => {
                warn!("virtio-blk: malformed chain at head={}", head);
                return Ok((S_IOERR, 0));
            }
        };
        let (hdr_desc, payload) = (descs[0], descs[1]);

        // Header must be readable by device
        if hdr_desc.is_write_only() || (hdr_desc.len as usize) < RequestHeader::SIZE || payload.len < 1 {
            return Ok((S_IOERR, 0));
        }

        // SAFETY: the driver keeps both buffers mapped while the chain is in flight.
        let hdr_mem = unsafe { raw_slice(hdr_desc.addr, RequestHeader::SIZE) };
        let payload_mem = unsafe { raw_slice(payload.addr, payload.len as usize) };

        let hdr: RequestHeader = hdr_mem
            .read_obj(0)
            .map_err(|e| Error::Memory(e.to_string()))?;
        let data_len = payload.len as usize - 1;

        let (status, written) = match RequestKind::from_raw(hdr.kind) {
            Some(RequestKind::Read) => {
                trace!("virtio-blk: READ request sector={} len={}", hdr.sector, data_len);
                if !payload.is_write_only() || !self.in_range(hdr.sector, data_len) {
                    (S_IOERR, 1)
                } else {
                    match self.read_disk(hdr.sector, data_len) {
                        Ok(buf) => {
                            payload_mem
                                .write_slice(&buf, 1)
                                .map_err(|e| Error::Memory(e.to_string()))?;
                            (S_OK, 1 + data_len as u32)
                        }
                        Err(e) => {
                            warn!("virtio-blk: read sector={} failed: {}", hdr.sector, e);
                            (S_IOERR, 1)
                        }
                    }
                }
            }
            Some(RequestKind::Write) if self.options.read_only => {
                warn!("virtio-blk: rejecting write request sector={} (ro backend)", hdr.sector);
                (S_UNSUPP, 1)
            }
            Some(RequestKind::Write) => {
                trace!("virtio-blk: WRITE request sector={} len={}", hdr.sector, data_len);
                if !self.in_range(hdr.sector, data_len) {
                    (S_IOERR, 1)
                } else {
                    let mut buf = vec![0u8; data_len];
                    payload_mem
                        .read_slice(&mut buf, 1)
                        .map_err(|e| Error::Memory(e.to_string()))?;
                    match self.disk.write_all_at(&buf, hdr.sector * SECTOR_SIZE as u64) {
                        Ok(()) => (S_OK, 1),
                        Err(e) => {
                            warn!("virtio-blk: write sector={} failed: {}", hdr.sector, e);
                            (S_IOERR, 1)
                        }
                    }
                }
            }
            Some(RequestKind::Flush) => match self.disk.sync_data() {
                Ok(()) => (S_OK, 1),
                Err(e) => {
                    warn!("virtio-blk: flush failed: {}", e);
                    (S_IOERR, 1)
                }
            },
            None => (S_UNSUPP, 1),
        };

        payload_mem
            .write_obj(status, 0)
            .map_err(|e| Error::Memory(e.to_string()))?;
        Ok((status, written))
    }

    fn in_range(&self, sector: u64, len: usize) -> bool {
        len % SECTOR_SIZE == 0
            && sector
                .checked_add((len / SECTOR_SIZE) as u64)
                .is_some_and(|end| end <= self.capacity_sectors)
    }

    fn read_disk(&self, sector: u64, len: usize) -> io::Result<Vec<u8>> {
        let offset = sector * SECTOR_SIZE as u64;
        let mut buf = vec![0u8; len];
        let mut n = 0usize;
        while n < buf.len() {
            match self.disk.read_at(&mut buf[n..], offset + n as u64) {
                Ok(0) => break, // EOF: keep remaining bytes zero-filled
                Ok(read_now) => n += read_now,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(buf)
    }

    /// Serve the region on a background thread.
    pub fn spawn(self) -> Result<BackendHandle> {
        let (tx, rx) = mpsc::channel();
        let completed = self.completed.clone();
        let thread = thread::Builder::new()
            .name("virtio-blk-backend".into())
            .spawn(move || self.run(rx))?;
        Ok(BackendHandle {
            signal: Arc::new(ChannelSignal { tx }),
            completed,
            thread: Some(thread),
        })
    }

    fn run(mut self, rx: Receiver<BackendMessage>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                BackendMessage::Notify(queue) => {
                    trace!("virtio-blk backend notified: queue={}", queue);
                    if let Err(e) = self.process_queue() {
                        warn!("virtio-blk: queue processing error: {}", e);
                    }
                }
                BackendMessage::Stall(stalled) => {
                    self.set_stalled(stalled);
                    if !stalled {
                        if let Err(e) = self.process_queue() {
                            warn!("virtio-blk: queue processing error: {}", e);
                        }
                    }
                }
                BackendMessage::Reset(ack) => {
                    self.reset();
                    let _ = ack.send(());
                }
                BackendMessage::Shutdown => break,
            }
        }
        debug!("virtio-blk backend stopped");
    }
}

enum BackendMessage {
    Notify(u16),
    Stall(bool),
    Reset(SyncSender<()>),
    Shutdown,
}

/// [`DeviceSignal`] that forwards to a spawned backend.
pub struct ChannelSignal {
    tx: Sender<BackendMessage>,
}

impl ChannelSignal {
    fn send(&self, msg: BackendMessage) -> io::Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "virtio-blk backend stopped"))
    }
}

impl DeviceSignal for ChannelSignal {
    fn notify(&self, queue_index: u16) -> io::Result<()> {
        self.send(BackendMessage::Notify(queue_index))
    }

    fn reset(&self) -> io::Result<()> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.send(BackendMessage::Reset(ack_tx))?;
        ack_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "virtio-blk backend stopped"))
    }
}

/// Running backend. Stopped on drop.
pub struct BackendHandle {
    signal: Arc<ChannelSignal>,
    completed: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl BackendHandle {
    pub fn signal(&self) -> Arc<dyn DeviceSignal> {
        self.signal.clone()
    }

    /// Stop (or resume) serving notifications. Resuming drains the avail ring.
    pub fn set_stalled(&self, stalled: bool) -> Result<()> {
        Ok(self.signal.send(BackendMessage::Stall(stalled))?)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.signal.send(BackendMessage::Shutdown);
            if thread.join().is_err() {
                warn!("virtio-blk backend thread panicked");
            }
        }
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
