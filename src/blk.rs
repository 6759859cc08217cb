//! Synchronous virtio-blk client
//!
//! Requests are issued one at a time: build the two-descriptor chain over the
//! buffer paired with its head, publish it, kick the device, then poll the used
//! ring until that head comes back, the timeout expires or the device is reset.
//!
//! A request moves `Building -> Submitted -> {Completed | TimedOut | Reset}`.
//! A timed-out chain stays allocated: the device may still write its buffer.
//! It is reclaimed when the device finally retires it or on the next reset.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::pool::{BlkStatus, RequestKind, BLOCK_SECTORS, BLOCK_SIZE, SECTOR_SIZE};
use crate::signal::DeviceSignal;
use crate::transport::{DeviceConfig, DeviceTransport};
use crate::virtq::{Completion, VirtqueueRing};
use crate::{Error, Result};

/// Where a request slot stands. Indexed by chain head.
///
/// `Completed` and `Reset` are terminal for the request; the slot is reused by
/// the next request that gets the same head. `TimedOut` also covers a chain
/// whose notify failed: it is on the ring but nobody waits for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Building,
    Submitted,
    Completed,
    TimedOut,
    Reset,
}

/// Resets the device from any thread.
///
/// A request blocked in the poll loop on the client resolves as
/// [`Error::Reset`] and every outstanding chain is reclaimed.
/// The reset waits for a chain being published to be notified first, so the
/// device never sees an avail index from before the reset.
#[derive(Clone)]
pub struct ResetHandle {
    signal: Arc<dyn DeviceSignal>,
    epoch: Arc<AtomicU64>,
    // Held from the epoch check before publishing a chain through its notify.
    publish: Arc<Mutex<()>>,
}

impl ResetHandle {
    pub fn reset(&self) -> Result<()> {
        let _publish = self.lock_publish();
        self.signal.reset()?;
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("virtio-blk device reset issued (epoch {})", epoch);
        Ok(())
    }

    fn lock_publish(&self) -> MutexGuard<'_, ()> {
        self.publish.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

pub struct BlockDeviceClient {
    config: ClientConfig,
    device: DeviceConfig,
    // Declared before the transport: the ring holds the mapping alive.
    ring: VirtqueueRing,
    transport: DeviceTransport,
    requests: Vec<RequestState>,
    reset: ResetHandle,
    seen_epoch: u64,
}

impl BlockDeviceClient {
    /// Open `config.device`, kicking it through ioctls on its descriptor.
    pub fn open(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = DeviceTransport::open(&config.device, config.queue_size)?;
        let signal = Arc::new(transport.ioctl_signal()?);
        Self::from_transport(transport, config, signal)
    }

    /// Open `config.device` with an injected device signal.
    pub fn open_with_signal(config: ClientConfig, signal: Arc<dyn DeviceSignal>) -> Result<Self> {
        config.validate()?;
        let transport = DeviceTransport::open(&config.device, config.queue_size)?;
        Self::from_transport(transport, config, signal)
    }

    pub fn from_transport(
        transport: DeviceTransport,
        config: ClientConfig,
        signal: Arc<dyn DeviceSignal>,
    ) -> Result<Self> {
        let device = transport.config()?;
        let ring = VirtqueueRing::new(transport.ring_memory()?, config.queue_index, signal.clone())?;
        let pool_size = transport.pool()?.count();
        if pool_size != ring.size() {
            return Err(Error::Config(format!(
                "buffer pool of {} does not match ring of {}",
                pool_size,
                ring.size()
            )));
        }

        debug!(
            "virtio-blk client ready: device={}, capacity={} sectors, features={:#x}",
            transport.path().display(),
            device.capacity_sectors,
            device.feature_flags
        );

        Ok(Self {
            requests: vec![RequestState::Idle; ring.size() as usize],
            config,
            device,
            ring,
            transport,
            reset: ResetHandle {
                signal,
                epoch: Arc::new(AtomicU64::new(0)),
                publish: Arc::new(Mutex::new(())),
            },
            seen_epoch: 0,
        })
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.device.capacity_sectors
    }

    pub fn device_config(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn device_path(&self) -> &Path {
        self.transport.path()
    }

    pub fn ring(&self) -> &VirtqueueRing {
        &self.ring
    }

    pub fn request_state(&self, head: u16) -> Option<RequestState> {
        self.requests.get(head as usize).copied()
    }

    /// Change the completion timeout for later requests.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn reset_handle(&self) -> ResetHandle {
        self.reset.clone()
    }

    /// Read `count` bytes (whole sectors, at most one block) starting at `sector`.
    pub fn read(&mut self, sector: u64, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.read_into(sector, &mut buf)?;
        Ok(buf)
    }

    /// Fill `buf` (whole sectors, at most one block) from `sector`.
    pub fn read_into(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_transfer(sector, buf.len())?;
        let head = self.execute(RequestKind::Read, sector, buf.len(), None)?;
        let result = self.transport.pool()?.read_data(head, buf);
        self.release(head)?;
        result
    }

    /// Write `data` (whole sectors, at most one block) at `sector`.
    pub fn write(&mut self, sector: u64, data: &[u8]) -> Result<()> {
        self.check_transfer(sector, data.len())?;
        let head = self.execute(RequestKind::Write, sector, data.len(), Some(data))?;
        self.release(head)
    }

    /// Ask the device to make earlier writes durable.
    pub fn flush(&mut self) -> Result<()> {
        let head = self.execute(RequestKind::Flush, 0, 0, None)?;
        self.release(head)
    }

    /// Read any number of whole sectors, one block per request.
    pub fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(sector, buf.len())?;
        for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            self.read_into(sector + (i * BLOCK_SECTORS) as u64, chunk)?;
        }
        Ok(())
    }

    /// Write any number of whole sectors, one block per request.
    pub fn write_sectors(&mut self, sector: u64, data: &[u8]) -> Result<()> {
        self.check_range(sector, data.len())?;
        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            self.write(sector + (i * BLOCK_SECTORS) as u64, chunk)?;
        }
        Ok(())
    }

    /// Reset the device and reclaim every outstanding chain.
    pub fn reset(&mut self) -> Result<()> {
        self.reset.reset()?;
        self.reclaim_after_reset()
    }

    /// Release the ring, the mapping, the buffer pool and the device file.
    pub fn close(self) {
        let Self {
            ring,
            mut transport,
            ..
        } = self;
        drop(ring);
        transport.close();
    }

    fn check_range(&self, sector: u64, len: usize) -> Result<()> {
        if len == 0 || len % SECTOR_SIZE != 0 {
            return Err(Error::InvalidRequest(format!(
                "length {} is not a nonzero multiple of {}",
                len, SECTOR_SIZE
            )));
        }
        let sectors = (len / SECTOR_SIZE) as u64;
        let end = sector.checked_add(sectors);
        if end.map_or(true, |end| end > self.device.capacity_sectors) {
            return Err(Error::InvalidRequest(format!(
                "sectors {}..{} beyond capacity {}",
                sector,
                sector.saturating_add(sectors),
                self.device.capacity_sectors
            )));
        }
        Ok(())
    }

    fn check_transfer(&self, sector: u64, len: usize) -> Result<()> {
        if len > BLOCK_SIZE {
            return Err(Error::InvalidRequest(format!(
                "{} bytes exceeds one block of {} bytes",
                len, BLOCK_SIZE
            )));
        }
        self.check_range(sector, len)
    }

    /// Run one request to completion and check its status.
    ///
    /// On success the chain is retired but not yet freed: the caller copies out
    /// of the buffer, then calls [`release`](Self::release).
    fn execute(
        &mut self,
        kind: RequestKind,
        sector: u64,
        len: usize,
        data: Option<&[u8]>,
    ) -> Result<u16> {
        let head = self.submit_with_retry(kind, sector, len, data)?;
        let completion = self.wait_for(head)?;
        self.requests[head as usize] = RequestState::Completed;

        let status = self.transport.pool()?.status(head)?;
        trace!(
            "virtio-blk {:?} sector={} head={} status={} written={}",
            kind,
            sector,
            head,
            status,
            completion.bytes_written
        );
        match BlkStatus::from(status) {
            BlkStatus::Ok => Ok(head),
            _ => {
                self.release(head)?;
                Err(Error::IoError { status })
            }
        }
    }

    fn submit_with_retry(
        &mut self,
        kind: RequestKind,
        sector: u64,
        len: usize,
        data: Option<&[u8]>,
    ) -> Result<u16> {
        let mut attempt = 0;
        loop {
            match self.submit(kind, sector, len, data) {
                Err(e) if e.is_retryable() && attempt < self.config.queue_full_retries => {
                    attempt += 1;
                    debug!("virtio-blk queue full, retry {}: {}", attempt, e);
                    for completion in self.ring.reap_completions()? {
                        self.retire_late(completion)?;
                    }
                    thread::sleep(self.config.poll_interval);
                }
                other => return other,
            }
        }
    }

    fn submit(
        &mut self,
        kind: RequestKind,
        sector: u64,
        len: usize,
        data: Option<&[u8]>,
    ) -> Result<u16> {
        let reset = self.reset.clone();
        let _publish = reset.lock_publish();
        if reset.epoch() != self.seen_epoch {
            self.reclaim_after_reset()?;
        }

        let head = self.ring.peek_free_head().ok_or(Error::QueueFull {
            needed: 2,
            free: self.ring.num_free() as usize,
        })?;
        self.requests[head as usize] = RequestState::Building;

        let pool = self.transport.pool()?;
        pool.prepare(head, kind, sector)?;
        if let Some(data) = data {
            pool.write_data(head, data)?;
        }
        let segments = [
            pool.header_segment(head)?,
            pool.payload_segment(head, len, kind)?,
        ];

        let submitted = match self.ring.submit_chain(&segments) {
            Ok(submitted) => submitted,
            Err(e) => {
                self.requests[head as usize] = RequestState::Idle;
                return Err(e);
            }
        };
        if submitted != head {
            return Err(Error::Protocol(format!(
                "chain published at head {} but buffer {} was filled",
                submitted, head
            )));
        }
        self.requests[head as usize] = RequestState::Submitted;
        if let Err(e) = self.ring.notify() {
            self.requests[head as usize] = RequestState::TimedOut;
            warn!(
                "virtio-blk notify for head={} failed: {}; descriptors held until completion or reset",
                head, e
            );
            return Err(e);
        }
        Ok(head)
    }

    fn wait_for(&mut self, head: u16) -> Result<Completion> {
        let start = Instant::now();
        loop {
            if self.reset.epoch() != self.seen_epoch {
                self.reclaim_after_reset()?;
                return Err(Error::Reset);
            }

            let mut found = None;
            for completion in self.ring.reap_completions()? {
                if completion.head == head {
                    found = Some(completion);
                } else {
                    self.retire_late(completion)?;
                }
            }
            if let Some(completion) = found {
                return Ok(completion);
            }

            let elapsed = start.elapsed();
            if elapsed >= self.config.timeout {
                self.requests[head as usize] = RequestState::TimedOut;
                warn!(
                    "virtio-blk request head={} timed out after {:?}; descriptors held until reset",
                    head, elapsed
                );
                return Err(Error::Timeout { head, elapsed });
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Completion for a chain nobody is waiting on any more.
    fn retire_late(&mut self, completion: Completion) -> Result<()> {
        let head = completion.head;
        match self.requests[head as usize] {
            RequestState::TimedOut => {
                warn!("virtio-blk late completion for timed-out head={}, reclaiming", head);
                self.ring.free_chain(head)?;
                self.requests[head as usize] = RequestState::Idle;
                Ok(())
            }
            state => Err(Error::Protocol(format!(
                "completion for head {} in state {:?}",
                head, state
            ))),
        }
    }

    fn release(&mut self, head: u16) -> Result<()> {
        self.ring.free_chain(head)?;
        self.requests[head as usize] = RequestState::Idle;
        Ok(())
    }

    fn reclaim_after_reset(&mut self) -> Result<()> {
        self.seen_epoch = self.reset.epoch();
        for state in self.requests.iter_mut() {
            if matches!(
                state,
                RequestState::Building | RequestState::Submitted | RequestState::TimedOut
            ) {
                *state = RequestState::Reset;
            }
        }
        let reclaimed = self.ring.reclaim_all()?;
        info!(
            "virtio-blk reset: reclaimed {} outstanding chains, {} descriptors free",
            reclaimed,
            self.ring.num_free()
        );
        Ok(())
    }
}
