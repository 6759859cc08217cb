//! Device transport
//!
//! Opens the device file, maps the shared region and owns everything that has
//! to be torn down with the device: the mapping, the request buffer pool and
//! the file handle.
//!
//! Region layout (shared with the backend, bit for bit):
//!
//! ```text
//! 0                      DeviceConfig {capacity_sectors: u64, feature_flags: u64}
//! size_of(DeviceConfig)  split ring (see virtq::RingLayout)
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use virtio_bindings::virtio_blk::{VIRTIO_BLK_F_CONFIG_WCE, VIRTIO_BLK_F_FLUSH};
use vm_memory::ByteValued;

use crate::memory::{align_up, SharedRegion, PAGE_SIZE};
use crate::pool::BufferPool;
use crate::signal::IoctlSignal;
use crate::virtq::{RingLayout, RingMemory};
use crate::{Error, Result};

/// Device configuration header at offset 0 of the region. Never written by the client.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub capacity_sectors: u64,
    pub feature_flags: u64,
}

// SAFETY: plain integers, `repr(C)`, no padding.
unsafe impl ByteValued for DeviceConfig {}

impl DeviceConfig {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Device supports write-back caching.
    pub const FEATURE_WRITE_BACK_CACHE: u64 = 1 << VIRTIO_BLK_F_CONFIG_WCE;
    /// Device accepts flush requests.
    pub const FEATURE_FLUSH: u64 = 1 << VIRTIO_BLK_F_FLUSH;

    pub fn has_feature(&self, feature: u64) -> bool {
        self.feature_flags & feature == feature
    }

    /// The two capability checks made before a device is used.
    pub fn validate(&self) -> Result<()> {
        if !self.has_feature(Self::FEATURE_WRITE_BACK_CACHE) {
            return Err(Error::UnsupportedDevice(
                "write-back caching not supported".into(),
            ));
        }
        if self.capacity_sectors == 0 {
            return Err(Error::UnsupportedDevice("invalid disk capacity 0".into()));
        }
        Ok(())
    }
}

/// Length of the mapping for a ring of `layout`.
pub fn region_size(layout: &RingLayout) -> usize {
    align_up(layout.end, PAGE_SIZE)
}

/// Ring layout inside a device region for a queue of `queue_size`.
pub fn ring_layout(queue_size: u16) -> Result<RingLayout> {
    RingLayout::new(DeviceConfig::SIZE, queue_size as u32)
}

/// Owner of the device file, its mapping and the request buffer pool.
#[derive(Debug)]
pub struct DeviceTransport {
    path: PathBuf,
    layout: RingLayout,
    file: Option<File>,
    region: Option<Arc<SharedRegion>>,
    pool: Option<BufferPool>,
}

impl DeviceTransport {
    /// Open and map `path`, check its capabilities and allocate the buffer pool.
    ///
    /// On failure everything acquired so far is released before returning.
    pub fn open<P: AsRef<Path>>(path: P, queue_size: u16) -> Result<Self> {
        let layout = ring_layout(queue_size)?;
        let mut transport = Self {
            path: path.as_ref().to_path_buf(),
            layout,
            file: None,
            region: None,
            pool: None,
        };

        if let Err(e) = transport.setup() {
            warn!("virtio-blk open {} failed: {}", transport.path.display(), e);
            transport.close();
            return Err(e);
        }

        debug!(
            "virtio-blk transport open: path={}, queue_size={}, region={} bytes",
            transport.path.display(),
            queue_size,
            region_size(&transport.layout)
        );
        Ok(transport)
    }

    fn setup(&mut self) -> Result<()> {
        self.map()?;
        self.validate()?;
        self.allocate_pool()
    }

    fn map(&mut self) -> Result<()> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                Error::Config(format!("failed to open {}: {}", self.path.display(), e))
            })?;
        let size = region_size(&self.layout);
        let region = SharedRegion::map_file(&file, size).map_err(|e| {
            Error::Config(format!("failed to map {}: {}", self.path.display(), e))
        })?;
        self.file = Some(file);
        self.region = Some(Arc::new(region));
        Ok(())
    }

    /// Fail unless the device caches writes back and has a nonzero capacity.
    pub fn validate(&self) -> Result<()> {
        self.config()?.validate()
    }

    fn allocate_pool(&mut self) -> Result<()> {
        self.pool = Some(BufferPool::new(self.layout.size)?);
        Ok(())
    }

    fn region(&self) -> Result<&Arc<SharedRegion>> {
        self.region
            .as_ref()
            .ok_or_else(|| Error::Config(format!("{} is not mapped", self.path.display())))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn queue_size(&self) -> u16 {
        self.layout.size
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some() || self.region.is_some() || self.pool.is_some()
    }

    /// Current device configuration header.
    pub fn config(&self) -> Result<DeviceConfig> {
        self.region()?.read_obj(0)
    }

    /// Ring storage, immediately after the configuration header.
    pub fn ring_memory(&self) -> Result<RingMemory> {
        RingMemory::new(self.region()?.clone(), self.layout)
    }

    pub fn pool(&self) -> Result<&BufferPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| Error::Config("buffer pool released".into()))
    }

    /// Ioctl-based signal on a duplicate of the device descriptor.
    pub fn ioctl_signal(&self) -> Result<IoctlSignal> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| Error::Config(format!("{} is not open", self.path.display())))?;
        Ok(IoctlSignal::new(file.try_clone()?))
    }

    /// Unmap the region, free the pool and close the file. Idempotent.
    ///
    /// A `RingMemory` handed out earlier keeps the mapping alive until it is dropped.
    pub fn close(&mut self) {
        let was_open = self.is_open();
        self.pool.take();
        self.region.take();
        self.file.take();
        if was_open {
            debug!("virtio-blk transport closed: path={}", self.path.display());
        }
    }
}

impl Drop for DeviceTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn region_file(config: DeviceConfig, queue_size: u16) -> tempfile::NamedTempFile {
        let layout = ring_layout(queue_size).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut bytes = vec![0u8; region_size(&layout)];
        bytes[..DeviceConfig::SIZE].copy_from_slice(config.as_slice());
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn good_config() -> DeviceConfig {
        DeviceConfig {
            capacity_sectors: 2048,
            feature_flags: DeviceConfig::FEATURE_WRITE_BACK_CACHE,
        }
    }

    #[test]
    fn test_feature_bits() {
        assert_eq!(DeviceConfig::FEATURE_WRITE_BACK_CACHE, 1 << 11);
        assert_eq!(DeviceConfig::SIZE, 16);
        assert!(good_config().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_write_back_cache() {
        let config = DeviceConfig {
            capacity_sectors: 2048,
            feature_flags: DeviceConfig::FEATURE_FLUSH,
        };
        assert!(matches!(config.validate(), Err(Error::UnsupportedDevice(_))));
    }

    #[test]
    fn test_validate_requires_capacity() {
        let config = DeviceConfig {
            capacity_sectors: 0,
            ..good_config()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::UnsupportedDevice(_)));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_open_reads_config_and_sizes_pool() {
        let file = region_file(good_config(), 8);
        let transport = DeviceTransport::open(file.path(), 8).unwrap();
        assert!(transport.is_open());
        assert_eq!(transport.config().unwrap(), good_config());
        assert_eq!(transport.pool().unwrap().count(), 8);
        assert_eq!(transport.ring_memory().unwrap().layout().desc_offset, 16);
    }

    #[test]
    fn test_failed_validation_releases_everything() {
        let file = region_file(
            DeviceConfig {
                capacity_sectors: 0,
                ..good_config()
            },
            4,
        );
        let mut transport = DeviceTransport {
            path: file.path().to_path_buf(),
            layout: ring_layout(4).unwrap(),
            file: None,
            region: None,
            pool: None,
        };
        transport.map().unwrap();
        assert!(transport.is_open());
        assert!(transport.validate().is_err());

        transport.close();
        assert!(!transport.is_open());
        assert!(transport.config().is_err());
        transport.close();
        assert!(!transport.is_open());
    }

    #[test]
    fn test_close_is_idempotent() {
        let file = region_file(good_config(), 4);
        let mut transport = DeviceTransport::open(file.path(), 4).unwrap();
        transport.close();
        transport.close();
        assert!(!transport.is_open());
        assert!(transport.pool().is_err());
        assert!(transport.ring_memory().is_err());
        assert!(transport.ioctl_signal().is_err());
    }

    #[test]
    fn test_open_missing_path() {
        let err = DeviceTransport::open("/nonexistent/vring-blk/device", 4).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_open_rejects_bad_queue_size() {
        let file = region_file(good_config(), 4);
        let err = DeviceTransport::open(file.path(), 12).unwrap_err();
        assert!(matches!(err, Error::InvalidCapacity(12)));
    }
}
