#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use vring_blk::devices::virtio_blk::{
    create_region_file, BackendHandle, BackendOptions, VirtioBlkBackend,
};
use vring_blk::{BlockDeviceClient, ClientConfig, DeviceConfig, SECTOR_SIZE};

pub const CAPACITY_SECTORS: u64 = 1024;

/// Region file, disk image and a running backend in a private directory.
pub struct Harness {
    pub dir: TempDir,
    pub region: PathBuf,
    pub disk: PathBuf,
    pub backend: BackendHandle,
}

impl Harness {
    pub fn new(queue_size: u16, options: BackendOptions) -> Self {
        Self::with_features(
            queue_size,
            DeviceConfig::FEATURE_WRITE_BACK_CACHE | DeviceConfig::FEATURE_FLUSH,
            options,
        )
    }

    pub fn with_features(queue_size: u16, features: u64, options: BackendOptions) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let region = dir.path().join("region");
        let disk = dir.path().join("disk.img");
        std::fs::write(&disk, vec![0u8; CAPACITY_SECTORS as usize * SECTOR_SIZE]).expect("disk image");
        create_region_file(&region, CAPACITY_SECTORS, features, queue_size).expect("region file");

        let backend = VirtioBlkBackend::new(&region, &disk, queue_size, options)
            .and_then(VirtioBlkBackend::spawn)
            .expect("backend");

        Self {
            dir,
            region,
            disk,
            backend,
        }
    }

    pub fn config(&self, queue_size: u16) -> ClientConfig {
        ClientConfig::new()
            .device(&self.region)
            .queue_size(queue_size)
            .timeout(Duration::from_secs(5))
            .poll_interval(Duration::from_micros(50))
    }

    pub fn client(&self, config: ClientConfig) -> BlockDeviceClient {
        BlockDeviceClient::open_with_signal(config, self.backend.signal()).expect("open client")
    }

    pub fn disk_bytes(&self) -> Vec<u8> {
        std::fs::read(&self.disk).expect("read disk image")
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
