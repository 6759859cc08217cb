//! vring-blk: split-virtqueue transport and synchronous virtio-blk client
//!
//! A driver-side virtio split ring living in a memory-mapped device region,
//! plus a block client that issues one sector request at a time over it.
//!
//! # Key Features
//!
//! - **Split virtqueue**: descriptor free list, avail publication, used-ring reaping
//! - **Whole-chain reclamation**: every descriptor of a retired chain is returned
//! - **Bounded waits**: completions are polled with a timeout, never spun forever
//! - **Reset**: resolves blocked requests and reclaims outstanding chains
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use vring_blk::{BlockDeviceClient, ClientConfig};
//!
//! fn main() -> vring_blk::Result<()> {
//!     let config = ClientConfig::new()
//!         .device("/dev/vring0")
//!         .timeout(Duration::from_secs(2));
//!
//!     let mut client = BlockDeviceClient::open(config)?;
//!     client.write(0, &[0xab; 512])?;
//!     let sector = client.read(0, 512)?;
//!     assert_eq!(sector, vec![0xab; 512]);
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

pub mod blk;
pub mod config;
pub mod devices;
pub mod error;
pub mod memory;
pub mod pool;
pub mod signal;
pub mod transport;
pub mod virtq;

// Re-exports for convenience
pub use blk::{BlockDeviceClient, RequestState, ResetHandle};
pub use config::{load_config, ClientConfig};
pub use error::{Error, Result};
pub use pool::{BlkStatus, RequestKind, BLOCK_SECTORS, BLOCK_SIZE, SECTOR_SIZE};
pub use signal::{DeviceSignal, IoctlSignal};
pub use transport::{DeviceConfig, DeviceTransport};
pub use virtq::{Completion, Segment, VirtqueueRing};
