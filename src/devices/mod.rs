//! Device emulation
//!
//! - virtio-blk backend serving a region file from a raw disk image

pub mod virtio_blk;
