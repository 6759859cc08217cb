//! Out-of-band device signalling
//!
//! The ring never talks to the device directly. New work is announced, and the
//! device is reset, through a [`DeviceSignal`] injected at construction time.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

use tracing::trace;

/// Backend-defined notification and reset calls.
pub trait DeviceSignal: Send + Sync {
    /// Tell the device that queue `queue_index` has new avail-ring entries.
    fn notify(&self, queue_index: u16) -> io::Result<()>;

    /// Reset the device. Returns once the device has stopped touching the rings.
    fn reset(&self) -> io::Result<()>;
}

/// Signals a device through `ioctl` on its open file descriptor.
pub struct IoctlSignal {
    file: File,
    notify_request: libc::c_ulong,
    reset_request: libc::c_ulong,
}

impl IoctlSignal {
    /// Kick request: `VIRTIO_BLK_T_IN | VIRTIO_BLK_T_OUT`, argument is the queue index.
    pub const NOTIFY_REQUEST: libc::c_ulong = 1;
    /// Reset request, argument is always 0.
    pub const RESET_REQUEST: libc::c_ulong = 2;

    pub fn new(file: File) -> Self {
        Self {
            file,
            notify_request: Self::NOTIFY_REQUEST,
            reset_request: Self::RESET_REQUEST,
        }
    }

    /// Override the backend's request codes.
    pub fn with_requests(mut self, notify: libc::c_ulong, reset: libc::c_ulong) -> Self {
        self.notify_request = notify;
        self.reset_request = reset;
        self
    }

    fn ioctl(&self, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<()> {
        // SAFETY: the descriptor is owned by `self.file`; the argument is passed by value.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl DeviceSignal for IoctlSignal {
    fn notify(&self, queue_index: u16) -> io::Result<()> {
        trace!("ioctl notify: queue={}", queue_index);
        self.ioctl(self.notify_request, queue_index as libc::c_ulong)
    }

    fn reset(&self) -> io::Result<()> {
        trace!("ioctl reset");
        self.ioctl(self.reset_request, 0)
    }
}
