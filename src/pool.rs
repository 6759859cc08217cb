//! Request buffers
//!
//! Every request is a two-descriptor chain over one pool slot:
//!
//! ```text
//! slot + 0    RequestHeader  {kind, reserved, sector}   device reads
//! slot + 16   status byte                               device writes
//! slot + 17   data, up to one block (128 sectors)
//! ```
//!
//! The pool holds one slot per descriptor and slot `i` is only ever used by the
//! chain whose head is descriptor `i`. It lives in its own anonymous mapping so
//! slot addresses never move while the device holds them.

use virtio_bindings::virtio_blk::{
    VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_FLUSH,
    VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};
use vm_memory::ByteValued;

use crate::memory::{align_up, SharedRegion};
use crate::virtq::Segment;
use crate::{Error, Result};

pub const SECTOR_SIZE: usize = 512;
pub const BLOCK_SECTORS: usize = 128;
pub const BLOCK_SIZE: usize = BLOCK_SECTORS * SECTOR_SIZE;

/// Written into the status byte before submission; no device reports it.
pub const STATUS_PENDING: u8 = 0xff;

const HEADER_OFFSET: usize = 0;
const STATUS_OFFSET: usize = RequestHeader::SIZE;
const DATA_OFFSET: usize = STATUS_OFFSET + 1;
const SLOT_SIZE: usize = align_up(DATA_OFFSET + BLOCK_SIZE, 64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    Flush,
}

impl RequestKind {
    pub fn as_raw(self) -> u32 {
        match self {
            RequestKind::Read => VIRTIO_BLK_T_IN,
            RequestKind::Write => VIRTIO_BLK_T_OUT,
            RequestKind::Flush => VIRTIO_BLK_T_FLUSH,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            VIRTIO_BLK_T_IN => Some(RequestKind::Read),
            VIRTIO_BLK_T_OUT => Some(RequestKind::Write),
            VIRTIO_BLK_T_FLUSH => Some(RequestKind::Flush),
            _ => None,
        }
    }

    /// Whether the device writes the data bytes of the payload segment.
    pub fn device_writes_payload(self) -> bool {
        !matches!(self, RequestKind::Write)
    }
}

/// Status byte values reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlkStatus {
    Ok,
    IoErr,
    Unsupported,
    Other(u8),
}

impl From<u8> for BlkStatus {
    fn from(raw: u8) -> Self {
        match raw as u32 {
            VIRTIO_BLK_S_OK => BlkStatus::Ok,
            VIRTIO_BLK_S_IOERR => BlkStatus::IoErr,
            VIRTIO_BLK_S_UNSUPP => BlkStatus::Unsupported,
            _ => BlkStatus::Other(raw),
        }
    }
}

impl From<BlkStatus> for u8 {
    fn from(status: BlkStatus) -> Self {
        match status {
            BlkStatus::Ok => VIRTIO_BLK_S_OK as u8,
            BlkStatus::IoErr => VIRTIO_BLK_S_IOERR as u8,
            BlkStatus::Unsupported => VIRTIO_BLK_S_UNSUPP as u8,
            BlkStatus::Other(raw) => raw,
        }
    }
}

/// virtio-blk request header
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestHeader {
    pub kind: u32,
    pub reserved: u32,
    pub sector: u64,
}

// SAFETY: plain integers, `repr(C)`, no padding.
unsafe impl ByteValued for RequestHeader {}

impl RequestHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(kind: RequestKind, sector: u64) -> Self {
        Self {
            kind: kind.as_raw(),
            reserved: 0,
            sector,
        }
    }
}

/// Fixed pool of request buffers, one per ring descriptor.
#[derive(Debug)]
pub struct BufferPool {
    region: SharedRegion,
    count: u16,
}

impl BufferPool {
    pub fn new(count: u16) -> Result<Self> {
        let region = SharedRegion::anonymous(count as usize * SLOT_SIZE)?;
        Ok(Self { region, count })
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    fn slot(&self, index: u16) -> Result<usize> {
        if index >= self.count {
            return Err(Error::Protocol(format!(
                "buffer {} outside pool of {}",
                index, self.count
            )));
        }
        Ok(index as usize * SLOT_SIZE)
    }

    /// Write the header and arm the status byte of buffer `index`.
    pub fn prepare(&self, index: u16, kind: RequestKind, sector: u64) -> Result<()> {
        let slot = self.slot(index)?;
        self.region
            .write_obj(RequestHeader::new(kind, sector), slot + HEADER_OFFSET)?;
        self.region.write_obj(STATUS_PENDING, slot + STATUS_OFFSET)
    }

    pub fn header(&self, index: u16) -> Result<RequestHeader> {
        let slot = self.slot(index)?;
        self.region.read_obj(slot + HEADER_OFFSET)
    }

    pub fn status(&self, index: u16) -> Result<u8> {
        let slot = self.slot(index)?;
        self.region.read_obj(slot + STATUS_OFFSET)
    }

    pub fn write_data(&self, index: u16, data: &[u8]) -> Result<()> {
        check_len(data.len())?;
        let slot = self.slot(index)?;
        self.region.write_bytes(slot + DATA_OFFSET, data)
    }

    pub fn read_data(&self, index: u16, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len())?;
        let slot = self.slot(index)?;
        self.region.read_bytes(slot + DATA_OFFSET, buf)
    }

    /// Header segment of buffer `index`, device read-only.
    pub fn header_segment(&self, index: u16) -> Result<Segment> {
        let slot = self.slot(index)?;
        Ok(Segment::readable(
            self.region.addr_of(slot + HEADER_OFFSET),
            RequestHeader::SIZE as u32,
        ))
    }

    /// Payload segment: the status byte followed by `data_len` data bytes.
    pub fn payload_segment(&self, index: u16, data_len: usize, kind: RequestKind) -> Result<Segment> {
        check_len(data_len)?;
        let slot = self.slot(index)?;
        let addr = self.region.addr_of(slot + STATUS_OFFSET);
        let len = (1 + data_len) as u32;
        Ok(if kind.device_writes_payload() {
            Segment::writable(addr, len)
        } else {
            Segment::readable(addr, len)
        })
    }
}

fn check_len(len: usize) -> Result<()> {
    if len > BLOCK_SIZE {
        return Err(Error::InvalidRequest(format!(
            "{} bytes exceeds one block of {} bytes",
            len, BLOCK_SIZE
        )));
    }
    Ok(())
}
