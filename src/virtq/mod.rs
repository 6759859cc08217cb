//! Split virtqueue
//!
//! - [`desc`]: descriptor, used-element and segment types
//! - [`layout`]: where the descriptor table and both rings live in shared memory
//! - [`ring`]: the driver-side ring with its descriptor free list

mod desc;
mod layout;
mod ring;

pub use desc::{DescFlags, Descriptor, Segment, UsedElem};
pub use layout::{RingLayout, RingMemory, MAX_QUEUE_SIZE};
pub use ring::{Completion, RingState, VirtqueueRing};
