//! Generic virtio plumbing shared by the virtio-net frontend.
//!
//! This crate provides the pieces a device model consumes rather than implements:
//! - [`memory::GuestRam`]: flat guest-physical memory handing out scatter/gather slices.
//! - [`queue::SplitQueue`]: a split virtqueue implementing the chain-level [`Virtqueue`] interface.
//! - [`interrupt::InterruptSink`]: where queue interrupts end up (legacy INTx or MSI-X).
//! - [`device::VirtioDevice`]: the callback set a device registers with its transport.
#![forbid(unsafe_code)]

pub mod device;
pub mod interrupt;
pub mod memory;
pub mod queue;

pub use device::VirtioDevice;
pub use interrupt::{InterruptLog, InterruptSink};
pub use memory::{GuestMemoryError, GuestRam, GuestRegion};
pub use queue::{Descriptor, DescriptorChain, QueueConfig, QueueError, SplitQueue, Virtqueue};
