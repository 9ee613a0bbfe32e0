//! Split virtqueues.
//!
//! [`Virtqueue`] is the chain-level interface device models program against: pull a chain, move
//! bytes through its buffers, then either complete it or hand it back. [`SplitQueue`] implements
//! it over the virtio 1.0 split ring layout in [`GuestRam`].

use crate::device::VIRTIO_F_NOTIFY_ON_EMPTY;
use crate::interrupt::InterruptSink;
use crate::memory::{
    read_u16_le, read_u32_le, read_u64_le, write_u16_le, write_u32_le, GuestMemoryError,
    GuestRam, GuestRegion,
};
use std::io::{IoSlice, IoSliceMut};
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Used ring flag: the driver need not notify the device about new buffers.
pub const VRING_USED_F_NO_NOTIFY: u16 = 1;
/// Available ring flag: the device need not interrupt the driver about used buffers.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

const DESC_SIZE: u64 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("available index moved by {delta} entries (queue size {size})")]
    AvailIndexOverrun { delta: u16, size: u16 },

    #[error("descriptor index {index} out of range (table size {size})")]
    DescriptorIndex { index: u16, size: u16 },

    #[error("descriptor chain longer than {max} segments")]
    ChainTooLong { max: usize },

    #[error("invalid indirect descriptor table length {len}")]
    IndirectTableLen { len: u32 },

    #[error("indirect descriptor inside an indirect table")]
    NestedIndirect,

    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }

    pub fn region(&self) -> GuestRegion {
        GuestRegion::new(self.addr, self.len)
    }
}

/// A descriptor chain pulled from a queue, with indirect tables already flattened.
///
/// Chains are deliberately not `Clone`: [`Virtqueue::complete_chain`] and
/// [`Virtqueue::return_chain`] both take the chain by value, so each pulled chain is resolved
/// exactly once.
#[must_use = "a pulled chain must be completed or returned to its queue"]
#[derive(Debug, PartialEq, Eq)]
pub struct DescriptorChain {
    head: u16,
    descriptors: Vec<Descriptor>,
}

impl DescriptorChain {
    pub fn new(head: u16, descriptors: Vec<Descriptor>) -> Self {
        Self { head, descriptors }
    }

    pub fn head_index(&self) -> u16 {
        self.head
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn segment_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Sum of all segment lengths.
    pub fn total_len(&self) -> u64 {
        self.descriptors.iter().map(|d| u64::from(d.len)).sum()
    }

    pub fn regions(&self) -> Vec<GuestRegion> {
        self.descriptors.iter().map(Descriptor::region).collect()
    }
}

/// Chain-level access to one virtqueue.
///
/// All methods take `&self`; a queue is shared between the thread that handles guest notifies and
/// the thread that drains it.
pub trait Virtqueue: Send + Sync {
    /// Whether the driver has made chains available that have not been pulled yet.
    fn has_descriptors(&self) -> bool;

    /// Pull the next available chain. `Ok(None)` means the ring is empty or disabled.
    ///
    /// A chain with more than `max_segments` buffers, or one that points outside guest memory, is
    /// a protocol violation and yields an error.
    fn pull_chain(&self, max_segments: usize) -> Result<Option<DescriptorChain>, QueueError>;

    /// Hand the most recently pulled chain back, unused, so it is pulled again next time.
    fn return_chain(&self, chain: DescriptorChain);

    /// Publish `chain` to the used ring with `len` bytes.
    fn complete_chain(&self, chain: DescriptorChain, len: u32);

    /// Interrupt the driver if completions since the last flush warrant it.
    ///
    /// `force` marks the "ring exhausted" case, which interrupts unconditionally once
    /// `VIRTIO_F_NOTIFY_ON_EMPTY` is negotiated.
    fn flush_interrupts(&self, force: bool);

    /// Set or clear `VRING_USED_F_NO_NOTIFY`.
    fn set_notify_suppressed(&self, suppressed: bool);

    /// Negotiated feature bits relevant to ring behaviour.
    fn set_features(&self, features: u64);

    /// Disable the queue and forget ring addresses, indices and features.
    fn reset(&self);

    /// Run `f` over the chain's buffers as read-only slices.
    fn read_chain(
        &self,
        chain: &DescriptorChain,
        f: &mut dyn FnMut(&[IoSlice<'_>]),
    ) -> Result<(), QueueError>;

    /// Run `f` over the chain's buffers as writable slices, each bounded by its descriptor length.
    fn write_chain(
        &self,
        chain: &DescriptorChain,
        f: &mut dyn FnMut(&mut [IoSliceMut<'_>]),
    ) -> Result<(), QueueError>;
}

/// Ring addresses programmed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub size: u16,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    /// MSI-X vector for queue interrupts; `None` falls back to the legacy INTx line.
    pub msix_vector: Option<u16>,
}

impl QueueConfig {
    fn validate(&self, max_size: u16, mem_size: u64) -> Result<(), QueueError> {
        if self.size == 0 || self.size > max_size || !self.size.is_power_of_two() {
            return Err(QueueError::InvalidConfig("queue size"));
        }

        let size = u64::from(self.size);
        let rings = [
            (self.desc_addr, size * DESC_SIZE),
            (self.avail_addr, 6 + 2 * size),
            (self.used_addr, 6 + 8 * size),
        ];
        for (addr, len) in rings {
            match addr.checked_add(len) {
                Some(end) if end <= mem_size => {}
                _ => return Err(QueueError::InvalidConfig("ring outside guest memory")),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    config: Option<QueueConfig>,
    last_avail: u16,
    next_used: u16,
    /// `next_used` as of the last interrupt flush.
    saved_used: u16,
    features: u64,
}

pub struct SplitQueue {
    index: u16,
    max_size: u16,
    mem: Arc<GuestRam>,
    interrupts: Arc<dyn InterruptSink>,
    state: Mutex<QueueState>,
}

impl SplitQueue {
    pub fn new(
        index: u16,
        max_size: u16,
        mem: Arc<GuestRam>,
        interrupts: Arc<dyn InterruptSink>,
    ) -> Self {
        Self {
            index,
            max_size,
            mem,
            interrupts,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    /// Program ring addresses and enable the queue. Negotiated features survive.
    pub fn configure(&self, config: QueueConfig) -> Result<(), QueueError> {
        config.validate(self.max_size, self.mem.size())?;
        let mut state = self.lock();
        *state = QueueState {
            config: Some(config),
            features: state.features,
            ..QueueState::default()
        };
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().config.is_some()
    }

    /// Index of the next used ring entry the device will write.
    pub fn next_used_idx(&self) -> u16 {
        self.lock().next_used
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_descriptor_at(&self, addr: u64) -> Result<Descriptor, GuestMemoryError> {
        Ok(Descriptor {
            addr: read_u64_le(&self.mem, addr)?,
            len: read_u32_le(&self.mem, addr + 8)?,
            flags: read_u16_le(&self.mem, addr + 12)?,
            next: read_u16_le(&self.mem, addr + 14)?,
        })
    }

    fn walk_chain(
        &self,
        config: &QueueConfig,
        head: u16,
        max_segments: usize,
    ) -> Result<Vec<Descriptor>, QueueError> {
        let mut segments = Vec::new();
        let mut index = head;
        // Every iteration pushes at least one segment, so `max_segments` also bounds loops.
        loop {
            if index >= config.size {
                return Err(QueueError::DescriptorIndex {
                    index,
                    size: config.size,
                });
            }
            let desc =
                self.read_descriptor_at(config.desc_addr + u64::from(index) * DESC_SIZE)?;
            if desc.is_indirect() {
                self.walk_indirect(&desc, max_segments, &mut segments)?;
            } else {
                push_segment(&mut segments, desc, max_segments)?;
            }
            if !desc.has_next() {
                return Ok(segments);
            }
            index = desc.next;
        }
    }

    fn walk_indirect(
        &self,
        table: &Descriptor,
        max_segments: usize,
        segments: &mut Vec<Descriptor>,
    ) -> Result<(), QueueError> {
        if table.len == 0 || u64::from(table.len) % DESC_SIZE != 0 {
            return Err(QueueError::IndirectTableLen { len: table.len });
        }
        let entries = u64::from(table.len) / DESC_SIZE;

        let mut index = 0u16;
        loop {
            let desc = self.read_descriptor_at(table.addr + u64::from(index) * DESC_SIZE)?;
            if desc.is_indirect() {
                return Err(QueueError::NestedIndirect);
            }
            push_segment(segments, desc, max_segments)?;
            if !desc.has_next() {
                return Ok(());
            }
            if u64::from(desc.next) >= entries {
                return Err(QueueError::DescriptorIndex {
                    index: desc.next,
                    size: u16::try_from(entries).unwrap_or(u16::MAX),
                });
            }
            index = desc.next;
        }
    }

    fn raise_interrupt(&self, config: &QueueConfig) {
        match config.msix_vector {
            Some(vector) => self.interrupts.signal_msix(vector),
            None => self.interrupts.raise_legacy_irq(),
        }
    }
}

fn push_segment(
    segments: &mut Vec<Descriptor>,
    desc: Descriptor,
    max_segments: usize,
) -> Result<(), QueueError> {
    if segments.len() >= max_segments {
        return Err(QueueError::ChainTooLong { max: max_segments });
    }
    segments.push(desc);
    Ok(())
}

impl Virtqueue for SplitQueue {
    fn has_descriptors(&self) -> bool {
        let state = self.lock();
        let Some(config) = state.config else {
            return false;
        };
        match read_u16_le(&self.mem, config.avail_addr + 2) {
            Ok(avail_idx) => avail_idx != state.last_avail,
            Err(_) => false,
        }
    }

    fn pull_chain(&self, max_segments: usize) -> Result<Option<DescriptorChain>, QueueError> {
        let mut state = self.lock();
        let Some(config) = state.config else {
            return Ok(None);
        };

        let avail_idx = read_u16_le(&self.mem, config.avail_addr + 2)?;
        let pending = avail_idx.wrapping_sub(state.last_avail);
        if pending == 0 {
            return Ok(None);
        }
        if pending > config.size {
            return Err(QueueError::AvailIndexOverrun {
                delta: pending,
                size: config.size,
            });
        }

        // Read the ring entry only after observing the index that published it.
        fence(Ordering::Acquire);

        let slot = u64::from(state.last_avail % config.size);
        let head = read_u16_le(&self.mem, config.avail_addr + 4 + slot * 2)?;
        state.last_avail = state.last_avail.wrapping_add(1);

        let descriptors = self.walk_chain(&config, head, max_segments)?;
        Ok(Some(DescriptorChain { head, descriptors }))
    }

    fn return_chain(&self, chain: DescriptorChain) {
        let mut state = self.lock();
        state.last_avail = state.last_avail.wrapping_sub(1);
        tracing::trace!(queue = self.index, head = chain.head, "chain returned unused");
    }

    fn complete_chain(&self, chain: DescriptorChain, len: u32) {
        let mut state = self.lock();
        let Some(config) = state.config else {
            // The queue was reset under an in-flight chain; there is no ring to publish to.
            return;
        };

        let slot = u64::from(state.next_used % config.size);
        let entry = config.used_addr + 4 + slot * 8;
        let written = write_u32_le(&self.mem, entry, u32::from(chain.head))
            .and_then(|()| write_u32_le(&self.mem, entry + 4, len));
        if let Err(err) = written {
            tracing::error!(queue = self.index, "failed to write used ring entry: {err}");
            return;
        }

        // The entry must be visible before the index that publishes it.
        fence(Ordering::Release);

        state.next_used = state.next_used.wrapping_add(1);
        if let Err(err) = write_u16_le(&self.mem, config.used_addr + 2, state.next_used) {
            tracing::error!(queue = self.index, "failed to write used index: {err}");
        }
    }

    fn flush_interrupts(&self, force: bool) {
        let mut state = self.lock();
        let Some(config) = state.config else {
            return;
        };

        let old = state.saved_used;
        let new = state.next_used;
        state.saved_used = new;

        let interrupt = if force && state.features & VIRTIO_F_NOTIFY_ON_EMPTY != 0 {
            true
        } else {
            let avail_flags = read_u16_le(&self.mem, config.avail_addr).unwrap_or(0);
            new != old && avail_flags & VRING_AVAIL_F_NO_INTERRUPT == 0
        };
        drop(state);

        if interrupt {
            self.raise_interrupt(&config);
        }
    }

    fn set_notify_suppressed(&self, suppressed: bool) {
        let state = self.lock();
        let Some(config) = state.config else {
            return;
        };

        let flags = match read_u16_le(&self.mem, config.used_addr) {
            Ok(flags) => flags,
            Err(err) => {
                tracing::error!(queue = self.index, "failed to read used flags: {err}");
                return;
            }
        };
        let flags = if suppressed {
            flags | VRING_USED_F_NO_NOTIFY
        } else {
            flags & !VRING_USED_F_NO_NOTIFY
        };
        if let Err(err) = write_u16_le(&self.mem, config.used_addr, flags) {
            tracing::error!(queue = self.index, "failed to write used flags: {err}");
        }
    }

    fn set_features(&self, features: u64) {
        self.lock().features = features;
    }

    fn reset(&self) {
        *self.lock() = QueueState::default();
    }

    fn read_chain(
        &self,
        chain: &DescriptorChain,
        f: &mut dyn FnMut(&[IoSlice<'_>]),
    ) -> Result<(), QueueError> {
        self.mem.with_slices(&chain.regions(), f)?;
        Ok(())
    }

    fn write_chain(
        &self,
        chain: &DescriptorChain,
        f: &mut dyn FnMut(&mut [IoSliceMut<'_>]),
    ) -> Result<(), QueueError> {
        self.mem.with_slices_mut(&chain.regions(), f)?;
        Ok(())
    }
}
