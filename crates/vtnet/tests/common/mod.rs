#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;
use vtnet::{PciSlot, VirtioNet};
use vtnet_backend::vnet_hdr::{gather, scatter};
use vtnet_backend::{BackendRegistry, LoopbackBackend, NetBackend, RxNotify};
use vtnet_virtio::memory::{read_u16_le, read_u32_le, write_u16_le, write_u32_le, write_u64_le};
use vtnet_virtio::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
use vtnet_virtio::{GuestRam, InterruptLog, QueueConfig, SplitQueue, Virtqueue};

pub const QUEUE_SIZE: u16 = 16;
pub const MEM_SIZE: usize = 0x40000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Driver-side view of one split ring in guest memory.
pub struct Ring {
    pub queue: Arc<SplitQueue>,
    mem: Arc<GuestRam>,
    desc: u64,
    avail: u64,
    used: u64,
    next_desc: u16,
}

impl Ring {
    fn new(
        index: u16,
        base: u64,
        mem: Arc<GuestRam>,
        irqs: Arc<InterruptLog>,
        msix_vector: Option<u16>,
    ) -> Self {
        let queue = Arc::new(SplitQueue::new(index, vtnet::VTNET_RINGSZ, mem.clone(), irqs));
        let ring = Self {
            queue,
            mem,
            desc: base,
            avail: base + 0x1000,
            used: base + 0x2000,
            next_desc: 0,
        };
        ring.configure(msix_vector);
        ring
    }

    /// (Re)program the ring addresses, as a driver does after reset.
    pub fn configure(&self, msix_vector: Option<u16>) {
        self.queue
            .configure(QueueConfig {
                size: QUEUE_SIZE,
                desc_addr: self.desc,
                avail_addr: self.avail,
                used_addr: self.used,
                msix_vector,
            })
            .unwrap();
    }

    /// Clear ring memory and descriptor allocation, then reprogram.
    pub fn reinit(&mut self, msix_vector: Option<u16>) {
        self.mem.write(self.desc, &[0; 0x3000]).unwrap();
        self.next_desc = 0;
        self.configure(msix_vector);
    }

    pub fn as_virtqueue(&self) -> Arc<dyn Virtqueue> {
        self.queue.clone()
    }

    /// Write a chain of `(addr, len)` buffers and make it available. Returns the head index.
    pub fn add_chain(&mut self, buffers: &[(u64, u32)], device_writable: bool) -> u16 {
        let head = self.next_desc;
        for (i, &(addr, len)) in buffers.iter().enumerate() {
            let index = self.alloc_desc();
            let mut flags = if device_writable { VIRTQ_DESC_F_WRITE } else { 0 };
            if i + 1 < buffers.len() {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            self.write_desc(index, addr, len, flags, index.wrapping_add(1) % QUEUE_SIZE);
        }
        self.publish(head);
        head
    }

    pub fn write_desc(&self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = self.desc + u64::from(index) * 16;
        write_u64_le(&self.mem, base, addr).unwrap();
        write_u32_le(&self.mem, base + 8, len).unwrap();
        write_u16_le(&self.mem, base + 12, flags).unwrap();
        write_u16_le(&self.mem, base + 14, next).unwrap();
    }

    pub fn alloc_desc(&mut self) -> u16 {
        let index = self.next_desc;
        self.next_desc = (self.next_desc + 1) % QUEUE_SIZE;
        index
    }

    pub fn publish(&self, head: u16) {
        let idx = read_u16_le(&self.mem, self.avail + 2).unwrap();
        let slot = u64::from(idx % QUEUE_SIZE);
        write_u16_le(&self.mem, self.avail + 4 + slot * 2, head).unwrap();
        write_u16_le(&self.mem, self.avail + 2, idx.wrapping_add(1)).unwrap();
    }

    pub fn set_avail_flags(&self, flags: u16) {
        write_u16_le(&self.mem, self.avail, flags).unwrap();
    }

    pub fn used_flags(&self) -> u16 {
        read_u16_le(&self.mem, self.used).unwrap()
    }

    pub fn used_idx(&self) -> u16 {
        read_u16_le(&self.mem, self.used + 2).unwrap()
    }

    /// `(id, len)` of used ring entry `i`.
    pub fn used_elem(&self, i: u16) -> (u32, u32) {
        let entry = self.used + 4 + u64::from(i % QUEUE_SIZE) * 8;
        (
            read_u32_le(&self.mem, entry).unwrap(),
            read_u32_le(&self.mem, entry + 4).unwrap(),
        )
    }
}

/// Guest memory, both rings and an interrupt log, ready for a device to attach to.
pub struct Harness {
    pub mem: Arc<GuestRam>,
    pub irqs: Arc<InterruptLog>,
    pub rx: Ring,
    pub tx: Ring,
}

pub const SLOT: PciSlot = PciSlot { slot: 2, func: 0 };

/// First guest address free for packet buffers.
pub const BUF_BASE: u64 = 0x10000;

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let mem = Arc::new(GuestRam::new(MEM_SIZE));
        let irqs = Arc::new(InterruptLog::default());
        let rx = Ring::new(0, 0x1000, mem.clone(), irqs.clone(), Some(0));
        let tx = Ring::new(1, 0x4000, mem.clone(), irqs.clone(), Some(1));
        Self { mem, irqs, rx, tx }
    }

    pub fn attach(&self, options: &str, registry: &BackendRegistry) -> VirtioNet {
        VirtioNet::attach(
            options,
            SLOT,
            "testvm",
            self.rx.as_virtqueue(),
            self.tx.as_virtqueue(),
            registry,
        )
        .unwrap()
    }

    /// Attach to a fresh loopback transport registered as `lo`, returning both ends.
    pub fn attach_loopback(&self) -> (VirtioNet, Arc<LoopbackBackend>) {
        let backend = Arc::new(LoopbackBackend::new());
        let registry = registry_with("lo", backend.clone());
        (self.attach("lo0", &registry), backend)
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.mem.read(addr, &mut out).unwrap();
        out
    }

    pub fn rx_interrupts(&self) -> usize {
        self.irqs.msix_vectors().iter().filter(|&&v| v == 0).count()
    }

    pub fn tx_interrupts(&self) -> usize {
        self.irqs.msix_vectors().iter().filter(|&&v| v == 1).count()
    }
}

/// A registry whose `prefix` transport always hands out `backend`.
pub fn registry_with<B>(prefix: &str, backend: Arc<B>) -> BackendRegistry
where
    B: NetBackend + NotifyTarget + 'static,
{
    let mut registry = BackendRegistry::new();
    registry.register(prefix, move |_, notify| {
        backend.set_notify(notify);
        Ok(backend.clone() as Arc<dyn NetBackend>)
    });
    registry
}

/// Transports that accept the device's receive-readiness callback.
pub trait NotifyTarget {
    fn set_notify(&self, notify: RxNotify);
}

impl NotifyTarget for LoopbackBackend {
    fn set_notify(&self, notify: RxNotify) {
        LoopbackBackend::set_notify(self, notify);
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A scripted transport that records sends and can hold them until released.
pub struct RecordingBackend {
    native_hdr: bool,
    state: Mutex<Recorded>,
    resumed: Condvar,
    notify: Mutex<Option<RxNotify>>,
}

#[derive(Default)]
struct Recorded {
    rx: VecDeque<Result<Vec<u8>, io::ErrorKind>>,
    sent: Vec<Vec<u8>>,
    paused: bool,
    active: usize,
    max_active: usize,
    entered: usize,
}

impl RecordingBackend {
    /// `native_hdr`: frames on this transport carry their own `virtio_net_hdr`.
    pub fn new(native_hdr: bool) -> Self {
        Self {
            native_hdr,
            state: Mutex::new(Recorded::default()),
            resumed: Condvar::new(),
            notify: Mutex::new(None),
        }
    }

    pub fn push_rx(&self, frame: Result<Vec<u8>, io::ErrorKind>) {
        self.state.lock().unwrap().rx.push_back(frame);
    }

    pub fn pending_rx(&self) -> usize {
        self.state.lock().unwrap().rx.len()
    }

    /// Fire the device's receive-readiness callback.
    pub fn signal_rx(&self) {
        let notify = self.notify.lock().unwrap().clone();
        if let Some(notify) = notify {
            notify();
        }
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Number of `send` calls started so far.
    pub fn entered(&self) -> usize {
        self.state.lock().unwrap().entered
    }

    /// Most `send` calls ever in flight at once.
    pub fn max_active(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    pub fn pause(&self) {
        self.state.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().unwrap().paused = false;
        self.resumed.notify_all();
    }
}

impl NetBackend for RecordingBackend {
    fn recv(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        match self.state.lock().unwrap().rx.pop_front() {
            None => Ok(0),
            Some(Ok(frame)) => Ok(scatter(bufs, &frame)),
            Some(Err(kind)) => Err(kind.into()),
        }
    }

    fn send(&self, bufs: &[IoSlice<'_>], len: usize) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.entered += 1;
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        while state.paused {
            state = self.resumed.wait(state).unwrap();
        }

        let mut frame = Vec::with_capacity(len);
        gather(bufs, 0, &mut frame);
        assert_eq!(frame.len(), len, "send length must match the gathered bytes");
        state.sent.push(frame);
        state.active -= 1;
        Ok(())
    }

    fn has_vnet_hdr(&self) -> bool {
        self.native_hdr
    }
}

impl NotifyTarget for RecordingBackend {
    fn set_notify(&self, notify: RxNotify) {
        *self.notify.lock().unwrap() = Some(notify);
    }
}

/// Guest address the [`MemoryTouchingBackend`] scribbles on, clear of rings and packet buffers.
pub const TOUCH_ADDR: u64 = MEM_SIZE as u64 - 0x100;

/// A reflecting loopback that reads and writes guest memory from inside `send` and `recv`, the
/// way a transport sharing memory with the guest (or re-entering the device) would.
pub struct MemoryTouchingBackend {
    inner: LoopbackBackend,
    mem: Arc<GuestRam>,
}

impl MemoryTouchingBackend {
    pub fn new(mem: Arc<GuestRam>) -> Self {
        Self {
            inner: LoopbackBackend::reflecting(),
            mem,
        }
    }

    pub fn inject(&self, frame: Vec<u8>) {
        self.inner.inject(frame);
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        self.inner.take_sent()
    }

    fn touch(&self, marker: u8) {
        let mut old = [0u8; 1];
        self.mem.read(TOUCH_ADDR, &mut old).unwrap();
        self.mem.write(TOUCH_ADDR, &[marker]).unwrap();
    }
}

impl NetBackend for MemoryTouchingBackend {
    fn recv(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.touch(0x52);
        self.inner.recv(bufs)
    }

    fn send(&self, bufs: &[IoSlice<'_>], len: usize) -> io::Result<()> {
        self.touch(0x54);
        self.inner.send(bufs, len)
    }
}

impl NotifyTarget for MemoryTouchingBackend {
    fn set_notify(&self, notify: RxNotify) {
        self.inner.set_notify(notify);
    }
}
