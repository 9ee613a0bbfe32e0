use crate::config::VirtioNetConfig;
use crate::error::VtnetError;
use crate::mac::MacAddr;
use crate::options::{NetOptions, PciSlot};
use crate::rx::RxState;
use crate::tx::{self, TxState};
use crate::{VTNET_CTLQ, VTNET_RINGSZ, VTNET_RXQ, VTNET_TXQ};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::thread::{self, JoinHandle};
use vtnet_backend::{BackendRegistry, NetBackend, NetFeatures, RxNotify, VIRTIO_NET_S_LINK_UP};
use vtnet_virtio::device::{
    VIRTIO_DEVICE_TYPE_NET, VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_F_RING_INDIRECT_DESC,
};
use vtnet_virtio::{VirtioDevice, Virtqueue};

/// Capabilities the frontend offers regardless of transport.
const VTNET_S_HOSTCAPS: u64 = NetFeatures::MAC.bits()
    | NetFeatures::STATUS.bits()
    | VIRTIO_F_NOTIFY_ON_EMPTY
    | VIRTIO_F_RING_INDIRECT_DESC;

/// Feature-dependent receive framing. Always replaced as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub features: u64,
    pub rx_hdr_len: usize,
    pub merge_buffers: bool,
}

impl Negotiated {
    fn from_features(features: u64) -> Self {
        let net = NetFeatures::from_bits_truncate(features);
        Self {
            features,
            rx_hdr_len: net.rx_header_len(),
            merge_buffers: net.contains(NetFeatures::MRG_RXBUF),
        }
    }
}

impl Default for Negotiated {
    /// The pre-negotiation state: mergeable-buffer framing until told otherwise.
    fn default() -> Self {
        Self {
            features: 0,
            rx_hdr_len: vtnet_backend::VirtioNetHdr::LEN,
            merge_buffers: true,
        }
    }
}

/// State shared by the vCPU-facing entry points, the transport's readiness callback and the
/// transmit worker.
pub(crate) struct Shared {
    pub name: String,
    pub rx_queue: Arc<dyn Virtqueue>,
    pub tx_queue: Arc<dyn Virtqueue>,
    pub backend: Option<Arc<dyn NetBackend>>,
    host_features: u64,

    config: Mutex<VirtioNetConfig>,
    negotiated: RwLock<Negotiated>,

    resetting: AtomicBool,
    rx_ready: AtomicBool,
    halted: AtomicBool,

    rx: Mutex<RxState>,
    tx: Mutex<TxState>,
    /// Signalled by notify when the worker is idle and there is work.
    pub tx_wake: Condvar,
    /// Signalled by the worker whenever it enters the idle state.
    pub tx_idle: Condvar,
}

impl Shared {
    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn rx_ready(&self) -> bool {
        self.rx_ready.load(Ordering::Acquire)
    }

    /// Mark the receive side live. Returns `true` on the first call after attach or reset.
    pub fn set_rx_ready(&self) -> bool {
        !self.rx_ready.swap(true, Ordering::AcqRel)
    }

    pub fn negotiated(&self) -> Negotiated {
        *self
            .negotiated
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stop servicing the guest until the next reset.
    pub fn halt(&self, queue: &'static str, reason: &dyn fmt::Display) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            tracing::error!(
                device = %self.name,
                queue,
                "guest protocol violation, device halted until reset: {reason}"
            );
        }
    }

    pub fn lock_rx(&self) -> MutexGuard<'_, RxState> {
        self.rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn lock_tx(&self) -> MutexGuard<'_, TxState> {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_config(&self) -> MutexGuard<'_, VirtioNetConfig> {
        self.config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply_negotiated_features(&self, features: u64) {
        let negotiated = Negotiated::from_features(features);
        *self
            .negotiated
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = negotiated;

        if let Some(backend) = &self.backend {
            let net = NetFeatures::from_bits_truncate(features);
            if let Err(err) = backend.set_capabilities(net, negotiated.rx_hdr_len) {
                tracing::warn!(device = %self.name, "backend rejected negotiated features: {err}");
            }
        }
        self.rx_queue.set_features(features);
        self.tx_queue.set_features(features);

        tracing::debug!(
            device = %self.name,
            features,
            rx_hdr_len = negotiated.rx_hdr_len,
            "features negotiated"
        );
    }

    fn reset(&self) {
        tracing::debug!(device = %self.name, "device reset requested");

        self.resetting.store(true, Ordering::Release);

        // Wait for the transmit worker to park, then for any receive pass to finish.
        {
            let mut tx = self.lock_tx();
            while tx.in_progress {
                tx = self
                    .tx_idle
                    .wait(tx)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
        drop(self.lock_rx());

        self.rx_ready.store(false, Ordering::Release);
        *self
            .negotiated
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Negotiated::default();

        self.rx_queue.reset();
        self.tx_queue.reset();
        self.halted.store(false, Ordering::Release);

        self.resetting.store(false, Ordering::Release);
    }
}

/// An attached virtio-net device.
///
/// Dropping the device stops and joins its transmit worker.
pub struct VirtioNet {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl VirtioNet {
    /// Attach a device configured by an option string such as `"tap0,00:a0:98:12:34:56"`.
    pub fn attach(
        options: &str,
        slot: PciSlot,
        vm_name: &str,
        rx_queue: Arc<dyn Virtqueue>,
        tx_queue: Arc<dyn Virtqueue>,
        registry: &BackendRegistry,
    ) -> Result<Self, VtnetError> {
        let options: NetOptions = options.parse()?;
        Self::with_options(&options, slot, vm_name, rx_queue, tx_queue, registry)
    }

    /// Attach a device from already-parsed options.
    ///
    /// A transport that fails to open is not an error: the device comes up with the link down
    /// and drops all traffic.
    pub fn with_options(
        options: &NetOptions,
        slot: PciSlot,
        vm_name: &str,
        rx_queue: Arc<dyn Virtqueue>,
        tx_queue: Arc<dyn Virtqueue>,
        registry: &BackendRegistry,
    ) -> Result<Self, VtnetError> {
        let name = format!("vtnet-{slot}");
        let mac = options
            .mac
            .unwrap_or_else(|| MacAddr::generate(slot, vm_name));

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let backend = options
                .backend
                .as_deref()
                .and_then(|backend| match registry.open(backend, rx_notify(weak.clone())) {
                    Ok(opened) => Some(opened),
                    Err(err) => {
                        tracing::warn!(device = %name, backend, "net backend initialization failed: {err}");
                        None
                    }
                });

            let mut host_features = VTNET_S_HOSTCAPS;
            if let Some(backend) = &backend {
                host_features |= backend.capabilities().bits();
            }

            // Only a requested transport that failed to open takes the link down.
            let link_up = options.backend.is_none() || backend.is_some();
            let config = VirtioNetConfig {
                mac: mac.octets(),
                status: if link_up { VIRTIO_NET_S_LINK_UP } else { 0 },
                max_virtqueue_pairs: 1,
            };

            Shared {
                name: name.clone(),
                rx_queue,
                tx_queue,
                backend,
                host_features,
                config: Mutex::new(config),
                negotiated: RwLock::new(Negotiated::default()),
                resetting: AtomicBool::new(false),
                rx_ready: AtomicBool::new(false),
                halted: AtomicBool::new(false),
                rx: Mutex::new(RxState::new()),
                tx: Mutex::new(TxState::default()),
                tx_wake: Condvar::new(),
                tx_idle: Condvar::new(),
            }
        });

        let worker_name = format!("{name} tx");
        let worker = thread::Builder::new()
            .name(worker_name.clone())
            .spawn({
                let shared = shared.clone();
                move || tx::run(&shared)
            })
            .map_err(|source| VtnetError::SpawnWorker {
                name: worker_name,
                source,
            })?;

        tracing::debug!(
            device = %name,
            %mac,
            backend = options.backend.as_deref().unwrap_or("none"),
            link_up = shared.lock_config().status & VIRTIO_NET_S_LINK_UP != 0,
            "attached"
        );
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// The transport has frames for the guest. Safe to call from any thread.
    pub fn on_receive_ready(&self) {
        self.shared.on_receive_ready();
    }

    /// Record the feature set the driver accepted.
    pub fn apply_negotiated_features(&self, features: u64) {
        self.shared.apply_negotiated_features(features);
    }

    /// Stop both datapaths and return to the just-attached state.
    pub fn reset(&self) {
        self.shared.reset();
    }

    pub fn negotiated_features(&self) -> u64 {
        self.shared.negotiated().features
    }

    /// Length of the `virtio_net_hdr` prepended to received frames.
    pub fn rx_header_len(&self) -> usize {
        self.shared.negotiated().rx_hdr_len
    }

    pub fn merge_buffers(&self) -> bool {
        self.shared.negotiated().merge_buffers
    }

    /// Whether the guest has notified the receive queue since attach or the last reset.
    pub fn rx_ready(&self) -> bool {
        self.shared.rx_ready()
    }

    pub fn is_halted(&self) -> bool {
        self.shared.is_halted()
    }

    pub fn config(&self) -> VirtioNetConfig {
        *self.shared.lock_config()
    }

    pub fn link_up(&self) -> bool {
        self.config().status & VIRTIO_NET_S_LINK_UP != 0
    }
}

/// The readiness callback handed to the transport. It holds only a weak reference so the
/// transport never keeps a detached device alive.
fn rx_notify(device: Weak<Shared>) -> RxNotify {
    Arc::new(move || {
        if let Some(shared) = device.upgrade() {
            shared.on_receive_ready();
        }
    })
}

impl VirtioDevice for VirtioNet {
    fn name(&self) -> &'static str {
        "vtnet"
    }

    fn device_type(&self) -> u16 {
        VIRTIO_DEVICE_TYPE_NET
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn queue_max_size(&self, _queue: u16) -> u16 {
        VTNET_RINGSZ
    }

    fn config_size(&self) -> usize {
        VirtioNetConfig::SIZE
    }

    fn device_features(&self) -> u64 {
        self.shared.host_features
    }

    fn set_features(&self, features: u64) {
        self.shared.apply_negotiated_features(features);
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        self.shared.lock_config().read(offset, data);
    }

    fn write_config(&self, offset: u64, data: &[u8]) {
        let stored = self.shared.lock_config().write(offset, data);
        if stored == 0 && !data.is_empty() {
            tracing::debug!(device = %self.shared.name, offset, "write to read-only register ignored");
        }
    }

    fn notify(&self, queue: u16) {
        match queue {
            VTNET_RXQ => self.shared.ping_rxq(),
            VTNET_TXQ => self.shared.ping_txq(),
            VTNET_CTLQ => {
                tracing::debug!(device = %self.shared.name, "control queue is not implemented")
            }
            _ => tracing::debug!(device = %self.shared.name, queue, "notify for unsupported queue"),
        }
    }

    fn reset(&self) {
        self.shared.reset();
    }

    fn needs_reset(&self) -> bool {
        self.shared.is_halted()
    }
}

impl Drop for VirtioNet {
    fn drop(&mut self) {
        {
            let mut tx = self.shared.lock_tx();
            tx.shutdown = true;
            self.shared.tx_wake.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(device = %self.shared.name, "transmit worker panicked");
            }
        }
    }
}
