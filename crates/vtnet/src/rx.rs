//! Receive path: host → guest.

use crate::device::{Negotiated, Shared};
use crate::{RX_FRAME_BUF_LEN, VTNET_MAXSEGS};
use std::io::{self, IoSliceMut};
use thiserror::Error;
use vtnet_backend::vnet_hdr::scatter;
use vtnet_backend::{NetBackend, VirtioNetHdr};
use vtnet_virtio::{Descriptor, DescriptorChain, QueueError};

/// Receive-side state, owned by the receive lock.
pub(crate) struct RxState {
    /// Each frame is read here first, then copied into guest buffers. Frames the guest cannot take
    /// are read here and dropped.
    frame_buf: Box<[u8]>,
}

impl RxState {
    pub fn new() -> Self {
        Self {
            frame_buf: vec![0; RX_FRAME_BUF_LEN].into_boxed_slice(),
        }
    }
}

#[derive(Debug, Error)]
enum RxError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("receive chain of {0} bytes cannot hold the virtio-net header")]
    ShortChain(u64),

    #[error("receive chain contains a device-read-only buffer")]
    ReadOnlyBuffer,

    #[error("backend receive failed: {0}")]
    Backend(#[source] io::Error),
}

impl Shared {
    /// Move pending frames from the transport into guest receive buffers.
    pub fn on_receive_ready(&self) {
        let mut rx = self.lock_rx();
        let Some(backend) = self.backend.as_deref() else {
            return;
        };

        if !self.rx_ready() || self.is_resetting() || self.is_halted() {
            // The rx ring is not set up yet, or is being torn down. Drop the frame.
            discard(&self.name, backend, &mut rx);
            return;
        }

        if !self.rx_queue.has_descriptors() {
            // No guest buffers. Drop the frame, and interrupt on empty if negotiated.
            discard(&self.name, backend, &mut rx);
            self.rx_queue.flush_interrupts(true);
            return;
        }

        let negotiated = self.negotiated();
        loop {
            let chain = match self.rx_queue.pull_chain(VTNET_MAXSEGS) {
                Ok(Some(chain)) => chain,
                Ok(None) => break,
                Err(err) => {
                    self.halt("rx", &err);
                    self.rx_queue.flush_interrupts(false);
                    return;
                }
            };
            if chain.segment_count() == 0 {
                self.rx_queue.return_chain(chain);
                self.halt("rx", &"empty descriptor chain");
                self.rx_queue.flush_interrupts(false);
                return;
            }

            match self.receive_into(backend, &mut rx, &chain, negotiated) {
                Ok(0) => {
                    // Nothing more to read, but buffers remain.
                    self.rx_queue.return_chain(chain);
                    self.rx_queue.flush_interrupts(false);
                    return;
                }
                Ok(len) => {
                    let len = u32::try_from(len).unwrap_or(u32::MAX);
                    self.rx_queue.complete_chain(chain, len);
                }
                Err(RxError::Backend(err)) => {
                    tracing::warn!(device = %self.name, "dropping received frame: {err}");
                    self.rx_queue.return_chain(chain);
                    break;
                }
                Err(err) => {
                    self.rx_queue.return_chain(chain);
                    self.halt("rx", &err);
                    self.rx_queue.flush_interrupts(false);
                    return;
                }
            }
        }

        // Ring exhausted or the transport failed: interrupt, including for notify-on-empty.
        self.rx_queue.flush_interrupts(true);
    }

    /// Receive one frame into `chain`, returning the number of bytes the guest should see
    /// (header included). `Ok(0)` means the transport had nothing.
    ///
    /// The transport fills the frame buffer with guest memory unlocked. Only the final copy runs
    /// inside `write_chain`.
    fn receive_into(
        &self,
        backend: &dyn NetBackend,
        rx: &mut RxState,
        chain: &DescriptorChain,
        negotiated: Negotiated,
    ) -> Result<usize, RxError> {
        if !chain.descriptors().iter().all(Descriptor::is_write_only) {
            return Err(RxError::ReadOnlyBuffer);
        }

        let hdr_len = if backend.has_vnet_hdr() {
            0
        } else {
            negotiated.rx_hdr_len
        };
        let capacity = usize::try_from(chain.total_len()).unwrap_or(usize::MAX);
        if capacity < hdr_len {
            return Err(RxError::ShortChain(chain.total_len()));
        }
        let capacity = capacity.min(rx.frame_buf.len());

        let payload = &mut rx.frame_buf[hdr_len..capacity];
        let received = match backend.recv(&mut [IoSliceMut::new(payload)]) {
            Ok(0) => return Ok(0),
            Ok(n) => n.min(capacity - hdr_len),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!(device = %self.name, "backend receive would block");
                return Ok(0);
            }
            Err(err) => return Err(RxError::Backend(err)),
        };

        let header = VirtioNetHdr::for_rx(negotiated.merge_buffers).to_bytes_le();
        rx.frame_buf[..hdr_len].copy_from_slice(&header[..hdr_len]);
        let frame = &rx.frame_buf[..hdr_len + received];
        self.rx_queue.write_chain(chain, &mut |bufs| {
            scatter(bufs, frame);
        })?;
        Ok(frame.len())
    }

    /// Handle a notify on the receive queue: the guest has posted its first buffers.
    pub fn ping_rxq(&self) {
        if self.set_rx_ready() {
            // Further RX notifications carry no information; readiness is driven by the backend.
            self.rx_queue.set_notify_suppressed(true);
        }
    }
}

/// Read and drop one frame.
fn discard(device: &str, backend: &dyn NetBackend, rx: &mut RxState) {
    let mut bufs = [IoSliceMut::new(&mut rx.frame_buf)];
    match backend.recv(&mut bufs) {
        Ok(0) => {}
        Ok(len) => tracing::debug!(device, len, "discarded received frame"),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
        Err(err) => tracing::warn!(device, "backend receive failed while discarding: {err}"),
    }
}
