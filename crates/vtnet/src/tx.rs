//! Transmit path: guest → host, drained by one worker thread per device.

use crate::device::Shared;
use crate::VTNET_MAXSEGS;
use std::io::IoSlice;
use vtnet_backend::vnet_hdr::gather;

/// Guarded by the transmit lock.
#[derive(Debug, Default)]
pub(crate) struct TxState {
    /// The worker is draining the queue. Never true while the worker waits for work.
    pub in_progress: bool,
    /// Set on detach; the worker exits at its next idle check.
    pub shutdown: bool,
}

/// Body of the transmit worker.
pub(crate) fn run(shared: &Shared) {
    let queue = &shared.tx_queue;
    tracing::debug!(device = %shared.name, "transmit worker started");

    // One outgoing frame, reused across chains.
    let mut frame = Vec::new();
    let mut tx = shared.lock_tx();
    loop {
        // The transmit lock is held here.
        while !tx.shutdown && !shared.tx_work_pending() {
            // Re-enable notifications, then look again so a chain posted in between is not
            // missed.
            queue.set_notify_suppressed(false);
            if shared.tx_work_pending() {
                break;
            }

            tx.in_progress = false;
            shared.tx_idle.notify_all();
            tx = shared
                .tx_wake
                .wait(tx)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if tx.shutdown {
            tx.in_progress = false;
            shared.tx_idle.notify_all();
            tracing::debug!(device = %shared.name, "transmit worker stopped");
            return;
        }

        queue.set_notify_suppressed(true);
        tx.in_progress = true;
        drop(tx);

        // A reset arriving now waits for this drain to finish.
        while !shared.is_halted() && queue.has_descriptors() {
            shared.process_tx_chain(&mut frame);
        }
        queue.flush_interrupts(true);

        tx = shared.lock_tx();
    }
}

impl Shared {
    /// Work the idle worker should wake up for.
    fn tx_work_pending(&self) -> bool {
        !self.is_resetting() && !self.is_halted() && self.tx_queue.has_descriptors()
    }

    /// Send one chain as one frame and hand it back to the guest.
    ///
    /// The chain is copied into `frame` under the guest memory lock and sent after the lock is
    /// released, so a transport may call back into the device from `send`.
    fn process_tx_chain(&self, frame: &mut Vec<u8>) {
        let chain = match self.tx_queue.pull_chain(VTNET_MAXSEGS) {
            Ok(Some(chain)) => chain,
            Ok(None) => return,
            Err(err) => {
                self.halt("tx", &err);
                return;
            }
        };
        if chain.segment_count() == 0 {
            self.tx_queue.return_chain(chain);
            self.halt("tx", &"empty descriptor chain");
            return;
        }

        let total = chain.total_len();
        let Ok(len) = u32::try_from(total) else {
            self.tx_queue.return_chain(chain);
            self.halt("tx", &format_args!("transmit chain of {total} bytes"));
            return;
        };

        if let Some(backend) = self.backend.as_deref() {
            let skip = if backend.has_vnet_hdr() {
                0
            } else {
                self.negotiated().rx_hdr_len
            };

            frame.clear();
            if let Err(err) = self
                .tx_queue
                .read_chain(&chain, &mut |bufs| gather(bufs, skip, &mut *frame))
            {
                self.tx_queue.return_chain(chain);
                self.halt("tx", &err);
                return;
            }

            if frame.is_empty() {
                tracing::debug!(device = %self.name, len, "transmit chain holds only a header");
            } else if let Err(err) = backend.send(&[IoSlice::new(&frame[..])], frame.len()) {
                tracing::warn!(device = %self.name, len = frame.len(), "transmit failed, frame dropped: {err}");
            }
        }

        self.tx_queue.complete_chain(chain, len);
    }

    /// Handle a notify on the transmit queue.
    pub fn ping_txq(&self) {
        if !self.tx_queue.has_descriptors() {
            return;
        }

        let tx = self.lock_tx();
        self.tx_queue.set_notify_suppressed(true);
        if !tx.in_progress {
            self.tx_wake.notify_one();
        }
    }
}
