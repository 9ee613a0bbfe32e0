//! In-process transports.

use crate::vnet_hdr::{gather, scatter};
use crate::{NetBackend, NetFeatures, RxNotify};
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::sync::{Mutex, MutexGuard};

/// A transport that drops every transmitted frame and never receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl NetBackend for NullBackend {
    fn recv(&self, _bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        Ok(0)
    }

    fn send(&self, _bufs: &[IoSlice<'_>], _len: usize) -> io::Result<()> {
        Ok(())
    }
}

struct LoopbackState {
    rx: VecDeque<Vec<u8>>,
    tx: Vec<Vec<u8>>,
    reflect: bool,
    features: NetFeatures,
    vnet_hdr_len: usize,
}

/// A transport backed by in-memory frame queues.
///
/// Frames queued with [`LoopbackBackend::inject`] are delivered to the device; frames the device
/// sends are recorded and, with [`LoopbackBackend::reflecting`], queued straight back for
/// receive.
pub struct LoopbackBackend {
    state: Mutex<LoopbackState>,
    notify: Mutex<Option<RxNotify>>,
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                rx: VecDeque::new(),
                tx: Vec::new(),
                reflect: false,
                features: NetFeatures::empty(),
                vnet_hdr_len: 0,
            }),
            notify: Mutex::new(None),
        }
    }

    /// A loopback that feeds every transmitted frame back to the receive side.
    pub fn reflecting() -> Self {
        let backend = Self::new();
        backend.lock().reflect = true;
        backend
    }

    /// Install the callback fired when frames become available.
    pub fn set_notify(&self, notify: RxNotify) {
        *self
            .notify
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(notify);
    }

    /// Queue a host → guest frame and signal the receiver.
    pub fn inject(&self, frame: Vec<u8>) {
        self.lock().rx.push_back(frame);
        self.fire_notify();
    }

    /// Drain the frames the device has sent so far.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.lock().tx)
    }

    /// Frames still waiting to be received.
    pub fn pending_rx(&self) -> usize {
        self.lock().rx.len()
    }

    /// Features and header length last enabled through `set_capabilities`.
    pub fn negotiated(&self) -> (NetFeatures, usize) {
        let state = self.lock();
        (state.features, state.vnet_hdr_len)
    }

    fn fire_notify(&self) {
        // Clone out of the lock: the callback re-enters `recv`.
        let notify = self
            .notify
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(notify) = notify {
            notify();
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NetBackend for LoopbackBackend {
    fn recv(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let Some(frame) = self.lock().rx.pop_front() else {
            return Ok(0);
        };
        Ok(scatter(bufs, &frame))
    }

    fn send(&self, bufs: &[IoSlice<'_>], len: usize) -> io::Result<()> {
        let mut frame = Vec::with_capacity(len);
        gather(bufs, 0, &mut frame);
        frame.truncate(len);

        let reflect = {
            let mut state = self.lock();
            state.tx.push(frame.clone());
            if state.reflect {
                state.rx.push_back(frame);
            }
            state.reflect
        };
        if reflect {
            self.fire_notify();
        }
        Ok(())
    }

    fn set_capabilities(
        &self,
        features: NetFeatures,
        vnet_hdr_len: usize,
    ) -> Result<(), crate::BackendError> {
        crate::check_capabilities(self.capabilities(), features, vnet_hdr_len)?;
        let mut state = self.lock();
        state.features = features;
        state.vnet_hdr_len = vnet_hdr_len;
        Ok(())
    }
}
