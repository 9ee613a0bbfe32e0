//! Network transports behind the virtio-net device.
//!
//! A transport moves whole Ethernet frames between the device and the host. The device talks to
//! it through [`NetBackend`] using scatter/gather vectors that point straight into guest buffers,
//! and learns about incoming traffic through an [`RxNotify`] callback handed over at open time.
//!
//! Transports are looked up by name through a [`BackendRegistry`].
#![forbid(unsafe_code)]

pub mod features;
pub mod loopback;
pub mod registry;
pub mod vnet_hdr;

use std::io::{self, IoSlice, IoSliceMut};
use std::sync::Arc;
use thiserror::Error;

pub use features::{NetFeatures, VIRTIO_NET_S_LINK_UP};
pub use loopback::{LoopbackBackend, NullBackend};
pub use registry::BackendRegistry;
pub use vnet_hdr::VirtioNetHdr;

/// Called by a transport whenever frames may be waiting to be received.
///
/// The callback may run on any thread, including re-entrantly from inside a
/// [`NetBackend::send`] on a looping transport.
pub type RxNotify = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no network backend matches {0:?}")]
    UnknownBackend(String),

    #[error("failed to open network backend {name:?}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("backend cannot provide features {0:?}")]
    UnsupportedFeatures(NetFeatures),

    #[error("unsupported virtio-net header length {0}")]
    InvalidHeaderLen(usize),
}

/// A frame transport.
///
/// All methods take `&self`: the device receives from its notify callback while its transmit
/// worker sends, so implementations carry their own locking.
pub trait NetBackend: Send + Sync {
    /// Receive one frame into `bufs`.
    ///
    /// `Ok(0)` means nothing is pending. A frame longer than `bufs` is truncated. An
    /// [`io::ErrorKind::WouldBlock`] error is treated like `Ok(0)` by callers.
    fn recv(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize>;

    /// Send one frame of `len` bytes gathered from `bufs`.
    fn send(&self, bufs: &[IoSlice<'_>], len: usize) -> io::Result<()>;

    /// Offload features the transport can provide on top of the frontend's own.
    fn capabilities(&self) -> NetFeatures {
        NetFeatures::empty()
    }

    /// Whether frames crossing this transport already carry a `virtio_net_hdr`.
    ///
    /// When `false` the device synthesizes the header on receive and strips it on transmit.
    fn has_vnet_hdr(&self) -> bool {
        false
    }

    /// Enable the negotiated `features`, with frames framed by a header of `vnet_hdr_len` bytes.
    fn set_capabilities(&self, features: NetFeatures, vnet_hdr_len: usize) -> Result<(), BackendError> {
        check_capabilities(self.capabilities(), features, vnet_hdr_len)
    }
}

/// Validate a `set_capabilities` request against what a transport offered.
pub fn check_capabilities(
    offered: NetFeatures,
    requested: NetFeatures,
    vnet_hdr_len: usize,
) -> Result<(), BackendError> {
    if ![0, VirtioNetHdr::BASE_LEN, VirtioNetHdr::LEN].contains(&vnet_hdr_len) {
        return Err(BackendError::InvalidHeaderLen(vnet_hdr_len));
    }
    let extra = requested.difference(offered | NetFeatures::FRONTEND);
    if !extra.is_empty() {
        return Err(BackendError::UnsupportedFeatures(extra));
    }
    Ok(())
}

impl<T: NetBackend + ?Sized> NetBackend for Arc<T> {
    fn recv(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        <T as NetBackend>::recv(self, bufs)
    }

    fn send(&self, bufs: &[IoSlice<'_>], len: usize) -> io::Result<()> {
        <T as NetBackend>::send(self, bufs, len)
    }

    fn capabilities(&self) -> NetFeatures {
        <T as NetBackend>::capabilities(self)
    }

    fn has_vnet_hdr(&self) -> bool {
        <T as NetBackend>::has_vnet_hdr(self)
    }

    fn set_capabilities(&self, features: NetFeatures, vnet_hdr_len: usize) -> Result<(), BackendError> {
        <T as NetBackend>::set_capabilities(self, features, vnet_hdr_len)
    }
}
