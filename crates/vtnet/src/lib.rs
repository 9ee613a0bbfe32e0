//! virtio-net device model.
//!
//! [`VirtioNet`] connects the guest's receive and transmit virtqueues to a host network transport:
//! - frames from the transport are written into RX chains when the transport signals readiness
//!   ([`VirtioNet::on_receive_ready`]);
//! - a dedicated worker thread drains the TX queue whenever the guest notifies it;
//! - [`VirtioNet::reset`] quiesces both paths before the rings are torn down, so a reset can race
//!   freely with traffic.
//!
//! The device is driven through [`vtnet_virtio::VirtioDevice`]; queues are consumed through
//! [`vtnet_virtio::Virtqueue`] and transports through [`vtnet_backend::NetBackend`].
#![forbid(unsafe_code)]

pub mod config;
mod device;
pub mod error;
pub mod mac;
pub mod options;
mod rx;
mod tx;

pub use config::VirtioNetConfig;
pub use device::VirtioNet;
pub use error::VtnetError;
pub use mac::{MacAddr, MacAddrError};
pub use options::{NetOptions, PciSlot};

/// Receive queue index.
pub const VTNET_RXQ: u16 = 0;
/// Transmit queue index.
pub const VTNET_TXQ: u16 = 1;
/// Control queue index. Reserved; control commands are not implemented.
pub const VTNET_CTLQ: u16 = 2;

/// Ring size offered for each queue.
pub const VTNET_RINGSZ: u16 = 1024;

/// Longest descriptor chain accepted from the guest.
pub const VTNET_MAXSEGS: usize = 256;

/// Per-device receive buffer. Holds the largest TSO segment plus its header.
pub const RX_FRAME_BUF_LEN: usize = 65536 + 64;
