//! `virtio_net_hdr` framing and scatter/gather helpers.
//!
//! Every frame exchanged with the guest carries a `virtio_net_hdr` prefix. Transports that do not
//! speak that header natively get it synthesized on receive and stripped on transmit by the
//! device. The helpers here copy frames between guest `IoSlice` vectors and flat buffers.

use std::io::{IoSlice, IoSliceMut};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

impl VirtioNetHdr {
    /// Header length without `num_buffers` (`VIRTIO_NET_F_MRG_RXBUF` not negotiated).
    pub const BASE_LEN: usize = 10;

    /// Header length including `num_buffers`.
    pub const LEN: usize = 12;

    /// The header the device places in front of a received frame: no offload information, and
    /// a single buffer when mergeable buffers are in use.
    pub fn for_rx(merge_buffers: bool) -> Self {
        Self {
            num_buffers: u16::from(merge_buffers),
            ..Self::default()
        }
    }

    pub fn to_bytes_le(self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.flags;
        out[1] = self.gso_type;
        out[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        out[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        out[6..8].copy_from_slice(&self.csum_start.to_le_bytes());
        out[8..10].copy_from_slice(&self.csum_offset.to_le_bytes());
        out[10..12].copy_from_slice(&self.num_buffers.to_le_bytes());
        out
    }
}

/// Copy `data` into `bufs` in order, returning the number of bytes copied. Bytes that do not fit
/// are dropped, as a datagram read into a short buffer would be.
pub fn scatter(bufs: &mut [IoSliceMut<'_>], data: &[u8]) -> usize {
    let mut copied = 0;
    for buf in bufs.iter_mut() {
        if copied == data.len() {
            break;
        }
        let n = buf.len().min(data.len() - copied);
        buf[..n].copy_from_slice(&data[copied..copied + n]);
        copied += n;
    }
    copied
}

/// Append the bytes of `bufs` to `out`, skipping the first `skip` bytes.
pub fn gather(bufs: &[IoSlice<'_>], skip: usize, out: &mut Vec<u8>) {
    let mut skip = skip;
    for buf in bufs {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        out.extend_from_slice(&buf[skip..]);
        skip = 0;
    }
}
