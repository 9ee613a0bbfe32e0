use bitflags::bitflags;

/// `VIRTIO_NET_S_LINK_UP` in the config-space status register.
pub const VIRTIO_NET_S_LINK_UP: u16 = 1;

bitflags! {
    /// virtio-net device feature bits (the low, device-specific part of the feature word).
    ///
    /// Generic ring bits such as `VIRTIO_F_NOTIFY_ON_EMPTY` live above bit 23 and are not part
    /// of this set; see `vtnet_virtio::device`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct NetFeatures: u64 {
        const CSUM = 1 << 0;
        const GUEST_CSUM = 1 << 1;
        const MAC = 1 << 5;
        const GUEST_TSO4 = 1 << 7;
        const GUEST_TSO6 = 1 << 8;
        const GUEST_ECN = 1 << 9;
        const GUEST_UFO = 1 << 10;
        const HOST_TSO4 = 1 << 11;
        const HOST_TSO6 = 1 << 12;
        const HOST_ECN = 1 << 13;
        const HOST_UFO = 1 << 14;
        const MRG_RXBUF = 1 << 15;
        const STATUS = 1 << 16;
    }
}

impl NetFeatures {
    /// Bits the device frontend implements itself, whatever the transport supports.
    pub const FRONTEND: Self = Self::MAC.union(Self::STATUS).union(Self::MRG_RXBUF);

    /// Length of the `virtio_net_hdr` that prefixes every frame once these features are
    /// negotiated.
    pub fn rx_header_len(self) -> usize {
        if self.contains(Self::MRG_RXBUF) {
            crate::vnet_hdr::VirtioNetHdr::LEN
        } else {
            crate::vnet_hdr::VirtioNetHdr::BASE_LEN
        }
    }
}
