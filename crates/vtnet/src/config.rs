/// The virtio-net device configuration block, as laid out in the device-specific config window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioNetConfig {
    pub mac: [u8; 6],
    pub status: u16,
    pub max_virtqueue_pairs: u16,
}

impl VirtioNetConfig {
    pub const SIZE: usize = 10;

    const MAC_LEN: usize = 6;

    pub fn to_bytes_le(&self) -> [u8; Self::SIZE] {
        let mut config = [0u8; Self::SIZE];
        config[..6].copy_from_slice(&self.mac);
        config[6..8].copy_from_slice(&self.status.to_le_bytes());
        config[8..10].copy_from_slice(&self.max_virtqueue_pairs.to_le_bytes());
        config
    }

    /// Copy the register window starting at `offset` into `data`. Bytes past the block read as
    /// zero.
    pub fn read(&self, offset: u64, data: &mut [u8]) {
        data.fill(0);
        let config = self.to_bytes_le();
        let Ok(offset) = usize::try_from(offset) else {
            return;
        };
        if offset >= config.len() {
            return;
        }

        let end = config.len().min(offset.saturating_add(data.len()));
        data[..end - offset].copy_from_slice(&config[offset..end]);
    }

    /// Apply a driver write. Only the MAC is writable; a write starting inside it is clamped to
    /// the MAC bytes.
    ///
    /// Returns the number of bytes stored.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> usize {
        let Ok(offset) = usize::try_from(offset) else {
            return 0;
        };
        if offset >= Self::MAC_LEN {
            return 0;
        }

        let end = Self::MAC_LEN.min(offset.saturating_add(data.len()));
        let len = end - offset;
        self.mac[offset..end].copy_from_slice(&data[..len]);
        len
    }
}
