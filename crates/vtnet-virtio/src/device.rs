pub const VIRTIO_DEVICE_TYPE_NET: u16 = 1;

pub const VIRTIO_F_NOTIFY_ON_EMPTY: u64 = 1 << 24;
pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;

/// The callback set a device model registers with its virtio transport.
///
/// Every method takes `&self`: the transport calls in from vCPU threads while the device's own
/// worker threads keep running, so implementations carry their own locking.
pub trait VirtioDevice: Send + Sync {
    /// Short name used for logging and thread names.
    fn name(&self) -> &'static str;

    fn device_type(&self) -> u16;

    /// Number of virtqueues the transport should expose.
    fn num_queues(&self) -> u16;

    fn queue_max_size(&self, queue: u16) -> u16;

    /// Size in bytes of the device-specific configuration block.
    fn config_size(&self) -> usize;

    /// Host capabilities offered to the driver.
    fn device_features(&self) -> u64;

    /// Apply the feature set the driver accepted (already masked by [`Self::device_features`]).
    fn set_features(&self, features: u64);

    fn read_config(&self, offset: u64, data: &mut [u8]);

    fn write_config(&self, offset: u64, data: &[u8]);

    /// The driver wrote the notify register of `queue`.
    fn notify(&self, queue: u16);

    fn reset(&self);

    /// Whether the device hit an unrecoverable guest error and wants `DEVICE_NEEDS_RESET`.
    fn needs_reset(&self) -> bool {
        false
    }
}
