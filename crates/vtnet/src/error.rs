use crate::mac::MacAddrError;
use thiserror::Error;

/// Errors that can prevent a device from attaching.
///
/// Once attached, the device never fails an operation: per-packet problems are logged and either
/// dropped or, for guest protocol violations, halt the device until the next reset.
#[derive(Debug, Error)]
pub enum VtnetError {
    #[error("invalid virtio-net options: {0}")]
    Options(#[from] MacAddrError),

    #[error("failed to spawn transmit worker {name:?}")]
    SpawnWorker {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
