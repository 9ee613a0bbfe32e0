use std::sync::Mutex;

/// A sink for interrupts produced by virtqueues.
///
/// Queues raise interrupts from whichever thread completes work, so implementations must be
/// callable concurrently.
pub trait InterruptSink: Send + Sync {
    fn raise_legacy_irq(&self);
    fn signal_msix(&self, vector: u16);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct InterruptCounts {
    legacy_irq_count: u64,
    msix_vectors: Vec<u16>,
}

/// Records every interrupt instead of delivering it.
#[derive(Debug, Default)]
pub struct InterruptLog {
    inner: Mutex<InterruptCounts>,
}

impl InterruptLog {
    pub fn legacy_irq_count(&self) -> u64 {
        self.lock().legacy_irq_count
    }

    pub fn msix_vectors(&self) -> Vec<u16> {
        self.lock().msix_vectors.clone()
    }

    /// Total interrupts of either kind.
    pub fn total(&self) -> u64 {
        let counts = self.lock();
        counts.legacy_irq_count + counts.msix_vectors.len() as u64
    }

    pub fn clear(&self) {
        *self.lock() = InterruptCounts::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InterruptCounts> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InterruptSink for InterruptLog {
    fn raise_legacy_irq(&self) {
        self.lock().legacy_irq_count += 1;
    }

    fn signal_msix(&self, vector: u16) {
        self.lock().msix_vectors.push(vector);
    }
}

impl<T: InterruptSink + ?Sized> InterruptSink for std::sync::Arc<T> {
    fn raise_legacy_irq(&self) {
        <T as InterruptSink>::raise_legacy_irq(self);
    }

    fn signal_msix(&self, vector: u16) {
        <T as InterruptSink>::signal_msix(self, vector);
    }
}
