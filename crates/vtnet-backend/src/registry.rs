use crate::{BackendError, LoopbackBackend, NetBackend, NullBackend, RxNotify};
use std::sync::Arc;

type Factory = Box<dyn Fn(&str, RxNotify) -> Result<Arc<dyn NetBackend>, BackendError> + Send + Sync>;

struct Entry {
    prefix: String,
    open: Factory,
}

/// Transports keyed by name prefix.
///
/// A device option such as `tap0` selects the transport registered as `tap`; the full name is
/// handed to the factory so it can pick the host interface.
#[derive(Default)]
pub struct BackendRegistry {
    entries: Vec<Entry>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the in-process transports: `null` and `loopback`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("null", |_, _| Ok(Arc::new(NullBackend)));
        registry.register("loopback", |_, notify| {
            let backend = LoopbackBackend::reflecting();
            backend.set_notify(notify);
            Ok(Arc::new(backend))
        });
        registry
    }

    /// Register `open` for names starting with `prefix`. Later registrations win on ties.
    pub fn register<F>(&mut self, prefix: &str, open: F)
    where
        F: Fn(&str, RxNotify) -> Result<Arc<dyn NetBackend>, BackendError> + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            prefix: prefix.to_owned(),
            open: Box::new(open),
        });
    }

    /// Open the transport `name`, wiring `notify` to its receive readiness.
    ///
    /// The longest matching prefix is used.
    pub fn open(&self, name: &str, notify: RxNotify) -> Result<Arc<dyn NetBackend>, BackendError> {
        let entry = self
            .entries
            .iter()
            .filter(|entry| name.starts_with(&entry.prefix))
            .max_by_key(|entry| entry.prefix.len())
            .ok_or_else(|| BackendError::UnknownBackend(name.to_owned()))?;

        tracing::debug!(backend = name, prefix = %entry.prefix, "opening network backend");
        (entry.open)(name, notify)
    }
}
