use crate::mac::{MacAddr, MacAddrError};
use std::fmt;

/// PCI location of the device. Used for thread names and MAC generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PciSlot {
    pub slot: u8,
    pub func: u8,
}

impl fmt::Display for PciSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.slot, self.func)
    }
}

/// Device options, parsed from `"<backend>[,<mac>]"` (e.g. `tap0,00:a0:98:12:34:56`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetOptions {
    /// Transport name, looked up in the backend registry by prefix.
    pub backend: Option<String>,
    /// Guest-visible MAC. Generated from the PCI slot when absent.
    pub mac: Option<MacAddr>,
}

impl std::str::FromStr for NetOptions {
    type Err = MacAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (backend, mac) = match s.split_once(',') {
            Some((backend, mac)) => (backend, Some(mac.parse()?)),
            None => (s, None),
        };
        let backend = backend.trim();
        Ok(Self {
            backend: (!backend.is_empty()).then(|| backend.to_owned()),
            mac,
        })
    }
}
