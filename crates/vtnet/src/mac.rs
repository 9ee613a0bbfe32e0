use crate::options::PciSlot;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Organizationally unique identifier used for generated addresses.
pub const GENERATED_MAC_OUI: [u8; 3] = [0x00, 0xa0, 0x98];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacAddrError {
    #[error("invalid MAC address {0:?} (expected six hex octets separated by ':' or '-')")]
    Format(String),

    #[error("MAC address {0} is a multicast address")]
    Multicast(MacAddr),

    #[error("MAC address must not be all zeroes")]
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(self) -> [u8; 6] {
        self.0
    }

    pub fn is_multicast(self) -> bool {
        self.0[0] & 1 != 0
    }

    /// A stable, locally derived address for a device without a configured MAC.
    ///
    /// The low three octets come from a SHA-256 digest of `"<slot>-<func>-<vm name>"`, so the
    /// same slot in the same VM always gets the same address.
    pub fn generate(slot: PciSlot, vm_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}-{}-{}", slot.slot, slot.func, vm_name));
        let digest = hasher.finalize();

        let [a, b, c] = GENERATED_MAC_OUI;
        Self([a, b, c, digest[0], digest[1], digest[2]])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl std::str::FromStr for MacAddr {
    type Err = MacAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format_err = || MacAddrError::Format(s.to_owned());

        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(|c: char| c == ':' || c == '-');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(format_err)?;
            if part.is_empty() || part.len() > 2 {
                return Err(format_err());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| format_err())?;
        }
        if parts.next().is_some() {
            return Err(format_err());
        }

        let mac = Self(octets);
        if mac.is_multicast() {
            return Err(MacAddrError::Multicast(mac));
        }
        if octets == [0; 6] {
            return Err(MacAddrError::Zero);
        }
        Ok(mac)
    }
}
