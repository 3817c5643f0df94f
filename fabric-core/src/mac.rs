//! Canonical MAC address handling.
//!
//! Leases key on MAC addresses coming from three places (the hypervisor
//! inventory, the DHCP daemon's lease database, and operator input), so every
//! MAC is normalised to the lowercase colon-separated form on parse and
//! compared only in that form.

use std::fmt;
use std::str::FromStr;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FabricError;

/// A 48-bit MAC address. Displays as `aa:bb:cc:dd:ee:ff`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// A MAC from raw octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Hex form with no separators, e.g. `aabbccddeeff`. Used to derive
    /// stable identifiers from a MAC.
    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

impl FromStr for MacAddr {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let sep = if s.contains('-') { '-' } else { ':' };
        let mut octets = [0u8; 6];
        let mut parts = s.split(sep);
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| FabricError::invalid_argument(format!("malformed MAC {s:?}")))?;
            if part.len() != 2 {
                return Err(FabricError::invalid_argument(format!("malformed MAC {s:?}")));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| FabricError::invalid_argument(format!("malformed MAC {s:?}")))?;
        }
        if parts.next().is_some() {
            return Err(FabricError::invalid_argument(format!("malformed MAC {s:?}")));
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
