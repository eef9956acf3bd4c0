use std::{fmt, str::FromStr};

/// A link-layer (Ethernet) address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr([u8; 6]);

#[derive(Clone, Debug, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct InvalidMacAddr(String);

// === impl MacAddr ===

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = InvalidMacAddr;

    /// Parses six hex octets separated by either `:` or `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidMacAddr(s.to_string());
        let sep = if s.contains('-') { '-' } else { ':' };

        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(sep);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}
