//! Per-node port bitmap: 256 bits, one per application port.
//!
//! Port 0 is the internal control protocol; a set bit 0 doubles as the
//! "we have port data for this node" marker, since every live node always
//! listens on port 0.

use serde::{Deserialize, Serialize};

/// Number of bytes backing the 256-bit bitmap.
pub const PORT_BITS_SIZE: usize = 32;

/// Fixed-size bitmap of open ports on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    #[serde(with = "serde_bytes_array")]
    bits: [u8; PORT_BITS_SIZE],
}

impl PortMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bits: [0; PORT_BITS_SIZE],
        }
    }

    pub fn set(&mut self, port: u8) {
        self.bits[usize::from(port) / 8] |= 1 << (port % 8);
    }

    pub fn clear(&mut self, port: u8) {
        self.bits[usize::from(port) / 8] &= !(1 << (port % 8));
    }

    #[must_use]
    pub fn get(&self, port: u8) -> bool {
        self.bits[usize::from(port) / 8] & (1 << (port % 8)) != 0
    }

    /// True if no port data has been seen for this node yet. Bit 0 is set by
    /// every node at join time, so an all-clear bit 0 means "never heard".
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        !self.get(0)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PORT_BITS_SIZE] {
        &self.bits
    }

    /// Replaces the whole bitmap, as done when applying a PORTSTATUS reply.
    pub fn load(&mut self, bytes: &[u8; PORT_BITS_SIZE]) {
        self.bits = *bytes;
    }

    pub fn clear_all(&mut self) {
        self.bits = [0; PORT_BITS_SIZE];
    }
}

impl Default for PortMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Serde support for the fixed byte array (serde's built-in arrays stop at
/// 32 elements but the derive still needs an explicit codec for clarity).
mod serde_bytes_array {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::PORT_BITS_SIZE;

    pub fn serialize<S: Serializer>(
        bytes: &[u8; PORT_BITS_SIZE],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; PORT_BITS_SIZE], D::Error> {
        let v: Vec<u8> = Vec::deserialize(deserializer)?;
        v.try_into()
            .map_err(|_| D::Error::custom("port bitmap must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let map = PortMap::new();
        for port in 0..=255u8 {
            assert!(!map.get(port));
        }
        assert!(map.is_unknown());
    }

    #[test]
    fn set_get_clear() {
        let mut map = PortMap::new();
        map.set(11);
        assert!(map.get(11));
        assert!(!map.get(12));

        map.clear(11);
        assert!(!map.get(11));
    }

    #[test]
    fn boundary_ports() {
        let mut map = PortMap::new();
        for port in [0u8, 1, 7, 8, 127, 128, 254, 255] {
            map.set(port);
            assert!(map.get(port));
        }
        // Neighbours in the same byte must be untouched.
        assert!(!map.get(2));
        assert!(!map.get(126));
    }

    #[test]
    fn known_once_port0_set() {
        let mut map = PortMap::new();
        map.set(0);
        assert!(!map.is_unknown());
    }

    #[test]
    fn load_replaces_contents() {
        let mut a = PortMap::new();
        a.set(0);
        a.set(42);

        let mut b = PortMap::new();
        b.load(a.as_bytes());
        assert!(b.get(0));
        assert!(b.get(42));
        assert!(!b.get(43));
    }

    #[test]
    fn bit_layout_matches_wire_format() {
        // Port p lives in byte p/8 at bit p%8; PORTSTATUS consumers on
        // other nodes rely on this exact packing.
        let mut map = PortMap::new();
        map.set(11);
        assert_eq!(map.as_bytes()[1], 1 << 3);
    }
}
