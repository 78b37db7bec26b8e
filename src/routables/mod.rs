// Routable addresses: keys, ranges and routes.
//
// Everything a transaction can touch is addressed either by individual keys
// or by contiguous ranges of the routing space. Containers here are sorted,
// deduplicated and support the set algebra (union, without, slice,
// intersect) the rest of the protocol is built on.

mod keys;
mod ranges;
mod route;

pub use keys::{Keys, RoutingKeys};
pub use ranges::{KeyRange, Ranges};
pub use route::{Route, RouteParts};

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A user key: an opaque byte string with total order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub Bytes);

impl Key {
    pub fn from_slice(bytes: &[u8]) -> Self {
        Key(Bytes::copy_from_slice(bytes))
    }

    /// The shard-routing projection of this key. Routing is by the full byte
    /// string; embeddings with composite keys substitute a prefix here.
    pub fn routing(&self) -> RoutingKey {
        RoutingKey(self.0.clone())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_truncated_hex(&self.0, f)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// Position of a key in the routing space. Shards own half-open intervals of
/// routing keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoutingKey(pub Bytes);

impl RoutingKey {
    pub fn from_slice(bytes: &[u8]) -> Self {
        RoutingKey(Bytes::copy_from_slice(bytes))
    }

    /// The exclusive upper bound immediately above this key: the shortest
    /// routing key strictly greater than every key equal to it.
    pub fn successor(&self) -> RoutingKey {
        let mut v = self.0.to_vec();
        v.push(0);
        RoutingKey(Bytes::from(v))
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_truncated_hex(&self.0, f)
    }
}

impl From<&str> for RoutingKey {
    fn from(s: &str) -> Self {
        RoutingKey(Bytes::copy_from_slice(s.as_bytes()))
    }
}

fn write_truncated_hex(bytes: &Bytes, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in bytes.iter().take(8) {
        write!(f, "{:02x}", b)?;
    }
    if bytes.len() > 8 {
        write!(f, "..")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_order_is_byte_order() {
        let a = Key::from("a");
        let b = Key::from("b");
        let ab = Key::from("ab");
        assert!(a < ab);
        assert!(ab < b);
    }

    #[test]
    fn test_successor_is_strictly_greater_and_tight() {
        let k = RoutingKey::from("abc");
        let s = k.successor();
        assert!(s > k);
        // Nothing fits strictly between a key and its successor.
        assert!(s <= RoutingKey::from_slice(b"abc\x00"));
    }

    #[test]
    fn test_routing_projection_preserves_order() {
        let a = Key::from("aa");
        let b = Key::from("ab");
        assert!(a.routing() < b.routing());
    }
}
