//! Blacklist entity hashing.
//!
//! Blacklist rows are looked up by `SHA3-224(type ‖ value)` so raw
//! identifiers (card numbers, id numbers, device fingerprints) never
//! appear in an index.

use paygate_common::enums::BlacklistEntityType;
use sha3::{Digest, Sha3_224};

/// `hex(SHA3-224(type ‖ value))`; the unique lookup key of a blacklist
/// entry.
pub fn entity_hash(entity_type: BlacklistEntityType, value: &str) -> String {
    let mut hasher = Sha3_224::new();
    hasher.update(entity_type.as_ref().as_bytes());
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deterministic_and_type_scoped() {
        let a = entity_hash(BlacklistEntityType::IpAddress, "203.0.113.9");
        let b = entity_hash(BlacklistEntityType::IpAddress, "203.0.113.9");
        assert_eq!(a, b);
        assert_eq!(a.len(), 56); // 224 bits in hex

        // Same value under a different type is a different entity.
        let c = entity_hash(BlacklistEntityType::Mobile, "203.0.113.9");
        assert_ne!(a, c);
    }
}
