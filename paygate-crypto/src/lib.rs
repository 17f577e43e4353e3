//! Request signing, payload sealing, and entity hashing.
//!
//! Everything here is pure computation over byte strings; key *storage*
//! belongs to the merchant / platform records, and key *policy* (which
//! sign types a merchant may use) lives in
//! [`paygate_common::enums::EncryptionMode`].

/// Parameter-map canonicalization shared by signing and verification.
pub mod canonical;
/// XChaCha20-Poly1305 sealed payloads for the admin surface.
pub mod codec;
/// Blacklist entity hashing.
pub mod entity;
/// Signature computation and verification.
pub mod signer;

pub use canonical::canonicalize;
pub use codec::PayloadCodec;
pub use entity::entity_hash;
pub use signer::{
    MerchantVerifier, PlatformSigner, Signed, digest_sign, generate_rsa_keypair,
    load_rsa_private_key_b64, load_rsa_public_key_b64, rsa2_sign, verify,
};
