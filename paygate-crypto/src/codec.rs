//! Sealed payloads for the admin surface.
//!
//! Wire format: Base64( 24-byte random nonce ‖ XChaCha20-Poly1305
//! ciphertext ). The key is the platform's configured 32-byte symmetric
//! key. Decode failures of any kind (bad Base64, short input, tag
//! mismatch) surface as `INVALID_REQUEST` without detail -- the admin
//! client is the only party who could have produced a valid payload.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use paygate_common::{Error, error::PayResult};
use rand::RngCore;

/// Nonce length of XChaCha20-Poly1305.
const NONCE_LEN: usize = 24;

/// Seals and opens admin payloads with the platform key.
#[derive(Clone)]
pub struct PayloadCodec {
    cipher: XChaCha20Poly1305,
}

impl PayloadCodec {
    pub fn new(key: &[u8; 32]) -> Self {
        Self { cipher: XChaCha20Poly1305::new(Key::from_slice(key)) }
    }

    /// Seal `plaintext`, returning Base64(nonce ‖ ciphertext).
    pub fn seal(
        &self,
        rng: &mut impl RngCore,
        plaintext: &[u8],
    ) -> PayResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| {
                Error::internal(anyhow::anyhow!("XChaCha20 encrypt failed"))
            })?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(B64.encode(out))
    }

    /// Open a Base64(nonce ‖ ciphertext) payload.
    pub fn open(&self, payload: &str) -> PayResult<Vec<u8>> {
        let raw = B64
            .decode(payload.trim())
            .map_err(|_| Error::invalid_request("payload is not Base64"))?;
        if raw.len() < NONCE_LEN {
            return Err(Error::invalid_request("payload too short"));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::invalid_request("payload decryption failed"))
    }
}

#[cfg(test)]
mod test {
    use paygate_common::ErrorKind;

    use super::*;

    fn codec() -> PayloadCodec {
        PayloadCodec::new(&[7u8; 32])
    }

    #[test]
    fn seal_open_roundtrip() {
        let codec = codec();
        let mut rng = rand::thread_rng();
        let msg = br#"{"action":"withdrawal_status","id":42}"#;
        let sealed = codec.seal(&mut rng, msg).unwrap();
        assert_eq!(codec.open(&sealed).unwrap(), msg);
    }

    #[test]
    fn nonces_differ_between_seals() {
        let codec = codec();
        let mut rng = rand::thread_rng();
        let a = codec.seal(&mut rng, b"x").unwrap();
        let b = codec.seal(&mut rng, b"x").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tamper_fails_closed() {
        let codec = codec();
        let mut rng = rand::thread_rng();
        let sealed = codec.seal(&mut rng, b"sensitive").unwrap();

        let mut raw = B64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let err = codec.open(&B64.encode(raw)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);

        // Wrong key fails the same way.
        let other = PayloadCodec::new(&[8u8; 32]);
        assert!(other.open(&sealed).is_err());

        assert!(codec.open("not base64 !!!").is_err());
        assert!(codec.open(&B64.encode(b"short")).is_err());
    }
}
