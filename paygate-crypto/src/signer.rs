//! Signature computation and verification over canonicalized parameter
//! maps.
//!
//! Three keyed-digest schemes (`xxh`, `sha3`, `sm3`) hash
//! `canonical ‖ hash_key` and render lowercase hex; `rsa2` is
//! SHA256-with-RSA (PKCS#1 v1.5) over the canonical string, Base64. RSA
//! keys are stored as headerless Base64 DER and reconstituted here.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use paygate_common::{
    Error,
    enums::{EncryptionMode, SignType},
    error::PayResult,
};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    pkcs8::{
        DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey,
    },
    signature::{SignatureEncoding, Signer as _, Verifier as _},
};
use serde_json::{Map, Value};
use sha2::Sha256;
use sha3::{Digest, Sha3_256};
use sm3::Sm3;
use twox_hash::XxHash3_128;

use crate::canonical::canonicalize;

/// A computed signature plus the canonical string it covers. The canonical
/// string is returned so callers can log exactly what was signed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Signed {
    pub canonical: String,
    pub signature: String,
}

/// Sign a parameter map with one of the keyed-digest schemes.
/// `hash_key` is the merchant's 32-byte shared key.
pub fn digest_sign(
    params: &Map<String, Value>,
    sign_type: SignType,
    hash_key: &[u8],
) -> PayResult<Signed> {
    let canonical = canonicalize(params);
    let signature = digest_hex(&canonical, sign_type, hash_key)?;
    Ok(Signed { canonical, signature })
}

fn digest_hex(
    canonical: &str,
    sign_type: SignType,
    hash_key: &[u8],
) -> PayResult<String> {
    let mut message = Vec::with_capacity(canonical.len() + hash_key.len());
    message.extend_from_slice(canonical.as_bytes());
    message.extend_from_slice(hash_key);

    let hex = match sign_type {
        SignType::Xxh => {
            let digest = XxHash3_128::oneshot(&message);
            format!("{digest:032x}")
        }
        SignType::Sha3 => hex::encode(Sha3_256::digest(&message)),
        SignType::Sm3 => hex::encode(Sm3::digest(&message)),
        SignType::Rsa2 =>
            return Err(Error::invalid_request(
                "rsa2 requires an RSA key, not a hash key",
            )),
    };
    Ok(hex)
}

/// Sign a parameter map with SHA256-with-RSA (PKCS#1 v1.5), Base64 output.
pub fn rsa2_sign(
    params: &Map<String, Value>,
    key: &RsaPrivateKey,
) -> Signed {
    let canonical = canonicalize(params);
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    let signature = signing_key.sign(canonical.as_bytes());
    Signed {
        signature: B64.encode(signature.to_bytes()),
        canonical,
    }
}

/// Per-merchant verification material: the configured mode, the shared
/// hash key, and the stored RSA public key if one has been uploaded.
#[derive(Clone)]
pub struct MerchantVerifier {
    pub mode: EncryptionMode,
    pub hash_key: Vec<u8>,
    pub rsa_public: Option<RsaPublicKey>,
}

/// Verify `sign` over `params`, returning the canonical string on success.
///
/// Fails `UNAUTHORIZED` when the merchant's mode disallows the claimed
/// sign type, the signature mismatches, or (for `rsa2`) no public key is
/// on file.
pub fn verify(
    params: &Map<String, Value>,
    sign: &str,
    sign_type: SignType,
    verifier: &MerchantVerifier,
) -> PayResult<String> {
    if !verifier.mode.allows(sign_type) {
        return Err(Error::unauthorized(format!(
            "sign type {sign_type} not allowed by merchant encryption mode",
        )));
    }

    let canonical = canonicalize(params);
    match sign_type {
        SignType::Xxh | SignType::Sha3 | SignType::Sm3 => {
            let expected =
                digest_hex(&canonical, sign_type, &verifier.hash_key)?;
            if !expected.eq_ignore_ascii_case(sign) {
                return Err(Error::unauthorized("signature mismatch"));
            }
        }
        SignType::Rsa2 => {
            let public = verifier.rsa_public.as_ref().ok_or_else(|| {
                Error::unauthorized("merchant has no RSA public key on file")
            })?;
            let raw = B64
                .decode(sign)
                .map_err(|_| Error::unauthorized("signature is not Base64"))?;
            let signature = Signature::try_from(raw.as_slice())
                .map_err(|_| Error::unauthorized("malformed RSA signature"))?;
            VerifyingKey::<Sha256>::new(public.clone())
                .verify(canonical.as_bytes(), &signature)
                .map_err(|_| Error::unauthorized("signature mismatch"))?;
        }
    }
    Ok(canonical)
}

// --- Platform signing --- //

/// The platform's own RSA identity, used to sign outgoing merchant
/// notifications and synchronous return URLs.
#[derive(Clone)]
pub struct PlatformSigner {
    key: RsaPrivateKey,
}

impl PlatformSigner {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Load from headerless Base64 DER, as stored in the environment.
    pub fn from_b64_der(b64: &str) -> anyhow::Result<Self> {
        Ok(Self { key: load_rsa_private_key_b64(b64)? })
    }

    pub fn sign(&self, params: &Map<String, Value>) -> Signed {
        rsa2_sign(params, &self.key)
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }
}

// --- Key codecs --- //

/// Decode an RSA private key from headerless Base64 PKCS#8 DER.
pub fn load_rsa_private_key_b64(b64: &str) -> anyhow::Result<RsaPrivateKey> {
    // Tolerate whitespace/newlines from sloppy env quoting.
    let compact: String = b64.split_whitespace().collect();
    let der = B64.decode(compact.as_bytes())?;
    Ok(RsaPrivateKey::from_pkcs8_der(&der)?)
}

/// Decode an RSA public key from headerless Base64 SPKI DER, i.e. the body
/// of a `-----BEGIN PUBLIC KEY-----` block.
pub fn load_rsa_public_key_b64(b64: &str) -> anyhow::Result<RsaPublicKey> {
    let compact: String = b64.split_whitespace().collect();
    let der = B64.decode(compact.as_bytes())?;
    Ok(RsaPublicKey::from_public_key_der(&der)?)
}

/// Generate a fresh RSA keypair, returning `(private_b64, public_b64)` as
/// headerless Base64 DER. The private half is returned to the caller once
/// and never stored.
pub fn generate_rsa_keypair(
    rng: &mut (impl rand::CryptoRng + rand::RngCore),
    bits: usize,
) -> anyhow::Result<(String, String)> {
    let private = RsaPrivateKey::new(rng, bits)?;
    let public = private.to_public_key();
    let private_der = private.to_pkcs8_der()?;
    let public_der = public.to_public_key_der()?;
    Ok((
        B64.encode(private_der.as_bytes()),
        B64.encode(public_der.as_bytes()),
    ))
}
