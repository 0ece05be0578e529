//! RSA key material
//!
//! Key generation plus RSA-SHA256 (PKCS#1 v1.5) signing and verification over
//! raw bytes. Nothing here performs I/O.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

/// Default modulus size for actor keys
pub const DEFAULT_KEY_BITS: usize = 2048;

/// A freshly generated PEM-encoded key pair
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// SPKI PEM (`BEGIN PUBLIC KEY`)
    pub public_key_pem: String,
    /// PKCS#8 PEM (`BEGIN PRIVATE KEY`)
    pub private_key_pem: String,
}

/// Generates key pairs and signs/verifies byte strings.
#[derive(Debug, Clone, Copy)]
pub struct KeyStore {
    bits: usize,
}

impl KeyStore {
    pub fn new(bits: usize) -> Self {
        Self { bits }
    }

    /// Generate a new RSA key pair
    ///
    /// Generation is CPU-bound; async callers should move it off the runtime
    /// with `spawn_blocking`.
    pub fn generate_key_pair(&self) -> Result<KeyPair, AppError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, self.bits)
            .map_err(|e| AppError::Crypto(format!("Key generation failed: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Crypto(format!("Failed to encode private key: {}", e)))?
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Crypto(format!("Failed to encode public key: {}", e)))?;

        Ok(KeyPair {
            public_key_pem,
            private_key_pem,
        })
    }

    /// Sign `data` with RSA-SHA256
    ///
    /// # Returns
    /// Base64-encoded signature
    ///
    /// # Errors
    /// `Crypto` if the private key PEM is malformed
    pub fn sign(&self, data: &[u8], private_key_pem: &str) -> Result<String, AppError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| AppError::Crypto(format!("Invalid private key: {}", e)))?;

        // Unprefixed matches what Mastodon-compatible peers verify against.
        let signing_key = SigningKey::<Sha256>::new_unprefixed(private_key);
        let mut rng = rand::thread_rng();
        let signature = signing_key.sign_with_rng(&mut rng, data);
        Ok(BASE64.encode(signature.to_bytes()))
    }

    /// Verify a base64 signature over `data`
    ///
    /// # Returns
    /// `Ok(false)` when the signature simply does not match.
    ///
    /// # Errors
    /// `Crypto` if the public key PEM or the signature encoding is malformed
    pub fn verify(
        &self,
        data: &[u8],
        signature_b64: &str,
        public_key_pem: &str,
    ) -> Result<bool, AppError> {
        let public_key = parse_public_key(public_key_pem)?;

        let signature_bytes = BASE64
            .decode(signature_b64.trim())
            .map_err(|e| AppError::Crypto(format!("Invalid signature encoding: {}", e)))?;
        let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
            .map_err(|e| AppError::Crypto(format!("Invalid signature format: {}", e)))?;

        let verifier = VerifyingKey::<Sha256>::new_unprefixed(public_key);
        Ok(verifier.verify(data, &signature).is_ok())
    }
}

/// Parse an SPKI public key, falling back to PKCS#1 (`BEGIN RSA PUBLIC KEY`)
/// which some peers still publish.
fn parse_public_key(pem: &str) -> Result<RsaPublicKey, AppError> {
    use rsa::pkcs1::DecodeRsaPublicKey;

    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::Crypto(format!("Invalid public key: {}", e)))
}
