// Capability interfaces the descriptor codec depends on, decoupling it from
// any concrete cryptographic library. The reference implementation names
// specific primitives (SHA-256, RSA-4096, AES-256-GCM); those are wired in
// below as the default bindings, but nothing above this module names them.

use rsa::{
    pss::{Signature, SigningKey, VerifyingKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier as _},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest as _, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("signing failed: {0}")]
    SignError(String),

    #[error("signature verification failed")]
    VerifyFailed,

    #[error("authenticated decryption failed (MAC mismatch or corrupt ciphertext)")]
    AeadOpenFailed,

    #[error("encryption failed: {0}")]
    AeadSealFailed(String),

    #[error("key error: {0}")]
    KeyError(String),
}

pub trait Digest: Send + Sync {
    // Output width in bytes of this digest.
    fn output_len(&self) -> usize;
    fn digest(&self, data: &[u8]) -> Vec<u8>;
}

pub trait Signer: Send + Sync {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub trait Verifier: Send + Sync {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError>;
}

// Hybrid-encryption primitives: an authenticated symmetric cipher for the
// body, plus asymmetric key-wrapping for the symmetric key.
pub trait Aead: Send + Sync {
    fn nonce_len(&self) -> usize;
    fn seal(&self, key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn open(&self, key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub trait KeyWrap: Send + Sync {
    fn wrap(&self, key: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

// --- default bindings -------------------------------------------------

pub struct Sha256Digest;

impl Digest for Sha256Digest {
    fn output_len(&self) -> usize { 32 }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }
}

pub struct RsaPssSigner {
    key: SigningKey<Sha256>,
}

impl RsaPssSigner {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self { key: SigningKey::<Sha256>::new(private_key) }
    }
}

impl Signer for RsaPssSigner {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut rng = rand::rngs::OsRng;
        let signature = self.key.sign_with_rng(&mut rng, data);
        Ok(signature.to_vec())
    }
}

pub struct RsaPssVerifier {
    key: VerifyingKey<Sha256>,
}

impl RsaPssVerifier {
    pub fn new(public_key: RsaPublicKey) -> Self {
        Self { key: VerifyingKey::<Sha256>::new(public_key) }
    }
}

impl Verifier for RsaPssVerifier {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let signature = Signature::try_from(signature)
            .map_err(|e| CryptoError::SignError(e.to_string()))?;
        self.key.verify(data, &signature).map_err(|_| CryptoError::VerifyFailed)
    }
}

pub struct Aes256GcmAead;

impl Aead for Aes256GcmAead {
    fn nonce_len(&self) -> usize { 12 }

    fn seal(&self, key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        use aes_gcm::{aead::Aead as _, Aes256Gcm, KeyInit, Nonce};
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::KeyError(e.to_string()))?;
        let nonce = Nonce::from_slice(nonce);
        cipher.encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::AeadSealFailed(e.to_string()))
    }

    fn open(&self, key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        use aes_gcm::{aead::Aead as _, Aes256Gcm, KeyInit, Nonce};
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::KeyError(e.to_string()))?;
        let nonce = Nonce::from_slice(nonce);
        cipher.decrypt(nonce, ciphertext).map_err(|_| CryptoError::AeadOpenFailed)
    }
}

pub struct RsaOaepKeyWrap {
    public_key: RsaPublicKey,
    private_key: Option<RsaPrivateKey>,
}

impl RsaOaepKeyWrap {
    pub fn new_encrypt_only(public_key: RsaPublicKey) -> Self {
        Self { public_key, private_key: None }
    }

    pub fn new(public_key: RsaPublicKey, private_key: RsaPrivateKey) -> Self {
        Self { public_key, private_key: Some(private_key) }
    }
}

impl KeyWrap for RsaOaepKeyWrap {
    fn wrap(&self, key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut rng = rand::rngs::OsRng;
        let padding = Oaep::new::<Sha256>();
        self.public_key.encrypt(&mut rng, padding, key)
            .map_err(|e| CryptoError::AeadSealFailed(e.to_string()))
    }

    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let private_key = self.private_key.as_ref()
            .ok_or_else(|| CryptoError::KeyError("no private key configured for unwrap".to_string()))?;
        let padding = Oaep::new::<Sha256>();
        private_key.decrypt(padding, wrapped)
            .map_err(|_| CryptoError::AeadOpenFailed)
    }
}

// Generates a fresh random AES-256 key (32 bytes) and a random 96-bit nonce,
// as used once per descriptor save.
pub fn generate_symmetric_key_and_nonce() -> ([u8; 32], [u8; 12]) {
    use rand::RngCore;
    let mut rng = rand::rngs::OsRng;
    let mut key = [0u8; 32];
    let mut nonce = [0u8; 12];
    rng.fill_bytes(&mut key);
    rng.fill_bytes(&mut nonce);
    (key, nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_digest_has_expected_width() {
        let d = Sha256Digest.digest(b"hello");
        assert_eq!(d.len(), 32);
    }

    #[test]
    fn aes_gcm_round_trips() {
        let aead = Aes256GcmAead;
        let (key, nonce) = generate_symmetric_key_and_nonce();
        let ciphertext = aead.seal(&key, &nonce, b"secret descriptor body").unwrap();
        let plaintext = aead.open(&key, &nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"secret descriptor body");
    }

    #[test]
    fn aes_gcm_rejects_tampered_ciphertext() {
        let aead = Aes256GcmAead;
        let (key, nonce) = generate_symmetric_key_and_nonce();
        let mut ciphertext = aead.seal(&key, &nonce, b"payload").unwrap();
        *ciphertext.last_mut().unwrap() ^= 0xff;
        assert!(aead.open(&key, &nonce, &ciphertext).is_err());
    }
}
