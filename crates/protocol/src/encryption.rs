//! Login handshake cryptography
//!
//! The handshake exchanges a 16-byte shared secret under the server's RSA
//! key, then both directions switch to AES-128-CFB8 with key = IV = secret.
//! CFB8 is a self-synchronizing stream mode with a one-byte block, applied to
//! the raw byte stream outside framing, so the cipher halves here work on
//! arbitrary-length slices in place.
//!
//! The server digest presented to the authentication service is SHA-1 over
//! `server_id || shared_secret || public_key_der`, hex-encoded as a signed
//! two's-complement big integer (a leading `-` when the high bit is set).

use aes::cipher::inout::InOutBuf;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use num_bigint::BigInt;
use rand::RngCore;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

use crate::error::{ProtocolError, Result};

type Aes128Cfb8Enc = cfb8::Encryptor<aes::Aes128>;
type Aes128Cfb8Dec = cfb8::Decryptor<aes::Aes128>;

/// Length of the shared secret / AES key in bytes.
pub const SECRET_LEN: usize = 16;
/// RSA modulus size used for the handshake keypair.
const RSA_BITS: usize = 1024;

/// Outbound half of the session stream cipher.
pub struct CipherEnc(Aes128Cfb8Enc);

impl CipherEnc {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.len() != SECRET_LEN {
            return Err(ProtocolError::InvalidSecretLength(secret.len()));
        }
        Aes128Cfb8Enc::new_from_slices(secret, secret)
            .map(CipherEnc)
            .map_err(|_| ProtocolError::InvalidSecretLength(secret.len()))
    }

    /// Encrypts `data` in place, advancing the stream state.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        let (blocks, rest) = InOutBuf::from(data).into_chunks();
        debug_assert!(rest.is_empty(), "cfb8 block size is one byte");
        self.0.encrypt_blocks_inout_mut(blocks);
    }
}

/// Inbound half of the session stream cipher.
pub struct CipherDec(Aes128Cfb8Dec);

impl CipherDec {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.len() != SECRET_LEN {
            return Err(ProtocolError::InvalidSecretLength(secret.len()));
        }
        Aes128Cfb8Dec::new_from_slices(secret, secret)
            .map(CipherDec)
            .map_err(|_| ProtocolError::InvalidSecretLength(secret.len()))
    }

    /// Decrypts `data` in place, advancing the stream state.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        let (blocks, rest) = InOutBuf::from(data).into_chunks();
        debug_assert!(rest.is_empty(), "cfb8 block size is one byte");
        self.0.decrypt_blocks_inout_mut(blocks);
    }
}

/// Builds the encrypt/decrypt cipher pair from a shared secret.
pub fn cipher_pair(secret: &[u8]) -> Result<(CipherEnc, CipherDec)> {
    Ok((CipherEnc::new(secret)?, CipherDec::new(secret)?))
}

/// The server's handshake RSA keypair, generated once at startup and shared
/// by every session.
pub struct ServerKeyPair {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl ServerKeyPair {
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
            .map_err(|e| ProtocolError::KeyGeneration(e.to_string()))?;
        let public_der = RsaPublicKey::from(&private)
            .to_public_key_der()
            .map_err(|e| ProtocolError::KeyGeneration(e.to_string()))?
            .into_vec();
        Ok(Self {
            private,
            public_der,
        })
    }

    /// X.509 SubjectPublicKeyInfo encoding of the public key, as sent in the
    /// encryption request.
    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    /// Decrypts a PKCS#1 v1.5 ciphertext from the client. Malformed
    /// ciphertext is a fatal handshake error, never retried.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| ProtocolError::KeyDecryptFailed)
    }
}

/// A fresh random verify token for one login challenge.
pub fn new_verify_token() -> [u8; 4] {
    let mut token = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut token);
    token
}

/// A random per-session server id string (the session nonce mixed into the
/// digest).
pub fn new_server_id() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

/// Computes the signed-hex SHA-1 digest presented to the authentication
/// service.
pub fn server_digest(server_id: &str, secret: &[u8], public_key_der: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_id.as_bytes());
    hasher.update(secret);
    hasher.update(public_key_der);
    let digest = hasher.finalize();
    BigInt::from_signed_bytes_be(&digest).to_str_radix(16)
}
