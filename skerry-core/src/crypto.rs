//! Cryptographic primitives for Skerry
//!
//! Provides:
//! - RSA-OAEP key wrapping and PKCS#1 v1.5 signatures (2048-bit keys)
//! - Streaming AES-256-CFB encryption as reader adapters
//! - Streaming SHA-256 and padded URL-safe base64 helpers
//! - Public-key fingerprinting for principal identities

use crate::error::{Error, Result};
use crate::STREAM_CHUNK;
use aes::Aes256;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::io::Read;

/// RSA modulus size for all principals
pub const RSA_KEY_BITS: usize = 2048;

/// AES-256 key size (32 bytes)
pub const AES_KEY_SIZE: usize = 32;

/// AES-CFB initialization vector size (16 bytes)
pub const AES_IV_SIZE: usize = 16;

/// Generate a fresh 2048-bit RSA keypair.
pub fn generate_keypair() -> Result<(RsaPrivateKey, RsaPublicKey)> {
    let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| Error::Crypto(format!("key generation failed: {e}")))?;
    let public = RsaPublicKey::from(&private);
    Ok((private, public))
}

/// Generate a fresh AES-256 key.
pub fn generate_aes_key() -> [u8; AES_KEY_SIZE] {
    let mut key = [0u8; AES_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generate a fresh AES-CFB initialization vector.
pub fn generate_aes_iv() -> [u8; AES_IV_SIZE] {
    let mut iv = [0u8; AES_IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Wrap a small secret (an AES key or IV) under a public key.
///
/// RSA-OAEP with SHA-256 for both the hash and the mask generation.
pub fn rsa_wrap(public: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| Error::Crypto(format!("OAEP encrypt failed: {e}")))
}

/// Unwrap a secret previously wrapped with [`rsa_wrap`].
pub fn rsa_unwrap(private: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    private
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| Error::Crypto(format!("OAEP decrypt failed: {e}")))
}

/// Sign a message with PKCS#1 v1.5 over its SHA-256 digest.
pub fn rsa_sign(private: &RsaPrivateKey, msg: &[u8]) -> Vec<u8> {
    let signing_key = SigningKey::<Sha256>::new(private.clone());
    signing_key.sign(msg).to_vec()
}

/// Verify a PKCS#1 v1.5 signature produced by [`rsa_sign`].
pub fn rsa_verify(public: &RsaPublicKey, msg: &[u8], sig: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::<Sha256>::new(public.clone());
    let sig = Signature::try_from(sig)
        .map_err(|e| Error::Auth(format!("malformed signature: {e}")))?;
    verifying_key
        .verify(msg, &sig)
        .map_err(|e| Error::Auth(format!("signature rejected: {e}")))
}

/// A principal's identity: the lowercase-hex SHA-256 of its PEM-encoded
/// public key.
pub fn fingerprint_key(public: &RsaPublicKey) -> Result<String> {
    let pem = public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Crypto(format!("cannot encode public key: {e}")))?;
    Ok(hex::encode(Sha256::digest(pem.as_bytes())))
}

/// Parse a PEM-encoded public key as stored in directory records.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| Error::Crypto(format!("invalid public key: {e}")))
}

/// SHA-256 over a byte stream without buffering it.
pub fn sha256_stream<R: Read>(reader: &mut R) -> std::io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Encode bytes as padded URL-safe base64, the encoding used for all
/// byte-valued metadata fields.
pub fn b64_encode(data: &[u8]) -> String {
    URL_SAFE.encode(data)
}

/// Decode padded URL-safe base64.
pub fn b64_decode(data: &str) -> Result<Vec<u8>> {
    URL_SAFE
        .decode(data)
        .map_err(|e| Error::Serialization(format!("invalid base64: {e}")))
}

/// Reader adapter that AES-256-CFB encrypts everything read through it.
pub struct CfbEncryptReader<R> {
    inner: R,
    cipher: BufEncryptor<Aes256>,
}

impl<R: Read> CfbEncryptReader<R> {
    pub fn new(key: &[u8], iv: &[u8], inner: R) -> Result<Self> {
        let cipher = BufEncryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| Error::Crypto(format!("invalid AES key or IV: {e}")))?;
        Ok(Self { inner, cipher })
    }
}

impl<R: Read> Read for CfbEncryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.encrypt(&mut buf[..n]);
        Ok(n)
    }
}

/// Reader adapter that AES-256-CFB decrypts everything read through it.
pub struct CfbDecryptReader<R> {
    inner: R,
    cipher: BufDecryptor<Aes256>,
}

impl<R: Read> CfbDecryptReader<R> {
    pub fn new(key: &[u8], iv: &[u8], inner: R) -> Result<Self> {
        let cipher = BufDecryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| Error::Crypto(format!("invalid AES key or IV: {e}")))?;
        Ok(Self { inner, cipher })
    }
}

impl<R: Read> Read for CfbDecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.decrypt(&mut buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_keypair() -> (RsaPrivateKey, RsaPublicKey) {
        // Key generation dominates test time; keep one pair per test.
        generate_keypair().unwrap()
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let (private, public) = test_keypair();
        let secret = generate_aes_key();

        let wrapped = rsa_wrap(&public, &secret).unwrap();
        assert_ne!(wrapped.as_slice(), secret.as_slice());

        let unwrapped = rsa_unwrap(&private, &wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), secret.as_slice());
    }

    #[test]
    fn test_unwrap_with_wrong_key_fails() {
        let (_, public) = test_keypair();
        let (other_private, _) = test_keypair();

        let wrapped = rsa_wrap(&public, b"secret").unwrap();
        assert!(rsa_unwrap(&other_private, &wrapped).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let (private, public) = test_keypair();
        let msg = b"challenge nonce";

        let sig = rsa_sign(&private, msg);
        rsa_verify(&public, msg, &sig).unwrap();

        // A tampered message must not verify.
        assert!(rsa_verify(&public, b"challenge nonce!", &sig).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let (_, public) = test_keypair();
        let fp1 = fingerprint_key(&public).unwrap();
        let fp2 = fingerprint_key(&public).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);
        assert!(fp1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_cfb_stream_roundtrip() {
        let key = generate_aes_key();
        let iv = generate_aes_iv();
        let plaintext: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();

        let mut enc = CfbEncryptReader::new(&key, &iv, Cursor::new(plaintext.clone())).unwrap();
        let mut ciphertext = Vec::new();
        enc.read_to_end(&mut ciphertext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_ne!(ciphertext, plaintext);

        let mut dec = CfbDecryptReader::new(&key, &iv, Cursor::new(ciphertext)).unwrap();
        let mut recovered = Vec::new();
        dec.read_to_end(&mut recovered).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_cfb_decrypt_is_chunking_independent() {
        let key = generate_aes_key();
        let iv = generate_aes_iv();
        let plaintext = vec![7u8; 4096];

        let mut enc = CfbEncryptReader::new(&key, &iv, Cursor::new(plaintext.clone())).unwrap();
        let mut ciphertext = Vec::new();
        enc.read_to_end(&mut ciphertext).unwrap();

        // Decrypt through reads of awkward sizes.
        let mut dec = CfbDecryptReader::new(&key, &iv, Cursor::new(ciphertext)).unwrap();
        let mut recovered = Vec::new();
        let mut buf = [0u8; 97];
        loop {
            let n = dec.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            recovered.extend_from_slice(&buf[..n]);
        }
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_sha256_stream_known_vector() {
        let mut reader = Cursor::new(b"abc".to_vec());
        let digest = sha256_stream(&mut reader).unwrap();
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_b64_roundtrip_keeps_padding() {
        let encoded = b64_encode(&[0xff, 0xfe, 0xfd]);
        assert_eq!(encoded, "__79");
        let encoded = b64_encode(&[0xff]);
        assert!(encoded.ends_with("=="));
        assert_eq!(b64_decode(&encoded).unwrap(), vec![0xff]);
    }
}
