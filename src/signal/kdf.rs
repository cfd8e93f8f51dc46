//! Chain and message key derivation shared by the pairwise and
//! sender-key layers: HMAC-SHA256 chain stepping, HKDF-SHA256 message
//! material, AES-256-GCM payload encryption.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SignalError;

const CHAIN_MESSAGE_SEED: &[u8] = &[0x01];
const CHAIN_STEP_SEED: &[u8] = &[0x02];

/// One symmetric chain: the current key and how many messages were
/// derived from it.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Chain {
    pub key: [u8; 32],
    pub index: u32,
}

impl Chain {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    /// Message key material at the current index, advancing the chain.
    pub fn step(&mut self) -> [u8; 32] {
        let material = hmac_sha256(&self.key, CHAIN_MESSAGE_SEED);
        self.key = hmac_sha256(&self.key, CHAIN_STEP_SEED);
        self.index += 1;
        material
    }
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Expand message-key material into an AES-256 key and GCM nonce.
fn message_keys(material: &[u8; 32], info: &[u8]) -> ([u8; 32], [u8; 12]) {
    let hk = Hkdf::<Sha256>::new(None, material);
    let mut okm = [0u8; 44];
    hk.expand(info, &mut okm).expect("44 bytes is a valid hkdf length");
    let mut key = [0u8; 32];
    let mut nonce = [0u8; 12];
    key.copy_from_slice(&okm[..32]);
    nonce.copy_from_slice(&okm[32..]);
    (key, nonce)
}

pub fn encrypt(
    material: &[u8; 32],
    info: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Vec<u8> {
    let (key, nonce) = message_keys(material, info);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .expect("aes-gcm encryption is infallible for in-memory buffers")
}

pub fn decrypt(
    material: &[u8; 32],
    info: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SignalError> {
    let (key, nonce) = message_keys(material, info);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| SignalError::BadMac)
}

/// Derive the root key and the two chain keys from the handshake DH
/// outputs. Both sides compute the same 96 bytes; the initiator sends on
/// the first chain, the responder on the second.
pub fn derive_session_keys(dh1: &[u8; 32], dh2: Option<&[u8; 32]>) -> ([u8; 32], [u8; 32], [u8; 32]) {
    let mut ikm = Vec::with_capacity(32 * 3);
    ikm.extend_from_slice(&[0xFF; 32]);
    ikm.extend_from_slice(dh1);
    if let Some(dh2) = dh2 {
        ikm.extend_from_slice(dh2);
    }
    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), &ikm);
    let mut okm = [0u8; 96];
    hk.expand(b"WhatsAppPairwiseSetup", &mut okm)
        .expect("96 bytes is a valid hkdf length");
    let mut root = [0u8; 32];
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    a.copy_from_slice(&okm[32..64]);
    b.copy_from_slice(&okm[64..]);
    (root, a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_step_advances_key_and_index() {
        let mut chain = Chain::new([7u8; 32]);
        let k0 = chain.key;
        let m1 = chain.step();
        assert_ne!(chain.key, k0);
        assert_eq!(chain.index, 1);
        let m2 = chain.step();
        assert_ne!(m1, m2);
        assert_eq!(chain.index, 2);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let material = [3u8; 32];
        let ct = encrypt(&material, b"test", b"payload", b"aad");
        assert_eq!(
            decrypt(&material, b"test", &ct, b"aad").unwrap(),
            b"payload"
        );
    }

    #[test]
    fn decrypt_rejects_wrong_aad() {
        let material = [3u8; 32];
        let ct = encrypt(&material, b"test", b"payload", b"aad");
        assert!(decrypt(&material, b"test", &ct, b"other").is_err());
    }

    #[test]
    fn session_keys_are_deterministic() {
        let a = derive_session_keys(&[1; 32], Some(&[2; 32]));
        let b = derive_session_keys(&[1; 32], Some(&[2; 32]));
        assert_eq!(a, b);
        let c = derive_session_keys(&[1; 32], None);
        assert_ne!(a.0, c.0);
    }
}
