//! Group sender-key sessions.
//!
//! Each sender in a group owns one chain; recipients bootstrap their
//! copy from a sender-key-distribution message and verify every group
//! message against the sender's Ed25519 chain signing key.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::kdf::{self, Chain};
use super::ratchet::MAX_SKIP;
use crate::error::SignalError;
use crate::proto::{SenderKeyDistributionMessage, SenderKeyMessage};

const SENDER_INFO: &[u8] = b"WhatsAppSenderKeys";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    pub key_id: u32,
    pub chain: Chain,
    pub signing_public: [u8; 32],
    /// Only present on our own records; recipients verify only.
    pub signing_private: Option<[u8; 32]>,
    pub skipped: HashMap<u32, [u8; 32]>,
}

impl SenderKeyRecord {
    /// Fresh chain for our own sending role in a group.
    pub fn create() -> Self {
        let mut chain_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut chain_key);
        let signing = SigningKey::generate(&mut rand::thread_rng());
        Self {
            key_id: rand::thread_rng().next_u32() >> 1,
            chain: Chain::new(chain_key),
            signing_public: signing.verifying_key().to_bytes(),
            signing_private: Some(signing.to_bytes()),
            skipped: HashMap::new(),
        }
    }

    /// The distribution message recipients need to follow this chain.
    pub fn to_distribution(&self) -> SenderKeyDistributionMessage {
        SenderKeyDistributionMessage {
            key_id: self.key_id,
            iteration: self.chain.index,
            chain_key: self.chain.key.to_vec(),
            signing_key: self.signing_public.to_vec(),
        }
    }

    /// Recipient-side record from a distribution message.
    pub fn from_distribution(skdm: &SenderKeyDistributionMessage) -> Result<Self, SignalError> {
        let chain_key: [u8; 32] = skdm
            .chain_key
            .as_slice()
            .try_into()
            .map_err(|_| SignalError::InvalidBundle("sender chain key must be 32 bytes".into()))?;
        let signing_public: [u8; 32] = skdm
            .signing_key
            .as_slice()
            .try_into()
            .map_err(|_| SignalError::InvalidBundle("sender signing key must be 32 bytes".into()))?;
        Ok(Self {
            key_id: skdm.key_id,
            chain: Chain {
                key: chain_key,
                index: skdm.iteration,
            },
            signing_public,
            signing_private: None,
            skipped: HashMap::new(),
        })
    }

    fn signature_body(key_id: u32, iteration: u32, ciphertext: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + ciphertext.len());
        body.extend_from_slice(&key_id.to_be_bytes());
        body.extend_from_slice(&iteration.to_be_bytes());
        body.extend_from_slice(ciphertext);
        body
    }

    /// Encrypt the next group message on our own chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SenderKeyMessage, SignalError> {
        let private = self
            .signing_private
            .ok_or_else(|| SignalError::NoSenderKey("record has no signing key".into()))?;
        let iteration = self.chain.index;
        let material = self.chain.step();
        let ciphertext = kdf::encrypt(&material, SENDER_INFO, plaintext, &iteration.to_be_bytes());
        let signing = SigningKey::from_bytes(&private);
        let signature = signing
            .sign(&Self::signature_body(self.key_id, iteration, &ciphertext))
            .to_bytes()
            .to_vec();
        Ok(SenderKeyMessage {
            key_id: self.key_id,
            iteration,
            ciphertext,
            signature,
        })
    }

    /// Decrypt a group message on the sender's chain, tolerating skips.
    pub fn decrypt(&mut self, msg: &SenderKeyMessage) -> Result<Vec<u8>, SignalError> {
        if msg.key_id != self.key_id {
            return Err(SignalError::NoSenderKey(format!(
                "message for chain {} but record holds {}",
                msg.key_id, self.key_id
            )));
        }
        let verifying = VerifyingKey::from_bytes(&self.signing_public)
            .map_err(|_| SignalError::InvalidBundle("bad sender signing key".into()))?;
        let sig_bytes: [u8; 64] = msg
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| SignalError::BadMac)?;
        verifying
            .verify(
                &Self::signature_body(msg.key_id, msg.iteration, &msg.ciphertext),
                &ed25519_dalek::Signature::from_bytes(&sig_bytes),
            )
            .map_err(|_| SignalError::BadMac)?;

        let aad = msg.iteration.to_be_bytes();
        if msg.iteration < self.chain.index {
            let material = self
                .skipped
                .remove(&msg.iteration)
                .ok_or(SignalError::DuplicateCounter(msg.iteration))?;
            return kdf::decrypt(&material, SENDER_INFO, &msg.ciphertext, &aad);
        }
        if msg.iteration - self.chain.index > MAX_SKIP {
            return Err(SignalError::CounterTooFar(msg.iteration));
        }
        while self.chain.index < msg.iteration {
            let idx = self.chain.index;
            let material = self.chain.step();
            self.skipped.insert(idx, material);
        }
        let material = self.chain.step();
        kdf::decrypt(&material, SENDER_INFO, &msg.ciphertext, &aad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_roundtrip_decrypts() {
        let mut sender = SenderKeyRecord::create();
        let mut recipient = SenderKeyRecord::from_distribution(&sender.to_distribution()).unwrap();
        let msg = sender.encrypt(b"to the group").unwrap();
        assert_eq!(recipient.decrypt(&msg).unwrap(), b"to the group");
    }

    #[test]
    fn late_joiner_skips_old_iterations() {
        let mut sender = SenderKeyRecord::create();
        sender.encrypt(b"one").unwrap();
        sender.encrypt(b"two").unwrap();
        // distribution taken after two messages: recipient starts at iteration 2
        let mut recipient = SenderKeyRecord::from_distribution(&sender.to_distribution()).unwrap();
        let msg = sender.encrypt(b"three").unwrap();
        assert_eq!(msg.iteration, 2);
        assert_eq!(recipient.decrypt(&msg).unwrap(), b"three");
    }

    #[test]
    fn out_of_order_group_messages() {
        let mut sender = SenderKeyRecord::create();
        let mut recipient = SenderKeyRecord::from_distribution(&sender.to_distribution()).unwrap();
        let m0 = sender.encrypt(b"zero").unwrap();
        let m1 = sender.encrypt(b"one").unwrap();
        assert_eq!(recipient.decrypt(&m1).unwrap(), b"one");
        assert_eq!(recipient.decrypt(&m0).unwrap(), b"zero");
    }

    #[test]
    fn forged_signature_is_rejected() {
        let mut sender = SenderKeyRecord::create();
        let mut recipient = SenderKeyRecord::from_distribution(&sender.to_distribution()).unwrap();
        let mut msg = sender.encrypt(b"real").unwrap();
        msg.signature[0] ^= 1;
        assert!(matches!(recipient.decrypt(&msg), Err(SignalError::BadMac)));
    }

    #[test]
    fn recipient_record_cannot_encrypt() {
        let sender = SenderKeyRecord::create();
        let mut recipient = SenderKeyRecord::from_distribution(&sender.to_distribution()).unwrap();
        assert!(recipient.encrypt(b"nope").is_err());
    }

    #[test]
    fn wrong_chain_id_is_rejected() {
        let mut sender = SenderKeyRecord::create();
        let mut other = SenderKeyRecord::create();
        let msg = sender.encrypt(b"x").unwrap();
        assert!(matches!(
            other.decrypt(&msg),
            Err(SignalError::NoSenderKey(_))
        ));
    }

    #[test]
    fn record_serde_roundtrip() {
        let mut sender = SenderKeyRecord::create();
        sender.encrypt(b"advance").unwrap();
        let json = serde_json::to_vec(&sender).unwrap();
        let back: SenderKeyRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.key_id, sender.key_id);
        assert_eq!(back.chain, sender.chain);
        assert!(back.signing_private.is_some());
    }
}
