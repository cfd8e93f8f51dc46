//! Pairwise session records.
//!
//! A session is bootstrapped from the recipient's prekey bundle
//! (initiator) or from the bundle material echoed in the first inbound
//! prekey message (responder). After setup both sides hold mirrored
//! send/receive chains; message keys are derived per counter with
//! out-of-order tolerance up to `MAX_SKIP`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::kdf::{self, Chain};
use crate::error::SignalError;
use crate::store::KeyPair;

/// Window of message keys kept for out-of-order delivery.
pub const MAX_SKIP: u32 = 2000;

const MESSAGE_INFO: &[u8] = b"WhatsAppMessageKeys";

/// Bootstrap material repeated in outgoing prekey messages until the
/// peer's first reply confirms the session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub pre_key_id: Option<u32>,
    pub signed_pre_key_id: u32,
    pub base_key: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub root_key: [u8; 32],
    pub send_chain: Chain,
    pub recv_chain: Chain,
    pub remote_identity: [u8; 32],
    pub remote_registration_id: u32,
    /// Present while the session is unacknowledged; its presence makes
    /// outgoing traffic `pkmsg`.
    pub pending_pre_key: Option<PendingPreKey>,
    /// Message keys skipped over for out-of-order inbound counters.
    pub skipped: HashMap<u32, [u8; 32]>,
}

impl SessionRecord {
    /// Initiator bootstrap from a peer's prekey bundle.
    pub fn initiate(
        base: &KeyPair,
        signed_pre_key_public: &[u8; 32],
        one_time_pre_key_public: Option<&[u8; 32]>,
        remote_identity: [u8; 32],
        remote_registration_id: u32,
        pending: PendingPreKey,
    ) -> Self {
        let dh1 = base.dh(signed_pre_key_public);
        let dh2 = one_time_pre_key_public.map(|pk| base.dh(pk));
        let (root_key, send, recv) = kdf::derive_session_keys(&dh1, dh2.as_ref());
        Self {
            root_key,
            send_chain: Chain::new(send),
            recv_chain: Chain::new(recv),
            remote_identity,
            remote_registration_id,
            pending_pre_key: Some(pending),
            skipped: HashMap::new(),
        }
    }

    /// Responder bootstrap from the material in an inbound prekey message.
    pub fn respond(
        signed_pre_key: &KeyPair,
        one_time_pre_key: Option<&KeyPair>,
        base_key_public: &[u8; 32],
        remote_identity: [u8; 32],
        remote_registration_id: u32,
    ) -> Self {
        let dh1 = signed_pre_key.dh(base_key_public);
        let dh2 = one_time_pre_key.map(|k| k.dh(base_key_public));
        let (root_key, send, recv) = kdf::derive_session_keys(&dh1, dh2.as_ref());
        // mirrored: the initiator's send chain is our receive chain
        Self {
            root_key,
            send_chain: Chain::new(recv),
            recv_chain: Chain::new(send),
            remote_identity,
            remote_registration_id,
            pending_pre_key: None,
            skipped: HashMap::new(),
        }
    }

    /// Whether outgoing traffic must still carry the bootstrap material.
    pub fn is_unacknowledged(&self) -> bool {
        self.pending_pre_key.is_some()
    }

    /// First inbound message proves the peer holds the session.
    pub fn acknowledge(&mut self) {
        self.pending_pre_key = None;
    }

    /// Encrypt the next outgoing message.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> crate::proto::PairwiseMessage {
        let counter = self.send_chain.index;
        let material = self.send_chain.step();
        let ciphertext = kdf::encrypt(&material, MESSAGE_INFO, plaintext, &counter.to_be_bytes());
        crate::proto::PairwiseMessage {
            counter,
            previous_counter: self.recv_chain.index,
            ciphertext,
        }
    }

    /// Decrypt an inbound message at its counter, tolerating skips.
    pub fn decrypt(
        &mut self,
        msg: &crate::proto::PairwiseMessage,
    ) -> Result<Vec<u8>, SignalError> {
        let aad = msg.counter.to_be_bytes();
        if msg.counter < self.recv_chain.index {
            let material = self
                .skipped
                .remove(&msg.counter)
                .ok_or(SignalError::DuplicateCounter(msg.counter))?;
            return kdf::decrypt(&material, MESSAGE_INFO, &msg.ciphertext, &aad);
        }
        if msg.counter - self.recv_chain.index > MAX_SKIP {
            return Err(SignalError::CounterTooFar(msg.counter));
        }
        while self.recv_chain.index < msg.counter {
            let idx = self.recv_chain.index;
            let material = self.recv_chain.step();
            self.skipped.insert(idx, material);
        }
        let material = self.recv_chain.step();
        let plaintext = kdf::decrypt(&material, MESSAGE_INFO, &msg.ciphertext, &aad)?;
        self.acknowledge();
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (SessionRecord, SessionRecord) {
        let spk = KeyPair::generate();
        let otp = KeyPair::generate();
        let base = KeyPair::generate();
        let initiator = SessionRecord::initiate(
            &base,
            &spk.public,
            Some(&otp.public),
            [1; 32],
            1001,
            PendingPreKey {
                pre_key_id: Some(7),
                signed_pre_key_id: 1,
                base_key: base.public,
            },
        );
        let responder = SessionRecord::respond(&spk, Some(&otp), &base.public, [2; 32], 2002);
        (initiator, responder)
    }

    #[test]
    fn chains_mirror_between_peers() {
        let (a, b) = session_pair();
        assert_eq!(a.send_chain.key, b.recv_chain.key);
        assert_eq!(a.recv_chain.key, b.send_chain.key);
        assert_eq!(a.root_key, b.root_key);
    }

    #[test]
    fn encrypt_decrypt_in_order() {
        let (mut a, mut b) = session_pair();
        for i in 0..5u32 {
            let msg = a.encrypt(format!("msg {i}").as_bytes());
            assert_eq!(msg.counter, i);
            let plain = b.decrypt(&msg).unwrap();
            assert_eq!(plain, format!("msg {i}").as_bytes());
        }
    }

    #[test]
    fn out_of_order_delivery_uses_skipped_keys() {
        let (mut a, mut b) = session_pair();
        let m0 = a.encrypt(b"zero");
        let m1 = a.encrypt(b"one");
        let m2 = a.encrypt(b"two");
        assert_eq!(b.decrypt(&m2).unwrap(), b"two");
        assert_eq!(b.decrypt(&m0).unwrap(), b"zero");
        assert_eq!(b.decrypt(&m1).unwrap(), b"one");
    }

    #[test]
    fn replay_is_rejected() {
        let (mut a, mut b) = session_pair();
        let m = a.encrypt(b"hello");
        b.decrypt(&m).unwrap();
        assert!(matches!(
            b.decrypt(&m),
            Err(SignalError::DuplicateCounter(0))
        ));
    }

    #[test]
    fn counter_too_far_is_rejected() {
        let (mut a, mut b) = session_pair();
        let mut m = a.encrypt(b"hello");
        m.counter = MAX_SKIP + 1;
        assert!(matches!(b.decrypt(&m), Err(SignalError::CounterTooFar(_))));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let (mut a, mut b) = session_pair();
        let mut m = a.encrypt(b"hello");
        m.ciphertext[0] ^= 1;
        assert!(matches!(b.decrypt(&m), Err(SignalError::BadMac)));
    }

    #[test]
    fn first_decrypt_acknowledges_session() {
        let (mut a, mut b) = session_pair();
        assert!(a.is_unacknowledged());
        let m = b.encrypt(b"reply");
        a.decrypt(&m).unwrap();
        assert!(!a.is_unacknowledged());
    }

    #[test]
    fn record_serde_roundtrip() {
        let (mut a, _) = session_pair();
        a.encrypt(b"advance the chain");
        let json = serde_json::to_vec(&a).unwrap();
        let back: SessionRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.send_chain, a.send_chain);
        assert_eq!(back.pending_pre_key, a.pending_pre_key);
    }

    #[test]
    fn without_one_time_prekey_still_interoperates() {
        let spk = KeyPair::generate();
        let base = KeyPair::generate();
        let mut a = SessionRecord::initiate(
            &base,
            &spk.public,
            None,
            [0; 32],
            1,
            PendingPreKey {
                pre_key_id: None,
                signed_pre_key_id: 1,
                base_key: base.public,
            },
        );
        let mut b = SessionRecord::respond(&spk, None, &base.public, [0; 32], 2);
        let m = a.encrypt(b"hi");
        assert_eq!(b.decrypt(&m).unwrap(), b"hi");
    }
}
