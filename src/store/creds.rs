//! Authentication credentials: the persistent identity of this device.
//!
//! Creds are generated once on a fresh install, mutated on every
//! handshake step and pre-key upload, and serialized to the external
//! blob store after each mutation.

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::types::Jid;

/// An X25519 key pair. Ed25519 seeds ride in the same shape since both
/// are 32-byte secrets.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyPair {
    pub public: [u8; 32],
    pub private: [u8; 32],
}

impl KeyPair {
    /// Fresh X25519 pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret).to_bytes();
        Self {
            public,
            private: secret.to_bytes(),
        }
    }

    /// Fresh Ed25519 pair (seed in `private`, verifying key in `public`).
    pub fn generate_signing() -> Self {
        let signing = SigningKey::generate(&mut rand::thread_rng());
        Self {
            public: signing.verifying_key().to_bytes(),
            private: signing.to_bytes(),
        }
    }

    /// X25519 Diffie-Hellman with a peer public key.
    pub fn dh(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        secret
            .diffie_hellman(&PublicKey::from(*peer_public))
            .to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log private halves.
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// A pre-key as issued locally: id plus key pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKey {
    pub id: u32,
    pub key_pair: KeyPair,
}

/// The signed pre-key: one long-lived pre-key signed by the identity key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub id: u32,
    pub key_pair: KeyPair,
    #[serde(with = "serde_sig")]
    pub signature: [u8; 64],
}

mod serde_sig {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

/// Per-account server-synced settings the core needs to carry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccountSettings {
    pub unarchive_chats: bool,
    pub default_disappearing_mode_duration: Option<u32>,
}

/// Persistent credential state. Serialized to the external blob store on
/// every mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticationCreds {
    pub noise_key: KeyPair,
    pub pairing_ephemeral_key: KeyPair,
    /// Ed25519 identity pair; signs the signed pre-key and the device
    /// identity.
    pub signed_identity_key: KeyPair,
    pub signed_pre_key: SignedPreKey,
    /// 16-bit registration id (14 random bits offset by 1, never zero).
    pub registration_id: u16,
    /// Base64 of 32 random bytes; HMAC key for ADV device-identity checks.
    pub adv_secret_key: String,
    pub processed_history_messages: Vec<String>,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
    pub account_sync_counter: u32,
    pub account_settings: AccountSettings,
    pub registered: bool,
    /// Signed device identity from the server, once paired.
    pub account: Option<Vec<u8>>,
    /// Opaque routing info echoed back at connect time.
    pub routing_info: Option<Vec<u8>>,
    pub me: Option<Jid>,
    pub lid: Option<Jid>,
}

/// Registration ids are 14 random bits offset by 1 so they fit the
/// 16-bit wire field and are never zero.
pub fn generate_registration_id() -> u16 {
    (rand::thread_rng().next_u32() as u16 & 0x3FFF) + 1
}

/// Sign a pre-key public with the identity key over its 0x05-prefixed
/// wire form.
pub fn sign_pre_key(identity: &KeyPair, pre_key_public: &[u8; 32]) -> [u8; 64] {
    let signing = SigningKey::from_bytes(&identity.private);
    let mut msg = Vec::with_capacity(33);
    msg.push(0x05);
    msg.extend_from_slice(pre_key_public);
    signing.sign(&msg).to_bytes()
}

/// Verify a pre-key signature against an identity verifying key.
pub fn verify_pre_key_signature(
    identity_public: &[u8; 32],
    pre_key_public: &[u8; 32],
    signature: &[u8; 64],
) -> bool {
    let Ok(verifying) = ed25519_dalek::VerifyingKey::from_bytes(identity_public) else {
        return false;
    };
    let mut msg = Vec::with_capacity(33);
    msg.push(0x05);
    msg.extend_from_slice(pre_key_public);
    verifying
        .verify_strict(&msg, &ed25519_dalek::Signature::from_bytes(signature))
        .is_ok()
}

/// Fresh-install credentials: noise, identity, signed pre-key id 1,
/// registration id, adv secret.
pub fn init_auth_creds() -> AuthenticationCreds {
    let signed_identity_key = KeyPair::generate_signing();
    let spk_pair = KeyPair::generate();
    let signature = sign_pre_key(&signed_identity_key, &spk_pair.public);
    let mut adv_secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut adv_secret);

    AuthenticationCreds {
        noise_key: KeyPair::generate(),
        pairing_ephemeral_key: KeyPair::generate(),
        signed_identity_key,
        signed_pre_key: SignedPreKey {
            id: 1,
            key_pair: spk_pair,
            signature,
        },
        registration_id: generate_registration_id(),
        adv_secret_key: base64::engine::general_purpose::STANDARD.encode(adv_secret),
        processed_history_messages: Vec::new(),
        next_pre_key_id: 1,
        first_unuploaded_pre_key_id: 1,
        account_sync_counter: 0,
        account_settings: AccountSettings::default(),
        registered: false,
        account: None,
        routing_info: None,
        me: None,
        lid: None,
    }
}

/// Result of issuing a pre-key batch: the fresh keys plus the creds
/// fields to advance. Ids are never reissued.
#[derive(Clone, Debug)]
pub struct PreKeyBatch {
    pub new_pre_keys: Vec<PreKey>,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
}

/// Issue `count` pre-keys starting at `next_pre_key_id`. The caller
/// persists the keys and applies the id advance to creds in one step.
pub fn generate_or_get_pre_keys(creds: &AuthenticationCreds, count: u32) -> PreKeyBatch {
    let start = creds.next_pre_key_id;
    let end = start + count;
    let new_pre_keys = (start..end)
        .map(|id| PreKey {
            id,
            key_pair: KeyPair::generate(),
        })
        .collect();
    PreKeyBatch {
        new_pre_keys,
        next_pre_key_id: end,
        first_unuploaded_pre_key_id: creds.first_unuploaded_pre_key_id.max(end),
    }
}
