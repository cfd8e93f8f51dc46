//! Signal protocol repository.
//!
//! Pairwise and group primitives over the transactional key store. Entry
//! points assume the caller has opened an outer store transaction, so
//! reads and writes on the `session`, `sender-key` and `pre-key` spaces
//! are atomic per relay operation.

mod group;
mod kdf;
mod ratchet;

pub use group::SenderKeyRecord;
pub use ratchet::{PendingPreKey, SessionRecord, MAX_SKIP};

use bytes::Bytes;
use prost::Message as _;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{SignalError, StoreError};
use crate::proto::{PairwiseMessage, PreKeyMessage, SenderKeyDistributionMessage, SenderKeyMessage};
use crate::store::{
    creds::{verify_pre_key_signature, AuthenticationCreds, KeyPair, PreKey},
    get_one, set_one, KeyType, TransactionalKeyStore,
};
use crate::types::Jid;

/// The `<enc type>` attribute values for pairwise traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncType {
    /// Prekey message: carries session bootstrap material.
    Pkmsg,
    /// Regular ratchet message.
    Msg,
}

impl EncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pkmsg => "pkmsg",
            Self::Msg => "msg",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EncryptedMessage {
    pub typ: EncType,
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct GroupEncryptedMessage {
    pub ciphertext: Vec<u8>,
    pub sender_key_distribution_message: Vec<u8>,
}

/// Prekey bundle fetched from the server for session bootstrap.
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub signed_pre_key_public: [u8; 32],
    pub signed_pre_key_signature: [u8; 64],
    pub pre_key: Option<(u32, [u8; 32])>,
}

pub struct SignalRepository {
    store: Arc<TransactionalKeyStore>,
    creds: Arc<RwLock<AuthenticationCreds>>,
}

impl SignalRepository {
    pub fn new(
        store: Arc<TransactionalKeyStore>,
        creds: Arc<RwLock<AuthenticationCreds>>,
    ) -> Self {
        Self { store, creds }
    }

    /// Deterministic Signal address for a JID: `user.device`.
    pub fn jid_to_signal_address(jid: &Jid) -> String {
        jid.to_signal_address()
    }

    fn sender_key_id(group: &Jid, author_address: &str) -> String {
        format!("{}::{}", group.to_non_ad(), author_address)
    }

    async fn load_session(&self, address: &str) -> crate::Result<Option<SessionRecord>> {
        let Some(raw) = get_one(&*self.store, KeyType::Session, address).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Corrupt(format!("session {address}"), e.to_string()))?;
        Ok(Some(record))
    }

    async fn save_session(&self, address: &str, record: &SessionRecord) -> crate::Result<()> {
        let raw = serde_json::to_vec(record)
            .map_err(|e| StoreError::Save(e.to_string()))?;
        set_one(&*self.store, KeyType::Session, address, Some(Bytes::from(raw))).await
    }

    pub async fn has_session(&self, jid: &Jid) -> crate::Result<bool> {
        Ok(self
            .load_session(&Self::jid_to_signal_address(jid))
            .await?
            .is_some())
    }

    /// Build a fresh pairwise session from a prekey bundle.
    pub async fn inject_e2e_session(&self, jid: &Jid, bundle: PreKeyBundle) -> crate::Result<()> {
        if !verify_pre_key_signature(
            &bundle.identity_key,
            &bundle.signed_pre_key_public,
            &bundle.signed_pre_key_signature,
        ) {
            return Err(SignalError::InvalidBundle(
                "signed prekey signature does not verify".into(),
            )
            .into());
        }
        let base = KeyPair::generate();
        let record = SessionRecord::initiate(
            &base,
            &bundle.signed_pre_key_public,
            bundle.pre_key.as_ref().map(|(_, public)| public),
            bundle.identity_key,
            bundle.registration_id,
            PendingPreKey {
                pre_key_id: bundle.pre_key.map(|(id, _)| id),
                signed_pre_key_id: bundle.signed_pre_key_id,
                base_key: base.public,
            },
        );
        let address = Self::jid_to_signal_address(jid);
        tracing::debug!(%jid, "injected e2e session");
        self.save_session(&address, &record).await
    }

    /// Encrypt a pairwise payload for one device. `pkmsg` while the
    /// session is unacknowledged, `msg` afterwards.
    pub async fn encrypt_message(
        &self,
        jid: &Jid,
        data: &[u8],
    ) -> crate::Result<EncryptedMessage> {
        let address = Self::jid_to_signal_address(jid);
        let mut record = self
            .load_session(&address)
            .await?
            .ok_or_else(|| SignalError::NoSession(address.clone()))?;

        let inner = record.encrypt(data).encode_to_vec();
        let out = if let Some(pending) = &record.pending_pre_key {
            let creds = self.creds.read().await;
            let pkmsg = PreKeyMessage {
                registration_id: creds.registration_id as u32,
                pre_key_id: pending.pre_key_id,
                signed_pre_key_id: pending.signed_pre_key_id,
                base_key: pending.base_key.to_vec(),
                identity_key: creds.signed_identity_key.public.to_vec(),
                message: inner,
            };
            EncryptedMessage {
                typ: EncType::Pkmsg,
                ciphertext: pkmsg.encode_to_vec(),
            }
        } else {
            EncryptedMessage {
                typ: EncType::Msg,
                ciphertext: inner,
            }
        };
        self.save_session(&address, &record).await?;
        Ok(out)
    }

    /// Decrypt a pairwise payload from one device.
    pub async fn decrypt_message(
        &self,
        jid: &Jid,
        typ: EncType,
        ciphertext: &[u8],
    ) -> crate::Result<Vec<u8>> {
        let address = Self::jid_to_signal_address(jid);
        match typ {
            EncType::Msg => {
                let msg = PairwiseMessage::decode(ciphertext)
                    .map_err(|e| SignalError::InvalidBundle(e.to_string()))?;
                let mut record = self
                    .load_session(&address)
                    .await?
                    .ok_or_else(|| SignalError::NoSession(address.clone()))?;
                let plain = record.decrypt(&msg)?;
                self.save_session(&address, &record).await?;
                Ok(plain)
            }
            EncType::Pkmsg => {
                let pkmsg = PreKeyMessage::decode(ciphertext)
                    .map_err(|e| SignalError::InvalidBundle(e.to_string()))?;
                let msg = PairwiseMessage::decode(pkmsg.message.as_slice())
                    .map_err(|e| SignalError::InvalidBundle(e.to_string()))?;
                let base_key: [u8; 32] = pkmsg
                    .base_key
                    .as_slice()
                    .try_into()
                    .map_err(|_| SignalError::InvalidBundle("base key must be 32 bytes".into()))?;
                let identity: [u8; 32] = pkmsg
                    .identity_key
                    .as_slice()
                    .try_into()
                    .map_err(|_| SignalError::InvalidBundle("identity must be 32 bytes".into()))?;

                // Re-use the existing session when it already matches this
                // bootstrap; otherwise build the responder side fresh.
                if let Some(mut record) = self.load_session(&address).await? {
                    if let Ok(plain) = record.decrypt(&msg) {
                        self.save_session(&address, &record).await?;
                        return Ok(plain);
                    }
                }
                let creds = self.creds.read().await.clone();
                if pkmsg.signed_pre_key_id != creds.signed_pre_key.id {
                    return Err(SignalError::InvalidBundle(format!(
                        "prekey message references signed prekey {}",
                        pkmsg.signed_pre_key_id
                    ))
                    .into());
                }
                let one_time = match pkmsg.pre_key_id {
                    Some(id) => Some(self.take_pre_key(id).await?),
                    None => None,
                };
                let mut record = SessionRecord::respond(
                    &creds.signed_pre_key.key_pair,
                    one_time.as_ref().map(|p| &p.key_pair),
                    &base_key,
                    identity,
                    pkmsg.registration_id,
                );
                let plain = record.decrypt(&msg)?;
                self.save_session(&address, &record).await?;
                Ok(plain)
            }
        }
    }

    /// Load and consume a one-time prekey. The record is deleted in the
    /// same transaction as the session write.
    async fn take_pre_key(&self, id: u32) -> crate::Result<PreKey> {
        let key = id.to_string();
        let raw = get_one(&*self.store, KeyType::PreKey, &key)
            .await?
            .ok_or_else(|| SignalError::InvalidBundle(format!("unknown prekey id {id}")))?;
        let pre_key: PreKey = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Corrupt(format!("pre-key {id}"), e.to_string()))?;
        set_one(&*self.store, KeyType::PreKey, &key, None).await?;
        Ok(pre_key)
    }

    async fn load_sender_key(&self, id: &str) -> crate::Result<Option<SenderKeyRecord>> {
        let Some(raw) = get_one(&*self.store, KeyType::SenderKey, id).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Corrupt(format!("sender-key {id}"), e.to_string()))?;
        Ok(Some(record))
    }

    async fn save_sender_key(&self, id: &str, record: &SenderKeyRecord) -> crate::Result<()> {
        let raw = serde_json::to_vec(record)
            .map_err(|e| StoreError::Save(e.to_string()))?;
        set_one(&*self.store, KeyType::SenderKey, id, Some(Bytes::from(raw))).await
    }

    /// Encrypt a group payload on our sender chain, creating the chain on
    /// first use. Returns the ciphertext plus the distribution message
    /// new recipients need.
    pub async fn encrypt_group_message(
        &self,
        group: &Jid,
        me: &Jid,
        data: &[u8],
    ) -> crate::Result<GroupEncryptedMessage> {
        let id = Self::sender_key_id(group, &Self::jid_to_signal_address(me));
        let mut record = match self.load_sender_key(&id).await? {
            Some(r) if r.signing_private.is_some() => r,
            _ => {
                tracing::debug!(%group, "creating sender key chain");
                SenderKeyRecord::create()
            }
        };
        let skdm = record.to_distribution().encode_to_vec();
        let ciphertext = record.encrypt(data)?.encode_to_vec();
        self.save_sender_key(&id, &record).await?;
        Ok(GroupEncryptedMessage {
            ciphertext,
            sender_key_distribution_message: skdm,
        })
    }

    /// Store a sender chain received from another group member.
    pub async fn process_sender_key_distribution(
        &self,
        group: &Jid,
        author: &Jid,
        skdm_bytes: &[u8],
    ) -> crate::Result<()> {
        let skdm = SenderKeyDistributionMessage::decode(skdm_bytes)
            .map_err(|e| SignalError::InvalidBundle(e.to_string()))?;
        let record = SenderKeyRecord::from_distribution(&skdm)?;
        let id = Self::sender_key_id(group, &Self::jid_to_signal_address(author));
        self.save_sender_key(&id, &record).await
    }

    /// Decrypt a group payload on the author's chain.
    pub async fn decrypt_group_message(
        &self,
        group: &Jid,
        author: &Jid,
        ciphertext: &[u8],
    ) -> crate::Result<Vec<u8>> {
        let msg = SenderKeyMessage::decode(ciphertext)
            .map_err(|e| SignalError::InvalidBundle(e.to_string()))?;
        let id = Self::sender_key_id(group, &Self::jid_to_signal_address(author));
        let mut record = self
            .load_sender_key(&id)
            .await?
            .ok_or_else(|| SignalError::NoSenderKey(id.clone()))?;
        let plain = record.decrypt(&msg)?;
        self.save_sender_key(&id, &record).await?;
        Ok(plain)
    }
}
