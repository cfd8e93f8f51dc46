//! Outbound message relay: recipient expansion, session assertion,
//! per-device encryption fan-out, and stanza assembly.
//!
//! One relay call runs inside a single key-store transaction, so the
//! session writes, sender-key rotation and sender-key-memory updates it
//! makes are committed atomically with respect to other relays.

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message as _;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::binary::Node;
use crate::error::Error;
use crate::proto::{self, protocol_message, GroupKeyDistributionMessage};
use crate::signal::{EncType, SignalRepository};
use crate::store::{AuthenticationCreds, KeyType, TransactionalKeyStore};
use crate::types::{generate_message_id_v2, Jid, MessageId, ServerClass};

/// Resolves the device list for a set of users (USync-backed in the
/// client, external via the `user_devices_cache` option).
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    async fn get_devices(
        &self,
        users: &[Jid],
        use_cache: bool,
        ignore_zero: bool,
    ) -> crate::Result<Vec<Jid>>;
}

/// Supplies group participant lists (the `cached_group_metadata` option,
/// falling back to a server query in the client).
#[async_trait]
pub trait GroupMetadataSource: Send + Sync {
    async fn participants(&self, group: &Jid) -> crate::Result<Vec<Jid>>;
}

/// Ensures pairwise sessions exist for the given device JIDs, fetching
/// prekey bundles for the missing ones.
#[async_trait]
pub trait SessionAsserter: Send + Sync {
    async fn assert_sessions(&self, jids: &[Jid]) -> crate::Result<()>;
}

/// Writes one stanza to the socket.
#[async_trait]
pub trait NodeSender: Send + Sync {
    async fn send_node(&self, node: Node) -> crate::Result<()>;
}

/// Last-chance mutation hook applied to the message right before
/// encryption; identity when absent.
pub type PatchMessageHook =
    Arc<dyn Fn(proto::Message, &[String]) -> proto::Message + Send + Sync>;

#[derive(Clone, Default)]
pub struct RelayOptions {
    /// Caller-supplied stanza id; generated otherwise.
    pub message_id: Option<MessageId>,
    /// Target a single device instead of the full recipient set. Forces
    /// a sender-key re-send in groups.
    pub participant: Option<Jid>,
    /// Audience for status broadcasts.
    pub status_jid_list: Vec<Jid>,
    /// Extra children appended to the stanza.
    pub additional_nodes: Vec<Node>,
    /// Peer category: a protocol message to one of our own devices,
    /// inlined without a participants wrapper.
    pub peer: bool,
}

pub struct RelayEngine {
    repo: Arc<SignalRepository>,
    store: Arc<TransactionalKeyStore>,
    creds: Arc<RwLock<AuthenticationCreds>>,
    devices: Arc<dyn DeviceResolver>,
    groups: Arc<dyn GroupMetadataSource>,
    sessions: Arc<dyn SessionAsserter>,
    sender: Arc<dyn NodeSender>,
    patch: Option<PatchMessageHook>,
}

struct EncodedRecipient {
    node: Node,
    used_pkmsg: bool,
}

impl RelayEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<SignalRepository>,
        store: Arc<TransactionalKeyStore>,
        creds: Arc<RwLock<AuthenticationCreds>>,
        devices: Arc<dyn DeviceResolver>,
        groups: Arc<dyn GroupMetadataSource>,
        sessions: Arc<dyn SessionAsserter>,
        sender: Arc<dyn NodeSender>,
        patch: Option<PatchMessageHook>,
    ) -> Self {
        Self {
            repo,
            store,
            creds,
            devices,
            groups,
            sessions,
            sender,
            patch,
        }
    }

    /// Relay a message to its destination, expanding recipients across
    /// all their devices. Returns the stanza id actually sent.
    pub async fn relay_message(
        &self,
        jid: &Jid,
        message: &proto::Message,
        opts: RelayOptions,
    ) -> crate::Result<MessageId> {
        let me = {
            let creds = self.creds.read().await;
            creds.me.clone().ok_or(Error::NotAuthenticated)?
        };
        let dest = jid.to_non_ad();
        let msg_id = opts
            .message_id
            .clone()
            .unwrap_or_else(|| generate_message_id_v2(Some(&me.user)));

        match dest.server_class() {
            ServerClass::Newsletter => self.relay_plaintext(&dest, message, msg_id).await,
            ServerClass::Unknown => Err(Error::Other(anyhow::anyhow!(
                "cannot relay to server {:?}",
                dest.server
            ))),
            class => {
                self.store
                    .transaction(|| async {
                        self.relay_encrypted(class, &me, jid, &dest, message, &opts, msg_id)
                            .await
                    })
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn relay_encrypted(
        &self,
        class: ServerClass,
        me: &Jid,
        jid: &Jid,
        dest: &Jid,
        message: &proto::Message,
        opts: &RelayOptions,
        msg_id: MessageId,
    ) -> crate::Result<MessageId> {
        if opts.peer {
            return self.relay_peer(jid, dest, message, opts, msg_id).await;
        }
        match class {
            ServerClass::Group => {
                self.relay_group(me, dest, message, opts, msg_id, true).await
            }
            ServerClass::Status | ServerClass::Broadcast => {
                self.relay_group(me, dest, message, opts, msg_id, false).await
            }
            _ => self.relay_individual(me, dest, message, opts, msg_id).await,
        }
    }

    /// Peer category: single device, single inlined `<enc>`.
    async fn relay_peer(
        &self,
        jid: &Jid,
        dest: &Jid,
        message: &proto::Message,
        opts: &RelayOptions,
        msg_id: MessageId,
    ) -> crate::Result<MessageId> {
        let target = opts.participant.clone().unwrap_or_else(|| jid.clone());
        self.sessions.assert_sessions(std::slice::from_ref(&target)).await?;
        let payload = message.encode_to_vec();
        let enc = self.repo.encrypt_message(&target, &payload).await?;
        let used_pkmsg = enc.typ == EncType::Pkmsg;

        let mut stanza = Node::new("message")
            .with_attr("id", msg_id.clone())
            .with_attr("to", dest.to_string())
            .with_attr("type", "text")
            .with_attr("category", "peer");
        let mut children = vec![enc_node(enc.typ.as_str(), enc.ciphertext, None)];
        if used_pkmsg {
            if let Some(identity) = self.device_identity_node().await {
                children.push(identity);
            }
        }
        children.extend(opts.additional_nodes.iter().cloned());
        stanza = stanza.with_children(children);
        self.sender.send_node(stanza).await?;
        Ok(msg_id)
    }

    /// Group and status fan-out: one sender-key ciphertext plus pairwise
    /// SKDM copies for devices that have not received the chain yet.
    async fn relay_group(
        &self,
        me: &Jid,
        dest: &Jid,
        message: &proto::Message,
        opts: &RelayOptions,
        msg_id: MessageId,
        track_memory: bool,
    ) -> crate::Result<MessageId> {
        let devices = if let Some(participant) = &opts.participant {
            vec![participant.clone()]
        } else if track_memory {
            let participants = self.groups.participants(dest).await?;
            self.devices.get_devices(&participants, true, false).await?
        } else {
            self.devices
                .get_devices(&opts.status_jid_list, true, false)
                .await?
        };

        let jids_encoded: Vec<String> = devices.iter().map(ToString::to_string).collect();
        let message = self.apply_patch(message.clone(), &jids_encoded);
        let payload = message.encode_to_vec();
        let group_enc = self.repo.encrypt_group_message(dest, me, &payload).await?;

        let mut memory = if track_memory {
            self.load_sender_key_memory(dest).await?
        } else {
            HashMap::new()
        };
        let force_resend = opts.participant.is_some();
        let skdm_targets: Vec<Jid> = devices
            .iter()
            .filter(|d| force_resend || !memory.get(&d.to_string()).copied().unwrap_or(false))
            .cloned()
            .collect();

        let mut include_identity = false;
        let mut to_nodes = Vec::with_capacity(skdm_targets.len());
        if !skdm_targets.is_empty() {
            self.sessions.assert_sessions(&skdm_targets).await?;
            let skdm_payload = proto::Message {
                group_key_distribution_message: Some(GroupKeyDistributionMessage {
                    group_jid: Some(dest.to_string()),
                    distribution: Some(group_enc.sender_key_distribution_message.clone()),
                }),
                ..Default::default()
            }
            .encode_to_vec();
            for target in &skdm_targets {
                let recipient = self.encrypt_recipient(target, &skdm_payload, None).await?;
                include_identity |= recipient.used_pkmsg;
                to_nodes.push(recipient.node);
            }
        }

        if track_memory {
            for target in &skdm_targets {
                memory.insert(target.to_string(), true);
            }
            self.save_sender_key_memory(dest, &memory).await?;
        }

        let mut children = Vec::new();
        if !to_nodes.is_empty() {
            children.push(Node::new("participants").with_children(to_nodes));
        }
        children.push(enc_node(
            "skmsg",
            group_enc.ciphertext,
            message.media_type(),
        ));
        if include_identity {
            if let Some(identity) = self.device_identity_node().await {
                children.push(identity);
            }
        }
        children.extend(opts.additional_nodes.iter().cloned());

        let mut stanza = Node::new("message")
            .with_attr("id", msg_id.clone())
            .with_attr("type", message_type_attr(&message))
            .with_attr("to", dest.to_string());
        if let Some(participant) = &opts.participant {
            stanza = stanza.with_attr("participant", participant.to_string());
        }
        if pins_in_chat(&message) {
            stanza = stanza.with_attr("decrypt-fail", "hide");
        }
        stanza = stanza.with_children(children);
        self.sender.send_node(stanza).await?;
        Ok(msg_id)
    }

    /// Individual and LID fan-out: pairwise encryption for every device
    /// of both sides, with our own devices receiving the message wrapped
    /// in `deviceSentMessage`.
    async fn relay_individual(
        &self,
        me: &Jid,
        dest: &Jid,
        message: &proto::Message,
        opts: &RelayOptions,
        msg_id: MessageId,
    ) -> crate::Result<MessageId> {
        let me_bare = me.to_non_ad();
        let devices: Vec<Jid> = if let Some(participant) = &opts.participant {
            vec![participant.clone()]
        } else {
            // seed with both primaries, then extend with the non-zero
            // devices USync knows about
            let mut devices = vec![dest.clone()];
            if dest.user != me_bare.user {
                devices.push(me_bare.clone());
            }
            let extra = self
                .devices
                .get_devices(&[me_bare.clone(), dest.clone()], true, true)
                .await?;
            devices.extend(extra);
            devices
        };

        let jids_encoded: Vec<String> = devices.iter().map(ToString::to_string).collect();
        let message = self.apply_patch(message.clone(), &jids_encoded);
        let payload = message.encode_to_vec();
        let dsm_payload = proto::Message::device_sent(dest.to_string(), message.clone())
            .encode_to_vec();

        self.sessions.assert_sessions(&devices).await?;

        let media_type = message.media_type();
        let mut include_identity = false;
        let mut to_nodes = Vec::with_capacity(devices.len());
        for device in &devices {
            let own = device.user == me_bare.user;
            let bytes = if own { &dsm_payload } else { &payload };
            let recipient = self.encrypt_recipient(device, bytes, media_type).await?;
            include_identity |= recipient.used_pkmsg;
            to_nodes.push(recipient.node);
        }

        let mut children = vec![Node::new("participants").with_children(to_nodes)];
        if include_identity {
            if let Some(identity) = self.device_identity_node().await {
                children.push(identity);
            }
        }
        children.extend(opts.additional_nodes.iter().cloned());

        let mut stanza = Node::new("message")
            .with_attr("id", msg_id.clone())
            .with_attr("type", message_type_attr(&message));
        match &opts.participant {
            None => {
                stanza = stanza.with_attr("to", dest.to_string());
            }
            Some(p) if p.user == me_bare.user => {
                stanza = stanza
                    .with_attr("to", p.to_string())
                    .with_attr("recipient", dest.to_string());
            }
            Some(p) => {
                stanza = stanza.with_attr("to", p.to_string());
            }
        }
        if pins_in_chat(&message) {
            stanza = stanza.with_attr("decrypt-fail", "hide");
        }
        stanza = stanza.with_children(children);
        self.sender.send_node(stanza).await?;
        Ok(msg_id)
    }

    /// Newsletter path: plaintext only, no per-recipient nodes. Edits and
    /// revokes rewrite the stanza id from the protocol-message key; the
    /// id actually sent is the one returned.
    async fn relay_plaintext(
        &self,
        dest: &Jid,
        message: &proto::Message,
        mut msg_id: MessageId,
    ) -> crate::Result<MessageId> {
        let mut payload = message.clone();
        if let Some(pm) = &message.protocol_message {
            let is_edit = pm.r#type == Some(protocol_message::Type::MessageEdit as i32);
            let is_revoke = pm.r#type == Some(protocol_message::Type::Revoke as i32);
            if is_edit || is_revoke {
                if let Some(id) = pm.key.as_ref().and_then(|k| k.id.clone()) {
                    msg_id = id;
                }
            }
            if is_edit {
                if let Some(edited) = &pm.edited_message {
                    payload = (**edited).clone();
                }
            }
        }
        let stanza = Node::new("message")
            .with_attr("id", msg_id.clone())
            .with_attr("to", dest.to_string())
            .with_attr("type", message_type_attr(&payload))
            .with_children(vec![
                Node::new("plaintext").with_content(payload.encode_to_vec()),
            ]);
        self.sender.send_node(stanza).await?;
        Ok(msg_id)
    }

    async fn encrypt_recipient(
        &self,
        target: &Jid,
        payload: &[u8],
        media_type: Option<&'static str>,
    ) -> crate::Result<EncodedRecipient> {
        let enc = self.repo.encrypt_message(target, payload).await?;
        let used_pkmsg = enc.typ == EncType::Pkmsg;
        let node = Node::new("to")
            .with_attr("jid", target.to_string())
            .with_children(vec![enc_node(enc.typ.as_str(), enc.ciphertext, media_type)]);
        Ok(EncodedRecipient { node, used_pkmsg })
    }

    fn apply_patch(&self, message: proto::Message, jids: &[String]) -> proto::Message {
        match &self.patch {
            Some(hook) => hook(message, jids),
            None => message,
        }
    }

    async fn device_identity_node(&self) -> Option<Node> {
        let account = self.creds.read().await.account.clone()?;
        Some(Node::new("device-identity").with_content(account))
    }

    async fn load_sender_key_memory(
        &self,
        group: &Jid,
    ) -> crate::Result<HashMap<String, bool>> {
        let raw = crate::store::get_one(&*self.store, KeyType::SenderKeyMemory, &group.to_string())
            .await?;
        match raw {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                crate::error::StoreError::Corrupt(format!("sender-key-memory {group}"), e.to_string())
                    .into()
            }),
            None => Ok(HashMap::new()),
        }
    }

    async fn save_sender_key_memory(
        &self,
        group: &Jid,
        memory: &HashMap<String, bool>,
    ) -> crate::Result<()> {
        let raw = serde_json::to_vec(memory)
            .map_err(|e| crate::error::StoreError::Save(e.to_string()))?;
        crate::store::set_one(
            &*self.store,
            KeyType::SenderKeyMemory,
            &group.to_string(),
            Some(Bytes::from(raw)),
        )
        .await
    }
}

fn enc_node(typ: &str, ciphertext: Vec<u8>, media_type: Option<&'static str>) -> Node {
    let mut node = Node::new("enc").with_attr("v", "2").with_attr("type", typ);
    if let Some(mt) = media_type {
        node = node.with_attr("mediatype", mt);
    }
    node.with_content(ciphertext)
}

fn message_type_attr(message: &proto::Message) -> &'static str {
    match message.media_type() {
        Some("url") | None => "text",
        Some(_) => "media",
    }
}

fn pins_in_chat(message: &proto::Message) -> bool {
    if message.pin_in_chat_message.is_some() {
        return true;
    }
    message
        .device_sent_message
        .as_ref()
        .and_then(|d| d.message.as_ref())
        .is_some_and(|inner| inner.pin_in_chat_message.is_some())
}
