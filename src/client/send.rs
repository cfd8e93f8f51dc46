//! Send-side surface: message sends, receipts, and their wire shapes.

use crate::binary::Node;
use crate::events::{Event, MessageUpsert};
use crate::proto;
use crate::relay::RelayOptions;
use crate::types::{Jid, MessageId};
use std::time::{SystemTime, UNIX_EPOCH};

use super::Client;

/// Response from sending a message.
#[derive(Clone, Debug)]
pub struct SendResponse {
    pub timestamp: SystemTime,
    pub id: MessageId,
    pub sender: Option<Jid>,
}

/// Optional parameters for `send_message`.
#[derive(Clone, Debug, Default)]
pub struct SendRequestExtra {
    pub id: Option<MessageId>,
    pub peer: bool,
    pub status_jid_list: Vec<Jid>,
}

/// Reference to a message for receipt purposes.
#[derive(Clone, Debug)]
pub struct MessageRef {
    pub remote_jid: Jid,
    pub id: MessageId,
    pub participant: Option<Jid>,
}

/// Receipt kinds the client originates. Delivery is the bare receipt
/// with no `type` attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptType {
    Read,
    ReadSelf,
    Sender,
    Delivery,
    Played,
    Retry,
}

impl ReceiptType {
    fn attr(&self) -> Option<&'static str> {
        match self {
            Self::Read => Some("read"),
            Self::ReadSelf => Some("read-self"),
            Self::Sender => Some("sender"),
            Self::Delivery => None,
            Self::Played => Some("played"),
            Self::Retry => Some("retry"),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Build receipt stanzas for the given keys: one stanza per
/// `(chat, participant)` pair, the first id on the stanza itself and the
/// rest batched under `<list>`.
pub fn build_receipt_nodes(keys: &[MessageRef], typ: ReceiptType) -> Vec<Node> {
    let mut grouped: Vec<(&MessageRef, Vec<&MessageRef>)> = Vec::new();
    for key in keys {
        match grouped.iter_mut().find(|(head, _)| {
            head.remote_jid == key.remote_jid
                && head.participant.as_ref().map(|p| &p.user)
                    == key.participant.as_ref().map(|p| &p.user)
        }) {
            Some((_, rest)) => rest.push(key),
            None => grouped.push((key, Vec::new())),
        }
    }

    grouped
        .into_iter()
        .map(|(head, rest)| {
            let mut node = Node::new("receipt")
                .with_attr("id", head.id.clone())
                .with_attr("to", head.remote_jid.to_string());
            if let Some(t) = typ.attr() {
                node = node.with_attr("type", t);
            }
            if matches!(typ, ReceiptType::Read | ReceiptType::ReadSelf | ReceiptType::Played) {
                node = node.with_attr("t", unix_now().to_string());
            }
            if let Some(participant) = &head.participant {
                node = node.with_attr("participant", participant.to_string());
            }
            if !rest.is_empty() {
                let items = rest
                    .iter()
                    .map(|k| Node::new("item").with_attr("id", k.id.clone()))
                    .collect();
                node = node.with_children(vec![Node::new("list").with_children(items)]);
            }
            node
        })
        .collect()
}

impl Client {
    /// Send a message to a chat. Expands recipients, encrypts per device
    /// and relays the stanza; returns the assigned id.
    pub async fn send_message(
        &self,
        to: &Jid,
        message: &proto::Message,
        extra: SendRequestExtra,
    ) -> crate::Result<SendResponse> {
        let opts = RelayOptions {
            message_id: extra.id,
            peer: extra.peer,
            status_jid_list: extra.status_jid_list,
            ..Default::default()
        };
        let id = self.relay.relay_message(to, message, opts).await?;
        let sender = self.own_jid().await;
        if self.config.emit_own_events {
            self.bus.emit(Event::MessagesUpsert(MessageUpsert {
                key_remote_jid: to.to_non_ad(),
                key_id: id.clone(),
                from_me: true,
                timestamp: unix_now(),
                raw: prost::Message::encode_to_vec(message),
            }));
        }
        Ok(SendResponse {
            timestamp: SystemTime::now(),
            id,
            sender,
        })
    }

    /// Send receipts for the given message keys. An empty slice is a
    /// no-op.
    pub async fn send_receipts(
        &self,
        keys: &[MessageRef],
        typ: ReceiptType,
    ) -> crate::Result<()> {
        for node in build_receipt_nodes(keys, typ) {
            self.wire.send_node(&node).await?;
        }
        Ok(())
    }
}
