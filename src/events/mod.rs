//! Typed events and the buffered in-process bus.
//!
//! Each event belongs to a named channel. While the bus is buffering,
//! emitted events accumulate per channel and consumers registered with
//! [`EventBus::process`] receive the whole map on flush; outside a
//! buffering window every emit delivers immediately as a one-entry map.

use crate::error::DisconnectReason;
use crate::store::AuthenticationCreds;
use crate::types::{Jid, MessageId};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// Connection lifecycle notification.
#[derive(Clone, Debug, Default)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionStatus>,
    pub last_disconnect: Option<DisconnectReason>,
    pub qr_ref: Option<String>,
    pub is_new_login: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Close,
}

#[derive(Clone, Debug)]
pub struct MessageUpsert {
    pub key_remote_jid: Jid,
    pub key_id: MessageId,
    pub from_me: bool,
    pub timestamp: u64,
    /// Raw message payload (protobuf); decode per message type.
    pub raw: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct MessageUpdate {
    pub key_remote_jid: Jid,
    pub key_id: MessageId,
    pub status: MessageStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    ServerAck,
    DeliveryAck,
    Read,
    Played,
}

#[derive(Clone, Debug)]
pub struct ReceiptUpdate {
    pub key_remote_jid: Jid,
    pub key_id: MessageId,
    pub receipt_type: String,
    pub participant: Option<Jid>,
    pub timestamp: u64,
}

#[derive(Clone, Debug)]
pub struct CallEvent {
    pub from: Jid,
    pub call_id: String,
    pub status: String,
}

#[derive(Clone, Debug)]
pub struct PresenceUpdate {
    pub jid: Jid,
    pub available: bool,
}

/// Events emitted by the client, one variant per channel.
#[derive(Clone, Debug)]
pub enum Event {
    ConnectionUpdate(ConnectionUpdate),
    CredsUpdate(Box<AuthenticationCreds>),
    MessagingHistorySet { chunk_order: u32, progress: u32 },
    MessagesUpsert(MessageUpsert),
    MessagesUpdate(Vec<MessageUpdate>),
    MessageReceiptUpdate(Vec<ReceiptUpdate>),
    GroupsUpsert(Vec<Jid>),
    GroupsUpdate(Vec<Jid>),
    ContactsUpdate(Vec<Jid>),
    ChatsDelete(Vec<Jid>),
    Call(CallEvent),
    PresenceUpdate(PresenceUpdate),
}

impl Event {
    /// The channel this event is delivered on.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::ConnectionUpdate(_) => "connection.update",
            Self::CredsUpdate(_) => "creds.update",
            Self::MessagingHistorySet { .. } => "messaging-history.set",
            Self::MessagesUpsert(_) => "messages.upsert",
            Self::MessagesUpdate(_) => "messages.update",
            Self::MessageReceiptUpdate(_) => "message-receipt.update",
            Self::GroupsUpsert(_) => "groups.upsert",
            Self::GroupsUpdate(_) => "groups.update",
            Self::ContactsUpdate(_) => "contacts.update",
            Self::ChatsDelete(_) => "chats.delete",
            Self::Call(_) => "call",
            Self::PresenceUpdate(_) => "presence.update",
        }
    }
}

/// Channel name → events accumulated since the last flush, in emit order.
pub type EventMap = HashMap<&'static str, Vec<Event>>;

type Handler = Box<dyn Fn(&EventMap) + Send + Sync>;

#[derive(Default)]
struct BusState {
    buffering: bool,
    pending: EventMap,
}

/// Buffered pub/sub bus.
#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
    handlers: RwLock<Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer. Each flush delivers the accumulated map once.
    pub fn process<F>(&self, handler: F)
    where
        F: Fn(&EventMap) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(handler));
    }

    /// Start accumulating instead of delivering immediately.
    pub fn buffer(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).buffering = true;
    }

    /// Emit one event: buffered while a window is open, otherwise
    /// delivered to all consumers right away.
    pub fn emit(&self, event: Event) {
        let immediate = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.buffering {
                st.pending.entry(event.channel()).or_default().push(event);
                None
            } else {
                let mut map = EventMap::new();
                map.insert(event.channel(), vec![event]);
                Some(map)
            }
        };
        if let Some(map) = immediate {
            self.deliver(&map);
        }
    }

    /// Close the buffering window and deliver everything accumulated, at
    /// most once. Returns whether anything was delivered.
    pub fn flush(&self) -> bool {
        let map = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.buffering = false;
            std::mem::take(&mut st.pending)
        };
        if map.is_empty() {
            return false;
        }
        self.deliver(&map);
        true
    }

    fn deliver(&self, map: &EventMap) {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        for handler in handlers.iter() {
            handler(map);
        }
    }
}
