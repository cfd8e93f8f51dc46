//! The socket client: wires the Noise transport, the binary codec, the
//! key stores, the Signal repository and the relay engine together, and
//! dispatches inbound stanzas to handlers.

mod prekeys;
mod send;

pub use prekeys::{
    build_pre_key_fetch_node, build_pre_key_upload_node, parse_and_inject_e2e_sessions,
    parse_pre_key_bundles,
};
pub use send::{build_receipt_nodes, MessageRef, ReceiptType, SendRequestExtra, SendResponse};

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message as _;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

use crate::binary::Node;
use crate::error::{DisconnectReason, Error};
use crate::events::{
    CallEvent, ConnectionStatus, ConnectionUpdate, Event, EventBus, MessageStatus, MessageUpdate,
    MessageUpsert, PresenceUpdate, ReceiptUpdate,
};
use crate::jobqueue::JobQueue;
use crate::mediaconn::{build_media_conn_iq, parse_media_conn, MediaConnCache, MediaConnInfo};
use crate::proto;
use crate::relay::{
    DeviceResolver, GroupMetadataSource, NodeSender, PatchMessageHook, RelayEngine, RelayOptions,
    SessionAsserter,
};
use crate::request::{ensure_stanza_id, route_node, InboundRoute, PendingRequests};
use crate::signal::{EncType, SignalRepository};
use crate::store::{
    creds::generate_or_get_pre_keys, AuthenticationCreds, CachedKeyStore, KeyBatch, KeyStore,
    KeyType, SignalKeyStore, TransactionOptions, TransactionalKeyStore,
};
use crate::transport::Transport;
use crate::types::Jid;
use crate::usync::{build_device_query, extract_device_jids, DeviceCache, DEVICE_CACHE_TTL};

/// Shared per-message-id retry counter. The default is in-memory; a
/// deployment can inject a store shared across restarts.
pub trait RetryCounterCache: Send + Sync {
    fn increment(&self, msg_id: &str) -> u32;
    fn get(&self, msg_id: &str) -> u32;
}

#[derive(Default)]
struct MemoryRetryCache {
    counts: StdMutex<HashMap<String, u32>>,
}

impl RetryCounterCache for MemoryRetryCache {
    fn increment(&self, msg_id: &str) -> u32 {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = counts.entry(msg_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn get(&self, msg_id: &str) -> u32 {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(msg_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Replay source for messages a peer failed to decrypt.
pub type GetMessageHook =
    Arc<dyn Fn(&proto::MessageKey) -> Option<proto::Message> + Send + Sync>;

/// Inbound JID filter.
pub type JidFilter = Arc<dyn Fn(&Jid) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct SocketConfig {
    pub ws_url: String,
    /// Protocol version triple sent in the handshake login payload.
    pub version: (u32, u32, u32),
    pub query_timeout: Duration,
    pub keepalive_interval: Duration,
    pub transaction_opts: TransactionOptions,
    pub device_cache_ttl: Duration,
    /// Whether `send_message` emits a local `messages.upsert`.
    pub emit_own_events: bool,
    pub max_msg_retry_count: u32,
    pub cached_group_metadata: Option<Arc<dyn GroupMetadataSource>>,
    pub patch_message_before_sending: Option<PatchMessageHook>,
    pub should_ignore_jid: Option<JidFilter>,
    pub get_message: Option<GetMessageHook>,
    pub msg_retry_counter_cache: Option<Arc<dyn RetryCounterCache>>,
    /// Externalized device cache, shared across clients when set.
    pub user_devices_cache: Option<Arc<DeviceCache>>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            ws_url: crate::socket::DEFAULT_WS_URL.to_string(),
            version: (2, 3000, 1023223821),
            query_timeout: crate::request::DEFAULT_QUERY_TIMEOUT,
            keepalive_interval: Duration::from_secs(30),
            transaction_opts: TransactionOptions::default(),
            device_cache_ttl: DEVICE_CACHE_TTL,
            emit_own_events: true,
            max_msg_retry_count: 5,
            cached_group_metadata: None,
            patch_message_before_sending: None,
            should_ignore_jid: None,
            get_message: None,
            msg_retry_counter_cache: None,
            user_devices_cache: None,
        }
    }
}

/// Shared send/query core: the transport slot and the pending-IQ table.
pub(crate) struct Wire {
    transport: RwLock<Option<Arc<dyn Transport>>>,
    pending: PendingRequests,
    query_timeout: Duration,
}

impl Wire {
    fn new(query_timeout: Duration) -> Self {
        Self {
            transport: RwLock::new(None),
            pending: PendingRequests::new(),
            query_timeout,
        }
    }

    pub(crate) async fn send_node(&self, node: &Node) -> crate::Result<()> {
        let transport = self
            .transport
            .read()
            .await
            .clone()
            .ok_or(Error::NotConnected)?;
        tracing::debug!(tag = %node.tag, "send node");
        transport.send(&node.marshal()?).await
    }

    /// Send a stanza and await the response with a matching id.
    pub(crate) async fn query(&self, mut node: Node) -> crate::Result<Node> {
        let id = ensure_stanza_id(&mut node);
        let rx = self.pending.register(&id);
        if let Err(e) = self.send_node(&node).await {
            self.pending.unregister(&id);
            return Err(e);
        }
        self.pending.wait(&id, rx, self.query_timeout).await
    }
}

struct WireNodeSender(Arc<Wire>);

#[async_trait]
impl NodeSender for WireNodeSender {
    async fn send_node(&self, node: Node) -> crate::Result<()> {
        self.0.send_node(&node).await
    }
}

/// USync-backed device resolver with the per-user TTL cache.
struct UsyncDeviceResolver {
    wire: Arc<Wire>,
    cache: Arc<DeviceCache>,
    creds: Arc<RwLock<AuthenticationCreds>>,
}

#[async_trait]
impl DeviceResolver for UsyncDeviceResolver {
    async fn get_devices(
        &self,
        users: &[Jid],
        use_cache: bool,
        ignore_zero: bool,
    ) -> crate::Result<Vec<Jid>> {
        let me = self
            .creds
            .read()
            .await
            .me
            .clone()
            .ok_or(Error::NotAuthenticated)?;
        let (mut devices, to_fetch) = self.cache.split(users, use_cache);
        if !to_fetch.is_empty() {
            let resp = self.wire.query(build_device_query(&to_fetch)).await?;
            // cache the full lists; zero-device filtering happens below so
            // both call styles share the same entries
            let fetched = extract_device_jids(&resp, &me, false)?;
            self.cache.store(&fetched);
            self.cache.store_empty(&to_fetch);
            devices.extend(fetched);
        }
        Ok(devices
            .into_iter()
            .filter(|d| !(ignore_zero && d.device == 0))
            .map(|d| d.to_jid())
            .collect())
    }
}

/// Asserts pairwise sessions by fetching prekey bundles for devices that
/// lack one.
struct PrekeySessionAsserter {
    wire: Arc<Wire>,
    repo: Arc<SignalRepository>,
}

#[async_trait]
impl SessionAsserter for PrekeySessionAsserter {
    async fn assert_sessions(&self, jids: &[Jid]) -> crate::Result<()> {
        let mut missing = Vec::new();
        for jid in jids {
            if !self.repo.has_session(jid).await? {
                missing.push(jid.clone());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = missing.len(), "fetching prekey bundles");
        let resp = self.wire.query(build_pre_key_fetch_node(&missing)).await?;
        parse_and_inject_e2e_sessions(&resp, &self.repo).await
    }
}

/// Group participant lookup over `iq w:g2` when no external cache is
/// configured.
struct GroupMetadataQuery {
    wire: Arc<Wire>,
}

#[async_trait]
impl GroupMetadataSource for GroupMetadataQuery {
    async fn participants(&self, group: &Jid) -> crate::Result<Vec<Jid>> {
        let query = Node::new("iq")
            .with_attr("type", "get")
            .with_attr("xmlns", "w:g2")
            .with_attr("to", group.to_string())
            .with_children(vec![Node::new("query").with_attr("request", "interactive")]);
        let resp = self.wire.query(query).await?;
        let group_node = resp.get_child_by_tag("group").ok_or_else(|| {
            Error::Binary(crate::error::BinaryError::MalformedFrame(
                "group metadata without group node".into(),
            ))
        })?;
        Ok(group_node
            .get_children_by_tag("participant")
            .filter_map(|p| p.attr("jid"))
            .filter_map(|j| j.parse().ok())
            .collect())
    }
}

/// Client for the multidevice service.
pub struct Client {
    pub(crate) config: SocketConfig,
    creds: Arc<RwLock<AuthenticationCreds>>,
    store: Arc<TransactionalKeyStore>,
    repo: Arc<SignalRepository>,
    pub(crate) relay: RelayEngine,
    pub(crate) wire: Arc<Wire>,
    pub(crate) bus: Arc<EventBus>,
    jobs: JobQueue,
    media: MediaConnCache,
    resolver: Arc<UsyncDeviceResolver>,
    retry_counters: Arc<dyn RetryCounterCache>,
    /// Back-reference for spawning the receive and keepalive loops.
    weak: std::sync::Weak<Client>,
}

impl Client {
    /// Build a client over externally injected creds and blob store.
    pub fn new(creds: AuthenticationCreds, backing: KeyStore, config: SocketConfig) -> Arc<Self> {
        let creds = Arc::new(RwLock::new(creds));
        let cached: KeyStore = Arc::new(CachedKeyStore::new(backing));
        let store = Arc::new(TransactionalKeyStore::new(cached, config.transaction_opts));
        let repo = Arc::new(SignalRepository::new(store.clone(), creds.clone()));
        let wire = Arc::new(Wire::new(config.query_timeout));
        let resolver = Arc::new(UsyncDeviceResolver {
            wire: wire.clone(),
            cache: config
                .user_devices_cache
                .clone()
                .unwrap_or_else(|| Arc::new(DeviceCache::new(config.device_cache_ttl))),
            creds: creds.clone(),
        });
        let groups: Arc<dyn GroupMetadataSource> = config
            .cached_group_metadata
            .clone()
            .unwrap_or_else(|| Arc::new(GroupMetadataQuery { wire: wire.clone() }));
        let sessions = Arc::new(PrekeySessionAsserter {
            wire: wire.clone(),
            repo: repo.clone(),
        });
        let relay = RelayEngine::new(
            repo.clone(),
            store.clone(),
            creds.clone(),
            resolver.clone(),
            groups,
            sessions,
            Arc::new(WireNodeSender(wire.clone())),
            config.patch_message_before_sending.clone(),
        );
        let retry_counters = config
            .msg_retry_counter_cache
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryRetryCache::default()));
        Arc::new_cyclic(|weak| Self {
            config,
            creds,
            store,
            repo,
            relay,
            wire,
            bus: Arc::new(EventBus::new()),
            jobs: JobQueue::default(),
            media: MediaConnCache::new(),
            resolver,
            retry_counters,
            weak: weak.clone(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn signal_repository(&self) -> &Arc<SignalRepository> {
        &self.repo
    }

    pub async fn own_jid(&self) -> Option<Jid> {
        self.creds.read().await.me.clone()
    }

    /// Snapshot of the current creds.
    pub async fn creds(&self) -> AuthenticationCreds {
        self.creds.read().await.clone()
    }

    /// Connect: WebSocket, Noise handshake with the login payload, then
    /// the receive and keepalive loops.
    pub async fn connect(&self) -> crate::Result<()> {
        let (noise_static, routing, payload) = {
            let creds = self.creds.read().await;
            let payload = proto::LoginPayload {
                passive: Some(false),
                username: creds.me.as_ref().and_then(|j| j.user.parse().ok()),
                device: creds.me.as_ref().map(|j| j.device as u32),
                version: Some(format!(
                    "{}.{}.{}",
                    self.config.version.0, self.config.version.1, self.config.version.2
                )),
                registration_id: Some(creds.registration_id as u32),
            };
            (
                creds.noise_key.private,
                creds.routing_info.clone(),
                payload.encode_to_vec(),
            )
        };
        self.bus.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionStatus::Connecting),
            ..Default::default()
        }));
        let (noise_tx, noise_rx) = crate::socket::connect_noise(
            &self.config.ws_url,
            &noise_static,
            routing.as_deref(),
            &payload,
        )
        .await?;
        *self.wire.transport.write().await = Some(Arc::new(noise_tx));
        let this = self.weak.upgrade().ok_or(Error::NotConnected)?;
        tokio::spawn(Self::recv_loop(this.clone(), noise_rx));
        tokio::spawn(Self::keepalive_loop(this));
        self.bus.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionStatus::Open),
            ..Default::default()
        }));
        Ok(())
    }

    async fn recv_loop(client: Arc<Self>, rx: crate::socket::NoiseRecv) {
        loop {
            match rx.next_decrypted_frame().await {
                Ok(frame) => {
                    if let Err(e) = client.handle_frame(&frame).await {
                        tracing::warn!(error = %e, "failed to handle inbound frame");
                    }
                }
                Err(e) => {
                    tracing::info!(error = %e, "connection closed");
                    client.handle_disconnect(&e).await;
                    return;
                }
            }
        }
    }

    async fn keepalive_loop(client: Arc<Self>) {
        let mut failures = 0u32;
        let mut ticker = tokio::time::interval(client.config.keepalive_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if client.wire.transport.read().await.is_none() {
                return;
            }
            let ping = Node::new("iq")
                .with_attr("type", "get")
                .with_attr("xmlns", "w:p")
                .with_attr("to", Jid::default_server().to_string())
                .with_children(vec![Node::new("ping")]);
            match client.wire.query(ping).await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(failures, error = %e, "keepalive failed");
                    if failures >= 3 {
                        client
                            .handle_disconnect(&Error::Connection(
                                crate::error::ConnectionError::Closed,
                            ))
                            .await;
                        return;
                    }
                }
            }
        }
    }

    async fn handle_disconnect(&self, error: &Error) {
        *self.wire.transport.write().await = None;
        self.wire.pending.fail_all();
        let reason = match error {
            Error::Connection(crate::error::ConnectionError::ConnectFailure(r)) => Some(*r),
            Error::Connection(crate::error::ConnectionError::DecryptFailure) => {
                Some(DisconnectReason::Generic)
            }
            _ => None,
        };
        self.bus.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionStatus::Close),
            last_disconnect: reason,
            ..Default::default()
        }));
    }

    /// Graceful close; `logout` also drops the session state.
    pub async fn disconnect(&self, logout: bool) -> crate::Result<()> {
        if let Some(transport) = self.wire.transport.write().await.take() {
            let _ = transport.close().await;
        }
        self.wire.pending.fail_all();
        if logout {
            {
                let mut creds = self.creds.write().await;
                creds.registered = false;
                creds.me = None;
                creds.lid = None;
            }
            self.store.clear().await?;
            self.emit_creds_update().await;
        }
        self.bus.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionStatus::Close),
            last_disconnect: logout.then_some(DisconnectReason::LoggedOut),
            ..Default::default()
        }));
        Ok(())
    }

    /// One decoded node per frame; resolve pending queries first, then
    /// dispatch by tag.
    pub(crate) async fn handle_frame(&self, frame: &[u8]) -> crate::Result<()> {
        let node = Node::unmarshal(frame)?;
        tracing::debug!(tag = %node.tag, "recv node");
        match route_node(&node) {
            InboundRoute::IqResponse => {
                if is_server_ping(&node) {
                    return self.send_pong(&node).await;
                }
                if let Some(unclaimed) = self.wire.pending.resolve(node) {
                    tracing::debug!(id = ?unclaimed.attr("id"), "iq with no pending waiter");
                }
                Ok(())
            }
            InboundRoute::Message => self.handle_message(node).await,
            InboundRoute::Receipt => self.handle_receipt(node).await,
            InboundRoute::Presence | InboundRoute::Chatstate => {
                self.handle_presence(node);
                Ok(())
            }
            InboundRoute::Notification => self.handle_notification(&node).await,
            InboundRoute::Ack => {
                self.handle_ack(&node);
                Ok(())
            }
            InboundRoute::Call => {
                self.handle_call(node);
                Ok(())
            }
            InboundRoute::Ib => Ok(()),
            InboundRoute::StreamError => {
                self.handle_stream_error(&node).await;
                Ok(())
            }
            InboundRoute::Unknown => {
                tracing::warn!(tag = %node.tag, "unknown stanza tag");
                self.acknowledge(&node).await
            }
        }
    }

    /// Decrypt each `<enc>` child on the sender's serialization bucket,
    /// emit the upsert, and acknowledge with a delivery receipt. Failures
    /// trigger a capped retry receipt.
    async fn handle_message(&self, node: Node) -> crate::Result<()> {
        let Some(from) = node.attr("from").and_then(|f| f.parse::<Jid>().ok()) else {
            return Ok(());
        };
        if let Some(filter) = &self.config.should_ignore_jid {
            if filter(&from) {
                return Ok(());
            }
        }
        let Some(msg_id) = node.attr("id").map(str::to_string) else {
            return Ok(());
        };
        let timestamp = node
            .attr("t")
            .and_then(|t| t.parse().ok())
            .unwrap_or_else(unix_now);
        let participant = node.attr("participant").and_then(|p| p.parse::<Jid>().ok());
        let sender = participant.clone().unwrap_or_else(|| from.clone());

        let mut decrypted = Vec::new();
        let mut failed = false;
        for enc in node.get_children_by_tag("enc") {
            let Some(ciphertext) = enc.content_bytes() else {
                continue;
            };
            let typ = enc.attr("type").unwrap_or_default().to_string();
            match self
                .decrypt_enc(&from, &sender, typ, ciphertext.to_vec())
                .await
            {
                Ok(plaintext) => decrypted.push(plaintext),
                Err(e) => {
                    tracing::warn!(id = %msg_id, error = %e, "failed to decrypt message");
                    failed = true;
                }
            }
        }

        for plaintext in &decrypted {
            if let Ok(message) = proto::Message::decode(plaintext.as_slice()) {
                if let Some(gkdm) = &message.group_key_distribution_message {
                    if let (Some(group), Some(distribution)) = (
                        gkdm.group_jid.as_ref().and_then(|g| g.parse::<Jid>().ok()),
                        gkdm.distribution.as_ref(),
                    ) {
                        if let Err(e) = self
                            .repo
                            .process_sender_key_distribution(&group, &sender, distribution)
                            .await
                        {
                            tracing::warn!(error = %e, "failed to process sender key distribution");
                        }
                        continue;
                    }
                }
            }
            self.bus.emit(Event::MessagesUpsert(MessageUpsert {
                key_remote_jid: from.to_non_ad(),
                key_id: msg_id.clone(),
                from_me: false,
                timestamp,
                raw: plaintext.clone(),
            }));
        }

        if failed {
            self.send_retry_receipt(&from, participant.as_ref(), &msg_id)
                .await?;
        } else if !decrypted.is_empty() {
            let keys = [MessageRef {
                remote_jid: from.clone(),
                id: msg_id,
                participant,
            }];
            self.send_receipts(&keys, ReceiptType::Delivery).await?;
        }
        Ok(())
    }

    /// Serialize Signal decrypts per peer address through the job queue,
    /// each inside its own store transaction.
    async fn decrypt_enc(
        &self,
        chat: &Jid,
        sender: &Jid,
        typ: String,
        ciphertext: Vec<u8>,
    ) -> crate::Result<Vec<u8>> {
        let bucket = sender.to_signal_address();
        let repo = self.repo.clone();
        let store = self.store.clone();
        let chat = chat.clone();
        let sender = sender.clone();
        self.jobs
            .enqueue(&bucket, move || async move {
                store
                    .transaction(|| async {
                        match typ.as_str() {
                            "pkmsg" => {
                                repo.decrypt_message(&sender, EncType::Pkmsg, &ciphertext).await
                            }
                            "msg" => {
                                repo.decrypt_message(&sender, EncType::Msg, &ciphertext).await
                            }
                            "skmsg" => {
                                repo.decrypt_group_message(&chat, &sender, &ciphertext).await
                            }
                            other => Err(Error::Other(anyhow::anyhow!(
                                "unknown enc type {other}"
                            ))),
                        }
                    })
                    .await
            })
            .await
    }

    /// Decrypt-failure receipt, capped by the shared retry counter.
    async fn send_retry_receipt(
        &self,
        from: &Jid,
        participant: Option<&Jid>,
        msg_id: &str,
    ) -> crate::Result<()> {
        let count = self.retry_counters.increment(msg_id);
        if count > self.config.max_msg_retry_count {
            tracing::warn!(id = %msg_id, count, "retry cap reached, dropping message");
            return Ok(());
        }
        let registration_id = self.creds.read().await.registration_id;
        let mut receipt = Node::new("receipt")
            .with_attr("id", msg_id)
            .with_attr("to", from.to_string())
            .with_attr("type", "retry");
        if let Some(p) = participant {
            receipt = receipt.with_attr("participant", p.to_string());
        }
        receipt = receipt.with_children(vec![
            Node::new("retry")
                .with_attr("count", count.to_string())
                .with_attr("id", msg_id)
                .with_attr("t", unix_now().to_string())
                .with_attr("v", "1"),
            Node::new("registration")
                .with_content((registration_id as u32).to_be_bytes().to_vec()),
        ]);
        self.wire.send_node(&receipt).await
    }

    async fn handle_receipt(&self, node: Node) -> crate::Result<()> {
        let from = node.attr("from").and_then(|f| f.parse::<Jid>().ok());
        let id = node.attr("id").map(str::to_string);
        let receipt_type = node.attr("type").unwrap_or("delivery").to_string();
        if let (Some(from), Some(id)) = (from.clone(), id.clone()) {
            self.bus
                .emit(Event::MessageReceiptUpdate(vec![ReceiptUpdate {
                    key_remote_jid: from.to_non_ad(),
                    key_id: id,
                    receipt_type: receipt_type.clone(),
                    participant: node.attr("participant").and_then(|p| p.parse().ok()),
                    timestamp: node.attr("t").and_then(|t| t.parse().ok()).unwrap_or_else(unix_now),
                }]));
        }
        if receipt_type == "retry" {
            self.handle_retry_request(&node).await?;
        }
        self.acknowledge(&node).await
    }

    /// A peer failed to decrypt one of our messages: re-relay it to that
    /// device with a forced session re-assertion, replayed through the
    /// external `get_message` hook.
    async fn handle_retry_request(&self, node: &Node) -> crate::Result<()> {
        let Some(get_message) = &self.config.get_message else {
            return Ok(());
        };
        let (Some(from), Some(id)) = (
            node.attr("from").and_then(|f| f.parse::<Jid>().ok()),
            node.attr("id"),
        ) else {
            return Ok(());
        };
        let retry_count = self.retry_counters.increment(&format!("out:{id}"));
        if retry_count > self.config.max_msg_retry_count {
            tracing::warn!(%id, "peer retry cap reached, dropping");
            return Ok(());
        }
        let key = proto::MessageKey {
            remote_jid: Some(from.to_non_ad().to_string()),
            from_me: Some(true),
            id: Some(id.to_string()),
            participant: node.attr("participant").map(str::to_string),
        };
        let Some(message) = get_message(&key) else {
            tracing::warn!(%id, "no stored copy for retry request");
            return Ok(());
        };
        let target = node
            .attr("participant")
            .and_then(|p| p.parse::<Jid>().ok())
            .unwrap_or_else(|| from.clone());
        self.relay
            .relay_message(
                &from.to_non_ad(),
                &message,
                RelayOptions {
                    message_id: Some(id.to_string()),
                    participant: Some(target),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Server ack for a stanza we sent; message acks surface as a
    /// `messages.update` with server-ack status.
    fn handle_ack(&self, node: &Node) {
        if node.attr("class") != Some("message") {
            return;
        }
        let (Some(from), Some(id)) = (
            node.attr("from").and_then(|f| f.parse::<Jid>().ok()),
            node.attr("id"),
        ) else {
            return;
        };
        self.bus.emit(Event::MessagesUpdate(vec![MessageUpdate {
            key_remote_jid: from.to_non_ad(),
            key_id: id.to_string(),
            status: MessageStatus::ServerAck,
        }]));
    }

    async fn handle_notification(&self, node: &Node) -> crate::Result<()> {
        if let Some(from) = node.attr("from").and_then(|f| f.parse::<Jid>().ok()) {
            match node.attr("type") {
                Some("w:gp2") => {
                    self.bus.emit(Event::GroupsUpdate(vec![from.to_non_ad()]));
                }
                Some("contacts") => {
                    self.bus.emit(Event::ContactsUpdate(vec![from.to_non_ad()]));
                }
                other => {
                    tracing::debug!(typ = ?other, "unhandled notification");
                }
            }
        }
        self.acknowledge(node).await
    }

    fn handle_presence(&self, node: Node) {
        let Some(from) = node.attr("from").and_then(|f| f.parse::<Jid>().ok()) else {
            return;
        };
        let available = node.attr("type") != Some("unavailable");
        self.bus.emit(Event::PresenceUpdate(PresenceUpdate {
            jid: from,
            available,
        }));
    }

    fn handle_call(&self, node: Node) {
        let Some(from) = node.attr("from").and_then(|f| f.parse::<Jid>().ok()) else {
            return;
        };
        let status = node
            .get_children()
            .first()
            .map(|c| c.tag.clone())
            .unwrap_or_else(|| "unknown".into());
        let call_id = node
            .get_children()
            .first()
            .and_then(|c| c.attr("call-id"))
            .unwrap_or_default()
            .to_string();
        self.bus.emit(Event::Call(CallEvent {
            from,
            call_id,
            status,
        }));
    }

    async fn handle_stream_error(&self, node: &Node) {
        let code = node
            .attr("code")
            .or_else(|| {
                node.get_children()
                    .first()
                    .and_then(|c| c.attr("code"))
            })
            .and_then(|c| c.parse().ok())
            .unwrap_or(500);
        let reason = DisconnectReason::from_code(code).unwrap_or(DisconnectReason::Generic);
        tracing::error!(code, "stream errored");
        *self.wire.transport.write().await = None;
        self.wire.pending.fail_all();
        self.bus.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: Some(ConnectionStatus::Close),
            last_disconnect: Some(reason),
            ..Default::default()
        }));
    }

    /// Ack an inbound stanza that carries an id and sender.
    async fn acknowledge(&self, node: &Node) -> crate::Result<()> {
        let (Some(id), Some(from)) = (node.attr("id"), node.attr("from")) else {
            return Ok(());
        };
        let mut ack = Node::new("ack")
            .with_attr("class", node.tag.clone())
            .with_attr("id", id)
            .with_attr("to", from);
        if let Some(typ) = node.attr("type") {
            ack = ack.with_attr("type", typ);
        }
        self.wire.send_node(&ack).await
    }

    async fn send_pong(&self, ping: &Node) -> crate::Result<()> {
        let Some(id) = ping.attr("id") else {
            return Ok(());
        };
        let mut pong = Node::new("iq")
            .with_attr("id", id)
            .with_attr("type", "result");
        if let Some(from) = ping.attr("from") {
            pong = pong.with_attr("to", from);
        }
        self.wire.send_node(&pong).await
    }

    /// Device-list lookup with the 5-minute cache; `use_cache = false`
    /// bypasses and refreshes.
    pub async fn get_usync_devices(
        &self,
        jids: &[Jid],
        use_cache: bool,
        ignore_zero: bool,
    ) -> crate::Result<Vec<Jid>> {
        self.resolver.get_devices(jids, use_cache, ignore_zero).await
    }

    /// Issue and upload a fresh pre-key batch: one store write batch for
    /// the keys, one registration IQ, then the creds id advance.
    pub async fn upload_pre_keys(&self, count: u32) -> crate::Result<()> {
        let batch = {
            let creds = self.creds.read().await;
            generate_or_get_pre_keys(&creds, count)
        };
        let mut writes = KeyBatch::new();
        let space = writes.entry(KeyType::PreKey).or_default();
        for key in &batch.new_pre_keys {
            let raw = serde_json::to_vec(key)
                .map_err(|e| crate::error::StoreError::Save(e.to_string()))?;
            space.insert(key.id.to_string(), Some(Bytes::from(raw)));
        }
        self.store.set(writes).await?;

        let node = {
            let creds = self.creds.read().await;
            build_pre_key_upload_node(&creds, &batch)
        };
        self.wire.query(node).await?;

        {
            let mut creds = self.creds.write().await;
            creds.next_pre_key_id = batch.next_pre_key_id;
            creds.first_unuploaded_pre_key_id = batch.first_unuploaded_pre_key_id;
        }
        self.emit_creds_update().await;
        Ok(())
    }

    /// Media host list, cached until its TTL lapses; `force` refreshes.
    pub async fn refresh_media_conn(&self, force: bool) -> crate::Result<MediaConnInfo> {
        if !force {
            if let Some(info) = self.media.get_fresh() {
                return Ok(info);
            }
        }
        let resp = self.wire.query(build_media_conn_iq()).await?;
        let info = parse_media_conn(&resp)?;
        self.media.store(info.clone());
        Ok(info)
    }

    /// Finish pairing: verify the server device identity against the adv
    /// secret, countersign it, and persist the resulting account state.
    pub async fn complete_pairing(
        &self,
        device_identity_with_tag: &[u8],
        me: Jid,
        lid: Jid,
    ) -> crate::Result<()> {
        let signed = {
            let creds = self.creds.read().await;
            let verified = crate::pairing::verify_device_identity(&creds, device_identity_with_tag)?;
            crate::pairing::sign_device_identity(&creds, &verified.payload)?
        };
        {
            let mut creds = self.creds.write().await;
            creds.account = Some(signed);
            creds.me = Some(me);
            creds.lid = Some(lid);
            creds.registered = true;
        }
        self.emit_creds_update().await;
        self.bus.emit(Event::ConnectionUpdate(ConnectionUpdate {
            connection: None,
            is_new_login: true,
            ..Default::default()
        }));
        Ok(())
    }

    async fn emit_creds_update(&self) {
        let creds = self.creds.read().await.clone();
        self.bus.emit(Event::CredsUpdate(Box::new(creds)));
    }

    #[cfg(test)]
    pub(crate) async fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.wire.transport.write().await = Some(transport);
    }

    #[cfg(test)]
    pub(crate) fn seed_device_cache(&self, devices: &[crate::usync::UserDevice]) {
        self.resolver.cache.store(devices);
    }

    #[cfg(test)]
    pub(crate) async fn set_creds<F: FnOnce(&mut AuthenticationCreds)>(&self, f: F) {
        f(&mut *self.creds.write().await);
    }
}

fn is_server_ping(node: &Node) -> bool {
    node.attr("type") == Some("get")
        && (node.attr("xmlns") == Some("urn:xmpp:ping")
            || node.get_child_by_tag("ping").is_some())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Reconnect policy for the external orchestrator: re-enter the startup
/// routine on close unless the disconnect means we were logged out.
pub fn should_reconnect(update: &ConnectionUpdate) -> bool {
    update.connection == Some(ConnectionStatus::Close)
        && update
            .last_disconnect
            .is_none_or(|reason| !reason.is_logged_out())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{init_auth_creds, MemoryKeyStore};
    use std::sync::Mutex;

    /// Transport that captures every marshaled stanza.
    #[derive(Default)]
    struct CaptureTransport {
        sent: Mutex<Vec<Node>>,
    }

    #[async_trait]
    impl Transport for CaptureTransport {
        async fn send(&self, data: &[u8]) -> crate::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(Node::unmarshal(data).expect("sent frames are valid"));
            Ok(())
        }
        async fn close(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    async fn client_with_transport() -> (Arc<Client>, Arc<CaptureTransport>) {
        let mut creds = init_auth_creds();
        creds.me = Some(Jid::device_jid("15550009999", 7));
        let client = Client::new(
            creds,
            Arc::new(MemoryKeyStore::new()),
            SocketConfig::default(),
        );
        let transport = Arc::new(CaptureTransport::default());
        client.set_transport(transport.clone()).await;
        (client, transport)
    }

    fn sent(transport: &CaptureTransport) -> Vec<Node> {
        transport.sent.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn server_ping_gets_pong() {
        let (client, transport) = client_with_transport().await;
        let ping = Node::new("iq")
            .with_attr("id", "ping1")
            .with_attr("type", "get")
            .with_attr("from", "s.whatsapp.net")
            .with_attr("xmlns", "urn:xmpp:ping")
            .with_children(vec![Node::new("ping")]);
        client.handle_frame(&ping.marshal().unwrap()).await.unwrap();
        let nodes = sent(&transport);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].tag, "iq");
        assert_eq!(nodes[0].attr("id"), Some("ping1"));
        assert_eq!(nodes[0].attr("type"), Some("result"));
    }

    #[tokio::test]
    async fn unknown_tag_is_acknowledged() {
        let (client, transport) = client_with_transport().await;
        let stanza = Node::new("mystery")
            .with_attr("id", "m1")
            .with_attr("from", "14155550000@s.whatsapp.net");
        client.handle_frame(&stanza.marshal().unwrap()).await.unwrap();
        let nodes = sent(&transport);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].tag, "ack");
        assert_eq!(nodes[0].attr("class"), Some("mystery"));
        assert_eq!(nodes[0].attr("id"), Some("m1"));
    }

    #[tokio::test]
    async fn receipt_emits_update_and_ack() {
        let (client, transport) = client_with_transport().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        client.events().process(move |map| {
            if let Some(events) = map.get("message-receipt.update") {
                seen2.lock().unwrap().push(events.len());
            }
        });
        let receipt = Node::new("receipt")
            .with_attr("id", "3EB0AA")
            .with_attr("from", "14155550000@s.whatsapp.net")
            .with_attr("type", "read");
        client.handle_frame(&receipt.marshal().unwrap()).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(sent(&transport)[0].tag, "ack");
    }

    #[tokio::test]
    async fn stream_error_maps_reason_and_closes() {
        let (client, _transport) = client_with_transport().await;
        let updates = Arc::new(Mutex::new(Vec::new()));
        let updates2 = updates.clone();
        client.events().process(move |map| {
            if let Some(events) = map.get("connection.update") {
                for e in events {
                    if let Event::ConnectionUpdate(u) = e {
                        updates2.lock().unwrap().push(u.clone());
                    }
                }
            }
        });
        let err = Node::new("stream:error").with_attr("code", "401");
        client.handle_frame(&err.marshal().unwrap()).await.unwrap();
        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].connection, Some(ConnectionStatus::Close));
        assert_eq!(updates[0].last_disconnect, Some(DisconnectReason::LoggedOut));
        assert!(!should_reconnect(&updates[0]));
    }

    #[tokio::test]
    async fn reconnect_policy_follows_reason() {
        let close_banned = ConnectionUpdate {
            connection: Some(ConnectionStatus::Close),
            last_disconnect: Some(DisconnectReason::TempBanned),
            ..Default::default()
        };
        assert!(should_reconnect(&close_banned));
        let close_logged_out = ConnectionUpdate {
            connection: Some(ConnectionStatus::Close),
            last_disconnect: Some(DisconnectReason::LoggedOut),
            ..Default::default()
        };
        assert!(!should_reconnect(&close_logged_out));
        let close_unknown = ConnectionUpdate {
            connection: Some(ConnectionStatus::Close),
            ..Default::default()
        };
        assert!(should_reconnect(&close_unknown));
        let open = ConnectionUpdate {
            connection: Some(ConnectionStatus::Open),
            ..Default::default()
        };
        assert!(!should_reconnect(&open));
    }

    #[tokio::test]
    async fn undecryptable_message_triggers_capped_retry() {
        let (client, transport) = client_with_transport().await;
        let message = Node::new("message")
            .with_attr("id", "3EB0BAD")
            .with_attr("from", "14155550000@s.whatsapp.net")
            .with_attr("t", "1700000000")
            .with_children(vec![Node::new("enc")
                .with_attr("v", "2")
                .with_attr("type", "msg")
                .with_content(vec![1, 2, 3, 4])]);
        let frame = message.marshal().unwrap();

        // cap is 5: six deliveries produce exactly five retry receipts
        for _ in 0..6 {
            client.handle_frame(&frame).await.unwrap();
        }
        let retries: Vec<Node> = sent(&transport)
            .into_iter()
            .filter(|n| n.tag == "receipt" && n.attr("type") == Some("retry"))
            .collect();
        assert_eq!(retries.len(), 5);
        assert_eq!(retries[0].attr("id"), Some("3EB0BAD"));
        let retry_child = retries[0].get_child_by_tag("retry").unwrap();
        assert_eq!(retry_child.attr("count"), Some("1"));
        assert!(retries[0].get_child_by_tag("registration").is_some());
    }

    #[tokio::test]
    async fn media_conn_query_roundtrip_and_cache() {
        let (client, transport) = client_with_transport().await;
        let task_client = client.clone();
        let handle = tokio::spawn(async move { task_client.refresh_media_conn(false).await });

        // wait for the outbound iq, then feed the response back
        let query = loop {
            tokio::task::yield_now().await;
            let nodes = sent(&transport);
            if let Some(node) = nodes.iter().find(|n| n.tag == "iq") {
                break node.clone();
            }
        };
        assert_eq!(query.attr("xmlns"), Some("w:m"));
        let response = Node::new("iq")
            .with_attr("id", query.attr("id").unwrap())
            .with_attr("type", "result")
            .with_children(vec![Node::new("media_conn")
                .with_attr("auth", "tok")
                .with_attr("ttl", "300")
                .with_children(vec![
                    Node::new("host").with_attr("hostname", "mmg.whatsapp.net")
                ])]);
        client.handle_frame(&response.marshal().unwrap()).await.unwrap();

        let info = handle.await.unwrap().unwrap();
        assert_eq!(info.auth, "tok");
        // second call is served from cache without a new query
        let before = sent(&transport).len();
        let cached = client.refresh_media_conn(false).await.unwrap();
        assert_eq!(cached.auth, "tok");
        assert_eq!(sent(&transport).len(), before);
    }

    #[tokio::test]
    async fn send_receipts_with_no_keys_is_noop() {
        let (client, transport) = client_with_transport().await;
        client.send_receipts(&[], ReceiptType::Read).await.unwrap();
        assert!(sent(&transport).is_empty());
    }

    #[tokio::test]
    async fn message_without_enc_children_is_ignored() {
        let (client, transport) = client_with_transport().await;
        let message = Node::new("message")
            .with_attr("id", "3EB0EMPTY")
            .with_attr("from", "14155550000@s.whatsapp.net");
        client.handle_frame(&message.marshal().unwrap()).await.unwrap();
        assert!(sent(&transport).is_empty());
    }

    #[tokio::test]
    async fn usync_merges_cached_and_fetched_devices() {
        use crate::usync::UserDevice;

        let (client, transport) = client_with_transport().await;
        client.seed_device_cache(&[UserDevice {
            user: "14155550000".into(),
            device: 0,
        }]);

        let task = client.clone();
        let handle = tokio::spawn(async move {
            task.get_usync_devices(
                &[
                    "14155550000@s.whatsapp.net".parse().unwrap(),
                    "14155550001@s.whatsapp.net".parse().unwrap(),
                ],
                true,
                false,
            )
            .await
        });

        let query = loop {
            tokio::task::yield_now().await;
            let nodes = sent(&transport);
            if let Some(node) = nodes.iter().find(|n| n.tag == "iq") {
                break node.clone();
            }
        };
        assert_eq!(query.attr("xmlns"), Some("usync"));
        let queried: Vec<String> = query
            .get_child_by_tag("usync")
            .unwrap()
            .get_child_by_tag("list")
            .unwrap()
            .get_children_by_tag("user")
            .filter_map(|u| u.attr("jid"))
            .map(str::to_string)
            .collect();
        assert_eq!(queried, ["14155550001@s.whatsapp.net"]);

        let response = Node::new("iq")
            .with_attr("id", query.attr("id").unwrap())
            .with_attr("type", "result")
            .with_children(vec![Node::new("usync").with_children(vec![Node::new(
                "list",
            )
            .with_children(vec![Node::new("user")
                .with_attr("jid", "14155550001@s.whatsapp.net")
                .with_children(vec![Node::new("devices").with_children(vec![
                    Node::new("device-list").with_children(vec![
                        Node::new("device").with_attr("id", "0"),
                    ]),
                ])])])])]);
        client.handle_frame(&response.marshal().unwrap()).await.unwrap();

        let devices = handle.await.unwrap().unwrap();
        let strings: Vec<String> = devices.iter().map(ToString::to_string).collect();
        assert!(strings.contains(&"14155550000@s.whatsapp.net".to_string()));
        assert!(strings.contains(&"14155550001@s.whatsapp.net".to_string()));
        // exactly one outbound usync query
        let iq_count = sent(&transport).iter().filter(|n| n.tag == "iq").count();
        assert_eq!(iq_count, 1);
    }

    #[tokio::test]
    async fn prekey_upload_advances_ids_in_one_write_batch() {
        use crate::store::KeyBatch;
        use std::collections::HashMap as StdHashMap;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingBacking {
            inner: MemoryKeyStore,
            sets: AtomicUsize,
        }

        #[async_trait]
        impl SignalKeyStore for CountingBacking {
            async fn get(
                &self,
                typ: KeyType,
                ids: &[String],
            ) -> crate::Result<StdHashMap<String, Bytes>> {
                self.inner.get(typ, ids).await
            }
            async fn set(&self, batch: KeyBatch) -> crate::Result<()> {
                self.sets.fetch_add(1, Ordering::SeqCst);
                self.inner.set(batch).await
            }
            async fn clear(&self) -> crate::Result<()> {
                self.inner.clear().await
            }
        }

        let mut creds = init_auth_creds();
        creds.me = Some(Jid::device_jid("15550009999", 7));
        creds.next_pre_key_id = 10;
        creds.first_unuploaded_pre_key_id = 10;
        let backing = Arc::new(CountingBacking {
            inner: MemoryKeyStore::new(),
            sets: AtomicUsize::new(0),
        });
        let client = Client::new(creds, backing.clone(), SocketConfig::default());
        let transport = Arc::new(CaptureTransport::default());
        client.set_transport(transport.clone()).await;

        let task = client.clone();
        let handle = tokio::spawn(async move { task.upload_pre_keys(5).await });

        let query = loop {
            tokio::task::yield_now().await;
            let nodes = sent(&transport);
            if let Some(node) = nodes.iter().find(|n| n.tag == "iq") {
                break node.clone();
            }
        };
        assert_eq!(query.attr("xmlns"), Some("encrypt"));
        let ids: Vec<u32> = query
            .get_child_by_tag("list")
            .unwrap()
            .get_children_by_tag("key")
            .map(|k| {
                let raw = k
                    .get_child_by_tag("id")
                    .unwrap()
                    .content_bytes()
                    .unwrap();
                u32::from_be_bytes([0, raw[0], raw[1], raw[2]])
            })
            .collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14]);

        let response = Node::new("iq")
            .with_attr("id", query.attr("id").unwrap())
            .with_attr("type", "result");
        client.handle_frame(&response.marshal().unwrap()).await.unwrap();
        handle.await.unwrap().unwrap();

        let creds = client.creds().await;
        assert_eq!(creds.next_pre_key_id, 15);
        assert_eq!(creds.first_unuploaded_pre_key_id, 15);
        // the five keys landed in exactly one backing write batch
        assert_eq!(backing.sets.load(Ordering::SeqCst), 1);
        assert_eq!(backing.inner.count(KeyType::PreKey), 5);
    }

    #[tokio::test]
    async fn ignored_jids_are_dropped_before_decryption() {
        let mut creds = init_auth_creds();
        creds.me = Some(Jid::device_jid("15550009999", 7));
        let config = SocketConfig {
            should_ignore_jid: Some(Arc::new(|jid: &Jid| jid.user == "14155550000")),
            ..Default::default()
        };
        let client = Client::new(creds, Arc::new(MemoryKeyStore::new()), config);
        let transport = Arc::new(CaptureTransport::default());
        client.set_transport(transport.clone()).await;

        let message = Node::new("message")
            .with_attr("id", "3EB0IGNORED")
            .with_attr("from", "14155550000@s.whatsapp.net")
            .with_children(vec![Node::new("enc")
                .with_attr("type", "msg")
                .with_content(vec![1, 2, 3])]);
        client.handle_frame(&message.marshal().unwrap()).await.unwrap();
        // no retry receipt, no delivery receipt
        assert!(sent(&transport).is_empty());
    }
}
