//! Request/response correlation and inbound stanza routing.
//!
//! Outbound IQs are correlated by the stanza `id` attribute: a waiter is
//! registered before the stanza is written, and the first inbound node
//! with a matching id completes it. Connection close fails every pending
//! waiter. The dispatcher classifies the remaining inbound stanzas by
//! tag for the client's handlers.

use crate::binary::Node;
use crate::error::{ConnectionError, Error};
use crate::types::generate_request_id;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Default wait for a response stanza.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Where an inbound stanza should be routed, by root tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundRoute {
    Message,
    Receipt,
    Presence,
    Notification,
    IqResponse,
    Ack,
    Call,
    Chatstate,
    Ib,
    StreamError,
    Unknown,
}

/// Classify an inbound stanza by its root tag.
pub fn route_node(node: &Node) -> InboundRoute {
    match node.tag.as_str() {
        "message" => InboundRoute::Message,
        "receipt" => InboundRoute::Receipt,
        "presence" => InboundRoute::Presence,
        "chatstate" => InboundRoute::Chatstate,
        "notification" => InboundRoute::Notification,
        "iq" => InboundRoute::IqResponse,
        "ack" => InboundRoute::Ack,
        "call" => InboundRoute::Call,
        "ib" => InboundRoute::Ib,
        "stream:error" => InboundRoute::StreamError,
        _ => InboundRoute::Unknown,
    }
}

/// Raise `ServerError` if the node carries an `<error code=…/>` child or
/// is itself an error-typed iq.
pub fn assert_node_error_free(node: &Node) -> crate::Result<()> {
    let error_child = node.get_child_by_tag("error");
    if node.attr("type") != Some("error") && error_child.is_none() {
        return Ok(());
    }
    let (code, text) = match error_child {
        Some(err) => (
            err.attr("code").and_then(|c| c.parse().ok()).unwrap_or(500),
            err.attr("text").unwrap_or("unknown error").to_string(),
        ),
        None => (500, "unknown error".to_string()),
    };
    Err(Error::Server { code, text })
}

/// Table of pending request waiters keyed by stanza id.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<Node>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the given stanza id. Returns the receiving
    /// half; a later waiter for the same id replaces the earlier one.
    pub fn register(&self, id: &str) -> oneshot::Receiver<Node> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, id: &str) {
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Complete the waiter matching the stanza's id, if any. Returns
    /// whether the node was consumed by a waiter.
    pub fn resolve(&self, node: Node) -> Option<Node> {
        let Some(id) = node.attr("id") else {
            return Some(node);
        };
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match waiter {
            Some(tx) => {
                // receiver may have timed out already; nothing to do then
                let _ = tx.send(node);
                None
            }
            None => Some(node),
        }
    }

    /// Fail every pending waiter (connection closed). Dropping the
    /// senders wakes each receiver with a channel error.
    pub fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending requests on close");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Await a registered waiter with a timeout. Expiry yields `Timeout`;
    /// a dropped sender (connection close) yields `ConnectionClosed`.
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<Node>,
        timeout: Duration,
    ) -> crate::Result<Node> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(node)) => {
                assert_node_error_free(&node)?;
                Ok(node)
            }
            Ok(Err(_)) => Err(Error::Connection(ConnectionError::Closed)),
            Err(_) => {
                self.unregister(id);
                Err(Error::Timeout)
            }
        }
    }
}

/// Allocate a stanza id when the caller did not provide one.
pub fn ensure_stanza_id(node: &mut Node) -> String {
    match node.attr("id") {
        Some(id) => id.to_string(),
        None => {
            let id = generate_request_id();
            node.attrs.insert("id".into(), id.clone());
            id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_known_tags() {
        for (tag, route) in [
            ("message", InboundRoute::Message),
            ("receipt", InboundRoute::Receipt),
            ("presence", InboundRoute::Presence),
            ("chatstate", InboundRoute::Chatstate),
            ("notification", InboundRoute::Notification),
            ("iq", InboundRoute::IqResponse),
            ("ack", InboundRoute::Ack),
            ("call", InboundRoute::Call),
            ("ib", InboundRoute::Ib),
            ("stream:error", InboundRoute::StreamError),
            ("whatever", InboundRoute::Unknown),
        ] {
            assert_eq!(route_node(&Node::new(tag)), route, "tag {tag}");
        }
    }

    #[test]
    fn error_nodes_raise_server_error() {
        let ok = Node::new("iq").with_attr("type", "result");
        assert!(assert_node_error_free(&ok).is_ok());

        let err = Node::new("iq").with_attr("type", "error").with_children(vec![
            Node::new("error")
                .with_attr("code", "404")
                .with_attr("text", "item-not-found"),
        ]);
        match assert_node_error_free(&err) {
            Err(Error::Server { code, text }) => {
                assert_eq!(code, 404);
                assert_eq!(text, "item-not-found");
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn ensure_stanza_id_allocates_when_missing() {
        let mut node = Node::new("iq");
        let id = ensure_stanza_id(&mut node);
        assert_eq!(node.attr("id"), Some(id.as_str()));
        let mut node = Node::new("iq").with_attr("id", "fixed");
        assert_eq!(ensure_stanza_id(&mut node), "fixed");
    }

    #[tokio::test]
    async fn waiter_completes_on_matching_id() {
        let pending = PendingRequests::new();
        let rx = pending.register("abc");
        let response = Node::new("iq").with_attr("id", "abc").with_attr("type", "result");
        assert!(pending.resolve(response).is_none());
        let node = pending.wait("abc", rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(node.attr("id"), Some("abc"));
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn unmatched_node_is_returned_to_caller() {
        let pending = PendingRequests::new();
        let node = Node::new("iq").with_attr("id", "nobody-waiting");
        assert!(pending.resolve(node).is_some());
    }

    #[tokio::test]
    async fn timeout_fails_locally_and_unregisters() {
        let pending = PendingRequests::new();
        let rx = pending.register("slow");
        let err = pending
            .wait("slow", rx, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn close_fails_all_pending() {
        let pending = PendingRequests::new();
        let rx = pending.register("a");
        pending.fail_all();
        let err = pending.wait("a", rx, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn error_response_fails_the_wait() {
        let pending = PendingRequests::new();
        let rx = pending.register("q1");
        let response = Node::new("iq")
            .with_attr("id", "q1")
            .with_attr("type", "error")
            .with_children(vec![Node::new("error").with_attr("code", "401")]);
        pending.resolve(response);
        let err = pending.wait("q1", rx, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Server { code: 401, .. }));
    }
}
