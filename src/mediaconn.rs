//! Media connection info: upload/download host list with an auth token,
//! fetched over `iq w:m media_conn` and cached until its TTL lapses.

use crate::binary::Node;
use crate::error::BinaryError;
use crate::types::Jid;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaHost {
    pub hostname: String,
    pub max_content_length_bytes: u64,
}

#[derive(Clone, Debug)]
pub struct MediaConnInfo {
    pub hosts: Vec<MediaHost>,
    pub auth: String,
    pub ttl: Duration,
    pub fetched_at: Instant,
}

impl MediaConnInfo {
    pub fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() > self.ttl
    }
}

/// Cached media connection, refreshed on expiry or on demand.
#[derive(Default)]
pub struct MediaConnCache {
    slot: Mutex<Option<MediaConnInfo>>,
}

impl MediaConnCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached info when still fresh; `None` means a refresh is due.
    pub fn get_fresh(&self) -> Option<MediaConnInfo> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|info| !info.is_stale())
            .cloned()
    }

    pub fn store(&self, info: MediaConnInfo) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(info);
    }

    pub fn invalidate(&self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Build the `iq set xmlns=w:m` media_conn request.
pub fn build_media_conn_iq() -> Node {
    Node::new("iq")
        .with_attr("type", "set")
        .with_attr("xmlns", "w:m")
        .with_attr("to", Jid::default_server().to_string())
        .with_children(vec![Node::new("media_conn")])
}

/// Parse the media_conn response into hosts, auth token and TTL.
pub fn parse_media_conn(resp: &Node) -> Result<MediaConnInfo, BinaryError> {
    let conn = resp
        .get_child_by_tag("media_conn")
        .ok_or_else(|| BinaryError::MalformedFrame("response without media_conn".into()))?;
    let auth = conn
        .attr("auth")
        .ok_or_else(|| BinaryError::MalformedFrame("media_conn without auth".into()))?
        .to_string();
    let ttl = conn
        .attr("ttl")
        .and_then(|t| t.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(300));
    let hosts = conn
        .get_children_by_tag("host")
        .filter_map(|h| {
            Some(MediaHost {
                hostname: h.attr("hostname")?.to_string(),
                max_content_length_bytes: h
                    .attr("maxContentLengthBytes")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            })
        })
        .collect::<Vec<_>>();
    if hosts.is_empty() {
        return Err(BinaryError::MalformedFrame("media_conn without hosts".into()));
    }
    Ok(MediaConnInfo {
        hosts,
        auth,
        ttl,
        fetched_at: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_conn_response(ttl: &str) -> Node {
        Node::new("iq").with_attr("type", "result").with_children(vec![
            Node::new("media_conn")
                .with_attr("auth", "token123")
                .with_attr("ttl", ttl)
                .with_children(vec![
                    Node::new("host")
                        .with_attr("hostname", "mmg.whatsapp.net")
                        .with_attr("maxContentLengthBytes", "104857600"),
                    Node::new("host").with_attr("hostname", "mmg-fallback.whatsapp.net"),
                ]),
        ])
    }

    #[test]
    fn parse_extracts_hosts_auth_ttl() {
        let info = parse_media_conn(&media_conn_response("300")).unwrap();
        assert_eq!(info.auth, "token123");
        assert_eq!(info.ttl, Duration::from_secs(300));
        assert_eq!(info.hosts.len(), 2);
        assert_eq!(info.hosts[0].hostname, "mmg.whatsapp.net");
        assert_eq!(info.hosts[0].max_content_length_bytes, 104_857_600);
        assert!(!info.is_stale());
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(parse_media_conn(&Node::new("iq")).is_err());
        let no_hosts = Node::new("iq").with_children(vec![
            Node::new("media_conn").with_attr("auth", "t").with_attr("ttl", "10"),
        ]);
        assert!(parse_media_conn(&no_hosts).is_err());
    }

    #[test]
    fn cache_serves_fresh_and_expires() {
        let cache = MediaConnCache::new();
        assert!(cache.get_fresh().is_none());

        let mut info = parse_media_conn(&media_conn_response("300")).unwrap();
        cache.store(info.clone());
        assert!(cache.get_fresh().is_some());

        info.ttl = Duration::from_secs(0);
        info.fetched_at = Instant::now() - Duration::from_secs(1);
        cache.store(info);
        assert!(cache.get_fresh().is_none());
    }

    #[test]
    fn invalidate_forces_refresh() {
        let cache = MediaConnCache::new();
        cache.store(parse_media_conn(&media_conn_response("300")).unwrap());
        cache.invalidate();
        assert!(cache.get_fresh().is_none());
    }
}
