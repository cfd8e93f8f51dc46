//! USync device discovery and the per-user device cache.
//!
//! Given a set of users, the server returns their current device lists.
//! Results are cached per bare user with a TTL; a call with
//! `use_cache = false` bypasses the cache and refreshes it.

use crate::binary::Node;
use crate::error::BinaryError;
use crate::types::{generate_request_id, Jid, DEFAULT_USER_SERVER};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Device list entry for one user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserDevice {
    pub user: String,
    pub device: u16,
}

impl UserDevice {
    pub fn to_jid(&self) -> Jid {
        Jid::device_jid(self.user.clone(), self.device)
    }
}

/// Default device-list lifetime.
pub const DEVICE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    devices: Vec<UserDevice>,
    fetched: Instant,
}

/// Per-user device cache.
pub struct DeviceCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl Default for DeviceCache {
    fn default() -> Self {
        Self::new(DEVICE_CACHE_TTL)
    }
}

impl DeviceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Uniqueify the input by bare user and split into cached hits and
    /// users that need a usync query. `use_cache = false` sends every
    /// user to the fetch list.
    pub fn split(&self, jids: &[Jid], use_cache: bool) -> (Vec<UserDevice>, Vec<Jid>) {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut seen = std::collections::HashSet::new();
        let mut cached = Vec::new();
        let mut to_fetch = Vec::new();
        for jid in jids {
            let bare = jid.to_non_ad();
            if !seen.insert(bare.user.clone()) {
                continue;
            }
            match entries.get(&bare.user) {
                Some(entry) if use_cache && entry.fetched.elapsed() < self.ttl => {
                    cached.extend(entry.devices.iter().cloned());
                }
                _ => to_fetch.push(bare),
            }
        }
        (cached, to_fetch)
    }

    /// Store freshly fetched device lists, replacing stale entries.
    pub fn store(&self, devices: &[UserDevice]) {
        let mut by_user: HashMap<String, Vec<UserDevice>> = HashMap::new();
        for d in devices {
            by_user.entry(d.user.clone()).or_default().push(d.clone());
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (user, devices) in by_user {
            entries.insert(
                user,
                CacheEntry {
                    devices,
                    fetched: Instant::now(),
                },
            );
        }
    }

    /// Record that a user's query returned no usable devices, so repeat
    /// sends within the TTL do not re-query.
    pub fn store_empty(&self, users: &[Jid]) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for user in users {
            entries.entry(user.user.clone()).or_insert(CacheEntry {
                devices: Vec::new(),
                fetched: Instant::now(),
            });
        }
    }
}

/// Build the `iq/usync` device query for the given users.
pub fn build_device_query(users: &[Jid]) -> Node {
    let user_nodes = users
        .iter()
        .map(|u| Node::new("user").with_attr("jid", u.to_non_ad().to_string()))
        .collect();
    let usync = Node::new("usync")
        .with_attr("sid", generate_request_id())
        .with_attr("mode", "query")
        .with_attr("last", "true")
        .with_attr("index", "0")
        .with_attr("context", "message")
        .with_children(vec![
            Node::new("query").with_children(vec![
                Node::new("devices").with_attr("version", "2"),
            ]),
            Node::new("list").with_children(user_nodes),
        ]);
    Node::new("iq")
        .with_attr("type", "get")
        .with_attr("xmlns", "usync")
        .with_attr("to", Jid::default_server().to_string())
        .with_children(vec![usync])
}

/// Extract `(user, device)` pairs from a usync response.
///
/// Filter rules: device 0 is dropped when `ignore_zero` is set, the
/// calling account's own device is always dropped, and a non-zero device
/// is retained only when its descriptor carries a non-empty `key-index`.
pub fn extract_device_jids(
    resp: &Node,
    my_jid: &Jid,
    ignore_zero: bool,
) -> Result<Vec<UserDevice>, BinaryError> {
    let usync = resp
        .get_child_by_tag("usync")
        .ok_or_else(|| BinaryError::MalformedFrame("usync response without usync node".into()))?;
    let list = usync
        .get_child_by_tag("list")
        .ok_or_else(|| BinaryError::MalformedFrame("usync response without list".into()))?;

    let mut out = Vec::new();
    for user_node in list.get_children_by_tag("user") {
        let Some(jid_attr) = user_node.attr("jid") else {
            continue;
        };
        let Ok(user_jid) = jid_attr.parse::<Jid>() else {
            continue;
        };
        let device_list = user_node
            .get_child_by_tag("devices")
            .and_then(|d| d.get_child_by_tag("device-list"));
        let Some(device_list) = device_list else {
            continue;
        };
        for device_node in device_list.get_children_by_tag("device") {
            let Some(device) = device_node.attr("id").and_then(|id| id.parse::<u16>().ok())
            else {
                continue;
            };
            if device == 0 && ignore_zero {
                continue;
            }
            if user_jid.user == my_jid.user && device == my_jid.device {
                continue;
            }
            if device != 0 && device_node.attr("key-index").is_none_or(str::is_empty) {
                continue;
            }
            out.push(UserDevice {
                user: user_jid.user.clone(),
                device,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_jid(user: &str) -> Jid {
        Jid::new(user, DEFAULT_USER_SERVER)
    }

    fn usync_response(users: &[(&str, &[(u16, Option<&str>)])]) -> Node {
        let user_nodes = users
            .iter()
            .map(|(user, devices)| {
                let device_nodes = devices
                    .iter()
                    .map(|(id, key_index)| {
                        let mut node = Node::new("device").with_attr("id", id.to_string());
                        if let Some(ki) = key_index {
                            node = node.with_attr("key-index", *ki);
                        }
                        node
                    })
                    .collect();
                Node::new("user")
                    .with_attr("jid", user_jid(user).to_string())
                    .with_children(vec![Node::new("devices").with_children(vec![
                        Node::new("device-list").with_children(device_nodes),
                    ])])
            })
            .collect();
        Node::new("iq").with_attr("type", "result").with_children(vec![
            Node::new("usync").with_children(vec![Node::new("list").with_children(user_nodes)]),
        ])
    }

    #[test]
    fn query_contains_only_uncached_users() {
        let cache = DeviceCache::default();
        cache.store(&[UserDevice {
            user: "14155550000".into(),
            device: 0,
        }]);
        let (cached, to_fetch) = cache.split(
            &[user_jid("14155550000"), user_jid("14155550001")],
            true,
        );
        assert_eq!(
            cached,
            vec![UserDevice {
                user: "14155550000".into(),
                device: 0
            }]
        );
        assert_eq!(to_fetch.len(), 1);
        assert_eq!(to_fetch[0].user, "14155550001");

        let query = build_device_query(&to_fetch);
        assert_eq!(query.attr("xmlns"), Some("usync"));
        let users: Vec<&Node> = query
            .get_child_by_tag("usync")
            .unwrap()
            .get_child_by_tag("list")
            .unwrap()
            .get_children_by_tag("user")
            .collect();
        assert_eq!(users.len(), 1);
        assert_eq!(
            users[0].attr("jid"),
            Some("14155550001@s.whatsapp.net")
        );
    }

    #[test]
    fn bypass_refreshes_cache() {
        let cache = DeviceCache::default();
        cache.store(&[UserDevice {
            user: "1".into(),
            device: 0,
        }]);
        let (cached, to_fetch) = cache.split(&[user_jid("1")], false);
        assert!(cached.is_empty());
        assert_eq!(to_fetch.len(), 1);
    }

    #[test]
    fn expired_entries_are_fetched_again() {
        let cache = DeviceCache::new(Duration::from_millis(0));
        cache.store(&[UserDevice {
            user: "1".into(),
            device: 0,
        }]);
        let (cached, to_fetch) = cache.split(&[user_jid("1")], true);
        assert!(cached.is_empty());
        assert_eq!(to_fetch.len(), 1);
    }

    #[test]
    fn duplicate_users_are_uniqueified() {
        let cache = DeviceCache::default();
        let (cached, to_fetch) = cache.split(
            &[
                user_jid("1"),
                Jid::device_jid("1", 3),
                user_jid("2"),
            ],
            true,
        );
        assert!(cached.is_empty());
        assert_eq!(to_fetch.len(), 2);
    }

    #[test]
    fn extract_applies_filters() {
        let me = Jid::device_jid("999", 5);
        let resp = usync_response(&[
            (
                "14155550000",
                &[(0, None), (1, Some("1")), (2, None), (3, Some(""))],
            ),
            ("999", &[(0, None), (5, Some("2")), (6, Some("3"))]),
        ]);

        // zero devices kept, own device dropped, key-index enforced
        let devices = extract_device_jids(&resp, &me, false).unwrap();
        assert!(devices.contains(&UserDevice {
            user: "14155550000".into(),
            device: 0
        }));
        assert!(devices.contains(&UserDevice {
            user: "14155550000".into(),
            device: 1
        }));
        // non-zero without key-index dropped
        assert!(!devices.iter().any(|d| d.user == "14155550000" && d.device == 2));
        assert!(!devices.iter().any(|d| d.user == "14155550000" && d.device == 3));
        // own device (999, 5) dropped, sibling device kept
        assert!(!devices.iter().any(|d| d.user == "999" && d.device == 5));
        assert!(devices.contains(&UserDevice {
            user: "999".into(),
            device: 6
        }));

        // ignore_zero drops primaries too
        let devices = extract_device_jids(&resp, &me, true).unwrap();
        assert!(!devices.iter().any(|d| d.device == 0));
        assert!(!devices.iter().any(|d| d.user == "999" && d.device == 5));
    }

    #[test]
    fn extract_rejects_malformed_response() {
        let resp = Node::new("iq");
        assert!(extract_device_jids(&resp, &user_jid("1"), false).is_err());
    }
}
