mod jid;

pub use jid::{
    Jid, JidParseError, ServerClass, BROADCAST_SERVER, DEFAULT_USER_SERVER, GROUP_SERVER,
    HIDDEN_USER_SERVER, LEGACY_USER_SERVER, NEWSLETTER_SERVER,
};

use rand::RngCore;
use sha2::Digest;

/// Message ID type (WhatsApp internal ID string).
pub type MessageId = String;

/// Server-assigned ID for newsletter messages.
pub type MessageServerId = i32;

/// Generate a message ID bound to the sender's own JID (the V2 scheme:
/// timestamp + own user + random, hashed, "3EB0" prefix).
pub fn generate_message_id_v2(own_user: Option<&str>) -> MessageId {
    use std::time::{SystemTime, UNIX_EPOCH};
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut data = Vec::with_capacity(8 + 32 + 16);
    data.extend_from_slice(&t.to_be_bytes());
    if let Some(user) = own_user {
        data.extend_from_slice(user.as_bytes());
        data.extend_from_slice(b"@c.us");
    }
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    data.extend_from_slice(&random);
    let hash = sha2::Sha256::digest(&data);
    format!("3EB0{}", hex::encode_upper(&hash[..9]))
}

/// Generate a stanza request id for IQ correlation.
pub fn generate_request_id() -> String {
    format!("{:x}", uuid::Uuid::new_v4().as_u128() & 0xFFFF_FFFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_format() {
        let id = generate_message_id_v2(Some("14155550000"));
        assert!(id.starts_with("3EB0"));
        assert_eq!(id.len(), 4 + 18);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn message_ids_unique() {
        let a = generate_message_id_v2(None);
        let b = generate_message_id_v2(None);
        assert_ne!(a, b);
    }

    #[test]
    fn request_ids_unique() {
        assert_ne!(generate_request_id(), generate_request_id());
    }
}
