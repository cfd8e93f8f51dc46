//! Protobuf surface: the application message envelope plus the wire
//! records for the pairwise and sender-key crypto layers.
//!
//! Schemas are hand-derived with prost; the crate treats the envelope as
//! an opaque codec (`encode_to_vec` / `decode`) and only ever inspects
//! variant presence (for media-type attributes) and the protocol-message
//! key (for edits and revokes).

/// Application message envelope. Exactly one variant is normally set.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(string, optional, tag = "1")]
    pub conversation: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub image_message: Option<ImageMessage>,
    #[prost(message, optional, tag = "3")]
    pub contact_message: Option<ContactMessage>,
    #[prost(message, optional, tag = "4")]
    pub location_message: Option<LocationMessage>,
    #[prost(message, optional, tag = "5")]
    pub extended_text_message: Option<ExtendedTextMessage>,
    #[prost(message, optional, tag = "6")]
    pub document_message: Option<DocumentMessage>,
    #[prost(message, optional, tag = "7")]
    pub audio_message: Option<AudioMessage>,
    #[prost(message, optional, tag = "8")]
    pub video_message: Option<VideoMessage>,
    #[prost(message, optional, boxed, tag = "9")]
    pub protocol_message: Option<Box<ProtocolMessage>>,
    #[prost(message, optional, tag = "10")]
    pub contacts_array_message: Option<ContactsArrayMessage>,
    #[prost(message, optional, tag = "11")]
    pub live_location_message: Option<LiveLocationMessage>,
    #[prost(message, optional, tag = "12")]
    pub sticker_message: Option<StickerMessage>,
    #[prost(message, optional, boxed, tag = "13")]
    pub device_sent_message: Option<Box<DeviceSentMessage>>,
    #[prost(message, optional, tag = "14")]
    pub order_message: Option<OrderMessage>,
    #[prost(message, optional, tag = "15")]
    pub product_message: Option<ProductMessage>,
    #[prost(message, optional, tag = "16")]
    pub reaction_message: Option<ReactionMessage>,
    #[prost(message, optional, tag = "17")]
    pub poll_creation_message: Option<PollCreationMessage>,
    #[prost(message, optional, tag = "18")]
    pub pin_in_chat_message: Option<PinInChatMessage>,
    #[prost(message, optional, tag = "19")]
    pub interactive_response_message: Option<InteractiveResponseMessage>,
    #[prost(message, optional, tag = "20")]
    pub group_key_distribution_message: Option<GroupKeyDistributionMessage>,
}

impl Message {
    /// Plain text helper.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            conversation: Some(body.into()),
            ..Default::default()
        }
    }

    /// Wrap a message as the own-device copy carrying the destination.
    pub fn device_sent(destination_jid: impl Into<String>, inner: Message) -> Self {
        Self {
            device_sent_message: Some(Box::new(DeviceSentMessage {
                destination_jid: Some(destination_jid.into()),
                message: Some(Box::new(inner)),
            })),
            ..Default::default()
        }
    }

    /// The `mediatype` attribute for the `<enc>` node, when one applies.
    ///
    /// Derived from the concrete variant; plain text, reactions and poll
    /// creations carry none.
    pub fn media_type(&self) -> Option<&'static str> {
        if self.image_message.is_some() {
            return Some("image");
        }
        if let Some(v) = &self.video_message {
            return Some(if v.gif_playback() { "gif" } else { "video" });
        }
        if let Some(a) = &self.audio_message {
            return Some(if a.ptt() { "ptt" } else { "audio" });
        }
        if self.contact_message.is_some() {
            return Some("vcard");
        }
        if self.document_message.is_some() {
            return Some("document");
        }
        if self.contacts_array_message.is_some() {
            return Some("contact_array");
        }
        if self.live_location_message.is_some() {
            return Some("livelocation");
        }
        if self.sticker_message.is_some() {
            return Some("sticker");
        }
        if self.order_message.is_some() {
            return Some("order");
        }
        if self.product_message.is_some() {
            return Some("product");
        }
        if let Some(i) = &self.interactive_response_message {
            if i.native_flow_response_message.is_some() {
                return Some("native_flow_response");
            }
        }
        if let Some(t) = &self.extended_text_message {
            if t.matched_text.as_deref().is_some_and(|m| !m.is_empty()) {
                return Some("url");
            }
        }
        if let Some(d) = &self.device_sent_message {
            if let Some(inner) = &d.message {
                return inner.media_type();
            }
        }
        None
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MessageKey {
    #[prost(string, optional, tag = "1")]
    pub remote_jid: Option<String>,
    #[prost(bool, optional, tag = "2")]
    pub from_me: Option<bool>,
    #[prost(string, optional, tag = "3")]
    pub id: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub participant: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceSentMessage {
    #[prost(string, optional, tag = "1")]
    pub destination_jid: Option<String>,
    #[prost(message, optional, boxed, tag = "2")]
    pub message: Option<Box<Message>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtocolMessage {
    #[prost(message, optional, tag = "1")]
    pub key: Option<MessageKey>,
    #[prost(enumeration = "protocol_message::Type", optional, tag = "2")]
    pub r#type: Option<i32>,
    #[prost(message, optional, boxed, tag = "3")]
    pub edited_message: Option<Box<Message>>,
}

pub mod protocol_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Revoke = 0,
        EphemeralSetting = 3,
        AppStateSyncKeyShare = 6,
        MessageEdit = 14,
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ImageMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub caption: Option<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub file_sha256: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "5")]
    pub file_length: Option<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VideoMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub caption: Option<String>,
    #[prost(uint32, optional, tag = "4")]
    pub seconds: Option<u32>,
    #[prost(bool, optional, tag = "5")]
    pub gif_playback: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AudioMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(uint32, optional, tag = "3")]
    pub seconds: Option<u32>,
    #[prost(bool, optional, tag = "4")]
    pub ptt: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DocumentMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub title: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub file_name: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StickerMessage {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mimetype: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContactMessage {
    #[prost(string, optional, tag = "1")]
    pub display_name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub vcard: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContactsArrayMessage {
    #[prost(string, optional, tag = "1")]
    pub display_name: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub contacts: Vec<ContactMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LocationMessage {
    #[prost(double, optional, tag = "1")]
    pub degrees_latitude: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub degrees_longitude: Option<f64>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LiveLocationMessage {
    #[prost(double, optional, tag = "1")]
    pub degrees_latitude: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub degrees_longitude: Option<f64>,
    #[prost(string, optional, tag = "3")]
    pub caption: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExtendedTextMessage {
    #[prost(string, optional, tag = "1")]
    pub text: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub matched_text: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub canonical_url: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub description: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub title: Option<String>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub jpeg_thumbnail: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderMessage {
    #[prost(string, optional, tag = "1")]
    pub order_id: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub item_count: Option<i32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProductMessage {
    #[prost(string, optional, tag = "1")]
    pub business_owner_jid: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub product_id: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReactionMessage {
    #[prost(message, optional, tag = "1")]
    pub key: Option<MessageKey>,
    #[prost(string, optional, tag = "2")]
    pub text: Option<String>,
    #[prost(int64, optional, tag = "3")]
    pub sender_timestamp_ms: Option<i64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PollCreationMessage {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub options: Vec<PollOption>,
    #[prost(uint32, optional, tag = "3")]
    pub selectable_options_count: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PollOption {
    #[prost(string, optional, tag = "1")]
    pub option_name: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PinInChatMessage {
    #[prost(message, optional, tag = "1")]
    pub key: Option<MessageKey>,
    #[prost(int32, optional, tag = "2")]
    pub r#type: Option<i32>,
    #[prost(int64, optional, tag = "3")]
    pub sender_timestamp_ms: Option<i64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InteractiveResponseMessage {
    #[prost(message, optional, tag = "1")]
    pub native_flow_response_message: Option<NativeFlowResponseMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NativeFlowResponseMessage {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub params_json: Option<String>,
}

/// Envelope variant that delivers a sender-key distribution message to
/// one group member over the pairwise channel.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GroupKeyDistributionMessage {
    #[prost(string, optional, tag = "1")]
    pub group_jid: Option<String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub distribution: Option<Vec<u8>>,
}

/// Login payload carried in the final handshake message: identifies the
/// account and client version to the server.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LoginPayload {
    #[prost(bool, optional, tag = "1")]
    pub passive: Option<bool>,
    #[prost(uint64, optional, tag = "2")]
    pub username: Option<u64>,
    #[prost(uint32, optional, tag = "3")]
    pub device: Option<u32>,
    #[prost(string, optional, tag = "4")]
    pub version: Option<String>,
    #[prost(uint32, optional, tag = "5")]
    pub registration_id: Option<u32>,
}

// --- Signal layer wire records ---

/// Pairwise ratchet message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PairwiseMessage {
    #[prost(uint32, tag = "1")]
    pub counter: u32,
    #[prost(uint32, tag = "2")]
    pub previous_counter: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub ciphertext: Vec<u8>,
}

/// Pairwise message carrying the session bootstrap material; sent until
/// the first reply proves the session is established on both ends.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PreKeyMessage {
    #[prost(uint32, tag = "1")]
    pub registration_id: u32,
    #[prost(uint32, optional, tag = "2")]
    pub pre_key_id: Option<u32>,
    #[prost(uint32, tag = "3")]
    pub signed_pre_key_id: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub base_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub identity_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub message: Vec<u8>,
}

/// Group message encrypted under the sender key chain.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SenderKeyMessage {
    #[prost(uint32, tag = "1")]
    pub key_id: u32,
    #[prost(uint32, tag = "2")]
    pub iteration: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub ciphertext: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub signature: Vec<u8>,
}

/// Bootstraps a recipient's copy of the sender key chain.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SenderKeyDistributionMessage {
    #[prost(uint32, tag = "1")]
    pub key_id: u32,
    #[prost(uint32, tag = "2")]
    pub iteration: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub chain_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub signing_key: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn envelope_roundtrip() {
        let msg = Message::text("hello");
        let bytes = msg.encode_to_vec();
        assert_eq!(Message::decode(&bytes[..]).unwrap(), msg);
    }

    #[test]
    fn device_sent_wraps_and_unwraps() {
        let wrapped = Message::device_sent("1@s.whatsapp.net", Message::text("hi"));
        let dsm = wrapped.device_sent_message.as_ref().unwrap();
        assert_eq!(dsm.destination_jid.as_deref(), Some("1@s.whatsapp.net"));
        assert_eq!(
            dsm.message.as_ref().unwrap().conversation.as_deref(),
            Some("hi")
        );
    }

    #[test]
    fn media_type_derivation() {
        assert_eq!(Message::text("x").media_type(), None);

        let mut m = Message::default();
        m.image_message = Some(ImageMessage::default());
        assert_eq!(m.media_type(), Some("image"));

        let mut m = Message::default();
        m.video_message = Some(VideoMessage {
            gif_playback: Some(true),
            ..Default::default()
        });
        assert_eq!(m.media_type(), Some("gif"));

        let mut m = Message::default();
        m.audio_message = Some(AudioMessage {
            ptt: Some(true),
            ..Default::default()
        });
        assert_eq!(m.media_type(), Some("ptt"));

        let mut m = Message::default();
        m.extended_text_message = Some(ExtendedTextMessage {
            text: Some("see https://example.com".into()),
            matched_text: Some("https://example.com".into()),
            ..Default::default()
        });
        assert_eq!(m.media_type(), Some("url"));

        let mut m = Message::default();
        m.reaction_message = Some(ReactionMessage::default());
        assert_eq!(m.media_type(), None);

        // poll creations carry no mediatype either
        let mut m = Message::default();
        m.poll_creation_message = Some(PollCreationMessage::default());
        assert_eq!(m.media_type(), None);
    }

    #[test]
    fn media_type_follows_device_sent_wrapper() {
        let mut inner = Message::default();
        inner.sticker_message = Some(StickerMessage::default());
        let wrapped = Message::device_sent("1@s.whatsapp.net", inner);
        assert_eq!(wrapped.media_type(), Some("sticker"));
    }

    #[test]
    fn signal_wire_records_roundtrip() {
        let pk = PreKeyMessage {
            registration_id: 1234,
            pre_key_id: Some(7),
            signed_pre_key_id: 1,
            base_key: vec![5; 33],
            identity_key: vec![6; 32],
            message: vec![1, 2, 3],
        };
        let bytes = pk.encode_to_vec();
        assert_eq!(PreKeyMessage::decode(&bytes[..]).unwrap(), pk);
    }
}
