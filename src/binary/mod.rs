//! Binary protocol stanzas.
//!
//! Every application-layer unit over the Noise channel is one `Node`: an
//! XML-like tree with a tag, string attributes, and either raw bytes or
//! child nodes as content. On the wire the tree is token-compressed with
//! a fixed dictionary; a leading flag byte marks optional zlib compression
//! of the remainder.

mod consts;
mod decoder;
mod encoder;
pub(crate) mod token;

pub use consts::{FLAG_COMPRESSED, NOISE_START_PATTERN, WA_CONN_HEADER, WA_MAGIC_VALUE};

use crate::error::BinaryError;
use flate2::read::ZlibDecoder;
use std::collections::HashMap;
use std::io::Read;

/// Attributes on a node.
pub type Attrs = HashMap<String, String>;

/// Content of a node: either child nodes or raw bytes.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum NodeContent {
    #[default]
    Empty,
    Nodes(Vec<Node>),
    Bytes(Vec<u8>),
}

/// A single binary protocol node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: NodeContent,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::Empty,
        }
    }

    pub fn with_attr(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.attrs.insert(k.into(), v.into());
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Nodes(children);
        self
    }

    pub fn with_content(mut self, bytes: Vec<u8>) -> Self {
        self.content = NodeContent::Bytes(bytes);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn get_child_by_tag(&self, tag: &str) -> Option<&Node> {
        match &self.content {
            NodeContent::Nodes(nodes) => nodes.iter().find(|n| n.tag == tag),
            _ => None,
        }
    }

    pub fn get_children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Nodes(n) => n,
            _ => &[],
        }
    }

    pub fn get_children_by_tag<'a, 'b>(&'a self, tag: &'b str) -> impl Iterator<Item = &'a Node> + 'b
    where
        'a: 'b,
    {
        self.get_children().iter().filter(move |n| n.tag == tag)
    }

    pub fn content_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Encode to wire form with the leading flag byte (uncompressed).
    pub fn marshal(&self) -> Result<Vec<u8>, BinaryError> {
        let mut out = vec![0u8];
        encoder::encode_node(self, &mut out)?;
        Ok(out)
    }

    /// Decode from wire form: flag byte then (optionally deflated) node.
    pub fn unmarshal(data: &[u8]) -> Result<Self, BinaryError> {
        let (&flag, rest) = data
            .split_first()
            .ok_or_else(|| BinaryError::MalformedFrame("empty frame".into()))?;
        if flag & FLAG_COMPRESSED != 0 {
            let mut inflated = Vec::with_capacity(rest.len() * 4);
            ZlibDecoder::new(rest)
                .read_to_end(&mut inflated)
                .map_err(|e| BinaryError::MalformedFrame(format!("zlib: {e}")))?;
            decoder::decode(&inflated)
        } else {
            decoder::decode(rest)
        }
    }

    /// Encode without the framing byte (used inside the handshake payload).
    pub fn encode(&self) -> Result<Vec<u8>, BinaryError> {
        let mut out = Vec::new();
        encoder::encode_node(self, &mut out)?;
        Ok(out)
    }

    /// Decode a bare node without the framing byte.
    pub fn decode(data: &[u8]) -> Result<Self, BinaryError> {
        decoder::decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn sample_stanza() -> Node {
        Node::new("message")
            .with_attr("id", "3EB0A9C2D4E6F8A0B1C2")
            .with_attr("to", "14155550000@s.whatsapp.net")
            .with_attr("type", "text")
            .with_children(vec![
                Node::new("enc")
                    .with_attr("v", "2")
                    .with_attr("type", "pkmsg")
                    .with_content(vec![0xDE, 0xAD, 0xBE, 0xEF]),
                Node::new("device-identity").with_content(vec![1, 2, 3]),
            ])
    }

    #[test]
    fn roundtrip_simple() {
        let node = Node::new("iq")
            .with_attr("type", "get")
            .with_attr("xmlns", "usync");
        let bytes = node.encode().unwrap();
        assert_eq!(Node::decode(&bytes).unwrap(), node);
    }

    #[test]
    fn roundtrip_nested() {
        let node = sample_stanza();
        let bytes = node.encode().unwrap();
        assert_eq!(Node::decode(&bytes).unwrap(), node);
    }

    #[test]
    fn encode_is_deterministic() {
        let a = sample_stanza().encode().unwrap();
        let b = sample_stanza().encode().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn encode_decode_identity_on_encoded_bytes() {
        let bytes = sample_stanza().encode().unwrap();
        let reencoded = Node::decode(&bytes).unwrap().encode().unwrap();
        assert_eq!(bytes, reencoded);
    }

    #[test]
    fn tokenized_strings_are_single_bytes() {
        // "message" and "type" are both dictionary tokens; the node head
        // should be list header + 1 tag byte, not a length-prefixed string.
        let node = Node::new("message");
        let bytes = node.encode().unwrap();
        assert_eq!(bytes.len(), 3);
    }

    #[test]
    fn jid_attr_compact_forms() {
        for jid in [
            "14155550000@s.whatsapp.net",
            "120363041234567890@g.us",
            "status@broadcast",
            "14155550000:12@s.whatsapp.net",
        ] {
            let node = Node::new("to").with_attr("jid", jid);
            let decoded = Node::decode(&node.encode().unwrap()).unwrap();
            assert_eq!(decoded.attr("jid"), Some(jid), "jid form lost for {jid}");
        }
    }

    #[test]
    fn packed_and_literal_strings_roundtrip() {
        for v in [
            "14155550000",
            "1.2.3-4",
            "0AF5",
            "mixed Case literal!",
            "",
        ] {
            let node = Node::new("prop").with_attr("value", v);
            let decoded = Node::decode(&node.encode().unwrap()).unwrap();
            assert_eq!(decoded.attr("value"), Some(v), "string form lost for {v:?}");
        }
    }

    #[test]
    fn unmarshal_rejects_garbage() {
        assert!(Node::unmarshal(&[]).is_err());
        assert!(Node::unmarshal(&[0x00]).is_err());
        assert!(Node::unmarshal(&[0x00, 0xF8]).is_err());
        assert!(Node::unmarshal(&[0x00, 0xF8, 0x02, 0x01]).is_err());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = Node::new("iq").encode().unwrap();
        bytes.push(0x00);
        assert!(Node::decode(&bytes).is_err());
    }

    #[test]
    fn unmarshal_inflates_flagged_frames() {
        let node = sample_stanza();
        let raw = node.encode().unwrap();
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&raw).unwrap();
        let mut framed = vec![FLAG_COMPRESSED];
        framed.extend_from_slice(&enc.finish().unwrap());
        assert_eq!(Node::unmarshal(&framed).unwrap(), node);
    }

    #[test]
    fn marshal_unmarshal_roundtrip() {
        let node = sample_stanza();
        assert_eq!(Node::unmarshal(&node.marshal().unwrap()).unwrap(), node);
    }
}
