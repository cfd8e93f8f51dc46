//! Token-compressed encoder for the binary node format.
//!
//! Encoding is deterministic: attributes are written in sorted key order,
//! so the same node always produces the same bytes.

use crate::binary::token;
use crate::error::BinaryError;
use crate::types::Jid;
use std::str::FromStr;

type Result<T> = std::result::Result<T, BinaryError>;

const MAX_BINARY_20: usize = 0x0F_FFFF;

fn write_u16_be(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn write_u20_be(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&[((v >> 16) & 0x0F) as u8, (v >> 8) as u8, v as u8]);
}

fn write_list_header(out: &mut Vec<u8>, size: usize) -> Result<()> {
    if size <= u8::MAX as usize {
        out.push(token::LIST_8);
        out.push(size as u8);
    } else if size <= u16::MAX as usize {
        out.push(token::LIST_16);
        write_u16_be(out, size as u16);
    } else {
        return Err(BinaryError::FrameTooLarge(size));
    }
    Ok(())
}

fn write_raw_bytes(out: &mut Vec<u8>, b: &[u8]) -> Result<()> {
    if b.len() <= u8::MAX as usize {
        out.push(token::BINARY_8);
        out.push(b.len() as u8);
    } else if b.len() <= MAX_BINARY_20 {
        out.push(token::BINARY_20);
        write_u20_be(out, b.len() as u32);
    } else if b.len() <= u32::MAX as usize {
        out.push(token::BINARY_32);
        out.extend_from_slice(&(b.len() as u32).to_be_bytes());
    } else {
        return Err(BinaryError::FrameTooLarge(b.len()));
    }
    out.extend_from_slice(b);
    Ok(())
}

fn nibble_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'-' => Some(10),
        b'.' => Some(11),
        _ => None,
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn write_packed(out: &mut Vec<u8>, opcode: u8, values: &[u8]) {
    out.push(opcode);
    let odd = values.len() % 2 == 1;
    let byte_count = values.len().div_ceil(2);
    out.push(byte_count as u8 | if odd { 0x80 } else { 0 });
    for pair in values.chunks(2) {
        let hi = pair[0];
        let lo = if pair.len() == 2 { pair[1] } else { 0x0F };
        out.push((hi << 4) | lo);
    }
}

/// Try the packed nibble/hex forms; true if one applied.
fn try_write_packed(out: &mut Vec<u8>, s: &str) -> bool {
    if s.is_empty() || s.len() > token::PACKED_MAX {
        return false;
    }
    let bytes = s.as_bytes();
    if let Some(values) = bytes.iter().map(|&c| nibble_value(c)).collect::<Option<Vec<_>>>() {
        write_packed(out, token::NIBBLE_8, &values);
        return true;
    }
    if let Some(values) = bytes.iter().map(|&c| hex_value(c)).collect::<Option<Vec<_>>>() {
        write_packed(out, token::HEX_8, &values);
        return true;
    }
    false
}

/// Known-server JIDs get the compact pair form; device JIDs on the default
/// server get the AD form. Anything else falls through to the literal.
fn try_write_jid(out: &mut Vec<u8>, s: &str) -> Result<bool> {
    if !s.contains('@') {
        return Ok(false);
    }
    let Ok(jid) = Jid::from_str(s) else {
        return Ok(false);
    };
    if jid.user.is_empty() || jid.to_string() != s {
        return Ok(false);
    }
    let known = matches!(
        jid.server.as_str(),
        crate::types::DEFAULT_USER_SERVER
            | crate::types::GROUP_SERVER
            | crate::types::LEGACY_USER_SERVER
            | crate::types::BROADCAST_SERVER
            | crate::types::HIDDEN_USER_SERVER
            | crate::types::NEWSLETTER_SERVER
    );
    if !known {
        return Ok(false);
    }
    if jid.raw_agent == 0 && jid.device == 0 {
        out.push(token::JID_PAIR);
        write_string(out, &jid.user)?;
        write_string(out, &jid.server)?;
        return Ok(true);
    }
    if jid.raw_agent == 0
        && jid.device <= u8::MAX as u16
        && jid.server == crate::types::DEFAULT_USER_SERVER
    {
        out.push(token::AD_JID);
        out.push(0);
        out.push(jid.device as u8);
        write_string(out, &jid.user)?;
        return Ok(true);
    }
    Ok(false)
}

pub(super) fn write_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.is_empty() {
        out.push(token::LIST_EMPTY);
        return Ok(());
    }
    if let Some(idx) = token::index_of_single_token(s) {
        out.push(idx);
        return Ok(());
    }
    if let Some((page, idx)) = token::index_of_double_token(s) {
        out.push(token::DICTIONARY_0 + page);
        out.push(idx);
        return Ok(());
    }
    if try_write_jid(out, s)? {
        return Ok(());
    }
    if try_write_packed(out, s) {
        return Ok(());
    }
    write_raw_bytes(out, s.as_bytes())
}

/// Encode a node to the binary format.
pub fn encode_node(node: &super::Node, out: &mut Vec<u8>) -> Result<()> {
    let attr_count = node.attrs.len();
    let has_content = !matches!(node.content, super::NodeContent::Empty);
    let list_size = 1 + 2 * attr_count + usize::from(has_content);
    write_list_header(out, list_size)?;

    write_string(out, &node.tag)?;
    let mut keys: Vec<&String> = node.attrs.keys().collect();
    keys.sort();
    for k in keys {
        write_string(out, k)?;
        write_string(out, &node.attrs[k])?;
    }

    if has_content {
        encode_content(out, &node.content)?;
    }
    Ok(())
}

fn encode_content(out: &mut Vec<u8>, content: &super::NodeContent) -> Result<()> {
    match content {
        super::NodeContent::Empty => out.push(token::LIST_EMPTY),
        super::NodeContent::Bytes(b) => write_raw_bytes(out, b)?,
        super::NodeContent::Nodes(children) => {
            write_list_header(out, children.len())?;
            for child in children {
                encode_node(child, out)?;
            }
        }
    }
    Ok(())
}
