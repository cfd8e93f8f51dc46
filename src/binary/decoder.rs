//! Decoder for the binary node format. Total over well-formed input;
//! anything else raises `MalformedFrame`.

use crate::binary::token;
use crate::error::BinaryError;
use crate::types::Jid;
use std::collections::HashMap;

type Result<T> = std::result::Result<T, BinaryError>;

fn malformed(msg: impl Into<String>) -> BinaryError {
    BinaryError::MalformedFrame(msg.into())
}

/// Decode one node from the buffer. Trailing bytes are rejected.
pub fn decode(data: &[u8]) -> Result<super::Node> {
    let mut d = Decoder::new(data);
    let node = d.read_node()?;
    if d.pos != data.len() {
        return Err(malformed(format!(
            "{} trailing bytes after node",
            data.len() - d.pos
        )));
    }
    Ok(node)
}

pub(super) struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub(super) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| malformed("unexpected eof"))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(malformed("unexpected eof"));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_u16_be(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u20_be(&mut self) -> Result<u32> {
        let b = self.read_bytes(3)?;
        Ok(((b[0] as u32 & 0x0F) << 16) | ((b[1] as u32) << 8) | (b[2] as u32))
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_packed(&mut self, opcode: u8) -> Result<String> {
        let header = self.read_u8()?;
        let odd = header & 0x80 != 0;
        let byte_count = (header & 0x7F) as usize;
        let bytes = self.read_bytes(byte_count)?;
        let mut s = String::with_capacity(byte_count * 2);
        for (i, &b) in bytes.iter().enumerate() {
            for (pos, nibble) in [(0, b >> 4), (1, b & 0x0F)] {
                if odd && i == byte_count - 1 && pos == 1 {
                    break;
                }
                let c = match (opcode, nibble) {
                    (token::NIBBLE_8, 0..=9) => (b'0' + nibble) as char,
                    (token::NIBBLE_8, 10) => '-',
                    (token::NIBBLE_8, 11) => '.',
                    (token::HEX_8, 0..=9) => (b'0' + nibble) as char,
                    (token::HEX_8, 10..=15) => (b'A' + nibble - 10) as char,
                    _ => return Err(malformed(format!("bad packed nibble {nibble}"))),
                };
                s.push(c);
            }
        }
        Ok(s)
    }

    fn read_jid_pair(&mut self) -> Result<String> {
        let user = self.read_string()?;
        let server = self.read_string()?;
        if server.is_empty() {
            return Err(malformed("jid pair with empty server"));
        }
        if user.is_empty() {
            Ok(server)
        } else {
            Ok(format!("{user}@{server}"))
        }
    }

    fn read_ad_jid(&mut self) -> Result<String> {
        let agent = self.read_u8()?;
        let device = self.read_u8()?;
        let user = self.read_string()?;
        let server = match agent {
            0 => crate::types::DEFAULT_USER_SERVER,
            1 => crate::types::HIDDEN_USER_SERVER,
            _ => return Err(malformed(format!("unknown AD JID agent {agent}"))),
        };
        let jid = Jid::new_ad(user, 0, device as u16, server);
        Ok(jid.to_string())
    }

    fn read_string(&mut self) -> Result<String> {
        let opcode = self.read_u8()?;
        match opcode {
            token::LIST_EMPTY => Ok(String::new()),
            1..=235 => token::get_single_token(opcode)
                .map(str::to_string)
                .ok_or_else(|| malformed(format!("single-byte token {opcode} out of range"))),
            token::DICTIONARY_0..=token::DICTIONARY_3 => {
                let idx = self.read_u8()?;
                token::get_double_token(opcode - token::DICTIONARY_0, idx)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        malformed(format!(
                            "double-byte token {}:{idx} out of range",
                            opcode - token::DICTIONARY_0
                        ))
                    })
            }
            token::JID_PAIR => self.read_jid_pair(),
            token::AD_JID => self.read_ad_jid(),
            token::NIBBLE_8 | token::HEX_8 => self.read_packed(opcode),
            token::BINARY_8 => {
                let len = self.read_u8()? as usize;
                self.read_utf8(len)
            }
            token::BINARY_20 => {
                let len = self.read_u20_be()? as usize;
                self.read_utf8(len)
            }
            token::BINARY_32 => {
                let len = self.read_u32_be()? as usize;
                self.read_utf8(len)
            }
            _ => Err(malformed(format!("unsupported string opcode {opcode}"))),
        }
    }

    fn read_utf8(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| BinaryError::InvalidString)
    }

    fn read_list_size(&mut self, opcode: u8) -> Result<usize> {
        match opcode {
            token::LIST_EMPTY => Ok(0),
            token::LIST_8 => Ok(self.read_u8()? as usize),
            token::LIST_16 => Ok(self.read_u16_be()? as usize),
            _ => Err(malformed(format!("unsupported list opcode {opcode}"))),
        }
    }

    pub(super) fn read_node(&mut self) -> Result<super::Node> {
        let opcode = self.read_u8()?;
        let list_size = self.read_list_size(opcode)?;
        if list_size == 0 {
            return Err(malformed("empty list size for node"));
        }
        let tag = self.read_string()?;
        if tag.is_empty() {
            return Err(malformed("node with empty tag"));
        }
        let attr_count = (list_size - 1) / 2;
        let has_content = list_size % 2 == 0;

        let mut attrs = HashMap::with_capacity(attr_count);
        for _ in 0..attr_count {
            let k = self.read_string()?;
            let v = self.read_string()?;
            attrs.insert(k, v);
        }

        let content = if has_content {
            self.read_content()?
        } else {
            super::NodeContent::Empty
        };

        Ok(super::Node { tag, attrs, content })
    }

    fn read_content(&mut self) -> Result<super::NodeContent> {
        let opcode = self.read_u8()?;
        match opcode {
            token::LIST_EMPTY => Ok(super::NodeContent::Empty),
            token::BINARY_8 => {
                let len = self.read_u8()? as usize;
                Ok(super::NodeContent::Bytes(self.read_bytes(len)?.to_vec()))
            }
            token::BINARY_20 => {
                let len = self.read_u20_be()? as usize;
                Ok(super::NodeContent::Bytes(self.read_bytes(len)?.to_vec()))
            }
            token::BINARY_32 => {
                let len = self.read_u32_be()? as usize;
                Ok(super::NodeContent::Bytes(self.read_bytes(len)?.to_vec()))
            }
            token::LIST_8 | token::LIST_16 => {
                let n = self.read_list_size(opcode)?;
                let mut children = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    children.push(self.read_node()?);
                }
                Ok(super::NodeContent::Nodes(children))
            }
            _ => Err(malformed(format!("unsupported content opcode {opcode}"))),
        }
    }
}
