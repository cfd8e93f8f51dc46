//! Constants for the binary protocol and connection header.

/// Noise handshake pattern advertised to the server, padded to 32 bytes.
pub const NOISE_START_PATTERN: &[u8] = b"Noise_XX_25519_AESGCM_SHA256\x00\x00\x00\x00";

/// Magic byte in the connection header.
pub const WA_MAGIC_VALUE: u8 = 6;

/// Connection header: "WA" + magic + dict version (4 bytes).
pub const WA_CONN_HEADER: [u8; 4] = [b'W', b'A', WA_MAGIC_VALUE, super::token::DICT_VERSION];

/// Flag bit in the leading framing byte: remainder is zlib-deflated.
pub const FLAG_COMPRESSED: u8 = 0x02;
