//! Shared-secret handshake helpers.
//!
//! The client sends a `Password` message carrying the hex SHA-256 of the
//! session secret. The server answers with a raw 4-byte ASCII field: the
//! zero-padded client id (`"0003"`) on success, `"-001"` on rejection.

use sha2::{Digest, Sha256};

use crate::protocol::{ClientId, ProtocolError};

/// Length of the raw id reply that follows the password frame.
pub const ID_REPLY_LEN: usize = 4;

const REJECTED: &[u8; ID_REPLY_LEN] = b"-001";

/// Lowercase hex SHA-256 of `secret`.
pub fn hash_password(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Check a presented hash against the expected one. Case-insensitive on
/// the hex digits so either encoding of the same digest is accepted.
pub fn verify(expected: &str, presented: &str) -> bool {
    expected.len() == presented.len()
        && expected
            .bytes()
            .zip(presented.bytes())
            .fold(0u8, |acc, (a, b)| {
                acc | (a.to_ascii_lowercase() ^ b.to_ascii_lowercase())
            })
            == 0
}

pub fn encode_id_reply(id: Option<ClientId>) -> [u8; ID_REPLY_LEN] {
    match id {
        Some(id) => {
            let mut reply = [b'0'; ID_REPLY_LEN];
            reply.copy_from_slice(format!("{:04}", id.get()).as_bytes());
            reply
        }
        None => *REJECTED,
    }
}

/// Parse the server's reply: `Some(id)` when admitted, `None` when the
/// password was refused.
pub fn decode_id_reply(reply: &[u8; ID_REPLY_LEN]) -> Result<Option<ClientId>, ProtocolError> {
    let invalid = || ProtocolError::InvalidIdReply(String::from_utf8_lossy(reply).into_owned());
    let text = std::str::from_utf8(reply).map_err(|_| invalid())?;
    let value: i32 = text.trim().parse().map_err(|_| invalid())?;
    if value < 0 {
        return Ok(None);
    }
    u16::try_from(value)
        .ok()
        .and_then(ClientId::new)
        .map(Some)
        .ok_or_else(invalid)
}
