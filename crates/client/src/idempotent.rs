//! Client-generated message ids for idempotent publishing.

use rt_protocol::Message;
use uuid::Uuid;

/// Random base for one publish batch: 9 random bytes, hex encoded.
pub fn random_base() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    // Bytes 6 and 8 carry the UUID version and variant bits.
    let mut random = [0u8; 9];
    random[..6].copy_from_slice(&bytes[..6]);
    random[6..].copy_from_slice(&bytes[10..13]);
    hex::encode(random)
}

/// Give every message without an id the id `<base>:<position>`.
///
/// Messages that already carry an id keep it; positions still count them.
pub fn assign_ids(messages: &mut [Message], base: &str) {
    for (index, message) in messages.iter_mut().enumerate() {
        if message.id.is_none() {
            message.id = Some(format!("{base}:{index}"));
        }
    }
}
