//! Recovery key: `<connectionKey>:<connectionSerial>:<msgSerial>`.
//!
//! Handed from one client instance to the next so the new instance can
//! take over the previous session.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryKey {
    pub connection_key: String,
    /// `-1` when no serial has been received yet.
    pub connection_serial: i64,
    pub msg_serial: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryKeyError {
    #[error("recovery key must have three ':' separated parts")]
    Shape,
    #[error("recovery key has an empty connection key")]
    EmptyKey,
    #[error("recovery key has a non-numeric {0}")]
    Number(&'static str),
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.connection_key, self.connection_serial, self.msg_serial
        )
    }
}

impl FromStr for RecoveryKey {
    type Err = RecoveryKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The connection key itself may contain ':'; the serials never do.
        let mut parts = s.rsplitn(3, ':');
        let (Some(msg_serial), Some(connection_serial), Some(connection_key)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(RecoveryKeyError::Shape);
        };
        if connection_key.is_empty() {
            return Err(RecoveryKeyError::EmptyKey);
        }
        Ok(Self {
            connection_key: connection_key.to_owned(),
            connection_serial: connection_serial
                .parse()
                .map_err(|_| RecoveryKeyError::Number("connection serial"))?,
            msg_serial: msg_serial
                .parse()
                .map_err(|_| RecoveryKeyError::Number("message serial"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_three_parts() {
        let k = RecoveryKey {
            connection_key: "abc!def".into(),
            connection_serial: 7,
            msg_serial: 3,
        };
        assert_eq!(k.to_string(), "abc!def:7:3");
        assert_eq!("abc!def:7:3".parse::<RecoveryKey>().unwrap(), k);
    }

    #[test]
    fn accepts_negative_connection_serial() {
        let k: RecoveryKey = "key:-1:0".parse().unwrap();
        assert_eq!(k.connection_serial, -1);
    }

    #[test]
    fn key_may_contain_colons() {
        let k: RecoveryKey = "a:b:5:9".parse().unwrap();
        assert_eq!(k.connection_key, "a:b");
        assert_eq!(k.connection_serial, 5);
        assert_eq!(k.msg_serial, 9);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert_eq!("nope".parse::<RecoveryKey>(), Err(RecoveryKeyError::Shape));
        assert_eq!(":1:2".parse::<RecoveryKey>(), Err(RecoveryKeyError::EmptyKey));
        assert!(matches!(
            "k:x:2".parse::<RecoveryKey>(),
            Err(RecoveryKeyError::Number(_))
        ));
    }
}
