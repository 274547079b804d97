//! WAL command codec
//!
//! Every WAL record is tagged with the command's type key. During recovery
//! the codec dispatches the raw payload to the deserializer registered for
//! that key, so a partition can replay logs containing several concrete
//! command shapes (typically the variants the host registered at engine
//! construction).

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::types::Command;

type DecodeFn<C> = Box<dyn Fn(&[u8]) -> Result<C> + Send + Sync>;

/// Registry of per-type-key deserializers, supplied by the host through
/// [`Bootstrap::codec`](crate::api::Bootstrap::codec).
pub struct CommandCodec<C> {
    decoders: HashMap<String, DecodeFn<C>>,
}

impl<C: Command> CommandCodec<C> {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry with a single bincode deserializer under `type_key`.
    ///
    /// Sufficient whenever the engine handles one concrete command type
    /// (including an enum of operations).
    pub fn bincode(type_key: impl Into<String>) -> Self
    where
        C: DeserializeOwned,
    {
        Self::new().with_bincode(type_key)
    }

    /// Register a bincode deserializer for `type_key`.
    pub fn with_bincode(self, type_key: impl Into<String>) -> Self
    where
        C: DeserializeOwned,
    {
        self.with_decoder(type_key, |bytes| {
            bincode::deserialize(bytes).map_err(Error::from)
        })
    }

    /// Register a custom deserializer for `type_key`.
    pub fn with_decoder(
        mut self,
        type_key: impl Into<String>,
        decode: impl Fn(&[u8]) -> Result<C> + Send + Sync + 'static,
    ) -> Self {
        self.decoders.insert(type_key.into(), Box::new(decode));
        self
    }

    /// Serialize a command for the WAL.
    pub fn encode(&self, command: &C) -> Result<Vec<u8>> {
        Ok(bincode::serialize(command)?)
    }

    /// Reify a WAL payload through the deserializer registered for its tag.
    pub fn decode(&self, type_key: &str, payload: &[u8]) -> Result<C> {
        let decode = self.decoders.get(type_key).ok_or_else(|| {
            Error::Recovery(format!("No deserializer registered for type key '{}'", type_key))
        })?;
        decode(payload)
    }

    /// True if `type_key` has a registered deserializer.
    pub fn knows(&self, type_key: &str) -> bool {
        self.decoders.contains_key(type_key)
    }
}

impl<C: Command> Default for CommandCodec<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Credit {
        tx: String,
        key: String,
        amount: i64,
    }

    impl Command for Credit {
        fn tx_id(&self) -> &str {
            &self.tx
        }
        fn routing_key(&self) -> &str {
            &self.key
        }
        fn type_key(&self) -> &str {
            "credit"
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = CommandCodec::<Credit>::bincode("credit");
        let cmd = Credit {
            tx: "tx-1".into(),
            key: "u1".into(),
            amount: 100,
        };
        let bytes = codec.encode(&cmd).unwrap();
        let back = codec.decode("credit", &bytes).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_unknown_type_key_is_recovery_error() {
        let codec = CommandCodec::<Credit>::bincode("credit");
        let err = codec.decode("debit", &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::Recovery(_)));
    }

    #[test]
    fn test_knows() {
        let codec = CommandCodec::<Credit>::bincode("credit");
        assert!(codec.knows("credit"));
        assert!(!codec.knows("debit"));
    }
}
