//! Opaque message-body codec boundary.
//!
//! Individual request/response structures are serialized with bincode behind
//! these two helpers. The secure channel and dispatcher treat bodies as
//! opaque bytes; swapping the encoding only touches this module.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a message body.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a message body.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        id: u32,
        name: String,
    }

    #[test]
    fn body_roundtrip() {
        let probe = Probe {
            id: 7,
            name: "boiler-7".into(),
        };
        let bytes = encode(&probe).unwrap();
        assert_eq!(decode::<Probe>(&bytes).unwrap(), probe);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode::<Probe>(&[0xFF, 0xFE]).is_err());
    }
}
