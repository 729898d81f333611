use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary: {0}")]
    Binary(#[from] bincode::Error),
}

/// Value serialization policy for a database.
///
/// Databases default to `Json`; segmented databases and the wire use
/// `Binary` (bincode). The codec travels with the database handle so every
/// typed read and write of that database agrees on the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    Binary,
}

impl Codec {
    pub fn encode<T: Serialize>(&self, v: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(v)?),
            Codec::Binary => Ok(bincode::serialize(v)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(buf)?),
            Codec::Binary => Ok(bincode::deserialize(buf)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Nested {
        a: String,
        b: i64,
        inner: Option<Box<Nested>>,
    }

    fn sample() -> Nested {
        Nested {
            a: "test".into(),
            b: 123,
            inner: Some(Box::new(Nested { a: "-".into(), b: 321, inner: None })),
        }
    }

    #[test]
    fn both_codecs_roundtrip_nested_values() {
        for codec in [Codec::Json, Codec::Binary] {
            let bytes = codec.encode(&sample()).unwrap();
            let back: Nested = codec.decode(&bytes).unwrap();
            assert_eq!(back, sample());
        }
    }

    #[test]
    fn empty_buffer_is_a_decode_error() {
        for codec in [Codec::Json, Codec::Binary] {
            assert!(codec.decode::<Nested>(&[]).is_err());
        }
    }
}
