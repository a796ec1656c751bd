// Every persisted record and wire payload goes through these two helpers so the
// byte layout is fixed by one bincode configuration.
use crate::error::{BlockchainError, Result};

/// Upper bound on any single decoded record, wire payloads included.
/// Length prefixes claiming more than this fail before anything is allocated.
pub const MAX_RECORD_SIZE: usize = 8 * 1024 * 1024;

/// Encode with bincode's standard configuration (varint lengths, little endian).
pub fn serialize<T: bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(data, bincode::config::standard())
        .map_err(|e| BlockchainError::Serialization(format!("Serialization failed: {e}")))
}

/// Decode a complete record; trailing bytes are rejected.
pub fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
    let config = bincode::config::standard().with_limit::<MAX_RECORD_SIZE>();
    let (data, read) = bincode::decode_from_slice(bytes, config)
        .map_err(|e| BlockchainError::Serialization(format!("Deserialization failed: {e}")))?;
    if read != bytes.len() {
        return Err(BlockchainError::Serialization(format!(
            "Trailing data: decoded {read} of {} bytes",
            bytes.len()
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
    struct Record {
        id: u64,
        name: String,
        values: Vec<i64>,
    }

    #[test]
    fn test_serialize_deserialize() {
        let original = Record {
            id: 42,
            name: "record".to_string(),
            values: vec![-1, 0, 1],
        };

        let bytes = serialize(&original).expect("Serialization should work");
        let decoded: Record = deserialize(&bytes).expect("Deserialization should work");
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_deserialize_invalid_data() {
        let result: Result<Record> = deserialize(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_rejects_trailing_bytes() {
        let mut bytes = serialize(&7u64).unwrap();
        bytes.push(0);
        let result: Result<u64> = deserialize(&bytes);
        assert!(matches!(result, Err(BlockchainError::Serialization(_))));
    }

    #[test]
    fn test_oversized_length_prefix_is_refused() {
        // id, then a string length of 2^40 behind the u64 varint marker
        let mut bytes = vec![1u8, 253];
        bytes.extend((1u64 << 40).to_le_bytes());
        let result: Result<Record> = deserialize(&bytes);
        assert!(matches!(result, Err(BlockchainError::Serialization(_))));
    }
}
