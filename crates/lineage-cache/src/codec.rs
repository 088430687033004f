//! MessagePack encoding of answers for the distributed tier.

use lineage_storage::MaterializedAnswer;

use crate::error::CacheError;

/// Encodes answers as MessagePack with field names, so added fields stay
/// readable by older instances during a rolling deploy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerCodec;

impl AnswerCodec {
    pub fn encode(&self, answer: &MaterializedAnswer) -> Result<Vec<u8>, CacheError> {
        rmp_serde::to_vec_named(answer).map_err(|e| CacheError::codec(e.to_string()))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<MaterializedAnswer, CacheError> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_storage::{EntityId, EntityPath, SourceHash};
    use time::OffsetDateTime;

    #[test]
    fn test_preserves_timestamps_and_arrays() {
        let answer = MaterializedAnswer {
            entity_id: EntityId::new("e1"),
            path: EntityPath::parse("root.acme.division_a").unwrap(),
            ancestors: vec!["root".into(), "Acme Corp".into()],
            descendant_count: 12,
            computed_at: OffsetDateTime::from_unix_timestamp(1_760_000_000).unwrap(),
            source_hash: SourceHash(42),
        };
        let codec = AnswerCodec;
        let bytes = codec.encode(&answer).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), answer);
    }

    #[test]
    fn test_garbage_is_codec_error() {
        let err = AnswerCodec.decode(&[0xc1, 0x00, 0xff]).unwrap_err();
        assert!(matches!(err, CacheError::Codec { .. }));
        assert!(!err.is_transient());
    }
}
