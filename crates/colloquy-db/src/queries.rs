//! Query functions, one module per table.
//!
//! All functions take a `&Connection` (or transaction) and leave
//! transaction boundaries to the caller; the [`crate::store::Store`]
//! facade wraps the multi-table contracts.

pub mod annotations;
pub mod conversations;
pub mod descriptors;
pub mod invitations;
pub mod operations;

use uuid::Uuid;

/// Convert a 16-byte blob column into a UUID.
pub(crate) fn uuid_from_blob(index: usize, blob: Vec<u8>) -> rusqlite::Result<Uuid> {
    Uuid::from_slice(&blob).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Blob, Box::new(e))
    })
}

/// Convert an optional 16-byte blob column into an optional UUID.
pub(crate) fn optional_uuid_from_blob(
    index: usize,
    blob: Option<Vec<u8>>,
) -> rusqlite::Result<Option<Uuid>> {
    blob.map(|b| uuid_from_blob(index, b)).transpose()
}

/// Annotation rows store "us" as the zero twincode; NULLs inside a SQLite
/// primary key compare distinct and would allow duplicates.
pub(crate) fn peer_to_blob(peer: Option<&Uuid>) -> Vec<u8> {
    peer.copied().unwrap_or_else(Uuid::nil).as_bytes().to_vec()
}

/// Inverse of [`peer_to_blob`].
pub(crate) fn peer_from_blob(index: usize, blob: Vec<u8>) -> rusqlite::Result<Option<Uuid>> {
    let uuid = uuid_from_blob(index, blob)?;
    Ok((!uuid.is_nil()).then_some(uuid))
}

/// A reply reference persisted as a 24-byte blob:
/// 16 bytes of twincode followed by the big-endian sequence id.
pub(crate) fn reply_to_blob(reply: &colloquy_types::DescriptorId) -> Vec<u8> {
    let mut blob = Vec::with_capacity(24);
    blob.extend_from_slice(reply.twincode_outbound_id.as_bytes());
    blob.extend_from_slice(&reply.sequence_id.to_be_bytes());
    blob
}

/// Inverse of [`reply_to_blob`].
pub(crate) fn reply_from_blob(
    index: usize,
    blob: Vec<u8>,
) -> rusqlite::Result<colloquy_types::DescriptorId> {
    if blob.len() != 24 {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Blob,
            "reply reference must be 24 bytes".into(),
        ));
    }
    let twincode = uuid_from_blob(index, blob[..16].to_vec())?;
    let mut sequence = [0u8; 8];
    sequence.copy_from_slice(&blob[16..]);
    Ok(colloquy_types::DescriptorId::remote(
        twincode,
        i64::from_be_bytes(sequence),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_blob_roundtrip() {
        let peer = Uuid::new_v4();
        assert_eq!(
            peer_from_blob(0, peer_to_blob(Some(&peer))).expect("blob"),
            Some(peer)
        );
        assert_eq!(peer_from_blob(0, peer_to_blob(None)).expect("blob"), None);
    }

    #[test]
    fn test_reply_blob_roundtrip() {
        let reply = colloquy_types::DescriptorId::remote(Uuid::new_v4(), -17);
        let decoded = reply_from_blob(0, reply_to_blob(&reply)).expect("blob");
        assert_eq!(decoded.twincode_outbound_id, reply.twincode_outbound_id);
        assert_eq!(decoded.sequence_id, -17);
    }

    #[test]
    fn test_reply_blob_wrong_length_rejected() {
        assert!(reply_from_blob(0, vec![1, 2, 3]).is_err());
    }
}
