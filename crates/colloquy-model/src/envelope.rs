//! Common descriptor envelope.

use colloquy_codec::{Decoder, Encoder, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use colloquy_types::{DatabaseId, DescriptorId, TIMESTAMP_PENDING};

use crate::annotation::AnnotationSummary;
use crate::schema::ENVELOPE_VERSION_4;

/// Attributes shared by every descriptor variant.
///
/// All dates are epoch milliseconds. `0` means pending, `-1` records a
/// permanent failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Descriptor identity (local row id + owner twincode + sequence).
    pub id: DescriptorId,
    /// Owning conversation row id.
    pub conversation_id: DatabaseId,
    /// When set, the descriptor is addressed to this single group member.
    pub send_to: Option<Uuid>,
    /// The descriptor this one replies to, when any.
    pub reply_to: Option<DescriptorId>,
    /// Creation time at the owner.
    pub creation_date: i64,
    /// When the peer acknowledged reception (sender side).
    pub send_date: i64,
    /// When we received it (receiver side).
    pub receive_date: i64,
    /// When it was read.
    pub read_date: i64,
    /// When the content was last edited.
    pub update_date: i64,
    /// When the peer deleted its copy.
    pub peer_delete_date: i64,
    /// When we deleted our copy.
    pub delete_date: i64,
    /// Milliseconds after read before the descriptor expires; `0` disables.
    pub expire_timeout: i64,
    /// Flag bitmap (copy-allowed, has-thumbnail, updated, call bits).
    pub flags: u32,
    /// Aggregated annotation summary attached on load.
    pub annotations: Vec<AnnotationSummary>,
}

impl Envelope {
    /// Envelope for a locally created, not yet dispatched descriptor.
    pub fn outgoing(id: DescriptorId, conversation_id: DatabaseId, now: i64) -> Self {
        Self {
            id,
            conversation_id,
            send_to: None,
            reply_to: None,
            creation_date: now,
            send_date: TIMESTAMP_PENDING,
            receive_date: TIMESTAMP_PENDING,
            read_date: TIMESTAMP_PENDING,
            update_date: 0,
            peer_delete_date: 0,
            delete_date: 0,
            expire_timeout: 0,
            flags: 0,
            annotations: Vec::new(),
        }
    }

    /// Envelope for a descriptor received from the wire.
    ///
    /// Peer-supplied dates are clamped to `now`; clocks across devices are
    /// not trusted to agree.
    pub fn received(id: DescriptorId, conversation_id: DatabaseId, now: i64) -> Self {
        let mut envelope = Self::outgoing(id, conversation_id, now);
        envelope.receive_date = now;
        envelope
    }

    /// Clamp peer-supplied creation/send dates to `now`.
    pub fn clamp_peer_dates(&mut self, now: i64) {
        if self.creation_date > now {
            self.creation_date = now;
        }
        if self.send_date > now {
            self.send_date = now;
        }
    }

    /// Whether the descriptor has expired at `now`.
    ///
    /// Active only when an expire timeout is set: a read descriptor expires
    /// `expire_timeout` ms after its read date, and a descriptor whose read
    /// date records a permanent delivery failure is expired immediately.
    pub fn is_expired(&self, now: i64) -> bool {
        if self.expire_timeout <= 0 {
            return false;
        }
        if self.read_date < 0 {
            return true;
        }
        self.read_date > 0 && now > self.read_date + self.expire_timeout
    }

    /// Test one flag bit.
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Set or clear one flag bit.
    pub fn set_flag(&mut self, flag: u32, enabled: bool) {
        if enabled {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Encode the wire form of the envelope.
    ///
    /// Version 3 carries identity, dates and flags; version 4 appends the
    /// expire timeout and the addressing extensions.
    pub fn encode(&self, encoder: &mut Encoder, version: i32) {
        encoder.write_uuid(&self.id.twincode_outbound_id);
        encoder.write_long(self.id.sequence_id);
        encoder.write_long(self.creation_date);
        encoder.write_long(self.send_date);
        encoder.write_long(i64::from(self.flags));
        if version >= ENVELOPE_VERSION_4 {
            encoder.write_long(self.expire_timeout);
            encoder.write_optional_uuid(self.send_to.as_ref());
            match &self.reply_to {
                None => encoder.write_u8(0),
                Some(reply) => {
                    encoder.write_u8(1);
                    encoder.write_uuid(&reply.twincode_outbound_id);
                    encoder.write_long(reply.sequence_id);
                }
            }
        }
    }

    /// Decode the wire form of the envelope.
    ///
    /// The local row id is `0` until the store assigns one; receive/read
    /// dates start pending.
    pub fn decode(decoder: &mut Decoder<'_>, version: i32) -> Result<Self> {
        let twincode = decoder.read_uuid()?;
        let sequence_id = decoder.read_long()?;
        let creation_date = decoder.read_long()?;
        let send_date = decoder.read_long()?;
        let flags = decoder.read_long()? as u32;

        let mut envelope = Self {
            id: DescriptorId::remote(twincode, sequence_id),
            conversation_id: 0,
            send_to: None,
            reply_to: None,
            creation_date,
            send_date,
            receive_date: TIMESTAMP_PENDING,
            read_date: TIMESTAMP_PENDING,
            update_date: 0,
            peer_delete_date: 0,
            delete_date: 0,
            expire_timeout: 0,
            flags,
            annotations: Vec::new(),
        };

        if version >= ENVELOPE_VERSION_4 {
            envelope.expire_timeout = decoder.read_long()?;
            envelope.send_to = decoder.read_optional_uuid()?;
            envelope.reply_to = match decoder.read_u8()? {
                0 => None,
                _ => {
                    let reply_twincode = decoder.read_uuid()?;
                    let reply_sequence = decoder.read_long()?;
                    Some(DescriptorId::remote(reply_twincode, reply_sequence))
                }
            };
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ENVELOPE_VERSION_3;
    use colloquy_types::{FLAG_COPY_ALLOWED, FLAG_HAS_THUMBNAIL};

    fn sample_id() -> DescriptorId {
        DescriptorId::new(5, Uuid::new_v4(), 9)
    }

    #[test]
    fn test_not_expired_without_timeout() {
        let mut envelope = Envelope::outgoing(sample_id(), 1, 1000);
        envelope.read_date = 1000;
        assert!(!envelope.is_expired(i64::MAX));
    }

    #[test]
    fn test_expired_after_read_plus_timeout() {
        let mut envelope = Envelope::outgoing(sample_id(), 1, 1000);
        envelope.expire_timeout = 1000;
        envelope.read_date = 5000;
        assert!(!envelope.is_expired(6000));
        assert!(envelope.is_expired(6001));
    }

    #[test]
    fn test_failed_delivery_expires_immediately() {
        let mut envelope = Envelope::outgoing(sample_id(), 1, 1000);
        envelope.expire_timeout = 60_000;
        envelope.read_date = -1;
        assert!(envelope.is_expired(1001));
    }

    #[test]
    fn test_unread_does_not_expire() {
        let mut envelope = Envelope::outgoing(sample_id(), 1, 1000);
        envelope.expire_timeout = 1000;
        assert!(!envelope.is_expired(i64::MAX));
    }

    #[test]
    fn test_clamp_peer_dates() {
        let mut envelope = Envelope::outgoing(sample_id(), 1, 9_999_999);
        envelope.send_date = 9_999_998;
        envelope.clamp_peer_dates(5000);
        assert_eq!(envelope.creation_date, 5000);
        assert_eq!(envelope.send_date, 5000);
    }

    #[test]
    fn test_flags() {
        let mut envelope = Envelope::outgoing(sample_id(), 1, 0);
        envelope.set_flag(FLAG_COPY_ALLOWED, true);
        assert!(envelope.has_flag(FLAG_COPY_ALLOWED));
        assert!(!envelope.has_flag(FLAG_HAS_THUMBNAIL));
        envelope.set_flag(FLAG_COPY_ALLOWED, false);
        assert!(!envelope.has_flag(FLAG_COPY_ALLOWED));
    }

    #[test]
    fn test_wire_roundtrip_v4() {
        let mut envelope = Envelope::outgoing(sample_id(), 3, 1_700_000_000_000);
        envelope.expire_timeout = 30_000;
        envelope.send_to = Some(Uuid::new_v4());
        envelope.reply_to = Some(DescriptorId::remote(Uuid::new_v4(), 17));
        envelope.flags = FLAG_COPY_ALLOWED;

        let mut encoder = Encoder::new();
        envelope.encode(&mut encoder, ENVELOPE_VERSION_4);
        let bytes = encoder.into_bytes();

        let mut decoder = Decoder::new(&bytes);
        let decoded = Envelope::decode(&mut decoder, ENVELOPE_VERSION_4).expect("decode");
        assert_eq!(
            decoded.id.twincode_outbound_id,
            envelope.id.twincode_outbound_id
        );
        assert_eq!(decoded.id.sequence_id, 9);
        assert_eq!(decoded.expire_timeout, 30_000);
        assert_eq!(decoded.send_to, envelope.send_to);
        assert_eq!(decoded.reply_to, envelope.reply_to);
        assert_eq!(decoded.flags, FLAG_COPY_ALLOWED);
    }

    #[test]
    fn test_wire_roundtrip_v3_drops_extensions() {
        let mut envelope = Envelope::outgoing(sample_id(), 3, 42);
        envelope.expire_timeout = 30_000;
        envelope.send_to = Some(Uuid::new_v4());

        let mut encoder = Encoder::new();
        envelope.encode(&mut encoder, ENVELOPE_VERSION_3);
        let bytes = encoder.into_bytes();

        let mut decoder = Decoder::new(&bytes);
        let decoded = Envelope::decode(&mut decoder, ENVELOPE_VERSION_3).expect("decode");
        assert_eq!(decoded.expire_timeout, 0);
        assert_eq!(decoded.send_to, None);
        assert!(decoder.is_empty());
    }
}
