//! Descriptor query functions.
//!
//! The envelope lives in table columns (authoritative); the `content`
//! blob carries only the schema header and the variant payload. For
//! file-bearing rows the `value` column is the media length, so clearing
//! media does not rewrite the blob; for invitations it is the status code.

use rusqlite::{Connection, Row};
use uuid::Uuid;

use colloquy_codec::{Decoder, Encoder};
use colloquy_model::{Descriptor, Envelope};
use colloquy_types::{DatabaseId, DescriptorId, DescriptorType, InvitationStatus};

use crate::queries::{optional_uuid_from_blob, reply_from_blob, reply_to_blob, uuid_from_blob};
use crate::Result;

const COLUMNS: &str = "id, cid, sequenceId, twincodeOutbound, sentTo, replyTo,
    descriptorType, creationDate, sendDate, receiveDate, readDate, updateDate,
    peerDeleteDate, deleteDate, expireTimeout, flags, value, content";

/// Which timestamp column an update targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateColumn {
    Send,
    Receive,
    Read,
    Update,
    PeerDelete,
    Delete,
}

impl DateColumn {
    fn column(self) -> &'static str {
        match self {
            Self::Send => "sendDate",
            Self::Receive => "receiveDate",
            Self::Read => "readDate",
            Self::Update => "updateDate",
            Self::PeerDelete => "peerDeleteDate",
            Self::Delete => "deleteDate",
        }
    }
}

/// Filter over call records when listing conversation tails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallsMode {
    /// All descriptor types.
    Include,
    /// Everything except call records.
    Exclude,
    /// Call records only.
    Only,
}

/// Planning view of a descriptor row, without payload hydration.
#[derive(Clone, Debug)]
pub struct DescriptorRow {
    pub id: DatabaseId,
    pub twincode_outbound: Uuid,
    pub sequence_id: i64,
    pub descriptor_type: u8,
    pub value: i64,
    pub creation_date: i64,
    pub delete_date: i64,
    pub peer_delete_date: i64,
}

fn value_for(descriptor: &Descriptor) -> i64 {
    match descriptor {
        Descriptor::File(d) => d.file.length,
        Descriptor::Invitation(d) => i64::from(d.status.code()),
        _ => 0,
    }
}

fn content_for(descriptor: &Descriptor) -> Vec<u8> {
    let mut encoder = Encoder::new();
    descriptor.encode_stored(&mut encoder);
    encoder.into_bytes()
}

/// Insert a descriptor row; returns the allocated row id.
pub fn insert(conn: &Connection, descriptor: &Descriptor) -> Result<DatabaseId> {
    let envelope = descriptor.envelope();
    conn.execute(
        "INSERT INTO descriptor (cid, sequenceId, twincodeOutbound, sentTo, replyTo,
             descriptorType, creationDate, sendDate, receiveDate, readDate, updateDate,
             peerDeleteDate, deleteDate, expireTimeout, flags, value, content)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        rusqlite::params![
            envelope.conversation_id,
            envelope.id.sequence_id,
            envelope.id.twincode_outbound_id.as_bytes().as_slice(),
            envelope.send_to.map(|u| u.as_bytes().to_vec()),
            envelope.reply_to.as_ref().map(reply_to_blob),
            i64::from(descriptor.descriptor_type().code()),
            envelope.creation_date,
            envelope.send_date,
            envelope.receive_date,
            envelope.read_date,
            envelope.update_date,
            envelope.peer_delete_date,
            envelope.delete_date,
            envelope.expire_timeout,
            i64::from(envelope.flags),
            value_for(descriptor),
            content_for(descriptor),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Rewrite the mutable columns of an existing row after an edit.
pub fn update(conn: &Connection, descriptor: &Descriptor) -> Result<()> {
    let envelope = descriptor.envelope();
    conn.execute(
        "UPDATE descriptor SET sendDate = ?1, receiveDate = ?2, readDate = ?3,
             updateDate = ?4, peerDeleteDate = ?5, deleteDate = ?6, expireTimeout = ?7,
             flags = ?8, value = ?9, content = ?10
         WHERE id = ?11",
        rusqlite::params![
            envelope.send_date,
            envelope.receive_date,
            envelope.read_date,
            envelope.update_date,
            envelope.peer_delete_date,
            envelope.delete_date,
            envelope.expire_timeout,
            i64::from(envelope.flags),
            value_for(descriptor),
            content_for(descriptor),
            envelope.id.database_id,
        ],
    )?;
    Ok(())
}

/// Set a single timestamp column.
pub fn set_date(conn: &Connection, id: DatabaseId, column: DateColumn, value: i64) -> Result<()> {
    conn.execute(
        &format!("UPDATE descriptor SET {} = ?1 WHERE id = ?2", column.column()),
        rusqlite::params![value, id],
    )?;
    Ok(())
}

/// Mark a descriptor as permanently undeliverable.
pub fn mark_failed(conn: &Connection, id: DatabaseId) -> Result<()> {
    conn.execute(
        "UPDATE descriptor SET sendDate = -1, receiveDate = -1, readDate = -1 WHERE id = ?1",
        [id],
    )?;
    Ok(())
}

fn hydrate(row: &Row<'_>) -> rusqlite::Result<Option<Descriptor>> {
    let id: DatabaseId = row.get(0)?;
    let cid: DatabaseId = row.get(1)?;
    let sequence_id: i64 = row.get(2)?;
    let twincode = uuid_from_blob(3, row.get(3)?)?;
    let sent_to = optional_uuid_from_blob(4, row.get(4)?)?;
    let reply_to = row
        .get::<_, Option<Vec<u8>>>(5)?
        .map(|blob| reply_from_blob(5, blob))
        .transpose()?;
    let descriptor_type: i64 = row.get(6)?;
    let value: i64 = row.get(16)?;
    let content: Option<Vec<u8>> = row.get(17)?;

    let envelope = Envelope {
        id: DescriptorId::new(id, twincode, sequence_id),
        conversation_id: cid,
        send_to: sent_to,
        reply_to,
        creation_date: row.get(7)?,
        send_date: row.get(8)?,
        receive_date: row.get(9)?,
        read_date: row.get(10)?,
        update_date: row.get(11)?,
        peer_delete_date: row.get(12)?,
        delete_date: row.get(13)?,
        expire_timeout: row.get(14)?,
        flags: row.get::<_, i64>(15)? as u32,
        annotations: Vec::new(),
    };

    let Some(content) = content else {
        tracing::warn!(id, descriptor_type, "descriptor row has no content; dropped");
        return Ok(None);
    };
    let mut decoder = Decoder::new(&content);
    let decoded = match Descriptor::decode_stored(&mut decoder, envelope) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!(id, error = %e, "descriptor content undecodable; dropped");
            return Ok(None);
        }
    };
    let Some(mut descriptor) = decoded else {
        tracing::warn!(id, descriptor_type, "unknown descriptor schema; dropped");
        return Ok(None);
    };

    // The value column is authoritative over the blob copy.
    match &mut descriptor {
        Descriptor::File(d) => d.file.length = value,
        Descriptor::Invitation(d) => {
            if let Some(status) = InvitationStatus::from_code(value as u8) {
                d.status = status;
            }
        }
        _ => {}
    }
    Ok(Some(descriptor))
}

/// Load one descriptor by row id, without its annotation summary.
pub fn get_by_id(conn: &Connection, id: DatabaseId) -> Result<Option<Descriptor>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM descriptor WHERE id = ?1"))?;
    let mut rows = stmt.query_map([id], hydrate)?;
    Ok(rows.next().transpose()?.flatten())
}

/// Load one descriptor by its wire identity.
pub fn get_by_pair(
    conn: &Connection,
    cid: DatabaseId,
    twincode: &Uuid,
    sequence_id: i64,
) -> Result<Option<Descriptor>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM descriptor
         WHERE cid = ?1 AND twincodeOutbound = ?2 AND sequenceId = ?3"
    ))?;
    let mut rows = stmt.query_map(
        rusqlite::params![cid, twincode.as_bytes().as_slice(), sequence_id],
        hydrate,
    )?;
    Ok(rows.next().transpose()?.flatten())
}

/// Newest-first page of a conversation's history.
pub fn list_before(
    conn: &Connection,
    cid: DatabaseId,
    before: i64,
    limit: usize,
) -> Result<Vec<Descriptor>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM descriptor
         WHERE cid = ?1 AND creationDate < ?2
         ORDER BY creationDate DESC, id DESC LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![cid, before, limit as i64], hydrate)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows.into_iter().flatten().collect())
}

/// The newest descriptor of every conversation, with the call filter.
pub fn list_last(conn: &Connection, calls_mode: CallsMode) -> Result<Vec<Descriptor>> {
    let call_code = i64::from(DescriptorType::Call.code());
    let filter = match calls_mode {
        CallsMode::Include => String::new(),
        CallsMode::Exclude => format!("WHERE descriptorType != {call_code}"),
        CallsMode::Only => format!("WHERE descriptorType = {call_code}"),
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM descriptor d
         JOIN (SELECT cid AS lcid, MAX(creationDate) AS latest
               FROM descriptor {filter} GROUP BY cid) last
           ON d.cid = last.lcid AND d.creationDate = last.latest
         GROUP BY d.cid
         ORDER BY d.creationDate DESC"
    ))?;
    let rows = stmt
        .query_map([], hydrate)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows.into_iter().flatten().collect())
}

/// Text search over message bodies, newest first.
///
/// Message text lives inside the content blob, so candidate rows are
/// decoded and filtered here rather than in SQL.
pub fn search(
    conn: &Connection,
    cids: &[DatabaseId],
    text: &str,
    before: i64,
    limit: usize,
) -> Result<Vec<Descriptor>> {
    if cids.is_empty() || text.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; cids.len()].join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM descriptor
         WHERE cid IN ({placeholders}) AND descriptorType = ?{n} AND creationDate < ?{m}
         ORDER BY creationDate DESC, id DESC",
        n = cids.len() + 1,
        m = cids.len() + 2,
    ))?;

    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::with_capacity(cids.len() + 2);
    for cid in cids {
        params.push(Box::new(*cid));
    }
    params.push(Box::new(i64::from(DescriptorType::Object.code())));
    params.push(Box::new(before));
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let needle = text.to_lowercase();
    let mut matches = Vec::new();
    let rows = stmt.query_map(param_refs.as_slice(), hydrate)?;
    for row in rows {
        let Some(descriptor) = row? else { continue };
        if let Descriptor::Object(ref object) = descriptor {
            if object.message.to_lowercase().contains(&needle) {
                matches.push(descriptor);
                if matches.len() >= limit {
                    break;
                }
            }
        }
    }
    Ok(matches)
}

fn row_to_planning(row: &Row<'_>) -> rusqlite::Result<DescriptorRow> {
    Ok(DescriptorRow {
        id: row.get(0)?,
        twincode_outbound: uuid_from_blob(1, row.get(1)?)?,
        sequence_id: row.get(2)?,
        descriptor_type: row.get::<_, i64>(3)? as u8,
        value: row.get(4)?,
        creation_date: row.get(5)?,
        delete_date: row.get(6)?,
        peer_delete_date: row.get(7)?,
    })
}

const PLANNING_COLUMNS: &str = "id, twincodeOutbound, sequenceId, descriptorType,
    value, creationDate, deleteDate, peerDeleteDate";

/// Rows of one owner at or below a sequence bound, for reset planning.
pub fn rows_older_or_equal(
    conn: &Connection,
    cid: DatabaseId,
    twincode: &Uuid,
    max_sequence: i64,
) -> Result<Vec<DescriptorRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PLANNING_COLUMNS} FROM descriptor
         WHERE cid = ?1 AND twincodeOutbound = ?2 AND sequenceId <= ?3"
    ))?;
    let rows = stmt
        .query_map(
            rusqlite::params![cid, twincode.as_bytes().as_slice(), max_sequence],
            row_to_planning,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Rows created at or before a date, for media-purge planning.
pub fn rows_before(conn: &Connection, cid: DatabaseId, before: i64) -> Result<Vec<DescriptorRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PLANNING_COLUMNS} FROM descriptor
         WHERE cid = ?1 AND creationDate <= ?2"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![cid, before], row_to_planning)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Delete rows by id. Annotations cascade.
pub fn delete_by_ids(conn: &Connection, ids: &[DatabaseId]) -> Result<()> {
    let mut stmt = conn.prepare("DELETE FROM descriptor WHERE id = ?1")?;
    for id in ids {
        stmt.execute([id])?;
    }
    Ok(())
}

/// Zero the media length of the given rows, keeping the messages.
pub fn zero_media(conn: &Connection, ids: &[DatabaseId]) -> Result<()> {
    let mut stmt = conn.prepare("UPDATE descriptor SET value = 0 WHERE id = ?1")?;
    for id in ids {
        stmt.execute([id])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_model::FileInfo;

    fn store_object(conn: &Connection, cid: DatabaseId, seq: i64, message: &str) -> DatabaseId {
        let descriptor = Descriptor::object(
            DescriptorId::new(0, Uuid::from_u128(7), seq),
            cid,
            1000 + seq,
            message.into(),
        );
        insert(conn, &descriptor).expect("insert descriptor")
    }

    fn test_conversation(conn: &Connection) -> DatabaseId {
        let conversation = colloquy_model::Conversation {
            database_id: 0,
            group_id: None,
            uuid: Uuid::new_v4(),
            creation_date: 0,
            subject: Uuid::new_v4(),
            invited_contact: None,
            peer_twincode_outbound: Some(Uuid::new_v4()),
            twincode_outbound: Uuid::new_v4(),
            resource_id: Uuid::new_v4(),
            peer_resource_id: None,
            permissions: 0,
            join_permissions: 0,
            state: None,
            next_sequence_id: 1,
            last_connect_date: None,
            last_retry_date: None,
            flags: 0,
        };
        crate::queries::conversations::insert(conn, &conversation).expect("conversation")
    }

    #[test]
    fn test_insert_and_hydrate() {
        let conn = crate::open_memory().expect("open");
        let cid = test_conversation(&conn);
        let id = store_object(&conn, cid, 1, "hello");

        let loaded = get_by_id(&conn, id).expect("get").expect("descriptor");
        assert_eq!(loaded.envelope().id.database_id, id);
        assert_eq!(loaded.envelope().conversation_id, cid);
        match loaded {
            Descriptor::Object(d) => assert_eq!(d.message, "hello"),
            _ => unreachable!("wrong variant"),
        }
    }

    #[test]
    fn test_get_by_pair() {
        let conn = crate::open_memory().expect("open");
        let cid = test_conversation(&conn);
        store_object(&conn, cid, 5, "by pair");

        let loaded = get_by_pair(&conn, cid, &Uuid::from_u128(7), 5)
            .expect("get")
            .expect("descriptor");
        assert_eq!(loaded.envelope().id.sequence_id, 5);
        assert!(get_by_pair(&conn, cid, &Uuid::from_u128(7), 6)
            .expect("get")
            .is_none());
    }

    #[test]
    fn test_value_column_overrides_file_length() {
        let conn = crate::open_memory().expect("open");
        let cid = test_conversation(&conn);
        let descriptor = Descriptor::file(
            DescriptorId::new(0, Uuid::from_u128(9), 1),
            cid,
            10,
            DescriptorType::Image,
            FileInfo {
                path: "blobs/img".into(),
                extension: Some("jpg".into()),
                length: 5000,
                thumbnail: None,
            },
        );
        let id = insert(&conn, &descriptor).expect("insert");
        zero_media(&conn, &[id]).expect("zero");

        let loaded = get_by_id(&conn, id).expect("get").expect("descriptor");
        assert_eq!(loaded.file_info().expect("file").length, 0);
    }

    #[test]
    fn test_timestamp_update_and_mark_failed() {
        let conn = crate::open_memory().expect("open");
        let cid = test_conversation(&conn);
        let id = store_object(&conn, cid, 1, "ts");

        set_date(&conn, id, DateColumn::Send, 1_700_000_000_000).expect("set");
        let loaded = get_by_id(&conn, id).expect("get").expect("descriptor");
        assert_eq!(loaded.envelope().send_date, 1_700_000_000_000);

        mark_failed(&conn, id).expect("fail");
        let failed = get_by_id(&conn, id).expect("get").expect("descriptor");
        assert_eq!(failed.envelope().send_date, -1);
        assert_eq!(failed.envelope().read_date, -1);
        assert_eq!(failed.envelope().receive_date, -1);
    }

    #[test]
    fn test_list_before_pages_newest_first() {
        let conn = crate::open_memory().expect("open");
        let cid = test_conversation(&conn);
        for seq in 1..=5 {
            store_object(&conn, cid, seq, &format!("m{seq}"));
        }
        let page = list_before(&conn, cid, i64::MAX, 2).expect("list");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].envelope().id.sequence_id, 5);
        assert_eq!(page[1].envelope().id.sequence_id, 4);
    }

    #[test]
    fn test_search_matches_case_insensitive() {
        let conn = crate::open_memory().expect("open");
        let cid = test_conversation(&conn);
        store_object(&conn, cid, 1, "Fondue tonight?");
        store_object(&conn, cid, 2, "no thanks");

        let hits = search(&conn, &[cid], "fondue", i64::MAX, 10).expect("search");
        assert_eq!(hits.len(), 1);
        match &hits[0] {
            Descriptor::Object(d) => assert!(d.message.contains("Fondue")),
            _ => unreachable!("wrong variant"),
        }
    }

    #[test]
    fn test_rows_older_or_equal() {
        let conn = crate::open_memory().expect("open");
        let cid = test_conversation(&conn);
        for seq in 1..=4 {
            store_object(&conn, cid, seq, "x");
        }
        let rows = rows_older_or_equal(&conn, cid, &Uuid::from_u128(7), 2).expect("rows");
        assert_eq!(rows.len(), 2);
        delete_by_ids(&conn, &rows.iter().map(|r| r.id).collect::<Vec<_>>()).expect("delete");
        assert_eq!(
            rows_older_or_equal(&conn, cid, &Uuid::from_u128(7), 10)
                .expect("rows")
                .len(),
            2
        );
    }
}
