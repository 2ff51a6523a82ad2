//! Annotation query functions.

use std::collections::HashMap;

use rusqlite::Connection;
use uuid::Uuid;

use colloquy_model::{Annotation, AnnotationSummary};
use colloquy_types::{AnnotationKind, DatabaseId};

use crate::queries::{peer_from_blob, peer_to_blob};
use crate::Result;

/// Insert or replace one annotation row.
pub fn upsert(conn: &Connection, annotation: &Annotation) -> Result<()> {
    conn.execute(
        "INSERT INTO annotation (cid, descriptor, peerTwincodeOutbound, kind, value,
             creationDate, notificationId)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (cid, descriptor, peerTwincodeOutbound, kind)
         DO UPDATE SET value = ?5, creationDate = ?6",
        rusqlite::params![
            annotation.conversation_id,
            annotation.descriptor_id,
            peer_to_blob(annotation.peer_twincode.as_ref()),
            i64::from(annotation.kind.code()),
            annotation.value,
            annotation.creation_date,
            annotation.notification_id,
        ],
    )?;
    Ok(())
}

/// Remove one participant's annotation of one kind.
pub fn delete(
    conn: &Connection,
    cid: DatabaseId,
    descriptor_id: DatabaseId,
    peer: Option<&Uuid>,
    kind: AnnotationKind,
) -> Result<()> {
    conn.execute(
        "DELETE FROM annotation
         WHERE cid = ?1 AND descriptor = ?2 AND peerTwincodeOutbound = ?3 AND kind = ?4",
        rusqlite::params![
            cid,
            descriptor_id,
            peer_to_blob(peer),
            i64::from(kind.code())
        ],
    )?;
    Ok(())
}

/// All stored rows for one descriptor.
pub fn list_for_descriptor(
    conn: &Connection,
    cid: DatabaseId,
    descriptor_id: DatabaseId,
) -> Result<Vec<Annotation>> {
    let mut stmt = conn.prepare(
        "SELECT peerTwincodeOutbound, kind, value, creationDate, notificationId
         FROM annotation WHERE cid = ?1 AND descriptor = ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![cid, descriptor_id], |row| {
            Ok((
                peer_from_blob(0, row.get(0)?)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows
        .into_iter()
        .filter_map(|(peer, kind, value, creation_date, notification_id)| {
            let kind = AnnotationKind::from_code(kind as u8)?;
            Some(Annotation {
                conversation_id: cid,
                descriptor_id,
                peer_twincode: peer,
                kind,
                value,
                creation_date,
                notification_id,
            })
        })
        .collect())
}

/// Our own rows for one descriptor, for annotation synchronization.
pub fn list_ours(
    conn: &Connection,
    cid: DatabaseId,
    descriptor_id: DatabaseId,
) -> Result<Vec<Annotation>> {
    Ok(list_for_descriptor(conn, cid, descriptor_id)?
        .into_iter()
        .filter(|a| a.peer_twincode.is_none())
        .collect())
}

/// Replace every row a peer has on one descriptor with a fresh set.
pub fn replace_peer_rows(
    conn: &Connection,
    cid: DatabaseId,
    descriptor_id: DatabaseId,
    peer: &Uuid,
    rows: &[(AnnotationKind, i64)],
    now: i64,
) -> Result<()> {
    conn.execute(
        "DELETE FROM annotation
         WHERE cid = ?1 AND descriptor = ?2 AND peerTwincodeOutbound = ?3",
        rusqlite::params![cid, descriptor_id, peer_to_blob(Some(peer))],
    )?;
    for (kind, value) in rows {
        upsert(
            conn,
            &Annotation {
                conversation_id: cid,
                descriptor_id,
                peer_twincode: Some(*peer),
                kind: *kind,
                value: *value,
                creation_date: now,
                notification_id: None,
            },
        )?;
    }
    Ok(())
}

/// The aggregated `(kind, value, count)` summary of one descriptor.
pub fn summary(
    conn: &Connection,
    cid: DatabaseId,
    descriptor_id: DatabaseId,
) -> Result<Vec<AnnotationSummary>> {
    let mut stmt = conn.prepare(
        "SELECT kind, value, COUNT(*) FROM annotation
         WHERE cid = ?1 AND descriptor = ?2
         GROUP BY kind, value ORDER BY kind, value",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![cid, descriptor_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows
        .into_iter()
        .filter_map(|(kind, value, count)| {
            Some(AnnotationSummary {
                kind: AnnotationKind::from_code(kind as u8)?,
                value,
                count,
            })
        })
        .collect())
}

/// One aggregated query covering a batch of descriptors.
pub fn summaries_for(
    conn: &Connection,
    descriptor_ids: &[DatabaseId],
) -> Result<HashMap<DatabaseId, Vec<AnnotationSummary>>> {
    if descriptor_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = vec!["?"; descriptor_ids.len()].join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT descriptor, kind, value, COUNT(*) FROM annotation
         WHERE descriptor IN ({placeholders})
         GROUP BY descriptor, kind, value ORDER BY descriptor, kind, value"
    ))?;
    let params: Vec<&dyn rusqlite::ToSql> = descriptor_ids
        .iter()
        .map(|id| id as &dyn rusqlite::ToSql)
        .collect();
    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut summaries: HashMap<DatabaseId, Vec<AnnotationSummary>> = HashMap::new();
    for (descriptor, kind, value, count) in rows {
        let Some(kind) = AnnotationKind::from_code(kind as u8) else {
            continue;
        };
        summaries
            .entry(descriptor)
            .or_default()
            .push(AnnotationSummary { kind, value, count });
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_model::Descriptor;
    use colloquy_types::DescriptorId;

    fn seed(conn: &Connection) -> (DatabaseId, DatabaseId) {
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
        let cid = crate::queries::conversations::insert(conn, &conversation).expect("conv");
        let descriptor = Descriptor::object(
            DescriptorId::new(0, Uuid::from_u128(3), 1),
            cid,
            100,
            "annotated".into(),
        );
        let did = crate::queries::descriptors::insert(conn, &descriptor).expect("descriptor");
        (cid, did)
    }

    fn like(cid: DatabaseId, did: DatabaseId, peer: Option<Uuid>, value: i64) -> Annotation {
        Annotation {
            conversation_id: cid,
            descriptor_id: did,
            peer_twincode: peer,
            kind: AnnotationKind::Like,
            value,
            creation_date: 50,
            notification_id: None,
        }
    }

    #[test]
    fn test_upsert_replaces_own_row() {
        let conn = crate::open_memory().expect("open");
        let (cid, did) = seed(&conn);

        upsert(&conn, &like(cid, did, None, 3)).expect("upsert");
        upsert(&conn, &like(cid, did, None, 5)).expect("upsert again");

        let rows = list_for_descriptor(&conn, cid, did).expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 5);
        assert_eq!(rows[0].peer_twincode, None);
    }

    #[test]
    fn test_summary_aggregates() {
        let conn = crate::open_memory().expect("open");
        let (cid, did) = seed(&conn);

        upsert(&conn, &like(cid, did, None, 3)).expect("ours");
        upsert(&conn, &like(cid, did, Some(Uuid::new_v4()), 3)).expect("peer a");
        upsert(&conn, &like(cid, did, Some(Uuid::new_v4()), 8)).expect("peer b");

        let summary = summary(&conn, cid, did).expect("summary");
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].value, 3);
        assert_eq!(summary[0].count, 2);
        assert_eq!(summary[1].value, 8);
        assert_eq!(summary[1].count, 1);
    }

    #[test]
    fn test_replace_peer_rows() {
        let conn = crate::open_memory().expect("open");
        let (cid, did) = seed(&conn);
        let peer = Uuid::new_v4();

        upsert(&conn, &like(cid, did, Some(peer), 3)).expect("old");
        replace_peer_rows(
            &conn,
            cid,
            did,
            &peer,
            &[(AnnotationKind::Like, 9), (AnnotationKind::Save, 0)],
            60,
        )
        .expect("replace");

        let rows = list_for_descriptor(&conn, cid, did).expect("list");
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .all(|r| r.peer_twincode == Some(peer) && r.creation_date == 60));
    }

    #[test]
    fn test_annotations_cascade_with_descriptor() {
        let conn = crate::open_memory().expect("open");
        let (cid, did) = seed(&conn);
        upsert(&conn, &like(cid, did, None, 1)).expect("upsert");

        crate::queries::descriptors::delete_by_ids(&conn, &[did]).expect("delete");
        assert!(list_for_descriptor(&conn, cid, did)
            .expect("list")
            .is_empty());
    }

    #[test]
    fn test_batch_summaries() {
        let conn = crate::open_memory().expect("open");
        let (cid, did) = seed(&conn);
        upsert(&conn, &like(cid, did, None, 4)).expect("upsert");

        let map = summaries_for(&conn, &[did]).expect("batch");
        assert_eq!(map.get(&did).expect("entry").len(), 1);
        assert!(summaries_for(&conn, &[]).expect("empty").is_empty());
    }
}
