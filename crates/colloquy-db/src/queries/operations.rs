//! Operation query functions.

use rusqlite::{Connection, Row};

use colloquy_types::DatabaseId;

use crate::Result;

/// One persisted operation row, as loaded at startup.
#[derive(Clone, Debug)]
pub struct OperationRow {
    pub id: DatabaseId,
    pub creation_date: i64,
    pub conversation_id: DatabaseId,
    /// Raw type code; unknown codes are dropped by the loader.
    pub op_type: u8,
    pub descriptor_id: Option<DatabaseId>,
    pub chunk_start: Option<i64>,
    pub content: Option<Vec<u8>>,
}

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<OperationRow> {
    Ok(OperationRow {
        id: row.get(0)?,
        creation_date: row.get(1)?,
        conversation_id: row.get(2)?,
        op_type: row.get::<_, i64>(3)? as u8,
        descriptor_id: row.get(4)?,
        chunk_start: row.get(5)?,
        content: row.get(6)?,
    })
}

/// Insert an operation row; returns the allocated id.
pub fn insert(
    conn: &Connection,
    creation_date: i64,
    conversation_id: DatabaseId,
    op_type: u8,
    descriptor_id: Option<DatabaseId>,
    chunk_start: Option<i64>,
    content: Option<&[u8]>,
) -> Result<DatabaseId> {
    conn.execute(
        "INSERT INTO operation (creationDate, cid, type, descriptor, chunkStart, content)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            creation_date,
            conversation_id,
            i64::from(op_type),
            descriptor_id,
            chunk_start,
            content,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// All persisted operations in creation order.
pub fn list_all(conn: &Connection) -> Result<Vec<OperationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, creationDate, cid, type, descriptor, chunkStart, content
         FROM operation ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], row_to_operation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Record sliding-window progress of a file push.
pub fn update_chunk_start(conn: &Connection, id: DatabaseId, chunk_start: i64) -> Result<()> {
    conn.execute(
        "UPDATE operation SET chunkStart = ?1 WHERE id = ?2",
        rusqlite::params![chunk_start, id],
    )?;
    Ok(())
}

/// Delete one completed or abandoned operation.
pub fn delete(conn: &Connection, id: DatabaseId) -> Result<()> {
    conn.execute("DELETE FROM operation WHERE id = ?1", [id])?;
    Ok(())
}

/// Delete every operation of one conversation.
pub fn delete_for_conversation(conn: &Connection, conversation_id: DatabaseId) -> Result<()> {
    conn.execute("DELETE FROM operation WHERE cid = ?1", [conversation_id])?;
    Ok(())
}

/// Ids of operations that reference any of the given descriptors.
pub fn ids_for_descriptors(
    conn: &Connection,
    descriptor_ids: &[DatabaseId],
) -> Result<Vec<DatabaseId>> {
    if descriptor_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; descriptor_ids.len()].join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM operation WHERE descriptor IN ({placeholders})"
    ))?;
    let params: Vec<&dyn rusqlite::ToSql> = descriptor_ids
        .iter()
        .map(|id| id as &dyn rusqlite::ToSql)
        .collect();
    let rows = stmt
        .query_map(params.as_slice(), |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Delete a batch of operations by id.
pub fn delete_by_ids(conn: &Connection, ids: &[DatabaseId]) -> Result<()> {
    let mut stmt = conn.prepare("DELETE FROM operation WHERE id = ?1")?;
    for id in ids {
        stmt.execute([id])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

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
    fn test_insert_list_delete() {
        let conn = crate::open_memory().expect("open");
        let cid = test_conversation(&conn);

        let a = insert(&conn, 100, cid, 2, None, None, None).expect("insert");
        let b = insert(&conn, 200, cid, 4, Some(7), Some(-1), Some(&[1, 2])).expect("insert");

        let rows = list_all(&conn).expect("list");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, a);
        assert_eq!(rows[1].chunk_start, Some(-1));
        assert_eq!(rows[1].content.as_deref(), Some(&[1u8, 2][..]));

        delete(&conn, a).expect("delete");
        assert_eq!(list_all(&conn).expect("list").len(), 1);
        delete_by_ids(&conn, &[b]).expect("delete batch");
        assert!(list_all(&conn).expect("list").is_empty());
    }

    #[test]
    fn test_chunk_start_progress() {
        let conn = crate::open_memory().expect("open");
        let cid = test_conversation(&conn);
        let id = insert(&conn, 100, cid, 4, None, Some(-1), None).expect("insert");

        update_chunk_start(&conn, id, 262_144).expect("update");
        let rows = list_all(&conn).expect("list");
        assert_eq!(rows[0].chunk_start, Some(262_144));
    }

    #[test]
    fn test_ids_for_descriptors() {
        let conn = crate::open_memory().expect("open");
        let cid = test_conversation(&conn);
        insert(&conn, 100, cid, 2, Some(11), None, None).expect("insert");
        insert(&conn, 101, cid, 2, Some(12), None, None).expect("insert");
        insert(&conn, 102, cid, 2, None, None, None).expect("insert");

        let hits = ids_for_descriptors(&conn, &[11, 99]).expect("query");
        assert_eq!(hits.len(), 1);
        assert!(ids_for_descriptors(&conn, &[]).expect("query").is_empty());
    }

    #[test]
    fn test_cascade_with_conversation() {
        let conn = crate::open_memory().expect("open");
        let cid = test_conversation(&conn);
        insert(&conn, 100, cid, 2, None, None, None).expect("insert");

        crate::queries::conversations::delete(&conn, cid).expect("delete conversation");
        assert!(list_all(&conn).expect("list").is_empty());
    }
}
