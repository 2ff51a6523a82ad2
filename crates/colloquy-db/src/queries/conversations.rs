//! Conversation query functions.

use rusqlite::{Connection, Row};
use uuid::Uuid;

use colloquy_model::Conversation;
use colloquy_types::{DatabaseId, GroupState, InvitationStatus};

use crate::queries::{optional_uuid_from_blob, uuid_from_blob};
use crate::Result;

const COLUMNS: &str = "id, groupId, uuid, creationDate, subject, invitedContact,
    peerTwincodeOutbound, twincodeOutbound, resourceId, peerResourceId,
    permissions, joinPermissions, state, sequence, lastConnectDate,
    lastRetryDate, flags";

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        database_id: row.get(0)?,
        group_id: row.get(1)?,
        uuid: uuid_from_blob(2, row.get(2)?)?,
        creation_date: row.get(3)?,
        subject: uuid_from_blob(4, row.get(4)?)?,
        invited_contact: optional_uuid_from_blob(5, row.get(5)?)?,
        peer_twincode_outbound: optional_uuid_from_blob(6, row.get(6)?)?,
        twincode_outbound: uuid_from_blob(7, row.get(7)?)?,
        resource_id: uuid_from_blob(8, row.get(8)?)?,
        peer_resource_id: optional_uuid_from_blob(9, row.get(9)?)?,
        permissions: row.get::<_, i64>(10)? as u64,
        join_permissions: row.get::<_, i64>(11)? as u64,
        state: row
            .get::<_, Option<i64>>(12)?
            .and_then(|code| GroupState::from_code(code as u8)),
        next_sequence_id: row.get(13)?,
        last_connect_date: row.get(14)?,
        last_retry_date: row.get(15)?,
        flags: row.get::<_, i64>(16)? as u64,
    })
}

/// Insert a conversation row; returns the allocated row id.
pub fn insert(conn: &Connection, conversation: &Conversation) -> Result<DatabaseId> {
    conn.execute(
        "INSERT INTO conversation (groupId, uuid, creationDate, subject, invitedContact,
             peerTwincodeOutbound, twincodeOutbound, resourceId, peerResourceId,
             permissions, joinPermissions, state, sequence, lastConnectDate,
             lastRetryDate, flags)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        rusqlite::params![
            conversation.group_id,
            conversation.uuid.as_bytes().as_slice(),
            conversation.creation_date,
            conversation.subject.as_bytes().as_slice(),
            conversation.invited_contact.map(|u| u.as_bytes().to_vec()),
            conversation
                .peer_twincode_outbound
                .map(|u| u.as_bytes().to_vec()),
            conversation.twincode_outbound.as_bytes().as_slice(),
            conversation.resource_id.as_bytes().as_slice(),
            conversation.peer_resource_id.map(|u| u.as_bytes().to_vec()),
            conversation.permissions as i64,
            conversation.join_permissions as i64,
            conversation.state.map(|s| i64::from(s.code())),
            conversation.next_sequence_id,
            conversation.last_connect_date,
            conversation.last_retry_date,
            conversation.flags as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Anchor a freshly inserted group row: its `groupId` is its own id.
pub fn set_group_id(conn: &Connection, id: DatabaseId, group_id: DatabaseId) -> Result<()> {
    conn.execute(
        "UPDATE conversation SET groupId = ?1 WHERE id = ?2",
        rusqlite::params![group_id, id],
    )?;
    Ok(())
}

/// Load one conversation by row id.
pub fn get_by_id(conn: &Connection, id: DatabaseId) -> Result<Option<Conversation>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {COLUMNS} FROM conversation WHERE id = ?1"))?;
    let mut rows = stmt.query_map([id], row_to_conversation)?;
    Ok(rows.next().transpose()?)
}

/// Load one conversation by stable identifier.
pub fn get_by_uuid(conn: &Connection, uuid: &Uuid) -> Result<Option<Conversation>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {COLUMNS} FROM conversation WHERE uuid = ?1"))?;
    let mut rows = stmt.query_map([uuid.as_bytes().as_slice()], row_to_conversation)?;
    Ok(rows.next().transpose()?)
}

/// Find the contact conversation for a subject, when one exists.
pub fn get_contact_by_subject(conn: &Connection, subject: &Uuid) -> Result<Option<Conversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM conversation WHERE subject = ?1 AND groupId IS NULL"
    ))?;
    let mut rows = stmt.query_map([subject.as_bytes().as_slice()], row_to_conversation)?;
    Ok(rows.next().transpose()?)
}

/// Find the group conversation for a subject, when one exists.
pub fn get_group_by_subject(conn: &Connection, subject: &Uuid) -> Result<Option<Conversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM conversation WHERE subject = ?1 AND groupId = id"
    ))?;
    let mut rows = stmt.query_map([subject.as_bytes().as_slice()], row_to_conversation)?;
    Ok(rows.next().transpose()?)
}

/// Find the group conversation carrying a group twincode.
pub fn get_group_by_twincode(
    conn: &Connection,
    group_twincode: &Uuid,
) -> Result<Option<Conversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM conversation WHERE twincodeOutbound = ?1 AND groupId = id"
    ))?;
    let mut rows = stmt.query_map([group_twincode.as_bytes().as_slice()], row_to_conversation)?;
    Ok(rows.next().transpose()?)
}

/// Find a member row of a group by the member's twincode.
pub fn get_member(
    conn: &Connection,
    group_id: DatabaseId,
    member_twincode: &Uuid,
) -> Result<Option<Conversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM conversation
         WHERE groupId = ?1 AND id != ?1 AND peerTwincodeOutbound = ?2"
    ))?;
    let mut rows = stmt.query_map(
        rusqlite::params![group_id, member_twincode.as_bytes().as_slice()],
        row_to_conversation,
    )?;
    Ok(rows.next().transpose()?)
}

/// All conversations, groups before their members.
pub fn list_all(conn: &Connection) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM conversation ORDER BY id"))?;
    let rows = stmt
        .query_map([], row_to_conversation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Member rows of one group.
pub fn list_members(conn: &Connection, group_id: DatabaseId) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM conversation WHERE groupId = ?1 AND id != ?1 ORDER BY id"
    ))?;
    let rows = stmt
        .query_map([group_id], row_to_conversation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Active members plus pending invitations, for the group-size bound.
pub fn count_members_and_invitations(conn: &Connection, group_id: DatabaseId) -> Result<i64> {
    let members: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conversation
         WHERE groupId = ?1 AND id != ?1 AND (state IS NULL OR state != ?2)",
        rusqlite::params![group_id, i64::from(GroupState::Left.code())],
        |row| row.get(0),
    )?;
    let pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM invitation i
         JOIN descriptor d ON d.id = i.id
         WHERE i.groupId = ?1 AND d.value = ?2",
        rusqlite::params![group_id, i64::from(InvitationStatus::Pending.code())],
        |row| row.get(0),
    )?;
    Ok(members + pending)
}

/// Update the peer's grant bitmap.
pub fn update_permissions(conn: &Connection, id: DatabaseId, permissions: u64) -> Result<()> {
    conn.execute(
        "UPDATE conversation SET permissions = ?1 WHERE id = ?2",
        rusqlite::params![permissions as i64, id],
    )?;
    Ok(())
}

/// Update the membership state of a group or member row.
pub fn update_state(conn: &Connection, id: DatabaseId, state: GroupState) -> Result<()> {
    conn.execute(
        "UPDATE conversation SET state = ?1 WHERE id = ?2",
        rusqlite::params![i64::from(state.code()), id],
    )?;
    Ok(())
}

/// Persist the next outgoing sequence id.
pub fn update_sequence(conn: &Connection, id: DatabaseId, next_sequence: i64) -> Result<()> {
    conn.execute(
        "UPDATE conversation SET sequence = ?1 WHERE id = ?2",
        rusqlite::params![next_sequence, id],
    )?;
    Ok(())
}

/// Record the peer device instance seen on the last link.
pub fn update_peer_resource(
    conn: &Connection,
    id: DatabaseId,
    peer_resource_id: Option<&Uuid>,
) -> Result<()> {
    conn.execute(
        "UPDATE conversation SET peerResourceId = ?1 WHERE id = ?2",
        rusqlite::params![peer_resource_id.map(|u| u.as_bytes().to_vec()), id],
    )?;
    Ok(())
}

/// Record a successful link open.
pub fn update_last_connect(conn: &Connection, id: DatabaseId, date: i64) -> Result<()> {
    conn.execute(
        "UPDATE conversation SET lastConnectDate = ?1 WHERE id = ?2",
        rusqlite::params![date, id],
    )?;
    Ok(())
}

/// Record an outgoing attempt.
pub fn update_last_retry(conn: &Connection, id: DatabaseId, date: i64) -> Result<()> {
    conn.execute(
        "UPDATE conversation SET lastRetryDate = ?1 WHERE id = ?2",
        rusqlite::params![date, id],
    )?;
    Ok(())
}

/// Delete a conversation row. Members, descriptors, annotations and
/// operations cascade.
pub fn delete(conn: &Connection, id: DatabaseId) -> Result<()> {
    conn.execute("DELETE FROM conversation WHERE id = ?1", [id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_types::DEFAULT_PERMISSIONS;

    fn new_conversation(group_id: Option<DatabaseId>) -> Conversation {
        Conversation {
            database_id: 0,
            group_id,
            uuid: Uuid::new_v4(),
            creation_date: 1000,
            subject: Uuid::new_v4(),
            invited_contact: None,
            peer_twincode_outbound: Some(Uuid::new_v4()),
            twincode_outbound: Uuid::new_v4(),
            resource_id: Uuid::new_v4(),
            peer_resource_id: None,
            permissions: DEFAULT_PERMISSIONS,
            join_permissions: 0,
            state: None,
            next_sequence_id: 1,
            last_connect_date: None,
            last_retry_date: None,
            flags: 0,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let conn = crate::open_memory().expect("open");
        let conversation = new_conversation(None);
        let id = insert(&conn, &conversation).expect("insert");

        let loaded = get_by_id(&conn, id).expect("get").expect("row");
        assert_eq!(loaded.uuid, conversation.uuid);
        assert_eq!(loaded.subject, conversation.subject);
        assert_eq!(loaded.permissions, DEFAULT_PERMISSIONS);
        assert_eq!(loaded.next_sequence_id, 1);

        let by_uuid = get_by_uuid(&conn, &conversation.uuid)
            .expect("get")
            .expect("row");
        assert_eq!(by_uuid.database_id, id);
    }

    #[test]
    fn test_group_and_members() {
        let conn = crate::open_memory().expect("open");
        let mut group = new_conversation(None);
        group.peer_twincode_outbound = None;
        group.state = Some(GroupState::Joined);
        let group_id = insert(&conn, &group).expect("insert group");
        set_group_id(&conn, group_id, group_id).expect("anchor");

        let mut member = new_conversation(Some(group_id));
        member.subject = group.subject;
        member.state = Some(GroupState::Joined);
        insert(&conn, &member).expect("insert member");

        let loaded = get_by_id(&conn, group_id).expect("get").expect("group");
        assert!(loaded.is_group());

        let members = list_members(&conn, group_id).expect("members");
        assert_eq!(members.len(), 1);
        assert!(members[0].is_group_member());

        let found = get_member(
            &conn,
            group_id,
            &member.peer_twincode_outbound.expect("peer"),
        )
        .expect("get member");
        assert!(found.is_some());
    }

    #[test]
    fn test_member_count_excludes_left() {
        let conn = crate::open_memory().expect("open");
        let mut group = new_conversation(None);
        group.peer_twincode_outbound = None;
        let group_id = insert(&conn, &group).expect("insert");
        set_group_id(&conn, group_id, group_id).expect("anchor");

        for state in [GroupState::Joined, GroupState::Joined, GroupState::Left] {
            let mut member = new_conversation(Some(group_id));
            member.state = Some(state);
            insert(&conn, &member).expect("insert member");
        }
        assert_eq!(
            count_members_and_invitations(&conn, group_id).expect("count"),
            2
        );
    }

    #[test]
    fn test_delete_cascades_members() {
        let conn = crate::open_memory().expect("open");
        let mut group = new_conversation(None);
        group.peer_twincode_outbound = None;
        let group_id = insert(&conn, &group).expect("insert");
        set_group_id(&conn, group_id, group_id).expect("anchor");
        let member_id = insert(&conn, &new_conversation(Some(group_id))).expect("member");

        delete(&conn, group_id).expect("delete");
        assert!(get_by_id(&conn, member_id).expect("get").is_none());
    }

    #[test]
    fn test_sequence_update() {
        let conn = crate::open_memory().expect("open");
        let id = insert(&conn, &new_conversation(None)).expect("insert");
        update_sequence(&conn, id, 42).expect("update");
        let loaded = get_by_id(&conn, id).expect("get").expect("row");
        assert_eq!(loaded.next_sequence_id, 42);
    }
}
