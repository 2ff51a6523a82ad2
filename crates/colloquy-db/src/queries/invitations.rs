//! Invitation query functions.
//!
//! One row per invitation descriptor, linking it to the group it creates
//! so that leaving the group can cascade the bookkeeping.

use rusqlite::{Connection, Row};
use uuid::Uuid;

use colloquy_types::DatabaseId;

use crate::queries::{optional_uuid_from_blob, uuid_from_blob};
use crate::Result;

/// One invitation row.
#[derive(Clone, Debug)]
pub struct InvitationRow {
    /// The invitation descriptor's row id.
    pub descriptor_id: DatabaseId,
    /// The group conversation the invitation belongs to.
    pub group_id: DatabaseId,
    /// Twincode of the inviting member.
    pub inviter_member: Uuid,
    /// Twincode of the member row created when the invitee joined.
    pub joined_member: Option<Uuid>,
}

fn row_to_invitation(row: &Row<'_>) -> rusqlite::Result<InvitationRow> {
    Ok(InvitationRow {
        descriptor_id: row.get(0)?,
        group_id: row.get(1)?,
        inviter_member: uuid_from_blob(2, row.get(2)?)?,
        joined_member: optional_uuid_from_blob(3, row.get(3)?)?,
    })
}

/// Insert the row for an invitation descriptor.
pub fn insert(conn: &Connection, invitation: &InvitationRow) -> Result<()> {
    conn.execute(
        "INSERT INTO invitation (id, groupId, inviterMember, joinedMember)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            invitation.descriptor_id,
            invitation.group_id,
            invitation.inviter_member.as_bytes().as_slice(),
            invitation.joined_member.map(|u| u.as_bytes().to_vec()),
        ],
    )?;
    Ok(())
}

/// Load the row behind one invitation descriptor.
pub fn get_by_descriptor(
    conn: &Connection,
    descriptor_id: DatabaseId,
) -> Result<Option<InvitationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, groupId, inviterMember, joinedMember FROM invitation WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map([descriptor_id], row_to_invitation)?;
    Ok(rows.next().transpose()?)
}

/// All invitation rows of one group.
pub fn list_for_group(conn: &Connection, group_id: DatabaseId) -> Result<Vec<InvitationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, groupId, inviterMember, joinedMember FROM invitation WHERE groupId = ?1",
    )?;
    let rows = stmt
        .query_map([group_id], row_to_invitation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Record which member row an accepted invitation produced.
pub fn set_joined_member(
    conn: &Connection,
    descriptor_id: DatabaseId,
    joined_member: &Uuid,
) -> Result<()> {
    conn.execute(
        "UPDATE invitation SET joinedMember = ?1 WHERE id = ?2",
        rusqlite::params![joined_member.as_bytes().as_slice(), descriptor_id],
    )?;
    Ok(())
}

/// Drop every invitation row of a group (used when we leave it).
pub fn delete_for_group(conn: &Connection, group_id: DatabaseId) -> Result<()> {
    conn.execute("DELETE FROM invitation WHERE groupId = ?1", [group_id])?;
    Ok(())
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
            peer_twincode_outbound: None,
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
        crate::queries::conversations::set_group_id(conn, cid, cid).expect("anchor");
        let descriptor = Descriptor::object(
            DescriptorId::new(0, Uuid::from_u128(1), 1),
            cid,
            100,
            "placeholder".into(),
        );
        let did = crate::queries::descriptors::insert(conn, &descriptor).expect("descriptor");
        (cid, did)
    }

    #[test]
    fn test_insert_get_and_join() {
        let conn = crate::open_memory().expect("open");
        let (group_id, did) = seed(&conn);
        let inviter = Uuid::new_v4();

        insert(
            &conn,
            &InvitationRow {
                descriptor_id: did,
                group_id,
                inviter_member: inviter,
                joined_member: None,
            },
        )
        .expect("insert");

        let row = get_by_descriptor(&conn, did).expect("get").expect("row");
        assert_eq!(row.inviter_member, inviter);
        assert_eq!(row.joined_member, None);

        let member = Uuid::new_v4();
        set_joined_member(&conn, did, &member).expect("join");
        let row = get_by_descriptor(&conn, did).expect("get").expect("row");
        assert_eq!(row.joined_member, Some(member));
    }

    #[test]
    fn test_cascade_with_descriptor() {
        let conn = crate::open_memory().expect("open");
        let (group_id, did) = seed(&conn);
        insert(
            &conn,
            &InvitationRow {
                descriptor_id: did,
                group_id,
                inviter_member: Uuid::new_v4(),
                joined_member: None,
            },
        )
        .expect("insert");

        crate::queries::descriptors::delete_by_ids(&conn, &[did]).expect("delete");
        assert!(get_by_descriptor(&conn, did).expect("get").is_none());
    }

    #[test]
    fn test_list_and_delete_for_group() {
        let conn = crate::open_memory().expect("open");
        let (group_id, did) = seed(&conn);
        insert(
            &conn,
            &InvitationRow {
                descriptor_id: did,
                group_id,
                inviter_member: Uuid::new_v4(),
                joined_member: None,
            },
        )
        .expect("insert");

        assert_eq!(list_for_group(&conn, group_id).expect("list").len(), 1);
        delete_for_group(&conn, group_id).expect("delete");
        assert!(list_for_group(&conn, group_id).expect("list").is_empty());
    }
}
