//! Database migration system.
//!
//! Schema version stored in `PRAGMA user_version`. Migrations are
//! forward-only. Databases older than version 20 use the legacy five-table
//! layout with text UUIDs; those are rewritten table by table, committing
//! after each so the migration is restartable (a re-run skips tables that
//! are already gone).

use rusqlite::Connection;
use uuid::Uuid;

use crate::{schema, DbError, Result, SCHEMA_VERSION};

/// Run all pending migrations.
///
/// `subject_peers` resolves a conversation subject to its current peer
/// twincode; the version-25 repair pass uses it for contact rows.
pub fn run(
    conn: &mut Connection,
    subject_peers: &dyn Fn(Uuid) -> Option<Uuid>,
) -> Result<()> {
    let current_version: u32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(DbError::Sqlite)?;

    if current_version == 0 {
        tracing::info!("initializing database schema v{SCHEMA_VERSION}");
        conn.execute_batch(schema::SCHEMA_CURRENT)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        return Ok(());
    }

    if current_version > SCHEMA_VERSION {
        return Err(DbError::Migration(format!(
            "database version {current_version} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    let mut version = current_version;
    if version < 20 {
        tracing::info!(from = version, "rewriting legacy tables");
        migrate_legacy(conn)?;
        // The rewrite produces the current annotation shape, so the v21
        // column additions are already in place.
        version = 21;
        conn.pragma_update(None, "user_version", version)?;
    }

    for next in (version + 1)..=SCHEMA_VERSION {
        tracing::info!("running migration to v{next}");
        run_migration(conn, next, subject_peers)?;
        conn.pragma_update(None, "user_version", next)?;
    }

    Ok(())
}

/// Run a specific migration step.
fn run_migration(
    conn: &mut Connection,
    version: u32,
    subject_peers: &dyn Fn(Uuid) -> Option<Uuid>,
) -> Result<()> {
    match version {
        21 => migration_v21(conn),
        // Reserved by prior application revisions; no schema change.
        22 | 23 | 24 => Ok(()),
        25 => migration_v25(conn, subject_peers),
        _ => Err(DbError::Migration(format!(
            "unknown migration version: {version}"
        ))),
    }
}

/// 20 -> 21: annotations gain a creation date and a notification handle.
fn migration_v21(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE annotation ADD COLUMN creationDate INTEGER NOT NULL DEFAULT 0;
         ALTER TABLE annotation ADD COLUMN notificationId INTEGER;",
    )?;
    Ok(())
}

/// <= 24 repair: contact rows whose peer twincode drifted from the subject
/// are realigned.
fn migration_v25(
    conn: &mut Connection,
    subject_peers: &dyn Fn(Uuid) -> Option<Uuid>,
) -> Result<()> {
    let tx = conn.transaction()?;
    let rows: Vec<(i64, Uuid, Option<Vec<u8>>)> = {
        let mut stmt = tx.prepare(
            "SELECT id, subject, peerTwincodeOutbound FROM conversation WHERE groupId IS NULL",
        )?;
        let mapped = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<Vec<u8>>>(2)?,
            ))
        })?;
        let mut rows = Vec::new();
        for item in mapped {
            let (id, subject, peer) = item?;
            let subject = Uuid::from_slice(&subject)
                .map_err(|e| DbError::Migration(format!("bad subject uuid: {e}")))?;
            rows.push((id, subject, peer));
        }
        rows
    };

    let mut repaired = 0usize;
    for (id, subject, stored_peer) in rows {
        let Some(expected) = subject_peers(subject) else {
            continue;
        };
        let matches = stored_peer
            .as_deref()
            .is_some_and(|blob| blob == expected.as_bytes().as_slice());
        if !matches {
            tx.execute(
                "UPDATE conversation SET peerTwincodeOutbound = ?1 WHERE id = ?2",
                rusqlite::params![expected.as_bytes().as_slice(), id],
            )?;
            repaired += 1;
        }
    }
    tx.commit()?;
    if repaired > 0 {
        tracing::info!(repaired, "realigned contact peer twincodes");
    }
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| DbError::Migration(format!("bad legacy uuid {text}: {e}")))
}

fn parse_optional_uuid(text: Option<&str>) -> Result<Option<Vec<u8>>> {
    match text {
        None => Ok(None),
        Some(t) => Ok(Some(parse_uuid(t)?.as_bytes().to_vec())),
    }
}

/// Rewrite the legacy five-table layout into the current schema.
///
/// One transaction per legacy table, each ending with a `DROP TABLE`; the
/// table's absence is the restart marker.
fn migrate_legacy(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(schema::SCHEMA_CURRENT)?;

    if table_exists(conn, "conversationConversation")? {
        migrate_legacy_conversations(conn)?;
    }
    if table_exists(conn, "conversationDescriptor")? {
        migrate_legacy_descriptors(conn)?;
    }
    if table_exists(conn, "conversationDescriptorAnnotation")? {
        migrate_legacy_annotations(conn)?;
    }
    if table_exists(conn, "conversationOperation")? {
        migrate_legacy_operations(conn)?;
    }
    if table_exists(conn, "notificationNotification")? {
        migrate_legacy_notifications(conn)?;
    }
    Ok(())
}

fn migrate_legacy_conversations(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch("PRAGMA defer_foreign_keys = ON;")?;
    {
        let mut stmt = tx.prepare(
            "SELECT id, groupId, uuid, creationDate, subject, twincodeOutbound,
                    peerTwincodeOutbound, resourceId, permissions, joinPermissions,
                    state, sequence, flags
             FROM conversationConversation ORDER BY id",
        )?;
        let mut insert = tx.prepare(
            "INSERT OR IGNORE INTO conversation (id, groupId, uuid, creationDate, subject,
                    peerTwincodeOutbound, twincodeOutbound, resourceId, permissions,
                    joinPermissions, state, sequence, flags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, Option<i64>>(10)?,
                row.get::<_, Option<i64>>(11)?,
                row.get::<_, i64>(12)?,
            ))
        })?;
        for row in rows {
            let (
                id,
                group_id,
                uuid,
                creation_date,
                subject,
                twincode,
                peer_twincode,
                resource_id,
                permissions,
                join_permissions,
                state,
                sequence,
                flags,
            ) = row?;
            insert.execute(rusqlite::params![
                id,
                group_id,
                parse_uuid(&uuid)?.as_bytes().as_slice(),
                creation_date,
                parse_uuid(&subject)?.as_bytes().as_slice(),
                parse_optional_uuid(peer_twincode.as_deref())?,
                parse_uuid(&twincode)?.as_bytes().as_slice(),
                parse_uuid(&resource_id)?.as_bytes().as_slice(),
                permissions,
                join_permissions,
                state,
                sequence.unwrap_or(1),
                flags,
            ])?;
        }
    }
    tx.execute_batch("DROP TABLE conversationConversation;")?;
    tx.commit()?;
    tracing::info!("migrated legacy conversations");
    Ok(())
}

fn migrate_legacy_descriptors(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "SELECT id, cid, sequenceId, twincodeOutbound, descriptorType, creationDate,
                    sendDate, receiveDate, readDate, expireTimeout, flags, value, content
             FROM conversationDescriptor ORDER BY id",
        )?;
        let mut insert = tx.prepare(
            "INSERT OR IGNORE INTO descriptor (id, cid, sequenceId, twincodeOutbound,
                    descriptorType, creationDate, sendDate, receiveDate, readDate,
                    expireTimeout, flags, value, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, Option<i64>>(9)?,
                row.get::<_, i64>(10)?,
                row.get::<_, i64>(11)?,
                row.get::<_, Option<Vec<u8>>>(12)?,
            ))
        })?;
        for row in rows {
            let (
                id,
                cid,
                sequence_id,
                twincode,
                descriptor_type,
                creation_date,
                send_date,
                receive_date,
                read_date,
                expire_timeout,
                flags,
                value,
                content,
            ) = row?;
            insert.execute(rusqlite::params![
                id,
                cid,
                sequence_id,
                parse_uuid(&twincode)?.as_bytes().as_slice(),
                descriptor_type,
                creation_date,
                send_date,
                receive_date,
                read_date,
                expire_timeout.unwrap_or(0),
                flags,
                value,
                content,
            ])?;
        }
    }
    tx.execute_batch("DROP TABLE conversationDescriptor;")?;
    tx.commit()?;
    tracing::info!("migrated legacy descriptors");
    Ok(())
}

fn migrate_legacy_annotations(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "SELECT cid, descriptor, peerTwincodeOutbound, kind, value
             FROM conversationDescriptorAnnotation",
        )?;
        let mut insert = tx.prepare(
            "INSERT OR IGNORE INTO annotation (cid, descriptor, peerTwincodeOutbound,
                    kind, value, creationDate)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        for row in rows {
            let (cid, descriptor, peer, kind, value) = row?;
            let peer_blob = parse_optional_uuid(peer.as_deref())?
                .unwrap_or_else(|| Uuid::nil().as_bytes().to_vec());
            insert.execute(rusqlite::params![cid, descriptor, peer_blob, kind, value])?;
        }
    }
    tx.execute_batch("DROP TABLE conversationDescriptorAnnotation;")?;
    tx.commit()?;
    tracing::info!("migrated legacy annotations");
    Ok(())
}

fn migrate_legacy_operations(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "INSERT OR IGNORE INTO operation (id, creationDate, cid, type, descriptor, chunkStart, content)
         SELECT id, creationDate, cid, type, descriptor, chunkStart, content
         FROM conversationOperation;
         DROP TABLE conversationOperation;",
    )?;
    tx.commit()?;
    tracing::info!("migrated legacy operations");
    Ok(())
}

fn migrate_legacy_notifications(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "UPDATE annotation SET notificationId = (
             SELECT n.id FROM notificationNotification n
             WHERE n.cid = annotation.cid
               AND n.descriptor = annotation.descriptor
               AND n.kind = annotation.kind
         )
         WHERE notificationId IS NULL;
         DROP TABLE notificationNotification;",
    )?;
    tx.commit()?;
    tracing::info!("migrated legacy notifications");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_migration() {
        let mut conn = Connection::open_in_memory().expect("open");
        run(&mut conn, &|_| None).expect("migrate");

        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_migration() {
        let mut conn = Connection::open_in_memory().expect("open");
        run(&mut conn, &|_| None).expect("first run");
        run(&mut conn, &|_| None).expect("second run should be no-op");
    }

    #[test]
    fn test_newer_database_rejected() {
        let conn = Connection::open_in_memory().expect("open");
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .expect("pragma");
        let mut conn = conn;
        assert!(matches!(
            run(&mut conn, &|_| None),
            Err(DbError::Migration(_))
        ));
    }

    #[test]
    fn test_tables_created() {
        let mut conn = Connection::open_in_memory().expect("open");
        run(&mut conn, &|_| None).expect("migrate");

        for table in [
            "conversation",
            "descriptor",
            "invitation",
            "annotation",
            "operation",
        ] {
            assert!(
                table_exists(&conn, table).expect("check"),
                "table '{table}' should exist"
            );
        }
    }

    #[test]
    fn test_v20_to_v21_adds_annotation_columns() {
        let mut conn = Connection::open_in_memory().expect("open");
        // A v20 database: current layout minus the two annotation columns.
        conn.execute_batch(
            "CREATE TABLE conversation (id INTEGER PRIMARY KEY, groupId INTEGER,
                 uuid BLOB NOT NULL UNIQUE, creationDate INTEGER NOT NULL,
                 subject BLOB NOT NULL, invitedContact BLOB, peerTwincodeOutbound BLOB,
                 twincodeOutbound BLOB NOT NULL, resourceId BLOB NOT NULL,
                 peerResourceId BLOB, permissions INTEGER NOT NULL DEFAULT 0,
                 joinPermissions INTEGER NOT NULL DEFAULT 0, state INTEGER,
                 sequence INTEGER NOT NULL DEFAULT 1, lastConnectDate INTEGER,
                 lastRetryDate INTEGER, flags INTEGER NOT NULL DEFAULT 0,
                 lock INTEGER NOT NULL DEFAULT 0);
             CREATE TABLE descriptor (id INTEGER PRIMARY KEY);
             CREATE TABLE invitation (id INTEGER PRIMARY KEY);
             CREATE TABLE operation (id INTEGER PRIMARY KEY);
             CREATE TABLE annotation (cid INTEGER NOT NULL, descriptor INTEGER NOT NULL,
                 peerTwincodeOutbound BLOB NOT NULL, kind INTEGER NOT NULL,
                 value INTEGER NOT NULL DEFAULT 0,
                 PRIMARY KEY (cid, descriptor, peerTwincodeOutbound, kind));
             INSERT INTO annotation (cid, descriptor, peerTwincodeOutbound, kind, value)
                 VALUES (1, 2, x'00000000000000000000000000000000', 4, 7);",
        )
        .expect("v20 layout");
        conn.pragma_update(None, "user_version", 20).expect("pragma");

        run(&mut conn, &|_| None).expect("migrate");

        let (creation, notification): (i64, Option<i64>) = conn
            .query_row(
                "SELECT creationDate, notificationId FROM annotation WHERE cid = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("annotation row");
        assert_eq!(creation, 0);
        assert_eq!(notification, None);

        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_v25_repairs_contact_peer_twincode() {
        let mut conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(schema::SCHEMA_CURRENT).expect("schema");
        conn.pragma_update(None, "user_version", 24).expect("pragma");

        let subject = Uuid::new_v4();
        let expected_peer = Uuid::new_v4();
        let stale_peer = Uuid::new_v4();
        conn.execute(
            "INSERT INTO conversation (id, uuid, creationDate, subject,
                 peerTwincodeOutbound, twincodeOutbound, resourceId)
             VALUES (1, ?1, 0, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                Uuid::new_v4().as_bytes().as_slice(),
                subject.as_bytes().as_slice(),
                stale_peer.as_bytes().as_slice(),
                Uuid::new_v4().as_bytes().as_slice(),
                Uuid::new_v4().as_bytes().as_slice(),
            ],
        )
        .expect("insert");

        run(&mut conn, &move |s| {
            (s == subject).then_some(expected_peer)
        })
        .expect("migrate");

        let repaired: Vec<u8> = conn
            .query_row(
                "SELECT peerTwincodeOutbound FROM conversation WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .expect("row");
        assert_eq!(repaired, expected_peer.as_bytes().to_vec());
    }
}
