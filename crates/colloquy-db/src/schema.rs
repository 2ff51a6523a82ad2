//! Current database schema.
//!
//! A group conversation is one `conversation` row whose `groupId` equals
//! its own `id`; member rows point their `groupId` at it. `sequence` is
//! the next local sequence id handed to an outgoing descriptor (a counter
//! rather than MAX()+1, so resets never cause sequence reuse). `lock` is
//! declared but never read; reserved for cross-process mutual exclusion.
//!
//! The `annotation` primary key includes `peerTwincodeOutbound`. SQLite
//! treats NULLs in a non-INTEGER primary key as distinct, which would let
//! our own annotation duplicate, so "us" is stored as the zero twincode
//! and mapped back to `None` on load.

/// Current DDL, applied to fresh databases.
pub const SCHEMA_CURRENT: &str = "
CREATE TABLE IF NOT EXISTS conversation (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    groupId INTEGER REFERENCES conversation(id) ON DELETE CASCADE,
    uuid BLOB NOT NULL UNIQUE,
    creationDate INTEGER NOT NULL,
    subject BLOB NOT NULL,
    invitedContact BLOB,
    peerTwincodeOutbound BLOB,
    twincodeOutbound BLOB NOT NULL,
    resourceId BLOB NOT NULL,
    peerResourceId BLOB,
    permissions INTEGER NOT NULL DEFAULT 0,
    joinPermissions INTEGER NOT NULL DEFAULT 0,
    state INTEGER,
    sequence INTEGER NOT NULL DEFAULT 1,
    lastConnectDate INTEGER,
    lastRetryDate INTEGER,
    flags INTEGER NOT NULL DEFAULT 0,
    lock INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS descriptor (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cid INTEGER NOT NULL REFERENCES conversation(id) ON DELETE CASCADE,
    sequenceId INTEGER NOT NULL,
    twincodeOutbound BLOB NOT NULL,
    sentTo BLOB,
    replyTo BLOB,
    descriptorType INTEGER NOT NULL,
    creationDate INTEGER NOT NULL,
    sendDate INTEGER NOT NULL DEFAULT 0,
    receiveDate INTEGER NOT NULL DEFAULT 0,
    readDate INTEGER NOT NULL DEFAULT 0,
    updateDate INTEGER NOT NULL DEFAULT 0,
    peerDeleteDate INTEGER NOT NULL DEFAULT 0,
    deleteDate INTEGER NOT NULL DEFAULT 0,
    expireTimeout INTEGER NOT NULL DEFAULT 0,
    flags INTEGER NOT NULL DEFAULT 0,
    value INTEGER NOT NULL DEFAULT 0,
    content BLOB,
    UNIQUE (cid, twincodeOutbound, sequenceId)
);

CREATE INDEX IF NOT EXISTS descriptor_cid_creation
    ON descriptor (cid, creationDate);

CREATE TABLE IF NOT EXISTS invitation (
    id INTEGER PRIMARY KEY REFERENCES descriptor(id) ON DELETE CASCADE,
    groupId INTEGER NOT NULL,
    inviterMember BLOB NOT NULL,
    joinedMember BLOB
);

CREATE TABLE IF NOT EXISTS annotation (
    cid INTEGER NOT NULL,
    descriptor INTEGER NOT NULL REFERENCES descriptor(id) ON DELETE CASCADE,
    peerTwincodeOutbound BLOB NOT NULL,
    kind INTEGER NOT NULL,
    value INTEGER NOT NULL DEFAULT 0,
    creationDate INTEGER NOT NULL DEFAULT 0,
    notificationId INTEGER,
    PRIMARY KEY (cid, descriptor, peerTwincodeOutbound, kind)
);

CREATE TABLE IF NOT EXISTS operation (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    creationDate INTEGER NOT NULL,
    cid INTEGER NOT NULL REFERENCES conversation(id) ON DELETE CASCADE,
    type INTEGER NOT NULL,
    descriptor INTEGER,
    chunkStart INTEGER,
    content BLOB
);

CREATE INDEX IF NOT EXISTS operation_cid ON operation (cid);
";

/// Legacy table names rewritten by the pre-v20 migration.
pub const LEGACY_TABLES: [&str; 5] = [
    "conversationConversation",
    "conversationDescriptor",
    "conversationDescriptorAnnotation",
    "conversationOperation",
    "notificationNotification",
];
