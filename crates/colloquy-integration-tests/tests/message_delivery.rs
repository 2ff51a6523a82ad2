//! Integration test: text message delivery over a peer link.
//!
//! Covers the send path (enqueue, link open, one `PushObject` with the
//! allocated sequence id, response application with the literal reception
//! timestamp, operation removal), the receive path (descriptor storage
//! plus the `OnPushObject` answer), and the version-gated edit fallback
//! against a (2, 18) peer.

use colloquy_engine::{Engine, EngineConfig, EngineEvent};
use colloquy_integration_tests::{
    descriptor_date, init_tracing, open_store, reader, seed_contact, wait_event, wait_until,
    FakeFactory, FakeLink,
};
use colloquy_model::Descriptor;
use colloquy_proto::iq::{PushDescriptorIq, ReceivedIq};
use colloquy_proto::{Iq, LinkState};
use colloquy_types::{DescriptorId, ErrorCode};
use uuid::Uuid;

#[tokio::test]
async fn send_and_deliver_text_message() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut store, db_path) = open_store(&dir);
    let conversation = seed_contact(&mut store, false);

    let factory = FakeFactory::new(20, 16_384, None);
    let engine = Engine::start(store, factory.clone(), EngineConfig::default());
    let mut events = engine.events().subscribe();

    engine.set_online(true);
    engine.send_message(conversation.uuid, "hi".into(), None, 0);

    assert!(
        wait_event(&mut events, |event| matches!(
            event,
            EngineEvent::OperationQueued { .. }
        ))
        .await
        .is_some()
    );
    assert!(wait_until(|| factory.link_count() == 1).await);
    let link = factory.last_link().expect("link");

    engine.link_state_changed(conversation.uuid, LinkState::Open, ErrorCode::Success);
    assert!(
        wait_event(&mut events, |event| matches!(
            event,
            EngineEvent::ConversationConnected { .. }
        ))
        .await
        .is_some()
    );
    assert!(wait_until(|| link.sent_count() == 1).await);

    let sent = link.drain_sent();
    assert_eq!(sent.len(), 1);
    let request_id = match &sent[0] {
        Iq::PushObject(push) => {
            assert_eq!(push.descriptor.envelope().id.sequence_id, 1);
            match &push.descriptor {
                Descriptor::Object(object) => assert_eq!(object.message, "hi"),
                other => unreachable!("wrong descriptor: {other:?}"),
            }
            push.request_id
        }
        other => unreachable!("wrong packet: {other:?}"),
    };

    engine.packet_received(
        conversation.uuid,
        Iq::OnPushObject(ReceivedIq {
            request_id,
            received_timestamp: 1_700_000_000_000,
        })
        .encode(),
    );
    assert!(
        wait_event(&mut events, |event| matches!(
            event,
            EngineEvent::OperationCompleted { .. }
        ))
        .await
        .is_some()
    );

    let db = reader(&db_path);
    let (descriptor_id, send_date): (i64, i64) = db
        .query_row(
            "SELECT id, sendDate FROM descriptor WHERE cid = ?1",
            [conversation.database_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("descriptor row");
    assert_eq!(send_date, 1_700_000_000_000);
    assert_eq!(descriptor_date(&db, descriptor_id, "sendDate"), send_date);

    let operations: i64 = db
        .query_row("SELECT COUNT(*) FROM operation", [], |row| row.get(0))
        .expect("operation count");
    assert_eq!(operations, 0, "no operation row remains");
}

#[tokio::test]
async fn receive_text_message_and_acknowledge() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut store, db_path) = open_store(&dir);
    // Our twincode sorts low, so the incoming link wins the tie-break.
    let conversation = seed_contact(&mut store, true);
    let peer = conversation.peer_twincode_outbound.expect("peer");

    let factory = FakeFactory::new(20, 16_384, None);
    let engine = Engine::start(store, factory, EngineConfig::default());
    let mut events = engine.events().subscribe();
    engine.set_online(true);

    let link = FakeLink::new(conversation.uuid, 20, 16_384, None);
    engine.incoming_connection(conversation.uuid, link.clone());
    engine.link_state_changed(conversation.uuid, LinkState::Open, ErrorCode::Success);

    let incoming = Descriptor::object(
        DescriptorId::remote(peer, 1),
        0,
        1_650_000_000_000,
        "bonjour".into(),
    );
    engine.packet_received(
        conversation.uuid,
        Iq::PushObject(PushDescriptorIq {
            request_id: 71,
            descriptor: incoming,
        })
        .encode(),
    );

    let received = wait_event(&mut events, |event| {
        matches!(event, EngineEvent::DescriptorReceived { .. })
    })
    .await
    .expect("descriptor received");
    match received {
        EngineEvent::DescriptorReceived {
            conversation_id, ..
        } => assert_eq!(conversation_id, conversation.database_id),
        other => unreachable!("wrong event: {other:?}"),
    }

    assert!(wait_until(|| link.sent_count() == 1).await);
    match &link.drain_sent()[0] {
        Iq::OnPushObject(response) => {
            assert_eq!(response.request_id, 71);
            assert!(response.received_timestamp > 0);
        }
        other => unreachable!("wrong packet: {other:?}"),
    }

    let db = reader(&db_path);
    let (receive_date, read_date): (i64, i64) = db
        .query_row(
            "SELECT receiveDate, readDate FROM descriptor WHERE cid = ?1 AND sequenceId = 1",
            [conversation.database_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("descriptor row");
    assert!(receive_date > 0);
    assert_eq!(read_date, 0);
}

#[tokio::test]
async fn message_edit_fails_against_old_peer() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut store, db_path) = open_store(&dir);
    let conversation = seed_contact(&mut store, false);

    // Peer negotiated (2, 18): edits require (2, 20).
    let factory = FakeFactory::new(18, 16_384, None);
    let engine = Engine::start(store, factory.clone(), EngineConfig::default());
    let mut events = engine.events().subscribe();

    engine.set_online(true);
    engine.send_message(conversation.uuid, "draft".into(), None, 0);
    assert!(wait_until(|| factory.link_count() == 1).await);
    let link = factory.last_link().expect("link");
    engine.link_state_changed(conversation.uuid, LinkState::Open, ErrorCode::Success);
    assert!(wait_until(|| link.sent_count() == 1).await);

    // Deliver the original message normally; (2, 18) carries PushObject.
    let request_id = match &link.drain_sent()[0] {
        Iq::PushObject(push) => push.request_id,
        other => unreachable!("wrong packet: {other:?}"),
    };
    engine.packet_received(
        conversation.uuid,
        Iq::OnPushObject(ReceivedIq {
            request_id,
            received_timestamp: 1_700_000_000_000,
        })
        .encode(),
    );
    assert!(
        wait_event(&mut events, |event| matches!(
            event,
            EngineEvent::OperationCompleted { .. }
        ))
        .await
        .is_some()
    );

    let db = reader(&db_path);
    let descriptor_id: i64 = db
        .query_row(
            "SELECT id FROM descriptor WHERE cid = ?1",
            [conversation.database_id],
            |row| row.get(0),
        )
        .expect("descriptor row");

    // Now request a copy-allowed edit: the gate fails it terminally.
    engine.update_message(
        conversation.uuid,
        colloquy_types::DescriptorId::new(descriptor_id, Uuid::nil(), 0),
        None,
        Some(true),
        None,
    );

    let failed = wait_event(&mut events, |event| {
        matches!(event, EngineEvent::OperationFailed { .. })
    })
    .await
    .expect("operation failed event");
    match failed {
        EngineEvent::OperationFailed { error, .. } => {
            assert_eq!(error, ErrorCode::FeatureNotSupportedByPeer);
        }
        other => unreachable!("wrong event: {other:?}"),
    }

    assert!(wait_until(|| {
        descriptor_date(&db, descriptor_id, "sendDate") == -1
    })
    .await);
    assert_eq!(descriptor_date(&db, descriptor_id, "readDate"), -1);
    assert_eq!(descriptor_date(&db, descriptor_id, "receiveDate"), -1);

    let operations: i64 = db
        .query_row("SELECT COUNT(*) FROM operation", [], |row| row.get(0))
        .expect("operation count");
    assert_eq!(operations, 0, "the failed edit operation is removed");
}
