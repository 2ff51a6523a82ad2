//! Integration test: group reset fan-out.
//!
//! A group with two members issues a reset with a global bound for our
//! descriptors and per-member bounds. Each member link carries one
//! `ResetConversation`; the acknowledgement applies the local deletion of
//! ours at or below 100, member one's at or below 50 and member two's at
//! or below 60, with the annotation rows of the deleted descriptors
//! vanishing in the same transaction.

use std::collections::HashMap;

use colloquy_engine::{Engine, EngineConfig, EngineEvent};
use colloquy_integration_tests::{
    count_rows, init_tracing, open_store, reader, seed_group, wait_event, wait_until, FakeFactory,
};
use colloquy_model::{Annotation, Descriptor};
use colloquy_proto::iq::AckIq;
use colloquy_proto::{Iq, LinkState};
use colloquy_types::{AnnotationKind, DescriptorId, ErrorCode};
use uuid::Uuid;

#[tokio::test]
async fn group_reset_deletes_per_member_bounds() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut store, db_path) = open_store(&dir);
    let (group, member1, member2) = seed_group(&mut store);
    let m1 = member1.peer_twincode_outbound.expect("member 1 twincode");
    let m2 = member2.peer_twincode_outbound.expect("member 2 twincode");

    // Ours: sequences 99, 100, 101. The reset bound is 100.
    let mut ours = Vec::new();
    for sequence in [99i64, 100, 101] {
        let descriptor = Descriptor::object(
            DescriptorId::remote(group.twincode_outbound, sequence),
            0,
            2_000 + sequence,
            format!("ours {sequence}"),
        );
        let stored = store
            .insert_or_update_descriptor(&group, descriptor)
            .expect("insert ours");
        match stored {
            colloquy_db::InsertOutcome::Stored(d) => ours.push(d.envelope().id),
            colloquy_db::InsertOutcome::Updated(_) => unreachable!("fresh insert"),
        }
    }
    let _ = &ours;

    // Member descriptors around their bounds.
    let mut member_rows: HashMap<Uuid, Vec<DescriptorId>> = HashMap::new();
    for (twincode, sequences) in [(m1, vec![49i64, 50, 51]), (m2, vec![59i64, 60, 61])] {
        for sequence in sequences {
            let descriptor = Descriptor::object(
                DescriptorId::remote(twincode, sequence),
                0,
                3_000 + sequence,
                format!("member {sequence}"),
            );
            let stored = store
                .insert_or_update_descriptor(&group, descriptor)
                .expect("insert member descriptor");
            if let colloquy_db::InsertOutcome::Stored(d) = stored {
                member_rows.entry(twincode).or_default().push(d.envelope().id);
            }
        }
    }

    // Annotations on one doomed and one surviving descriptor.
    let doomed = member_rows[&m1][0]; // sequence 49
    let survivor = member_rows[&m2][2]; // sequence 61
    for target in [doomed, survivor] {
        store
            .annotate(&Annotation {
                conversation_id: group.database_id,
                descriptor_id: target.database_id,
                peer_twincode: None,
                kind: AnnotationKind::Like,
                value: 1,
                creation_date: 4_000,
                notification_id: None,
            })
            .expect("annotate");
    }

    let factory = FakeFactory::new(20, 16_384, None);
    let engine = Engine::start(store, factory.clone(), EngineConfig::default());
    let mut events = engine.events().subscribe();
    engine.set_online(true);

    engine.reset_conversation(group.uuid, 100, vec![(m1, 50), (m2, 60)], false);

    // One link per member, one reset IQ on each.
    assert!(wait_until(|| factory.link_count() == 2).await);
    for member in [&member1, &member2] {
        engine.link_state_changed(member.uuid, LinkState::Open, ErrorCode::Success);
    }
    let link1 = factory.link_for(&member1.uuid).expect("member 1 link");
    let link2 = factory.link_for(&member2.uuid).expect("member 2 link");
    assert!(wait_until(|| link1.sent_count() == 1 && link2.sent_count() == 1).await);

    for (member, link) in [(&member1, &link1), (&member2, &link2)] {
        let sent = link.drain_sent();
        let request_id = match &sent[0] {
            Iq::ResetConversation(reset) => {
                assert_eq!(reset.min_sequence_id, 100);
                assert_eq!(reset.peer_bounds.len(), 2);
                reset.request_id
            }
            other => unreachable!("wrong packet: {other:?}"),
        };
        engine.packet_received(
            member.uuid,
            Iq::OnResetConversation(AckIq { request_id }).encode(),
        );
        assert!(
            wait_event(&mut events, |event| matches!(
                event,
                EngineEvent::OperationCompleted { .. }
            ))
            .await
            .is_some()
        );
    }

    let db = reader(&db_path);
    let remaining: Vec<(Vec<u8>, i64)> = {
        let mut stmt = db
            .prepare("SELECT twincodeOutbound, sequenceId FROM descriptor WHERE cid = ?1")
            .expect("prepare");
        let rows = stmt
            .query_map([group.database_id], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })
            .expect("query")
            .collect::<rusqlite::Result<Vec<_>>>()
            .expect("rows");
        rows
    };

    let survivors: Vec<(Uuid, i64)> = remaining
        .iter()
        .map(|(blob, sequence)| (Uuid::from_slice(blob).expect("uuid"), *sequence))
        .collect();
    assert_eq!(survivors.len(), 3);
    assert!(survivors.contains(&(group.twincode_outbound, 101)));
    assert!(survivors.contains(&(m1, 51)));
    assert!(survivors.contains(&(m2, 61)));

    // Annotations of deleted descriptors are gone; the survivor keeps its.
    assert_eq!(count_rows(&db, "annotation"), 1);
    let annotated: i64 = db
        .query_row(
            "SELECT descriptor FROM annotation",
            [],
            |row| row.get(0),
        )
        .expect("annotation row");
    assert_eq!(annotated, survivor.database_id);
}
