//! End-to-end scenarios over the in-memory network.

mod common;

use common::{Network, HOST};
use concord::{
    DocumentState, InconsistencyReason, Message, Operation, Packet, ParticipantId, SessionEvent,
    Timestamp,
};

fn is_snapshot_to(peer: &str) -> impl Fn(&common::InFlight) -> bool + '_ {
    move |p| {
        p.to.as_str() == peer
            && matches!(
                &p.packet,
                Packet::Sequenced(e) if matches!(e.payload, Message::ResyncSnapshot { .. })
            )
    }
}

#[test]
fn concurrent_inserts_into_empty_document_converge() {
    let mut net = Network::new();
    net.share("doc", "");
    net.join("alice");
    net.join("bob");
    net.deliver_all();

    net.edit("alice", "doc", |_| Operation::insert(0, "foo"));
    net.edit("bob", "doc", |_| Operation::insert(0, "bar"));
    net.deliver_all();

    let contents = net.all_contents("doc");
    assert!(contents.iter().all(|c| c == &contents[0]));
    let result = contents[0].clone().unwrap();
    assert_eq!(result.chars().count(), 6);
    // "alice" sorts before "bob", so her text goes first.
    assert_eq!(result, "foobar");
}

#[test]
fn insert_inside_concurrent_delete_is_preserved() {
    let mut net = Network::new();
    net.share("doc", "0123456789");
    net.join("alice");
    net.join("bob");
    net.deliver_all();

    net.edit("alice", "doc", |_| Operation::delete(2, "234"));
    net.edit("bob", "doc", |_| Operation::insert(3, "X"));
    net.deliver_all();

    for content in net.all_contents("doc") {
        assert_eq!(content.as_deref(), Some("01X56789"));
    }
}

#[test]
fn host_and_participants_edit_concurrently() {
    let mut net = Network::new();
    net.share("doc", "hello world");
    net.join("alice");
    net.join("bob");
    net.deliver_all();

    net.host_edit("doc", |_| Operation::insert(0, ">> "));
    net.edit("alice", "doc", |_| Operation::delete(5, " world"));
    net.edit("bob", "doc", |_| Operation::insert(11, "!"));
    net.edit("bob", "doc", |_| Operation::insert(12, "?"));
    net.deliver_all_shuffled(&[3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5, 8, 9, 7, 9]);

    let contents = net.all_contents("doc");
    assert!(contents.iter().all(|c| c == &contents[0]), "{contents:?}");
    assert_eq!(contents[0].as_deref(), Some(">> hello!?"));
}

#[test]
fn joining_participant_receives_snapshot_once() {
    let mut net = Network::new();
    net.share("doc", "hello");
    net.join("alice");
    assert_eq!(net.count_in_flight(is_snapshot_to("alice")), 1);

    // Alice already knows the document exists and reports it missing twice
    // before the snapshot reaches her.
    net.participants
        .get_mut(&ParticipantId::from("alice"))
        .unwrap()
        .0
        .expect_document("doc".into());
    net.audit("alice");
    net.audit("alice");
    while let Some(i) = net.in_flight.iter().position(|p| p.to.as_str() == HOST) {
        net.deliver(i);
    }
    assert_eq!(net.count_in_flight(is_snapshot_to("alice")), 1);

    net.deliver_all();
    assert_eq!(net.content("alice", "doc").as_deref(), Some("hello"));
    assert_eq!(
        net.count_events(|e| matches!(e, SessionEvent::ResyncComplete { .. })),
        2,
        "one on each side"
    );
}

#[test]
fn missing_checksum_triggers_exactly_one_snapshot() {
    let mut net = Network::new();
    net.share("doc", "hello");
    net.join("alice");
    net.deliver_all();

    // Alice loses her copy.
    {
        let (session, _) = net.participants.get_mut(&ParticipantId::from("alice")).unwrap();
        session.close_document(&"doc".into());
        session.expect_document("doc".into());
    }
    net.audit("alice");
    net.deliver_all_matching_host();
    assert_eq!(net.count_in_flight(is_snapshot_to("alice")), 1);

    net.audit("alice");
    net.deliver_all_matching_host();
    assert_eq!(net.count_in_flight(is_snapshot_to("alice")), 1);

    let detected = net.count_events(|e| {
        matches!(
            e,
            SessionEvent::InconsistencyDetected {
                reason: InconsistencyReason::Missing,
                ..
            }
        )
    });
    assert_eq!(detected, 1);

    net.deliver_all();
    assert_eq!(net.content("alice", "doc").as_deref(), Some("hello"));
    assert!(!net.host.watchdog().is_resyncing(&"doc".into(), &"alice".into()));
}

#[test]
fn diverged_participant_is_resynced() {
    let mut net = Network::new();
    net.share("doc", "abc");
    net.join("alice");
    net.deliver_all();

    // Corrupt alice's editor behind the protocol's back.
    {
        let (_, editor) = net.participants.get_mut(&ParticipantId::from("alice")).unwrap();
        concord::Editor::replace(editor, &"doc".into(), "abX".to_string());
    }
    net.audit("alice");
    net.deliver_all();

    assert_eq!(net.content("alice", "doc").as_deref(), Some("abc"));
    let reasons: Vec<_> = net
        .host
        .watchdog()
        .history()
        .iter()
        .map(|i| i.reason.clone())
        .collect();
    assert!(matches!(reasons.as_slice(), [InconsistencyReason::Mismatch { .. }]));

    // The pair restarted from (0,0) under a new generation and still works.
    assert_eq!(net.host.generation_of(&"doc".into(), &"alice".into()), Some(2));
    net.edit("alice", "doc", |_| Operation::insert(3, "d"));
    net.deliver_all();
    assert_eq!(net.content(HOST, "doc").as_deref(), Some("abcd"));
}

#[test]
fn consistent_checksums_trigger_nothing() {
    let mut net = Network::new();
    net.share("doc", "abc");
    net.join("alice");
    net.deliver_all();
    net.edit("alice", "doc", |_| Operation::insert(0, "x"));
    net.host_edit("doc", |_| Operation::insert(3, "y"));
    net.deliver_all();

    net.audit("alice");
    net.deliver_all();
    assert!(net.host.watchdog().history().is_empty());
    assert_eq!(net.content("alice", "doc").as_deref(), Some("xabcy"));
}

#[test]
fn stale_checksum_is_not_a_mismatch() {
    let mut net = Network::new();
    net.share("doc", "abc");
    net.join("alice");
    net.deliver_all();

    // The host edits, but alice reports before seeing it.
    net.host_edit("doc", |_| Operation::insert(0, "z"));
    net.audit("alice");
    net.deliver_all();

    assert!(net.host.watchdog().history().is_empty());
    assert_eq!(net.content("alice", "doc").as_deref(), Some("zabc"));
}

#[test]
fn protocol_violation_breaks_document_until_resync() {
    let mut net = Network::new();
    net.share("doc", "abc");
    net.join("alice");
    net.deliver_all();

    // A relay claiming to acknowledge operations alice never sent.
    net.host_edit("doc", |_| Operation::insert(0, "?"));
    assert_eq!(net.in_flight.len(), 1);
    net.tamper(0, |message| {
        if let Message::EditRequest { request, .. } = message {
            request.timestamp = Timestamp::new(0, 9);
        }
    });
    net.deliver(0);

    let alice = ParticipantId::from("alice");
    assert_eq!(
        net.participants[&alice].0.document_state(&"doc".into()),
        Some(DocumentState::Broken)
    );
    assert_eq!(
        net.count_events(|e| matches!(e, SessionEvent::DocumentBroken { .. })),
        1
    );

    // The broken report reaches the host, which resyncs alice.
    net.deliver_all();
    assert_eq!(
        net.participants[&alice].0.document_state(&"doc".into()),
        Some(DocumentState::Active)
    );
    assert_eq!(net.content("alice", "doc").as_deref(), Some("?abc"));
}

#[test]
fn edits_from_before_a_resync_are_dropped() {
    let mut net = Network::new();
    net.share("doc", "abc");
    net.join("alice");
    net.deliver_all();

    net.edit("alice", "doc", |_| Operation::insert(0, "lost "));
    // The host resyncs alice before her edit arrives.
    let events = net
        .host
        .resync(&"doc".into(), &"alice".into(), net.now_ms)
        .unwrap();
    assert_eq!(events.len(), 1);
    for event in events {
        if let SessionEvent::Transmit { to, packet } = event {
            net.in_flight.push(common::InFlight {
                from: HOST.into(),
                to,
                packet,
            });
        }
    }
    net.deliver_all();

    assert_eq!(net.content(HOST, "doc").as_deref(), Some("abc"));
    assert_eq!(net.content("alice", "doc").as_deref(), Some("abc"));
}

#[test]
fn snapshot_applied_twice_is_idempotent() {
    let mut net = Network::new();
    net.share("doc", "abc");
    net.join("alice");
    net.deliver_all();

    let snapshot = Message::ResyncSnapshot {
        document: "doc".into(),
        content: "fresh".into(),
        reset_timestamp: Timestamp::ZERO,
        generation: 3,
    };
    let alice = ParticipantId::from("alice");

    let first = net.forge_from_host("alice", snapshot.clone());
    net.inject(&HOST.into(), &alice, first);
    let after_once = (
        net.content("alice", "doc"),
        net.participants[&alice].0.timestamp(&"doc".into()),
        net.participants[&alice].0.generation(&"doc".into()),
    );

    let second = net.forge_from_host("alice", snapshot);
    net.inject(&HOST.into(), &alice, second);
    let after_twice = (
        net.content("alice", "doc"),
        net.participants[&alice].0.timestamp(&"doc".into()),
        net.participants[&alice].0.generation(&"doc".into()),
    );

    assert_eq!(after_once, after_twice);
    assert_eq!(after_once.0.as_deref(), Some("fresh"));
    assert_eq!(after_once.1, Some(Timestamp::ZERO));
}

#[test]
fn departed_participant_gets_nothing_more() {
    let mut net = Network::new();
    net.share("doc", "abc");
    net.join("alice");
    net.join("bob");
    net.deliver_all();

    net.edit("bob", "doc", |_| Operation::insert(0, "b"));
    assert!(net.host.remove_participant(&"alice".into()));
    net.deliver(0);

    assert_eq!(net.count_in_flight(|p| p.to.as_str() == "alice"), 0);
    net.deliver_all();
    assert_eq!(net.content(HOST, "doc").as_deref(), Some("babc"));
    assert_eq!(net.content("alice", "doc").as_deref(), Some("abc"));
    assert_eq!(net.host.timestamp_of(&"doc".into(), &"alice".into()), None);
}

#[test]
fn lost_packet_is_recovered_by_retransmission() {
    let mut config = concord::CollabConfig::default();
    config.sequencer.gap_timeout_ms = 100;
    let mut net = Network::with_config(config);
    net.share("doc", "");
    net.join("alice");
    net.deliver_all();

    net.host_edit("doc", |_| Operation::insert(0, "a"));
    net.host_edit("doc", |_| Operation::insert(1, "b"));
    // Hold back the first relay and deliver the second.
    let _held = net.in_flight.remove(0);
    net.deliver_all();
    assert_eq!(net.content("alice", "doc").as_deref(), Some(""));

    net.tick(200);
    assert_eq!(
        net.count_in_flight(|p| matches!(p.packet, Packet::Retransmit(_))),
        1
    );
    net.deliver_all();
    assert_eq!(net.content("alice", "doc").as_deref(), Some("ab"));
}

#[test]
fn resharing_supersedes_a_resynced_copy() {
    let mut net = Network::new();
    net.share("doc", "abc");
    net.join("alice");
    net.deliver_all();
    {
        let (_, editor) = net.participants.get_mut(&ParticipantId::from("alice")).unwrap();
        concord::Editor::replace(editor, &"doc".into(), "abX".to_string());
    }
    net.audit("alice");
    net.deliver_all();
    assert_eq!(net.host.generation_of(&"doc".into(), &"alice".into()), Some(2));

    // Alice keeps her generation-2 copy across the unshare.
    net.unshare("doc");
    net.share("doc", "xyz");
    net.host_edit("doc", |_| Operation::insert(3, "!"));
    net.deliver_all();
    net.audit("alice");
    net.deliver_all();

    assert_eq!(net.content("alice", "doc").as_deref(), Some("xyz!"));
    assert_eq!(net.host.generation_of(&"doc".into(), &"alice".into()), Some(3));
    let (alice, _) = &net.participants[&ParticipantId::from("alice")];
    assert_eq!(alice.generation(&"doc".into()), Some(3));
    assert_eq!(net.host.watchdog().history().len(), 1);

    net.edit("alice", "doc", |_| Operation::insert(0, "<"));
    net.deliver_all();
    assert_eq!(net.content(HOST, "doc").as_deref(), Some("<xyz!"));
}

fn short_history() -> concord::CollabConfig {
    let mut config = concord::CollabConfig::default();
    config.sequencer.gap_timeout_ms = 100;
    config.sequencer.history_limit = 1;
    config
}

#[test]
fn evicted_relay_is_replaced_by_snapshot() {
    let mut net = Network::with_config(short_history());
    net.share("doc", "abc");
    net.join("alice");
    net.deliver_all();

    net.host_edit("doc", |_| Operation::insert(3, "d"));
    net.host_edit("doc", |_| Operation::insert(4, "e"));
    // The first relay is lost and already gone from the host's history.
    let _lost = net.in_flight.remove(0);
    net.deliver_all();
    assert_eq!(net.content("alice", "doc").as_deref(), Some("abc"));

    net.tick(200);
    net.deliver_all();

    assert_eq!(net.content("alice", "doc").as_deref(), Some("abcde"));
    let (alice, _) = &net.participants[&ParticipantId::from("alice")];
    assert_eq!(alice.document_state(&"doc".into()), Some(DocumentState::Active));
    let reasons: Vec<_> = net
        .host
        .watchdog()
        .history()
        .iter()
        .map(|i| i.reason.clone())
        .collect();
    assert_eq!(
        reasons,
        vec![InconsistencyReason::StreamLost {
            from_seq: 2,
            to_seq: 2
        }]
    );
    assert!(!net.host.watchdog().is_resyncing(&"doc".into(), &"alice".into()));

    net.edit("alice", "doc", |_| Operation::insert(0, ">"));
    net.deliver_all();
    assert_eq!(net.content(HOST, "doc").as_deref(), Some(">abcde"));
}

#[test]
fn evicted_participant_edit_triggers_resync() {
    let mut net = Network::with_config(short_history());
    net.share("doc", "abc");
    net.join("alice");
    net.deliver_all();

    net.edit("alice", "doc", |_| Operation::insert(0, "x"));
    net.edit("alice", "doc", |_| Operation::insert(1, "y"));
    let _lost = net.in_flight.remove(0);
    net.deliver_all();
    assert_eq!(net.content(HOST, "doc").as_deref(), Some("abc"));

    net.tick(200);
    net.deliver_all();

    // Both of alice's edits are gone; she is back on the host's copy.
    assert_eq!(net.all_contents("doc"), vec![Some("abc".to_string()); 2]);
    assert_eq!(
        net.count_events(|e| matches!(
            e,
            SessionEvent::InconsistencyDetected {
                reason: InconsistencyReason::StreamLost { .. },
                ..
            }
        )),
        1
    );
    assert_eq!(net.host.generation_of(&"doc".into(), &"alice".into()), Some(2));
}

impl Network {
    fn deliver_all_matching_host(&mut self) {
        while let Some(i) = self.in_flight.iter().position(|p| p.to.as_str() == HOST) {
            self.deliver(i);
        }
    }
}
