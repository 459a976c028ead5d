use super::*;
use chrono::{Duration, TimeZone};
use shared::domain::{Attachment, PermanentId};

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().expect("valid time")
        + Duration::seconds(seconds)
}

fn conversation() -> ConversationId {
    ConversationId::new("c1")
}

fn reconciler() -> IdentityReconciler {
    IdentityReconciler::new(std::time::Duration::from_secs(5))
}

fn send(
    store: &mut MessageStore,
    reconciler: &mut IdentityReconciler,
    body: &str,
    seconds: i64,
) -> (ProvisionalId, String) {
    let provisional = ProvisionalId::generate();
    let key = format!("key-{provisional}");
    let message = Message {
        id: MessageId::Provisional(provisional),
        conversation_id: conversation(),
        sender_role: SenderRole::Customer,
        body: Some(body.to_string()),
        attachment: None,
        created_at: at(seconds),
        read: false,
        generated_by_assistant: false,
        delivery: DeliveryState::Pending,
    };
    reconciler.register_send(&message, key.clone());
    store.upsert(message);
    (provisional, key)
}

fn inbound(id: &str, role: SenderRole, body: &str, seconds: i64) -> Message {
    Message {
        id: MessageId::Permanent(PermanentId::new(id)),
        conversation_id: conversation(),
        sender_role: role,
        body: Some(body.to_string()),
        attachment: None,
        created_at: at(seconds),
        read: false,
        generated_by_assistant: false,
        delivery: DeliveryState::Sent,
    }
}

fn ack(id: &str, seconds: i64) -> SendMessageResponse {
    SendMessageResponse {
        message_id: PermanentId::new(id),
        created_at: at(seconds),
    }
}

fn ids(store: &MessageStore) -> Vec<String> {
    store
        .get_ordered(&conversation())
        .iter()
        .map(|m| m.id.to_string())
        .collect()
}

#[test]
fn inbound_copy_of_own_send_replaces_provisional() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    let (t1, _) = send(&mut store, &mut reconciler, "Hello", 0);

    let result = reconciler.reconcile(
        &mut store,
        inbound("P1", SenderRole::Customer, "Hello", 2),
        None,
    );

    assert_eq!(
        result,
        Reconciliation::Reconciled {
            provisional: t1,
            path: MatchPath::Heuristic
        }
    );
    assert_eq!(ids(&store), vec!["P1"]);
}

#[test]
fn ack_then_push_leaves_one_record() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    let (t1, _) = send(&mut store, &mut reconciler, "Hello", 0);

    reconciler.confirm_send(&mut store, t1, &ack("P1", 1));
    let result = reconciler.reconcile(
        &mut store,
        inbound("P1", SenderRole::Customer, "Hello", 1),
        None,
    );

    assert!(matches!(result, Reconciliation::Duplicate { .. }));
    assert_eq!(ids(&store), vec!["P1"]);
}

#[test]
fn push_then_ack_leaves_one_record() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    let (t1, key) = send(&mut store, &mut reconciler, "Hello", 0);

    reconciler.reconcile(
        &mut store,
        inbound("P1", SenderRole::Customer, "Hello", 1),
        Some(&key),
    );
    let result = reconciler.confirm_send(&mut store, t1, &ack("P1", 1));

    assert_eq!(result, Reconciliation::Duplicate { changed: false });
    assert_eq!(ids(&store), vec!["P1"]);
    assert_eq!(reconciler.index().len(&conversation()), 0);
}

#[test]
fn same_permanent_record_twice_is_idempotent() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    let record = inbound("P1", SenderRole::Vendor, "hi", 0);

    assert_eq!(
        reconciler.reconcile(&mut store, record.clone(), None),
        Reconciliation::Appended
    );
    let snapshot = store.get_ordered(&conversation());
    assert_eq!(
        reconciler.reconcile(&mut store, record, None),
        Reconciliation::Duplicate { changed: false }
    );
    assert_eq!(store.get_ordered(&conversation()), snapshot);
}

#[test]
fn identical_bodies_match_in_send_order() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    let (t1, _) = send(&mut store, &mut reconciler, "ok", 0);
    let (t2, _) = send(&mut store, &mut reconciler, "ok", 0);

    let first = reconciler.reconcile(&mut store, inbound("P1", SenderRole::Customer, "ok", 1), None);
    let second = reconciler.reconcile(&mut store, inbound("P2", SenderRole::Customer, "ok", 1), None);

    assert!(matches!(first, Reconciliation::Reconciled { provisional, .. } if provisional == t1));
    assert!(matches!(second, Reconciliation::Reconciled { provisional, .. } if provisional == t2));
    assert_eq!(ids(&store), vec!["P1", "P2"]);
}

#[test]
fn client_key_beats_body_heuristic() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    let (_t1, _) = send(&mut store, &mut reconciler, "ok", 0);
    let (t2, key2) = send(&mut store, &mut reconciler, "ok", 0);

    let result = reconciler.reconcile(
        &mut store,
        inbound("P2", SenderRole::Customer, "ok", 1),
        Some(&key2),
    );

    assert_eq!(
        result,
        Reconciliation::Reconciled {
            provisional: t2,
            path: MatchPath::ClientKey
        }
    );
    assert_eq!(store.len(&conversation()), 2);
}

#[test]
fn body_mismatch_falls_back_to_time_window() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    let (t1, _) = send(&mut store, &mut reconciler, "hello  ", 0);

    // Server trimmed the body.
    let result = reconciler.reconcile(
        &mut store,
        inbound("P1", SenderRole::Customer, "hello", 3),
        None,
    );
    assert!(matches!(result, Reconciliation::Reconciled { provisional, path: MatchPath::Heuristic } if provisional == t1));
}

#[test]
fn outside_tolerance_appends_instead_of_matching() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    send(&mut store, &mut reconciler, "draft", 0);

    let result = reconciler.reconcile(
        &mut store,
        inbound("P1", SenderRole::Customer, "other text", 60),
        None,
    );
    assert_eq!(result, Reconciliation::Appended);
    assert_eq!(store.len(&conversation()), 2);
}

#[test]
fn counterpart_messages_never_match_own_sends() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    send(&mut store, &mut reconciler, "Hello", 0);

    let result = reconciler.reconcile(
        &mut store,
        inbound("P1", SenderRole::Vendor, "Hello", 0),
        None,
    );
    assert_eq!(result, Reconciliation::Appended);
    assert_eq!(store.len(&conversation()), 2);
}

#[test]
fn attachment_presence_must_agree() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    send(&mut store, &mut reconciler, "look", 0);

    let mut with_file = inbound("P1", SenderRole::Customer, "look", 0);
    with_file.attachment = Some(Attachment {
        url: "https://cdn.example.com/a.png".into(),
        media_type: "image/png".into(),
        byte_size: 10,
        local_only: false,
    });

    assert_eq!(
        reconciler.reconcile(&mut store, with_file, None),
        Reconciliation::Appended
    );
}

#[test]
fn cross_matched_ack_still_converges_to_one_record_per_message() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    let (t1, _) = send(&mut store, &mut reconciler, "ok", 0);
    let (t2, _) = send(&mut store, &mut reconciler, "ok", 0);

    // P2 (really t2) arrives first and takes the oldest candidate, t1.
    reconciler.reconcile(&mut store, inbound("P2", SenderRole::Customer, "ok", 1), None);
    reconciler.confirm_send(&mut store, t1, &ack("P1", 1));
    reconciler.confirm_send(&mut store, t2, &ack("P2", 1));
    reconciler.reconcile(&mut store, inbound("P1", SenderRole::Customer, "ok", 1), None);

    let mut final_ids = ids(&store);
    final_ids.sort();
    assert_eq!(final_ids, vec!["P1", "P2"]);
}

#[test]
fn old_history_with_equal_body_does_not_take_a_fresh_send() {
    let mut store = MessageStore::new();
    let mut reconciler = reconciler();
    let (fresh, _) = send(&mut store, &mut reconciler, "ok", 3600);

    let result = reconciler.reconcile(
        &mut store,
        inbound("P-old", SenderRole::Customer, "ok", 0),
        None,
    );

    assert_eq!(result, Reconciliation::Appended);
    assert_eq!(ids(&store), vec!["P-old".to_string(), fresh.to_string()]);
    assert!(store.find_provisional(fresh).is_some());
    assert_eq!(reconciler.index().len(&conversation()), 1);
}
