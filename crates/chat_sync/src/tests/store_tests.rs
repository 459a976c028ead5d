use super::*;
use chrono::{DateTime, Duration, TimeZone, Utc};

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().expect("valid time") + Duration::seconds(seconds)
}

fn conversation() -> ConversationId {
    ConversationId::new("c1")
}

fn permanent(id: &str, role: SenderRole, body: &str, seconds: i64) -> Message {
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

fn provisional(role: SenderRole, body: &str, seconds: i64) -> (ProvisionalId, Message) {
    let id = ProvisionalId::generate();
    let mut message = permanent("unused", role, body, seconds);
    message.id = MessageId::Provisional(id);
    message.delivery = DeliveryState::Pending;
    (id, message)
}

fn ids(store: &MessageStore) -> Vec<String> {
    store
        .get_ordered(&conversation())
        .iter()
        .map(|m| m.id.to_string())
        .collect()
}

#[test]
fn keeps_records_sorted_by_created_at() {
    let mut store = MessageStore::new();
    store.upsert(permanent("p3", SenderRole::Vendor, "c", 30));
    store.upsert(permanent("p1", SenderRole::Vendor, "a", 10));
    store.upsert(permanent("p2", SenderRole::Customer, "b", 20));

    assert_eq!(ids(&store), vec!["p1", "p2", "p3"]);
}

#[test]
fn equal_timestamps_keep_arrival_order() {
    let mut store = MessageStore::new();
    store.upsert(permanent("b", SenderRole::Vendor, "first", 10));
    store.upsert(permanent("a", SenderRole::Vendor, "second", 10));
    store.upsert(permanent("c", SenderRole::Vendor, "third", 10));

    assert_eq!(ids(&store), vec!["b", "a", "c"]);
}

#[test]
fn upserting_identical_record_is_unchanged() {
    let mut store = MessageStore::new();
    let message = permanent("p1", SenderRole::Vendor, "hi", 0);

    assert_eq!(store.upsert(message.clone()), UpsertOutcome::Inserted);
    let before = store.get_ordered(&conversation());
    assert_eq!(store.upsert(message), UpsertOutcome::Unchanged);
    assert_eq!(store.get_ordered(&conversation()), before);
}

#[test]
fn upsert_never_clears_read_flag() {
    let mut store = MessageStore::new();
    let mut message = permanent("p1", SenderRole::Vendor, "hi", 0);
    message.read = true;
    store.upsert(message.clone());

    message.read = false;
    assert_eq!(store.upsert(message), UpsertOutcome::Unchanged);
    assert!(store.get_ordered(&conversation())[0].read);
}

#[test]
fn replacing_provisional_keeps_single_record() {
    let mut store = MessageStore::new();
    let (tmp, message) = provisional(SenderRole::Customer, "Hello", 5);
    store.upsert(permanent("p0", SenderRole::Vendor, "before", 5));
    store.upsert(message);
    store.upsert(permanent("p9", SenderRole::Vendor, "after", 5));

    let confirmed = permanent("p1", SenderRole::Customer, "Hello", 5);
    assert_eq!(store.replace_provisional(tmp, confirmed), ReplaceOutcome::Replaced);

    assert_eq!(ids(&store), vec!["p0", "p1", "p9"]);
    assert!(store.find_provisional(tmp).is_none());
    assert_eq!(
        store.get_ordered(&conversation())[1].delivery,
        DeliveryState::Sent
    );
}

#[test]
fn replacement_reorders_when_server_time_differs() {
    let mut store = MessageStore::new();
    let (tmp, message) = provisional(SenderRole::Customer, "Hello", 1);
    store.upsert(message);
    store.upsert(permanent("p5", SenderRole::Vendor, "later", 5));

    store.replace_provisional(tmp, permanent("p7", SenderRole::Customer, "Hello", 7));
    assert_eq!(ids(&store), vec!["p5", "p7"]);
}

#[test]
fn replacing_when_permanent_exists_collapses() {
    let mut store = MessageStore::new();
    let (tmp, message) = provisional(SenderRole::Customer, "Hello", 0);
    store.upsert(message);
    store.upsert(permanent("p1", SenderRole::Customer, "Hello", 1));

    let outcome = store.replace_provisional(tmp, permanent("p1", SenderRole::Customer, "Hello", 1));
    assert_eq!(outcome, ReplaceOutcome::Collapsed);
    assert_eq!(ids(&store), vec!["p1"]);
}

#[test]
fn remove_provisional_only_touches_provisional_records() {
    let mut store = MessageStore::new();
    let (_, pending) = provisional(SenderRole::Customer, "draft", 0);
    store.upsert(pending);
    store.upsert(permanent("p1", SenderRole::Customer, "draft", 1));

    let removed = store.remove_provisional(|m| m.body.as_deref() == Some("draft"));
    assert_eq!(removed.len(), 1);
    assert_eq!(ids(&store), vec!["p1"]);
}

#[test]
fn mark_read_reports_only_flipped_ids() {
    let mut store = MessageStore::new();
    store.upsert(permanent("p1", SenderRole::Vendor, "a", 0));
    store.upsert(permanent("p2", SenderRole::Vendor, "b", 1));

    let flipped = store.mark_read(&conversation(), &[PermanentId::new("p1")]);
    assert_eq!(flipped, vec![PermanentId::new("p1")]);

    let flipped = store.mark_read(
        &conversation(),
        &[PermanentId::new("p1"), PermanentId::new("p2")],
    );
    assert_eq!(flipped, vec![PermanentId::new("p2")]);
}

#[test]
fn unread_count_ignores_local_role() {
    let mut store = MessageStore::new();
    store.upsert(permanent("p1", SenderRole::Vendor, "a", 0));
    store.upsert(permanent("p2", SenderRole::Assistant, "b", 1));
    store.upsert(permanent("p3", SenderRole::Customer, "mine", 2));

    assert_eq!(store.unread_count(&conversation(), SenderRole::Customer), 2);
    store.mark_read(&conversation(), &[PermanentId::new("p2")]);
    assert_eq!(store.unread_count(&conversation(), SenderRole::Customer), 1);
}

#[test]
fn evict_keeps_pending_sends_when_requested() {
    let mut store = MessageStore::new();
    let (tmp, pending) = provisional(SenderRole::Customer, "draft", 9);
    store.upsert(pending);
    store.upsert(permanent("p1", SenderRole::Vendor, "a", 0));

    assert_eq!(store.evict(&conversation(), true), 1);
    assert!(store.find_provisional(tmp).is_some());
    assert_eq!(store.evict(&conversation(), false), 1);
    assert!(store.is_empty(&conversation()));
}

#[test]
fn recent_returns_tail_in_order() {
    let mut store = MessageStore::new();
    for i in 0..5 {
        store.upsert(permanent(&format!("p{i}"), SenderRole::Vendor, "x", i));
    }
    let recent: Vec<_> = store
        .recent(&conversation(), 2)
        .into_iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(recent, vec!["p3", "p4"]);
}
