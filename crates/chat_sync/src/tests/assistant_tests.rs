use super::*;
use chrono::Utc;
use serde_json::json;
use shared::domain::{DeliveryState, MessageId, PermanentId, SenderRole};

fn c1() -> ConversationId {
    ConversationId::new("c1")
}

fn message(id: &str, role: SenderRole, body: Option<&str>) -> Message {
    Message {
        id: MessageId::Permanent(PermanentId::new(id)),
        conversation_id: c1(),
        sender_role: role,
        body: body.map(str::to_string),
        attachment: None,
        created_at: Utc::now(),
        read: true,
        generated_by_assistant: false,
        delivery: DeliveryState::Sent,
    }
}

#[test]
fn request_keeps_newest_text_turns_in_order() {
    let relay = AssistantRelay::new(2);
    let recent = vec![
        message("P1", SenderRole::Customer, Some("first")),
        message("P2", SenderRole::Vendor, Some("second")),
        message("P3", SenderRole::Customer, None),
        message("P4", SenderRole::Customer, Some("third")),
    ];

    let request = relay.build_request(&c1(), &recent, json!({"business": "salon"}));

    let texts: Vec<_> = request.recent_messages.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(texts, vec!["second", "third"]);
    assert_eq!(request.recent_messages[0].role, SenderRole::Vendor);
    assert_eq!(request.business_context, json!({"business": "salon"}));
    assert!(request.prior_slot_state.is_none());
}

#[test]
fn slot_state_is_relayed_on_next_turn() {
    let mut relay = AssistantRelay::new(20);
    let reply = relay
        .accept_response(
            &c1(),
            AssistantResponse {
                response_text: " Which day works? ".into(),
                slot_state: Some(json!({"service": "haircut"})),
            },
        )
        .expect("reply");
    assert_eq!(reply, "Which day works?");

    let request = relay.build_request(&c1(), &[], json!(null));
    assert_eq!(request.prior_slot_state, Some(json!({"service": "haircut"})));

    // A reply without slot state keeps the previous one.
    relay
        .accept_response(
            &c1(),
            AssistantResponse {
                response_text: "ok".into(),
                slot_state: None,
            },
        )
        .expect("reply");
    assert_eq!(relay.slot_state(&c1()), Some(&json!({"service": "haircut"})));

    relay.forget(&c1());
    assert!(relay.slot_state(&c1()).is_none());
}

#[test]
fn empty_reply_is_rejected() {
    let mut relay = AssistantRelay::new(20);
    let err = relay
        .accept_response(
            &c1(),
            AssistantResponse {
                response_text: "   ".into(),
                slot_state: None,
            },
        )
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
}
