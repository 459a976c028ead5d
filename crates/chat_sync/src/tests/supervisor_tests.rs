use super::*;

fn policy() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_secs(1),
        max: Duration::from_secs(8),
        max_attempts: 3,
    }
}

#[test]
fn backoff_grows_and_caps() {
    let policy = policy();
    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    assert_eq!(policy.delay_for(40), Duration::from_secs(8));
}

#[test]
fn connect_cycle_walks_states() {
    let mut supervisor = ConnectionSupervisor::new(policy());
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);

    assert!(supervisor.begin_connect());
    assert_eq!(supervisor.state(), ConnectionState::Connecting);
    assert!(!supervisor.begin_connect());

    supervisor.on_connected();
    assert_eq!(supervisor.state(), ConnectionState::Connected);
}

#[test]
fn channel_loss_disconnects_then_degrades_with_bounded_retries() {
    let mut supervisor = ConnectionSupervisor::new(policy());
    let now = Instant::now();
    supervisor.begin_connect();
    supervisor.on_connected();

    let first = supervisor.on_channel_lost(now).expect("first retry");
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    supervisor.degrade();
    assert_eq!(supervisor.state(), ConnectionState::Degraded);
    assert_eq!(first, now + Duration::from_secs(1));

    assert!(!supervisor.reconnect_due(now));
    assert!(supervisor.reconnect_due(first));
    assert!(supervisor.begin_connect());
    let second = supervisor.on_channel_lost(first).expect("second retry");
    assert_eq!(second, first + Duration::from_secs(2));

    supervisor.begin_connect();
    supervisor.on_channel_lost(second).expect("third retry");
    supervisor.begin_connect();
    assert!(supervisor.on_channel_lost(second).is_none());
    assert_eq!(supervisor.next_deadline(), None);
}

#[test]
fn reconnect_rejoins_every_open_room() {
    let mut supervisor = ConnectionSupervisor::new(policy());
    assert!(!supervisor.join_room(ConversationId::new("c1")));
    assert!(!supervisor.join_room(ConversationId::new("c2")));

    supervisor.begin_connect();
    let rooms = supervisor.on_connected();
    assert_eq!(
        rooms,
        vec![ConversationId::new("c1"), ConversationId::new("c2")]
    );

    assert!(supervisor.leave_room(&ConversationId::new("c1")));
    supervisor.on_channel_lost(Instant::now());
    supervisor.begin_connect();
    assert_eq!(supervisor.on_connected(), vec![ConversationId::new("c2")]);
}

#[test]
fn manual_retry_refills_budget_and_fires_now() {
    let mut supervisor = ConnectionSupervisor::new(BackoffPolicy {
        max_attempts: 1,
        ..policy()
    });
    let now = Instant::now();
    supervisor.begin_connect();
    supervisor.on_channel_lost(now);
    supervisor.begin_connect();
    assert!(supervisor.on_channel_lost(now).is_none());
    supervisor.degrade();

    assert!(supervisor.reset_budget(now));
    assert_eq!(supervisor.attempts(), 0);
    assert!(supervisor.reconnect_due(now));
}

#[test]
fn halt_blocks_all_reconnects() {
    let mut supervisor = ConnectionSupervisor::new(policy());
    supervisor.halt();

    assert!(!supervisor.begin_connect());
    assert!(supervisor.on_channel_lost(Instant::now()).is_none());
    assert!(!supervisor.reset_budget(Instant::now()));
    supervisor.degrade();
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}
