//! Relay integration tests: presence, rooms and message fan-out across
//! several sessions.

use std::collections::BTreeSet;

use parlor::auth::Identity;
use parlor::ws::{OutboundEvent, RelayConfig, RelayError};
use tokio::sync::mpsc::Receiver;
use tokio::sync::mpsc::error::TryRecvError;

mod common;
use common::{test_state, test_state_with};

/// Drain pending events, keeping only online lists as sorted usernames.
fn online_lists(events: &mut Receiver<OutboundEvent>) -> Vec<Vec<String>> {
    let mut lists = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let OutboundEvent::OnlineUsers(users) = event {
            lists.push(users.into_iter().map(|u| u.username).collect());
        }
    }
    lists
}

fn drain(events: &mut Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_two_tabs_single_presence() {
    let app = test_state().await;
    let relay = &app.state.relay;
    let alice = app.seed_user("alice").await;
    let bob = app.seed_user("bob").await;

    let (_bob_tab, mut bob_rx) = relay.open(bob);
    assert_eq!(online_lists(&mut bob_rx), vec![names(&["bob"])]);

    let (tab1, mut rx1) = relay.open(alice.clone());
    assert_eq!(online_lists(&mut bob_rx), vec![names(&["alice", "bob"])]);
    assert_eq!(online_lists(&mut rx1), vec![names(&["alice", "bob"])]);

    // Second tab: snapshot to the new tab only, nobody else hears about it.
    let (tab2, mut rx2) = relay.open(alice.clone());
    assert_eq!(online_lists(&mut rx2), vec![names(&["alice", "bob"])]);
    assert!(online_lists(&mut rx1).is_empty());
    assert!(online_lists(&mut bob_rx).is_empty());
    assert_eq!(relay.registry().connection_count(&alice.user_id), 2);

    // Closing one tab keeps the user online.
    tab1.close();
    assert!(online_lists(&mut bob_rx).is_empty());
    assert!(online_lists(&mut rx2).is_empty());
    assert!(relay.registry().is_online(&alice.user_id));

    // Closing the last tab takes the user offline.
    tab2.close();
    assert_eq!(online_lists(&mut bob_rx), vec![names(&["bob"])]);
    assert!(!relay.registry().is_online(&alice.user_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_all_visible() {
    const USERS: usize = 24;

    let app = test_state_with(RelayConfig {
        connection_buffer: 1024,
        ..RelayConfig::default()
    })
    .await;

    let mut identities = Vec::new();
    for i in 0..USERS {
        identities.push(app.seed_user(&format!("user{i:02}")).await);
    }

    let mut handles = Vec::new();
    for identity in identities.clone() {
        let relay = app.state.relay.clone();
        handles.push(tokio::spawn(async move { relay.open(identity) }));
    }

    let mut sessions = Vec::new();
    for handle in handles {
        sessions.push(handle.await.unwrap());
    }

    let snapshot = app.state.relay.registry().snapshot();
    assert_eq!(snapshot.len(), USERS);
    let expected: BTreeSet<(String, String)> = identities
        .iter()
        .map(|i| (i.user_id.clone(), i.username.clone()))
        .collect();
    let actual: BTreeSet<(String, String)> = snapshot
        .iter()
        .map(|e| (e.user_id.clone(), e.username.clone()))
        .collect();
    assert_eq!(actual, expected);

    // The last list every connection received is the full set.
    for (_session, rx) in sessions.iter_mut() {
        let lists = online_lists(rx);
        assert_eq!(lists.last().map(Vec::len), Some(USERS));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_churn_settles_offline() {
    const USERS: usize = 8;
    const ROUNDS: usize = 20;

    let app = test_state_with(RelayConfig {
        connection_buffer: 4096,
        ..RelayConfig::default()
    })
    .await;
    let observer = app.seed_user("observer").await;
    let (_observer_tab, mut observer_rx) = app.state.relay.open(observer);

    let mut churners: Vec<Identity> = Vec::new();
    for i in 0..USERS {
        churners.push(app.seed_user(&format!("churn{i}")).await);
    }

    let mut handles = Vec::new();
    for identity in churners.clone() {
        let relay = app.state.relay.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let (first, _rx1) = relay.open(identity.clone());
                let (second, _rx2) = relay.open(identity.clone());
                tokio::task::yield_now().await;
                first.close();
                drop(second);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let registry = app.state.relay.registry();
    assert_eq!(registry.len(), 1);
    for identity in &churners {
        assert!(!registry.is_online(&identity.user_id));
    }

    let lists = online_lists(&mut observer_rx);
    assert_eq!(lists.last(), Some(&names(&["observer"])));
}

#[tokio::test]
async fn test_room_fan_out_and_ownership() {
    let app = test_state().await;
    let relay = &app.state.relay;
    let alice = app.seed_user("alice").await;
    let bob = app.seed_user("bob").await;
    let carol = app.seed_user("carol").await;

    let (a, mut a_rx) = relay.open(alice.clone());
    let (b, mut b_rx) = relay.open(bob.clone());
    let (_c, mut c_rx) = relay.open(carol);

    a.handle_text(r#"{"event":"join-channel","data":"general"}"#)
        .await
        .unwrap();
    b.handle_text(r#"{"event":"join-channel","data":{"roomId":"general"}}"#)
        .await
        .unwrap();
    drain(&mut a_rx);
    drain(&mut b_rx);
    drain(&mut c_rx);

    a.handle_text(
        r#"{"event":"send-message","data":{"roomId":"general","content":"  hello  "}}"#,
    )
    .await
    .unwrap();

    let sent = match drain(&mut a_rx).as_slice() {
        [OutboundEvent::NewMessage(message)] => message.clone(),
        other => panic!("unexpected events: {other:?}"),
    };
    assert_eq!(sent.content, "hello");
    assert_eq!(sent.sender.id, alice.user_id);
    assert_eq!(drain(&mut b_rx), vec![OutboundEvent::NewMessage(sent.clone())]);
    assert!(drain(&mut c_rx).is_empty(), "non-members hear nothing");

    // Bob may not edit or delete Alice's message.
    let edit = format!(
        r#"{{"event":"edit-message","data":{{"roomId":"general","messageId":"{}","content":"hijacked"}}}}"#,
        sent.id
    );
    let err = b.handle_text(&edit).await.unwrap_err();
    assert!(matches!(err, RelayError::NotAuthorized(_)));
    assert_eq!(
        drain(&mut b_rx),
        vec![OutboundEvent::error("Not authorized to edit this message")]
    );
    assert!(drain(&mut a_rx).is_empty());

    let delete = format!(
        r#"{{"event":"delete-message","data":{{"roomId":"general","messageId":"{}"}}}}"#,
        sent.id
    );
    assert!(b.handle_text(&delete).await.is_err());
    assert_eq!(
        drain(&mut b_rx),
        vec![OutboundEvent::error("Not authorized to delete this message")]
    );
    assert!(drain(&mut a_rx).is_empty());

    // The author can.
    a.handle_text(&edit).await.unwrap();
    match drain(&mut b_rx).as_slice() {
        [OutboundEvent::MessageEdited(message)] => {
            assert_eq!(message.content, "hijacked");
            assert!(message.is_edited);
        }
        other => panic!("unexpected events: {other:?}"),
    }
    drain(&mut a_rx);

    a.handle_text(&delete).await.unwrap();
    assert_eq!(drain(&mut a_rx).len(), 1);
    assert_eq!(drain(&mut b_rx).len(), 1);
}

#[tokio::test]
async fn test_close_purges_rooms_and_notifies_nobody_in_room() {
    let app = test_state().await;
    let relay = &app.state.relay;
    let alice = app.seed_user("alice").await;
    let bob = app.seed_user("bob").await;

    let (a, _a_rx) = relay.open(alice);
    let (b, mut b_rx) = relay.open(bob);
    for room in ["general", "random"] {
        let join = format!(r#"{{"event":"join-channel","data":"{room}"}}"#);
        a.handle_text(&join).await.unwrap();
    }
    b.handle_text(r#"{"event":"join-channel","data":"general"}"#)
        .await
        .unwrap();
    drain(&mut b_rx);

    let a_id = a.id();
    a.close();

    assert!(relay.rooms().rooms_of(a_id).is_empty());
    assert_eq!(relay.rooms().members("general"), vec![b.id()]);
    assert!(relay.rooms().members("random").is_empty());

    // Only the online list changes; no room-scoped leave is broadcast.
    assert_eq!(
        drain(&mut b_rx)
            .into_iter()
            .filter(|e| !matches!(e, OutboundEvent::OnlineUsers(_)))
            .count(),
        0
    );
}

#[tokio::test]
async fn test_slow_connection_is_closed_instead_of_left_stale() {
    let app = test_state_with(RelayConfig {
        connection_buffer: 2,
        ..RelayConfig::default()
    })
    .await;
    let relay = &app.state.relay;
    let alice = app.seed_user("alice").await;
    let bob = app.seed_user("bob").await;
    let carol = app.seed_user("carol").await;

    // Alice never reads, so her buffer fills up.
    let (alice_tab, mut alice_rx) = relay.open(alice.clone());
    let alice_close = alice_tab.close_signal();
    let (bob_tab, mut bob_rx) = relay.open(bob);
    drain(&mut bob_rx);
    assert!(!alice_close.is_cancelled());

    let (_carol_tab, mut carol_rx) = relay.open(carol);
    assert!(alice_close.is_cancelled());
    drain(&mut bob_rx);

    bob_tab.close();
    drain(&mut carol_rx);

    // What was queued before the overflow is delivered, then the stream ends.
    assert_eq!(
        online_lists(&mut alice_rx),
        vec![names(&["alice"]), names(&["alice", "bob"])]
    );
    assert!(matches!(alice_rx.try_recv(), Err(TryRecvError::Disconnected)));

    // The transport reacts to the signal by closing; a reconnect is current.
    alice_tab.close();
    let (_again, mut again_rx) = relay.open(alice);
    assert_eq!(
        online_lists(&mut again_rx).last(),
        Some(&names(&["alice", "carol"]))
    );
}

#[tokio::test]
async fn test_shutdown_flushes_presence_writes() {
    let app = test_state().await;
    let relay = &app.state.relay;
    let alice = app.seed_user("alice").await;

    let (tab, _rx) = relay.open(alice.clone());
    tab.close();
    relay.shutdown().await;

    let stored = app.users.get(&alice.user_id).await.unwrap().unwrap();
    assert!(!stored.is_online);
    assert!(stored.last_seen.is_some());

    relay.shutdown().await;
}
