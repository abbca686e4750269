//! Broker and upstream pump, end to end over the in-memory upstream.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tribe_protocol::{codec, Chat, Envelope, PresenceUpdate, Record, WireWriter};
use tribecast_core::{
    Broker, BrokerConfig, DeliveryPolicy, Event, ListenerChannel, MemoryUpstream,
    SubscriptionState,
};

const WAIT: Duration = Duration::from_secs(2);

fn setup() -> (Broker, Arc<MemoryUpstream>) {
    let upstream = Arc::new(MemoryUpstream::new());
    let config = BrokerConfig {
        resubscribe_initial: Duration::from_millis(10),
        resubscribe_max: Duration::from_millis(50),
        ..BrokerConfig::default()
    };
    let broker = Broker::with_config(upstream.clone(), config);
    (broker, upstream)
}

/// Poll until the topic has exactly `count` upstream subscribers.
async fn wait_for_subscribers(upstream: &MemoryUpstream, topic: &str, count: usize) {
    let deadline = Instant::now() + WAIT;
    while upstream.subscriber_count(topic) != count {
        assert!(
            Instant::now() < deadline,
            "topic {topic} never reached {count} subscribers"
        );
        sleep(Duration::from_millis(5)).await;
    }
}

async fn next(listener: &mut ListenerChannel) -> Event {
    timeout(WAIT, listener.recv())
        .await
        .expect("timed out waiting for event")
        .expect("listener closed")
}

fn chat(message: &str) -> Record {
    Record::Chat(Chat {
        sender_name: "Bob".into(),
        sender_steam_name: "bob_steam".into(),
        sender_tribe_name: "Raiders".into(),
        sender_id: 17,
        message: message.into(),
        sender_team_index: 2,
        send_mode: "TribeChat".into(),
        user_id: "7656119".into(),
        use_admin_icon: false,
        is_tribe_owner: true,
        player_badge_group: 0,
    })
}

#[tokio::test]
async fn test_upstream_record_reaches_group() {
    let (broker, upstream) = setup();
    let mut a = broker.join("user-a", 7);
    let mut b = broker.join("user-b", 7);
    wait_for_subscribers(&upstream, "tribemsg:7", 1).await;

    upstream.publish("tribemsg:7", codec::encode(&chat("Hello"), 1, 0));

    for listener in [&mut a, &mut b] {
        let event = next(listener).await;
        assert_eq!(event.group, Some(7));
        assert_eq!(event.kind, Some("Chat"));
        let json: serde_json::Value = serde_json::from_str(event.data()).unwrap();
        assert_eq!(json["SenderName"], "Bob");
        assert_eq!(json["Message"], "Hello");
        assert_eq!(json["SenderID"], 17);
    }
}

#[tokio::test]
async fn test_bad_records_do_not_stop_pump() {
    let (broker, upstream) = setup();
    let mut listener = broker.join("user-a", 7);
    wait_for_subscribers(&upstream, "tribemsg:7", 1).await;

    upstream.publish("tribemsg:7", vec![1u8, 2, 3]);
    // Chat whose first string claims more bytes than the body holds.
    let mut oversized = WireWriter::new(&Envelope::new(1, 0, 1));
    oversized.put_i32(64).put_raw_string(b"short");
    upstream.publish("tribemsg:7", oversized.finish());
    upstream.publish("tribemsg:7", WireWriter::new(&Envelope::new(1, 0, 999)).finish());
    let presence = Record::PresenceUpdate(PresenceUpdate {
        player_id: 5,
        last_online_at: 100,
    });
    upstream.publish("tribemsg:7", codec::encode(&presence, 1, 0));

    let event = next(&mut listener).await;
    assert_eq!(event.kind, Some("PresenceUpdate"));
    assert!(listener.try_recv().is_none());

    let stats = broker.stats();
    assert_eq!(stats.decode_failures, 2);
    assert_eq!(stats.unknown_variants, 1);
    assert_eq!(broker.subscription_state(7), SubscriptionState::Active);
}

#[tokio::test]
async fn test_subscription_lifecycle() {
    let (broker, upstream) = setup();

    let a = broker.join("user-a", 7);
    let b = broker.join("user-b", 7);
    wait_for_subscribers(&upstream, "tribemsg:7", 1).await;
    assert_eq!(broker.subscription_state(7), SubscriptionState::Active);

    broker.leave(a.id());
    assert_eq!(broker.subscription_state(7), SubscriptionState::Active);
    assert_eq!(upstream.subscriber_count("tribemsg:7"), 1);

    broker.leave(b.id());
    assert_ne!(broker.subscription_state(7), SubscriptionState::Active);

    broker.retire(7).await;
    assert_eq!(broker.subscription_state(7), SubscriptionState::Absent);
    assert_eq!(upstream.subscriber_count("tribemsg:7"), 0);
}

#[tokio::test]
async fn test_rejoin_during_retire_keeps_one_subscription() {
    let (broker, upstream) = setup();

    let first = broker.join("user-a", 7);
    wait_for_subscribers(&upstream, "tribemsg:7", 1).await;
    broker.leave(first.id());

    let mut second = broker.join("user-a", 7);
    assert_eq!(broker.subscription_state(7), SubscriptionState::Active);
    wait_for_subscribers(&upstream, "tribemsg:7", 1).await;

    // Give a stray second pump a chance to show up.
    sleep(Duration::from_millis(30)).await;
    assert_eq!(upstream.subscriber_count("tribemsg:7"), 1);
    assert_eq!(broker.stats().active_subscriptions, 1);

    upstream.publish("tribemsg:7", codec::encode(&chat("again"), 1, 0));
    let event = next(&mut second).await;
    assert!(event.data().contains("again"));
    assert!(second.try_recv().is_none());
}

#[tokio::test]
async fn test_resubscribe_after_upstream_loss() {
    let (broker, upstream) = setup();
    let mut listener = broker.join("user-a", 7);
    wait_for_subscribers(&upstream, "tribemsg:7", 1).await;

    assert!(upstream.close_topic("tribemsg:7"));
    wait_for_subscribers(&upstream, "tribemsg:7", 1).await;

    upstream.publish("tribemsg:7", codec::encode(&chat("back"), 1, 0));
    let event = next(&mut listener).await;
    assert!(event.data().contains("back"));
    assert!(broker.stats().upstream_errors >= 1);
    assert!(!listener.is_closed());
}

#[tokio::test]
async fn test_groups_are_isolated() {
    let (broker, upstream) = setup();
    let mut seven = broker.join("user-a", 7);
    let mut eight = broker.join("user-b", 8);
    wait_for_subscribers(&upstream, "tribemsg:7", 1).await;
    wait_for_subscribers(&upstream, "tribemsg:8", 1).await;

    upstream.publish("tribemsg:8", codec::encode(&chat("eight"), 1, 0));

    let event = next(&mut eight).await;
    assert_eq!(event.group, Some(8));
    sleep(Duration::from_millis(20)).await;
    assert!(seven.try_recv().is_none());
}

#[tokio::test]
async fn test_user_listeners_across_groups() {
    let (broker, _upstream) = setup();
    let mut in_seven = broker.join("user-a", 7);
    let mut in_eight = broker.join("user-a", 8);

    let count = broker
        .send_to_user("user-a", Event::new("direct"))
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(next(&mut in_seven).await.data(), "direct");
    assert_eq!(next(&mut in_eight).await.data(), "direct");
}

#[tokio::test]
async fn test_slow_listener_disconnected() {
    let upstream = Arc::new(MemoryUpstream::new());
    let config = BrokerConfig {
        delivery_policy: DeliveryPolicy::Disconnect,
        listener_capacity: 16,
        ..BrokerConfig::default()
    };
    let broker = Broker::with_config(upstream.clone(), config);
    let mut slow = broker.join("slow", 7);
    wait_for_subscribers(&upstream, "tribemsg:7", 1).await;

    for i in 0..17 {
        upstream.publish("tribemsg:7", codec::encode(&chat(&i.to_string()), 1, 0));
    }

    // The group empties, so the pump is cancelled along with the listener.
    timeout(WAIT, broker.retire(7)).await.unwrap();
    wait_for_subscribers(&upstream, "tribemsg:7", 0).await;
    assert!(slow.is_closed());
    assert!(slow.recv().await.is_none());
    assert_eq!(broker.stats().listeners_disconnected, 1);
}

#[tokio::test]
async fn test_shutdown_stops_pumps() {
    let (broker, upstream) = setup();
    let mut listener = broker.join("user-a", 7);
    let _other = broker.join("user-b", 8);
    wait_for_subscribers(&upstream, "tribemsg:7", 1).await;
    wait_for_subscribers(&upstream, "tribemsg:8", 1).await;

    timeout(WAIT, broker.shutdown()).await.unwrap();

    assert_eq!(upstream.subscriber_count("tribemsg:7"), 0);
    assert_eq!(upstream.subscriber_count("tribemsg:8"), 0);
    assert!(listener.recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_join_leave_churn() {
    let (broker, upstream) = setup();
    let peak = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let watcher = tokio::spawn({
        let upstream = upstream.clone();
        let peak = peak.clone();
        let stop = stop.clone();
        async move {
            while !stop.load(Ordering::Relaxed) {
                peak.fetch_max(upstream.subscriber_count("tribemsg:7"), Ordering::Relaxed);
                tokio::task::yield_now().await;
            }
        }
    });

    for round in 0..20 {
        let tasks: Vec<_> = (0..16)
            .map(|worker| {
                let broker = broker.clone();
                tokio::spawn(async move {
                    for cycle in 0..20 {
                        let listener = broker.join(format!("user-{worker}"), 7);
                        if (worker + cycle) % 3 == 0 {
                            tokio::task::yield_now().await;
                        }
                        assert!(broker.leave(listener.id()));
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(broker.group_listener_count(7), 0, "round {round}");
        timeout(WAIT, broker.retire(7))
            .await
            .unwrap_or_else(|_| panic!("round {round}: pump never stopped"));
        assert_eq!(broker.subscription_state(7), SubscriptionState::Absent);
        wait_for_subscribers(&upstream, "tribemsg:7", 0).await;
    }

    stop.store(true, Ordering::Relaxed);
    watcher.await.unwrap();
    assert!(peak.load(Ordering::Relaxed) <= 1);
    assert_eq!(broker.stats().listeners, 0);
}
