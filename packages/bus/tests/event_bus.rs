#![allow(clippy::disallowed_methods)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bus::{BusError, Event, EventBus, ListenerError, ListenerResult, Store};
use serde_json::json;

use common::{TestResult, TestStore, eventually, forward, recv, stays_empty};

#[tokio::test]
async fn every_listener_receives_each_event() -> TestResult {
    common::init_tracing();
    let bus = EventBus::new(Store::memory()).await?;

    let (first, mut first_rx) = forward::<Event>();
    let (second, mut second_rx) = forward::<Event>();
    bus.subscribe_listener("user.created", first).await?;
    bus.subscribe_listener("user.created", second).await?;

    let published = bus.publish("user.created", json!({ "id": 7 })).await?;

    for rx in [&mut first_rx, &mut second_rx] {
        let event = recv(rx).await?;
        assert_eq!(event.channel, "user.created");
        assert_eq!(event.payload, json!({ "id": 7 }));
        assert_eq!(event.event_id, published.event_id);
    }
    Ok(())
}

#[tokio::test]
async fn store_subscription_follows_first_and_last_listener() -> TestResult {
    let test_store = TestStore::default();
    let bus = EventBus::new(test_store.store().await?).await?;
    let counts = test_store.counts.clone();

    let (a, _a_rx) = forward::<Event>();
    let (b, _b_rx) = forward::<Event>();
    let a = bus.subscribe_listener("ch", a).await?;
    let b = bus.subscribe_listener("ch", b).await?;
    assert_eq!(counts.subscribes(), 1);
    assert_eq!(bus.listener_count("ch").await, 2);

    assert!(bus.unsubscribe("ch", a).await?);
    assert_eq!(counts.unsubscribes(), 0);

    assert!(bus.unsubscribe("ch", b).await?);
    assert_eq!(counts.unsubscribes(), 1);

    // Unknown ids change nothing.
    assert!(!bus.unsubscribe("ch", b).await?);
    assert_eq!(counts.unsubscribes(), 1);

    let (c, mut c_rx) = forward::<Event>();
    bus.subscribe_listener("ch", c).await?;
    assert_eq!(counts.subscribes(), 2);

    bus.publish("ch", json!("again")).await?;
    assert_eq!(recv(&mut c_rx).await?.payload, json!("again"));
    Ok(())
}

#[tokio::test]
async fn failed_store_unsubscribe_still_removes_the_listener() -> TestResult {
    let test_store = TestStore::default();
    let bus = EventBus::new(test_store.store().await?).await?;
    let (listener, mut rx) = forward::<Event>();
    let id = bus.subscribe_listener("ch", listener).await?;

    test_store.faults.fail_unsubscribes(true);
    assert!(bus.unsubscribe("ch", id).await?);
    assert_eq!(bus.listener_count("ch").await, 0);
    assert_eq!(test_store.counts.unsubscribes(), 1);

    bus.publish("ch", json!("unheard")).await?;
    assert!(stays_empty(&mut rx, Duration::from_millis(50)).await);

    test_store.faults.fail_unsubscribes(false);
    let (listener, mut rx) = forward::<Event>();
    bus.subscribe_listener("ch", listener).await?;
    bus.publish("ch", json!("heard")).await?;
    assert_eq!(recv(&mut rx).await?.payload, json!("heard"));
    Ok(())
}

#[tokio::test]
async fn once_listener_fires_at_most_once() -> TestResult {
    let test_store = TestStore::default();
    let bus = EventBus::new(test_store.store().await?).await?;

    let fired = Arc::new(AtomicUsize::new(0));
    bus.once("tick", {
        let fired = fired.clone();
        move |_event: Event| {
            let fired = fired.clone();
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
                ListenerResult::Ok(())
            }
        }
    })
    .await?;
    let (steady, mut steady_rx) = forward::<Event>();
    bus.subscribe_listener("tick", steady).await?;

    for n in 0..3 {
        bus.publish("tick", json!(n)).await?;
    }
    for n in 0..3 {
        assert_eq!(recv(&mut steady_rx).await?.payload, json!(n));
    }

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(bus.listener_count("tick").await, 1);
    assert_eq!(test_store.counts.unsubscribes(), 0);
    Ok(())
}

#[tokio::test]
async fn lone_once_listener_releases_the_subscription() -> TestResult {
    let test_store = TestStore::default();
    let bus = EventBus::new(test_store.store().await?).await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bus.once("ready", move |event: Event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.payload);
            ListenerResult::Ok(())
        }
    })
    .await?;

    bus.publish("ready", json!(true)).await?;
    assert_eq!(recv(&mut rx).await?, json!(true));

    let counts = test_store.counts.clone();
    assert!(eventually(|| {
        let counts = counts.clone();
        async move { counts.unsubscribes() == 1 }
    })
    .await);
    assert_eq!(bus.listener_count("ready").await, 0);
    Ok(())
}

#[tokio::test]
async fn publish_without_listeners_is_a_no_op() -> TestResult {
    let bus = EventBus::new(Store::memory()).await?;

    let first = bus.publish("nobody.listens", json!({})).await?;
    let second = bus.publish("nobody.listens", json!({})).await?;

    assert_ne!(first.event_id, second.event_id);
    assert!(bus.channels().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn failing_listeners_do_not_starve_the_others() -> TestResult {
    let bus = EventBus::new(Store::memory()).await?;

    bus.subscribe("jobs", |_event: Event| async {
        Err::<(), ListenerError>("rejected".into())
    })
    .await?;
    bus.subscribe("jobs", |event: Event| async move {
        if event.payload == json!(1) {
            panic!("listener bug");
        }
        ListenerResult::Ok(())
    })
    .await?;
    let (healthy, mut healthy_rx) = forward::<Event>();
    bus.subscribe_listener("jobs", healthy).await?;

    bus.publish("jobs", json!(1)).await?;
    bus.publish("jobs", json!(2)).await?;

    assert_eq!(recv(&mut healthy_rx).await?.payload, json!(1));
    assert_eq!(recv(&mut healthy_rx).await?.payload, json!(2));
    Ok(())
}

#[tokio::test]
async fn malformed_messages_are_dropped() -> TestResult {
    let store = Store::memory();
    let bus = EventBus::new(store.clone()).await?;
    let (listener, mut rx) = forward::<Event>();
    bus.subscribe_listener("raw", listener).await?;

    store.publish("raw", "not json").await?;
    bus.publish("raw", json!("valid")).await?;

    assert_eq!(recv(&mut rx).await?.payload, json!("valid"));
    assert!(stays_empty(&mut rx, Duration::from_millis(50)).await);
    Ok(())
}

#[tokio::test]
async fn closed_bus_rejects_further_use() -> TestResult {
    let bus = EventBus::new(Store::memory()).await?;
    let (listener, mut rx) = forward::<Event>();
    bus.subscribe_listener("ch", listener).await?;

    bus.close().await?;
    bus.close().await?;

    assert!(bus.is_closed());
    assert!(matches!(bus.publish("ch", json!(1)).await, Err(BusError::Closed)));
    assert!(matches!(
        bus.subscribe("ch", |_: Event| async { ListenerResult::Ok(()) }).await,
        Err(BusError::Closed)
    ));
    assert_eq!(bus.listener_count("ch").await, 0);
    assert!(stays_empty(&mut rx, Duration::from_millis(50)).await);
    Ok(())
}
