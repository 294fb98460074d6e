//! Queue consumers, dead-letter handling and event fan-out.

mod common;

use common::{fast_retry, init_tracing, wait_until};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasker_flow::events::{DeliveryOutcome, Event, EventBus, EventSubscriber, FnSubscriber};
use tasker_flow::messaging::{MessageHandler, MessageQueue, QueueConsumer, QueueMessage};

fn toggled_handler(healthy: Arc<AtomicBool>, seen: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
    Arc::new(move |message: QueueMessage| {
        seen.fetch_add(1, Ordering::SeqCst);
        let healthy = healthy.load(Ordering::SeqCst);
        async move {
            if healthy {
                Ok(())
            } else {
                Err::<(), _>(anyhow::anyhow!("cannot process order {}", message.payload["order"]))
            }
        }
    })
}

#[tokio::test]
async fn test_consumer_dead_letters_after_retry_budget_and_replays() {
    init_tracing();
    let queue = Arc::new(MessageQueue::new().with_redelivery_policy(fast_retry(1)));
    queue.create_queue("orders").unwrap();

    let message = queue.message(json!({"order": 7})).with_max_retries(2);
    let message_id = queue.publish("orders", message).unwrap();

    let healthy = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(AtomicUsize::new(0));
    let consumer = QueueConsumer::new(
        queue.clone(),
        "orders",
        toggled_handler(healthy.clone(), seen.clone()),
    )
    .with_poll_interval(Duration::from_millis(5))
    .spawn();

    assert!(wait_until(|| queue.dead_letters("orders").unwrap().len() == 1).await);
    let stats = consumer.shutdown().await.unwrap();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.processed, 0);
    assert_eq!(seen.load(Ordering::SeqCst), 3);

    let dead_letters = queue.dead_letters("orders").unwrap();
    let dead_letter = &dead_letters[0];
    assert_eq!(dead_letter.message_id(), message_id);
    assert_eq!(dead_letter.message.retry_count, 3);
    assert!(dead_letter.reason.contains("cannot process order 7"));
    assert_eq!(queue.depth("orders").unwrap(), 0);

    healthy.store(true, Ordering::SeqCst);
    queue.replay_dead_letter("orders", message_id).unwrap();
    assert!(queue.dead_letters("orders").unwrap().is_empty());

    let consumer = QueueConsumer::new(queue.clone(), "orders", toggled_handler(healthy, seen.clone()))
        .with_poll_interval(Duration::from_millis(5))
        .spawn();
    assert!(wait_until(|| queue.depth("orders").unwrap() == 0).await);
    let stats = consumer.shutdown().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(seen.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_priority_order_and_visibility_timeout() {
    let queue = MessageQueue::new();
    queue.create_queue("jobs").unwrap();

    let low = queue.publish("jobs", queue.message(json!("low")).with_priority(1)).unwrap();
    let high = queue.publish("jobs", queue.message(json!("high")).with_priority(9)).unwrap();

    let lease = Duration::from_millis(50);
    let first = queue.dequeue("jobs", lease, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(first.id, high);

    let second = queue.dequeue("jobs", lease, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(second.id, low);
    queue.acknowledge("jobs", &second.receipt).unwrap();

    // The unacknowledged high-priority message reappears once its lease lapses
    assert!(queue.dequeue("jobs", lease, Duration::ZERO).await.unwrap().is_none());
    let redelivered = queue
        .dequeue("jobs", lease, Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.id, high);
    assert_eq!(queue.depth("jobs").unwrap(), 1);

    // Only the newest lease settles the redelivered message
    assert!(queue.acknowledge("jobs", &first.receipt).is_err());
    queue.acknowledge("jobs", &redelivered.receipt).unwrap();
    assert_eq!(queue.depth("jobs").unwrap(), 0);
}

#[tokio::test]
async fn test_zero_retry_budget_dead_letters_on_first_failure() {
    let queue = MessageQueue::new();
    queue.create_queue("once").unwrap();
    let id = queue
        .publish("once", queue.message(json!({})).with_max_retries(0))
        .unwrap();

    let leased = queue
        .dequeue("once", Duration::from_secs(5), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    let disposition = queue.fail("once", &leased.receipt, "rejected").unwrap();
    assert!(disposition.is_dead_lettered());
    assert_eq!(queue.dead_letters("once").unwrap()[0].message_id(), id);
}

fn recording(id: &str, received: Arc<AtomicUsize>) -> Arc<dyn EventSubscriber> {
    FnSubscriber::new(id, move |_event: Event| {
        received.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    })
}

#[tokio::test]
async fn test_failing_subscriber_is_isolated_and_dead_lettered() {
    init_tracing();
    let bus = EventBus::new().with_handler_timeout(Duration::from_millis(100));

    let audit = Arc::new(AtomicUsize::new(0));
    let billing = Arc::new(AtomicUsize::new(0));
    let fail_shipping = Arc::new(AtomicBool::new(true));

    bus.subscribe("order.*", recording("audit", audit.clone())).unwrap();
    bus.subscribe("order.created", recording("billing", billing.clone()))
        .unwrap();
    let flag = fail_shipping.clone();
    bus.subscribe(
        "order.created",
        FnSubscriber::new("shipping", move |event: Event| {
            let failing = flag.load(Ordering::SeqCst);
            async move {
                if failing {
                    anyhow::bail!("no carrier for {}", event.payload["order"]);
                }
                Ok(())
            }
        }),
    )
    .unwrap();

    let report = bus
        .publish(Event::new("order.created", "storefront", json!({"order": 11})))
        .await
        .unwrap();

    assert_eq!(report.deliveries.len(), 3);
    assert_eq!(report.delivered_count(), 2);
    assert_eq!(report.outcome_for("audit"), Some(&DeliveryOutcome::Delivered));
    assert!(matches!(
        report.outcome_for("shipping"),
        Some(DeliveryOutcome::Failed { error }) if error.contains("no carrier for 11")
    ));
    assert_eq!(audit.load(Ordering::SeqCst), 1);
    assert_eq!(billing.load(Ordering::SeqCst), 1);

    let dead_letters = bus.dead_letters("shipping");
    assert_eq!(dead_letters.len(), 1);
    assert!(bus.dead_letters("audit").is_empty());
    assert!(bus.dead_letters("billing").is_empty());

    // Replay goes to the failing subscriber only
    fail_shipping.store(false, Ordering::SeqCst);
    let delivery = bus
        .replay_dead_letter("shipping", dead_letters[0].id)
        .await
        .unwrap();
    assert!(delivery.outcome.is_delivered());
    assert!(bus.dead_letters("shipping").is_empty());
    assert_eq!(audit.load(Ordering::SeqCst), 1);
    assert_eq!(billing.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slow_subscriber_times_out_without_blocking_others() {
    let bus = EventBus::new().with_handler_timeout(Duration::from_millis(30));
    let fast = Arc::new(AtomicUsize::new(0));

    bus.subscribe("report.*", recording("fast", fast.clone())).unwrap();
    bus.subscribe(
        "report.*",
        FnSubscriber::new("slow", |_event: Event| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }),
    )
    .unwrap();

    let report = bus
        .publish(Event::new("report.ready", "analytics", json!({})))
        .await
        .unwrap();

    assert_eq!(fast.load(Ordering::SeqCst), 1);
    assert_eq!(
        report.outcome_for("slow"),
        Some(&DeliveryOutcome::TimedOut { timeout_ms: 30 })
    );
    assert_eq!(bus.dead_letters("slow").len(), 1);
}
