//! Reliability tests
//!
//! End-to-end properties of the publish/consume core against the embedded
//! broker:
//! - confirms resolve in FIFO sequence order
//! - queue declaration is idempotent, conflicting flags error
//! - outstanding publishes are replayed in order after reconnect
//! - redelivery ceiling routes to dead-letter instead of requeueing
//! - a handler that fails once sees the redelivery and the message is acked

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use cv_broker::MemoryBroker;
use cv_client::{ChannelRole, Client, ConsumerState, DeliveryContext, EventHandler};
use cv_common::{
    BrokerConfig, ConsumerOptions, ConveyorError, Event, EventAction, HandlerOutcome,
    PublisherConfig, QueueOptions, ReconnectPolicy,
};

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_connect_attempts: None,
    }
}

async fn connect(broker: &MemoryBroker) -> Client {
    Client::connect(
        Box::new(broker.clone()),
        BrokerConfig::default(),
        fast_policy(),
    )
    .await
    .unwrap()
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Handler that fails its first `fail_first` invocations, recording the
/// redelivery count it observed on each call.
struct FlakyHandler {
    calls: AtomicU32,
    fail_first: u32,
    seen_redeliveries: Mutex<Vec<u32>>,
}

impl FlakyHandler {
    fn new(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first,
            seen_redeliveries: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FlakyHandler {
    async fn handle(&self, _event: Event, delivery: &DeliveryContext) -> HandlerOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_redeliveries.lock().push(delivery.redelivery_count);
        if call < self.fail_first {
            HandlerOutcome::retry("transient handler failure")
        } else {
            HandlerOutcome::Success
        }
    }
}

#[tokio::test]
async fn confirms_resolve_in_fifo_sequence_order() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let publisher = client.publisher(QueueOptions::durable("q"), PublisherConfig::default());

    for expected in 1..=10u64 {
        let receipt = publisher
            .send(Event::new(format!("item-{expected}"), EventAction::Created))
            .await
            .unwrap();
        assert_eq!(receipt.sequence, expected);
    }
    assert_eq!(broker.queue_depth("q"), 10);

    client.shutdown().await;
}

#[tokio::test]
async fn queue_declaration_is_idempotent() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    let channel = client.channels().acquire(ChannelRole::Publisher).await.unwrap();
    let queue = QueueOptions::durable("q");
    channel.channel().declare_queue(&queue).await.unwrap();
    channel.channel().declare_queue(&queue).await.unwrap();

    let conflicting = QueueOptions {
        name: "q".to_string(),
        durable: false,
    };
    assert!(channel.channel().declare_queue(&conflicting).await.is_err());

    client.shutdown().await;
}

#[tokio::test]
async fn outstanding_publishes_replay_in_order_after_reconnect() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let publisher = client.publisher(QueueOptions::durable("q"), PublisherConfig::default());

    // Declare the queue while the connection is still up, then take the
    // broker away and keep reconnect attempts failing.
    publisher
        .send(Event::new("warmup", EventAction::Created))
        .await
        .unwrap();
    broker.fail_next_connects(u32::MAX);
    broker.kill_connections();

    // Three sends with a short caller deadline: each times out but stays
    // tracked for replay.
    let events: Vec<Event> = (1..=3)
        .map(|i| Event::new(format!("replayed-{i}"), EventAction::Updated))
        .collect();
    for event in &events {
        let err = publisher
            .send_with_timeout(event.clone(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::PublishTimeout(_)));
    }
    assert_eq!(publisher.outstanding(), 3);

    // Let the broker back up; the supervisor reconnects and the publisher
    // replays in sequence order, exactly once each.
    broker.fail_next_connects(0);
    eventually("replayed publishes to settle", || publisher.outstanding() == 0).await;

    let payloads = broker.queue_payloads("q");
    let expected: Vec<Vec<u8>> = std::iter::once(Event::new("warmup", EventAction::Created))
        .chain(events.iter().cloned())
        .map(|e| e.encode().unwrap())
        .collect();
    assert_eq!(payloads, expected);

    client.shutdown().await;
}

#[tokio::test]
async fn redelivery_ceiling_routes_to_dead_letter() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let queue = QueueOptions::durable("q");

    let publisher = client.publisher(queue.clone(), PublisherConfig::default());
    publisher
        .send(Event::new("poison", EventAction::Created))
        .await
        .unwrap();

    let options = ConsumerOptions {
        redelivery_ceiling: 2,
        ..ConsumerOptions::default()
    };
    let consumer = client.consumer(options);
    let handler = FlakyHandler::new(u32::MAX); // never succeeds
    consumer.start(queue.clone(), handler.clone()).await.unwrap();

    eventually("poison message to reach the dead-letter queue", || {
        broker.queue_depth("q.dead-letter") == 1
    })
    .await;

    // Requeued exactly `ceiling` times: initial delivery plus one redelivery
    // per requeue, and never a third requeue.
    assert_eq!(handler.calls(), 3);
    assert_eq!(broker.queue_depth("q"), 0);
    assert_eq!(&*handler.seen_redeliveries.lock(), &[0, 1, 2]);

    client.shutdown().await;
}

#[tokio::test]
async fn handler_failure_then_success_acks_the_redelivery() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let queue = QueueOptions::durable("products_queue");

    let publisher = client.publisher(queue.clone(), PublisherConfig::default());
    let receipt = publisher
        .send(Event::new("widget", EventAction::Created))
        .await
        .unwrap();
    assert_eq!(receipt.sequence, 1);

    let consumer = client.consumer(ConsumerOptions::default());
    let handler = FlakyHandler::new(1); // fail once, then succeed
    consumer.start(queue.clone(), handler.clone()).await.unwrap();

    eventually("redelivery to be processed and acked", || {
        broker.queue_depth("products_queue") == 0 && handler.calls() == 2
    })
    .await;
    assert_eq!(&*handler.seen_redeliveries.lock(), &[0, 1]);
    assert_eq!(broker.queue_depth("products_queue.dead-letter"), 0);

    consumer.stop().await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    client.shutdown().await;
}

#[tokio::test]
async fn consumer_resubscribes_after_connection_loss() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let queue = QueueOptions::durable("q");

    let consumer = client.consumer(ConsumerOptions::default());
    let handler = FlakyHandler::new(0);
    consumer.start(queue.clone(), handler.clone()).await.unwrap();

    broker.kill_connections();
    // Reconnect happens behind the scenes; a publish from a fresh client
    // must still reach the resubscribed consumer.
    eventually("connection to come back", || broker.open_connections() >= 1).await;

    let seeder = connect(&broker).await;
    let publisher = seeder.publisher(queue.clone(), PublisherConfig::default());
    publisher
        .send(Event::new("after-reconnect", EventAction::Created))
        .await
        .unwrap();

    eventually("delivery after resubscribe", || handler.calls() == 1).await;

    seeder.shutdown().await;
    client.shutdown().await;
}

#[tokio::test]
async fn broker_rejection_surfaces_after_retry_budget() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let publisher = client.publisher(
        QueueOptions::durable("q"),
        PublisherConfig {
            max_publish_retries: 1,
            retry_base_delay: Duration::from_millis(5),
            ..PublisherConfig::default()
        },
    );

    broker.reject_next_publishes(2);
    let err = publisher
        .send(Event::new("rejected", EventAction::Deleted))
        .await
        .unwrap_err();
    assert!(matches!(err, ConveyorError::BrokerRejected(_)));

    client.shutdown().await;
}
