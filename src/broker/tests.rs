use super::Broker;
use super::topic::Topic;
use super::transport::{BrokerTransport, RebalanceListener};
use crate::config::{BrokerSettings, OffsetReset, Settings};
use crate::utils::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOPIC: &str = "messages";
const GROUP: &str = "group";
const SHORT: Duration = Duration::from_millis(50);

fn broker_with_topic(partitions: u32) -> Broker {
    let broker = Broker::default();
    broker.create_topic(TOPIC, partitions);
    broker
}

/// Finds a key that routes to `partition`.
fn key_for(partition: u32, partitions: u32) -> String {
    let topic = Topic::new("routing", partitions);
    (0..)
        .map(|i| format!("key-{i}"))
        .find(|k| topic.partition_for(k) == partition)
        .unwrap()
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<(String, String, Vec<u32>)>>,
}

impl RebalanceListener for RecordingListener {
    fn on_partitions_revoked(&self, member_id: &str, partitions: &[u32]) {
        self.events
            .lock()
            .unwrap()
            .push(("revoked".into(), member_id.into(), partitions.to_vec()));
    }

    fn on_partitions_assigned(&self, member_id: &str, partitions: &[u32]) {
        self.events
            .lock()
            .unwrap()
            .push(("assigned".into(), member_id.into(), partitions.to_vec()));
    }
}

#[test]
fn test_topic_new() {
    let topic = Topic::new("test_topic", 3);
    assert_eq!(topic.name, "test_topic");
    assert_eq!(topic.partition_count(), 3);
    assert_eq!(topic.end_offset(0), 0);
}

#[test]
fn test_topic_has_at_least_one_partition() {
    assert_eq!(Topic::new("t", 0).partition_count(), 1);
}

#[test]
fn test_same_key_same_partition_in_order() {
    let mut topic = Topic::new("t", 3);
    let first = topic.append("order-42", "a".into());
    let second = topic.append("order-42", "b".into());

    assert_eq!(first.partition, second.partition);
    assert_eq!(second.offset, first.offset + 1);

    let payloads: Vec<_> = topic
        .read(first.partition, 0, 10)
        .into_iter()
        .map(|r| r.payload)
        .collect();
    assert_eq!(payloads, vec!["a", "b"]);
}

#[test]
fn test_read_past_end_is_empty() {
    let mut topic = Topic::new("t", 1);
    topic.append("k", "a".into());
    assert!(topic.read(0, 5, 10).is_empty());
    assert!(topic.read(7, 0, 10).is_empty());
}

#[test]
fn test_read_window_from_middle() {
    let mut topic = Topic::new("t", 1);
    for i in 0..5 {
        topic.append("k", format!("m{i}"));
    }

    let offsets: Vec<u64> = topic.read(0, 2, 2).into_iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![2, 3]);
    assert_eq!(topic.read(0, 4, 10).len(), 1);
    assert!(topic.read(0, 5, 10).is_empty());
}

#[test]
fn test_from_settings_creates_dead_letter_topic() {
    let settings = Settings::default().broker;
    let broker = Broker::from_settings(&settings);
    assert_eq!(broker.partition_count("messages"), Some(3));
    assert_eq!(broker.partition_count("messages.DLQ"), Some(1));

    let no_dlq = BrokerSettings {
        dead_letter: false,
        ..settings
    };
    assert_eq!(Broker::from_settings(&no_dlq).partition_count("messages.DLQ"), None);
}

#[tokio::test]
async fn test_send_acknowledges_with_offset() {
    let broker = broker_with_topic(3);
    let ack = broker.send(TOPIC, "k", "hello".into()).await.unwrap();
    assert_eq!(ack.topic, TOPIC);
    assert_eq!(ack.offset, 0);
    assert_eq!(broker.end_offset(TOPIC, ack.partition), 1);
}

#[tokio::test]
async fn test_send_to_unknown_topic_fails() {
    let broker = Broker::default();
    let err = broker.send("nope", "k", "x".into()).await.unwrap_err();
    assert!(matches!(err, Error::Delivery(_)));
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let broker = broker_with_topic(1);
    broker.close();
    let err = broker.send(TOPIC, "k", "x".into()).await.unwrap_err();
    assert!(matches!(err, Error::Delivery(_)));
}

#[tokio::test]
async fn test_single_member_owns_every_partition() {
    let broker = broker_with_topic(3);
    let sub = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();
    assert_eq!(broker.assigned_partitions(&sub), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_members_get_disjoint_partitions() {
    let broker = broker_with_topic(3);
    let a = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();
    let b = broker.subscribe(TOPIC, GROUP, "b", None).unwrap();
    let c = broker.subscribe(TOPIC, GROUP, "c", None).unwrap();

    assert_eq!(broker.assigned_partitions(&a), vec![0]);
    assert_eq!(broker.assigned_partitions(&b), vec![1]);
    assert_eq!(broker.assigned_partitions(&c), vec![2]);
    assert_eq!(broker.generation(TOPIC, GROUP), 3);
}

#[tokio::test]
async fn test_extra_members_stay_idle() {
    let broker = broker_with_topic(1);
    let a = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();
    let b = broker.subscribe(TOPIC, GROUP, "b", None).unwrap();
    assert_eq!(broker.assigned_partitions(&a), vec![0]);
    assert!(broker.assigned_partitions(&b).is_empty());
}

#[tokio::test]
async fn test_listener_sees_revoke_then_assign() {
    let broker = broker_with_topic(2);
    let listener = Arc::new(RecordingListener::default());
    broker
        .subscribe(TOPIC, GROUP, "a", Some(listener.clone()))
        .unwrap();
    broker
        .subscribe(TOPIC, GROUP, "b", Some(listener.clone()))
        .unwrap();

    let events = listener.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            ("assigned".to_string(), "a".to_string(), vec![0, 1]),
            ("revoked".to_string(), "a".to_string(), vec![1]),
            ("assigned".to_string(), "b".to_string(), vec![1]),
        ]
    );
}

#[tokio::test]
async fn test_poll_returns_records_in_partition_order() {
    let broker = broker_with_topic(1);
    for i in 0..5 {
        broker.send(TOPIC, "k", format!("m{i}")).await.unwrap();
    }
    let sub = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();

    let first = broker.poll(&sub, 3, SHORT).await.unwrap();
    let second = broker.poll(&sub, 3, SHORT).await.unwrap();
    let offsets: Vec<_> = first.iter().chain(&second).map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_poll_times_out_empty() {
    let broker = broker_with_topic(1);
    let sub = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();
    assert!(broker.poll(&sub, 10, SHORT).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_poll_wakes_on_send() {
    let broker = Arc::new(broker_with_topic(1));
    let sub = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();

    let producer = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.send(TOPIC, "k", "late".into()).await.unwrap();
    });

    let records = broker.poll(&sub, 10, Duration::from_secs(5)).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, "late");
}

#[tokio::test]
async fn test_poll_after_close_errors() {
    let broker = broker_with_topic(1);
    let sub = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();
    broker.close();
    assert!(matches!(
        broker.poll(&sub, 10, SHORT).await,
        Err(Error::Transport(_))
    ));
}

#[tokio::test]
async fn test_uncommitted_records_are_redelivered_after_rebalance() {
    let broker = broker_with_topic(2);
    let key = key_for(1, 2);
    for i in 0..3 {
        broker.send(TOPIC, &key, format!("m{i}")).await.unwrap();
    }

    let a = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();
    let fetched = broker.poll(&a, 10, SHORT).await.unwrap();
    assert_eq!(fetched.len(), 3);
    // only the first record gets committed before the rebalance
    broker.commit(&a, 1, 0).unwrap();

    let b = broker.subscribe(TOPIC, GROUP, "b", None).unwrap();
    assert_eq!(broker.assigned_partitions(&b), vec![1]);

    let redelivered = broker.poll(&b, 10, SHORT).await.unwrap();
    let offsets: Vec<_> = redelivered.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![1, 2]);
}

#[tokio::test]
async fn test_commit_rejected_after_revocation() {
    let broker = broker_with_topic(2);
    let a = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();
    broker.subscribe(TOPIC, GROUP, "b", None).unwrap();

    assert!(broker.commit(&a, 0, 0).is_ok());
    assert!(matches!(broker.commit(&a, 1, 0), Err(Error::Transport(_))));
}

#[tokio::test]
async fn test_committed_offset_only_moves_forward() {
    let broker = broker_with_topic(1);
    let a = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();
    broker.commit(&a, 0, 4).unwrap();
    broker.commit(&a, 0, 2).unwrap();
    assert_eq!(broker.committed(TOPIC, GROUP, 0), Some(5));
}

#[tokio::test]
async fn test_seek_rewinds_position() {
    let broker = broker_with_topic(1);
    broker.send(TOPIC, "k", "a".into()).await.unwrap();
    broker.send(TOPIC, "k", "b".into()).await.unwrap();
    let sub = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();

    assert_eq!(broker.poll(&sub, 10, SHORT).await.unwrap().len(), 2);
    broker.seek(&sub, 0, 1).unwrap();
    let again = broker.poll(&sub, 10, SHORT).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].payload, "b");
}

#[tokio::test]
async fn test_leave_hands_partitions_back() {
    let broker = broker_with_topic(3);
    let a = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();
    let b = broker.subscribe(TOPIC, GROUP, "b", None).unwrap();
    broker.unsubscribe(&b);
    assert_eq!(broker.assigned_partitions(&a), vec![0, 1, 2]);
    assert!(broker.assigned_partitions(&b).is_empty());
}

#[tokio::test]
async fn test_latest_reset_skips_existing_records() {
    let broker = Broker::new(OffsetReset::Latest);
    broker.create_topic(TOPIC, 1);
    broker.send(TOPIC, "k", "old".into()).await.unwrap();

    let sub = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();
    assert!(broker.poll(&sub, 10, SHORT).await.unwrap().is_empty());

    broker.send(TOPIC, "k", "new".into()).await.unwrap();
    let records = broker.poll(&sub, 10, SHORT).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, "new");
}

#[tokio::test]
async fn test_groups_consume_independently() {
    let broker = broker_with_topic(1);
    broker.send(TOPIC, "k", "shared".into()).await.unwrap();
    let a = broker.subscribe(TOPIC, "audit", "a", None).unwrap();
    let b = broker.subscribe(TOPIC, "index", "b", None).unwrap();
    assert_eq!(broker.poll(&a, 10, SHORT).await.unwrap().len(), 1);
    assert_eq!(broker.poll(&b, 10, SHORT).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_lag_counts_uncommitted_records() {
    let broker = broker_with_topic(1);
    for _ in 0..4 {
        broker.send(TOPIC, "k", "x".into()).await.unwrap();
    }
    let sub = broker.subscribe(TOPIC, GROUP, "a", None).unwrap();
    assert_eq!(broker.lag(TOPIC, GROUP), 4);
    broker.commit(&sub, 0, 1).unwrap();
    assert_eq!(broker.lag(TOPIC, GROUP), 2);
}
