use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeDelta};
use futures_util::{SinkExt, StreamExt};
use pubstash::broker::{Broker, BrokerTransport};
use pubstash::config::{Settings, WorkerSettings};
use pubstash::messaging::{ConsumerGroup, GroupSettings, Publisher};
use pubstash::model::{Message, MessageEnvelope, MessageType};
use pubstash::persistence::IndexedStore;
use pubstash::service::MessageService;
use pubstash::transport::websocket::start_websocket_server;
use serde_json::{Value, json};
use tempfile::tempdir;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::connect_async;
use tungstenite::protocol::Message as WsMessage;

const SENDERS: [&str; 3] = ["sender-1", "sender-2", "sender-3"];

struct Harness {
    broker: Arc<Broker>,
    store: Arc<IndexedStore>,
    settings: GroupSettings,
}

fn harness(store: IndexedStore) -> Harness {
    let mut config = Settings::default();
    config.broker.poll_timeout_ms = 50;
    config.consumer.workers = vec![
        WorkerSettings::new("consumer-a", 10),
        WorkerSettings::new("consumer-b", 15),
        WorkerSettings::new("consumer-c", 8),
    ];
    Harness {
        broker: Arc::new(Broker::from_settings(&config.broker)),
        store: Arc::new(store),
        settings: GroupSettings::from_settings(&config),
    }
}

impl Harness {
    fn publisher(&self) -> Publisher {
        Publisher::new(self.broker.clone(), self.settings.topic.clone())
    }

    fn group(&self) -> ConsumerGroup {
        ConsumerGroup::new(self.broker.clone(), self.store.clone(), self.settings.clone())
    }

    async fn wait_for_generation(&self, generation: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.broker.generation(&self.settings.topic, &self.settings.group_id) < generation
            && Instant::now() < deadline
        {
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_until_drained(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.broker.lag(&self.settings.topic, &self.settings.group_id) > 0
            && Instant::now() < deadline
        {
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(self.broker.lag(&self.settings.topic, &self.settings.group_id), 0);
    }
}

#[tokio::test]
async fn nine_messages_three_senders_three_workers() {
    let dir = tempdir().unwrap();
    let h = harness(IndexedStore::open(dir.path().to_str().unwrap()).unwrap());
    let group = h.group().start().unwrap();
    let publisher = h.publisher();

    let mut sent = HashSet::new();
    for sender in SENDERS {
        for i in 0..3 {
            let message = Message::create(format!("#{i}"), sender, MessageType::Event).unwrap();
            sent.insert(message.id().to_string());
            publisher.publish(&message).unwrap();
        }
    }

    h.wait_until_drained().await;
    let stats = group.shutdown().await;
    assert_eq!(stats.len(), 3);

    assert_eq!(h.store.len(), 9);
    let stored: HashSet<String> = h
        .store
        .list()
        .unwrap()
        .iter()
        .map(|m| m.id().to_string())
        .collect();
    assert_eq!(stored, sent);

    for sender in SENDERS {
        let messages = h.store.list_by_sender(sender).unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.sender() == sender));
    }
    assert!(h.store.verify_indexes().unwrap().is_consistent());
}

#[tokio::test]
async fn malformed_envelope_does_not_stop_the_worker() {
    let h = harness(IndexedStore::temporary().unwrap());
    let group = h.group().start().unwrap();
    let topic = h.settings.topic.clone();
    h.wait_for_generation(3).await;

    // both records share a key, so the bad one sits ahead of the good one
    let bad = json!({
        "id": "x",
        "content": "when?",
        "sender": "sender-1",
        "timestamp": "yesterday",
        "type": "INFO"
    });
    h.broker
        .send(&topic, "shared-key", bad.to_string())
        .await
        .unwrap();
    let good = Message::create("still here", "sender-1", MessageType::Success).unwrap();
    let payload = MessageEnvelope::from(&good).to_json().unwrap();
    h.broker.send(&topic, "shared-key", payload).await.unwrap();
    assert!((0..3).any(|p| h.broker.records(&topic, p).len() == 2));

    h.wait_until_drained().await;
    let stats = group.shutdown().await;

    assert_eq!(h.store.get(good.id()).unwrap(), Some(good));
    assert_eq!(h.store.len(), 1);
    let skipped: u64 = stats.iter().map(|(_, s)| s.skipped).sum();
    assert_eq!(skipped, 1);
    assert_eq!(h.broker.records("messages.DLQ", 0).len(), 1);
}

#[tokio::test]
async fn restarted_group_resumes_after_committed_offsets() {
    let h = harness(IndexedStore::temporary().unwrap());
    let publisher = h.publisher();

    let group = h.group().start().unwrap();
    publisher
        .publish(&Message::create("first", "sender-1", MessageType::Info).unwrap())
        .unwrap();
    h.wait_until_drained().await;
    group.shutdown().await;

    // three joins and three leaves so far; wait for the next three joins
    let group = h.group().start().unwrap();
    h.wait_for_generation(9).await;
    publisher
        .publish(&Message::create("second", "sender-2", MessageType::Info).unwrap())
        .unwrap();
    h.wait_until_drained().await;
    let stats = group.shutdown().await;

    let processed: u64 = stats.iter().map(|(_, s)| s.processed).sum();
    assert_eq!(processed, 1);
    assert_eq!(h.store.len(), 2);
}

#[tokio::test]
async fn cleanup_through_the_facade() {
    let h = harness(IndexedStore::temporary().unwrap());
    let service = MessageService::new(h.store.clone(), h.publisher());

    let old = Local::now().naive_local() - TimeDelta::minutes(70);
    let a = Message::new("A", "old", "sender-1", old, MessageType::Info).unwrap();
    let b = Message::create("new", "sender-2", MessageType::Info).unwrap();
    h.store.save(&a).unwrap();
    h.store.save(&b).unwrap();

    assert_eq!(service.cleanup(60).unwrap(), 1);
    assert_eq!(service.get_by_id("A").unwrap(), None);
    assert_eq!(service.get_by_id(b.id()).unwrap(), Some(b));
}

#[tokio::test]
async fn websocket_create_is_consumed_and_queryable() {
    let h = harness(IndexedStore::temporary().unwrap());
    let group = h.group().start().unwrap();
    let service = MessageService::new(h.store.clone(), h.publisher());

    let addr = "127.0.0.1:39117";
    tokio::spawn(async move {
        let _ = start_websocket_server(addr, service).await;
    });
    sleep(Duration::from_millis(300)).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();

    let create = json!({
        "type": "create",
        "content": "over the wire",
        "sender": "sender-3",
        "message_type": "ERROR"
    });
    ws.send(WsMessage::Text(create.to_string().into())).await.unwrap();
    let created: Value = match ws.next().await {
        Some(Ok(WsMessage::Text(text))) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected frame: {other:?}"),
    };
    assert_eq!(created["type"], "message");

    h.wait_until_drained().await;
    group.shutdown().await;

    ws.send(WsMessage::Text(json!({ "type": "urgent" }).to_string().into()))
        .await
        .unwrap();
    let urgent: Value = match ws.next().await {
        Some(Ok(WsMessage::Text(text))) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected frame: {other:?}"),
    };
    assert_eq!(urgent["messages"].as_array().unwrap().len(), 1);
    assert_eq!(urgent["messages"][0]["id"], created["message"]["id"]);
}
