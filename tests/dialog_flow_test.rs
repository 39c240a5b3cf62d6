//! Dialog Flow Integration Tests
//!
//! End-to-end conversations through the public API, with SQLite-backed
//! snapshots surviving an engine restart.

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use flowbot::{
    ActionRegistry, ChannelRegistry, ChatManager, Config, ConversationRef, EntityObservation,
    Event, ExtractorPipeline, FlowGraph, KeywordExtractor, MemoryChannel, Resolver, ScheduleStore,
    Scheduler, SnapshotStore, SqliteSnapshotStore,
};

const FLOWS: &str = r#"
    [default]
    unsupported = { text = "Sorry, I did not get that." }

    [[default.states]]
    name = "root"
    action = { text = "Hi there!" }
    supports = ["greeting"]

    [order]
    intent = "order|buy"
    accepts = ["product"]

    [[order.states]]
    name = "root"
    action = { text = "What would you like?", next = "checkout:" }

    [[order.states]]
    name = "checkout"
    action = { text = "Order placed." }
    require = [{ entity = "product", action = { text = "Which product?" } }]
    supports = ["product"]
"#;

fn create_engine(db_path: &Path) -> (Arc<ChatManager>, Arc<MemoryChannel>) {
    let registry = ActionRegistry::new();
    let graph = Arc::new(FlowGraph::from_toml_str(FLOWS, &registry).expect("flows should build"));

    let snapshots: Arc<dyn SnapshotStore> =
        Arc::new(SqliteSnapshotStore::open(db_path).expect("snapshot store"));
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(ScheduleStore::open(db_path).expect("schedule store")),
        snapshots.clone(),
    ));

    let channel = Arc::new(MemoryChannel::new());
    let mut channels = ChannelRegistry::new();
    channels.register(channel.clone());

    let pipeline = ExtractorPipeline::new()
        .with(Arc::new(
            KeywordExtractor::new("greeting", &[("hello", &["hi", "hello", "hey"])]).unwrap(),
        ))
        .with(Arc::new(
            KeywordExtractor::new("product", &[("apples", &["apple", "apples"])]).unwrap(),
        ));

    let resolver = Resolver::new(graph, &Config::default());
    let manager = Arc::new(ChatManager::new(
        resolver, snapshots, channels, scheduler, pipeline,
    ));
    (manager, channel)
}

fn conversation() -> ConversationRef {
    ConversationRef::new(42, "memory")
}

#[tokio::test]
async fn test_slot_filling_conversation() {
    let temp = TempDir::new().unwrap();
    let (manager, channel) = create_engine(&temp.path().join("flowbot.db"));

    // intent pulls into the order flow, which cascades into checkout and
    // asks for the missing product
    let event = Event::message("I want to order")
        .with_entity("intent", EntityObservation::text("order"));
    manager.accept(conversation(), event).await.unwrap();
    assert_eq!(
        channel.sent_texts(42).await,
        vec!["What would you like?", "Which product?"]
    );

    // the extractor turns "apples" into the product entity, which satisfies
    // the requirement in place
    manager
        .accept(conversation(), Event::message("two apples please"))
        .await
        .unwrap();
    assert_eq!(channel.sent_texts(42).await.last().unwrap(), "Order placed.");
}

#[tokio::test]
async fn test_greeting_handled_in_place_and_gibberish_falls_back() {
    let temp = TempDir::new().unwrap();
    let (manager, channel) = create_engine(&temp.path().join("flowbot.db"));

    manager
        .accept(conversation(), Event::message("hello!"))
        .await
        .unwrap();
    assert_eq!(channel.sent_texts(42).await, vec!["Hi there!"]);

    manager
        .accept(conversation(), Event::message("xyzzy"))
        .await
        .unwrap();
    assert_eq!(
        channel.sent_texts(42).await.last().unwrap(),
        "Sorry, I did not get that."
    );
}

#[tokio::test]
async fn test_context_survives_restart() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("flowbot.db");

    {
        let (manager, _channel) = create_engine(&db_path);
        let event = Event::message("order")
            .with_entity("intent", EntityObservation::text("order"));
        manager.accept(conversation(), event).await.unwrap();
        manager
            .accept(conversation(), Event::message("apples"))
            .await
            .unwrap();
    }

    // a fresh engine over the same database resumes mid-flow: the product
    // entity is still in context, so checkout is satisfied
    let snapshots = SqliteSnapshotStore::open(&db_path).unwrap();
    let snapshot = snapshots.load(42).unwrap().expect("snapshot persisted");
    assert_eq!(snapshot.state_name, "order.checkout");

    let context = flowbot::Context::from_blob(&snapshot.context_blob);
    assert!(context.contains("product"));
    assert_eq!(context.counter(), 2);

    let (manager, channel) = create_engine(&db_path);
    manager
        .accept(conversation(), Event::message("some apples"))
        .await
        .unwrap();
    assert_eq!(channel.sent_texts(42).await, vec!["Order placed."]);
}

#[tokio::test]
async fn test_events_are_serialized_per_conversation() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("flowbot.db");
    let (manager, channel) = create_engine(&db_path);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .accept(conversation(), Event::message("hello"))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // five messages, five replies, and a counter that saw every one
    assert_eq!(channel.sent_texts(42).await.len(), 5);
    let snapshots = SqliteSnapshotStore::open(&db_path).unwrap();
    let snapshot = snapshots.load(42).unwrap().unwrap();
    let context = flowbot::Context::from_blob(&snapshot.context_blob);
    assert_eq!(context.counter(), 5);
}
