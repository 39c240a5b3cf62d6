//! Flowbot - Entry Point
//!
//! Console demo: type messages on stdin and watch the dialog engine resolve
//! them. Flows come from FLOWBOT_FLOWS (comma-separated TOML files) or fall
//! back to a small built-in graph.

use std::sync::Arc;

use flowbot::{
    ActionOutcome, ActionRegistry, ChannelRegistry, ChatManager, Config, ConversationRef,
    EntityObservation, Event, ExtractorPipeline, FlowGraph, KeywordExtractor, MemoryChannel,
    Resolver, ScheduleStore, Scheduler, SnapshotStore, SqliteSnapshotStore, TelemetryService,
    TracingLogger,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEMO_FLOWS: &str = r#"
    [default]
    unsupported = { text = "Sorry, I did not get that." }

    [[default.states]]
    name = "root"
    action = { text = "Hi! Try ordering something, or ask for a reminder." }
    supports = ["greeting"]

    [order]
    intent = "order|buy"
    accepts = ["product"]

    [[order.states]]
    name = "root"
    action = { text = "What would you like to order?", next = "checkout:" }

    [[order.states]]
    name = "checkout"
    action = { text = "Great, your order is on its way." }
    require = [{ entity = "product", action = { text = "Which product?" } }]
    supports = ["product"]

    [reminder]
    intent = "remind.*"

    [[reminder.states]]
    name = "root"
    action = "remind_soon"
"#;

fn demo_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register("remind_soon", |dialog| {
        let mut payload = flowbot::SchedulePayload::new();
        payload.insert(
            "_state".to_string(),
            vec![EntityObservation::text("default.root:")],
        );
        dialog.schedule_in(payload, 10)?;
        dialog.send_text("Ok, I will ping you in 10 seconds.");
        Ok(ActionOutcome::Stay)
    });
    registry
}

fn demo_pipeline() -> anyhow::Result<ExtractorPipeline> {
    let greetings = KeywordExtractor::new(
        "greeting",
        &[("hello", &["hi", "hello", "hey"]), ("bye", &["bye", "goodbye"])],
    )?;
    let products = KeywordExtractor::new(
        "product",
        &[
            ("apples", &["apple", "apples"]),
            ("coffee", &["coffee", "espresso"]),
        ],
    )?;
    Ok(ExtractorPipeline::new()
        .with(Arc::new(greetings))
        .with(Arc::new(products)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Flowbot dialog engine v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: flowbot");
        println!();
        println!("Console demo: messages are read from stdin, one per line.");
        println!();
        println!("Environment variables:");
        println!("  FLOWBOT_DB_PATH         SQLite database path");
        println!("  FLOWBOT_FLOWS           Comma-separated flow TOML files");
        println!("  FLOWBOT_ERROR_MESSAGE   Reply sent when an action fails");
        println!("  FLOWBOT_HEARTBEAT_SECS  Scheduler heartbeat interval");
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Flowbot dialog engine v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let registry = demo_registry();
    let graph = if config.flow_paths.is_empty() {
        info!("FLOWBOT_FLOWS not set, using the built-in demo flows");
        FlowGraph::from_toml_str(DEMO_FLOWS, &registry)?
    } else {
        FlowGraph::from_toml_files(&config.flow_paths, &registry)?
    };

    let snapshots: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::open(&config.db_path)?);
    let schedule_store = Arc::new(ScheduleStore::open(&config.db_path)?);
    let scheduler = Arc::new(Scheduler::new(schedule_store, snapshots.clone()));

    let channel = Arc::new(MemoryChannel::new());
    let mut channels = ChannelRegistry::new();
    channels.register(channel.clone());

    let resolver = Resolver::new(Arc::new(graph), &config)
        .with_telemetry(TelemetryService::new().with_sink(Arc::new(TracingLogger)));
    let manager = Arc::new(ChatManager::new(
        resolver,
        snapshots,
        channels,
        scheduler,
        demo_pipeline()?,
    ));
    let _heartbeat = manager.start_heartbeat(config.heartbeat_interval);

    let conversation = ConversationRef::new(1, "memory");
    println!("you> ");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0;
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        manager
            .accept(conversation.clone(), Event::message(text))
            .await?;
        // every reply is flushed to the channel, scheduled pings included
        let sent = channel.sent_texts(1).await;
        for text in &sent[printed..] {
            println!("bot> {}", text);
        }
        printed = sent.len();
    }

    Ok(())
}
