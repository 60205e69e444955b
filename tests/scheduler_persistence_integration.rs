//! Integration tests for durable scheduling and the event log.
//!
//! Covers:
//! 1. Scheduled events fire through normal dispatch once due
//! 2. A due event rejected at admission keeps its checkpoint and retries
//! 3. Cancellation before the due time prevents firing
//! 4. Schedules survive a bus restart through the SQLite checkpoint
//! 5. Dispatched events land in the SQLite event log

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use relaybus::adapters::sqlite::{create_pool, SqliteEventLog, SqliteScheduledStore};
use relaybus::services::InMemoryScheduledStore;
use relaybus::{
    BackpressurePolicy, BusConfig, BusResult, Command, CommandHandler, CommandId, CommandResult,
    Event, EventHandler, EventLog, MessageBus, ScheduledStore,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReminderDue {
    text: String,
}

impl Event for ReminderDue {}

struct ReminderCounter {
    count: Arc<AtomicU32>,
}

#[async_trait]
impl EventHandler<ReminderDue> for ReminderCounter {
    async fn handle(&self, _event: &ReminderDue) -> BusResult<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn fast_tick_config() -> BusConfig {
    BusConfig { scheduler_tick_ms: 20, batch_window_ms: 5, ..BusConfig::default() }
}

async fn wait_for_count(count: &Arc<AtomicU32>, expected: u32, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;
    while count.load(Ordering::SeqCst) < expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn scheduled_event_fires_once_due() {
    let bus = MessageBus::new(fast_tick_config());
    bus.start().await.unwrap();
    let count = Arc::new(AtomicU32::new(0));
    bus.register_event_handler::<ReminderDue, _>(ReminderCounter {
        count: Arc::clone(&count),
    })
    .await;

    bus.schedule_in(ReminderDue { text: "stand up".to_string() }, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(bus.pending_schedules().await, 1);

    wait_for_count(&count, 1, Duration::from_secs(2)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(bus.pending_schedules().await, 0);
    bus.stop().await;
}

#[derive(Debug)]
struct Block;

impl Command for Block {}

/// Holds the single dispatch worker until released.
struct BlockingHandler {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl CommandHandler<Block> for BlockingHandler {
    async fn handle(&self, _command: &Block) -> CommandResult {
        self.started.notify_one();
        self.release.notified().await;
        CommandResult::ok(CommandId::new())
    }
}

#[tokio::test]
async fn due_event_keeps_its_checkpoint_until_admission_succeeds() {
    let config = BusConfig {
        scheduler_tick_ms: 20,
        batch_size: 1,
        batch_window_ms: 5,
        queue_capacity: 1,
        backpressure: BackpressurePolicy::RejectNew,
        ..BusConfig::default()
    };
    let store: Arc<dyn ScheduledStore> = Arc::new(InMemoryScheduledStore::new());
    let bus = MessageBus::new(config).with_scheduled_store(store.clone());
    bus.start().await.unwrap();
    let count = Arc::new(AtomicU32::new(0));
    bus.register_event_handler::<ReminderDue, _>(ReminderCounter {
        count: Arc::clone(&count),
    })
    .await;
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    bus.register_command_handler::<Block, _>(BlockingHandler {
        started: Arc::clone(&started),
        release: Arc::clone(&release),
    })
    .await;

    let blocker = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.execute(Block).await })
    };
    started.notified().await;
    // Fill the single queue slot behind the held worker.
    bus.publish(ReminderDue { text: "filler".to_string() }).await.unwrap();

    bus.schedule_in(ReminderDue { text: "due now".to_string() }, Duration::from_millis(1))
        .await
        .unwrap();

    // Several ticks pass with admission rejected; the schedule and its
    // checkpoint row both survive.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.load_all().await.unwrap().len(), 1);
    assert_eq!(count.load(Ordering::SeqCst), 0);

    release.notify_one();
    blocker.await.unwrap().unwrap();

    // Both the filler and the retried scheduled event get through.
    wait_for_count(&count, 2, Duration::from_secs(3)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert!(store.load_all().await.unwrap().is_empty());
    assert_eq!(bus.pending_schedules().await, 0);
    bus.stop().await;
}

#[tokio::test]
async fn cancelled_schedule_never_fires() {
    let bus = MessageBus::new(fast_tick_config());
    bus.start().await.unwrap();
    let count = Arc::new(AtomicU32::new(0));
    bus.register_event_handler::<ReminderDue, _>(ReminderCounter {
        count: Arc::clone(&count),
    })
    .await;

    let id = bus
        .schedule_in(ReminderDue { text: "never".to_string() }, Duration::from_millis(100))
        .await
        .unwrap();
    bus.cancel_schedule(id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
    bus.stop().await;
}

#[tokio::test]
async fn schedule_survives_restart_through_sqlite_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("bus.db").display());
    let pool = create_pool(&url, None).await.unwrap();

    // First process: schedule and shut down before the due time.
    {
        let store: Arc<dyn ScheduledStore> =
            Arc::new(SqliteScheduledStore::new(pool.clone()));
        let bus = MessageBus::new(fast_tick_config()).with_scheduled_store(store.clone());
        bus.start().await.unwrap();
        bus.schedule_in(
            ReminderDue { text: "survive me".to_string() },
            Duration::from_millis(300),
        )
        .await
        .unwrap();
        bus.stop().await;

        let rows = store.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "ReminderDue");
    }

    // Second process: restore from the checkpoint and let it fire.
    let store: Arc<dyn ScheduledStore> = Arc::new(SqliteScheduledStore::new(pool));
    let bus = MessageBus::new(fast_tick_config()).with_scheduled_store(store.clone());
    bus.register_scheduled_type::<ReminderDue>().await;
    let count = Arc::new(AtomicU32::new(0));
    bus.register_event_handler::<ReminderDue, _>(ReminderCounter {
        count: Arc::clone(&count),
    })
    .await;
    bus.start().await.unwrap();
    assert_eq!(bus.pending_schedules().await, 1);

    wait_for_count(&count, 1, Duration::from_secs(3)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    // The checkpoint row is deleted once the event is handed off.
    assert!(store.load_all().await.unwrap().is_empty());
    bus.stop().await;
}

#[tokio::test]
async fn cancel_deletes_the_checkpoint_row() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("bus.db").display());
    let pool = create_pool(&url, None).await.unwrap();
    let store: Arc<dyn ScheduledStore> = Arc::new(SqliteScheduledStore::new(pool));

    let bus = MessageBus::new(fast_tick_config()).with_scheduled_store(store.clone());
    bus.start().await.unwrap();
    let id = bus
        .schedule_in(ReminderDue { text: "x".to_string() }, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(store.load_all().await.unwrap().len(), 1);

    bus.cancel_schedule(id).await.unwrap();
    assert!(store.load_all().await.unwrap().is_empty());
    bus.stop().await;
}

#[tokio::test]
async fn dispatched_events_land_in_the_sqlite_log() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("bus.db").display());
    let pool = create_pool(&url, None).await.unwrap();
    let log: Arc<dyn EventLog> = Arc::new(SqliteEventLog::new(pool));

    let bus = MessageBus::new(BusConfig::default()).with_event_log(log.clone());
    bus.start().await.unwrap();

    bus.publish_and_wait(ReminderDue { text: "logged".to_string() }).await.unwrap();
    bus.publish_and_wait(ReminderDue { text: "also logged".to_string() }).await.unwrap();

    let recent = log.recent(10).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent.iter().all(|e| e.event_type == "ReminderDue"));
    bus.stop().await;
}
