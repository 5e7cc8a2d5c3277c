//! Subscribes to every event on the bus and batches it into the columnar
//! store, grouped by type. Grounded on the state-updater background task
//! pattern: a bus subscription drained by a loop, with a `tokio::time`
//! interval driving periodic flush work alongside size-triggered flush.

use std::collections::HashMap;
use std::time::Duration;

use aegis_core::{Event, EventFilter, EventType};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::store::ColumnarSink;

pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct IngesterConfig {
    pub subscription_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Handle to the running ingester. Dropping it aborts the worker without
/// flushing — call [`Ingester::shutdown`] for a clean drain-and-flush stop.
pub struct Ingester {
    handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Ingester {
    pub fn start(bus: EventBus, sink: std::sync::Arc<dyn ColumnarSink>, config: IngesterConfig) -> Self {
        let subscription_capacity = config.subscription_capacity;
        let batch_size = config.batch_size;
        let flush_interval = config.flush_interval;
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut subscription = bus.subscribe(EventFilter::all(), None, subscription_capacity).await;
            let groups: Mutex<HashMap<EventType, Vec<Event>>> = Mutex::new(HashMap::new());
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut shutdown_rx = shutdown_rx;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => {
                        drain_and_flush(&mut subscription, &groups, sink.as_ref()).await;
                        return;
                    }
                    _ = ticker.tick() => {
                        flush_all(&groups, sink.as_ref()).await;
                    }
                    maybe_event = subscription.recv() => {
                        match maybe_event {
                            Some(event) => {
                                let event_type = event.event_type();
                                let mut guard = groups.lock().await;
                                let group = guard.entry(event_type).or_default();
                                group.push(event);
                                if group.len() >= batch_size {
                                    let batch = std::mem::take(group);
                                    drop(guard);
                                    flush_group(sink.as_ref(), event_type, batch).await;
                                }
                            }
                            None => {
                                flush_all(&groups, sink.as_ref()).await;
                                return;
                            }
                        }
                    }
                }
            }
        });

        Self {
            handle: Some(handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Drain whatever is already queued on the subscription, flush every
    /// remaining type group, then stop.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn drain_and_flush(
    subscription: &mut crate::bus::BusSubscription,
    groups: &Mutex<HashMap<EventType, Vec<Event>>>,
    sink: &dyn ColumnarSink,
) {
    while let Ok(event) = subscription.try_recv() {
        let event_type = event.event_type();
        groups.lock().await.entry(event_type).or_default().push(event);
    }
    flush_all(groups, sink).await;
}

async fn flush_all(groups: &Mutex<HashMap<EventType, Vec<Event>>>, sink: &dyn ColumnarSink) {
    let drained: Vec<(EventType, Vec<Event>)> = {
        let mut guard = groups.lock().await;
        guard.drain().filter(|(_, v)| !v.is_empty()).collect()
    };
    for (event_type, batch) in drained {
        flush_group(sink, event_type, batch).await;
    }
}

async fn flush_group(sink: &dyn ColumnarSink, event_type: EventType, batch: Vec<Event>) {
    let count = batch.len();
    if let Err(e) = sink.insert_batch(event_type, &batch).await {
        tracing::warn!("ingester: insert failed for {event_type:?} ({count} events): {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryColumnarSink;
    use aegis_core::{ChatMessagePayload, PlayerRef, ServerId};

    fn chat_event(server_id: ServerId) -> Event {
        Event::new(
            server_id,
            ChatMessagePayload {
                chat_type: "ChatAll".into(),
                player: PlayerRef {
                    engine_id: "e".into(),
                    platform_id: "p".into(),
                    name: None,
                    team_id: None,
                },
                message: "hi".into(),
            },
        )
    }

    #[tokio::test]
    async fn flushes_on_batch_size() {
        let bus = EventBus::new(10_000);
        let sink = std::sync::Arc::new(InMemoryColumnarSink::new());
        let ingester = Ingester::start(
            bus.clone(),
            sink.clone(),
            IngesterConfig {
                batch_size: 10,
                flush_interval: Duration::from_secs(3600),
                ..IngesterConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let server_id = ServerId::new();
        for _ in 0..25 {
            bus.publish_event(chat_event(server_id));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(sink.row_count(EventType::ChatMessage).await, 20);
        ingester.shutdown().await;
        assert_eq!(sink.row_count(EventType::ChatMessage).await, 25);
    }

    #[tokio::test]
    async fn flushes_on_timer() {
        let bus = EventBus::new(10_000);
        let sink = std::sync::Arc::new(InMemoryColumnarSink::new());
        let ingester = Ingester::start(
            bus.clone(),
            sink.clone(),
            IngesterConfig {
                batch_size: 1000,
                flush_interval: Duration::from_millis(50),
                ..IngesterConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let server_id = ServerId::new();
        bus.publish_event(chat_event(server_id));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(sink.row_count(EventType::ChatMessage).await, 1);
        ingester.shutdown().await;
    }
}
