//! Columnar store port. The real columnar store (one table per event type,
//! partitioned by month on event time) is a named external collaborator;
//! the ingester only ever talks to this trait, never a concrete database
//! client.

use aegis_core::{Event, EventType};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("insert failed for type {event_type:?}: {reason}")]
    InsertFailed { event_type: EventType, reason: String },
}

#[async_trait]
pub trait ColumnarSink: Send + Sync {
    /// Insert one homogeneous batch (all events share `event_type`) as a
    /// single multi-row insert.
    async fn insert_batch(&self, event_type: EventType, events: &[Event]) -> Result<(), StoreError>;
}

/// In-process default: appends to per-type in-memory vectors. Stands in
/// for the real columnar store the same way `TomlStore` stands in for the
/// relational one — adequate for tests and for running the daemon without
/// an external warehouse wired up.
#[derive(Default)]
pub struct InMemoryColumnarSink {
    rows: tokio::sync::Mutex<std::collections::HashMap<EventType, Vec<Event>>>,
}

impl InMemoryColumnarSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row_count(&self, event_type: EventType) -> usize {
        self.rows
            .lock()
            .await
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ColumnarSink for InMemoryColumnarSink {
    async fn insert_batch(&self, event_type: EventType, events: &[Event]) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        rows.entry(event_type).or_default().extend_from_slice(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::{ChatMessagePayload, PlayerRef, ServerId};

    #[tokio::test]
    async fn insert_batch_accumulates_rows_per_type() {
        let sink = InMemoryColumnarSink::new();
        let event = Event::new(
            ServerId::new(),
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
        );
        sink.insert_batch(EventType::ChatMessage, &[event.clone(), event])
            .await
            .unwrap();
        assert_eq!(sink.row_count(EventType::ChatMessage).await, 2);
    }
}
