//! Owns one [`LogSource`] per managed server, classifies each tailed line
//! through a shared [`LogParser`], and publishes the result to the bus with
//! the original line attached as `raw`. Same per-server map-and-forward
//! shape as [`crate::command::manager::CommandManager`].

use std::collections::HashMap;
use std::sync::Arc;

use aegis_core::{Event, RawPayload};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::log::parser::LogParser;
use crate::log::source::{LogSource, RemoteFetcher};
use crate::state::config::ServerEntry;

struct ManagedSource {
    source: LogSource,
    forward_handle: JoinHandle<()>,
}

impl Drop for ManagedSource {
    fn drop(&mut self) {
        self.source.stop();
        self.forward_handle.abort();
    }
}

pub struct LogManager {
    bus: EventBus,
    parser: Arc<LogParser>,
    fetcher: Option<Arc<dyn RemoteFetcher>>,
    sources: RwLock<HashMap<aegis_core::ServerId, ManagedSource>>,
}

impl LogManager {
    pub fn new(bus: EventBus, fetcher: Option<Arc<dyn RemoteFetcher>>) -> Self {
        Self {
            bus,
            parser: Arc::new(LogParser::new()),
            fetcher,
            sources: RwLock::new(HashMap::new()),
        }
    }

    pub async fn connect_all(&self, servers: &[ServerEntry]) {
        for entry in servers {
            self.add(entry).await;
        }
    }

    pub async fn add(&self, entry: &ServerEntry) {
        let (lines_tx, mut lines_rx) = tokio::sync::mpsc::unbounded_channel();
        let source = LogSource::start(entry.log_source.clone(), lines_tx, self.fetcher.clone());

        let bus = self.bus.clone();
        let parser = Arc::clone(&self.parser);
        let server_id = entry.id;
        let forward_handle = tokio::spawn(async move {
            while let Some(line) = lines_rx.recv().await {
                if let Some(payload) = parser.parse(&line) {
                    let event = Event::new(server_id, payload).raw(RawPayload::Text(line));
                    bus.publish_event(event);
                }
            }
        });

        self.sources.write().await.insert(entry.id, ManagedSource { source, forward_handle });
    }

    pub async fn remove(&self, server_id: aegis_core::ServerId) {
        self.sources.write().await.remove(&server_id);
    }

    pub async fn update(&self, entry: &ServerEntry) {
        self.remove(entry.id).await;
        self.add(entry).await;
    }

    pub async fn server_ids(&self) -> Vec<aegis_core::ServerId> {
        self.sources.read().await.keys().copied().collect()
    }
}
