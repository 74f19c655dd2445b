//! Write coalescing for bursty cache persistence
//!
//! Pending writes are held per record name, last write wins. A background
//! task flushes them once no new write has arrived for the idle delay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{RecordStore, lock};

enum Signal {
    Dirty,
    Flush(oneshot::Sender<()>),
}

pub struct CacheWriter {
    pending: Arc<Mutex<HashMap<String, String>>>,
    tx: mpsc::UnboundedSender<Signal>,
}

impl CacheWriter {
    /// Spawns the flush task; must be called inside a tokio runtime
    pub fn spawn(store: RecordStore, idle_delay: Duration) -> Self {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(run(store, pending.clone(), rx, idle_delay));

        Self { pending, tx }
    }

    pub fn schedule(&self, name: &str, contents: String) {
        lock(&self.pending).insert(name.to_string(), contents);
        let _ = self.tx.send(Signal::Dirty);
    }

    /// Drop any write for `name` that has not been flushed yet
    pub fn discard(&self, name: &str) {
        lock(&self.pending).remove(name);
    }

    /// Write out everything pending and wait for it to land
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Signal::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Final flush; the task exits once the writer is dropped
    pub async fn shutdown(self) {
        self.flush().await;
    }
}

async fn run(
    store: RecordStore,
    pending: Arc<Mutex<HashMap<String, String>>>,
    mut rx: mpsc::UnboundedReceiver<Signal>,
    idle_delay: Duration,
) {
    while let Some(signal) = rx.recv().await {
        let mut waiters = Vec::new();
        if let Signal::Flush(done) = signal {
            waiters.push(done);
        } else {
            // Debounce: keep extending while writes keep arriving
            loop {
                match tokio::time::timeout(idle_delay, rx.recv()).await {
                    Ok(Some(Signal::Dirty)) => continue,
                    Ok(Some(Signal::Flush(done))) => {
                        waiters.push(done);
                        break;
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }

        flush_pending(&store, &pending);
        for done in waiters {
            let _ = done.send(());
        }
    }

    flush_pending(&store, &pending);
}

fn flush_pending(store: &RecordStore, pending: &Mutex<HashMap<String, String>>) {
    let batch: Vec<(String, String)> = lock(pending).drain().collect();
    for (name, contents) in batch {
        match store.save_raw(&name, &contents) {
            Ok(outcome) => debug!(record = %name, ?outcome, "Flushed cache record"),
            Err(e) => warn!(record = %name, error = %e, "Failed to flush cache record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::records;

    #[tokio::test]
    async fn test_flush_writes_latest_value() {
        let store = RecordStore::in_memory();
        let writer = CacheWriter::spawn(store.clone(), Duration::from_secs(60));

        writer.schedule(records::METADATA_CACHE, "{\"a\":1}".to_string());
        writer.schedule(records::METADATA_CACHE, "{\"a\":2}".to_string());
        writer.flush().await;

        let saved: HashMap<String, u32> = store.load(records::METADATA_CACHE);
        assert_eq!(saved.get("a"), Some(&2));
    }

    #[tokio::test]
    async fn test_idle_delay_flushes_without_explicit_call() {
        let store = RecordStore::in_memory();
        let writer = CacheWriter::spawn(store.clone(), Duration::from_millis(20));

        writer.schedule(records::METADATA_CACHE, "{\"b\":1}".to_string());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let saved: HashMap<String, u32> = store.load(records::METADATA_CACHE);
        assert_eq!(saved.get("b"), Some(&1));
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_discard_drops_pending_write() {
        let store = RecordStore::in_memory();
        let writer = CacheWriter::spawn(store.clone(), Duration::from_secs(60));

        writer.schedule(records::METADATA_CACHE, "{\"c\":1}".to_string());
        writer.discard(records::METADATA_CACHE);
        writer.shutdown().await;

        let saved: HashMap<String, u32> = store.load(records::METADATA_CACHE);
        assert!(saved.is_empty());
    }
}
