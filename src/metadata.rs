//! Mutable key/value metadata scoped to a run.
//!
//! Mutations are applied in memory and wake a debounced flusher, so a burst
//! of writes produces a single flush. The executor forces a final flush
//! before it reports the attempt, which guarantees the last written value of
//! every key reaches the Run Engine.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::engine::{EngineError, MetadataMap, RunEngine};

/// Destination of metadata flushes.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn flush_metadata(&self, run_id: &str, record: &MetadataMap) -> Result<(), EngineError>;
}

#[async_trait]
impl<E: RunEngine> MetadataSink for E {
    async fn flush_metadata(&self, run_id: &str, record: &MetadataMap) -> Result<(), EngineError> {
        RunEngine::flush_metadata(self, run_id, record).await
    }
}

/// Flushes through a shared, type-erased Run Engine handle.
pub struct EngineSink(pub Arc<dyn RunEngine>);

#[async_trait]
impl MetadataSink for EngineSink {
    async fn flush_metadata(&self, run_id: &str, record: &MetadataMap) -> Result<(), EngineError> {
        self.0.flush_metadata(run_id, record).await
    }
}

struct MetadataInner {
    run_id: String,
    record: Mutex<MetadataMap>,
    version: AtomicU64,
    flushed: AtomicU64,
    sink: Arc<dyn MetadataSink>,
    dirty: Notify,
    flush_lock: tokio::sync::Mutex<()>,
}

/// Run metadata store.
#[derive(Clone)]
pub struct RunMetadataStore {
    inner: Arc<MetadataInner>,
}

impl RunMetadataStore {
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn MetadataSink>) -> Self {
        Self::restore(run_id, sink, MetadataMap::new())
    }

    /// Store seeded with a record from a checkpoint. The seed counts as flushed.
    pub fn restore(run_id: impl Into<String>, sink: Arc<dyn MetadataSink>, record: MetadataMap) -> Self {
        Self {
            inner: Arc::new(MetadataInner {
                run_id: run_id.into(),
                record: Mutex::new(record),
                version: AtomicU64::new(0),
                flushed: AtomicU64::new(0),
                sink,
                dirty: Notify::new(),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn record(&self) -> MutexGuard<'_, MetadataMap> {
        self.inner.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut MetadataMap) -> R) -> R {
        let result = {
            let mut record = self.record();
            let result = f(&mut record);
            self.inner.version.fetch_add(1, Ordering::SeqCst);
            result
        };
        self.inner.dirty.notify_one();
        result
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        self.mutate(|record| {
            record.insert(key.to_string(), value);
        });
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.record().get(key).cloned()
    }

    pub fn delete(&self, key: &str) -> Option<Value> {
        self.mutate(|record| record.remove(key))
    }

    /// Append to a list value. A missing key starts a new list; a scalar is
    /// promoted to a one-element list first.
    pub fn append(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        self.mutate(|record| {
            let entry = record.entry(key.to_string()).or_insert_with(|| Value::Array(Vec::new()));
            match entry {
                Value::Array(items) => items.push(value),
                other => {
                    let previous = other.take();
                    *other = Value::Array(vec![previous, value]);
                }
            }
        });
    }

    /// Add `delta` to a numeric value, treating a missing or non-numeric value as zero.
    pub fn increment(&self, key: &str, delta: f64) -> f64 {
        self.mutate(|record| {
            let current = record.get(key).and_then(Value::as_f64).unwrap_or(0.0);
            let next = current + delta;
            let value = if next.fract() == 0.0 && next.abs() < i64::MAX as f64 {
                Value::from(next as i64)
            } else {
                Value::from(next)
            };
            record.insert(key.to_string(), value);
            next
        })
    }

    pub fn current(&self) -> MetadataMap {
        self.record().clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.version.load(Ordering::SeqCst) != self.inner.flushed.load(Ordering::SeqCst)
    }

    /// Send the current record if it changed since the last successful flush.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let _guard = self.inner.flush_lock.lock().await;
        let (version, snapshot) = {
            let record = self.record();
            (self.inner.version.load(Ordering::SeqCst), record.clone())
        };
        if version == self.inner.flushed.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.sink.flush_metadata(&self.inner.run_id, &snapshot).await?;
        self.inner.flushed.fetch_max(version, Ordering::SeqCst);
        Ok(())
    }

    /// Spawn the debounced background flusher. Dropping the handle stops it.
    pub fn spawn_flusher(&self, debounce: Duration) -> MetadataFlusher {
        let store = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                store.inner.dirty.notified().await;
                tokio::time::sleep(debounce).await;
                if let Err(e) = store.flush().await {
                    tracing::warn!(run_id = %store.inner.run_id, error = %e, "Metadata flush failed");
                }
            }
        });
        MetadataFlusher { handle }
    }
}

/// Background flush loop of a [`RunMetadataStore`].
pub struct MetadataFlusher {
    handle: JoinHandle<()>,
}

impl Drop for MetadataFlusher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryRunEngine;

    fn store() -> (RunMetadataStore, Arc<InMemoryRunEngine>) {
        let engine = Arc::new(InMemoryRunEngine::new());
        (RunMetadataStore::new("run_1", engine.clone()), engine)
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (store, _) = store();
        store.set("progress", 0.5);
        assert_eq!(store.get("progress"), Some(serde_json::json!(0.5)));
        assert_eq!(store.delete("progress"), Some(serde_json::json!(0.5)));
        assert_eq!(store.get("progress"), None);
    }

    #[tokio::test]
    async fn test_append_and_increment() {
        let (store, _) = store();
        store.append("events", "a");
        store.append("events", "b");
        store.set("single", 1);
        store.append("single", 2);
        assert_eq!(store.increment("count", 2.0), 2.0);
        assert_eq!(store.increment("count", 3.0), 5.0);

        assert_eq!(store.get("events"), Some(serde_json::json!(["a", "b"])));
        assert_eq!(store.get("single"), Some(serde_json::json!([1, 2])));
        assert_eq!(store.get("count"), Some(serde_json::json!(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_mutations_coalesce_into_one_flush() {
        let (store, engine) = store();
        let _flusher = store.spawn_flusher(Duration::from_millis(100));
        tokio::task::yield_now().await;

        store.set("a", 1);
        store.set("b", 2);
        store.set("a", 3);
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(engine.metadata_flushes(), 1);
        let flushed = engine.metadata("run_1").unwrap();
        assert_eq!(flushed.get("a"), Some(&serde_json::json!(3)));
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn test_forced_flush_skips_clean_record() {
        let (store, engine) = store();
        store.flush().await.unwrap();
        assert_eq!(engine.metadata_flushes(), 0);

        store.set("k", "v");
        store.flush().await.unwrap();
        store.flush().await.unwrap();
        assert_eq!(engine.metadata_flushes(), 1);
    }
}
