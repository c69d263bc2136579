use std::sync::Arc;

use feedsync_core::{sanitize_text, ImportRunRecord};
use feedsync_storage::{load_document, store_document, DocumentStore, StorageError};
use tokio::sync::Mutex;

pub const LOG_DOCUMENT: &str = "import_logs";
pub const MAX_LOG_ENTRIES: usize = 200;
pub const DEFAULT_LOG_LIMIT: usize = 50;

/// Bounded run history, newest first.
pub struct RunLogger {
    store: Arc<dyn DocumentStore>,
    max_entries: usize,
    write_lock: Mutex<()>,
}

impl RunLogger {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            max_entries: MAX_LOG_ENTRIES,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<ImportRunRecord>, StorageError> {
        load_document(self.store.as_ref(), LOG_DOCUMENT).await
    }

    pub async fn append(&self, mut record: ImportRunRecord) -> Result<(), StorageError> {
        record.feed_name = sanitize_text(&record.feed_name);
        record.error_messages = record
            .error_messages
            .iter()
            .map(|m| sanitize_text(m))
            .collect();

        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(0, record);
        entries.truncate(self.max_entries);
        store_document(self.store.as_ref(), LOG_DOCUMENT, &entries).await
    }

    /// Newest entries first, optionally only those of one feed.
    pub async fn recent(
        &self,
        limit: usize,
        feed_id: Option<&str>,
    ) -> Result<Vec<ImportRunRecord>, StorageError> {
        let entries = self.load().await?;
        Ok(entries
            .into_iter()
            .filter(|e| feed_id.map_or(true, |id| e.feed_id == id))
            .take(limit)
            .collect())
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        store_document(self.store.as_ref(), LOG_DOCUMENT, &Vec::<ImportRunRecord>::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use feedsync_core::RunStatus;
    use feedsync_storage::MemoryDocumentStore;

    fn entry(feed_id: &str, n: u32) -> ImportRunRecord {
        ImportRunRecord {
            feed_id: feed_id.to_string(),
            feed_name: format!("Feed\n{n}"),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().expect("ts"),
            status: RunStatus::Success,
            created_count: n,
            updated_count: 0,
            skipped_count: 0,
            error_count: 0,
            error_messages: vec![],
            duration_seconds: 0.5,
        }
    }

    #[tokio::test]
    async fn keeps_at_most_200_newest_entries() {
        let logger = RunLogger::new(Arc::new(MemoryDocumentStore::new()));
        for n in 0..205 {
            logger.append(entry("feed_a", n)).await.expect("append");
        }
        let all = logger.recent(usize::MAX, None).await.expect("recent");
        assert_eq!(all.len(), MAX_LOG_ENTRIES);
        assert_eq!(all[0].created_count, 204);
        assert_eq!(all[199].created_count, 5);
        assert_eq!(all[0].feed_name, "Feed 204");
    }

    #[tokio::test]
    async fn filters_by_feed_and_clears() {
        let logger = RunLogger::new(Arc::new(MemoryDocumentStore::new()));
        logger.append(entry("feed_a", 1)).await.expect("append");
        logger.append(entry("feed_b", 2)).await.expect("append");
        logger.append(entry("feed_a", 3)).await.expect("append");

        let only_a = logger.recent(DEFAULT_LOG_LIMIT, Some("feed_a")).await.expect("recent");
        assert_eq!(
            only_a.iter().map(|e| e.created_count).collect::<Vec<_>>(),
            vec![3, 1]
        );
        assert_eq!(logger.recent(1, None).await.expect("recent").len(), 1);

        logger.clear().await.expect("clear");
        assert!(logger.recent(DEFAULT_LOG_LIMIT, None).await.expect("recent").is_empty());
    }
}
