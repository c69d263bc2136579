use std::collections::BTreeMap;
use std::sync::Arc;

use feedsync_core::{
    clamp_max_items, new_feed_id, sanitize_key, sanitize_text, Clock, FeedConfig, FeedDraft,
    RunStatus,
};
use feedsync_storage::{load_document, store_document, DocumentStore, StorageError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

pub const FEEDS_DOCUMENT: &str = "feeds";
pub const DEFAULT_COLLECTION: &str = "post";
pub const DEFAULT_OWNER: &str = "1";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("feed {0} not found")]
    NotFound(String),
    #[error("invalid feed url {0:?}: must be an http or https url")]
    InvalidUrl(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

type FeedsDocument = BTreeMap<String, FeedConfig>;

/// Feed configurations held in a single `feeds` document keyed by id.
pub struct FeedRepository {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    default_owner: String,
    write_lock: Mutex<()>,
}

impl FeedRepository {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            default_owner: DEFAULT_OWNER.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_default_owner(mut self, owner: impl Into<String>) -> Self {
        self.default_owner = owner.into();
        self
    }

    async fn load(&self) -> Result<FeedsDocument, RepositoryError> {
        Ok(load_document(self.store.as_ref(), FEEDS_DOCUMENT).await?)
    }

    async fn persist(&self, feeds: &FeedsDocument) -> Result<(), RepositoryError> {
        Ok(store_document(self.store.as_ref(), FEEDS_DOCUMENT, feeds).await?)
    }

    /// All feeds, oldest first.
    pub async fn list(&self) -> Result<Vec<FeedConfig>, RepositoryError> {
        let mut feeds = self.load().await?.into_values().collect::<Vec<_>>();
        feeds.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(feeds)
    }

    pub async fn enabled(&self) -> Result<Vec<FeedConfig>, RepositoryError> {
        Ok(self.list().await?.into_iter().filter(|f| f.enabled).collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<FeedConfig>, RepositoryError> {
        Ok(self.load().await?.remove(id))
    }

    /// Create or replace a feed. Creation happens when the draft carries no id
    /// or an id not stored yet; run bookkeeping and `created_at` survive updates.
    pub async fn save(&self, draft: FeedDraft) -> Result<FeedConfig, RepositoryError> {
        let source_url = sanitize_text(&draft.source_url);
        let host = match Url::parse(&source_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                url.host_str().unwrap_or_default().to_string()
            }
            _ => return Err(RepositoryError::InvalidUrl(source_url)),
        };

        let _guard = self.write_lock.lock().await;
        let mut feeds = self.load().await?;
        let now = self.clock.now();

        // Explicit ids are stored as given, whitespace aside.
        let id = draft
            .id
            .as_deref()
            .map(sanitize_text)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_feed_id);
        let previous = feeds.get(&id);

        let name = match sanitize_text(&draft.name) {
            name if name.is_empty() => host,
            name => name,
        };
        let target_collection = draft
            .target_collection
            .as_deref()
            .map(sanitize_key)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_COLLECTION.to_string());
        let owner = draft
            .owner
            .as_deref()
            .map(sanitize_text)
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| self.default_owner.clone());
        let field_mappings = draft
            .field_mappings
            .iter()
            .filter_map(|row| row.to_rule())
            .collect::<Vec<_>>();

        let feed = FeedConfig {
            id: id.clone(),
            name,
            source_url,
            target_collection,
            target_visibility: draft.target_visibility.unwrap_or_default(),
            owner,
            interval: draft.interval.unwrap_or_default(),
            max_items_per_run: clamp_max_items(draft.max_items_per_run),
            enabled: draft.enabled,
            field_mappings,
            created_at: previous.map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
            last_run_at: previous.and_then(|p| p.last_run_at),
            last_run_status: previous.map(|p| p.last_run_status).unwrap_or_default(),
            last_run_count: previous.map(|p| p.last_run_count).unwrap_or_default(),
        };
        debug!(feed_id = %feed.id, created = previous.is_none(), "saving feed");

        feeds.insert(id, feed.clone());
        self.persist(&feeds).await?;
        Ok(feed)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut feeds = self.load().await?;
        if feeds.remove(id).is_none() {
            return Ok(false);
        }
        self.persist(&feeds).await?;
        Ok(true)
    }

    /// Stamp the outcome of a finished run. Unknown ids are ignored.
    pub async fn record_run_outcome(
        &self,
        id: &str,
        status: RunStatus,
        count: u32,
    ) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut feeds = self.load().await?;
        let Some(feed) = feeds.get_mut(id) else {
            return Ok(());
        };
        feed.last_run_at = Some(self.clock.now());
        feed.last_run_status = status;
        feed.last_run_count = count;
        self.persist(&feeds).await
    }

    pub async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<FeedConfig, RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut feeds = self.load().await?;
        let feed = feeds
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        feed.enabled = enabled;
        feed.updated_at = self.clock.now();
        let updated = feed.clone();
        self.persist(&feeds).await?;
        Ok(updated)
    }
}
