//! The import run: fetch, dedup, map, upsert, record.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDateTime, Utc};
use feedsync_adapters::{
    parse_feed_date, plain_text_excerpt, CachePolicy, ContentStore, FeedFetchError, FeedReader,
    ImageMaterializer, RecordId, RecordPayload, SchemaDiscovery,
};
use feedsync_core::{
    round_duration_secs, Clock, FeedConfig, FeedItem, ImportRunRecord, ResolvedRecord, RunStatus,
    NATIVE_CONTENT, NATIVE_DATE, NATIVE_EXCERPT, NATIVE_TITLE, UNTITLED_PLACEHOLDER,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::logger::RunLogger;
use crate::mapper::{apply_mapping, PUB_DATE_FORMAT};
use crate::repository::FeedRepository;

pub const TAG_GUID: &str = "_rss_import_guid";
pub const TAG_FEED_ID: &str = "_rss_import_feed_id";
pub const TAG_LAST_UPDATED: &str = "_rss_import_last_updated";

pub const PREVIEW_ITEMS: usize = 5;
pub const PREVIEW_WORDS: usize = 30;

/// Reasons a run ends before fetching anything. None of them is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum RunRefusal {
    #[error("Feed not found.")]
    ConfigNotFound,
    #[error("Feed is disabled.")]
    FeedDisabled,
    #[error("Import already running for this feed.")]
    AlreadyRunning,
}

/// Why a run that was not refused still ended without importing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailure {
    /// The feed could not be fetched or parsed.
    Fetch,
    /// The stored feed configuration could not be read.
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    DedupKeyMissing,
    Upsert,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ItemError {
    pub kind: ItemErrorKind,
    pub message: String,
}

impl ItemError {
    fn new(kind: ItemErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn apply(what: &str, err: impl std::fmt::Display) -> Self {
        Self::new(ItemErrorKind::Apply, format!("Applying {what} failed: {err}"))
    }
}

/// Per-run counters built from typed item results.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunTally {
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub errors: u32,
    pub error_messages: Vec<String>,
}

impl RunTally {
    pub fn record(&mut self, result: Result<ItemOutcome, ItemError>) {
        match result {
            Ok(ItemOutcome::Created) => self.created += 1,
            Ok(ItemOutcome::Updated) => self.updated += 1,
            Err(err) => {
                self.errors += 1;
                self.error_messages.push(err.message);
            }
        }
    }

    pub fn imported(&self) -> u32 {
        self.created + self.updated
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::from_counts(self.created as usize, self.updated as usize, self.errors as usize)
    }

    pub fn message(&self) -> String {
        format!(
            "Import complete: {} created, {} updated, {} skipped, {} errors.",
            self.created, self.updated, self.skipped, self.errors
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub success: bool,
    pub status: RunStatus,
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub errors: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<RunRefusal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl RunResult {
    fn refused(refusal: RunRefusal) -> Self {
        Self {
            success: false,
            status: RunStatus::None,
            created: 0,
            updated: 0,
            skipped: 0,
            errors: 0,
            message: refusal.to_string(),
            refusal: Some(refusal),
            failure: None,
        }
    }

    fn failed(failure: RunFailure, message: String) -> Self {
        Self {
            success: false,
            status: RunStatus::Error,
            created: 0,
            updated: 0,
            skipped: 0,
            errors: 0,
            message,
            refusal: None,
            failure: Some(failure),
        }
    }

    fn completed(tally: &RunTally) -> Self {
        Self {
            success: true,
            status: tally.status(),
            created: tally.created,
            updated: tally.updated,
            skipped: tally.skipped,
            errors: tally.errors,
            message: tally.message(),
            refusal: None,
            failure: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewItem {
    pub title: String,
    pub link: String,
    pub pub_date: String,
    pub description: String,
    pub has_content: bool,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedPreview {
    pub feed_title: String,
    pub item_count: usize,
    pub sample_items: Vec<PreviewItem>,
}

/// Target capabilities looked up once per run.
struct RunContext {
    taxonomies: BTreeSet<String>,
    custom_fields_available: bool,
}

pub struct ImportPipeline {
    repo: Arc<FeedRepository>,
    logger: Arc<RunLogger>,
    reader: Arc<dyn FeedReader>,
    store: Arc<dyn ContentStore>,
    schema: Arc<dyn SchemaDiscovery>,
    images: Arc<dyn ImageMaterializer>,
    clock: Arc<dyn Clock>,
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ImportPipeline {
    pub fn new(
        repo: Arc<FeedRepository>,
        logger: Arc<RunLogger>,
        reader: Arc<dyn FeedReader>,
        store: Arc<dyn ContentStore>,
        schema: Arc<dyn SchemaDiscovery>,
        images: Arc<dyn ImageMaterializer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            logger,
            reader,
            store,
            schema,
            images,
            clock,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn run_lock(&self, feed_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        locks.entry(feed_id.to_string()).or_default().clone()
    }

    /// Drop the feed's lock entry once no run holds or awaits it.
    async fn release_run_lock(&self, feed_id: &str) {
        let mut locks = self.run_locks.lock().await;
        if locks.get(feed_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(feed_id);
        }
    }

    /// Feeds with a run lock entry. Empty whenever no run is in flight.
    pub async fn tracked_run_locks(&self) -> usize {
        self.run_locks.lock().await.len()
    }

    /// Import one feed. `force` runs disabled feeds and bypasses reader caches.
    /// Never fails; every outcome is described by the returned result.
    pub async fn run(&self, feed_id: &str, force: bool) -> RunResult {
        let span = info_span!("import_run", feed_id, force);
        let result = self.run_inner(feed_id, force).instrument(span).await;
        self.release_run_lock(feed_id).await;
        result
    }

    async fn run_inner(&self, feed_id: &str, force: bool) -> RunResult {
        let feed = match self.repo.get(feed_id).await {
            Ok(Some(feed)) => feed,
            Ok(None) => return RunResult::refused(RunRefusal::ConfigNotFound),
            Err(err) => {
                error!(error = %err, "loading feed configuration failed");
                return RunResult::failed(RunFailure::Config, err.to_string());
            }
        };
        if !force && !feed.enabled {
            return RunResult::refused(RunRefusal::FeedDisabled);
        }

        let lock = self.run_lock(feed_id).await;
        let Ok(_running) = lock.try_lock_owned() else {
            info!("run refused, another import holds the feed");
            return RunResult::refused(RunRefusal::AlreadyRunning);
        };

        let started = Instant::now();
        let cache = if force { CachePolicy::Bypass } else { CachePolicy::Use };
        let parsed = match self.reader.fetch(&feed.source_url, cache).await {
            Ok(parsed) => parsed,
            Err(err) => {
                let message = err.to_string();
                warn!(url = %feed.source_url, error = %message, "feed fetch failed");
                let tally = RunTally {
                    error_messages: vec![message.clone()],
                    ..Default::default()
                };
                self.record(&feed, RunStatus::Error, &tally, started).await;
                return RunResult::failed(RunFailure::Fetch, message);
            }
        };

        let ctx = self.run_context(&feed.target_collection).await;
        let mut tally = RunTally::default();
        for item in parsed.items(0, feed.max_items_per_run as usize) {
            let result = self.import_item(&feed, item, &ctx).await;
            if let Err(err) = &result {
                warn!(kind = ?err.kind, error = %err.message, "item failed");
            }
            tally.record(result);
        }

        let status = tally.status();
        self.record(&feed, status, &tally, started).await;
        info!(
            created = tally.created,
            updated = tally.updated,
            errors = tally.errors,
            status = %status,
            "import finished"
        );
        RunResult::completed(&tally)
    }

    async fn run_context(&self, collection: &str) -> RunContext {
        let taxonomies = match self.schema.taxonomies(collection).await {
            Ok(list) => list.into_iter().map(|t| t.key).collect(),
            Err(err) => {
                warn!(
                    collection,
                    error = %err,
                    "taxonomy discovery failed; taxonomy mappings skipped"
                );
                BTreeSet::new()
            }
        };
        RunContext {
            taxonomies,
            custom_fields_available: self.schema.custom_fields_available(),
        }
    }

    /// Persist last-run status and append one history entry. Failures are logged only.
    async fn record(
        &self,
        feed: &FeedConfig,
        status: RunStatus,
        tally: &RunTally,
        started: Instant,
    ) {
        if let Err(err) = self.repo.record_run_outcome(&feed.id, status, tally.imported()).await {
            error!(error = %err, "recording run outcome failed");
        }
        let entry = ImportRunRecord {
            feed_id: feed.id.clone(),
            feed_name: feed.name.clone(),
            timestamp: self.clock.now(),
            status,
            created_count: tally.created,
            updated_count: tally.updated,
            skipped_count: tally.skipped,
            error_count: tally.errors,
            error_messages: tally.error_messages.clone(),
            duration_seconds: round_duration_secs(started.elapsed()),
        };
        if let Err(err) = self.logger.append(entry).await {
            error!(error = %err, "appending run history failed");
        }
    }

    async fn import_item(
        &self,
        feed: &FeedConfig,
        item: &FeedItem,
        ctx: &RunContext,
    ) -> Result<ItemOutcome, ItemError> {
        let dedup_key = item
            .dedup_key()
            .ok_or_else(|| {
                ItemError::new(ItemErrorKind::DedupKeyMissing, "Item has no GUID or link.")
            })?
            .to_string();

        let existing = self
            .store
            .find_by_tag(&feed.target_collection, TAG_GUID, &dedup_key)
            .await
            .map_err(|e| ItemError::new(ItemErrorKind::Upsert, format!("Lookup failed: {e}")))?;

        let resolved = apply_mapping(item, &feed.field_mappings);
        let payload = build_payload(feed, item, &resolved);

        let (record_id, outcome) = match existing {
            Some(id) => {
                self.store
                    .update(id, &payload)
                    .await
                    .map_err(|e| {
                        ItemError::new(ItemErrorKind::Upsert, format!("Update failed: {e}"))
                    })?;
                (id, ItemOutcome::Updated)
            }
            None => {
                let id = self
                    .store
                    .insert(&feed.target_collection, &payload)
                    .await
                    .map_err(|e| {
                        ItemError::new(ItemErrorKind::Upsert, format!("Insert failed: {e}"))
                    })?;
                (id, ItemOutcome::Created)
            }
        };

        let stamped = self.clock.now().format(PUB_DATE_FORMAT).to_string();
        let tags = [
            (TAG_GUID, dedup_key.as_str()),
            (TAG_FEED_ID, feed.id.as_str()),
            (TAG_LAST_UPDATED, stamped.as_str()),
        ];
        for (key, value) in tags {
            self.store
                .set_tag(record_id, key, value)
                .await
                .map_err(|e| ItemError::apply("tracking tags", e))?;
        }

        if let Some(url) = &resolved.featured_image_url {
            self.attach_featured_image(record_id, feed, url).await;
        }
        self.apply_targets(record_id, &resolved, ctx).await?;

        debug!(record_id, dedup_key = %dedup_key, ?outcome, "item imported");
        Ok(outcome)
    }

    async fn attach_featured_image(&self, record_id: RecordId, feed: &FeedConfig, url: &str) {
        match self.try_attach_featured_image(record_id, feed, url).await {
            Ok(true) => debug!(record_id, url, "featured image attached"),
            Ok(false) => debug!(record_id, url, "featured image unchanged"),
            Err(err) => warn!(record_id, url, error = %err, "featured image skipped"),
        }
    }

    async fn try_attach_featured_image(
        &self,
        record_id: RecordId,
        feed: &FeedConfig,
        url: &str,
    ) -> anyhow::Result<bool> {
        if let Some(current) = self.store.primary_image(record_id).await? {
            if self.store.asset_source_url(current).await?.as_deref() == Some(url) {
                return Ok(false);
            }
        }
        let asset = self.images.materialize(url, &feed.id).await?;
        let asset_id = self.store.register_asset(url, &asset).await?;
        self.store.attach_primary_image(record_id, asset_id).await?;
        Ok(true)
    }

    async fn apply_targets(
        &self,
        record_id: RecordId,
        resolved: &ResolvedRecord,
        ctx: &RunContext,
    ) -> Result<(), ItemError> {
        if ctx.custom_fields_available {
            for (key, value) in &resolved.custom_values {
                self.store
                    .set_custom_field(record_id, key, value)
                    .await
                    .map_err(|e| ItemError::apply(&format!("custom field {key}"), e))?;
            }
        } else if !resolved.custom_values.is_empty() {
            debug!(record_id, "custom fields unavailable; values dropped");
        }

        for (taxonomy, names) in &resolved.taxonomy_terms {
            if !ctx.taxonomies.contains(taxonomy) {
                debug!(record_id, taxonomy = %taxonomy, "taxonomy not supported by collection");
                continue;
            }
            let mut term_ids = Vec::new();
            for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
                let id = self
                    .store
                    .ensure_taxonomy_term(taxonomy, name)
                    .await
                    .map_err(|e| ItemError::apply(&format!("taxonomy {taxonomy}"), e))?;
                if !term_ids.contains(&id) {
                    term_ids.push(id);
                }
            }
            if !term_ids.is_empty() {
                self.store
                    .assign_terms(record_id, taxonomy, &term_ids)
                    .await
                    .map_err(|e| ItemError::apply(&format!("taxonomy {taxonomy}"), e))?;
            }
        }

        for (key, value) in &resolved.meta_values {
            self.store
                .set_meta(record_id, key, value)
                .await
                .map_err(|e| ItemError::apply(&format!("meta {key}"), e))?;
        }
        Ok(())
    }

    /// First items of a feed for operator inspection. Always fetches fresh.
    pub async fn preview(&self, url: &str) -> Result<FeedPreview, FeedFetchError> {
        let parsed = self.reader.fetch(url, CachePolicy::Bypass).await?;
        let sample_items = parsed
            .items(0, PREVIEW_ITEMS)
            .iter()
            .map(|item| PreviewItem {
                title: item.title.clone().unwrap_or_default(),
                link: item.link.clone().unwrap_or_default(),
                pub_date: item
                    .pub_date
                    .map(|d| d.format(PUB_DATE_FORMAT).to_string())
                    .unwrap_or_default(),
                description: plain_text_excerpt(
                    item.description.as_deref().unwrap_or_default(),
                    PREVIEW_WORDS,
                ),
                has_content: item.content.as_deref().is_some_and(|c| !c.trim().is_empty()),
                categories: item.categories.clone(),
            })
            .collect();

        Ok(FeedPreview {
            feed_title: parsed.title.clone(),
            item_count: parsed.item_count(),
            sample_items,
        })
    }
}

/// Native fields for the upsert. The title is never empty.
fn build_payload(feed: &FeedConfig, item: &FeedItem, resolved: &ResolvedRecord) -> RecordPayload {
    let native = |key: &str| {
        resolved
            .native_values
            .get(key)
            .map(|v| v.to_text())
            .filter(|v| !v.trim().is_empty())
    };

    let title = native(NATIVE_TITLE)
        .or_else(|| item.title.clone().filter(|t| !t.trim().is_empty()))
        .unwrap_or_else(|| UNTITLED_PLACEHOLDER.to_string());

    let published_at = native(NATIVE_DATE).and_then(|raw| {
        let parsed = parse_post_date(&raw);
        if parsed.is_none() {
            debug!(value = %raw, "dropping unparsable post date");
        }
        parsed
    });

    RecordPayload {
        title,
        content: native(NATIVE_CONTENT),
        excerpt: native(NATIVE_EXCERPT),
        published_at,
        visibility: feed.target_visibility,
        owner: feed.owner.clone(),
    }
}

/// `YYYY-MM-DD HH:MM:SS` (UTC) or any feed date format.
fn parse_post_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, PUB_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| parse_feed_date(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedsync_core::{FieldValue, Visibility};

    fn feed() -> FeedConfig {
        let now = Utc::now();
        FeedConfig {
            id: "feed_test".into(),
            name: "Test".into(),
            source_url: "https://a.example/rss".into(),
            target_collection: "post".into(),
            target_visibility: Visibility::Published,
            owner: "7".into(),
            interval: Default::default(),
            max_items_per_run: 20,
            enabled: true,
            field_mappings: vec![],
            created_at: now,
            updated_at: now,
            last_run_at: None,
            last_run_status: RunStatus::None,
            last_run_count: 0,
        }
    }

    #[test]
    fn tally_status_and_message() {
        let mut tally = RunTally::default();
        for _ in 0..3 {
            tally.record(Ok(ItemOutcome::Created));
        }
        tally.record(Ok(ItemOutcome::Updated));
        tally.record(Err(ItemError::new(ItemErrorKind::Upsert, "Insert failed: boom")));

        assert_eq!(tally.status(), RunStatus::Partial);
        assert_eq!(tally.imported(), 4);
        assert_eq!(tally.message(), "Import complete: 3 created, 1 updated, 0 skipped, 1 errors.");
        assert_eq!(tally.error_messages, vec!["Insert failed: boom".to_string()]);
    }

    #[test]
    fn payload_title_falls_back_to_item_then_placeholder() {
        let feed = feed();
        let mut item = FeedItem {
            title: Some("Item title".into()),
            ..Default::default()
        };
        let mut resolved = ResolvedRecord::default();
        assert_eq!(build_payload(&feed, &item, &resolved).title, "Item title");

        resolved
            .native_values
            .insert(NATIVE_TITLE.into(), FieldValue::Text("Mapped".into()));
        assert_eq!(build_payload(&feed, &item, &resolved).title, "Mapped");

        resolved.native_values.clear();
        item.title = Some("  ".into());
        let payload = build_payload(&feed, &item, &resolved);
        assert_eq!(payload.title, UNTITLED_PLACEHOLDER);
        assert_eq!(payload.visibility, Visibility::Published);
        assert_eq!(payload.owner, "7");
    }

    #[test]
    fn unparsable_post_dates_are_dropped() {
        let feed = feed();
        let item = FeedItem::default();
        let mut resolved = ResolvedRecord::default();
        resolved
            .native_values
            .insert(NATIVE_DATE.into(), FieldValue::Text("2026-03-02 09:30:00".into()));
        let payload = build_payload(&feed, &item, &resolved);
        assert_eq!(
            payload.published_at.map(|d| d.to_rfc3339()),
            Some("2026-03-02T09:30:00+00:00".to_string())
        );

        resolved
            .native_values
            .insert(NATIVE_DATE.into(), FieldValue::Text("last tuesday".into()));
        assert_eq!(build_payload(&feed, &item, &resolved).published_at, None);
    }

    #[test]
    fn refusals_carry_operator_messages() {
        let refused = RunResult::refused(RunRefusal::AlreadyRunning);
        assert!(!refused.success);
        assert_eq!(refused.failure, None);
        assert_eq!(refused.message, "Import already running for this feed.");
        assert_eq!(RunRefusal::ConfigNotFound.to_string(), "Feed not found.");
        assert_eq!(RunRefusal::FeedDisabled.to_string(), "Feed is disabled.");
    }
}
