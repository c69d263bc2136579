use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use feedsync_adapters::{
    parse_rss, CachePolicy, ContentStore, FeedFetchError, FeedReader, ImageError, ImageMaterializer,
    MemoryContentStore, StaticFeedReader, StoredAsset,
};
use feedsync_core::{
    Clock, FeedDraft, FeedItem, FixedClock, ImportInterval, MappingRuleInput, ParsedFeed, RunStatus,
};
use feedsync_storage::MemoryDocumentStore;
use feedsync_sync::pipeline::TAG_GUID;
use feedsync_sync::{
    hook_id, EngineParts, ManualTriggerScheduler, RunFailure, RunRefusal, SyncEngine,
    TriggerScheduler,
};
use tokio::sync::Notify;

const FEED_URL: &str = "https://news.example.com/rss";

#[derive(Default)]
struct CountingImages {
    calls: AtomicUsize,
    unreachable: bool,
}

impl CountingImages {
    fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ImageMaterializer for CountingImages {
    async fn materialize(&self, url: &str, _scope: &str) -> Result<StoredAsset, ImageError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(ImageError::InvalidUrl(url.to_string()));
        }
        Ok(StoredAsset {
            content_hash: format!("{n:064}"),
            relative_path: format!("images/{n}.jpg"),
            byte_size: url.len() as u64,
            mime_type: "image/jpeg".to_string(),
        })
    }
}

struct Harness {
    engine: SyncEngine,
    store: Arc<MemoryContentStore>,
    triggers: Arc<ManualTriggerScheduler>,
    images: Arc<CountingImages>,
    clock: Arc<FixedClock>,
}

fn harness_with_reader(reader: Arc<dyn FeedReader>) -> Harness {
    build_harness(reader, CountingImages::default())
}

fn build_harness(reader: Arc<dyn FeedReader>, images: CountingImages) -> Harness {
    let store = Arc::new(
        MemoryContentStore::new()
            .with_taxonomy("post", "category", "Categories")
            .with_custom_field("post", "source_link", "Source link"),
    );
    let images = Arc::new(images);
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).single().expect("ts"),
    ));
    let parts = EngineParts {
        documents: Arc::new(MemoryDocumentStore::new()),
        reader,
        store: store.clone(),
        schema: store.clone(),
        images: images.clone(),
        clock: clock.clone(),
        default_owner: "1".to_string(),
    };

    let mut manual = None;
    let engine = SyncEngine::new(parts, |handler| {
        let triggers = Arc::new(ManualTriggerScheduler::new(handler));
        manual = Some(triggers.clone());
        triggers as Arc<dyn TriggerScheduler>
    });

    Harness {
        engine,
        store,
        triggers: manual.expect("trigger backend built"),
        images,
        clock,
    }
}

fn harness(reader: Arc<StaticFeedReader>) -> Harness {
    harness_with_reader(reader)
}

fn mapping(source: &str, target_kind: &str, target_key: &str) -> MappingRuleInput {
    MappingRuleInput {
        source: source.to_string(),
        target_kind: target_kind.to_string(),
        target_key: target_key.to_string(),
    }
}

fn draft(id: &str, enabled: bool) -> FeedDraft {
    FeedDraft {
        id: Some(id.to_string()),
        name: format!("Feed {id}"),
        source_url: FEED_URL.to_string(),
        interval: Some(ImportInterval::Hourly),
        enabled,
        field_mappings: vec![
            mapping("title", "native_field", "post_title"),
            mapping("content", "native_field", "post_content"),
            mapping("categories", "taxonomy_term_set", "category"),
            mapping("media_content_url", "native_field", "featured_image"),
            mapping("link", "custom_field", "source_link"),
        ],
        ..Default::default()
    }
}

fn item(title: &str, guid: Option<&str>) -> FeedItem {
    FeedItem {
        title: Some(title.to_string()),
        guid: guid.map(ToString::to_string),
        ..Default::default()
    }
}

fn feed_of(title: &str, items: Vec<FeedItem>) -> ParsedFeed {
    ParsedFeed {
        title: title.to_string(),
        items,
    }
}

fn sample_feed() -> ParsedFeed {
    let xml = include_str!("../../../fixtures/feeds/sample.xml");
    parse_rss(xml.as_bytes()).expect("fixture parses")
}

#[tokio::test]
async fn rerunning_a_feed_updates_instead_of_duplicating() {
    let reader = Arc::new(StaticFeedReader::new().with_feed(FEED_URL, sample_feed()));
    let h = harness(reader);
    h.engine.repo.save(draft("news", true)).await.expect("save");

    let first = h.engine.pipeline.run("news", false).await;
    assert!(first.success);
    assert_eq!((first.created, first.updated, first.errors), (3, 0, 1));
    assert_eq!(first.status, RunStatus::Partial);
    assert_eq!(h.store.record_count().await, 3);
    assert_eq!(h.images.calls.load(Ordering::SeqCst), 3);

    let second = h.engine.pipeline.run("news", false).await;
    assert_eq!((second.created, second.updated, second.errors), (0, 3, 1));
    assert_eq!(h.store.record_count().await, 3);
    // Same source URLs: no new downloads.
    assert_eq!(h.images.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.store.asset_count().await, 3);

    let story_1 = h
        .store
        .find_by_tag("post", TAG_GUID, "urn:example:story-1")
        .await
        .expect("lookup")
        .expect("story 1 stored");
    let story_2 = h
        .store
        .find_by_tag("post", TAG_GUID, "https://news.example.com/story-2")
        .await
        .expect("lookup")
        .expect("story 2 keyed by link");
    assert_ne!(story_1, story_2);
    assert_eq!(h.store.term_names(story_1, "category").await, vec!["Science", "Space"]);

    let record = h.store.record(story_1).await.expect("record");
    assert!(record.primary_image.is_some());
    assert!(record.payload.content.as_deref().is_some_and(|c| c.contains("probe")));
}

#[tokio::test]
async fn mixed_outcomes_make_a_partial_run() {
    let reader = Arc::new(StaticFeedReader::new());
    let h = harness(reader.clone());
    h.engine.repo.save(draft("mixed", true)).await.expect("save");

    reader
        .set_feed(FEED_URL, feed_of("Mixed", vec![item("Existing", Some("g-existing"))]))
        .await;
    assert_eq!(h.engine.pipeline.run("mixed", false).await.created, 1);

    h.store.reject_title("Broken").await;
    reader
        .set_feed(
            FEED_URL,
            feed_of(
                "Mixed",
                vec![
                    item("One", Some("g-1")),
                    item("Two", Some("g-2")),
                    item("Existing", Some("g-existing")),
                    item("Broken", Some("g-broken")),
                    item("Three", Some("g-3")),
                ],
            ),
        )
        .await;

    let result = h.engine.pipeline.run("mixed", false).await;
    assert!(result.success);
    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!((result.created, result.updated, result.errors, result.skipped), (3, 1, 1, 0));
    assert_eq!(result.message, "Import complete: 3 created, 1 updated, 0 skipped, 1 errors.");

    let logs = h.engine.logger.recent(10, Some("mixed")).await.expect("logs");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].status, RunStatus::Partial);
    assert_eq!(logs[0].error_messages.len(), 1);

    let feed = h.engine.repo.get("mixed").await.expect("get").expect("feed");
    assert_eq!(feed.last_run_status, RunStatus::Partial);
    assert_eq!(feed.last_run_count, 4);
    assert!(feed.last_run_at.is_some());
}

#[tokio::test]
async fn run_stops_at_the_per_run_item_cap() {
    let items = (0..5)
        .map(|i| item(&format!("Story {i}"), Some(&format!("g-{i}"))))
        .collect();
    let reader = Arc::new(StaticFeedReader::new().with_feed(FEED_URL, feed_of("Capped", items)));
    let h = harness(reader);
    let mut capped = draft("capped", true);
    capped.max_items_per_run = Some(2);
    h.engine.repo.save(capped).await.expect("save");

    let result = h.engine.pipeline.run("capped", false).await;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!((result.created, result.updated, result.errors), (2, 0, 0));
    assert_eq!(h.store.record_count().await, 2);

    for (guid, stored) in [("g-0", true), ("g-1", true), ("g-2", false), ("g-4", false)] {
        let found = h.store.find_by_tag("post", TAG_GUID, guid).await.expect("lookup");
        assert_eq!(found.is_some(), stored, "{guid}");
    }
}

#[tokio::test]
async fn failed_image_download_does_not_fail_the_item() {
    let story = FeedItem {
        media_content_urls: vec!["https://cdn.example.com/img/missing.jpg".into()],
        ..item("Pictured", Some("g-pictured"))
    };
    let reader =
        Arc::new(StaticFeedReader::new().with_feed(FEED_URL, feed_of("Pictures", vec![story])));
    let h = build_harness(reader, CountingImages::unreachable());
    h.engine.repo.save(draft("pictures", true)).await.expect("save");

    let result = h.engine.pipeline.run("pictures", false).await;
    assert!(result.success);
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!((result.created, result.errors), (1, 0));
    assert_eq!(h.images.calls.load(Ordering::SeqCst), 1);

    let logs = h.engine.logger.recent(1, Some("pictures")).await.expect("logs");
    assert!(logs[0].error_messages.is_empty());

    let id = h
        .store
        .find_by_tag("post", TAG_GUID, "g-pictured")
        .await
        .expect("lookup")
        .expect("record stored");
    assert_eq!(h.store.record(id).await.expect("record").primary_image, None);
    assert_eq!(h.store.asset_count().await, 0);
}

#[tokio::test]
async fn run_with_only_failing_items_is_an_error() {
    let untracked = (0..5).map(|i| item(&format!("Bulletin {i}"), None)).collect();
    let reader =
        Arc::new(StaticFeedReader::new().with_feed(FEED_URL, feed_of("Bulletins", untracked)));
    let h = harness(reader);
    h.engine.repo.save(draft("bulletins", true)).await.expect("save");

    let result = h.engine.pipeline.run("bulletins", false).await;
    assert_eq!(result.status, RunStatus::Error);
    assert_eq!((result.created, result.updated, result.errors), (0, 0, 5));
    assert_eq!(h.store.record_count().await, 0);
}

#[tokio::test]
async fn disabled_feed_is_refused_without_fetching_unless_forced() {
    let reader = Arc::new(StaticFeedReader::new().with_feed(FEED_URL, sample_feed()));
    let h = harness(reader.clone());
    h.engine.repo.save(draft("quiet", false)).await.expect("save");

    let refused = h.engine.pipeline.run("quiet", false).await;
    assert!(!refused.success);
    assert_eq!(refused.refusal, Some(RunRefusal::FeedDisabled));
    assert_eq!(refused.message, "Feed is disabled.");
    assert_eq!(reader.fetch_count(), 0);
    assert!(h.engine.logger.recent(10, None).await.expect("logs").is_empty());

    let forced = h.engine.pipeline.run("quiet", true).await;
    assert!(forced.success);
    assert_eq!(reader.fetch_count(), 1);
    assert_eq!(h.engine.logger.recent(10, None).await.expect("logs").len(), 1);
}

#[tokio::test]
async fn unknown_feed_is_refused_without_a_log_entry() {
    let h = harness(Arc::new(StaticFeedReader::new()));
    let result = h.engine.pipeline.run("missing", true).await;
    assert_eq!(result.refusal, Some(RunRefusal::ConfigNotFound));
    assert_eq!(result.message, "Feed not found.");
    assert!(h.engine.logger.recent(10, None).await.expect("logs").is_empty());
}

#[tokio::test]
async fn fetch_failure_writes_exactly_one_error_entry() {
    let reader = Arc::new(StaticFeedReader::new());
    reader.set_failure(FEED_URL, "connection refused").await;
    let h = harness(reader);
    h.engine.repo.save(draft("down", true)).await.expect("save");

    let result = h.engine.pipeline.run("down", false).await;
    assert!(!result.success);
    assert_eq!(result.status, RunStatus::Error);
    assert_eq!(result.failure, Some(RunFailure::Fetch));
    assert_eq!(result.message, "connection refused");

    let logs = h.engine.logger.recent(10, None).await.expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Error);
    assert_eq!(logs[0].error_count, 0);
    assert_eq!(logs[0].error_messages, vec!["connection refused".to_string()]);

    let feed = h.engine.repo.get("down").await.expect("get").expect("feed");
    assert_eq!(feed.last_run_status, RunStatus::Error);
    assert_eq!(feed.last_run_count, 0);
}

/// Reader that parks inside `fetch` until released.
struct GateReader {
    entered: Notify,
    release: Notify,
    feed: ParsedFeed,
}

#[async_trait]
impl FeedReader for GateReader {
    async fn fetch(&self, _url: &str, _cache: CachePolicy) -> Result<ParsedFeed, FeedFetchError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(self.feed.clone())
    }
}

#[tokio::test]
async fn concurrent_run_for_the_same_feed_is_refused() {
    let gate = Arc::new(GateReader {
        entered: Notify::new(),
        release: Notify::new(),
        feed: feed_of("Gate", vec![item("Only", Some("g-only"))]),
    });
    let h = harness_with_reader(gate.clone());
    h.engine.repo.save(draft("busy", true)).await.expect("save");

    let pipeline = h.engine.pipeline.clone();
    let first = tokio::spawn(async move { pipeline.run("busy", false).await });
    gate.entered.notified().await;

    let second = h.engine.pipeline.run("busy", true).await;
    assert_eq!(second.refusal, Some(RunRefusal::AlreadyRunning));
    assert_eq!(second.message, "Import already running for this feed.");

    gate.release.notify_one();
    let first = first.await.expect("join");
    assert!(first.success);
    assert_eq!(first.created, 1);
    assert_eq!(h.engine.logger.recent(10, None).await.expect("logs").len(), 1);
    assert_eq!(h.engine.pipeline.tracked_run_locks().await, 0);
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let h = harness(Arc::new(StaticFeedReader::new()));
    h.engine.repo.save(draft("on", true)).await.expect("save");
    h.engine.repo.save(draft("off", false)).await.expect("save");

    let first = h.engine.scheduler.reconcile_all().await.expect("reconcile");
    assert_eq!(first.installed, vec!["on".to_string()]);
    assert!(first.removed.is_empty());
    assert_eq!(first.unchanged, 1);

    let second = h.engine.scheduler.reconcile_all().await.expect("reconcile");
    assert!(second.installed.is_empty());
    assert!(second.removed.is_empty());
    assert_eq!(second.unchanged, 2);

    assert_eq!(h.triggers.install_count(), 1);
    assert_eq!(h.triggers.pending().await.len(), 1);
    assert!(h.triggers.pending().await.contains_key(&hook_id("on")));
}

#[tokio::test]
async fn disabled_feeds_never_hold_a_trigger() {
    let h = harness(Arc::new(StaticFeedReader::new()));
    h.engine.repo.save(draft("later", false)).await.expect("save");

    assert!(!h.engine.scheduler.schedule("later").await.expect("schedule"));
    assert_eq!(h.engine.scheduler.next_fire("later").await.expect("next"), None);

    let toggled = h.engine.toggle_feed("later").await.expect("toggle");
    assert!(toggled.enabled);
    assert_eq!(
        h.engine.scheduler.next_fire("later").await.expect("next"),
        Some(h.clock.now())
    );

    let toggled = h.engine.toggle_feed("later").await.expect("toggle back");
    assert!(!toggled.enabled);
    assert_eq!(h.engine.scheduler.next_fire("later").await.expect("next"), None);
}

#[tokio::test]
async fn operator_lifecycle_runs_schedules_and_unschedules() {
    let reader = Arc::new(StaticFeedReader::new().with_feed(FEED_URL, sample_feed()));
    let h = harness(reader.clone());

    let saved = h.engine.create_feed(draft("ignored-id", true)).await.expect("create");
    let id = saved.feed.id.clone();
    assert_ne!(id, "ignored-id");
    let initial = saved.initial_run.expect("enabled feeds run on create");
    assert_eq!(initial.created, 3);
    assert!(h.engine.scheduler.next_fire(&id).await.expect("next").is_some());

    // One hour later the hourly trigger fires an unforced run.
    h.clock.advance(chrono::Duration::hours(1));
    let now = h.clock.now();
    assert_eq!(h.triggers.fire_due(now).await, 1);
    assert_eq!(reader.fetch_count(), 2);
    assert_eq!(h.engine.logger.recent(10, Some(&id)).await.expect("logs")[0].updated_count, 3);

    let mut changed = FeedDraft::from(&saved.feed);
    changed.interval = Some(ImportInterval::Daily);
    let updated = h.engine.update_feed(&id, changed).await.expect("update");
    assert_eq!(updated.interval, ImportInterval::Daily);
    assert_eq!(updated.created_at, saved.feed.created_at);
    assert_eq!(h.triggers.pending().await[&hook_id(&id)].every.as_secs(), 86_400);

    assert!(h.engine.delete_feed(&id).await.expect("delete"));
    assert!(h.triggers.pending().await.is_empty());
    assert!(h.engine.repo.get(&id).await.expect("get").is_none());
    assert!(h.engine.update_feed(&id, FeedDraft::default()).await.is_err());
}

#[tokio::test]
async fn preview_samples_the_first_items() {
    let reader = Arc::new(StaticFeedReader::new().with_feed(FEED_URL, sample_feed()));
    let h = harness(reader);

    let preview = h.engine.pipeline.preview(FEED_URL).await.expect("preview");
    assert_eq!(preview.item_count, 4);
    assert_eq!(preview.sample_items.len(), 4);
    let first = &preview.sample_items[0];
    assert_eq!(first.pub_date, "2026-03-02 09:30:00");
    assert!(first.has_content);
    assert!(!first.description.contains('<'));
    assert_eq!(first.categories, vec!["Science", "Space"]);
}
