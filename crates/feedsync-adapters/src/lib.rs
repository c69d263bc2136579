//! Collaborator contracts for the sync engine (feed reader, content store,
//! schema discovery, image materializer) and their concrete implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_core::{Enclosure, FeedItem, FieldValue, ParsedFeed, Visibility, NATIVE_FIELDS};
use feedsync_storage::HttpFetcher;
use scraper::Html;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

mod images;
mod memory;
mod postgres;

pub use feedsync_storage::CachePolicy;
pub use images::{HttpImageMaterializer, ImageError, ImageMaterializer, NoopImageMaterializer};
pub use memory::{MemoryContentStore, StoredRecord};
pub use postgres::PgContentStore;

pub const CRATE_NAME: &str = "feedsync-adapters";

const MEDIA_RSS_NAMESPACE: &str = "http://search.yahoo.com/mrss/";

#[derive(Debug, Error)]
pub enum FeedFetchError {
    #[error(transparent)]
    Http(#[from] feedsync_storage::FetchError),
    #[error("feed could not be parsed: {0}")]
    Parse(String),
    #[error("invalid feed url {0:?}")]
    InvalidUrl(String),
    #[error("{0}")]
    Unavailable(String),
}

#[async_trait]
pub trait FeedReader: Send + Sync {
    async fn fetch(&self, url: &str, cache: CachePolicy) -> Result<ParsedFeed, FeedFetchError>;
}

/// Fetches over HTTP and parses RSS 2.0 or Atom 1.0.
#[derive(Debug, Clone)]
pub struct HttpFeedReader {
    http: Arc<HttpFetcher>,
}

impl HttpFeedReader {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl FeedReader for HttpFeedReader {
    async fn fetch(&self, url: &str, cache: CachePolicy) -> Result<ParsedFeed, FeedFetchError> {
        let parsed = Url::parse(url).map_err(|_| FeedFetchError::InvalidUrl(url.to_string()))?;
        let scope = parsed.host_str().unwrap_or("unknown-host").to_string();
        let response = self.http.fetch_bytes(&scope, url, cache).await?;
        let feed = parse_feed(&response.body)?;
        tracing::debug!(url, items = feed.item_count(), "parsed feed");
        Ok(feed)
    }
}

/// RSS 2.0 or Atom 1.0, chosen by the document element.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, FeedFetchError> {
    match root_element(bytes) {
        Some("feed") => parse_atom(bytes),
        _ => parse_rss(bytes),
    }
}

/// Local name of the document element. Skips the prolog and comments.
fn root_element(bytes: &[u8]) -> Option<&str> {
    let mut rest = bytes;
    loop {
        let open = rest.iter().position(|b| *b == b'<')?;
        rest = &rest[open + 1..];
        if rest.starts_with(b"!--") {
            let close = rest.windows(3).position(|w| w == b"-->")?;
            rest = &rest[close + 3..];
            continue;
        }
        if matches!(rest.first(), Some(b'?' | b'!')) {
            continue;
        }
        let end = rest
            .iter()
            .position(|b| b.is_ascii_whitespace() || matches!(b, b'>' | b'/'))
            .unwrap_or(rest.len());
        let name = std::str::from_utf8(&rest[..end]).ok()?;
        return name.rsplit(':').next();
    }
}

fn media_prefix(namespaces: &BTreeMap<String, String>) -> String {
    namespaces
        .iter()
        .find(|(_, uri)| uri.as_str() == MEDIA_RSS_NAMESPACE)
        .map(|(prefix, _)| prefix.clone())
        .unwrap_or_else(|| "media".to_string())
}

pub fn parse_rss(bytes: &[u8]) -> Result<ParsedFeed, FeedFetchError> {
    let channel = rss::Channel::read_from(bytes).map_err(|e| FeedFetchError::Parse(e.to_string()))?;
    let media_prefix = media_prefix(channel.namespaces());

    let items = channel
        .items()
        .iter()
        .map(|item| item_from_rss(item, &media_prefix))
        .collect();

    Ok(ParsedFeed {
        title: channel.title().trim().to_string(),
        items,
    })
}

fn item_from_rss(item: &rss::Item, media_prefix: &str) -> FeedItem {
    let dc = item.dublin_core_ext();
    let pub_date = item.pub_date().and_then(parse_feed_date).or_else(|| {
        dc.and_then(|dc| dc.dates().first())
            .and_then(|d| parse_feed_date(d))
    });
    let media = item.extensions().get(media_prefix);

    FeedItem {
        title: owned(item.title()),
        link: owned(item.link()),
        description: owned(item.description()),
        content: owned(item.content()),
        pub_date,
        author: owned(item.author()),
        dc_creators: dc.map(|dc| dc.creators().to_vec()).unwrap_or_default(),
        categories: item
            .categories()
            .iter()
            .map(|c| c.name().trim().to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        guid: item.guid().map(|g| g.value().to_string()),
        enclosure: item.enclosure().map(|e| Enclosure {
            url: e.url().trim().to_string(),
            mime_type: e.mime_type().trim().to_string(),
        }),
        media_content_urls: media_urls(media, "content"),
        media_thumbnail_urls: media_urls(media, "thumbnail"),
    }
}

pub fn parse_atom(bytes: &[u8]) -> Result<ParsedFeed, FeedFetchError> {
    let feed = atom_syndication::Feed::read_from(bytes)
        .map_err(|e| FeedFetchError::Parse(e.to_string()))?;
    let media_prefix = media_prefix(feed.namespaces());

    let items = feed
        .entries()
        .iter()
        .map(|entry| item_from_atom(entry, &media_prefix))
        .collect();

    Ok(ParsedFeed {
        title: feed.title().trim().to_string(),
        items,
    })
}

fn item_from_atom(entry: &atom_syndication::Entry, media_prefix: &str) -> FeedItem {
    let links = entry.links();
    let link = links
        .iter()
        .find(|l| l.rel() == "alternate")
        .or_else(|| links.iter().find(|l| l.rel() != "enclosure"))
        .and_then(|l| non_empty(l.href()));
    let enclosure = links.iter().find(|l| l.rel() == "enclosure").map(|l| Enclosure {
        url: l.href().trim().to_string(),
        mime_type: l.mime_type().unwrap_or_default().trim().to_string(),
    });
    // A missing `updated` parses as the epoch.
    let pub_date = entry
        .published()
        .or(Some(entry.updated()))
        .filter(|d| d.timestamp() != 0)
        .map(|d| d.with_timezone(&Utc));
    let media = entry.extensions().get(media_prefix);

    FeedItem {
        title: non_empty(entry.title().as_str()),
        link,
        description: entry.summary().and_then(|s| non_empty(s.as_str())),
        content: entry.content().and_then(|c| c.value()).and_then(non_empty),
        pub_date,
        author: entry.authors().first().and_then(|p| non_empty(p.name())),
        dc_creators: Vec::new(),
        categories: entry
            .categories()
            .iter()
            .filter_map(|c| non_empty(c.term()))
            .collect(),
        guid: non_empty(entry.id()),
        enclosure,
        media_content_urls: media_urls(media, "content"),
        media_thumbnail_urls: media_urls(media, "thumbnail"),
    }
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(ToString::to_string)
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Extension element shape shared by the `rss` and `atom_syndication` crates.
trait ExtensionNode: Sized {
    fn attr(&self, name: &str) -> Option<&str>;
    fn child_elements(&self, name: &str) -> &[Self];
}

impl ExtensionNode for rss::extension::Extension {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs().get(name).map(String::as_str)
    }

    fn child_elements(&self, name: &str) -> &[Self] {
        self.children().get(name).map(Vec::as_slice).unwrap_or_default()
    }
}

impl ExtensionNode for atom_syndication::extension::Extension {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs().get(name).map(String::as_str)
    }

    fn child_elements(&self, name: &str) -> &[Self] {
        self.children().get(name).map(Vec::as_slice).unwrap_or_default()
    }
}

/// `url` attributes of `media:<element>`, including ones nested in `media:group`.
fn media_urls<E: ExtensionNode>(
    media: Option<&BTreeMap<String, Vec<E>>>,
    element: &str,
) -> Vec<String> {
    let Some(media) = media else {
        return Vec::new();
    };
    let direct = media.get(element).into_iter().flatten();
    let grouped = media
        .get("group")
        .into_iter()
        .flatten()
        .flat_map(|group| group.child_elements(element));

    direct
        .chain(grouped)
        .filter_map(|ext| ext.attr("url"))
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect()
}

/// RFC 2822 (RSS `pubDate`) or RFC 3339 (Dublin Core, Atom-style).
pub fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Text content of an HTML fragment, cut to `max_words` words.
pub fn plain_text_excerpt(html: &str, max_words: usize) -> String {
    let fragment = Html::parse_fragment(html);
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    let words = text.split_whitespace().collect::<Vec<_>>();
    if words.len() <= max_words {
        words.join(" ")
    } else {
        format!("{}…", words[..max_words].join(" "))
    }
}

/// In-memory reader keyed by URL. Counts every fetch attempt.
#[derive(Debug, Default)]
pub struct StaticFeedReader {
    feeds: Mutex<HashMap<String, Result<ParsedFeed, String>>>,
    fetches: AtomicUsize,
}

impl StaticFeedReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed(mut self, url: impl Into<String>, feed: ParsedFeed) -> Self {
        self.feeds.get_mut().insert(url.into(), Ok(feed));
        self
    }

    pub async fn set_feed(&self, url: impl Into<String>, feed: ParsedFeed) {
        self.feeds.lock().await.insert(url.into(), Ok(feed));
    }

    pub async fn set_failure(&self, url: impl Into<String>, reason: impl Into<String>) {
        self.feeds.lock().await.insert(url.into(), Err(reason.into()));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedReader for StaticFeedReader {
    async fn fetch(&self, url: &str, _cache: CachePolicy) -> Result<ParsedFeed, FeedFetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.feeds.lock().await.get(url) {
            Some(Ok(feed)) => Ok(feed.clone()),
            Some(Err(reason)) => Err(FeedFetchError::Unavailable(reason.clone())),
            None => Err(FeedFetchError::Unavailable(format!("no feed registered for {url}"))),
        }
    }
}

pub type RecordId = i64;
pub type TermId = i64;
pub type AssetId = i64;

/// Native fields written on insert/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub title: String,
    pub content: Option<String>,
    pub excerpt: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub visibility: Visibility,
    pub owner: String,
}

/// Asset bytes already persisted by an image materializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAsset {
    pub content_hash: String,
    pub relative_path: String,
    pub byte_size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub key: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyDescriptor {
    pub key: String,
    pub label: String,
    pub hierarchical: bool,
}

#[derive(Debug, Error)]
pub enum ContentStoreError {
    #[error("record {0} not found")]
    RecordNotFound(RecordId),
    #[error("asset {0} not found")]
    AssetNotFound(AssetId),
    #[error("rejected by content store: {0}")]
    Rejected(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Record storage the import pipeline upserts into. Tags are text meta entries.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Exact-match lookup of a record in `collection` carrying `tag_key = tag_value`.
    async fn find_by_tag(
        &self,
        collection: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Option<RecordId>, ContentStoreError>;

    async fn insert(
        &self,
        collection: &str,
        payload: &RecordPayload,
    ) -> Result<RecordId, ContentStoreError>;

    async fn update(&self, id: RecordId, payload: &RecordPayload) -> Result<(), ContentStoreError>;

    async fn set_meta(
        &self,
        id: RecordId,
        key: &str,
        value: &FieldValue,
    ) -> Result<(), ContentStoreError>;

    async fn get_meta(
        &self,
        id: RecordId,
        key: &str,
    ) -> Result<Option<FieldValue>, ContentStoreError>;

    async fn set_tag(&self, id: RecordId, key: &str, value: &str) -> Result<(), ContentStoreError> {
        self.set_meta(id, key, &FieldValue::Text(value.to_string())).await
    }

    async fn get_tag(&self, id: RecordId, key: &str) -> Result<Option<String>, ContentStoreError> {
        Ok(self.get_meta(id, key).await?.map(|v| v.to_text()))
    }

    async fn set_custom_field(
        &self,
        id: RecordId,
        key: &str,
        value: &FieldValue,
    ) -> Result<(), ContentStoreError>;

    async fn register_asset(
        &self,
        source_url: &str,
        asset: &StoredAsset,
    ) -> Result<AssetId, ContentStoreError>;

    async fn asset_source_url(&self, asset: AssetId) -> Result<Option<String>, ContentStoreError>;

    async fn primary_image(&self, id: RecordId) -> Result<Option<AssetId>, ContentStoreError>;

    async fn attach_primary_image(
        &self,
        id: RecordId,
        asset: AssetId,
    ) -> Result<(), ContentStoreError>;

    /// Term id for `name` in `taxonomy`, created when missing. Names match exactly.
    async fn ensure_taxonomy_term(
        &self,
        taxonomy: &str,
        name: &str,
    ) -> Result<TermId, ContentStoreError>;

    /// Replace the record's terms for `taxonomy`.
    async fn assign_terms(
        &self,
        id: RecordId,
        taxonomy: &str,
        terms: &[TermId],
    ) -> Result<(), ContentStoreError>;
}

/// What a target collection currently supports. Unknown collections yield
/// empty lists rather than errors.
#[async_trait]
pub trait SchemaDiscovery: Send + Sync {
    fn native_fields(&self) -> Vec<FieldDescriptor> {
        NATIVE_FIELDS
            .iter()
            .map(|(key, label)| FieldDescriptor {
                key: key.to_string(),
                label: label.to_string(),
                field_type: None,
            })
            .collect()
    }

    /// Whether the custom-field extension exists at all.
    fn custom_fields_available(&self) -> bool;

    async fn custom_fields(
        &self,
        collection: &str,
    ) -> Result<Vec<FieldDescriptor>, ContentStoreError>;

    async fn taxonomies(
        &self,
        collection: &str,
    ) -> Result<Vec<TaxonomyDescriptor>, ContentStoreError>;
}
