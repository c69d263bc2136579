//! Core domain model for the feed sync engine: feed configuration, mapping
//! rules, parsed feed items and import run records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedsync-core";

pub const DEFAULT_MAX_ITEMS: u32 = 20;
pub const MAX_ITEMS_CAP: u32 = 100;

/// Sentinel native-field key routed to the record's primary image.
pub const FEATURED_IMAGE_KEY: &str = "featured_image";
pub const NATIVE_TITLE: &str = "post_title";
pub const NATIVE_CONTENT: &str = "post_content";
pub const NATIVE_EXCERPT: &str = "post_excerpt";
pub const NATIVE_DATE: &str = "post_date";

/// Fixed native field vocabulary as `(key, label)`.
pub const NATIVE_FIELDS: &[(&str, &str)] = &[
    (NATIVE_TITLE, "Title"),
    (NATIVE_CONTENT, "Content"),
    (NATIVE_EXCERPT, "Excerpt"),
    (NATIVE_DATE, "Publish Date"),
    (FEATURED_IMAGE_KEY, "Featured Image (URL)"),
];

/// Placeholder title used when neither a mapping nor the item supplies one.
pub const UNTITLED_PLACEHOLDER: &str = "(No title)";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Source of "now" for anything that stamps times.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImportInterval {
    Hourly,
    #[serde(alias = "twicedaily")]
    TwiceDaily,
    #[default]
    Daily,
    Weekly,
}

impl ImportInterval {
    pub const ALL: [ImportInterval; 4] = [
        ImportInterval::Hourly,
        ImportInterval::TwiceDaily,
        ImportInterval::Daily,
        ImportInterval::Weekly,
    ];

    pub fn period(self) -> Duration {
        match self {
            ImportInterval::Hourly => Duration::from_secs(3_600),
            ImportInterval::TwiceDaily => Duration::from_secs(43_200),
            ImportInterval::Daily => Duration::from_secs(86_400),
            ImportInterval::Weekly => Duration::from_secs(604_800),
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            ImportInterval::Hourly => "hourly",
            ImportInterval::TwiceDaily => "twice_daily",
            ImportInterval::Daily => "daily",
            ImportInterval::Weekly => "weekly",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ImportInterval::Hourly => "Once Hourly",
            ImportInterval::TwiceDaily => "Twice Daily",
            ImportInterval::Daily => "Once Daily",
            ImportInterval::Weekly => "Once Weekly",
        }
    }
}

impl FromStr for ImportInterval {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "hourly" => Ok(ImportInterval::Hourly),
            "twice_daily" | "twicedaily" => Ok(ImportInterval::TwiceDaily),
            "daily" => Ok(ImportInterval::Daily),
            "weekly" => Ok(ImportInterval::Weekly),
            other => Err(UnknownVariant::new("interval", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Draft,
    #[serde(alias = "publish")]
    Published,
}

impl Visibility {
    pub fn key(self) -> &'static str {
        match self {
            Visibility::Draft => "draft",
            Visibility::Published => "published",
        }
    }
}

impl FromStr for Visibility {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "draft" => Ok(Visibility::Draft),
            "published" | "publish" => Ok(Visibility::Published),
            other => Err(UnknownVariant::new("visibility", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    None,
    Success,
    Partial,
    Error,
}

impl RunStatus {
    /// Status of a completed run: any error with nothing imported is `Error`,
    /// errors alongside imports are `Partial`.
    pub fn from_counts(created: usize, updated: usize, errors: usize) -> Self {
        let total = created + updated;
        match (errors > 0, total > 0) {
            (true, false) => RunStatus::Error,
            (true, true) => RunStatus::Partial,
            (false, _) => RunStatus::Success,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            RunStatus::None => "none",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Fixed RSS source vocabulary a mapping rule can read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceField {
    Title,
    Description,
    Content,
    Link,
    #[serde(alias = "pubDate")]
    PubDate,
    Author,
    Categories,
    Guid,
    MediaContentUrl,
    MediaThumbnailUrl,
    EnclosureUrl,
    EnclosureType,
}

impl SourceField {
    pub const ALL: [SourceField; 12] = [
        SourceField::Title,
        SourceField::Description,
        SourceField::Content,
        SourceField::Link,
        SourceField::PubDate,
        SourceField::Author,
        SourceField::Categories,
        SourceField::Guid,
        SourceField::MediaContentUrl,
        SourceField::MediaThumbnailUrl,
        SourceField::EnclosureUrl,
        SourceField::EnclosureType,
    ];

    pub fn key(self) -> &'static str {
        match self {
            SourceField::Title => "title",
            SourceField::Description => "description",
            SourceField::Content => "content",
            SourceField::Link => "link",
            SourceField::PubDate => "pub_date",
            SourceField::Author => "author",
            SourceField::Categories => "categories",
            SourceField::Guid => "guid",
            SourceField::MediaContentUrl => "media_content_url",
            SourceField::MediaThumbnailUrl => "media_thumbnail_url",
            SourceField::EnclosureUrl => "enclosure_url",
            SourceField::EnclosureType => "enclosure_type",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SourceField::Title => "Title",
            SourceField::Description => "Description / Summary",
            SourceField::Content => "Content (content:encoded)",
            SourceField::Link => "Link / URL",
            SourceField::PubDate => "Publication Date",
            SourceField::Author => "Author",
            SourceField::Categories => "Categories",
            SourceField::Guid => "GUID",
            SourceField::MediaContentUrl => "Media Content URL",
            SourceField::MediaThumbnailUrl => "Media Thumbnail URL",
            SourceField::EnclosureUrl => "Enclosure URL",
            SourceField::EnclosureType => "Enclosure MIME Type",
        }
    }
}

impl FromStr for SourceField {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "pubDate" {
            return Ok(SourceField::PubDate);
        }
        SourceField::ALL
            .into_iter()
            .find(|f| f.key() == s)
            .ok_or_else(|| UnknownVariant::new("source field", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[serde(alias = "wp_field")]
    NativeField,
    #[serde(alias = "acf_field")]
    CustomField,
    #[serde(alias = "taxonomy")]
    TaxonomyTermSet,
    #[serde(alias = "meta_field")]
    FreeMeta,
}

impl TargetKind {
    pub fn key(self) -> &'static str {
        match self {
            TargetKind::NativeField => "native_field",
            TargetKind::CustomField => "custom_field",
            TargetKind::TaxonomyTermSet => "taxonomy_term_set",
            TargetKind::FreeMeta => "free_meta",
        }
    }
}

impl FromStr for TargetKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "native_field" | "wp_field" => Ok(TargetKind::NativeField),
            "custom_field" | "acf_field" => Ok(TargetKind::CustomField),
            "taxonomy_term_set" | "taxonomy" => Ok(TargetKind::TaxonomyTermSet),
            "free_meta" | "meta_field" => Ok(TargetKind::FreeMeta),
            other => Err(UnknownVariant::new("target kind", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    pub source_field: SourceField,
    pub target_kind: TargetKind,
    pub target_key: String,
}

impl MappingRule {
    pub fn new(
        source_field: SourceField,
        target_kind: TargetKind,
        target_key: impl Into<String>,
    ) -> Self {
        Self {
            source_field,
            target_kind,
            target_key: target_key.into(),
        }
    }
}

/// Unvalidated mapping row as an operator submits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MappingRuleInput {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target_kind: String,
    #[serde(default)]
    pub target_key: String,
}

impl MappingRuleInput {
    /// Validated rule, or `None` when any part is empty or unknown.
    pub fn to_rule(&self) -> Option<MappingRule> {
        let key = sanitize_text(&self.target_key);
        if key.is_empty() {
            return None;
        }
        let source = self.source.parse::<SourceField>().ok()?;
        let kind = self.target_kind.parse::<TargetKind>().ok()?;
        Some(MappingRule::new(source, kind, key))
    }
}

impl From<&MappingRule> for MappingRuleInput {
    fn from(rule: &MappingRule) -> Self {
        Self {
            source: rule.source_field.key().to_string(),
            target_kind: rule.target_kind.key().to_string(),
            target_key: rule.target_key.clone(),
        }
    }
}

/// Persisted feed configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub id: String,
    pub name: String,
    pub source_url: String,
    pub target_collection: String,
    pub target_visibility: Visibility,
    pub owner: String,
    pub interval: ImportInterval,
    pub max_items_per_run: u32,
    pub enabled: bool,
    #[serde(default)]
    pub field_mappings: Vec<MappingRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_status: RunStatus,
    #[serde(default)]
    pub last_run_count: u32,
}

/// Operator-supplied feed fields; the repository sanitizes and completes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FeedDraft {
    pub id: Option<String>,
    pub name: String,
    pub source_url: String,
    pub target_collection: Option<String>,
    pub target_visibility: Option<Visibility>,
    pub owner: Option<String>,
    pub interval: Option<ImportInterval>,
    pub max_items_per_run: Option<u32>,
    pub enabled: bool,
    pub field_mappings: Vec<MappingRuleInput>,
}

impl From<&FeedConfig> for FeedDraft {
    fn from(feed: &FeedConfig) -> Self {
        Self {
            id: Some(feed.id.clone()),
            name: feed.name.clone(),
            source_url: feed.source_url.clone(),
            target_collection: Some(feed.target_collection.clone()),
            target_visibility: Some(feed.target_visibility),
            owner: Some(feed.owner.clone()),
            interval: Some(feed.interval),
            max_items_per_run: Some(feed.max_items_per_run),
            enabled: feed.enabled,
            field_mappings: feed.field_mappings.iter().map(MappingRuleInput::from).collect(),
        }
    }
}

pub fn new_feed_id() -> String {
    format!("feed_{}", Uuid::new_v4().simple())
}

/// Zero or absent falls back to the default; everything else is capped to 1..=100.
pub fn clamp_max_items(requested: Option<u32>) -> u32 {
    match requested {
        None | Some(0) => DEFAULT_MAX_ITEMS,
        Some(n) => n.min(MAX_ITEMS_CAP),
    }
}

/// Trim, turn control characters into spaces and collapse whitespace runs.
pub fn sanitize_text(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercase identifier restricted to `[a-z0-9_-]`.
pub fn sanitize_key(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Immutable history entry for one import run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRunRecord {
    pub feed_id: String,
    pub feed_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub created_count: u32,
    pub updated_count: u32,
    pub skipped_count: u32,
    pub error_count: u32,
    #[serde(default)]
    pub error_messages: Vec<String>,
    pub duration_seconds: f64,
}

pub fn round_duration_secs(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Enclosure {
    pub url: String,
    pub mime_type: String,
}

/// Parsed feed item as handed over by a feed reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FeedItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub pub_date: Option<DateTime<Utc>>,
    /// Raw attribution, typically `email (Name)`.
    pub author: Option<String>,
    pub dc_creators: Vec<String>,
    pub categories: Vec<String>,
    pub guid: Option<String>,
    pub enclosure: Option<Enclosure>,
    pub media_content_urls: Vec<String>,
    pub media_thumbnail_urls: Vec<String>,
}

impl FeedItem {
    /// GUID when present, otherwise the link.
    pub fn dedup_key(&self) -> Option<&str> {
        non_blank(self.guid.as_deref()).or_else(|| non_blank(self.link.as_deref()))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParsedFeed {
    pub title: String,
    pub items: Vec<FeedItem>,
}

impl ParsedFeed {
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self, offset: usize, limit: usize) -> &[FeedItem] {
        let start = offset.min(self.items.len());
        let end = start.saturating_add(limit).min(self.items.len());
        &self.items[start..end]
    }
}

/// Scalar-or-list value extracted from an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::List(items) => items.is_empty(),
        }
    }

    pub fn into_list(self) -> Vec<String> {
        match self {
            FieldValue::Text(s) => vec![s],
            FieldValue::List(items) => items,
        }
    }

    pub fn first_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            FieldValue::List(items) => items.first().map(String::as_str),
        }
    }

    /// Text form; lists are joined with `", "`.
    pub fn to_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::List(items) => items.join(", "),
        }
    }
}

/// Mapping output for one item, grouped by target kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResolvedRecord {
    pub native_values: BTreeMap<String, FieldValue>,
    pub featured_image_url: Option<String>,
    pub custom_values: BTreeMap<String, FieldValue>,
    pub taxonomy_terms: BTreeMap<String, Vec<String>>,
    pub meta_values: BTreeMap<String, FieldValue>,
}
