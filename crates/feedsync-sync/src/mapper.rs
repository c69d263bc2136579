//! Projection of parsed feed items onto target fields.

use std::sync::Arc;

use feedsync_adapters::{FieldDescriptor, SchemaDiscovery, TaxonomyDescriptor};
use feedsync_core::{
    FeedItem, FieldValue, MappingRule, ResolvedRecord, SourceField, TargetKind, FEATURED_IMAGE_KEY,
};
use serde::Serialize;
use tracing::warn;

/// Display format for publication dates handed to mapping targets.
pub const PUB_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFieldInfo {
    pub key: &'static str,
    pub label: &'static str,
}

/// The fixed source vocabulary, in display order.
pub fn source_fields() -> Vec<SourceFieldInfo> {
    SourceField::ALL
        .iter()
        .map(|field| SourceFieldInfo {
            key: field.key(),
            label: field.label(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFields {
    pub native_fields: Vec<FieldDescriptor>,
    pub custom_fields: Vec<FieldDescriptor>,
    pub taxonomies: Vec<TaxonomyDescriptor>,
    pub custom_fields_available: bool,
}

pub struct FieldMapper {
    schema: Arc<dyn SchemaDiscovery>,
}

impl FieldMapper {
    pub fn new(schema: Arc<dyn SchemaDiscovery>) -> Self {
        Self { schema }
    }

    /// What `collection` accepts. Discovery failures degrade to empty lists.
    pub async fn target_fields(&self, collection: &str) -> TargetFields {
        let custom_fields_available = self.schema.custom_fields_available();
        let custom_fields = if custom_fields_available {
            self.schema.custom_fields(collection).await.unwrap_or_else(|err| {
                warn!(collection, error = %err, "custom field discovery failed");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        let taxonomies = self.schema.taxonomies(collection).await.unwrap_or_else(|err| {
            warn!(collection, error = %err, "taxonomy discovery failed");
            Vec::new()
        });

        TargetFields {
            native_fields: self.schema.native_fields(),
            custom_fields,
            taxonomies,
            custom_fields_available,
        }
    }
}

fn text(value: Option<&str>) -> Option<FieldValue> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| FieldValue::Text(v.to_string()))
}

/// Value of one source field, or `None` when the item does not carry it.
pub fn extract(item: &FeedItem, field: SourceField) -> Option<FieldValue> {
    match field {
        SourceField::Title => text(item.title.as_deref()),
        SourceField::Description => text(item.description.as_deref()),
        SourceField::Content => text(item.content.as_deref()),
        SourceField::Link => text(item.link.as_deref()),
        SourceField::Guid => text(item.guid.as_deref()),
        SourceField::PubDate => item
            .pub_date
            .map(|d| FieldValue::Text(d.format(PUB_DATE_FORMAT).to_string())),
        SourceField::Author => author_name(item).map(FieldValue::Text),
        SourceField::Categories => {
            let labels = item
                .categories
                .iter()
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            (!labels.is_empty()).then_some(FieldValue::List(labels))
        }
        SourceField::MediaContentUrl => text(item.media_content_urls.first().map(String::as_str))
            .or_else(|| {
                item.enclosure
                    .as_ref()
                    .filter(|e| e.mime_type.contains("image"))
                    .and_then(|e| text(Some(e.url.as_str())))
            }),
        SourceField::MediaThumbnailUrl => {
            text(item.media_thumbnail_urls.first().map(String::as_str))
        }
        SourceField::EnclosureUrl => item
            .enclosure
            .as_ref()
            .and_then(|e| text(Some(e.url.as_str()))),
        SourceField::EnclosureType => item
            .enclosure
            .as_ref()
            .and_then(|e| text(Some(e.mime_type.as_str()))),
    }
}

/// Name part of the item attribution: `Name` from `email (Name)`, a bare
/// value that is not an address, else the first Dublin Core creator.
pub fn author_name(item: &FeedItem) -> Option<String> {
    let from_author = item.author.as_deref().map(str::trim).and_then(|raw| {
        if let (Some(open), true) = (raw.find('('), raw.ends_with(')')) {
            let name = raw[open + 1..raw.len() - 1].trim();
            return (!name.is_empty()).then(|| name.to_string());
        }
        (!raw.is_empty() && !raw.contains('@')).then(|| raw.to_string())
    });

    from_author.or_else(|| {
        item.dc_creators
            .iter()
            .map(|c| c.trim())
            .find(|c| !c.is_empty())
            .map(ToString::to_string)
    })
}

/// Resolve `rules` in order. Empty extractions write nothing; later rules
/// replace earlier ones on the same key.
pub fn apply_mapping(item: &FeedItem, rules: &[MappingRule]) -> ResolvedRecord {
    let mut record = ResolvedRecord::default();

    for rule in rules {
        let Some(value) = extract(item, rule.source_field) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let key = rule.target_key.clone();

        match rule.target_kind {
            TargetKind::NativeField if key == FEATURED_IMAGE_KEY => {
                record.featured_image_url = value.first_text().map(ToString::to_string);
            }
            TargetKind::NativeField => {
                record.native_values.insert(key, value);
            }
            TargetKind::CustomField => {
                record.custom_values.insert(key, value);
            }
            TargetKind::TaxonomyTermSet => {
                record.taxonomy_terms.insert(key, value.into_list());
            }
            TargetKind::FreeMeta => {
                record.meta_values.insert(key, value);
            }
        }
    }

    record
}
