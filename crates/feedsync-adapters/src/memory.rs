use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use feedsync_core::FieldValue;
use tokio::sync::Mutex;

use crate::{
    AssetId, ContentStore, ContentStoreError, FieldDescriptor, RecordId, RecordPayload,
    SchemaDiscovery, StoredAsset, TaxonomyDescriptor, TermId,
};

/// Snapshot of one record held by [`MemoryContentStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub collection: String,
    pub payload: RecordPayload,
    pub meta: BTreeMap<String, FieldValue>,
    pub custom_fields: BTreeMap<String, FieldValue>,
    pub terms: BTreeMap<String, Vec<TermId>>,
    pub primary_image: Option<AssetId>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    records: BTreeMap<RecordId, StoredRecord>,
    terms: BTreeMap<(String, String), TermId>,
    assets: BTreeMap<AssetId, (String, StoredAsset)>,
    taxonomies: BTreeMap<String, Vec<TaxonomyDescriptor>>,
    custom_fields: BTreeMap<String, Vec<FieldDescriptor>>,
    rejected_titles: BTreeSet<String>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn record_mut(&mut self, id: RecordId) -> Result<&mut StoredRecord, ContentStoreError> {
        self.records.get_mut(&id).ok_or(ContentStoreError::RecordNotFound(id))
    }

    fn check_title(&self, payload: &RecordPayload) -> Result<(), ContentStoreError> {
        if self.rejected_titles.contains(&payload.title) {
            return Err(ContentStoreError::Rejected(format!("title {:?} refused", payload.title)));
        }
        Ok(())
    }
}

/// Process-local content store with the same contract as the Postgres one.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    state: Mutex<MemoryState>,
    custom_fields_available: bool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_taxonomy(mut self, collection: &str, key: &str, label: &str) -> Self {
        self.state
            .get_mut()
            .taxonomies
            .entry(collection.to_string())
            .or_default()
            .push(TaxonomyDescriptor {
                key: key.to_string(),
                label: label.to_string(),
                hierarchical: false,
            });
        self
    }

    pub fn with_custom_field(mut self, collection: &str, key: &str, label: &str) -> Self {
        self.custom_fields_available = true;
        self.state
            .get_mut()
            .custom_fields
            .entry(collection.to_string())
            .or_default()
            .push(FieldDescriptor {
                key: key.to_string(),
                label: label.to_string(),
                field_type: Some("text".to_string()),
            });
        self
    }

    /// Marks the custom-field extension as installed without declaring fields.
    pub fn with_custom_fields_available(mut self) -> Self {
        self.custom_fields_available = true;
        self
    }

    /// Inserts and updates carrying this exact title fail with `Rejected`.
    pub async fn reject_title(&self, title: &str) {
        self.state.lock().await.rejected_titles.insert(title.to_string());
    }

    pub async fn records(&self) -> Vec<StoredRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    pub async fn record(&self, id: RecordId) -> Option<StoredRecord> {
        self.state.lock().await.records.get(&id).cloned()
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn asset_count(&self) -> usize {
        self.state.lock().await.assets.len()
    }

    /// Term names assigned to a record for one taxonomy, in assignment order.
    pub async fn term_names(&self, id: RecordId, taxonomy: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let Some(record) = state.records.get(&id) else {
            return Vec::new();
        };
        let assigned = record.terms.get(taxonomy).cloned().unwrap_or_default();
        assigned
            .iter()
            .filter_map(|term_id| {
                state
                    .terms
                    .iter()
                    .find(|(_, id)| *id == term_id)
                    .map(|((_, name), _)| name.clone())
            })
            .collect()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn find_by_tag(
        &self,
        collection: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Option<RecordId>, ContentStoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.collection == collection)
            .find(|r| matches!(r.meta.get(tag_key), Some(FieldValue::Text(v)) if v == tag_value))
            .map(|r| r.id))
    }

    async fn insert(
        &self,
        collection: &str,
        payload: &RecordPayload,
    ) -> Result<RecordId, ContentStoreError> {
        let mut state = self.state.lock().await;
        state.check_title(payload)?;
        let id = state.allocate_id();
        state.records.insert(
            id,
            StoredRecord {
                id,
                collection: collection.to_string(),
                payload: payload.clone(),
                meta: BTreeMap::new(),
                custom_fields: BTreeMap::new(),
                terms: BTreeMap::new(),
                primary_image: None,
            },
        );
        Ok(id)
    }

    async fn update(&self, id: RecordId, payload: &RecordPayload) -> Result<(), ContentStoreError> {
        let mut state = self.state.lock().await;
        state.check_title(payload)?;
        state.record_mut(id)?.payload = payload.clone();
        Ok(())
    }

    async fn set_meta(
        &self,
        id: RecordId,
        key: &str,
        value: &FieldValue,
    ) -> Result<(), ContentStoreError> {
        let mut state = self.state.lock().await;
        state.record_mut(id)?.meta.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn get_meta(
        &self,
        id: RecordId,
        key: &str,
    ) -> Result<Option<FieldValue>, ContentStoreError> {
        let mut state = self.state.lock().await;
        Ok(state.record_mut(id)?.meta.get(key).cloned())
    }

    async fn set_custom_field(
        &self,
        id: RecordId,
        key: &str,
        value: &FieldValue,
    ) -> Result<(), ContentStoreError> {
        let mut state = self.state.lock().await;
        state
            .record_mut(id)?
            .custom_fields
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn register_asset(
        &self,
        source_url: &str,
        asset: &StoredAsset,
    ) -> Result<AssetId, ContentStoreError> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.assets.insert(id, (source_url.to_string(), asset.clone()));
        Ok(id)
    }

    async fn asset_source_url(&self, asset: AssetId) -> Result<Option<String>, ContentStoreError> {
        let state = self.state.lock().await;
        Ok(state.assets.get(&asset).map(|(url, _)| url.clone()))
    }

    async fn primary_image(&self, id: RecordId) -> Result<Option<AssetId>, ContentStoreError> {
        let mut state = self.state.lock().await;
        Ok(state.record_mut(id)?.primary_image)
    }

    async fn attach_primary_image(
        &self,
        id: RecordId,
        asset: AssetId,
    ) -> Result<(), ContentStoreError> {
        let mut state = self.state.lock().await;
        if !state.assets.contains_key(&asset) {
            return Err(ContentStoreError::AssetNotFound(asset));
        }
        state.record_mut(id)?.primary_image = Some(asset);
        Ok(())
    }

    async fn ensure_taxonomy_term(
        &self,
        taxonomy: &str,
        name: &str,
    ) -> Result<TermId, ContentStoreError> {
        let mut state = self.state.lock().await;
        let key = (taxonomy.to_string(), name.to_string());
        if let Some(id) = state.terms.get(&key) {
            return Ok(*id);
        }
        let id = state.allocate_id();
        state.terms.insert(key, id);
        Ok(id)
    }

    async fn assign_terms(
        &self,
        id: RecordId,
        taxonomy: &str,
        terms: &[TermId],
    ) -> Result<(), ContentStoreError> {
        let mut state = self.state.lock().await;
        state
            .record_mut(id)?
            .terms
            .insert(taxonomy.to_string(), terms.to_vec());
        Ok(())
    }
}

#[async_trait]
impl SchemaDiscovery for MemoryContentStore {
    fn custom_fields_available(&self) -> bool {
        self.custom_fields_available
    }

    async fn custom_fields(
        &self,
        collection: &str,
    ) -> Result<Vec<FieldDescriptor>, ContentStoreError> {
        let state = self.state.lock().await;
        Ok(state.custom_fields.get(collection).cloned().unwrap_or_default())
    }

    async fn taxonomies(
        &self,
        collection: &str,
    ) -> Result<Vec<TaxonomyDescriptor>, ContentStoreError> {
        let state = self.state.lock().await;
        Ok(state.taxonomies.get(collection).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedsync_core::Visibility;

    fn payload(title: &str) -> RecordPayload {
        RecordPayload {
            title: title.to_string(),
            content: None,
            excerpt: None,
            published_at: None,
            visibility: Visibility::Draft,
            owner: "admin".to_string(),
        }
    }

    #[tokio::test]
    async fn tag_lookup_is_scoped_to_collection() {
        let store = MemoryContentStore::new();
        let a = store.insert("post", &payload("A")).await.expect("insert");
        store.set_tag(a, "_guid", "urn:1").await.expect("tag");

        assert_eq!(store.find_by_tag("post", "_guid", "urn:1").await.expect("find"), Some(a));
        assert_eq!(store.find_by_tag("page", "_guid", "urn:1").await.expect("find"), None);
        assert_eq!(store.get_tag(a, "_guid").await.expect("get").as_deref(), Some("urn:1"));
    }

    #[tokio::test]
    async fn terms_are_created_once_and_replaced_per_taxonomy() {
        let store = MemoryContentStore::new().with_taxonomy("post", "category", "Categories");
        let id = store.insert("post", &payload("A")).await.expect("insert");

        let news = store.ensure_taxonomy_term("category", "News").await.expect("term");
        let again = store.ensure_taxonomy_term("category", "News").await.expect("term");
        assert_eq!(news, again);

        let tech = store.ensure_taxonomy_term("category", "Tech").await.expect("term");
        store.assign_terms(id, "category", &[news, tech]).await.expect("assign");
        store.assign_terms(id, "category", &[tech]).await.expect("reassign");
        assert_eq!(store.term_names(id, "category").await, vec!["Tech".to_string()]);

        let taxonomies = store.taxonomies("post").await.expect("taxonomies");
        assert_eq!(taxonomies.len(), 1);
        assert!(store.taxonomies("unknown").await.expect("taxonomies").is_empty());
    }

    #[tokio::test]
    async fn rejected_titles_and_missing_records_error() {
        let store = MemoryContentStore::new();
        store.reject_title("bad").await;
        let err = store.insert("post", &payload("bad")).await.expect_err("rejected");
        assert!(matches!(err, ContentStoreError::Rejected(_)));

        let err = store.update(99, &payload("ok")).await.expect_err("missing");
        assert!(matches!(err, ContentStoreError::RecordNotFound(99)));
    }

    #[test]
    fn custom_fields_availability_follows_builder() {
        assert!(!MemoryContentStore::new().custom_fields_available());
        assert!(MemoryContentStore::new()
            .with_custom_field("post", "source_url", "Source URL")
            .custom_fields_available());
    }
}
