use std::time::Duration;

use async_trait::async_trait;
use feedsync_core::FieldValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::{
    AssetId, ContentStore, ContentStoreError, FieldDescriptor, RecordId, RecordPayload,
    SchemaDiscovery, StoredAsset, TaxonomyDescriptor, TermId,
};

/// Content store backed by the tables in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgContentStore {
    pool: PgPool,
    custom_fields_available: bool,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            custom_fields_available: true,
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, ContentStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn with_custom_fields_available(mut self, available: bool) -> Self {
        self.custom_fields_available = available;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), ContentStoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn find_by_tag(
        &self,
        collection: &str,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Option<RecordId>, ContentStoreError> {
        let row = sqlx::query(
            r#"
            SELECT r.id
              FROM content_records r
              JOIN record_meta m ON m.record_id = r.id
             WHERE r.collection = $1
               AND m.meta_key = $2
               AND m.meta_value = to_jsonb($3::text)
             ORDER BY r.id
             LIMIT 1
            "#,
        )
        .bind(collection)
        .bind(tag_key)
        .bind(tag_value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get("id")).transpose()?)
    }

    async fn insert(
        &self,
        collection: &str,
        payload: &RecordPayload,
    ) -> Result<RecordId, ContentStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO content_records
                (collection, title, content, excerpt, published_at, visibility, owner)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(collection)
        .bind(&payload.title)
        .bind(&payload.content)
        .bind(&payload.excerpt)
        .bind(payload.published_at)
        .bind(payload.visibility.key())
        .bind(&payload.owner)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn update(&self, id: RecordId, payload: &RecordPayload) -> Result<(), ContentStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE content_records
               SET title = $2,
                   content = $3,
                   excerpt = $4,
                   published_at = $5,
                   visibility = $6,
                   owner = $7,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&payload.title)
        .bind(&payload.content)
        .bind(&payload.excerpt)
        .bind(payload.published_at)
        .bind(payload.visibility.key())
        .bind(&payload.owner)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ContentStoreError::RecordNotFound(id));
        }
        Ok(())
    }

    async fn set_meta(
        &self,
        id: RecordId,
        key: &str,
        value: &FieldValue,
    ) -> Result<(), ContentStoreError> {
        sqlx::query(
            r#"
            INSERT INTO record_meta (record_id, meta_key, meta_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (record_id, meta_key) DO UPDATE SET meta_value = EXCLUDED.meta_value
            "#,
        )
        .bind(id)
        .bind(key)
        .bind(Json(value))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_meta(
        &self,
        id: RecordId,
        key: &str,
    ) -> Result<Option<FieldValue>, ContentStoreError> {
        let row = sqlx::query(
            "SELECT meta_value FROM record_meta WHERE record_id = $1 AND meta_key = $2",
        )
            .bind(id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let Json(value): Json<FieldValue> = row.try_get("meta_value")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set_custom_field(
        &self,
        id: RecordId,
        key: &str,
        value: &FieldValue,
    ) -> Result<(), ContentStoreError> {
        sqlx::query(
            r#"
            INSERT INTO record_custom_fields (record_id, field_key, field_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (record_id, field_key) DO UPDATE SET field_value = EXCLUDED.field_value
            "#,
        )
        .bind(id)
        .bind(key)
        .bind(Json(value))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn register_asset(
        &self,
        source_url: &str,
        asset: &StoredAsset,
    ) -> Result<AssetId, ContentStoreError> {
        let byte_size = i64::try_from(asset.byte_size).map_err(|_| {
            ContentStoreError::Rejected(format!("asset too large: {} bytes", asset.byte_size))
        })?;
        let row = sqlx::query(
            r#"
            INSERT INTO assets (source_url, content_hash, relative_path, byte_size, mime_type)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(source_url)
        .bind(&asset.content_hash)
        .bind(&asset.relative_path)
        .bind(byte_size)
        .bind(&asset.mime_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn asset_source_url(&self, asset: AssetId) -> Result<Option<String>, ContentStoreError> {
        let row = sqlx::query("SELECT source_url FROM assets WHERE id = $1")
            .bind(asset)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("source_url")).transpose()?)
    }

    async fn primary_image(&self, id: RecordId) -> Result<Option<AssetId>, ContentStoreError> {
        let row = sqlx::query("SELECT primary_image_id FROM content_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ContentStoreError::RecordNotFound(id))?;
        Ok(row.try_get("primary_image_id")?)
    }

    async fn attach_primary_image(
        &self,
        id: RecordId,
        asset: AssetId,
    ) -> Result<(), ContentStoreError> {
        let result = sqlx::query(
            "UPDATE content_records SET primary_image_id = $2, updated_at = NOW() WHERE id = $1",
        )
            .bind(id)
            .bind(asset)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ContentStoreError::RecordNotFound(id));
        }
        Ok(())
    }

    async fn ensure_taxonomy_term(
        &self,
        taxonomy: &str,
        name: &str,
    ) -> Result<TermId, ContentStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO taxonomy_terms (taxonomy, name)
            VALUES ($1, $2)
            ON CONFLICT (taxonomy, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(taxonomy)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn assign_terms(
        &self,
        id: RecordId,
        taxonomy: &str,
        terms: &[TermId],
    ) -> Result<(), ContentStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM record_terms WHERE record_id = $1 AND taxonomy = $2")
            .bind(id)
            .bind(taxonomy)
            .execute(&mut *tx)
            .await?;
        for (position, term_id) in terms.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO record_terms (record_id, taxonomy, term_id, position)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (record_id, term_id) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(taxonomy)
            .bind(term_id)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SchemaDiscovery for PgContentStore {
    fn custom_fields_available(&self) -> bool {
        self.custom_fields_available
    }

    async fn custom_fields(
        &self,
        collection: &str,
    ) -> Result<Vec<FieldDescriptor>, ContentStoreError> {
        if !self.custom_fields_available {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT field_key, label, field_type
              FROM collection_custom_fields
             WHERE collection = $1
             ORDER BY position, field_key
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(FieldDescriptor {
                key: row.try_get("field_key")?,
                label: row.try_get("label")?,
                field_type: row.try_get("field_type")?,
            });
        }
        Ok(out)
    }

    async fn taxonomies(
        &self,
        collection: &str,
    ) -> Result<Vec<TaxonomyDescriptor>, ContentStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT taxonomy, label, hierarchical
              FROM collection_taxonomies
             WHERE collection = $1
             ORDER BY taxonomy
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(TaxonomyDescriptor {
                key: row.try_get("taxonomy")?,
                label: row.try_get("label")?,
                hierarchical: row.try_get("hierarchical")?,
            });
        }
        Ok(out)
    }
}
