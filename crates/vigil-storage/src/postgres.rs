//! PostgreSQL table backend.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;
use vigil_core::{CanonicalItem, ItemKey};

use crate::{
    fill_page, AnnotationPatch, ContinuationKey, Page, PageRequest, StoreError, TableStore,
    UpdateResult,
};

pub async fn connect_pool(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("vigil_items migrations applied");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgTable {
    pool: PgPool,
    name: String,
}

impl PgTable {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<CanonicalItem>, StoreError> {
        rows.into_iter()
            .map(|row| {
                let Json(item) = row.try_get::<Json<CanonicalItem>, _>("item")?;
                Ok(item)
            })
            .collect()
    }

    fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, request: &PageRequest) {
        let Some(filter) = &request.filter else {
            return;
        };
        if filter.attribute == "statusCode" {
            qb.push(" AND status_code = ").push_bind(filter.value.clone());
        } else {
            qb.push(" AND item ->> ")
                .push_bind(filter.attribute.clone())
                .push(" = ")
                .push_bind(filter.value.clone());
        }
    }

    fn push_limit(qb: &mut QueryBuilder<'_, Postgres>, request: &PageRequest) {
        let lookahead = request.limit.max(1) as i64 + 1;
        qb.push(" LIMIT ").push_bind(lookahead);
    }

    async fn fetch_page(
        &self,
        mut qb: QueryBuilder<'_, Postgres>,
        request: &PageRequest,
        position: fn(&CanonicalItem) -> ContinuationKey,
    ) -> Result<Page, StoreError> {
        let rows = qb.build().fetch_all(&self.pool).await?;
        let items = Self::decode_rows(rows)?;
        fill_page(&items, request, position)
    }
}

#[async_trait]
impl TableStore for PgTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &ItemKey) -> Result<Option<CanonicalItem>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT item
              FROM vigil_items
             WHERE table_name = $1
               AND pk = $2
               AND sk = $3
            "#,
        )
        .bind(&self.name)
        .bind(&key.partition_key)
        .bind(&key.sort_key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Self::decode_rows(vec![row])?.pop()),
            None => Ok(None),
        }
    }

    async fn put(&self, item: &CanonicalItem) -> Result<(), StoreError> {
        let value = serde_json::to_value(item)?;
        sqlx::query(
            r#"
            INSERT INTO vigil_items (table_name, pk, sk, status_code, sort_time, expires_at, item)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (table_name, pk, sk) DO UPDATE
               SET status_code = EXCLUDED.status_code,
                   sort_time = EXCLUDED.sort_time,
                   expires_at = EXCLUDED.expires_at,
                   item = EXCLUDED.item
            "#,
        )
        .bind(&self.name)
        .bind(&item.partition_key)
        .bind(&item.sort_key)
        .bind(item.status_code())
        .bind(&item.created_at)
        .bind(item.expires_at)
        .bind(Json(value))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_annotation(
        &self,
        key: &ItemKey,
        patch: &AnnotationPatch,
    ) -> Result<UpdateResult, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE vigil_items
               SET item = item || $4
             WHERE table_name = $1
               AND pk = $2
               AND sk = $3
            "#,
        )
        .bind(&self.name)
        .bind(&key.partition_key)
        .bind(&key.sort_key)
        .bind(Json(patch.to_json()))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            Ok(UpdateResult::Missing)
        } else {
            Ok(UpdateResult::Applied)
        }
    }

    async fn query_partition(
        &self,
        partition_key: &str,
        sort_key_prefix: &str,
        request: &PageRequest,
    ) -> Result<Page, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT item FROM vigil_items WHERE table_name = ");
        qb.push_bind(self.name.clone());
        qb.push(" AND pk = ").push_bind(partition_key.to_string());
        qb.push(" AND starts_with(sk, ")
            .push_bind(sort_key_prefix.to_string())
            .push(")");
        if let Some(after) = request.cursor.as_ref().and_then(ContinuationKey::decode) {
            qb.push(" AND sk < ").push_bind(after.sk);
        }
        Self::push_filter(&mut qb, request);
        qb.push(" ORDER BY sk DESC");
        Self::push_limit(&mut qb, request);
        self.fetch_page(qb, request, ContinuationKey::for_key).await
    }

    async fn query_index(
        &self,
        status_code: &str,
        request: &PageRequest,
    ) -> Result<Page, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT item FROM vigil_items WHERE table_name = ");
        qb.push_bind(self.name.clone());
        qb.push(" AND status_code = ").push_bind(status_code.to_string());
        if let Some(after) = request.cursor.as_ref().and_then(ContinuationKey::decode) {
            qb.push(" AND (sort_time, pk, sk) < (")
                .push_bind(after.sort_time.unwrap_or_default())
                .push(", ")
                .push_bind(after.pk)
                .push(", ")
                .push_bind(after.sk)
                .push(")");
        }
        Self::push_filter(&mut qb, request);
        qb.push(" ORDER BY sort_time DESC, pk DESC, sk DESC");
        Self::push_limit(&mut qb, request);
        self.fetch_page(qb, request, ContinuationKey::for_index).await
    }

    async fn scan(&self, request: &PageRequest) -> Result<Page, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT item FROM vigil_items WHERE table_name = ");
        qb.push_bind(self.name.clone());
        if let Some(after) = request.cursor.as_ref().and_then(ContinuationKey::decode) {
            qb.push(" AND (pk, sk) > (")
                .push_bind(after.pk)
                .push(", ")
                .push_bind(after.sk)
                .push(")");
        }
        Self::push_filter(&mut qb, request);
        qb.push(" ORDER BY pk, sk");
        Self::push_limit(&mut qb, request);
        self.fetch_page(qb, request, ContinuationKey::for_key).await
    }
}
