use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use roost_core::error::AppError;
use roost_core::merge::AddressKey;
use roost_core::models::NormalizedProperty;
use roost_core::traits::PropertyStore;

/// Repository for canonical properties in PostgreSQL.
#[derive(Clone)]
pub struct PgPropertyRepository {
    pool: Pool<Postgres>,
}

impl PgPropertyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM properties"#)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count)
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct PropertyRow {
    data: serde_json::Value,
}

impl PropertyRow {
    fn into_property(self) -> Result<NormalizedProperty, AppError> {
        Ok(serde_json::from_value(self.data)?)
    }
}

// -- Trait implementation --

impl PropertyStore for PgPropertyRepository {
    async fn find_by_mls(&self, mls_number: &str) -> Result<Option<NormalizedProperty>, AppError> {
        let row = sqlx::query_as::<_, PropertyRow>(
            r#"
            SELECT data FROM properties
            WHERE mls_number = $1
            ORDER BY last_scraped_at DESC
            LIMIT 1
            "#,
        )
        .bind(mls_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(PropertyRow::into_property).transpose()
    }

    async fn find_by_address(
        &self,
        key: &AddressKey,
    ) -> Result<Option<NormalizedProperty>, AppError> {
        let row = sqlx::query_as::<_, PropertyRow>(
            r#"
            SELECT data FROM properties
            WHERE street_key = $1 AND unit_key = $2 AND zip = $3
            ORDER BY last_scraped_at DESC
            LIMIT 1
            "#,
        )
        .bind(&key.street)
        .bind(key.unit.as_deref().unwrap_or(""))
        .bind(&key.zip)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(PropertyRow::into_property).transpose()
    }

    async fn upsert(&self, property: &NormalizedProperty) -> Result<(), AppError> {
        let key = AddressKey::of(&property.address);
        let data = serde_json::to_value(property)?;
        let price = i64::try_from(property.price)
            .map_err(|_| AppError::DatabaseError(format!("price {} out of range", property.price)))?;

        sqlx::query(
            r#"
            INSERT INTO properties
                (id, mls_number, street_key, unit_key, zip, price, status, last_scraped_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                mls_number = EXCLUDED.mls_number,
                street_key = EXCLUDED.street_key,
                unit_key = EXCLUDED.unit_key,
                zip = EXCLUDED.zip,
                price = EXCLUDED.price,
                status = EXCLUDED.status,
                last_scraped_at = EXCLUDED.last_scraped_at,
                data = EXCLUDED.data,
                updated_at = NOW()
            "#,
        )
        .bind(property.id)
        .bind(&property.mls_number)
        .bind(&key.street)
        .bind(key.unit.as_deref().unwrap_or(""))
        .bind(&key.zip)
        .bind(price)
        .bind(property.status.as_str())
        .bind(property.last_scraped_at)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<NormalizedProperty>, AppError> {
        let row = sqlx::query_as::<_, PropertyRow>(r#"SELECT data FROM properties WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(PropertyRow::into_property).transpose()
    }

    async fn list(&self, limit: usize) -> Result<Vec<NormalizedProperty>, AppError> {
        let rows = sqlx::query_as::<_, PropertyRow>(
            r#"
            SELECT data FROM properties
            ORDER BY last_scraped_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(PropertyRow::into_property).collect()
    }
}
