use sqlx::PgPool;

use crate::pipeline::PipelineError;

/// Bundled migration creating the three pipeline tables.
pub const SCHEMA_SQL: &str = include_str!("../sql/schema/001_create_schema.sql");

/// Whether the `locations` table, used as the schema marker, is on the search path.
pub async fn schema_exists(pool: &PgPool) -> Result<bool, sqlx::Error> {
    let marker: Option<String> = sqlx::query_scalar("SELECT to_regclass('locations')::text")
        .fetch_one(pool)
        .await?;
    Ok(marker.is_some())
}

/// Apply the bundled migration when the schema marker is missing.
///
/// Returns `true` if the migration ran.
pub async fn ensure_schema(pool: &PgPool) -> Result<bool, PipelineError> {
    let exists = schema_exists(pool)
        .await
        .map_err(|e| PipelineError::Schema(format!("schema check failed: {e}")))?;
    if exists {
        tracing::debug!("schema present");
        return Ok(false);
    }

    tracing::info!("applying schema");
    apply_schema(pool)
        .await
        .map_err(|e| PipelineError::Schema(format!("failed to apply schema: {e}")))?;
    tracing::info!("schema applied");
    Ok(true)
}

async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::raw_sql(SCHEMA_SQL).execute(&mut *tx).await?;
    tx.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_schema_is_idempotent_and_keyed() {
        assert_eq!(SCHEMA_SQL.matches("CREATE TABLE IF NOT EXISTS").count(), 3);
        assert!(!SCHEMA_SQL.contains("CREATE TABLE locations"));
        assert!(SCHEMA_SQL.contains("UNIQUE (location_id, timestamp)"));
        assert!(SCHEMA_SQL.contains("raw_weather_id  BIGINT NOT NULL UNIQUE"));
    }
}
