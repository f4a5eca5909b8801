use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::{debug, info, instrument};
use veil_pipeline::ports::AnalyticsStore;
use veil_pipeline::{AnalyticsRecord, PersistenceError};

/// Analytical store writing one row per record into PostgreSQL
pub struct PgAnalyticsStore {
    pool: PgPool,
    insert_sql: String,
}

/// Accepts plain SQL identifiers only, since they are spliced into queries
fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid {
        anyhow::bail!("invalid {} name {:?}", kind, value);
    }
    Ok(())
}

fn insert_statement(dataset: &str, table: &str) -> Result<String> {
    validate_identifier("dataset", dataset)?;
    validate_identifier("table", table)?;

    Ok(format!(
        "INSERT INTO {}.{} \
         (gcs_url, content_url, content_type, insert_timestamp, labels, safe_search) \
         VALUES ($1, $2, $3, $4, $5, $6)",
        dataset, table
    ))
}

impl PgAnalyticsStore {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let insert_sql = insert_statement(&config.dataset, &config.table)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!(
            dataset = %config.dataset,
            table = %config.table,
            "Connected to PostgreSQL database"
        );

        Ok(Self { pool, insert_sql })
    }

    /// Create the default schema and table
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl AnalyticsStore for PgAnalyticsStore {
    #[instrument(skip_all, fields(gcs_url = %record.gcs_url))]
    async fn insert_row(&self, record: &AnalyticsRecord) -> Result<(), PersistenceError> {
        // Empty label lists are omitted from records, so store them as NULL
        let labels = (!record.labels.is_empty()).then(|| Json(&record.labels));

        sqlx::query(&self.insert_sql)
            .bind(&record.gcs_url)
            .bind(&record.content_url)
            .bind(&record.content_type)
            .bind(&record.insert_timestamp)
            .bind(labels)
            .bind(Json(&record.safe_search))
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError(e.to_string()))?;

        debug!("Row inserted");
        Ok(())
    }
}
