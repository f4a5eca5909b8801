use crate::error::StageError;
use crate::messages::AnalyticsRecord;
use crate::ports::AnalyticsStore;
use std::sync::Arc;
use tracing::{info, instrument};

/// Writes analytics records to the analytical store, one row each
#[derive(Clone)]
pub struct RecorderStage {
    store: Arc<dyn AnalyticsStore>,
}

impl RecorderStage {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, record), fields(gcs_url = %record.gcs_url))]
    pub async fn handle(&self, record: &AnalyticsRecord) -> Result<(), StageError> {
        let kind = record.validate()?;

        self.store.insert_row(record).await?;

        metrics::counter!("veil.records.inserted", "kind" => kind.as_str()).increment(1);
        info!(
            labels = record.labels.len(),
            ratings = record.safe_search.len(),
            "Record inserted"
        );
        Ok(())
    }
}
