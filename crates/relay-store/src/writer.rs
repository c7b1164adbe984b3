//! Downstream write seam used by the proxies

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_common::{StoreError, TrainingRecord};

use crate::client::StoreClient;
use crate::store::ExperienceStore;

/// Anything a proxy can write training records into
#[async_trait]
pub trait ExperienceWriter: Send + Sync {
    /// Write `records` to `table`, returning how many were accepted
    async fn write(
        &self,
        table: &str,
        records: Vec<TrainingRecord>,
        priorities: &[f64],
    ) -> Result<usize, StoreError>;

    /// Where the writes go, for logs
    fn endpoint(&self) -> String;
}

/// Writes into an in-process store
pub struct LocalWriter {
    store: Arc<ExperienceStore>,
    timeout: Option<Duration>,
}

impl LocalWriter {
    /// `timeout` bounds how long a write may wait on a table's rate limiter
    pub fn new(store: Arc<ExperienceStore>, timeout: Option<Duration>) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<ExperienceStore> {
        &self.store
    }
}

#[async_trait]
impl ExperienceWriter for LocalWriter {
    async fn write(
        &self,
        table: &str,
        records: Vec<TrainingRecord>,
        priorities: &[f64],
    ) -> Result<usize, StoreError> {
        self.store.write(table, records, priorities, self.timeout).await
    }

    fn endpoint(&self) -> String {
        "local".to_string()
    }
}

#[async_trait]
impl ExperienceWriter for StoreClient {
    async fn write(
        &self,
        table: &str,
        records: Vec<TrainingRecord>,
        priorities: &[f64],
    ) -> Result<usize, StoreError> {
        StoreClient::write(self, table, records, priorities).await
    }

    fn endpoint(&self) -> String {
        self.addr().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use relay_common::Tensor;

    #[tokio::test]
    async fn test_local_writer_through_trait_object() {
        let store = Arc::new(
            ExperienceStore::new(StoreConfig {
                capacity: 8,
                batch_size: 1,
                ..Default::default()
            })
            .unwrap(),
        );
        let writer: Arc<dyn ExperienceWriter> =
            Arc::new(LocalWriter::new(store.clone(), Some(Duration::from_millis(50))));

        let record = TrainingRecord::new().with_field("x", Tensor::vector(vec![1.0]));
        let n = writer
            .write("reverb_table_0", vec![record.clone(), record], &[])
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.total_size(), 2);
        assert_eq!(writer.endpoint(), "local");
    }
}
