//! Event feed endpoint

use flowline_core::dto::executor::EventBatch;

use crate::ExecutorClient;
use crate::error::Result;

impl ExecutorClient {
    /// Fetch events recorded after `cursor`
    pub async fn poll_events(&self, cursor: u64) -> Result<EventBatch> {
        let url = format!("{}/v1/events", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("cursor", cursor)])
            .send()
            .await?;

        self.handle_response(response).await
    }
}
