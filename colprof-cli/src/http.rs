//! HTTP transport to a profiling runtime.
//!
//! Batches are posted as JSON to `{runtime}/v1/instances/{instance}/queries/batch`
//! and answered with one result per query key.

use colprof_core::batcher::{BatchRequest, BatchResponse};
use colprof_core::transport::{Transport, TransportFuture};
use colprof_core::TransportError;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Runtime client that sends query batches over HTTP
#[derive(Clone)]
pub struct HttpTransport {
    /// HTTP client
    client: Client,
    /// Runtime base URL
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for the runtime at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    /// Create a transport reusing an existing client
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(url = %base_url, "Creating runtime transport");
        Self { client, base_url }
    }

    /// Get the runtime base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Endpoint that accepts batches for `instance_id`
    pub fn batch_url(&self, instance_id: &str) -> String {
        format!("{}/v1/instances/{}/queries/batch", self.base_url, instance_id)
    }

    /// Check if the runtime is reachable
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), TransportError> {
        let url = format!("{}/v1/ping", self.base_url);
        debug!(url = %url, "Checking runtime health");

        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Runtime is healthy");
                Ok(())
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(status = %status, body = %body, "Runtime returned error");
                Err(TransportError::status(status.as_u16(), body))
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to runtime");
                Err(TransportError::connection(e.to_string()))
            }
        }
    }
}

impl Transport<BatchRequest, BatchResponse> for HttpTransport {
    fn send(
        &self,
        request: BatchRequest,
        cancel: CancellationToken,
    ) -> TransportFuture<BatchResponse> {
        let client = self.client.clone();
        let url = self.batch_url(&request.instance_id);

        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(url = %url, "Batch request aborted");
                    Err(TransportError::connection("request aborted"))
                }
                result = post_batch(&client, &url, &request) => result,
            }
        })
    }
}

#[instrument(skip(client, request), fields(queries = request.queries.len()))]
async fn post_batch(
    client: &Client,
    url: &str,
    request: &BatchRequest,
) -> Result<BatchResponse, TransportError> {
    debug!("Posting query batch");

    let response = client
        .post(url)
        .json(request)
        .send()
        .await
        .map_err(|e| TransportError::connection(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Runtime rejected batch");
        return Err(TransportError::status(status.as_u16(), body));
    }

    response
        .json::<BatchResponse>()
        .await
        .map_err(|e| TransportError::decode(e.to_string()))
}
