//! Push transport: `POST http://{address}/agent/update` and `/agent/rollback`

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use fleetota_core::wire::{DispatchRequest, DispatchResponse, RollbackRequest, RollbackResponse};
use fleetota_core::NodeRecord;

use super::{NodeTransport, TransportError};

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(Self { client })
    }

    async fn post<B, R>(&self, node: &NodeRecord, path: &str, body: &B) -> Result<R, TransportError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = agent_url(&node.address, path);
        debug!(node_id = %node.node_id, %url, "POST to agent");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected(format!("HTTP {status}: {text}")));
        }

        response.json::<R>().await.map_err(|e| TransportError::Decode(e.to_string()))
    }
}

fn agent_url(address: &str, path: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        format!("{}{path}", address.trim_end_matches('/'))
    } else {
        format!("http://{address}{path}")
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn dispatch_update(
        &self,
        node: &NodeRecord,
        request: &DispatchRequest,
    ) -> Result<DispatchResponse, TransportError> {
        self.post(node, "/agent/update", request).await
    }

    async fn dispatch_rollback(
        &self,
        node: &NodeRecord,
        request: &RollbackRequest,
    ) -> Result<RollbackResponse, TransportError> {
        self.post(node, "/agent/rollback", request).await
    }
}
